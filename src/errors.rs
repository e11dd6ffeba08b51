//! Terminal rendering of evaluation failures.
//!
//! A failure inside a deferred computation is reported against two places
//! in the source: where the promise was created and where its value was
//! first needed. Unbound names get a "did you mean" hint built from the
//! names in scope.

use crate::ast::{SourceMap, Span};
use crate::eval::EvalError;
use crate::promise::{ErrorContext, Site};

/// Width of the `-- KIND ----` header line
const HEADER_WIDTH: usize = 60;

/// Hints offered for one unbound name
const MAX_SUGGESTIONS: usize = 3;

/// ANSI styling; every code is empty when disabled
#[derive(Debug, Clone, Copy, Default)]
pub struct Colors {
    pub enabled: bool,
}

impl Colors {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    fn code(&self, code: &'static str) -> &'static str {
        if self.enabled {
            code
        } else {
            ""
        }
    }

    pub fn red(&self) -> &'static str {
        self.code("\x1b[31m")
    }

    pub fn cyan(&self) -> &'static str {
        self.code("\x1b[36m")
    }

    pub fn bold(&self) -> &'static str {
        self.code("\x1b[1m")
    }

    pub fn dim(&self) -> &'static str {
        self.code("\x1b[2m")
    }

    pub fn reset(&self) -> &'static str {
        self.code("\x1b[0m")
    }
}

#[derive(Debug, Clone, Default)]
pub struct ErrorConfig {
    pub colors: Colors,
    /// Shown in locations; `<input>` when unset
    pub filename: Option<String>,
}

impl ErrorConfig {
    pub fn new(use_color: bool) -> Self {
        Self {
            colors: Colors::new(use_color),
            filename: None,
        }
    }

    pub fn with_filename(mut self, name: impl Into<String>) -> Self {
        self.filename = Some(name.into());
        self
    }
}

// ============================================================================
// Name suggestions
// ============================================================================

/// Edit distance between two names, counted in characters
fn edit_distance(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut row = vec![0; b.len() + 1];
    for (i, ca) in a.chars().enumerate() {
        row[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitute = prev[j] + usize::from(ca != *cb);
            row[j + 1] = substitute.min(prev[j + 1] + 1).min(row[j] + 1);
        }
        std::mem::swap(&mut prev, &mut row);
    }
    prev[b.len()]
}

/// Names within `max_distance` edits of `name`, closest first and then
/// alphabetical. The name itself and duplicates are left out.
pub fn find_similar<'a>(
    name: &str,
    candidates: impl IntoIterator<Item = &'a str>,
    max_distance: usize,
) -> Vec<String> {
    let mut close: Vec<(usize, &str)> = candidates
        .into_iter()
        .map(|candidate| (edit_distance(name, candidate), candidate))
        .filter(|&(distance, _)| distance > 0 && distance <= max_distance)
        .collect();
    close.sort_unstable();
    close.dedup();
    close
        .into_iter()
        .take(MAX_SUGGESTIONS)
        .map(|(_, candidate)| candidate.to_string())
        .collect()
}

fn hint(suggestions: &[String], colors: Colors) -> String {
    let names: Vec<String> = suggestions
        .iter()
        .map(|s| format!("{}{}{}", colors.bold(), s, colors.reset()))
        .collect();
    match names.as_slice() {
        [] => String::new(),
        [one] => format!("\n\nDid you mean {}?", one),
        many => format!("\n\nDid you mean one of: {}?", many.join(", ")),
    }
}

// ============================================================================
// Layout
// ============================================================================

fn header(kind: &str, colors: Colors) -> String {
    let rule = "-".repeat(HEADER_WIDTH.saturating_sub(kind.len() + 4));
    format!("{}-- {} {}{}", colors.cyan(), kind, rule, colors.reset())
}

/// `file:line:column` of the start of `span`
fn location(span: &Span, source_map: &SourceMap, config: &ErrorConfig) -> String {
    format!(
        "{}{}:{}{}",
        config.colors.bold(),
        config.filename.as_deref().unwrap_or("<input>"),
        source_map.position(span.start),
        config.colors.reset()
    )
}

/// The line holding the start of `span`, underlined. A span that runs onto
/// later lines gets a single caret.
fn snippet(span: &Span, source_map: &SourceMap, colors: Colors) -> String {
    let loc = source_map.locate(span);
    let line = loc.start.line;
    let gutter = line.to_string();
    let marks = if loc.end.line == line {
        loc.end.column.saturating_sub(loc.start.column).max(1)
    } else {
        1
    };
    format!(
        "{}{} |{} {}\n{}{}{}{}",
        colors.cyan(),
        gutter,
        colors.reset(),
        source_map.line(line).unwrap_or(""),
        " ".repeat(gutter.len() + 2 + loc.start.column),
        colors.red(),
        "^".repeat(marks),
        colors.reset()
    )
}

// ============================================================================
// Reports
// ============================================================================

fn error_kind(err: &EvalError) -> &'static str {
    match err {
        EvalError::UnboundVariable { .. } => "UNBOUND VARIABLE",
        EvalError::TypeError(_) | EvalError::NotApplicable { .. } => "TYPE ERROR",
        EvalError::DivisionByZero
        | EvalError::IndexOutOfRange { .. }
        | EvalError::NoSuchField { .. }
        | EvalError::ArityMismatch { .. }
        | EvalError::RuntimeError(_) => "RUNTIME ERROR",
        EvalError::ThunkExecution(_) => "DEFERRED ERROR",
        EvalError::Timeout { .. } => "TIMEOUT",
        EvalError::Cancelled { .. } => "CANCELLED",
        EvalError::CyclicResolution { .. } => "CYCLIC PROMISE",
        EvalError::PoolShutdown => "ENGINE SHUT DOWN",
    }
}

fn site_block(label: &str, site: &Site, source_map: &SourceMap, config: &ErrorConfig) -> String {
    let colors = config.colors;
    let func = site.function.as_deref().unwrap_or("<top>");
    match &site.span {
        Some(span) => format!(
            "{}{}{} {}, {}\n\n{}",
            colors.dim(),
            label,
            colors.reset(),
            func,
            location(span, source_map, config),
            snippet(span, source_map, colors)
        ),
        None => format!("{}{}{} {} (host code)", colors.dim(), label, colors.reset(), func),
    }
}

/// Report a failure inside a deferred computation, showing both where the
/// promise was created and where its value was first needed.
pub fn format_deferred_error(ctx: &ErrorContext, source_map: &SourceMap, config: &ErrorConfig) -> String {
    let root = ctx.root_cause();
    let mut out = header(error_kind(root), config.colors);
    out.push_str(&format!("\n\nThe value of promise {} failed: {}\n\n", ctx.promise, root));
    out.push_str(&site_block("created", &ctx.created_at, source_map, config));
    out.push_str("\n\n");
    out.push_str(&site_block("resolved", &ctx.resolved_at, source_map, config));
    if let EvalError::UnboundVariable { suggestions, .. } = root {
        out.push_str(&hint(suggestions, config.colors));
    }
    out
}

/// Render any evaluation error for display on a terminal
pub fn format_eval_error(err: &EvalError, source_map: &SourceMap, config: &ErrorConfig) -> String {
    match err {
        EvalError::ThunkExecution(ctx) => format_deferred_error(ctx, source_map, config),
        EvalError::UnboundVariable { suggestions, .. } => format!(
            "{}\n\n{}{}",
            header(error_kind(err), config.colors),
            err,
            hint(suggestions, config.colors)
        ),
        other => format!("{}\n\n{}", header(error_kind(other), config.colors), other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::PromiseId;
    use std::sync::Arc;
    use std::time::SystemTime;

    #[test]
    fn test_edit_distance() {
        assert_eq!(edit_distance("counter", "counter"), 0);
        assert_eq!(edit_distance("countr", "counter"), 1);
        assert_eq!(edit_distance("combine", "combien"), 2);
        assert_eq!(edit_distance("", "len"), 3);
        assert_eq!(edit_distance("len", ""), 3);
    }

    #[test]
    fn test_suggestions_closest_first() {
        let names = ["counter", "count", "combine", "print"];
        assert_eq!(find_similar("countr", names, 2), vec!["count", "counter"]);
        assert!(find_similar("xyz", names, 2).is_empty());
    }

    #[test]
    fn test_suggestions_skip_exact_and_duplicates() {
        let names = ["total", "totals", "totals"];
        assert_eq!(find_similar("total", names, 2), vec!["totals"]);
    }

    #[test]
    fn test_hint_wording() {
        let colors = Colors::default();
        assert!(hint(&[], colors).is_empty());
        assert_eq!(hint(&["len".into()], colors), "\n\nDid you mean len?");
        assert_eq!(
            hint(&["len".into(), "range".into()], colors),
            "\n\nDid you mean one of: len, range?"
        );
    }

    #[test]
    fn test_snippet_underlines_span() {
        let source_map = SourceMap::new("let x = 1\nlet y = x + z\n");
        let out = snippet(&Span::new(18, 23), &source_map, Colors::default());
        assert_eq!(out, "2 | let y = x + z\n            ^^^^^");
    }

    #[test]
    fn test_header_width() {
        let h = header("TIMEOUT", Colors::default());
        assert!(h.starts_with("-- TIMEOUT -"));
        assert_eq!(h.len(), HEADER_WIDTH);
    }

    #[test]
    fn test_format_deferred_error_shows_both_sites() {
        let source = "fn f() {\n    return 10 / 0\n}\nlet p = f()\nprint(p + 1)\n";
        let source_map = SourceMap::new(source);
        let ctx = ErrorContext {
            promise: PromiseId::new(0, 0),
            cause: EvalError::DivisionByZero,
            created_at: Site::new(Some(Arc::from("f")), Span::new(13, 26)),
            created_time: SystemTime::now(),
            resolved_at: Site::new(None, Span::new(47, 52)),
            resolved_time: SystemTime::now(),
        };
        let out = format_deferred_error(&ctx, &source_map, &ErrorConfig::default().with_filename("demo.lt"));
        assert!(out.contains("RUNTIME ERROR"));
        assert!(out.contains("division by zero"));
        assert!(out.contains("created f"));
        assert!(out.contains("return 10 / 0"));
        assert!(out.contains("resolved <top>"));
        assert!(out.contains("print(p + 1)"));
        assert!(out.contains("demo.lt:2:"));
    }

    #[test]
    fn test_host_site_has_no_snippet() {
        let ctx = ErrorContext {
            promise: PromiseId::new(3, 1),
            cause: EvalError::DivisionByZero,
            created_at: Site::host(),
            created_time: SystemTime::now(),
            resolved_at: Site::host(),
            resolved_time: SystemTime::now(),
        };
        let out = format_deferred_error(&ctx, &SourceMap::new(""), &ErrorConfig::default());
        assert!(out.contains("created <top> (host code)"));
        assert!(!out.contains('^'));
    }

    #[test]
    fn test_format_eval_error_with_suggestion() {
        let source_map = SourceMap::new("");
        let err = EvalError::UnboundVariable {
            name: "countr".into(),
            suggestions: vec!["counter".into()],
        };
        let out = format_eval_error(&err, &source_map, &ErrorConfig::default());
        assert!(out.contains("UNBOUND VARIABLE"));
        assert!(out.contains("Did you mean counter?"));
    }

    #[test]
    fn test_colors_only_when_enabled() {
        let plain = format_eval_error(&EvalError::PoolShutdown, &SourceMap::new(""), &ErrorConfig::new(false));
        let styled = format_eval_error(&EvalError::PoolShutdown, &SourceMap::new(""), &ErrorConfig::new(true));
        assert!(!plain.contains('\x1b'));
        assert!(styled.contains("\x1b[36m"));
    }
}
