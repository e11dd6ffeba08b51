//! Abstract Syntax Tree consumed by the evaluator
//!
//! Trees are produced by an external front end. The only construct this
//! crate cares about beyond ordinary expressions is the function terminator,
//! which carries its [`Delivery`] mode.

use std::fmt;
use std::sync::Arc;

pub type Ident = String;

/// Source location for error reporting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn merge(&self, other: &Span) -> Span {
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// Human-readable source position (1-indexed line and column)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    /// 1-indexed line number
    pub line: usize,
    /// 1-indexed column number (in characters, not bytes)
    pub column: usize,
}

impl Position {
    pub fn new(line: usize, column: usize) -> Self {
        Self { line, column }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// A span with start and end positions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatedSpan {
    pub start: Position,
    pub end: Position,
}

impl fmt::Display for LocatedSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start.line == self.end.line {
            write!(
                f,
                "{}:{}-{}",
                self.start.line, self.start.column, self.end.column
            )
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// Maps byte offsets to line:column positions.
///
/// Line boundaries are computed once, so lookups are a binary search.
#[derive(Debug, Clone)]
pub struct SourceMap {
    source: String,
    /// Byte offset of the start of each line; `line_starts[0] == 0`
    line_starts: Vec<usize>,
}

impl SourceMap {
    pub fn new(source: &str) -> Self {
        let mut line_starts = vec![0];
        for (i, c) in source.char_indices() {
            if c == '\n' {
                line_starts.push(i + 1);
            }
        }
        Self {
            source: source.to_string(),
            line_starts,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn line_count(&self) -> usize {
        self.line_starts.len()
    }

    /// Convert a byte offset to a Position (1-indexed line and column).
    /// Offsets past the end clamp to the last character.
    pub fn position(&self, byte_offset: usize) -> Position {
        let byte_offset = byte_offset.min(self.source.len());
        let line_idx = match self.line_starts.binary_search(&byte_offset) {
            Ok(idx) => idx,
            Err(idx) => idx - 1,
        };

        let line_start = self.line_starts[line_idx];
        // Columns count characters, not bytes
        let column = self.source[line_start..byte_offset].chars().count() + 1;

        Position {
            line: line_idx + 1,
            column,
        }
    }

    pub fn locate(&self, span: &Span) -> LocatedSpan {
        LocatedSpan {
            start: self.position(span.start),
            end: self.position(span.end),
        }
    }

    /// Text of a line (1-indexed), without the trailing newline
    pub fn line(&self, line_num: usize) -> Option<&str> {
        if line_num == 0 || line_num > self.line_starts.len() {
            return None;
        }

        let line_idx = line_num - 1;
        let start = self.line_starts[line_idx];
        let end = if line_idx + 1 < self.line_starts.len() {
            self.line_starts[line_idx + 1] - 1
        } else {
            self.source.len()
        };

        Some(self.source[start..end].trim_end_matches('\r'))
    }

    pub fn span_text(&self, span: &Span) -> &str {
        let end = span.end.min(self.source.len());
        let start = span.start.min(end);
        &self.source[start..end]
    }
}

/// A spanned AST node
#[derive(Debug, Clone)]
pub struct Spanned<T> {
    pub node: T,
    pub span: Span,
}

impl<T> Spanned<T> {
    pub fn new(node: T, span: Span) -> Self {
        Self { node, span }
    }
}

// ============================================================================
// Delivery
// ============================================================================

/// How a function-terminating statement hands its value back to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Delivery {
    /// `deliver E`: evaluate now, return a concrete value.
    Eager,
    /// `return E`: capture `E` and return a promise for it.
    Lazy,
}

impl Delivery {
    pub fn keyword(&self) -> &'static str {
        match self {
            Delivery::Eager => "deliver",
            Delivery::Lazy => "return",
        }
    }
}

impl fmt::Display for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

// ============================================================================
// Expressions
// ============================================================================

pub type Expr = Spanned<ExprKind>;

#[derive(Debug, Clone)]
pub enum ExprKind {
    Lit(Literal),

    Var(Ident),

    BinOp {
        op: BinOp,
        left: Arc<Expr>,
        right: Arc<Expr>,
    },

    UnaryOp {
        op: UnaryOp,
        operand: Arc<Expr>,
    },

    /// Call: `f(a, b)`
    Call { func: Arc<Expr>, args: Vec<Expr> },

    /// Method call: `receiver.method(args)`
    MethodCall {
        receiver: Arc<Expr>,
        method: Ident,
        args: Vec<Expr>,
    },

    /// Field access: `target.field`
    Field {
        target: Arc<Expr>,
        field: Ident,
    },

    /// Indexing: `target[index]`
    Index {
        target: Arc<Expr>,
        index: Arc<Expr>,
    },

    List(Vec<Expr>),

    /// Record literal: `{name: expr, ...}`
    Record(Vec<(Ident, Expr)>),

    /// Conditional expression: `a if cond else b`
    If {
        cond: Arc<Expr>,
        then_branch: Arc<Expr>,
        else_branch: Arc<Expr>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Int(i64),
    Float(f64),
    String(String),
    Bool(bool),
    Unit,
}

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    // Arithmetic
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    // Comparison
    Eq,
    Neq,
    Lt,
    Gt,
    Lte,
    Gte,
    // Boolean
    And,
    Or,
}

impl BinOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
            BinOp::Eq => "==",
            BinOp::Neq => "!=",
            BinOp::Lt => "<",
            BinOp::Gt => ">",
            BinOp::Lte => "<=",
            BinOp::Gte => ">=",
            BinOp::And => "and",
            BinOp::Or => "or",
        }
    }

    /// Whether the right operand is only evaluated on demand
    pub fn is_short_circuit(&self) -> bool {
        matches!(self, BinOp::And | BinOp::Or)
    }
}

impl fmt::Display for BinOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

impl fmt::Display for UnaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnaryOp::Neg => f.write_str("-"),
            UnaryOp::Not => f.write_str("not"),
        }
    }
}

// ============================================================================
// Statements
// ============================================================================

pub type Stmt = Spanned<StmtKind>;

#[derive(Debug, Clone)]
pub enum StmtKind {
    /// Introduce a local binding
    Let { name: Ident, value: Expr },

    /// Rebind an existing local, or write a program-level global
    Assign { name: Ident, value: Expr },

    Expr(Expr),

    If {
        cond: Expr,
        then_body: Vec<Stmt>,
        else_body: Vec<Stmt>,
    },

    While { cond: Expr, body: Vec<Stmt> },

    For {
        var: Ident,
        iter: Expr,
        body: Vec<Stmt>,
    },

    /// A block whose call results are resolved before the next statement runs
    Sequential(Vec<Stmt>),

    /// Function terminator: `deliver E`, `return E` or a bare `return`
    Return {
        delivery: Delivery,
        value: Option<Arc<Expr>>,
    },
}

// ============================================================================
// Declarations
// ============================================================================

/// A user-defined function
#[derive(Debug, Clone)]
pub struct FnDecl {
    pub name: Ident,
    pub params: Vec<Ident>,
    pub body: Vec<Stmt>,
    /// Declared return type, used only for display of pending promises
    pub ret_type: Option<String>,
    /// Resolution deadline for promises this function returns lazily
    pub timeout_ms: Option<u64>,
    pub span: Span,
}

/// A top-level item
#[derive(Debug, Clone)]
pub enum Item {
    /// A program-level mutable binding shared by every function
    Global { name: Ident, value: Expr, span: Span },
    Function(Arc<FnDecl>),
    Stmt(Stmt),
}

#[derive(Debug, Clone, Default)]
pub struct Program {
    pub items: Vec<Item>,
}

impl Program {
    pub fn new(items: Vec<Item>) -> Self {
        Self { items }
    }

    pub fn functions(&self) -> impl Iterator<Item = &Arc<FnDecl>> {
        self.items.iter().filter_map(|item| match item {
            Item::Function(decl) => Some(decl),
            _ => None,
        })
    }
}
