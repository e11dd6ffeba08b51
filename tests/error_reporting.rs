//! Rendering of evaluation failures
//!
//! A deferred failure is reported with two snippets: where the promise was
//! created and where its value was first needed.

use latent::ast::SourceMap;
use latent::errors::{format_eval_error, ErrorConfig};
use latent::eval::EvalError;
use latent::test_support::*;

//        0         1         2         3         4         5
//        0123456789012345678901234567890123456789012345678901234567
const SOURCE: &str = "fn ratio(n) {\n    return n / 0\n}\nlet r = ratio(4)\nprint(r * 2)\n";

#[test]
fn deferred_failure_shows_creation_and_use() {
    let interp = test_interpreter();
    let err = interp
        .run(&program(vec![
            def("ratio")
                .params(&["n"])
                .body(vec![ret(div(var("n"), int(0))).at(18, 30)]),
            stmt_item(let_("r", call("ratio", vec![int(4)])).at(33, 49)),
            stmt_item(expr_stmt(
                call("print", vec![mul(var("r"), int(2)).at(56, 61)]).at(50, 62),
            )),
        ]))
        .unwrap_err();
    assert!(matches!(err.root_cause(), EvalError::DivisionByZero));

    let source_map = SourceMap::new(SOURCE);
    let report = format_eval_error(&err, &source_map, &ErrorConfig::default().with_filename("ratio.lt"));

    assert!(report.contains("RUNTIME ERROR"), "{report}");
    assert!(report.contains("division by zero"), "{report}");
    assert!(report.contains("created ratio, ratio.lt:2:5"), "{report}");
    assert!(report.contains("    return n / 0"), "{report}");
    assert!(report.contains("resolved <top>, ratio.lt:5:7"), "{report}");
    assert!(report.contains("print(r * 2)"), "{report}");
    assert!(interp.take_output().is_empty());
}

#[test]
fn unbound_name_suggests_alternatives() {
    let interp = test_interpreter();
    let err = interp
        .run(&program(vec![
            def("ratio").params(&["n"]).body(vec![deliver(var("n"))]),
            expr_item(call("ratoi", vec![int(1)])),
        ]))
        .unwrap_err();
    let report = format_eval_error(&err, &SourceMap::new(""), &ErrorConfig::default());
    assert!(report.contains("UNBOUND VARIABLE"));
    assert!(report.contains("Did you mean ratio?"));
}

#[test]
fn inline_failure_has_no_deferred_context() {
    let interp = test_interpreter();
    let err = interp
        .run(&program(vec![expr_item(add(int(1), string("x")))]))
        .unwrap_err();
    assert!(err.context().is_none());
    let report = format_eval_error(&err, &SourceMap::new(""), &ErrorConfig::default());
    assert!(report.contains("TYPE ERROR"));
    assert!(report.contains("cannot apply + to Int and String"));
}
