//! Property-based tests for promise transparency
//!
//! These tests verify the two laws that make lazy delivery invisible:
//! - Transparency: an operator applied to a promise gives the same result as
//!   the operator applied to the resolved value
//! - Round trip: `return E` followed by any access equals `deliver E`

use std::sync::OnceLock;

use proptest::prelude::*;

use latent::ast::{BinOp, Expr, Item};
use latent::eval::Interpreter;
use latent::test_support::*;
use latent::value::Value;

/// One interpreter for all cases; each case defines its own functions
fn interp() -> &'static Interpreter {
    static INTERP: OnceLock<Interpreter> = OnceLock::new();
    INTERP.get_or_init(|| {
        let interp = test_interpreter();
        interp
            .run(&program(vec![
                def("lazy_id").params(&["x"]).body(vec![ret(var("x"))]),
                def("eager_id").params(&["x"]).body(vec![deliver(var("x"))]),
            ]))
            .expect("helper definitions run");
        interp
    })
}

/// Comparable outcome of a run: the forced value, or the failure's root
fn outcome(items: Vec<Item>) -> Result<Value, String> {
    interp()
        .run(&program(items))
        .and_then(|v| v.force_deep())
        .map_err(|e| e.root_cause().to_string())
}

// ============================================================================
// Generators
// ============================================================================

fn arb_binop() -> impl Strategy<Value = BinOp> {
    prop_oneof![
        Just(BinOp::Add),
        Just(BinOp::Sub),
        Just(BinOp::Mul),
        Just(BinOp::Div),
        Just(BinOp::Mod),
        Just(BinOp::Eq),
        Just(BinOp::Neq),
        Just(BinOp::Lt),
        Just(BinOp::Gte),
    ]
}

fn arb_leaf() -> impl Strategy<Value = Value> {
    prop_oneof![
        4 => (-50i64..50).prop_map(Value::Int),
        1 => (-50i64..50).prop_map(|n| Value::Float(n as f64 / 4.0)),
        1 => "[a-c]{0,3}".prop_map(Value::str),
        1 => any::<bool>().prop_map(Value::Bool),
    ]
}

fn literal(value: &Value) -> Expr {
    match value {
        Value::Int(n) => int(*n),
        Value::Float(x) => float(*x),
        Value::Str(s) => string(s),
        Value::Bool(b) => boolean(*b),
        _ => unit(),
    }
}

/// Arithmetic expression trees over small integers
fn arb_int_expr(depth: u32) -> BoxedStrategy<Expr> {
    let leaf = (-20i64..20).prop_map(int).boxed();
    if depth == 0 {
        return leaf;
    }
    prop_oneof![
        2 => leaf,
        3 => (arb_binop(), arb_int_expr(depth - 1), arb_int_expr(depth - 1))
            .prop_map(|(op, l, r)| binop(op, l, r)),
        1 => (any::<bool>(), arb_int_expr(depth - 1), arb_int_expr(depth - 1))
            .prop_map(|(c, a, b)| if_expr(boolean(c), a, b)),
        1 => prop::collection::vec(arb_int_expr(depth - 1), 0..3).prop_map(list),
    ]
    .boxed()
}

// ============================================================================
// Laws
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn transparency_left_operand(op in arb_binop(), a in arb_leaf(), b in arb_leaf()) {
        let wrapped = outcome(vec![expr_item(binop(
            op,
            call("lazy_id", vec![literal(&a)]),
            literal(&b),
        ))]);
        let concrete = outcome(vec![expr_item(binop(op, literal(&a), literal(&b)))]);
        prop_assert_eq!(wrapped, concrete);
    }

    #[test]
    fn transparency_right_operand(op in arb_binop(), a in arb_leaf(), b in arb_leaf()) {
        let wrapped = outcome(vec![expr_item(binop(
            op,
            literal(&a),
            call("lazy_id", vec![literal(&b)]),
        ))]);
        let concrete = outcome(vec![expr_item(binop(op, literal(&a), literal(&b)))]);
        prop_assert_eq!(wrapped, concrete);
    }

    #[test]
    fn transparency_host_operators(a in -1000i64..1000, b in 1i64..1000) {
        let p = interp().call("lazy_id", vec![Value::Int(a)]).unwrap();
        let q = Value::Int(b);
        prop_assert_eq!((&p + &q).unwrap(), Value::Int(a + b));
        prop_assert_eq!((&p * &q).unwrap(), Value::Int(a * b));
        prop_assert_eq!((&q - &p).unwrap(), Value::Int(b - a));
        prop_assert_eq!((&p % &q).unwrap(), Value::Int(a % b));
        prop_assert_eq!((-&p).unwrap(), Value::Int(-a));
        prop_assert_eq!(p.to_string(), a.to_string());
    }

    #[test]
    fn transparency_index_and_iteration(items in prop::collection::vec(-100i64..100, 1..6), i in 0usize..6) {
        let xs = list(items.iter().copied().map(int).collect());
        let idx = (i % items.len()) as i64;
        let wrapped = outcome(vec![expr_item(list(vec![
            index(call("lazy_id", vec![xs.clone()]), int(idx)),
            call("len", vec![call("lazy_id", vec![xs.clone()])]),
        ]))]);
        prop_assert_eq!(
            wrapped,
            Ok(Value::list(vec![Value::Int(items[idx as usize]), Value::Int(items.len() as i64)]))
        );
    }

    #[test]
    fn round_trip(e in arb_int_expr(3)) {
        let lazy = outcome(vec![expr_item(call("lazy_id", vec![e.clone()]))]);
        let eager = outcome(vec![expr_item(call("eager_id", vec![e.clone()]))]);
        let direct = outcome(vec![expr_item(e)]);
        prop_assert_eq!(&lazy, &eager);
        prop_assert_eq!(lazy, direct);
    }

    #[test]
    fn round_trip_deferred_operand(e in arb_int_expr(3)) {
        let lazy = outcome(vec![
            def("defer_expr").body(vec![ret(e.clone())]),
            expr_item(call("defer_expr", vec![])),
        ]);
        let eager = outcome(vec![
            def("deliver_expr").body(vec![deliver(e)]),
            expr_item(call("deliver_expr", vec![])),
        ]);
        prop_assert_eq!(lazy, eager);
    }
}
