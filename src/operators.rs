//! Operator table for runtime values.
//!
//! Every operator resolves its operands first, so a promise behaves exactly
//! like the value it stands for. The evaluator calls the free functions
//! with the site of the expression; host code can use the `std::ops`
//! implementations on `&Value`, which resolve from a host site.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::ops::{Add, Div, Mul, Neg, Not, Rem, Sub};
use std::sync::Arc;

use crate::ast::{BinOp, UnaryOp};
use crate::eval::EvalError;
use crate::promise::Site;
use crate::value::Value;

/// Apply a binary operator. `And`/`Or` here are strict; the evaluator
/// short-circuits them before reaching this table.
pub fn binop(op: BinOp, left: &Value, right: &Value, site: &Site) -> Result<Value, EvalError> {
    let left = left.force_at(site)?;
    let right = right.force_at(site)?;
    concrete_binop(op, &left, &right, site)
}

fn concrete_binop(op: BinOp, left: &Value, right: &Value, site: &Site) -> Result<Value, EvalError> {
    match (op, left, right) {
        // Integer arithmetic
        (BinOp::Add, Value::Int(a), Value::Int(b)) => checked(a.checked_add(*b)),
        (BinOp::Sub, Value::Int(a), Value::Int(b)) => checked(a.checked_sub(*b)),
        (BinOp::Mul, Value::Int(a), Value::Int(b)) => checked(a.checked_mul(*b)),
        (BinOp::Div, Value::Int(_), Value::Int(0)) => Err(EvalError::DivisionByZero),
        (BinOp::Div, Value::Int(a), Value::Int(b)) => checked(a.checked_div(*b)),
        (BinOp::Mod, Value::Int(_), Value::Int(0)) => Err(EvalError::DivisionByZero),
        (BinOp::Mod, Value::Int(a), Value::Int(b)) => checked(a.checked_rem(*b)),

        // Float arithmetic, with integers promoted
        (BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod, _, _)
            if is_number(left) && is_number(right) =>
        {
            let (a, b) = (as_f64(left), as_f64(right));
            match op {
                BinOp::Add => Ok(Value::Float(a + b)),
                BinOp::Sub => Ok(Value::Float(a - b)),
                BinOp::Mul => Ok(Value::Float(a * b)),
                BinOp::Div if b == 0.0 => Err(EvalError::DivisionByZero),
                BinOp::Div => Ok(Value::Float(a / b)),
                BinOp::Mod if b == 0.0 => Err(EvalError::DivisionByZero),
                _ => Ok(Value::Float(a % b)),
            }
        }

        // Concatenation
        (BinOp::Add, Value::Str(a), Value::Str(b)) => Ok(Value::str(format!("{}{}", a, b))),
        (BinOp::Add, Value::List(a), Value::List(b)) => {
            let mut items = Vec::with_capacity(a.len() + b.len());
            items.extend(a.iter().cloned());
            items.extend(b.iter().cloned());
            Ok(Value::list(items))
        }
        (BinOp::Add, Value::Record(a), Value::Record(b)) => {
            let mut fields: BTreeMap<String, Value> = (**a).clone();
            fields.extend(b.iter().map(|(k, v)| (k.clone(), v.clone())));
            Ok(Value::Record(Arc::new(fields)))
        }
        (BinOp::Mul, Value::Str(s), Value::Int(n)) | (BinOp::Mul, Value::Int(n), Value::Str(s)) => {
            repeat(s, *n)
        }

        // Equality
        (BinOp::Eq, a, b) => Ok(Value::Bool(a.concrete_eq(b, site)?)),
        (BinOp::Neq, a, b) => Ok(Value::Bool(!a.concrete_eq(b, site)?)),

        // Ordering
        (BinOp::Lt | BinOp::Gt | BinOp::Lte | BinOp::Gte, a, b) => {
            let ord = concrete_cmp(a, b, site)?;
            Ok(Value::Bool(match op {
                BinOp::Lt => ord == Ordering::Less,
                BinOp::Gt => ord == Ordering::Greater,
                BinOp::Lte => ord != Ordering::Greater,
                _ => ord != Ordering::Less,
            }))
        }

        // Boolean
        (BinOp::And, Value::Bool(a), Value::Bool(b)) => Ok(Value::Bool(*a && *b)),
        (BinOp::Or, Value::Bool(a), Value::Bool(b)) => Ok(Value::Bool(*a || *b)),

        _ => Err(EvalError::TypeError(format!(
            "cannot apply {} to {} and {}",
            op.symbol(),
            left.type_name(),
            right.type_name()
        ))),
    }
}

pub fn unary(op: UnaryOp, operand: &Value, site: &Site) -> Result<Value, EvalError> {
    match (op, operand.force_at(site)?) {
        (UnaryOp::Neg, Value::Int(n)) => checked(n.checked_neg()),
        (UnaryOp::Neg, Value::Float(x)) => Ok(Value::Float(-x)),
        (UnaryOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
        (op, other) => Err(EvalError::TypeError(format!(
            "cannot apply {} to {}",
            op,
            other.type_name()
        ))),
    }
}

/// Structural equality after resolution. Nested promises are resolved as
/// they are reached; a failure among them is an error, not inequality.
pub fn equals(left: &Value, right: &Value, site: &Site) -> Result<bool, EvalError> {
    left.force_at(site)?.concrete_eq(&right.force_at(site)?, site)
}

/// Ordering of two values after resolution
pub fn compare(left: &Value, right: &Value, site: &Site) -> Result<Ordering, EvalError> {
    concrete_cmp(&left.force_at(site)?, &right.force_at(site)?, site)
}

fn concrete_cmp(left: &Value, right: &Value, site: &Site) -> Result<Ordering, EvalError> {
    match (left, right) {
        (Value::Int(a), Value::Int(b)) => Ok(a.cmp(b)),
        (a, b) if is_number(a) && is_number(b) => as_f64(a)
            .partial_cmp(&as_f64(b))
            .ok_or_else(|| EvalError::TypeError("cannot order NaN".into())),
        (Value::Str(a), Value::Str(b)) => Ok(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Ok(a.cmp(b)),
        (Value::List(a), Value::List(b)) => {
            for (x, y) in a.iter().zip(b.iter()) {
                let ord = compare(x, y, site)?;
                if ord != Ordering::Equal {
                    return Ok(ord);
                }
            }
            Ok(a.len().cmp(&b.len()))
        }
        _ => Err(EvalError::TypeError(format!(
            "cannot compare {} with {}",
            left.type_name(),
            right.type_name()
        ))),
    }
}

/// Field access: `target.name`
pub fn field(target: &Value, name: &str, site: &Site) -> Result<Value, EvalError> {
    match target.force_at(site)? {
        Value::Record(fields) => fields.get(name).cloned().ok_or_else(|| EvalError::NoSuchField {
            field: name.to_string(),
            type_name: "Record",
        }),
        other => Err(EvalError::NoSuchField {
            field: name.to_string(),
            type_name: other.type_name(),
        }),
    }
}

/// Indexing: `target[index]`. Negative indices count from the end.
pub fn index(target: &Value, index: &Value, site: &Site) -> Result<Value, EvalError> {
    let target = target.force_at(site)?;
    let index = index.force_at(site)?;
    match (&target, &index) {
        (Value::List(items), Value::Int(i)) => {
            let pos = normalize_index(*i, items.len())?;
            Ok(items[pos].clone())
        }
        (Value::Str(s), Value::Int(i)) => {
            let chars: Vec<char> = s.chars().collect();
            let pos = normalize_index(*i, chars.len())?;
            Ok(Value::str(chars[pos].to_string()))
        }
        (Value::Record(fields), Value::Str(key)) => {
            fields.get(key.as_ref()).cloned().ok_or_else(|| EvalError::NoSuchField {
                field: key.to_string(),
                type_name: "Record",
            })
        }
        _ => Err(EvalError::TypeError(format!(
            "cannot index {} with {}",
            target.type_name(),
            index.type_name()
        ))),
    }
}

fn normalize_index(i: i64, len: usize) -> Result<usize, EvalError> {
    let pos = if i < 0 { len as i64 + i } else { i };
    if pos < 0 || pos >= len as i64 {
        return Err(EvalError::IndexOutOfRange { index: i, len });
    }
    Ok(pos as usize)
}

/// The elements a `for` loop visits. Records iterate their field names.
pub fn iterate(target: &Value, site: &Site) -> Result<Vec<Value>, EvalError> {
    match target.force_at(site)? {
        Value::List(items) => Ok(items.as_ref().clone()),
        Value::Str(s) => Ok(s.chars().map(|c| Value::str(c.to_string())).collect()),
        Value::Record(fields) => Ok(fields.keys().map(Value::str).collect()),
        other => Err(EvalError::TypeError(format!(
            "cannot iterate over {}",
            other.type_name()
        ))),
    }
}

/// Longest string `*` will build, in bytes
const MAX_REPEAT_BYTES: usize = 1 << 30;

fn repeat(s: &str, n: i64) -> Result<Value, EvalError> {
    let count = usize::try_from(n.max(0)).unwrap_or(usize::MAX);
    match s.len().checked_mul(count) {
        Some(len) if len <= MAX_REPEAT_BYTES => Ok(Value::str(s.repeat(count))),
        _ => Err(EvalError::RuntimeError(format!(
            "string repeated {} times exceeds {} bytes",
            n, MAX_REPEAT_BYTES
        ))),
    }
}

fn checked(result: Option<i64>) -> Result<Value, EvalError> {
    result
        .map(Value::Int)
        .ok_or_else(|| EvalError::RuntimeError("integer overflow".into()))
}

fn is_number(v: &Value) -> bool {
    matches!(v, Value::Int(_) | Value::Float(_))
}

fn as_f64(v: &Value) -> f64 {
    match v {
        Value::Int(n) => *n as f64,
        Value::Float(x) => *x,
        _ => f64::NAN,
    }
}

// ============================================================================
// std::ops for host code
// ============================================================================

macro_rules! host_binop {
    ($trait:ident, $method:ident, $op:expr) => {
        impl $trait<&Value> for &Value {
            type Output = Result<Value, EvalError>;

            fn $method(self, rhs: &Value) -> Self::Output {
                binop($op, self, rhs, &Site::host())
            }
        }
    };
}

host_binop!(Add, add, BinOp::Add);
host_binop!(Sub, sub, BinOp::Sub);
host_binop!(Mul, mul, BinOp::Mul);
host_binop!(Div, div, BinOp::Div);
host_binop!(Rem, rem, BinOp::Mod);

impl Neg for &Value {
    type Output = Result<Value, EvalError>;

    fn neg(self) -> Self::Output {
        unary(UnaryOp::Neg, self, &Site::host())
    }
}

impl Not for &Value {
    type Output = Result<Value, EvalError>;

    fn not(self) -> Self::Output {
        unary(UnaryOp::Not, self, &Site::host())
    }
}

impl Value {
    pub fn get_field(&self, name: &str) -> Result<Value, EvalError> {
        field(self, name, &Site::host())
    }

    pub fn get_index(&self, idx: &Value) -> Result<Value, EvalError> {
        index(self, idx, &Site::host())
    }

    pub fn elements(&self) -> Result<Vec<Value>, EvalError> {
        iterate(self, &Site::host())
    }

    pub fn try_cmp(&self, other: &Value) -> Result<Ordering, EvalError> {
        compare(self, other, &Site::host())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Span;
    use crate::config::EngineConfig;
    use crate::promise::PromiseSpec;
    use crate::runtime::ExecutionBoundary;

    #[test]
    fn test_int_arithmetic() {
        assert_eq!((&Value::Int(5) + &Value::Int(2)).unwrap(), Value::Int(7));
        assert_eq!((&Value::Int(7) / &Value::Int(2)).unwrap(), Value::Int(3));
        assert_eq!((&Value::Int(7) % &Value::Int(2)).unwrap(), Value::Int(1));
    }

    #[test]
    fn test_division_by_zero() {
        assert!(matches!(&Value::Int(1) / &Value::Int(0), Err(EvalError::DivisionByZero)));
        assert!(matches!(&Value::Float(1.0) / &Value::Int(0), Err(EvalError::DivisionByZero)));
    }

    #[test]
    fn test_overflow_is_an_error() {
        assert!(matches!(
            &Value::Int(i64::MAX) + &Value::Int(1),
            Err(EvalError::RuntimeError(_))
        ));
    }

    #[test]
    fn test_mixed_numeric_promotes() {
        assert_eq!((&Value::Int(1) + &Value::Float(0.5)).unwrap(), Value::Float(1.5));
    }

    #[test]
    fn test_concatenation() {
        assert_eq!(
            (&Value::str("ab") + &Value::str("cd")).unwrap(),
            Value::str("abcd")
        );
        let joined = (&Value::list(vec![Value::Int(1)]) + &Value::list(vec![Value::Int(2)])).unwrap();
        assert_eq!(joined, Value::list(vec![Value::Int(1), Value::Int(2)]));
    }

    #[test]
    fn test_type_error_message() {
        let err = (&Value::Int(1) + &Value::Bool(true)).unwrap_err();
        assert_eq!(err.to_string(), "type error: cannot apply + to Int and Bool");
    }

    #[test]
    fn test_negative_index() {
        let list = Value::list(vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
        assert_eq!(list.get_index(&Value::Int(-1)).unwrap(), Value::Int(3));
        assert!(matches!(
            list.get_index(&Value::Int(3)),
            Err(EvalError::IndexOutOfRange { index: 3, len: 3 })
        ));
    }

    #[test]
    fn test_field_access() {
        let rec = Value::record([("result", Value::Int(4))]);
        assert_eq!(rec.get_field("result").unwrap(), Value::Int(4));
        assert!(matches!(
            rec.get_field("missing"),
            Err(EvalError::NoSuchField { .. })
        ));
        assert!(matches!(
            Value::Int(1).get_field("x"),
            Err(EvalError::NoSuchField { type_name: "Int", .. })
        ));
    }

    #[test]
    fn test_ordering() {
        assert_eq!(Value::Int(1).try_cmp(&Value::Float(1.5)).unwrap(), Ordering::Less);
        assert_eq!(Value::str("b").try_cmp(&Value::str("a")).unwrap(), Ordering::Greater);
        assert!(Value::Int(1).try_cmp(&Value::str("a")).is_err());
    }

    #[test]
    fn test_unary() {
        assert_eq!((-&Value::Int(3)).unwrap(), Value::Int(-3));
        assert_eq!((!&Value::Bool(true)).unwrap(), Value::Bool(false));
        assert!((!&Value::Int(1)).is_err());
    }

    #[test]
    fn test_string_repeat() {
        assert_eq!((&Value::str("ab") * &Value::Int(3)).unwrap(), Value::str("ababab"));
        assert_eq!((&Value::Int(-2) * &Value::str("ab")).unwrap(), Value::str(""));
        assert!(matches!(
            &Value::str("ab") * &Value::Int(i64::MAX),
            Err(EvalError::RuntimeError(_))
        ));
    }

    fn failing(b: &Arc<ExecutionBoundary>) -> Value {
        Value::Promise(b.defer(
            PromiseSpec::new(Site::host()),
            Box::new(|| Err(EvalError::DivisionByZero)),
            None,
        ))
    }

    fn boundary() -> Arc<ExecutionBoundary> {
        ExecutionBoundary::new(EngineConfig::default().with_workers(1)).unwrap()
    }

    fn at(start: usize, end: usize) -> Site {
        Site::new(Some(Arc::from("caller")), Span::new(start, end))
    }

    #[test]
    fn test_equality_reports_nested_failure() {
        let b = boundary();
        let left = Value::list(vec![failing(&b)]);
        let right = Value::list(vec![Value::Int(1)]);
        let err = binop(BinOp::Eq, &left, &right, &at(3, 9)).unwrap_err();
        assert!(matches!(err.root_cause(), EvalError::DivisionByZero));
        assert_eq!(err.context().unwrap().resolved_at, at(3, 9));

        let rec = Value::record([("v", failing(&b))]);
        let same_keys = Value::record([("v", Value::Int(1))]);
        assert!(binop(BinOp::Neq, &rec, &same_keys, &at(0, 1)).is_err());
        // Different shapes never resolve their elements
        assert_eq!(
            binop(BinOp::Eq, &left, &Value::list(vec![]), &at(0, 1)).unwrap(),
            Value::Bool(false)
        );
    }

    #[test]
    fn test_list_ordering_keeps_site() {
        let b = boundary();
        let left = Value::list(vec![failing(&b)]);
        let right = Value::list(vec![Value::Int(1)]);
        let err = compare(&left, &right, &at(4, 7)).unwrap_err();
        assert_eq!(err.context().unwrap().resolved_at, at(4, 7));
    }

    #[test]
    fn test_iterate_record_keys() {
        let rec = Value::record([("b", Value::Int(1)), ("a", Value::Int(2))]);
        assert_eq!(rec.elements().unwrap(), vec![Value::str("a"), Value::str("b")]);
    }
}
