//! Runtime values
//!
//! Every variant is `Send + Sync` so promise thunks can run on pool threads.
//! A [`Value::Promise`] stands in for any other variant; the helpers here
//! that consume a value's contents resolve it first.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::eval::EvalError;
use crate::operators;
use crate::promise::{Promise, Site};

#[derive(Debug, Clone)]
pub enum Value {
    Unit,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    List(Arc<Vec<Value>>),
    Record(Arc<BTreeMap<String, Value>>),
    /// A reference to a user-defined function, by name
    Function(Arc<str>),
    Builtin(Builtin),
    /// A deferred value; transparent everywhere except the inspection methods
    Promise(Promise),
}

impl Value {
    pub fn str(s: impl AsRef<str>) -> Value {
        Value::Str(Arc::from(s.as_ref()))
    }

    pub fn list(items: Vec<Value>) -> Value {
        Value::List(Arc::new(items))
    }

    pub fn record<K: Into<String>>(fields: impl IntoIterator<Item = (K, Value)>) -> Value {
        Value::Record(Arc::new(
            fields.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        ))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Unit => "()",
            Value::Bool(_) => "Bool",
            Value::Int(_) => "Int",
            Value::Float(_) => "Float",
            Value::Str(_) => "String",
            Value::List(_) => "List",
            Value::Record(_) => "Record",
            Value::Function(_) => "Function",
            Value::Builtin(_) => "Builtin",
            Value::Promise(_) => "Promise",
        }
    }

    pub fn is_promise(&self) -> bool {
        matches!(self, Value::Promise(_))
    }

    pub fn as_promise(&self) -> Option<&Promise> {
        match self {
            Value::Promise(p) => Some(p),
            _ => None,
        }
    }

    /// Resolve a promise from host code. Concrete values are returned as-is.
    pub fn force(&self) -> Result<Value, EvalError> {
        self.force_at(&Site::host())
    }

    /// Resolve a promise, recording `site` as the resolution location.
    pub fn force_at(&self, site: &Site) -> Result<Value, EvalError> {
        match self {
            Value::Promise(p) => p.resolve_at(site),
            other => Ok(other.clone()),
        }
    }

    /// Resolve this value and everything nested in its lists and records.
    pub fn force_deep(&self) -> Result<Value, EvalError> {
        match self.force()? {
            Value::List(items) => Ok(Value::list(
                items
                    .iter()
                    .map(Value::force_deep)
                    .collect::<Result<_, _>>()?,
            )),
            Value::Record(fields) => {
                let mut out = BTreeMap::new();
                for (name, value) in fields.iter() {
                    out.insert(name.clone(), value.force_deep()?);
                }
                Ok(Value::Record(Arc::new(out)))
            }
            other => Ok(other),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Truthiness for conditions and logical operators
    pub fn truthy(&self) -> Result<bool, EvalError> {
        match self.force()? {
            Value::Bool(b) => Ok(b),
            other => Err(EvalError::TypeError(format!(
                "expected Bool in condition, found {}",
                other.type_name()
            ))),
        }
    }

    /// Structural equality of two concrete values. Elements of lists and
    /// records are resolved at `site` as they are compared; a top-level
    /// promise here compares unequal, so callers resolve it first.
    pub(crate) fn concrete_eq(&self, other: &Value, site: &Site) -> Result<bool, EvalError> {
        match (self, other) {
            (Value::Unit, Value::Unit) => Ok(true),
            (Value::Bool(a), Value::Bool(b)) => Ok(a == b),
            (Value::Int(a), Value::Int(b)) => Ok(a == b),
            (Value::Float(a), Value::Float(b)) => Ok(a == b),
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
                Ok((*a as f64) == *b)
            }
            (Value::Str(a), Value::Str(b)) => Ok(a == b),
            (Value::List(a), Value::List(b)) => {
                if a.len() != b.len() {
                    return Ok(false);
                }
                for (x, y) in a.iter().zip(b.iter()) {
                    if !operators::equals(x, y, site)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            (Value::Record(a), Value::Record(b)) => {
                if a.len() != b.len() || !a.keys().eq(b.keys()) {
                    return Ok(false);
                }
                for (x, y) in a.values().zip(b.values()) {
                    if !operators::equals(x, y, site)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            (Value::Function(a), Value::Function(b)) => Ok(a == b),
            (Value::Builtin(a), Value::Builtin(b)) => Ok(a == b),
            _ => Ok(false),
        }
    }

    fn write_display(&self, f: &mut fmt::Formatter<'_>, quoted: bool) -> fmt::Result {
        match self {
            Value::Unit => f.write_str("()"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(n) => write!(f, "{}", n),
            Value::Float(x) => {
                if x.fract() == 0.0 && x.is_finite() {
                    write!(f, "{:.1}", x)
                } else {
                    write!(f, "{}", x)
                }
            }
            Value::Str(s) if quoted => write!(f, "{:?}", s.as_ref()),
            Value::Str(s) => f.write_str(s),
            Value::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    item.write_display(f, true)?;
                }
                f.write_str("]")
            }
            Value::Record(fields) => {
                f.write_str("{")?;
                for (i, (name, value)) in fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}: ", name)?;
                    value.write_display(f, true)?;
                }
                f.write_str("}")
            }
            Value::Function(name) => write!(f, "<function {}>", name),
            Value::Builtin(b) => write!(f, "<builtin {}>", b.name()),
            Value::Promise(p) => match p.resolve() {
                Ok(v) => v.write_display(f, quoted),
                Err(e) => write!(f, "<error: {}>", e),
            },
        }
    }
}

/// Host-side equality. Resolves promises on both sides, nested ones
/// included; a value whose resolution fails equals nothing. The language's
/// `==` reports such failures instead, see [`operators::equals`].
impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        operators::equals(self, other, &Site::host()).unwrap_or(false)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_display(f, false)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::str(s)
    }
}

impl From<Promise> for Value {
    fn from(p: Promise) -> Self {
        Value::Promise(p)
    }
}

/// Functions provided by the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Builtin {
    Print,
    Len,
    Str,
    Sleep,
    Combine,
    Range,
    TypeOf,
    GroupSummary,
}

impl Builtin {
    pub const ALL: [Builtin; 8] = [
        Builtin::Print,
        Builtin::Len,
        Builtin::Str,
        Builtin::Sleep,
        Builtin::Combine,
        Builtin::Range,
        Builtin::TypeOf,
        Builtin::GroupSummary,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Builtin::Print => "print",
            Builtin::Len => "len",
            Builtin::Str => "str",
            Builtin::Sleep => "sleep",
            Builtin::Combine => "combine",
            Builtin::Range => "range",
            Builtin::TypeOf => "type_of",
            Builtin::GroupSummary => "group_summary",
        }
    }

    pub fn from_name(name: &str) -> Option<Builtin> {
        Builtin::ALL.iter().copied().find(|b| b.name() == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_nested() {
        let v = Value::record([
            ("name", Value::str("ada")),
            ("scores", Value::list(vec![Value::Int(1), Value::Float(2.5)])),
        ]);
        assert_eq!(v.to_string(), "{name: \"ada\", scores: [1, 2.5]}");
    }

    #[test]
    fn test_display_float_whole() {
        assert_eq!(Value::Float(3.0).to_string(), "3.0");
    }

    #[test]
    fn test_equality_across_numeric_types() {
        assert_eq!(Value::Int(2), Value::Float(2.0));
        assert_ne!(Value::Int(2), Value::str("2"));
    }

    #[test]
    fn test_builtin_names_round_trip() {
        for b in Builtin::ALL {
            assert_eq!(Builtin::from_name(b.name()), Some(b));
        }
        assert_eq!(Builtin::from_name("nope"), None);
    }

    #[test]
    fn test_truthy_rejects_non_bool() {
        assert!(Value::Bool(true).truthy().unwrap());
        assert!(matches!(
            Value::Int(1).truthy(),
            Err(EvalError::TypeError(_))
        ));
    }
}
