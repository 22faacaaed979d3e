//! Dynamic values stored in slices
//!
//! Every slice holds a [`Record`]: an insertion-ordered map of field names
//! to [`Value`]s. Composite values sit behind `Arc`, so copying a record
//! only bumps reference counts and identity comparisons stay cheap.
//!
//! # Identity
//!
//! The engine never asks "are these two values structurally equal?" when
//! deciding whether something changed. It asks [`Value::is_same`], which
//! compares scalars by value and lists/maps by pointer. An action that
//! wants to signal a change to a list must build a new list.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// The state of one slice, or the derived fields of one slice.
pub type Record = IndexMap<String, Value>;

/// A dynamic value stored in a slice field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum Value {
    /// No value
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(Arc<str>),
    List(Arc<Vec<Value>>),
    Map(Arc<Record>),
}

impl Value {
    /// Identity comparison used for every change check in the store.
    ///
    /// Scalars compare by value (NaN is the same as NaN, `0.0` is not the
    /// same as `-0.0`), strings by content, lists and maps by pointer.
    pub fn is_same(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => {
                (a.is_nan() && b.is_nan()) || a.to_bits() == b.to_bits()
            }
            (Value::String(a), Value::String(b)) => a == b,
            (Value::List(a), Value::List(b)) => Arc::ptr_eq(a, b),
            (Value::Map(a), Value::Map(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Integers widen to floats.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Record> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Build a list value from anything convertible into values.
    pub fn list<I, V>(items: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Value::List(Arc::new(items.into_iter().map(Into::into).collect()))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::String(s) => write!(f, "\"{}\"", s),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Map(map) => {
                write!(f, "{{")?;
                for (i, (key, value)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", key, value)?;
                }
                write!(f, "}}")
            }
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<u32> for Value {
    fn from(i: u32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(Arc::from(s))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(Arc::from(s))
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(Arc::new(items))
    }
}

impl From<Record> for Value {
    fn from(map: Record) -> Self {
        Value::Map(Arc::new(map))
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map_or(Value::Null, Into::into)
    }
}

/// Build a [`Record`] from `"field" => value` pairs.
///
/// ```rust
/// use trellis_core::record;
///
/// let state = record! { "count" => 1, "label" => "clicks" };
/// assert_eq!(state["count"].as_int(), Some(1));
/// ```
#[macro_export]
macro_rules! record {
    () => {
        $crate::value::Record::new()
    };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut record = $crate::value::Record::new();
        $(
            record.insert(::std::string::String::from($key), $crate::value::Value::from($value));
        )+
        record
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalars_compare_by_value() {
        assert!(Value::Int(3).is_same(&Value::Int(3)));
        assert!(Value::from("a").is_same(&Value::from("a")));
        assert!(!Value::Int(3).is_same(&Value::Float(3.0)));
        assert!(Value::Null.is_same(&Value::Null));
    }

    #[test]
    fn float_identity_follows_object_is() {
        assert!(Value::Float(f64::NAN).is_same(&Value::Float(f64::NAN)));
        assert!(!Value::Float(0.0).is_same(&Value::Float(-0.0)));
    }

    #[test]
    fn composites_compare_by_pointer() {
        let list = Value::list([1, 2, 3]);
        let copy = list.clone();
        let rebuilt = Value::list([1, 2, 3]);

        assert!(list.is_same(&copy));
        assert!(!list.is_same(&rebuilt));
        // structural equality still holds
        assert_eq!(list, rebuilt);
    }

    #[test]
    fn record_macro_preserves_order() {
        let r = record! { "b" => 2, "a" => 1 };
        let keys: Vec<_> = r.keys().cloned().collect();
        assert_eq!(keys, vec!["b".to_string(), "a".to_string()]);
    }
}
