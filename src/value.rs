//! Self-describing value algebra stored in pool entries
//!
//! Every payload that flows through a pool is a `Value`: a small closed
//! algebra of nulls, booleans, 64-bit integers, floats, byte strings,
//! unicode strings, lists, and string-keyed maps. The wire form is the
//! bincode encoding of the tagged enum, which round-trips by construction.
//! Applications needing richer types serialize upstream into `Bytes`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{MventError, Result};

/// A value storable in a shared pool entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Absent / null
    Null,
    /// Boolean
    Bool(bool),
    /// Signed 64-bit integer
    Int(i64),
    /// 64-bit float
    Float(f64),
    /// Opaque byte string
    Bytes(Vec<u8>),
    /// Unicode string
    Str(String),
    /// Ordered list of values
    List(Vec<Value>),
    /// Map with string keys; ordered for deterministic encoding
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Build a map value from key-value pairs
    pub fn map<K: Into<String>>(entries: impl IntoIterator<Item = (K, Value)>) -> Self {
        Value::Map(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v))
                .collect(),
        )
    }

    /// True iff this is `Value::Null`
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Borrow as bool
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Borrow as i64
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Borrow as f64
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Borrow as str
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Borrow as bytes
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Borrow as list
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    /// Borrow as map
    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Look up a key in a map value
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map().and_then(|m| m.get(key))
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(v: BTreeMap<String, Value>) -> Self {
        Value::Map(v)
    }
}

/// Encode a value into its wire form
pub fn encode_value(value: &Value) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| MventError::encode(format!("bincode error: {}", e)))
}

/// Decode a value from its wire form
pub fn decode_value(bytes: &[u8]) -> Result<Value> {
    bincode::deserialize(bytes).map_err(MventError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(v: Value) -> Value {
        decode_value(&encode_value(&v).unwrap()).unwrap()
    }

    #[test]
    fn test_scalar_roundtrip() {
        assert_eq!(roundtrip(Value::Null), Value::Null);
        assert_eq!(roundtrip(Value::Bool(true)), Value::Bool(true));
        assert_eq!(roundtrip(Value::Int(-42)), Value::Int(-42));
        assert_eq!(roundtrip(Value::Float(1.5)), Value::Float(1.5));
        assert_eq!(
            roundtrip(Value::Str("héllo".into())),
            Value::Str("héllo".into())
        );
        assert_eq!(
            roundtrip(Value::Bytes(vec![0, 255, 128])),
            Value::Bytes(vec![0, 255, 128])
        );
    }

    #[test]
    fn test_nested_roundtrip() {
        let v = Value::map([
            ("name", Value::from("Bob")),
            ("age", Value::from(30)),
            (
                "tags",
                Value::List(vec![Value::from("a"), Value::from("b"), Value::Null]),
            ),
            ("meta", Value::map([("inner", Value::from(1.25))])),
        ]);
        assert_eq!(roundtrip(v.clone()), v);
    }

    #[test]
    fn test_accessors() {
        let v = Value::map([("n", Value::from(7))]);
        assert_eq!(v.get("n").and_then(Value::as_int), Some(7));
        assert_eq!(v.get("missing"), None);
        assert!(Value::Null.is_null());
        assert_eq!(Value::from("x").as_str(), Some("x"));
        assert_eq!(Value::from(true).as_int(), None);
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(decode_value(&[0xff; 16]).is_err());
    }
}
