use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Version tag prepended to every encoded payload. Bumping this is a breaking
/// change to every content id in an existing database.
pub const FORMAT_VERSION: u8 = 1;

/// The plain values the store can persist. Maps are ordered by key so that
/// equal logical values always produce equal bytes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
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

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_list_mut(&mut self) -> Option<&mut Vec<Value>> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(entries) => Some(entries),
            _ => None,
        }
    }

    pub fn as_map_mut(&mut self) -> Option<&mut BTreeMap<String, Value>> {
        match self {
            Value::Map(entries) => Some(entries),
            _ => None,
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
        Value::Int(i.into())
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(entries: BTreeMap<String, Value>) -> Self {
        Value::Map(entries)
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("empty payload")]
    Empty,
    #[error("unsupported codec version {0}, expected {FORMAT_VERSION}")]
    UnsupportedVersion(u8),
    #[error("malformed payload: {0}")]
    Malformed(#[from] bincode::Error),
}

/// Adds version-tagged Bincode encode/decode methods to the types persisted
/// as table blobs. Encoding is deterministic: two equal values always produce
/// equal bytes.
pub trait Encode: Serialize + DeserializeOwned {
    fn encode(&self) -> Vec<u8> {
        let mut buf = vec![FORMAT_VERSION];
        bincode::serialize_into(&mut buf, self).expect("serialization to a buffer cannot fail");
        buf
    }

    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        match bytes.split_first() {
            None => Err(CodecError::Empty),
            Some((&FORMAT_VERSION, rest)) => Ok(bincode::deserialize(rest)?),
            Some((&version, _)) => Err(CodecError::UnsupportedVersion(version)),
        }
    }
}

impl Encode for Value {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoding_is_deterministic() {
        let a = Value::Map(BTreeMap::from([
            ("x".to_owned(), Value::Int(1)),
            ("y".to_owned(), Value::List(vec![Value::Text("s".to_owned()), Value::Null])),
        ]));
        let b = a.clone();
        assert_eq!(a.encode(), b.encode());
    }

    #[test]
    fn roundtrip() {
        let v = Value::List(vec![
            Value::Bool(true),
            Value::Float(2.5),
            Value::Bytes(vec![0, 1, 2]),
        ]);
        assert_eq!(Value::decode(&v.encode()).unwrap(), v);
    }

    #[test]
    fn version_tag_is_checked() {
        let mut bytes = Value::Int(7).encode();
        bytes[0] = FORMAT_VERSION + 1;
        assert!(matches!(
            Value::decode(&bytes),
            Err(CodecError::UnsupportedVersion(_))
        ));
        assert!(matches!(Value::decode(&[]), Err(CodecError::Empty)));
    }
}
