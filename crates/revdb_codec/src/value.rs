//! Dynamic document value type.

use std::collections::BTreeMap;
use std::fmt;

/// A document body: string keys mapped to values, kept in key order.
pub type Dict = BTreeMap<String, Value>;

/// Key that marks a dictionary as blob (attachment) metadata.
pub const BLOB_TYPE_KEY: &str = "@type";

/// Value of [`BLOB_TYPE_KEY`] for blob dictionaries.
pub const BLOB_TYPE: &str = "blob";

/// A value stored in a document body.
///
/// Bodies nest arbitrarily through [`Value::Array`] and [`Value::Dict`].
/// Floats are intentionally not part of the model so that encoding stays
/// deterministic and revision digests are stable.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Value {
    /// Null value.
    #[default]
    Null,
    /// Boolean value.
    Bool(bool),
    /// Signed integer (full i64 range).
    Integer(i64),
    /// UTF-8 text.
    Text(String),
    /// Raw bytes. Treated as inline attachment data.
    Bytes(Vec<u8>),
    /// Ordered list of values.
    Array(Vec<Value>),
    /// Nested dictionary.
    Dict(Dict),
}

impl Value {
    /// Builds a dictionary value from key/value pairs.
    pub fn dict<K, I>(pairs: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Value::Dict(pairs.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Check if this value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Get this value as a boolean, if it is one.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Get this value as an integer, if it is one.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Get this value as text, if it is text.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Get this value as bytes, if it is a byte string.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Get this value as an array, if it is one.
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Get this value as a dictionary, if it is one.
    pub fn as_dict(&self) -> Option<&Dict> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Get this value as a mutable dictionary, if it is one.
    pub fn as_dict_mut(&mut self) -> Option<&mut Dict> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Returns true if this dictionary describes a blob.
    pub fn is_blob(&self) -> bool {
        self.as_dict()
            .and_then(|d| d.get(BLOB_TYPE_KEY))
            .and_then(Value::as_text)
            == Some(BLOB_TYPE)
    }

    /// Returns true if this value holds attachment data anywhere inside it.
    ///
    /// Byte strings and blob dictionaries both count.
    pub fn has_attachments(&self) -> bool {
        match self {
            Value::Bytes(_) => true,
            Value::Array(items) => items.iter().any(Value::has_attachments),
            Value::Dict(d) => self.is_blob() || dict_has_attachments(d),
            _ => false,
        }
    }
}

/// Returns true if any value in the dictionary holds attachment data.
pub fn dict_has_attachments(dict: &Dict) -> bool {
    dict.values().any(Value::has_attachments)
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", crate::json::to_json(self))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Integer(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Integer(i64::from(n))
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Integer(i64::from(n))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<Dict> for Value {
    fn from(d: Dict) -> Self {
        Value::Dict(d)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accessors() {
        assert_eq!(Value::from(7).as_integer(), Some(7));
        assert_eq!(Value::from("x").as_text(), Some("x"));
        assert_eq!(Value::from(true).as_bool(), Some(true));
        assert!(Value::from(None::<i64>).is_null());
        assert!(Value::from("x").as_integer().is_none());
    }

    #[test]
    fn plain_body_has_no_attachments() {
        let v = Value::dict([
            ("name", Value::from("Alice")),
            ("tags", Value::Array(vec![Value::from("a"), Value::from(1)])),
        ]);
        assert!(!v.has_attachments());
    }

    #[test]
    fn nested_bytes_are_attachments() {
        let v = Value::dict([(
            "photos",
            Value::Array(vec![Value::dict([("data", Value::Bytes(vec![1, 2]))])]),
        )]);
        assert!(v.has_attachments());
    }

    #[test]
    fn blob_dict_is_attachment() {
        let blob = Value::dict([
            (BLOB_TYPE_KEY, Value::from(BLOB_TYPE)),
            ("length", Value::from(12)),
        ]);
        assert!(blob.is_blob());
        assert!(Value::dict([("avatar", blob)]).has_attachments());
    }
}
