//! The dynamic object graph stored in database rows.

use std::fmt;

/// A dynamic value: the unit of storage for row objects and metadata.
///
/// `Value` is deliberately small and codec-neutral. The CBOR codec can
/// represent every variant; the JSON codec restricts map keys to text.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Absent / null.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed 64-bit integer.
    Integer(i64),
    /// 64-bit float.
    Float(f64),
    /// UTF-8 text.
    Text(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
    /// Ordered list of values.
    Array(Vec<Value>),
    /// Ordered key/value pairs. Keys are usually text but need not be.
    Map(Vec<(Value, Value)>),
}

impl Value {
    /// Creates a map value from key/value pairs.
    #[must_use]
    pub fn map(pairs: Vec<(Value, Value)>) -> Self {
        Self::Map(pairs)
    }

    /// Creates a text-keyed map entry list from `(name, value)` pairs.
    #[must_use]
    pub fn record(fields: Vec<(&str, Value)>) -> Self {
        Self::Map(
            fields
                .into_iter()
                .map(|(k, v)| (Value::Text(k.to_string()), v))
                .collect(),
        )
    }

    /// Returns the boolean value, if this is a bool.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the integer value, if this is an integer.
    #[must_use]
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns the float value, if this is a float.
    #[must_use]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Returns the text value, if this is text.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the byte value, if this is bytes.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Returns the array elements, if this is an array.
    #[must_use]
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Returns the map pairs, if this is a map.
    #[must_use]
    pub fn as_map(&self) -> Option<&[(Value, Value)]> {
        match self {
            Self::Map(pairs) => Some(pairs),
            _ => None,
        }
    }

    /// Looks up a text key in a map value.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.as_map()?
            .iter()
            .find(|(k, _)| k.as_text() == Some(field))
            .map(|(_, v)| v)
    }

    /// Returns true if this value is `Null`.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Replaces or appends a text-keyed field in a map value.
    ///
    /// Non-map values are left untouched.
    pub fn set_field(&mut self, field: &str, value: Value) {
        if let Self::Map(pairs) = self {
            if let Some(entry) = pairs.iter_mut().find(|(k, _)| k.as_text() == Some(field)) {
                entry.1 = value;
            } else {
                pairs.push((Value::Text(field.to_string()), value));
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Text(s) => write!(f, "{s:?}"),
            Self::Bytes(b) => write!(f, "bytes[{}]", b.len()),
            Self::Array(items) => write!(f, "array[{}]", items.len()),
            Self::Map(pairs) => write!(f, "map[{}]", pairs.len()),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Self::Array(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accessors() {
        assert_eq!(Value::from(true).as_bool(), Some(true));
        assert_eq!(Value::from(42i64).as_integer(), Some(42));
        assert_eq!(Value::from(1.5).as_float(), Some(1.5));
        assert_eq!(Value::from("hi").as_text(), Some("hi"));
        assert_eq!(Value::from(vec![1u8, 2]).as_bytes(), Some(&[1u8, 2][..]));
        assert!(Value::Null.is_null());
        assert_eq!(Value::from("hi").as_integer(), None);
    }

    #[test]
    fn map_get() {
        let value = Value::record(vec![("name", "ada".into()), ("age", 36i64.into())]);
        assert_eq!(value.get("name").and_then(Value::as_text), Some("ada"));
        assert_eq!(value.get("age").and_then(Value::as_integer), Some(36));
        assert!(value.get("missing").is_none());
    }

    #[test]
    fn set_field_replaces_and_appends() {
        let mut value = Value::record(vec![("a", 1i64.into())]);
        value.set_field("a", 2i64.into());
        value.set_field("b", 3i64.into());
        assert_eq!(value.get("a").and_then(Value::as_integer), Some(2));
        assert_eq!(value.get("b").and_then(Value::as_integer), Some(3));
    }
}
