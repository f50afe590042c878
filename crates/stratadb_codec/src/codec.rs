//! Serializer strategies and the built-in codecs.

use crate::error::{CodecError, CodecResult};
use crate::value::Value;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Converts a row object into its stored byte representation.
///
/// Implementations must be pure: the same `(collection, key, object)` input
/// always yields the same bytes, with no side effects.
pub trait ObjectSerializer: Send + Sync {
    /// Serializes `object` for the row at `(collection, key)`.
    fn serialize(&self, collection: &str, key: &str, object: &Value) -> CodecResult<Vec<u8>>;
}

/// Converts stored bytes back into a row object.
///
/// The inverse of [`ObjectSerializer`]: for every supported value,
/// `deserialize(serialize(x)) == x`.
pub trait ObjectDeserializer: Send + Sync {
    /// Deserializes the bytes stored for the row at `(collection, key)`.
    fn deserialize(&self, collection: &str, key: &str, bytes: &[u8]) -> CodecResult<Value>;
}

/// The default codec: CBOR via ciborium. Every [`Value`] variant round-trips.
#[derive(Debug, Clone, Copy, Default)]
pub struct CborCodec;

impl ObjectSerializer for CborCodec {
    fn serialize(&self, _collection: &str, _key: &str, object: &Value) -> CodecResult<Vec<u8>> {
        let cbor = to_cbor_value(object);
        let mut buf = Vec::new();
        ciborium::into_writer(&cbor, &mut buf)
            .map_err(|e| CodecError::encode(format!("cbor: {e}")))?;
        Ok(buf)
    }
}

impl ObjectDeserializer for CborCodec {
    fn deserialize(&self, _collection: &str, _key: &str, bytes: &[u8]) -> CodecResult<Value> {
        let cbor: ciborium::value::Value = ciborium::from_reader(bytes)
            .map_err(|e| CodecError::decode(format!("cbor: {e}")))?;
        from_cbor_value(cbor)
    }
}

/// The property-list analogue: JSON via serde_json.
///
/// Restrictions: map keys must be text, and bytes are stored as a tagged
/// `{"$bytes": [..]}` object so they survive the round trip.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

const BYTES_TAG: &str = "$bytes";

impl ObjectSerializer for JsonCodec {
    fn serialize(&self, _collection: &str, _key: &str, object: &Value) -> CodecResult<Vec<u8>> {
        let json = to_json_value(object)?;
        serde_json::to_vec(&json).map_err(|e| CodecError::encode(format!("json: {e}")))
    }
}

impl ObjectDeserializer for JsonCodec {
    fn deserialize(&self, _collection: &str, _key: &str, bytes: &[u8]) -> CodecResult<Value> {
        let json: serde_json::Value =
            serde_json::from_slice(bytes).map_err(|e| CodecError::decode(format!("json: {e}")))?;
        from_json_value(json)
    }
}

/// Pass-through codec: objects must be [`Value::Bytes`] and are stored
/// verbatim.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawCodec;

impl ObjectSerializer for RawCodec {
    fn serialize(&self, _collection: &str, _key: &str, object: &Value) -> CodecResult<Vec<u8>> {
        match object {
            Value::Bytes(bytes) => Ok(bytes.clone()),
            other => Err(CodecError::unsupported(format!(
                "raw codec requires bytes, got {other}"
            ))),
        }
    }
}

impl ObjectDeserializer for RawCodec {
    fn deserialize(&self, _collection: &str, _key: &str, bytes: &[u8]) -> CodecResult<Value> {
        Ok(Value::Bytes(bytes.to_vec()))
    }
}

/// Transcodes a serde-serializable type into a [`Value`].
pub fn to_value<T: Serialize>(value: &T) -> CodecResult<Value> {
    let cbor = ciborium::value::Value::serialized(value)
        .map_err(|e| CodecError::encode(format!("transcode: {e}")))?;
    from_cbor_value(cbor)
}

/// Transcodes a [`Value`] into a serde-deserializable type.
pub fn from_value<T: DeserializeOwned>(value: &Value) -> CodecResult<T> {
    let cbor = to_cbor_value(value);
    cbor.deserialized()
        .map_err(|e| CodecError::decode(format!("transcode: {e}")))
}

fn to_cbor_value(value: &Value) -> ciborium::value::Value {
    use ciborium::value::Value as Cbor;
    match value {
        Value::Null => Cbor::Null,
        Value::Bool(b) => Cbor::Bool(*b),
        Value::Integer(i) => Cbor::Integer((*i).into()),
        Value::Float(f) => Cbor::Float(*f),
        Value::Text(s) => Cbor::Text(s.clone()),
        Value::Bytes(b) => Cbor::Bytes(b.clone()),
        Value::Array(items) => Cbor::Array(items.iter().map(to_cbor_value).collect()),
        Value::Map(pairs) => Cbor::Map(
            pairs
                .iter()
                .map(|(k, v)| (to_cbor_value(k), to_cbor_value(v)))
                .collect(),
        ),
    }
}

fn from_cbor_value(value: ciborium::value::Value) -> CodecResult<Value> {
    use ciborium::value::Value as Cbor;
    Ok(match value {
        Cbor::Null => Value::Null,
        Cbor::Bool(b) => Value::Bool(b),
        Cbor::Integer(i) => {
            let i: i128 = i.into();
            Value::Integer(
                i64::try_from(i)
                    .map_err(|_| CodecError::decode("integer out of i64 range"))?,
            )
        }
        Cbor::Float(f) => Value::Float(f),
        Cbor::Text(s) => Value::Text(s),
        Cbor::Bytes(b) => Value::Bytes(b),
        Cbor::Array(items) => Value::Array(
            items
                .into_iter()
                .map(from_cbor_value)
                .collect::<CodecResult<_>>()?,
        ),
        Cbor::Map(pairs) => Value::Map(
            pairs
                .into_iter()
                .map(|(k, v)| Ok((from_cbor_value(k)?, from_cbor_value(v)?)))
                .collect::<CodecResult<_>>()?,
        ),
        Cbor::Tag(_, inner) => from_cbor_value(*inner)?,
        other => {
            return Err(CodecError::decode(format!(
                "unsupported CBOR value: {other:?}"
            )))
        }
    })
}

fn to_json_value(value: &Value) -> CodecResult<serde_json::Value> {
    use serde_json::Value as Json;
    Ok(match value {
        Value::Null => Json::Null,
        Value::Bool(b) => Json::Bool(*b),
        Value::Integer(i) => Json::Number((*i).into()),
        Value::Float(f) => serde_json::Number::from_f64(*f)
            .map(Json::Number)
            .ok_or_else(|| CodecError::unsupported("non-finite float in JSON codec"))?,
        Value::Text(s) => Json::String(s.clone()),
        Value::Bytes(b) => {
            let items = b.iter().map(|&byte| Json::Number(byte.into())).collect();
            let mut map = serde_json::Map::new();
            map.insert(BYTES_TAG.to_string(), Json::Array(items));
            Json::Object(map)
        }
        Value::Array(items) => Json::Array(
            items
                .iter()
                .map(to_json_value)
                .collect::<CodecResult<_>>()?,
        ),
        Value::Map(pairs) => {
            let mut map = serde_json::Map::new();
            for (k, v) in pairs {
                let key = k
                    .as_text()
                    .ok_or_else(|| CodecError::unsupported("JSON codec requires text map keys"))?;
                map.insert(key.to_string(), to_json_value(v)?);
            }
            Json::Object(map)
        }
    })
}

fn from_json_value(value: serde_json::Value) -> CodecResult<Value> {
    use serde_json::Value as Json;
    Ok(match value {
        Json::Null => Value::Null,
        Json::Bool(b) => Value::Bool(b),
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Integer(i)
            } else if let Some(f) = n.as_f64() {
                Value::Float(f)
            } else {
                return Err(CodecError::decode(format!("unrepresentable number: {n}")));
            }
        }
        Json::String(s) => Value::Text(s),
        Json::Array(items) => Value::Array(
            items
                .into_iter()
                .map(from_json_value)
                .collect::<CodecResult<_>>()?,
        ),
        Json::Object(map) => {
            if map.len() == 1 {
                if let Some(Json::Array(items)) = map.get(BYTES_TAG) {
                    let mut bytes = Vec::with_capacity(items.len());
                    for item in items {
                        let byte = item
                            .as_u64()
                            .and_then(|n| u8::try_from(n).ok())
                            .ok_or_else(|| CodecError::decode("invalid byte in $bytes"))?;
                        bytes.push(byte);
                    }
                    return Ok(Value::Bytes(bytes));
                }
            }
            Value::Map(
                map.into_iter()
                    .map(|(k, v)| Ok((Value::Text(k), from_json_value(v)?)))
                    .collect::<CodecResult<_>>()?,
            )
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn representative_values() -> Vec<Value> {
        vec![
            Value::Null,
            Value::Bool(true),
            Value::Integer(-42),
            Value::Float(3.25),
            Value::Text("hello".into()),
            Value::Bytes(vec![0, 1, 254, 255]),
            Value::Array(vec![Value::Integer(1), Value::Text("two".into())]),
            Value::record(vec![
                ("name", "ada".into()),
                ("tags", Value::Array(vec!["a".into(), "b".into()])),
                ("meta", Value::Null),
                ("blob", Value::Bytes(vec![9, 8, 7])),
            ]),
        ]
    }

    #[test]
    fn cbor_roundtrip() {
        let codec = CborCodec;
        for value in representative_values() {
            let bytes = codec.serialize("c", "k", &value).unwrap();
            let decoded = codec.deserialize("c", "k", &bytes).unwrap();
            assert_eq!(decoded, value);
        }
    }

    #[test]
    fn json_roundtrip() {
        let codec = JsonCodec;
        for value in representative_values() {
            let bytes = codec.serialize("c", "k", &value).unwrap();
            let decoded = codec.deserialize("c", "k", &bytes).unwrap();
            assert_eq!(decoded, value);
        }
    }

    #[test]
    fn json_rejects_non_text_keys() {
        let codec = JsonCodec;
        let value = Value::Map(vec![(Value::Integer(1), Value::Bool(true))]);
        assert!(codec.serialize("c", "k", &value).is_err());
    }

    #[test]
    fn raw_passthrough() {
        let codec = RawCodec;
        let value = Value::Bytes(vec![1, 2, 3]);
        let bytes = codec.serialize("c", "k", &value).unwrap();
        assert_eq!(bytes, vec![1, 2, 3]);
        assert_eq!(codec.deserialize("c", "k", &bytes).unwrap(), value);

        assert!(codec.serialize("c", "k", &Value::Integer(1)).is_err());
    }

    #[test]
    fn typed_transcode() {
        #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
        struct Book {
            title: String,
            pages: u32,
        }
        let book = Book {
            title: "Moby-Dick".into(),
            pages: 635,
        };
        let value = to_value(&book).unwrap();
        assert_eq!(
            value.get("title").and_then(Value::as_text),
            Some("Moby-Dick")
        );
        let back: Book = from_value(&value).unwrap();
        assert_eq!(back, book);
    }

    fn arb_value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::Integer),
            "[a-z]{0,8}".prop_map(Value::Text),
            proptest::collection::vec(any::<u8>(), 0..16).prop_map(Value::Bytes),
        ];
        leaf.prop_recursive(3, 32, 4, |inner| {
            prop_oneof![
                proptest::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                proptest::collection::vec(("[a-z]{1,6}", inner), 0..4).prop_map(|pairs| {
                    Value::Map(
                        pairs
                            .into_iter()
                            .map(|(k, v)| (Value::Text(k), v))
                            .collect(),
                    )
                }),
            ]
        })
    }

    proptest! {
        #[test]
        fn cbor_roundtrip_prop(value in arb_value()) {
            let codec = CborCodec;
            let bytes = codec.serialize("c", "k", &value).unwrap();
            prop_assert_eq!(codec.deserialize("c", "k", &bytes).unwrap(), value);
        }

        #[test]
        fn json_roundtrip_prop(value in arb_value()) {
            let codec = JsonCodec;
            let bytes = codec.serialize("c", "k", &value).unwrap();
            prop_assert_eq!(codec.deserialize("c", "k", &bytes).unwrap(), value);
        }
    }
}
