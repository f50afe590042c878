//! Primary row framing and loading.
//!
//! A primary table value is framed as: metadata flag (1 byte), object
//! length (4 bytes LE), object bytes, metadata bytes.

use crate::database::COLLECTION_PREFIX;
use crate::error::DbResult;
use crate::extension::{AccessLevel, StoredRow};
use stratadb_codec::ObjectDeserializer;
use stratadb_store::{Rowid, StoreError, TableRead};

pub(crate) fn encode_row_value(object: &[u8], metadata: Option<&[u8]>) -> Vec<u8> {
    let mut buf = Vec::with_capacity(5 + object.len() + metadata.map_or(0, <[u8]>::len));
    buf.push(u8::from(metadata.is_some()));
    buf.extend_from_slice(&(object.len() as u32).to_le_bytes());
    buf.extend_from_slice(object);
    if let Some(metadata) = metadata {
        buf.extend_from_slice(metadata);
    }
    buf
}

pub(crate) fn decode_row_value(bytes: &[u8]) -> DbResult<(&[u8], Option<&[u8]>)> {
    if bytes.len() < 5 {
        return Err(StoreError::corruption("row value frame too short").into());
    }
    let has_metadata = bytes[0] != 0;
    let object_len = u32::from_le_bytes(bytes[1..5].try_into().unwrap_or([0; 4])) as usize;
    if 5 + object_len > bytes.len() {
        return Err(StoreError::corruption("row value frame truncated").into());
    }
    let object = &bytes[5..5 + object_len];
    let metadata = has_metadata.then(|| &bytes[5 + object_len..]);
    Ok((object, metadata))
}

pub(crate) fn key_from_bytes(bytes: Vec<u8>) -> DbResult<String> {
    String::from_utf8(bytes).map_err(|_| StoreError::corruption("row key is not UTF-8").into())
}

/// Loads a primary row by rowid, deserializing only what `access` requires.
///
/// Returns `None` if the rowid does not resolve to a live primary row.
pub(crate) fn load_row_by_rowid<R: TableRead>(
    reader: &R,
    object_deserializer: &dyn ObjectDeserializer,
    metadata_deserializer: &dyn ObjectDeserializer,
    rowid: Rowid,
    access: AccessLevel,
) -> DbResult<Option<StoredRow>> {
    let Some((table, key_bytes)) = reader.rowid_entry(rowid)? else {
        return Ok(None);
    };
    let Some(collection) = table.strip_prefix(COLLECTION_PREFIX) else {
        return Ok(None);
    };
    let collection = collection.to_string();
    let key = key_from_bytes(key_bytes)?;
    load_row(
        reader,
        object_deserializer,
        metadata_deserializer,
        &collection,
        &key,
        access,
    )
}

/// Loads a primary row by collection and key, deserializing only what
/// `access` requires.
pub(crate) fn load_row<R: TableRead>(
    reader: &R,
    object_deserializer: &dyn ObjectDeserializer,
    metadata_deserializer: &dyn ObjectDeserializer,
    collection: &str,
    key: &str,
    access: AccessLevel,
) -> DbResult<Option<StoredRow>> {
    let table = format!("{COLLECTION_PREFIX}{collection}");
    let Some(record) = reader.get(&table, key.as_bytes())? else {
        return Ok(None);
    };
    let (object_bytes, metadata_bytes) = decode_row_value(&record.value)?;
    let object = if access.needs_object() {
        Some(object_deserializer.deserialize(collection, key, object_bytes)?)
    } else {
        None
    };
    let metadata = if access.needs_metadata() {
        metadata_bytes
            .map(|bytes| metadata_deserializer.deserialize(collection, key, bytes))
            .transpose()?
    } else {
        None
    };
    Ok(Some(StoredRow {
        collection: collection.to_string(),
        key: key.to_string(),
        rowid: record.rowid,
        object,
        metadata,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_roundtrip() {
        let encoded = encode_row_value(b"object", Some(b"meta"));
        let (object, metadata) = decode_row_value(&encoded).unwrap();
        assert_eq!(object, b"object");
        assert_eq!(metadata, Some(&b"meta"[..]));

        let encoded = encode_row_value(b"object", None);
        let (object, metadata) = decode_row_value(&encoded).unwrap();
        assert_eq!(object, b"object");
        assert_eq!(metadata, None);
    }

    #[test]
    fn frame_rejects_truncation() {
        let encoded = encode_row_value(b"object", Some(b"meta"));
        assert!(decode_row_value(&encoded[..3]).is_err());
        assert!(decode_row_value(&encoded[..7]).is_err());
    }

    #[test]
    fn empty_object_frame() {
        let encoded = encode_row_value(b"", None);
        let (object, metadata) = decode_row_value(&encoded).unwrap();
        assert!(object.is_empty());
        assert!(metadata.is_none());
    }
}
