//! Write-ahead log records and framing.
//!
//! Every record is framed as: magic (4 bytes), record type (1 byte),
//! payload length (4 bytes LE), CRC32 of the payload (4 bytes LE), payload.
//! A torn frame at the tail of the log is discarded during replay; commits
//! are only applied when their `Commit` marker was read intact.

use crate::error::{StoreError, StoreResult};
use crate::media::LogMedia;

/// Magic bytes identifying a log record.
pub const LOG_MAGIC: [u8; 4] = *b"SLOG";

/// Size of the frame header (magic + type + len + crc).
const FRAME_HEADER: usize = 4 + 1 + 4 + 4;

/// A log record representing one store mutation or marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    /// Insert or update one row.
    Put {
        /// Table the row belongs to.
        table: String,
        /// Binary row key.
        key: Vec<u8>,
        /// Engine-assigned rowid.
        rowid: i64,
        /// Row value bytes.
        value: Vec<u8>,
    },
    /// Delete one row.
    Delete {
        /// Table the row belongs to.
        table: String,
        /// Binary row key.
        key: Vec<u8>,
    },
    /// Remove every row from a table.
    ClearTable {
        /// Table to clear.
        table: String,
    },
    /// Commit marker: the preceding uncommitted records become visible at
    /// this sequence.
    Commit {
        /// Sequence number assigned to the commit.
        seq: u64,
    },
    /// Snapshot header: the file contains the full store state as of this
    /// sequence. Only used in checkpoint files.
    Snapshot {
        /// Sequence the snapshot was taken at.
        seq: u64,
    },
}

impl LogRecord {
    fn type_byte(&self) -> u8 {
        match self {
            Self::Put { .. } => 1,
            Self::Delete { .. } => 2,
            Self::ClearTable { .. } => 3,
            Self::Commit { .. } => 4,
            Self::Snapshot { .. } => 5,
        }
    }

    /// Serializes the record payload (without the frame envelope).
    pub fn encode_payload(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Self::Put {
                table,
                key,
                rowid,
                value,
            } => {
                write_bytes(&mut buf, table.as_bytes());
                write_bytes(&mut buf, key);
                buf.extend_from_slice(&rowid.to_le_bytes());
                write_bytes(&mut buf, value);
            }
            Self::Delete { table, key } => {
                write_bytes(&mut buf, table.as_bytes());
                write_bytes(&mut buf, key);
            }
            Self::ClearTable { table } => {
                write_bytes(&mut buf, table.as_bytes());
            }
            Self::Commit { seq } | Self::Snapshot { seq } => {
                buf.extend_from_slice(&seq.to_le_bytes());
            }
        }
        buf
    }

    /// Deserializes a record from its type byte and payload.
    pub fn decode_payload(type_byte: u8, payload: &[u8]) -> StoreResult<Self> {
        let mut cursor = 0usize;
        let record = match type_byte {
            1 => {
                let table = read_string(payload, &mut cursor)?;
                let key = read_bytes(payload, &mut cursor)?;
                let rowid = i64::from_le_bytes(read_array(payload, &mut cursor)?);
                let value = read_bytes(payload, &mut cursor)?;
                Self::Put {
                    table,
                    key,
                    rowid,
                    value,
                }
            }
            2 => {
                let table = read_string(payload, &mut cursor)?;
                let key = read_bytes(payload, &mut cursor)?;
                Self::Delete { table, key }
            }
            3 => {
                let table = read_string(payload, &mut cursor)?;
                Self::ClearTable { table }
            }
            4 => Self::Commit {
                seq: u64::from_le_bytes(read_array(payload, &mut cursor)?),
            },
            5 => Self::Snapshot {
                seq: u64::from_le_bytes(read_array(payload, &mut cursor)?),
            },
            other => {
                return Err(StoreError::corruption(format!(
                    "unknown log record type: {other}"
                )))
            }
        };
        if cursor != payload.len() {
            return Err(StoreError::corruption(format!(
                "trailing bytes in log record: consumed {cursor} of {}",
                payload.len()
            )));
        }
        Ok(record)
    }

    /// Serializes the record with its frame envelope.
    pub fn encode_frame(&self, buf: &mut Vec<u8>) {
        let payload = self.encode_payload();
        buf.extend_from_slice(&LOG_MAGIC);
        buf.push(self.type_byte());
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&crc32(&payload).to_le_bytes());
        buf.extend_from_slice(&payload);
    }
}

fn write_bytes(buf: &mut Vec<u8>, data: &[u8]) {
    buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
    buf.extend_from_slice(data);
}

fn read_array<const N: usize>(payload: &[u8], cursor: &mut usize) -> StoreResult<[u8; N]> {
    if *cursor + N > payload.len() {
        return Err(StoreError::corruption("unexpected end of log payload"));
    }
    let bytes: [u8; N] = payload[*cursor..*cursor + N]
        .try_into()
        .map_err(|_| StoreError::corruption("invalid fixed field"))?;
    *cursor += N;
    Ok(bytes)
}

fn read_bytes(payload: &[u8], cursor: &mut usize) -> StoreResult<Vec<u8>> {
    let len = u32::from_le_bytes(read_array(payload, cursor)?) as usize;
    if *cursor + len > payload.len() {
        return Err(StoreError::corruption("unexpected end of log payload"));
    }
    let bytes = payload[*cursor..*cursor + len].to_vec();
    *cursor += len;
    Ok(bytes)
}

fn read_string(payload: &[u8], cursor: &mut usize) -> StoreResult<String> {
    let bytes = read_bytes(payload, cursor)?;
    String::from_utf8(bytes).map_err(|_| StoreError::corruption("table name is not UTF-8"))
}

/// Computes the CRC32 (IEEE) checksum of `data`.
pub fn crc32(data: &[u8]) -> u32 {
    const TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ TABLE[index];
    }
    !crc
}

/// An append-only record log over a [`LogMedia`].
pub struct LogWriter {
    media: Box<dyn LogMedia>,
}

impl LogWriter {
    /// Creates a log writer over the given media.
    pub fn new(media: Box<dyn LogMedia>) -> Self {
        Self { media }
    }

    /// Appends a batch of records as one contiguous write.
    pub fn append_batch(&mut self, records: &[LogRecord]) -> StoreResult<()> {
        let mut buf = Vec::new();
        for record in records {
            record.encode_frame(&mut buf);
        }
        self.media.append(&buf)?;
        Ok(())
    }

    /// Pushes buffered writes to the OS.
    pub fn flush(&mut self) -> StoreResult<()> {
        self.media.flush()
    }

    /// Ensures all appended records are durable.
    pub fn sync(&mut self) -> StoreResult<()> {
        self.media.sync()
    }

    /// Returns the log size in bytes.
    pub fn len(&self) -> StoreResult<u64> {
        self.media.len()
    }

    /// Returns true if the log holds no records.
    pub fn is_empty(&self) -> StoreResult<bool> {
        self.media.is_empty()
    }

    /// Truncates the log to zero bytes.
    pub fn clear(&mut self) -> StoreResult<()> {
        self.media.truncate(0)
    }

    /// Reads every intact record from the start of the log.
    ///
    /// A torn frame at the tail (short header, short payload, or checksum
    /// mismatch) ends the scan; everything before it is returned.
    pub fn read_all(&self) -> StoreResult<Vec<LogRecord>> {
        let size = self.media.len()?;
        let mut records = Vec::new();
        let mut offset = 0u64;

        while offset + FRAME_HEADER as u64 <= size {
            let header = self.media.read_at(offset, FRAME_HEADER)?;
            if header[0..4] != LOG_MAGIC {
                tracing::warn!(offset, "discarding log tail: bad magic");
                break;
            }
            let type_byte = header[4];
            let len = u32::from_le_bytes(header[5..9].try_into().unwrap_or([0; 4])) as usize;
            let expected_crc = u32::from_le_bytes(header[9..13].try_into().unwrap_or([0; 4]));
            if offset + (FRAME_HEADER + len) as u64 > size {
                tracing::warn!(offset, "discarding log tail: short payload");
                break;
            }
            let payload = self.media.read_at(offset + FRAME_HEADER as u64, len)?;
            if crc32(&payload) != expected_crc {
                tracing::warn!(offset, "discarding log tail: checksum mismatch");
                break;
            }
            records.push(LogRecord::decode_payload(type_byte, &payload)?);
            offset += (FRAME_HEADER + len) as u64;
        }

        Ok(records)
    }
}

impl std::fmt::Debug for LogWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogWriter").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MemoryMedia;

    fn sample_records() -> Vec<LogRecord> {
        vec![
            LogRecord::Put {
                table: "books".into(),
                key: b"k1".to_vec(),
                rowid: 7,
                value: vec![1, 2, 3],
            },
            LogRecord::Delete {
                table: "books".into(),
                key: b"k2".to_vec(),
            },
            LogRecord::ClearTable {
                table: "drafts".into(),
            },
            LogRecord::Commit { seq: 42 },
        ]
    }

    #[test]
    fn record_payload_roundtrip() {
        for record in sample_records() {
            let payload = record.encode_payload();
            let decoded = LogRecord::decode_payload(record.type_byte(), &payload).unwrap();
            assert_eq!(record, decoded);
        }
    }

    #[test]
    fn batch_roundtrip() {
        let mut log = LogWriter::new(Box::new(MemoryMedia::new()));
        let records = sample_records();
        log.append_batch(&records).unwrap();
        log.flush().unwrap();

        assert_eq!(log.read_all().unwrap(), records);
    }

    #[test]
    fn torn_tail_is_discarded() {
        let mut log = LogWriter::new(Box::new(MemoryMedia::new()));
        log.append_batch(&[LogRecord::Commit { seq: 1 }]).unwrap();

        // Append a second frame, then chop its payload short.
        let mut frame = Vec::new();
        LogRecord::Put {
            table: "t".into(),
            key: b"k".to_vec(),
            rowid: 1,
            value: vec![9; 100],
        }
        .encode_frame(&mut frame);
        frame.truncate(frame.len() - 40);
        let full = log.len().unwrap();
        // Re-create the log with the torn bytes appended.
        let mut media = MemoryMedia::new();
        let mut intact = Vec::new();
        LogRecord::Commit { seq: 1 }.encode_frame(&mut intact);
        media.append(&intact).unwrap();
        media.append(&frame).unwrap();
        let log = LogWriter::new(Box::new(media));

        let records = log.read_all().unwrap();
        assert_eq!(records, vec![LogRecord::Commit { seq: 1 }]);
        assert!(full > 0);
    }

    #[test]
    fn checksum_mismatch_is_discarded() {
        let mut frame = Vec::new();
        LogRecord::Commit { seq: 5 }.encode_frame(&mut frame);
        // Flip a payload byte.
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        let mut media = MemoryMedia::new();
        media.append(&frame).unwrap();
        let log = LogWriter::new(Box::new(media));
        assert!(log.read_all().unwrap().is_empty());
    }

    #[test]
    fn crc32_known_value() {
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(crc32(b""), 0);
    }

    #[test]
    fn clear_truncates() {
        let mut log = LogWriter::new(Box::new(MemoryMedia::new()));
        log.append_batch(&sample_records()).unwrap();
        assert!(!log.is_empty().unwrap());
        log.clear().unwrap();
        assert!(log.is_empty().unwrap());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn arb_record() -> impl Strategy<Value = LogRecord> {
            prop_oneof![
                (
                    "[a-z:]{1,12}",
                    proptest::collection::vec(any::<u8>(), 0..32),
                    any::<i64>(),
                    proptest::collection::vec(any::<u8>(), 0..64),
                )
                    .prop_map(|(table, key, rowid, value)| LogRecord::Put {
                        table,
                        key,
                        rowid,
                        value,
                    }),
                ("[a-z:]{1,12}", proptest::collection::vec(any::<u8>(), 0..32))
                    .prop_map(|(table, key)| LogRecord::Delete { table, key }),
                "[a-z:]{1,12}".prop_map(|table| LogRecord::ClearTable { table }),
                any::<u64>().prop_map(|seq| LogRecord::Commit { seq }),
            ]
        }

        proptest! {
            #[test]
            fn batches_roundtrip(records in proptest::collection::vec(arb_record(), 0..20)) {
                let mut log = LogWriter::new(Box::new(MemoryMedia::new()));
                log.append_batch(&records).unwrap();
                prop_assert_eq!(log.read_all().unwrap(), records);
            }
        }
    }
}
