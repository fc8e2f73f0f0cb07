//! Column values and the inline/reference decision
//!
//! A column value is either stored inline in the primary row or externalized
//! into a hunk chunk and replaced by a [`HunkRef`]. Externalized payloads are
//! framed as hunk records: an 8-byte header holding the little-endian
//! xxHash64 of the payload, followed by the payload itself.

use crate::schema::TableSchema;
use crate::writer::HunkChunkWriter;
use bytes::{BufMut, Bytes, BytesMut};
use hunkstore_common::checksum::payload_hash;
use hunkstore_common::{ChunkId, Error, Result};
use serde::{Deserialize, Serialize};

/// Size of the header preceding every hunk payload
pub const HUNK_HEADER_SIZE: usize = 8;

/// Address of an externalized payload
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HunkRef {
    pub chunk_id: ChunkId,
    pub block_index: u32,
    /// Offset of the hunk record (header included) within the block
    pub block_offset: u64,
    /// Payload length, header excluded
    pub length: u64,
}

impl HunkRef {
    /// Length of the framed record
    #[must_use]
    pub const fn record_length(&self) -> u64 {
        self.length + HUNK_HEADER_SIZE as u64
    }
}

/// A column value as stored in a store chunk
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HunkValue {
    Inline(Bytes),
    Ref(HunkRef),
}

impl HunkValue {
    /// Payload length, whether inline or externalized
    #[must_use]
    pub fn len(&self) -> u64 {
        match self {
            Self::Inline(bytes) => bytes.len() as u64,
            Self::Ref(hunk_ref) => hunk_ref.length,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub const fn hunk_ref(&self) -> Option<&HunkRef> {
        match self {
            Self::Ref(hunk_ref) => Some(hunk_ref),
            Self::Inline(_) => None,
        }
    }
}

/// Frame a payload as a hunk record
pub fn encode_hunk_record(payload: &[u8], out: &mut BytesMut) {
    out.reserve(HUNK_HEADER_SIZE + payload.len());
    out.put_u64_le(payload_hash(payload));
    out.put_slice(payload);
}

/// Strip and verify the header of a hunk record
pub fn decode_hunk_record(record: &Bytes) -> Result<Bytes> {
    if record.len() < HUNK_HEADER_SIZE {
        return Err(Error::invalid_argument(format!(
            "hunk record of {} bytes is shorter than its header",
            record.len()
        )));
    }
    let mut header = [0u8; HUNK_HEADER_SIZE];
    header.copy_from_slice(&record[..HUNK_HEADER_SIZE]);
    let expected = u64::from_le_bytes(header);

    let payload = record.slice(HUNK_HEADER_SIZE..);
    let actual = payload_hash(&payload);
    if expected != actual {
        return Err(Error::ChecksumMismatch { expected, actual });
    }
    Ok(payload)
}

/// Per-column inline/externalize decision
#[derive(Clone, Debug)]
pub struct ValueClassifier {
    thresholds: Vec<Option<usize>>,
}

impl ValueClassifier {
    /// Classifier for the value columns of a schema
    #[must_use]
    pub fn new(schema: &TableSchema) -> Self {
        Self {
            thresholds: schema
                .value_columns()
                .iter()
                .map(|c| c.max_inline_hunk_size)
                .collect(),
        }
    }

    /// Whether a value of `length` bytes stays inline under `threshold`
    #[must_use]
    pub const fn is_inline(threshold: Option<usize>, length: usize) -> bool {
        match threshold {
            Some(max) => length <= max,
            None => true,
        }
    }

    /// Threshold of a value column
    #[must_use]
    pub fn threshold(&self, column: usize) -> Option<usize> {
        self.thresholds.get(column).copied().flatten()
    }

    /// Whether a value of `length` bytes in `column` must be externalized
    #[must_use]
    pub fn should_externalize(&self, column: usize, length: usize) -> bool {
        !Self::is_inline(self.threshold(column), length)
    }

    /// Classify a value, queueing externalized payloads to `writer`
    pub fn classify(
        &self,
        column: usize,
        value: Bytes,
        writer: &mut HunkChunkWriter,
    ) -> Result<HunkValue> {
        if self.should_externalize(column, value.len()) {
            Ok(HunkValue::Ref(writer.add_hunk(&value)?))
        } else {
            Ok(HunkValue::Inline(value))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnSchema;

    #[test]
    fn test_inline_threshold() {
        assert!(ValueClassifier::is_inline(Some(10), 10));
        assert!(!ValueClassifier::is_inline(Some(10), 11));
        assert!(ValueClassifier::is_inline(None, 1 << 20));
    }

    #[test]
    fn test_classifier_per_column() {
        let schema = TableSchema::new(
            "key",
            vec![
                ColumnSchema::new("small"),
                ColumnSchema::with_max_inline_hunk_size("large", 10),
            ],
        )
        .unwrap();
        let classifier = ValueClassifier::new(&schema);

        assert!(!classifier.should_externalize(0, 100));
        assert!(!classifier.should_externalize(1, 10));
        assert!(classifier.should_externalize(1, 26));
        assert_eq!(classifier.threshold(5), None);
    }

    #[test]
    fn test_record_framing() {
        let mut out = BytesMut::new();
        encode_hunk_record(b"abcdefghijklmnopqrstuvwxyz", &mut out);
        assert_eq!(out.len(), HUNK_HEADER_SIZE + 26);

        let record = out.freeze();
        let payload = decode_hunk_record(&record).unwrap();
        assert_eq!(payload.as_ref(), b"abcdefghijklmnopqrstuvwxyz");
    }

    #[test]
    fn test_record_corruption_detected() {
        let mut out = BytesMut::new();
        encode_hunk_record(b"payload", &mut out);
        let last = out.len() - 1;
        out[last] ^= 0x01;

        assert!(matches!(
            decode_hunk_record(&out.freeze()),
            Err(Error::ChecksumMismatch { .. })
        ));
        assert!(decode_hunk_record(&Bytes::from_static(b"abc")).is_err());
    }

    #[test]
    fn test_hunk_value_len() {
        let hunk_ref = HunkRef {
            chunk_id: ChunkId::new(),
            block_index: 0,
            block_offset: 0,
            length: 26,
        };
        assert_eq!(HunkValue::Ref(hunk_ref).len(), 26);
        assert_eq!(hunk_ref.record_length(), 34);
        assert_eq!(HunkValue::Inline(Bytes::from_static(b"abc")).len(), 3);
    }
}
