//! Part type for erasure coded blocks

use bytes::Bytes;
use hunkstore_common::Checksum;

/// Role of a part within an erasure-coded block
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PartRole {
    Data,
    Parity,
}

/// A single part of an erasure coded block
#[derive(Clone, Debug)]
pub struct ErasurePart {
    /// Position of the part within the codec (data parts first)
    pub index: usize,
    /// Whether this is a data or parity part
    pub role: PartRole,
    /// The part data
    pub data: Bytes,
    /// Checksum for integrity verification
    pub checksum: Checksum,
}

impl ErasurePart {
    /// Create a new part
    #[must_use]
    pub fn new(index: usize, is_parity: bool, data: Bytes) -> Self {
        let checksum = Checksum::compute(&data);
        Self {
            index,
            role: if is_parity {
                PartRole::Parity
            } else {
                PartRole::Data
            },
            data,
            checksum,
        }
    }

    #[must_use]
    pub fn is_parity(&self) -> bool {
        self.role == PartRole::Parity
    }

    /// Verify the part's checksum
    #[must_use]
    pub fn verify(&self) -> bool {
        self.checksum.verify_fast(&self.data)
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.data.len()
    }
}
