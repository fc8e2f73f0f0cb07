//! Checksum utilities for hunkstore
//!
//! Parts written to storage nodes carry a CRC32C and an xxHash64 so that a
//! reader or the repair path can reject corrupted parts before decoding.

use serde::{Deserialize, Serialize};

/// Checksum values computed for a block or part of data
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checksum {
    /// CRC32C checksum (fast, for inline verification)
    pub crc32c: u32,
    /// xxHash64 (fast, for comparison)
    pub xxhash64: u64,
}

impl Checksum {
    /// Create a new checksum from raw values
    #[must_use]
    pub const fn new(crc32c: u32, xxhash64: u64) -> Self {
        Self { crc32c, xxhash64 }
    }

    /// Compute checksum from data
    #[must_use]
    pub fn compute(data: &[u8]) -> Self {
        Self {
            crc32c: crc32c::crc32c(data),
            xxhash64: xxhash_rust::xxh64::xxh64(data, 0),
        }
    }

    /// Verify data against this checksum (fast check using CRC32C)
    #[must_use]
    pub fn verify_fast(&self, data: &[u8]) -> bool {
        crc32c::crc32c(data) == self.crc32c
    }

    /// Verify data against both checksums
    #[must_use]
    pub fn verify_full(&self, data: &[u8]) -> bool {
        self.verify_fast(data) && xxhash_rust::xxh64::xxh64(data, 0) == self.xxhash64
    }
}

/// Streaming checksum calculator
pub struct ChecksumCalculator {
    crc32c: u32,
    xxhash_state: xxhash_rust::xxh64::Xxh64,
}

impl ChecksumCalculator {
    /// Create a new calculator
    #[must_use]
    pub fn new() -> Self {
        Self {
            crc32c: 0,
            xxhash_state: xxhash_rust::xxh64::Xxh64::new(0),
        }
    }

    /// Update the calculator with more data
    pub fn update(&mut self, data: &[u8]) {
        self.crc32c = crc32c::crc32c_append(self.crc32c, data);
        self.xxhash_state.update(data);
    }

    /// Finalize and return the computed checksum
    #[must_use]
    pub fn finalize(self) -> Checksum {
        Checksum {
            crc32c: self.crc32c,
            xxhash64: self.xxhash_state.digest(),
        }
    }
}

impl Default for ChecksumCalculator {
    fn default() -> Self {
        Self::new()
    }
}

/// xxHash64 of a payload, as stored in a hunk record header
#[inline]
#[must_use]
pub fn payload_hash(data: &[u8]) -> u64 {
    xxhash_rust::xxh64::xxh64(data, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    #[test]
    fn test_checksum_compute() {
        let checksum = Checksum::compute(b"hello, world!");
        assert_ne!(checksum.crc32c, 0);
        assert_ne!(checksum.xxhash64, 0);
    }

    #[test]
    fn test_checksum_verify() {
        let data = b"hello, world!";
        let checksum = Checksum::compute(data);

        assert!(checksum.verify_fast(data));
        assert!(checksum.verify_full(data));

        let corrupted = b"hello, world?";
        assert!(!checksum.verify_fast(corrupted));
        assert!(!checksum.verify_full(corrupted));
    }

    #[test]
    fn test_streaming_calculator() {
        let mut data = vec![0u8; 4096];
        rand::thread_rng().fill_bytes(&mut data);

        let expected = Checksum::compute(&data);

        let mut calc = ChecksumCalculator::new();
        for piece in data.chunks(1000) {
            calc.update(piece);
        }
        assert_eq!(calc.finalize(), expected);
    }

    #[test]
    fn test_payload_hash_matches_checksum() {
        let data = b"abcdefghijklmnopqrstuvwxyz";
        assert_eq!(payload_hash(data), Checksum::compute(data).xxhash64);
    }
}
