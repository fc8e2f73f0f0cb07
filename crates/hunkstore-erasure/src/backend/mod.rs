//! Erasure coding backend abstraction
//!
//! # Code Types
//!
//! - MDS (Maximum Distance Separable): Standard Reed-Solomon, any k parts
//!   reconstruct the block
//! - LRC (Locally Repairable Codes): Has local parity groups allowing a single
//!   lost part to be rebuilt from its group alone

pub mod rust_simd;

use crate::ErasureError;

/// Result type for backend operations
pub type BackendResult<T> = Result<T, ErasureError>;

/// Capabilities of an erasure coding backend
#[derive(Clone, Debug, Default)]
pub struct BackendCapabilities {
    /// Backend name for identification
    pub name: &'static str,
    /// Supports LRC (Locally Repairable Codes)
    pub supports_lrc: bool,
    /// Maximum total parts supported
    pub max_total_parts: usize,
}

/// Core trait for erasure coding backends
///
/// Parts are ordered data parts first, then parity parts.
pub trait ErasureBackend: Send + Sync {
    /// Get backend capabilities
    fn capabilities(&self) -> BackendCapabilities;

    /// Get the number of data parts (k)
    fn data_parts(&self) -> usize;

    /// Get the number of parity parts
    fn parity_parts(&self) -> usize;

    /// Get total number of parts
    fn total_parts(&self) -> usize {
        self.data_parts() + self.parity_parts()
    }

    /// Whether the given availability pattern allows full reconstruction
    ///
    /// `available` has one entry per part. The default is the MDS rule: any
    /// `k` parts suffice.
    fn can_reconstruct(&self, available: &[bool]) -> bool {
        available.len() == self.total_parts()
            && available.iter().filter(|a| **a).count() >= self.data_parts()
    }

    /// Encode `k` equal-sized data parts, returning all parts in order
    fn encode(&self, data_parts: &[&[u8]], part_size: usize) -> BackendResult<Vec<Vec<u8>>>;

    /// Rebuild every part from the available ones
    ///
    /// `parts` has one entry per part, `None` for missing. Returns all parts
    /// (data and parity) in order.
    fn reconstruct(
        &self,
        parts: &[Option<&[u8]>],
        part_size: usize,
    ) -> BackendResult<Vec<Vec<u8>>>;

    /// Verify that parity parts are consistent with data parts
    fn verify(&self, parts: &[&[u8]]) -> BackendResult<bool> {
        let k = self.data_parts();
        if parts.len() != self.total_parts() {
            return Ok(false);
        }
        let Some(part_size) = parts.first().map(|p| p.len()) else {
            return Ok(false);
        };
        if !parts.iter().all(|p| p.len() == part_size) {
            return Ok(false);
        }
        let encoded = self.encode(&parts[..k], part_size)?;
        Ok(encoded
            .iter()
            .zip(parts)
            .skip(k)
            .all(|(expected, actual)| expected.as_slice() == *actual))
    }
}

/// LRC (Locally Repairable Codes) configuration
///
/// Example: LRC (12, 2, 2) has:
/// - 12 data parts split into 2 groups of 6
/// - 2 local parity parts (one per group, XOR of group)
/// - 2 global parity parts (Reed-Solomon over all data)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LrcConfig {
    /// Number of data parts (k)
    pub data_parts: u8,
    /// Number of local parity parts (l), one per group
    pub local_parity_parts: u8,
    /// Number of global parity parts (g)
    pub global_parity_parts: u8,
}

impl LrcConfig {
    #[must_use]
    pub const fn new(data_parts: u8, local_parity_parts: u8, global_parity_parts: u8) -> Self {
        Self {
            data_parts,
            local_parity_parts,
            global_parity_parts,
        }
    }

    /// Data parts per local group
    #[must_use]
    pub const fn local_group_size(&self) -> usize {
        self.data_parts as usize / self.local_parity_parts as usize
    }

    /// Total parts: k + l + g
    #[must_use]
    pub const fn total_parts(&self) -> usize {
        self.data_parts as usize + self.local_parity_parts as usize + self.global_parity_parts as usize
    }

    /// Index of the local parity part for a data part
    #[must_use]
    pub const fn local_parity_index(&self, data_index: usize) -> usize {
        self.data_parts as usize + data_index / self.local_group_size()
    }
}

pub use rust_simd::{RustSimdBackend, RustSimdLrcBackend};
