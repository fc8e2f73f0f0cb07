//! Block-level erasure codec
//!
//! A block of `n` bytes is split into `k` data parts of `part_size` bytes
//! each (zero padded), where `part_size` is `ceil(n / k)` rounded up to an
//! even number and at least [`MIN_PART_SIZE`]. Data parts hold the block
//! bytes in order, so any byte range of the block maps onto a contiguous run
//! of data parts.

use crate::backend::{ErasureBackend, LrcConfig, RustSimdBackend, RustSimdLrcBackend};
use crate::part::ErasurePart;
use bytes::Bytes;
use hunkstore_common::{ErasureConfig, ErasureType, Error as CommonError, Result};
use std::sync::Arc;
use thiserror::Error;

/// Smallest part size produced for a block
pub const MIN_PART_SIZE: usize = 64;

/// Errors specific to erasure coding operations
#[derive(Debug, Error)]
pub enum ErasureError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("encoding failed: {0}")]
    EncodingFailed(String),

    #[error("decoding failed: {0}")]
    DecodingFailed(String),

    #[error("insufficient parts: have {available}, need {required}")]
    InsufficientParts { available: usize, required: usize },

    #[error("part {index} has size {size}, expected {expected}")]
    PartSizeMismatch {
        index: usize,
        size: usize,
        expected: usize,
    },
}

impl From<ErasureError> for CommonError {
    fn from(e: ErasureError) -> Self {
        match e {
            ErasureError::InsufficientParts {
                available,
                required,
            } => Self::InsufficientParts {
                available,
                required,
            },
            other => Self::ErasureCoding(other.to_string()),
        }
    }
}

/// A byte range of one data part, produced by [`ErasureCodec::map_range`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PartSlice {
    /// Data part index
    pub part_index: usize,
    /// Offset within the part
    pub offset: usize,
    /// Length of the slice
    pub length: usize,
}

/// Erasure codec supporting both MDS Reed-Solomon and LRC
pub struct ErasureCodec {
    config: ErasureConfig,
    backend: Arc<dyn ErasureBackend>,
}

impl ErasureCodec {
    /// Create a new erasure codec with the given configuration
    pub fn new(config: ErasureConfig) -> Result<Self> {
        let backend: Arc<dyn ErasureBackend> = match config.ec_type {
            ErasureType::Mds => Arc::new(RustSimdBackend::new(
                config.data_parts,
                config.parity_parts,
            )?),
            ErasureType::Lrc {
                local_parity,
                global_parity,
            } => {
                if local_parity + global_parity != config.parity_parts {
                    return Err(ErasureError::InvalidConfig(
                        "parity_parts must equal local + global parity".into(),
                    )
                    .into());
                }
                Arc::new(RustSimdLrcBackend::new(LrcConfig::new(
                    config.data_parts,
                    local_parity,
                    global_parity,
                ))?)
            }
        };

        Ok(Self { config, backend })
    }

    /// Get the configuration
    #[must_use]
    pub const fn config(&self) -> ErasureConfig {
        self.config
    }

    /// Name of the backend in use
    #[must_use]
    pub fn backend_name(&self) -> &'static str {
        self.backend.capabilities().name
    }

    #[must_use]
    pub fn data_parts(&self) -> usize {
        self.backend.data_parts()
    }

    #[must_use]
    pub fn parity_parts(&self) -> usize {
        self.backend.parity_parts()
    }

    #[must_use]
    pub fn total_parts(&self) -> usize {
        self.backend.total_parts()
    }

    /// Part size used for a block of `block_size` bytes
    #[must_use]
    pub fn part_size(&self, block_size: usize) -> usize {
        let k = self.data_parts();
        let size = block_size.div_ceil(k).max(MIN_PART_SIZE);
        size + size % 2
    }

    /// Whether the block can be rebuilt from the available parts
    #[must_use]
    pub fn can_reconstruct(&self, available: &[bool]) -> bool {
        self.backend.can_reconstruct(available)
    }

    /// Encode a block into data and parity parts
    pub fn encode_block(&self, block: &[u8]) -> Result<Vec<ErasurePart>> {
        let k = self.data_parts();
        let part_size = self.part_size(block.len());

        let mut padded = vec![0u8; part_size * k];
        padded[..block.len()].copy_from_slice(block);
        let data_parts: Vec<&[u8]> = padded.chunks(part_size).collect();

        let parts = self.backend.encode(&data_parts, part_size)?;
        Ok(parts
            .into_iter()
            .enumerate()
            .map(|(index, data)| ErasurePart::new(index, index >= k, Bytes::from(data)))
            .collect())
    }

    /// Rebuild all parts of a block from the available ones
    pub fn reconstruct(&self, parts: &[Option<Bytes>], block_size: usize) -> Result<Vec<Bytes>> {
        let part_size = self.part_size(block_size);
        for (index, part) in parts.iter().enumerate() {
            if let Some(part) = part
                && part.len() != part_size
            {
                return Err(ErasureError::PartSizeMismatch {
                    index,
                    size: part.len(),
                    expected: part_size,
                }
                .into());
            }
        }

        let refs: Vec<Option<&[u8]>> = parts.iter().map(|p| p.as_deref()).collect();
        let rebuilt = self.backend.reconstruct(&refs, part_size)?;
        Ok(rebuilt.into_iter().map(Bytes::from).collect())
    }

    /// Decode the original block from the available parts
    pub fn decode_block(&self, parts: &[Option<Bytes>], block_size: usize) -> Result<Bytes> {
        let k = self.data_parts();
        if parts.len() >= k && parts[..k].iter().all(Option::is_some) {
            let mut block = Vec::with_capacity(block_size);
            for part in parts[..k].iter().flatten() {
                block.extend_from_slice(part);
            }
            block.truncate(block_size);
            return Ok(Bytes::from(block));
        }

        let rebuilt = self.reconstruct(parts, block_size)?;
        let mut block = Vec::with_capacity(block_size);
        for part in &rebuilt[..k] {
            block.extend_from_slice(part);
        }
        block.truncate(block_size);
        Ok(Bytes::from(block))
    }

    /// Map a byte range of a block onto data part slices
    #[must_use]
    pub fn map_range(&self, block_size: usize, offset: usize, length: usize) -> Vec<PartSlice> {
        let part_size = self.part_size(block_size);
        let end = offset + length;
        let mut slices = Vec::new();
        let mut position = offset;
        while position < end {
            let part_index = position / part_size;
            let part_offset = position % part_size;
            let take = (part_size - part_offset).min(end - position);
            slices.push(PartSlice {
                part_index,
                offset: part_offset,
                length: take,
            });
            position += take;
        }
        slices
    }

    /// Verify that all parts of a block are consistent
    pub fn verify(&self, parts: &[Bytes]) -> Result<bool> {
        let refs: Vec<&[u8]> = parts.iter().map(Bytes::as_ref).collect();
        Ok(self.backend.verify(&refs)?)
    }
}
