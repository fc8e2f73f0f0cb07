//! Error types for hunkstore
//!
//! This module defines the common error types used throughout the system.

use crate::types::{ChunkId, NodeId};
use std::fmt;
use thiserror::Error;

/// Common result type for hunkstore operations
pub type Result<T> = std::result::Result<T, Error>;

/// Part indices of an erasure-coded chunk that could not be fetched
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MissingParts {
    /// Missing data part indices
    pub data: Vec<usize>,
    /// Missing parity part indices
    pub parity: Vec<usize>,
}

impl MissingParts {
    /// Split missing part indices by role given the data part count
    #[must_use]
    pub fn from_indices(indices: impl IntoIterator<Item = usize>, data_part_count: usize) -> Self {
        let (data, parity) = indices.into_iter().partition(|&i| i < data_part_count);
        Self { data, parity }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty() && self.parity.is_empty()
    }

    #[must_use]
    pub fn has_missing_data(&self) -> bool {
        !self.data.is_empty()
    }

    #[must_use]
    pub fn has_missing_parity(&self) -> bool {
        !self.parity.is_empty()
    }
}

impl fmt::Display for MissingParts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "data parts {:?}, parity parts {:?}", self.data, self.parity)
    }
}

/// Common error type for hunkstore
#[derive(Debug, Error)]
pub enum Error {
    // Read validation errors
    #[error("invalid chunk id: {0}")]
    InvalidChunkId(String),

    #[error("invalid range: offset {offset}, length {length}")]
    InvalidRange { offset: i64, length: i64 },

    #[error(
        "range out of bounds: offset {offset} + length {length} exceeds block size {block_size}"
    )]
    OutOfRange {
        offset: u64,
        length: u64,
        block_size: u64,
    },

    #[error("invalid block index {block_index} for chunk {chunk_id} with {block_count} blocks")]
    InvalidBlockIndex {
        chunk_id: ChunkId,
        block_index: u32,
        block_count: usize,
    },

    // Availability errors
    #[error("chunk {chunk_id} is unavailable: missing {missing}")]
    DataUnavailable {
        chunk_id: ChunkId,
        missing: MissingParts,
    },

    #[error("node unavailable: {0}")]
    NodeUnavailable(NodeId),

    #[error("insufficient parts for reconstruction: have {available}, need {required}")]
    InsufficientParts { available: usize, required: usize },

    #[error("insufficient nodes for placement: have {available}, need {required}")]
    InsufficientNodes { available: usize, required: usize },

    // Metadata errors
    #[error("schema violation: {0}")]
    SchemaViolation(String),

    #[error("store chunk {0} was rewritten while its references were being resolved")]
    ConcurrentRewrite(ChunkId),

    #[error("no such chunk: {0}")]
    NoSuchChunk(ChunkId),

    #[error("no such node: {0}")]
    NoSuchNode(String),

    #[error("no such table: {0}")]
    NoSuchTable(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    // Data errors
    #[error("checksum mismatch: expected {expected:#x}, got {actual:#x}")]
    ChecksumMismatch { expected: u64, actual: u64 },

    #[error("erasure coding error: {0}")]
    ErasureCoding(String),

    #[error("storage error: {0}")]
    Storage(String),

    // Internal errors
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("operation canceled")]
    Canceled,

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a schema violation error
    pub fn schema_violation(msg: impl Into<String>) -> Self {
        Self::SchemaViolation(msg.into())
    }

    /// Check if this is a retryable error
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NodeUnavailable(_) | Self::ConcurrentRewrite(_) | Self::Storage(_)
        )
    }

    /// Check if this error was raised by request validation, before any I/O
    #[must_use]
    pub fn is_validation_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidChunkId(_)
                | Self::InvalidRange { .. }
                | Self::OutOfRange { .. }
                | Self::InvalidBlockIndex { .. }
                | Self::InvalidArgument(_)
        )
    }

    /// Clone the error for fan-out to several requests addressing one chunk
    ///
    /// Variants wrapping non-cloneable sources are degraded to their message.
    #[must_use]
    pub fn duplicate(&self) -> Self {
        match self {
            Self::InvalidChunkId(s) => Self::InvalidChunkId(s.clone()),
            Self::InvalidRange { offset, length } => Self::InvalidRange {
                offset: *offset,
                length: *length,
            },
            Self::OutOfRange {
                offset,
                length,
                block_size,
            } => Self::OutOfRange {
                offset: *offset,
                length: *length,
                block_size: *block_size,
            },
            Self::InvalidBlockIndex {
                chunk_id,
                block_index,
                block_count,
            } => Self::InvalidBlockIndex {
                chunk_id: *chunk_id,
                block_index: *block_index,
                block_count: *block_count,
            },
            Self::DataUnavailable { chunk_id, missing } => Self::DataUnavailable {
                chunk_id: *chunk_id,
                missing: missing.clone(),
            },
            Self::NodeUnavailable(node) => Self::NodeUnavailable(*node),
            Self::InsufficientParts {
                available,
                required,
            } => Self::InsufficientParts {
                available: *available,
                required: *required,
            },
            Self::InsufficientNodes {
                available,
                required,
            } => Self::InsufficientNodes {
                available: *available,
                required: *required,
            },
            Self::SchemaViolation(s) => Self::SchemaViolation(s.clone()),
            Self::ConcurrentRewrite(id) => Self::ConcurrentRewrite(*id),
            Self::NoSuchChunk(id) => Self::NoSuchChunk(*id),
            Self::NoSuchNode(s) => Self::NoSuchNode(s.clone()),
            Self::NoSuchTable(s) => Self::NoSuchTable(s.clone()),
            Self::InvalidState(s) => Self::InvalidState(s.clone()),
            Self::ChecksumMismatch { expected, actual } => Self::ChecksumMismatch {
                expected: *expected,
                actual: *actual,
            },
            Self::ErasureCoding(s) => Self::ErasureCoding(s.clone()),
            Self::Storage(s) => Self::Storage(s.clone()),
            Self::InvalidArgument(s) => Self::InvalidArgument(s.clone()),
            Self::Canceled => Self::Canceled,
            Self::Configuration(s) => Self::Configuration(s.clone()),
            Self::Serialization(s) => Self::Serialization(s.clone()),
            Self::Internal(s) => Self::Internal(s.clone()),
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Self::Configuration(e.to_string())
    }
}
