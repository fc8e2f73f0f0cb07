//! Hunkstore Common - Shared types and utilities
//!
//! This crate provides the identifiers, erasure codec descriptors, checksums,
//! error definitions and configuration groups used across all hunkstore
//! components.

pub mod checksum;
pub mod config;
pub mod error;
pub mod types;

pub use checksum::{Checksum, ChecksumCalculator};
pub use config::{
    GcConfig, HedgingManagerConfig, HunkChunkReaderConfig, HunkChunkWriterConfig,
    HunkCompactionConfig, HunkLockManagerConfig, HunkStorageConfig, HunkStoreConfig,
};
pub use error::{Error, MissingParts, Result};
pub use types::*;
