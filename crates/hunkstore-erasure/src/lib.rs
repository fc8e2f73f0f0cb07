//! Hunkstore Erasure Coding
//!
//! Hunk chunks declared with a non-`none` erasure codec store every block as
//! `k` data parts plus parity parts, each part on a distinct node. This crate
//! provides:
//! - MDS (Maximum Distance Separable) Reed-Solomon codes
//! - LRC (Locally Repairable Codes) for reduced repair bandwidth
//! - Mapping of block byte ranges onto data parts, so that readers can fetch
//!   fragments straight from data parts without decoding
//!
//! # Example
//!
//! ```
//! use hunkstore_erasure::ErasureCodec;
//! use hunkstore_common::ErasureConfig;
//!
//! let codec = ErasureCodec::new(ErasureConfig::mds(4, 2)).unwrap();
//! let block = b"Hello, World!";
//! let parts = codec.encode_block(block).unwrap();
//! assert_eq!(parts.len(), 6);
//! ```

pub mod backend;
pub mod codec;
pub mod part;

pub use backend::{ErasureBackend, LrcConfig, RustSimdBackend, RustSimdLrcBackend};
pub use codec::{ErasureCodec, ErasureError, PartSlice};
pub use part::{ErasurePart, PartRole};
