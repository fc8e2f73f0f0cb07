//! Core type definitions for hunkstore
//!
//! This module defines the opaque identifiers used by the chunk ledger and
//! the erasure codec descriptors attached to hunk chunks.

use derive_more::{From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier for a chunk (store chunk or hunk chunk)
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, From, Into)]
pub struct ChunkId(Uuid);

impl ChunkId {
    /// Generate a new random chunk ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from existing UUID
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Get as bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for ChunkId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkId({})", self.0)
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ChunkId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Unique identifier for a storage node
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, From, Into)]
pub struct NodeId(Uuid);

impl NodeId {
    /// Generate a new random node ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from raw bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Get as bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a tablet (a key range of a sorted table)
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, From, Into)]
pub struct TabletId(Uuid);

impl TabletId {
    /// Generate a new random tablet ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TabletId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TabletId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TabletId({})", self.0)
    }
}

impl fmt::Display for TabletId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Erasure coding type
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErasureType {
    /// Maximum Distance Separable (standard Reed-Solomon)
    /// Any k parts can reconstruct the data
    #[default]
    Mds,
    /// Locally Repairable Codes
    /// Local parity groups enable faster single-part repairs
    Lrc {
        /// Number of local parity parts (one per group)
        local_parity: u8,
        /// Number of global parity parts (Reed-Solomon over all data)
        global_parity: u8,
    },
}

impl ErasureType {
    /// Check if this is MDS
    #[must_use]
    pub const fn is_mds(&self) -> bool {
        matches!(self, Self::Mds)
    }

    /// Check if this is LRC
    #[must_use]
    pub const fn is_lrc(&self) -> bool {
        matches!(self, Self::Lrc { .. })
    }
}

/// Erasure coding configuration
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ErasureConfig {
    /// Number of data parts (k)
    pub data_parts: u8,
    /// Number of parity parts (m for MDS, l+g for LRC)
    pub parity_parts: u8,
    /// Type of erasure coding
    #[serde(default)]
    pub ec_type: ErasureType,
}

impl ErasureConfig {
    /// Create a new MDS erasure config
    #[must_use]
    pub const fn mds(data_parts: u8, parity_parts: u8) -> Self {
        Self {
            data_parts,
            parity_parts,
            ec_type: ErasureType::Mds,
        }
    }

    /// Create a new LRC erasure config
    ///
    /// # Arguments
    /// * `data_parts` - Number of data parts (k), must be divisible by `local_parity`
    /// * `local_parity` - Number of local parity parts (l), one per group
    /// * `global_parity` - Number of global parity parts (g)
    #[must_use]
    pub const fn lrc(data_parts: u8, local_parity: u8, global_parity: u8) -> Self {
        Self {
            data_parts,
            parity_parts: local_parity + global_parity,
            ec_type: ErasureType::Lrc {
                local_parity,
                global_parity,
            },
        }
    }

    /// Total number of parts (k + m)
    #[must_use]
    pub const fn total_parts(&self) -> usize {
        self.data_parts as usize + self.parity_parts as usize
    }

    /// Storage efficiency (k / (k + m))
    #[must_use]
    pub fn efficiency(&self) -> f64 {
        f64::from(self.data_parts) / (f64::from(self.data_parts) + f64::from(self.parity_parts))
    }
}

/// Erasure codec attached to a hunk chunk
///
/// Rendered as `none`, `reed_solomon_<k>_<m>` or `lrc_<k>_<l>_<g>`. The
/// `isa_` prefix used by hardware-accelerated codec names is accepted on
/// input and maps to the same codec.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ErasureCodecId {
    /// Plain replication
    #[default]
    None,
    /// Reed-Solomon with `data` data parts and `parity` parity parts
    ReedSolomon { data: u8, parity: u8 },
    /// Locally repairable code
    Lrc { data: u8, local: u8, global: u8 },
}

impl ErasureCodecId {
    /// Whether the codec erasure-encodes blocks
    #[must_use]
    pub const fn is_erasure(&self) -> bool {
        !matches!(self, Self::None)
    }

    /// Erasure configuration, `None` for replicated chunks
    #[must_use]
    pub const fn erasure_config(&self) -> Option<ErasureConfig> {
        match *self {
            Self::None => None,
            Self::ReedSolomon { data, parity } => Some(ErasureConfig::mds(data, parity)),
            Self::Lrc {
                data,
                local,
                global,
            } => Some(ErasureConfig::lrc(data, local, global)),
        }
    }

    /// Number of data parts, 1 for replicated chunks
    #[must_use]
    pub const fn data_part_count(&self) -> usize {
        match *self {
            Self::None => 1,
            Self::ReedSolomon { data, .. } | Self::Lrc { data, .. } => data as usize,
        }
    }

    /// Number of parity parts, 0 for replicated chunks
    #[must_use]
    pub const fn parity_part_count(&self) -> usize {
        match *self {
            Self::None => 0,
            Self::ReedSolomon { parity, .. } => parity as usize,
            Self::Lrc { local, global, .. } => local as usize + global as usize,
        }
    }

    /// Total number of parts
    #[must_use]
    pub const fn total_part_count(&self) -> usize {
        self.data_part_count() + self.parity_part_count()
    }
}

impl fmt::Display for ErasureCodecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::ReedSolomon { data, parity } => write!(f, "reed_solomon_{data}_{parity}"),
            Self::Lrc {
                data,
                local,
                global,
            } => write!(f, "lrc_{data}_{local}_{global}"),
        }
    }
}

/// Error returned when parsing an erasure codec name
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown erasure codec: {0}")]
pub struct UnknownErasureCodec(pub String);

impl FromStr for ErasureCodecId {
    type Err = UnknownErasureCodec;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let unknown = || UnknownErasureCodec(s.to_string());
        let name = s.strip_prefix("isa_").unwrap_or(s);
        if name == "none" {
            return Ok(Self::None);
        }

        let parse_counts = |rest: &str| -> Option<Vec<u8>> {
            rest.split('_').map(|p| p.parse::<u8>().ok()).collect()
        };

        let codec = if let Some(rest) = name.strip_prefix("reed_solomon_") {
            match parse_counts(rest).as_deref() {
                Some(&[data, parity]) => Self::ReedSolomon { data, parity },
                _ => return Err(unknown()),
            }
        } else if let Some(rest) = name.strip_prefix("lrc_") {
            match parse_counts(rest).as_deref() {
                Some(&[data, local, global]) => Self::Lrc {
                    data,
                    local,
                    global,
                },
                _ => return Err(unknown()),
            }
        } else {
            return Err(unknown());
        };

        let valid = match codec {
            Self::None => true,
            Self::ReedSolomon { data, parity } => data > 0 && parity > 0,
            Self::Lrc {
                data,
                local,
                global,
            } => data > 0 && local > 0 && global > 0 && data % local == 0,
        };
        if valid { Ok(codec) } else { Err(unknown()) }
    }
}

impl TryFrom<String> for ErasureCodecId {
    type Error = UnknownErasureCodec;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ErasureCodecId> for String {
    fn from(value: ErasureCodecId) -> Self {
        value.to_string()
    }
}
