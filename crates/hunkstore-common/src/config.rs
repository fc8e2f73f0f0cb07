//! Configuration types for hunkstore
//!
//! Each component owns one fixed configuration group. Groups are plain serde
//! structs with defaults; durations are stored as milliseconds and exposed as
//! [`Duration`] accessors. Every group validates itself, and components call
//! `validate()` on construction.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "HUNKSTORE";

/// Root configuration for hunkstore
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HunkStoreConfig {
    /// Hunk chunk reader configuration
    pub hunk_chunk_reader: HunkChunkReaderConfig,
    /// Hunk chunk writer configuration
    pub hunk_chunk_writer: HunkChunkWriterConfig,
    /// Compaction rewrite thresholds
    pub compaction: HunkCompactionConfig,
    /// Log-backed hunk storage configuration
    pub hunk_storage: HunkStorageConfig,
    /// Hunk lock manager configuration
    pub hunk_lock_manager: HunkLockManagerConfig,
    /// Garbage collector configuration
    pub gc: GcConfig,
}

impl HunkStoreConfig {
    /// Load configuration from a file, overlaid with `HUNKSTORE__*` environment variables
    ///
    /// The file format is inferred from the extension (TOML, JSON or YAML).
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;
        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every configuration group
    pub fn validate(&self) -> Result<()> {
        self.hunk_chunk_reader.validate()?;
        self.hunk_chunk_writer.validate()?;
        self.compaction.validate()?;
        self.hunk_storage.validate()?;
        self.hunk_lock_manager.validate()?;
        self.gc.validate()
    }
}

fn require_positive(group: &str, name: &str, value: u64) -> Result<()> {
    if value == 0 {
        return Err(Error::configuration(format!(
            "{group}.{name} must be positive"
        )));
    }
    Ok(())
}

fn require_fraction(group: &str, name: &str, value: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(Error::configuration(format!(
            "{group}.{name} must be within [0, 1], got {value}"
        )));
    }
    Ok(())
}

/// Hunk chunk reader configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HunkChunkReaderConfig {
    /// Maximum number of fragments per backend read request
    pub max_hunk_count_per_read: usize,
    /// Maximum total fragment length per backend read request
    pub max_total_hunk_length_per_read: u64,
    /// Delay before a backup request is issued; hedging is disabled when unset
    pub fragment_read_hedging_delay_ms: Option<u64>,
    /// Maximum total length of fragments being read concurrently
    pub max_inflight_fragment_length: u64,
    /// Maximum number of fragments being read concurrently
    pub max_inflight_fragment_count: usize,
    /// Backup request budget; defaults apply when hedging is enabled without it
    pub hedging_manager: Option<HedgingManagerConfig>,
}

impl Default for HunkChunkReaderConfig {
    fn default() -> Self {
        Self {
            max_hunk_count_per_read: 10_000,
            max_total_hunk_length_per_read: 16 * 1024 * 1024,
            fragment_read_hedging_delay_ms: None,
            max_inflight_fragment_length: 64 * 1024 * 1024,
            max_inflight_fragment_count: 8192,
            hedging_manager: None,
        }
    }
}

impl HunkChunkReaderConfig {
    /// Hedging delay, if hedging is enabled
    #[must_use]
    pub fn fragment_read_hedging_delay(&self) -> Option<Duration> {
        self.fragment_read_hedging_delay_ms.map(Duration::from_millis)
    }

    /// Validate the reader configuration
    pub fn validate(&self) -> Result<()> {
        const GROUP: &str = "hunk_chunk_reader";
        require_positive(GROUP, "max_hunk_count_per_read", self.max_hunk_count_per_read as u64)?;
        require_positive(
            GROUP,
            "max_total_hunk_length_per_read",
            self.max_total_hunk_length_per_read,
        )?;
        require_positive(
            GROUP,
            "max_inflight_fragment_length",
            self.max_inflight_fragment_length,
        )?;
        require_positive(
            GROUP,
            "max_inflight_fragment_count",
            self.max_inflight_fragment_count as u64,
        )?;
        if let Some(hedging) = &self.hedging_manager {
            hedging.validate()?;
        }
        Ok(())
    }
}

/// Hedging manager configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HedgingManagerConfig {
    /// Maximum ratio of backup requests to primary requests
    pub max_backup_request_ratio: f64,
}

impl Default for HedgingManagerConfig {
    fn default() -> Self {
        Self {
            max_backup_request_ratio: 0.1,
        }
    }
}

impl HedgingManagerConfig {
    /// Validate the hedging configuration
    pub fn validate(&self) -> Result<()> {
        require_fraction(
            "hedging_manager",
            "max_backup_request_ratio",
            self.max_backup_request_ratio,
        )
    }
}

/// Hunk chunk writer configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HunkChunkWriterConfig {
    /// Target block size; a block is sealed once it reaches this size
    pub desired_block_size: u64,
    /// Replica count for chunks written without an erasure codec
    pub replication_factor: usize,
}

impl Default for HunkChunkWriterConfig {
    fn default() -> Self {
        Self {
            desired_block_size: 1024 * 1024,
            replication_factor: 3,
        }
    }
}

impl HunkChunkWriterConfig {
    /// Validate the writer configuration
    pub fn validate(&self) -> Result<()> {
        const GROUP: &str = "hunk_chunk_writer";
        require_positive(GROUP, "desired_block_size", self.desired_block_size)?;
        require_positive(GROUP, "replication_factor", self.replication_factor as u64)
    }
}

/// Compaction rewrite thresholds for hunk chunks
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HunkCompactionConfig {
    /// Garbage fraction above which a hunk chunk is rewritten
    pub max_hunk_compaction_garbage_ratio: f64,
    /// Hunk chunks with a smaller total hunk length are merge candidates
    pub max_hunk_compaction_size: u64,
    /// Maximum number of small hunk chunks merged by one compaction
    pub max_hunk_compaction_chunk_count: usize,
}

impl Default for HunkCompactionConfig {
    fn default() -> Self {
        Self {
            max_hunk_compaction_garbage_ratio: 0.5,
            max_hunk_compaction_size: 8 * 1024 * 1024,
            max_hunk_compaction_chunk_count: 10,
        }
    }
}

impl HunkCompactionConfig {
    /// Validate the compaction configuration
    pub fn validate(&self) -> Result<()> {
        const GROUP: &str = "compaction";
        require_fraction(
            GROUP,
            "max_hunk_compaction_garbage_ratio",
            self.max_hunk_compaction_garbage_ratio,
        )?;
        require_positive(
            GROUP,
            "max_hunk_compaction_chunk_count",
            self.max_hunk_compaction_chunk_count as u64,
        )
    }
}

/// Log-backed hunk storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HunkStorageConfig {
    /// Period after which the active store is sealed and replaced
    pub store_rotation_period_ms: u64,
    /// Delay before a sealed store drops the storage from its owning nodes
    pub store_removal_grace_period_ms: u64,
}

impl Default for HunkStorageConfig {
    fn default() -> Self {
        Self {
            store_rotation_period_ms: 600_000,
            store_removal_grace_period_ms: 10_000,
        }
    }
}

impl HunkStorageConfig {
    #[must_use]
    pub const fn store_rotation_period(&self) -> Duration {
        Duration::from_millis(self.store_rotation_period_ms)
    }

    #[must_use]
    pub const fn store_removal_grace_period(&self) -> Duration {
        Duration::from_millis(self.store_removal_grace_period_ms)
    }

    /// Validate the hunk storage configuration
    pub fn validate(&self) -> Result<()> {
        require_positive(
            "hunk_storage",
            "store_rotation_period_ms",
            self.store_rotation_period_ms,
        )
    }
}

/// Hunk lock manager configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HunkLockManagerConfig {
    /// Minimum time a store survives after its last lock is released
    pub hunk_store_extra_lifetime_ms: u64,
    /// Period of the pending unlock check
    pub unlock_check_period_ms: u64,
}

impl Default for HunkLockManagerConfig {
    fn default() -> Self {
        Self {
            hunk_store_extra_lifetime_ms: 5_000,
            unlock_check_period_ms: 1_000,
        }
    }
}

impl HunkLockManagerConfig {
    #[must_use]
    pub const fn hunk_store_extra_lifetime(&self) -> Duration {
        Duration::from_millis(self.hunk_store_extra_lifetime_ms)
    }

    #[must_use]
    pub const fn unlock_check_period(&self) -> Duration {
        Duration::from_millis(self.unlock_check_period_ms)
    }

    /// Validate the lock manager configuration
    pub fn validate(&self) -> Result<()> {
        require_positive(
            "hunk_lock_manager",
            "unlock_check_period_ms",
            self.unlock_check_period_ms,
        )
    }
}

/// Garbage collector configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// Period of the background sweep
    pub sweep_period_ms: u64,
    /// Minimum time an unreferenced chunk is kept before deletion
    pub removal_grace_period_ms: u64,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            sweep_period_ms: 1_000,
            removal_grace_period_ms: 5_000,
        }
    }
}

impl GcConfig {
    #[must_use]
    pub const fn sweep_period(&self) -> Duration {
        Duration::from_millis(self.sweep_period_ms)
    }

    #[must_use]
    pub const fn removal_grace_period(&self) -> Duration {
        Duration::from_millis(self.removal_grace_period_ms)
    }

    /// Validate the garbage collector configuration
    pub fn validate(&self) -> Result<()> {
        require_positive("gc", "sweep_period_ms", self.sweep_period_ms)
    }
}
