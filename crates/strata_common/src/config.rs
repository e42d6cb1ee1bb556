use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Rows per persisted row group, and the upper bound of any column vector.
pub const ROW_GROUP_CAPACITY: usize = 61_440;

/// Rows per in-flight execution batch.
pub const DEFAULT_BATCH_SIZE: usize = 1024;

/// Top-level configuration (`strata.toml`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StrataConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
}

impl StrataConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: StrataConfig =
            toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.storage;
        if s.row_group_capacity == 0 || s.row_group_capacity > ROW_GROUP_CAPACITY {
            return Err(ConfigError::Invalid {
                key: "storage.row_group_capacity",
                reason: format!("must be in 1..={}", ROW_GROUP_CAPACITY),
            });
        }
        if !(s.delta_merge_threshold > 0.0 && s.delta_merge_threshold <= 1.0) {
            return Err(ConfigError::Invalid {
                key: "storage.delta_merge_threshold",
                reason: format!("{} is not in (0, 1]", s.delta_merge_threshold),
            });
        }
        if s.delta_max_rows == 0 {
            return Err(ConfigError::Invalid {
                key: "storage.delta_max_rows",
                reason: "must be positive".into(),
            });
        }
        let e = &self.executor;
        if e.batch_size == 0 || e.batch_size > s.row_group_capacity {
            return Err(ConfigError::Invalid {
                key: "executor.batch_size",
                reason: format!("must be in 1..={}", s.row_group_capacity),
            });
        }
        if !e.spill.partitions.is_power_of_two() || e.spill.partitions < 2 {
            return Err(ConfigError::Invalid {
                key: "executor.spill.partitions",
                reason: "must be a power of two >= 2".into(),
            });
        }
        if !(e.hash_agg.fill_factor > 0.0 && e.hash_agg.fill_factor < 1.0) {
            return Err(ConfigError::Invalid {
                key: "executor.hash_agg.fill_factor",
                reason: "must be in (0, 1)".into(),
            });
        }
        Ok(())
    }
}

/// Compression applied to serialized column payloads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionMethod {
    #[default]
    None,
    /// zstd: better ratio, slower.
    Generic,
    /// lz4: cheap to decode.
    Fast,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Rows per row group (at most `ROW_GROUP_CAPACITY`).
    pub row_group_capacity: usize,
    /// Upper bound on delta-region row identifiers; also the size the
    /// merge threshold is measured against.
    pub delta_max_rows: u64,
    /// Fraction of `delta_max_rows` above which housekeeping merges.
    pub delta_merge_threshold: f64,
    pub compression: CompressionMethod,
    /// Merge also turns a trailing partial batch into a row group.
    pub merge_drain_all: bool,
    /// Byte prefix kept for text/bytea zone-map bounds.
    pub minmax_prefix_len: usize,
    /// Decoded (row group, column) buffers kept per scan session.
    pub decode_cache_entries: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            row_group_capacity: ROW_GROUP_CAPACITY,
            delta_max_rows: 1 << 32,
            delta_merge_threshold: 0.5,
            compression: CompressionMethod::None,
            merge_drain_all: false,
            minmax_prefix_len: 16,
            decode_cache_entries: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub batch_size: usize,
    pub hash_agg: HashAggConfig,
    pub spill: SpillConfig,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            hash_agg: HashAggConfig::default(),
            spill: SpillConfig::default(),
        }
    }
}

/// Vectorized grouping memory policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HashAggConfig {
    /// Budget for group metadata + representative keys (0 = unlimited).
    pub memory_budget_bytes: u64,
    /// Live group limit before switching to spill mode (0 = unlimited).
    pub max_groups: usize,
    pub initial_buckets: usize,
    /// Occupancy at which the bucket array doubles.
    pub fill_factor: f64,
}

impl Default for HashAggConfig {
    fn default() -> Self {
        Self {
            memory_budget_bytes: 256 * 1024 * 1024,
            max_groups: 0,
            initial_buckets: 1024,
            fill_factor: 0.75,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpillConfig {
    /// Temporary directory for spill files. Uses system temp dir if empty.
    pub temp_dir: String,
    /// Partition fan-out per spill level (power of two).
    pub partitions: usize,
    /// Recursion bound; at this depth grouping stops spilling and grows.
    pub max_depth: u32,
}

impl Default for SpillConfig {
    fn default() -> Self {
        Self {
            temp_dir: String::new(),
            partitions: 8,
            max_depth: 4,
        }
    }
}
