//! Configuration System
//!
//! Hierarchical configuration for the stage builder:
//! - `slotplan.toml` (default configuration file)
//! - Environment variables (`SLOTPLAN_*` prefix)
//!
//! ## Example
//!
//! ```toml
//! # slotplan.toml
//! [sort]
//! memory_limit_bytes = 104857600
//! allow_disk_use = true
//! ```
//!
//! Environment variable overrides:
//! ```bash
//! SLOTPLAN_SORT__MEMORY_LIMIT_BYTES=33554432
//! SLOTPLAN_SORT__ALLOW_DISK_USE=true
//! ```

use crate::error::BuildError;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default blocking-sort memory cap: 100 MiB
pub const DEFAULT_SORT_MEMORY_LIMIT_BYTES: usize = 100 * 1024 * 1024;

/// Main configuration struct
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BuilderConfig {
    /// Sort resource limits
    #[serde(default)]
    pub sort: SortConfig,
}

/// Resource limits flowed into every sort stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SortConfig {
    /// Bytes of memory a blocking sort may hold before it must spill
    #[serde(default = "default_sort_memory_limit")]
    pub memory_limit_bytes: usize,

    /// Whether sorts may spill to disk at all
    #[serde(default)]
    pub allow_disk_use: bool,
}

fn default_sort_memory_limit() -> usize {
    DEFAULT_SORT_MEMORY_LIMIT_BYTES
}

impl Default for SortConfig {
    fn default() -> Self {
        SortConfig {
            memory_limit_bytes: DEFAULT_SORT_MEMORY_LIMIT_BYTES,
            allow_disk_use: false,
        }
    }
}

impl BuilderConfig {
    /// Load from `slotplan.toml` plus `SLOTPLAN_*` environment overrides
    pub fn load() -> Result<Self, BuildError> {
        Self::load_from("slotplan.toml")
    }

    /// Load from an explicit toml path plus environment overrides
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, BuildError> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("SLOTPLAN_").split("__"))
            .extract()
            .map_err(|err| BuildError::Config(Box::new(err)))
    }
}
