use std::path::PathBuf;
use std::time::Duration;

use cxo_cxds::DEFAULT_SCAN_COUNT;
use cxo_skyobject::{PackFlags, PackOptions, CHUNK_OVERHEAD, DEFAULT_DEGREE};
use serde::{Deserialize, Serialize};

use crate::error::{ContainerError, ContainerResult};

/// On-disk engine of a persistent container.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    /// One redb B+-tree file per database.
    #[default]
    File,
    /// One sled log-structured directory per database.
    Lsm,
}

/// Configuration of a [`Container`](crate::Container).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding both databases.
    pub data_dir: PathBuf,
    /// Keep both databases in memory; `data_dir` and `engine` are ignored.
    pub in_memory_db: bool,
    pub engine: Engine,
    /// Upper bound of an encoded chunk produced by split.
    pub max_object_size: usize,
    /// Entries read per batch by CXDS iterations.
    pub scan_count: usize,
    /// Fan-out of new Refs trees.
    pub refs_degree: u32,
    /// Concurrent filler workers per root; 0 means unbounded.
    pub max_parallel: usize,
    /// Roots kept per head by the periodic GC.
    pub gc_keep_last: u64,
    /// Time budget of one object sweep.
    pub gc_timeout_ms: u64,
    /// Pause between GC passes; 0 turns the periodic GC off.
    pub gc_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("cxo"),
            in_memory_db: false,
            engine: Engine::File,
            max_object_size: 16 * 1024,
            scan_count: DEFAULT_SCAN_COUNT,
            refs_degree: DEFAULT_DEGREE,
            max_parallel: 10,
            gc_keep_last: 10,
            gc_timeout_ms: 5_000,
            gc_interval_ms: 60_000,
        }
    }
}

impl Config {
    /// Defaults with both databases in memory.
    pub fn in_memory() -> Self {
        Self {
            in_memory_db: true,
            ..Default::default()
        }
    }

    /// Parse a TOML document; missing keys take their defaults.
    pub fn from_toml_str(s: &str) -> ContainerResult<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ContainerResult<()> {
        if self.refs_degree < 2 {
            return Err(ContainerError::InvalidConfig(format!(
                "refs_degree must be at least 2, got {}",
                self.refs_degree
            )));
        }
        if self.max_object_size <= CHUNK_OVERHEAD {
            return Err(ContainerError::InvalidConfig(format!(
                "max_object_size must exceed {CHUNK_OVERHEAD}, got {}",
                self.max_object_size
            )));
        }
        if self.scan_count == 0 {
            return Err(ContainerError::InvalidConfig(
                "scan_count must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Pack options with the configured degree.
    pub fn pack_options(&self, flags: PackFlags) -> PackOptions {
        PackOptions {
            flags,
            degree: self.refs_degree,
        }
    }

    pub fn gc_timeout(&self) -> Duration {
        Duration::from_millis(self.gc_timeout_ms)
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_millis(self.gc_interval_ms)
    }
}
