//! Mesh base configuration

use crate::identifier::MeshBaseIdentifier;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default bound of each proxy's outbound queue
pub const DEFAULT_MAX_OUTBOUND_QUEUE: usize = 10_000;

/// Default LMDB map size (64MB)
pub const DEFAULT_MAP_SIZE: usize = 64 * 1024 * 1024;

/// Store configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory of the LMDB environment; `None` keeps everything in memory
    pub path: Option<PathBuf>,

    /// LMDB map size in bytes
    pub map_size: usize,

    /// Maximum number of named LMDB databases
    pub max_dbs: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            map_size: DEFAULT_MAP_SIZE,
            max_dbs: 4,
        }
    }
}

impl StoreConfig {
    /// In-memory store
    pub fn memory() -> Self {
        Self::default()
    }

    /// LMDB store in `path`
    pub fn lmdb(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Default::default()
        }
    }
}

/// Configuration of one mesh base
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshBaseConfig {
    /// Identifier of this mesh base
    pub identifier: MeshBaseIdentifier,

    /// Interval of the background sweeper
    pub sweep_interval: Duration,

    /// Bound of each proxy's outbound queue; a commit that would overflow it fails
    pub max_outbound_queue: usize,

    /// Whether lookups update the in-memory read time
    pub read_updates_time_read: bool,

    /// Store configuration
    #[serde(default)]
    pub store: StoreConfig,
}

impl Default for MeshBaseConfig {
    fn default() -> Self {
        Self {
            identifier: MeshBaseIdentifier::new("meshbase"),
            sweep_interval: Duration::from_secs(60),
            max_outbound_queue: DEFAULT_MAX_OUTBOUND_QUEUE,
            read_updates_time_read: true,
            store: StoreConfig::default(),
        }
    }
}

impl MeshBaseConfig {
    /// Configuration for a mesh base with the given identifier
    pub fn new(identifier: impl Into<MeshBaseIdentifier>) -> Self {
        Self {
            identifier: identifier.into(),
            ..Default::default()
        }
    }

    /// Load from JSON; missing fields fail, except `store`
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| Error::config(format!("Invalid mesh base config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Set the store configuration
    pub fn with_store(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }

    /// Set the sweep interval
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Set the outbound queue bound
    pub fn with_max_outbound_queue(mut self, max: usize) -> Self {
        self.max_outbound_queue = max;
        self
    }

    /// Check the configuration for unusable values
    pub fn validate(&self) -> Result<()> {
        if self.identifier.as_str().trim().is_empty() {
            return Err(Error::config("Mesh base identifier must not be empty"));
        }
        if self.sweep_interval.is_zero() {
            return Err(Error::config("Sweep interval must be positive"));
        }
        if self.max_outbound_queue == 0 {
            return Err(Error::config("Outbound queue bound must be positive"));
        }
        if self.store.path.is_some() && self.store.map_size < 1024 * 1024 {
            return Err(Error::config("LMDB map size must be at least 1MB"));
        }
        if self.store.max_dbs == 0 {
            return Err(Error::config("max_dbs must be positive"));
        }
        Ok(())
    }
}
