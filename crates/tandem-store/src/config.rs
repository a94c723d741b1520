use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

/// Tunables shared by every store a [`StoreFactory`](crate::StoreFactory) opens.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Child stores a backing muxer keeps open before evicting the least
    /// recently used one.
    pub backing_cache_capacity: usize,
    /// How long a reference-mode store waits for backing data before clearing
    /// its container and retrying.
    pub hold_timeout_ms: u64,
    /// Transitions the driver state machine may take for one change.
    pub max_update_spins: usize,
    pub write_back: WriteBackConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backing_cache_capacity: 50,
            hold_timeout_ms: 30_000,
            max_update_spins: 1000,
            write_back: WriteBackConfig::default(),
        }
    }
}

impl StoreConfig {
    pub fn hold_timeout(&self) -> Duration {
        Duration::from_millis(self.hold_timeout_ms)
    }

    pub fn from_toml_str(s: &str) -> StoreResult<Self> {
        let config: StoreConfig = toml::from_str(s).map_err(|e| StoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> StoreResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> StoreResult<()> {
        if self.backing_cache_capacity == 0 {
            return Err(StoreError::Config("backing_cache_capacity must be at least 1".into()));
        }
        if self.max_update_spins == 0 {
            return Err(StoreError::Config("max_update_spins must be at least 1".into()));
        }
        Ok(())
    }
}

/// Which storage protocols buffer driver flushes on a background task.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteBackConfig {
    pub queued_protocols: Vec<String>,
}

impl Default for WriteBackConfig {
    fn default() -> Self {
        Self {
            queued_protocols: vec!["db".to_string()],
        }
    }
}

impl WriteBackConfig {
    pub fn is_queued(&self, protocol: &str) -> bool {
        self.queued_protocols.iter().any(|p| p == protocol)
    }
}
