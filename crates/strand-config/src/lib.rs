//! Configuration management for Strand
//!
//! Provides hierarchical configuration loading from multiple sources:
//! 1. Environment variables (STRAND_* prefix, `__` between sections)
//! 2. strand.local.toml (gitignored, local overrides)
//! 3. strand.toml (git-tracked, project config)
//! 4. ~/.config/strand/config.toml (user defaults)
//! 5. Built-in defaults (lowest precedence)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use strand_types::{PartitionId, ValueType};

mod error;
mod loader;
mod paths;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use paths::Paths;

/// Main Strand configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StrandConfig {
    pub engine: EngineConfig,
    pub partition: PartitionConfig,
}

/// Tuning knobs of the stream processing engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Delay before a record that failed with a recoverable error is retried.
    pub processing_retry_delay_ms: u64,
    /// Interval of the liveness heartbeat. The processor reports unhealthy
    /// once the heartbeat is older than twice this interval.
    pub health_check_interval_ms: u64,
    /// Compare replayed follow-up records with the ones in the log.
    pub detect_reprocessing_inconsistency: bool,
    /// Attempts per side effect before it is given up (0 = until closed).
    pub side_effect_max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// Value types whose state is only changed by applying their events.
    pub migrated_value_types: Vec<ValueType>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            processing_retry_delay_ms: 250,
            health_check_interval_ms: 5_000,
            detect_reprocessing_inconsistency: true,
            side_effect_max_attempts: 10,
            retry_base_delay_ms: 10,
            retry_max_delay_ms: 2_000,
            migrated_value_types: Vec::new(),
        }
    }
}

impl EngineConfig {
    pub fn processing_retry_delay(&self) -> Duration {
        Duration::from_millis(self.processing_retry_delay_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }

    /// Side effect attempt limit, `None` when unbounded.
    pub fn side_effect_attempt_limit(&self) -> Option<u32> {
        (self.side_effect_max_attempts > 0).then_some(self.side_effect_max_attempts)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.health_check_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "engine.health_check_interval_ms must be positive".to_string(),
            ));
        }
        if self.retry_base_delay_ms > self.retry_max_delay_ms {
            return Err(ConfigError::ValidationError(format!(
                "engine.retry_base_delay_ms ({}) exceeds engine.retry_max_delay_ms ({})",
                self.retry_base_delay_ms, self.retry_max_delay_ms
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PartitionConfig {
    pub partition_id: u16,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self { partition_id: 1 }
    }
}

impl PartitionConfig {
    pub fn partition_id(&self) -> PartitionId {
        PartitionId::new(self.partition_id)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.partition_id > PartitionId::MAX {
            return Err(ConfigError::ValidationError(format!(
                "partition.partition_id {} exceeds the maximum of {}",
                self.partition_id,
                PartitionId::MAX
            )));
        }
        Ok(())
    }
}

impl StrandConfig {
    /// Load configuration from the current directory
    pub fn load() -> Result<Self> {
        ConfigLoader::new().load()
    }

    /// Load configuration from a specific project directory
    pub fn load_from_dir(project_dir: impl AsRef<Path>) -> Result<Self> {
        ConfigLoader::new().with_project_dir(project_dir).load()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.engine.validate()?;
        self.partition.validate()
    }
}
