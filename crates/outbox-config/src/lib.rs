//! Configuration management system for outbox
//!
//! Configuration is layered: built-in defaults, then an optional file (YAML,
//! TOML or JSON), then `OUTBOX__SECTION__KEY` environment variables. The
//! result is validated before it is handed out.
//!
//! # Examples
//!
//! ```rust,no_run
//! use outbox_config::ConfigBuilder;
//!
//! let config = ConfigBuilder::new()
//!     .add_defaults()
//!     .add_source_file("outbox.yaml")
//!     .add_env_prefix("OUTBOX")
//!     .build()
//!     .expect("Failed to load configuration");
//!
//! println!("Data directory: {}", config.storage.data_dir.display());
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

use outbox_types::{FailureClass, NetworkType, ResolutionPolicy};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

pub mod builder;
pub mod error;
pub mod loader;

pub use builder::ConfigBuilder;
pub use error::{ConfigError, ConfigResult};
pub use loader::ConfigLoader;

/// Main configuration structure for outbox
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    /// Durable storage
    #[serde(default)]
    pub storage: StorageConfig,
    /// Sync coordinator behaviour
    #[serde(default)]
    pub sync: SyncConfig,
    /// Background scheduling
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Capability sampling
    #[serde(default)]
    pub capability: CapabilityConfig,
    /// Initial selective-sync policy
    #[serde(default)]
    pub policy: PolicyConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where durable state lives
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    /// Directory holding the queue and policy files
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".outbox"),
        }
    }
}

/// Sync coordinator behaviour
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncConfig {
    /// Policy applied to detected conflicts
    pub conflict_policy: ResolutionPolicy,
    /// Batch size override; when unset the capability tier decides
    pub max_batch_size: Option<usize>,
    /// Class given to failure codes the client does not recognise
    pub unknown_failure: FailureClass,
    /// Per-code classification overrides, keyed by backend error code
    #[serde(default)]
    pub failure_overrides: BTreeMap<String, FailureClass>,
    /// Capacity of the event broadcast channel
    pub event_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            conflict_policy: ResolutionPolicy::LastWriteWins,
            max_batch_size: None,
            unknown_failure: FailureClass::Transient,
            failure_overrides: BTreeMap::new(),
            event_capacity: 256,
        }
    }
}

/// Scheduling strategy as written in configuration files
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StrategyConfig {
    /// Run whenever the queue changes and is non-empty
    Immediate,
    /// Run on a fixed interval
    Periodic {
        /// Interval in seconds
        interval_secs: u64,
    },
    /// Back off exponentially after failed runs
    ExponentialBackoff {
        /// First delay in seconds
        base_secs: u64,
        /// Maximum delay in seconds
        cap_secs: u64,
    },
    /// Run when the host reports idle time
    Idle {
        /// Fallback interval in seconds when no idle hook is installed
        fallback_secs: u64,
    },
    /// Run only when power and network conditions allow
    OptimalConditions {
        /// Minimum battery level in `0.0..=1.0` unless charging
        battery_threshold: f32,
        /// Network type that must be active, if any
        #[serde(default)]
        required_network: Option<NetworkType>,
        /// How often conditions are re-checked, in seconds
        check_interval_secs: u64,
    },
    /// Run once the queue reaches a length
    QueueThreshold {
        /// Minimum queue length
        threshold: usize,
    },
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self::ExponentialBackoff {
            base_secs: 5,
            cap_secs: 300,
        }
    }
}

/// Background scheduling
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerConfig {
    /// Selected strategy
    #[serde(default)]
    pub strategy: StrategyConfig,
    /// Re-evaluate immediately when the app returns to the foreground
    pub trigger_on_foreground: bool,
    /// Re-evaluate immediately on startup
    pub trigger_on_startup: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyConfig::default(),
            trigger_on_foreground: true,
            trigger_on_startup: true,
        }
    }
}

/// Capability sampling
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CapabilityConfig {
    /// Interval between capability samples, in seconds
    pub sample_interval_secs: u64,
    /// How long a sample stays fresh, in seconds
    pub cache_ttl_secs: u64,
}

impl CapabilityConfig {
    /// Sampling interval
    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.sample_interval_secs)
    }

    /// Sample freshness
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        Self {
            sample_interval_secs: 60,
            cache_ttl_secs: 30,
        }
    }
}

/// Initial selective-sync policy, used when nothing is persisted yet
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyConfig {
    /// Global sync switch
    pub enabled: bool,
    /// Whether entity types without a rule sync
    pub default_enabled: bool,
    /// Entity types that can never be disabled
    #[serde(default)]
    pub required: Vec<String>,
    /// Entity types disabled initially
    #[serde(default)]
    pub disabled: Vec<String>,
    /// Entity type to the types it depends on
    #[serde(default)]
    pub dependencies: BTreeMap<String, Vec<String>>,
    /// Compress outgoing payloads
    pub compress: bool,
    /// Cap on operations per run imposed by policy
    pub max_batch_size: Option<usize>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_enabled: true,
            required: vec!["settings".to_string()],
            disabled: Vec::new(),
            dependencies: BTreeMap::new(),
            compress: false,
            max_batch_size: None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Enable JSON formatting
    pub json_format: bool,
    /// Enable colored output
    pub colored_output: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            colored_output: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.sync.conflict_policy, ResolutionPolicy::LastWriteWins);
        assert_eq!(config.sync.unknown_failure, FailureClass::Transient);
        assert!(config.policy.required.contains(&"settings".to_string()));
        assert!(config.scheduler.trigger_on_startup);
    }

    #[test]
    fn test_strategy_yaml_shape() {
        let strategy: StrategyConfig =
            serde_yaml::from_str("type: queue_threshold\nthreshold: 10\n").unwrap();
        assert_eq!(strategy, StrategyConfig::QueueThreshold { threshold: 10 });

        let strategy: StrategyConfig = serde_yaml::from_str(
            "type: optimal_conditions\nbattery_threshold: 0.5\nrequired_network: wifi\ncheck_interval_secs: 60\n",
        )
        .unwrap();
        assert_eq!(
            strategy,
            StrategyConfig::OptimalConditions {
                battery_threshold: 0.5,
                required_network: Some(NetworkType::Wifi),
                check_interval_secs: 60,
            }
        );
    }
}
