//! Configuration builder for flexible configuration loading

use crate::{Config, ConfigError, ConfigResult, StrategyConfig};
use config::{ConfigBuilder as ConfigBuilderInner, Environment, File, FileFormat};
use outbox_types::BackendErrorCode;
use std::path::{Path, PathBuf};

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Configuration builder for loading configuration from multiple sources
#[derive(Debug)]
pub struct ConfigBuilder {
    inner: ConfigBuilderInner<config::builder::DefaultState>,
    sources: Vec<ConfigSource>,
    env_separator: String,
}

#[derive(Debug, Clone)]
enum ConfigSource {
    File { path: PathBuf, format: FileFormat },
    Defaults,
    Environment { prefix: String },
}

impl ConfigBuilder {
    /// Create a new configuration builder
    pub fn new() -> Self {
        Self {
            inner: config::Config::builder(),
            sources: Vec::new(),
            env_separator: "__".to_string(),
        }
    }

    /// Add default configuration values
    pub fn add_defaults(mut self) -> Self {
        self.sources.push(ConfigSource::Defaults);
        self
    }

    /// Add a configuration file source; missing files are skipped
    pub fn add_source_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let format = Self::detect_format(&path);
        self.sources.push(ConfigSource::File { path, format });
        self
    }

    /// Add environment variable source with prefix
    pub fn add_env_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.sources.push(ConfigSource::Environment {
            prefix: prefix.into(),
        });
        self
    }

    /// Set environment variable separator (default: "__")
    pub fn env_separator<S: Into<String>>(mut self, separator: S) -> Self {
        self.env_separator = separator.into();
        self
    }

    /// Build the configuration
    pub fn build(mut self) -> ConfigResult<Config> {
        // Defaults are always the base layer
        let defaults_value = serde_yaml::to_value(Config::default())
?;
        self.inner = self
            .inner
            .add_source(config::Config::try_from(&defaults_value)?);

        for source in &self.sources {
            match source {
                ConfigSource::File { path, format } => {
                    if path.exists() {
                        self.inner = self
                            .inner
                            .add_source(File::from(path.clone()).format(*format));
                    }
                }
                ConfigSource::Environment { prefix } => {
                    self.inner = self.inner.add_source(
                        Environment::with_prefix(prefix)
                            .prefix_separator(&self.env_separator)
                            .separator(&self.env_separator)
                            .try_parsing(true),
                    );
                }
                ConfigSource::Defaults => {}
            }
        }

        let config = self.inner.build()?;
        let result: Config = config.try_deserialize()?;

        validate(&result)?;

        Ok(result)
    }

    /// Try to build the configuration, returning defaults on error
    pub fn build_or_default(self) -> Config {
        self.build().unwrap_or_default()
    }

    /// Detect file format from extension
    fn detect_format(path: &Path) -> FileFormat {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => FileFormat::Toml,
            Some("json") => FileFormat::Json,
            _ => FileFormat::Yaml,
        }
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate a configuration
pub fn validate(config: &Config) -> ConfigResult<()> {
    match &config.scheduler.strategy {
        StrategyConfig::Periodic { interval_secs } if *interval_secs == 0 => {
            return Err(ConfigError::validation(
                "Periodic interval must be greater than 0",
            ));
        }
        StrategyConfig::ExponentialBackoff {
            base_secs,
            cap_secs,
        } => {
            if *base_secs == 0 {
                return Err(ConfigError::validation(
                    "Backoff base must be greater than 0",
                ));
            }
            if base_secs > cap_secs {
                return Err(ConfigError::validation(
                    "Backoff base cannot exceed backoff cap",
                ));
            }
        }
        StrategyConfig::Idle { fallback_secs } if *fallback_secs == 0 => {
            return Err(ConfigError::validation(
                "Idle fallback interval must be greater than 0",
            ));
        }
        StrategyConfig::OptimalConditions {
            battery_threshold,
            check_interval_secs,
            ..
        } => {
            if !(0.0..=1.0).contains(battery_threshold) {
                return Err(ConfigError::validation(
                    "Battery threshold must be between 0.0 and 1.0",
                ));
            }
            if *check_interval_secs == 0 {
                return Err(ConfigError::validation(
                    "Condition check interval must be greater than 0",
                ));
            }
        }
        StrategyConfig::QueueThreshold { threshold } if *threshold == 0 => {
            return Err(ConfigError::validation(
                "Queue threshold must be greater than 0",
            ));
        }
        _ => {}
    }

    if config.sync.max_batch_size == Some(0) || config.policy.max_batch_size == Some(0) {
        return Err(ConfigError::validation(
            "Batch size must be greater than 0",
        ));
    }

    if config.sync.event_capacity == 0 {
        return Err(ConfigError::validation(
            "Event capacity must be greater than 0",
        ));
    }

    for code in config.sync.failure_overrides.keys() {
        parse_error_code(code)?;
    }

    if config.capability.sample_interval_secs == 0 {
        return Err(ConfigError::validation(
            "Capability sample interval must be greater than 0",
        ));
    }

    for required in &config.policy.required {
        if config.policy.disabled.contains(required) {
            return Err(ConfigError::invalid_value(
                "policy.disabled",
                format!("'{}' is required and cannot be disabled", required),
            ));
        }
    }

    if !LOG_LEVELS.contains(&config.logging.level.as_str()) {
        return Err(ConfigError::validation(
            "Log level must be one of: trace, debug, info, warn, error",
        ));
    }

    Ok(())
}

/// Parse a backend error code as written in `sync.failure_overrides`
pub fn parse_error_code(code: &str) -> ConfigResult<BackendErrorCode> {
    serde_json::from_value(serde_json::Value::String(code.to_string())).map_err(|_| {
        ConfigError::UnknownErrorCode {
            code: code.to_string(),
        }
    })
}
