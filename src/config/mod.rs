//! Configuration module for Sift
//!
//! This module handles loading and validating configuration from files and
//! command line arguments.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Validation(String),
}

/// Main configuration structure for Sift
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SiftConfig {
    pub pipeline: PipelineConfig,
    pub rules: RulesConfig,
    pub logging: LoggingConfig,
}

/// Pipeline shape and capacity limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// First-stage dispatcher threads.
    pub load_balancers: usize,
    /// Fast-path worker threads per load balancer.
    pub fps_per_lb: usize,
    /// Capacity of every pipeline queue.
    pub queue_capacity: usize,
    /// Connection-cache capacity per worker.
    pub max_connections_per_fp: usize,
    /// Idle flows older than this are swept from the trackers.
    pub flow_timeout_secs: u64,
}

/// Rule sourcing and matching behavior
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RulesConfig {
    pub rules_file: Option<String>,
    /// When set, only exact domain matches block; substring and wildcard
    /// patterns are ignored.
    pub strict_domain_matching: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_level: String,
    pub log_file: Option<String>,
}

impl Default for SiftConfig {
    fn default() -> Self {
        Self {
            pipeline: PipelineConfig::default(),
            rules: RulesConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            load_balancers: 2,
            fps_per_lb: 2,
            queue_capacity: 10_000,
            max_connections_per_fp: 100_000,
            flow_timeout_secs: 300,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_file: None,
        }
    }
}

impl SiftConfig {
    /// Load configuration from a file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config_str: String = std::fs::read_to_string(path)?;
        let config: SiftConfig = toml::from_str(&config_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pipeline.load_balancers == 0 {
            return Err(ConfigError::Validation(
                "Number of load balancers must be greater than 0".to_string(),
            ));
        }

        if self.pipeline.fps_per_lb == 0 {
            return Err(ConfigError::Validation(
                "Fast paths per load balancer must be greater than 0".to_string(),
            ));
        }

        if self.pipeline.queue_capacity == 0 {
            return Err(ConfigError::Validation(
                "Queue capacity must be greater than 0".to_string(),
            ));
        }

        if self.pipeline.max_connections_per_fp == 0 {
            return Err(ConfigError::Validation(
                "Connection cache capacity must be greater than 0".to_string(),
            ));
        }

        // Reader + writer + LBs + FPs; more threads than cores still runs,
        // it just oversubscribes.
        let thread_total: usize = 2
            + self.pipeline.load_balancers
            + self.pipeline.load_balancers * self.pipeline.fps_per_lb;
        let cores: usize = num_cpus::get();
        if thread_total > cores {
            warn!(
                "Configured {} threads on a {}-core machine",
                thread_total, cores
            );
        }

        Ok(())
    }

    /// Total fast-path worker count.
    pub fn total_fps(&self) -> usize {
        self.pipeline.load_balancers * self.pipeline.fps_per_lb
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = SiftConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.total_fps(), 4);
    }

    #[test]
    fn rejects_zero_thread_counts() {
        let mut config = SiftConfig::default();
        config.pipeline.load_balancers = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Validation(_))
        ));

        let mut config = SiftConfig::default();
        config.pipeline.fps_per_lb = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_partial_toml() {
        let toml_str = r#"
            [pipeline]
            load_balancers = 1
            fps_per_lb = 3

            [rules]
            strict_domain_matching = true
        "#;
        let config: SiftConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.pipeline.load_balancers, 1);
        assert_eq!(config.pipeline.fps_per_lb, 3);
        assert_eq!(config.pipeline.queue_capacity, 10_000);
        assert!(config.rules.strict_domain_matching);
        assert_eq!(config.logging.log_level, "info");
    }
}
