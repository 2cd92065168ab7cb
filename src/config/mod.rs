//! Configuration module for SOLLOL
//!
//! Provides layered configuration loading from files, environment variables, and defaults.

pub mod backend;
pub mod dispatch;
pub mod error;
pub mod exclusion;
pub mod health;
pub mod logging;
pub mod metrics;
pub mod queue;
pub mod server;

pub use backend::{BackendEntry, CoordinatorConfig};
pub use dispatch::DispatchConfig;
pub use error::ConfigError;
pub use exclusion::ExclusionConfig;
pub use health::{HealthConfig, ProbeIntervals};
pub use logging::{LogFormat, LoggingConfig};
pub use metrics::MetricsConfig;
pub use queue::QueueConfig;
pub use server::ServerConfig;

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration struct that holds all sub-configurations
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SollolConfig {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub backends: Vec<BackendEntry>,
    pub queue: QueueConfig,
    pub dispatch: DispatchConfig,
    pub health: HealthConfig,
    pub metrics: MetricsConfig,
    pub exclusion: ExclusionConfig,
    pub coordinator: Option<CoordinatorConfig>,
}

impl SollolConfig {
    /// Load configuration from a TOML file
    ///
    /// If path is None, returns default configuration.
    /// If path doesn't exist, returns NotFound error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(p) => {
                if !p.exists() {
                    return Err(ConfigError::NotFound(p.to_path_buf()));
                }
                let content = std::fs::read_to_string(p)?;
                toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
            }
            None => Ok(Self::default()),
        }
    }

    /// Apply environment variable overrides
    ///
    /// Supports SOLLOL_* environment variables for common settings.
    /// Invalid values are silently ignored (defaults are kept).
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(port) = std::env::var("SOLLOL_PORT") {
            if let Ok(p) = port.parse() {
                self.server.port = p;
            }
        }
        if let Ok(host) = std::env::var("SOLLOL_HOST") {
            self.server.host = host;
        }

        if let Ok(level) = std::env::var("SOLLOL_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("SOLLOL_LOG_FORMAT") {
            if let Ok(f) = format.parse() {
                self.logging.format = f;
            }
        }

        if let Ok(health) = std::env::var("SOLLOL_HEALTH_CHECK") {
            self.health.enabled = health.to_lowercase() == "true";
        }

        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::Validation {
                field: "server.port".to_string(),
                message: "port must be non-zero".to_string(),
            });
        }

        for (i, backend) in self.backends.iter().enumerate() {
            if backend.host.is_empty() {
                return Err(ConfigError::Validation {
                    field: format!("backends[{}].host", i),
                    message: "host cannot be empty".to_string(),
                });
            }
            if backend.port == 0 {
                return Err(ConfigError::Validation {
                    field: format!("backends[{}].port", i),
                    message: "port must be non-zero".to_string(),
                });
            }
        }

        if self.dispatch.max_retries == 0 {
            return Err(ConfigError::Validation {
                field: "dispatch.max_retries".to_string(),
                message: "at least one dispatch attempt is required".to_string(),
            });
        }

        if self.dispatch.per_backend_concurrency == 0 {
            return Err(ConfigError::Validation {
                field: "dispatch.per_backend_concurrency".to_string(),
                message: "per-backend concurrency must be at least 1".to_string(),
            });
        }

        if !(0.0..=1.0).contains(&self.metrics.sampling_rate_info) {
            return Err(ConfigError::Validation {
                field: "metrics.sampling_rate_info".to_string(),
                message: "sampling rate must be within [0, 1]".to_string(),
            });
        }

        if self.exclusion.backoff_schedule_ms.is_empty() {
            return Err(ConfigError::Validation {
                field: "exclusion.backoff_schedule_ms".to_string(),
                message: "backoff schedule cannot be empty".to_string(),
            });
        }

        Ok(())
    }
}
