//! Gateway server configuration.

use serde::{Deserialize, Serialize};

/// HTTP server settings for the gateway facade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address
    pub host: String,
    /// Bind port
    pub port: u16,
    /// Maximum request body size in bytes
    pub request_body_limit: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            request_body_limit: 10 * 1024 * 1024,
        }
    }
}
