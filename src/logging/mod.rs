//! Structured logging setup.

use crate::config::{LogFormat, LoggingConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Build filter directives string from LoggingConfig
///
/// Constructs a tracing filter string that includes the base log level
/// and any component-specific log levels configured in the LoggingConfig.
///
/// # Examples
///
/// ```
/// use sollol::config::LoggingConfig;
/// use sollol::logging::build_filter_directives;
/// use std::collections::HashMap;
///
/// let mut component_levels = HashMap::new();
/// component_levels.insert("routing".to_string(), "debug".to_string());
///
/// let config = LoggingConfig {
///     level: "info".to_string(),
///     component_levels: Some(component_levels),
///     ..Default::default()
/// };
///
/// assert_eq!(build_filter_directives(&config), "info,sollol::routing=debug");
/// ```
pub fn build_filter_directives(config: &LoggingConfig) -> String {
    let mut filter_str = config.level.clone();

    if let Some(component_levels) = &config.component_levels {
        let mut entries: Vec<_> = component_levels.iter().collect();
        entries.sort();
        for (component, level) in entries {
            filter_str.push_str(&format!(",sollol::{}={}", component, level));
        }
    }

    filter_str
}

/// Initialize the global tracing subscriber from configuration.
///
/// `RUST_LOG` wins over the configured level when set.
pub fn init_tracing(config: &LoggingConfig) -> Result<(), Box<dyn std::error::Error>> {
    let filter_str = build_filter_directives(config);

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    match config.format {
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .try_init()?;
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()?;
        }
    }

    Ok(())
}
