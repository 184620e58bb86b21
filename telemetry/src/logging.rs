//! Process-wide `tracing` subscriber setup.

use crate::error::{Result, TelemetryError};
use serde::{Deserialize, Serialize};
use tracing_subscriber::{
    fmt::{self, time::ChronoUtc},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Output format of the log stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable, for development
    #[default]
    Text,
    /// One JSON object per line, for production
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogSettings {
    /// Default level for the engine's own crates when `RUST_LOG` is unset
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

impl LogSettings {
    /// The filter used when `RUST_LOG` is not set.
    pub fn default_directives(&self) -> String {
        let level = &self.level;
        format!(
            "rebac_server={level},zanzibar_storage={level},database_layer={level},\
             auth_gateway={level},config_engine={level},tower_http=info,sqlx=warn,hyper=info"
        )
    }
}

/// Install the global subscriber.
///
/// # Errors
///
/// Fails if the level is not a valid filter or a subscriber is already set.
pub fn init_tracing(settings: &LogSettings) -> Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(settings.default_directives())
            .map_err(|e| TelemetryError::Tracing(e.to_string()))?,
    };

    let registry = tracing_subscriber::registry().with(env_filter);
    let installed = match settings.format {
        LogFormat::Text => registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_timer(ChronoUtc::rfc_3339()),
            )
            .try_init(),
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_ansi(false)
                    .json(),
            )
            .try_init(),
    };

    installed.map_err(|e| TelemetryError::Tracing(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parses_lowercase() {
        let format: LogFormat = serde_json::from_str("\"json\"").unwrap();
        assert_eq!(format, LogFormat::Json);
    }

    #[test]
    fn test_default_directives_use_level() {
        let settings = LogSettings {
            level: "debug".to_string(),
            ..LogSettings::default()
        };
        assert!(settings.default_directives().contains("zanzibar_storage=debug"));
    }
}
