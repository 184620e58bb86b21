//! The service's configuration surface.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use telemetry::{LogFormat, LogSettings};
use validator::{Validate, ValidationError};

/// Every option the service recognises, with its default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct ServiceConfig {
    /// Physical engine name: `memory` or `postgres`
    #[serde(default = "default_datastore_engine")]
    pub datastore_engine: String,

    /// Connection URI for engines that need one
    #[serde(default)]
    pub datastore_uri: Option<String>,

    /// Entries held by the caching reader
    #[serde(default = "default_max_cache_size")]
    #[validate(range(min = 1))]
    pub datastore_max_cache_size: u64,

    /// Reads allowed in flight against the engine at once
    #[serde(default = "default_max_concurrent_reads")]
    #[validate(range(min = 1))]
    pub datastore_max_concurrent_reads: usize,

    #[serde(default = "default_hundred")]
    #[validate(range(min = 1))]
    pub max_tuples_per_write: usize,

    #[serde(default = "default_hundred")]
    #[validate(range(min = 1))]
    pub max_types_per_authorization_model: usize,

    /// Depth limit handed to the resolution logic
    #[serde(default = "default_resolve_node_limit")]
    #[validate(range(min = 1))]
    pub resolve_node_limit: u32,

    #[serde(default)]
    pub changelog_horizon_offset_minutes: u64,

    /// 0 disables the per-request deadline
    #[serde(default)]
    pub request_timeout_ms: u64,

    #[serde(default = "default_hundred")]
    #[validate(range(min = 1))]
    pub changes_page_size: usize,

    /// `none`, `preshared` or `oidc`
    #[serde(default = "default_auth_method")]
    pub auth_method: String,

    #[serde(default)]
    pub preshared_keys: Vec<String>,

    #[serde(default)]
    pub oidc_issuer: Option<String>,

    #[serde(default)]
    pub oidc_audience: Option<String>,

    #[serde(default = "default_http_addr")]
    #[validate(custom(function = "validate_socket_addr"))]
    pub http_addr: String,

    #[serde(default)]
    pub log_format: LogFormat,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_datastore_engine() -> String { "memory".to_string() }
fn default_max_cache_size() -> u64 { 100_000 }
fn default_max_concurrent_reads() -> usize { 100 }
fn default_hundred() -> usize { 100 }
fn default_resolve_node_limit() -> u32 { 25 }
fn default_auth_method() -> String { "none".to_string() }
fn default_http_addr() -> String { "0.0.0.0:8080".to_string() }
fn default_log_level() -> String { "info".to_string() }

fn validate_socket_addr(value: &str) -> Result<(), ValidationError> {
    value
        .parse::<SocketAddr>()
        .map(|_| ())
        .map_err(|_| ValidationError::new("socket_addr"))
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            datastore_engine: default_datastore_engine(),
            datastore_uri: None,
            datastore_max_cache_size: default_max_cache_size(),
            datastore_max_concurrent_reads: default_max_concurrent_reads(),
            max_tuples_per_write: default_hundred(),
            max_types_per_authorization_model: default_hundred(),
            resolve_node_limit: default_resolve_node_limit(),
            changelog_horizon_offset_minutes: 0,
            request_timeout_ms: 0,
            changes_page_size: default_hundred(),
            auth_method: default_auth_method(),
            preshared_keys: Vec::new(),
            oidc_issuer: None,
            oidc_audience: None,
            http_addr: default_http_addr(),
            log_format: LogFormat::default(),
            log_level: default_log_level(),
        }
    }
}

impl ServiceConfig {
    /// Per-request deadline, if one is configured.
    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_ms > 0).then(|| Duration::from_millis(self.request_timeout_ms))
    }

    pub fn changelog_horizon_offset(&self) -> Duration {
        Duration::from_secs(self.changelog_horizon_offset_minutes.saturating_mul(60))
    }

    pub fn log_settings(&self) -> LogSettings {
        LogSettings {
            level: self.log_level.clone(),
            format: self.log_format,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ServiceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.request_timeout(), None);
        assert_eq!(config.changelog_horizon_offset(), Duration::ZERO);
    }

    #[test]
    fn test_zero_bounds_are_rejected() {
        let config = ServiceConfig {
            datastore_max_concurrent_reads: 0,
            ..ServiceConfig::default()
        };
        assert!(config.validate().is_err());

        let config = ServiceConfig {
            datastore_max_cache_size: 0,
            ..ServiceConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_listen_address_is_rejected() {
        let config = ServiceConfig {
            http_addr: "localhost".to_string(),
            ..ServiceConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_durations() {
        let config = ServiceConfig {
            request_timeout_ms: 1500,
            changelog_horizon_offset_minutes: 2,
            ..ServiceConfig::default()
        };
        assert_eq!(config.request_timeout(), Some(Duration::from_millis(1500)));
        assert_eq!(config.changelog_horizon_offset(), Duration::from_secs(120));
    }
}
