//! Configuration for the ReBAC engine
//!
//! Sources are layered in order, later ones winning:
//! - built-in defaults
//! - an optional TOML, YAML or JSON file
//! - environment variables prefixed `REBAC_` (`REBAC_DATASTORE_ENGINE=postgres`,
//!   `REBAC_PRESHARED_KEYS=key-a,key-b`)
//!
//! The merged result is validated before it is returned.
//!
//! # Example
//!
//! ```rust
//! use config_engine::{ConfigFormat, ConfigLoader};
//! use std::collections::HashMap;
//!
//! let config = ConfigLoader::new()
//!     .inline("datastore_max_concurrent_reads = 8", ConfigFormat::Toml)
//!     .env_source(HashMap::new())
//!     .load()
//!     .unwrap();
//! assert_eq!(config.datastore_max_concurrent_reads, 8);
//! assert_eq!(config.datastore_engine, "memory");
//! ```

pub mod error;
pub mod loader;
pub mod settings;

pub use error::{ConfigError, Result};
pub use loader::{ConfigFormat, ConfigLoader, ENV_PREFIX};
pub use settings::ServiceConfig;
