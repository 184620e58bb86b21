//! Layered loading: serde defaults, then an optional file, then environment.

use crate::error::Result;
use crate::settings::ServiceConfig;
use config::{Config, Environment, File, FileFormat};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::debug;
use validator::Validate;

/// Prefix of every environment variable the service reads.
pub const ENV_PREFIX: &str = "REBAC";

/// Keys whose environment value is a comma separated list.
const LIST_KEYS: [&str; 1] = ["preshared_keys"];

/// Format of inline configuration text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Toml,
    Yaml,
    Json,
}

impl From<ConfigFormat> for FileFormat {
    fn from(format: ConfigFormat) -> Self {
        match format {
            ConfigFormat::Toml => FileFormat::Toml,
            ConfigFormat::Yaml => FileFormat::Yaml,
            ConfigFormat::Json => FileFormat::Json,
        }
    }
}

/// Builds a validated [`ServiceConfig`].
#[derive(Debug, Default)]
pub struct ConfigLoader {
    file: Option<PathBuf>,
    inline: Option<(String, ConfigFormat)>,
    env: Option<HashMap<String, String>>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Layer a configuration file; a missing file is skipped.
    pub fn file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    /// Layer configuration text, applied after the file.
    pub fn inline(mut self, content: &str, format: ConfigFormat) -> Self {
        self.inline = Some((content.to_string(), format));
        self
    }

    /// Read environment overrides from `vars` instead of the process environment.
    pub fn env_source(mut self, vars: HashMap<String, String>) -> Self {
        self.env = Some(vars);
        self
    }

    /// # Errors
    ///
    /// [`crate::ConfigError::Load`] for unreadable or mistyped sources and
    /// [`crate::ConfigError::Validation`] for out of range values.
    pub fn load(self) -> Result<ServiceConfig> {
        let mut builder = Config::builder();

        if let Some(path) = &self.file {
            debug!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(File::from(path.as_path()).required(false));
        }
        if let Some((content, format)) = &self.inline {
            builder = builder.add_source(File::from_str(content, FileFormat::from(*format)));
        }

        let mut environment = Environment::with_prefix(ENV_PREFIX)
            .try_parsing(true)
            .list_separator(",");
        for key in LIST_KEYS {
            environment = environment.with_list_parse_key(key);
        }
        if let Some(vars) = self.env {
            environment = environment.source(Some(vars.into_iter().collect()));
        }
        builder = builder.add_source(environment);

        let config: ServiceConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }
}
