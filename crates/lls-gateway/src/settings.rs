//! Layered server settings
//!
//! Sources, lowest to highest precedence: built-in defaults, an optional
//! config file (toml/json/yaml by extension), then `LLS_*` environment
//! variables (`LLS_PORT`, `LLS_BIN_DIR`, `LLS_OFFLOAD_PERCENT`, ...). CLI
//! flags are applied on top by the binary.

use config::{Config, Environment, File};
use lls_local_llm::DispatchConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const ENV_PREFIX: &str = "LLS";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to load settings: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid settings: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServeSettings {
    pub host: String,
    pub port: u16,
    /// Model file served from startup. Without it every chat request
    /// fails with `MODEL_NOT_SELECTED`.
    pub model: Option<PathBuf>,
    pub log_json: bool,
    #[serde(flatten)]
    pub dispatch: DispatchConfig,
}

impl Default for ServeSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 1234,
            model: None,
            log_json: false,
            dispatch: DispatchConfig::default(),
        }
    }
}

impl ServeSettings {
    /// Load from the optional file and the process environment.
    pub fn load(file: Option<&Path>) -> Result<Self, SettingsError> {
        Self::load_with_env(file, None)
    }

    /// Like [`load`](Self::load), but reads environment variables from
    /// `env` instead of the process when given.
    pub fn load_with_env(
        file: Option<&Path>,
        env: Option<HashMap<String, String>>,
    ) -> Result<Self, SettingsError> {
        let mut builder = Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(File::from(path).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .source(env),
        );

        let settings: ServeSettings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.port == 0 {
            return Err(SettingsError::Invalid("port must be > 0".into()));
        }
        self.dispatch
            .validate()
            .map_err(|e| SettingsError::Invalid(e.to_string()))
    }

    pub fn with_port(mut self, port: Option<u16>) -> Self {
        if let Some(port) = port {
            self.port = port;
        }
        self
    }

    pub fn with_model(mut self, model: Option<PathBuf>) -> Self {
        if model.is_some() {
            self.model = model;
        }
        self
    }

    pub fn with_bin_dir(mut self, bin_dir: Option<PathBuf>) -> Self {
        if let Some(dir) = bin_dir {
            self.dispatch.bin_dir = dir;
        }
        self
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
