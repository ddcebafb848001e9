//! Dispatch configuration: where binaries live and how requests map onto them

use crate::error::{BackendError, BackendResult};
use crate::hardware::Accelerator;
use crate::selector::SelectionPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Settings consumed by binary discovery, selection, offload and launching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Directory holding llama.cpp builds (loose executables or extracted
    /// release folders).
    pub bin_dir: PathBuf,

    /// File names looked up inside extracted release folders.
    pub executable_names: Vec<String>,

    pub selection_policy: SelectionPolicy,

    /// Share of accelerator memory the model may use, 0–100.
    pub offload_percent: f64,

    /// Layer count of the served model.
    pub total_layers: u32,

    /// Seconds without a stdout line before the backend is killed.
    pub liveness_timeout_secs: u64,

    /// Arguments appended to every backend invocation.
    pub extra_args: Vec<String>,

    /// Use this accelerator list instead of probing the host.
    pub accelerators: Option<Vec<Accelerator>>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            bin_dir: PathBuf::from("./data/llama-binaries"),
            executable_names: ["llama-cli", "llama-cli.exe", "main", "main.exe"]
                .into_iter()
                .map(String::from)
                .collect(),
            selection_policy: SelectionPolicy::Strict,
            offload_percent: 90.0,
            total_layers: 32,
            liveness_timeout_secs: 120,
            extra_args: Vec::new(),
            accelerators: None,
        }
    }
}

impl DispatchConfig {
    pub fn new(bin_dir: impl Into<PathBuf>) -> Self {
        Self {
            bin_dir: bin_dir.into(),
            ..Default::default()
        }
    }

    pub fn with_selection_policy(mut self, policy: SelectionPolicy) -> Self {
        self.selection_policy = policy;
        self
    }

    pub fn with_offload_percent(mut self, percent: f64) -> Result<Self, &'static str> {
        if !(0.0..=100.0).contains(&percent) {
            return Err("offload_percent must be between 0 and 100");
        }
        self.offload_percent = percent;
        Ok(self)
    }

    pub fn with_total_layers(mut self, layers: u32) -> Self {
        self.total_layers = layers;
        self
    }

    pub fn with_liveness_timeout(mut self, timeout: Duration) -> Result<Self, &'static str> {
        if timeout.is_zero() {
            return Err("liveness timeout must be > 0");
        }
        self.liveness_timeout_secs = timeout.as_secs().max(1);
        Ok(self)
    }

    pub fn with_accelerators(mut self, accelerators: Vec<Accelerator>) -> Self {
        self.accelerators = Some(accelerators);
        self
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.liveness_timeout_secs)
    }

    /// Reject values a deserialized config could carry but the builders
    /// would refuse.
    pub fn validate(&self) -> BackendResult<()> {
        if !(0.0..=100.0).contains(&self.offload_percent) {
            return Err(BackendError::InvalidConfig(format!(
                "offload_percent must be between 0 and 100, got {}",
                self.offload_percent
            )));
        }
        if self.liveness_timeout_secs == 0 {
            return Err(BackendError::InvalidConfig(
                "liveness_timeout_secs must be > 0".into(),
            ));
        }
        if self.executable_names.is_empty() {
            return Err(BackendError::InvalidConfig(
                "executable_names must not be empty".into(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
