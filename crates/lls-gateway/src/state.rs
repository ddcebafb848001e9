//! Shared application state for the gateway server

use crate::model::ActiveModel;
use lls_local_llm::{CapabilityRegistry, ChildProcessLauncher, DispatchConfig, ProcessLauncher};
use std::sync::Arc;

/// State shared across all request handlers
#[derive(Clone)]
pub struct AppState {
    /// Host capabilities and installed binaries, fixed at startup
    pub registry: Arc<CapabilityRegistry>,
    pub active_model: ActiveModel,
    /// Starts one backend process per request
    pub launcher: Arc<dyn ProcessLauncher>,
    pub dispatch: DispatchConfig,
}

impl AppState {
    /// State that spawns real llama.cpp processes.
    pub fn new(registry: CapabilityRegistry, active_model: ActiveModel, dispatch: DispatchConfig) -> Self {
        Self::with_launcher(registry, active_model, dispatch, Arc::new(ChildProcessLauncher))
    }

    pub fn with_launcher(
        registry: CapabilityRegistry,
        active_model: ActiveModel,
        dispatch: DispatchConfig,
        launcher: Arc<dyn ProcessLauncher>,
    ) -> Self {
        Self {
            registry: Arc::new(registry),
            active_model,
            launcher,
            dispatch,
        }
    }
}
