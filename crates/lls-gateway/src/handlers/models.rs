//! Model and capability listing endpoints
//!
//! GET /v1/models       - OpenAI `list` object with the active model
//! GET /v1/capabilities - host capability snapshot and the binary that
//!                        would serve the next request

use axum::{Json, extract::State, response::IntoResponse};
use lls_local_llm::{
    Accelerator, BinaryDescriptor, CpuTier, SelectionPolicy, list_compatible_binaries,
    preferred_tags, select_binary,
};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use crate::openai::{ModelCard, ModelList};
use crate::state::AppState;

/// GET /v1/models
pub async fn list_models(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut data = Vec::new();
    if let Some(model) = state.active_model.snapshot() {
        data.push(ModelCard {
            id: model.name(),
            object: "model".to_string(),
            created: modified_secs(&model.path).await,
            owned_by: "local".to_string(),
        });
    }

    Json(ModelList {
        object: "list".to_string(),
        data,
    })
}

/// File mtime as Unix seconds, 0 when unavailable.
async fn modified_secs(path: &Path) -> i64 {
    tokio::fs::metadata(path)
        .await
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[derive(Debug, Serialize)]
pub struct CapabilitiesDto {
    pub accelerators: Vec<Accelerator>,
    pub cpu_tier: CpuTier,
    pub system_memory_bytes: u64,
    pub binaries: Vec<BinaryDescriptor>,
    pub compatible: Vec<BinaryDescriptor>,
    pub selection_policy: SelectionPolicy,
    pub preferred_tags: Vec<String>,
    pub selected: Option<BinaryDescriptor>,
    pub selection_error: Option<String>,
}

/// GET /v1/capabilities
pub async fn capabilities(State(state): State<Arc<AppState>>) -> Json<CapabilitiesDto> {
    let registry = state.registry.as_ref();
    let policy = state.dispatch.selection_policy;
    let (selected, selection_error) = match select_binary(registry, policy) {
        Ok(binary) => (Some(binary.clone()), None),
        Err(e) => (None, Some(e.to_string())),
    };

    Json(CapabilitiesDto {
        accelerators: registry.accelerators.clone(),
        cpu_tier: registry.cpu_tier,
        system_memory_bytes: registry.system_memory_bytes,
        binaries: registry.binaries.iter().cloned().collect(),
        compatible: list_compatible_binaries(registry)
            .into_iter()
            .cloned()
            .collect(),
        selection_policy: policy,
        preferred_tags: preferred_tags(registry, policy)
            .iter()
            .map(|t| t.to_string())
            .collect(),
        selected,
        selection_error,
    })
}

/// Build the models router sub-tree
pub fn models_router() -> axum::Router<Arc<AppState>> {
    use axum::routing::get;
    axum::Router::new()
        .route("/v1/models", get(list_models))
        .route("/v1/capabilities", get(capabilities))
}
