//! Chat completions endpoint
//!
//! POST /v1/chat/completions - run one backend process per request and
//! return its output as a `chat.completion` or an SSE stream of
//! `chat.completion.chunk` events

use axum::{
    Json,
    body::Bytes,
    extract::State,
    http::header,
    response::{IntoResponse, Response, Sse, sse::Event},
};
use lls_local_llm::{LaunchSpec, offload_accelerator, plan_offload, select_binary};
use std::sync::Arc;
use tokio_stream::{StreamExt, wrappers::ReceiverStream};

use crate::error::{GatewayError, GatewayResult};
use crate::framer::{CompletionFramer, aggregate, spawn_stream};
use crate::request::InferenceRequest;
use crate::state::AppState;

/// POST /v1/chat/completions
///
/// The body is parsed by hand rather than through the `Json` extractor so
/// that malformed input gets the same error envelope as every other
/// failure.
pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> GatewayResult<Response> {
    let request = InferenceRequest::from_body(&body)?;

    // One snapshot per request; later model changes don't affect it.
    let model = state
        .active_model
        .snapshot()
        .ok_or(GatewayError::ModelNotSelected)?;

    let binary = select_binary(&state.registry, state.dispatch.selection_policy)?;
    let offload = plan_offload(
        offload_accelerator(&state.registry, binary),
        state.registry.system_memory_bytes,
        model.size_bytes,
        state.dispatch.total_layers,
        state.dispatch.offload_percent,
    );

    let spec = LaunchSpec::new(&binary.path, &model.path, request.prompt())
        .with_temperature(request.temperature)
        .with_max_tokens(request.max_tokens)
        .with_offload(offload)
        .with_extra_args(state.dispatch.extra_args.clone());
    let process = state.launcher.launch(&spec)?;

    let framer = CompletionFramer::new(model.name());
    let liveness = state.dispatch.liveness_timeout();
    tracing::info!(
        id = %framer.id(),
        model = %model.name(),
        binary = %binary.path.display(),
        stream = request.stream,
        messages = request.messages.len(),
        "chat completion started"
    );

    if request.stream {
        let chunks = ReceiverStream::new(spawn_stream(framer, process, liveness))
            .map(|chunk| Event::default().json_data(&chunk));
        Ok(([(header::CACHE_CONTROL, "no-cache")], Sse::new(chunks)).into_response())
    } else {
        let completion = aggregate(framer, process, liveness).await?;
        Ok(Json(completion).into_response())
    }
}

/// Build the chat router sub-tree
pub fn chat_router() -> axum::Router<Arc<AppState>> {
    use axum::routing::post;
    axum::Router::new().route("/v1/chat/completions", post(chat_completions))
}
