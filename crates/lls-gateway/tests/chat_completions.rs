use async_trait::async_trait;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use axum::Router;
use futures::StreamExt;
use lls_gateway::build_router;
use lls_gateway::model::{ActiveModel, ModelSelection};
use lls_gateway::state::AppState;
use lls_local_llm::{
    Accelerator, BackendError, BackendProcess, BackendResult, BackendTag, BinaryDescriptor,
    CapabilityRegistry, CpuTier, DispatchConfig, ExitOutcome, GpuVendor, LaunchSpec,
    ProcessLauncher,
};
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tower::ServiceExt;

// ─────────────────────────────────────────────────────────────────────────────
// Scripted backend
// ─────────────────────────────────────────────────────────────────────────────

struct ScriptedProcess {
    lines: VecDeque<String>,
    exit_code: i32,
    hang: bool,
    killed: Arc<AtomicBool>,
}

#[async_trait]
impl BackendProcess for ScriptedProcess {
    async fn read_line(&mut self) -> std::io::Result<Option<String>> {
        if let Some(line) = self.lines.pop_front() {
            return Ok(Some(line));
        }
        if self.hang && !self.killed.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(None)
    }

    async fn wait(&mut self) -> std::io::Result<ExitOutcome> {
        Ok(ExitOutcome {
            code: Some(self.exit_code),
            success: self.exit_code == 0,
            stderr_tail: if self.exit_code == 0 {
                String::new()
            } else {
                "ggml_cuda_init: failed".to_string()
            },
        })
    }

    async fn kill(&mut self) -> std::io::Result<()> {
        self.killed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct ScriptedLauncher {
    lines: Vec<&'static str>,
    exit_code: i32,
    hang: bool,
    fail: bool,
    killed: Arc<AtomicBool>,
    launched: parking_lot::Mutex<Vec<LaunchSpec>>,
}

impl ScriptedLauncher {
    fn replying(lines: &[&'static str]) -> Self {
        Self {
            lines: lines.to_vec(),
            ..Default::default()
        }
    }

    fn launched(&self) -> Vec<LaunchSpec> {
        self.launched.lock().clone()
    }
}

impl ProcessLauncher for ScriptedLauncher {
    fn launch(&self, spec: &LaunchSpec) -> BackendResult<Box<dyn BackendProcess>> {
        self.launched.lock().push(spec.clone());
        if self.fail {
            return Err(BackendError::LaunchFailed {
                binary: spec.binary.clone(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            });
        }
        Ok(Box::new(ScriptedProcess {
            lines: self.lines.iter().map(|l| l.to_string()).collect(),
            exit_code: self.exit_code,
            hang: self.hang,
            killed: self.killed.clone(),
        }))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn cpu_registry() -> CapabilityRegistry {
    CapabilityRegistry::new(CpuTier::Avx2, 8 << 30).with_binary(BinaryDescriptor::with_tags(
        "/opt/llama/avx2/llama-cli",
        [BackendTag::Avx2],
    ))
}

fn model() -> ActiveModel {
    ActiveModel::new(Some(ModelSelection::new("/models/llama-7b.Q4_0.gguf", 4_000_000_000)))
}

fn app_with(
    registry: CapabilityRegistry,
    active_model: ActiveModel,
    dispatch: DispatchConfig,
    launcher: Arc<ScriptedLauncher>,
) -> Router {
    build_router(Arc::new(AppState::with_launcher(
        registry,
        active_model,
        dispatch,
        launcher,
    )))
}

fn app(launcher: Arc<ScriptedLauncher>) -> Router {
    app_with(cpu_registry(), model(), DispatchConfig::default(), launcher)
}

fn chat_request(body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn hello() -> Value {
    json!({ "messages": [{ "role": "user", "content": "Say hello" }] })
}

async fn json_body(response: axum::response::Response) -> Value {
    let body = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body");
    serde_json::from_slice(&body).expect("json body")
}

/// `data: <json>` payloads of an SSE body, in order.
fn sse_events(body: &str) -> Vec<Value> {
    body.split("\n\n")
        .filter_map(|event| event.trim().strip_prefix("data:"))
        .map(|data| serde_json::from_str(data.trim()).expect("event json"))
        .collect()
}

async fn assert_error(response: axum::response::Response, status: StatusCode, code: &str) {
    assert_eq!(response.status(), status);
    let body = json_body(response).await;
    assert_eq!(body["object"], "error");
    assert_eq!(body["choices"], json!([]));
    assert_eq!(body["error"]["code"], code);
}

// ─────────────────────────────────────────────────────────────────────────────
// Request validation and dispatch failures
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn empty_messages_is_bad_request() {
    let launcher = Arc::new(ScriptedLauncher::replying(&["never"]));
    let response = app(launcher.clone())
        .oneshot(chat_request(json!({ "messages": [] })))
        .await
        .unwrap();

    assert_error(response, StatusCode::BAD_REQUEST, "INVALID_REQUEST").await;
    assert!(launcher.launched().is_empty());
}

#[tokio::test]
async fn missing_messages_is_bad_request() {
    let launcher = Arc::new(ScriptedLauncher::default());
    let response = app(launcher.clone())
        .oneshot(chat_request(json!({ "stream": true })))
        .await
        .unwrap();

    assert_error(response, StatusCode::BAD_REQUEST, "INVALID_REQUEST").await;
    assert!(launcher.launched().is_empty());
}

#[tokio::test]
async fn malformed_body_is_bad_request() {
    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .body(Body::from("{\"messages\": ["))
        .unwrap();
    let response = app(Arc::new(ScriptedLauncher::default()))
        .oneshot(request)
        .await
        .unwrap();

    assert_error(response, StatusCode::BAD_REQUEST, "INVALID_REQUEST").await;
}

#[tokio::test]
async fn no_model_is_failed_dependency() {
    let launcher = Arc::new(ScriptedLauncher::default());
    let app = app_with(
        cpu_registry(),
        ActiveModel::default(),
        DispatchConfig::default(),
        launcher.clone(),
    );
    let response = app.oneshot(chat_request(hello())).await.unwrap();

    assert_error(response, StatusCode::FAILED_DEPENDENCY, "MODEL_NOT_SELECTED").await;
    assert!(launcher.launched().is_empty());
}

#[tokio::test]
async fn no_binary_is_service_unavailable() {
    let registry = CapabilityRegistry::new(CpuTier::Avx2, 8 << 30);
    let app = app_with(
        registry,
        model(),
        DispatchConfig::default(),
        Arc::new(ScriptedLauncher::default()),
    );
    let response = app.oneshot(chat_request(hello())).await.unwrap();

    assert_error(
        response,
        StatusCode::SERVICE_UNAVAILABLE,
        "NO_BACKEND_AVAILABLE",
    )
    .await;
}

#[tokio::test]
async fn launch_failure_is_internal_error() {
    let launcher = Arc::new(ScriptedLauncher {
        fail: true,
        ..Default::default()
    });
    let response = app(launcher).oneshot(chat_request(hello())).await.unwrap();

    assert_error(
        response,
        StatusCode::INTERNAL_SERVER_ERROR,
        "BACKEND_LAUNCH_ERROR",
    )
    .await;
}

// ─────────────────────────────────────────────────────────────────────────────
// Aggregate mode
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn aggregate_returns_joined_completion() {
    let launcher = Arc::new(ScriptedLauncher::replying(&["Hello", " world"]));
    let response = app(launcher.clone())
        .oneshot(chat_request(json!({
            "model": "ignored",
            "messages": [
                { "role": "system", "content": "Be brief." },
                { "role": "user", "content": "Say hello" }
            ],
            "temperature": 0.2,
            "max_tokens": 16
        })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert!(body["id"].as_str().unwrap().starts_with("chatcmpl-"));
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["model"], "llama-7b.Q4_0.gguf");
    assert_eq!(body["choices"][0]["message"]["role"], "assistant");
    assert_eq!(body["choices"][0]["message"]["content"], "Hello world");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
    assert!(body.get("backend_error").is_none());

    let launched = launcher.launched();
    assert_eq!(launched.len(), 1);
    let spec = &launched[0];
    assert_eq!(spec.prompt, "system: Be brief. user: Say hello");
    assert_eq!(spec.temperature, 0.2);
    assert_eq!(spec.max_tokens, 16);
    assert_eq!(spec.binary.to_str(), Some("/opt/llama/avx2/llama-cli"));
}

#[tokio::test]
async fn aggregate_annotates_non_zero_exit() {
    let launcher = Arc::new(ScriptedLauncher {
        lines: vec!["partial answer"],
        exit_code: 1,
        ..Default::default()
    });
    let response = app(launcher).oneshot(chat_request(hello())).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["choices"][0]["message"]["content"], "partial answer");
    assert_eq!(body["backend_error"]["code"], "BACKEND_NON_ZERO_EXIT");
    assert_eq!(body["backend_error"]["exit_code"], 1);
}

#[tokio::test(start_paused = true)]
async fn silent_backend_times_out() {
    let launcher = Arc::new(ScriptedLauncher {
        lines: vec!["Hello"],
        hang: true,
        ..Default::default()
    });
    let mut dispatch = DispatchConfig::default();
    dispatch.liveness_timeout_secs = 2;

    let response = app_with(cpu_registry(), model(), dispatch, launcher.clone())
        .oneshot(chat_request(hello()))
        .await
        .unwrap();

    assert_error(response, StatusCode::GATEWAY_TIMEOUT, "BACKEND_TIMEOUT").await;
    assert!(launcher.killed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn nvidia_host_offloads_to_cuda_binary() {
    let registry = CapabilityRegistry::new(CpuTier::Avx2, 32 << 30)
        .with_accelerator(Accelerator::new(GpuVendor::Intel, "UHD 630", 0))
        .with_accelerator(Accelerator::new(GpuVendor::Nvidia, "RTX 3070", 8_000_000_000))
        .with_binaries([
            BinaryDescriptor::with_tags("/opt/llama/avx2/llama-cli", [BackendTag::Avx2]),
            BinaryDescriptor::with_tags("/opt/llama/cuda/llama-cli", [BackendTag::Cuda]),
        ]);
    let launcher = Arc::new(ScriptedLauncher::replying(&["ok"]));
    let response = app_with(registry, model(), DispatchConfig::default(), launcher.clone())
        .oneshot(chat_request(hello()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let spec = &launcher.launched()[0];
    assert_eq!(spec.binary.to_str(), Some("/opt/llama/cuda/llama-cli"));
    assert_eq!(spec.offload.layer_count, 32);
    let args: Vec<String> = spec
        .to_args()
        .into_iter()
        .map(|a| a.to_string_lossy().into_owned())
        .collect();
    assert!(args.windows(2).any(|w| w == ["--n-gpu-layers", "32"]));
    assert!(!args.iter().any(|a| a == "--mlock"));
}

#[tokio::test]
async fn cpu_build_on_gpu_host_uses_mlock() {
    let registry = CapabilityRegistry::new(CpuTier::Avx2, 32 << 30)
        .with_accelerator(Accelerator::new(GpuVendor::Intel, "Arc A770", 8_000_000_000))
        .with_binary(BinaryDescriptor::with_tags(
            "/opt/llama/avx2/llama-cli",
            [BackendTag::Avx2],
        ));
    let launcher = Arc::new(ScriptedLauncher::replying(&["ok"]));
    let response = app_with(registry, model(), DispatchConfig::default(), launcher.clone())
        .oneshot(chat_request(hello()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let spec = &launcher.launched()[0];
    assert_eq!(spec.binary.to_str(), Some("/opt/llama/avx2/llama-cli"));
    assert_eq!(spec.offload.layer_count, 0);
    assert!(spec.offload.use_memory_lock);
    let args: Vec<String> = spec
        .to_args()
        .into_iter()
        .map(|a| a.to_string_lossy().into_owned())
        .collect();
    assert!(args.iter().any(|a| a == "--mlock"));
    assert!(!args.iter().any(|a| a == "--n-gpu-layers"));
}

// ─────────────────────────────────────────────────────────────────────────────
// Streaming mode
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn stream_sends_line_chunks_then_stop() {
    let launcher = Arc::new(ScriptedLauncher::replying(&["Hello", " world"]));
    let mut body = hello();
    body["stream"] = json!(true);
    let response = app(launcher).oneshot(chat_request(body)).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    assert!(content_type.starts_with("text/event-stream"));
    assert_eq!(
        response.headers().get(header::CACHE_CONTROL).unwrap(),
        "no-cache"
    );

    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let events = sse_events(std::str::from_utf8(&bytes).unwrap());
    assert_eq!(events.len(), 3);

    assert_eq!(events[0]["object"], "chat.completion.chunk");
    assert_eq!(events[0]["choices"][0]["delta"]["content"], "Hello");
    assert_eq!(events[0]["choices"][0]["finish_reason"], Value::Null);
    assert_eq!(events[1]["choices"][0]["delta"]["content"], "world");
    assert_eq!(events[2]["choices"][0]["delta"], json!({}));
    assert_eq!(events[2]["choices"][0]["finish_reason"], "stop");

    let id = &events[0]["id"];
    assert!(events.iter().all(|e| &e["id"] == id));
    assert!(events.iter().all(|e| e["model"] == "llama-7b.Q4_0.gguf"));
}

#[tokio::test]
async fn dropping_stream_kills_backend() {
    let launcher = Arc::new(ScriptedLauncher {
        lines: vec!["Hello"],
        hang: true,
        ..Default::default()
    });
    let mut body = hello();
    body["stream"] = json!(true);
    let response = app(launcher.clone())
        .oneshot(chat_request(body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let mut data = response.into_body().into_data_stream();
    let first = data.next().await.expect("first frame").unwrap();
    assert!(std::str::from_utf8(&first).unwrap().contains("Hello"));
    drop(data);

    for _ in 0..100 {
        if launcher.killed.load(Ordering::SeqCst) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(launcher.killed.load(Ordering::SeqCst));
}

// ─────────────────────────────────────────────────────────────────────────────
// Listing endpoints
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn health_is_ok() {
    let response = app(Arc::new(ScriptedLauncher::default()))
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["status"], "ok");
}

#[tokio::test]
async fn models_lists_active_model() {
    let response = app(Arc::new(ScriptedLauncher::default()))
        .oneshot(Request::builder().uri("/v1/models").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = json_body(response).await;
    assert_eq!(body["object"], "list");
    assert_eq!(body["data"][0]["id"], "llama-7b.Q4_0.gguf");

    let empty = app_with(
        cpu_registry(),
        ActiveModel::default(),
        DispatchConfig::default(),
        Arc::new(ScriptedLauncher::default()),
    )
    .oneshot(Request::builder().uri("/v1/models").body(Body::empty()).unwrap())
    .await
    .unwrap();
    assert_eq!(json_body(empty).await["data"], json!([]));
}

#[tokio::test]
async fn capabilities_reports_selection() {
    let response = app(Arc::new(ScriptedLauncher::default()))
        .oneshot(
            Request::builder()
                .uri("/v1/capabilities")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let body = json_body(response).await;
    assert_eq!(body["cpu_tier"], "avx2");
    assert_eq!(body["preferred_tags"], json!(["avx2"]));
    assert_eq!(body["selected"]["path"], "/opt/llama/avx2/llama-cli");
    assert_eq!(body["selection_error"], Value::Null);
    assert_eq!(body["accelerators"], json!([]));
    assert_eq!(body["binaries"].as_array().unwrap().len(), 1);
    assert_eq!(body["compatible"][0]["path"], "/opt/llama/avx2/llama-cli");
}

#[tokio::test]
async fn models_reports_file_mtime_as_created() {
    let file = tempfile::Builder::new().suffix(".gguf").tempfile().unwrap();
    let response = app_with(
        cpu_registry(),
        ActiveModel::new(Some(ModelSelection::new(file.path(), 0))),
        DispatchConfig::default(),
        Arc::new(ScriptedLauncher::default()),
    )
    .oneshot(Request::builder().uri("/v1/models").body(Body::empty()).unwrap())
    .await
    .unwrap();
    let body = json_body(response).await;
    assert!(body["data"][0]["created"].as_i64().unwrap() > 0);

    // A missing file reports 0.
    let response = app(Arc::new(ScriptedLauncher::default()))
        .oneshot(Request::builder().uri("/v1/models").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(json_body(response).await["data"][0]["created"], 0);
}

// ─────────────────────────────────────────────────────────────────────────────
// Real child processes
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(unix)]
mod with_script {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    fn write_backend(dir: &Path, body: &str) -> std::path::PathBuf {
        let path = dir.join("llama-cli-avx2");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn real_app(dir: &Path, script: &str) -> Router {
        let binary = write_backend(dir, script);
        let model_path = dir.join("tiny.gguf");
        std::fs::write(&model_path, [0u8; 64]).unwrap();

        let registry = CapabilityRegistry::new(CpuTier::Avx2, 8 << 30)
            .with_binary(BinaryDescriptor::from_path(binary));
        let active = ActiveModel::new(Some(ModelSelection::from_file(&model_path).unwrap()));
        build_router(Arc::new(AppState::new(
            registry,
            active,
            DispatchConfig::default(),
        )))
    }

    #[tokio::test]
    async fn aggregate_from_child_process() {
        let dir = tempfile::tempdir().unwrap();
        let app = real_app(dir.path(), "echo Hello\necho ' world'");

        let response = app.oneshot(chat_request(hello())).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["choices"][0]["message"]["content"], "Hello world");
        assert_eq!(body["model"], "tiny.gguf");
    }

    #[tokio::test]
    async fn stream_from_child_process() {
        let dir = tempfile::tempdir().unwrap();
        let app = real_app(dir.path(), "echo Hello\necho ' world'");

        let mut body = hello();
        body["stream"] = json!(true);
        let response = app.oneshot(chat_request(body)).await.unwrap();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let events = sse_events(std::str::from_utf8(&bytes).unwrap());

        let contents: Vec<_> = events
            .iter()
            .map(|e| e["choices"][0]["delta"]["content"].as_str().unwrap_or_default())
            .collect();
        assert_eq!(contents, ["Hello", "world", ""]);
        assert_eq!(events[2]["choices"][0]["finish_reason"], "stop");
    }

    #[tokio::test]
    async fn child_exit_code_is_annotated() {
        let dir = tempfile::tempdir().unwrap();
        let app = real_app(dir.path(), "echo partial\necho 'out of memory' >&2\nexit 2");

        let response = app.oneshot(chat_request(hello())).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["choices"][0]["message"]["content"], "partial");
        assert_eq!(body["backend_error"]["exit_code"], 2);
        assert!(
            body["backend_error"]["message"]
                .as_str()
                .unwrap()
                .contains("out of memory")
        );
    }
}
