//! `lls-gateway`: OpenAI-compatible HTTP front end for local llama.cpp
//! binaries.
//!
//! Each `POST /v1/chat/completions` request is dispatched onto one child
//! process chosen by [`lls_local_llm`] for the host hardware; the process's
//! stdout lines are framed as a `chat.completion` or as a stream of
//! `chat.completion.chunk` server-sent events.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use lls_gateway::{
//!     model::{ActiveModel, ModelSelection},
//!     server::GatewayServer,
//!     state::AppState,
//! };
//! use lls_local_llm::{CapabilityRegistry, DispatchConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let dispatch = DispatchConfig::new("./data/llama-binaries");
//!     let registry = CapabilityRegistry::assemble(&dispatch).unwrap();
//!     let model = ModelSelection::from_file("./models/llama-7b.gguf").unwrap();
//!
//!     let state = AppState::new(registry, ActiveModel::new(Some(model)), dispatch);
//!     GatewayServer::new("0.0.0.0:1234", state).start().await.unwrap();
//! }
//! ```

pub mod error;
pub mod framer;
pub mod handlers;
pub mod model;
pub mod openai;
pub mod request;
pub mod server;
pub mod settings;
pub mod state;

pub use error::{GatewayError, GatewayResult};
pub use server::{GatewayServer, build_router};
