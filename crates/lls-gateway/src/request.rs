//! Validated inference request

use crate::error::{GatewayError, GatewayResult};
use crate::openai::{ChatCompletionRequest, ChatMessage};
use lls_local_llm::flatten_prompt;

pub const DEFAULT_TEMPERATURE: f32 = 0.7;

/// A chat request that passed validation. Built only through
/// [`InferenceRequest::from_body`] or [`TryFrom`].
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    /// Non-positive means "until the model stops".
    pub max_tokens: i64,
    pub stream: bool,
}

impl InferenceRequest {
    /// Parse and validate a raw JSON body.
    pub fn from_body(body: &[u8]) -> GatewayResult<Self> {
        let raw: ChatCompletionRequest = serde_json::from_slice(body)
            .map_err(|e| GatewayError::InvalidRequest(format!("malformed request body: {e}")))?;
        Self::try_from(raw)
    }

    /// Messages flattened into the backend prompt, one `role: content`
    /// entry each, space separated.
    pub fn prompt(&self) -> String {
        flatten_prompt(
            self.messages
                .iter()
                .map(|m| (m.role.as_str(), m.content.as_str())),
        )
    }
}

impl TryFrom<ChatCompletionRequest> for InferenceRequest {
    type Error = GatewayError;

    fn try_from(raw: ChatCompletionRequest) -> GatewayResult<Self> {
        let messages = raw
            .messages
            .ok_or_else(|| GatewayError::InvalidRequest("`messages` is required".into()))?;
        if messages.is_empty() {
            return Err(GatewayError::InvalidRequest(
                "`messages` must not be empty".into(),
            ));
        }

        let temperature = raw.temperature.unwrap_or(DEFAULT_TEMPERATURE);
        if !temperature.is_finite() || temperature < 0.0 {
            return Err(GatewayError::InvalidRequest(format!(
                "`temperature` must be a non-negative number, got {temperature}"
            )));
        }

        Ok(Self {
            messages,
            temperature,
            max_tokens: raw.max_tokens.unwrap_or(-1),
            stream: raw.stream.unwrap_or(false),
        })
    }
}
