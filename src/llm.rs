//! LLM provider abstraction.
//!
//! A small provider-agnostic interface (`LlmService`) with HTTP adapters per
//! provider, a registry keyed by model id, and the role-tagged `Gateway`
//! that the task controllers call.

mod anthropic;
mod error;
mod gateway;
mod openai;
pub mod parse;
mod registry;
mod types;

pub use anthropic::AnthropicService;
pub use error::{LlmError, LlmErrorKind};
pub use gateway::{CallOptions, CallOutcome, Gateway, Role};
pub use openai::OpenAiService;
pub use registry::{LlmConfig, ModelInfo, ModelRegistry};
pub use types::{ChatMessage, LlmRequest, LlmResponse, MessageRole, Usage};

use async_trait::async_trait;
use std::sync::Arc;

/// Common interface for LLM providers.
#[async_trait]
pub trait LlmService: Send + Sync {
    /// Make a completion request.
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError>;

    /// Get the model ID.
    fn model_id(&self) -> &str;
}

/// Logging wrapper for LLM services.
pub struct LoggingService {
    inner: Arc<dyn LlmService>,
    model_id: String,
}

impl LoggingService {
    pub fn new(inner: Arc<dyn LlmService>) -> Self {
        let model_id = inner.model_id().to_string();
        Self { inner, model_id }
    }
}

#[async_trait]
impl LlmService for LoggingService {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        let start = std::time::Instant::now();
        let result = self.inner.complete(request).await;
        let duration = start.elapsed();

        match &result {
            Ok(response) => {
                tracing::info!(
                    model = %self.model_id,
                    duration_ms = %duration.as_millis(),
                    input_tokens = response.usage.input_tokens,
                    output_tokens = response.usage.output_tokens,
                    "LLM request completed"
                );
            }
            Err(e) => {
                tracing::error!(
                    model = %self.model_id,
                    duration_ms = %duration.as_millis(),
                    error = %e.message,
                    retryable = e.kind.is_retryable(),
                    "LLM request failed"
                );
            }
        }

        result
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}
