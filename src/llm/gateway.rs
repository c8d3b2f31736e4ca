//! Role-tagged gateway over the model registry.
//!
//! Every model invocation in the engine goes through [`Gateway::invoke`] so
//! that token usage can be attributed to the reasoning role that spent it.
//! The gateway owns transient-error retries (exponential backoff with
//! jitter); callers own semantic retries (re-prompts, node budgets).

use super::types::{ChatMessage, LlmRequest, LlmResponse, Usage};
use super::{LlmError, LlmErrorKind, ModelRegistry};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Closed set of reasoning roles, used for model selection and token
/// attribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Router,
    Architect,
    Librarian,
    Foreman,
    Worker,
    Supervisor,
    Editor,
    BoardChair,
    BoardExpert,
}

impl Role {
    pub const ALL: [Role; 9] = [
        Role::Router,
        Role::Architect,
        Role::Librarian,
        Role::Foreman,
        Role::Worker,
        Role::Supervisor,
        Role::Editor,
        Role::BoardChair,
        Role::BoardExpert,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Router => "ROUTER",
            Role::Architect => "ARCHITECT",
            Role::Librarian => "LIBRARIAN",
            Role::Foreman => "FOREMAN",
            Role::Worker => "WORKER",
            Role::Supervisor => "SUPERVISOR",
            Role::Editor => "EDITOR",
            Role::BoardChair => "BOARD_CHAIR",
            Role::BoardExpert => "BOARD_EXPERT",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        Role::ALL.iter().copied().find(|r| r.as_str() == s)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Appended to the system prompt when the caller expects JSON of a
    /// particular shape.
    pub schema_hint: Option<String>,
}

/// Result of a successful gateway call.
#[derive(Debug, Clone)]
pub struct CallOutcome {
    pub text: String,
    pub usage: Usage,
    pub model_id: String,
}

/// Uniform call site for model invocations.
pub struct Gateway {
    registry: Arc<ModelRegistry>,
    role_defaults: HashMap<Role, String>,
    max_retries: u32,
}

impl Gateway {
    pub fn new(
        registry: Arc<ModelRegistry>,
        role_defaults: HashMap<Role, String>,
        max_retries: u32,
    ) -> Self {
        Self {
            registry,
            role_defaults,
            max_retries,
        }
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    /// Resolve the model for a role: per-run override, then per-role default
    /// from configuration, then the registry default.
    pub fn resolve_model(&self, role: Role, overrides: &HashMap<Role, String>) -> String {
        overrides
            .get(&role)
            .or_else(|| self.role_defaults.get(&role))
            .cloned()
            .unwrap_or_else(|| self.registry.default_model_id().to_string())
    }

    /// Invoke a model for a role. Transient errors are retried with
    /// exponential backoff until `max_retries` is exhausted; the token is
    /// observed between attempts and during backoff sleeps.
    pub async fn invoke(
        &self,
        role: Role,
        model_id: &str,
        system: &str,
        messages: Vec<ChatMessage>,
        options: &CallOptions,
        cancel: &CancellationToken,
    ) -> Result<CallOutcome, LlmError> {
        let service = self
            .registry
            .get(model_id)
            .ok_or_else(|| LlmError::unknown(format!("model '{model_id}' is not available")))?;

        let mut system = system.to_string();
        if let Some(hint) = &options.schema_hint {
            system.push_str("\n\n");
            system.push_str(hint);
        }

        let request = LlmRequest {
            system,
            messages,
            temperature: options.temperature,
            max_tokens: options.max_tokens,
        };

        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(LlmError::cancelled());
            }
            attempt += 1;

            let result = tokio::select! {
                r = service.complete(&request) => r,
                () = cancel.cancelled() => return Err(LlmError::cancelled()),
            };

            match result {
                Ok(response) => {
                    tracing::debug!(
                        role = %role,
                        model = %model_id,
                        attempt,
                        tokens = response.usage.total(),
                        "gateway call succeeded"
                    );
                    return Ok(self.outcome(model_id, response));
                }
                Err(e) if e.kind.is_retryable() && attempt <= self.max_retries => {
                    let delay = e.retry_after.unwrap_or_else(|| backoff_delay(attempt));
                    tracing::warn!(
                        role = %role,
                        model = %model_id,
                        attempt,
                        delay_ms = %delay.as_millis(),
                        error = %e.message,
                        "transient LLM error, backing off"
                    );
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = cancel.cancelled() => return Err(LlmError::cancelled()),
                    }
                }
                Err(e) if e.kind.is_retryable() => {
                    return Err(LlmError::new(
                        LlmErrorKind::Network,
                        format!("exhausted {attempt} attempts: {}", e.message),
                    ));
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn outcome(&self, model_id: &str, response: LlmResponse) -> CallOutcome {
        CallOutcome {
            text: response.text,
            usage: response.usage,
            model_id: model_id.to_string(),
        }
    }
}

/// Exponential backoff with jitter: 1s, 2s, 4s, ... plus up to 250ms.
fn backoff_delay(attempt: u32) -> Duration {
    let base = Duration::from_secs(1 << (attempt - 1).min(4));
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
    base + jitter
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmService;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Service that fails N times with a retryable error, then succeeds.
    struct FlakyService {
        failures_left: Mutex<u32>,
        calls: Mutex<u32>,
    }

    #[async_trait]
    impl LlmService for FlakyService {
        async fn complete(&self, _request: &LlmRequest) -> Result<LlmResponse, LlmError> {
            *self.calls.lock().unwrap() += 1;
            let mut left = self.failures_left.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                Err(LlmError::server_error("boom").with_retry_after(Duration::from_millis(1)))
            } else {
                Ok(LlmResponse {
                    text: "ok".to_string(),
                    usage: Usage {
                        input_tokens: 10,
                        output_tokens: 5,
                    },
                })
            }
        }

        fn model_id(&self) -> &str {
            "flaky"
        }
    }

    fn gateway_with(service: Arc<dyn LlmService>, max_retries: u32) -> Gateway {
        let mut registry = ModelRegistry::empty("flaky");
        registry.register(service);
        Gateway::new(Arc::new(registry), HashMap::new(), max_retries)
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let service = Arc::new(FlakyService {
            failures_left: Mutex::new(2),
            calls: Mutex::new(0),
        });
        let gateway = gateway_with(service.clone(), 3);

        let outcome = gateway
            .invoke(
                Role::Router,
                "flaky",
                "sys",
                vec![ChatMessage::user("hi")],
                &CallOptions::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.text, "ok");
        assert_eq!(outcome.usage.total(), 15);
        assert_eq!(*service.calls.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn retry_budget_is_bounded() {
        let service = Arc::new(FlakyService {
            failures_left: Mutex::new(100),
            calls: Mutex::new(0),
        });
        let gateway = gateway_with(service.clone(), 2);

        let err = gateway
            .invoke(
                Role::Worker,
                "flaky",
                "sys",
                vec![ChatMessage::user("hi")],
                &CallOptions::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(err.kind.is_retryable());
        // max_retries retries after the first attempt
        assert_eq!(*service.calls.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn cancellation_interrupts_invoke() {
        let service = Arc::new(FlakyService {
            failures_left: Mutex::new(100),
            calls: Mutex::new(0),
        });
        let gateway = gateway_with(service, 10);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = gateway
            .invoke(
                Role::Editor,
                "flaky",
                "sys",
                vec![],
                &CallOptions::default(),
                &cancel,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, LlmErrorKind::Cancelled);
    }

    #[test]
    fn role_round_trips_through_wire_format() {
        for role in Role::ALL {
            assert_eq!(Role::parse(role.as_str()), Some(role));
            let json = serde_json::to_string(&role).unwrap();
            let back: Role = serde_json::from_str(&json).unwrap();
            assert_eq!(back, role);
        }
        assert_eq!(
            serde_json::to_value(Role::BoardChair).unwrap(),
            serde_json::json!("BOARD_CHAIR")
        );
    }

    #[test]
    fn model_resolution_precedence() {
        let mut registry = ModelRegistry::empty("default-model");
        registry.register(Arc::new(FlakyService {
            failures_left: Mutex::new(0),
            calls: Mutex::new(0),
        }));
        let mut defaults = HashMap::new();
        defaults.insert(Role::Router, "role-default".to_string());
        let gateway = Gateway::new(Arc::new(registry), defaults, 1);

        let mut overrides = HashMap::new();
        overrides.insert(Role::Router, "override".to_string());

        assert_eq!(gateway.resolve_model(Role::Router, &overrides), "override");
        assert_eq!(
            gateway.resolve_model(Role::Router, &HashMap::new()),
            "role-default"
        );
        assert_eq!(
            gateway.resolve_model(Role::Editor, &HashMap::new()),
            "default-model"
        );
    }
}
