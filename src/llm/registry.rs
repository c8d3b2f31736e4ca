//! Model registry for managing available LLM providers.

use super::{AnthropicService, LlmService, LoggingService, OpenAiService};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Provider backing a model definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Provider {
    Anthropic,
    OpenAi,
}

impl Provider {
    fn display_name(self) -> &'static str {
        match self {
            Provider::Anthropic => "Anthropic",
            Provider::OpenAi => "OpenAI",
        }
    }
}

struct ModelDef {
    id: &'static str,
    api_name: &'static str,
    provider: Provider,
    description: &'static str,
}

const MODELS: &[ModelDef] = &[
    ModelDef {
        id: "claude-sonnet",
        api_name: "claude-sonnet-4-5",
        provider: Provider::Anthropic,
        description: "Balanced Anthropic model, default for reasoning nodes",
    },
    ModelDef {
        id: "claude-haiku",
        api_name: "claude-haiku-4-5",
        provider: Provider::Anthropic,
        description: "Fast Anthropic model for routing and supervision",
    },
    ModelDef {
        id: "gpt-4o",
        api_name: "gpt-4o",
        provider: Provider::OpenAi,
        description: "OpenAI general-purpose model",
    },
    ModelDef {
        id: "gpt-4o-mini",
        api_name: "gpt-4o-mini",
        provider: Provider::OpenAi,
        description: "Fast OpenAI model for routing and supervision",
    },
];

/// Configuration for LLM providers.
#[derive(Debug, Clone, Default)]
pub struct LlmConfig {
    pub anthropic_api_key: Option<String>,
    pub openai_api_key: Option<String>,
    /// Gateway base URL; when set, provider auth is handled by the gateway.
    pub gateway: Option<String>,
    /// Default model ID.
    pub default_model: Option<String>,
}

impl LlmConfig {
    pub fn from_env() -> Self {
        Self {
            anthropic_api_key: std::env::var("ANTHROPIC_API_KEY").ok(),
            openai_api_key: std::env::var("OPENAI_API_KEY").ok(),
            gateway: std::env::var("LLM_GATEWAY").ok(),
            default_model: std::env::var("DEFAULT_MODEL").ok(),
        }
    }
}

/// Model metadata exposed over `GET /api/models`.
#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub id: String,
    pub provider: String,
    pub description: String,
}

/// Registry of available LLM models, read-only after startup.
pub struct ModelRegistry {
    services: HashMap<String, Arc<dyn LlmService>>,
    default_model: String,
}

impl ModelRegistry {
    pub fn new(config: &LlmConfig) -> Self {
        let mut services: HashMap<String, Arc<dyn LlmService>> = HashMap::new();

        for def in MODELS {
            if let Some(service) = Self::try_create_model(def, config) {
                services.insert(def.id.to_string(), service);
            }
        }

        let default_model = config
            .default_model
            .clone()
            .or_else(|| {
                if services.contains_key("claude-sonnet") {
                    Some("claude-sonnet".to_string())
                } else {
                    let mut ids: Vec<_> = services.keys().cloned().collect();
                    ids.sort();
                    ids.into_iter().next()
                }
            })
            .unwrap_or_else(|| "claude-sonnet".to_string());

        Self {
            services,
            default_model,
        }
    }

    /// Create an empty registry; services are added with [`Self::register`].
    pub fn empty(default_model: impl Into<String>) -> Self {
        Self {
            services: HashMap::new(),
            default_model: default_model.into(),
        }
    }

    /// Register a service under its model id.
    pub fn register(&mut self, service: Arc<dyn LlmService>) {
        self.services.insert(service.model_id().to_string(), service);
    }

    fn try_create_model(def: &ModelDef, config: &LlmConfig) -> Option<Arc<dyn LlmService>> {
        // In gateway mode the gateway handles authentication.
        let api_key = if config.gateway.is_some() {
            "implicit".to_string()
        } else {
            match def.provider {
                Provider::Anthropic => config.anthropic_api_key.as_ref()?,
                Provider::OpenAi => config.openai_api_key.as_ref()?,
            }
            .clone()
        };

        if config.gateway.is_none() && api_key.is_empty() {
            return None;
        }

        let gateway = config.gateway.as_deref();
        let service: Arc<dyn LlmService> = match def.provider {
            Provider::Anthropic => {
                Arc::new(AnthropicService::new(api_key, def.id, def.api_name, gateway).ok()?)
            }
            Provider::OpenAi => {
                Arc::new(OpenAiService::new(api_key, def.id, def.api_name, gateway).ok()?)
            }
        };
        Some(Arc::new(LoggingService::new(service)))
    }

    /// Get a model by ID.
    pub fn get(&self, model_id: &str) -> Option<Arc<dyn LlmService>> {
        self.services.get(model_id).cloned()
    }

    pub fn default_model_id(&self) -> &str {
        &self.default_model
    }

    pub fn has_models(&self) -> bool {
        !self.services.is_empty()
    }

    /// List all available model IDs, sorted.
    pub fn available_models(&self) -> Vec<String> {
        let mut models: Vec<_> = self.services.keys().cloned().collect();
        models.sort();
        models
    }

    /// Detailed metadata for registered models.
    pub fn available_model_info(&self) -> Vec<ModelInfo> {
        let mut infos: Vec<ModelInfo> = MODELS
            .iter()
            .filter(|def| self.services.contains_key(def.id))
            .map(|def| ModelInfo {
                id: def.id.to_string(),
                provider: def.provider.display_name().to_string(),
                description: def.description.to_string(),
            })
            .collect();

        // Models registered outside the static table (tests, plugins) still
        // need to show up.
        for id in self.services.keys() {
            if !MODELS.iter().any(|d| d.id == id.as_str()) {
                infos.push(ModelInfo {
                    id: id.clone(),
                    provider: "Custom".to_string(),
                    description: String::new(),
                });
            }
        }
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }
}
