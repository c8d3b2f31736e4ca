//! Server configuration from environment variables.
//!
//! Everything is prefixed `WORKSITE_` except provider credentials, which
//! keep their conventional names (`ANTHROPIC_API_KEY`, `OPENAI_API_KEY`,
//! `LLM_GATEWAY`, `TAVILY_API_KEY`). A malformed value is a configuration
//! error, reported before the server touches storage (exit code 2).

use crate::llm::{LlmConfig, Role};
use crate::task::{ControllerConfig, Limits};
use crate::tools::ToolTimeouts;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("configuration error: {0}")]
pub struct ConfigError(pub String);

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub db_path: PathBuf,
    pub workspace_root: PathBuf,
    pub max_concurrent_tasks: usize,
    pub limits: Limits,
    pub llm_retries: u32,
    pub llm_timeout: Duration,
    pub grace_period: Duration,
    pub tool_timeouts: ToolTimeouts,
    /// Default model per role, from `WORKSITE_MODEL_<ROLE>`.
    pub role_models: HashMap<Role, String>,
    pub llm: LlmConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        let data_dir = PathBuf::from(&home).join(".worksite");

        let port = parse_var("WORKSITE_PORT", 8600_u16)?;
        let db_path = std::env::var("WORKSITE_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("worksite.db"));
        let workspace_root = std::env::var("WORKSITE_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("workspaces"));

        let max_concurrent_tasks = parse_var("WORKSITE_MAX_TASKS", 16_usize)?;
        let limits = Limits {
            max_step_retries: parse_var("WORKSITE_MAX_STEP_RETRIES", 2_u32)?,
            max_replans: parse_var("WORKSITE_MAX_REPLANS", 2_u32)?,
        };
        let llm_retries = parse_var("WORKSITE_LLM_RETRIES", 3_u32)?;
        let llm_timeout = Duration::from_secs(parse_var("WORKSITE_LLM_TIMEOUT_SECS", 60_u64)?);
        let grace_period = Duration::from_secs(parse_var("WORKSITE_GRACE_PERIOD_SECS", 5_u64)?);

        let tool_timeouts = ToolTimeouts {
            read_only: Duration::from_secs(parse_var("WORKSITE_TOOL_TIMEOUT_READ_SECS", 30_u64)?),
            writes: Duration::from_secs(parse_var("WORKSITE_TOOL_TIMEOUT_WRITE_SECS", 60_u64)?),
            executes_code: Duration::from_secs(parse_var(
                "WORKSITE_TOOL_TIMEOUT_EXEC_SECS",
                300_u64,
            )?),
        };

        let mut role_models = HashMap::new();
        for role in Role::ALL {
            let var = format!("WORKSITE_MODEL_{}", role.as_str());
            if let Ok(model_id) = std::env::var(&var) {
                if !model_id.is_empty() {
                    role_models.insert(role, model_id);
                }
            }
        }

        Ok(Self {
            port,
            db_path,
            workspace_root,
            max_concurrent_tasks,
            limits,
            llm_retries,
            llm_timeout,
            grace_period,
            tool_timeouts,
            role_models,
            llm: LlmConfig::from_env(),
        })
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            limits: self.limits,
            node_retry_budget: 2,
            llm_timeout: self.llm_timeout,
            grace_period: self.grace_period,
        }
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError(format!("{name} has invalid value '{raw}'"))),
        Err(_) => Ok(default),
    }
}
