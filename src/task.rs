//! Task orchestration: per-task controllers and the manager that owns them.

mod controller;
mod effect;
mod event;
mod nodes;
mod state;
mod transition;

#[cfg(test)]
mod testing;

pub use controller::{ControllerConfig, TaskController};
pub use event::{ResumeDecision, ResumeInput, RunEvent};
pub use state::RunState;
pub use transition::Limits;

use crate::bus::EventBus;
use crate::error::ErrorKind;
use crate::llm::{Gateway, Role};
use crate::store::{StoreError, TaskRecord, TaskSnapshot, TaskStatus};
use crate::tools::ToolRegistry;
use crate::workspace::WorkspaceManager;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex as StdMutex};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

const CONTROLLER_CHANNEL_CAPACITY: usize = 32;

/// User-facing rejection from the manager: a taxonomy kind plus detail.
#[derive(Debug, Error)]
#[error("{detail}")]
pub struct TaskError {
    pub kind: ErrorKind,
    pub detail: String,
}

impl TaskError {
    fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

impl From<StoreError> for TaskError {
    fn from(e: StoreError) -> Self {
        Self::new(e.error_kind(), e.to_string())
    }
}

/// Handle to a live controller.
struct TaskHandle {
    tx: mpsc::Sender<RunEvent>,
    cancel: Arc<StdMutex<CancellationToken>>,
}

/// Owns all task controllers in the process.
pub struct TaskManager {
    bus: Arc<EventBus>,
    gateway: Arc<Gateway>,
    tools: Arc<ToolRegistry>,
    workspaces: WorkspaceManager,
    cfg: ControllerConfig,
    max_concurrent_tasks: usize,
    active: RwLock<HashMap<String, TaskHandle>>,
}

impl TaskManager {
    pub fn new(
        bus: Arc<EventBus>,
        gateway: Arc<Gateway>,
        tools: Arc<ToolRegistry>,
        workspaces: WorkspaceManager,
        cfg: ControllerConfig,
        max_concurrent_tasks: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            gateway,
            tools,
            workspaces,
            cfg,
            max_concurrent_tasks,
            active: RwLock::new(HashMap::new()),
        })
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    // ==================== Task lifecycle ====================

    /// Create a task (idempotent on id).
    pub fn create_task(
        &self,
        task_id: Option<String>,
        name: Option<String>,
    ) -> Result<TaskRecord, TaskError> {
        let id = task_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let workspace = self
            .workspaces
            .create(&id)
            .map_err(|e| TaskError::new(ErrorKind::InvalidArguments, e.to_string()))?;
        let name =
            name.unwrap_or_else(|| format!("task-{}", id.chars().take(8).collect::<String>()));
        let record = self.bus.store().create_task(
            &id,
            &name,
            &workspace.root().to_string_lossy(),
        )?;
        Ok(record)
    }

    pub fn rename_task(&self, task_id: &str, name: &str) -> Result<(), TaskError> {
        self.bus.store().rename_task(task_id, name)?;
        Ok(())
    }

    /// Delete a task: stop its run, drop its controller, remove its
    /// workspace and its whole event log.
    pub async fn delete_task(&self, task_id: &str) -> Result<(), TaskError> {
        let record = self.bus.store().get_task(task_id)?;
        if record.status.is_busy() {
            let _ = self.stop(task_id).await;
        }
        self.active.write().await.remove(task_id);
        self.bus.forget(task_id).await;
        self.workspaces
            .destroy(task_id)
            .map_err(|e| TaskError::new(ErrorKind::StorageError, e.to_string()))?;
        self.bus.store().delete_task(task_id)?;
        Ok(())
    }

    pub fn list_tasks(&self) -> Result<Vec<TaskRecord>, TaskError> {
        Ok(self.bus.store().list_tasks()?)
    }

    pub fn snapshot(&self, task_id: &str) -> Result<TaskSnapshot, TaskError> {
        Ok(self.bus.store().snapshot(task_id)?)
    }

    // ==================== Run commands ====================

    /// Start a run on an idle task.
    pub async fn run_agent(
        &self,
        task_id: &str,
        prompt: &str,
        llm_config: HashMap<Role, String>,
        enabled_tools: Vec<String>,
    ) -> Result<(), TaskError> {
        let record = self.bus.store().get_task(task_id)?;
        if record.status.is_busy() {
            return Err(TaskError::new(
                ErrorKind::TaskBusy,
                "task already has a run in flight; stop it or wait",
            ));
        }
        if prompt.trim().is_empty() {
            return Err(TaskError::new(ErrorKind::InvalidArguments, "prompt is empty"));
        }

        let busy = self
            .bus
            .store()
            .list_tasks()?
            .iter()
            .filter(|t| t.status.is_busy())
            .count();
        if busy >= self.max_concurrent_tasks {
            return Err(TaskError::new(
                ErrorKind::TaskBusy,
                format!("at capacity: {busy} concurrent runs"),
            ));
        }

        let known = self.tools.names();
        let unknown: Vec<&String> = enabled_tools.iter().filter(|t| !known.contains(*t)).collect();
        if !unknown.is_empty() {
            return Err(TaskError::new(
                ErrorKind::InvalidArguments,
                format!("unknown tools in enabled_tools: {unknown:?}"),
            ));
        }
        for model_id in llm_config.values() {
            if self.gateway.registry().get(model_id).is_none() {
                return Err(TaskError::new(
                    ErrorKind::InvalidArguments,
                    format!("unknown model id '{model_id}' in llm_config"),
                ));
            }
        }

        let enabled: BTreeSet<String> = if enabled_tools.is_empty() {
            known
        } else {
            enabled_tools.into_iter().collect()
        };

        self.send(
            task_id,
            RunEvent::RunRequested {
                prompt: prompt.to_string(),
                role_models: llm_config,
                enabled_tools: enabled,
            },
        )
        .await
    }

    /// Resume a suspended run with a human decision.
    pub async fn resume(&self, task_id: &str, input: ResumeInput) -> Result<(), TaskError> {
        let record = self.bus.store().get_task(task_id)?;
        if record.status != TaskStatus::AwaitingInput || record.pending_interrupt.is_none() {
            return Err(TaskError::new(
                ErrorKind::NoPendingInterrupt,
                "task is not awaiting input",
            ));
        }

        if input.decision == ResumeDecision::Modify {
            let Some(plan) = &input.modified_plan else {
                return Err(TaskError::new(
                    ErrorKind::PlanInvalid,
                    "modify decision requires modified_plan",
                ));
            };

            // Rehydrate the suspended run to learn which gate is open and
            // which tools the run may use.
            let run_state: Option<RunState> = record
                .run_state
                .as_ref()
                .and_then(|v| serde_json::from_value(v.clone()).ok());
            let Some(run_state) = run_state else {
                return Err(TaskError::new(
                    ErrorKind::StorageError,
                    "suspended run state is missing or corrupt",
                ));
            };
            if matches!(run_state, RunState::AwaitingBoardApproval { .. }) {
                return Err(TaskError::new(
                    ErrorKind::PlanInvalid,
                    "the board roster gate does not accept a modified plan",
                ));
            }
            let enabled = run_state
                .run_ctx()
                .map(|r| r.enabled_tools.clone())
                .unwrap_or_default();
            plan.validate(&enabled)
                .map_err(|e| TaskError::new(ErrorKind::PlanInvalid, e.to_string()))?;
        }

        self.send(task_id, RunEvent::ResumeReceived { input }).await
    }

    /// Stop a live run. No-op on tasks without one.
    pub async fn stop(&self, task_id: &str) -> Result<(), TaskError> {
        let record = self.bus.store().get_task(task_id)?;
        if !record.status.is_busy() {
            return Ok(());
        }

        if record.status == TaskStatus::Running {
            self.bus
                .store()
                .update_status(task_id, TaskStatus::Cancelling)?;
        }

        // Fire the run's token first so an in-flight LLM/tool call aborts,
        // then queue the stop for the state machine. A controller that is
        // gone (process restarted with a suspended gate) is respawned by
        // `send` and finishes the cancellation from its rehydrated state.
        {
            let active = self.active.read().await;
            if let Some(handle) = active.get(task_id) {
                handle
                    .cancel
                    .lock()
                    .expect("cancel cell poisoned")
                    .cancel();
            }
        }

        self.send(task_id, RunEvent::StopRequested).await
    }

    // ==================== Controller plumbing ====================

    async fn send(&self, task_id: &str, event: RunEvent) -> Result<(), TaskError> {
        let tx = self.get_or_spawn(task_id).await?;
        tx.send(event)
            .await
            .map_err(|e| TaskError::new(ErrorKind::Bug, format!("controller channel closed: {e}")))
    }

    async fn get_or_spawn(&self, task_id: &str) -> Result<mpsc::Sender<RunEvent>, TaskError> {
        {
            let active = self.active.read().await;
            if let Some(handle) = active.get(task_id) {
                return Ok(handle.tx.clone());
            }
        }

        let record = self.bus.store().get_task(task_id)?;

        // Rehydrate a suspended run; anything else starts idle (interrupted
        // mid-flight runs were reset at startup).
        let initial_state: RunState = record
            .run_state
            .as_ref()
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();

        let workspace = self
            .workspaces
            .handle(task_id)
            .map_err(|e| TaskError::new(ErrorKind::StorageError, e.to_string()))?;

        let mut active = self.active.write().await;
        if let Some(handle) = active.get(task_id) {
            return Ok(handle.tx.clone());
        }

        let (tx, rx) = mpsc::channel(CONTROLLER_CHANNEL_CAPACITY);
        let cancel = Arc::new(StdMutex::new(CancellationToken::new()));

        let controller = TaskController::new(
            task_id.to_string(),
            initial_state,
            record.pending_interrupt.clone(),
            self.cfg.clone(),
            Arc::clone(&self.bus),
            Arc::clone(&self.gateway),
            Arc::clone(&self.tools),
            workspace,
            Arc::clone(&cancel),
            rx,
        );

        let id = task_id.to_string();
        tokio::spawn(async move {
            controller.run().await;
            tracing::debug!(task_id = %id, "controller task finished");
        });

        active.insert(task_id.to_string(), TaskHandle { tx: tx.clone(), cancel });
        Ok(tx)
    }
}
