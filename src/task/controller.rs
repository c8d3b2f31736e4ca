//! Task controller: executes the node graph for one task.
//!
//! The controller owns the task's run state and processes events from a
//! single channel: user commands arrive from the session layer, node and
//! tool completions are generated by executing effects. Each event goes
//! through the pure transition function; the resulting effects are executed
//! inline, in order, so everything a task does is serialized and every event
//! lands on the log in causal order.

use super::effect::{Effect, Node};
use super::event::RunEvent;
use super::nodes::{self, NodeCall};
use super::state::RunState;
use super::transition::{transition, Limits};
use crate::bus::EventBus;
use crate::error::ErrorKind;
use crate::events::EventPayload;
use crate::llm::{CallOutcome, ChatMessage, Gateway, LlmErrorKind};
use crate::plan::{Evaluation, StepOutcome, ToolCall};
use crate::store::PendingInterrupt;
use crate::tools::{ToolContext, ToolError, ToolInfo, ToolRegistry};
use crate::workspace::WorkspaceHandle;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Controller-level configuration.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub limits: Limits,
    /// Node-level retries after the gateway's own retry budget is spent.
    pub node_retry_budget: u32,
    /// Wall-clock budget per LLM node call.
    pub llm_timeout: Duration,
    /// How long a cancelled in-flight operation may drain before being
    /// abandoned.
    pub grace_period: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            limits: Limits::default(),
            node_retry_budget: 2,
            llm_timeout: Duration::from_secs(60),
            grace_period: Duration::from_secs(5),
        }
    }
}

pub struct TaskController {
    task_id: String,
    state: RunState,
    pending_interrupt: Option<PendingInterrupt>,
    cfg: ControllerConfig,
    bus: Arc<EventBus>,
    gateway: Arc<Gateway>,
    tools: Arc<ToolRegistry>,
    tool_infos: Vec<ToolInfo>,
    workspace: WorkspaceHandle,
    /// Current run's token; replaced at run start. The manager holds the
    /// same cell so `stop` can fire it without going through the queue.
    cancel_cell: Arc<Mutex<CancellationToken>>,
    cancel: CancellationToken,
    rx: mpsc::Receiver<RunEvent>,
}

impl TaskController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        task_id: String,
        initial_state: RunState,
        pending_interrupt: Option<PendingInterrupt>,
        cfg: ControllerConfig,
        bus: Arc<EventBus>,
        gateway: Arc<Gateway>,
        tools: Arc<ToolRegistry>,
        workspace: WorkspaceHandle,
        cancel_cell: Arc<Mutex<CancellationToken>>,
        rx: mpsc::Receiver<RunEvent>,
    ) -> Self {
        let cancel = cancel_cell.lock().expect("cancel cell poisoned").clone();
        let tool_infos = tools.list();
        Self {
            task_id,
            state: initial_state,
            pending_interrupt,
            cfg,
            bus,
            gateway,
            tools,
            tool_infos,
            workspace,
            cancel_cell,
            cancel,
            rx,
        }
    }

    pub async fn run(mut self) {
        tracing::info!(task_id = %self.task_id, "task controller started");

        while let Some(event) = self.rx.recv().await {
            self.process_event(event).await;
        }

        tracing::info!(task_id = %self.task_id, "task controller stopped");
    }

    /// Run one event through the transition function and execute its
    /// effects; effects that launch work push their completion back onto the
    /// local queue, so a whole node chain drains before the next external
    /// command is read.
    async fn process_event(&mut self, event: RunEvent) {
        let mut queue = VecDeque::from([event]);

        while let Some(current) = queue.pop_front() {
            if matches!(current, RunEvent::RunRequested { .. }) && !self.state.is_active() {
                self.fresh_cancel_token();
            }
            let is_storage_failure = matches!(
                &current,
                RunEvent::NodeFailed {
                    kind: ErrorKind::StorageError,
                    ..
                }
            );

            let result = match transition(&self.state, &self.cfg.limits, current) {
                Ok(r) => r,
                Err(e) => {
                    // The session layer validates commands before they reach
                    // us, so a rejection here is a race or a bug; either
                    // way the run state is untouched.
                    tracing::warn!(task_id = %self.task_id, error = %e, "transition rejected");
                    continue;
                }
            };

            self.state = result.new_state;

            for effect in result.effects {
                match self.execute_effect(effect).await {
                    Ok(Some(next)) => queue.push_back(next),
                    Ok(None) => {}
                    Err(detail) => {
                        tracing::error!(task_id = %self.task_id, error = %detail, "effect failed");
                        if !is_storage_failure {
                            queue.push_back(RunEvent::NodeFailed {
                                kind: ErrorKind::StorageError,
                                detail,
                            });
                        }
                        break;
                    }
                }
            }
        }
    }

    fn fresh_cancel_token(&mut self) {
        let token = CancellationToken::new();
        *self.cancel_cell.lock().expect("cancel cell poisoned") = token.clone();
        self.cancel = token;
    }

    async fn execute_effect(&mut self, effect: Effect) -> Result<Option<RunEvent>, String> {
        match effect {
            Effect::Emit(payload) => {
                self.bus
                    .append(&self.task_id, payload)
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(None)
            }

            Effect::SetStatus(status) => {
                self.bus
                    .store()
                    .update_status(&self.task_id, status)
                    .map_err(|e| e.to_string())?;
                Ok(None)
            }

            Effect::PersistRun => {
                let state_json = if self.state.is_active() {
                    Some(serde_json::to_value(&self.state).map_err(|e| e.to_string())?)
                } else {
                    None
                };
                self.bus
                    .store()
                    .update_run_state(
                        &self.task_id,
                        state_json.as_ref(),
                        self.pending_interrupt.as_ref(),
                    )
                    .map_err(|e| e.to_string())?;
                Ok(None)
            }

            Effect::StoreInterrupt(interrupt) => {
                self.pending_interrupt = Some(interrupt);
                Ok(None)
            }

            Effect::ClearInterrupt => {
                self.pending_interrupt = None;
                Ok(None)
            }

            Effect::RunNode(node) => Ok(Some(self.run_node(node).await)),

            Effect::HydrateStep => Ok(Some(self.hydrate_step())),

            Effect::InvokeTool { call } => Ok(Some(self.invoke_tool(call).await)),
        }
    }

    // ==================== Foreman ====================

    /// Deterministic placeholder hydration; no model involved.
    fn hydrate_step(&self) -> RunEvent {
        let RunState::Hydrating { exec, .. } = &self.state else {
            return RunEvent::NodeFailed {
                kind: ErrorKind::Bug,
                detail: format!("hydrate requested in state {:?}", self.state),
            };
        };

        let step = exec.current_step();
        let outputs = exec.plan.completed_outputs();
        match crate::plan::template::hydrate(&step.tool_input, &outputs) {
            Ok(args) => RunEvent::StepHydrated {
                call: ToolCall {
                    tool_name: step.tool_name.clone(),
                    args,
                },
            },
            Err(e) => RunEvent::HydrationFailed {
                message: e.to_string(),
            },
        }
    }

    // ==================== Worker (tool path) ====================

    async fn invoke_tool(&mut self, call: ToolCall) -> RunEvent {
        if self.cancel.is_cancelled() {
            return RunEvent::Aborted;
        }
        let Some(run) = self.state.run_ctx() else {
            return RunEvent::NodeFailed {
                kind: ErrorKind::Bug,
                detail: "tool invocation with no live run".to_string(),
            };
        };
        let enabled = run.enabled_tools.clone();

        let ctx = ToolContext {
            workspace: self.workspace.clone(),
            cancel: self.cancel.child_token(),
        };
        let tools = Arc::clone(&self.tools);
        let fut = tools.invoke(&call.tool_name, &call.args, &ctx, &enabled);
        tokio::pin!(fut);

        let result = tokio::select! {
            r = &mut fut => Some(r),
            () = self.cancel.cancelled() => {
                // Give the in-flight call a bounded drain, then abandon it.
                // The child token above tells cooperative tools to stop.
                let _ = tokio::time::timeout(self.cfg.grace_period, &mut fut).await;
                None
            }
        };

        // A result that raced the token still counts as aborted; the step
        // must not continue into the Supervisor after a stop.
        if self.cancel.is_cancelled() {
            return RunEvent::Aborted;
        }

        match result {
            None | Some(Err(ToolError::Cancelled)) => RunEvent::Aborted,
            Some(Ok(outcome)) => RunEvent::ToolFinished { outcome },
            Some(Err(e)) => RunEvent::ToolFinished {
                outcome: e.into_outcome(),
            },
        }
    }

    // ==================== Reasoning nodes ====================

    async fn run_node(&mut self, node: Node) -> RunEvent {
        if self.cancel.is_cancelled() {
            return RunEvent::Aborted;
        }

        // Sandbox violations never reach the model: the judgement is
        // deterministic and non-retryable.
        if node == Node::Supervisor {
            if let RunState::Evaluating { outcome, .. } = &self.state {
                if let Some(fault) = &outcome.error {
                    if matches!(
                        fault.kind,
                        ErrorKind::PathEscape | ErrorKind::SandboxViolation
                    ) {
                        return RunEvent::Verdict {
                            evaluation: Evaluation {
                                outcome: StepOutcome::Escalate,
                                reasoning: format!(
                                    "sandbox violation is fatal to the step: {}",
                                    fault.message
                                ),
                                revised_instruction: None,
                            },
                        };
                    }
                }
            }
        }

        let call = match self.prepare_call(node) {
            Ok(c) => c,
            Err(detail) => {
                return RunEvent::NodeFailed {
                    kind: ErrorKind::Bug,
                    detail,
                }
            }
        };
        let role_models = self
            .state
            .run_ctx()
            .map(|r| r.role_models.clone())
            .unwrap_or_default();
        let model = self.gateway.resolve_model(call.role, &role_models);

        let mut messages = call.messages.clone();
        let mut llm_failures: u32 = 0;
        let mut reprompted = false;

        loop {
            let invoke = self.gateway.invoke(
                call.role,
                &model,
                &call.system,
                messages.clone(),
                &call.options,
                &self.cancel,
            );
            let outcome = match tokio::time::timeout(self.cfg.llm_timeout, invoke).await {
                Ok(r) => r,
                Err(_) => Err(crate::llm::LlmError::network(format!(
                    "node timed out after {:?}",
                    self.cfg.llm_timeout
                ))),
            };

            match outcome {
                Ok(out) => {
                    self.record_usage(call.role, &out).await;
                    match self.interpret(node, &out.text) {
                        Ok(event) => return event,
                        Err(detail) if !reprompted => {
                            tracing::warn!(
                                task_id = %self.task_id,
                                node = ?node,
                                error = %detail,
                                "structured output malformed, re-prompting once"
                            );
                            reprompted = true;
                            messages.push(ChatMessage::assistant(out.text));
                            messages.push(ChatMessage::user(format!(
                                "{} ({detail})",
                                nodes::STRICT_FORMAT_REMINDER
                            )));
                        }
                        Err(detail) => {
                            return RunEvent::NodeFailed {
                                kind: ErrorKind::LlmParseError,
                                detail,
                            }
                        }
                    }
                }
                Err(e) if e.kind == LlmErrorKind::Cancelled => return RunEvent::Aborted,
                Err(e) => {
                    llm_failures += 1;
                    if llm_failures <= self.cfg.node_retry_budget {
                        tracing::warn!(
                            task_id = %self.task_id,
                            node = ?node,
                            attempt = llm_failures,
                            error = %e.message,
                            "node call failed, retrying"
                        );
                        continue;
                    }
                    return RunEvent::NodeFailed {
                        kind: ErrorKind::LlmUnavailable,
                        detail: e.message,
                    };
                }
            }
        }
    }

    /// Build the gateway call for a node from the current state.
    fn prepare_call(&self, node: Node) -> Result<NodeCall, String> {
        match (node, &self.state) {
            (Node::Router, RunState::Routing { run }) => Ok(nodes::router_call(&run.prompt)),

            (Node::Librarian, RunState::Answering { run }) => {
                Ok(nodes::librarian_call(&run.prompt))
            }

            (Node::Architect, RunState::Planning { run }) => Ok(nodes::architect_call(
                &run.prompt,
                &run.failure_context,
                &self.tool_infos,
                &run.enabled_tools,
            )),

            (Node::BoardRoster, RunState::BoardProposing { run }) => {
                Ok(nodes::roster_call(&run.prompt))
            }

            (Node::ChairDraft, RunState::ChairDrafting { run, board }) => {
                Ok(nodes::chair_draft_call(
                    &run.prompt,
                    &board.experts,
                    &self.tool_infos,
                    &run.enabled_tools,
                ))
            }

            (Node::ExpertCritique { index }, RunState::Critiquing { run, board }) => {
                let expert = board
                    .experts
                    .get(index)
                    .ok_or_else(|| format!("no expert at index {index}"))?;
                let draft = board
                    .draft
                    .as_ref()
                    .ok_or_else(|| "critique requested with no draft plan".to_string())?;
                Ok(nodes::expert_critique_call(&run.prompt, expert, draft))
            }

            (Node::ChairFinal, RunState::ChairFinalizing { run, board }) => {
                let draft = board
                    .draft
                    .as_ref()
                    .ok_or_else(|| "synthesis requested with no draft plan".to_string())?;
                Ok(nodes::chair_final_call(
                    &run.prompt,
                    draft,
                    &board.critiques,
                    &self.tool_infos,
                    &run.enabled_tools,
                ))
            }

            (Node::WorkerLlm, RunState::InvokingTool { exec, call, .. }) => {
                Ok(nodes::worker_llm_call(
                    &exec.current_step().instruction,
                    &call.args,
                ))
            }

            (
                Node::Supervisor,
                RunState::Evaluating {
                    exec,
                    call,
                    outcome,
                    ..
                },
            ) => Ok(nodes::supervisor_call(exec.current_step(), call, outcome)),

            (Node::Editor, RunState::Editing { run, exec }) => {
                Ok(nodes::editor_call(&run.prompt, &exec.plan))
            }

            (node, state) => Err(format!("node {node:?} requested in state {state:?}")),
        }
    }

    /// Turn a node's text output into the transition event it stands for.
    /// `Err` means the structured output was malformed (re-prompt material).
    fn interpret(&self, node: Node, text: &str) -> Result<RunEvent, String> {
        match node {
            Node::Router => Ok(RunEvent::RouteChosen {
                route: nodes::parse_route(text),
            }),

            Node::Librarian => Ok(RunEvent::AnswerReady {
                text: text.trim().to_string(),
            }),

            Node::Architect => {
                let plan = nodes::parse_plan(text)?;
                self.check_plan(&plan)?;
                Ok(RunEvent::PlanReady { plan })
            }

            Node::BoardRoster => Ok(RunEvent::RosterReady {
                experts: nodes::parse_roster(text)?,
            }),

            Node::ChairDraft => {
                let (plan, notes) = nodes::parse_draft(text)?;
                self.check_plan(&plan)?;
                Ok(RunEvent::DraftReady { plan, notes })
            }

            Node::ChairFinal => {
                let (plan, _notes) = nodes::parse_draft(text)?;
                self.check_plan(&plan)?;
                Ok(RunEvent::PlanReady { plan })
            }

            Node::ExpertCritique { index } => {
                let expert = match &self.state {
                    RunState::Critiquing { board, .. } => board
                        .experts
                        .get(index)
                        .map(|e| e.name.clone())
                        .unwrap_or_default(),
                    _ => String::new(),
                };
                Ok(RunEvent::CritiqueReady {
                    critique: crate::plan::Critique {
                        expert,
                        critique: text.trim().to_string(),
                    },
                })
            }

            Node::WorkerLlm => Ok(RunEvent::ToolFinished {
                outcome: crate::tools::ToolOutcome::success(serde_json::Value::String(
                    text.trim().to_string(),
                )),
            }),

            Node::Supervisor => Ok(RunEvent::Verdict {
                evaluation: nodes::parse_evaluation(text)?,
            }),

            Node::Editor => Ok(RunEvent::ReportReady {
                report: text.trim().to_string(),
            }),
        }
    }

    fn check_plan(&self, plan: &crate::plan::Plan) -> Result<(), String> {
        let enabled = self
            .state
            .run_ctx()
            .map(|r| r.enabled_tools.clone())
            .unwrap_or_default();
        plan.validate(&enabled).map_err(|e| e.to_string())
    }

    async fn record_usage(&self, role: crate::llm::Role, out: &CallOutcome) {
        if let Err(e) = self
            .bus
            .store()
            .add_token_usage(&self.task_id, role, out.usage)
        {
            tracing::error!(task_id = %self.task_id, error = %e, "failed to record token usage");
        }
        let payload = EventPayload::TokenUsage {
            role,
            model_id: out.model_id.clone(),
            input: out.usage.input_tokens,
            output: out.usage.output_tokens,
            total: out.usage.total(),
        };
        if let Err(e) = self.bus.append(&self.task_id, payload).await {
            tracing::error!(task_id = %self.task_id, error = %e, "failed to emit token usage");
        }
    }
}
