//! Pure state transition function for the run node graph.
//!
//! Given the current state, the run limits, and one event, produce the next
//! state plus an ordered list of effects. No I/O happens here; the
//! controller executes the effects. This is the piece that makes the engine
//! auditable: every arm below is exercised directly by unit tests.

use super::effect::{Effect, Node};
use super::event::{ResumeDecision, ResumeInput, RunEvent};
use super::state::{BoardCtx, ExecCtx, RunCtx, RunState};
use crate::error::ErrorKind;
use crate::events::EventPayload;
use crate::plan::{Plan, StepOutcome, StepStatus, ToolCall};
use crate::store::{InterruptKind, PendingInterrupt, TaskStatus};
use serde_json::json;
use thiserror::Error;

/// Budgets the graph enforces.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_step_retries: u32,
    pub max_replans: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_step_retries: 2,
            max_replans: 2,
        }
    }
}

/// Result of a state transition.
#[derive(Debug)]
pub struct TransitionResult {
    pub new_state: RunState,
    pub effects: Vec<Effect>,
}

impl TransitionResult {
    pub fn new(state: RunState) -> Self {
        Self {
            new_state: state,
            effects: vec![],
        }
    }

    pub fn with_effect(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }
}

/// Errors that can occur during transition. These are user-facing rejections
/// (the run itself is unaffected).
#[derive(Debug, Error)]
pub enum TransitionError {
    #[error("task is busy; stop the current run first")]
    TaskBusy,
    #[error("no pending interrupt to resume")]
    NoPendingInterrupt,
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
}

impl TransitionError {
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            TransitionError::TaskBusy => ErrorKind::TaskBusy,
            TransitionError::NoPendingInterrupt => ErrorKind::NoPendingInterrupt,
            TransitionError::InvalidTransition(_) => ErrorKind::Bug,
        }
    }
}

/// Pure transition function.
#[allow(clippy::too_many_lines)] // the node graph is one exhaustive match
pub fn transition(
    state: &RunState,
    limits: &Limits,
    event: RunEvent,
) -> Result<TransitionResult, TransitionError> {
    match (state, event) {
        // ============================================================
        // Run start
        // ============================================================
        (
            RunState::Idle,
            RunEvent::RunRequested {
                prompt,
                role_models,
                enabled_tools,
            },
        ) => {
            let run = RunCtx {
                prompt,
                role_models,
                enabled_tools,
                replans_remaining: limits.max_replans,
                failure_context: vec![],
            };
            Ok(TransitionResult::new(RunState::Routing { run })
                .with_effect(Effect::SetStatus(TaskStatus::Running))
                .with_effect(Effect::PersistRun)
                .with_effect(Effect::RunNode(Node::Router)))
        }

        (_, RunEvent::RunRequested { .. }) => Err(TransitionError::TaskBusy),

        // ============================================================
        // Routing
        // ============================================================
        (RunState::Routing { run }, RunEvent::RouteChosen { route }) => {
            let (next_state, node) = match route {
                crate::plan::Route::DirectQa => {
                    (RunState::Answering { run: run.clone() }, Node::Librarian)
                }
                crate::plan::Route::ComplexTask => {
                    (RunState::Planning { run: run.clone() }, Node::Architect)
                }
                crate::plan::Route::PeerReview => (
                    RunState::BoardProposing { run: run.clone() },
                    Node::BoardRoster,
                ),
            };
            Ok(TransitionResult::new(next_state)
                .with_effect(Effect::Emit(EventPayload::RouterDecision { route }))
                .with_effect(Effect::PersistRun)
                .with_effect(Effect::RunNode(node)))
        }

        // ============================================================
        // Direct QA
        // ============================================================
        (RunState::Answering { .. }, RunEvent::AnswerReady { text }) => {
            Ok(TransitionResult::new(RunState::Idle)
                .with_effect(Effect::SetStatus(TaskStatus::Completed))
                .with_effect(Effect::PersistRun)
                .with_effect(Effect::Emit(EventPayload::DirectAnswer { text })))
        }

        // ============================================================
        // Architect plan + approval gate
        // ============================================================
        (RunState::Planning { run }, RunEvent::PlanReady { plan }) => {
            let interrupt = PendingInterrupt {
                kind: InterruptKind::PlanApproval,
                payload: json!({ "plan": &plan }),
            };
            Ok(TransitionResult::new(RunState::AwaitingPlanApproval {
                run: run.clone(),
                plan: plan.clone(),
            })
            .with_effect(Effect::SetStatus(TaskStatus::AwaitingInput))
            .with_effect(Effect::StoreInterrupt(interrupt))
            .with_effect(Effect::PersistRun)
            .with_effect(Effect::Emit(EventPayload::ArchitectPlanGenerated {
                plan: plan.clone(),
                is_awaiting_approval: true,
            }))
            .with_effect(Effect::Emit(EventPayload::PlanProposal { plan })))
        }

        (
            RunState::AwaitingPlanApproval { run, plan },
            RunEvent::ResumeReceived { input },
        ) => resume_plan_gate(run, plan, input, limits),

        // ============================================================
        // Board of experts
        // ============================================================
        (RunState::BoardProposing { run }, RunEvent::RosterReady { experts }) => {
            let interrupt = PendingInterrupt {
                kind: InterruptKind::BoardApproval,
                payload: json!({ "experts": &experts }),
            };
            Ok(TransitionResult::new(RunState::AwaitingBoardApproval {
                run: run.clone(),
                board: BoardCtx::new(experts.clone()),
            })
            .with_effect(Effect::SetStatus(TaskStatus::AwaitingInput))
            .with_effect(Effect::StoreInterrupt(interrupt))
            .with_effect(Effect::PersistRun)
            .with_effect(Effect::Emit(EventPayload::BoardApprovalRequest { experts })))
        }

        (
            RunState::AwaitingBoardApproval { run, board },
            RunEvent::ResumeReceived { input },
        ) => match input.decision {
            ResumeDecision::Approve => {
                Ok(TransitionResult::new(RunState::ChairDrafting {
                    run: run.clone(),
                    board: board.clone(),
                })
                .with_effect(Effect::ClearInterrupt)
                .with_effect(Effect::SetStatus(TaskStatus::Running))
                .with_effect(Effect::PersistRun)
                .with_effect(Effect::RunNode(Node::ChairDraft)))
            }
            ResumeDecision::Reject => Ok(cancelled(true)),
            ResumeDecision::Modify => Err(TransitionError::InvalidTransition(
                "the board roster gate does not accept modified plans".to_string(),
            )),
        },

        (RunState::ChairDrafting { run, board }, RunEvent::DraftReady { plan, notes }) => {
            let mut board = board.clone();
            board.draft = Some(plan.clone());
            board.notes = notes;
            board.next_expert = 0;

            let emit = Effect::Emit(EventPayload::ChairPlanGenerated { plan });

            // A degenerate (empty) roster skips straight to synthesis.
            let (next_state, node) = if board.experts.is_empty() {
                (
                    RunState::ChairFinalizing {
                        run: run.clone(),
                        board,
                    },
                    Node::ChairFinal,
                )
            } else {
                (
                    RunState::Critiquing {
                        run: run.clone(),
                        board,
                    },
                    Node::ExpertCritique { index: 0 },
                )
            };

            Ok(TransitionResult::new(next_state)
                .with_effect(emit)
                .with_effect(Effect::PersistRun)
                .with_effect(Effect::RunNode(node)))
        }

        (RunState::Critiquing { run, board }, RunEvent::CritiqueReady { critique }) => {
            let mut board = board.clone();
            board.critiques.push(critique.clone());
            board.next_expert += 1;

            let emit = Effect::Emit(EventPayload::ExpertCritiqueGenerated { critique });

            if board.next_expert < board.experts.len() {
                let index = board.next_expert;
                Ok(TransitionResult::new(RunState::Critiquing {
                    run: run.clone(),
                    board,
                })
                .with_effect(emit)
                .with_effect(Effect::PersistRun)
                .with_effect(Effect::RunNode(Node::ExpertCritique { index })))
            } else {
                Ok(TransitionResult::new(RunState::ChairFinalizing {
                    run: run.clone(),
                    board,
                })
                .with_effect(emit)
                .with_effect(Effect::PersistRun)
                .with_effect(Effect::RunNode(Node::ChairFinal)))
            }
        }

        (RunState::ChairFinalizing { run, board }, RunEvent::PlanReady { plan }) => {
            let interrupt = PendingInterrupt {
                kind: InterruptKind::FinalPlanApproval,
                payload: json!({
                    "plan": &plan,
                    "critiques": &board.critiques,
                    "implementation_notes": &board.notes,
                }),
            };
            Ok(TransitionResult::new(RunState::AwaitingFinalApproval {
                run: run.clone(),
                plan: plan.clone(),
                board: board.clone(),
            })
            .with_effect(Effect::SetStatus(TaskStatus::AwaitingInput))
            .with_effect(Effect::StoreInterrupt(interrupt))
            .with_effect(Effect::PersistRun)
            .with_effect(Effect::Emit(EventPayload::FinalPlanApprovalRequest {
                plan,
                critiques: board.critiques.clone(),
                implementation_notes: board.notes.clone(),
            })))
        }

        (
            RunState::AwaitingFinalApproval { run, plan, .. },
            RunEvent::ResumeReceived { input },
        ) => resume_plan_gate(run, plan, input, limits),

        // ============================================================
        // Execution loop: Foreman -> Worker -> Supervisor
        // ============================================================
        (RunState::Hydrating { run, exec }, RunEvent::StepHydrated { call }) => {
            let step = exec.current_step().clone();
            let launch = if step.is_llm_only() {
                Effect::RunNode(Node::WorkerLlm)
            } else {
                Effect::InvokeTool { call: call.clone() }
            };
            Ok(TransitionResult::new(RunState::InvokingTool {
                run: run.clone(),
                exec: exec.clone(),
                call: call.clone(),
            })
            .with_effect(Effect::PersistRun)
            .with_effect(Effect::Emit(EventPayload::ForemanStepPrepared {
                step,
                hydrated_tool_call: call,
            }))
            .with_effect(launch))
        }

        (RunState::Hydrating { run, exec }, RunEvent::HydrationFailed { message }) => {
            // Unresolved placeholders skip the Worker and go straight to the
            // Supervisor as a retry candidate.
            let step = exec.current_step();
            let call = ToolCall {
                tool_name: step.tool_name.clone(),
                args: step.tool_input.clone(),
            };
            let outcome = crate::tools::ToolOutcome::failure(
                ErrorKind::PlaceholderUnresolved,
                message,
            );
            Ok(TransitionResult::new(RunState::Evaluating {
                run: run.clone(),
                exec: exec.clone(),
                call,
                outcome,
            })
            .with_effect(Effect::PersistRun)
            .with_effect(Effect::RunNode(Node::Supervisor)))
        }

        (
            RunState::InvokingTool { run, exec, call },
            RunEvent::ToolFinished { outcome },
        ) => Ok(TransitionResult::new(RunState::Evaluating {
            run: run.clone(),
            exec: exec.clone(),
            call: call.clone(),
            outcome: outcome.clone(),
        })
        .with_effect(Effect::PersistRun)
        .with_effect(Effect::Emit(EventPayload::WorkerStepExecuted {
            tool_call: call.clone(),
            output: outcome.wire_output(),
            artifacts: outcome.artifacts,
        }))
        .with_effect(Effect::RunNode(Node::Supervisor))),

        (
            RunState::Evaluating {
                run,
                exec,
                outcome,
                ..
            },
            RunEvent::Verdict { evaluation },
        ) => {
            let emit = Effect::Emit(EventPayload::SupervisorStepEvaluated {
                evaluation: evaluation.clone(),
            });

            match evaluation.outcome {
                StepOutcome::Success => {
                    let mut exec = exec.clone();
                    exec.current_step_mut().status = StepStatus::Completed;
                    exec.current_step_mut().actual_output = Some(outcome.output.clone());

                    if exec.is_last_step() {
                        Ok(TransitionResult::new(RunState::Editing {
                            run: run.clone(),
                            exec,
                        })
                        .with_effect(emit)
                        .with_effect(Effect::PersistRun)
                        .with_effect(Effect::RunNode(Node::Editor)))
                    } else {
                        exec.step_index += 1;
                        exec.retries_remaining = limits.max_step_retries;
                        exec.mark_current(StepStatus::InProgress);
                        Ok(TransitionResult::new(RunState::Hydrating {
                            run: run.clone(),
                            exec,
                        })
                        .with_effect(emit)
                        .with_effect(Effect::PersistRun)
                        .with_effect(Effect::HydrateStep))
                    }
                }

                StepOutcome::Retry if exec.retries_remaining > 0 => {
                    let mut exec = exec.clone();
                    exec.retries_remaining -= 1;
                    if let Some(revised) = &evaluation.revised_instruction {
                        exec.current_step_mut().instruction = revised.clone();
                    }
                    Ok(TransitionResult::new(RunState::Hydrating {
                        run: run.clone(),
                        exec,
                    })
                    .with_effect(emit)
                    .with_effect(Effect::PersistRun)
                    .with_effect(Effect::HydrateStep))
                }

                // Retry with no budget left behaves as escalate.
                StepOutcome::Retry | StepOutcome::Escalate => {
                    let mut run = run.clone();
                    let mut exec = exec.clone();
                    exec.mark_current(StepStatus::Failed);
                    let step = exec.current_step();
                    run.failure_context.push(format!(
                        "Plan attempt {}: step {} ({}) failed. Supervisor: {}",
                        run.failure_context.len() + 1,
                        step.step_id,
                        step.instruction,
                        evaluation.reasoning,
                    ));

                    if run.replans_remaining > 0 {
                        run.replans_remaining -= 1;
                        Ok(TransitionResult::new(RunState::Planning { run })
                            .with_effect(emit)
                            .with_effect(Effect::PersistRun)
                            .with_effect(Effect::RunNode(Node::Architect)))
                    } else {
                        let detail = format!(
                            "re-plan budget exhausted after step {} failed: {}",
                            step.step_id, evaluation.reasoning
                        );
                        Ok(TransitionResult::new(RunState::Idle)
                            .with_effect(emit)
                            .with_effect(Effect::SetStatus(TaskStatus::Failed))
                            .with_effect(Effect::PersistRun)
                            .with_effect(Effect::Emit(EventPayload::Failed {
                                reason: ErrorKind::PlanUnrecoverable,
                                detail,
                            })))
                    }
                }
            }
        }

        // ============================================================
        // Editor
        // ============================================================
        (RunState::Editing { .. }, RunEvent::ReportReady { report }) => {
            Ok(TransitionResult::new(RunState::Idle)
                .with_effect(Effect::SetStatus(TaskStatus::Completed))
                .with_effect(Effect::PersistRun)
                .with_effect(Effect::Emit(EventPayload::EditorReportGenerated {
                    report: report.clone(),
                }))
                .with_effect(Effect::Emit(EventPayload::FinalAnswer { text: report })))
        }

        // ============================================================
        // Failures, cancellation
        // ============================================================
        (state, RunEvent::NodeFailed { kind, detail }) if state.is_active() => {
            Ok(TransitionResult::new(RunState::Idle)
                .with_effect(Effect::ClearInterrupt)
                .with_effect(Effect::SetStatus(TaskStatus::Failed))
                .with_effect(Effect::PersistRun)
                .with_effect(Effect::Emit(EventPayload::Failed { reason: kind, detail })))
        }

        (state, RunEvent::StopRequested | RunEvent::Aborted) if state.is_active() => {
            Ok(cancelled(state.is_awaiting_input()))
        }

        // Stop on a task with no live run is a no-op.
        (RunState::Idle, RunEvent::StopRequested | RunEvent::Aborted) => {
            Ok(TransitionResult::new(RunState::Idle))
        }

        (RunState::Idle, RunEvent::ResumeReceived { .. }) => {
            Err(TransitionError::NoPendingInterrupt)
        }
        (state, RunEvent::ResumeReceived { .. }) if !state.is_awaiting_input() => {
            Err(TransitionError::NoPendingInterrupt)
        }

        // ============================================================
        // Anything else is a bug in the controller.
        // ============================================================
        (state, event) => Err(TransitionError::InvalidTransition(format!(
            "no transition from {state:?} with {event:?}"
        ))),
    }
}

/// Shared handling for the two plan approval gates.
fn resume_plan_gate(
    run: &RunCtx,
    plan: &Plan,
    input: ResumeInput,
    limits: &Limits,
) -> Result<TransitionResult, TransitionError> {
    match input.decision {
        ResumeDecision::Approve => Ok(start_execution(run.clone(), plan.clone(), limits, None)),
        ResumeDecision::Reject => Ok(cancelled(true)),
        ResumeDecision::Modify => {
            // The session layer validates modified plans before they reach
            // the controller; a missing plan here is a controller bug.
            let mut modified = input.modified_plan.ok_or_else(|| {
                TransitionError::InvalidTransition(
                    "modify resume without a modified plan".to_string(),
                )
            })?;
            modified.reset_progress();
            Ok(start_execution(
                run.clone(),
                modified.clone(),
                limits,
                Some(Effect::Emit(EventPayload::ArchitectPlanGenerated {
                    plan: modified,
                    is_awaiting_approval: false,
                })),
            ))
        }
    }
}

fn start_execution(
    run: RunCtx,
    mut plan: Plan,
    limits: &Limits,
    record: Option<Effect>,
) -> TransitionResult {
    if let Some(first) = plan.steps.first_mut() {
        first.status = StepStatus::InProgress;
    }
    let exec = ExecCtx::new(plan, limits.max_step_retries);

    let mut result = TransitionResult::new(RunState::Hydrating { run, exec })
        .with_effect(Effect::ClearInterrupt)
        .with_effect(Effect::SetStatus(TaskStatus::Running));
    if let Some(effect) = record {
        result = result.with_effect(effect);
    }
    result
        .with_effect(Effect::PersistRun)
        .with_effect(Effect::HydrateStep)
}

fn cancelled(clear_interrupt: bool) -> TransitionResult {
    let mut result = TransitionResult::new(RunState::Idle);
    if clear_interrupt {
        result = result.with_effect(Effect::ClearInterrupt);
    }
    result
        .with_effect(Effect::SetStatus(TaskStatus::Idle))
        .with_effect(Effect::PersistRun)
        .with_effect(Effect::Emit(EventPayload::TaskCancelled))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{Evaluation, Expert, NO_TOOL, PlanStep, Route};
    use crate::tools::ToolOutcome;
    use serde_json::json;
    use std::collections::{BTreeSet, HashMap};

    fn limits() -> Limits {
        Limits {
            max_step_retries: 2,
            max_replans: 1,
        }
    }

    fn run_ctx() -> RunCtx {
        RunCtx {
            prompt: "build a report".to_string(),
            role_models: HashMap::new(),
            enabled_tools: ["write_file".to_string(), "list_files".to_string()]
                .into_iter()
                .collect(),
            replans_remaining: 1,
            failure_context: vec![],
        }
    }

    fn two_step_plan() -> Plan {
        Plan {
            steps: vec![
                PlanStep {
                    step_id: 1,
                    instruction: "write hello.txt".to_string(),
                    tool_name: "write_file".to_string(),
                    tool_input: json!({"file": "hello.txt", "content": "hi"}),
                    expected_outcome: "file exists".to_string(),
                    status: StepStatus::Pending,
                    actual_output: None,
                },
                PlanStep {
                    step_id: 2,
                    instruction: "list the workspace".to_string(),
                    tool_name: "list_files".to_string(),
                    tool_input: json!("."),
                    expected_outcome: "hello.txt listed".to_string(),
                    status: StepStatus::Pending,
                    actual_output: None,
                },
            ],
        }
    }

    fn approve() -> RunEvent {
        RunEvent::ResumeReceived {
            input: ResumeInput {
                decision: ResumeDecision::Approve,
                modified_plan: None,
                feedback: None,
            },
        }
    }

    fn run_requested() -> RunEvent {
        RunEvent::RunRequested {
            prompt: "build a report".to_string(),
            role_models: HashMap::new(),
            enabled_tools: BTreeSet::new(),
        }
    }

    fn emitted(result: &TransitionResult) -> Vec<&EventPayload> {
        result
            .effects
            .iter()
            .filter_map(|e| match e {
                Effect::Emit(p) => Some(p),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn idle_run_request_starts_routing() {
        let result = transition(&RunState::Idle, &limits(), run_requested()).unwrap();
        assert!(matches!(result.new_state, RunState::Routing { .. }));
        assert!(result
            .effects
            .iter()
            .any(|e| matches!(e, Effect::RunNode(Node::Router))));
        if let RunState::Routing { run } = &result.new_state {
            assert_eq!(run.replans_remaining, 1);
        }
    }

    #[test]
    fn run_request_while_busy_rejected() {
        let state = RunState::Routing { run: run_ctx() };
        let err = transition(&state, &limits(), run_requested()).unwrap_err();
        assert!(matches!(err, TransitionError::TaskBusy));
    }

    #[test]
    fn direct_qa_route_goes_to_librarian() {
        let state = RunState::Routing { run: run_ctx() };
        let result = transition(
            &state,
            &limits(),
            RunEvent::RouteChosen {
                route: Route::DirectQa,
            },
        )
        .unwrap();
        assert!(matches!(result.new_state, RunState::Answering { .. }));
        assert!(matches!(
            emitted(&result)[0],
            EventPayload::RouterDecision {
                route: Route::DirectQa
            }
        ));
    }

    #[test]
    fn direct_answer_is_terminal_and_completes_task() {
        let state = RunState::Answering { run: run_ctx() };
        let result = transition(
            &state,
            &limits(),
            RunEvent::AnswerReady {
                text: "4".to_string(),
            },
        )
        .unwrap();
        assert!(matches!(result.new_state, RunState::Idle));
        assert!(result
            .effects
            .iter()
            .any(|e| matches!(e, Effect::SetStatus(TaskStatus::Completed))));
        let events = emitted(&result);
        assert_eq!(events.len(), 1);
        assert!(events[0].is_terminal());
    }

    #[test]
    fn plan_ready_opens_approval_gate() {
        let state = RunState::Planning { run: run_ctx() };
        let result = transition(
            &state,
            &limits(),
            RunEvent::PlanReady {
                plan: two_step_plan(),
            },
        )
        .unwrap();

        assert!(matches!(
            result.new_state,
            RunState::AwaitingPlanApproval { .. }
        ));
        assert!(result
            .effects
            .iter()
            .any(|e| matches!(e, Effect::StoreInterrupt(i) if i.kind == InterruptKind::PlanApproval)));
        assert!(result
            .effects
            .iter()
            .any(|e| matches!(e, Effect::SetStatus(TaskStatus::AwaitingInput))));

        let events = emitted(&result);
        assert!(matches!(
            events[0],
            EventPayload::ArchitectPlanGenerated {
                is_awaiting_approval: true,
                ..
            }
        ));
        assert!(matches!(events[1], EventPayload::PlanProposal { .. }));
    }

    #[test]
    fn approve_starts_execution_at_step_one() {
        let state = RunState::AwaitingPlanApproval {
            run: run_ctx(),
            plan: two_step_plan(),
        };
        let result = transition(&state, &limits(), approve()).unwrap();

        let RunState::Hydrating { exec, .. } = &result.new_state else {
            panic!("expected Hydrating, got {:?}", result.new_state);
        };
        assert_eq!(exec.step_index, 0);
        assert_eq!(exec.retries_remaining, 2);
        assert_eq!(exec.plan.steps[0].status, StepStatus::InProgress);
        assert!(result
            .effects
            .iter()
            .any(|e| matches!(e, Effect::ClearInterrupt)));
        assert!(result
            .effects
            .iter()
            .any(|e| matches!(e, Effect::HydrateStep)));
    }

    #[test]
    fn reject_cancels_the_run() {
        let state = RunState::AwaitingPlanApproval {
            run: run_ctx(),
            plan: two_step_plan(),
        };
        let result = transition(
            &state,
            &limits(),
            RunEvent::ResumeReceived {
                input: ResumeInput {
                    decision: ResumeDecision::Reject,
                    modified_plan: None,
                    feedback: Some("not like this".to_string()),
                },
            },
        )
        .unwrap();

        assert!(matches!(result.new_state, RunState::Idle));
        let events = emitted(&result);
        assert_eq!(events, vec![&EventPayload::TaskCancelled]);
    }

    #[test]
    fn modify_replaces_plan_and_records_it() {
        let mut modified = two_step_plan();
        modified.steps.truncate(1);
        let state = RunState::AwaitingPlanApproval {
            run: run_ctx(),
            plan: two_step_plan(),
        };
        let result = transition(
            &state,
            &limits(),
            RunEvent::ResumeReceived {
                input: ResumeInput {
                    decision: ResumeDecision::Modify,
                    modified_plan: Some(modified),
                    feedback: None,
                },
            },
        )
        .unwrap();

        let RunState::Hydrating { exec, .. } = &result.new_state else {
            panic!("expected Hydrating");
        };
        assert_eq!(exec.plan.len(), 1);
        assert!(matches!(
            emitted(&result)[0],
            EventPayload::ArchitectPlanGenerated {
                is_awaiting_approval: false,
                ..
            }
        ));
    }

    #[test]
    fn duplicate_resume_is_rejected() {
        // After approval the state is no longer a gate; a second resume
        // must fail closed.
        let state = RunState::Hydrating {
            run: run_ctx(),
            exec: ExecCtx::new(two_step_plan(), 2),
        };
        let err = transition(&state, &limits(), approve()).unwrap_err();
        assert!(matches!(err, TransitionError::NoPendingInterrupt));

        let err = transition(&RunState::Idle, &limits(), approve()).unwrap_err();
        assert!(matches!(err, TransitionError::NoPendingInterrupt));
    }

    #[test]
    fn board_path_sequences_critiques() {
        let experts = vec![
            Expert {
                name: "Ada".to_string(),
                specialty: "correctness".to_string(),
            },
            Expert {
                name: "Grace".to_string(),
                specialty: "operability".to_string(),
            },
        ];

        let state = RunState::BoardProposing { run: run_ctx() };
        let result = transition(
            &state,
            &limits(),
            RunEvent::RosterReady {
                experts: experts.clone(),
            },
        )
        .unwrap();
        assert!(matches!(
            result.new_state,
            RunState::AwaitingBoardApproval { .. }
        ));

        let result = transition(&result.new_state, &limits(), approve()).unwrap();
        assert!(matches!(result.new_state, RunState::ChairDrafting { .. }));

        let result = transition(
            &result.new_state,
            &limits(),
            RunEvent::DraftReady {
                plan: two_step_plan(),
                notes: Some("watch the edge cases".to_string()),
            },
        )
        .unwrap();
        assert!(matches!(result.new_state, RunState::Critiquing { .. }));
        assert!(result
            .effects
            .iter()
            .any(|e| matches!(e, Effect::RunNode(Node::ExpertCritique { index: 0 }))));

        // First critique moves to the second expert.
        let critique1 = crate::plan::Critique {
            expert: "Ada".to_string(),
            critique: "step 2 is vague".to_string(),
        };
        let result = transition(
            &result.new_state,
            &limits(),
            RunEvent::CritiqueReady {
                critique: critique1,
            },
        )
        .unwrap();
        assert!(result
            .effects
            .iter()
            .any(|e| matches!(e, Effect::RunNode(Node::ExpertCritique { index: 1 }))));

        // Second critique moves to synthesis.
        let critique2 = crate::plan::Critique {
            expert: "Grace".to_string(),
            critique: "fine".to_string(),
        };
        let result = transition(
            &result.new_state,
            &limits(),
            RunEvent::CritiqueReady {
                critique: critique2,
            },
        )
        .unwrap();
        assert!(matches!(result.new_state, RunState::ChairFinalizing { .. }));
        assert!(result
            .effects
            .iter()
            .any(|e| matches!(e, Effect::RunNode(Node::ChairFinal))));

        // Final plan opens the second gate with critiques attached.
        let result = transition(
            &result.new_state,
            &limits(),
            RunEvent::PlanReady {
                plan: two_step_plan(),
            },
        )
        .unwrap();
        assert!(matches!(
            result.new_state,
            RunState::AwaitingFinalApproval { .. }
        ));
        let events = emitted(&result);
        assert!(matches!(
            events[0],
            EventPayload::FinalPlanApprovalRequest { critiques, .. } if critiques.len() == 2
        ));
    }

    fn exec_state_at_step(step_index: usize, retries: u32) -> RunState {
        let mut exec = ExecCtx::new(two_step_plan(), retries);
        exec.step_index = step_index;
        exec.mark_current(StepStatus::InProgress);
        if step_index > 0 {
            exec.plan.steps[0].status = StepStatus::Completed;
            exec.plan.steps[0].actual_output = Some(json!("done"));
        }
        let call = ToolCall {
            tool_name: exec.current_step().tool_name.clone(),
            args: exec.current_step().tool_input.clone(),
        };
        RunState::Evaluating {
            run: run_ctx(),
            exec,
            call,
            outcome: ToolOutcome::success(json!("wrote 2 bytes to hello.txt")),
        }
    }

    fn verdict(outcome: StepOutcome, revised: Option<&str>) -> RunEvent {
        RunEvent::Verdict {
            evaluation: Evaluation {
                outcome,
                reasoning: "because".to_string(),
                revised_instruction: revised.map(String::from),
            },
        }
    }

    #[test]
    fn success_advances_to_next_step() {
        let state = exec_state_at_step(0, 2);
        let result = transition(&state, &limits(), verdict(StepOutcome::Success, None)).unwrap();

        let RunState::Hydrating { exec, .. } = &result.new_state else {
            panic!("expected Hydrating");
        };
        assert_eq!(exec.step_index, 1);
        assert_eq!(exec.retries_remaining, 2);
        assert_eq!(exec.plan.steps[0].status, StepStatus::Completed);
        assert_eq!(
            exec.plan.steps[0].actual_output,
            Some(json!("wrote 2 bytes to hello.txt"))
        );
        assert_eq!(exec.plan.steps[1].status, StepStatus::InProgress);
    }

    #[test]
    fn success_on_last_step_goes_to_editor() {
        let state = exec_state_at_step(1, 2);
        let result = transition(&state, &limits(), verdict(StepOutcome::Success, None)).unwrap();
        assert!(matches!(result.new_state, RunState::Editing { .. }));
        assert!(result
            .effects
            .iter()
            .any(|e| matches!(e, Effect::RunNode(Node::Editor))));
    }

    #[test]
    fn retry_decrements_budget_and_applies_revised_instruction() {
        let state = exec_state_at_step(0, 2);
        let result = transition(
            &state,
            &limits(),
            verdict(StepOutcome::Retry, Some("write it as UTF-8")),
        )
        .unwrap();

        let RunState::Hydrating { exec, .. } = &result.new_state else {
            panic!("expected Hydrating");
        };
        assert_eq!(exec.retries_remaining, 1);
        assert_eq!(exec.step_index, 0);
        assert_eq!(exec.current_step().instruction, "write it as UTF-8");
    }

    #[test]
    fn retry_with_no_budget_escalates_to_replan() {
        let state = exec_state_at_step(0, 0);
        let result = transition(&state, &limits(), verdict(StepOutcome::Retry, None)).unwrap();

        let RunState::Planning { run } = &result.new_state else {
            panic!("expected Planning, got {:?}", result.new_state);
        };
        assert_eq!(run.replans_remaining, 0);
        assert_eq!(run.failure_context.len(), 1);
        assert!(run.failure_context[0].contains("Supervisor: because"));
        assert!(result
            .effects
            .iter()
            .any(|e| matches!(e, Effect::RunNode(Node::Architect))));
    }

    #[test]
    fn escalate_with_no_replan_budget_fails_run() {
        let mut run = run_ctx();
        run.replans_remaining = 0;
        let mut exec = ExecCtx::new(two_step_plan(), 0);
        exec.mark_current(StepStatus::InProgress);
        let call = ToolCall {
            tool_name: "write_file".to_string(),
            args: json!({}),
        };
        let state = RunState::Evaluating {
            run,
            exec,
            call,
            outcome: ToolOutcome::failure(ErrorKind::PathEscape, "escaped"),
        };

        let result = transition(&state, &limits(), verdict(StepOutcome::Escalate, None)).unwrap();
        assert!(matches!(result.new_state, RunState::Idle));
        let events = emitted(&result);
        assert!(matches!(
            events.last().unwrap(),
            EventPayload::Failed {
                reason: ErrorKind::PlanUnrecoverable,
                ..
            }
        ));
        assert!(result
            .effects
            .iter()
            .any(|e| matches!(e, Effect::SetStatus(TaskStatus::Failed))));
    }

    #[test]
    fn hydration_failure_routes_to_supervisor() {
        let mut exec = ExecCtx::new(two_step_plan(), 2);
        exec.mark_current(StepStatus::InProgress);
        let state = RunState::Hydrating {
            run: run_ctx(),
            exec,
        };
        let result = transition(
            &state,
            &limits(),
            RunEvent::HydrationFailed {
                message: "{step_9_output} does not match any completed step".to_string(),
            },
        )
        .unwrap();

        let RunState::Evaluating { outcome, .. } = &result.new_state else {
            panic!("expected Evaluating");
        };
        assert_eq!(
            outcome.error.as_ref().unwrap().kind,
            ErrorKind::PlaceholderUnresolved
        );
        assert!(result
            .effects
            .iter()
            .any(|e| matches!(e, Effect::RunNode(Node::Supervisor))));
        // No worker event: the step never executed.
        assert!(emitted(&result).is_empty());
    }

    #[test]
    fn llm_only_step_launches_worker_node() {
        let mut plan = two_step_plan();
        plan.steps[0].tool_name = NO_TOOL.to_string();
        let mut exec = ExecCtx::new(plan, 2);
        exec.mark_current(StepStatus::InProgress);
        let state = RunState::Hydrating {
            run: run_ctx(),
            exec,
        };
        let call = ToolCall {
            tool_name: NO_TOOL.to_string(),
            args: json!("summarize"),
        };
        let result = transition(&state, &limits(), RunEvent::StepHydrated { call }).unwrap();
        assert!(result
            .effects
            .iter()
            .any(|e| matches!(e, Effect::RunNode(Node::WorkerLlm))));
        assert!(matches!(
            emitted(&result)[0],
            EventPayload::ForemanStepPrepared { .. }
        ));
    }

    #[test]
    fn editor_report_produces_both_report_and_final_answer() {
        let state = RunState::Editing {
            run: run_ctx(),
            exec: ExecCtx::new(two_step_plan(), 2),
        };
        let result = transition(
            &state,
            &limits(),
            RunEvent::ReportReady {
                report: "all done".to_string(),
            },
        )
        .unwrap();

        let events = emitted(&result);
        assert!(matches!(events[0], EventPayload::EditorReportGenerated { .. }));
        assert!(matches!(events[1], EventPayload::FinalAnswer { .. }));
        assert!(events[1].is_terminal());
    }

    #[test]
    fn node_failure_fails_the_run() {
        let state = RunState::Planning { run: run_ctx() };
        let result = transition(
            &state,
            &limits(),
            RunEvent::NodeFailed {
                kind: ErrorKind::LlmUnavailable,
                detail: "provider down".to_string(),
            },
        )
        .unwrap();
        assert!(matches!(result.new_state, RunState::Idle));
        assert!(matches!(
            emitted(&result)[0],
            EventPayload::Failed {
                reason: ErrorKind::LlmUnavailable,
                ..
            }
        ));
    }

    #[test]
    fn stop_cancels_active_run_exactly_once() {
        let state = RunState::Routing { run: run_ctx() };
        let result = transition(&state, &limits(), RunEvent::StopRequested).unwrap();
        assert!(matches!(result.new_state, RunState::Idle));
        let events = emitted(&result);
        assert_eq!(events, vec![&EventPayload::TaskCancelled]);

        // A second stop on the now-idle task emits nothing.
        let result = transition(&result.new_state, &limits(), RunEvent::StopRequested).unwrap();
        assert!(emitted(&result).is_empty());
    }

    #[test]
    fn stop_at_gate_clears_interrupt() {
        let state = RunState::AwaitingPlanApproval {
            run: run_ctx(),
            plan: two_step_plan(),
        };
        let result = transition(&state, &limits(), RunEvent::StopRequested).unwrap();
        assert!(result
            .effects
            .iter()
            .any(|e| matches!(e, Effect::ClearInterrupt)));
        assert_eq!(emitted(&result), vec![&EventPayload::TaskCancelled]);
    }

    #[test]
    fn aborted_mid_tool_emits_single_cancel() {
        let mut exec = ExecCtx::new(two_step_plan(), 2);
        exec.mark_current(StepStatus::InProgress);
        let state = RunState::InvokingTool {
            run: run_ctx(),
            exec,
            call: ToolCall {
                tool_name: "write_file".to_string(),
                args: json!({}),
            },
        };
        let result = transition(&state, &limits(), RunEvent::Aborted).unwrap();
        assert_eq!(emitted(&result), vec![&EventPayload::TaskCancelled]);
    }
}
