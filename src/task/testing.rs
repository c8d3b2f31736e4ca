//! End-to-end scenario tests for the node graph, driven by a scripted LLM.
//!
//! The scripted service pops canned responses in call order, so each test
//! writes down exactly the model turns it expects (router, architect,
//! supervisor, editor, ...) and then asserts the ordered event log.

use super::*;
use crate::bus::EventBus;
use crate::error::ErrorKind;
use crate::events::{EventPayload, TaskEvent};
use crate::llm::{
    Gateway, LlmError, LlmRequest, LlmResponse, LlmService, ModelRegistry, Usage,
};
use crate::plan::StepOutcome;
use crate::store::{Store, TaskStatus};
use crate::tools::{ToolRegistry, ToolTimeouts};
use crate::workspace::WorkspaceManager;
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

const SCRIPT_MODEL: &str = "scripted";
const CALL_USAGE: Usage = Usage {
    input_tokens: 10,
    output_tokens: 5,
};

struct ScriptedLlm {
    responses: Mutex<std::collections::VecDeque<String>>,
}

impl ScriptedLlm {
    fn new(responses: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.iter().map(|s| (*s).to_string()).collect()),
        })
    }
}

#[async_trait]
impl LlmService for ScriptedLlm {
    async fn complete(&self, _request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        let next = self.responses.lock().unwrap().pop_front();
        match next {
            Some(text) => Ok(LlmResponse {
                text,
                usage: CALL_USAGE,
            }),
            None => Err(LlmError::invalid_request("script exhausted")),
        }
    }

    fn model_id(&self) -> &str {
        SCRIPT_MODEL
    }
}

struct Fixture {
    manager: Arc<TaskManager>,
    _tmp: TempDir,
}

fn fixture_with_limits(script: &[&str], limits: Limits) -> Fixture {
    let tmp = TempDir::new().unwrap();
    let store = Store::open_in_memory().unwrap();
    let bus = EventBus::new(store);

    let mut registry = ModelRegistry::empty(SCRIPT_MODEL);
    registry.register(ScriptedLlm::new(script));
    let gateway = Arc::new(Gateway::new(Arc::new(registry), HashMap::new(), 0));

    let tools = Arc::new(ToolRegistry::standard(ToolTimeouts::default()));
    let workspaces = WorkspaceManager::new(tmp.path()).unwrap();

    let cfg = ControllerConfig {
        limits,
        node_retry_budget: 1,
        llm_timeout: Duration::from_secs(10),
        grace_period: Duration::from_secs(2),
    };

    let manager = TaskManager::new(bus, gateway, tools, workspaces, cfg, 8);
    Fixture {
        manager,
        _tmp: tmp,
    }
}

fn fixture(script: &[&str]) -> Fixture {
    fixture_with_limits(
        script,
        Limits {
            max_step_retries: 1,
            max_replans: 0,
        },
    )
}

/// Drain events until a terminal payload arrives (or panic after a timeout).
async fn collect_until_terminal(
    rx: &mut tokio::sync::broadcast::Receiver<TaskEvent>,
    collected: &mut Vec<TaskEvent>,
) {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for terminal event")
            .expect("event channel closed");
        let terminal = event.payload.is_terminal();
        collected.push(event);
        if terminal {
            return;
        }
    }
}

/// Wait for a specific event type to arrive.
async fn wait_for(
    rx: &mut tokio::sync::broadcast::Receiver<TaskEvent>,
    collected: &mut Vec<TaskEvent>,
    type_tag: &str,
) {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {type_tag}"))
            .expect("event channel closed");
        let found = event.payload.type_tag() == type_tag;
        collected.push(event);
        if found {
            return;
        }
    }
}

fn type_tags(events: &[TaskEvent]) -> Vec<&'static str> {
    events
        .iter()
        .map(|e| e.payload.type_tag())
        .filter(|t| *t != "token_usage")
        .collect()
}

fn assert_gapless(events: &[TaskEvent]) {
    for (i, event) in events.iter().enumerate() {
        assert_eq!(
            event.seq,
            i as i64 + 1,
            "seq must be gapless: {:?}",
            events.iter().map(|e| e.seq).collect::<Vec<_>>()
        );
    }
}

fn approve() -> ResumeInput {
    ResumeInput {
        decision: ResumeDecision::Approve,
        modified_plan: None,
        feedback: None,
    }
}

fn two_step_plan_json() -> String {
    json!([
        {
            "step_id": 1,
            "instruction": "write hello.txt",
            "tool_name": "write_file",
            "tool_input": {"file": "hello.txt", "content": "hi"},
            "expected_outcome": "hello.txt exists with content hi"
        },
        {
            "step_id": 2,
            "instruction": "list the workspace",
            "tool_name": "list_files",
            "tool_input": ".",
            "expected_outcome": "listing includes hello.txt"
        }
    ])
    .to_string()
}

fn success_verdict() -> String {
    json!({"outcome": "success", "reasoning": "expected outcome met"}).to_string()
}

// ==================== Scenarios ====================

#[tokio::test]
async fn direct_qa_answers_without_plan_events() {
    let fx = fixture(&[r#"{"route": "DIRECT_QA"}"#, "4"]);
    fx.manager.create_task(Some("t1".to_string()), None).unwrap();

    let (_, mut rx) = fx.manager.bus().subscribe("t1", 1).await.unwrap();
    fx.manager
        .run_agent("t1", "What is 2+2?", HashMap::new(), vec![])
        .await
        .unwrap();

    let mut events = Vec::new();
    collect_until_terminal(&mut rx, &mut events).await;

    assert_eq!(type_tags(&events), vec!["router_decision", "direct_answer"]);
    assert!(matches!(
        &events.last().unwrap().payload,
        EventPayload::DirectAnswer { text } if text == "4"
    ));
    assert_gapless(&events);

    let record = fx.manager.bus().store().get_task("t1").unwrap();
    assert_eq!(record.status, TaskStatus::Completed);
}

#[tokio::test]
async fn complex_task_happy_path_executes_approved_plan() {
    let fx = fixture(&[
        r#"{"route": "COMPLEX_TASK"}"#,
        &two_step_plan_json(),
        &success_verdict(),
        &success_verdict(),
        "Created hello.txt with content 'hi' and verified it in the workspace listing.",
    ]);
    fx.manager.create_task(Some("t1".to_string()), None).unwrap();

    let (_, mut rx) = fx.manager.bus().subscribe("t1", 1).await.unwrap();
    fx.manager
        .run_agent(
            "t1",
            "Create a file named hello.txt with content 'hi' and list the workspace.",
            HashMap::new(),
            vec!["write_file".to_string(), "list_files".to_string()],
        )
        .await
        .unwrap();

    let mut events = Vec::new();
    wait_for(&mut rx, &mut events, "plan_proposal").await;

    // The gate is open: the task is suspended with a persisted interrupt.
    let record = fx.manager.bus().store().get_task("t1").unwrap();
    assert_eq!(record.status, TaskStatus::AwaitingInput);
    assert!(record.pending_interrupt.is_some());

    fx.manager.resume("t1", approve()).await.unwrap();
    collect_until_terminal(&mut rx, &mut events).await;

    assert_eq!(
        type_tags(&events),
        vec![
            "router_decision",
            "architect_plan_generated",
            "plan_proposal",
            "foreman_step_prepared",
            "worker_step_executed",
            "supervisor_step_evaluated",
            "foreman_step_prepared",
            "worker_step_executed",
            "supervisor_step_evaluated",
            "editor_report_generated",
            "final_answer",
        ]
    );
    assert_gapless(&events);

    // Step 2's listing actually saw the file written by step 1.
    let listing = events
        .iter()
        .filter_map(|e| match &e.payload {
            EventPayload::WorkerStepExecuted { output, .. } => Some(output),
            _ => None,
        })
        .nth(1)
        .unwrap();
    assert!(listing.to_string().contains("hello.txt"));

    // The workspace holds the artifact.
    let ws = fx.manager.workspaces().handle("t1").unwrap();
    assert_eq!(ws.read_to_string("hello.txt").unwrap(), "hi");

    let record = fx.manager.bus().store().get_task("t1").unwrap();
    assert_eq!(record.status, TaskStatus::Completed);
    assert!(record.pending_interrupt.is_none());
}

#[tokio::test]
async fn token_usage_events_sum_to_task_totals() {
    let fx = fixture(&[r#"{"route": "DIRECT_QA"}"#, "4"]);
    fx.manager.create_task(Some("t1".to_string()), None).unwrap();

    let (_, mut rx) = fx.manager.bus().subscribe("t1", 1).await.unwrap();
    fx.manager
        .run_agent("t1", "What is 2+2?", HashMap::new(), vec![])
        .await
        .unwrap();

    let mut events = Vec::new();
    collect_until_terminal(&mut rx, &mut events).await;

    let mut summed: u64 = 0;
    for event in &events {
        if let EventPayload::TokenUsage { total, .. } = &event.payload {
            summed += total;
        }
    }
    assert!(summed > 0);

    let record = fx.manager.bus().store().get_task("t1").unwrap();
    let stored: u64 = record.token_totals.0.values().map(|t| t.total).sum();
    assert_eq!(summed, stored);
}

#[tokio::test]
async fn placeholder_pipes_step_output_into_next_step() {
    let plan = json!([
        {
            "step_id": 1,
            "instruction": "find the latest scikit-learn version",
            "tool_name": "None",
            "tool_input": "",
            "expected_outcome": "a version string"
        },
        {
            "step_id": 2,
            "instruction": "record the version",
            "tool_name": "write_file",
            "tool_input": {"file": "x.py", "content": "version='{step_1_output}'"},
            "expected_outcome": "x.py contains the version"
        }
    ])
    .to_string();

    let fx = fixture(&[
        r#"{"route": "COMPLEX_TASK"}"#,
        &plan,
        "1.5.1",
        &success_verdict(),
        &success_verdict(),
        "Recorded scikit-learn 1.5.1 in x.py.",
    ]);
    fx.manager.create_task(Some("t1".to_string()), None).unwrap();

    let (_, mut rx) = fx.manager.bus().subscribe("t1", 1).await.unwrap();
    fx.manager
        .run_agent("t1", "Record the latest scikit-learn version", HashMap::new(), vec![])
        .await
        .unwrap();

    let mut events = Vec::new();
    wait_for(&mut rx, &mut events, "plan_proposal").await;
    fx.manager.resume("t1", approve()).await.unwrap();
    collect_until_terminal(&mut rx, &mut events).await;

    let hydrated: Vec<_> = events
        .iter()
        .filter_map(|e| match &e.payload {
            EventPayload::ForemanStepPrepared {
                hydrated_tool_call, ..
            } => Some(hydrated_tool_call),
            _ => None,
        })
        .collect();
    assert_eq!(hydrated.len(), 2);
    assert_eq!(hydrated[1].args["content"], json!("version='1.5.1'"));

    let ws = fx.manager.workspaces().handle("t1").unwrap();
    assert_eq!(ws.read_to_string("x.py").unwrap(), "version='1.5.1'");
}

#[tokio::test]
async fn supervisor_retry_applies_revised_instruction() {
    let plan = json!([
        {
            "step_id": 1,
            "instruction": "read notes.txt",
            "tool_name": "read_file",
            "tool_input": {"path": "notes.txt"},
            "expected_outcome": "file content"
        }
    ])
    .to_string();
    let retry = json!({
        "outcome": "retry",
        "reasoning": "the file does not exist yet",
        "revised_instruction": "read notes.txt, creating it first if missing"
    })
    .to_string();
    let escalate = json!({
        "outcome": "escalate",
        "reasoning": "the file is genuinely absent"
    })
    .to_string();

    let fx = fixture(&[r#"{"route": "COMPLEX_TASK"}"#, &plan, &retry, &escalate]);
    fx.manager.create_task(Some("t1".to_string()), None).unwrap();

    let (_, mut rx) = fx.manager.bus().subscribe("t1", 1).await.unwrap();
    fx.manager
        .run_agent("t1", "Read my notes", HashMap::new(), vec![])
        .await
        .unwrap();

    let mut events = Vec::new();
    wait_for(&mut rx, &mut events, "plan_proposal").await;
    fx.manager.resume("t1", approve()).await.unwrap();
    collect_until_terminal(&mut rx, &mut events).await;

    assert_eq!(
        type_tags(&events),
        vec![
            "router_decision",
            "architect_plan_generated",
            "plan_proposal",
            "foreman_step_prepared",
            "worker_step_executed",
            "supervisor_step_evaluated",
            "foreman_step_prepared",
            "worker_step_executed",
            "supervisor_step_evaluated",
            "failed",
        ]
    );

    // The retried step carries the supervisor's revised instruction.
    let prepared: Vec<_> = events
        .iter()
        .filter_map(|e| match &e.payload {
            EventPayload::ForemanStepPrepared { step, .. } => Some(step.instruction.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(prepared[0], "read notes.txt");
    assert_eq!(
        prepared[1],
        "read notes.txt, creating it first if missing"
    );

    assert!(matches!(
        &events.last().unwrap().payload,
        EventPayload::Failed {
            reason: ErrorKind::PlanUnrecoverable,
            ..
        }
    ));
}

#[tokio::test]
async fn stop_during_tool_emits_single_task_cancelled() {
    let plan = json!([
        {
            "step_id": 1,
            "instruction": "wait a while",
            "tool_name": "run_script",
            "tool_input": {"command": "sleep 30"},
            "expected_outcome": "nothing"
        }
    ])
    .to_string();

    let fx = fixture(&[r#"{"route": "COMPLEX_TASK"}"#, &plan]);
    fx.manager.create_task(Some("t1".to_string()), None).unwrap();

    let (_, mut rx) = fx.manager.bus().subscribe("t1", 1).await.unwrap();
    fx.manager
        .run_agent("t1", "wait", HashMap::new(), vec![])
        .await
        .unwrap();

    let mut events = Vec::new();
    wait_for(&mut rx, &mut events, "plan_proposal").await;
    fx.manager.resume("t1", approve()).await.unwrap();
    wait_for(&mut rx, &mut events, "foreman_step_prepared").await;

    let stopped_at = std::time::Instant::now();
    fx.manager.stop("t1").await.unwrap();
    collect_until_terminal(&mut rx, &mut events).await;
    assert!(stopped_at.elapsed() < Duration::from_secs(10));

    let cancels = events
        .iter()
        .filter(|e| matches!(e.payload, EventPayload::TaskCancelled))
        .count();
    assert_eq!(cancels, 1);
    assert!(events.last().unwrap().payload.is_terminal());

    // No further events after the terminal one.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(matches!(
        rx.try_recv(),
        Err(tokio::sync::broadcast::error::TryRecvError::Empty)
    ));

    let record = fx.manager.bus().store().get_task("t1").unwrap();
    assert_eq!(record.status, TaskStatus::Idle);
}

#[tokio::test]
async fn path_escape_escalates_without_consulting_the_model() {
    let plan = json!([
        {
            "step_id": 1,
            "instruction": "write outside the sandbox",
            "tool_name": "write_file",
            "tool_input": {"file": "../../etc/passwd", "content": "x"},
            "expected_outcome": "never"
        }
    ])
    .to_string();

    // Note: no supervisor response in the script; the sandbox verdict is
    // synthesized deterministically.
    let fx = fixture(&[r#"{"route": "COMPLEX_TASK"}"#, &plan]);
    fx.manager.create_task(Some("t1".to_string()), None).unwrap();

    let (_, mut rx) = fx.manager.bus().subscribe("t1", 1).await.unwrap();
    fx.manager
        .run_agent("t1", "overwrite passwd", HashMap::new(), vec![])
        .await
        .unwrap();

    let mut events = Vec::new();
    wait_for(&mut rx, &mut events, "plan_proposal").await;
    fx.manager.resume("t1", approve()).await.unwrap();
    collect_until_terminal(&mut rx, &mut events).await;

    let worker = events
        .iter()
        .find_map(|e| match &e.payload {
            EventPayload::WorkerStepExecuted { output, .. } => Some(output.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(worker["error"], json!("path_escape"));

    let verdict = events
        .iter()
        .find_map(|e| match &e.payload {
            EventPayload::SupervisorStepEvaluated { evaluation } => Some(evaluation.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(verdict.outcome, StepOutcome::Escalate);

    assert!(matches!(
        &events.last().unwrap().payload,
        EventPayload::Failed {
            reason: ErrorKind::PlanUnrecoverable,
            ..
        }
    ));
}

#[tokio::test]
async fn board_path_collects_sequential_critiques() {
    let roster = json!({"experts": [
        {"name": "Ada", "specialty": "correctness"},
        {"name": "Grace", "specialty": "operability"}
    ]})
    .to_string();
    let draft = json!({
        "plan": [{
            "step_id": 1,
            "instruction": "summarize the request",
            "tool_name": "None",
            "tool_input": "",
            "expected_outcome": "a summary"
        }],
        "implementation_notes": "keep it short"
    })
    .to_string();
    let final_plan = draft.clone();

    let fx = fixture(&[
        r#"{"route": "PEER_REVIEW"}"#,
        &roster,
        &draft,
        "Step 1 is too vague.",
        "Looks fine operationally.",
        &final_plan,
        "A summary.",
        &success_verdict(),
        "Reviewed and summarized.",
    ]);
    fx.manager.create_task(Some("t1".to_string()), None).unwrap();

    let (_, mut rx) = fx.manager.bus().subscribe("t1", 1).await.unwrap();
    fx.manager
        .run_agent(
            "t1",
            "Have a board of experts review a summary plan",
            HashMap::new(),
            vec![],
        )
        .await
        .unwrap();

    let mut events = Vec::new();
    wait_for(&mut rx, &mut events, "board_approval_request").await;
    fx.manager.resume("t1", approve()).await.unwrap();
    wait_for(&mut rx, &mut events, "final_plan_approval_request").await;
    fx.manager.resume("t1", approve()).await.unwrap();
    collect_until_terminal(&mut rx, &mut events).await;

    assert_eq!(
        type_tags(&events),
        vec![
            "router_decision",
            "board_approval_request",
            "chair_plan_generated",
            "expert_critique_generated",
            "expert_critique_generated",
            "final_plan_approval_request",
            "foreman_step_prepared",
            "worker_step_executed",
            "supervisor_step_evaluated",
            "editor_report_generated",
            "final_answer",
        ]
    );

    let critiques: Vec<_> = events
        .iter()
        .filter_map(|e| match &e.payload {
            EventPayload::ExpertCritiqueGenerated { critique } => Some(critique.expert.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(critiques, vec!["Ada".to_string(), "Grace".to_string()]);
}

// ==================== Command ordering ====================

#[tokio::test]
async fn duplicate_resume_is_rejected_and_state_unchanged() {
    let fx = fixture(&[
        r#"{"route": "COMPLEX_TASK"}"#,
        &two_step_plan_json(),
        &success_verdict(),
        &success_verdict(),
        "done",
    ]);
    fx.manager.create_task(Some("t1".to_string()), None).unwrap();

    let (_, mut rx) = fx.manager.bus().subscribe("t1", 1).await.unwrap();
    fx.manager
        .run_agent("t1", "make files", HashMap::new(), vec![])
        .await
        .unwrap();

    let mut events = Vec::new();
    wait_for(&mut rx, &mut events, "plan_proposal").await;
    fx.manager.resume("t1", approve()).await.unwrap();
    collect_until_terminal(&mut rx, &mut events).await;

    let err = fx.manager.resume("t1", approve()).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::NoPendingInterrupt);
}

#[tokio::test]
async fn run_agent_rejected_while_awaiting_approval() {
    let fx = fixture(&[r#"{"route": "COMPLEX_TASK"}"#, &two_step_plan_json()]);
    fx.manager.create_task(Some("t1".to_string()), None).unwrap();

    let (_, mut rx) = fx.manager.bus().subscribe("t1", 1).await.unwrap();
    fx.manager
        .run_agent("t1", "make files", HashMap::new(), vec![])
        .await
        .unwrap();
    let mut events = Vec::new();
    wait_for(&mut rx, &mut events, "plan_proposal").await;

    let err = fx
        .manager
        .run_agent("t1", "another prompt", HashMap::new(), vec![])
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::TaskBusy);
}

#[tokio::test]
async fn resume_with_no_run_reports_no_pending_interrupt() {
    let fx = fixture(&[]);
    fx.manager.create_task(Some("t1".to_string()), None).unwrap();
    let err = fx.manager.resume("t1", approve()).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::NoPendingInterrupt);
}

#[tokio::test]
async fn stop_on_idle_task_is_a_noop() {
    let fx = fixture(&[]);
    fx.manager.create_task(Some("t1".to_string()), None).unwrap();
    fx.manager.stop("t1").await.unwrap();
    assert_eq!(fx.manager.bus().store().last_seq("t1").unwrap(), 0);
}

#[tokio::test]
async fn modify_resume_validates_plan_against_enabled_tools() {
    let fx = fixture(&[r#"{"route": "COMPLEX_TASK"}"#, &two_step_plan_json()]);
    fx.manager.create_task(Some("t1".to_string()), None).unwrap();

    let (_, mut rx) = fx.manager.bus().subscribe("t1", 1).await.unwrap();
    fx.manager
        .run_agent(
            "t1",
            "make files",
            HashMap::new(),
            vec!["write_file".to_string(), "list_files".to_string()],
        )
        .await
        .unwrap();
    let mut events = Vec::new();
    wait_for(&mut rx, &mut events, "plan_proposal").await;

    // A modified plan naming a tool outside the run's enabled set re-opens
    // the gate with plan_invalid.
    let bad_plan = serde_json::from_value(json!([
        {
            "step_id": 1,
            "instruction": "run something",
            "tool_name": "run_script",
            "tool_input": {"command": "echo hi"},
            "expected_outcome": "output"
        }
    ]))
    .unwrap();
    let err = fx
        .manager
        .resume(
            "t1",
            ResumeInput {
                decision: ResumeDecision::Modify,
                modified_plan: Some(bad_plan),
                feedback: None,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::PlanInvalid);

    // The gate is still open: an approve still works.
    let record = fx.manager.bus().store().get_task("t1").unwrap();
    assert_eq!(record.status, TaskStatus::AwaitingInput);
}

#[tokio::test]
async fn plan_rejection_cancels_the_run() {
    let fx = fixture(&[r#"{"route": "COMPLEX_TASK"}"#, &two_step_plan_json()]);
    fx.manager.create_task(Some("t1".to_string()), None).unwrap();

    let (_, mut rx) = fx.manager.bus().subscribe("t1", 1).await.unwrap();
    fx.manager
        .run_agent("t1", "make files", HashMap::new(), vec![])
        .await
        .unwrap();
    let mut events = Vec::new();
    wait_for(&mut rx, &mut events, "plan_proposal").await;

    fx.manager
        .resume(
            "t1",
            ResumeInput {
                decision: ResumeDecision::Reject,
                modified_plan: None,
                feedback: Some("not what I wanted".to_string()),
            },
        )
        .await
        .unwrap();

    collect_until_terminal(&mut rx, &mut events).await;
    assert!(matches!(
        events.last().unwrap().payload,
        EventPayload::TaskCancelled
    ));
    let record = fx.manager.bus().store().get_task("t1").unwrap();
    assert!(record.pending_interrupt.is_none());
}

#[tokio::test]
async fn llm_parse_error_after_single_reprompt_fails_run() {
    // The architect returns prose twice; one automatic re-prompt is allowed,
    // then the run fails with llm_parse_error.
    let fx = fixture(&[
        r#"{"route": "COMPLEX_TASK"}"#,
        "I would rather describe the plan in prose.",
        "Still prose, sorry.",
    ]);
    fx.manager.create_task(Some("t1".to_string()), None).unwrap();

    let (_, mut rx) = fx.manager.bus().subscribe("t1", 1).await.unwrap();
    fx.manager
        .run_agent("t1", "make files", HashMap::new(), vec![])
        .await
        .unwrap();

    let mut events = Vec::new();
    collect_until_terminal(&mut rx, &mut events).await;
    assert!(matches!(
        &events.last().unwrap().payload,
        EventPayload::Failed {
            reason: ErrorKind::LlmParseError,
            ..
        }
    ));

    // Both model calls were billed.
    let usage_events = events
        .iter()
        .filter(|e| matches!(e.payload, EventPayload::TokenUsage { .. }))
        .count();
    assert_eq!(usage_events, 3); // router + two architect attempts
}
