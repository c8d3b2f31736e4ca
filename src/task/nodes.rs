//! Prompt construction and response parsing for each reasoning node.
//!
//! The controller matches on [`super::effect::Node`], builds the
//! corresponding [`NodeCall`], sends it through the gateway, and feeds the
//! parsed result back into the transition function. Parsers are tolerant of
//! fenced and prose-wrapped JSON (see `llm::parse`) but never guess at
//! semantics: a response that parses into the wrong shape is a parse error.

use crate::llm::parse::extract_json;
use crate::llm::{CallOptions, ChatMessage, Role};
use crate::plan::{Critique, Evaluation, Expert, Plan, Route, ToolCall};
use crate::tools::{ToolInfo, ToolOutcome};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeSet;

/// One prepared gateway invocation.
#[derive(Debug, Clone)]
pub struct NodeCall {
    pub role: Role,
    pub system: String,
    pub messages: Vec<ChatMessage>,
    pub options: CallOptions,
}

/// Reminder appended for the single automatic re-prompt after a structured
/// output parse failure.
pub const STRICT_FORMAT_REMINDER: &str =
    "Your previous reply could not be parsed. Respond with ONLY the requested JSON, \
     formatted strictly as the schema describes, with no commentary and no code fences.";

// ============================================================
// Router
// ============================================================

const ROUTER_SYSTEM: &str = "\
You are the router for a research assistant. Classify the user's request into \
exactly one of three categories:

- DIRECT_QA: a question answerable directly from knowledge, no tools or files needed.
- COMPLEX_TASK: work that needs a step-by-step plan using tools (files, search, scripts).
- PEER_REVIEW: a request that explicitly asks for review by a board of experts, or for \
multiple expert perspectives on a plan.

Respond with JSON: {\"route\": \"DIRECT_QA\" | \"COMPLEX_TASK\" | \"PEER_REVIEW\"}";

pub fn router_call(prompt: &str) -> NodeCall {
    NodeCall {
        role: Role::Router,
        system: ROUTER_SYSTEM.to_string(),
        messages: vec![ChatMessage::user(prompt)],
        options: CallOptions {
            temperature: Some(0.0),
            max_tokens: Some(128),
            schema_hint: None,
        },
    }
}

#[derive(Debug, Deserialize)]
struct RouterVerdict {
    route: String,
}

/// Parse the router label. Unknown or unparseable labels default to
/// `DIRECT_QA`, which is the cheapest safe route.
pub fn parse_route(text: &str) -> Route {
    let label = extract_json::<RouterVerdict>(text)
        .map(|v| v.route)
        .unwrap_or_else(|_| text.to_string());
    let upper = label.to_uppercase();
    if upper.contains("PEER_REVIEW") {
        Route::PeerReview
    } else if upper.contains("COMPLEX_TASK") {
        Route::ComplexTask
    } else {
        Route::DirectQa
    }
}

// ============================================================
// Librarian
// ============================================================

const LIBRARIAN_SYSTEM: &str = "\
You are a knowledgeable research librarian. Answer the user's question \
directly, accurately, and concisely. Do not mention tools or plans.";

pub fn librarian_call(prompt: &str) -> NodeCall {
    NodeCall {
        role: Role::Librarian,
        system: LIBRARIAN_SYSTEM.to_string(),
        messages: vec![ChatMessage::user(prompt)],
        options: CallOptions::default(),
    }
}

// ============================================================
// Architect
// ============================================================

const PLAN_SCHEMA_HINT: &str = r#"Respond with JSON only: an array of steps, each
{"step_id": <1-based integer>, "instruction": "...", "tool_name": "<tool name or \"None\">",
 "tool_input": <string or object, may embed {step_N_output} placeholders>,
 "expected_outcome": "..."}"#;

fn tool_catalog(tools: &[ToolInfo], enabled: &BTreeSet<String>) -> String {
    let mut lines = Vec::new();
    for tool in tools {
        if !enabled.contains(&tool.name) {
            continue;
        }
        lines.push(format!(
            "- {}: {}\n  input schema: {}",
            tool.name, tool.description, tool.schema
        ));
    }
    if lines.is_empty() {
        "(no tools enabled; every step must use tool_name \"None\")".to_string()
    } else {
        lines.join("\n")
    }
}

pub fn architect_call(
    prompt: &str,
    failure_context: &[String],
    tools: &[ToolInfo],
    enabled: &BTreeSet<String>,
) -> NodeCall {
    let system = format!(
        "You are the architect for a research assistant. Decompose the user's request \
         into an ordered plan of concrete steps.\n\n\
         Available tools:\n{}\n\n\
         Rules:\n\
         - step_id values form a dense 1-based sequence.\n\
         - tool_name is one of the tools above, or \"None\" for a reasoning-only step.\n\
         - tool_input may reference earlier outputs with {{step_N_output}} placeholders; \
           N must be an earlier step.\n\
         - expected_outcome states how a supervisor can check the step worked.",
        tool_catalog(tools, enabled)
    );

    let mut content = prompt.to_string();
    if !failure_context.is_empty() {
        content.push_str("\n\nEarlier attempts at this task failed. Produce a revised plan that avoids these failures:\n");
        for entry in failure_context {
            content.push_str("- ");
            content.push_str(entry);
            content.push('\n');
        }
    }

    NodeCall {
        role: Role::Architect,
        system,
        messages: vec![ChatMessage::user(content)],
        options: CallOptions {
            temperature: Some(0.2),
            max_tokens: None,
            schema_hint: Some(PLAN_SCHEMA_HINT.to_string()),
        },
    }
}

#[derive(Debug, Deserialize)]
struct PlanEnvelope {
    plan: Plan,
}

/// Parse a plan from model output: a bare step array or `{"plan": [...]}`.
pub fn parse_plan(text: &str) -> Result<Plan, String> {
    if let Ok(plan) = extract_json::<Plan>(text) {
        return Ok(plan);
    }
    extract_json::<PlanEnvelope>(text)
        .map(|e| e.plan)
        .map_err(|e| e.to_string())
}

// ============================================================
// Board of experts
// ============================================================

const ROSTER_SYSTEM: &str = "\
You are the chair of a board of experts reviewing a research request. Propose \
a small roster (two to four members) of expert personas whose perspectives \
would materially improve the plan.

Respond with JSON: {\"experts\": [{\"name\": \"...\", \"specialty\": \"...\"}]}";

pub fn roster_call(prompt: &str) -> NodeCall {
    NodeCall {
        role: Role::BoardChair,
        system: ROSTER_SYSTEM.to_string(),
        messages: vec![ChatMessage::user(prompt)],
        options: CallOptions {
            temperature: Some(0.5),
            max_tokens: Some(512),
            schema_hint: None,
        },
    }
}

#[derive(Debug, Deserialize)]
struct RosterEnvelope {
    experts: Vec<Expert>,
}

pub fn parse_roster(text: &str) -> Result<Vec<Expert>, String> {
    let experts = if let Ok(env) = extract_json::<RosterEnvelope>(text) {
        env.experts
    } else {
        extract_json::<Vec<Expert>>(text).map_err(|e| e.to_string())?
    };
    if experts.is_empty() {
        return Err("roster must name at least one expert".to_string());
    }
    Ok(experts)
}

pub fn chair_draft_call(
    prompt: &str,
    experts: &[Expert],
    tools: &[ToolInfo],
    enabled: &BTreeSet<String>,
) -> NodeCall {
    let roster = experts
        .iter()
        .map(|e| format!("- {} ({})", e.name, e.specialty))
        .collect::<Vec<_>>()
        .join("\n");
    let system = format!(
        "You chair a board of experts:\n{roster}\n\n\
         Draft an initial plan for the request below; the board will critique it. \
         \n\nAvailable tools:\n{}\n\n\
         Respond with JSON: {{\"plan\": [steps as specified], \"implementation_notes\": \"...\"}}",
        tool_catalog(tools, enabled)
    );
    NodeCall {
        role: Role::BoardChair,
        system,
        messages: vec![ChatMessage::user(prompt)],
        options: CallOptions {
            temperature: Some(0.3),
            max_tokens: None,
            schema_hint: Some(PLAN_SCHEMA_HINT.to_string()),
        },
    }
}

#[derive(Debug, Deserialize)]
struct DraftEnvelope {
    plan: Plan,
    #[serde(default)]
    implementation_notes: Option<String>,
}

pub fn parse_draft(text: &str) -> Result<(Plan, Option<String>), String> {
    if let Ok(env) = extract_json::<DraftEnvelope>(text) {
        return Ok((env.plan, env.implementation_notes));
    }
    parse_plan(text).map(|p| (p, None))
}

pub fn expert_critique_call(prompt: &str, expert: &Expert, draft: &Plan) -> NodeCall {
    let system = format!(
        "You are {name}, an expert in {specialty}, reviewing a proposed plan. \
         Critique it from your specialty's point of view: name concrete risks, \
         missing steps, and improvements. Be brief and specific.",
        name = expert.name,
        specialty = expert.specialty,
    );
    let plan_json = serde_json::to_string_pretty(draft).unwrap_or_default();
    let content = format!("Request:\n{prompt}\n\nDraft plan:\n{plan_json}");
    NodeCall {
        role: Role::BoardExpert,
        system,
        messages: vec![ChatMessage::user(content)],
        options: CallOptions {
            temperature: Some(0.6),
            max_tokens: Some(1024),
            schema_hint: None,
        },
    }
}

pub fn chair_final_call(
    prompt: &str,
    draft: &Plan,
    critiques: &[Critique],
    tools: &[ToolInfo],
    enabled: &BTreeSet<String>,
) -> NodeCall {
    let critique_text = critiques
        .iter()
        .map(|c| format!("{}: {}", c.expert, c.critique))
        .collect::<Vec<_>>()
        .join("\n");
    let draft_json = serde_json::to_string_pretty(draft).unwrap_or_default();
    let system = format!(
        "You chair a board of experts. Synthesize the final plan from your draft and \
         the board's critiques.\n\nAvailable tools:\n{}\n\n\
         Respond with JSON: {{\"plan\": [steps as specified], \"implementation_notes\": \"...\"}}",
        tool_catalog(tools, enabled)
    );
    let content = format!(
        "Request:\n{prompt}\n\nYour draft:\n{draft_json}\n\nBoard critiques:\n{critique_text}"
    );
    NodeCall {
        role: Role::BoardChair,
        system,
        messages: vec![ChatMessage::user(content)],
        options: CallOptions {
            temperature: Some(0.2),
            max_tokens: None,
            schema_hint: Some(PLAN_SCHEMA_HINT.to_string()),
        },
    }
}

// ============================================================
// Worker (LLM-only steps)
// ============================================================

const WORKER_SYSTEM: &str = "\
You are a diligent worker executing one step of an approved plan. Produce the \
step's output directly; no preamble, no commentary about the plan.";

pub fn worker_llm_call(instruction: &str, hydrated_input: &Value) -> NodeCall {
    let mut content = format!("Step instruction: {instruction}");
    match hydrated_input {
        Value::Null => {}
        Value::String(s) if s.is_empty() => {}
        other => {
            let rendered = match other {
                Value::String(s) => s.clone(),
                v => v.to_string(),
            };
            content.push_str("\n\nInput:\n");
            content.push_str(&rendered);
        }
    }
    NodeCall {
        role: Role::Worker,
        system: WORKER_SYSTEM.to_string(),
        messages: vec![ChatMessage::user(content)],
        options: CallOptions::default(),
    }
}

// ============================================================
// Supervisor
// ============================================================

const SUPERVISOR_SYSTEM: &str = "\
You supervise step execution for a research assistant. Judge whether the step \
achieved its expected outcome.

Rules:
- Treat empty, placeholder-like, or content-free outputs as failures even if \
the tool reported success.
- outcome \"success\": the expected outcome was achieved.
- outcome \"retry\": the step failed but a revised instruction could fix it; \
include revised_instruction.
- outcome \"escalate\": the step failed in a way retrying cannot fix (wrong \
plan, sandbox violation, impossible input).

Respond with JSON: {\"outcome\": \"success\" | \"retry\" | \"escalate\", \
\"reasoning\": \"...\", \"revised_instruction\": \"...\" (optional)}";

pub fn supervisor_call(
    step: &crate::plan::PlanStep,
    call: &ToolCall,
    outcome: &ToolOutcome,
) -> NodeCall {
    let error_line = match &outcome.error {
        Some(fault) => format!("{} ({})", fault.message, fault.kind),
        None => "none".to_string(),
    };
    let content = format!(
        "Step {}: {}\nExpected outcome: {}\nTool call: {} {}\nTool output: {}\nError: {}",
        step.step_id,
        step.instruction,
        step.expected_outcome,
        call.tool_name,
        call.args,
        outcome.output,
        error_line,
    );
    NodeCall {
        role: Role::Supervisor,
        system: SUPERVISOR_SYSTEM.to_string(),
        messages: vec![ChatMessage::user(content)],
        options: CallOptions {
            temperature: Some(0.0),
            max_tokens: Some(1024),
            schema_hint: None,
        },
    }
}

pub fn parse_evaluation(text: &str) -> Result<Evaluation, String> {
    extract_json::<Evaluation>(text).map_err(|e| e.to_string())
}

// ============================================================
// Editor
// ============================================================

const EDITOR_SYSTEM: &str = "\
You are the editor producing the final report for a completed research task. \
Write a clear, well-organized answer to the original request using the step \
results below. Address the user directly; do not describe the plan mechanics.";

pub fn editor_call(prompt: &str, plan: &Plan) -> NodeCall {
    let mut content = format!("Original request:\n{prompt}\n\nCompleted steps:\n");
    for step in &plan.steps {
        let output = step
            .actual_output
            .as_ref()
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .unwrap_or_else(|| "(no output)".to_string());
        content.push_str(&format!(
            "{}. {} -> {}\n",
            step.step_id, step.instruction, output
        ));
    }
    NodeCall {
        role: Role::Editor,
        system: EDITOR_SYSTEM.to_string(),
        messages: vec![ChatMessage::user(content)],
        options: CallOptions::default(),
    }
}
