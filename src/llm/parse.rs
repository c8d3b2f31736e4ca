//! Defensive parsing of structured LLM output.
//!
//! Nodes that expect JSON (Router, Architect, Supervisor, Chair) get
//! responses that may be raw JSON, fenced JSON, or JSON embedded in prose.
//! `extract_json` tries each shape in order. It never evaluates anything and
//! never guesses beyond the first balanced JSON value it finds.

use serde::de::DeserializeOwned;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("could not parse structured output: {detail}")]
pub struct ParseError {
    pub detail: String,
}

/// Deserialize a `T` from model output text.
pub fn extract_json<T: DeserializeOwned>(text: &str) -> Result<T, ParseError> {
    let trimmed = text.trim();

    // 1. The whole response is JSON.
    if let Ok(value) = serde_json::from_str::<T>(trimmed) {
        return Ok(value);
    }

    // 2. A fenced block (```json ... ``` or bare ``` ... ```).
    if let Some(block) = fenced_block(trimmed) {
        if let Ok(value) = serde_json::from_str::<T>(block.trim()) {
            return Ok(value);
        }
    }

    // 3. First balanced object or array embedded in prose.
    if let Some(candidate) = balanced_json(trimmed) {
        if let Ok(value) = serde_json::from_str::<T>(candidate) {
            return Ok(value);
        }
    }

    Err(ParseError {
        detail: format!(
            "no parseable JSON in response ({} chars)",
            trimmed.chars().count()
        ),
    })
}

fn fenced_block(text: &str) -> Option<&str> {
    let start = text.find("```")?;
    let after_fence = &text[start + 3..];
    // Skip an optional language tag up to the first newline.
    let body_start = after_fence.find('\n')? + 1;
    let body = &after_fence[body_start..];
    let end = body.find("```")?;
    Some(&body[..end])
}

/// Slice out the first balanced `{...}` or `[...]`, respecting strings.
fn balanced_json(text: &str) -> Option<&str> {
    let open_idx = text.find(['{', '['])?;
    let bytes = text.as_bytes();
    let open = bytes[open_idx];
    let close = if open == b'{' { b'}' } else { b']' };

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(open_idx) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b if b == open => depth += 1,
            b if b == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[open_idx..=i]);
                }
            }
            _ => {}
        }
    }
    None
}
