//! Placeholder hydration for plan step inputs.
//!
//! Step templates may embed `{step_N_output}` markers in string values.
//! Hydration replaces each marker with the recorded output of step N: a
//! textual splice when the output is a string, compact JSON otherwise. A
//! marker that is the *entire* string is replaced by the referenced value
//! itself, preserving structure. The engine never evaluates anything; it is
//! pure substitution over the string leaves of a JSON value.

use regex::Regex;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::OnceLock;
use thiserror::Error;

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{step_(\d+)_output\}").expect("placeholder regex"))
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("placeholder {{step_{0}_output}} does not match any completed step")]
    Unresolved(u32),
}

/// Collect every step id referenced by placeholders anywhere in `template`.
pub fn references(template: &Value) -> BTreeSet<u32> {
    let mut refs = BTreeSet::new();
    collect(template, &mut refs);
    refs
}

fn collect(value: &Value, refs: &mut BTreeSet<u32>) {
    match value {
        Value::String(s) => {
            for cap in placeholder_re().captures_iter(s) {
                if let Ok(n) = cap[1].parse::<u32>() {
                    refs.insert(n);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                collect(item, refs);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect(item, refs);
            }
        }
        _ => {}
    }
}

/// Substitute placeholders throughout `template` using `outputs` (completed
/// step id → recorded output).
pub fn hydrate(template: &Value, outputs: &HashMap<u32, Value>) -> Result<Value, TemplateError> {
    match template {
        Value::String(s) => hydrate_string(s, outputs),
        Value::Array(items) => {
            let hydrated = items
                .iter()
                .map(|item| hydrate(item, outputs))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::Array(hydrated))
        }
        Value::Object(map) => {
            let mut hydrated = serde_json::Map::with_capacity(map.len());
            for (key, item) in map {
                hydrated.insert(key.clone(), hydrate(item, outputs)?);
            }
            Ok(Value::Object(hydrated))
        }
        other => Ok(other.clone()),
    }
}

fn hydrate_string(s: &str, outputs: &HashMap<u32, Value>) -> Result<Value, TemplateError> {
    let re = placeholder_re();

    // A string that is exactly one placeholder keeps the referenced value's
    // structure instead of flattening it to text.
    if let Some(cap) = re.captures(s) {
        if cap.get(0).map(|m| (m.start(), m.end())) == Some((0, s.len())) {
            let n: u32 = cap[1].parse().unwrap_or(0);
            return outputs
                .get(&n)
                .cloned()
                .ok_or(TemplateError::Unresolved(n));
        }
    }

    let mut result = String::with_capacity(s.len());
    let mut last = 0;
    for cap in re.captures_iter(s) {
        let m = cap.get(0).expect("whole-match group");
        let n: u32 = cap[1].parse().unwrap_or(0);
        let output = outputs.get(&n).ok_or(TemplateError::Unresolved(n))?;

        result.push_str(&s[last..m.start()]);
        match output {
            Value::String(text) => result.push_str(text),
            other => result.push_str(&other.to_string()),
        }
        last = m.end();
    }
    result.push_str(&s[last..]);
    Ok(Value::String(result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn outputs() -> HashMap<u32, Value> {
        let mut map = HashMap::new();
        map.insert(1, json!("1.5.1"));
        map.insert(2, json!({"count": 3}));
        map
    }

    #[test]
    fn textual_substitution_in_string_template() {
        let template = json!("version='{step_1_output}'");
        let hydrated = hydrate(&template, &outputs()).unwrap();
        assert_eq!(hydrated, json!("version='1.5.1'"));
    }

    #[test]
    fn structured_output_serialized_compact_in_string_context() {
        let template = json!("result: {step_2_output}!");
        let hydrated = hydrate(&template, &outputs()).unwrap();
        assert_eq!(hydrated, json!("result: {\"count\":3}!"));
    }

    #[test]
    fn whole_string_placeholder_preserves_structure() {
        let template = json!("{step_2_output}");
        let hydrated = hydrate(&template, &outputs()).unwrap();
        assert_eq!(hydrated, json!({"count": 3}));
    }

    #[test]
    fn map_templates_hydrate_nested_string_leaves() {
        let template = json!({
            "file": "x.py",
            "content": "version='{step_1_output}'",
            "meta": {"from": "{step_1_output}", "depth": 2}
        });
        let hydrated = hydrate(&template, &outputs()).unwrap();
        assert_eq!(hydrated["content"], json!("version='1.5.1'"));
        assert_eq!(hydrated["meta"]["from"], json!("1.5.1"));
        assert_eq!(hydrated["meta"]["depth"], json!(2));
    }

    #[test]
    fn unresolved_reference_is_an_error() {
        let template = json!("{step_9_output}");
        assert_eq!(
            hydrate(&template, &outputs()),
            Err(TemplateError::Unresolved(9))
        );
    }

    #[test]
    fn references_found_in_arrays_and_maps() {
        let template = json!({
            "a": ["{step_3_output}", {"b": "{step_1_output}"}],
            "c": "{step_2_output} and {step_3_output}"
        });
        let refs: Vec<u32> = references(&template).into_iter().collect();
        assert_eq!(refs, vec![1, 2, 3]);
    }

    #[test]
    fn non_placeholder_braces_left_alone() {
        let template = json!("set {x} to {step_1_output}");
        let hydrated = hydrate(&template, &outputs()).unwrap();
        assert_eq!(hydrated, json!("set {x} to 1.5.1"));
    }

    proptest! {
        // Templates without placeholders hydrate to themselves.
        #[test]
        fn no_placeholder_is_identity(s in "[a-zA-Z0-9 _.{}]*") {
            prop_assume!(!placeholder_re().is_match(&s));
            let template = Value::String(s);
            let hydrated = hydrate(&template, &outputs()).unwrap();
            prop_assert_eq!(hydrated, template);
        }

        // Every reference reported by `references` is either resolvable or
        // makes hydration fail; hydration never fabricates output.
        #[test]
        fn hydration_agrees_with_references(n in 0u32..6) {
            let template = Value::String(format!("x {{step_{n}_output}} y"));
            let refs = references(&template);
            prop_assert!(refs.contains(&n));
            let result = hydrate(&template, &outputs());
            if outputs().contains_key(&n) {
                prop_assert!(result.is_ok());
            } else {
                prop_assert_eq!(result, Err(TemplateError::Unresolved(n)));
            }
        }
    }
}
