use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde_json::{Map, Value};

use crate::state::ExecutionState;

fn reference_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{([^}]+)\}\}").expect("valid regex"))
}

/// Whether `text` contains at least one `{{...}}` reference.
pub fn has_reference(text: &str) -> bool {
    reference_re().is_match(text)
}

/// Expand every reference in `template` to text.
///
/// Paths are looked up as `sys.<key>`, `conversation.<key>`,
/// `<node_id>.<key>`, then as a bare name in the run inputs and the transient
/// variables. Unresolved references and nulls stay verbatim, and substituted
/// text is never re-scanned.
pub fn resolve(template: &str, state: &ExecutionState) -> String {
    if !template.contains("{{") {
        return template.to_string();
    }
    reference_re()
        .replace_all(template, |caps: &Captures| match lookup(caps[1].trim(), state) {
            Some(value) if !value.is_null() => value_to_text(value),
            _ => caps[0].to_string(),
        })
        .into_owned()
}

/// Like [`resolve`], but a template that is exactly one reference yields the
/// referenced JSON value itself.
pub fn resolve_value(template: &str, state: &ExecutionState) -> Value {
    let trimmed = template.trim();
    if let Some(caps) = reference_re().captures(trimmed) {
        if caps.get(0).is_some_and(|m| m.start() == 0 && m.end() == trimmed.len()) {
            if let Some(value) = lookup(caps[1].trim(), state) {
                if !value.is_null() {
                    return value.clone();
                }
            }
        }
    }
    Value::String(resolve(template, state))
}

/// Resolve every string inside a JSON structure; keys are left alone.
pub fn resolve_deep(value: &Value, state: &ExecutionState) -> Value {
    match value {
        Value::String(s) => Value::String(resolve(s, state)),
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_deep(v, state)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_deep(v, state)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Find the value a reference path points at.
pub fn lookup<'a>(path: &str, state: &'a ExecutionState) -> Option<&'a Value> {
    let mut segments = path.split('.').map(str::trim);
    let head = segments.next()?;
    let rest: Vec<&str> = segments.collect();

    match head {
        "sys" if !rest.is_empty() => {
            return walk(state.system_variables.get(rest[0])?, &rest[1..]);
        }
        "conversation" if !rest.is_empty() => {
            return walk(state.conversation_variables.get(rest[0])?, &rest[1..]);
        }
        _ => {}
    }

    if !rest.is_empty() {
        if let Some(output) = state.output(head) {
            return match output {
                Value::Object(map) => walk(map.get(rest[0])?, &rest[1..]),
                // A scalar output stands for every key of its node.
                other => Some(other),
            };
        }
    }

    scope_lookup(&state.inputs, head, &rest).or_else(|| scope_lookup(&state.variables, head, &rest))
}

fn scope_lookup<'a>(scope: &'a Map<String, Value>, head: &str, rest: &[&str]) -> Option<&'a Value> {
    walk(scope.get(head)?, rest)
}

fn walk<'a>(mut value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    for segment in path {
        value = match value {
            Value::Object(map) => map.get(*segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(value)
}

/// Strings render raw, everything else as compact JSON.
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Find a variable by bare name: `{{...}}` templates are resolved, otherwise
/// the run inputs are consulted, then the first node output carrying the key.
pub fn find_variable(name: &str, state: &ExecutionState) -> Option<Value> {
    if has_reference(name) {
        return Some(resolve_value(name, state));
    }
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    if let Some(v) = state.inputs.get(name) {
        return Some(v.clone());
    }
    state
        .outputs()
        .find_map(|(_, output)| output.as_object().and_then(|o| o.get(name)))
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state() -> ExecutionState {
        let mut inputs = Map::new();
        inputs.insert("name".into(), json!("Ada"));
        inputs.insert("user".into(), json!({"tags": ["a", "b"]}));
        inputs.insert("missing".into(), Value::Null);
        let mut state = ExecutionState::new(inputs);
        state.set_output("llm_1", json!({"text": "hello", "meta": {"tokens": 12}}));
        state.set_output("raw", json!("plain"));
        state.system_variables.insert("conversation_id".into(), json!("c-1"));
        state.conversation_variables.insert("topic".into(), json!("rust"));
        state.variables.insert("count".into(), json!(3));
        state
    }

    #[test]
    fn test_scopes() {
        let s = state();
        assert_eq!(resolve("{{sys.conversation_id}}", &s), "c-1");
        assert_eq!(resolve("{{conversation.topic}}", &s), "rust");
        assert_eq!(resolve("{{ llm_1.text }}!", &s), "hello!");
        assert_eq!(resolve("{{llm_1.meta.tokens}}", &s), "12");
        assert_eq!(resolve("{{raw.anything}}", &s), "plain");
        assert_eq!(resolve("Hi {{name}}", &s), "Hi Ada");
        assert_eq!(resolve("{{user.tags.1}}", &s), "b");
        assert_eq!(resolve("n={{count}}", &s), "n=3");
    }

    #[test]
    fn test_unresolved_and_null_stay_verbatim() {
        let s = state();
        assert_eq!(resolve("{{nope}} {{llm_1.nope}}", &s), "{{nope}} {{llm_1.nope}}");
        assert_eq!(resolve("{{missing}}", &s), "{{missing}}");
        assert_eq!(resolve("no refs", &s), "no refs");
    }

    #[test]
    fn test_non_strings_render_as_compact_json() {
        let s = state();
        assert_eq!(resolve("{{user.tags}}", &s), r#"["a","b"]"#);
        assert_eq!(resolve("{{llm_1.meta}}", &s), r#"{"tokens":12}"#);
    }

    #[test]
    fn test_resolution_is_not_recursive() {
        let mut s = state();
        s.inputs.insert("evil".into(), json!("{{name}}"));
        assert_eq!(resolve("{{evil}}", &s), "{{name}}");
    }

    #[test]
    fn test_resolution_idempotent_on_brace_free_output() {
        let s = state();
        let once = resolve("{{name}} has {{count}} items in {{conversation.topic}}", &s);
        assert!(!once.contains("{{"));
        assert_eq!(resolve(&once, &s), once);
    }

    #[test]
    fn test_resolve_value_typed() {
        let s = state();
        assert_eq!(resolve_value("{{user.tags}}", &s), json!(["a", "b"]));
        assert_eq!(resolve_value(" {{count}} ", &s), json!(3));
        assert_eq!(resolve_value("{{count}} items", &s), json!("3 items"));
        assert_eq!(resolve_value("{{nope}}", &s), json!("{{nope}}"));
    }

    #[test]
    fn test_resolve_deep() {
        let s = state();
        let v = resolve_deep(&json!({"q": "{{name}}", "list": ["{{count}}", 1], "{{name}}": true}), &s);
        assert_eq!(v, json!({"q": "Ada", "list": ["3", 1], "{{name}}": true}));
    }

    #[test]
    fn test_find_variable_order() {
        let s = state();
        assert_eq!(find_variable("name", &s), Some(json!("Ada")));
        assert_eq!(find_variable("text", &s), Some(json!("hello")));
        assert_eq!(find_variable("{{llm_1.meta.tokens}}", &s), Some(json!(12)));
        assert_eq!(find_variable("ghost", &s), None);
        assert_eq!(find_variable("", &s), None);
    }
}
