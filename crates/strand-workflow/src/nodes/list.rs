use std::cmp::Ordering;
use std::collections::HashSet;

use serde_json::{json, Value};

use crate::graph::config::{
    FilterCondition, IterationConfig, ListOperation, ListOperatorConfig, ListParams, SortOrder,
};
use crate::resolver::{find_variable, value_to_text};
use crate::state::ExecutionState;

use super::{NodeContext, NodeOutcome};

pub(super) fn execute_list_operator(config: &ListOperatorConfig, state: &ExecutionState) -> NodeOutcome {
    let items = as_sequence(find_variable(&config.variable, state));
    let result = apply_operation(items, config.operation, &config.params);
    let count = result.len();
    NodeOutcome::new(json!({"result": result, "count": count}))
}

pub(super) fn execute_iteration(
    ctx: &NodeContext<'_>,
    config: &IterationConfig,
    state: &ExecutionState,
) -> NodeOutcome {
    let mut items = as_sequence(find_variable(&config.input_variable, state));
    if let Some(operation) = config.operation {
        items = apply_operation(items, operation, &config.params);
    }

    let total = items.len();
    let mut collected = Vec::with_capacity(total);
    for (index, item) in items.into_iter().enumerate() {
        ctx.emit_chunk(format!("Processing item {}/{}\n", index + 1, total));
        collected.push(json!({"index": index, "item": item}));
    }

    let key = if config.output_variable.is_empty() {
        "items"
    } else {
        config.output_variable.as_str()
    };
    let mut output = serde_json::Map::new();
    output.insert(key.to_string(), Value::Array(collected));
    output.insert("count".into(), json!(total));
    output.insert("success".into(), json!(true));
    NodeOutcome::new(Value::Object(output))
}

/// Coerce a resolved value into a list.
///
/// Arrays pass through, a string holding a JSON array is parsed, any other
/// non-empty scalar becomes a one-item list and null becomes empty.
pub(crate) fn as_sequence(value: Option<Value>) -> Vec<Value> {
    match value {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items,
        Some(Value::String(s)) => match serde_json::from_str::<Value>(&s) {
            Ok(Value::Array(items)) => items,
            _ if s.is_empty() => Vec::new(),
            _ => vec![Value::String(s)],
        },
        Some(other) => vec![other],
    }
}

/// Apply one list operation.
pub fn apply_operation(items: Vec<Value>, operation: ListOperation, params: &ListParams) -> Vec<Value> {
    let len = items.len() as i64;
    match operation {
        ListOperation::First => {
            let count = params.count.unwrap_or(1).max(0) as usize;
            items.into_iter().take(count).collect()
        }
        ListOperation::Last => {
            let count = params.count.unwrap_or(1).max(0) as usize;
            let skip = items.len().saturating_sub(count);
            items.into_iter().skip(skip).collect()
        }
        ListOperation::Limit => {
            let count = params.count.unwrap_or(10).max(0) as usize;
            items.into_iter().take(count).collect()
        }
        ListOperation::Slice => {
            let start = clamp_index(params.start.unwrap_or(0), len);
            let end = clamp_index(params.end.unwrap_or(len), len);
            if start >= end {
                Vec::new()
            } else {
                items[start..end].to_vec()
            }
        }
        ListOperation::Sort => {
            let mut items = items;
            let field = params.field.as_deref().filter(|f| !f.is_empty());
            match field {
                Some(field) if items.first().is_some_and(Value::is_object) => {
                    items.sort_by(|a, b| {
                        compare_values(
                            a.get(field).unwrap_or(&Value::Null),
                            b.get(field).unwrap_or(&Value::Null),
                        )
                    });
                }
                _ => items.sort_by(compare_values),
            }
            if params.order == SortOrder::Desc {
                items.reverse();
            }
            items
        }
        ListOperation::Unique => {
            let mut seen = HashSet::new();
            items
                .into_iter()
                .filter(|item| seen.insert(value_to_text(item)))
                .collect()
        }
        ListOperation::Flatten => items
            .into_iter()
            .flat_map(|item| match item {
                Value::Array(inner) => inner,
                other => vec![other],
            })
            .collect(),
        ListOperation::Filter => {
            let field = params.field.as_deref().filter(|f| !f.is_empty());
            match (field, params.condition) {
                (Some(field), Some(condition)) => items
                    .into_iter()
                    .filter(|item| {
                        item.as_object().is_some_and(|obj| {
                            check_condition(obj.get(field).unwrap_or(&Value::Null), condition, &params.value)
                        })
                    })
                    .collect(),
                _ => items.into_iter().filter(is_truthy).collect(),
            }
        }
        ListOperation::Extract => match params.field.as_deref().filter(|f| !f.is_empty()) {
            Some(field) => items
                .into_iter()
                .map(|item| match item {
                    Value::Object(obj) => obj.get(field).cloned().unwrap_or(Value::Null),
                    other => other,
                })
                .collect(),
            None => items,
        },
    }
}

/// Python-style slice bound: negatives count from the end.
fn clamp_index(index: i64, len: i64) -> usize {
    let index = if index < 0 { len + index } else { index };
    index.clamp(0, len) as usize
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Null first, then numbers by value, then everything else by text.
fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(value: &Value) -> u8 {
        match value {
            Value::Null => 0,
            Value::Number(_) => 1,
            _ => 2,
        }
    }
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.total_cmp(&y)
        }
        _ => rank(a)
            .cmp(&rank(b))
            .then_with(|| value_to_text(a).cmp(&value_to_text(b))),
    }
}

fn check_condition(value: &Value, condition: FilterCondition, target: &Value) -> bool {
    let as_number = |v: &Value| match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match condition {
        FilterCondition::Equals => value == target,
        FilterCondition::NotEquals => value != target,
        FilterCondition::Contains => value_to_text(value).contains(&value_to_text(target)),
        FilterCondition::NotContains => !value_to_text(value).contains(&value_to_text(target)),
        FilterCondition::Greater => match (as_number(value), as_number(target)) {
            (Some(a), Some(b)) => a > b,
            _ => false,
        },
        FilterCondition::Less => match (as_number(value), as_number(target)) {
            (Some(a), Some(b)) => a < b,
            _ => false,
        },
        FilterCondition::IsEmpty => !is_truthy(value),
        FilterCondition::IsNotEmpty => is_truthy(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use super::super::test_support::{no_llm, state_with, Harness};

    fn params(value: Value) -> ListParams {
        serde_json::from_value(value).unwrap()
    }

    fn nums(values: &[i64]) -> Vec<Value> {
        values.iter().map(|v| json!(v)).collect()
    }

    #[test]
    fn test_sequence_coercion() {
        assert_eq!(as_sequence(Some(json!("[1,2]"))), nums(&[1, 2]));
        assert_eq!(as_sequence(Some(json!("plain"))), vec![json!("plain")]);
        assert_eq!(as_sequence(Some(json!(5))), vec![json!(5)]);
        assert!(as_sequence(Some(Value::Null)).is_empty());
        assert!(as_sequence(None).is_empty());
    }

    #[test]
    fn test_first_last_limit_slice() {
        let items = nums(&[1, 2, 3, 4, 5]);
        assert_eq!(apply_operation(items.clone(), ListOperation::First, &params(json!({}))), nums(&[1]));
        assert_eq!(
            apply_operation(items.clone(), ListOperation::Last, &params(json!({"count": 2}))),
            nums(&[4, 5])
        );
        assert_eq!(apply_operation(items.clone(), ListOperation::Limit, &params(json!({}))).len(), 5);
        assert_eq!(
            apply_operation(items.clone(), ListOperation::Slice, &params(json!({"start": 1, "end": -1}))),
            nums(&[2, 3, 4])
        );
        assert!(apply_operation(items, ListOperation::Slice, &params(json!({"start": 4, "end": 2}))).is_empty());
    }

    #[test]
    fn test_sort_mixed_numbers_and_strings() {
        let items: Vec<Value> = (0..64)
            .map(|i| if i % 2 == 0 { json!(i) } else { json!((64 - i).to_string()) })
            .chain([Value::Null])
            .collect();
        let sorted = apply_operation(items, ListOperation::Sort, &params(json!({})));

        assert_eq!(sorted.len(), 65);
        assert_eq!(sorted[0], Value::Null);
        let first_text = sorted.iter().position(Value::is_string).unwrap();
        assert_eq!(first_text, 33);
        assert!(sorted[1..first_text].windows(2).all(|w| w[0].as_i64() < w[1].as_i64()));
        assert!(sorted[first_text..].iter().all(Value::is_string));
        assert!(sorted[first_text..]
            .windows(2)
            .all(|w| w[0].as_str() <= w[1].as_str()));
    }

    #[test]
    fn test_sort_by_field_desc() {
        let items = vec![json!({"n": "b", "s": 2}), json!({"n": "a", "s": 10}), json!({"n": "c", "s": 1})];
        let sorted = apply_operation(items, ListOperation::Sort, &params(json!({"field": "s", "order": "desc"})));
        let names: Vec<&str> = sorted.iter().map(|v| v["n"].as_str().unwrap()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_unique_flatten_extract() {
        let unique = apply_operation(vec![json!(1), json!("1"), json!(2), json!(1)], ListOperation::Unique, &params(json!({})));
        assert_eq!(unique, vec![json!(1), json!(2)]);

        let flat = apply_operation(vec![json!([1, [2]]), json!(3)], ListOperation::Flatten, &params(json!({})));
        assert_eq!(flat, vec![json!(1), json!([2]), json!(3)]);

        let names = apply_operation(
            vec![json!({"name": "a"}), json!({"x": 1}), json!("raw")],
            ListOperation::Extract,
            &params(json!({"field": "name"})),
        );
        assert_eq!(names, vec![json!("a"), Value::Null, json!("raw")]);
    }

    #[test]
    fn test_filter_conditions() {
        let items = vec![json!({"age": 30}), json!({"age": "12"}), json!({"age": "old"}), json!(7)];
        let older = apply_operation(
            items.clone(),
            ListOperation::Filter,
            &params(json!({"field": "age", "condition": "greater", "value": 18})),
        );
        assert_eq!(older, vec![json!({"age": 30})]);

        let truthy = apply_operation(
            vec![json!(0), json!(""), json!("x"), Value::Null, json!([1])],
            ListOperation::Filter,
            &params(json!({})),
        );
        assert_eq!(truthy, vec![json!("x"), json!([1])]);
    }

    #[tokio::test]
    async fn test_list_operator_node() {
        let h = Harness::new(
            "list-operator",
            json!({"variable": "{{src.items}}", "operation": "limit", "params": {"count": 2}}),
            no_llm(),
        );
        let mut state = state_with(json!({}));
        state.set_output("src", json!({"items": [1, 2, 3]}));
        let out = h.run("n", &state).await.unwrap().output;
        assert_eq!(out, json!({"result": [1, 2], "count": 2}));
    }

    #[tokio::test]
    async fn test_iteration_reports_progress() {
        let mut h = Harness::new(
            "iteration",
            json!({"input_variable": "docs", "output_variable": "rows"}),
            no_llm(),
        );
        let out = h.run("n", &state_with(json!({"docs": "[\"a\",\"b\"]"}))).await.unwrap().output;
        assert_eq!(
            out,
            json!({"rows": [{"index": 0, "item": "a"}, {"index": 1, "item": "b"}], "count": 2, "success": true})
        );
        assert_eq!(h.chunks(), vec!["Processing item 1/2\n", "Processing item 2/2\n"]);
    }

    #[tokio::test]
    async fn test_iteration_with_operation() {
        let h = Harness::new(
            "iteration",
            json!({"input_variable": "xs", "operation": "last", "params": {"count": 1}}),
            no_llm(),
        );
        let out = h.run("n", &state_with(json!({"xs": [1, 2, 3]}))).await.unwrap().output;
        assert_eq!(out["items"], json!([{"index": 0, "item": 3}]));
        assert_eq!(out["count"], 1);
    }
}
