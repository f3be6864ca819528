use std::cmp::Ordering;

use serde_json::json;

use crate::graph::config::{Clause, Comparator, ConditionConfig, LogicalOperator};
use crate::resolver::{find_variable, value_to_text};
use crate::state::ExecutionState;

use super::NodeOutcome;

/// Binary mode writes `{result, branch_id: "true"|"false"}`; cases mode
/// writes the first matching case id, or `"false"` when none match.
pub(super) fn execute(config: &ConditionConfig, state: &ExecutionState) -> NodeOutcome {
    if !config.cases.is_empty() {
        let output = match config
            .cases
            .iter()
            .find(|case| evaluate(&case.conditions, case.logical_operator, state))
        {
            Some(case) => json!({"branch_id": case.case_id, "result": true}),
            None => json!({"branch_id": "false", "result": false}),
        };
        return NodeOutcome::new(output);
    }

    let result = evaluate(&config.conditions, config.logical_operator, state);
    NodeOutcome::new(json!({"result": result, "branch_id": result.to_string()}))
}

/// Combine clauses; an empty list is false.
pub(crate) fn evaluate(clauses: &[Clause], logic: LogicalOperator, state: &ExecutionState) -> bool {
    if clauses.is_empty() {
        return false;
    }
    match logic {
        LogicalOperator::And => clauses.iter().all(|c| check(c, state)),
        LogicalOperator::Or => clauses.iter().any(|c| check(c, state)),
    }
}

fn check(clause: &Clause, state: &ExecutionState) -> bool {
    let actual = find_variable(&clause.variable, state)
        .filter(|v| !v.is_null())
        .map(|v| value_to_text(&v))
        .unwrap_or_default();
    let expected = if clause.value.is_null() {
        String::new()
    } else {
        value_to_text(&clause.value)
    };
    compare(&actual, clause.operator, &expected)
}

/// Compare as text; ordering operators try numbers first and fall back to
/// lexicographic order when either side is not a number.
pub(crate) fn compare(actual: &str, operator: Comparator, expected: &str) -> bool {
    match operator {
        Comparator::Equal => actual == expected,
        Comparator::NotEqual => actual != expected,
        Comparator::Contains => actual.contains(expected),
        Comparator::NotContains => !actual.contains(expected),
        Comparator::IsEmpty => actual.is_empty(),
        Comparator::IsNotEmpty => !actual.is_empty(),
        Comparator::Greater
        | Comparator::Less
        | Comparator::GreaterOrEqual
        | Comparator::LessOrEqual => {
            let ordering = match (actual.trim().parse::<f64>(), expected.trim().parse::<f64>()) {
                (Ok(a), Ok(b)) => a.partial_cmp(&b),
                _ => Some(actual.cmp(expected)),
            };
            let Some(ordering) = ordering else {
                return false;
            };
            match operator {
                Comparator::Greater => ordering == Ordering::Greater,
                Comparator::Less => ordering == Ordering::Less,
                Comparator::GreaterOrEqual => ordering != Ordering::Less,
                _ => ordering != Ordering::Greater,
            }
        }
    }
}
