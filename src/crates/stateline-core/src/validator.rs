//! Structural validation of parsed definitions
//!
//! Runs once at load time, before any state executes. Validation is
//! structural only: it checks required fields, transition closure, and
//! reachability, but never evaluates path expressions or checks them for
//! resolvability.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::definition::{ChoiceRule, StateSpec};
use crate::error::{EngineError, Result};

pub(crate) fn validate_machine(
    start_at: &str,
    states: &HashMap<String, StateSpec>,
    nested: bool,
) -> Result<()> {
    if !states.contains_key(start_at) {
        return Err(EngineError::Validation(format!(
            "StartAt '{start_at}' references a nonexistent state"
        )));
    }

    for (name, spec) in states {
        validate_state(name, spec, nested)?;
    }

    check_name_closure(states)?;
    check_reachability(start_at, states)?;

    Ok(())
}

fn validate_state(name: &str, spec: &StateSpec, nested: bool) -> Result<()> {
    if nested && matches!(spec, StateSpec::Approval(_) | StateSpec::Checkpoint(_)) {
        return Err(EngineError::Validation(format!(
            "state '{name}': {} states are not supported inside Map iterators or Parallel branches",
            spec.type_name()
        )));
    }

    match spec {
        StateSpec::Succeed(_) | StateSpec::Fail(_) => {}
        StateSpec::Choice(choice) => {
            if choice.choices.is_empty() {
                return Err(EngineError::Validation(format!(
                    "Choice state '{name}' has an empty Choices array"
                )));
            }
            for rule in &choice.choices {
                validate_rule(name, rule, true)?;
            }
        }
        StateSpec::Approval(approval) => {
            if let Some(rules) = &approval.choices {
                if rules.is_empty() {
                    return Err(EngineError::Validation(format!(
                        "Approval state '{name}' has an empty Choices array"
                    )));
                }
                for rule in rules {
                    validate_rule(name, rule, true)?;
                }
            } else {
                check_transition_exclusivity(name, spec)?;
            }
            if approval.options.is_empty() {
                return Err(EngineError::Validation(format!(
                    "Approval state '{name}' has an empty Options array"
                )));
            }
        }
        StateSpec::Map(map) => {
            if map.items_path.is_none() {
                return Err(EngineError::Validation(format!(
                    "Map state '{name}' lacks ItemsPath"
                )));
            }
            if map.iterator.is_none() {
                return Err(EngineError::Validation(format!(
                    "Map state '{name}' lacks an Iterator"
                )));
            }
            check_transition_exclusivity(name, spec)?;
        }
        StateSpec::Parallel(parallel) => {
            if parallel.branches.is_empty() {
                return Err(EngineError::Validation(format!(
                    "Parallel state '{name}' has no branches"
                )));
            }
            check_transition_exclusivity(name, spec)?;
        }
        StateSpec::Wait(wait) => {
            let wait_fields = [
                wait.seconds.is_some(),
                wait.seconds_path.is_some(),
                wait.timestamp.is_some(),
                wait.timestamp_path.is_some(),
            ]
            .iter()
            .filter(|set| **set)
            .count();
            if wait_fields != 1 {
                return Err(EngineError::Validation(format!(
                    "Wait state '{name}' must set exactly one of Seconds, SecondsPath, Timestamp, TimestampPath"
                )));
            }
            check_transition_exclusivity(name, spec)?;
        }
        StateSpec::Debate(debate) => {
            if debate.participants.len() < 2 {
                return Err(EngineError::Validation(format!(
                    "Debate state '{name}' has fewer than two participants"
                )));
            }
            check_transition_exclusivity(name, spec)?;
        }
        StateSpec::Task(_) | StateSpec::Pass(_) | StateSpec::Checkpoint(_) => {
            check_transition_exclusivity(name, spec)?;
        }
    }

    Ok(())
}

fn check_transition_exclusivity(name: &str, spec: &StateSpec) -> Result<()> {
    match (spec.next_field(), spec.end_field()) {
        (Some(_), false) | (None, true) => Ok(()),
        (None, false) => Err(EngineError::Validation(format!(
            "state '{name}' lacks both Next and End"
        ))),
        (Some(_), true) => Err(EngineError::Validation(format!(
            "state '{name}' declares both Next and End"
        ))),
    }
}

fn validate_rule(state: &str, rule: &ChoiceRule, top_level: bool) -> Result<()> {
    if top_level && rule.next.is_none() {
        return Err(EngineError::Validation(format!(
            "Choice rule in state '{state}' lacks Next"
        )));
    }

    if rule.is_compound() {
        let compounds = [rule.and.is_some(), rule.or.is_some(), rule.not.is_some()]
            .iter()
            .filter(|set| **set)
            .count();
        if compounds != 1 || rule.comparator_count() != 0 || rule.variable.is_some() {
            return Err(EngineError::Validation(format!(
                "Choice rule in state '{state}' mixes compound and leaf forms"
            )));
        }
        let nested: Vec<&ChoiceRule> = match (&rule.and, &rule.or, &rule.not) {
            (Some(rules), _, _) | (_, Some(rules), _) => rules.iter().collect(),
            (_, _, Some(inner)) => vec![inner.as_ref()],
            _ => Vec::new(),
        };
        if nested.is_empty() {
            return Err(EngineError::Validation(format!(
                "compound Choice rule in state '{state}' has no sub-rules"
            )));
        }
        for sub in nested {
            validate_rule(state, sub, false)?;
        }
        return Ok(());
    }

    if rule.variable.is_none() {
        return Err(EngineError::Validation(format!(
            "Choice rule in state '{state}' lacks Variable"
        )));
    }
    if rule.comparator_count() != 1 {
        return Err(EngineError::Validation(format!(
            "Choice rule in state '{state}' must set exactly one comparator"
        )));
    }
    Ok(())
}

fn transition_targets(spec: &StateSpec) -> Vec<&str> {
    let mut targets = Vec::new();
    if let Some(next) = spec.next_field() {
        targets.push(next);
    }
    for rule in spec.catch_rules() {
        targets.push(&rule.next);
    }
    match spec {
        StateSpec::Choice(choice) => {
            for rule in &choice.choices {
                if let Some(next) = &rule.next {
                    targets.push(next);
                }
            }
            if let Some(default) = &choice.default {
                targets.push(default);
            }
        }
        StateSpec::Approval(approval) => {
            for rule in approval.choices.iter().flatten() {
                if let Some(next) = &rule.next {
                    targets.push(next);
                }
            }
            if let Some(default) = &approval.default {
                targets.push(default);
            }
        }
        _ => {}
    }
    targets
}

fn check_name_closure(states: &HashMap<String, StateSpec>) -> Result<()> {
    for (name, spec) in states {
        for target in transition_targets(spec) {
            if !states.contains_key(target) {
                return Err(EngineError::Validation(format!(
                    "state '{name}' transitions to nonexistent state '{target}'"
                )));
            }
        }
    }
    Ok(())
}

fn check_reachability(start_at: &str, states: &HashMap<String, StateSpec>) -> Result<()> {
    let mut visited: HashSet<&str> = HashSet::new();
    let mut queue: VecDeque<&str> = VecDeque::new();
    visited.insert(start_at);
    queue.push_back(start_at);

    while let Some(current) = queue.pop_front() {
        let Some(spec) = states.get(current) else {
            continue;
        };
        for target in transition_targets(spec) {
            if visited.insert(target) {
                queue.push_back(target);
            }
        }
    }

    let mut unreachable: Vec<&str> = states
        .keys()
        .map(String::as_str)
        .filter(|name| !visited.contains(name))
        .collect();
    if !unreachable.is_empty() {
        unreachable.sort_unstable();
        return Err(EngineError::Validation(format!(
            "unreachable state(s): {}",
            unreachable.join(", ")
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::StateMachine;
    use serde_json::{json, Map, Value};

    fn build(start_at: &str, states: Value) -> Result<std::sync::Arc<StateMachine>> {
        let map: Map<String, Value> = states.as_object().unwrap().clone();
        StateMachine::build(start_at.to_string(), &map, false)
    }

    fn expect_validation_error(result: Result<std::sync::Arc<StateMachine>>, needle: &str) {
        let err = result.unwrap_err();
        let message = err.to_string();
        assert!(
            message.contains(needle),
            "expected '{needle}' in '{message}'"
        );
    }

    #[test]
    fn test_valid_linear_machine() {
        let machine = build(
            "A",
            json!({
                "A": {"Type": "Pass", "Next": "B"},
                "B": {"Type": "Succeed"}
            }),
        )
        .unwrap();
        assert_eq!(machine.start_at(), "A");
    }

    #[test]
    fn test_start_at_must_exist() {
        expect_validation_error(
            build("Ghost", json!({"A": {"Type": "Succeed"}})),
            "StartAt 'Ghost'",
        );
    }

    #[test]
    fn test_missing_type_rejected() {
        expect_validation_error(build("A", json!({"A": {"Next": "A"}})), "missing required field 'Type'");
    }

    #[test]
    fn test_unknown_type_rejected() {
        expect_validation_error(
            build("A", json!({"A": {"Type": "Quantum"}})),
            "unknown type 'Quantum'",
        );
    }

    #[test]
    fn test_transition_exclusivity() {
        expect_validation_error(
            build("A", json!({"A": {"Type": "Pass"}})),
            "lacks both Next and End",
        );
        expect_validation_error(
            build("A", json!({"A": {"Type": "Pass", "Next": "A", "End": true}})),
            "declares both Next and End",
        );
    }

    #[test]
    fn test_dangling_transition_rejected() {
        expect_validation_error(
            build("A", json!({"A": {"Type": "Pass", "Next": "Missing"}})),
            "nonexistent state 'Missing'",
        );
    }

    #[test]
    fn test_dangling_catch_rejected() {
        expect_validation_error(
            build(
                "A",
                json!({
                    "A": {
                        "Type": "Task",
                        "Agent": "worker",
                        "End": true,
                        "Catch": [{"ErrorEquals": ["States.ALL"], "Next": "Nowhere"}]
                    }
                }),
            ),
            "nonexistent state 'Nowhere'",
        );
    }

    #[test]
    fn test_choice_requirements() {
        expect_validation_error(
            build("A", json!({"A": {"Type": "Choice", "Choices": []}})),
            "empty Choices",
        );
        expect_validation_error(
            build(
                "A",
                json!({
                    "A": {
                        "Type": "Choice",
                        "Choices": [{"Variable": "$.x", "IsPresent": true}]
                    }
                }),
            ),
            "lacks Next",
        );
        expect_validation_error(
            build(
                "A",
                json!({
                    "A": {
                        "Type": "Choice",
                        "Choices": [{"Variable": "$.x", "Next": "B"}],
                        "Default": "B"
                    },
                    "B": {"Type": "Succeed"}
                }),
            ),
            "exactly one comparator",
        );
    }

    #[test]
    fn test_map_requirements() {
        expect_validation_error(
            build(
                "M",
                json!({
                    "M": {
                        "Type": "Map",
                        "End": true,
                        "Iterator": {"StartAt": "I", "States": {"I": {"Type": "Succeed"}}}
                    }
                }),
            ),
            "lacks ItemsPath",
        );
        expect_validation_error(
            build(
                "M",
                json!({"M": {"Type": "Map", "ItemsPath": "$.xs", "End": true}}),
            ),
            "lacks an Iterator",
        );
    }

    #[test]
    fn test_parallel_requires_branches() {
        expect_validation_error(
            build("P", json!({"P": {"Type": "Parallel", "End": true}})),
            "no branches",
        );
    }

    #[test]
    fn test_wait_requires_exactly_one_form() {
        expect_validation_error(
            build("W", json!({"W": {"Type": "Wait", "End": true}})),
            "exactly one of Seconds",
        );
        expect_validation_error(
            build(
                "W",
                json!({"W": {"Type": "Wait", "Seconds": 1, "SecondsPath": "$.s", "End": true}}),
            ),
            "exactly one of Seconds",
        );
    }

    #[test]
    fn test_debate_requires_two_participants() {
        expect_validation_error(
            build(
                "D",
                json!({"D": {"Type": "Debate", "Participants": ["solo"], "End": true}}),
            ),
            "fewer than two participants",
        );
    }

    #[test]
    fn test_unreachable_state_rejected() {
        expect_validation_error(
            build(
                "A",
                json!({
                    "A": {"Type": "Succeed"},
                    "Orphan": {"Type": "Succeed"}
                }),
            ),
            "unreachable state(s): Orphan",
        );
    }

    #[test]
    fn test_reachability_through_choice_and_catch() {
        let machine = build(
            "C",
            json!({
                "C": {
                    "Type": "Choice",
                    "Choices": [{"Variable": "$.x", "IsPresent": true, "Next": "Hit"}],
                    "Default": "Miss"
                },
                "Hit": {
                    "Type": "Task",
                    "Agent": "worker",
                    "Next": "Done",
                    "Catch": [{"ErrorEquals": ["States.ALL"], "Next": "Recover"}]
                },
                "Miss": {"Type": "Succeed"},
                "Recover": {"Type": "Succeed"},
                "Done": {"Type": "Succeed"}
            }),
        );
        assert!(machine.is_ok());
    }

    #[test]
    fn test_approval_rejected_inside_iterator() {
        expect_validation_error(
            build(
                "M",
                json!({
                    "M": {
                        "Type": "Map",
                        "ItemsPath": "$.xs",
                        "End": true,
                        "Iterator": {
                            "StartAt": "Gate",
                            "States": {"Gate": {"Type": "Approval", "End": true}}
                        }
                    }
                }),
            ),
            "not supported inside Map iterators",
        );
    }

    #[test]
    fn test_nested_sub_machines_validate_recursively() {
        expect_validation_error(
            build(
                "M",
                json!({
                    "M": {
                        "Type": "Map",
                        "ItemsPath": "$.xs",
                        "End": true,
                        "Iterator": {
                            "StartAt": "I",
                            "States": {"I": {"Type": "Pass", "Next": "Gone"}}
                        }
                    }
                }),
            ),
            "nonexistent state 'Gone'",
        );
    }
}
