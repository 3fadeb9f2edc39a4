//! Choice state: first-match routing over ordered rules
//!
//! Rules are evaluated top to bottom; the first match wins. A missing
//! left-hand value makes every comparator false except `IsPresent: false`
//! and `IsNull: true`. Choice states call no agents, consume no tokens, and
//! pass the input through unchanged apart from `InputPath`/`OutputPath`.

use std::cmp::Ordering;

use regex::Regex;
use serde_json::{Map, Number, Value};

use crate::context::{ExecutionContext, TraceKind};
use crate::definition::{ChoiceRule, ChoiceSpec};
use crate::error::{codes, ExecutionError};
use crate::path::Path;
use crate::states::{apply_input_path, apply_output_path, StepResult};
use crate::value::{compare_numbers, is_timestamp};

pub(crate) fn step(
    spec: &ChoiceSpec,
    ctx: &mut ExecutionContext,
    document: Value,
) -> Result<StepResult, ExecutionError> {
    let context_object = ctx.context_object();
    let effective = apply_input_path(&spec.input_path, &document, &context_object)?;
    let state = ctx.current_state.clone();

    for (index, rule) in spec.choices.iter().enumerate() {
        if !rule_matches(rule, &effective, &context_object)? {
            continue;
        }
        let next = rule.next.clone().ok_or_else(|| {
            ExecutionError::task_failed(format!("matched Choice rule in '{state}' lacks Next"))
        })?;
        record_match(ctx, &state, Some(index), &next);
        let output = apply_output_path(&spec.output_path, &effective, &context_object)?;
        return Ok(StepResult::Next {
            output,
            next,
            tokens: 0,
            cost: 0.0,
        });
    }

    if let Some(default) = &spec.default {
        record_match(ctx, &state, None, default);
        let output = apply_output_path(&spec.output_path, &effective, &context_object)?;
        return Ok(StepResult::Next {
            output,
            next: default.clone(),
            tokens: 0,
            cost: 0.0,
        });
    }

    Err(ExecutionError::new(
        codes::NO_CHOICE_MATCHED,
        format!("no choice rule matched in state '{state}' and no Default is set"),
    ))
}

fn record_match(ctx: &mut ExecutionContext, state: &str, rule_index: Option<usize>, next: &str) {
    let mut extras = Map::new();
    match rule_index {
        Some(index) => extras.insert("rule".to_string(), Value::from(index)),
        None => extras.insert("rule".to_string(), Value::String("default".to_string())),
    };
    extras.insert("next".to_string(), Value::String(next.to_string()));
    let now = ctx.now();
    ctx.trace
        .record_with(TraceKind::ChoiceMatch, state, now, extras);
}

/// Evaluate one rule (compound or leaf) against a document and context.
pub(crate) fn rule_matches(
    rule: &ChoiceRule,
    document: &Value,
    context: &Value,
) -> Result<bool, ExecutionError> {
    if let Some(rules) = &rule.and {
        for sub in rules {
            if !rule_matches(sub, document, context)? {
                return Ok(false);
            }
        }
        return Ok(true);
    }
    if let Some(rules) = &rule.or {
        for sub in rules {
            if rule_matches(sub, document, context)? {
                return Ok(true);
            }
        }
        return Ok(false);
    }
    if let Some(inner) = &rule.not {
        return Ok(!rule_matches(inner, document, context)?);
    }

    let variable = rule.variable.as_deref().ok_or_else(|| {
        ExecutionError::task_failed("Choice rule lacks Variable")
    })?;
    let lhs = Path::parse(variable)?.read(document, context);

    let Some(value) = lhs else {
        return Ok(rule.is_present == Some(false) || rule.is_null == Some(true));
    };

    // Presence family: the check result must equal the rule's boolean.
    if let Some(expected) = rule.is_present {
        return Ok(expected);
    }
    if let Some(expected) = rule.is_null {
        return Ok(value.is_null() == expected);
    }
    if let Some(expected) = rule.is_string {
        return Ok(value.is_string() == expected);
    }
    if let Some(expected) = rule.is_numeric {
        return Ok(value.is_number() == expected);
    }
    if let Some(expected) = rule.is_boolean {
        return Ok(value.is_boolean() == expected);
    }
    if let Some(expected) = rule.is_timestamp {
        let looks_like = value.as_str().map(is_timestamp).unwrap_or(false);
        return Ok(looks_like == expected);
    }

    // String family.
    if let Some(expected) = &rule.string_equals {
        return Ok(value.as_str() == Some(expected.as_str()));
    }
    if let Some(path) = &rule.string_equals_path {
        let rhs = Path::parse(path)?.read(document, context);
        return Ok(matches!(
            (value.as_str(), rhs.and_then(Value::as_str)),
            (Some(a), Some(b)) if a == b
        ));
    }
    if let Some(expected) = &rule.string_less_than {
        return Ok(string_cmp(value, expected, |o| o == Ordering::Less));
    }
    if let Some(expected) = &rule.string_less_than_equals {
        return Ok(string_cmp(value, expected, |o| o != Ordering::Greater));
    }
    if let Some(expected) = &rule.string_greater_than {
        return Ok(string_cmp(value, expected, |o| o == Ordering::Greater));
    }
    if let Some(expected) = &rule.string_greater_than_equals {
        return Ok(string_cmp(value, expected, |o| o != Ordering::Less));
    }
    if let Some(pattern) = &rule.string_matches {
        return glob_match(value, pattern);
    }

    // Numeric family.
    if let Some(expected) = &rule.numeric_equals {
        return Ok(numeric_cmp(value, expected, |o| o == Ordering::Equal));
    }
    if let Some(path) = &rule.numeric_equals_path {
        let rhs = Path::parse(path)?.read(document, context);
        return Ok(match (value, rhs) {
            (Value::Number(a), Some(Value::Number(b))) => {
                compare_numbers(a, b) == Some(Ordering::Equal)
            }
            _ => false,
        });
    }
    if let Some(expected) = &rule.numeric_less_than {
        return Ok(numeric_cmp(value, expected, |o| o == Ordering::Less));
    }
    if let Some(expected) = &rule.numeric_less_than_equals {
        return Ok(numeric_cmp(value, expected, |o| o != Ordering::Greater));
    }
    if let Some(expected) = &rule.numeric_greater_than {
        return Ok(numeric_cmp(value, expected, |o| o == Ordering::Greater));
    }
    if let Some(expected) = &rule.numeric_greater_than_equals {
        return Ok(numeric_cmp(value, expected, |o| o != Ordering::Less));
    }

    // Boolean family.
    if let Some(expected) = rule.boolean_equals {
        return Ok(value.as_bool() == Some(expected));
    }
    if let Some(path) = &rule.boolean_equals_path {
        let rhs = Path::parse(path)?.read(document, context);
        return Ok(matches!(
            (value.as_bool(), rhs.and_then(Value::as_bool)),
            (Some(a), Some(b)) if a == b
        ));
    }

    Err(ExecutionError::task_failed(
        "Choice rule has no comparator",
    ))
}

fn string_cmp(value: &Value, expected: &str, pred: impl Fn(Ordering) -> bool) -> bool {
    value.as_str().map(|s| pred(s.cmp(expected))).unwrap_or(false)
}

fn numeric_cmp(value: &Value, expected: &Number, pred: impl Fn(Ordering) -> bool) -> bool {
    match value {
        Value::Number(n) => compare_numbers(n, expected).map(pred).unwrap_or(false),
        _ => false,
    }
}

/// Anchored glob match: `*` is any run, `?` is one character, everything
/// else is literal.
fn glob_match(value: &Value, pattern: &str) -> Result<bool, ExecutionError> {
    let Some(input) = value.as_str() else {
        return Ok(false);
    };
    let mut source = String::with_capacity(pattern.len() + 2);
    source.push('^');
    for c in pattern.chars() {
        match c {
            '*' => source.push_str(".*"),
            '?' => source.push('.'),
            other => source.push_str(&regex::escape(&other.to_string())),
        }
    }
    source.push('$');
    let re = Regex::new(&source).map_err(|e| {
        ExecutionError::task_failed(format!("invalid StringMatches pattern '{pattern}': {e}"))
    })?;
    Ok(re.is_match(input))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn matches(rule: Value, document: Value) -> bool {
        let rule: ChoiceRule = serde_json::from_value(rule).unwrap();
        rule_matches(&rule, &document, &Value::Null).unwrap()
    }

    #[test]
    fn test_numeric_comparators_are_type_aware() {
        assert!(matches(
            json!({"Variable": "$.n", "NumericGreaterThanEquals": 90}),
            json!({"n": 90.0})
        ));
        assert!(matches(
            json!({"Variable": "$.n", "NumericLessThan": 5}),
            json!({"n": 4.5})
        ));
        assert!(!matches(
            json!({"Variable": "$.n", "NumericEquals": 5}),
            json!({"n": "5"})
        ));
    }

    #[test]
    fn test_string_comparators() {
        assert!(matches(
            json!({"Variable": "$.s", "StringEquals": "abc"}),
            json!({"s": "abc"})
        ));
        assert!(matches(
            json!({"Variable": "$.s", "StringLessThan": "b"}),
            json!({"s": "a"})
        ));
        assert!(matches(
            json!({"Variable": "$.s", "StringEqualsPath": "$.other"}),
            json!({"s": "x", "other": "x"})
        ));
    }

    #[test]
    fn test_string_matches_glob_is_anchored() {
        assert!(matches(
            json!({"Variable": "$.f", "StringMatches": "*.csv"}),
            json!({"f": "report.csv"})
        ));
        assert!(!matches(
            json!({"Variable": "$.f", "StringMatches": "*.csv"}),
            json!({"f": "report.csv.bak"})
        ));
        assert!(matches(
            json!({"Variable": "$.f", "StringMatches": "v?.final"}),
            json!({"f": "v2.final"})
        ));
        // Regex metacharacters in the pattern are literal.
        assert!(!matches(
            json!({"Variable": "$.f", "StringMatches": "a.c"}),
            json!({"f": "abc"})
        ));
    }

    #[test]
    fn test_presence_family_distinguishes_absent_from_null() {
        assert!(matches(
            json!({"Variable": "$.here", "IsPresent": true}),
            json!({"here": null})
        ));
        assert!(matches(
            json!({"Variable": "$.gone", "IsPresent": false}),
            json!({})
        ));
        assert!(matches(
            json!({"Variable": "$.here", "IsNull": true}),
            json!({"here": null})
        ));
        assert!(!matches(
            json!({"Variable": "$.here", "IsNull": true}),
            json!({"here": 0})
        ));
    }

    #[test]
    fn test_missing_lhs_fails_ordinary_comparators() {
        assert!(!matches(
            json!({"Variable": "$.gone", "NumericEquals": 1}),
            json!({})
        ));
        assert!(!matches(
            json!({"Variable": "$.gone", "StringEquals": ""}),
            json!({})
        ));
        assert!(!matches(
            json!({"Variable": "$.gone", "IsPresent": true}),
            json!({})
        ));
        // The two exceptions.
        assert!(matches(
            json!({"Variable": "$.gone", "IsPresent": false}),
            json!({})
        ));
        assert!(matches(
            json!({"Variable": "$.gone", "IsNull": true}),
            json!({})
        ));
    }

    #[test]
    fn test_is_timestamp() {
        assert!(matches(
            json!({"Variable": "$.t", "IsTimestamp": true}),
            json!({"t": "2026-03-01T12:00:00Z"})
        ));
        assert!(matches(
            json!({"Variable": "$.t", "IsTimestamp": false}),
            json!({"t": "tomorrow"})
        ));
    }

    #[test]
    fn test_compound_rules() {
        let rule = json!({
            "And": [
                {"Variable": "$.n", "NumericGreaterThan": 0},
                {"Not": {"Variable": "$.banned", "BooleanEquals": true}}
            ]
        });
        assert!(matches(rule.clone(), json!({"n": 3, "banned": false})));
        assert!(!matches(rule, json!({"n": 3, "banned": true})));

        let any = json!({
            "Or": [
                {"Variable": "$.a", "IsPresent": true},
                {"Variable": "$.b", "IsPresent": true}
            ]
        });
        assert!(matches(any.clone(), json!({"b": 1})));
        assert!(!matches(any, json!({})));
    }

    fn choice_step(spec: Value, document: Value) -> Result<StepResult, ExecutionError> {
        use crate::context::Environment;
        use tokio_util::sync::CancellationToken;

        let spec: ChoiceSpec = serde_json::from_value(spec).unwrap();
        let mut ctx = ExecutionContext::new(
            "exec-1".to_string(),
            document.clone(),
            Environment::new(),
            CancellationToken::new(),
        );
        ctx.enter_state("C");
        step(&spec, &mut ctx, document)
    }

    #[test]
    fn test_first_match_wins() {
        let spec = json!({
            "Choices": [
                {"Variable": "$.n", "NumericGreaterThanEquals": 90, "Next": "High"},
                {"Variable": "$.n", "NumericGreaterThanEquals": 80, "Next": "Mid"}
            ],
            "Default": "Low"
        });
        match choice_step(spec.clone(), json!({"n": 95})).unwrap() {
            StepResult::Next { next, .. } => assert_eq!(next, "High"),
            other => panic!("unexpected {other:?}"),
        }
        match choice_step(spec.clone(), json!({"n": 85})).unwrap() {
            StepResult::Next { next, .. } => assert_eq!(next, "Mid"),
            other => panic!("unexpected {other:?}"),
        }
        match choice_step(spec, json!({"n": 10})).unwrap() {
            StepResult::Next { next, .. } => assert_eq!(next, "Low"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_no_match_without_default_raises() {
        let spec = json!({
            "Choices": [{"Variable": "$.n", "NumericEquals": 1, "Next": "One"}]
        });
        let err = choice_step(spec, json!({"n": 2})).unwrap_err();
        assert_eq!(err.code, codes::NO_CHOICE_MATCHED);
    }
}
