//! Approval state: a suspended human-in-the-loop gate
//!
//! On entry the state resolves its prompt template, emits an
//! [`ApprovalRequest`] through the configured gateway, optionally snapshots
//! the execution, and suspends. The decision side of the protocol - option
//! validation, field edits, routing through `Choices` or `Next` - lives in
//! [`resolve_decision`], which the runner calls on `resume`.

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::approval::{ApprovalDecision, ApprovalRequest, Escalation};
use crate::context::{EvalScope, ExecutionContext, TraceKind};
use crate::definition::ApprovalSpec;
use crate::error::{codes, ExecutionError};
use crate::params::resolve_template;
use crate::path::Path;
use crate::runner::EngineCore;
use crate::states::choice::rule_matches;
use crate::states::{
    apply_input_path, apply_output_path, SuspendReason, Suspension, StepResult,
};
use stateline_checkpoint::Checkpoint;

/// Where a resolved decision sends the execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Route {
    Next(String),
    End,
}

pub(crate) async fn step(
    spec: &ApprovalSpec,
    core: &Arc<EngineCore>,
    ctx: &mut ExecutionContext,
    document: Value,
) -> Result<StepResult, ExecutionError> {
    let context_object = ctx.context_object();
    let effective = apply_input_path(&spec.input_path, &document, &context_object)?;

    let prompt = match &spec.prompt {
        Some(template) => {
            let scope = EvalScope {
                document: &effective,
                context: &context_object,
                env: ctx.env(),
            };
            resolve_template(template, &scope)?
        }
        None => Value::Null,
    };
    let request = ApprovalRequest {
        prompt,
        options: spec.options.clone(),
        timeout_seconds: spec.timeout_seconds,
        escalation: spec.escalation.as_ref().map(|e| Escalation {
            recipients: e.recipients.clone(),
            repeat: e.repeat,
        }),
        editable_fields: spec
            .editable
            .as_ref()
            .map(|e| e.fields.clone())
            .unwrap_or_default(),
    };

    let Some(gateway) = &core.approvals else {
        return Err(ExecutionError::task_failed(
            "Approval state reached but no approval gateway is configured",
        ));
    };
    let token = gateway.emit(request.clone()).await?;

    let state = ctx.current_state.clone();
    let mut extras = Map::new();
    extras.insert("reason".to_string(), Value::String("approval".to_string()));
    extras.insert("token".to_string(), Value::String(token.clone()));
    let now = ctx.now();
    ctx.trace.record_with(TraceKind::Suspend, &state, now, extras);
    tracing::info!(state = %state, token = %token, "execution suspended awaiting approval");

    // Crash recovery: snapshot with the approval state itself as the resume
    // point, so a restored execution re-emits the request.
    if let Some(store) = &core.checkpoints {
        let trace = serde_json::to_value(&ctx.trace)
            .map_err(|e| ExecutionError::task_failed(format!("trace serialization failed: {e}")))?;
        let checkpoint = Checkpoint {
            name: token.clone(),
            execution_id: ctx.execution_id.clone(),
            current_state: state.clone(),
            state: effective.clone(),
            trace,
            totals: ctx.totals,
            created_at: ctx.now(),
            ttl_seconds: None,
            compressed: false,
        };
        store
            .put(&token, checkpoint)
            .await
            .map_err(|e| ExecutionError::task_failed(format!("checkpoint write failed: {e}")))?;
    }

    Ok(StepResult::Suspend(Box::new(Suspension {
        reason: SuspendReason::Approval,
        token,
        document: effective,
        request: Some(request),
    })))
}

/// Apply a delivered decision to the suspended document: validate the
/// option, write each edited field, write the decision at `ResultPath`,
/// apply `OutputPath`, and pick the outgoing route.
pub(crate) fn resolve_decision(
    spec: &ApprovalSpec,
    document: Value,
    decision: &ApprovalDecision,
    context_object: &Value,
    validate_option: bool,
) -> Result<(Value, Route), ExecutionError> {
    if validate_option && !spec.options.contains(&decision.option) {
        return Err(ExecutionError::task_failed(format!(
            "decision option '{}' is not one of the approval's options",
            decision.option
        )));
    }

    let mut document = document;
    for (path, value) in &decision.edited_fields {
        document = Path::parse(path)?.write(document, value.clone())?;
    }

    let decision_value = serde_json::to_value(decision)
        .map_err(|e| ExecutionError::task_failed(format!("decision serialization failed: {e}")))?;
    document = spec.result_path.apply(document, decision_value)?;

    let route = route_after(spec, &document, context_object)?;
    let output = apply_output_path(&spec.output_path, &document, context_object)?;
    Ok((output, route))
}

/// Routing after a decision: dynamic `Choices` against the post-write
/// document when present, otherwise the static `Next`/`End`.
pub(crate) fn route_after(
    spec: &ApprovalSpec,
    document: &Value,
    context_object: &Value,
) -> Result<Route, ExecutionError> {
    if let Some(rules) = &spec.choices {
        for rule in rules {
            if rule_matches(rule, document, context_object)? {
                let next = rule.next.clone().ok_or_else(|| {
                    ExecutionError::task_failed("matched approval routing rule lacks Next")
                })?;
                return Ok(Route::Next(next));
            }
        }
        if let Some(default) = &spec.default {
            return Ok(Route::Next(default.clone()));
        }
        return Err(ExecutionError::new(
            codes::NO_CHOICE_MATCHED,
            "no approval routing rule matched and no Default is set",
        ));
    }
    if let Some(next) = &spec.next {
        return Ok(Route::Next(next.clone()));
    }
    if spec.end {
        return Ok(Route::End);
    }
    Err(ExecutionError::task_failed(
        "Approval state has neither routing Choices nor Next/End",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn spec(value: Value) -> ApprovalSpec {
        serde_json::from_value(value).unwrap()
    }

    fn decision(option: &str, edits: Value) -> ApprovalDecision {
        ApprovalDecision {
            option: option.to_string(),
            approver: "u@x".to_string(),
            comment: None,
            edited_fields: edits.as_object().cloned().unwrap_or_default(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_decision_edits_and_result_path() {
        let spec = spec(json!({
            "Editable": {"Fields": ["$.draft.title"]},
            "ResultPath": "$.decision",
            "Next": "Publish"
        }));
        let (document, route) = resolve_decision(
            &spec,
            json!({"draft": {"title": "Old"}}),
            &decision("approve", json!({"$.draft.title": "New"})),
            &Value::Null,
            true,
        )
        .unwrap();

        assert_eq!(route, Route::Next("Publish".to_string()));
        assert_eq!(document["draft"]["title"], json!("New"));
        assert_eq!(document["decision"]["option"], json!("approve"));
        assert_eq!(document["decision"]["approver"], json!("u@x"));
    }

    #[test]
    fn test_invalid_option_rejected() {
        let spec = spec(json!({"Options": ["ship", "hold"], "Next": "B"}));
        let err = resolve_decision(
            &spec,
            json!({}),
            &decision("approve", json!({})),
            &Value::Null,
            true,
        )
        .unwrap_err();
        assert!(err.cause.contains("not one of"));
    }

    #[test]
    fn test_choices_route_on_decision() {
        let spec = spec(json!({
            "ResultPath": "$.decision",
            "Choices": [
                {"Variable": "$.decision.option", "StringEquals": "approve", "Next": "Ship"},
                {"Variable": "$.decision.option", "StringEquals": "reject", "Next": "Rework"}
            ],
            "Default": "Review"
        }));
        let (_, route) = resolve_decision(
            &spec,
            json!({}),
            &decision("reject", json!({})),
            &Value::Null,
            true,
        )
        .unwrap();
        assert_eq!(route, Route::Next("Rework".to_string()));
    }

    #[test]
    fn test_choices_without_match_or_default_raise() {
        let spec = spec(json!({
            "Options": ["maybe"],
            "ResultPath": "$.decision",
            "Choices": [
                {"Variable": "$.decision.option", "StringEquals": "approve", "Next": "Ship"}
            ]
        }));
        let err = resolve_decision(
            &spec,
            json!({}),
            &decision("maybe", json!({})),
            &Value::Null,
            true,
        )
        .unwrap_err();
        assert_eq!(err.code, codes::NO_CHOICE_MATCHED);
    }
}
