//! Succeed and Fail: the terminal states

use serde_json::Value;

use crate::context::ExecutionContext;
use crate::definition::{FailSpec, SucceedSpec};
use crate::error::{codes, ExecutionError};
use crate::path::Path;
use crate::states::{apply_input_path, apply_output_path, StepResult};
use crate::value::shallow_merge;

pub(crate) fn succeed(
    spec: &SucceedSpec,
    ctx: &mut ExecutionContext,
    document: Value,
) -> Result<StepResult, ExecutionError> {
    let context_object = ctx.context_object();
    let effective = apply_input_path(&spec.input_path, &document, &context_object)?;
    let output = apply_output_path(&spec.output_path, &effective, &context_object)?;
    Ok(StepResult::End {
        output,
        tokens: 0,
        cost: 0.0,
    })
}

pub(crate) fn fail(
    spec: &FailSpec,
    ctx: &mut ExecutionContext,
    document: Value,
) -> Result<StepResult, ExecutionError> {
    let context_object = ctx.context_object();
    let error = sourced_field(
        &spec.error,
        &spec.error_path,
        &document,
        &context_object,
        codes::TASK_FAILED,
    )?;
    let cause = sourced_field(&spec.cause, &spec.cause_path, &document, &context_object, "")?;

    let annotation = serde_json::json!({"Error": error, "Cause": cause});
    let output = shallow_merge(&document, &annotation);
    Ok(StepResult::Fail {
        error,
        cause,
        output,
    })
}

/// A Fail field comes from a literal, a path into the document, or the
/// default.
fn sourced_field(
    literal: &Option<String>,
    path: &Option<String>,
    document: &Value,
    context: &Value,
    default: &str,
) -> Result<String, ExecutionError> {
    if let Some(value) = literal {
        return Ok(value.clone());
    }
    if let Some(expr) = path {
        return Path::parse(expr)?
            .read(document, context)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                ExecutionError::path_failure(format!("'{expr}' must resolve to a string"))
            });
    }
    Ok(default.to_string())
}
