//! Pass state: pure data plumbing
//!
//! Behaves like a Task whose agent returns `Result` verbatim - or, when
//! `Result` is absent, the (possibly `Parameters`-shaped) input. No tokens,
//! no cost, and no errors beyond path-expression failures, which propagate
//! directly: Pass carries no Retry or Catch.

use serde_json::Value;

use crate::context::{EvalScope, ExecutionContext, Totals};
use crate::definition::PassSpec;
use crate::error::ExecutionError;
use crate::params::resolve_template;
use crate::states::{apply_input_path, apply_output_path, transition, StepResult};

pub(crate) fn step(
    spec: &PassSpec,
    ctx: &mut ExecutionContext,
    document: Value,
) -> Result<StepResult, ExecutionError> {
    let context_object = ctx.context_object();
    let effective = apply_input_path(&spec.input_path, &document, &context_object)?;

    let shaped = match &spec.parameters {
        Some(template) => {
            let scope = EvalScope {
                document: &effective,
                context: &context_object,
                env: ctx.env(),
            };
            resolve_template(template, &scope)?
        }
        None => effective.clone(),
    };
    let result = spec.result.clone().unwrap_or(shaped);

    let written = spec.result_path.apply(effective, result)?;
    let output = apply_output_path(&spec.output_path, &written, &context_object)?;
    transition(spec.next.as_deref(), spec.end, output, Totals::default())
}
