//! State implementations
//!
//! One module per state kind; each consumes an input document plus the
//! execution context and produces a [`StepResult`]. The shared data-plumbing
//! pipeline (`InputPath` → `Parameters` → body → `ResultSelector` →
//! `ResultPath` → `OutputPath`) lives here so every state applies it in the
//! same order.

pub(crate) mod approval;
pub(crate) mod checkpoint;
pub(crate) mod choice;
pub(crate) mod debate;
pub(crate) mod map;
pub(crate) mod parallel;
pub(crate) mod pass;
pub(crate) mod task;
pub(crate) mod terminal;
pub(crate) mod wait;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use crate::approval::ApprovalRequest;
use crate::context::{Environment, EvalScope, ExecutionContext, Totals, TraceKind};
use crate::definition::{CatchSpec, CompiledState, ResultPathField, StateSpec};
use crate::error::ExecutionError;
use crate::params::resolve_template;
use crate::path::Path;
use crate::retry::PlannedRetry;
use crate::runner::EngineCore;
use crate::value::{shallow_merge, wrap_scalar};

/// Why an execution suspended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendReason {
    Approval,
    Checkpoint,
}

/// A suspension handed up to the runner.
#[derive(Debug)]
pub struct Suspension {
    pub reason: SuspendReason,
    /// Resume token (Approval) or checkpoint id (Checkpoint)
    pub token: String,
    /// The document at the suspension point
    pub document: Value,
    /// The emitted request, for Approval suspensions
    pub request: Option<ApprovalRequest>,
}

/// What one state step produced.
#[derive(Debug)]
pub enum StepResult {
    /// Continue at a named state
    Next {
        output: Value,
        next: String,
        tokens: u64,
        cost: f64,
    },
    /// Terminal success
    End {
        output: Value,
        tokens: u64,
        cost: f64,
    },
    /// Terminal failure
    Fail {
        error: String,
        cause: String,
        output: Value,
    },
    /// Hand control back to the host
    Suspend(Box<Suspension>),
}

/// Dispatch a step to the state's implementation.
pub(crate) async fn step(
    node: &Arc<CompiledState>,
    core: &Arc<EngineCore>,
    ctx: &mut ExecutionContext,
    document: Value,
) -> Result<StepResult, ExecutionError> {
    match &node.spec {
        StateSpec::Task(spec) => task::step(spec, core, ctx, document).await,
        StateSpec::Debate(spec) => debate::step(spec, core, ctx, document).await,
        StateSpec::Choice(spec) => choice::step(spec, ctx, document),
        StateSpec::Pass(spec) => pass::step(spec, ctx, document),
        StateSpec::Wait(spec) => wait::step(spec, ctx, document).await,
        StateSpec::Succeed(spec) => terminal::succeed(spec, ctx, document),
        StateSpec::Fail(spec) => terminal::fail(spec, ctx, document),
        StateSpec::Map(spec) => {
            let Some(iterator) = &node.iterator else {
                return Err(ExecutionError::task_failed(
                    "Map state has no compiled iterator",
                ));
            };
            map::step(spec, iterator, core, ctx, document).await
        }
        StateSpec::Parallel(spec) => parallel::step(spec, &node.branches, core, ctx, document).await,
        StateSpec::Approval(spec) => approval::step(spec, core, ctx, document).await,
        StateSpec::Checkpoint(spec) => checkpoint::step(spec, core, ctx, document).await,
    }
}

/// Apply `InputPath`, wrapping scalar results as `{value: ...}`.
pub(crate) fn apply_input_path(
    path: &Option<String>,
    document: &Value,
    context: &Value,
) -> Result<Value, ExecutionError> {
    match path {
        Some(expr) => {
            let value = Path::parse(expr)?
                .read(document, context)
                .cloned()
                .ok_or_else(|| {
                    ExecutionError::path_failure(format!("InputPath '{expr}' did not resolve"))
                })?;
            Ok(wrap_scalar(value))
        }
        None => Ok(document.clone()),
    }
}

/// Apply `OutputPath`.
pub(crate) fn apply_output_path(
    path: &Option<String>,
    document: &Value,
    context: &Value,
) -> Result<Value, ExecutionError> {
    match path {
        Some(expr) => Path::parse(expr)?
            .read(document, context)
            .cloned()
            .ok_or_else(|| {
                ExecutionError::path_failure(format!("OutputPath '{expr}' did not resolve"))
            }),
        None => Ok(document.clone()),
    }
}

/// Terminate a step per the state's `Next`/`End` declaration.
pub(crate) fn transition(
    next: Option<&str>,
    end: bool,
    output: Value,
    usage: Totals,
) -> Result<StepResult, ExecutionError> {
    match next {
        Some(next) => Ok(StepResult::Next {
            output,
            next: next.to_string(),
            tokens: usage.tokens,
            cost: usage.cost,
        }),
        None if end => Ok(StepResult::End {
            output,
            tokens: usage.tokens,
            cost: usage.cost,
        }),
        None => Err(ExecutionError::task_failed(
            "state has neither Next nor End",
        )),
    }
}

/// The shared output side of the pipeline: `ResultSelector` over
/// `shallowMerge(input, result)`, then `ResultPath`, then `OutputPath`.
pub(crate) fn shape_result(
    selector: &Option<Value>,
    result_path: &ResultPathField,
    output_path: &Option<String>,
    effective: &Value,
    raw: Value,
    context_object: &Value,
    env: &Environment,
) -> Result<Value, ExecutionError> {
    let selected = match selector {
        Some(template) => {
            let merged = shallow_merge(effective, &raw);
            let scope = EvalScope {
                document: &merged,
                context: context_object,
                env,
            };
            resolve_template(template, &scope)?
        }
        None => raw,
    };
    let written = result_path.apply(effective.clone(), selected)?;
    apply_output_path(output_path, &written, context_object)
}

/// Route an unrecoverable state-body error: Catch when a rule matches,
/// otherwise propagate. Cancellation bypasses Catch entirely. Propagated
/// errors are traced by the driver; only the caught path records its error
/// entry here, ahead of the transition.
pub(crate) fn settle_failure(
    catch: &[CatchSpec],
    ctx: &mut ExecutionContext,
    base: Value,
    error: ExecutionError,
    usage: Totals,
) -> Result<StepResult, ExecutionError> {
    let state = ctx.current_state.clone();
    if error.is_cancellation() {
        return Err(error);
    }
    if let Some(rule) = crate::retry::find_catch(catch, &error.code) {
        trace_error(ctx, &state, &error);
        tracing::debug!(
            state = %state,
            code = %error.code,
            target = %rule.next,
            "error caught, routing to fallback state"
        );
        return apply_catch(rule, base, &error, usage);
    }
    Err(error)
}

/// Record a scheduled retry on the trace and log.
pub(crate) fn record_retry(
    ctx: &mut ExecutionContext,
    error: &ExecutionError,
    planned: &PlannedRetry,
) {
    let state = ctx.current_state.clone();
    let mut extras = Map::new();
    extras.insert("code".to_string(), Value::String(error.code.clone()));
    extras.insert("attempt".to_string(), Value::from(planned.attempt));
    extras.insert(
        "delay_ms".to_string(),
        Value::from(planned.delay.as_millis() as u64),
    );
    let now = ctx.now();
    ctx.trace.record_with(TraceKind::Retry, &state, now, extras);
    tracing::warn!(
        state = %state,
        code = %error.code,
        attempt = planned.attempt,
        delay_ms = planned.delay.as_millis() as u64,
        "state body failed, retrying after delay"
    );
}

/// Route a matched error to its catch target: write `{Error, Cause}` at the
/// rule's `ResultPath` and transition.
pub(crate) fn apply_catch(
    rule: &CatchSpec,
    base: Value,
    error: &ExecutionError,
    usage: Totals,
) -> Result<StepResult, ExecutionError> {
    let error_value = json!({"Error": error.code, "Cause": error.cause});
    let output = rule.result_path.apply(base, error_value)?;
    Ok(StepResult::Next {
        output,
        next: rule.next.clone(),
        tokens: usage.tokens,
        cost: usage.cost,
    })
}

/// Record an error event on the trace.
pub(crate) fn trace_error(ctx: &mut ExecutionContext, state: &str, error: &ExecutionError) {
    let mut extras = Map::new();
    extras.insert("code".to_string(), Value::String(error.code.clone()));
    extras.insert("cause".to_string(), Value::String(error.cause.clone()));
    let now = ctx.now();
    ctx.trace.record_with(TraceKind::Error, state, now, extras);
}

/// Remove the reserved accounting keys from an agent result, returning what
/// they added up to.
pub(crate) fn strip_accounting(result: &mut Value) -> Totals {
    let mut usage = Totals::default();
    if let Some(map) = result.as_object_mut() {
        if let Some(tokens) = map.remove("_tokens") {
            usage.tokens = tokens.as_u64().unwrap_or(0);
        }
        if let Some(cost) = map.remove("_cost") {
            usage.cost = cost.as_f64().unwrap_or(0.0);
        }
        map.remove("_usage");
    }
    usage
}

/// Cooperative sleep: wakes early with `States.Cancelled` when the
/// execution is cancelled.
pub(crate) async fn sleep_cancellable(
    delay: Duration,
    cancel: &CancellationToken,
) -> Result<(), ExecutionError> {
    if delay.is_zero() {
        return Ok(());
    }
    tokio::select! {
        _ = cancel.cancelled() => Err(ExecutionError::cancelled("execution cancelled during sleep")),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}
