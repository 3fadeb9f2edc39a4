//! Task state: shape input, invoke an agent, shape output
//!
//! The pipeline runs in a fixed order: `InputPath` → `Parameters` → agent
//! invocation → totals accounting → `ResultSelector` → `ResultPath` →
//! `OutputPath`. Input shaping happens once per state entry; a retry
//! re-invokes the agent with the already-shaped input. Shaping failures on
//! either side of the invocation are not retried - they go straight to
//! Catch matching or propagate.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::agent::{Agent, CallContext, Heartbeat};
use crate::context::{EvalScope, ExecutionContext, Totals};
use crate::definition::TaskSpec;
use crate::error::ExecutionError;
use crate::params::resolve_template;
use crate::retry::{plan_retry, AttemptLog};
use crate::runner::EngineCore;
use crate::states::{
    apply_input_path, record_retry, settle_failure, shape_result, sleep_cancellable,
    strip_accounting, transition, StepResult,
};

pub(crate) async fn step(
    spec: &TaskSpec,
    core: &Arc<EngineCore>,
    ctx: &mut ExecutionContext,
    document: Value,
) -> Result<StepResult, ExecutionError> {
    let context_object = ctx.context_object();
    let mut usage = Totals::default();

    let (effective, agent_input) = match shape_input(spec, &document, &context_object, ctx) {
        Ok(pair) => pair,
        Err(err) => return settle_failure(&spec.catch, ctx, document, err, usage),
    };

    let raw = match invoke_with_retry(spec, core, ctx, &agent_input, &mut usage).await {
        Ok(value) => value,
        Err(err) => return settle_failure(&spec.catch, ctx, effective, err, usage),
    };

    let shaped = shape_result(
        &spec.result_selector,
        &spec.result_path,
        &spec.output_path,
        &effective,
        raw,
        &context_object,
        ctx.env(),
    );
    match shaped {
        Ok(output) => transition(spec.next.as_deref(), spec.end, output, usage),
        Err(err) => settle_failure(&spec.catch, ctx, effective, err, usage),
    }
}

fn shape_input(
    spec: &TaskSpec,
    document: &Value,
    context_object: &Value,
    ctx: &ExecutionContext,
) -> Result<(Value, Value), ExecutionError> {
    let effective = apply_input_path(&spec.input_path, document, context_object)?;
    let agent_input = match &spec.parameters {
        Some(template) => {
            let scope = EvalScope {
                document: &effective,
                context: context_object,
                env: ctx.env(),
            };
            resolve_template(template, &scope)?
        }
        None => effective.clone(),
    };
    Ok((effective, agent_input))
}

async fn invoke_with_retry(
    spec: &TaskSpec,
    core: &Arc<EngineCore>,
    ctx: &mut ExecutionContext,
    agent_input: &Value,
    usage: &mut Totals,
) -> Result<Value, ExecutionError> {
    let agent = core.registry.get(&spec.agent).ok_or_else(|| {
        ExecutionError::task_failed(format!("no agent registered under '{}'", spec.agent))
    })?;
    let config = spec.agent_config();
    let mut log = AttemptLog::new(spec.retry.len());

    loop {
        tracing::debug!(state = %ctx.current_state, agent = %spec.agent, "invoking agent");
        match invoke_once(spec, ctx, &agent, agent_input.clone(), config.clone()).await {
            Ok(mut result) => {
                usage.add(strip_accounting(&mut result));
                return Ok(result);
            }
            Err(err) if err.is_cancellation() => return Err(err),
            Err(err) => {
                let Some(planned) = plan_retry(&spec.retry, &mut log, &err) else {
                    tracing::warn!(
                        state = %ctx.current_state,
                        agent = %spec.agent,
                        code = %err.code,
                        "task failed with no retry remaining"
                    );
                    return Err(err);
                };
                record_retry(ctx, &err, &planned);
                sleep_cancellable(planned.delay, ctx.cancel_token()).await?;
            }
        }
    }
}

const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365);

/// One bounded invocation: races the agent future against the per-call
/// timeout, the heartbeat window, and cancellation.
async fn invoke_once(
    spec: &TaskSpec,
    ctx: &ExecutionContext,
    agent: &Arc<dyn Agent>,
    input: Value,
    config: Value,
) -> Result<Value, ExecutionError> {
    let (heartbeat, mut beats) = Heartbeat::channel();
    let deadline = spec
        .timeout_seconds
        .and_then(|s| chrono::Duration::try_seconds(s as i64))
        .map(|d| ctx.now() + d);
    let call = CallContext {
        state: ctx.current_state.clone(),
        execution_id: ctx.execution_id.clone(),
        deadline,
        heartbeat,
        cancel: ctx.cancel_token().clone(),
    };

    let overall = spec.timeout_seconds.map(Duration::from_secs);
    let heartbeat_window = spec.heartbeat_seconds.map(Duration::from_secs);

    let invocation = agent.invoke(input, config, call);
    tokio::pin!(invocation);
    let overall_sleep = tokio::time::sleep(overall.unwrap_or(FAR_FUTURE));
    tokio::pin!(overall_sleep);
    let heartbeat_sleep = tokio::time::sleep(heartbeat_window.unwrap_or(FAR_FUTURE));
    tokio::pin!(heartbeat_sleep);
    let mut beats_open = true;

    loop {
        tokio::select! {
            result = &mut invocation => {
                return result.map_err(|e| ExecutionError::new(e.code, e.cause));
            }
            _ = &mut overall_sleep, if overall.is_some() => {
                return Err(ExecutionError::timeout(format!(
                    "agent '{}' exceeded TimeoutSeconds ({}s)",
                    spec.agent,
                    spec.timeout_seconds.unwrap_or(0)
                )));
            }
            _ = &mut heartbeat_sleep, if heartbeat_window.is_some() => {
                return Err(ExecutionError::timeout(format!(
                    "agent '{}' missed its heartbeat window ({}s)",
                    spec.agent,
                    spec.heartbeat_seconds.unwrap_or(0)
                )));
            }
            beat = beats.recv(), if beats_open && heartbeat_window.is_some() => {
                match (beat, heartbeat_window) {
                    (Some(()), Some(window)) => {
                        heartbeat_sleep.as_mut().reset(tokio::time::Instant::now() + window);
                    }
                    _ => beats_open = false,
                }
            }
            _ = ctx.cancel_token().cancelled() => {
                return Err(ExecutionError::cancelled(format!(
                    "invocation of agent '{}' cancelled",
                    spec.agent
                )));
            }
        }
    }
}
