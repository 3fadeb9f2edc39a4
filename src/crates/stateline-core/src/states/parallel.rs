//! Parallel state: independent branches over the same input
//!
//! Every branch starts concurrently as its own sub-execution seeded with a
//! deep copy of the state input; branches share no mutable state. The first
//! uncaught branch failure cancels the siblings, and the Parallel state
//! fails with `States.ParallelFailed`. The result array is in definition
//! order regardless of completion order.

use std::sync::Arc;

use serde_json::Value;

use tokio::task::JoinSet;

use crate::context::{ExecutionContext, Totals, Trace};
use crate::definition::{ParallelSpec, StateMachine};
use crate::error::{codes, ExecutionError};
use crate::retry::{plan_retry, AttemptLog};
use crate::runner::{drive, Driven, EngineCore};
use crate::states::{
    apply_input_path, record_retry, settle_failure, shape_result, sleep_cancellable, transition,
    StepResult,
};

pub(crate) async fn step(
    spec: &ParallelSpec,
    branches: &[Arc<StateMachine>],
    core: &Arc<EngineCore>,
    ctx: &mut ExecutionContext,
    document: Value,
) -> Result<StepResult, ExecutionError> {
    let context_object = ctx.context_object();
    let mut usage = Totals::default();

    let effective = match apply_input_path(&spec.input_path, &document, &context_object) {
        Ok(value) => value,
        Err(err) => return settle_failure(&spec.catch, ctx, document, err, usage),
    };

    let mut log = AttemptLog::new(spec.retry.len());
    let results = loop {
        match run_branches(branches, core, ctx, &effective, &mut usage).await {
            Ok(results) => break results,
            Err(err) if err.is_cancellation() => return Err(err),
            Err(err) => {
                let Some(planned) = plan_retry(&spec.retry, &mut log, &err) else {
                    return settle_failure(&spec.catch, ctx, effective, err, usage);
                };
                record_retry(ctx, &err, &planned);
                sleep_cancellable(planned.delay, ctx.cancel_token()).await?;
            }
        }
    };

    let shaped = shape_result(
        &spec.result_selector,
        &spec.result_path,
        &spec.output_path,
        &effective,
        Value::Array(results),
        &context_object,
        ctx.env(),
    );
    match shaped {
        Ok(output) => transition(spec.next.as_deref(), spec.end, output, usage),
        Err(err) => settle_failure(&spec.catch, ctx, effective, err, usage),
    }
}

async fn run_branches(
    branches: &[Arc<StateMachine>],
    core: &Arc<EngineCore>,
    ctx: &mut ExecutionContext,
    effective: &Value,
    usage: &mut Totals,
) -> Result<Vec<Value>, ExecutionError> {
    let total = branches.len();
    let cancel = ctx.cancel_token().child_token();

    tracing::debug!(state = %ctx.current_state, branches = total, "starting parallel branches");

    let mut join_set = JoinSet::new();
    for (index, machine) in branches.iter().enumerate() {
        let mut child =
            ExecutionContext::for_branch(ctx, cancel.child_token(), effective.clone());
        child.current_state = machine.start_at().to_string();
        let machine = machine.clone();
        let core = core.clone();
        let input = effective.clone();
        join_set.spawn(async move {
            let driven = drive(core, machine, &mut child, input).await;
            (index, child, driven)
        });
    }

    let mut results: Vec<Option<Value>> = (0..total).map(|_| None).collect();
    let mut child_traces: Vec<Option<Trace>> = (0..total).map(|_| None).collect();
    let mut failures: Vec<(usize, ExecutionError)> = Vec::new();
    let mut collected = Totals::default();

    while let Some(joined) = join_set.join_next().await {
        let (index, child, driven) = match joined {
            Ok(settled) => settled,
            Err(join_error) => {
                cancel.cancel();
                return Err(ExecutionError::task_failed(format!(
                    "parallel branch task failed: {join_error}"
                )));
            }
        };
        collected.add(child.totals);
        child_traces[index] = Some(child.trace);
        match driven {
            Driven::Completed { output } => results[index] = Some(output),
            Driven::Failed { error, cause, .. } => {
                failures.push((index, ExecutionError::new(error, cause)));
                // First failure dooms the Parallel state; stop the siblings.
                cancel.cancel();
            }
            Driven::Suspended { .. } => {
                failures.push((
                    index,
                    ExecutionError::task_failed("parallel branch attempted to suspend"),
                ));
                cancel.cancel();
            }
        }
    }

    usage.add(collected);
    for trace in child_traces.into_iter().flatten() {
        ctx.trace.absorb(trace);
    }

    if !failures.is_empty() {
        failures.sort_by_key(|(index, _)| *index);
        // Report the originating failure, not a cancellation it triggered.
        let (index, error) = failures
            .iter()
            .find(|(_, error)| !error.is_cancellation())
            .unwrap_or(&failures[0]);
        return Err(ExecutionError::new(
            codes::PARALLEL_FAILED,
            format!("branch {index} failed: {}: {}", error.code, error.cause),
        ));
    }

    Ok(results
        .into_iter()
        .map(|slot| slot.unwrap_or(Value::Null))
        .collect())
}
