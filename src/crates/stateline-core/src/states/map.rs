//! Map state: iterate a sub-machine over an array with bounded concurrency
//!
//! Iterations are scheduled in index order (a FIFO semaphore bounds how many
//! are pending at once) but may complete in any order; results are collected
//! into an array whose index equals the source item's index, so completion
//! order never leaks into the document. Each iteration runs in its own
//! sub-execution with a deep copy of its input and a child cancellation
//! token; exceeding the tolerated-failure threshold cancels the remainder.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::context::{EvalScope, ExecutionContext, MapItem, Totals, Trace};
use crate::definition::{MapSpec, StateMachine};
use crate::error::{codes, ExecutionError};
use crate::params::resolve_template;
use crate::path::Path;
use crate::retry::{plan_retry, AttemptLog};
use crate::runner::{drive, Driven, EngineCore};
use crate::states::{
    apply_input_path, record_retry, settle_failure, shape_result, sleep_cancellable, transition,
    StepResult,
};
use crate::value::wrap_scalar;

pub(crate) async fn step(
    spec: &MapSpec,
    iterator: &Arc<StateMachine>,
    core: &Arc<EngineCore>,
    ctx: &mut ExecutionContext,
    document: Value,
) -> Result<StepResult, ExecutionError> {
    let context_object = ctx.context_object();
    let mut usage = Totals::default();

    let (effective, items) = match shape_input(spec, &document, &context_object) {
        Ok(pair) => pair,
        Err(err) => return settle_failure(&spec.catch, ctx, document, err, usage),
    };

    let mut log = AttemptLog::new(spec.retry.len());
    let results = loop {
        match run_iterations(spec, iterator, core, ctx, &effective, &items, &mut usage).await {
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

fn shape_input(
    spec: &MapSpec,
    document: &Value,
    context_object: &Value,
) -> Result<(Value, Vec<Value>), ExecutionError> {
    let effective = apply_input_path(&spec.input_path, document, context_object)?;
    let items_path = spec.items_path.as_deref().ok_or_else(|| {
        ExecutionError::path_failure("Map state lacks ItemsPath")
    })?;
    let items = Path::parse(items_path)?
        .read(&effective, context_object)
        .ok_or_else(|| {
            ExecutionError::path_failure(format!("ItemsPath '{items_path}' did not resolve"))
        })?
        .as_array()
        .ok_or_else(|| {
            ExecutionError::path_failure(format!(
                "ItemsPath '{items_path}' must resolve to an array"
            ))
        })?
        .clone();
    Ok((effective, items))
}

/// One attempt over all items: spawn every iteration (bounded by
/// `MaxConcurrency`), join them all, fold totals and traces back into the
/// parent, and enforce the tolerated-failure threshold.
async fn run_iterations(
    spec: &MapSpec,
    iterator: &Arc<StateMachine>,
    core: &Arc<EngineCore>,
    ctx: &mut ExecutionContext,
    effective: &Value,
    items: &[Value],
    usage: &mut Totals,
) -> Result<Vec<Value>, ExecutionError> {
    let total = items.len();
    if total == 0 {
        return Ok(Vec::new());
    }

    // Resolve every iteration's input up front so a selector failure aborts
    // before anything is spawned.
    let cancel = ctx.cancel_token().child_token();
    let mut prepared = Vec::with_capacity(total);
    for (index, item) in items.iter().enumerate() {
        let input = match &spec.item_selector {
            Some(template) => {
                let mut iter_context = ctx.context_object();
                iter_context["Map"] = json!({"Item": {"Value": item, "Index": index}});
                let scope = EvalScope {
                    document: effective,
                    context: &iter_context,
                    env: ctx.env(),
                };
                resolve_template(template, &scope)?
            }
            None => wrap_scalar(item.clone()),
        };
        let mut child = ExecutionContext::for_iteration(
            ctx,
            MapItem {
                value: item.clone(),
                index,
            },
            cancel.child_token(),
            input.clone(),
        );
        child.current_state = iterator.start_at().to_string();
        prepared.push((index, child, input));
    }

    let permits = if spec.max_concurrency == 0 {
        total
    } else {
        spec.max_concurrency
    };
    let semaphore = Arc::new(Semaphore::new(permits.max(1)));
    let allowed = allowed_failures(spec, total);

    tracing::debug!(
        state = %ctx.current_state,
        items = total,
        max_concurrency = spec.max_concurrency,
        "starting map iterations"
    );

    let mut join_set = JoinSet::new();
    for (index, mut child, input) in prepared {
        let semaphore = semaphore.clone();
        let machine = iterator.clone();
        let core = core.clone();
        join_set.spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok();
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
                    "map iteration task failed: {join_error}"
                )));
            }
        };
        collected.add(child.totals);
        child_traces[index] = Some(child.trace);
        match driven {
            Driven::Completed { output } => results[index] = Some(output),
            Driven::Failed { error, cause, .. } => {
                failures.push((index, ExecutionError::new(error, cause)));
                if failures.len() > allowed {
                    cancel.cancel();
                }
            }
            Driven::Suspended { .. } => {
                failures.push((
                    index,
                    ExecutionError::task_failed("map iteration attempted to suspend"),
                ));
                cancel.cancel();
            }
        }
    }

    usage.add(collected);
    for trace in child_traces.into_iter().flatten() {
        ctx.trace.absorb(trace);
    }

    if failures.len() > allowed {
        failures.sort_by_key(|(index, _)| *index);
        let partial: Vec<Value> = results
            .iter()
            .map(|slot| slot.clone().unwrap_or(Value::Null))
            .collect();
        let detail = json!({
            "message": format!("{} of {total} iterations failed", failures.len()),
            "failures": failures
                .iter()
                .map(|(index, error)| json!({
                    "index": index,
                    "Error": error.code,
                    "Cause": error.cause,
                }))
                .collect::<Vec<_>>(),
            "partialResults": partial,
        });
        return Err(ExecutionError::new(codes::MAP_FAILED, detail.to_string()));
    }

    Ok(results
        .into_iter()
        .map(|slot| slot.unwrap_or(Value::Null))
        .collect())
}

/// Failures acceptable before the Map as a whole fails. When both a count
/// and a percentage are set, the stricter bound wins.
fn allowed_failures(spec: &MapSpec, total: usize) -> usize {
    let by_count = spec.tolerated_failure_count;
    let by_percentage = spec
        .tolerated_failure_percentage
        .map(|p| ((p / 100.0) * total as f64).floor() as usize);
    match (by_count, by_percentage) {
        (Some(count), Some(percentage)) => count.min(percentage),
        (Some(count), None) => count,
        (None, Some(percentage)) => percentage,
        (None, None) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map_spec(value: serde_json::Value) -> MapSpec {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_allowed_failures_combinations() {
        let none = map_spec(json!({"ItemsPath": "$.xs", "End": true}));
        assert_eq!(allowed_failures(&none, 10), 0);

        let by_count = map_spec(json!({
            "ItemsPath": "$.xs", "End": true, "ToleratedFailureCount": 3
        }));
        assert_eq!(allowed_failures(&by_count, 10), 3);

        let by_percentage = map_spec(json!({
            "ItemsPath": "$.xs", "End": true, "ToleratedFailurePercentage": 25.0
        }));
        assert_eq!(allowed_failures(&by_percentage, 10), 2);

        let both = map_spec(json!({
            "ItemsPath": "$.xs", "End": true,
            "ToleratedFailureCount": 5, "ToleratedFailurePercentage": 10.0
        }));
        assert_eq!(allowed_failures(&both, 10), 1);
    }
}
