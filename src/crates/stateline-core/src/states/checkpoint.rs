//! Checkpoint state: write a durable resume point
//!
//! The snapshot records the *next* state to run, so checkpoints are never
//! re-executed on resume. With `Suspend: true` the runner also hands
//! control back to the host after the write.

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::context::{ExecutionContext, Totals, TraceKind};
use crate::definition::CheckpointSpec;
use crate::error::ExecutionError;
use crate::path::Path;
use crate::runner::EngineCore;
use crate::states::{transition, SuspendReason, Suspension, StepResult};
use stateline_checkpoint::{parse_ttl, Checkpoint};

pub(crate) async fn step(
    spec: &CheckpointSpec,
    core: &Arc<EngineCore>,
    ctx: &mut ExecutionContext,
    document: Value,
) -> Result<StepResult, ExecutionError> {
    let Some(store) = &core.checkpoints else {
        return Err(ExecutionError::task_failed(
            "Checkpoint state reached but no checkpoint store is configured",
        ));
    };
    let context_object = ctx.context_object();

    let id = if let Some(path) = &spec.checkpoint_id_path {
        Path::parse(path)?
            .read(&document, &context_object)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                ExecutionError::path_failure(format!(
                    "CheckpointIdPath '{path}' must resolve to a string"
                ))
            })?
    } else if let Some(name) = &spec.name {
        name.clone()
    } else {
        ctx.env().uuid()
    };

    let data = match &spec.data_path {
        Some(path) => Path::parse(path)?
            .read(&document, &context_object)
            .cloned()
            .ok_or_else(|| {
                ExecutionError::path_failure(format!("DataPath '{path}' did not resolve"))
            })?,
        None => document.clone(),
    };

    let ttl_seconds = match &spec.ttl {
        Some(ttl) => parse_ttl(ttl)
            .map_err(|e| ExecutionError::task_failed(format!("invalid checkpoint TTL: {e}")))?,
        None => None,
    };

    let trace = serde_json::to_value(&ctx.trace)
        .map_err(|e| ExecutionError::task_failed(format!("trace serialization failed: {e}")))?;
    let checkpoint = Checkpoint {
        name: id.clone(),
        execution_id: ctx.execution_id.clone(),
        // The state to run on resume; a checkpoint is never re-executed.
        current_state: spec.next.clone().unwrap_or_default(),
        state: data,
        trace,
        totals: ctx.totals,
        created_at: ctx.now(),
        ttl_seconds,
        compressed: spec.compress,
    };
    store
        .put(&id, checkpoint)
        .await
        .map_err(|e| ExecutionError::task_failed(format!("checkpoint write failed: {e}")))?;
    tracing::info!(state = %ctx.current_state, checkpoint = %id, "checkpoint written");

    if spec.suspend {
        let state = ctx.current_state.clone();
        let mut extras = Map::new();
        extras.insert("reason".to_string(), Value::String("checkpoint".to_string()));
        extras.insert("checkpoint".to_string(), Value::String(id.clone()));
        let now = ctx.now();
        ctx.trace.record_with(TraceKind::Suspend, &state, now, extras);
        return Ok(StepResult::Suspend(Box::new(Suspension {
            reason: SuspendReason::Checkpoint,
            token: id,
            document,
            request: None,
        })));
    }

    transition(spec.next.as_deref(), spec.end, document, Totals::default())
}
