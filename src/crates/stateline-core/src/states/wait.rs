//! Wait state: cooperative delay until a duration or deadline

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::context::{ExecutionContext, Totals};
use crate::definition::WaitSpec;
use crate::error::ExecutionError;
use crate::path::Path;
use crate::states::{apply_input_path, apply_output_path, sleep_cancellable, transition, StepResult};

pub(crate) async fn step(
    spec: &WaitSpec,
    ctx: &mut ExecutionContext,
    document: Value,
) -> Result<StepResult, ExecutionError> {
    let context_object = ctx.context_object();
    let effective = apply_input_path(&spec.input_path, &document, &context_object)?;

    let delay = compute_delay(spec, &effective, &context_object, ctx)?;
    if !delay.is_zero() {
        tracing::debug!(
            state = %ctx.current_state,
            delay_ms = delay.as_millis() as u64,
            "waiting"
        );
    }
    sleep_cancellable(delay, ctx.cancel_token()).await?;

    let output = apply_output_path(&spec.output_path, &effective, &context_object)?;
    transition(spec.next.as_deref(), spec.end, output, Totals::default())
}

fn compute_delay(
    spec: &WaitSpec,
    document: &Value,
    context: &Value,
    ctx: &ExecutionContext,
) -> Result<Duration, ExecutionError> {
    if let Some(seconds) = spec.seconds {
        return Ok(duration_from_seconds(seconds));
    }
    if let Some(path) = &spec.seconds_path {
        let value = Path::parse(path)?
            .read(document, context)
            .ok_or_else(|| {
                ExecutionError::path_failure(format!("SecondsPath '{path}' did not resolve"))
            })?;
        let seconds = value.as_f64().ok_or_else(|| {
            ExecutionError::path_failure(format!("SecondsPath '{path}' must resolve to a number"))
        })?;
        return Ok(duration_from_seconds(seconds));
    }
    if let Some(timestamp) = &spec.timestamp {
        return delay_until(timestamp, ctx);
    }
    if let Some(path) = &spec.timestamp_path {
        let value = Path::parse(path)?
            .read(document, context)
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ExecutionError::path_failure(format!(
                    "TimestampPath '{path}' must resolve to a string"
                ))
            })?
            .to_string();
        return delay_until(&value, ctx);
    }
    Err(ExecutionError::task_failed("Wait state has no wait field"))
}

fn duration_from_seconds(seconds: f64) -> Duration {
    if seconds <= 0.0 {
        Duration::ZERO
    } else {
        Duration::from_secs_f64(seconds)
    }
}

/// Delay until an RFC 3339 deadline; past timestamps mean zero delay.
fn delay_until(timestamp: &str, ctx: &ExecutionContext) -> Result<Duration, ExecutionError> {
    let deadline: DateTime<Utc> = DateTime::parse_from_rfc3339(timestamp)
        .map_err(|e| {
            ExecutionError::task_failed(format!("invalid Wait timestamp '{timestamp}': {e}"))
        })?
        .with_timezone(&Utc);
    let remaining = deadline - ctx.now();
    Ok(remaining.to_std().unwrap_or(Duration::ZERO))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Clock, Environment};
    use crate::error::codes;
    use serde_json::json;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    struct FixedClock(DateTime<Utc>);

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }

    fn ctx_at(now: &str, document: Value) -> ExecutionContext {
        let env = Environment::new().with_clock(Arc::new(FixedClock(now.parse().unwrap())));
        let mut ctx = ExecutionContext::new(
            "exec-1".to_string(),
            document,
            env,
            CancellationToken::new(),
        );
        ctx.enter_state("W");
        ctx
    }

    fn wait(value: Value) -> WaitSpec {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_seconds_elapse() {
        let spec = wait(json!({"Seconds": 5, "End": true}));
        let mut ctx = ctx_at("2026-03-01T12:00:00Z", json!({}));
        let started = tokio::time::Instant::now();
        let result = step(&spec, &mut ctx, json!({"a": 1})).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert!(matches!(result, StepResult::End { .. }));
    }

    #[tokio::test]
    async fn test_zero_seconds_completes_immediately() {
        let spec = wait(json!({"Seconds": 0, "End": true}));
        let mut ctx = ctx_at("2026-03-01T12:00:00Z", json!({}));
        let result = step(&spec, &mut ctx, json!({})).await.unwrap();
        assert!(matches!(result, StepResult::End { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_seconds_path() {
        let spec = wait(json!({"SecondsPath": "$.delay", "Next": "B"}));
        let mut ctx = ctx_at("2026-03-01T12:00:00Z", json!({}));
        let started = tokio::time::Instant::now();
        let result = step(&spec, &mut ctx, json!({"delay": 3})).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(3));
        match result {
            StepResult::Next { next, output, .. } => {
                assert_eq!(next, "B");
                assert_eq!(output, json!({"delay": 3}));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_past_timestamp_means_zero_delay() {
        let spec = wait(json!({"Timestamp": "2026-03-01T11:00:00Z", "End": true}));
        let mut ctx = ctx_at("2026-03-01T12:00:00Z", json!({}));
        let result = step(&spec, &mut ctx, json!({})).await.unwrap();
        assert!(matches!(result, StepResult::End { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_future_timestamp_path_waits() {
        let spec = wait(json!({"TimestampPath": "$.until", "End": true}));
        let mut ctx = ctx_at("2026-03-01T12:00:00Z", json!({}));
        let started = tokio::time::Instant::now();
        step(
            &spec,
            &mut ctx,
            json!({"until": "2026-03-01T12:00:10Z"}),
        )
        .await
        .unwrap();
        assert!(started.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_unresolvable_seconds_path_fails() {
        let spec = wait(json!({"SecondsPath": "$.absent", "End": true}));
        let mut ctx = ctx_at("2026-03-01T12:00:00Z", json!({}));
        let err = step(&spec, &mut ctx, json!({})).await.unwrap_err();
        assert_eq!(err.code, codes::PARAMETER_PATH_FAILURE);
    }
}
