//! Debate state: two or more agents over an accumulated transcript
//!
//! Participants are invoked in definition order for `Rounds` rounds. Each
//! turn receives `{input, transcript}` where `transcript` holds every prior
//! turn, and the state's raw result is `{Transcript, Rounds}`. Accounting,
//! the data-plumbing pipeline, and Retry/Catch all behave as they do for
//! Task.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::agent::{Agent, CallContext, Heartbeat};
use crate::context::{EvalScope, ExecutionContext, Totals};
use crate::definition::DebateSpec;
use crate::error::ExecutionError;
use crate::params::resolve_template;
use crate::retry::{plan_retry, AttemptLog};
use crate::runner::EngineCore;
use crate::states::{
    apply_input_path, record_retry, settle_failure, shape_result, sleep_cancellable,
    strip_accounting, transition, StepResult,
};

pub(crate) async fn step(
    spec: &DebateSpec,
    core: &Arc<EngineCore>,
    ctx: &mut ExecutionContext,
    document: Value,
) -> Result<StepResult, ExecutionError> {
    let context_object = ctx.context_object();
    let mut usage = Totals::default();

    let shaped = (|| {
        let effective = apply_input_path(&spec.input_path, &document, &context_object)?;
        let debate_input = match &spec.parameters {
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
        Ok::<_, ExecutionError>((effective, debate_input))
    })();
    let (effective, debate_input) = match shaped {
        Ok(pair) => pair,
        Err(err) => return settle_failure(&spec.catch, ctx, document, err, usage),
    };

    let mut log = AttemptLog::new(spec.retry.len());
    let raw = loop {
        match run_debate(spec, core, ctx, &debate_input, &mut usage).await {
            Ok(value) => break value,
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
        raw,
        &context_object,
        ctx.env(),
    );
    match shaped {
        Ok(output) => transition(spec.next.as_deref(), spec.end, output, usage),
        Err(err) => settle_failure(&spec.catch, ctx, effective, err, usage),
    }
}

async fn run_debate(
    spec: &DebateSpec,
    core: &Arc<EngineCore>,
    ctx: &mut ExecutionContext,
    debate_input: &Value,
    usage: &mut Totals,
) -> Result<Value, ExecutionError> {
    let mut agents: Vec<(String, Arc<dyn Agent>)> = Vec::with_capacity(spec.participants.len());
    for name in &spec.participants {
        let agent = core.registry.get(name).ok_or_else(|| {
            ExecutionError::task_failed(format!("no agent registered under '{name}'"))
        })?;
        agents.push((name.clone(), agent));
    }

    let mut transcript: Vec<Value> = Vec::new();
    for round in 0..spec.rounds {
        for (name, agent) in &agents {
            if ctx.cancel_token().is_cancelled() {
                return Err(ExecutionError::cancelled("debate cancelled"));
            }
            let turn_input = json!({
                "input": debate_input,
                "transcript": transcript,
            });
            let (heartbeat, _beats) = Heartbeat::channel();
            let call = CallContext {
                state: ctx.current_state.clone(),
                execution_id: ctx.execution_id.clone(),
                deadline: None,
                heartbeat,
                cancel: ctx.cancel_token().clone(),
            };
            tracing::debug!(state = %ctx.current_state, agent = %name, round, "debate turn");
            let mut content = agent
                .invoke(turn_input, json!({}), call)
                .await
                .map_err(|e| ExecutionError::new(e.code, e.cause))?;
            usage.add(strip_accounting(&mut content));
            transcript.push(json!({
                "Agent": name,
                "Round": round,
                "Content": content,
            }));
        }
    }

    Ok(json!({"Transcript": transcript, "Rounds": spec.rounds}))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentRegistry;
    use crate::context::Environment;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_round_robin_transcript() {
        let mut registry = AgentRegistry::new();
        registry.register_fn("optimist", |input| async move {
            let turns = input["transcript"].as_array().unwrap().len();
            Ok(json!({"position": "for", "turn": turns, "_tokens": 10}))
        });
        registry.register_fn("skeptic", |input| async move {
            let turns = input["transcript"].as_array().unwrap().len();
            Ok(json!({"position": "against", "turn": turns, "_tokens": 10}))
        });
        let core = Arc::new(EngineCore::new(registry, None, None, Environment::new()));
        let mut ctx = ExecutionContext::new(
            "exec-1".to_string(),
            json!({}),
            Environment::new(),
            CancellationToken::new(),
        );
        ctx.enter_state("D");

        let spec: DebateSpec = serde_json::from_value(json!({
            "Participants": ["optimist", "skeptic"],
            "Rounds": 2,
            "ResultPath": "$.debate",
            "End": true
        }))
        .unwrap();

        let result = step(&spec, &core, &mut ctx, json!({"topic": "rewrite?"}))
            .await
            .unwrap();
        match result {
            StepResult::End { output, tokens, .. } => {
                assert_eq!(tokens, 40);
                let transcript = output["debate"]["Transcript"].as_array().unwrap();
                assert_eq!(transcript.len(), 4);
                assert_eq!(transcript[0]["Agent"], json!("optimist"));
                assert_eq!(transcript[1]["Agent"], json!("skeptic"));
                assert_eq!(transcript[3]["Round"], json!(1));
                // Each turn saw all prior turns.
                assert_eq!(transcript[2]["Content"]["turn"], json!(2));
                assert_eq!(output["topic"], json!("rewrite?"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_participant_fails() {
        let core = Arc::new(EngineCore::new(
            AgentRegistry::new(),
            None,
            None,
            Environment::new(),
        ));
        let mut ctx = ExecutionContext::new(
            "exec-1".to_string(),
            json!({}),
            Environment::new(),
            CancellationToken::new(),
        );
        ctx.enter_state("D");
        let spec: DebateSpec = serde_json::from_value(json!({
            "Participants": ["a", "b"],
            "End": true
        }))
        .unwrap();
        let err = step(&spec, &core, &mut ctx, json!({})).await.unwrap_err();
        assert!(err.cause.contains("no agent registered"));
    }
}
