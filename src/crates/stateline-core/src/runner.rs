//! The dispatcher: drive a compiled workflow from input to outcome
//!
//! [`CompiledWorkflow`] is the host-facing execution surface. `run` seeds an
//! [`ExecutionContext`] and repeatedly steps states until the machine ends,
//! fails, or suspends; `resume` continues a suspended Approval with a
//! decision (or timeout signal), and `resume_from_checkpoint` restores a
//! durable snapshot and continues stepping at the saved state.
//!
//! Within a single (sub-)execution, transitions are totally ordered and
//! serialized; concurrency only ever comes from Map and Parallel states,
//! which run their sub-executions through [`drive`] on spawned tasks and
//! merge results back in deterministic order.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::agent::AgentRegistry;
use crate::approval::{ApprovalDecision, ApprovalGateway, ApprovalRequest, ResumePayload};
use crate::context::{
    Environment, ExecutionContext, ExecutionStatus, Totals, Trace, TraceKind,
};
use crate::definition::{ApprovalSpec, OnTimeoutPolicy, StateMachine, StateSpec};
use crate::error::{codes, EngineError, ExecutionError, Result};
use crate::states::approval::{resolve_decision, Route};
use crate::states::{self, StepResult, SuspendReason, Suspension};
use stateline_checkpoint::CheckpointStore;

/// Shared, read-only machinery handed to every state step and every
/// spawned sub-execution.
pub(crate) struct EngineCore {
    pub(crate) registry: AgentRegistry,
    pub(crate) checkpoints: Option<Arc<dyn CheckpointStore>>,
    pub(crate) approvals: Option<Arc<dyn ApprovalGateway>>,
    pub(crate) env: Environment,
}

impl EngineCore {
    pub(crate) fn new(
        registry: AgentRegistry,
        checkpoints: Option<Arc<dyn CheckpointStore>>,
        approvals: Option<Arc<dyn ApprovalGateway>>,
        env: Environment,
    ) -> Self {
        Self {
            registry,
            checkpoints,
            approvals,
            env,
        }
    }
}

/// How one (sub-)execution settled.
#[derive(Debug)]
pub(crate) enum Driven {
    Completed { output: Value },
    Failed {
        error: String,
        cause: String,
        output: Value,
    },
    Suspended { suspension: Box<Suspension> },
}

/// Advance a machine until it ends, fails, or suspends. `ctx.current_state`
/// names the state to run first.
///
/// Returns an explicitly boxed, `Send`-asserted future rather than an
/// `async fn` opaque type: `drive` participates in mutual recursion with
/// `states::step` (Map/Parallel spawn sub-executions that call back into
/// `drive`), and that cycle defeats the compiler's auto-trait leak-check for
/// `Send` on a plain opaque return type.
pub(crate) fn drive<'a>(
    core: Arc<EngineCore>,
    machine: Arc<StateMachine>,
    ctx: &'a mut ExecutionContext,
    input: Value,
) -> Pin<Box<dyn Future<Output = Driven> + Send + 'a>> {
    Box::pin(async move {
    let mut document = input;
    loop {
        if ctx.cancel_token().is_cancelled() {
            let error = ExecutionError::cancelled("execution cancelled");
            let state = ctx.current_state.clone();
            states::trace_error(ctx, &state, &error);
            ctx.status = ExecutionStatus::Failed;
            let output = json!({"Error": error.code, "Cause": error.cause});
            ctx.output = output.clone();
            return Driven::Failed {
                error: error.code,
                cause: error.cause,
                output,
            };
        }

        let name = ctx.current_state.clone();
        let Some(node) = machine.state(&name).cloned() else {
            // Unreachable after validation; kept as a hard stop.
            ctx.status = ExecutionStatus::Failed;
            let error = ExecutionError::task_failed(format!("unknown state '{name}'"));
            let output = json!({"Error": error.code, "Cause": error.cause});
            return Driven::Failed {
                error: error.code,
                cause: error.cause,
                output,
            };
        };

        ctx.enter_state(&name);
        tracing::debug!(
            execution = %ctx.execution_id,
            state = %name,
            kind = node.spec.type_name(),
            "entering state"
        );

        let result = states::step(&node, &core, ctx, std::mem::take(&mut document)).await;
        match result {
            Ok(StepResult::Next {
                output,
                next,
                tokens,
                cost,
            }) => {
                ctx.totals.add(Totals { tokens, cost });
                let now = ctx.now();
                ctx.trace.record(TraceKind::Exit, &name, now);
                ctx.output = output.clone();
                document = output;
                ctx.current_state = next;
            }
            Ok(StepResult::End {
                output,
                tokens,
                cost,
            }) => {
                ctx.totals.add(Totals { tokens, cost });
                let now = ctx.now();
                ctx.trace.record(TraceKind::Exit, &name, now);
                ctx.output = output.clone();
                ctx.status = ExecutionStatus::Succeeded;
                return Driven::Completed { output };
            }
            Ok(StepResult::Fail {
                error,
                cause,
                output,
            }) => {
                let failure = ExecutionError::new(error, cause);
                states::trace_error(ctx, &name, &failure);
                ctx.output = output.clone();
                ctx.status = ExecutionStatus::Failed;
                return Driven::Failed {
                    error: failure.code,
                    cause: failure.cause,
                    output,
                };
            }
            Ok(StepResult::Suspend(suspension)) => {
                ctx.status = ExecutionStatus::Suspended;
                ctx.output = suspension.document.clone();
                return Driven::Suspended { suspension };
            }
            Err(error) => {
                states::trace_error(ctx, &name, &error);
                ctx.status = ExecutionStatus::Failed;
                let output = json!({"Error": error.code, "Cause": error.cause});
                ctx.output = output.clone();
                return Driven::Failed {
                    error: error.code,
                    cause: error.cause,
                    output,
                };
            }
        }
    }
    })
}

/// A suspended approval waiting on its decision.
struct SuspendedExecution {
    state_name: String,
    document: Value,
    ctx: ExecutionContext,
    request: ApprovalRequest,
    escalations_used: u32,
}

/// The result surfaced to the host for one `run`/`resume` call.
#[derive(Debug)]
pub struct Outcome {
    pub status: ExecutionStatus,
    pub output: Value,
    pub trace: Trace,
    pub totals: Totals,
    /// Set when the execution is suspended awaiting an approval decision
    pub pending_approval: Option<PendingApproval>,
    /// Set when the execution suspended at a Checkpoint state
    pub checkpoint_id: Option<String>,
}

/// The approval a suspended execution is waiting on.
#[derive(Debug, Clone)]
pub struct PendingApproval {
    pub token: String,
    pub request: ApprovalRequest,
}

/// A validated workflow wired to its collaborators, ready to run.
pub struct CompiledWorkflow {
    machine: Arc<StateMachine>,
    registry: AgentRegistry,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    approvals: Option<Arc<dyn ApprovalGateway>>,
    env: Environment,
    execution_timeout: Option<Duration>,
    suspended: Mutex<HashMap<String, SuspendedExecution>>,
}

impl CompiledWorkflow {
    pub(crate) fn new(machine: Arc<StateMachine>, registry: AgentRegistry) -> Self {
        Self {
            machine,
            registry,
            checkpoints: None,
            approvals: None,
            env: Environment::new(),
            execution_timeout: None,
            suspended: Mutex::new(HashMap::new()),
        }
    }

    /// Attach a checkpoint store; required for Checkpoint states and for
    /// approval crash recovery.
    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    /// Attach the approval collaborator; required for Approval states.
    pub fn with_approval_gateway(mut self, gateway: Arc<dyn ApprovalGateway>) -> Self {
        self.approvals = Some(gateway);
        self
    }

    /// Replace the injected clock / id source (tests pin these).
    pub fn with_environment(mut self, env: Environment) -> Self {
        self.env = env;
        self
    }

    /// Host-supplied wall-clock bound for a whole `run`/`resume` call.
    /// Expiry cancels all pending work.
    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = Some(timeout);
        self
    }

    fn core(&self) -> Arc<EngineCore> {
        Arc::new(EngineCore::new(
            self.registry.clone(),
            self.checkpoints.clone(),
            self.approvals.clone(),
            self.env.clone(),
        ))
    }

    /// Run the workflow against an input document.
    pub async fn run(&self, input: Value) -> Result<Outcome> {
        let cancel = CancellationToken::new();
        let mut ctx = ExecutionContext::new(
            self.env.uuid(),
            input.clone(),
            self.env.clone(),
            cancel,
        );
        ctx.current_state = self.machine.start_at().to_string();
        tracing::info!(
            execution = %ctx.execution_id,
            start_at = %ctx.current_state,
            "starting execution"
        );
        let driven = self.drive_bounded(&mut ctx, input).await;
        self.settle(ctx, driven).await
    }

    /// Deliver a decision (or a gateway timeout signal) to a suspended
    /// approval and continue the execution.
    pub async fn resume(&self, token: &str, payload: ResumePayload) -> Result<Outcome> {
        let mut entry = self
            .suspended
            .lock()
            .await
            .remove(token)
            .ok_or_else(|| EngineError::UnknownResumeToken(token.to_string()))?;
        let node = self
            .machine
            .state(&entry.state_name)
            .cloned()
            .ok_or_else(|| {
                EngineError::Configuration(format!(
                    "suspended state '{}' no longer exists",
                    entry.state_name
                ))
            })?;
        let StateSpec::Approval(spec) = &node.spec else {
            return Err(EngineError::Configuration(format!(
                "suspended state '{}' is not an Approval state",
                entry.state_name
            )));
        };

        let now = entry.ctx.now();
        entry.ctx.trace.record(TraceKind::Resume, &entry.state_name, now);

        // The suspension's crash-recovery snapshot is consumed by resume.
        if let Some(store) = &self.checkpoints {
            store.delete(token).await?;
        }

        match payload {
            ResumePayload::Decision(decision) => {
                tracing::info!(token, option = %decision.option, "resuming with decision");
                self.continue_after_decision(entry, spec, decision, true)
                    .await
            }
            ResumePayload::Timeout => {
                tracing::info!(token, "approval timed out");
                self.handle_timeout(entry, spec).await
            }
        }
    }

    /// Restore a durable snapshot and continue stepping at the saved state.
    pub async fn resume_from_checkpoint(&self, id: &str) -> Result<Outcome> {
        let store = self.checkpoints.as_ref().ok_or_else(|| {
            EngineError::Configuration("no checkpoint store configured".to_string())
        })?;
        let checkpoint = store
            .get(id)
            .await?
            .ok_or_else(|| EngineError::CheckpointNotFound(id.to_string()))?;
        store.delete(id).await?;

        let cancel = CancellationToken::new();
        let mut ctx = ExecutionContext::new(
            checkpoint.execution_id.clone(),
            checkpoint.state.clone(),
            self.env.clone(),
            cancel,
        );
        ctx.totals = checkpoint.totals;
        ctx.trace = serde_json::from_value(checkpoint.trace.clone())?;

        if checkpoint.current_state.is_empty() {
            // The checkpoint was the machine's last state.
            ctx.status = ExecutionStatus::Succeeded;
            return Ok(Outcome {
                status: ExecutionStatus::Succeeded,
                output: checkpoint.state,
                trace: ctx.trace,
                totals: ctx.totals,
                pending_approval: None,
                checkpoint_id: None,
            });
        }

        ctx.current_state = checkpoint.current_state.clone();
        let now = ctx.now();
        ctx.trace.record(TraceKind::Resume, &ctx.current_state, now);
        tracing::info!(
            checkpoint = id,
            state = %ctx.current_state,
            "resuming from checkpoint"
        );
        let input = checkpoint.state.clone();
        let driven = self.drive_bounded(&mut ctx, input).await;
        self.settle(ctx, driven).await
    }

    async fn drive_bounded(&self, ctx: &mut ExecutionContext, input: Value) -> Driven {
        let core = self.core();
        let cancel = ctx.cancel_token().clone();
        let machine = self.machine.clone();
        let fut = drive(core, machine, ctx, input);
        tokio::pin!(fut);
        match self.execution_timeout {
            Some(limit) => {
                tokio::select! {
                    driven = &mut fut => driven,
                    _ = tokio::time::sleep(limit) => {
                        tracing::warn!(limit_ms = limit.as_millis() as u64, "execution timeout, cancelling");
                        cancel.cancel();
                        fut.await
                    }
                }
            }
            None => fut.await,
        }
    }

    async fn settle(&self, ctx: ExecutionContext, driven: Driven) -> Result<Outcome> {
        match driven {
            Driven::Completed { output } => Ok(Outcome {
                status: ExecutionStatus::Succeeded,
                output,
                trace: ctx.trace,
                totals: ctx.totals,
                pending_approval: None,
                checkpoint_id: None,
            }),
            Driven::Failed { output, error, cause } => {
                tracing::warn!(
                    execution = %ctx.execution_id,
                    code = %error,
                    cause = %cause,
                    "execution failed"
                );
                Ok(Outcome {
                    status: ExecutionStatus::Failed,
                    output,
                    trace: ctx.trace,
                    totals: ctx.totals,
                    pending_approval: None,
                    checkpoint_id: None,
                })
            }
            Driven::Suspended { suspension } => {
                let suspension = *suspension;
                let trace = ctx.trace.clone();
                let totals = ctx.totals;
                match suspension.reason {
                    SuspendReason::Approval => {
                        let request = suspension.request.ok_or_else(|| {
                            EngineError::Configuration(
                                "approval suspension is missing its request".to_string(),
                            )
                        })?;
                        let pending = PendingApproval {
                            token: suspension.token.clone(),
                            request: request.clone(),
                        };
                        let entry = SuspendedExecution {
                            state_name: ctx.current_state.clone(),
                            document: suspension.document.clone(),
                            ctx,
                            request,
                            escalations_used: 0,
                        };
                        self.suspended
                            .lock()
                            .await
                            .insert(suspension.token, entry);
                        Ok(Outcome {
                            status: ExecutionStatus::Suspended,
                            output: suspension.document,
                            trace,
                            totals,
                            pending_approval: Some(pending),
                            checkpoint_id: None,
                        })
                    }
                    SuspendReason::Checkpoint => Ok(Outcome {
                        status: ExecutionStatus::Suspended,
                        output: suspension.document,
                        trace,
                        totals,
                        pending_approval: None,
                        checkpoint_id: Some(suspension.token),
                    }),
                }
            }
        }
    }

    async fn continue_after_decision(
        &self,
        mut entry: SuspendedExecution,
        spec: &ApprovalSpec,
        decision: ApprovalDecision,
        validate_option: bool,
    ) -> Result<Outcome> {
        let context_object = entry.ctx.context_object();
        match resolve_decision(
            spec,
            entry.document.clone(),
            &decision,
            &context_object,
            validate_option,
        ) {
            Ok((document, Route::Next(next))) => {
                entry.ctx.status = ExecutionStatus::Running;
                entry.ctx.current_state = next;
                let driven = self.drive_bounded(&mut entry.ctx, document).await;
                self.settle(entry.ctx, driven).await
            }
            Ok((document, Route::End)) => {
                entry.ctx.status = ExecutionStatus::Succeeded;
                entry.ctx.output = document.clone();
                Ok(Outcome {
                    status: ExecutionStatus::Succeeded,
                    output: document,
                    trace: entry.ctx.trace,
                    totals: entry.ctx.totals,
                    pending_approval: None,
                    checkpoint_id: None,
                })
            }
            Err(error) => self.fail_approval(entry, spec, error).await,
        }
    }

    /// An approval-level error: Catch on the approval state when a rule
    /// matches, terminal failure otherwise.
    async fn fail_approval(
        &self,
        mut entry: SuspendedExecution,
        spec: &ApprovalSpec,
        error: ExecutionError,
    ) -> Result<Outcome> {
        let state = entry.ctx.current_state.clone();
        states::trace_error(&mut entry.ctx, &state, &error);
        if let Some(rule) = crate::retry::find_catch(&spec.catch, &error.code) {
            if let Ok(StepResult::Next { output, next, .. }) =
                states::apply_catch(rule, entry.document.clone(), &error, Totals::default())
            {
                entry.ctx.status = ExecutionStatus::Running;
                entry.ctx.current_state = next;
                let driven = self.drive_bounded(&mut entry.ctx, output).await;
                return self.settle(entry.ctx, driven).await;
            }
        }
        entry.ctx.status = ExecutionStatus::Failed;
        let output = json!({"Error": error.code, "Cause": error.cause});
        Ok(Outcome {
            status: ExecutionStatus::Failed,
            output,
            trace: entry.ctx.trace,
            totals: entry.ctx.totals,
            pending_approval: None,
            checkpoint_id: None,
        })
    }

    async fn handle_timeout(
        &self,
        mut entry: SuspendedExecution,
        spec: &ApprovalSpec,
    ) -> Result<Outcome> {
        match spec.on_timeout {
            Some(OnTimeoutPolicy::AutoApprove) | Some(OnTimeoutPolicy::AutoReject) => {
                let option = if spec.on_timeout == Some(OnTimeoutPolicy::AutoApprove) {
                    "approve"
                } else {
                    "reject"
                };
                let decision = ApprovalDecision {
                    option: option.to_string(),
                    approver: "system:timeout".to_string(),
                    comment: None,
                    edited_fields: serde_json::Map::new(),
                    timestamp: entry.ctx.now(),
                };
                self.continue_after_decision(entry, spec, decision, false)
                    .await
            }
            Some(OnTimeoutPolicy::Escalate) => {
                let cap = spec.escalation.as_ref().map(|e| e.repeat).unwrap_or(0);
                if entry.escalations_used >= cap {
                    return self
                        .fail_approval(
                            entry,
                            spec,
                            ExecutionError::new(
                                codes::APPROVAL_TIMEOUT,
                                "approval escalation repeats exhausted",
                            ),
                        )
                        .await;
                }
                let gateway = self.approvals.as_ref().ok_or_else(|| {
                    EngineError::Configuration("no approval gateway configured".to_string())
                })?;
                let new_token = gateway
                    .emit(entry.request.clone())
                    .await
                    .map_err(EngineError::Execution)?;
                entry.escalations_used += 1;

                let state = entry.ctx.current_state.clone();
                let mut extras = serde_json::Map::new();
                extras.insert(
                    "reason".to_string(),
                    Value::String("approval-escalation".to_string()),
                );
                extras.insert("token".to_string(), Value::String(new_token.clone()));
                extras.insert(
                    "escalation".to_string(),
                    Value::from(entry.escalations_used),
                );
                let now = entry.ctx.now();
                entry
                    .ctx
                    .trace
                    .record_with(TraceKind::Suspend, &state, now, extras);
                tracing::info!(
                    state = %state,
                    token = %new_token,
                    escalation = entry.escalations_used,
                    "approval escalated, timeout restarted"
                );

                let pending = PendingApproval {
                    token: new_token.clone(),
                    request: entry.request.clone(),
                };
                let trace = entry.ctx.trace.clone();
                let totals = entry.ctx.totals;
                let output = entry.document.clone();
                self.suspended.lock().await.insert(new_token, entry);
                Ok(Outcome {
                    status: ExecutionStatus::Suspended,
                    output,
                    trace,
                    totals,
                    pending_approval: Some(pending),
                    checkpoint_id: None,
                })
            }
            Some(OnTimeoutPolicy::Fail) => {
                self.fail_approval(
                    entry,
                    spec,
                    ExecutionError::new(codes::APPROVAL_TIMEOUT, "approval timed out"),
                )
                .await
            }
            None => {
                if let Some(default) = spec.default.clone() {
                    entry.ctx.status = ExecutionStatus::Running;
                    entry.ctx.current_state = default;
                    let document = entry.document.clone();
                    let driven = self.drive_bounded(&mut entry.ctx, document).await;
                    self.settle(entry.ctx, driven).await
                } else {
                    self.fail_approval(
                        entry,
                        spec,
                        ExecutionError::new(
                            codes::APPROVAL_TIMEOUT,
                            "approval timed out with no OnTimeout policy and no Default",
                        ),
                    )
                    .await
                }
            }
        }
    }
}
