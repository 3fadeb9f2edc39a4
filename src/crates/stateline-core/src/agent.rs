//! Agent registry: the engine's view of the agents it orchestrates
//!
//! The engine never calls a model, runs a tool, or assembles a context
//! window. It sees agents only through the [`Agent`] trait: an opaque async
//! callable that takes a JSON input plus a pass-through configuration object
//! and returns a JSON result or a flat `{code, cause}` error. Task and
//! Debate states look agents up by name in an [`AgentRegistry`] that is
//! read-only for the lifetime of an execution.
//!
//! The [`CallContext`] handed to every invocation carries the cooperative
//! obligations: a deadline when `TimeoutSeconds` is set, a [`Heartbeat`]
//! handle the agent should beat when `HeartbeatSeconds` is set, and a
//! cancellation token the agent must observe to abort early.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::ExecutionError;

/// Handle an agent uses to signal liveness during a long invocation.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    tx: mpsc::UnboundedSender<()>,
}

impl Heartbeat {
    /// Create a heartbeat handle and the receiver the engine monitors.
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Signal liveness. Beats after the engine stopped listening are
    /// silently dropped.
    pub fn beat(&self) {
        let _ = self.tx.send(());
    }
}

/// Per-invocation context passed to an agent.
#[derive(Debug, Clone)]
pub struct CallContext {
    /// Name of the state performing the invocation
    pub state: String,
    /// Id of the execution the invocation belongs to
    pub execution_id: String,
    /// Wall-clock deadline when the state sets `TimeoutSeconds`
    pub deadline: Option<DateTime<Utc>>,
    /// Liveness handle; beat at least as often as `HeartbeatSeconds`
    pub heartbeat: Heartbeat,
    /// Cooperative cancellation; the agent must observe this to abort early
    pub cancel: CancellationToken,
}

/// An opaque callable registered by the host.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Invoke the agent. The returned object may include the reserved
    /// accounting keys `_tokens`, `_cost`, and `_usage`, which the engine
    /// strips after adding to the execution totals. Raised errors must carry
    /// a code and cause; an empty code is classified as `States.TaskFailed`.
    async fn invoke(
        &self,
        input: Value,
        config: Value,
        call: CallContext,
    ) -> Result<Value, ExecutionError>;
}

struct FnAgent<F>(F);

#[async_trait]
impl<F, Fut> Agent for FnAgent<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, ExecutionError>> + Send,
{
    async fn invoke(
        &self,
        input: Value,
        _config: Value,
        _call: CallContext,
    ) -> Result<Value, ExecutionError> {
        (self.0)(input).await
    }
}

/// Name-to-agent binding used by Task and Debate states.
#[derive(Default, Clone)]
pub struct AgentRegistry {
    agents: HashMap<String, Arc<dyn Agent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent under a name, replacing any previous binding.
    pub fn register(&mut self, name: impl Into<String>, agent: Arc<dyn Agent>) {
        self.agents.insert(name.into(), agent);
    }

    /// Register a plain async closure that only needs the input. Useful for
    /// tests and simple hosts.
    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ExecutionError>> + Send + 'static,
    {
        self.register(name, Arc::new(FnAgent(f)));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Agent>> {
        self.agents.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.agents.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("agents", &self.agents.keys().collect::<Vec<_>>())
            .finish()
    }
}
