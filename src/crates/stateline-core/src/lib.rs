//! # stateline-core - Workflow Execution Engine for AI Agents
//!
//! **An interpreter for a declarative, JSON-encoded state-machine language**
//! that orchestrates AI agents. A workflow definition is a named graph of
//! states connected by explicit transitions; the engine advances an
//! execution through that graph, threading a mutable JSON document through
//! each state and invoking host-registered agents at Task states.
//!
//! ## Overview
//!
//! `stateline-core` provides:
//!
//! - **A state dispatcher** - load, validate, and step definitions through
//!   Task, Choice, Map, Parallel, Pass, Wait, Succeed, Fail, Approval,
//!   Checkpoint, and Debate states
//! - **Data plumbing** - `InputPath` → `Parameters` → invocation →
//!   `ResultSelector` → `ResultPath` → `OutputPath`, with path expressions
//!   (`$.a.b`, `$$.Map.Item.Value`) and `States.*` intrinsic functions
//! - **Error handling** - flat error codes matched by `Retry` rules
//!   (exponential backoff with jitter) and `Catch` routes
//! - **Bounded concurrency** - Map iteration under `MaxConcurrency` and
//!   Parallel branches, with cooperative cancellation and results collected
//!   in definition order
//! - **Long-lived states** - Approval (suspend for an external decision,
//!   with timeout/escalation policy) and Checkpoint (durable resume points
//!   via [`stateline_checkpoint`])
//!
//! The engine deliberately stops at the agent boundary: model calls, tool
//! execution, sandboxing, and rate limiting live behind the [`Agent`] trait,
//! and approval transport behind [`ApprovalGateway`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use stateline_core::{AgentRegistry, Definition};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> stateline_core::Result<()> {
//!     let definition = Definition::from_json(r#"{
//!         "StartAt": "Summarize",
//!         "States": {
//!             "Summarize": {
//!                 "Type": "Task",
//!                 "Agent": "summarizer",
//!                 "Parameters": {"text.$": "$.document"},
//!                 "ResultPath": "$.summary",
//!                 "Next": "Route"
//!             },
//!             "Route": {
//!                 "Type": "Choice",
//!                 "Choices": [
//!                     {"Variable": "$.summary.confidence",
//!                      "NumericGreaterThanEquals": 0.8, "Next": "Done"}
//!                 ],
//!                 "Default": "Done"
//!             },
//!             "Done": {"Type": "Succeed"}
//!         }
//!     }"#)?;
//!
//!     let mut registry = AgentRegistry::new();
//!     registry.register_fn("summarizer", |input| async move {
//!         // Call a model here; `_tokens`/`_cost` feed execution totals.
//!         Ok(json!({"text": input["text"], "confidence": 0.9, "_tokens": 120}))
//!     });
//!
//!     let workflow = definition.compile(registry)?;
//!     let outcome = workflow.run(json!({"document": "..."})).await?;
//!     println!("{:?}: {}", outcome.status, outcome.output);
//!     Ok(())
//! }
//! ```
//!
//! ## Suspension and Resume
//!
//! Approval states emit a request through the configured
//! [`ApprovalGateway`] and return an `Outcome` with
//! `status == Suspended` and a resume token; the host later calls
//! [`CompiledWorkflow::resume`] with a decision (or a timeout signal, which
//! triggers the state's `OnTimeout` policy). Checkpoint states snapshot the
//! execution into a [`CheckpointStore`]; [`CompiledWorkflow::resume_from_checkpoint`]
//! restores the document, trace, and totals and continues at the saved
//! state.

pub mod agent;
pub mod approval;
pub mod context;
pub mod definition;
pub mod error;
pub mod intrinsics;
pub mod params;
pub mod path;
pub mod retry;
pub mod runner;
pub mod states;
mod validator;
pub mod value;

pub use agent::{Agent, AgentRegistry, CallContext, Heartbeat};
pub use approval::{
    ApprovalDecision, ApprovalGateway, ApprovalRequest, Escalation, ResumePayload,
};
pub use context::{
    Clock, Environment, EvalScope, ExecutionContext, ExecutionStatus, IdSource, MapItem,
    RandomIds, SystemClock, Totals, Trace, TraceEntry, TraceKind,
};
pub use definition::{
    CatchSpec, ChoiceRule, Definition, JitterStrategy, ResultPathField, RetrySpec, StateMachine,
    StateSpec,
};
pub use error::{codes, EngineError, ExecutionError, Result};
pub use path::Path;
pub use runner::{CompiledWorkflow, Outcome, PendingApproval};
pub use states::{StepResult, SuspendReason, Suspension};

pub use stateline_checkpoint::{
    parse_ttl, Checkpoint, CheckpointError, CheckpointStore, InMemoryCheckpointStore,
};
