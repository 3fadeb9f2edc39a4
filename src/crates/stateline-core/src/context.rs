//! Per-execution state: the running document, trace, totals, and the
//! read-only context object surfaced at `$$`
//!
//! An [`ExecutionContext`] is created by the runner for every execution (and
//! for every Map iteration / Parallel branch sub-execution). It owns the
//! mutable, execution-wide data; the immutable machinery (definition, agent
//! registry, collaborators) lives elsewhere and is shared.
//!
//! Time, randomness, and id generation are injected through [`Environment`]
//! so tests can pin them.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

pub use stateline_checkpoint::Totals;

/// Source of the current wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The real clock.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Source of fresh identifiers.
pub trait IdSource: Send + Sync {
    fn uuid(&self) -> String;
}

/// Version-4 UUIDs.
#[derive(Debug, Default)]
pub struct RandomIds;

impl IdSource for RandomIds {
    fn uuid(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

/// Injected time and identifier generation.
#[derive(Clone)]
pub struct Environment {
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdSource>,
}

impl Environment {
    pub fn new() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            ids: Arc::new(RandomIds),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_ids(mut self, ids: Arc<dyn IdSource>) -> Self {
        self.ids = ids;
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn uuid(&self) -> String {
        self.ids.uuid()
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment").finish_non_exhaustive()
    }
}

/// Lifecycle status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Suspended,
    Succeeded,
    Failed,
}

/// What kind of event a trace entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceKind {
    Enter,
    Exit,
    Error,
    Retry,
    ChoiceMatch,
    Suspend,
    Resume,
}

/// One event in the execution trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEntry {
    pub kind: TraceKind,
    pub state: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extras: Map<String, Value>,
}

/// Append-only event log for one execution.
///
/// Existing entries are never mutated or reordered; the only mutations are
/// appending and absorbing a finished sub-execution's entries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Trace {
    entries: Vec<TraceEntry>,
}

impl Trace {
    pub fn push(&mut self, entry: TraceEntry) {
        self.entries.push(entry);
    }

    pub fn record(&mut self, kind: TraceKind, state: &str, timestamp: DateTime<Utc>) {
        self.push(TraceEntry {
            kind,
            state: state.to_string(),
            timestamp,
            extras: Map::new(),
        });
    }

    pub fn record_with(
        &mut self,
        kind: TraceKind,
        state: &str,
        timestamp: DateTime<Utc>,
        extras: Map<String, Value>,
    ) {
        self.push(TraceEntry {
            kind,
            state: state.to_string(),
            timestamp,
            extras,
        });
    }

    /// Append all entries of a finished sub-execution, in their order.
    pub fn absorb(&mut self, other: Trace) {
        self.entries.extend(other.entries);
    }

    pub fn entries(&self) -> &[TraceEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries of a given kind, in trace order.
    pub fn of_kind(&self, kind: TraceKind) -> impl Iterator<Item = &TraceEntry> {
        self.entries.iter().filter(move |e| e.kind == kind)
    }
}

/// Map-iteration coordinates surfaced at `$$.Map.Item`.
#[derive(Debug, Clone)]
pub struct MapItem {
    pub value: Value,
    pub index: usize,
}

/// Execution-wide mutable state for one (sub-)execution.
#[derive(Debug)]
pub struct ExecutionContext {
    pub execution_id: String,
    pub started_at: DateTime<Utc>,
    /// The user-supplied input this execution was seeded with
    pub input: Value,
    /// The running document after the most recent transition
    pub output: Value,
    pub current_state: String,
    pub status: ExecutionStatus,
    pub trace: Trace,
    pub totals: Totals,
    env: Environment,
    cancel: CancellationToken,
    map_item: Option<MapItem>,
    state_entered_at: DateTime<Utc>,
}

impl ExecutionContext {
    pub fn new(
        execution_id: String,
        input: Value,
        env: Environment,
        cancel: CancellationToken,
    ) -> Self {
        let started_at = env.now();
        Self {
            execution_id,
            started_at,
            output: input.clone(),
            input,
            current_state: String::new(),
            status: ExecutionStatus::Running,
            trace: Trace::default(),
            totals: Totals::default(),
            env,
            cancel,
            map_item: None,
            state_entered_at: started_at,
        }
    }

    /// Child context for one Map iteration, carrying the `$$.Map.Item`
    /// coordinates. The child gets a fresh trace and totals; the driver
    /// folds both back into the parent after the iteration settles.
    pub(crate) fn for_iteration(
        parent: &ExecutionContext,
        item: MapItem,
        cancel: CancellationToken,
        input: Value,
    ) -> Self {
        let mut child = Self::new(parent.execution_id.clone(), input, parent.env.clone(), cancel);
        child.started_at = parent.started_at;
        child.map_item = Some(item);
        child
    }

    /// Child context for one Parallel branch.
    pub(crate) fn for_branch(
        parent: &ExecutionContext,
        cancel: CancellationToken,
        input: Value,
    ) -> Self {
        let mut child = Self::new(parent.execution_id.clone(), input, parent.env.clone(), cancel);
        child.started_at = parent.started_at;
        child
    }

    /// Mark entry into a state: update the current state name, stamp the
    /// entry time, and record an `enter` trace event.
    pub fn enter_state(&mut self, name: &str) {
        self.current_state = name.to_string();
        self.state_entered_at = self.env.now();
        self.trace.record(TraceKind::Enter, name, self.state_entered_at);
    }

    /// The read-only context object addressed by `$$`.
    pub fn context_object(&self) -> Value {
        let mut object = json!({
            "Execution": {
                "Id": self.execution_id,
                "StartTime": self.started_at.to_rfc3339(),
            },
            "State": {
                "Name": self.current_state,
                "EnteredTime": self.state_entered_at.to_rfc3339(),
            },
        });
        if let Some(item) = &self.map_item {
            object["Map"] = json!({
                "Item": { "Value": item.value, "Index": item.index }
            });
        }
        object
    }

    pub fn env(&self) -> &Environment {
        &self.env
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.env.now()
    }
}

/// Borrowed evaluation scope for path and intrinsic expressions: the
/// document being addressed, the `$$` context object, and the environment
/// for nondeterministic intrinsics.
pub struct EvalScope<'a> {
    pub document: &'a Value,
    pub context: &'a Value,
    pub env: &'a Environment,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    pub(crate) struct FixedClock(pub DateTime<Utc>);

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }

    #[derive(Debug)]
    struct CountingIds(std::sync::atomic::AtomicU64);

    impl IdSource for CountingIds {
        fn uuid(&self) -> String {
            let n = self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            format!("id-{n}")
        }
    }

    fn pinned_env() -> Environment {
        let now = "2026-03-01T12:00:00Z".parse().unwrap();
        Environment::new()
            .with_clock(Arc::new(FixedClock(now)))
            .with_ids(Arc::new(CountingIds(std::sync::atomic::AtomicU64::new(0))))
    }

    #[test]
    fn test_environment_injection() {
        let env = pinned_env();
        assert_eq!(env.now().to_rfc3339(), "2026-03-01T12:00:00+00:00");
        assert_eq!(env.uuid(), "id-0");
        assert_eq!(env.uuid(), "id-1");
    }

    #[test]
    fn test_context_object_shape() {
        let env = pinned_env();
        let mut ctx = ExecutionContext::new(
            "exec-1".to_string(),
            json!({"a": 1}),
            env,
            CancellationToken::new(),
        );
        ctx.enter_state("First");

        let object = ctx.context_object();
        assert_eq!(object["Execution"]["Id"], json!("exec-1"));
        assert_eq!(object["State"]["Name"], json!("First"));
        assert_eq!(
            object["State"]["EnteredTime"],
            json!("2026-03-01T12:00:00+00:00")
        );
        assert!(object.get("Map").is_none());
    }

    #[test]
    fn test_iteration_context_carries_map_item() {
        let env = pinned_env();
        let parent = ExecutionContext::new(
            "exec-1".to_string(),
            json!({}),
            env,
            CancellationToken::new(),
        );
        let child = ExecutionContext::for_iteration(
            &parent,
            MapItem { value: json!("x"), index: 3 },
            CancellationToken::new(),
            json!({"value": "x"}),
        );
        let object = child.context_object();
        assert_eq!(object["Map"]["Item"]["Value"], json!("x"));
        assert_eq!(object["Map"]["Item"]["Index"], json!(3));
        assert_eq!(object["Execution"]["Id"], json!("exec-1"));
    }

    #[test]
    fn test_trace_is_append_only_and_filterable() {
        let now = Utc::now();
        let mut trace = Trace::default();
        trace.record(TraceKind::Enter, "A", now);
        trace.record(TraceKind::Exit, "A", now);
        trace.record(TraceKind::Enter, "B", now);

        let mut sub = Trace::default();
        sub.record(TraceKind::Error, "B1", now);
        trace.absorb(sub);

        assert_eq!(trace.len(), 4);
        assert_eq!(trace.entries()[3].state, "B1");
        assert_eq!(trace.of_kind(TraceKind::Enter).count(), 2);
    }
}
