//! Workflow definitions: the JSON wire format and the compiled machine
//!
//! A definition document is UTF-8 JSON with `StartAt` and `States` at the
//! top level; `States` maps names to discriminated state records keyed by
//! `Type`. Pre-processing-only keys (`Imports`, `Module`, `Exports`,
//! `Parameters`, `Budget`, `Memory`, `DefaultTools`, `Progress`,
//! `RealTime`) are accepted and ignored - template composition is assumed to
//! have been inlined before the document reaches the engine.
//!
//! [`Definition::compile`] is the factory: it parses every state record,
//! runs structural validation, recursively builds the sub-machines of Map
//! iterators and Parallel branches, and wires the result to an agent
//! registry, producing a ready-to-run
//! [`CompiledWorkflow`](crate::runner::CompiledWorkflow).

use std::collections::HashMap;
use std::path::Path as FilePath;
use std::sync::Arc;

use serde::{Deserialize, Deserializer};
use serde_json::{Map, Number, Value};

use crate::agent::AgentRegistry;
use crate::error::{EngineError, ExecutionError, Result};
use crate::path::Path;
use crate::runner::CompiledWorkflow;
use crate::validator;

/// Tri-state `ResultPath`: absent replaces the whole document, literal
/// `null` discards the result, and a path writes the result into the input.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ResultPathField {
    #[default]
    Replace,
    Discard,
    At(String),
}

impl ResultPathField {
    /// Combine a state's input document with its result.
    pub fn apply(&self, document: Value, result: Value) -> std::result::Result<Value, ExecutionError> {
        match self {
            ResultPathField::Replace => Ok(result),
            ResultPathField::Discard => Ok(document),
            ResultPathField::At(expr) => Path::parse(expr)?.write(document, result),
        }
    }
}

fn deserialize_result_path<'de, D>(deserializer: D) -> std::result::Result<ResultPathField, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<String>::deserialize(deserializer)? {
        Some(path) => ResultPathField::At(path),
        None => ResultPathField::Discard,
    })
}

/// Jitter applied to a computed retry delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum JitterStrategy {
    /// Use the computed delay as-is
    #[default]
    #[serde(rename = "NONE")]
    None,
    /// Draw uniformly from `[0, delay]`
    #[serde(rename = "FULL")]
    Full,
    /// Decorrelated jitter: `min(cap, uniform(base, prev * 3))`
    #[serde(rename = "DECORRELATED")]
    Decorrelated,
}

fn default_interval_seconds() -> f64 {
    1.0
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_rate() -> f64 {
    2.0
}

/// One retry rule. Rules are matched in order; each keeps its own attempt
/// counter, so `States.ALL` conventionally matches last.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RetrySpec {
    pub error_equals: Vec<String>,
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: f64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_rate")]
    pub backoff_rate: f64,
    #[serde(default)]
    pub max_delay_seconds: Option<f64>,
    #[serde(default)]
    pub jitter_strategy: JitterStrategy,
}

impl RetrySpec {
    pub fn matches(&self, code: &str) -> bool {
        self.error_equals
            .iter()
            .any(|e| e == code || e == crate::error::codes::ALL)
    }
}

/// One catch rule: route a matching error to a fallback state, writing
/// `{Error, Cause}` into the document at `ResultPath`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CatchSpec {
    pub error_equals: Vec<String>,
    pub next: String,
    #[serde(default, deserialize_with = "deserialize_result_path")]
    pub result_path: ResultPathField,
}

impl CatchSpec {
    pub fn matches(&self, code: &str) -> bool {
        self.error_equals
            .iter()
            .any(|e| e == code || e == crate::error::codes::ALL)
    }
}

/// A choice rule: either a compound (`And`/`Or`/`Not`) or a leaf with
/// `Variable` plus exactly one comparator. Top-level rules carry `Next`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ChoiceRule {
    pub variable: Option<String>,
    pub next: Option<String>,

    pub and: Option<Vec<ChoiceRule>>,
    pub or: Option<Vec<ChoiceRule>>,
    pub not: Option<Box<ChoiceRule>>,

    pub string_equals: Option<String>,
    pub string_equals_path: Option<String>,
    pub string_less_than: Option<String>,
    pub string_less_than_equals: Option<String>,
    pub string_greater_than: Option<String>,
    pub string_greater_than_equals: Option<String>,
    pub string_matches: Option<String>,

    pub numeric_equals: Option<Number>,
    pub numeric_equals_path: Option<String>,
    pub numeric_less_than: Option<Number>,
    pub numeric_less_than_equals: Option<Number>,
    pub numeric_greater_than: Option<Number>,
    pub numeric_greater_than_equals: Option<Number>,

    pub boolean_equals: Option<bool>,
    pub boolean_equals_path: Option<String>,

    pub is_present: Option<bool>,
    pub is_null: Option<bool>,
    pub is_string: Option<bool>,
    pub is_numeric: Option<bool>,
    pub is_boolean: Option<bool>,
    pub is_timestamp: Option<bool>,
}

impl ChoiceRule {
    pub fn is_compound(&self) -> bool {
        self.and.is_some() || self.or.is_some() || self.not.is_some()
    }

    /// Number of leaf comparators set on this rule.
    pub fn comparator_count(&self) -> usize {
        [
            self.string_equals.is_some(),
            self.string_equals_path.is_some(),
            self.string_less_than.is_some(),
            self.string_less_than_equals.is_some(),
            self.string_greater_than.is_some(),
            self.string_greater_than_equals.is_some(),
            self.string_matches.is_some(),
            self.numeric_equals.is_some(),
            self.numeric_equals_path.is_some(),
            self.numeric_less_than.is_some(),
            self.numeric_less_than_equals.is_some(),
            self.numeric_greater_than.is_some(),
            self.numeric_greater_than_equals.is_some(),
            self.boolean_equals.is_some(),
            self.boolean_equals_path.is_some(),
            self.is_present.is_some(),
            self.is_null.is_some(),
            self.is_string.is_some(),
            self.is_numeric.is_some(),
            self.is_boolean.is_some(),
            self.is_timestamp.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count()
    }
}

/// A nested `{StartAt, States}` block: a Map iterator or a Parallel branch.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SubDefinition {
    pub start_at: String,
    pub states: Map<String, Value>,
    #[serde(default)]
    pub comment: Option<String>,
}

/// Task: shape input, invoke a registered agent, shape output.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TaskSpec {
    pub agent: String,
    pub comment: Option<String>,
    pub input_path: Option<String>,
    pub parameters: Option<Value>,
    pub result_selector: Option<Value>,
    #[serde(default, deserialize_with = "deserialize_result_path")]
    pub result_path: ResultPathField,
    pub output_path: Option<String>,
    pub next: Option<String>,
    #[serde(default)]
    pub end: bool,
    pub timeout_seconds: Option<u64>,
    pub heartbeat_seconds: Option<u64>,
    #[serde(default)]
    pub retry: Vec<RetrySpec>,
    #[serde(default)]
    pub catch: Vec<CatchSpec>,

    // Opaque configuration blocks surfaced to the agent unchanged.
    pub memory: Option<Value>,
    pub context: Option<Value>,
    pub tools: Option<Value>,
    pub guardrails: Option<Value>,
    pub reasoning: Option<Value>,
    pub generation: Option<Value>,
    pub model: Option<Value>,
    pub budget: Option<Value>,
    pub streaming: Option<Value>,
    pub idempotent: Option<Value>,
    pub idempotency_key: Option<Value>,
}

impl TaskSpec {
    /// Assemble the opaque `agentConfig` payload from the state's
    /// non-execution blocks. The engine assigns no meaning to any of it.
    pub fn agent_config(&self) -> Value {
        let blocks: [(&str, &Option<Value>); 11] = [
            ("Memory", &self.memory),
            ("Context", &self.context),
            ("Tools", &self.tools),
            ("Guardrails", &self.guardrails),
            ("Reasoning", &self.reasoning),
            ("Generation", &self.generation),
            ("Model", &self.model),
            ("Budget", &self.budget),
            ("Streaming", &self.streaming),
            ("Idempotent", &self.idempotent),
            ("IdempotencyKey", &self.idempotency_key),
        ];
        let mut config = Map::new();
        for (key, block) in blocks {
            if let Some(value) = block {
                config.insert(key.to_string(), value.clone());
            }
        }
        Value::Object(config)
    }
}

/// Choice: route on the first matching rule.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ChoiceSpec {
    #[serde(default)]
    pub choices: Vec<ChoiceRule>,
    pub default: Option<String>,
    pub comment: Option<String>,
    pub input_path: Option<String>,
    pub output_path: Option<String>,
}

/// Map: iterate a sub-machine over an array with bounded concurrency.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MapSpec {
    pub items_path: Option<String>,
    pub item_selector: Option<Value>,
    pub iterator: Option<SubDefinition>,
    #[serde(default)]
    pub max_concurrency: usize,
    pub tolerated_failure_count: Option<usize>,
    pub tolerated_failure_percentage: Option<f64>,
    pub comment: Option<String>,
    pub input_path: Option<String>,
    pub result_selector: Option<Value>,
    #[serde(default, deserialize_with = "deserialize_result_path")]
    pub result_path: ResultPathField,
    pub output_path: Option<String>,
    pub next: Option<String>,
    #[serde(default)]
    pub end: bool,
    #[serde(default)]
    pub retry: Vec<RetrySpec>,
    #[serde(default)]
    pub catch: Vec<CatchSpec>,
}

/// Parallel: run branch sub-machines concurrently over the same input.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ParallelSpec {
    #[serde(default)]
    pub branches: Vec<SubDefinition>,
    pub comment: Option<String>,
    pub input_path: Option<String>,
    pub result_selector: Option<Value>,
    #[serde(default, deserialize_with = "deserialize_result_path")]
    pub result_path: ResultPathField,
    pub output_path: Option<String>,
    pub next: Option<String>,
    #[serde(default)]
    pub end: bool,
    #[serde(default)]
    pub retry: Vec<RetrySpec>,
    #[serde(default)]
    pub catch: Vec<CatchSpec>,
}

/// Pass: pure data plumbing.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PassSpec {
    pub result: Option<Value>,
    pub comment: Option<String>,
    pub input_path: Option<String>,
    pub parameters: Option<Value>,
    #[serde(default, deserialize_with = "deserialize_result_path")]
    pub result_path: ResultPathField,
    pub output_path: Option<String>,
    pub next: Option<String>,
    #[serde(default)]
    pub end: bool,
}

/// Wait: delay for a duration or until a timestamp.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WaitSpec {
    pub seconds: Option<f64>,
    pub seconds_path: Option<String>,
    pub timestamp: Option<String>,
    pub timestamp_path: Option<String>,
    pub comment: Option<String>,
    pub input_path: Option<String>,
    pub output_path: Option<String>,
    pub next: Option<String>,
    #[serde(default)]
    pub end: bool,
}

/// Succeed: terminal success.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SucceedSpec {
    pub comment: Option<String>,
    pub input_path: Option<String>,
    pub output_path: Option<String>,
}

/// Fail: terminal failure with an error code and cause.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FailSpec {
    pub error: Option<String>,
    pub cause: Option<String>,
    pub error_path: Option<String>,
    pub cause_path: Option<String>,
    pub comment: Option<String>,
}

/// `OnTimeout` policy for Approval states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum OnTimeoutPolicy {
    AutoApprove,
    AutoReject,
    Escalate,
    Fail,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EscalationSpec {
    #[serde(default)]
    pub recipients: Vec<String>,
    #[serde(default)]
    pub repeat: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EditableSpec {
    #[serde(default)]
    pub fields: Vec<String>,
}

fn default_approval_options() -> Vec<String> {
    vec!["approve".to_string(), "reject".to_string()]
}

/// Approval: suspend for an external decision.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ApprovalSpec {
    pub prompt: Option<Value>,
    #[serde(default = "default_approval_options")]
    pub options: Vec<String>,
    pub timeout_seconds: Option<u64>,
    pub escalation: Option<EscalationSpec>,
    pub editable: Option<EditableSpec>,
    pub on_timeout: Option<OnTimeoutPolicy>,
    pub choices: Option<Vec<ChoiceRule>>,
    pub default: Option<String>,
    pub comment: Option<String>,
    pub input_path: Option<String>,
    #[serde(default, deserialize_with = "deserialize_result_path")]
    pub result_path: ResultPathField,
    pub output_path: Option<String>,
    pub next: Option<String>,
    #[serde(default)]
    pub end: bool,
    #[serde(default)]
    pub catch: Vec<CatchSpec>,
}

/// Checkpoint: snapshot the execution at a durable resume point.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CheckpointSpec {
    pub name: Option<String>,
    pub checkpoint_id_path: Option<String>,
    pub data_path: Option<String>,
    #[serde(default)]
    pub compress: bool,
    #[serde(rename = "TTL")]
    pub ttl: Option<String>,
    /// When true, the runner also suspends after the snapshot so the host
    /// may persist and exit.
    #[serde(default)]
    pub suspend: bool,
    pub comment: Option<String>,
    pub next: Option<String>,
    #[serde(default)]
    pub end: bool,
}

fn default_rounds() -> u32 {
    1
}

/// Debate: invoke two or more agents over an accumulated transcript.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DebateSpec {
    #[serde(default)]
    pub participants: Vec<String>,
    #[serde(default = "default_rounds")]
    pub rounds: u32,
    pub comment: Option<String>,
    pub input_path: Option<String>,
    pub parameters: Option<Value>,
    pub result_selector: Option<Value>,
    #[serde(default, deserialize_with = "deserialize_result_path")]
    pub result_path: ResultPathField,
    pub output_path: Option<String>,
    pub next: Option<String>,
    #[serde(default)]
    pub end: bool,
    #[serde(default)]
    pub retry: Vec<RetrySpec>,
    #[serde(default)]
    pub catch: Vec<CatchSpec>,
}

/// One state record, discriminated by `Type`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "Type")]
pub enum StateSpec {
    Task(TaskSpec),
    Choice(ChoiceSpec),
    Map(MapSpec),
    Parallel(ParallelSpec),
    Pass(PassSpec),
    Wait(WaitSpec),
    Succeed(SucceedSpec),
    Fail(FailSpec),
    Approval(ApprovalSpec),
    Checkpoint(CheckpointSpec),
    Debate(DebateSpec),
}

pub(crate) const KNOWN_STATE_TYPES: &[&str] = &[
    "Task",
    "Choice",
    "Map",
    "Parallel",
    "Pass",
    "Wait",
    "Succeed",
    "Fail",
    "Approval",
    "Checkpoint",
    "Debate",
];

impl StateSpec {
    pub fn type_name(&self) -> &'static str {
        match self {
            StateSpec::Task(_) => "Task",
            StateSpec::Choice(_) => "Choice",
            StateSpec::Map(_) => "Map",
            StateSpec::Parallel(_) => "Parallel",
            StateSpec::Pass(_) => "Pass",
            StateSpec::Wait(_) => "Wait",
            StateSpec::Succeed(_) => "Succeed",
            StateSpec::Fail(_) => "Fail",
            StateSpec::Approval(_) => "Approval",
            StateSpec::Checkpoint(_) => "Checkpoint",
            StateSpec::Debate(_) => "Debate",
        }
    }

    /// The static `Next` transition, if this state kind carries one.
    pub(crate) fn next_field(&self) -> Option<&str> {
        match self {
            StateSpec::Task(s) => s.next.as_deref(),
            StateSpec::Map(s) => s.next.as_deref(),
            StateSpec::Parallel(s) => s.next.as_deref(),
            StateSpec::Pass(s) => s.next.as_deref(),
            StateSpec::Wait(s) => s.next.as_deref(),
            StateSpec::Approval(s) => s.next.as_deref(),
            StateSpec::Checkpoint(s) => s.next.as_deref(),
            StateSpec::Debate(s) => s.next.as_deref(),
            StateSpec::Choice(_) | StateSpec::Succeed(_) | StateSpec::Fail(_) => None,
        }
    }

    pub(crate) fn end_field(&self) -> bool {
        match self {
            StateSpec::Task(s) => s.end,
            StateSpec::Map(s) => s.end,
            StateSpec::Parallel(s) => s.end,
            StateSpec::Pass(s) => s.end,
            StateSpec::Wait(s) => s.end,
            StateSpec::Approval(s) => s.end,
            StateSpec::Checkpoint(s) => s.end,
            StateSpec::Debate(s) => s.end,
            StateSpec::Choice(_) | StateSpec::Succeed(_) | StateSpec::Fail(_) => false,
        }
    }

    pub(crate) fn catch_rules(&self) -> &[CatchSpec] {
        match self {
            StateSpec::Task(s) => &s.catch,
            StateSpec::Map(s) => &s.catch,
            StateSpec::Parallel(s) => &s.catch,
            StateSpec::Approval(s) => &s.catch,
            StateSpec::Debate(s) => &s.catch,
            _ => &[],
        }
    }
}

/// A loaded, not-yet-validated definition document.
#[derive(Debug, Clone)]
pub struct Definition {
    pub comment: Option<String>,
    pub version: Option<String>,
    pub start_at: String,
    states: Map<String, Value>,
}

impl Definition {
    /// Load a definition from a JSON file.
    pub fn from_file(path: impl AsRef<FilePath>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Parse a definition from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        Self::from_value(serde_json::from_str(json)?)
    }

    /// Build a definition from an already-parsed JSON value.
    pub fn from_value(value: Value) -> Result<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| EngineError::Validation("definition must be a JSON object".to_string()))?;
        let start_at = object
            .get("StartAt")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                EngineError::Validation("definition is missing required field 'StartAt'".to_string())
            })?
            .to_string();
        let states = object
            .get("States")
            .and_then(Value::as_object)
            .ok_or_else(|| {
                EngineError::Validation(
                    "definition is missing required object field 'States'".to_string(),
                )
            })?
            .clone();
        Ok(Self {
            comment: object
                .get("Comment")
                .and_then(Value::as_str)
                .map(str::to_string),
            version: object
                .get("Version")
                .and_then(Value::as_str)
                .map(str::to_string),
            start_at,
            states,
        })
    }

    /// Names of the top-level states, in document order.
    pub fn state_names(&self) -> impl Iterator<Item = &str> {
        self.states.keys().map(String::as_str)
    }

    /// Validate the definition and wire it to an agent registry, producing
    /// a runnable workflow.
    pub fn compile(&self, registry: AgentRegistry) -> Result<CompiledWorkflow> {
        let machine = StateMachine::build(self.start_at.clone(), &self.states, false)?;
        Ok(CompiledWorkflow::new(machine, registry))
    }
}

/// A validated (sub-)machine: the immutable product of the factory.
#[derive(Debug)]
pub struct StateMachine {
    start_at: String,
    states: HashMap<String, Arc<CompiledState>>,
}

/// One state wired into a machine, with any sub-machines pre-built.
#[derive(Debug)]
pub struct CompiledState {
    pub spec: StateSpec,
    /// Compiled `Iterator` sub-machine (Map states only)
    pub iterator: Option<Arc<StateMachine>>,
    /// Compiled `Branches` sub-machines (Parallel states only)
    pub branches: Vec<Arc<StateMachine>>,
}

impl StateMachine {
    pub(crate) fn build(
        start_at: String,
        raw_states: &Map<String, Value>,
        nested: bool,
    ) -> Result<Arc<Self>> {
        let mut parsed: HashMap<String, StateSpec> = HashMap::new();
        for (name, value) in raw_states {
            let object = value.as_object().ok_or_else(|| {
                EngineError::Validation(format!("state '{name}' must be a JSON object"))
            })?;
            let type_name = object
                .get("Type")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    EngineError::Validation(format!(
                        "state '{name}' is missing required field 'Type'"
                    ))
                })?;
            if !KNOWN_STATE_TYPES.contains(&type_name) {
                return Err(EngineError::Validation(format!(
                    "state '{name}' declares unknown type '{type_name}'"
                )));
            }
            let spec: StateSpec = serde_json::from_value(value.clone())
                .map_err(|e| EngineError::Validation(format!("state '{name}': {e}")))?;
            parsed.insert(name.clone(), spec);
        }

        validator::validate_machine(&start_at, &parsed, nested)?;

        let mut states = HashMap::with_capacity(parsed.len());
        for (name, spec) in parsed {
            let (iterator, branches) = match &spec {
                StateSpec::Map(map) => {
                    let sub = map.iterator.as_ref().ok_or_else(|| {
                        EngineError::Validation(format!("Map state '{name}' lacks an Iterator"))
                    })?;
                    (
                        Some(Self::build(sub.start_at.clone(), &sub.states, true)?),
                        Vec::new(),
                    )
                }
                StateSpec::Parallel(parallel) => {
                    let branches = parallel
                        .branches
                        .iter()
                        .map(|sub| Self::build(sub.start_at.clone(), &sub.states, true))
                        .collect::<Result<Vec<_>>>()?;
                    (None, branches)
                }
                _ => (None, Vec::new()),
            };
            states.insert(
                name,
                Arc::new(CompiledState {
                    spec,
                    iterator,
                    branches,
                }),
            );
        }

        Ok(Arc::new(Self { start_at, states }))
    }

    pub fn start_at(&self) -> &str {
        &self.start_at
    }

    pub(crate) fn state(&self, name: &str) -> Option<&Arc<CompiledState>> {
        self.states.get(name)
    }

    pub fn state_names(&self) -> impl Iterator<Item = &str> {
        self.states.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_minimal_definition() {
        let definition = Definition::from_json(
            r#"{
                "Comment": "smallest possible workflow",
                "Version": "1.0",
                "StartAt": "Done",
                "States": {
                    "Done": { "Type": "Succeed" }
                }
            }"#,
        )
        .unwrap();
        assert_eq!(definition.start_at, "Done");
        assert_eq!(definition.comment.as_deref(), Some("smallest possible workflow"));
        assert_eq!(definition.state_names().collect::<Vec<_>>(), vec!["Done"]);
    }

    #[test]
    fn test_preprocessing_keys_are_ignored() {
        let definition = Definition::from_value(json!({
            "StartAt": "Done",
            "Imports": ["lib.json"],
            "Module": "review",
            "Exports": {"x": 1},
            "Budget": {"tokens": 100},
            "States": {"Done": {"Type": "Succeed"}}
        }))
        .unwrap();
        assert_eq!(definition.start_at, "Done");
    }

    #[test]
    fn test_missing_start_at_rejected() {
        let err = Definition::from_value(json!({"States": {}})).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert!(err.to_string().contains("StartAt"));
    }

    #[test]
    fn test_missing_states_rejected() {
        let err = Definition::from_value(json!({"StartAt": "A"})).unwrap_err();
        assert!(err.to_string().contains("States"));
    }

    #[test]
    fn test_result_path_tri_state() {
        #[derive(Deserialize)]
        #[serde(rename_all = "PascalCase")]
        struct Probe {
            #[serde(default, deserialize_with = "deserialize_result_path")]
            result_path: ResultPathField,
        }

        let absent: Probe = serde_json::from_value(json!({})).unwrap();
        assert_eq!(absent.result_path, ResultPathField::Replace);

        let null: Probe = serde_json::from_value(json!({"ResultPath": null})).unwrap();
        assert_eq!(null.result_path, ResultPathField::Discard);

        let at: Probe = serde_json::from_value(json!({"ResultPath": "$.out"})).unwrap();
        assert_eq!(at.result_path, ResultPathField::At("$.out".to_string()));
    }

    #[test]
    fn test_retry_spec_defaults() {
        let retry: RetrySpec =
            serde_json::from_value(json!({"ErrorEquals": ["States.Timeout"]})).unwrap();
        assert_eq!(retry.interval_seconds, 1.0);
        assert_eq!(retry.max_attempts, 3);
        assert_eq!(retry.backoff_rate, 2.0);
        assert_eq!(retry.jitter_strategy, JitterStrategy::None);
        assert!(retry.matches("States.Timeout"));
        assert!(!retry.matches("States.TaskFailed"));

        let wildcard: RetrySpec =
            serde_json::from_value(json!({"ErrorEquals": ["States.ALL"]})).unwrap();
        assert!(wildcard.matches("anything"));
    }

    #[test]
    fn test_task_agent_config_assembly() {
        let task: TaskSpec = serde_json::from_value(json!({
            "Agent": "writer",
            "End": true,
            "Model": {"name": "large"},
            "Tools": ["search"],
            "Budget": {"maxTokens": 1000}
        }))
        .unwrap();
        let config = task.agent_config();
        assert_eq!(config["Model"], json!({"name": "large"}));
        assert_eq!(config["Tools"], json!(["search"]));
        assert_eq!(config["Budget"], json!({"maxTokens": 1000}));
        assert!(config.get("Memory").is_none());
    }

    #[test]
    fn test_state_spec_tagging() {
        let spec: StateSpec = serde_json::from_value(json!({
            "Type": "Wait",
            "Seconds": 5,
            "Next": "B"
        }))
        .unwrap();
        assert_eq!(spec.type_name(), "Wait");
        assert_eq!(spec.next_field(), Some("B"));
        assert!(!spec.end_field());
    }

    #[test]
    fn test_choice_rule_shape_helpers() {
        let leaf: ChoiceRule = serde_json::from_value(json!({
            "Variable": "$.score",
            "NumericGreaterThanEquals": 90,
            "Next": "High"
        }))
        .unwrap();
        assert!(!leaf.is_compound());
        assert_eq!(leaf.comparator_count(), 1);

        let compound: ChoiceRule = serde_json::from_value(json!({
            "And": [
                {"Variable": "$.a", "IsPresent": true},
                {"Variable": "$.a", "NumericLessThan": 5}
            ],
            "Next": "Both"
        }))
        .unwrap();
        assert!(compound.is_compound());
        assert_eq!(compound.comparator_count(), 0);
    }

    #[test]
    fn test_checkpoint_ttl_key_is_uppercase() {
        let spec: CheckpointSpec = serde_json::from_value(json!({
            "Name": "after-review",
            "TTL": "24h",
            "Suspend": true,
            "Next": "Publish"
        }))
        .unwrap();
        assert_eq!(spec.ttl.as_deref(), Some("24h"));
        assert!(spec.suspend);
    }
}
