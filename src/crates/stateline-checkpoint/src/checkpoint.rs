//! Checkpoint snapshot schema and TTL parsing

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CheckpointError, Result};

/// Token and cost accounting accumulated over an execution.
///
/// Both fields are monotonically non-decreasing for the lifetime of an
/// execution; a restored checkpoint continues counting from the snapshot
/// values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Totals {
    /// Total tokens consumed by agent invocations
    pub tokens: u64,

    /// Total cost attributed by agent invocations
    pub cost: f64,
}

impl Totals {
    /// Fold another accounting record into this one.
    pub fn add(&mut self, other: Totals) {
        self.tokens += other.tokens;
        self.cost += other.cost;
    }
}

/// A durable snapshot of one workflow execution.
///
/// `current_state` names the *next* state to run on resume; a checkpoint
/// written by a Checkpoint state records that state's successor, so the
/// checkpoint is never re-executed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Checkpoint name (the id it was stored under)
    pub name: String,

    /// Execution this snapshot belongs to
    pub execution_id: String,

    /// Name of the next state to run on resume
    pub current_state: String,

    /// The execution document at snapshot time
    pub state: Value,

    /// Serialized trace entries accumulated so far
    pub trace: Value,

    /// Accounting totals at snapshot time
    pub totals: Totals,

    /// When the snapshot was taken
    pub created_at: DateTime<Utc>,

    /// Optional time-to-live in seconds; `None` means the snapshot never
    /// expires
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl_seconds: Option<u64>,

    /// Whether the store is permitted to compress the payload
    #[serde(default)]
    pub compressed: bool,
}

impl Checkpoint {
    /// Whether this snapshot has outlived its TTL as of `now`.
    pub fn expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.ttl_seconds {
            Some(ttl) => {
                let age = now.signed_duration_since(self.created_at);
                age.num_seconds() >= 0 && age.num_seconds() as u64 >= ttl
            }
            None => false,
        }
    }
}

/// Parse a human-friendly TTL string into seconds.
///
/// Accepted forms are a non-negative integer followed by a unit suffix
/// (`s`, `m`, `h`, `d`), or the literal `never` which returns `None`.
///
/// ```
/// use stateline_checkpoint::parse_ttl;
///
/// assert_eq!(parse_ttl("30m").unwrap(), Some(1800));
/// assert_eq!(parse_ttl("24h").unwrap(), Some(86_400));
/// assert_eq!(parse_ttl("7d").unwrap(), Some(604_800));
/// assert_eq!(parse_ttl("never").unwrap(), None);
/// ```
pub fn parse_ttl(ttl: &str) -> Result<Option<u64>> {
    let ttl = ttl.trim();
    if ttl.eq_ignore_ascii_case("never") {
        return Ok(None);
    }
    let Some((unit_at, unit)) = ttl.char_indices().last() else {
        return Err(CheckpointError::InvalidTtl(ttl.to_string()));
    };
    let magnitude: u64 = ttl[..unit_at]
        .parse()
        .map_err(|_| CheckpointError::InvalidTtl(ttl.to_string()))?;
    let seconds = match unit {
        's' => magnitude,
        'm' => magnitude * 60,
        'h' => magnitude * 3_600,
        'd' => magnitude * 86_400,
        _ => return Err(CheckpointError::InvalidTtl(ttl.to_string())),
    };
    Ok(Some(seconds))
}
