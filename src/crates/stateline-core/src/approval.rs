//! Approval collaborator surface: human-in-the-loop decisions
//!
//! The engine does not own a transport for approvals. On entering an
//! Approval state it hands an [`ApprovalRequest`] to the configured
//! [`ApprovalGateway`] and suspends; the host later calls
//! `CompiledWorkflow::resume` with the token and a [`ResumePayload`]. The
//! gateway (not the engine) owns any wall-clock timer: on timeout it resumes
//! with [`ResumePayload::Timeout`] and the state's `OnTimeout` policy takes
//! over.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ExecutionError;

/// The request emitted when an Approval state suspends.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    /// Resolved prompt template shown to the approver
    pub prompt: Value,
    /// The options a decision may pick from
    pub options: Vec<String>,
    /// Seconds the gateway should wait before signalling a timeout
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    /// Who to re-notify on escalation, and how often escalation may repeat
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escalation: Option<Escalation>,
    /// Paths in the execution document the approver may edit
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub editable_fields: Vec<String>,
}

/// Escalation policy attached to an approval request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Escalation {
    #[serde(default)]
    pub recipients: Vec<String>,
    /// Maximum number of times the timeout may escalate before the state
    /// falls through to failure
    #[serde(default)]
    pub repeat: u32,
}

/// A decision delivered by the host on resume.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalDecision {
    /// The chosen option; must be one of the request's `options`
    pub option: String,
    /// Who decided
    pub approver: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    /// Path-to-value edits applied to the execution document before routing
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub edited_fields: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

/// What the host delivers when resuming a suspended approval.
#[derive(Debug, Clone)]
pub enum ResumePayload {
    /// A decision was made
    Decision(ApprovalDecision),
    /// The gateway's timer expired without a decision
    Timeout,
}

/// Transport for approval requests, implemented by the host.
#[async_trait]
pub trait ApprovalGateway: Send + Sync {
    /// Deliver a request to whoever decides, returning the resume token the
    /// host will later present to `CompiledWorkflow::resume`.
    async fn emit(&self, request: ApprovalRequest) -> Result<String, ExecutionError>;

    /// Drop a pending request whose execution no longer waits on it.
    async fn cancel(&self, token: &str);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_serializes_with_camel_case_keys() {
        let request = ApprovalRequest {
            prompt: json!({"text": "ship it?"}),
            options: vec!["approve".to_string(), "reject".to_string()],
            timeout_seconds: Some(3600),
            escalation: Some(Escalation {
                recipients: vec!["oncall@example.com".to_string()],
                repeat: 2,
            }),
            editable_fields: vec!["$.draft.title".to_string()],
        };
        let encoded = serde_json::to_value(&request).unwrap();
        assert_eq!(encoded["timeoutSeconds"], json!(3600));
        assert_eq!(encoded["editableFields"], json!(["$.draft.title"]));
        assert_eq!(encoded["escalation"]["repeat"], json!(2));
    }

    #[test]
    fn test_decision_round_trips() {
        let decision: ApprovalDecision = serde_json::from_value(json!({
            "option": "approve",
            "approver": "u@x",
            "editedFields": {"$.draft.title": "New"},
            "timestamp": "2026-03-01T12:00:00Z"
        }))
        .unwrap();
        assert_eq!(decision.option, "approve");
        assert_eq!(decision.edited_fields["$.draft.title"], json!("New"));
        assert!(decision.comment.is_none());
    }
}
