//! Observed orchestration stacks, for groups launching stacks instead of
//! plain servers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Health classification of a stack, derived from its status string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StackHealth {
    /// A `*_COMPLETE` status other than `DELETE_COMPLETE`.
    Healthy,
    /// A `*_IN_PROGRESS` status; converge again later.
    InProgress,
    /// `CHECK_FAILED`: the stack exists but its last check found it
    /// unsound; repairable by re-applying the template.
    Suspect,
    /// Any other `*_FAILED` or deleted status; the stack must be
    /// replaced.
    Unhealthy,
}

/// One observed orchestration stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stack {
    pub id: String,
    pub name: String,
    /// Raw upstream status, e.g. `CREATE_COMPLETE`.
    pub status: String,
    pub created: u64,
}

impl Stack {
    /// Build a `Stack` from one entry of a list-stacks response.
    pub fn from_payload(json: &Value) -> Option<Self> {
        Some(Stack {
            id: json.get("id")?.as_str()?.to_string(),
            name: json
                .get("stack_name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            status: json
                .get("stack_status")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            created: json.get("created").and_then(Value::as_u64).unwrap_or(0),
        })
    }

    pub fn health(&self) -> StackHealth {
        if self.status.ends_with("_IN_PROGRESS") {
            StackHealth::InProgress
        } else if self.status.ends_with("_COMPLETE") && self.status != "DELETE_COMPLETE" {
            StackHealth::Healthy
        } else if self.status == "CHECK_FAILED" {
            StackHealth::Suspect
        } else {
            StackHealth::Unhealthy
        }
    }
}
