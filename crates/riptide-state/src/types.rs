//! Stored domain types.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use riptide_model::DesiredGroupState;

/// Lifecycle status of a scaling group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupStatus {
    /// Converged normally.
    Active,
    /// Convergence suspended by the operator; self-heal skips it.
    Paused,
    /// The last cycle failed; `error_reasons` says why.
    Error,
    /// Being torn down.
    Deleting,
}

/// One scaling group as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingGroup {
    pub tenant_id: String,
    pub group_id: String,
    pub status: GroupStatus,
    pub desired: DesiredGroupState,
    /// Human-readable reasons from the last failed cycle; cleared on
    /// success.
    pub error_reasons: Vec<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl ScalingGroup {
    pub fn new(tenant_id: &str, group_id: &str, desired: DesiredGroupState) -> Self {
        let now = epoch_secs();
        ScalingGroup {
            tenant_id: tenant_id.to_string(),
            group_id: group_id.to_string(),
            status: GroupStatus::Active,
            desired,
            error_reasons: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn table_key(&self) -> String {
        group_key(&self.tenant_id, &self.group_id)
    }
}

/// One server as recorded in a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotServer {
    pub id: String,
    /// The load balancers the server was attached to when the snapshot
    /// was taken.
    pub links: Vec<String>,
}

/// What the group's servers looked like after the last successful
/// cycle. The only durable side effect of convergence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveServersSnapshot {
    pub servers: Vec<SnapshotServer>,
    pub taken_at: u64,
}

/// Composite table key for a group.
pub fn group_key(tenant_id: &str, group_id: &str) -> String {
    format!("{tenant_id}/{group_id}")
}

/// Current time as seconds since the epoch.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
