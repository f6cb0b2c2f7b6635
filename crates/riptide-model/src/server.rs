//! Observed cloud servers.
//!
//! A `CloudServer` is a snapshot of one compute server as reported by the
//! upstream list-servers call, reduced to the fields convergence planning
//! needs plus the raw payload for anything else.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::lb::{ClbDescription, LbDescription, NodeCondition, NodeType, PoolDescription};

/// Metadata key tagging a server with the scaling group that owns it.
pub const GROUP_ID_METADATA_KEY: &str = "riptide:group:id";

/// Metadata key prefix for desired CLB attachments:
/// `riptide:lb:clb:{lb_id}` → JSON array of `{"port": N}`.
pub const CLB_METADATA_PREFIX: &str = "riptide:lb:clb:";

/// Metadata key prefix for desired pool attachments:
/// `riptide:lb:pool:{pool_id}` (value unused).
pub const POOL_METADATA_PREFIX: &str = "riptide:lb:pool:";

/// Metadata key marking a server as draining (set by the planner, read on
/// the next gather).
pub const DRAINING_METADATA_KEY: &str = "riptide:server:state";

/// Lifecycle state of an observed server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerState {
    Active,
    Build,
    Error,
    Draining,
    Deleted,
    /// Status string we do not recognize.
    Unknown,
    /// Carries the group tag but the group has disowned it.
    UnknownToRiptide,
}

impl ServerState {
    /// Parse an upstream status string, case-insensitively.
    ///
    /// `BUILDING` is accepted as an alias for `BUILD`; anything
    /// unrecognized maps to `Unknown` rather than failing the gather.
    pub fn from_status(status: &str) -> Self {
        match status.to_ascii_uppercase().as_str() {
            "ACTIVE" => ServerState::Active,
            "BUILD" | "BUILDING" => ServerState::Build,
            "ERROR" => ServerState::Error,
            "DRAINING" => ServerState::Draining,
            "DELETED" => ServerState::Deleted,
            _ => ServerState::Unknown,
        }
    }
}

/// One observed compute server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudServer {
    pub id: String,
    pub state: ServerState,
    /// Creation time, epoch seconds.
    pub created: u64,
    pub image_id: Option<String>,
    pub flavor_id: Option<String>,
    /// Private (service-net) address used for LB attachment.
    pub servicenet_address: Option<String>,
    /// LB attachments this server *should* have, parsed from metadata.
    pub desired_lbs: Vec<LbDescription>,
    /// The raw upstream payload.
    pub json: Value,
}

impl CloudServer {
    /// Build a `CloudServer` from one entry of a list-servers response.
    ///
    /// A task state of `deleting` forces `Deleted` regardless of the
    /// reported status. A metadata draining marker overrides `Active` and
    /// `Build` with `Draining` (the planner tagged it last cycle).
    pub fn from_payload(json: &Value) -> Option<Self> {
        let id = json.get("id")?.as_str()?.to_string();

        let status = json.get("status").and_then(Value::as_str).unwrap_or("");
        let mut state = ServerState::from_status(status);

        let task_state = json
            .get("OS-EXT-STS:task_state")
            .and_then(Value::as_str)
            .unwrap_or("");
        if task_state == "deleting" {
            state = ServerState::Deleted;
        }

        let metadata = json.get("metadata").cloned().unwrap_or(Value::Null);
        if state == ServerState::Active || state == ServerState::Build {
            let marked_draining = metadata
                .get(DRAINING_METADATA_KEY)
                .and_then(Value::as_str)
                == Some("DRAINING");
            if marked_draining {
                state = ServerState::Draining;
            }
        }

        let created = json
            .get("created")
            .and_then(Value::as_u64)
            .unwrap_or(0);

        Some(CloudServer {
            id,
            state,
            created,
            image_id: json
                .pointer("/image/id")
                .and_then(Value::as_str)
                .map(str::to_string),
            flavor_id: json
                .pointer("/flavor/id")
                .and_then(Value::as_str)
                .map(str::to_string),
            servicenet_address: servicenet_address(json),
            desired_lbs: lbs_from_metadata(&metadata),
            json: json.clone(),
        })
    }

    /// The scaling group this server is tagged with, if any.
    pub fn group_id(&self) -> Option<&str> {
        self.json
            .pointer(&format!("/metadata/{GROUP_ID_METADATA_KEY}"))
            .and_then(Value::as_str)
    }
}

/// Extract the first private (service-net) IPv4 address.
fn servicenet_address(json: &Value) -> Option<String> {
    let addrs = json.pointer("/addresses/private")?.as_array()?;
    addrs
        .iter()
        .filter(|a| a.get("version").and_then(Value::as_i64) == Some(4))
        .filter_map(|a| a.get("addr").and_then(Value::as_str))
        .map(str::to_string)
        .next()
}

/// Parse desired LB descriptions from server metadata.
///
/// Malformed entries are skipped; a server with unparseable LB metadata
/// simply converges toward no attachments for those entries.
pub fn lbs_from_metadata(metadata: &Value) -> Vec<LbDescription> {
    let Some(map) = metadata.as_object() else {
        return Vec::new();
    };
    let mut lbs = Vec::new();
    for (key, value) in map {
        if let Some(lb_id) = key.strip_prefix(CLB_METADATA_PREFIX) {
            // Value is a JSON-encoded array of {"port": N}.
            let parsed: Option<Vec<Value>> = value
                .as_str()
                .and_then(|s| serde_json::from_str(s).ok())
                .or_else(|| value.as_array().cloned());
            let Some(entries) = parsed else { continue };
            for entry in entries {
                if let Some(port) = entry.get("port").and_then(Value::as_u64) {
                    lbs.push(LbDescription::Clb(ClbDescription {
                        lb_id: lb_id.to_string(),
                        port: port as u16,
                        weight: 1,
                        condition: NodeCondition::Enabled,
                        node_type: NodeType::Primary,
                    }));
                }
            }
        } else if let Some(pool_id) = key.strip_prefix(POOL_METADATA_PREFIX) {
            lbs.push(LbDescription::Pool(PoolDescription {
                pool_id: pool_id.to_string(),
            }));
        }
    }
    lbs
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn server_payload() -> Value {
        json!({
            "id": "srv-1",
            "status": "ACTIVE",
            "created": 1000,
            "image": {"id": "img-1"},
            "flavor": {"id": "flv-1"},
            "addresses": {
                "private": [
                    {"version": 6, "addr": "fd00::1"},
                    {"version": 4, "addr": "10.0.0.5"}
                ]
            },
            "metadata": {
                "riptide:group:id": "group-1",
                "riptide:lb:clb:23": "[{\"port\": 80}]"
            }
        })
    }

    #[test]
    fn parses_basic_fields() {
        let server = CloudServer::from_payload(&server_payload()).unwrap();
        assert_eq!(server.id, "srv-1");
        assert_eq!(server.state, ServerState::Active);
        assert_eq!(server.created, 1000);
        assert_eq!(server.image_id.as_deref(), Some("img-1"));
        assert_eq!(server.flavor_id.as_deref(), Some("flv-1"));
        assert_eq!(server.servicenet_address.as_deref(), Some("10.0.0.5"));
        assert_eq!(server.group_id(), Some("group-1"));
    }

    #[test]
    fn prefers_ipv4_private_address() {
        let server = CloudServer::from_payload(&server_payload()).unwrap();
        assert_eq!(server.servicenet_address.as_deref(), Some("10.0.0.5"));
    }

    #[test]
    fn deleting_task_state_overrides_status() {
        let mut payload = server_payload();
        payload["OS-EXT-STS:task_state"] = json!("deleting");
        let server = CloudServer::from_payload(&payload).unwrap();
        assert_eq!(server.state, ServerState::Deleted);
    }

    #[test]
    fn draining_metadata_overrides_active() {
        let mut payload = server_payload();
        payload["metadata"]["riptide:server:state"] = json!("DRAINING");
        let server = CloudServer::from_payload(&payload).unwrap();
        assert_eq!(server.state, ServerState::Draining);
    }

    #[test]
    fn draining_metadata_does_not_override_error() {
        let mut payload = server_payload();
        payload["status"] = json!("ERROR");
        payload["metadata"]["riptide:server:state"] = json!("DRAINING");
        let server = CloudServer::from_payload(&payload).unwrap();
        assert_eq!(server.state, ServerState::Error);
    }

    #[test]
    fn unknown_status_maps_to_unknown() {
        let mut payload = server_payload();
        payload["status"] = json!("VERIFY_RESIZE");
        let server = CloudServer::from_payload(&payload).unwrap();
        assert_eq!(server.state, ServerState::Unknown);
    }

    #[test]
    fn status_parse_is_case_insensitive() {
        assert_eq!(ServerState::from_status("active"), ServerState::Active);
        assert_eq!(ServerState::from_status("Build"), ServerState::Build);
        assert_eq!(ServerState::from_status("BUILDING"), ServerState::Build);
    }

    #[test]
    fn desired_lbs_from_metadata() {
        let server = CloudServer::from_payload(&server_payload()).unwrap();
        assert_eq!(server.desired_lbs.len(), 1);
        match &server.desired_lbs[0] {
            LbDescription::Clb(d) => {
                assert_eq!(d.lb_id, "23");
                assert_eq!(d.port, 80);
            }
            other => panic!("unexpected description: {other:?}"),
        }
    }

    #[test]
    fn pool_metadata_parses() {
        let metadata = json!({"riptide:lb:pool:p-9": ""});
        let lbs = lbs_from_metadata(&metadata);
        assert_eq!(
            lbs,
            vec![LbDescription::Pool(PoolDescription {
                pool_id: "p-9".to_string()
            })]
        );
    }

    #[test]
    fn malformed_lb_metadata_is_skipped() {
        let metadata = json!({"riptide:lb:clb:23": "not json"});
        assert!(lbs_from_metadata(&metadata).is_empty());
    }

    #[test]
    fn missing_id_yields_none() {
        assert!(CloudServer::from_payload(&json!({"status": "ACTIVE"})).is_none());
    }
}
