//! Desired state of a scaling group.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::lb::LbDescription;

/// The launch template for new servers or stacks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ServerTemplate {
    /// Plain compute server: the JSON body passed to create-server,
    /// minus the unique name suffix added at request-build time.
    Server { args: Value },
    /// Orchestration stack: the JSON body passed to create-stack.
    Stack { args: Value },
}

impl ServerTemplate {
    /// The template arguments, whichever kind.
    pub fn args(&self) -> &Value {
        match self {
            ServerTemplate::Server { args } | ServerTemplate::Stack { args } => args,
        }
    }
}

/// What a scaling group should look like: capacity, launch template, and
/// the LB attachments every member server should have.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesiredGroupState {
    pub template: ServerTemplate,
    pub capacity: usize,
    /// LB attachments desired on every member server.
    pub desired_lbs: Vec<LbDescription>,
    /// Seconds to drain a node before removal; 0 removes immediately.
    pub draining_timeout_secs: f64,
}

impl DesiredGroupState {
    /// A group with a server template and no LB attachments.
    pub fn new(args: Value, capacity: usize) -> Self {
        DesiredGroupState {
            template: ServerTemplate::Server { args },
            capacity,
            desired_lbs: Vec::new(),
            draining_timeout_secs: 0.0,
        }
    }

    /// A group launching orchestration stacks instead of plain servers.
    pub fn stack(args: Value, capacity: usize) -> Self {
        DesiredGroupState {
            template: ServerTemplate::Stack { args },
            capacity,
            desired_lbs: Vec::new(),
            draining_timeout_secs: 0.0,
        }
    }

    pub fn with_lbs(mut self, lbs: Vec<LbDescription>) -> Self {
        self.desired_lbs = lbs;
        self
    }

    pub fn with_draining_timeout(mut self, secs: f64) -> Self {
        self.draining_timeout_secs = secs;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lb::{ClbDescription, NodeCondition, NodeType};
    use serde_json::json;

    #[test]
    fn builder_sets_fields() {
        let desired = DesiredGroupState::new(json!({"name": "web"}), 3)
            .with_draining_timeout(30.0)
            .with_lbs(vec![LbDescription::Clb(ClbDescription {
                lb_id: "23".to_string(),
                port: 80,
                weight: 1,
                condition: NodeCondition::Enabled,
                node_type: NodeType::Primary,
            })]);

        assert_eq!(desired.capacity, 3);
        assert_eq!(desired.draining_timeout_secs, 30.0);
        assert_eq!(desired.desired_lbs.len(), 1);
        assert_eq!(desired.template.args()["name"], "web");
    }

    #[test]
    fn serde_round_trip() {
        let desired = DesiredGroupState::new(json!({"flavorRef": "2"}), 2);
        let encoded = serde_json::to_string(&desired).unwrap();
        let decoded: DesiredGroupState = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, desired);
    }
}
