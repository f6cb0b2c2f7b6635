//! Load-balancer descriptions and observed nodes.
//!
//! A *description* says how a server should be attached to a load
//! balancer; a *node* is an attachment actually observed upstream. Two
//! descriptions are equivalent iff their definitional fields match —
//! weight, condition, and node type are attributes updated in place and
//! never participate in identity.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Condition of a CLB node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeCondition {
    /// Serving traffic.
    Enabled,
    /// Finishing existing connections, accepting no new ones.
    Draining,
    /// Out of rotation.
    Disabled,
}

/// Role of a CLB node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeType {
    Primary,
    Secondary,
}

/// How a server should be attached to one CLB.
///
/// `lb_id` and `port` are definitional; the rest are attributes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClbDescription {
    pub lb_id: String,
    pub port: u16,
    pub weight: u32,
    pub condition: NodeCondition,
    pub node_type: NodeType,
}

/// How a server should be attached to one pool-based load balancer.
/// The pool id is the entire definition; pools have no port concept.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PoolDescription {
    pub pool_id: String,
}

/// A desired load-balancer attachment, either kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LbDescription {
    Clb(ClbDescription),
    Pool(PoolDescription),
}

impl LbDescription {
    /// The id of the load balancer this description targets.
    pub fn lb_id(&self) -> &str {
        match self {
            LbDescription::Clb(d) => &d.lb_id,
            LbDescription::Pool(d) => &d.pool_id,
        }
    }

    /// Definitional equality: same LB (and port, for CLB), ignoring
    /// weight / condition / node type.
    pub fn equivalent(&self, other: &LbDescription) -> bool {
        match (self, other) {
            (LbDescription::Clb(a), LbDescription::Clb(b)) => {
                a.lb_id == b.lb_id && a.port == b.port
            }
            (LbDescription::Pool(a), LbDescription::Pool(b)) => a.pool_id == b.pool_id,
            _ => false,
        }
    }
}

/// Asked for a CLB node's drain start time before it is known.
///
/// The timestamp comes from the node's event feed and is only resolved
/// for nodes observed in `Draining` condition; callers must be prepared
/// for it to be unavailable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("draining info unavailable for node {node_id} on load balancer {lb_id}")]
pub struct DrainingUnavailable {
    pub lb_id: String,
    pub node_id: String,
}

/// An observed CLB attachment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClbNode {
    pub node_id: String,
    /// Server address the node points at.
    pub address: String,
    /// The description currently in effect upstream.
    pub description: ClbDescription,
    /// When the node entered `Draining`, epoch seconds. Resolved lazily
    /// from the node event feed; `None` until known.
    pub drained_at: Option<f64>,
    /// Active connection count, when the upstream reports it.
    pub connections: Option<u64>,
}

impl ClbNode {
    /// The drain start time, or an error if it has not been resolved.
    pub fn drained_at(&self) -> Result<f64, DrainingUnavailable> {
        self.drained_at.ok_or_else(|| DrainingUnavailable {
            lb_id: self.description.lb_id.clone(),
            node_id: self.node_id.clone(),
        })
    }

    /// Whether this node can be removed right now under the draining
    /// policy: the drain window has elapsed, or connections are known to
    /// be zero.
    pub fn done_draining(&self, now: f64, timeout: f64) -> bool {
        if self.connections == Some(0) {
            return true;
        }
        match self.drained_at {
            Some(t) => now - t >= timeout,
            None => false,
        }
    }
}

/// An observed pool membership.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolNode {
    pub node_id: String,
    pub pool_id: String,
    pub server_id: String,
}

/// Any observed load-balancer attachment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LbNode {
    Clb(ClbNode),
    Pool(PoolNode),
}

impl LbNode {
    /// The id of the load balancer this node belongs to.
    pub fn lb_id(&self) -> &str {
        match self {
            LbNode::Clb(n) => &n.description.lb_id,
            LbNode::Pool(n) => &n.pool_id,
        }
    }

    /// Whether this node currently attaches the given server, matched by
    /// service-net address for CLB and by server id for pools.
    pub fn attaches(&self, server_id: &str, address: Option<&str>) -> bool {
        match self {
            LbNode::Clb(n) => Some(n.address.as_str()) == address,
            LbNode::Pool(n) => n.server_id == server_id,
        }
    }

    /// The description in effect for this node.
    pub fn description(&self) -> LbDescription {
        match self {
            LbNode::Clb(n) => LbDescription::Clb(n.description.clone()),
            LbNode::Pool(n) => LbDescription::Pool(PoolDescription {
                pool_id: n.pool_id.clone(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clb_desc(lb_id: &str, port: u16) -> ClbDescription {
        ClbDescription {
            lb_id: lb_id.to_string(),
            port,
            weight: 1,
            condition: NodeCondition::Enabled,
            node_type: NodeType::Primary,
        }
    }

    #[test]
    fn equivalence_ignores_attributes() {
        let a = LbDescription::Clb(clb_desc("5", 80));
        let b = LbDescription::Clb(ClbDescription {
            weight: 10,
            condition: NodeCondition::Draining,
            ..clb_desc("5", 80)
        });
        assert!(a.equivalent(&b));
        assert_ne!(a, b);
    }

    #[test]
    fn equivalence_requires_same_port() {
        let a = LbDescription::Clb(clb_desc("5", 80));
        let b = LbDescription::Clb(clb_desc("5", 8080));
        assert!(!a.equivalent(&b));
    }

    #[test]
    fn clb_and_pool_never_equivalent() {
        let a = LbDescription::Clb(clb_desc("5", 80));
        let b = LbDescription::Pool(PoolDescription {
            pool_id: "5".to_string(),
        });
        assert!(!a.equivalent(&b));
    }

    #[test]
    fn drained_at_unavailable_is_an_error() {
        let node = ClbNode {
            node_id: "n-1".to_string(),
            address: "10.0.0.1".to_string(),
            description: clb_desc("5", 80),
            drained_at: None,
            connections: None,
        };
        let err = node.drained_at().unwrap_err();
        assert_eq!(err.lb_id, "5");
        assert_eq!(err.node_id, "n-1");
    }

    #[test]
    fn done_draining_on_elapsed_timeout() {
        let node = ClbNode {
            node_id: "n-1".to_string(),
            address: "10.0.0.1".to_string(),
            description: clb_desc("5", 80),
            drained_at: Some(100.0),
            connections: Some(3),
        };
        assert!(node.done_draining(130.0, 30.0));
        assert!(!node.done_draining(120.0, 30.0));
    }

    #[test]
    fn done_draining_on_zero_connections() {
        let node = ClbNode {
            node_id: "n-1".to_string(),
            address: "10.0.0.1".to_string(),
            description: clb_desc("5", 80),
            drained_at: None,
            connections: Some(0),
        };
        // Zero connections wins even with drain time unknown.
        assert!(node.done_draining(0.0, 3600.0));
    }

    #[test]
    fn unknown_drain_time_and_connections_keeps_node() {
        let node = ClbNode {
            node_id: "n-1".to_string(),
            address: "10.0.0.1".to_string(),
            description: clb_desc("5", 80),
            drained_at: None,
            connections: None,
        };
        assert!(!node.done_draining(1e9, 0.0));
    }

    #[test]
    fn pool_node_attaches_by_server_id() {
        let node = LbNode::Pool(PoolNode {
            node_id: "m-1".to_string(),
            pool_id: "p-1".to_string(),
            server_id: "srv-1".to_string(),
        });
        assert!(node.attaches("srv-1", None));
        assert!(!node.attaches("srv-2", None));
    }

    #[test]
    fn clb_node_attaches_by_address() {
        let node = LbNode::Clb(ClbNode {
            node_id: "n-1".to_string(),
            address: "10.0.0.1".to_string(),
            description: clb_desc("5", 80),
            drained_at: None,
            connections: None,
        });
        assert!(node.attaches("srv-1", Some("10.0.0.1")));
        assert!(!node.attaches("srv-1", Some("10.0.0.2")));
        assert!(!node.attaches("srv-1", None));
    }
}
