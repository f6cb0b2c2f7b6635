//! Observed-state collection for one scaling group.
//!
//! One gather produces everything the planner needs for one cycle:
//! the group's tagged servers, the node lists of every load balancer the
//! group cares about, and (for stack groups) the group's stacks. The
//! load-balancer fetches run concurrently and are awaited together; a
//! failure of any required fetch aborts the whole gather, which in turn
//! aborts the convergence cycle.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use riptide_model::group::{DesiredGroupState, ServerTemplate};
use riptide_model::lb::{
    ClbDescription, ClbNode, LbDescription, LbNode, NodeCondition, NodeType, PoolNode,
};
use riptide_model::server::{CloudServer, ServerState};
use riptide_model::stack::Stack;
use riptide_plan::{Request, Service};

use crate::client::{CloudClient, retry_with_backoff};
use crate::error::{ClientError, GatherError, GatherResult};

const GATHER_ATTEMPTS: u32 = 5;
const GATHER_BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Everything observed about one group in one gather.
#[derive(Debug, Clone, Default)]
pub struct ObservedGroup {
    pub servers: Vec<CloudServer>,
    pub lb_nodes: Vec<LbNode>,
    pub stacks: Vec<Stack>,
}

/// Collects observed state through a `CloudClient`.
#[derive(Clone)]
pub struct Gatherer {
    client: Arc<dyn CloudClient>,
    attempts: u32,
    backoff_base: Duration,
}

impl Gatherer {
    pub fn new(client: Arc<dyn CloudClient>) -> Self {
        Gatherer {
            client,
            attempts: GATHER_ATTEMPTS,
            backoff_base: GATHER_BACKOFF_BASE,
        }
    }

    /// Override the retry budget, mainly to keep tests fast.
    pub fn with_retry(mut self, attempts: u32, backoff_base: Duration) -> Self {
        self.attempts = attempts;
        self.backoff_base = backoff_base;
        self
    }

    /// Gather the full observed state for one group.
    ///
    /// Servers and stacks are fetched first (concurrently); the set of
    /// load balancers to inspect is the union of the group's desired LBs
    /// and the LBs recorded on each server's metadata, so detachments
    /// from no-longer-desired LBs still get planned.
    pub async fn gather_group_state(
        &self,
        group_id: &str,
        desired: &DesiredGroupState,
    ) -> GatherResult<ObservedGroup> {
        let (servers, stacks) = tokio::join!(
            self.gather_servers(group_id),
            self.gather_stacks(group_id, desired),
        );
        let servers = servers?;
        let stacks = stacks?;

        let mut clb_ids: BTreeSet<String> = BTreeSet::new();
        let mut pool_ids: BTreeSet<String> = BTreeSet::new();
        let all_descriptions = desired
            .desired_lbs
            .iter()
            .chain(servers.iter().flat_map(|s| s.desired_lbs.iter()));
        for description in all_descriptions {
            match description {
                LbDescription::Clb(d) => {
                    clb_ids.insert(d.lb_id.clone());
                }
                LbDescription::Pool(d) => {
                    pool_ids.insert(d.pool_id.clone());
                }
            }
        }

        let mut fetches: JoinSet<GatherResult<Vec<LbNode>>> = JoinSet::new();
        for lb_id in clb_ids {
            let gatherer = self.clone();
            fetches.spawn(async move { gatherer.gather_clb_nodes(&lb_id).await });
        }
        for pool_id in pool_ids {
            let gatherer = self.clone();
            fetches.spawn(async move { gatherer.gather_pool_nodes(&pool_id).await });
        }

        let mut lb_nodes = Vec::new();
        let mut failure: Option<GatherError> = None;
        while let Some(joined) = fetches.join_next().await {
            match joined {
                Ok(Ok(nodes)) => lb_nodes.extend(nodes),
                Ok(Err(e)) => failure = Some(failure.take().unwrap_or(e)),
                Err(e) => {
                    failure =
                        Some(failure.take().unwrap_or(GatherError::Payload(e.to_string())));
                }
            }
        }
        if let Some(e) = failure {
            return Err(e);
        }

        debug!(
            group = group_id,
            servers = servers.len(),
            lb_nodes = lb_nodes.len(),
            stacks = stacks.len(),
            "gathered group state"
        );
        Ok(ObservedGroup {
            servers,
            lb_nodes,
            stacks,
        })
    }

    /// All non-deleted servers carrying this group's tag.
    async fn gather_servers(&self, group_id: &str) -> GatherResult<Vec<CloudServer>> {
        let body = self
            .fetch(Request {
                service: Service::Compute,
                method: "GET".to_string(),
                path: "servers/detail".to_string(),
                body: None,
            })
            .await?;
        let entries = body
            .get("servers")
            .and_then(Value::as_array)
            .ok_or_else(|| GatherError::Payload("server listing has no servers array".into()))?;

        let mut servers = Vec::new();
        for entry in entries {
            let Some(server) = CloudServer::from_payload(entry) else {
                warn!("skipping malformed server payload");
                continue;
            };
            if server.group_id() == Some(group_id) && server.state != ServerState::Deleted {
                servers.push(server);
            }
        }
        Ok(servers)
    }

    /// Nodes of one CLB, with `drained_at` resolved from the node event
    /// feed for nodes observed in `Draining` condition. A feed failure
    /// leaves `drained_at` unknown rather than failing the gather; a 404
    /// on the node listing means the LB is gone and reads as empty.
    async fn gather_clb_nodes(&self, lb_id: &str) -> GatherResult<Vec<LbNode>> {
        let request = Request {
            service: Service::Clb,
            method: "GET".to_string(),
            path: format!("loadbalancers/{lb_id}/nodes"),
            body: None,
        };
        let response = retry_with_backoff(self.attempts, self.backoff_base, || {
            self.client.execute(&request)
        })
        .await
        .map_err(GatherError::Upstream)?;
        if response.status == 404 || response.status == 410 {
            warn!(lb = lb_id, "load balancer gone, treating as empty");
            return Ok(Vec::new());
        }
        let body = require_success(response)?;

        let entries = body
            .get("nodes")
            .and_then(Value::as_array)
            .ok_or_else(|| GatherError::Payload(format!("CLB {lb_id} listing has no nodes")))?;

        let mut nodes = Vec::new();
        for entry in entries {
            let node = parse_clb_node(lb_id, entry)?;
            nodes.push(node);
        }

        for node in &mut nodes {
            if node.description.condition == NodeCondition::Draining {
                node.drained_at = self.resolve_drained_at(lb_id, &node.node_id).await;
            }
        }

        Ok(nodes.into_iter().map(LbNode::Clb).collect())
    }

    /// When a draining node entered its draining condition, from the
    /// node's event feed. `None` when the feed is unavailable or has no
    /// draining entry.
    async fn resolve_drained_at(&self, lb_id: &str, node_id: &str) -> Option<f64> {
        let request = Request {
            service: Service::Clb,
            method: "GET".to_string(),
            path: format!("loadbalancers/{lb_id}/nodes/{node_id}/events"),
            body: None,
        };
        let response = retry_with_backoff(self.attempts, self.backoff_base, || {
            self.client.execute(&request)
        })
        .await;
        let response = match response {
            Ok(r) if (200..300).contains(&r.status) => r,
            Ok(r) => {
                warn!(lb = lb_id, node = node_id, status = r.status, "node feed unavailable");
                return None;
            }
            Err(e) => {
                warn!(lb = lb_id, node = node_id, error = %e, "node feed fetch failed");
                return None;
            }
        };

        let events = response.body.get("events").and_then(Value::as_array)?;
        events.iter().find_map(|event| {
            let detail = event.get("detail").and_then(Value::as_str)?;
            if detail.contains("DRAINING") {
                event.get("timestamp").and_then(Value::as_f64)
            } else {
                None
            }
        })
    }

    async fn gather_pool_nodes(&self, pool_id: &str) -> GatherResult<Vec<LbNode>> {
        let request = Request {
            service: Service::Pool,
            method: "GET".to_string(),
            path: format!("load_balancer_pools/{pool_id}/nodes"),
            body: None,
        };
        let response = retry_with_backoff(self.attempts, self.backoff_base, || {
            self.client.execute(&request)
        })
        .await
        .map_err(GatherError::Upstream)?;
        if response.status == 404 {
            warn!(pool = pool_id, "pool gone, treating as empty");
            return Ok(Vec::new());
        }
        let body = require_success(response)?;

        let entries = body
            .get("nodes")
            .and_then(Value::as_array)
            .ok_or_else(|| GatherError::Payload(format!("pool {pool_id} listing has no nodes")))?;

        let mut nodes = Vec::new();
        for entry in entries {
            let node_id = string_field(entry, "id")
                .ok_or_else(|| GatherError::Payload(format!("pool {pool_id} node has no id")))?;
            let server_id = entry
                .get("cloud_server")
                .and_then(|s| string_field(s, "id"))
                .ok_or_else(|| {
                    GatherError::Payload(format!("pool {pool_id} node has no cloud server"))
                })?;
            nodes.push(LbNode::Pool(PoolNode {
                node_id,
                pool_id: pool_id.to_string(),
                server_id,
            }));
        }
        Ok(nodes)
    }

    /// Stacks tagged with this group's id; empty for server-template groups.
    async fn gather_stacks(
        &self,
        group_id: &str,
        desired: &DesiredGroupState,
    ) -> GatherResult<Vec<Stack>> {
        if !matches!(desired.template, ServerTemplate::Stack { .. }) {
            return Ok(Vec::new());
        }
        let body = self
            .fetch(Request {
                service: Service::Orchestration,
                method: "GET".to_string(),
                path: format!("stacks?tags={group_id}"),
                body: None,
            })
            .await?;
        let entries = body
            .get("stacks")
            .and_then(Value::as_array)
            .ok_or_else(|| GatherError::Payload("stack listing has no stacks array".into()))?;

        let mut stacks = Vec::new();
        for entry in entries {
            let Some(stack) = Stack::from_payload(entry) else {
                warn!("skipping malformed stack payload");
                continue;
            };
            stacks.push(stack);
        }
        Ok(stacks)
    }

    /// Execute with retry and demand a 2xx, returning the parsed body.
    async fn fetch(&self, request: Request) -> GatherResult<Value> {
        let response = retry_with_backoff(self.attempts, self.backoff_base, || {
            self.client.execute(&request)
        })
        .await
        .map_err(GatherError::Upstream)?;
        require_success(response)
    }
}

fn require_success(response: riptide_plan::Response) -> GatherResult<Value> {
    if (200..300).contains(&response.status) {
        Ok(response.body)
    } else {
        Err(GatherError::Upstream(ClientError::Status {
            status: response.status,
            message: response.body.to_string(),
        }))
    }
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn parse_clb_node(lb_id: &str, entry: &Value) -> GatherResult<ClbNode> {
    let node_id = string_field(entry, "id")
        .ok_or_else(|| GatherError::Payload(format!("CLB {lb_id} node has no id")))?;
    let address = string_field(entry, "address")
        .ok_or_else(|| GatherError::Payload(format!("CLB {lb_id} node has no address")))?;
    let port = entry
        .get("port")
        .and_then(Value::as_u64)
        .ok_or_else(|| GatherError::Payload(format!("CLB {lb_id} node has no port")))?
        as u16;
    let condition: NodeCondition = entry
        .get("condition")
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or(NodeCondition::Enabled);
    let node_type: NodeType = entry
        .get("type")
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or(NodeType::Primary);
    let weight = entry.get("weight").and_then(Value::as_u64).unwrap_or(1) as u32;

    Ok(ClbNode {
        node_id,
        address,
        description: ClbDescription {
            lb_id: lb_id.to_string(),
            port,
            weight,
            condition,
            node_type,
        },
        drained_at: None,
        connections: entry.get("numConnections").and_then(Value::as_u64),
    })
}
