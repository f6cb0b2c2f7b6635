//! The step protocol.
//!
//! A `Step` is one idempotent unit of upstream work. Each variant can
//! describe itself as a plain `Request` and interpret the upstream
//! outcome into a `(StepResult, reasons, continuation)` triple. Steps
//! never perform I/O and never retry internally — retry is cycle-granular
//! and belongs to the convergence loop.
//!
//! Mutating calls whose effect is only observable on the next gather
//! (create / delete / LB membership changes) report `Retry` on their own
//! success path: "done" is defined by the next observation matching
//! desired state, not by the call succeeding.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use riptide_model::lb::{ClbDescription, NodeCondition, NodeType};
use riptide_model::result::{ErrorReason, StepResult};
use riptide_model::server::DRAINING_METADATA_KEY;

/// Which upstream service a request goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Service {
    Compute,
    Clb,
    Pool,
    Orchestration,
}

/// A plain-data description of one upstream HTTP call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub service: Service,
    pub method: String,
    pub path: String,
    pub body: Option<Value>,
}

/// An upstream HTTP response, reduced to what interpretation needs.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    pub body: Value,
}

/// What actually came back from executing a request.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamOutcome {
    Response(Response),
    /// The call never produced an HTTP response (connect failure, etc.).
    Transport(String),
}

/// The interpreted result of one step execution.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    pub result: StepResult,
    pub reasons: Vec<ErrorReason>,
    /// A fresh step to run next cycle covering the still-unsatisfied part
    /// of this one (bulk pool recovery).
    pub continuation: Option<Step>,
}

impl StepOutcome {
    fn new(result: StepResult) -> Self {
        StepOutcome {
            result,
            reasons: Vec::new(),
            continuation: None,
        }
    }

    fn with_reason(mut self, reason: ErrorReason) -> Self {
        self.reasons.push(reason);
        self
    }
}

/// One server-to-pool link for the bulk pool calls.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PoolPair {
    pub pool_id: String,
    pub server_id: String,
}

/// One idempotent unit of upstream work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum Step {
    CreateServer {
        /// Launch template body; a unique name suffix is appended at
        /// request-build time, never at planning time.
        template: Value,
    },
    DeleteServer {
        server_id: String,
    },
    SetMetadataItem {
        server_id: String,
        key: String,
        value: String,
    },
    AddNodesToClb {
        lb_id: String,
        /// `(address, description)` pairs; multiple ports per address are
        /// distinct nodes.
        nodes: Vec<(String, ClbDescription)>,
    },
    RemoveNodesFromClb {
        lb_id: String,
        node_ids: Vec<String>,
    },
    ChangeClbNode {
        lb_id: String,
        node_id: String,
        condition: NodeCondition,
        weight: u32,
        node_type: NodeType,
    },
    BulkAddToPools {
        pairs: Vec<PoolPair>,
    },
    BulkRemoveFromPools {
        pairs: Vec<PoolPair>,
    },
    CreateStack {
        template: Value,
    },
    CheckStack {
        stack_name: String,
        stack_id: String,
    },
    UpdateStack {
        stack_name: String,
        stack_id: String,
        template: Value,
    },
    DeleteStack {
        stack_name: String,
        stack_id: String,
    },
    /// No upstream work; force another cycle.
    ConvergeLater {
        reasons: Vec<ErrorReason>,
    },
    /// No upstream work; abort this group's convergence permanently.
    FailConvergence {
        reasons: Vec<ErrorReason>,
    },
}

impl Step {
    /// Mark a server as draining via its metadata.
    pub fn set_draining(server_id: &str) -> Step {
        Step::SetMetadataItem {
            server_id: server_id.to_string(),
            key: DRAINING_METADATA_KEY.to_string(),
            value: "DRAINING".to_string(),
        }
    }

    /// Describe the upstream call for this step, or `None` for the two
    /// synthetic steps that do no upstream work.
    pub fn to_request(&self) -> Option<Request> {
        match self {
            Step::CreateServer { template } => {
                let mut body = template.clone();
                if let Some(name) = body.pointer("/server/name").and_then(Value::as_str) {
                    let suffixed = format!("{name}-{}", unique_token());
                    body["server"]["name"] = json!(suffixed);
                }
                Some(Request {
                    service: Service::Compute,
                    method: "POST".to_string(),
                    path: "servers".to_string(),
                    body: Some(body),
                })
            }
            Step::DeleteServer { server_id } => Some(Request {
                service: Service::Compute,
                method: "DELETE".to_string(),
                path: format!("servers/{server_id}"),
                body: None,
            }),
            Step::SetMetadataItem {
                server_id,
                key,
                value,
            } => Some(Request {
                service: Service::Compute,
                method: "PUT".to_string(),
                path: format!("servers/{server_id}/metadata/{key}"),
                body: Some(json!({"meta": {key: value}})),
            }),
            Step::AddNodesToClb { lb_id, nodes } => {
                let nodes_body: Vec<Value> = nodes
                    .iter()
                    .map(|(address, d)| {
                        json!({
                            "address": address,
                            "port": d.port,
                            "condition": d.condition,
                            "weight": d.weight,
                            "type": d.node_type,
                        })
                    })
                    .collect();
                Some(Request {
                    service: Service::Clb,
                    method: "POST".to_string(),
                    path: format!("loadbalancers/{lb_id}/nodes"),
                    body: Some(json!({"nodes": nodes_body})),
                })
            }
            Step::RemoveNodesFromClb { lb_id, node_ids } => Some(Request {
                service: Service::Clb,
                method: "DELETE".to_string(),
                path: format!(
                    "loadbalancers/{lb_id}/nodes?{}",
                    node_ids
                        .iter()
                        .map(|n| format!("id={n}"))
                        .collect::<Vec<_>>()
                        .join("&")
                ),
                body: None,
            }),
            Step::ChangeClbNode {
                lb_id,
                node_id,
                condition,
                weight,
                node_type,
            } => Some(Request {
                service: Service::Clb,
                method: "PUT".to_string(),
                path: format!("loadbalancers/{lb_id}/nodes/{node_id}"),
                body: Some(json!({
                    "node": {
                        "condition": condition,
                        "weight": weight,
                        "type": node_type,
                    }
                })),
            }),
            Step::BulkAddToPools { pairs } => Some(bulk_pool_request("POST", pairs)),
            Step::BulkRemoveFromPools { pairs } => Some(bulk_pool_request("DELETE", pairs)),
            Step::CreateStack { template } => Some(Request {
                service: Service::Orchestration,
                method: "POST".to_string(),
                path: "stacks".to_string(),
                body: Some(template.clone()),
            }),
            Step::CheckStack {
                stack_name,
                stack_id,
            } => Some(Request {
                service: Service::Orchestration,
                method: "POST".to_string(),
                path: format!("stacks/{stack_name}/{stack_id}/actions"),
                body: Some(json!({"check": null})),
            }),
            Step::UpdateStack {
                stack_name,
                stack_id,
                template,
            } => Some(Request {
                service: Service::Orchestration,
                method: "PUT".to_string(),
                path: format!("stacks/{stack_name}/{stack_id}"),
                body: Some(template.clone()),
            }),
            Step::DeleteStack {
                stack_name,
                stack_id,
            } => Some(Request {
                service: Service::Orchestration,
                method: "DELETE".to_string(),
                path: format!("stacks/{stack_name}/{stack_id}"),
                body: None,
            }),
            Step::ConvergeLater { .. } | Step::FailConvergence { .. } => None,
        }
    }

    /// Interpret a synthetic step without an upstream outcome, or `None`
    /// if this step actually calls upstream.
    pub fn synthetic_outcome(&self) -> Option<StepOutcome> {
        match self {
            Step::ConvergeLater { reasons } => Some(StepOutcome {
                result: StepResult::Retry,
                reasons: reasons.clone(),
                continuation: None,
            }),
            Step::FailConvergence { reasons } => Some(StepOutcome {
                result: StepResult::Failure,
                reasons: reasons.clone(),
                continuation: None,
            }),
            _ => None,
        }
    }

    /// Map the upstream outcome of this step's request to the uniform
    /// result contract.
    pub fn interpret(&self, outcome: &UpstreamOutcome) -> StepOutcome {
        let response = match outcome {
            UpstreamOutcome::Response(r) => r,
            // No response at all: conservative retry, reason retained.
            UpstreamOutcome::Transport(message) => {
                return StepOutcome::new(StepResult::Retry).with_reason(ErrorReason::exception(
                    "TransportError",
                    message.clone(),
                ));
            }
        };

        match self {
            Step::CreateServer { .. } => interpret_create_server(response),
            Step::DeleteServer { .. } => interpret_delete(response, "waiting for server deletion"),
            Step::SetMetadataItem { .. } => interpret_metadata(response),
            Step::AddNodesToClb { .. } => interpret_clb_mutation(response, false),
            Step::RemoveNodesFromClb { .. } => interpret_clb_mutation(response, true),
            Step::ChangeClbNode { .. } => interpret_clb_mutation(response, false),
            Step::BulkAddToPools { pairs } => interpret_bulk_pool(response, pairs, true),
            Step::BulkRemoveFromPools { pairs } => interpret_bulk_pool(response, pairs, false),
            Step::CreateStack { .. } => interpret_create_stack(response),
            Step::CheckStack { .. } | Step::UpdateStack { .. } => {
                interpret_stack_mutation(response)
            }
            Step::DeleteStack { .. } => interpret_delete(response, "waiting for stack deletion"),
            Step::ConvergeLater { .. } | Step::FailConvergence { .. } => self
                .synthetic_outcome()
                .unwrap_or_else(|| StepOutcome::new(StepResult::Retry)),
        }
    }
}

fn bulk_pool_request(method: &str, pairs: &[PoolPair]) -> Request {
    let body: Vec<Value> = pairs
        .iter()
        .map(|p| {
            json!({
                "load_balancer_pool": {"id": p.pool_id},
                "cloud_server": {"id": p.server_id},
            })
        })
        .collect();
    Request {
        service: Service::Pool,
        method: method.to_string(),
        path: "load_balancer_pools/nodes".to_string(),
        body: Some(Value::Array(body)),
    }
}

/// A successful mutating call still classifies as `Retry`: the effect is
/// only observable on the next gather.
fn regather_retry(why: &str) -> StepOutcome {
    StepOutcome::new(StepResult::Retry).with_reason(ErrorReason::string(why))
}

fn upstream_exception(response: &Response, kind: &str) -> ErrorReason {
    let message = response
        .body
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("status {}", response.status));
    ErrorReason::exception(kind, message)
}

fn interpret_create_server(response: &Response) -> StepOutcome {
    match response.status {
        200..=299 => regather_retry("waiting for server to become active"),
        403 => StepOutcome::new(StepResult::Failure)
            .with_reason(upstream_exception(response, "CreateServerOverQuoteError")),
        400..=499 => StepOutcome::new(StepResult::Failure).with_reason(upstream_exception(
            response,
            "CreateServerConfigurationError",
        )),
        _ => StepOutcome::new(StepResult::Retry)
            .with_reason(upstream_exception(response, "UpstreamError")),
    }
}

fn interpret_delete(response: &Response, why: &str) -> StepOutcome {
    match response.status {
        // Already gone counts the same as accepted: re-gather confirms.
        200..=299 | 404 | 410 => regather_retry(why),
        400..=499 => StepOutcome::new(StepResult::Failure)
            .with_reason(upstream_exception(response, "UpstreamBadRequest")),
        _ => StepOutcome::new(StepResult::Retry)
            .with_reason(upstream_exception(response, "UpstreamError")),
    }
}

fn interpret_metadata(response: &Response) -> StepOutcome {
    match response.status {
        // Metadata writes are fully confirmed synchronously.
        200..=299 => StepOutcome::new(StepResult::Success),
        // The server vanished between planning and execution; the next
        // gather sorts it out.
        404 => regather_retry("server gone before metadata write"),
        400..=499 => StepOutcome::new(StepResult::Failure)
            .with_reason(upstream_exception(response, "UpstreamBadRequest")),
        _ => StepOutcome::new(StepResult::Retry)
            .with_reason(upstream_exception(response, "UpstreamError")),
    }
}

/// Shared classification for CLB add / remove / change.
fn interpret_clb_mutation(response: &Response, removal: bool) -> StepOutcome {
    let message = response
        .body
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("");
    match response.status {
        200..=299 => regather_retry("waiting for load balancer nodes to converge"),
        // The LB is mid-update or temporarily locked; next cycle.
        422 if message.contains("PENDING_UPDATE") || message.contains("considered immutable") => {
            StepOutcome::new(StepResult::Retry)
                .with_reason(upstream_exception(response, "CLBImmutableError"))
        }
        413 | 429 => StepOutcome::new(StepResult::Retry)
            .with_reason(upstream_exception(response, "CLBRateLimitError")),
        // Removing from a deleted LB or removing an absent node already
        // achieved the goal.
        404 | 410 if removal => StepOutcome::new(StepResult::Success),
        404 => StepOutcome::new(StepResult::Failure)
            .with_reason(upstream_exception(response, "NoSuchCLBError")),
        410 => StepOutcome::new(StepResult::Failure)
            .with_reason(upstream_exception(response, "CLBDeletedError")),
        400..=499 => StepOutcome::new(StepResult::Failure)
            .with_reason(upstream_exception(response, "UpstreamBadRequest")),
        _ => StepOutcome::new(StepResult::Retry)
            .with_reason(upstream_exception(response, "UpstreamError")),
    }
}

/// Bulk pool calls can partially fail with per-pair error strings. The
/// recovery rules:
/// - pairs already in the goal state ("already a member" on add, "is not
///   a member" on remove) are satisfied and dropped;
/// - pairs whose pool is gone or inactive are unreachable and dropped
///   rather than retried forever;
/// - anything unrecognized fails the step;
/// - whatever remains is returned as a fresh bulk step (continuation).
fn interpret_bulk_pool(response: &Response, pairs: &[PoolPair], adding: bool) -> StepOutcome {
    match response.status {
        200..=299 => {
            return regather_retry("waiting for pool memberships to converge");
        }
        409 => {}
        413 | 429 => {
            return StepOutcome::new(StepResult::Retry)
                .with_reason(upstream_exception(response, "PoolRateLimitError"));
        }
        500..=599 => {
            return StepOutcome::new(StepResult::Retry)
                .with_reason(upstream_exception(response, "UpstreamError"));
        }
        _ => {
            return StepOutcome::new(StepResult::Failure)
                .with_reason(upstream_exception(response, "UpstreamBadRequest"));
        }
    }

    let errors: Vec<String> = response
        .body
        .get("errors")
        .and_then(Value::as_array)
        .map(|a| {
            a.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let mut remaining: Vec<PoolPair> = pairs.to_vec();
    let mut reasons = Vec::new();

    for error in &errors {
        if let Some((server_id, pool_id)) = parse_membership_error(error, adding) {
            // Goal already reached for this pair.
            remaining.retain(|p| !(p.server_id == server_id && p.pool_id == pool_id));
        } else if let Some(pool_id) = parse_unreachable_pool_error(error) {
            reasons.push(ErrorReason::user(error.clone()));
            remaining.retain(|p| p.pool_id != pool_id);
        } else {
            // An error we cannot attribute to a pair: stop converging
            // rather than hammering upstream with a bad request.
            return StepOutcome::new(StepResult::Failure)
                .with_reason(ErrorReason::exception("BulkPoolError", error.clone()));
        }
    }

    let continuation = if remaining.is_empty() {
        None
    } else if adding {
        Some(Step::BulkAddToPools { pairs: remaining })
    } else {
        Some(Step::BulkRemoveFromPools { pairs: remaining })
    };

    StepOutcome {
        result: StepResult::Retry,
        reasons,
        continuation,
    }
}

/// `"Cloud Server {id} is already a member of Load Balancer Pool {id}"`
/// (add) / `"... is not a member of ..."` (remove) → `(server, pool)`.
fn parse_membership_error(error: &str, adding: bool) -> Option<(String, String)> {
    let needle = if adding {
        " is already a member of Load Balancer Pool "
    } else {
        " is not a member of Load Balancer Pool "
    };
    let rest = error.strip_prefix("Cloud Server ")?;
    let (server_id, pool_id) = rest.split_once(needle)?;
    Some((server_id.to_string(), pool_id.trim().to_string()))
}

/// `"Load Balancer Pool {id} does not exist"` or
/// `"Load Balancer Pool {id} is not in an ACTIVE state"` → pool id.
fn parse_unreachable_pool_error(error: &str) -> Option<String> {
    let rest = error.strip_prefix("Load Balancer Pool ")?;
    let pool_id = rest
        .strip_suffix(" does not exist")
        .or_else(|| rest.strip_suffix(" is not in an ACTIVE state"))?;
    Some(pool_id.to_string())
}

fn interpret_create_stack(response: &Response) -> StepOutcome {
    match response.status {
        200..=299 => regather_retry("waiting for stack creation"),
        400..=499 => StepOutcome::new(StepResult::Failure).with_reason(upstream_exception(
            response,
            "CreateStackConfigurationError",
        )),
        _ => StepOutcome::new(StepResult::Retry)
            .with_reason(upstream_exception(response, "UpstreamError")),
    }
}

fn interpret_stack_mutation(response: &Response) -> StepOutcome {
    match response.status {
        200..=299 => regather_retry("waiting for stack operation"),
        409 => StepOutcome::new(StepResult::Retry)
            .with_reason(upstream_exception(response, "StackBusyError")),
        400..=499 => StepOutcome::new(StepResult::Failure)
            .with_reason(upstream_exception(response, "UpstreamBadRequest")),
        _ => StepOutcome::new(StepResult::Retry)
            .with_reason(upstream_exception(response, "UpstreamError")),
    }
}

/// A short unique token for server name suffixes, generated at
/// request-build time.
fn unique_token() -> String {
    use std::hash::{Hash, Hasher};
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
        .hash(&mut hasher);
    COUNTER.fetch_add(1, Ordering::Relaxed).hash(&mut hasher);
    std::process::id().hash(&mut hasher);
    format!("{:08x}", hasher.finish() as u32)
}
