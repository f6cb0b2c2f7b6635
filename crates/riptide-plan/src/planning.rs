//! The diffing planner.
//!
//! `plan()` is a deterministic, side-effect-free, total function from
//! `(desired, servers, lb_nodes, now)` to a multiset of steps. Duplicates
//! are meaningful and preserved until optimization.

use std::collections::BTreeMap;

use riptide_model::lb::{LbDescription, LbNode, NodeCondition};
use riptide_model::result::ErrorReason;
use riptide_model::server::{CloudServer, ServerState};
use riptide_model::stack::{Stack, StackHealth};
use riptide_model::{DesiredGroupState, ServerTemplate};

use crate::steps::{PoolPair, Step};

/// Default build timeout: a server stuck in `BUILD` this long is deleted.
pub const DEFAULT_BUILD_TIMEOUT_SECS: u64 = 3600;

/// Produce the step bag that moves observed state toward `desired`.
///
/// `servers` are the group's observed servers; `lb_nodes` all observed
/// load-balancer attachments for the group; `now` epoch seconds.
pub fn plan(
    desired: &DesiredGroupState,
    servers: &[CloudServer],
    lb_nodes: &[LbNode],
    now: f64,
    build_timeout_secs: u64,
) -> Vec<Step> {
    let mut steps = Vec::new();

    // Bucket by state, each newest-first (stable on created ties).
    let errored = bucket(servers, ServerState::Error);
    let active = bucket(servers, ServerState::Active);
    let building = bucket(servers, ServerState::Build);
    let draining = bucket(servers, ServerState::Draining);

    let (timed_out, pending): (Vec<&CloudServer>, Vec<&CloudServer>) = building
        .into_iter()
        .partition(|s| now - s.created as f64 >= build_timeout_secs as f64);

    // Create up to desired capacity; pending builds count.
    let in_service = active.len() + pending.len();
    for _ in in_service..desired.capacity {
        steps.push(create_step(&desired.template));
    }

    // Timed-out builds are deleted unconditionally; they never counted
    // against desired above.
    for server in &timed_out {
        steps.push(Step::DeleteServer {
            server_id: server.id.clone(),
        });
    }

    // Scale-down selection: active servers are preferred to survive, and
    // within a bucket older servers are evicted before newer ones (the
    // newest-first ordering puts the eviction candidates at the tail).
    let mut survivors: Vec<&CloudServer> = Vec::with_capacity(active.len() + pending.len());
    survivors.extend(active.iter().copied());
    survivors.extend(pending.iter().copied());
    let over_capacity: Vec<&CloudServer> = survivors
        .get(desired.capacity..)
        .map(|tail| tail.to_vec())
        .unwrap_or_default();

    // Drain-and-delete the over-capacity set plus anything already
    // draining from a previous cycle.
    let mut drain_waiting = false;
    for server in over_capacity.iter().chain(draining.iter()) {
        let nodes = nodes_for_server(lb_nodes, server);
        let lb_steps = remove_from_lb_with_draining(desired.draining_timeout_secs, &nodes, now);
        let removable_now = all_removals(&lb_steps, nodes.len());
        steps.extend(lb_steps);
        if removable_now {
            steps.push(Step::DeleteServer {
                server_id: server.id.clone(),
            });
        } else {
            drain_waiting = true;
            if server.state != ServerState::Draining {
                steps.push(Step::set_draining(&server.id));
            }
        }
    }

    // Errored servers never serve traffic: delete, and detach from every
    // LB without draining.
    for server in &errored {
        steps.push(Step::DeleteServer {
            server_id: server.id.clone(),
        });
        for node in nodes_for_server(lb_nodes, server) {
            steps.push(remove_node_step(&node));
        }
    }

    // LB reconciliation for every active server that is staying.
    for server in survivors.iter().take(desired.capacity) {
        if server.state != ServerState::Active {
            continue;
        }
        let nodes = nodes_for_server(lb_nodes, server);
        steps.extend(converge_lb_state(server, &desired.desired_lbs, &nodes));
    }

    // Force another cycle while builds or drains are outstanding, even if
    // no upstream work was planned this time.
    if !pending.is_empty() {
        steps.push(Step::ConvergeLater {
            reasons: vec![ErrorReason::string(format!(
                "waiting for {} server(s) to become active",
                pending.len()
            ))],
        });
    }
    if drain_waiting {
        steps.push(Step::ConvergeLater {
            reasons: vec![ErrorReason::string("waiting for servers to drain")],
        });
    }

    steps
}

/// The servers in one state, newest-first, ties broken by input order.
fn bucket<'a>(servers: &'a [CloudServer], state: ServerState) -> Vec<&'a CloudServer> {
    let mut out: Vec<&CloudServer> = servers.iter().filter(|s| s.state == state).collect();
    // Stable sort: equal `created` keeps relative input order.
    out.sort_by_key(|s| std::cmp::Reverse(s.created));
    out
}

fn create_step(template: &ServerTemplate) -> Step {
    match template {
        ServerTemplate::Server { args } => Step::CreateServer {
            template: args.clone(),
        },
        ServerTemplate::Stack { args } => Step::CreateStack {
            template: args.clone(),
        },
    }
}

/// The observed LB attachments belonging to one server.
fn nodes_for_server<'a>(lb_nodes: &'a [LbNode], server: &CloudServer) -> Vec<LbNode> {
    lb_nodes
        .iter()
        .filter(|n| n.attaches(&server.id, server.servicenet_address.as_deref()))
        .cloned()
        .collect()
}

fn remove_node_step(node: &LbNode) -> Step {
    match node {
        LbNode::Clb(n) => Step::RemoveNodesFromClb {
            lb_id: n.description.lb_id.clone(),
            node_ids: vec![n.node_id.clone()],
        },
        LbNode::Pool(n) => Step::BulkRemoveFromPools {
            pairs: vec![PoolPair {
                pool_id: n.pool_id.clone(),
                server_id: n.server_id.clone(),
            }],
        },
    }
}

/// Apply the draining policy to one server's current LB nodes.
///
/// With `timeout <= 0` every node is removed immediately. Otherwise
/// disabled nodes are removed, enabled nodes are transitioned to
/// draining, and draining nodes are removed only once the drain window
/// elapsed or connections are known to be zero — otherwise they are left
/// untouched for this cycle. Pool memberships have no drain concept and
/// are always removed immediately.
pub fn remove_from_lb_with_draining(timeout: f64, nodes: &[LbNode], now: f64) -> Vec<Step> {
    let mut steps = Vec::new();
    for node in nodes {
        match node {
            LbNode::Pool(_) => steps.push(remove_node_step(node)),
            LbNode::Clb(clb) => {
                if timeout <= 0.0 {
                    steps.push(remove_node_step(node));
                    continue;
                }
                match clb.description.condition {
                    NodeCondition::Disabled => steps.push(remove_node_step(node)),
                    NodeCondition::Enabled => steps.push(Step::ChangeClbNode {
                        lb_id: clb.description.lb_id.clone(),
                        node_id: clb.node_id.clone(),
                        condition: NodeCondition::Draining,
                        weight: clb.description.weight,
                        node_type: clb.description.node_type,
                    }),
                    NodeCondition::Draining => {
                        if clb.done_draining(now, timeout) {
                            steps.push(remove_node_step(node));
                        }
                        // else: wait for the next gather.
                    }
                }
            }
        }
    }
    steps
}

/// True when `lb_steps` removes every one of the server's `node_count`
/// current attachments — meaning the server itself can be deleted now.
fn all_removals(lb_steps: &[Step], node_count: usize) -> bool {
    let removals = lb_steps
        .iter()
        .filter(|s| {
            matches!(
                s,
                Step::RemoveNodesFromClb { .. } | Step::BulkRemoveFromPools { .. }
            )
        })
        .count();
    removals == node_count && lb_steps.len() == removals
}

/// Key identifying one desired/observed attachment slot: the LB id plus
/// the port for CLB (pools have no port).
type LbKey = (String, Option<u16>);

fn description_key(description: &LbDescription) -> LbKey {
    match description {
        LbDescription::Clb(d) => (d.lb_id.clone(), Some(d.port)),
        LbDescription::Pool(d) => (d.pool_id.clone(), None),
    }
}

/// Diff one server's desired LB descriptions against its current nodes.
///
/// Desired-only keys become adds, current-only keys become removes, and
/// keys present on both sides with an attribute difference become
/// change-in-place steps.
pub fn converge_lb_state(
    server: &CloudServer,
    desired_lbs: &[LbDescription],
    current_nodes: &[LbNode],
) -> Vec<Step> {
    let desired: BTreeMap<LbKey, &LbDescription> = desired_lbs
        .iter()
        .map(|d| (description_key(d), d))
        .collect();
    let current: BTreeMap<LbKey, &LbNode> = current_nodes
        .iter()
        .map(|n| (description_key(&n.description()), n))
        .collect();

    let mut steps = Vec::new();

    for (key, description) in &desired {
        match current.get(key) {
            None => {
                if let Some(step) = add_node_step(server, description) {
                    steps.push(step);
                }
            }
            Some(node) => {
                if let LbNode::Clb(clb) = &**node
                    && let LbDescription::Clb(want) = &**description
                    && clb.description != *want
                {
                    steps.push(Step::ChangeClbNode {
                        lb_id: want.lb_id.clone(),
                        node_id: clb.node_id.clone(),
                        condition: want.condition,
                        weight: want.weight,
                        node_type: want.node_type,
                    });
                }
                // Identical description: nothing to do.
            }
        }
    }

    for (key, node) in &current {
        if !desired.contains_key(key) {
            steps.push(remove_node_step(node));
        }
    }

    steps
}

fn add_node_step(server: &CloudServer, description: &LbDescription) -> Option<Step> {
    match description {
        LbDescription::Clb(d) => {
            // A CLB node needs the server's service-net address; servers
            // without one are picked up on a later cycle.
            let address = server.servicenet_address.clone()?;
            Some(Step::AddNodesToClb {
                lb_id: d.lb_id.clone(),
                nodes: vec![(address, d.clone())],
            })
        }
        LbDescription::Pool(d) => Some(Step::BulkAddToPools {
            pairs: vec![PoolPair {
                pool_id: d.pool_id.clone(),
                server_id: server.id.clone(),
            }],
        }),
    }
}

/// Converge a stack-launching group: create for shortfall, delete
/// unhealthy and over-capacity stacks, and converge again while any stack
/// operation is still in progress.
pub fn plan_stacks(desired: &DesiredGroupState, stacks: &[Stack], _now: f64) -> Vec<Step> {
    let mut steps = Vec::new();

    let mut healthy: Vec<&Stack> = stacks
        .iter()
        .filter(|s| s.health() == StackHealth::Healthy)
        .collect();
    healthy.sort_by_key(|s| std::cmp::Reverse(s.created));
    let mut in_progress: Vec<&Stack> = stacks
        .iter()
        .filter(|s| s.health() == StackHealth::InProgress)
        .collect();
    in_progress.sort_by_key(|s| std::cmp::Reverse(s.created));
    let mut suspect: Vec<&Stack> = stacks
        .iter()
        .filter(|s| s.health() == StackHealth::Suspect)
        .collect();
    suspect.sort_by_key(|s| std::cmp::Reverse(s.created));
    let unhealthy: Vec<&Stack> = stacks
        .iter()
        .filter(|s| s.health() == StackHealth::Unhealthy)
        .collect();

    let in_service = healthy.len() + suspect.len() + in_progress.len();
    for _ in in_service..desired.capacity {
        steps.push(create_step(&desired.template));
    }

    for stack in &unhealthy {
        steps.push(delete_stack_step(stack));
    }

    // Healthy stacks are preferred to survive, then repairable ones,
    // then in-progress ones.
    let mut survivors: Vec<&Stack> = Vec::with_capacity(in_service);
    survivors.extend(healthy.iter().copied());
    survivors.extend(suspect.iter().copied());
    survivors.extend(in_progress.iter().copied());
    for stack in survivors.iter().skip(desired.capacity) {
        steps.push(delete_stack_step(stack));
    }
    survivors.truncate(desired.capacity);

    // Surviving stacks that failed their last check get the template
    // re-applied.
    for stack in survivors
        .iter()
        .filter(|s| s.health() == StackHealth::Suspect)
    {
        steps.push(Step::UpdateStack {
            stack_name: stack.name.clone(),
            stack_id: stack.id.clone(),
            template: desired.template.args().clone(),
        });
    }

    // A quiet plan still verifies survivors that have not been checked
    // since their last create or update; CHECK_COMPLETE marks a stack as
    // verified, so the check cycle terminates.
    if steps.is_empty() && in_progress.is_empty() {
        for stack in survivors.iter().filter(|s| s.status != "CHECK_COMPLETE") {
            steps.push(Step::CheckStack {
                stack_name: stack.name.clone(),
                stack_id: stack.id.clone(),
            });
        }
    }

    if !in_progress.is_empty() {
        steps.push(Step::ConvergeLater {
            reasons: vec![ErrorReason::string(format!(
                "waiting for {} stack(s) to complete",
                in_progress.len()
            ))],
        });
    }

    steps
}

fn delete_stack_step(stack: &Stack) -> Step {
    Step::DeleteStack {
        stack_name: stack.name.clone(),
        stack_id: stack.id.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use riptide_model::lb::{ClbDescription, ClbNode, NodeType, PoolDescription, PoolNode};
    use serde_json::json;

    const BUILD_TIMEOUT: u64 = 3600;

    fn server(id: &str, state: ServerState, created: u64) -> CloudServer {
        CloudServer {
            id: id.to_string(),
            state,
            created,
            image_id: None,
            flavor_id: None,
            servicenet_address: Some(format!("10.0.0.{}", id.len())),
            desired_lbs: Vec::new(),
            json: json!({}),
        }
    }

    fn server_at(id: &str, state: ServerState, created: u64, addr: &str) -> CloudServer {
        CloudServer {
            servicenet_address: Some(addr.to_string()),
            ..server(id, state, created)
        }
    }

    fn desired(capacity: usize) -> DesiredGroupState {
        DesiredGroupState::new(json!({"server": {"name": "web"}}), capacity)
    }

    fn clb_desc(lb_id: &str, port: u16) -> ClbDescription {
        ClbDescription {
            lb_id: lb_id.to_string(),
            port,
            weight: 1,
            condition: NodeCondition::Enabled,
            node_type: NodeType::Primary,
        }
    }

    fn clb_node(node_id: &str, addr: &str, desc: ClbDescription) -> LbNode {
        LbNode::Clb(ClbNode {
            node_id: node_id.to_string(),
            address: addr.to_string(),
            description: desc,
            drained_at: None,
            connections: None,
        })
    }

    fn count_creates(steps: &[Step]) -> usize {
        steps
            .iter()
            .filter(|s| matches!(s, Step::CreateServer { .. }))
            .count()
    }

    fn deleted_ids(steps: &[Step]) -> Vec<String> {
        steps
            .iter()
            .filter_map(|s| match s {
                Step::DeleteServer { server_id } => Some(server_id.clone()),
                _ => None,
            })
            .collect()
    }

    // ── Capacity ───────────────────────────────────────────────────

    #[test]
    fn creates_to_fill_shortfall() {
        let steps = plan(&desired(2), &[], &[], 0.0, BUILD_TIMEOUT);
        assert_eq!(count_creates(&steps), 2);
        assert_eq!(steps.len(), 2);
    }

    #[test]
    fn pending_builds_count_toward_capacity() {
        let servers = [
            server("a", ServerState::Active, 100),
            server("b", ServerState::Build, 200),
        ];
        let steps = plan(&desired(3), &servers, &[], 300.0, BUILD_TIMEOUT);
        assert_eq!(count_creates(&steps), 1);
    }

    #[test]
    fn converged_group_plans_nothing() {
        let servers = [
            server("a", ServerState::Active, 100),
            server("b", ServerState::Active, 200),
        ];
        let steps = plan(&desired(2), &servers, &[], 300.0, BUILD_TIMEOUT);
        assert!(steps.is_empty());
    }

    #[test]
    fn plan_is_deterministic() {
        let servers = [
            server("a", ServerState::Active, 100),
            server("b", ServerState::Build, 100),
            server("c", ServerState::Error, 50),
        ];
        let first = plan(&desired(1), &servers, &[], 300.0, BUILD_TIMEOUT);
        let second = plan(&desired(1), &servers, &[], 300.0, BUILD_TIMEOUT);
        assert_eq!(first, second);
    }

    // ── Build timeout ──────────────────────────────────────────────

    #[test]
    fn timed_out_builds_are_deleted_and_replaced() {
        let servers = [server("a", ServerState::Build, 0)];
        let now = BUILD_TIMEOUT as f64 + 1.0;
        let steps = plan(&desired(1), &servers, &[], now, BUILD_TIMEOUT);
        assert_eq!(deleted_ids(&steps), vec!["a"]);
        assert_eq!(count_creates(&steps), 1);
    }

    #[test]
    fn fresh_build_is_not_deleted() {
        let servers = [server("a", ServerState::Build, 0)];
        let steps = plan(&desired(1), &servers, &[], 10.0, BUILD_TIMEOUT);
        assert!(deleted_ids(&steps).is_empty());
        assert_eq!(count_creates(&steps), 0);
        // But we do need another cycle.
        assert!(
            steps
                .iter()
                .any(|s| matches!(s, Step::ConvergeLater { .. }))
        );
    }

    // ── Scale-down selection ───────────────────────────────────────

    #[test]
    fn building_servers_are_evicted_before_active() {
        let servers = [
            server("builder", ServerState::Build, 200),
            server("worker", ServerState::Active, 100),
        ];
        let steps = plan(&desired(1), &servers, &[], 300.0, BUILD_TIMEOUT);
        assert_eq!(deleted_ids(&steps), vec!["builder"]);
    }

    #[test]
    fn older_servers_are_evicted_before_newer() {
        let servers = [
            server("old", ServerState::Active, 100),
            server("new", ServerState::Active, 500),
        ];
        let steps = plan(&desired(1), &servers, &[], 600.0, BUILD_TIMEOUT);
        assert_eq!(deleted_ids(&steps), vec!["old"]);
    }

    #[test]
    fn created_ties_break_by_input_order() {
        let servers = [
            server("first", ServerState::Active, 100),
            server("second", ServerState::Active, 100),
        ];
        let steps = plan(&desired(1), &servers, &[], 600.0, BUILD_TIMEOUT);
        // Stable ordering keeps "first" ahead, so "second" is the tail.
        assert_eq!(deleted_ids(&steps), vec!["second"]);
    }

    #[test]
    fn scale_to_zero_deletes_all() {
        let servers = [
            server("a", ServerState::Active, 100),
            server("b", ServerState::Active, 200),
        ];
        let mut ids = deleted_ids(&plan(&desired(0), &servers, &[], 300.0, BUILD_TIMEOUT));
        ids.sort();
        assert_eq!(ids, vec!["a", "b"]);
    }

    // ── Draining ───────────────────────────────────────────────────

    #[test]
    fn zero_timeout_removes_and_deletes_immediately() {
        let servers = [server_at("a", ServerState::Active, 100, "10.0.0.1")];
        let nodes = [clb_node("n1", "10.0.0.1", clb_desc("5", 80))];
        let steps = plan(&desired(0), &servers, &nodes, 300.0, BUILD_TIMEOUT);

        assert!(steps.iter().any(|s| matches!(
            s,
            Step::RemoveNodesFromClb { lb_id, .. } if lb_id == "5"
        )));
        assert_eq!(deleted_ids(&steps), vec!["a"]);
    }

    #[test]
    fn draining_round_trip() {
        let group = desired(0).with_draining_timeout(30.0);

        // Cycle 1: enabled node → change to draining + tag the server,
        // no delete yet.
        let servers = [server_at("a", ServerState::Active, 100, "10.0.0.1")];
        let nodes = [clb_node("n1", "10.0.0.1", clb_desc("5", 80))];
        let steps = plan(&group, &servers, &nodes, 300.0, BUILD_TIMEOUT);

        assert!(steps.iter().any(|s| matches!(
            s,
            Step::ChangeClbNode { condition: NodeCondition::Draining, .. }
        )));
        assert!(steps.iter().any(|s| matches!(
            s,
            Step::SetMetadataItem { server_id, .. } if server_id == "a"
        )));
        assert!(deleted_ids(&steps).is_empty());

        // Cycle 2: node reports draining with zero connections → remove
        // and delete.
        let servers = [server_at("a", ServerState::Draining, 100, "10.0.0.1")];
        let nodes = [LbNode::Clb(ClbNode {
            node_id: "n1".to_string(),
            address: "10.0.0.1".to_string(),
            description: ClbDescription {
                condition: NodeCondition::Draining,
                ..clb_desc("5", 80)
            },
            drained_at: Some(300.0),
            connections: Some(0),
        })];
        let steps = plan(&group, &servers, &nodes, 310.0, BUILD_TIMEOUT);

        assert!(
            steps
                .iter()
                .any(|s| matches!(s, Step::RemoveNodesFromClb { .. }))
        );
        assert_eq!(deleted_ids(&steps), vec!["a"]);
    }

    #[test]
    fn unexpired_drain_waits() {
        let group = desired(0).with_draining_timeout(300.0);
        let servers = [server_at("a", ServerState::Draining, 100, "10.0.0.1")];
        let nodes = [LbNode::Clb(ClbNode {
            node_id: "n1".to_string(),
            address: "10.0.0.1".to_string(),
            description: ClbDescription {
                condition: NodeCondition::Draining,
                ..clb_desc("5", 80)
            },
            drained_at: Some(1000.0),
            connections: Some(7),
        })];
        let steps = plan(&group, &servers, &nodes, 1100.0, BUILD_TIMEOUT);

        assert!(deleted_ids(&steps).is_empty());
        assert!(
            !steps
                .iter()
                .any(|s| matches!(s, Step::RemoveNodesFromClb { .. }))
        );
        assert!(
            steps
                .iter()
                .any(|s| matches!(s, Step::ConvergeLater { .. }))
        );
    }

    #[test]
    fn already_draining_server_is_not_retagged() {
        let group = desired(0).with_draining_timeout(300.0);
        let servers = [server_at("a", ServerState::Draining, 100, "10.0.0.1")];
        let nodes = [clb_node("n1", "10.0.0.1", clb_desc("5", 80))];
        let steps = plan(&group, &servers, &nodes, 400.0, BUILD_TIMEOUT);
        assert!(
            !steps
                .iter()
                .any(|s| matches!(s, Step::SetMetadataItem { .. }))
        );
    }

    // ── Error cleanup ──────────────────────────────────────────────

    #[test]
    fn errored_servers_are_deleted_and_detached_without_draining() {
        let group = desired(1).with_draining_timeout(300.0);
        let servers = [
            server_at("good", ServerState::Active, 100, "10.0.0.1"),
            server_at("bad", ServerState::Error, 200, "10.0.0.2"),
        ];
        let nodes = [clb_node("n2", "10.0.0.2", clb_desc("5", 80))];
        let steps = plan(&group, &servers, &nodes, 300.0, BUILD_TIMEOUT);

        assert_eq!(deleted_ids(&steps), vec!["bad"]);
        // No drain transition for an errored server, straight removal.
        assert!(
            steps
                .iter()
                .any(|s| matches!(s, Step::RemoveNodesFromClb { .. }))
        );
        assert!(!steps.iter().any(|s| matches!(s, Step::ChangeClbNode { .. })));
    }

    #[test]
    fn errored_servers_do_not_count_toward_capacity() {
        let servers = [server("bad", ServerState::Error, 100)];
        let steps = plan(&desired(1), &servers, &[], 300.0, BUILD_TIMEOUT);
        assert_eq!(count_creates(&steps), 1);
        assert_eq!(deleted_ids(&steps), vec!["bad"]);
    }

    // ── LB reconciliation ──────────────────────────────────────────

    #[test]
    fn active_server_missing_lb_node_gets_added() {
        let group = desired(1).with_lbs(vec![LbDescription::Clb(clb_desc("23", 80))]);
        let servers = [server_at("a", ServerState::Active, 100, "10.0.0.1")];
        let steps = plan(&group, &servers, &[], 300.0, BUILD_TIMEOUT);

        assert_eq!(steps.len(), 1);
        match &steps[0] {
            Step::AddNodesToClb { lb_id, nodes } => {
                assert_eq!(lb_id, "23");
                assert_eq!(nodes, &[("10.0.0.1".to_string(), clb_desc("23", 80))]);
            }
            other => panic!("unexpected step: {other:?}"),
        }
    }

    #[test]
    fn server_without_address_waits_for_clb_attach() {
        let group = desired(1).with_lbs(vec![LbDescription::Clb(clb_desc("23", 80))]);
        let mut srv = server("a", ServerState::Active, 100);
        srv.servicenet_address = None;
        let steps = plan(&group, &[srv], &[], 300.0, BUILD_TIMEOUT);
        assert!(steps.is_empty());
    }

    #[test]
    fn stray_lb_node_is_removed() {
        let group = desired(1);
        let servers = [server_at("a", ServerState::Active, 100, "10.0.0.1")];
        let nodes = [clb_node("n1", "10.0.0.1", clb_desc("99", 80))];
        let steps = plan(&group, &servers, &nodes, 300.0, BUILD_TIMEOUT);

        assert_eq!(
            steps,
            vec![Step::RemoveNodesFromClb {
                lb_id: "99".to_string(),
                node_ids: vec!["n1".to_string()],
            }]
        );
    }

    #[test]
    fn attribute_drift_becomes_change_in_place() {
        let want = ClbDescription {
            weight: 5,
            ..clb_desc("23", 80)
        };
        let group = desired(1).with_lbs(vec![LbDescription::Clb(want.clone())]);
        let servers = [server_at("a", ServerState::Active, 100, "10.0.0.1")];
        let nodes = [clb_node("n1", "10.0.0.1", clb_desc("23", 80))];
        let steps = plan(&group, &servers, &nodes, 300.0, BUILD_TIMEOUT);

        assert_eq!(
            steps,
            vec![Step::ChangeClbNode {
                lb_id: "23".to_string(),
                node_id: "n1".to_string(),
                condition: NodeCondition::Enabled,
                weight: 5,
                node_type: NodeType::Primary,
            }]
        );
    }

    #[test]
    fn matching_attachment_plans_nothing() {
        let group = desired(1).with_lbs(vec![LbDescription::Clb(clb_desc("23", 80))]);
        let servers = [server_at("a", ServerState::Active, 100, "10.0.0.1")];
        let nodes = [clb_node("n1", "10.0.0.1", clb_desc("23", 80))];
        let steps = plan(&group, &servers, &nodes, 300.0, BUILD_TIMEOUT);
        assert!(steps.is_empty());
    }

    #[test]
    fn multiple_ports_on_one_lb_are_distinct() {
        let group = desired(1).with_lbs(vec![
            LbDescription::Clb(clb_desc("23", 80)),
            LbDescription::Clb(clb_desc("23", 8080)),
        ]);
        let servers = [server_at("a", ServerState::Active, 100, "10.0.0.1")];
        let nodes = [clb_node("n1", "10.0.0.1", clb_desc("23", 80))];
        let steps = plan(&group, &servers, &nodes, 300.0, BUILD_TIMEOUT);

        // Port 80 is satisfied; only 8080 needs an add.
        assert_eq!(steps.len(), 1);
        assert!(matches!(
            &steps[0],
            Step::AddNodesToClb { nodes, .. } if nodes[0].1.port == 8080
        ));
    }

    #[test]
    fn pool_attachments_diff_by_server_id() {
        let group = desired(1).with_lbs(vec![LbDescription::Pool(PoolDescription {
            pool_id: "p1".to_string(),
        })]);
        let servers = [server_at("a", ServerState::Active, 100, "10.0.0.1")];
        let steps = plan(&group, &servers, &[], 300.0, BUILD_TIMEOUT);

        assert_eq!(
            steps,
            vec![Step::BulkAddToPools {
                pairs: vec![PoolPair {
                    pool_id: "p1".to_string(),
                    server_id: "a".to_string(),
                }]
            }]
        );

        // And the reverse: membership no longer desired.
        let group = desired(1);
        let nodes = [LbNode::Pool(PoolNode {
            node_id: "m1".to_string(),
            pool_id: "p1".to_string(),
            server_id: "a".to_string(),
        })];
        let steps = plan(&group, &servers, &nodes, 300.0, BUILD_TIMEOUT);
        assert_eq!(
            steps,
            vec![Step::BulkRemoveFromPools {
                pairs: vec![PoolPair {
                    pool_id: "p1".to_string(),
                    server_id: "a".to_string(),
                }]
            }]
        );
    }

    // ── Stack planning ─────────────────────────────────────────────

    fn stack(id: &str, status: &str, created: u64) -> Stack {
        Stack {
            id: id.to_string(),
            name: format!("stack-{id}"),
            status: status.to_string(),
            created,
        }
    }

    fn stack_desired(capacity: usize) -> DesiredGroupState {
        DesiredGroupState {
            template: ServerTemplate::Stack {
                args: json!({"stack_name": "web", "template": {}}),
            },
            capacity,
            desired_lbs: Vec::new(),
            draining_timeout_secs: 0.0,
        }
    }

    #[test]
    fn stack_shortfall_creates() {
        let steps = plan_stacks(&stack_desired(2), &[], 0.0);
        assert_eq!(
            steps
                .iter()
                .filter(|s| matches!(s, Step::CreateStack { .. }))
                .count(),
            2
        );
    }

    #[test]
    fn failed_stacks_are_deleted_and_replaced() {
        let stacks = [stack("a", "CREATE_FAILED", 100)];
        let steps = plan_stacks(&stack_desired(1), &stacks, 0.0);
        assert!(steps.iter().any(|s| matches!(
            s,
            Step::DeleteStack { stack_id, .. } if stack_id == "a"
        )));
        assert!(steps.iter().any(|s| matches!(s, Step::CreateStack { .. })));
    }

    #[test]
    fn in_progress_stacks_defer_convergence() {
        let stacks = [stack("a", "CREATE_IN_PROGRESS", 100)];
        let steps = plan_stacks(&stack_desired(1), &stacks, 0.0);
        assert_eq!(
            steps,
            vec![Step::ConvergeLater {
                reasons: vec![ErrorReason::string("waiting for 1 stack(s) to complete")]
            }]
        );
    }

    #[test]
    fn check_failed_stacks_get_the_template_reapplied() {
        let stacks = [stack("a", "CHECK_FAILED", 100)];
        let steps = plan_stacks(&stack_desired(1), &stacks, 0.0);
        assert_eq!(
            steps,
            vec![Step::UpdateStack {
                stack_name: "stack-a".to_string(),
                stack_id: "a".to_string(),
                template: json!({"stack_name": "web", "template": {}}),
            }]
        );
    }

    #[test]
    fn check_failed_stacks_over_capacity_are_deleted_not_repaired() {
        let stacks = [
            stack("good", "CREATE_COMPLETE", 100),
            stack("bad", "CHECK_FAILED", 50),
        ];
        let steps = plan_stacks(&stack_desired(1), &stacks, 0.0);
        assert!(steps.iter().any(|s| matches!(
            s,
            Step::DeleteStack { stack_id, .. } if stack_id == "bad"
        )));
        assert!(!steps.iter().any(|s| matches!(s, Step::UpdateStack { .. })));
    }

    #[test]
    fn quiet_plan_checks_unverified_stacks() {
        let stacks = [stack("a", "CREATE_COMPLETE", 100)];
        let steps = plan_stacks(&stack_desired(1), &stacks, 0.0);
        assert_eq!(
            steps,
            vec![Step::CheckStack {
                stack_name: "stack-a".to_string(),
                stack_id: "a".to_string(),
            }]
        );
    }

    #[test]
    fn verified_stacks_plan_nothing() {
        let stacks = [stack("a", "CHECK_COMPLETE", 100)];
        assert!(plan_stacks(&stack_desired(1), &stacks, 0.0).is_empty());
    }

    #[test]
    fn healthy_stacks_survive_scale_down_over_in_progress() {
        let stacks = [
            stack("busy", "UPDATE_IN_PROGRESS", 500),
            stack("done", "CREATE_COMPLETE", 100),
        ];
        let steps = plan_stacks(&stack_desired(1), &stacks, 0.0);
        assert!(steps.iter().any(|s| matches!(
            s,
            Step::DeleteStack { stack_id, .. } if stack_id == "busy"
        )));
    }
}
