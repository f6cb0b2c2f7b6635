//! Step-bag optimization.
//!
//! Runs before execution to cut upstream call count: merge same-typed
//! steps targeting the same resource, allow only one mutating CLB step
//! type per load balancer per cycle, and cap per-type step counts to
//! bound blast radius. Dropped steps are not lost — the world still
//! differs from desired, so they are re-planned next cycle.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::steps::{PoolPair, Step};

/// Per-cycle caps on creation steps.
#[derive(Debug, Clone, Copy)]
pub struct StepLimits {
    pub create_server: usize,
    pub create_stack: usize,
}

impl Default for StepLimits {
    fn default() -> Self {
        StepLimits {
            create_server: 10,
            create_stack: 10,
        }
    }
}

/// Optimize a step bag: merge, filter, cap. Stable under reordering of
/// mergeable inputs; never drops an operand on address+port collisions.
pub fn optimize(steps: Vec<Step>, limits: StepLimits) -> Vec<Step> {
    let planned = steps.len();
    let merged = merge_steps(steps);
    let filtered = one_clb_step_type_per_lb(merged);
    let capped = cap_steps(filtered, limits);
    if capped.len() != planned {
        debug!(planned, optimized = capped.len(), "optimized step bag");
    }
    capped
}

/// Merge same-typed steps that target the same external resource:
/// CLB adds/removes by LB id, bulk pool calls into one call each way.
/// Operands are deduplicated but multiple ports on one address+LB are
/// preserved as distinct nodes.
fn merge_steps(steps: Vec<Step>) -> Vec<Step> {
    // Index of the step a merge key folds into, keyed by merge identity.
    let mut add_slot: HashMap<String, usize> = HashMap::new();
    let mut remove_slot: HashMap<String, usize> = HashMap::new();
    let mut bulk_add_slot: Option<usize> = None;
    let mut bulk_remove_slot: Option<usize> = None;

    let mut out: Vec<Step> = Vec::with_capacity(steps.len());

    for step in steps {
        match step {
            Step::AddNodesToClb { lb_id, nodes } => {
                match add_slot.get(&lb_id) {
                    Some(&i) => {
                        if let Step::AddNodesToClb { nodes: have, .. } = &mut out[i] {
                            for node in nodes {
                                // Identity is (address, port): one address
                                // may legitimately serve several ports.
                                let dup = have
                                    .iter()
                                    .any(|(a, d)| *a == node.0 && d.port == node.1.port);
                                if !dup {
                                    have.push(node);
                                }
                            }
                        }
                    }
                    None => {
                        add_slot.insert(lb_id.clone(), out.len());
                        out.push(Step::AddNodesToClb { lb_id, nodes });
                    }
                }
            }
            Step::RemoveNodesFromClb { lb_id, node_ids } => match remove_slot.get(&lb_id) {
                Some(&i) => {
                    if let Step::RemoveNodesFromClb { node_ids: have, .. } = &mut out[i] {
                        for id in node_ids {
                            if !have.contains(&id) {
                                have.push(id);
                            }
                        }
                    }
                }
                None => {
                    remove_slot.insert(lb_id.clone(), out.len());
                    out.push(Step::RemoveNodesFromClb { lb_id, node_ids });
                }
            },
            Step::BulkAddToPools { pairs } => {
                merge_bulk(&mut out, &mut bulk_add_slot, pairs, true);
            }
            Step::BulkRemoveFromPools { pairs } => {
                merge_bulk(&mut out, &mut bulk_remove_slot, pairs, false);
            }
            other => out.push(other),
        }
    }

    out
}

fn merge_bulk(out: &mut Vec<Step>, slot: &mut Option<usize>, pairs: Vec<PoolPair>, adding: bool) {
    match slot {
        Some(i) => {
            let have = match &mut out[*i] {
                Step::BulkAddToPools { pairs } | Step::BulkRemoveFromPools { pairs } => pairs,
                _ => return,
            };
            for pair in pairs {
                if !have.contains(&pair) {
                    have.push(pair);
                }
            }
        }
        None => {
            *slot = Some(out.len());
            out.push(if adding {
                Step::BulkAddToPools { pairs }
            } else {
                Step::BulkRemoveFromPools { pairs }
            });
        }
    }
}

/// At most one mutating CLB step type per load balancer per cycle: the
/// first-seen type wins, later conflicting types are dropped and will be
/// re-planned once state is re-gathered.
fn one_clb_step_type_per_lb(steps: Vec<Step>) -> Vec<Step> {
    // lb_id → discriminant of the winning step type.
    let mut winner: HashMap<String, u8> = HashMap::new();
    let mut out = Vec::with_capacity(steps.len());

    for step in steps {
        let (lb_id, kind) = match &step {
            Step::AddNodesToClb { lb_id, .. } => (lb_id.clone(), 0u8),
            Step::RemoveNodesFromClb { lb_id, .. } => (lb_id.clone(), 1),
            Step::ChangeClbNode { lb_id, .. } => (lb_id.clone(), 2),
            _ => {
                out.push(step);
                continue;
            }
        };
        let entry = *winner.entry(lb_id.clone()).or_insert(kind);
        if entry == kind {
            out.push(step);
        } else {
            debug!(%lb_id, "dropping conflicting CLB step type for this cycle");
        }
    }

    out
}

/// Cap per-step-type counts; steps beyond the cap are dropped for this
/// cycle.
fn cap_steps(steps: Vec<Step>, limits: StepLimits) -> Vec<Step> {
    let mut created_servers = 0usize;
    let mut created_stacks = 0usize;
    let mut seen_over_cap: HashSet<&'static str> = HashSet::new();

    let out: Vec<Step> = steps
        .into_iter()
        .filter(|step| match step {
            Step::CreateServer { .. } => {
                created_servers += 1;
                if created_servers > limits.create_server {
                    seen_over_cap.insert("create_server");
                    false
                } else {
                    true
                }
            }
            Step::CreateStack { .. } => {
                created_stacks += 1;
                if created_stacks > limits.create_stack {
                    seen_over_cap.insert("create_stack");
                    false
                } else {
                    true
                }
            }
            _ => true,
        })
        .collect();

    for kind in seen_over_cap {
        debug!(kind, "creation steps over per-cycle cap were dropped");
    }
    out
}
