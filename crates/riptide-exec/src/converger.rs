//! The converger: turns dirty-group flags into convergence cycles.
//!
//! Divergence is signalled by a flag node under `/groups/divergent`,
//! named `{tenant}_{group}`. Marking is create-or-set, so re-marking an
//! already-dirty group just bumps the node version. A cycle finishes by
//! deleting the flag with the version observed when the cycle started;
//! if someone re-marked the group meanwhile the delete fails with
//! `BadVersion` and the group stays dirty. That is the whole
//! "no lost wakeups" story.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use riptide_coord::{CoordError, CoordResult, CoordStore, Partitioner};
use riptide_gather::{CloudClient, Gatherer, ObservedGroup};
use riptide_model::result::{StepResult, present_reasons};
use riptide_model::server::ServerState;
use riptide_model::{DesiredGroupState, ServerTemplate};
use riptide_plan::{DEFAULT_BUILD_TIMEOUT_SECS, Step, StepLimits, plan, plan_stacks};
use riptide_state::{
    ActiveServersSnapshot, GroupStatus, GroupStore, SnapshotServer, epoch_secs,
};

use crate::effecting::execute_steps;
use crate::error::ExecResult;

/// Parent node of the dirty-group flags.
pub const DIVERGENT_PATH: &str = "/groups/divergent";

/// Flag node path for one group.
pub fn flag_path(tenant_id: &str, group_id: &str) -> String {
    format!("{DIVERGENT_PATH}/{tenant_id}_{group_id}")
}

/// Split a flag node name back into tenant and group. Ids must not
/// contain underscores.
pub fn parse_flag(name: &str) -> Option<(String, String)> {
    let (tenant, group) = name.split_once('_')?;
    if tenant.is_empty() || group.is_empty() {
        return None;
    }
    Some((tenant.to_string(), group.to_string()))
}

/// Runs convergence cycles for the groups this process owns.
#[derive(Clone)]
pub struct Converger {
    groups: GroupStore,
    coord: Arc<dyn CoordStore>,
    client: Arc<dyn CloudClient>,
    gatherer: Gatherer,
    limits: StepLimits,
    build_timeout_secs: u64,
    /// Flag names with a cycle currently running in this process.
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl Converger {
    pub fn new(groups: GroupStore, coord: Arc<dyn CoordStore>, client: Arc<dyn CloudClient>) -> Self {
        Converger {
            groups,
            coord,
            gatherer: Gatherer::new(Arc::clone(&client)),
            client,
            limits: StepLimits::default(),
            build_timeout_secs: DEFAULT_BUILD_TIMEOUT_SECS,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn with_limits(mut self, limits: StepLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_build_timeout(mut self, secs: u64) -> Self {
        self.build_timeout_secs = secs;
        self
    }

    /// Substitute a preconfigured gatherer (tests shrink its retry
    /// budget).
    pub fn with_gatherer(mut self, gatherer: Gatherer) -> Self {
        self.gatherer = gatherer;
        self
    }

    /// Flag a group as divergent. Idempotent; re-marking bumps the flag
    /// version so a cycle already underway cannot swallow the new mark.
    pub async fn mark_dirty(&self, tenant_id: &str, group_id: &str) -> CoordResult<i32> {
        let version = self
            .coord
            .create_or_set(&flag_path(tenant_id, group_id), &[])
            .await?;
        debug!(tenant = tenant_id, group = group_id, version, "group marked divergent");
        Ok(version)
    }

    /// One pass over the dirty flags: run a cycle for every owned,
    /// not-already-running group and wait for them all. Returns how many
    /// cycles ran.
    pub async fn sweep_once(&self, partitioner: &Partitioner) -> ExecResult<usize> {
        self.coord.ensure(DIVERGENT_PATH).await?;
        let flags = self.coord.get_children_with_stats(DIVERGENT_PATH).await?;

        let mut cycles: JoinSet<()> = JoinSet::new();
        let mut scheduled = 0;
        for (name, stat) in flags {
            let Some((tenant, group)) = parse_flag(&name) else {
                warn!(flag = %name, "unparseable divergence flag");
                continue;
            };
            if !partitioner.owns(&tenant).await? {
                continue;
            }
            let Some(guard) = InFlightGuard::claim(&self.in_flight, &name) else {
                debug!(flag = %name, "cycle already running");
                continue;
            };
            let converger = self.clone();
            scheduled += 1;
            cycles.spawn(async move {
                converger.converge_one(&tenant, &group, stat.version).await;
                drop(guard);
            });
        }
        while cycles.join_next().await.is_some() {}
        Ok(scheduled)
    }

    /// One full convergence cycle for one flagged group.
    ///
    /// `flag_version` is the flag's version at listing time; the flag is
    /// only ever deleted at exactly that version.
    pub async fn converge_one(&self, tenant_id: &str, group_id: &str, flag_version: i32) {
        let path = flag_path(tenant_id, group_id);

        let group = match self.groups.get_group(tenant_id, group_id) {
            Ok(group) => group,
            Err(e) => {
                error!(tenant = tenant_id, group = group_id, error = %e, "group load failed");
                return;
            }
        };
        let Some(mut group) = group else {
            info!(tenant = tenant_id, group = group_id, "group gone, clearing flag");
            self.clear_flag(&path, None).await;
            return;
        };
        if group.status == GroupStatus::Paused {
            debug!(tenant = tenant_id, group = group_id, "group paused, clearing flag");
            self.clear_flag(&path, None).await;
            return;
        }

        let observed = match self.gatherer.gather_group_state(group_id, &group.desired).await {
            Ok(observed) => observed,
            Err(e) => {
                // The flag stays; the next sweep retries.
                error!(tenant = tenant_id, group = group_id, error = %e, "gather failed, aborting cycle");
                return;
            }
        };

        let steps = self.plan_for(&group.desired, &observed);
        let outcome = execute_steps(Arc::clone(&self.client), steps, self.limits).await;
        if !outcome.continuations.is_empty() {
            // Recomputed from scratch by the next cycle's plan.
            debug!(pending = outcome.continuations.len(), "partial step results");
        }

        match outcome.result {
            StepResult::Success => {
                let fresh = match self.gatherer.gather_group_state(group_id, &group.desired).await {
                    Ok(fresh) => fresh,
                    Err(e) => {
                        warn!(tenant = tenant_id, group = group_id, error = %e, "post-cycle gather failed");
                        return;
                    }
                };
                let snapshot = snapshot_of(&fresh);
                if let Err(e) = self.groups.put_snapshot(tenant_id, group_id, &snapshot) {
                    error!(tenant = tenant_id, group = group_id, error = %e, "snapshot write failed");
                    return;
                }
                group.status = GroupStatus::Active;
                group.error_reasons.clear();
                group.updated_at = epoch_secs();
                if let Err(e) = self.groups.put_group(&group) {
                    error!(tenant = tenant_id, group = group_id, error = %e, "group update failed");
                    return;
                }
                info!(tenant = tenant_id, group = group_id, "group converged");
                self.clear_flag(&path, Some(flag_version)).await;
            }
            StepResult::Retry | StepResult::LimitedRetry => {
                debug!(tenant = tenant_id, group = group_id, "converging again later");
            }
            StepResult::Failure => {
                group.error_reasons = present_reasons(&outcome.reasons);
                group.status = GroupStatus::Error;
                group.updated_at = epoch_secs();
                if let Err(e) = self.groups.put_group(&group) {
                    error!(tenant = tenant_id, group = group_id, error = %e, "group update failed");
                    return;
                }
                warn!(
                    tenant = tenant_id,
                    group = group_id,
                    reasons = ?group.error_reasons,
                    "convergence failed"
                );
                self.clear_flag(&path, Some(flag_version)).await;
            }
        }
    }

    fn plan_for(&self, desired: &DesiredGroupState, observed: &ObservedGroup) -> Vec<Step> {
        let now = epoch_f64();
        match desired.template {
            ServerTemplate::Stack { .. } => plan_stacks(desired, &observed.stacks, now),
            ServerTemplate::Server { .. } => plan(
                desired,
                &observed.servers,
                &observed.lb_nodes,
                now,
                self.build_timeout_secs,
            ),
        }
    }

    /// Delete the flag; `BadVersion` means the group was re-marked
    /// during the cycle and stays dirty.
    async fn clear_flag(&self, path: &str, version: Option<i32>) {
        match self.coord.delete(path, version).await {
            Ok(()) | Err(CoordError::NoNode(_)) => {}
            Err(CoordError::BadVersion { .. }) => {
                debug!(flag = %path, "re-marked during cycle, staying dirty");
            }
            Err(e) => {
                error!(flag = %path, error = %e, "flag delete failed");
            }
        }
    }

    /// Run the converge loop until shutdown.
    pub async fn run(
        self,
        mut partitioner: Partitioner,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        if let Err(e) = partitioner.join().await {
            error!(error = %e, "partition join failed");
            return;
        }
        info!(
            interval_secs = interval.as_secs(),
            buckets = partitioner.bucket_count(),
            "converger started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.sweep_once(&partitioner).await {
                        error!(error = %e, "converge sweep failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("converger shutting down");
                    break;
                }
            }
        }
        if let Err(e) = partitioner.leave().await {
            warn!(error = %e, "partition leave failed");
        }
    }
}

/// Membership in the in-flight set, released on drop even when a cycle
/// panics.
struct InFlightGuard {
    set: Arc<Mutex<HashSet<String>>>,
    key: String,
}

impl InFlightGuard {
    fn claim(set: &Arc<Mutex<HashSet<String>>>, key: &str) -> Option<Self> {
        let mut guard = match set.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !guard.insert(key.to_string()) {
            return None;
        }
        Some(InFlightGuard {
            set: Arc::clone(set),
            key: key.to_string(),
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut guard = match self.set.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.remove(&self.key);
    }
}

/// The active servers and their LB links, as observed.
fn snapshot_of(observed: &ObservedGroup) -> ActiveServersSnapshot {
    let servers = observed
        .servers
        .iter()
        .filter(|s| s.state == ServerState::Active)
        .map(|s| {
            let links: Vec<String> = observed
                .lb_nodes
                .iter()
                .filter(|n| n.attaches(&s.id, s.servicenet_address.as_deref()))
                .map(|n| n.lb_id().to_string())
                .collect();
            SnapshotServer {
                id: s.id.clone(),
                links,
            }
        })
        .collect();
    ActiveServersSnapshot {
        servers,
        taken_at: epoch_secs(),
    }
}

fn epoch_f64() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
