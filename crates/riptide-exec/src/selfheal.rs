//! Self-heal: periodic re-marking of every active group.
//!
//! Convergence is normally event-driven, so a group whose cloud state
//! drifts silently would stay stale forever. The self-heal sweep bounds
//! that staleness: every interval it schedules one divergence mark per
//! active group, spread evenly across the interval so the converger
//! sees a trickle instead of a thundering herd. Each sweep cancels
//! whatever the previous sweep still had scheduled.
//!
//! Exactly one process in the fleet sweeps at a time: the loop contends
//! for a lock each interval and a non-holder schedules nothing.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use riptide_coord::{CoordStore, Lock};
use riptide_state::{GroupStatus, GroupStore};

use crate::converger::Converger;
use crate::error::ExecResult;

/// Lock directory guarding the sweep.
pub const SELF_HEAL_LOCK_PATH: &str = "/selfheal/leader";

/// Schedules divergence marks for every group on a slow cycle.
pub struct SelfHeal {
    groups: GroupStore,
    converger: Converger,
    lock: Lock,
    /// Marks scheduled by the previous sweep, cancelled on the next.
    scheduled: JoinSet<()>,
}

impl SelfHeal {
    pub fn new(groups: GroupStore, converger: Converger, coord: Arc<dyn CoordStore>) -> Self {
        SelfHeal {
            groups,
            converger,
            lock: Lock::new(coord, SELF_HEAL_LOCK_PATH),
            scheduled: JoinSet::new(),
        }
    }

    /// Cancel anything still scheduled and spread fresh marks for every
    /// active group across `interval`. Groups in `Paused`, `Error` or
    /// `Deleting` status are left alone: paused means the owner asked
    /// for quiet, and an errored group stays stopped until someone
    /// intervenes. Returns how many marks were scheduled.
    pub fn schedule_sweep(&mut self, interval: Duration) -> ExecResult<usize> {
        self.scheduled.abort_all();

        let groups = self.groups.list_groups()?;
        let eligible: Vec<_> = groups
            .into_iter()
            .filter(|g| g.status == GroupStatus::Active)
            .collect();
        if eligible.is_empty() {
            return Ok(0);
        }

        let spacing = interval / eligible.len() as u32;
        let count = eligible.len();
        // Marks land at spacing, 2*spacing, ... so a sweep never fires
        // anything the instant it is scheduled.
        for (i, group) in eligible.into_iter().enumerate() {
            let converger = self.converger.clone();
            let delay = spacing * (i + 1) as u32;
            self.scheduled.spawn(async move {
                tokio::time::sleep(delay).await;
                if let Err(e) = converger.mark_dirty(&group.tenant_id, &group.group_id).await {
                    error!(
                        tenant = %group.tenant_id,
                        group = %group.group_id,
                        error = %e,
                        "self-heal mark failed"
                    );
                }
            });
        }
        debug!(groups = count, interval_secs = interval.as_secs(), "self-heal sweep scheduled");
        Ok(count)
    }

    /// Contend for the sweep lock. The holder keeps it across calls;
    /// everyone else backs off until the holder's session ends.
    async fn leads(&mut self) -> bool {
        match self.lock.try_acquire().await {
            Ok(held) => held,
            Err(e) => {
                error!(error = %e, "self-heal lock attempt failed");
                false
            }
        }
    }

    /// Run the self-heal loop until shutdown.
    pub async fn run(mut self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "self-heal started");
        loop {
            if self.leads().await {
                if let Err(e) = self.schedule_sweep(interval) {
                    error!(error = %e, "self-heal sweep failed");
                }
            } else {
                debug!("self-heal led by another process");
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {
                    info!("self-heal shutting down");
                    self.scheduled.abort_all();
                    break;
                }
            }
        }
        if let Err(e) = self.lock.release().await {
            warn!(error = %e, "self-heal lock release failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::converger::{DIVERGENT_PATH, Converger};
    use async_trait::async_trait;
    use riptide_coord::MemoryCoordStore;
    use riptide_gather::{ClientError, CloudClient};
    use riptide_model::DesiredGroupState;
    use riptide_plan::{Request, Response};
    use riptide_state::ScalingGroup;
    use serde_json::{Value, json};

    struct NullClient;

    #[async_trait]
    impl CloudClient for NullClient {
        async fn execute(&self, _request: &Request) -> Result<Response, ClientError> {
            Ok(Response {
                status: 404,
                body: Value::Null,
            })
        }
    }

    fn fixture() -> (SelfHeal, GroupStore, MemoryCoordStore) {
        let groups = GroupStore::open_in_memory().unwrap();
        let coord = MemoryCoordStore::new();
        let converger = Converger::new(
            groups.clone(),
            Arc::new(coord.clone()),
            Arc::new(NullClient),
        );
        (
            SelfHeal::new(groups.clone(), converger, Arc::new(coord.clone())),
            groups,
            coord,
        )
    }

    fn group(tenant: &str, id: &str, status: GroupStatus) -> ScalingGroup {
        let mut g = ScalingGroup::new(
            tenant,
            id,
            DesiredGroupState::new(json!({"server": {"name": "web"}}), 1),
        );
        g.status = status;
        g
    }

    #[tokio::test]
    async fn marks_only_active_groups() {
        let (mut selfheal, groups, coord) = fixture();
        groups.put_group(&group("t1", "g1", GroupStatus::Active)).unwrap();
        groups.put_group(&group("t1", "g2", GroupStatus::Error)).unwrap();
        groups.put_group(&group("t2", "g3", GroupStatus::Paused)).unwrap();
        groups.put_group(&group("t2", "g4", GroupStatus::Deleting)).unwrap();

        let scheduled = selfheal.schedule_sweep(Duration::from_millis(10)).unwrap();
        assert_eq!(scheduled, 1);

        // Wait for the spread-out marks to land.
        while selfheal.scheduled.join_next().await.is_some() {}
        let flags = coord.get_children(DIVERGENT_PATH).await.unwrap();
        assert_eq!(flags, vec!["t1_g1"]);
    }

    #[tokio::test]
    async fn errored_groups_stay_unmarked() {
        // Failure is terminal until someone intervenes; the sweep must
        // not quietly restart a stopped group.
        let (mut selfheal, groups, coord) = fixture();
        groups.put_group(&group("t1", "g1", GroupStatus::Error)).unwrap();

        assert_eq!(selfheal.schedule_sweep(Duration::from_millis(1)).unwrap(), 0);
        while selfheal.scheduled.join_next().await.is_some() {}
        assert!(coord.exists(DIVERGENT_PATH).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_store_schedules_nothing() {
        let (mut selfheal, _groups, _coord) = fixture();
        assert_eq!(selfheal.schedule_sweep(Duration::from_secs(300)).unwrap(), 0);
    }

    #[tokio::test]
    async fn a_new_sweep_cancels_the_previous_one() {
        let (mut selfheal, groups, coord) = fixture();
        groups.put_group(&group("t1", "g1", GroupStatus::Active)).unwrap();

        // First sweep spaces the single mark across an hour; it cannot
        // have fired before the second sweep aborts it.
        selfheal.schedule_sweep(Duration::from_secs(3600)).unwrap();
        selfheal.schedule_sweep(Duration::from_millis(1)).unwrap();

        while selfheal.scheduled.join_next().await.is_some() {}
        let flags = coord.get_children(DIVERGENT_PATH).await.unwrap();
        assert_eq!(flags, vec!["t1_g1"]);
    }

    #[tokio::test]
    async fn only_one_process_leads_the_sweep() {
        let (mut selfheal, _groups, coord) = fixture();
        let mut other = Lock::new(Arc::new(coord.session()), SELF_HEAL_LOCK_PATH);
        assert!(other.try_acquire().await.unwrap());

        assert!(!selfheal.leads().await);

        other.release().await.unwrap();
        assert!(selfheal.leads().await);
        // The holder keeps the lock across intervals.
        assert!(selfheal.leads().await);
    }
}
