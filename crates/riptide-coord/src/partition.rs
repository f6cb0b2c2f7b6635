//! Bucket partitioner: spreads the tenant universe over converger
//! processes.
//!
//! The bucket universe is fixed (default 11). Each participant registers
//! an ephemeral sequential child under the partition path; buckets are
//! dealt round-robin over the participants sorted by child name, so
//! every participant computes the same assignment from the same
//! membership without talking to anyone. A group belongs to bucket
//! `hash(tenant_id) % bucket_count`.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{CoordError, CoordResult};
use crate::store::{CoordStore, CreateMode};

pub const DEFAULT_BUCKETS: u32 = 11;

/// The bucket a tenant's groups hash into.
pub fn bucket_of(tenant_id: &str, bucket_count: u32) -> u32 {
    let mut hasher = DefaultHasher::new();
    tenant_id.hash(&mut hasher);
    (hasher.finish() % u64::from(bucket_count)) as u32
}

/// One participant in the bucket partition.
pub struct Partitioner {
    store: Arc<dyn CoordStore>,
    path: String,
    bucket_count: u32,
    /// Our registration node, once joined.
    node: Option<String>,
}

impl Partitioner {
    pub fn new(store: Arc<dyn CoordStore>, path: impl Into<String>) -> Self {
        Partitioner {
            store,
            path: path.into(),
            bucket_count: DEFAULT_BUCKETS,
            node: None,
        }
    }

    pub fn with_buckets(mut self, bucket_count: u32) -> Self {
        self.bucket_count = bucket_count;
        self
    }

    pub fn bucket_count(&self) -> u32 {
        self.bucket_count
    }

    /// Register as a participant. Idempotent.
    pub async fn join(&mut self) -> CoordResult<()> {
        if self.node.is_some() {
            return Ok(());
        }
        self.store.ensure(&self.path).await?;
        let node = self
            .store
            .create(
                &format!("{}/p-", self.path),
                &[],
                CreateMode::EPHEMERAL_SEQUENTIAL,
            )
            .await?;
        info!(node = %node, buckets = self.bucket_count, "joined partition");
        self.node = Some(node);
        Ok(())
    }

    /// Deregister, handing our buckets back to the remaining
    /// participants on their next poll.
    pub async fn leave(&mut self) -> CoordResult<()> {
        if let Some(node) = self.node.take() {
            match self.store.delete(&node, None).await {
                Ok(()) | Err(CoordError::NoNode(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// The buckets currently dealt to this participant. Recomputed from
    /// live membership on every call; the converge loop calls this once
    /// per polling interval, which is how membership changes take
    /// effect.
    pub async fn my_buckets(&self) -> CoordResult<Vec<u32>> {
        let Some(node) = &self.node else {
            return Ok(Vec::new());
        };
        let mine = node.rsplit('/').next().unwrap_or_default().to_string();
        let mut participants = self.store.get_children(&self.path).await?;
        participants.sort();

        let Some(my_index) = participants.iter().position(|p| *p == mine) else {
            // Our registration vanished (session expired); own nothing
            // until we rejoin.
            return Ok(Vec::new());
        };

        let count = participants.len() as u32;
        let buckets: Vec<u32> = (0..self.bucket_count)
            .filter(|b| b % count == my_index as u32)
            .collect();
        debug!(?buckets, participants = count, "bucket assignment");
        Ok(buckets)
    }

    /// Whether this participant is responsible for the tenant's groups.
    pub async fn owns(&self, tenant_id: &str) -> CoordResult<bool> {
        let bucket = bucket_of(tenant_id, self.bucket_count);
        Ok(self.my_buckets().await?.contains(&bucket))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryCoordStore;

    async fn joined(store: &MemoryCoordStore) -> Partitioner {
        let mut p = Partitioner::new(Arc::new(store.session()), "/partition");
        p.join().await.unwrap();
        p
    }

    #[tokio::test]
    async fn single_participant_owns_every_bucket() {
        let store = MemoryCoordStore::new();
        let p = joined(&store).await;
        let buckets = p.my_buckets().await.unwrap();
        assert_eq!(buckets, (0..DEFAULT_BUCKETS).collect::<Vec<_>>());
        assert!(p.owns("tenant-1").await.unwrap());
    }

    #[tokio::test]
    async fn buckets_are_disjoint_and_cover_the_universe() {
        let store = MemoryCoordStore::new();
        let a = joined(&store).await;
        let b = joined(&store).await;
        let c = joined(&store).await;

        let mut all = Vec::new();
        for p in [&a, &b, &c] {
            all.extend(p.my_buckets().await.unwrap());
        }
        all.sort_unstable();
        assert_eq!(all, (0..DEFAULT_BUCKETS).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn assignment_is_deterministic_across_participants() {
        let store = MemoryCoordStore::new();
        let a = joined(&store).await;
        let b = joined(&store).await;

        // Every tenant is owned by exactly one of the two.
        for tenant in ["t1", "t2", "t3", "acme", "umbrella"] {
            let owners = [a.owns(tenant).await.unwrap(), b.owns(tenant).await.unwrap()];
            assert_eq!(owners.iter().filter(|o| **o).count(), 1, "tenant {tenant}");
        }
    }

    #[tokio::test]
    async fn leaving_redistributes_buckets() {
        let store = MemoryCoordStore::new();
        let mut a = joined(&store).await;
        let b = joined(&store).await;

        a.leave().await.unwrap();
        let buckets = b.my_buckets().await.unwrap();
        assert_eq!(buckets, (0..DEFAULT_BUCKETS).collect::<Vec<_>>());
        assert!(a.my_buckets().await.unwrap().is_empty());
    }

    #[test]
    fn bucket_of_is_stable_and_in_range() {
        let first = bucket_of("tenant-42", DEFAULT_BUCKETS);
        let second = bucket_of("tenant-42", DEFAULT_BUCKETS);
        assert_eq!(first, second);
        assert!(first < DEFAULT_BUCKETS);
    }
}
