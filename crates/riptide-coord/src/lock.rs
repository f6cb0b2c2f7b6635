//! Polling lock recipe on top of the coordination store.
//!
//! Contenders race to create an ephemeral sequential child under the
//! lock directory; whoever holds the lowest-numbered child holds the
//! lock. Waiters poll rather than watch: the converger's critical
//! sections are seconds long and a short poll interval is plenty.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{Instant, sleep};
use tracing::debug;

use crate::error::CoordError;
use crate::store::{CoordStore, CreateMode};

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock not acquired within {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Coord(#[from] CoordError),
}

/// One contender for one lock directory. Not shareable; each contender
/// makes its own `Lock`.
pub struct Lock {
    store: Arc<dyn CoordStore>,
    base_path: String,
    poll_interval: Duration,
    /// Our child node, while contending or holding.
    node: Option<String>,
}

impl Lock {
    pub fn new(store: Arc<dyn CoordStore>, base_path: impl Into<String>) -> Self {
        Lock {
            store,
            base_path: base_path.into(),
            poll_interval: Duration::from_millis(100),
            node: None,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Whether anyone (us included) currently holds or contends for this
    /// lock.
    pub async fn is_acquired_by_any(&self) -> Result<bool, LockError> {
        match self.store.get_children(&self.base_path).await {
            Ok(children) => Ok(!children.is_empty()),
            Err(CoordError::NoNode(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Take the lock if it is free right now; never waits.
    pub async fn try_acquire(&mut self) -> Result<bool, LockError> {
        self.enter_contention().await?;
        if self.holds_lowest().await? {
            Ok(true)
        } else {
            self.release().await?;
            Ok(false)
        }
    }

    /// Wait for the lock, polling, up to `timeout`.
    pub async fn acquire(&mut self, timeout: Duration) -> Result<(), LockError> {
        let deadline = Instant::now() + timeout;
        self.enter_contention().await?;
        loop {
            if self.holds_lowest().await? {
                return Ok(());
            }
            if Instant::now() >= deadline {
                self.release().await?;
                return Err(LockError::Timeout(timeout));
            }
            sleep(self.poll_interval).await;
        }
    }

    /// Leave contention, releasing the lock if held. Idempotent.
    pub async fn release(&mut self) -> Result<(), LockError> {
        if let Some(node) = self.node.take() {
            match self.store.delete(&node, None).await {
                Ok(()) | Err(CoordError::NoNode(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn enter_contention(&mut self) -> Result<(), LockError> {
        if self.node.is_some() {
            return Ok(());
        }
        self.store.ensure(&self.base_path).await?;
        let node = self
            .store
            .create(
                &format!("{}/lock-", self.base_path),
                &[],
                CreateMode::EPHEMERAL_SEQUENTIAL,
            )
            .await?;
        debug!(node = %node, "contending for lock");
        self.node = Some(node);
        Ok(())
    }

    /// Whether our child is the lowest-numbered one.
    async fn holds_lowest(&self) -> Result<bool, LockError> {
        let Some(node) = &self.node else {
            return Ok(false);
        };
        let mine = node
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();
        let mut children = self.store.get_children(&self.base_path).await?;
        children.sort();
        Ok(children.first() == Some(&mine))
    }
}
