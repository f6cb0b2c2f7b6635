//! The coordination store: a versioned node tree.
//!
//! Nodes live at slash-separated paths and carry opaque bytes, a version
//! that increments on every write, and a creation id (`czxid`) that
//! totally orders creations. Sequential children get a zero-padded
//! monotonic suffix per parent; ephemeral nodes vanish when their owning
//! session expires. These are exactly the semantics the lock and
//! partitioner recipes need.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::debug;

use crate::error::{CoordError, CoordResult};

/// How a node is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CreateMode {
    /// Deleted automatically when the creating session expires.
    pub ephemeral: bool,
    /// The path gets a zero-padded monotonic suffix unique per parent.
    pub sequential: bool,
}

impl CreateMode {
    pub const PERSISTENT: CreateMode = CreateMode {
        ephemeral: false,
        sequential: false,
    };
    pub const EPHEMERAL_SEQUENTIAL: CreateMode = CreateMode {
        ephemeral: true,
        sequential: true,
    };
}

/// Metadata of one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    /// Incremented on every data write; 0 at creation.
    pub version: i32,
    /// Creation id; totally orders node creations.
    pub czxid: i64,
}

/// The coordination seam. One implementation ships (in-memory,
/// standalone mode) and doubles as the test fixture everywhere.
#[async_trait]
pub trait CoordStore: Send + Sync {
    /// Create a node, failing with `NodeExists` if the path is taken.
    /// Returns the actual path, which differs from the requested one for
    /// sequential nodes. The parent must already exist.
    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> CoordResult<String>;

    /// Create the node or overwrite its data, creating missing parents.
    /// Returns the node's version after the write, so the caller can
    /// later delete exactly the state it observed.
    async fn create_or_set(&self, path: &str, data: &[u8]) -> CoordResult<i32>;

    async fn get(&self, path: &str) -> CoordResult<(Vec<u8>, Stat)>;

    /// Child names (not full paths), sorted.
    async fn get_children(&self, path: &str) -> CoordResult<Vec<String>>;

    async fn get_children_with_stats(&self, path: &str) -> CoordResult<Vec<(String, Stat)>>;

    /// Delete a node. With `Some(version)` the delete only succeeds if
    /// the node is still at that version (`BadVersion` otherwise).
    async fn delete(&self, path: &str, version: Option<i32>) -> CoordResult<()>;

    async fn exists(&self, path: &str) -> CoordResult<Option<Stat>>;

    /// Create any missing nodes along the path, persistently.
    async fn ensure(&self, path: &str) -> CoordResult<()> {
        let mut prefix = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            prefix.push('/');
            prefix.push_str(segment);
            match self.create(&prefix, &[], CreateMode::PERSISTENT).await {
                Ok(_) | Err(CoordError::NodeExists(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct Node {
    data: Vec<u8>,
    version: i32,
    czxid: i64,
    ephemeral_owner: Option<u64>,
}

#[derive(Default)]
struct Tree {
    nodes: BTreeMap<String, Node>,
    /// Next sequential suffix, per parent path.
    counters: BTreeMap<String, u64>,
    next_zxid: i64,
}

/// The in-memory coordination store.
///
/// Cloning yields a handle to the same tree under a new session;
/// ephemerals created through a handle die with `expire_session` on that
/// handle, which is how tests simulate a participant going away.
#[derive(Clone)]
pub struct MemoryCoordStore {
    tree: Arc<Mutex<Tree>>,
    next_session: Arc<AtomicU64>,
    session_id: u64,
}

impl Default for MemoryCoordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCoordStore {
    pub fn new() -> Self {
        MemoryCoordStore {
            tree: Arc::new(Mutex::new(Tree::default())),
            next_session: Arc::new(AtomicU64::new(1)),
            session_id: 0,
        }
    }

    /// A handle to the same tree under a fresh session.
    pub fn session(&self) -> Self {
        let mut other = self.clone();
        other.session_id = self.next_session.fetch_add(1, Ordering::Relaxed);
        other
    }

    /// Drop every ephemeral node owned by this handle's session.
    pub fn expire_session(&self) {
        let mut tree = self.lock_tree();
        let doomed: Vec<String> = tree
            .nodes
            .iter()
            .filter(|(_, n)| n.ephemeral_owner == Some(self.session_id))
            .map(|(p, _)| p.clone())
            .collect();
        for path in doomed {
            debug!(%path, "ephemeral expired");
            tree.nodes.remove(&path);
        }
    }

    fn lock_tree(&self) -> std::sync::MutexGuard<'_, Tree> {
        match self.tree.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn parent_of(path: &str) -> Option<&str> {
    let idx = path.rfind('/')?;
    if idx == 0 { None } else { Some(&path[..idx]) }
}

fn child_name(parent: &str, path: &str) -> Option<String> {
    let rest = path.strip_prefix(parent)?.strip_prefix('/')?;
    if rest.is_empty() || rest.contains('/') {
        None
    } else {
        Some(rest.to_string())
    }
}

impl Tree {
    fn create(
        &mut self,
        path: &str,
        data: &[u8],
        mode: CreateMode,
        session: u64,
    ) -> CoordResult<String> {
        let actual = if mode.sequential {
            let counter = self.counters.entry(path.to_string()).or_insert(0);
            let seq = *counter;
            *counter += 1;
            format!("{path}{seq:010}")
        } else {
            path.to_string()
        };

        if self.nodes.contains_key(&actual) {
            return Err(CoordError::NodeExists(actual));
        }
        if let Some(parent) = parent_of(&actual)
            && !self.nodes.contains_key(parent)
        {
            return Err(CoordError::NoNode(parent.to_string()));
        }

        self.next_zxid += 1;
        self.nodes.insert(
            actual.clone(),
            Node {
                data: data.to_vec(),
                version: 0,
                czxid: self.next_zxid,
                ephemeral_owner: mode.ephemeral.then_some(session),
            },
        );
        Ok(actual)
    }

    fn children(&self, path: &str) -> CoordResult<Vec<(String, Stat)>> {
        if !self.nodes.contains_key(path) {
            return Err(CoordError::NoNode(path.to_string()));
        }
        Ok(self
            .nodes
            .range(path.to_string()..)
            .take_while(|(p, _)| p.starts_with(path))
            .filter_map(|(p, n)| {
                child_name(path, p).map(|name| {
                    (
                        name,
                        Stat {
                            version: n.version,
                            czxid: n.czxid,
                        },
                    )
                })
            })
            .collect())
    }
}

#[async_trait]
impl CoordStore for MemoryCoordStore {
    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> CoordResult<String> {
        self.lock_tree().create(path, data, mode, self.session_id)
    }

    async fn create_or_set(&self, path: &str, data: &[u8]) -> CoordResult<i32> {
        let mut tree = self.lock_tree();
        if let Some(node) = tree.nodes.get_mut(path) {
            node.data = data.to_vec();
            node.version += 1;
            return Ok(node.version);
        }
        // Create, materializing missing parents first.
        if let Some(parent) = parent_of(path) {
            let mut prefix = String::new();
            for segment in parent.split('/').filter(|s| !s.is_empty()) {
                prefix.push('/');
                prefix.push_str(segment);
                if !tree.nodes.contains_key(&prefix) {
                    tree.create(&prefix, &[], CreateMode::PERSISTENT, self.session_id)?;
                }
            }
        }
        tree.create(path, data, CreateMode::PERSISTENT, self.session_id)?;
        Ok(0)
    }

    async fn get(&self, path: &str) -> CoordResult<(Vec<u8>, Stat)> {
        let tree = self.lock_tree();
        let node = tree
            .nodes
            .get(path)
            .ok_or_else(|| CoordError::NoNode(path.to_string()))?;
        Ok((
            node.data.clone(),
            Stat {
                version: node.version,
                czxid: node.czxid,
            },
        ))
    }

    async fn get_children(&self, path: &str) -> CoordResult<Vec<String>> {
        Ok(self
            .lock_tree()
            .children(path)?
            .into_iter()
            .map(|(name, _)| name)
            .collect())
    }

    async fn get_children_with_stats(&self, path: &str) -> CoordResult<Vec<(String, Stat)>> {
        self.lock_tree().children(path)
    }

    async fn delete(&self, path: &str, version: Option<i32>) -> CoordResult<()> {
        let mut tree = self.lock_tree();
        let node = tree
            .nodes
            .get(path)
            .ok_or_else(|| CoordError::NoNode(path.to_string()))?;
        if let Some(expected) = version
            && node.version != expected
        {
            return Err(CoordError::BadVersion {
                path: path.to_string(),
                expected,
                actual: node.version,
            });
        }
        let child_prefix = format!("{path}/");
        if tree.nodes.keys().any(|p| p.starts_with(&child_prefix)) {
            return Err(CoordError::NotEmpty(path.to_string()));
        }
        tree.nodes.remove(path);
        Ok(())
    }

    async fn exists(&self, path: &str) -> CoordResult<Option<Stat>> {
        Ok(self.lock_tree().nodes.get(path).map(|n| Stat {
            version: n.version,
            czxid: n.czxid,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_and_get_round_trip() {
        let store = MemoryCoordStore::new();
        store.ensure("/groups").await.unwrap();
        store
            .create("/groups/a", b"hello", CreateMode::PERSISTENT)
            .await
            .unwrap();

        let (data, stat) = store.get("/groups/a").await.unwrap();
        assert_eq!(data, b"hello");
        assert_eq!(stat.version, 0);
    }

    #[tokio::test]
    async fn create_requires_parent_and_rejects_duplicates() {
        let store = MemoryCoordStore::new();
        let err = store
            .create("/missing/child", b"", CreateMode::PERSISTENT)
            .await
            .unwrap_err();
        assert_eq!(err, CoordError::NoNode("/missing".to_string()));

        store.ensure("/a").await.unwrap();
        assert_eq!(
            store.create("/a", b"", CreateMode::PERSISTENT).await,
            Err(CoordError::NodeExists("/a".to_string()))
        );
    }

    #[tokio::test]
    async fn sequential_children_get_monotonic_suffixes() {
        let store = MemoryCoordStore::new();
        store.ensure("/locks/g1").await.unwrap();
        let mode = CreateMode {
            ephemeral: false,
            sequential: true,
        };
        let first = store.create("/locks/g1/lock-", b"", mode).await.unwrap();
        let second = store.create("/locks/g1/lock-", b"", mode).await.unwrap();
        assert_eq!(first, "/locks/g1/lock-0000000000");
        assert_eq!(second, "/locks/g1/lock-0000000001");
        assert!(first < second);
    }

    #[tokio::test]
    async fn create_or_set_bumps_version() {
        let store = MemoryCoordStore::new();
        assert_eq!(store.create_or_set("/flags/t1_g1", b"").await.unwrap(), 0);
        assert_eq!(store.create_or_set("/flags/t1_g1", b"").await.unwrap(), 1);
        assert_eq!(store.create_or_set("/flags/t1_g1", b"").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn versioned_delete_detects_concurrent_writes() {
        let store = MemoryCoordStore::new();
        store.create_or_set("/flags/t1_g1", b"").await.unwrap();
        let stat = store.exists("/flags/t1_g1").await.unwrap().unwrap();

        // A re-mark lands between the read and the delete.
        store.create_or_set("/flags/t1_g1", b"").await.unwrap();

        let err = store
            .delete("/flags/t1_g1", Some(stat.version))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordError::BadVersion { .. }));
        assert!(store.exists("/flags/t1_g1").await.unwrap().is_some());

        store.delete("/flags/t1_g1", Some(1)).await.unwrap();
        assert!(store.exists("/flags/t1_g1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_refuses_nodes_with_children() {
        let store = MemoryCoordStore::new();
        store.create_or_set("/a/b", b"").await.unwrap();
        assert_eq!(
            store.delete("/a", None).await,
            Err(CoordError::NotEmpty("/a".to_string()))
        );
    }

    #[tokio::test]
    async fn children_are_direct_and_sorted() {
        let store = MemoryCoordStore::new();
        store.create_or_set("/g/b", b"").await.unwrap();
        store.create_or_set("/g/a", b"").await.unwrap();
        store.create_or_set("/g/a/nested", b"").await.unwrap();
        assert_eq!(store.get_children("/g").await.unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn ephemerals_die_with_their_session() {
        let store = MemoryCoordStore::new();
        store.ensure("/partition").await.unwrap();
        let session = store.session();
        session
            .create("/partition/p-", b"", CreateMode::EPHEMERAL_SEQUENTIAL)
            .await
            .unwrap();
        store
            .create("/partition/keep", b"", CreateMode::PERSISTENT)
            .await
            .unwrap();

        session.expire_session();
        assert_eq!(store.get_children("/partition").await.unwrap(), vec!["keep"]);
    }

    #[tokio::test]
    async fn czxid_orders_creations() {
        let store = MemoryCoordStore::new();
        store.create_or_set("/x", b"").await.unwrap();
        store.create_or_set("/y", b"").await.unwrap();
        let x = store.exists("/x").await.unwrap().unwrap();
        let y = store.exists("/y").await.unwrap().unwrap();
        assert!(x.czxid < y.czxid);
    }
}
