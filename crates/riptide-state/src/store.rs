//! GroupStore — redb-backed persistence for scaling groups and
//! snapshots.
//!
//! Typed CRUD over the two tables, with both on-disk and in-memory
//! backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe group store backed by redb.
#[derive(Clone)]
pub struct GroupStore {
    db: Arc<Database>,
}

impl GroupStore {
    /// Open (or create) a persistent group store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "group store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory group store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory group store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(GROUPS).map_err(map_err!(Table))?;
        txn.open_table(SERVER_SNAPSHOTS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Groups ─────────────────────────────────────────────────────

    /// Insert or update a scaling group.
    pub fn put_group(&self, group: &ScalingGroup) -> StateResult<()> {
        let key = group.table_key();
        let value = serde_json::to_vec(group).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(GROUPS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, "group stored");
        Ok(())
    }

    /// Get a group by tenant and group id.
    pub fn get_group(&self, tenant_id: &str, group_id: &str) -> StateResult<Option<ScalingGroup>> {
        let key = group_key(tenant_id, group_id);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(GROUPS).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let group: ScalingGroup =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(group))
            }
            None => Ok(None),
        }
    }

    /// List all groups.
    pub fn list_groups(&self) -> StateResult<Vec<ScalingGroup>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(GROUPS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let group: ScalingGroup =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(group);
        }
        Ok(results)
    }

    /// List all groups for one tenant (key prefix scan).
    pub fn list_groups_for_tenant(&self, tenant_id: &str) -> StateResult<Vec<ScalingGroup>> {
        let prefix = format!("{tenant_id}/");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(GROUPS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let group: ScalingGroup =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(group);
            }
        }
        Ok(results)
    }

    /// Delete a group and its snapshot. Returns true if the group
    /// existed.
    pub fn delete_group(&self, tenant_id: &str, group_id: &str) -> StateResult<bool> {
        let key = group_key(tenant_id, group_id);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut groups = txn.open_table(GROUPS).map_err(map_err!(Table))?;
            existed = groups.remove(key.as_str()).map_err(map_err!(Write))?.is_some();
            let mut snapshots = txn.open_table(SERVER_SNAPSHOTS).map_err(map_err!(Table))?;
            snapshots.remove(key.as_str()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, existed, "group deleted");
        Ok(existed)
    }

    // ── Snapshots ──────────────────────────────────────────────────

    /// Record the active-servers snapshot for a group.
    pub fn put_snapshot(
        &self,
        tenant_id: &str,
        group_id: &str,
        snapshot: &ActiveServersSnapshot,
    ) -> StateResult<()> {
        let key = group_key(tenant_id, group_id);
        let value = serde_json::to_vec(snapshot).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(SERVER_SNAPSHOTS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, servers = snapshot.servers.len(), "snapshot stored");
        Ok(())
    }

    /// Get the latest snapshot for a group.
    pub fn get_snapshot(
        &self,
        tenant_id: &str,
        group_id: &str,
    ) -> StateResult<Option<ActiveServersSnapshot>> {
        let key = group_key(tenant_id, group_id);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SERVER_SNAPSHOTS).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let snapshot: ActiveServersSnapshot =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(snapshot))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_group(tenant: &str, group: &str) -> ScalingGroup {
        ScalingGroup::new(
            tenant,
            group,
            riptide_model::DesiredGroupState::new(json!({"flavorRef": "2"}), 3),
        )
    }

    #[test]
    fn put_get_round_trip() {
        let store = GroupStore::open_in_memory().unwrap();
        let group = test_group("t1", "g1");
        store.put_group(&group).unwrap();

        let loaded = store.get_group("t1", "g1").unwrap().unwrap();
        assert_eq!(loaded, group);
        assert!(store.get_group("t1", "missing").unwrap().is_none());
    }

    #[test]
    fn tenant_prefix_scan_is_scoped() {
        let store = GroupStore::open_in_memory().unwrap();
        store.put_group(&test_group("t1", "g1")).unwrap();
        store.put_group(&test_group("t1", "g2")).unwrap();
        store.put_group(&test_group("t2", "g1")).unwrap();

        let t1 = store.list_groups_for_tenant("t1").unwrap();
        assert_eq!(t1.len(), 2);
        assert!(t1.iter().all(|g| g.tenant_id == "t1"));
        assert_eq!(store.list_groups().unwrap().len(), 3);
    }

    #[test]
    fn delete_removes_group_and_snapshot() {
        let store = GroupStore::open_in_memory().unwrap();
        store.put_group(&test_group("t1", "g1")).unwrap();
        store
            .put_snapshot(
                "t1",
                "g1",
                &ActiveServersSnapshot {
                    servers: vec![SnapshotServer {
                        id: "s1".to_string(),
                        links: vec!["lb1".to_string()],
                    }],
                    taken_at: epoch_secs(),
                },
            )
            .unwrap();

        assert!(store.delete_group("t1", "g1").unwrap());
        assert!(store.get_group("t1", "g1").unwrap().is_none());
        assert!(store.get_snapshot("t1", "g1").unwrap().is_none());
        assert!(!store.delete_group("t1", "g1").unwrap());
    }

    #[test]
    fn snapshot_round_trip() {
        let store = GroupStore::open_in_memory().unwrap();
        let snapshot = ActiveServersSnapshot {
            servers: vec![
                SnapshotServer {
                    id: "s1".to_string(),
                    links: vec!["lb1".to_string(), "p1".to_string()],
                },
                SnapshotServer {
                    id: "s2".to_string(),
                    links: Vec::new(),
                },
            ],
            taken_at: 1000,
        };
        store.put_snapshot("t1", "g1", &snapshot).unwrap();
        assert_eq!(store.get_snapshot("t1", "g1").unwrap().unwrap(), snapshot);
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("groups.redb");

        {
            let store = GroupStore::open(&path).unwrap();
            store.put_group(&test_group("t1", "g1")).unwrap();
        }

        let store = GroupStore::open(&path).unwrap();
        let group = store.get_group("t1", "g1").unwrap().unwrap();
        assert_eq!(group.group_id, "g1");
        assert_eq!(group.status, GroupStatus::Active);
    }
}
