//! redb table definitions for the group store.
//!
//! Both tables use `&str` keys and `&[u8]` values (JSON-serialized
//! domain types). Keys are `{tenant_id}/{group_id}`.

use redb::TableDefinition;

/// Scaling group definitions.
pub const GROUPS: TableDefinition<&str, &[u8]> = TableDefinition::new("groups");

/// Active-servers snapshots, written after each successful convergence
/// cycle.
pub const SERVER_SNAPSHOTS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("server_snapshots");
