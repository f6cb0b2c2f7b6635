//! riptide-state — embedded group store.
//!
//! Backed by [redb](https://docs.rs/redb); holds scaling group
//! definitions and the active-servers snapshot taken after each
//! successful convergence cycle. Values are JSON-serialized into redb's
//! `&[u8]` value columns; keys are `{tenant_id}/{group_id}` so a
//! tenant's groups are one prefix scan.
//!
//! The `GroupStore` is `Clone` + `Send` + `Sync` (backed by
//! `Arc<Database>`) and is shared across the converger tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::GroupStore;
pub use types::*;
