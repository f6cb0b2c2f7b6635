//! riptide-gather — observed-state collection.
//!
//! The gatherer is pure data collection: it fetches the group's servers,
//! all load-balancer nodes, and (for stack groups) stacks from upstream,
//! concurrently, and hands the planner an `ObservedGroup`. All upstream
//! I/O goes through the `CloudClient` trait, which is the only seam
//! mocked in tests.

pub mod client;
pub mod error;
pub mod gathering;

pub use client::{CloudClient, CloudEndpoints, HttpCloudClient, retry_with_backoff};
pub use error::{ClientError, GatherError, GatherResult};
pub use gathering::{Gatherer, ObservedGroup};
