//! riptide-model — immutable value types for the convergence engine.
//!
//! Everything here is plain data: observed servers, load-balancer
//! descriptions and nodes, the desired state of a scaling group, and the
//! uniform step-result vocabulary. Nothing in this crate performs I/O;
//! values are constructed from gather responses and replaced (never
//! mutated) on the next gather.

pub mod group;
pub mod lb;
pub mod result;
pub mod server;
pub mod stack;

pub use group::{DesiredGroupState, ServerTemplate};
pub use lb::{
    ClbDescription, ClbNode, DrainingUnavailable, LbDescription, LbNode, NodeCondition, NodeType,
    PoolDescription, PoolNode,
};
pub use result::{ErrorReason, StepResult, present_reasons};
pub use server::{CloudServer, GROUP_ID_METADATA_KEY, ServerState};
pub use stack::{Stack, StackHealth};
