//! riptide-plan — the pure heart of the convergence engine.
//!
//! `plan()` diffs a group's desired state against observed servers and
//! load-balancer nodes and returns a bag of idempotent steps. Steps are
//! plain data: each knows how to describe its upstream request and how to
//! classify the response. The optimizer merges and caps a step bag before
//! execution.
//!
//! Nothing in this crate performs I/O, suspends, or reads clocks — `now`
//! is always an argument.

pub mod planning;
pub mod steps;
pub mod transforming;

pub use planning::{
    DEFAULT_BUILD_TIMEOUT_SECS, converge_lb_state, plan, plan_stacks, remove_from_lb_with_draining,
};
pub use steps::{PoolPair, Request, Response, Service, Step, StepOutcome, UpstreamOutcome};
pub use transforming::{StepLimits, optimize};
