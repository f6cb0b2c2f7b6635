//! riptide-exec — the convergence execution service.
//!
//! Where planning meets the world: `effecting` runs an optimized step
//! bag against the cloud in parallel, the `Converger` turns dirty-group
//! flags into convergence cycles, and `SelfHeal` re-marks every active
//! group on a slow sweep so drift is bounded even when no one reports
//! it.

pub mod converger;
pub mod effecting;
pub mod error;
pub mod selfheal;

pub use converger::{Converger, DIVERGENT_PATH, flag_path, parse_flag};
pub use effecting::{ExecutionOutcome, execute_steps};
pub use error::{ExecError, ExecResult};
pub use selfheal::{SELF_HEAL_LOCK_PATH, SelfHeal};
