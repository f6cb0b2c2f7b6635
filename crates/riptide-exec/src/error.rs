//! Error types for the execution service.

use thiserror::Error;

use riptide_coord::CoordError;
use riptide_gather::GatherError;
use riptide_state::StateError;

/// Errors that abort a convergence cycle.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error(transparent)]
    Coord(#[from] CoordError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Gather(#[from] GatherError),
}

pub type ExecResult<T> = Result<T, ExecError>;
