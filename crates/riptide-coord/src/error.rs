//! Coordination store errors.

use thiserror::Error;

/// Errors from coordination store operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoordError {
    #[error("no node at {0}")]
    NoNode(String),

    #[error("node already exists at {0}")]
    NodeExists(String),

    #[error("version mismatch at {path}: expected {expected}, found {actual}")]
    BadVersion {
        path: String,
        expected: i32,
        actual: i32,
    },

    #[error("node {0} has children")]
    NotEmpty(String),

    #[error("coordination store connection lost")]
    ConnectionLoss,
}

pub type CoordResult<T> = Result<T, CoordError>;
