//! Error types for upstream calls and gathering.

use thiserror::Error;

/// Errors from a single upstream HTTP call.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request failed: {0}")]
    Request(String),

    #[error("invalid response body: {0}")]
    Body(String),

    #[error("unexpected status {status}: {message}")]
    Status { status: u16, message: String },
}

/// Errors that abort a gather (and therefore the whole cycle).
#[derive(Debug, Error)]
pub enum GatherError {
    #[error("upstream call failed after retries: {0}")]
    Upstream(#[from] ClientError),

    #[error("malformed upstream payload: {0}")]
    Payload(String),
}

pub type GatherResult<T> = Result<T, GatherError>;
