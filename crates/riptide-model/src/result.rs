//! Step results and error reasons.
//!
//! Every step execution reduces to a `(StepResult, Vec<ErrorReason>)`
//! pair — the uniform vocabulary for "how did this unit of work go and
//! why". Results aggregate across a step bag with `Failure` dominating.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Terminal-ness classification of a step outcome, independent of the
/// step type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepResult {
    /// Effect fully confirmed; nothing more to do for this step.
    Success,
    /// Try again on the next full convergence cycle.
    Retry,
    /// Retry, but only a bounded number of times.
    LimitedRetry,
    /// Do not retry; convergence for this group must stop until external
    /// intervention.
    Failure,
}

impl StepResult {
    /// Severity for aggregation: failure dominates, then the retry
    /// family, then success.
    fn severity(&self) -> u8 {
        match self {
            StepResult::Success => 0,
            StepResult::Retry => 1,
            StepResult::LimitedRetry => 2,
            StepResult::Failure => 3,
        }
    }

    /// Combine the results of a whole step bag: any `Failure` wins, else
    /// any retry-class result, else `Success`. An empty bag is `Success`.
    pub fn aggregate<'a, I: IntoIterator<Item = &'a StepResult>>(results: I) -> StepResult {
        results
            .into_iter()
            .max_by_key(|r| r.severity())
            .cloned()
            .unwrap_or(StepResult::Success)
    }
}

/// Why a step was not simply "done".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ErrorReason {
    /// A captured upstream exception: a stable kind tag plus message.
    Exception { kind: String, message: String },
    /// A free-form internal reason.
    String { reason: String },
    /// Structured data for logs and diagnostics.
    Structured { data: Value },
    /// A reason already phrased for the group's owner.
    UserMessage { message: String },
}

impl ErrorReason {
    pub fn string(reason: impl Into<String>) -> Self {
        ErrorReason::String {
            reason: reason.into(),
        }
    }

    pub fn exception(kind: impl Into<String>, message: impl Into<String>) -> Self {
        ErrorReason::Exception {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn user(message: impl Into<String>) -> Self {
        ErrorReason::UserMessage {
            message: message.into(),
        }
    }
}

/// Render the user-visible subset of a reason list.
///
/// `UserMessage` passes through; `Exception` is mapped through a small
/// registry of known kinds; everything unrecognized is filtered out of
/// user-facing output (it stays in structured logs).
pub fn present_reasons(reasons: &[ErrorReason]) -> Vec<String> {
    reasons.iter().filter_map(present_reason).collect()
}

fn present_reason(reason: &ErrorReason) -> Option<String> {
    match reason {
        ErrorReason::UserMessage { message } => Some(message.clone()),
        ErrorReason::Exception { kind, message } => match kind.as_str() {
            "NoSuchCLBError" => Some(format!("Cloud Load Balancer does not exist: {message}")),
            "NoSuchCLBNodeError" => {
                Some(format!("Node does not exist on load balancer: {message}"))
            }
            "CLBDeletedError" => Some(format!("Cloud Load Balancer is deleted: {message}")),
            "NoSuchPoolError" => Some(format!("Load balancer pool does not exist: {message}")),
            "CreateServerConfigurationError" => {
                Some(format!("Server launch configuration is invalid: {message}"))
            }
            "CreateServerOverQuoteError" => {
                Some(format!("Server quota exceeded: {message}"))
            }
            _ => None,
        },
        ErrorReason::String { .. } | ErrorReason::Structured { .. } => None,
    }
}
