//! Running an optimized step bag against the cloud.
//!
//! Every step's request is spawned into a `JoinSet` and awaited
//! together; one step failing never cancels the rest. Each response is
//! interpreted by its own step, then the per-step results collapse into
//! one cycle verdict by severity.

use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, warn};

use riptide_model::result::{ErrorReason, StepResult};
use riptide_plan::{Step, StepLimits, StepOutcome, UpstreamOutcome, optimize};

use riptide_gather::CloudClient;

/// The collapsed result of one execution pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutcome {
    pub result: StepResult,
    pub reasons: Vec<ErrorReason>,
    /// Steps covering the still-unsatisfied parts of partially-applied
    /// steps, to run next cycle.
    pub continuations: Vec<Step>,
}

/// Optimize and execute a step bag, in parallel, and aggregate.
pub async fn execute_steps(
    client: Arc<dyn CloudClient>,
    steps: Vec<Step>,
    limits: StepLimits,
) -> ExecutionOutcome {
    let optimized = optimize(steps, limits);
    let mut outcomes: Vec<StepOutcome> = Vec::new();
    let mut tasks: JoinSet<StepOutcome> = JoinSet::new();

    for step in optimized {
        if let Some(outcome) = step.synthetic_outcome() {
            outcomes.push(outcome);
            continue;
        }
        let Some(request) = step.to_request() else {
            continue;
        };
        let client = Arc::clone(&client);
        tasks.spawn(async move {
            let outcome = match client.execute(&request).await {
                Ok(response) => UpstreamOutcome::Response(response),
                Err(e) => UpstreamOutcome::Transport(e.to_string()),
            };
            step.interpret(&outcome)
        });
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(outcome) => outcomes.push(outcome),
            Err(e) => {
                warn!(error = %e, "step task failed");
                outcomes.push(StepOutcome {
                    result: StepResult::Retry,
                    reasons: vec![ErrorReason::exception("TaskError", e.to_string())],
                    continuation: None,
                });
            }
        }
    }

    let mut result = StepResult::aggregate(outcomes.iter().map(|o| &o.result));
    let reasons: Vec<ErrorReason> = outcomes.iter().flat_map(|o| o.reasons.clone()).collect();
    let continuations: Vec<Step> = outcomes
        .into_iter()
        .filter_map(|o| o.continuation)
        .collect();
    if result == StepResult::Success && !continuations.is_empty() {
        result = StepResult::Retry;
    }

    debug!(?result, reasons = reasons.len(), continuations = continuations.len(), "executed step bag");
    ExecutionOutcome {
        result,
        reasons,
        continuations,
    }
}
