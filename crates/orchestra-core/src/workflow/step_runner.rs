//! Single-attempt execution of leaf steps.
//!
//! One attempt = optional backoff sleep, then the step's action under the
//! step timeout. Attempts run as independent tasks on the execution's
//! `JoinSet` and report back an [`AttemptOutcome`]; the run loop decides what
//! happens next.

use std::sync::Arc;
use std::time::Duration;

use orchestra_types::error::WorkflowError;
use serde_json::{Value, json};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::invoker::{BoxAgentInvoker, InvocationError, InvocationRequest};

/// What a leaf step does on each attempt.
#[derive(Debug, Clone)]
pub(crate) enum StepAction {
    /// Agent and custom steps go through the invocation adapter.
    Invoke(InvocationRequest),
    /// Delay steps sleep without holding any engine resource.
    Delay(Duration),
}

impl StepAction {
    pub(crate) fn for_attempt(mut self, attempt: u32) -> Self {
        if let Self::Invoke(request) = &mut self {
            request.attempt = attempt;
        }
        self
    }

    /// Input snapshot stored on the step record.
    pub(crate) fn input_snapshot(&self) -> Value {
        match self {
            Self::Invoke(request) => request.input.clone(),
            Self::Delay(duration) => json!({ "duration_ms": duration.as_millis() as u64 }),
        }
    }
}

/// Everything a spawned attempt owns.
pub(crate) struct AttemptJob {
    pub invoker: Arc<BoxAgentInvoker>,
    pub step_id: String,
    pub attempt: u32,
    pub backoff: Duration,
    pub timeout: Duration,
    pub action: StepAction,
    pub cancel: CancellationToken,
}

/// A failed attempt and whether the retry policy may act on it.
#[derive(Debug)]
pub(crate) struct StepFailure {
    pub error: WorkflowError,
    pub retryable: bool,
}

/// Report from one finished attempt.
#[derive(Debug)]
pub(crate) struct AttemptOutcome {
    pub step_id: String,
    pub attempt: u32,
    pub result: Result<Value, StepFailure>,
    /// Time spent in the action, excluding backoff.
    pub elapsed_ms: u64,
}

/// Run one attempt to completion.
pub(crate) async fn run_attempt(job: AttemptJob) -> AttemptOutcome {
    let AttemptJob {
        invoker,
        step_id,
        attempt,
        backoff,
        timeout,
        action,
        cancel,
    } = job;

    if !backoff.is_zero() {
        let interrupted = tokio::select! {
            () = cancel.cancelled() => true,
            () = tokio::time::sleep(backoff) => false,
        };
        if interrupted {
            return AttemptOutcome {
                result: Err(cancelled(&step_id)),
                step_id,
                attempt,
                elapsed_ms: 0,
            };
        }
    }

    let started = Instant::now();
    let work = async {
        match action {
            StepAction::Invoke(request) => invoker
                .invoke(request, cancel.clone())
                .await
                .map_err(|e| invocation_failure(&step_id, e)),
            StepAction::Delay(duration) => tokio::select! {
                () = cancel.cancelled() => Err(cancelled(&step_id)),
                () = tokio::time::sleep(duration) => {
                    Ok(json!({ "delayed_ms": duration.as_millis() as u64 }))
                }
            },
        }
    };

    let result = match tokio::time::timeout(timeout, work).await {
        Ok(result) => result,
        Err(_elapsed) => Err(StepFailure {
            error: WorkflowError::Timeout {
                scope: format!("step '{step_id}'"),
                timeout_ms: timeout.as_millis() as u64,
            },
            retryable: true,
        }),
    };

    AttemptOutcome {
        elapsed_ms: started.elapsed().as_millis() as u64,
        step_id,
        attempt,
        result,
    }
}

fn cancelled(step_id: &str) -> StepFailure {
    StepFailure {
        error: WorkflowError::Cancellation(format!("step '{step_id}' was cancelled")),
        retryable: false,
    }
}

fn invocation_failure(step_id: &str, error: InvocationError) -> StepFailure {
    match error {
        InvocationError::Cancelled => cancelled(step_id),
        other => StepFailure {
            retryable: other.is_retryable(),
            error: WorkflowError::StepExecution {
                step_id: step_id.to_string(),
                message: other.to_string(),
            },
        },
    }
}
