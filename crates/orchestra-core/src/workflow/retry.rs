//! Retry and backoff policy evaluation.
//!
//! Stateless: the coordinator tracks attempts and asks [`RetryEvaluator`]
//! what to do after each failure.

use std::time::Duration;

use orchestra_types::config::EngineConfig;
use orchestra_types::workflow::{BackoffKind, RetryPolicy, WorkflowDefinition, WorkflowStep};

/// Outcome of consulting the retry policy after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Start the next attempt after this delay.
    RetryAfter(Duration),
    /// No retries left; the step fails permanently.
    Exhausted,
}

/// Stateless retry evaluator for step failures.
pub struct RetryEvaluator;

impl RetryEvaluator {
    /// Decide whether another attempt is allowed.
    ///
    /// `attempts_made` is 1-based and counts the attempt that just failed.
    /// Retries used so far are `attempts_made - 1`; while that is below
    /// `max_retries` the next delay is:
    /// - linear: `initial_delay * attempts_made`
    /// - exponential: `initial_delay * 2^(attempts_made - 1)`
    ///
    /// capped at `max_delay_ms` when set.
    pub fn evaluate(policy: &RetryPolicy, attempts_made: u32) -> RetryDecision {
        let retries_used = attempts_made.saturating_sub(1);
        if retries_used >= policy.max_retries {
            return RetryDecision::Exhausted;
        }
        RetryDecision::RetryAfter(Self::delay(policy, attempts_made))
    }

    /// Backoff delay before the attempt following `attempts_made`.
    pub fn delay(policy: &RetryPolicy, attempts_made: u32) -> Duration {
        let attempts = u64::from(attempts_made.max(1));
        let millis = match policy.backoff {
            BackoffKind::Linear => policy.initial_delay_ms.saturating_mul(attempts),
            BackoffKind::Exponential => {
                let exponent = (attempts - 1).min(63) as u32;
                policy
                    .initial_delay_ms
                    .saturating_mul(2u64.saturating_pow(exponent))
            }
        };
        let capped = policy.max_delay_ms.map_or(millis, |max| millis.min(max));
        Duration::from_millis(capped)
    }

    /// Total attempts a policy allows (initial + retries).
    pub fn max_attempts(policy: &RetryPolicy) -> u32 {
        policy.max_retries.saturating_add(1)
    }

    /// The policy that applies to a step: its own, or the definition's
    /// `max_retries` with the engine's default backoff.
    pub fn effective_policy(
        step: &WorkflowStep,
        def: &WorkflowDefinition,
        config: &EngineConfig,
    ) -> RetryPolicy {
        step.retry_policy.clone().unwrap_or_else(|| RetryPolicy {
            max_retries: def.max_retries,
            backoff: config.default_backoff,
            initial_delay_ms: config.default_initial_delay_ms,
            max_delay_ms: Some(config.default_max_delay_ms),
        })
    }
}
