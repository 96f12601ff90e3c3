//! Agent invocation port.
//!
//! The engine is agnostic to what an agent does: `agent` and `custom` steps
//! are handed to an [`AgentInvoker`] supplied at construction.
//!
//! Same blanket-impl pattern as the repository ports:
//! 1. [`AgentInvoker`] uses native async fn in traits (not object-safe)
//! 2. [`AgentInvokerDyn`] is the object-safe mirror with boxed futures
//! 3. [`BoxAgentInvoker`] wraps `Box<dyn AgentInvokerDyn>` and delegates

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Which kind of step produced an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationKind {
    Agent,
    Custom,
}

/// Everything an adapter needs to run one attempt of a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationRequest {
    pub execution_id: Uuid,
    pub step_id: String,
    pub kind: InvocationKind,
    /// Agent reference or custom handler name.
    pub target: String,
    /// Step input with templates resolved.
    pub input: Value,
    /// Snapshot of the evaluation context at dispatch time.
    pub context: Value,
    /// 1-based attempt number.
    pub attempt: u32,
}

/// Errors an adapter reports back to the engine.
#[derive(Debug, Clone, thiserror::Error)]
pub enum InvocationError {
    /// Transient failure; subject to the step's retry policy.
    #[error("{0}")]
    Failed(String),

    /// The target agent or handler does not exist. Never retried.
    #[error("unknown target '{0}'")]
    UnknownTarget(String),

    /// The adapter refused the input. Never retried.
    #[error("rejected: {0}")]
    Rejected(String),

    /// The adapter honored the cancellation signal.
    #[error("invocation cancelled")]
    Cancelled,
}

impl InvocationError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// Runs agent and custom steps.
///
/// Implementations should watch `cancel` and return
/// [`InvocationError::Cancelled`] promptly once it fires; the engine waits a
/// bounded grace period for that before abandoning the attempt.
pub trait AgentInvoker: Send + Sync {
    fn invoke(
        &self,
        request: InvocationRequest,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<Value, InvocationError>> + Send;
}

/// Object-safe version of [`AgentInvoker`] with boxed futures.
pub trait AgentInvokerDyn: Send + Sync {
    fn invoke_boxed<'a>(
        &'a self,
        request: InvocationRequest,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<Value, InvocationError>> + Send + 'a>>;
}

/// Blanket implementation: any `AgentInvoker` automatically implements `AgentInvokerDyn`.
impl<T: AgentInvoker> AgentInvokerDyn for T {
    fn invoke_boxed<'a>(
        &'a self,
        request: InvocationRequest,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<Value, InvocationError>> + Send + 'a>> {
        Box::pin(self.invoke(request, cancel))
    }
}

/// Type-erased invoker injected into the coordinator.
pub struct BoxAgentInvoker {
    inner: Box<dyn AgentInvokerDyn>,
}

impl BoxAgentInvoker {
    pub fn new<T: AgentInvoker + 'static>(invoker: T) -> Self {
        Self {
            inner: Box::new(invoker),
        }
    }

    pub async fn invoke(
        &self,
        request: InvocationRequest,
        cancel: CancellationToken,
    ) -> Result<Value, InvocationError> {
        self.inner.invoke_boxed(request, cancel).await
    }
}

impl std::fmt::Debug for BoxAgentInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxAgentInvoker").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    impl AgentInvoker for Echo {
        async fn invoke(
            &self,
            request: InvocationRequest,
            cancel: CancellationToken,
        ) -> Result<Value, InvocationError> {
            if cancel.is_cancelled() {
                return Err(InvocationError::Cancelled);
            }
            match request.target.as_str() {
                "echo" => Ok(json!({ "echo": request.input, "attempt": request.attempt })),
                other => Err(InvocationError::UnknownTarget(other.to_string())),
            }
        }
    }

    fn request(target: &str) -> InvocationRequest {
        InvocationRequest {
            execution_id: Uuid::now_v7(),
            step_id: "s".into(),
            kind: InvocationKind::Agent,
            target: target.into(),
            input: json!({ "n": 1 }),
            context: json!({}),
            attempt: 2,
        }
    }

    #[tokio::test]
    async fn boxed_invoker_delegates() {
        let invoker = BoxAgentInvoker::new(Echo);
        let out = invoker
            .invoke(request("echo"), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out, json!({ "echo": { "n": 1 }, "attempt": 2 }));
    }

    #[tokio::test]
    async fn boxed_invoker_propagates_errors() {
        let invoker = BoxAgentInvoker::new(Echo);
        let err = invoker
            .invoke(request("ghost"), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, InvocationError::UnknownTarget(ref t) if t == "ghost"));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn cancelled_token_is_visible_to_adapter() {
        let invoker = BoxAgentInvoker::new(Echo);
        let token = CancellationToken::new();
        token.cancel();
        let err = invoker.invoke(request("echo"), token).await.unwrap_err();
        assert!(matches!(err, InvocationError::Cancelled));
    }

    #[test]
    fn only_transient_failures_retry() {
        assert!(InvocationError::Failed("boom".into()).is_retryable());
        assert!(!InvocationError::Rejected("bad".into()).is_retryable());
        assert!(!InvocationError::Cancelled.is_retryable());
    }
}
