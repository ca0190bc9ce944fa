/*!
 * Uniform execution capability for primary and fallback paths
 */

use crate::client::RetryingClient;
use crate::remote::{AiRequest, AiResponse, CallContext, RpcError, SERVICE_EXECUTE_AGENT};
use aigate_core_resilience::RetryFailure;
use async_trait::async_trait;

/// Something that can answer an [`AiRequest`]
///
/// The gateway calls primary and fallback executors through this trait
/// alone, so fallback strategies can change without touching it.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Service name used for metrics and traces
    fn name(&self) -> &str;

    async fn execute(
        &self,
        ctx: &CallContext,
        request: &AiRequest,
    ) -> Result<AiResponse, RetryFailure<RpcError>>;
}

#[async_trait]
impl Executor for RetryingClient {
    fn name(&self) -> &str {
        SERVICE_EXECUTE_AGENT
    }

    async fn execute(
        &self,
        ctx: &CallContext,
        request: &AiRequest,
    ) -> Result<AiResponse, RetryFailure<RpcError>> {
        self.execute_with_retry(ctx, request).await
    }
}

/// Canned degraded response
#[derive(Debug, Clone)]
pub struct StaticFallback {
    message: String,
}

impl StaticFallback {
    pub const NAME: &'static str = "fallback";

    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
impl Executor for StaticFallback {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn execute(
        &self,
        ctx: &CallContext,
        request: &AiRequest,
    ) -> Result<AiResponse, RetryFailure<RpcError>> {
        if ctx.cancel.is_cancelled() {
            return Err(RetryFailure {
                attempts: 0,
                error: RpcError::Cancelled,
            });
        }
        Ok(AiResponse {
            content: self.message.clone(),
            tokens_used: 0,
            model: Self::NAME.to_string(),
            workflow_type: request.workflow_type.clone(),
            degraded: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_static_fallback_is_degraded_and_free() {
        let fallback = StaticFallback::new("try later");
        let response = fallback
            .execute(&CallContext::new(), &AiRequest::new("u", "summarize"))
            .await
            .unwrap();

        assert!(response.degraded);
        assert_eq!(response.tokens_used, 0);
        assert_eq!(response.content, "try later");
        assert_eq!(response.workflow_type, "summarize");
    }

    #[tokio::test]
    async fn test_static_fallback_honours_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let ctx = CallContext::new().with_cancel(cancel);

        let failure = StaticFallback::new("x")
            .execute(&ctx, &AiRequest::new("u", "w"))
            .await
            .unwrap_err();
        assert_eq!(failure.error, RpcError::Cancelled);
    }
}
