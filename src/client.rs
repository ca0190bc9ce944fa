/*!
 * Retrying client for the remote AI service
 */

use crate::remote::{
    AiRequest, AiResponse, CallContext, HealthStatus, RemoteAiService, RpcError,
    SERVICE_EXECUTE_AGENT, SERVICE_HEALTH_CHECK,
};
use aigate_core_resilience::{RetryFailure, RetryPolicy, Retryable};
use aigate_observability::MetricsCollector;
use std::sync::Arc;
use tracing::{debug, warn};

/// [`RemoteAiService`] wrapped in a [`RetryPolicy`]
///
/// Every retry and every timed-out attempt is counted in the metrics
/// collector under [`SERVICE_EXECUTE_AGENT`].
#[derive(Clone)]
pub struct RetryingClient {
    service: Arc<dyn RemoteAiService>,
    policy: RetryPolicy,
    metrics: Arc<MetricsCollector>,
}

impl std::fmt::Debug for RetryingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryingClient")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl RetryingClient {
    pub fn new(
        service: Arc<dyn RemoteAiService>,
        policy: RetryPolicy,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            service,
            policy,
            metrics,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Execute `request`, retrying transient failures
    ///
    /// Returns as soon as `ctx.cancel` fires or `ctx.deadline` passes,
    /// whether the client is waiting on an attempt or a backoff delay.
    pub async fn execute_with_retry(
        &self,
        ctx: &CallContext,
        request: &AiRequest,
    ) -> Result<AiResponse, RetryFailure<RpcError>> {
        if let Err(error) = request.validate() {
            return Err(RetryFailure { attempts: 0, error });
        }

        let service = &self.service;
        let metrics = &self.metrics;
        self.policy
            .execute_observed(
                &ctx.cancel,
                ctx.deadline,
                |attempt| {
                    if attempt > 0 {
                        metrics.record_retry(SERVICE_EXECUTE_AGENT);
                        debug!(request_id = %ctx.request_id, attempt, "Retrying remote call");
                    }
                    service.execute(ctx, request)
                },
                |attempt, error| {
                    if error.is_timeout() {
                        metrics.record_timeout(SERVICE_EXECUTE_AGENT);
                    }
                    if error.is_retryable() {
                        warn!(
                            request_id = %ctx.request_id,
                            attempt,
                            error = %error,
                            "Remote call attempt failed"
                        );
                    }
                },
            )
            .await
    }

    /// Single health probe bounded by the per-attempt timeout
    pub async fn health_check(&self) -> Result<HealthStatus, RpcError> {
        let timeout = self.policy.config().attempt_timeout;
        match tokio::time::timeout(timeout, self.service.health_check()).await {
            Ok(result) => result,
            Err(_) => {
                self.metrics.record_timeout(SERVICE_HEALTH_CHECK);
                Err(RpcError::Timeout(timeout))
            }
        }
    }
}
