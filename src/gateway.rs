/*!
 * Gateway facade
 *
 * Request flow for [`Gateway::execute`]:
 *
 * ```text
 * validate → resolve model → quota check → breaker admission
 *     → (pre-debit) → trace → executor (retries inside)
 *     → success: breaker/metrics/trace, settle quota
 *     → failure: breaker/metrics/trace, restore pre-debit, optional fallback
 * ```
 */

use crate::client::RetryingClient;
use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::executor::{Executor, StaticFallback};
use crate::quota::{EventBus, InMemoryCache, InMemoryQuotaRepository, QuotaService};
use crate::registry::{ModelRegistry, ModelSpec, ProviderKind};
use crate::remote::{AiRequest, AiResponse, CallContext, RemoteAiService, RpcError};
use aigate_core_resilience::{CircuitBreaker, RetryFailure, RetryPolicy};
use aigate_observability::{MetricsCollector, PrometheusExporter, TraceStatus, Tracer};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Single entry point composing admission control, resilience and
/// observability around an [`Executor`]
pub struct Gateway {
    executors: HashMap<ProviderKind, Arc<dyn Executor>>,
    fallback: Option<Arc<dyn Executor>>,
    fallback_on_error: bool,
    breaker: CircuitBreaker,
    quota: Option<Arc<QuotaService>>,
    pre_debit: bool,
    default_estimate: u64,
    registry: Arc<ModelRegistry>,
    metrics: Arc<MetricsCollector>,
    tracer: Arc<Tracer>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("providers", &self.executors.keys().collect::<Vec<_>>())
            .field("fallback", &self.fallback.is_some())
            .field("breaker", &self.breaker.name())
            .field("quota", &self.quota.is_some())
            .field("pre_debit", &self.pre_debit)
            .finish_non_exhaustive()
    }
}

impl Gateway {
    /// Gateway with `primary` serving [`ProviderKind::Remote`] models
    pub fn new(
        primary: Arc<dyn Executor>,
        breaker: CircuitBreaker,
        metrics: Arc<MetricsCollector>,
        tracer: Arc<Tracer>,
    ) -> Self {
        let mut executors = HashMap::new();
        executors.insert(ProviderKind::Remote, primary);
        Self {
            executors,
            fallback: None,
            fallback_on_error: false,
            breaker,
            quota: None,
            pre_debit: false,
            default_estimate: 1,
            registry: Arc::new(ModelRegistry::new()),
            metrics,
            tracer,
        }
    }

    /// Wire a complete gateway from configuration
    ///
    /// Quota state lives in the in-memory repository and cache.
    pub fn from_config(
        config: &GatewayConfig,
        remote: Arc<dyn RemoteAiService>,
        events: Arc<dyn EventBus>,
    ) -> Result<Self> {
        let mut metrics = MetricsCollector::new(config.observability.max_latency_samples);
        if config.observability.prometheus {
            let exporter =
                PrometheusExporter::new().map_err(|e| GatewayError::Internal(e.to_string()))?;
            metrics = metrics.with_prometheus(exporter);
        }
        let metrics = Arc::new(metrics);
        let tracer = Arc::new(Tracer::new(config.observability.max_trace_history));

        let client = RetryingClient::new(
            remote,
            RetryPolicy::new(config.retry_config()),
            metrics.clone(),
        );
        let breaker = CircuitBreaker::new("ai-service", config.breaker_config());

        let mut gateway = Gateway::new(Arc::new(client), breaker, metrics, tracer)
            .with_registry(Arc::new(ModelRegistry::from_config(&config.models)))
            .with_default_estimate(config.quota.default_estimate);

        if config.quota.enabled {
            let quota = QuotaService::new(
                Arc::new(InMemoryQuotaRepository::new()),
                config.quota_settings(),
            )
            .with_cache(Arc::new(InMemoryCache::new()))
            .with_event_bus(events);
            gateway = gateway
                .with_quota(Arc::new(quota))
                .with_pre_debit(config.quota.pre_debit);
        }

        if config.fallback.enabled {
            gateway = gateway.with_fallback(
                Arc::new(StaticFallback::new(config.fallback.message.clone())),
                config.fallback.on_error,
            );
        }

        Ok(gateway)
    }

    /// Serve models of `kind` with `executor`
    pub fn with_executor(mut self, kind: ProviderKind, executor: Arc<dyn Executor>) -> Self {
        self.executors.insert(kind, executor);
        self
    }

    /// Degraded path taken while the circuit is open, and after failed
    /// calls too when `on_error` is set
    pub fn with_fallback(mut self, fallback: Arc<dyn Executor>, on_error: bool) -> Self {
        self.fallback = Some(fallback);
        self.fallback_on_error = on_error;
        self
    }

    pub fn with_quota(mut self, quota: Arc<QuotaService>) -> Self {
        self.quota = Some(quota);
        self
    }

    pub fn with_pre_debit(mut self, pre_debit: bool) -> Self {
        self.pre_debit = pre_debit;
        self
    }

    pub fn with_default_estimate(mut self, tokens: u64) -> Self {
        self.default_estimate = tokens;
        self
    }

    pub fn with_registry(mut self, registry: Arc<ModelRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn tracer(&self) -> &Arc<Tracer> {
        &self.tracer
    }

    pub fn quota(&self) -> Option<&Arc<QuotaService>> {
        self.quota.as_ref()
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    /// Run `request` through admission control and the resolved executor
    #[tracing::instrument(
        skip(self, ctx, request),
        fields(request_id = %ctx.request_id, user_id = %request.user_id)
    )]
    pub async fn execute(&self, ctx: &CallContext, request: &AiRequest) -> Result<AiResponse> {
        request.validate().map_err(|e| match e {
            RpcError::InvalidRequest(msg) => GatewayError::InvalidRequest(msg),
            other => GatewayError::InvalidRequest(other.to_string()),
        })?;

        let model = self
            .registry
            .resolve(request.model.as_deref())
            .ok_or_else(|| {
                GatewayError::UnknownModel(request.model.clone().unwrap_or_default())
            })?;

        let estimate = match request.estimated_tokens {
            0 => self.default_estimate,
            n => n,
        };
        if !model.admits(estimate) {
            return Err(GatewayError::InvalidRequest(format!(
                "estimate of {estimate} tokens exceeds the limit of model {}",
                model.id
            )));
        }

        let executor = self.executor_for(model.provider)?;
        let service = executor.name().to_string();

        if let Some(quota) = &self.quota {
            if let Err(e) = quota.check_quota(&request.user_id, estimate).await {
                self.metrics.record_rejection(&service);
                if e.is_admission_rejection() {
                    self.metrics.quota().record_quota_shortage(&request.user_id);
                }
                info!(service = %service, error = %e, "Request rejected by quota");
                return Err(e.into());
            }
        }

        // Only the remote provider sits behind the breaker.
        let guarded = model.provider == ProviderKind::Remote;
        if guarded && !self.breaker.allow_request().await {
            self.metrics.record_rejection(&service);
            warn!(service = %service, "Circuit open, request not sent");
            return match &self.fallback {
                Some(fallback) => self.run_fallback(fallback, ctx, request, "circuit open").await,
                None => Err(GatewayError::CircuitOpen),
            };
        }

        let mut routed = request.clone();
        routed.model = Some(model.id.clone());

        let debited = self.pre_debit(&service, &model, ctx, &routed, estimate).await?;

        let guard = self.tracer.guard(&service, &ctx.request_id);
        guard.set_metadata("user_id", routed.user_id.as_str());
        guard.set_metadata("model", model.id.as_str());
        guard.set_metadata("workflow_type", routed.workflow_type.as_str());

        let started = Instant::now();
        let outcome = executor.execute(ctx, &routed).await;
        let elapsed = started.elapsed();

        match outcome {
            Ok(response) => {
                if guarded {
                    self.breaker.record_success().await;
                }
                self.metrics.record_call(&service, true);
                self.metrics.record_latency(&service, elapsed);
                guard.set_metadata("tokens_used", response.tokens_used.to_string());
                guard.finish(TraceStatus::Success, None);

                self.settle(&service, &model, ctx, &routed, &response, debited)
                    .await;
                debug!(
                    service = %service,
                    tokens = response.tokens_used,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Request completed"
                );
                Ok(response)
            }
            Err(RetryFailure { attempts, error }) => {
                let cancelled = error == RpcError::Cancelled;
                let caller_error = error.is_caller_error();

                if guarded && !cancelled && !caller_error {
                    self.breaker.record_failure().await;
                }
                if !cancelled {
                    self.metrics.record_call(&service, false);
                }
                self.metrics.record_latency(&service, elapsed);

                let status = if cancelled {
                    TraceStatus::Cancelled
                } else if error.is_timeout() {
                    TraceStatus::Timeout
                } else {
                    TraceStatus::Failed
                };
                guard.finish(status, Some(&error));

                if debited > 0 {
                    self.restore(&routed.user_id, debited, "rollback after failed request")
                        .await;
                }

                if cancelled {
                    info!(service = %service, attempts, "Request cancelled");
                    return Err(GatewayError::Cancelled);
                }

                warn!(service = %service, attempts, error = %error, "Request failed");
                match &self.fallback {
                    Some(fallback) if self.fallback_on_error && !caller_error => {
                        self.run_fallback(fallback, ctx, request, "remote failure")
                            .await
                    }
                    _ => Err(GatewayError::Remote {
                        attempts,
                        source: error,
                    }),
                }
            }
        }
    }

    fn executor_for(&self, provider: ProviderKind) -> Result<Arc<dyn Executor>> {
        let executor = match provider {
            ProviderKind::Fallback => self
                .executors
                .get(&provider)
                .or(self.fallback.as_ref())
                .cloned(),
            _ => self.executors.get(&provider).cloned(),
        };
        executor.ok_or(GatewayError::NoExecutor(provider))
    }

    /// Debit the estimate up front; returns the amount to roll back on failure
    async fn pre_debit(
        &self,
        service: &str,
        model: &ModelSpec,
        ctx: &CallContext,
        request: &AiRequest,
        estimate: u64,
    ) -> Result<u64> {
        let Some(quota) = self.quota.as_ref().filter(|_| self.pre_debit) else {
            return Ok(0);
        };
        match quota
            .consume_quota(&request.user_id, estimate, service, &model.id, &ctx.request_id)
            .await
        {
            Ok(_) => Ok(estimate),
            Err(e) => {
                self.metrics.record_rejection(service);
                if e.is_admission_rejection() {
                    self.metrics.quota().record_quota_shortage(&request.user_id);
                }
                info!(service, error = %e, "Pre-debit rejected");
                Err(e.into())
            }
        }
    }

    /// Charge the tokens actually used, reconciling any pre-debit
    ///
    /// The response is already produced, so failures here are logged and
    /// counted as shortages rather than returned.
    async fn settle(
        &self,
        service: &str,
        model: &ModelSpec,
        ctx: &CallContext,
        request: &AiRequest,
        response: &AiResponse,
        debited: u64,
    ) {
        let Some(quota) = &self.quota else {
            return;
        };
        let used = response.tokens_used;
        let model_id = if response.model.is_empty() {
            model.id.as_str()
        } else {
            response.model.as_str()
        };

        if used > debited {
            let extra = used - debited;
            if let Err(e) = quota
                .consume_quota(&request.user_id, extra, service, model_id, &ctx.request_id)
                .await
            {
                self.metrics.quota().record_quota_shortage(&request.user_id);
                error!(
                    user_id = %request.user_id,
                    tokens = extra,
                    error = %e,
                    "Failed to charge quota for completed request"
                );
            }
        } else if used < debited {
            self.restore(&request.user_id, debited - used, "reconcile pre-debit")
                .await;
        }

        if used > 0 {
            self.metrics
                .quota()
                .record_quota_consumed(&request.user_id, service, model_id, used);
        }
    }

    async fn restore(&self, user_id: &str, amount: u64, reason: &str) {
        let Some(quota) = &self.quota else {
            return;
        };
        if let Err(e) = quota.restore_quota(user_id, amount, reason).await {
            error!(user_id, amount, error = %e, "Failed to restore quota");
        }
    }

    async fn run_fallback(
        &self,
        fallback: &Arc<dyn Executor>,
        ctx: &CallContext,
        request: &AiRequest,
        reason: &str,
    ) -> Result<AiResponse> {
        let service = fallback.name().to_string();
        let trace_id = format!("{}:fallback", ctx.request_id);
        let guard = self.tracer.guard(&service, &trace_id);
        guard.set_metadata("reason", reason);

        let started = Instant::now();
        let outcome = fallback.execute(ctx, request).await;
        self.metrics.record_latency(&service, started.elapsed());

        match outcome {
            Ok(response) => {
                self.metrics.record_call(&service, true);
                guard.finish(TraceStatus::Success, None);
                warn!(service = %service, reason, "Served degraded response");
                Ok(response)
            }
            Err(RetryFailure { error, .. }) => {
                self.metrics.record_call(&service, false);
                let status = if error == RpcError::Cancelled {
                    TraceStatus::Cancelled
                } else {
                    TraceStatus::Failed
                };
                guard.finish(status, Some(&error));
                error!(service = %service, reason, error = %error, "Fallback failed");
                Err(GatewayError::Fallback {
                    reason: reason.to_string(),
                    source: error,
                })
            }
        }
    }
}
