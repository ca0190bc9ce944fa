/*!
 * Remote AI service adapter
 *
 * [`RemoteAiService`] is the seam between the gateway and the transport.
 * [`GrpcAiService`] implements it over the tonic client; tests plug in
 * scripted implementations.
 */

use aigate_core_resilience::Retryable;
use aigate_observability::{generate_request_id, TraceContext};
use aigate_proto::{AgentExecutionRequest, AiServiceClient, HealthCheckRequest};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::transport::Channel;
use tonic::Code;
use tracing::{debug, warn};

/// Service name used for metrics and traces of agent execution
pub const SERVICE_EXECUTE_AGENT: &str = "ExecuteAgent";

/// Service name used for metrics and traces of health checks
pub const SERVICE_HEALTH_CHECK: &str = "HealthCheck";

/// Remote call failure
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RpcError {
    #[error("gRPC status {code:?}: {message}")]
    Status { code: Code, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("call cancelled")]
    Cancelled,

    #[error("execution failed with status {status}: {errors:?}")]
    ExecutionFailed { status: String, errors: Vec<String> },

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl RpcError {
    pub fn status(code: Code, message: impl Into<String>) -> Self {
        RpcError::Status {
            code,
            message: message.into(),
        }
    }

    /// Deadline ran out, either ours or the server's
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            RpcError::Timeout(_)
                | RpcError::Status {
                    code: Code::DeadlineExceeded,
                    ..
                }
        )
    }

    /// Rejected as malformed before or by the remote service
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            RpcError::InvalidRequest(_)
                | RpcError::Status {
                    code: Code::InvalidArgument,
                    ..
                }
        )
    }
}

impl Retryable for RpcError {
    fn is_retryable(&self) -> bool {
        match self {
            RpcError::Status { code, .. } => matches!(
                code,
                Code::Unavailable | Code::DeadlineExceeded | Code::ResourceExhausted | Code::Aborted
            ),
            RpcError::Transport(_) | RpcError::Timeout(_) => true,
            RpcError::Cancelled | RpcError::ExecutionFailed { .. } | RpcError::InvalidRequest(_) => {
                false
            }
        }
    }

    fn deadline_exceeded(after: Duration) -> Self {
        RpcError::Timeout(after)
    }

    fn cancelled() -> Self {
        RpcError::Cancelled
    }
}

impl From<tonic::Status> for RpcError {
    fn from(status: tonic::Status) -> Self {
        RpcError::Status {
            code: status.code(),
            message: status.message().to_string(),
        }
    }
}

impl From<tonic::transport::Error> for RpcError {
    fn from(err: tonic::transport::Error) -> Self {
        RpcError::Transport(err.to_string())
    }
}

/// Per-request call context
///
/// Cancelling `cancel` or passing `deadline` bounds every wait the gateway
/// performs on behalf of the request.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub request_id: String,
    pub cancel: CancellationToken,
    pub deadline: Option<Instant>,
    pub trace: TraceContext,
}

impl Default for CallContext {
    fn default() -> Self {
        Self::new()
    }
}

impl CallContext {
    pub fn new() -> Self {
        let request_id = generate_request_id();
        Self {
            trace: TraceContext::new_root().with_request(request_id.clone()),
            request_id,
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self.trace.request_id = Some(self.request_id.clone());
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_trace(mut self, trace: TraceContext) -> Self {
        self.trace = trace;
        self
    }

    /// Time left before the deadline, if one is set
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }
}

/// Request routed through the gateway
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AiRequest {
    pub user_id: String,
    pub workflow_type: String,
    pub project_id: String,
    pub task_id: String,
    pub parameters: BTreeMap<String, String>,
    /// Model ID; `None` selects the registry default
    pub model: Option<String>,
    /// Expected cost used for admission; 0 uses the configured default
    pub estimated_tokens: u64,
}

impl AiRequest {
    pub fn new(user_id: impl Into<String>, workflow_type: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            workflow_type: workflow_type.into(),
            ..Default::default()
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = project_id.into();
        self
    }

    pub fn with_estimate(mut self, tokens: u64) -> Self {
        self.estimated_tokens = tokens;
        self
    }

    /// Reject requests the remote service could never accept
    pub fn validate(&self) -> Result<(), RpcError> {
        if self.user_id.trim().is_empty() {
            return Err(RpcError::InvalidRequest("user_id is required".to_string()));
        }
        if self.workflow_type.trim().is_empty() {
            return Err(RpcError::InvalidRequest(
                "workflow_type is required".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AiResponse {
    pub content: String,
    pub tokens_used: u64,
    pub model: String,
    pub workflow_type: String,
    /// Produced by a fallback instead of the remote service
    pub degraded: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthStatus {
    pub status: String,
    pub checks: BTreeMap<String, String>,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self.status.as_str(), "healthy" | "ok" | "serving")
    }
}

/// Transport-level access to the remote AI service
#[async_trait]
pub trait RemoteAiService: Send + Sync {
    /// One attempt at executing `request`
    ///
    /// A response whose status is not `completed` is an
    /// [`RpcError::ExecutionFailed`].
    async fn execute(&self, ctx: &CallContext, request: &AiRequest) -> Result<AiResponse, RpcError>;

    async fn health_check(&self) -> Result<HealthStatus, RpcError>;
}

/// [`RemoteAiService`] over gRPC
///
/// Cheap to clone; clones share the channel.
#[derive(Debug, Clone)]
pub struct GrpcAiService {
    client: AiServiceClient,
}

impl GrpcAiService {
    pub fn new(channel: Channel) -> Self {
        Self {
            client: AiServiceClient::new(channel),
        }
    }

    /// Connect eagerly to `endpoint`
    pub async fn connect(endpoint: impl Into<String>) -> Result<Self, RpcError> {
        let client = AiServiceClient::connect(endpoint).await?;
        Ok(Self { client })
    }

    /// Build a client whose connection is established on first use
    pub fn connect_lazy(endpoint: impl Into<String>) -> Result<Self, RpcError> {
        let channel = tonic::transport::Endpoint::from_shared(endpoint.into())?.connect_lazy();
        Ok(Self::new(channel))
    }

    fn build_request(
        ctx: &CallContext,
        request: &AiRequest,
    ) -> tonic::Request<AgentExecutionRequest> {
        let message = AgentExecutionRequest {
            workflow_type: request.workflow_type.clone(),
            project_id: if request.project_id.is_empty() {
                request.user_id.clone()
            } else {
                request.project_id.clone()
            },
            user_id: request.user_id.clone(),
            task_id: request.task_id.clone(),
            parameters: request
                .parameters
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<HashMap<_, _>>(),
            model: request.model.clone().unwrap_or_default(),
        };

        let mut req = tonic::Request::new(message);
        if let Some(remaining) = ctx.remaining() {
            req.set_timeout(remaining);
        }

        let span = ctx.trace.child_span();
        for (key, value) in [
            ("traceparent", span.to_traceparent()),
            ("x-request-id", ctx.request_id.clone()),
        ] {
            match value.parse::<MetadataValue<Ascii>>() {
                Ok(value) => {
                    req.metadata_mut().insert(key, value);
                }
                Err(e) => warn!(key, error = %e, "Skipping invalid metadata value"),
            }
        }
        req
    }
}

#[async_trait]
impl RemoteAiService for GrpcAiService {
    async fn execute(&self, ctx: &CallContext, request: &AiRequest) -> Result<AiResponse, RpcError> {
        request.validate()?;
        let req = Self::build_request(ctx, request);

        debug!(
            request_id = %ctx.request_id,
            workflow = %request.workflow_type,
            "Calling remote ExecuteAgent"
        );
        let response = self.client.clone().execute_agent(req).await?.into_inner();

        if !response.is_completed() {
            return Err(RpcError::ExecutionFailed {
                status: response.status,
                errors: response.errors,
            });
        }

        Ok(AiResponse {
            content: response.result,
            tokens_used: u64::try_from(response.tokens_used).unwrap_or(0),
            model: response.model,
            workflow_type: request.workflow_type.clone(),
            degraded: false,
        })
    }

    async fn health_check(&self) -> Result<HealthStatus, RpcError> {
        let response = self
            .client
            .clone()
            .health_check(HealthCheckRequest {})
            .await?
            .into_inner();
        Ok(HealthStatus {
            status: response.status,
            checks: response.checks.into_iter().collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        for code in [
            Code::Unavailable,
            Code::DeadlineExceeded,
            Code::ResourceExhausted,
            Code::Aborted,
        ] {
            assert!(RpcError::status(code, "x").is_retryable(), "{code:?}");
        }
        for code in [
            Code::InvalidArgument,
            Code::PermissionDenied,
            Code::NotFound,
            Code::Internal,
        ] {
            assert!(!RpcError::status(code, "x").is_retryable(), "{code:?}");
        }
        assert!(!RpcError::ExecutionFailed {
            status: "failed".into(),
            errors: vec![]
        }
        .is_retryable());
        assert!(!RpcError::Cancelled.is_retryable());
    }

    #[test]
    fn test_timeout_detection() {
        assert!(RpcError::Timeout(Duration::from_secs(1)).is_timeout());
        assert!(RpcError::status(Code::DeadlineExceeded, "late").is_timeout());
        assert!(!RpcError::status(Code::Unavailable, "down").is_timeout());
    }

    #[test]
    fn test_from_status() {
        let err: RpcError = tonic::Status::invalid_argument("bad workflow").into();
        assert!(err.is_caller_error());
        assert_eq!(err, RpcError::status(Code::InvalidArgument, "bad workflow"));
    }

    #[test]
    fn test_request_validation() {
        assert!(AiRequest::new("u1", "outline").validate().is_ok());
        assert!(AiRequest::new("", "outline").validate().is_err());
        assert!(AiRequest::new("u1", " ").validate().is_err());
    }

    #[test]
    fn test_grpc_request_carries_correlation_metadata() {
        let ctx = CallContext::new()
            .with_request_id("req-abc")
            .with_timeout(Duration::from_secs(5));
        let request = AiRequest::new("u1", "outline").with_param("chapter", "2");

        let req = GrpcAiService::build_request(&ctx, &request);
        assert_eq!(
            req.metadata().get("x-request-id").unwrap().to_str().unwrap(),
            "req-abc"
        );
        let traceparent = req.metadata().get("traceparent").unwrap().to_str().unwrap();
        assert!(traceparent.contains(&ctx.trace.trace_id));
        assert!(req.metadata().get("grpc-timeout").is_some());

        let message = req.get_ref();
        assert_eq!(message.project_id, "u1");
        assert_eq!(message.parameters["chapter"], "2");
    }

    #[tokio::test]
    async fn test_context_remaining() {
        let ctx = CallContext::new();
        assert!(ctx.remaining().is_none());
        let ctx = ctx.with_timeout(Duration::from_secs(10));
        assert!(ctx.remaining().unwrap() <= Duration::from_secs(10));
    }
}
