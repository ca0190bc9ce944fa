//! gRPC protocol definitions for the remote AI service.
//!
//! The message types mirror `proto/ai_service.proto` field for field and are
//! encoded with prost. [`AiServiceClient`] is a unary tonic client for the
//! `aigate.v1.AIService` service.

use std::collections::HashMap;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Channel, Endpoint};

/// Fully-qualified service name
pub const SERVICE_NAME: &str = "aigate.v1.AIService";

/// Response status that marks a successful execution
pub const STATUS_COMPLETED: &str = "completed";

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AgentExecutionRequest {
    #[prost(string, tag = "1")]
    pub workflow_type: String,
    #[prost(string, tag = "2")]
    pub project_id: String,
    #[prost(string, tag = "3")]
    pub user_id: String,
    #[prost(string, tag = "4")]
    pub task_id: String,
    #[prost(map = "string, string", tag = "5")]
    pub parameters: HashMap<String, String>,
    #[prost(string, tag = "6")]
    pub model: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AgentExecutionResponse {
    #[prost(string, tag = "1")]
    pub status: String,
    #[prost(string, tag = "2")]
    pub result: String,
    #[prost(string, repeated, tag = "3")]
    pub errors: Vec<String>,
    #[prost(int64, tag = "4")]
    pub tokens_used: i64,
    #[prost(string, tag = "5")]
    pub model: String,
}

impl AgentExecutionResponse {
    pub fn is_completed(&self) -> bool {
        self.status == STATUS_COMPLETED
    }
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct HealthCheckRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HealthCheckResponse {
    #[prost(string, tag = "1")]
    pub status: String,
    #[prost(map = "string, string", tag = "2")]
    pub checks: HashMap<String, String>,
}

/// Unary client for `aigate.v1.AIService`
///
/// Cheap to clone; clones share the underlying channel.
#[derive(Debug, Clone)]
pub struct AiServiceClient {
    inner: tonic::client::Grpc<Channel>,
}

impl AiServiceClient {
    /// Connect to the service at `endpoint` (e.g. `http://127.0.0.1:50051`)
    pub async fn connect(endpoint: impl Into<String>) -> Result<Self, tonic::transport::Error> {
        let channel = Endpoint::from_shared(endpoint.into())?.connect().await?;
        Ok(Self::new(channel))
    }

    pub fn new(channel: Channel) -> Self {
        Self {
            inner: tonic::client::Grpc::new(channel),
        }
    }

    pub async fn execute_agent(
        &mut self,
        request: impl tonic::IntoRequest<AgentExecutionRequest>,
    ) -> Result<tonic::Response<AgentExecutionResponse>, tonic::Status> {
        self.unary(request.into_request(), "ExecuteAgent").await
    }

    pub async fn health_check(
        &mut self,
        request: impl tonic::IntoRequest<HealthCheckRequest>,
    ) -> Result<tonic::Response<HealthCheckResponse>, tonic::Status> {
        self.unary(request.into_request(), "HealthCheck").await
    }

    async fn unary<Req, Resp>(
        &mut self,
        mut request: tonic::Request<Req>,
        method: &'static str,
    ) -> Result<tonic::Response<Resp>, tonic::Status>
    where
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        self.inner
            .ready()
            .await
            .map_err(|e| tonic::Status::unavailable(format!("Service was not ready: {e}")))?;

        let path = PathAndQuery::try_from(format!("/{SERVICE_NAME}/{method}"))
            .map_err(|e| tonic::Status::internal(format!("Invalid method path: {e}")))?;
        request
            .extensions_mut()
            .insert(tonic::GrpcMethod::new(SERVICE_NAME, method));

        let codec = tonic_prost::ProstCodec::<Req, Resp>::default();
        self.inner.unary(request, path, codec).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn test_request_wire_format() {
        let mut request = AgentExecutionRequest {
            workflow_type: "outline".to_string(),
            user_id: "user-1".to_string(),
            ..Default::default()
        };
        request
            .parameters
            .insert("chapter".to_string(), "3".to_string());

        let bytes = request.encode_to_vec();
        // Field 1, wire type 2 (length-delimited)
        assert_eq!(bytes[0], 0x0a);

        let decoded = AgentExecutionRequest::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_completed_status() {
        let mut response = AgentExecutionResponse {
            status: "completed".to_string(),
            ..Default::default()
        };
        assert!(response.is_completed());

        response.status = "failed".to_string();
        assert!(!response.is_completed());
    }

    #[tokio::test]
    async fn test_connect_invalid_uri() {
        assert!(AiServiceClient::connect("not a uri").await.is_err());
    }
}
