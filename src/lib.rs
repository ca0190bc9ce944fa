/*!
 * Aigate - resilience and governance gateway for a remote AI service
 *
 * Every request passes through:
 * - Per-user quota admission with a consumption ledger and low-balance events
 * - A circuit breaker guarding the remote service
 * - A retrying gRPC client with per-attempt deadlines and cancellation
 * - Call/latency metrics and a bounded request tracer
 * - An optional degraded fallback path
 *
 * ```no_run
 * use aigate::{config::GatewayConfig, quota::BroadcastEventBus, remote::GrpcAiService};
 * use aigate::{AiRequest, CallContext, Gateway};
 * use std::sync::Arc;
 *
 * # async fn example() -> Result<(), Box<dyn std::error::Error>> {
 * let config = GatewayConfig::default();
 * let remote = GrpcAiService::connect_lazy(config.remote.endpoint.clone())?;
 * let gateway = Gateway::from_config(
 *     &config,
 *     Arc::new(remote),
 *     Arc::new(BroadcastEventBus::default()),
 * )?;
 *
 * let request = AiRequest::new("user-42", "summarize").with_param("doc_id", "d-1");
 * let response = gateway.execute(&CallContext::new(), &request).await?;
 * println!("{}", response.content);
 * # Ok(())
 * # }
 * ```
 */

pub mod client;
pub mod config;
pub mod error;
pub mod executor;
pub mod gateway;
pub mod logging;
pub mod quota;
pub mod registry;
pub mod remote;

// Re-export commonly used types
pub use client::RetryingClient;
pub use config::GatewayConfig;
pub use error::{ConfigError, ErrorCategory, GatewayError, Result};
pub use executor::{Executor, StaticFallback};
pub use gateway::Gateway;
pub use registry::{ModelRegistry, ModelSpec, ProviderKind};
pub use remote::{AiRequest, AiResponse, CallContext, RemoteAiService, RpcError};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
