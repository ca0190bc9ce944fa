/*!
 * Aigate CLI - Command Line Interface
 */

use aigate::{
    config::GatewayConfig,
    logging,
    quota::{BroadcastEventBus, QuotaEvent},
    remote::{GrpcAiService, SERVICE_HEALTH_CHECK},
    AiRequest, CallContext, ErrorCategory, Gateway, GatewayError, RetryingClient,
};
use aigate_core_resilience::RetryPolicy;
use aigate_observability::MetricsCollector;
use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const EXIT_SUCCESS: i32 = 0;
const EXIT_FATAL: i32 = 1;
/// Request refused by quota or an open circuit
const EXIT_REJECTED: i32 = 2;

#[derive(Parser)]
#[command(name = "aigate")]
#[command(version, about = "Resilience and quota gateway for a remote AI service", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Write JSON logs to this file instead of stdout
    #[arg(long, value_name = "FILE", global = true)]
    log: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load, validate and print the effective configuration
    CheckConfig,

    /// Call the remote health check
    Health {
        /// Remote endpoint URI (overrides the config)
        #[arg(long)]
        endpoint: Option<String>,
    },

    /// Run one request through a fully wired gateway
    Execute {
        /// Remote endpoint URI (overrides the config)
        #[arg(long)]
        endpoint: Option<String>,

        #[arg(long)]
        user: String,

        #[arg(long)]
        workflow: String,

        #[arg(long)]
        project: Option<String>,

        #[arg(long)]
        model: Option<String>,

        /// Expected token cost used for admission
        #[arg(long)]
        estimate: Option<u64>,

        /// Request parameter as key=value (repeatable)
        #[arg(long = "param", value_name = "KEY=VALUE", value_parser = parse_key_val)]
        params: Vec<(String, String)>,

        /// Overall deadline in seconds
        #[arg(long)]
        timeout: Option<u64>,
    },
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{s}'")),
    }
}

fn main() {
    let code = match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            exit_code(&e)
        }
    };
    std::process::exit(code);
}

fn exit_code(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<GatewayError>().map(GatewayError::category) {
        Some(ErrorCategory::Admission) => EXIT_REJECTED,
        _ => EXIT_FATAL,
    }
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => GatewayConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => GatewayConfig::default(),
    };
    config.logging.verbose |= cli.verbose;
    if cli.log.is_some() {
        config.logging.file = cli.log.clone();
    }

    if let Err(e) = logging::init_logging(&config.logging) {
        eprintln!("Warning: Failed to initialize logging: {}", e);
    }

    let runtime = tokio::runtime::Runtime::new().context("starting tokio runtime")?;

    match cli.command {
        Commands::CheckConfig => {
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
        Commands::Health { endpoint } => {
            if let Some(endpoint) = endpoint {
                config.remote.endpoint = endpoint;
            }
            runtime.block_on(health(&config))
        }
        Commands::Execute {
            endpoint,
            user,
            workflow,
            project,
            model,
            estimate,
            params,
            timeout,
        } => {
            if let Some(endpoint) = endpoint {
                config.remote.endpoint = endpoint;
            }
            let mut request = AiRequest::new(user, workflow);
            if let Some(project) = project {
                request = request.with_project(project);
            }
            if let Some(model) = model {
                request = request.with_model(model);
            }
            if let Some(estimate) = estimate {
                request = request.with_estimate(estimate);
            }
            for (k, v) in params {
                request = request.with_param(k, v);
            }
            runtime.block_on(execute(&config, request, timeout.map(Duration::from_secs)))
        }
    }
}

async fn health(config: &GatewayConfig) -> anyhow::Result<()> {
    let remote = GrpcAiService::connect_lazy(config.remote.endpoint.clone())?;
    let metrics = Arc::new(MetricsCollector::new(config.observability.max_latency_samples));
    let client = RetryingClient::new(
        Arc::new(remote),
        RetryPolicy::new(config.retry_config()),
        metrics.clone(),
    );

    let status = client.health_check().await;
    metrics.record_call(SERVICE_HEALTH_CHECK, status.is_ok());
    let status = status.with_context(|| format!("health check against {}", config.remote.endpoint))?;

    println!("status: {}", status.status);
    for (name, check) in &status.checks {
        println!("  {name}: {check}");
    }
    if !status.is_healthy() {
        bail!("remote service reports '{}'", status.status);
    }
    Ok(())
}

async fn execute(
    config: &GatewayConfig,
    request: AiRequest,
    timeout: Option<Duration>,
) -> anyhow::Result<()> {
    let remote = GrpcAiService::connect_lazy(config.remote.endpoint.clone())?;
    let events = Arc::new(BroadcastEventBus::default());
    let mut event_rx = events.subscribe();
    let gateway = Gateway::from_config(config, Arc::new(remote), events)?;

    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv().await {
            let QuotaEvent::Warning(w) = event;
            warn!(
                user_id = %w.user_id,
                level = w.level.as_str(),
                remaining = w.remaining_quota,
                "Quota running low"
            );
        }
    });

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, cancelling request");
            on_signal.cancel();
        }
    });

    let mut ctx = CallContext::new().with_cancel(cancel);
    if let Some(timeout) = timeout {
        ctx = ctx.with_timeout(timeout);
    }

    let result = gateway.execute(&ctx, &request).await;

    println!("{}", gateway.metrics().format_report());
    match result {
        Ok(response) => {
            if response.degraded {
                println!("(degraded response)");
            }
            println!("model: {}", response.model);
            println!("tokens used: {}", response.tokens_used);
            println!("{}", response.content);
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_val() {
        assert_eq!(
            parse_key_val("doc=abc=1").unwrap(),
            ("doc".to_string(), "abc=1".to_string())
        );
        assert!(parse_key_val("novalue").is_err());
        assert!(parse_key_val("=x").is_err());
    }

    #[test]
    fn test_cli_parses_execute() {
        let cli = Cli::try_parse_from([
            "aigate", "execute", "--user", "u1", "--workflow", "summarize", "--param", "a=b",
            "--param", "c=d",
        ])
        .unwrap();
        match cli.command {
            Commands::Execute { user, params, .. } => {
                assert_eq!(user, "u1");
                assert_eq!(params.len(), 2);
            }
            _ => panic!("expected execute"),
        }
    }

    #[test]
    fn test_admission_errors_have_their_own_exit_code() {
        let err = anyhow::Error::from(GatewayError::CircuitOpen);
        assert_eq!(exit_code(&err), EXIT_REJECTED);
        let err = anyhow::Error::from(GatewayError::Internal("x".into()));
        assert_eq!(exit_code(&err), EXIT_FATAL);
    }
}
