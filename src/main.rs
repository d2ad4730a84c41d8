//! Corral daemon - agent-facing control plane of a model scheduler

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use corral::agent::{AgentServer, SecurityProtocol, ServerMtlsConfig};
use corral::events::EventHub;
use corral::scheduler::SimpleScheduler;
use corral::store::InMemoryModelStore;
use corral::Error;

/// Corral - agent-facing control plane of a model scheduler
#[derive(Parser, Debug)]
#[command(name = "corral", version, about, long_about = None)]
struct Cli {
    /// Plaintext agent gRPC listener port
    #[arg(long, default_value_t = corral::DEFAULT_AGENT_PORT)]
    agent_port: u16,

    /// mTLS agent gRPC listener port
    #[arg(long, default_value_t = corral::DEFAULT_AGENT_TLS_PORT)]
    agent_tls_port: u16,

    /// Disable the plaintext listener (TLS must then be configured)
    #[arg(long)]
    no_plaintext: bool,

    /// Environment prefix for TLS material paths
    #[arg(long, default_value = corral::agent::mtls::DEFAULT_ENV_PREFIX)]
    tls_env_prefix: String,
}

#[tokio::main]
async fn main() -> corral::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let hub = Arc::new(EventHub::new());
    let store = Arc::new(InMemoryModelStore::new().with_event_hub(hub.clone()));
    let scheduler = Arc::new(SimpleScheduler::new(store.clone()));
    let server = AgentServer::new(store, scheduler, &hub);

    let tls = match SecurityProtocol::from_env(&cli.tls_env_prefix) {
        SecurityProtocol::Ssl => Some(ServerMtlsConfig::from_env(&cli.tls_env_prefix)?),
        SecurityProtocol::Plaintext => None,
    };

    server
        .start(!cli.no_plaintext, cli.agent_port, cli.agent_tls_port, tls)
        .await?;

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| Error::config(format!("waiting for shutdown signal: {e}")))?;
    tracing::info!("shutting down");
    Ok(())
}
