//! Uplink proxy.
//!
//! A stateful WebSocket reverse proxy that hides backend churn from clients.
//!
//! # Architecture Overview
//!
//! ```text
//!                        ┌──────────────────────────────────────────────────────┐
//!                        │                    UPLINK PROXY                       │
//!                        │                                                      │
//!    Client socket       │  ┌──────────┐    ┌─────────────┐    ┌─────────────┐  │
//!    ────────────────────┼─▶│   http   │───▶│ supervisor  │───▶│  upstream   │──┼──▶ Backend
//!                        │  │ websocket│◀───│ (session    │◀───│ connection  │◀─┼─── (ws/wss)
//!                        │  └──────────┘    │  actors)    │    │ + heartbeat │  │
//!                        │                  └──────┬──────┘    └─────────────┘  │
//!                        │                         │                            │
//!                        │                         ▼                            │
//!                        │                  ┌─────────────┐    ┌─────────────┐  │
//!    Admin (bearer)      │                  │  registry   │    │   session   │  │
//!    ────────────────────┼─▶ admin ────────▶│ tiers/health│    │ buffer/subs │  │
//!                        │                  └─────────────┘    └─────────────┘  │
//!                        │                                                      │
//!                        │   config · observability · lifecycle                 │
//!                        └──────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;

use uplink_proxy::admin::{serve_admin, AdminState};
use uplink_proxy::config::{load_config, prepare_config, ProxyConfig};
use uplink_proxy::lifecycle::{signals, Shutdown};
use uplink_proxy::observability::{logging, metrics};
use uplink_proxy::upstream::TungsteniteConnector;
use uplink_proxy::{BackendRegistry, ConnectionSupervisor, HttpServer, SupervisorSettings};

#[derive(Parser, Debug)]
#[command(name = "uplink-proxy", version, about = "Stateful WebSocket reverse proxy")]
struct Args {
    /// Path to the TOML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the client listener bind address.
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => prepare_config(ProxyConfig::default())?,
    };
    if let Some(bind) = args.bind {
        config.listener.bind_address = bind;
    }

    logging::init_logging(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "uplink-proxy starting");
    tracing::info!(
        bind_address = %config.listener.bind_address,
        backends = config.backends.len(),
        default_tier = %config.registry.default_tier,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(e) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }

    let registry = Arc::new(BackendRegistry::from_config(&config)?);
    let supervisor = ConnectionSupervisor::new(
        registry,
        Arc::new(TungsteniteConnector::new()),
        SupervisorSettings::from_config(&config),
    );

    let shutdown = Shutdown::new();
    signals::spawn_signal_handler(shutdown.clone());

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening for clients");

    if config.admin.enabled {
        let admin_listener = TcpListener::bind(&config.admin.bind_address).await?;
        let state = AdminState {
            supervisor: supervisor.clone(),
            api_key: Arc::from(config.admin.api_key.as_str()),
        };
        let admin_shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_admin(admin_listener, state, admin_shutdown).await {
                tracing::error!(error = %e, "Admin listener failed");
            }
        });
    }

    HttpServer::new(supervisor).run(listener, shutdown).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
