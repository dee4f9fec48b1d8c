//! revproxy-lb - an HTTP reverse proxy and load balancer
//!
//! Usage:
//!     revproxy-lb --servers <path>
//!
//! See --help for more options.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use revproxy_lb::backend::{Algorithm, Registry};
use revproxy_lb::config::{load_config, LogFormat};
use revproxy_lb::health::HealthProber;
use revproxy_lb::metrics::{MetricsCollector, MetricsServer};
use revproxy_lb::proxy::Forwarder;
use revproxy_lb::server::ManagementListener;
use revproxy_lb::session::SessionTable;
use revproxy_lb::util::{init_logging, ShutdownSignal};
use revproxy_lb::Balancer;

const SESSION_TTL: Duration = Duration::from_secs(3600);
const SESSION_CLEANER_CADENCE: Duration = Duration::from_secs(300);
const HEALTH_PROBE_CADENCE: Duration = Duration::from_secs(30);
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// An HTTP reverse proxy and load balancer with sticky sessions and active health checks.
#[derive(Parser, Debug)]
#[command(name = "revproxy-lb")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Load-balancing algorithm
    #[arg(long, value_enum, default_value = "round_robin")]
    algorithm: Algorithm,

    /// Port the forwarding and management listener binds
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Path to the JSON server list
    #[arg(long, default_value = "servers.json")]
    servers: PathBuf,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Log output format
    #[arg(long, value_enum, default_value = "json")]
    log_format: LogFormat,

    /// Validate the server list and exit
    #[arg(long)]
    validate: bool,

    /// Port the Prometheus metrics listener binds
    #[arg(long, default_value_t = 9090)]
    metrics_port: u16,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let server_list = load_config(&cli.servers)
        .with_context(|| format!("failed to load server list from '{}'", cli.servers.display()))?;

    init_logging(cli.log_level.as_deref().unwrap_or("info"), &cli.log_format);

    if cli.validate {
        println!("Server list is valid.");
        println!("  Servers: {}", server_list.len());
        for entry in &server_list {
            println!("    - {}:{}", entry.host, entry.port);
        }
        return Ok(());
    }

    info!(
        servers_path = %cli.servers.display(),
        server_count = server_list.len(),
        algorithm = ?cli.algorithm,
        "revproxy-lb starting"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    runtime.block_on(run_async(cli, server_list))
}

async fn run_async(cli: Cli, server_list: Vec<revproxy_lb::config::ServerEntry>) -> Result<()> {
    let shutdown = ShutdownSignal::new();

    let registry = Arc::new(Registry::new());
    for entry in server_list {
        registry.register(entry.host, entry.port);
    }

    let sessions = Arc::new(SessionTable::new(SESSION_TTL));
    let metrics = MetricsCollector::new();
    let balancer = Balancer::new(Arc::clone(&registry), Arc::clone(&sessions), cli.algorithm, metrics.clone());
    let forwarder = Forwarder::new(
        Arc::clone(&registry),
        Arc::clone(balancer.selector()),
        Arc::clone(&sessions),
        metrics.clone(),
    );

    let mut handles = Vec::new();

    let prober = HealthProber::new(
        Arc::clone(&registry),
        HEALTH_PROBE_CADENCE,
        HEALTH_PROBE_TIMEOUT,
        metrics.clone(),
    );
    let shutdown_rx = shutdown.subscribe();
    handles.push(tokio::spawn(async move {
        prober.run(shutdown_rx).await;
    }));

    let cleaner_sessions = Arc::clone(&sessions);
    let shutdown_rx = shutdown.subscribe();
    handles.push(tokio::spawn(async move {
        cleaner_sessions.run_cleaner(SESSION_CLEANER_CADENCE, shutdown_rx).await;
    }));

    let metrics_address = format!("127.0.0.1:{}", cli.metrics_port).parse()?;
    let metrics_server = MetricsServer::new(metrics_address, "/metrics".to_string(), metrics.clone());
    let shutdown_rx = shutdown.subscribe();
    handles.push(tokio::spawn(async move {
        metrics_server.run(shutdown_rx).await;
    }));

    let listen_address = format!("0.0.0.0:{}", cli.port).parse()?;
    let listener = ManagementListener::bind(listen_address, balancer, forwarder)
        .await
        .with_context(|| format!("failed to bind listener on {listen_address}"))?;
    let shutdown_rx = shutdown.subscribe();
    handles.push(tokio::spawn(async move {
        listener.run(shutdown_rx).await;
    }));

    info!("revproxy-lb is running");
    info!("press Ctrl+C to stop");

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received shutdown signal"),
        Err(e) => error!(error = %e, "failed to listen for shutdown signal"),
    }

    info!("initiating graceful shutdown");
    shutdown.shutdown();

    let shutdown_timeout = Duration::from_secs(30);
    let shutdown_deadline = tokio::time::sleep(shutdown_timeout);
    tokio::pin!(shutdown_deadline);

    for (i, handle) in handles.into_iter().enumerate() {
        tokio::select! {
            result = handle => {
                if let Err(e) = result {
                    warn!(task = i, error = %e, "task panicked during shutdown");
                }
            }
            _ = &mut shutdown_deadline => {
                warn!("shutdown timeout reached, forcing exit");
                break;
            }
        }
    }

    info!("revproxy-lb shut down complete");
    Ok(())
}
