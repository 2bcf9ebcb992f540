//! Integrity Node Main Program
//!
//! Modes:
//! 1. `--once`: run one audit cycle and print the signed snapshot
//! 2. `--compare-peer <URL>`: fetch a peer's latest snapshot and compare it with the local baseline
//! 3. `--serve`: periodic audits plus the HTTP verification API

use anyhow::{Context, Result};
use clap::Parser;
use integrity_node::api::build_router;
use integrity_node::config::{self, NodeConfig};
use integrity_node::peer_client::PeerClient;
use integrity_node::retry::RetryConfig;
use integrity_node::IntegrityService;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::Notify;
use tracing::{error, info, warn};

/// Inference Node Integrity and Audit Service
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Run a single audit cycle and print the signed snapshot
    #[arg(long, default_value_t = false)]
    once: bool,

    /// Run periodic audits and serve the HTTP API
    #[arg(short, long, default_value_t = false)]
    serve: bool,

    /// Listen address (overrides config file)
    #[arg(long)]
    listen: Option<String>,

    /// Base URL of a peer node whose latest snapshot should be compared
    #[arg(long)]
    compare_peer: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Initialize logging
    init_logging(&args.log_level)?;

    info!("Starting Integrity Node v{}", env!("CARGO_PKG_VERSION"));

    // 2. Load configuration
    let mut config = load_configuration(&args.config)?;
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    log_configuration(&config);

    // 3. Assemble service (replays persisted state, loads keys)
    let service = IntegrityService::from_config(&config).context("Failed to assemble integrity service")?;

    // 4. Run based on mode
    if args.once {
        run_once(&service).await?;
    } else if let Some(peer_url) = args.compare_peer {
        run_compare(&config, &service, &peer_url).await?;
    } else if args.serve {
        let shutdown = setup_shutdown_handler();
        run_server(&config, service, shutdown).await?;
    } else {
        error!("No operation mode specified");
        error!("   Use --once for a single audit");
        error!("   Use --compare-peer <URL> to compare with a peer");
        error!("   Use --serve to start the service");
        std::process::exit(1);
    }

    info!("Integrity node shutting down gracefully");
    Ok(())
}

/// Initialize logging system
fn init_logging(log_level: &str) -> Result<()> {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => {
            eprintln!("Unknown log level: {}, using INFO", log_level);
            tracing::Level::INFO
        }
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    Ok(())
}

/// Load configuration file, falling back to environment variables
fn load_configuration(config_path: &Path) -> Result<NodeConfig> {
    info!("Loading configuration: {}", config_path.display());

    if !config_path.exists() {
        warn!(
            "Configuration file does not exist, using defaults with {}_* overrides",
            config::ENV_PREFIX
        );
        return config::load_config_from_env().context("Failed to load configuration from environment");
    }

    config::load_config(config_path).context("Failed to load configuration")
}

fn log_configuration(config: &NodeConfig) {
    info!("   - Node identity: {}", config.node_identity);
    info!("   - Code root: {}", config.code_root.display());
    info!(
        "   - Ledger: {}",
        config
            .ledger_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "in-memory".to_string())
    );
    info!("   - Signature algorithm: {}", config.signature_algorithm);
    info!("   - Audit interval: {} seconds", config.monitor_interval_secs);
    info!("   - Trusted peers: {}", config.trusted_peers.len());
}

/// Setup graceful shutdown handling
fn setup_shutdown_handler() -> Arc<Notify> {
    let shutdown = Arc::new(Notify::new());
    let shutdown_clone = shutdown.clone();

    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C signal, preparing to shutdown...");
                shutdown_clone.notify_waiters();
            }
            Err(err) => {
                error!("Cannot listen to shutdown signal: {}", err);
            }
        }
    });

    shutdown
}

/// Execute a single audit and print the snapshot to stdout
async fn run_once(service: &Arc<IntegrityService>) -> Result<()> {
    info!("Single Audit Mode");

    let snapshot = service
        .generate_audit()
        .await
        .map_err(|e| anyhow::anyhow!("Audit failed: {}", e))?;

    let status = service.get_status().await;
    if status.open_alerts.is_empty() {
        info!("   No open alerts");
    } else {
        for alert in &status.open_alerts {
            warn!(
                "   Open alert #{} [{:?}] {} {:?}",
                alert.id, alert.severity, alert.subject, alert.kind
            );
        }
    }

    println!("{}", snapshot.to_json()?);
    Ok(())
}

/// Compare a peer's latest snapshot with the local baseline
async fn run_compare(config: &NodeConfig, service: &Arc<IntegrityService>, peer_url: &str) -> Result<()> {
    info!("Peer Comparison Mode");
    info!("   Peer: {}", peer_url);

    // A fresh node has no baseline yet; establish one before comparing
    if service.get_status().await.baseline_summary.is_empty() {
        if let Err(e) = service.generate_audit().await {
            warn!("Local audit before comparison failed: {}", e);
        }
    }

    let client = PeerClient::new(
        Duration::from_secs(config.http_timeout_secs),
        RetryConfig::conservative(),
    )?;
    let document = client
        .fetch_latest_report(peer_url)
        .await
        .context("Failed to fetch peer report")?;

    let result = service.compare_with(&document).await?;
    if result.consistent {
        info!("   Peer {} is consistent", result.peer_node_identity);
    } else {
        warn!("   Peer {} is inconsistent:", result.peer_node_identity);
        for issue in &result.issues {
            warn!("     - {}", issue);
        }
    }

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

/// Periodic audits plus the HTTP API until shutdown
async fn run_server(config: &NodeConfig, service: Arc<IntegrityService>, shutdown: Arc<Notify>) -> Result<()> {
    info!("Service Mode");
    info!("   Listening on {}", config.listen_addr);

    let periodic = service.spawn_periodic(
        Duration::from_secs(config.monitor_interval_secs),
        shutdown.clone(),
    );

    let app = build_router(service, config.admin_token.clone());
    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.notified().await })
        .await
        .context("HTTP server failed")?;

    // A cycle in progress when the signal arrived never saw the notification
    periodic.abort();
    Ok(())
}
