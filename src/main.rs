use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use gcsfuse_csi::config::Config;
use gcsfuse_csi::csi::metrics::metrics_router;
use gcsfuse_csi::csi::{CsiMetrics, CsiServer, IdentityService, KubePodLookup, NodeService};
use gcsfuse_csi::mount::SystemMounter;
use gcsfuse_csi::sidecar::SidecarMounter;
use gcsfuse_csi::token::TokenManager;
use gcsfuse_csi::webhook::{self, InjectorConfig, WebhookState};
use prometheus::Registry;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Sidecar mount orchestration for Cloud Storage bucket volumes
#[derive(Parser)]
#[command(name = "gcsfuse-csi")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, env = "GCSFUSE_CSI_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    #[arg(long, global = true, env = "GCSFUSE_CSI_LOG_FORMAT", value_enum, default_value = "plain")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Plain,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// CSI node plugin (DaemonSet)
    Node {
        #[arg(long, env = "NODE_ID")]
        node_id: Option<String>,

        /// CSI endpoint, e.g. unix:///csi/csi.sock
        #[arg(long)]
        endpoint: Option<String>,
    },

    /// Mount helper running inside the workload pod
    Sidecar {
        #[arg(long)]
        comm_dir: Option<PathBuf>,

        #[arg(long)]
        cache_root: Option<PathBuf>,
    },

    /// Mutating admission webhook
    Webhook,
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "gcsfuse_csi=debug,info".into());
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Plain => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
    }
}

/// Cancel on SIGTERM or Ctrl-C.
fn shutdown_token() -> Result<CancellationToken> {
    use tokio::signal::unix::{SignalKind, signal};

    let token = CancellationToken::new();
    let mut terminate = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let cancel = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = terminate.recv() => tracing::info!("Received SIGTERM"),
            _ = tokio::signal::ctrl_c() => tracing::info!("Received interrupt"),
        }
        cancel.cancel();
    });
    Ok(token)
}

async fn run_node(
    config: Config,
    node_id: Option<String>,
    endpoint: Option<String>,
    shutdown: CancellationToken,
) -> Result<()> {
    let node_id = node_id
        .or_else(|| config.node.node_id.clone())
        .context("Node id is required (--node-id or NODE_ID)")?;
    let endpoint = endpoint.unwrap_or_else(|| config.node.endpoint.clone());

    let client = kube::Client::try_default().await.context("Failed to create Kubernetes client")?;
    let pods = Arc::new(KubePodLookup::new(client, Duration::from_secs(config.node.pod_cache_ttl_secs)));

    let mut node = NodeService::new(
        node_id.clone(),
        config.node.clone(),
        config.sidecar.cache_root.clone(),
        Arc::new(SystemMounter::new()),
        pods,
    );

    if let Some(addr) = &config.node.metrics_addr {
        let registry = Arc::new(Registry::new());
        let metrics = CsiMetrics::new(registry.clone()).context("Failed to register metrics")?;
        node = node.with_metrics(Arc::new(metrics));

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind metrics address {addr}"))?;
        tracing::info!("Metrics listening on {}", addr);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, metrics_router(registry))
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
            {
                tracing::error!(error = %e, "Metrics server failed");
            }
        });
    }

    let report = node.reconcile().await.context("Failed to reconcile volumes")?;
    tracing::info!(node_id = %node_id, mounted = report.mounted, "Node plugin ready");

    CsiServer::serve_node(IdentityService::new(&config.driver.name), node, endpoint, shutdown).await
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    let shutdown = shutdown_token()?;

    match cli.command {
        Commands::Node { node_id, endpoint } => {
            tracing::info!("Starting gcsfuse CSI node plugin");
            run_node(config, node_id, endpoint, shutdown).await
        }
        Commands::Sidecar { comm_dir, cache_root } => {
            let mut sidecar = config.sidecar.clone();
            if let Some(comm_dir) = comm_dir {
                sidecar.comm_dir = comm_dir;
            }
            if let Some(cache_root) = cache_root {
                sidecar.cache_root = cache_root;
            }
            tracing::info!(comm_dir = %sidecar.comm_dir.display(), "Starting gcsfuse sidecar mounter");

            let tokens = TokenManager::new(config.token.expiry_delta());
            SidecarMounter::new(sidecar, tokens, Arc::new(SystemMounter::new()))
                .run(shutdown)
                .await
                .context("Sidecar mounter failed")
        }
        Commands::Webhook => {
            let state = Arc::new(WebhookState::new(InjectorConfig::from_config(&config)));
            webhook::serve(&config.webhook, state, shutdown).await
        }
    }
}
