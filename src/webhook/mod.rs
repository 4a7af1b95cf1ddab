//! Mutating admission webhook that adds the gcsfuse helper container to pods
//! mounting bucket volumes.

pub mod handler;
pub mod injector;

pub use injector::{AdmissionError, InjectionOutcome, InjectorConfig, inject};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    Router,
    routing::{get, post},
};
use axum_server::tls_rustls::RustlsConfig;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::WebhookConfig;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Shared state for webhook handlers
#[derive(Debug, Clone)]
pub struct WebhookState {
    pub injector: InjectorConfig,
}

impl WebhookState {
    pub fn new(injector: InjectorConfig) -> Self {
        Self { injector }
    }
}

/// - POST /mutate-pod
/// - GET /healthz
pub fn webhook_router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/mutate-pod", post(handler::mutate_handler))
        .route("/healthz", get(handler::healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the webhook over TLS until `shutdown` fires.
pub async fn serve(
    config: &WebhookConfig,
    state: Arc<WebhookState>,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .with_context(|| format!("Invalid webhook listen address {}", config.listen_addr))?;

    let tls_config = RustlsConfig::from_pem_file(&config.tls_cert_path, &config.tls_key_path)
        .await
        .with_context(|| {
            format!(
                "Failed to load TLS certificate {} and key {}",
                config.tls_cert_path.display(),
                config.tls_key_path.display()
            )
        })?;

    let handle = axum_server::Handle::new();
    tokio::spawn({
        let handle = handle.clone();
        async move {
            shutdown.cancelled().await;
            handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
        }
    });

    info!(addr = %addr, image = %state.injector.sidecar_image, "Starting admission webhook");

    axum_server::bind_rustls(addr, tls_config)
        .handle(handle)
        .serve(webhook_router(state).into_make_service())
        .await
        .context("Webhook server error")
}
