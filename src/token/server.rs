//! Token endpoint served to the mount process on a per-volume unix socket.
//!
//! The mount process pulls `GET /token` whenever it needs a credential, so a
//! renewed lease reaches it without restarting the process.

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::net::UnixListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{TokenError, TokenSource};

#[derive(Debug, Serialize)]
struct TokenResponse {
    access_token: String,
    token_type: &'static str,
    expires_in: u64,
    expiry: String,
}

async fn token_handler(State(source): State<TokenSource>) -> Response {
    match source.token().await {
        Ok(lease) => Json(TokenResponse {
            expires_in: lease.remaining().as_secs(),
            expiry: lease.expiry.to_rfc3339(),
            access_token: lease.access_token,
            token_type: "Bearer",
        })
        .into_response(),
        Err(e) => {
            (StatusCode::BAD_GATEWAY, Json(serde_json::json!({ "error": e.to_string() })))
                .into_response()
        }
    }
}

pub fn token_router(source: TokenSource) -> Router {
    Router::new().route("/token", get(token_handler)).with_state(source)
}

/// Bind `socket` (replacing a stale one) and serve tokens until `shutdown` fires.
pub async fn serve_token_socket(
    socket: &Path,
    source: TokenSource,
    shutdown: CancellationToken,
) -> Result<JoinHandle<()>, TokenError> {
    if tokio::fs::try_exists(socket).await.unwrap_or(false) {
        tokio::fs::remove_file(socket).await?;
    }
    if let Some(parent) = socket.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let listener = UnixListener::bind(socket)?;
    let socket: PathBuf = socket.to_path_buf();
    tracing::debug!(socket = %socket.display(), "Serving token endpoint");

    Ok(tokio::spawn(async move {
        let server = axum::serve(listener, token_router(source))
            .with_graceful_shutdown(async move { shutdown.cancelled().await });
        if let Err(e) = server.await {
            tracing::warn!(socket = %socket.display(), error = %e, "Token endpoint stopped");
        }
        let _ = tokio::fs::remove_file(&socket).await;
    }))
}
