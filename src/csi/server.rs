use crate::csi::proto::{identity_server::IdentityServer, node_server::NodeServer};
use crate::csi::{IdentityService, NodeService};
use anyhow::{Context, Result};
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;

/// CSI gRPC server
pub struct CsiServer;

impl CsiServer {
    /// Filesystem path of a `unix://` endpoint.
    pub fn socket_path(addr: &str) -> Result<&Path> {
        addr.strip_prefix("unix://")
            .filter(|path| !path.is_empty())
            .map(Path::new)
            .context("Address must start with unix://")
    }

    /// Serve identity and node services until `shutdown` fires.
    pub async fn serve_node(
        identity: IdentityService,
        node: NodeService,
        addr: String,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let socket = Self::socket_path(&addr)?;

        // Remove existing socket if it exists
        if socket.exists() {
            std::fs::remove_file(socket).context("Failed to remove existing socket")?;
        }

        // Create parent directory
        if let Some(parent) = socket.parent() {
            std::fs::create_dir_all(parent).context("Failed to create socket directory")?;
        }

        // Create UDS listener
        let uds = tokio::net::UnixListener::bind(socket).context("Failed to bind Unix socket")?;
        let uds_stream = tokio_stream::wrappers::UnixListenerStream::new(uds);

        tracing::info!("CSI Node listening on {}", addr);

        Server::builder()
            .add_service(IdentityServer::new(identity))
            .add_service(NodeServer::new(node))
            .serve_with_incoming_shutdown(uds_stream, shutdown.cancelled_owned())
            .await
            .context("gRPC server error")
    }
}
