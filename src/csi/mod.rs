pub mod identity;
pub mod metrics;
pub mod node;
pub mod pod;
pub mod server;
pub mod state;
pub mod target;
pub mod volume_context;

pub use identity::IdentityService;
pub use metrics::CsiMetrics;
pub use node::{NodeService, ReconcileReport};
pub use pod::{KubePodLookup, PodInfo, PodLookup};
pub use server::CsiServer;
pub use state::{VolumeKey, VolumePhase, VolumeTable};
pub use target::TargetPath;
pub use volume_context::VolumeContext;

use thiserror::Error;
use tonic::Status;

use crate::error::FailureKind;
use crate::mount::MountError;
use crate::protocol::ProtocolError;

// Re-export generated proto types
pub mod proto {
    tonic::include_proto!("csi.v1");
}

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("{0}")]
    InvalidArgument(String),

    #[error("{0}")]
    FailedPrecondition(String),

    #[error("Pod {namespace}/{name} not found")]
    PodNotFound { namespace: String, name: String },

    #[error("Kubernetes API error: {0}")]
    Kube(String),

    #[error("Volume {volume} did not become ready within {waited_ms}ms")]
    PublishTimeout { volume: String, waited_ms: u64 },

    #[error("Mount of volume {volume} failed ({kind}): {message}")]
    MountFailed { volume: String, kind: FailureKind, message: String },

    #[error("Volume {0} is already published with different options")]
    Conflict(String),

    #[error(transparent)]
    Protocol(ProtocolError),

    #[error(transparent)]
    Mount(#[from] MountError),
}

impl NodeError {
    /// Taxonomy kind, for errors that map onto one.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            NodeError::PublishTimeout { .. } => Some(FailureKind::PublishTimeout),
            NodeError::MountFailed { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

impl From<ProtocolError> for NodeError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::ConflictingRequest(volume) => NodeError::Conflict(volume),
            ProtocolError::InvalidVolumeName(_) | ProtocolError::InvalidPath(_) => {
                NodeError::InvalidArgument(e.to_string())
            }
            other => NodeError::Protocol(other),
        }
    }
}

impl From<NodeError> for Status {
    fn from(e: NodeError) -> Self {
        let message = e.to_string();
        match e {
            NodeError::InvalidArgument(_) => Status::invalid_argument(message),
            NodeError::FailedPrecondition(_) => Status::failed_precondition(message),
            NodeError::PodNotFound { .. } => Status::not_found(message),
            NodeError::Kube(_) => Status::unavailable(message),
            NodeError::PublishTimeout { .. } => Status::deadline_exceeded(message),
            NodeError::MountFailed { kind: FailureKind::CredentialFailure, .. } => {
                Status::unauthenticated(message)
            }
            NodeError::MountFailed { .. } => Status::internal(message),
            NodeError::Conflict(_) => Status::already_exists(message),
            NodeError::Protocol(_) | NodeError::Mount(_) => Status::internal(message),
        }
    }
}
