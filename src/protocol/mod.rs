//! File-based message passing between the node daemon and the in-pod helper.
//!
//! Each pod gets an emptyDir (the communication volume). Inside it every
//! volume owns one directory holding a handful of well-known records, each
//! with exactly one writer:
//!
//! ```text
//! <comm>/.volumes/<volume>/request.json     node daemon  -> helper
//! <comm>/.volumes/<volume>/status.json      helper       -> node daemon
//! <comm>/.volumes/<volume>/terminate        node daemon  -> helper
//! <comm>/.volumes/<volume>/cleanup.json     node daemon  (forced cleanup)
//! <comm>/.volumes/<volume>/credential.json  node daemon  -> helper
//! <comm>/.volumes/<volume>/mount/           helper's FUSE mount point
//! <comm>/.volumes/<volume>/token.sock       helper's token endpoint
//! ```

pub mod layout;
pub mod records;
pub mod store;

pub use layout::{CommDir, VolumeDir};
pub use records::{
    BaseCredential, ForcedCleanup, MountOptions, MountPhase, MountRequest, MountStatus, PodRef,
    TerminationSignal,
};

use thiserror::Error;

pub type ProtocolResult<T> = Result<T, ProtocolError>;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid volume name: {0:?}")]
    InvalidVolumeName(String),

    #[error("Path escapes the communication volume: {0}")]
    InvalidPath(String),

    #[error("Conflicting mount request for volume {0}")]
    ConflictingRequest(String),

    #[error("Malformed record {path}: {source}")]
    Malformed {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl ProtocolError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        ProtocolError::Io { path: path.display().to_string(), source }
    }
}
