//! In-pod helper that turns mount requests into supervised mount processes.
//!
//! [`SidecarMounter`] scans the communication volume and runs one
//! [`supervisor`] task per requested volume. Each task owns its mount process,
//! its token endpoint and its renewal loop, so a slow or failing volume never
//! holds up a sibling.

pub mod args;
pub mod mounter;
pub mod process;
pub mod read_ahead;
pub mod supervisor;

pub use args::MountCommand;
pub use mounter::SidecarMounter;
pub use process::MountProcess;
pub use supervisor::{SupervisorContext, supervise};

use thiserror::Error;

use crate::mount::MountError;
use crate::protocol::ProtocolError;
use crate::token::TokenError;

#[derive(Error, Debug)]
pub enum SidecarError {
    #[error("Failed to spawn mount process {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to signal mount process {pid}: {reason}")]
    Signal { pid: u32, reason: String },

    #[error("Read-ahead for {mount_point} not applied: {reason}")]
    ReadAhead { mount_point: String, reason: String },

    #[error("Rejected mount request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error(transparent)]
    Mount(#[from] MountError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
