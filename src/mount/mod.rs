//! Kernel mount-table access.
//!
//! Both the node daemon (bind mounts onto kubelet target paths) and the helper
//! (readiness of the FUSE mount point) go through [`Mounter`], so everything
//! above it can be exercised without privileges.

pub mod mountinfo;
pub mod system;

pub use mountinfo::MountEntry;
pub use system::SystemMounter;

use async_trait::async_trait;
#[cfg(any(test, feature = "mockall"))]
use mockall::automock;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MountError {
    #[error("Failed to mount {source_path} on {target}: {reason}")]
    Mount { source_path: PathBuf, target: PathBuf, reason: String },

    #[error("Failed to unmount {target}: {reason}")]
    Unmount { target: PathBuf, reason: String },

    #[error("Failed to read mount table: {0}")]
    MountTable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg_attr(any(test, feature = "mockall"), automock)]
#[async_trait]
pub trait Mounter: Send + Sync {
    /// Bind `source` onto `target`, read-only when asked.
    async fn bind_mount(&self, source: &Path, target: &Path, read_only: bool)
    -> Result<(), MountError>;

    /// Unmount `target`; `lazy` detaches even if the mount is busy.
    async fn unmount(&self, target: &Path, lazy: bool) -> Result<(), MountError>;

    async fn is_mount_point(&self, path: &Path) -> Result<bool, MountError>;

    async fn list_mounts(&self) -> Result<Vec<MountEntry>, MountError>;
}
