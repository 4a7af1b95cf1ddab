use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::FailureKind;

/// Identity of the pod a request belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodRef {
    pub namespace: String,
    pub name: String,
    pub uid: String,
}

/// Resolved options for one mount. Validated once when the request is built;
/// the helper turns them into flags without re-interpreting annotations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountOptions {
    pub read_only: bool,
    pub implicit_dirs: bool,
    pub read_ahead_kb: Option<u32>,
    /// Cache directory as seen from the helper container. `None` disables caching.
    pub cache_dir: Option<PathBuf>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    #[serde(default)]
    pub extra_flags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountRequest {
    pub volume: String,
    pub bucket: String,
    /// Mount point as seen from the helper container.
    pub mount_point: PathBuf,
    pub options: MountOptions,
    pub pod: PodRef,
    pub created_at: DateTime<Utc>,
}

impl MountRequest {
    /// Two requests describe the same mount if everything but the timestamp matches.
    pub fn same_mount(&self, other: &MountRequest) -> bool {
        self.volume == other.volume
            && self.bucket == other.bucket
            && self.mount_point == other.mount_point
            && self.options == other.options
            && self.pod == other.pod
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum MountPhase {
    /// Process spawned, mount not live yet.
    Starting,
    Running,
    Exited { exit_code: Option<i32> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountStatus {
    pub volume: String,
    pub pid: Option<u32>,
    #[serde(flatten)]
    pub phase: MountPhase,
    pub error: Option<String>,
    pub failure: Option<FailureKind>,
    pub updated_at: DateTime<Utc>,
}

impl MountStatus {
    pub fn starting(volume: &str, pid: Option<u32>) -> Self {
        Self::new(volume, pid, MountPhase::Starting, None, None)
    }

    pub fn running(volume: &str, pid: Option<u32>) -> Self {
        Self::new(volume, pid, MountPhase::Running, None, None)
    }

    pub fn exited(
        volume: &str,
        pid: Option<u32>,
        exit_code: Option<i32>,
        error: Option<String>,
        failure: Option<FailureKind>,
    ) -> Self {
        Self::new(volume, pid, MountPhase::Exited { exit_code }, error, failure)
    }

    fn new(
        volume: &str,
        pid: Option<u32>,
        phase: MountPhase,
        error: Option<String>,
        failure: Option<FailureKind>,
    ) -> Self {
        Self { volume: volume.to_string(), pid, phase, error, failure, updated_at: Utc::now() }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.phase, MountPhase::Exited { .. })
    }

    pub fn is_running(&self) -> bool {
        self.phase == MountPhase::Running && self.error.is_none()
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self.phase {
            MountPhase::Exited { exit_code } => exit_code,
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminationSignal {
    pub volume: String,
    pub reason: String,
    pub requested_at: DateTime<Utc>,
}

impl TerminationSignal {
    pub fn new(volume: &str, reason: &str) -> Self {
        Self { volume: volume.to_string(), reason: reason.to_string(), requested_at: Utc::now() }
    }
}

/// Left behind when the node daemon tore a mount down without the helper's cooperation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForcedCleanup {
    pub volume: String,
    pub reason: String,
    pub cleaned_at: DateTime<Utc>,
}

impl ForcedCleanup {
    pub fn new(volume: &str, reason: &str) -> Self {
        Self { volume: volume.to_string(), reason: reason.to_string(), cleaned_at: Utc::now() }
    }
}

/// Base credential handed over by kubelet on (re)publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseCredential {
    pub access_token: String,
    pub expiry: DateTime<Utc>,
}
