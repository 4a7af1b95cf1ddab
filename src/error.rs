//! Failure taxonomy shared by every component.
//!
//! A [`FailureKind`] is what ends up in a `MountStatus`, in the gRPC status
//! returned to kubelet and in the warning attached to an admission response,
//! so the pod's events always name one of these kinds.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Malformed pod annotation. The pod is admitted unmodified.
    AdmissionError,
    /// The mount did not become ready in time. Retryable.
    PublishTimeout,
    /// The mount process exited on its own.
    MountProcessFailure,
    /// The credential could not be obtained or refreshed.
    CredentialFailure,
    /// The helper did not acknowledge termination within the grace period.
    UnpublishForced,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::AdmissionError => "AdmissionError",
            FailureKind::PublishTimeout => "PublishTimeout",
            FailureKind::MountProcessFailure => "MountProcessFailure",
            FailureKind::CredentialFailure => "CredentialFailure",
            FailureKind::UnpublishForced => "UnpublishForced",
        }
    }

    /// Whether the orchestrator should simply retry the call.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FailureKind::PublishTimeout)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
