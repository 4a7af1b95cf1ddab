//! Atomic reads and writes of protocol records.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;

use super::records::{
    BaseCredential, ForcedCleanup, MountRequest, MountStatus, TerminationSignal,
};
use super::{ProtocolError, ProtocolResult, VolumeDir};

/// Write `value` as JSON next to `path` and rename it into place.
pub async fn write_record<T: Serialize>(path: &Path, value: &T) -> ProtocolResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|e| ProtocolError::io(parent, e))?;
    }

    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|source| ProtocolError::Malformed { path: path.display().to_string(), source })?;

    let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("record");
    let tmp = path.with_file_name(format!(".{}.{}.tmp", file_name, std::process::id()));

    tokio::fs::write(&tmp, &bytes).await.map_err(|e| ProtocolError::io(&tmp, e))?;
    tokio::fs::rename(&tmp, path).await.map_err(|e| ProtocolError::io(path, e))
}

/// Read a JSON record, `None` if it does not exist.
pub async fn read_record<T: DeserializeOwned>(path: &Path) -> ProtocolResult<Option<T>> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(ProtocolError::io(path, e)),
    };

    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| ProtocolError::Malformed { path: path.display().to_string(), source })
}

async fn remove_if_exists(path: &Path) -> ProtocolResult<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ProtocolError::io(path, e)),
    }
}

impl VolumeDir {
    /// Write the request unless an identical one is already there.
    ///
    /// Returns `true` when a new request was written.
    pub async fn put_request(&self, request: &MountRequest) -> ProtocolResult<bool> {
        if let Some(existing) = self.read_request().await? {
            if existing.same_mount(request) {
                return Ok(false);
            }
            // A finished mount may be replaced, a live one may not.
            let live = self.read_status().await?.map(|s| !s.is_terminal()).unwrap_or(true);
            if live && !self.is_terminating().await {
                return Err(ProtocolError::ConflictingRequest(self.volume().to_string()));
            }
        }
        write_record(&self.request_path(), request).await?;
        Ok(true)
    }

    pub async fn read_request(&self) -> ProtocolResult<Option<MountRequest>> {
        read_record(&self.request_path()).await
    }

    pub async fn write_status(&self, status: &MountStatus) -> ProtocolResult<()> {
        write_record(&self.status_path(), status).await
    }

    pub async fn read_status(&self) -> ProtocolResult<Option<MountStatus>> {
        read_record(&self.status_path()).await
    }

    pub async fn write_termination(&self, signal: &TerminationSignal) -> ProtocolResult<()> {
        write_record(&self.terminate_path(), signal).await
    }

    pub async fn read_termination(&self) -> ProtocolResult<Option<TerminationSignal>> {
        read_record(&self.terminate_path()).await
    }

    pub async fn is_terminating(&self) -> bool {
        tokio::fs::try_exists(self.terminate_path()).await.unwrap_or(false)
    }

    pub async fn write_cleanup(&self, cleanup: &ForcedCleanup) -> ProtocolResult<()> {
        write_record(&self.cleanup_path(), cleanup).await
    }

    pub async fn read_cleanup(&self) -> ProtocolResult<Option<ForcedCleanup>> {
        read_record(&self.cleanup_path()).await
    }

    pub async fn write_credential(&self, credential: &BaseCredential) -> ProtocolResult<()> {
        write_record(&self.credential_path(), credential).await
    }

    pub async fn read_credential(&self) -> ProtocolResult<Option<BaseCredential>> {
        read_record(&self.credential_path()).await
    }

    /// Drop the message records once both sides are done with them.
    pub async fn remove_records(&self) -> ProtocolResult<()> {
        for path in [
            self.request_path(),
            self.status_path(),
            self.terminate_path(),
            self.credential_path(),
        ] {
            remove_if_exists(&path).await?;
        }
        Ok(())
    }

    /// Clear a finished lifecycle, forced-cleanup record included, before a new request.
    pub async fn reset(&self) -> ProtocolResult<()> {
        self.remove_records().await?;
        remove_if_exists(&self.cleanup_path()).await
    }
}
