use std::path::{Component, Path, PathBuf};

use super::{ProtocolError, ProtocolResult};

pub const VOLUMES_DIR: &str = ".volumes";
pub const REQUEST_FILE: &str = "request.json";
pub const STATUS_FILE: &str = "status.json";
pub const TERMINATE_FILE: &str = "terminate";
pub const CLEANUP_FILE: &str = "cleanup.json";
pub const CREDENTIAL_FILE: &str = "credential.json";
pub const MOUNT_DIR: &str = "mount";
pub const TOKEN_SOCKET: &str = "token.sock";

/// Root of one pod's communication volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommDir {
    root: PathBuf,
}

impl CommDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn volumes_dir(&self) -> PathBuf {
        self.root.join(VOLUMES_DIR)
    }

    pub fn volume(&self, volume: &str) -> ProtocolResult<VolumeDir> {
        validate_volume_name(volume)?;
        Ok(VolumeDir { volume: volume.to_string(), path: self.volumes_dir().join(volume) })
    }

    /// Resolve a path recorded relative to the communication volume root.
    pub fn resolve(&self, relative: &Path) -> ProtocolResult<PathBuf> {
        let escapes = relative.components().any(|c| !matches!(c, Component::Normal(_)));
        if relative.as_os_str().is_empty() || escapes {
            return Err(ProtocolError::InvalidPath(relative.display().to_string()));
        }
        Ok(self.root.join(relative))
    }

    /// Names of all volume directories currently present.
    pub async fn list_volumes(&self) -> ProtocolResult<Vec<String>> {
        let dir = self.volumes_dir();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ProtocolError::io(&dir, e)),
        };

        let mut volumes = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| ProtocolError::io(&dir, e))? {
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            if let (true, Some(name)) = (is_dir, entry.file_name().to_str()) {
                if validate_volume_name(name).is_ok() {
                    volumes.push(name.to_string());
                }
            }
        }
        volumes.sort();
        Ok(volumes)
    }
}

/// Directory holding the records of one volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeDir {
    volume: String,
    path: PathBuf,
}

impl VolumeDir {
    pub fn volume(&self) -> &str {
        &self.volume
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn request_path(&self) -> PathBuf {
        self.path.join(REQUEST_FILE)
    }

    pub fn status_path(&self) -> PathBuf {
        self.path.join(STATUS_FILE)
    }

    pub fn terminate_path(&self) -> PathBuf {
        self.path.join(TERMINATE_FILE)
    }

    pub fn cleanup_path(&self) -> PathBuf {
        self.path.join(CLEANUP_FILE)
    }

    pub fn credential_path(&self) -> PathBuf {
        self.path.join(CREDENTIAL_FILE)
    }

    pub fn mount_dir(&self) -> PathBuf {
        self.path.join(MOUNT_DIR)
    }

    pub fn token_socket(&self) -> PathBuf {
        self.path.join(TOKEN_SOCKET)
    }

    /// Mount point as recorded in a request: relative to the volume root, so
    /// both sides can resolve it against their own view of the volume.
    pub fn relative_mount_point(&self) -> PathBuf {
        Path::new(VOLUMES_DIR).join(&self.volume).join(MOUNT_DIR)
    }
}

/// Volume names become path components; reject anything that could escape the directory.
pub fn validate_volume_name(volume: &str) -> ProtocolResult<()> {
    if volume.is_empty()
        || volume == "."
        || volume == ".."
        || volume.contains('/')
        || volume.contains('\0')
    {
        return Err(ProtocolError::InvalidVolumeName(volume.to_string()));
    }
    Ok(())
}
