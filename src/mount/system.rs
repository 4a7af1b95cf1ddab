use async_trait::async_trait;
use nix::mount::{MntFlags, MsFlags};
use std::path::{Path, PathBuf};

use super::{MountEntry, MountError, Mounter, mountinfo};

const MOUNTINFO: &str = "/proc/self/mountinfo";

/// [`Mounter`] backed by mount(2)/umount2(2) and `/proc/self/mountinfo`.
#[derive(Debug, Clone)]
pub struct SystemMounter {
    mountinfo_path: PathBuf,
}

impl SystemMounter {
    pub fn new() -> Self {
        Self { mountinfo_path: PathBuf::from(MOUNTINFO) }
    }
}

impl Default for SystemMounter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Mounter for SystemMounter {
    async fn bind_mount(
        &self,
        source: &Path,
        target: &Path,
        read_only: bool,
    ) -> Result<(), MountError> {
        tokio::fs::create_dir_all(target).await?;

        let source = source.to_path_buf();
        let target = target.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let fail = |e: nix::Error| MountError::Mount {
                source_path: source.clone(),
                target: target.clone(),
                reason: e.to_string(),
            };

            nix::mount::mount(
                Some(source.as_path()),
                target.as_path(),
                None::<&str>,
                MsFlags::MS_BIND,
                None::<&str>,
            )
            .map_err(fail)?;

            // MS_RDONLY is ignored on the initial bind; it needs a remount.
            if read_only {
                let flags = MsFlags::MS_REMOUNT | MsFlags::MS_BIND | MsFlags::MS_RDONLY;
                if let Err(e) = nix::mount::mount(
                    None::<&str>,
                    target.as_path(),
                    None::<&str>,
                    flags,
                    None::<&str>,
                ) {
                    let _ = nix::mount::umount2(target.as_path(), MntFlags::MNT_DETACH);
                    return Err(fail(e));
                }
            }
            Ok(())
        })
        .await
        .map_err(|e| MountError::MountTable(e.to_string()))?
    }

    async fn unmount(&self, target: &Path, lazy: bool) -> Result<(), MountError> {
        let target = target.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let flags = if lazy { MntFlags::MNT_DETACH } else { MntFlags::empty() };
            match nix::mount::umount2(target.as_path(), flags) {
                Ok(()) => Ok(()),
                // Not mounted (or already gone) is what we wanted.
                Err(nix::Error::EINVAL) | Err(nix::Error::ENOENT) => Ok(()),
                Err(e) => Err(MountError::Unmount { target, reason: e.to_string() }),
            }
        })
        .await
        .map_err(|e| MountError::MountTable(e.to_string()))?
    }

    async fn is_mount_point(&self, path: &Path) -> Result<bool, MountError> {
        let mounts = self.list_mounts().await?;
        Ok(mounts.iter().any(|m| m.mount_point == path))
    }

    async fn list_mounts(&self) -> Result<Vec<MountEntry>, MountError> {
        let content = tokio::fs::read_to_string(&self.mountinfo_path)
            .await
            .map_err(|e| MountError::MountTable(e.to_string()))?;
        Ok(mountinfo::parse(&content))
    }
}
