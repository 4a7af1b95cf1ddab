use std::path::{Path, PathBuf};

use super::SidecarError;
use crate::mount::Mounter;

/// `<bdi_dir>/<major>:<minor>/read_ahead_kb` of the device backing `mount_point`.
pub async fn read_ahead_knob(
    mounter: &dyn Mounter,
    bdi_dir: &Path,
    mount_point: &Path,
) -> Result<PathBuf, SidecarError> {
    let fail = |reason: String| SidecarError::ReadAhead {
        mount_point: mount_point.display().to_string(),
        reason,
    };

    let mounts = mounter.list_mounts().await?;
    // Later entries shadow earlier ones on the same path.
    let entry = mounts
        .iter()
        .rev()
        .find(|m| m.mount_point == mount_point)
        .ok_or_else(|| fail("not a mount point".to_string()))?;
    let (major, minor) =
        entry.device_numbers().ok_or_else(|| fail(format!("bad device {:?}", entry.device)))?;

    Ok(bdi_dir.join(format!("{major}:{minor}")).join("read_ahead_kb"))
}

/// Set the kernel read-ahead of the mount at `mount_point` to `kb` KiB.
pub async fn apply_read_ahead(
    mounter: &dyn Mounter,
    bdi_dir: &Path,
    mount_point: &Path,
    kb: u32,
) -> Result<(), SidecarError> {
    let knob = read_ahead_knob(mounter, bdi_dir, mount_point).await?;
    tokio::fs::write(&knob, kb.to_string()).await.map_err(|e| SidecarError::ReadAhead {
        mount_point: mount_point.display().to_string(),
        reason: format!("{}: {e}", knob.display()),
    })?;
    tracing::info!(mount_point = %mount_point.display(), read_ahead_kb = kb, knob = %knob.display(), "Applied read-ahead");
    Ok(())
}
