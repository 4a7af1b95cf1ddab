//! Lifecycle of one volume inside the helper.
//!
//! ```text
//! request ──> credential ──> spawn ──> ready? ──> Running ──┬─> crash      -> Exited (MountProcessFailure)
//!                │                       │                  ├─> terminate  -> SIGTERM, grace, SIGKILL -> Exited
//!                └─> CredentialFailure   └─> exit/timeout   └─> renewal failed -> Exited (CredentialFailure)
//! ```
//!
//! Whatever happens, the final [`MountStatus`] is written before the task ends.

use chrono::{DateTime, Utc};
use std::path::{Component, Path};
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::process::describe_exit;
use super::read_ahead::apply_read_ahead;
use super::{MountCommand, MountProcess, SidecarError};
use crate::config::SidecarConfig;
use crate::error::FailureKind;
use crate::mount::Mounter;
use crate::protocol::{CommDir, MountRequest, MountStatus, VolumeDir};
use crate::token::server::serve_token_socket;
use crate::token::{FileTokenFetcher, TokenError, TokenManager, TokenSource};

const READY_POLL: Duration = Duration::from_millis(100);
const RENEW_RETRY_FLOOR: Duration = Duration::from_millis(100);

/// Shared by every supervisor of one helper.
pub struct SupervisorContext {
    pub comm: CommDir,
    pub config: SidecarConfig,
    pub tokens: TokenManager,
    pub mounter: Arc<dyn Mounter>,
}

enum Readiness {
    Ready,
    Exited(ExitStatus),
    Cancelled,
    TimedOut,
}

/// Run the mount described by `request` until it exits or `cancel` fires.
///
/// Returns the final status, which has also been written to the volume's
/// status record.
pub async fn supervise(
    ctx: Arc<SupervisorContext>,
    request: MountRequest,
    cancel: CancellationToken,
) -> MountStatus {
    let volume = request.volume.clone();
    let status = match run(&ctx, &request, &cancel).await {
        Ok(status) => status,
        Err(e) => {
            let failure = match &e {
                SidecarError::Token(_) => FailureKind::CredentialFailure,
                _ => FailureKind::MountProcessFailure,
            };
            tracing::error!(volume = %volume, error = %e, failure = %failure, "Mount failed");
            MountStatus::exited(&volume, None, None, Some(e.to_string()), Some(failure))
        }
    };

    match ctx.comm.volume(&volume) {
        Ok(dir) => {
            if let Err(e) = dir.write_status(&status).await {
                tracing::error!(volume = %volume, error = %e, "Failed to write final status");
            }
        }
        Err(e) => tracing::error!(volume = %volume, error = %e, "Cannot record final status"),
    }
    status
}

async fn run(
    ctx: &SupervisorContext,
    request: &MountRequest,
    cancel: &CancellationToken,
) -> Result<MountStatus, SidecarError> {
    let volume = request.volume.as_str();
    let dir = ctx.comm.volume(volume)?;
    let mount_point = ctx.comm.resolve(&request.mount_point)?;

    // A previous helper instance may have left a dead FUSE mount behind.
    if ctx.mounter.is_mount_point(&mount_point).await.unwrap_or(false) {
        tracing::warn!(volume, mount_point = %mount_point.display(), "Removing stale mount");
        ctx.mounter.unmount(&mount_point, true).await?;
    }
    tokio::fs::create_dir_all(&mount_point).await?;
    if let Some(cache_dir) = &request.options.cache_dir {
        check_cache_dir(&ctx.config.cache_root, cache_dir)?;
        tokio::fs::create_dir_all(cache_dir).await?;
    }

    let token_shutdown = cancel.child_token();
    let _stop_token_server = token_shutdown.clone().drop_guard();
    let source = match start_token_source(ctx, &dir, &token_shutdown).await? {
        Some(source) => Some(source),
        None => {
            tracing::debug!(volume, "No credential record, mount process uses ambient credentials");
            None
        }
    };

    let command = MountCommand::build(
        &ctx.config.mount_binary,
        &request.bucket,
        &mount_point,
        &request.options,
        source.as_ref().map(|_| dir.token_socket()).as_deref(),
    );
    let mut process = MountProcess::spawn(&command)?;
    let pid = process.pid();
    dir.write_status(&MountStatus::starting(volume, pid)).await?;

    match wait_until_ready(ctx, &mut process, &mount_point, cancel).await? {
        Readiness::Ready => {}
        Readiness::Exited(exit) => {
            let tail = process.stderr_tail().await;
            cleanup_mount_point(ctx.mounter.as_ref(), &mount_point).await;
            return Ok(MountStatus::exited(
                volume,
                pid,
                exit.code(),
                Some(format!("mount process exited before the mount was ready ({}): {tail}", describe_exit(&exit))),
                Some(FailureKind::MountProcessFailure),
            ));
        }
        Readiness::Cancelled => {
            let exit = process.stop(ctx.config.stop_grace()).await?;
            cleanup_mount_point(ctx.mounter.as_ref(), &mount_point).await;
            tracing::info!(volume, "Terminated before the mount was ready");
            return Ok(MountStatus::exited(volume, pid, exit.code(), None, None));
        }
        Readiness::TimedOut => {
            let exit = process.stop(ctx.config.stop_grace()).await?;
            let tail = process.stderr_tail().await;
            cleanup_mount_point(ctx.mounter.as_ref(), &mount_point).await;
            return Ok(MountStatus::exited(
                volume,
                pid,
                exit.code(),
                Some(format!(
                    "mount point not ready after {}ms: {tail}",
                    ctx.config.ready_timeout_ms
                )),
                Some(FailureKind::MountProcessFailure),
            ));
        }
    }

    if let Some(kb) = request.options.read_ahead_kb {
        if let Err(e) =
            apply_read_ahead(ctx.mounter.as_ref(), &ctx.config.sysfs_bdi_dir, &mount_point, kb).await
        {
            tracing::warn!(volume, error = %e, "Continuing without read-ahead tuning");
        }
    }

    dir.write_status(&MountStatus::running(volume, pid)).await?;
    tracing::info!(volume, bucket = %request.bucket, pid = ?pid, "Mount is running");

    let renewal = async {
        match &source {
            Some(source) => renew(source, ctx.config.refresh_margin()).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(renewal);

    let status = tokio::select! {
        exit = process.wait() => {
            let exit = exit?;
            let tail = process.stderr_tail().await;
            tracing::error!(volume, pid = ?pid, exit = %describe_exit(&exit), stderr = %tail, "Mount process exited unexpectedly");
            MountStatus::exited(
                volume,
                pid,
                exit.code(),
                Some(format!("mount process exited unexpectedly ({}): {tail}", describe_exit(&exit))),
                Some(FailureKind::MountProcessFailure),
            )
        }
        _ = cancel.cancelled() => {
            tracing::info!(volume, pid = ?pid, "Stopping mount process");
            let exit = process.stop(ctx.config.stop_grace()).await?;
            MountStatus::exited(volume, pid, exit.code(), None, None)
        }
        e = &mut renewal => {
            tracing::error!(volume, error = %e, "Credential renewal failed, stopping mount");
            let exit = process.stop(ctx.config.stop_grace()).await?;
            MountStatus::exited(
                volume,
                pid,
                exit.code(),
                Some(e.to_string()),
                Some(FailureKind::CredentialFailure),
            )
        }
    };

    cleanup_mount_point(ctx.mounter.as_ref(), &mount_point).await;
    Ok(status)
}

async fn start_token_source(
    ctx: &SupervisorContext,
    dir: &VolumeDir,
    shutdown: &CancellationToken,
) -> Result<Option<TokenSource>, SidecarError> {
    let Some(base) = dir.read_credential().await? else {
        return Ok(None);
    };

    let source = ctx.tokens.token_source(base.into(), Arc::new(FileTokenFetcher::new(dir.clone())));
    // Fail before spawning anything if the credential is already unusable.
    source.token().await?;
    serve_token_socket(&dir.token_socket(), source.clone(), shutdown.clone()).await?;
    Ok(Some(source))
}

async fn wait_until_ready(
    ctx: &SupervisorContext,
    process: &mut MountProcess,
    mount_point: &Path,
    cancel: &CancellationToken,
) -> Result<Readiness, SidecarError> {
    let deadline = tokio::time::Instant::now() + ctx.config.ready_timeout();
    loop {
        if ctx.mounter.is_mount_point(mount_point).await? {
            return Ok(Readiness::Ready);
        }
        tokio::select! {
            exit = process.wait() => return Ok(Readiness::Exited(exit?)),
            _ = cancel.cancelled() => return Ok(Readiness::Cancelled),
            _ = tokio::time::sleep_until(deadline) => return Ok(Readiness::TimedOut),
            _ = tokio::time::sleep(READY_POLL) => {}
        }
    }
}

/// Renew the lease `margin` ahead of expiry until a renewal fails with no
/// valid lease left.
///
/// A lease that does not move forward is retried once more at the expiry
/// delta and a last time at expiry, never in a tight loop.
async fn renew(source: &TokenSource, margin: Duration) -> TokenError {
    let delta = source.expiry_delta();
    loop {
        let wait = match source.expiry().await {
            Some(expiry) => next_renewal(expiry, margin, delta, Utc::now()),
            None => Duration::ZERO,
        };
        tokio::time::sleep(wait).await;

        match source.refresh_within(margin).await {
            Ok(lease) => tracing::debug!(expiry = %lease.expiry, "Credential lease renewed"),
            Err(e) => match source.token().await {
                Ok(_) => tracing::warn!(error = %e, "Early renewal failed, current lease still valid"),
                Err(_) => return e,
            },
        }
    }
}

/// Time until the next renewal attempt: the margin ahead of expiry, then the
/// expiry delta, then expiry itself.
fn next_renewal(expiry: DateTime<Utc>, margin: Duration, delta: Duration, now: DateTime<Utc>) -> Duration {
    let margin = margin.max(delta);
    let remaining = (expiry - now).to_std().unwrap_or(Duration::ZERO);
    let wait = if remaining > margin {
        remaining - margin
    } else if remaining > delta {
        remaining - delta
    } else {
        remaining
    };
    wait.max(RENEW_RETRY_FLOOR)
}

/// The helper only writes cache data inside the cache volume it was given.
fn check_cache_dir(cache_root: &Path, cache_dir: &Path) -> Result<(), SidecarError> {
    let climbs = cache_dir.components().any(|c| matches!(c, Component::ParentDir));
    if climbs || !cache_dir.starts_with(cache_root) {
        return Err(SidecarError::InvalidRequest(format!(
            "cache directory {} is outside {}",
            cache_dir.display(),
            cache_root.display()
        )));
    }
    Ok(())
}

async fn cleanup_mount_point(mounter: &dyn Mounter, mount_point: &Path) {
    match mounter.is_mount_point(mount_point).await {
        Ok(true) => {
            if let Err(e) = mounter.unmount(mount_point, false).await {
                tracing::warn!(mount_point = %mount_point.display(), error = %e, "Unmount failed, detaching");
                let _ = mounter.unmount(mount_point, true).await;
            }
        }
        Ok(false) => {}
        Err(e) => tracing::warn!(mount_point = %mount_point.display(), error = %e, "Cannot inspect mount table"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::CredentialLease;
    use crate::token::fetcher::MockTokenFetcher;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const DELTA: Duration = Duration::from_secs(10);

    #[test]
    fn test_next_renewal_before_margin() {
        let now = Utc::now();
        let wait = next_renewal(now + chrono::Duration::minutes(60), Duration::from_secs(300), DELTA, now);
        assert_eq!(wait, Duration::from_secs(55 * 60));
    }

    #[test]
    fn test_next_renewal_inside_margin_waits_for_delta() {
        let now = Utc::now();
        let wait = next_renewal(now + chrono::Duration::minutes(2), Duration::from_secs(300), DELTA, now);
        assert_eq!(wait, Duration::from_secs(110));

        let wait = next_renewal(now + chrono::Duration::seconds(4), Duration::from_secs(300), DELTA, now);
        assert_eq!(wait, Duration::from_secs(4));

        let wait = next_renewal(now - chrono::Duration::minutes(2), Duration::from_secs(300), DELTA, now);
        assert_eq!(wait, RENEW_RETRY_FLOOR);
    }

    #[test]
    fn test_cache_dir_must_stay_in_cache_root() {
        let root = Path::new("/gcsfuse-cache");
        assert!(check_cache_dir(root, Path::new("/gcsfuse-cache/.volumes/v1")).is_ok());
        assert!(check_cache_dir(root, Path::new("/etc")).is_err());
        assert!(check_cache_dir(root, Path::new("/gcsfuse-cache/../etc")).is_err());
        assert!(check_cache_dir(root, Path::new("/gcsfuse-cache-other/v1")).is_err());
    }

    fn source_with_fixed_lease(expiry: DateTime<Utc>, delta: Duration) -> (TokenSource, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut fetcher = MockTokenFetcher::new();
        fetcher.expect_fetch().returning({
            let calls = calls.clone();
            move || {
                calls.fetch_add(1, Ordering::SeqCst);
                if expiry > Utc::now() {
                    Ok(CredentialLease::new("same", expiry))
                } else {
                    Err(TokenError::Expired(expiry))
                }
            }
        });
        let source = TokenManager::new(delta).token_source(CredentialLease::new("same", expiry), Arc::new(fetcher));
        (source, calls)
    }

    #[tokio::test]
    async fn test_renew_does_not_refetch_unchanged_lease_in_a_loop() {
        let expiry = Utc::now() + chrono::Duration::seconds(3);
        let (source, calls) = source_with_fixed_lease(expiry, Duration::from_millis(200));

        let result =
            tokio::time::timeout(Duration::from_millis(1500), renew(&source, Duration::from_millis(2500))).await;

        assert!(result.is_err(), "renewal should still be waiting");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_renew_gives_up_once_lease_expires() {
        let expiry = Utc::now() + chrono::Duration::milliseconds(600);
        let (source, calls) = source_with_fixed_lease(expiry, Duration::from_millis(100));

        let err = tokio::time::timeout(Duration::from_secs(3), renew(&source, Duration::from_millis(400)))
            .await
            .unwrap();

        assert!(matches!(err, TokenError::Expired(_)), "{err:?}");
        let calls = calls.load(Ordering::SeqCst);
        assert!((2..=4).contains(&calls), "{calls} fetches");
    }
}
