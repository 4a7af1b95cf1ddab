use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{SidecarError, SupervisorContext, supervise};
use crate::config::SidecarConfig;
use crate::mount::Mounter;
use crate::protocol::{CommDir, MountStatus};
use crate::token::TokenManager;

struct Tracked {
    created_at: DateTime<Utc>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<MountStatus>>,
    terminated: bool,
}

impl Tracked {
    fn is_active(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

/// Watches the communication volume and supervises one mount per request.
pub struct SidecarMounter {
    ctx: Arc<SupervisorContext>,
    volumes: BTreeMap<String, Tracked>,
}

impl SidecarMounter {
    pub fn new(config: SidecarConfig, tokens: TokenManager, mounter: Arc<dyn Mounter>) -> Self {
        let ctx = SupervisorContext { comm: CommDir::new(&config.comm_dir), config, tokens, mounter };
        Self { ctx: Arc::new(ctx), volumes: BTreeMap::new() }
    }

    /// Run until every volume seen has been terminated, or until `shutdown`
    /// fires and the shutdown grace runs out.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<(), SidecarError> {
        let scan_interval = self.ctx.config.scan_interval();
        tracing::info!(comm_dir = %self.ctx.comm.root().display(), "Sidecar mounter started");

        let mut interval = tokio::time::interval(scan_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut drain_deadline = None;

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.cancelled(), if drain_deadline.is_none() => {
                    tracing::info!(
                        grace_ms = self.ctx.config.shutdown_grace_ms,
                        "Shutdown requested, waiting for volumes to be terminated"
                    );
                    drain_deadline = Some(tokio::time::Instant::now() + self.ctx.config.shutdown_grace());
                }
            }

            if let Err(e) = self.scan().await {
                tracing::warn!(error = %e, "Scan of communication volume failed");
            }

            if self.all_done() {
                tracing::info!(volumes = self.volumes.len(), "All volumes terminated, exiting");
                break;
            }
            if drain_deadline.is_some_and(|d| tokio::time::Instant::now() >= d) {
                tracing::warn!("Shutdown grace elapsed, stopping remaining mounts");
                break;
            }
        }

        self.stop_all().await;
        Ok(())
    }

    /// One pass over the communication volume.
    pub async fn scan(&mut self) -> Result<(), SidecarError> {
        for volume in self.ctx.comm.list_volumes().await? {
            let dir = self.ctx.comm.volume(&volume)?;
            let request = match dir.read_request().await {
                Ok(Some(request)) => request,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(volume = %volume, error = %e, "Skipping unreadable request");
                    continue;
                }
            };
            let terminating = dir.is_terminating().await;
            let status = dir.read_status().await.unwrap_or(None);

            if let Some(tracked) = self.volumes.get_mut(&volume) {
                if terminating && !tracked.terminated {
                    let reason = dir.read_termination().await.ok().flatten().map(|s| s.reason);
                    tracing::info!(volume = %volume, reason = ?reason, "Termination requested");
                    tracked.terminated = true;
                    tracked.cancel.cancel();
                }
                if tracked.is_active() || tracked.created_at == request.created_at {
                    continue;
                }
            }

            if terminating {
                // Requested and withdrawn before this helper started it.
                if !status.as_ref().is_some_and(MountStatus::is_terminal) {
                    dir.write_status(&MountStatus::exited(&volume, None, None, None, None)).await?;
                }
                self.volumes.insert(volume, Tracked {
                    created_at: request.created_at,
                    cancel: CancellationToken::new(),
                    handle: None,
                    terminated: true,
                });
                continue;
            }

            if status.as_ref().is_some_and(MountStatus::is_terminal) {
                // Finished mounts are not restarted.
                self.volumes.entry(volume).or_insert_with(|| Tracked {
                    created_at: request.created_at,
                    cancel: CancellationToken::new(),
                    handle: None,
                    terminated: false,
                });
                continue;
            }

            tracing::info!(volume = %volume, bucket = %request.bucket, "Starting mount");
            let cancel = CancellationToken::new();
            let created_at = request.created_at;
            let handle = tokio::spawn(supervise(self.ctx.clone(), request, cancel.clone()));
            self.volumes.insert(volume, Tracked {
                created_at,
                cancel,
                handle: Some(handle),
                terminated: false,
            });
        }
        Ok(())
    }

    /// At least one volume was seen, all were terminated and none is still running.
    fn all_done(&self) -> bool {
        !self.volumes.is_empty() && self.volumes.values().all(|t| t.terminated && !t.is_active())
    }

    async fn stop_all(&mut self) {
        for tracked in self.volumes.values() {
            tracked.cancel.cancel();
        }
        for (volume, tracked) in self.volumes.iter_mut() {
            if let Some(handle) = tracked.handle.take() {
                match handle.await {
                    Ok(status) => tracing::info!(volume = %volume, phase = ?status.phase, "Supervisor finished"),
                    Err(e) => tracing::error!(volume = %volume, error = %e, "Supervisor task failed"),
                }
            }
        }
    }
}
