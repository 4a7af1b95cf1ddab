use crate::csi::proto::{
    NodeExpandVolumeRequest, NodeExpandVolumeResponse, NodeGetCapabilitiesRequest,
    NodeGetCapabilitiesResponse, NodeGetInfoRequest, NodeGetInfoResponse,
    NodeGetVolumeStatsRequest, NodeGetVolumeStatsResponse, NodePublishVolumeRequest,
    NodePublishVolumeResponse, NodeStageVolumeRequest, NodeStageVolumeResponse,
    NodeUnpublishVolumeRequest, NodeUnpublishVolumeResponse, NodeUnstageVolumeRequest,
    NodeUnstageVolumeResponse, VolumeCapability, node_server::Node, volume_capability,
};
use crate::csi::target::comm_dir;
use crate::csi::volume_context::check_mount_options;
use crate::csi::{CsiMetrics, NodeError, PodInfo, PodLookup, TargetPath, VolumePhase, VolumeTable};
use crate::config::NodeConfig;
use crate::error::FailureKind;
use crate::mount::Mounter;
use crate::options::{PodAnnotations, SIDECAR_CONTAINER_NAME, VolumeInputs, resolve_mount_options};
use crate::protocol::{
    CommDir, ForcedCleanup, MountRequest, MountStatus, PodRef, ProtocolError, TerminationSignal,
    VolumeDir,
};
use chrono::Utc;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tonic::metadata::MetadataMap;
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

/// Exponential poll interval for status.json.
#[derive(Debug, Clone)]
struct Backoff {
    next: Duration,
    max: Duration,
    multiplier: f64,
}

impl Backoff {
    fn from_config(config: &NodeConfig) -> Self {
        Self {
            next: Duration::from_millis(config.poll_initial_ms.max(1)),
            max: Duration::from_millis(config.poll_max_ms.max(config.poll_initial_ms).max(1)),
            multiplier: config.poll_multiplier.max(1.0),
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = delay.mul_f64(self.multiplier).min(self.max);
        delay
    }
}

/// Parse the `grpc-timeout` header, e.g. `29999m` or `30S`.
pub fn grpc_timeout(metadata: &MetadataMap) -> Option<Duration> {
    let value = metadata.get("grpc-timeout")?.to_str().ok()?;
    parse_grpc_timeout(value)
}

fn parse_grpc_timeout(value: &str) -> Option<Duration> {
    if value.len() < 2 {
        return None;
    }
    let (amount, unit) = value.split_at(value.len() - 1);
    let amount: u64 = amount.parse().ok()?;
    match unit {
        "H" => Some(Duration::from_secs(amount.saturating_mul(3600))),
        "M" => Some(Duration::from_secs(amount.saturating_mul(60))),
        "S" => Some(Duration::from_secs(amount)),
        "m" => Some(Duration::from_millis(amount)),
        "u" => Some(Duration::from_micros(amount)),
        "n" => Some(Duration::from_nanos(amount)),
        _ => None,
    }
}

fn is_read_only_capability(capability: &VolumeCapability) -> bool {
    use volume_capability::access_mode::Mode;

    capability
        .access_mode
        .as_ref()
        .map(|mode| {
            mode.mode == Mode::SingleNodeReaderOnly as i32
                || mode.mode == Mode::MultiNodeReaderOnly as i32
        })
        .unwrap_or(false)
}

/// Counts of what a startup reconciliation found.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub mounted: usize,
    pub in_progress: usize,
    pub failed: usize,
    pub unmount_requested: usize,
    pub orphaned: usize,
    /// Volumes whose records were cleared because the unmount had already completed.
    pub completed: usize,
    /// Targets left bound to a dead mount and detached.
    pub detached: usize,
}

impl ReconcileReport {
    fn count(&mut self, phase: VolumePhase) {
        match phase {
            VolumePhase::Mounted => self.mounted += 1,
            VolumePhase::Requested | VolumePhase::MountInProgress => self.in_progress += 1,
            VolumePhase::MountFailed(_) => self.failed += 1,
            VolumePhase::UnmountRequested => self.unmount_requested += 1,
            VolumePhase::Orphaned => self.orphaned += 1,
            VolumePhase::Unmounted => self.completed += 1,
        }
    }
}

/// Node Service implementation
///
/// Publishes bucket volumes by handing a mount request to the pod's helper
/// container and bind mounting the helper's FUSE mount onto the kubelet
/// target path once it reports running.
#[derive(Clone)]
pub struct NodeService {
    node_id: String,
    config: Arc<NodeConfig>,
    /// Cache volume root as the helper sees it.
    cache_root: PathBuf,
    mounter: Arc<dyn Mounter>,
    pods: Arc<dyn PodLookup>,
    table: Arc<VolumeTable>,
    metrics: Option<Arc<CsiMetrics>>,
}

impl NodeService {
    pub fn new(
        node_id: impl Into<String>,
        config: NodeConfig,
        cache_root: impl Into<PathBuf>,
        mounter: Arc<dyn Mounter>,
        pods: Arc<dyn PodLookup>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            config: Arc::new(config),
            cache_root: cache_root.into(),
            mounter,
            pods,
            table: Arc::new(VolumeTable::new()),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<CsiMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn table(&self) -> &Arc<VolumeTable> {
        &self.table
    }

    /// How long a publish may wait, given the caller's own deadline.
    pub fn publish_deadline(&self, caller: Option<Duration>) -> Duration {
        let configured = self.config.publish_timeout();
        match caller {
            Some(remaining) => configured.min(remaining.saturating_sub(self.config.deadline_margin())),
            None => configured,
        }
    }

    pub async fn publish(
        &self,
        req: &NodePublishVolumeRequest,
        timeout: Duration,
    ) -> Result<(), NodeError> {
        if req.volume_id.is_empty() {
            return Err(NodeError::InvalidArgument("volume_id is required".into()));
        }
        if req.target_path.is_empty() {
            return Err(NodeError::InvalidArgument("target_path is required".into()));
        }
        let capability = req
            .volume_capability
            .as_ref()
            .ok_or_else(|| NodeError::InvalidArgument("volume_capability is required".into()))?;
        let mount_flags = match &capability.access_type {
            Some(volume_capability::AccessType::Block(_)) => {
                return Err(NodeError::InvalidArgument("block volumes are not supported".into()));
            }
            Some(volume_capability::AccessType::Mount(mount)) => mount.mount_flags.clone(),
            None => Vec::new(),
        };

        let root = &self.config.kubelet_root_dir;
        let target_path = PathBuf::from(&req.target_path);
        let key = TargetPath::parse(root, &target_path).ok_or_else(|| {
            NodeError::InvalidArgument(format!(
                "target path {} is not a kubelet pod volume path",
                req.target_path
            ))
        })?;

        let context = crate::csi::VolumeContext::parse(&req.volume_context)?;
        context.check_pod_uid(&key.pod_uid)?;
        check_mount_options("mount_flags", &mount_flags)?;
        let bucket = context.bucket(&req.volume_id)?.to_string();
        let (Some(namespace), Some(name)) = (&context.pod_namespace, &context.pod_name) else {
            return Err(NodeError::InvalidArgument(
                "volume context has no pod name or namespace; is podInfoOnMount enabled?".into(),
            ));
        };

        let pod = self.lookup_pod(namespace, name, &key.pod_uid).await?;
        if !pod.has_helper {
            return Err(NodeError::FailedPrecondition(format!(
                "pod {namespace}/{name} has no {SIDECAR_CONTAINER_NAME} container, \
                 was it created while the admission webhook was unavailable?"
            )));
        }

        let annotations = match PodAnnotations::parse(&pod.annotations) {
            Ok((annotations, warnings)) => {
                for warning in warnings {
                    warn!(pod = %format!("{namespace}/{name}"), "{}", warning);
                }
                annotations
            }
            Err(e) => {
                warn!(pod = %format!("{namespace}/{name}"), error = %e, "Ignoring pod annotations");
                PodAnnotations::default()
            }
        };

        let read_only = req.readonly || is_read_only_capability(capability);
        let mut extra_flags = context.mount_options.clone();
        extra_flags.extend(mount_flags);
        let options = resolve_mount_options(
            &annotations,
            &VolumeInputs {
                read_only,
                implicit_dirs: context.implicit_dirs,
                disable_cache: context.disable_cache,
                extra_flags,
            },
            &self.cache_root,
            &key.volume,
        );

        let _guard = self.table.lock(&key).await;

        let comm = CommDir::new(key.comm_dir(root));
        let dir = comm.volume(&key.volume)?;
        let previous = dir.read_status().await?;

        if previous.as_ref().is_some_and(MountStatus::is_running)
            && self.table.phase(&key) == Some(VolumePhase::Mounted)
            && self.mounter.is_mount_point(&target_path).await?
        {
            // Periodic republish: only the credential changes.
            if let Some(credential) = &context.credential {
                dir.write_credential(credential).await?;
            }
            debug!(volume = %key.volume, pod_uid = %key.pod_uid, "Volume already published");
            return Ok(());
        }

        if previous.as_ref().is_some_and(MountStatus::is_terminal) || dir.is_terminating().await {
            info!(volume = %key.volume, pod_uid = %key.pod_uid, "Clearing finished mount before a new attempt");
            if self.mounter.is_mount_point(&target_path).await.unwrap_or(false) {
                self.mounter.unmount(&target_path, true).await?;
            }
            dir.reset().await?;
        }

        if let Some(credential) = &context.credential {
            dir.write_credential(credential).await?;
        }

        let request = MountRequest {
            volume: key.volume.clone(),
            bucket: bucket.clone(),
            mount_point: dir.relative_mount_point(),
            options,
            pod: PodRef { namespace: namespace.clone(), name: name.clone(), uid: key.pod_uid.clone() },
            created_at: Utc::now(),
        };
        let written = dir.put_request(&request).await?;
        self.table.set(&key, VolumePhase::Requested, target_path.clone(), Some(bucket.clone()));
        if written {
            info!(volume = %key.volume, pod_uid = %key.pod_uid, %bucket, "Mount requested");
        } else {
            debug!(volume = %key.volume, pod_uid = %key.pod_uid, "Mount request already present");
        }
        self.table.set_phase(&key, VolumePhase::MountInProgress);

        let started = Instant::now();
        let status = self.wait_for_status(&dir, timeout, |s| s.is_running() || s.is_terminal()).await;

        match status {
            None => Err(NodeError::PublishTimeout {
                volume: key.volume.clone(),
                waited_ms: started.elapsed().as_millis() as u64,
            }),
            Some(status) if status.is_terminal() => {
                let kind = status.failure.unwrap_or(FailureKind::MountProcessFailure);
                self.table.set_phase(&key, VolumePhase::MountFailed(kind));
                Err(NodeError::MountFailed {
                    volume: key.volume.clone(),
                    kind,
                    message: status.error.unwrap_or_else(|| "mount process exited".to_string()),
                })
            }
            Some(_) => {
                if !self.mounter.is_mount_point(&target_path).await? {
                    tokio::fs::create_dir_all(&target_path)
                        .await
                        .map_err(crate::mount::MountError::Io)?;
                    self.mounter.bind_mount(&dir.mount_dir(), &target_path, read_only).await?;
                }
                self.table.set_phase(&key, VolumePhase::Mounted);
                info!(
                    volume = %key.volume,
                    pod_uid = %key.pod_uid,
                    target = %target_path.display(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Volume published"
                );
                Ok(())
            }
        }
    }

    /// How long an unpublish may wait for the helper, given the caller's own
    /// deadline. Forced cleanup has to fit in the margin that is left.
    pub fn unpublish_grace(&self, caller: Option<Duration>) -> Duration {
        let configured = self.config.unpublish_grace();
        match caller {
            Some(remaining) => configured.min(remaining.saturating_sub(self.config.deadline_margin())),
            None => configured,
        }
    }

    /// Always succeeds once the target is gone; a helper that does not answer
    /// within `grace` is cleaned up around.
    pub async fn unpublish(
        &self,
        req: &NodeUnpublishVolumeRequest,
        grace: Duration,
    ) -> Result<(), NodeError> {
        if req.volume_id.is_empty() {
            return Err(NodeError::InvalidArgument("volume_id is required".into()));
        }
        if req.target_path.is_empty() {
            return Err(NodeError::InvalidArgument("target_path is required".into()));
        }

        let root = &self.config.kubelet_root_dir;
        let target_path = PathBuf::from(&req.target_path);
        let Some(key) = TargetPath::parse(root, &target_path) else {
            warn!(target = %target_path.display(), "Not a kubelet pod volume path, only unmounting");
            self.release_target(&target_path).await;
            return Ok(());
        };

        let _guard = self.table.lock(&key).await;
        self.release_target(&target_path).await;

        let comm = CommDir::new(key.comm_dir(root));
        let dir = comm.volume(&key.volume)?;
        if !tokio::fs::try_exists(dir.request_path()).await.unwrap_or(false) {
            debug!(volume = %key.volume, pod_uid = %key.pod_uid, "No mount request, nothing to stop");
            self.table.remove(&key);
            return Ok(());
        }

        let terminal = match dir.read_status().await {
            Ok(status) => status.is_some_and(|s| s.is_terminal()),
            Err(e) => {
                warn!(volume = %key.volume, error = %e, "Unreadable mount status");
                false
            }
        };

        if !terminal {
            if let Err(e) = dir.write_termination(&TerminationSignal::new(&key.volume, "unpublish")).await {
                warn!(volume = %key.volume, error = %e, "Failed to signal termination");
                self.force_cleanup(&key, &dir, Duration::ZERO).await;
                return Ok(());
            }
            self.table.set_phase(&key, VolumePhase::UnmountRequested);

            if self.wait_for_status(&dir, grace, MountStatus::is_terminal).await.is_none() {
                self.force_cleanup(&key, &dir, grace).await;
                return Ok(());
            }
        }

        if let Err(e) = dir.remove_records().await {
            warn!(volume = %key.volume, error = %e, "Failed to remove protocol records");
        }
        self.table.remove(&key);
        info!(volume = %key.volume, pod_uid = %key.pod_uid, "Volume unpublished");
        Ok(())
    }

    /// Rebuild the volume table from communication volumes and the mount table.
    pub async fn reconcile(&self) -> Result<ReconcileReport, NodeError> {
        let root = &self.config.kubelet_root_dir;
        let mounted: HashSet<PathBuf> =
            self.mounter.list_mounts().await?.into_iter().map(|m| m.mount_point).collect();

        let mut report = ReconcileReport::default();
        let pods_dir = root.join("pods");
        let mut pods = match tokio::fs::read_dir(&pods_dir).await {
            Ok(pods) => pods,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(report),
            Err(e) => return Err(ProtocolError::io(&pods_dir, e).into()),
        };

        while let Some(entry) = pods.next_entry().await.map_err(|e| ProtocolError::io(&pods_dir, e))? {
            let Some(pod_uid) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let comm = CommDir::new(comm_dir(root, &pod_uid));
            for volume in comm.list_volumes().await? {
                let key = TargetPath::new(pod_uid.clone(), volume);
                let dir = comm.volume(&key.volume)?;
                let request = match dir.read_request().await {
                    Ok(Some(request)) => request,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(volume = %key.volume, pod_uid = %pod_uid, error = %e, "Skipping unreadable request");
                        continue;
                    }
                };

                let phase = self.recover(&key, &dir, &mounted, &mut report).await;
                if phase == VolumePhase::Unmounted {
                    report.count(phase);
                    continue;
                }
                self.table.set(&key, phase, key.format(root), Some(request.bucket));
                report.count(phase);
            }
        }

        self.update_volume_gauges();
        info!(?report, "Reconciled volume table");
        Ok(report)
    }

    async fn recover(
        &self,
        key: &TargetPath,
        dir: &VolumeDir,
        mounted: &HashSet<PathBuf>,
        report: &mut ReconcileReport,
    ) -> VolumePhase {
        let target = key.format(&self.config.kubelet_root_dir);
        let is_mounted = mounted.contains(&target);
        let status = dir.read_status().await.ok().flatten();
        let terminating = dir.is_terminating().await;

        if let Some(status) = status.as_ref().filter(|s| s.is_terminal()) {
            if is_mounted {
                warn!(volume = %key.volume, pod_uid = %key.pod_uid, "Target bound to a dead mount, detaching");
                if let Err(e) = self.mounter.unmount(&target, true).await {
                    warn!(target = %target.display(), error = %e, "Failed to detach target");
                }
                if let Err(e) = dir.write_cleanup(&ForcedCleanup::new(&key.volume, "reconcile")).await {
                    warn!(volume = %key.volume, error = %e, "Failed to record cleanup");
                }
                report.detached += 1;
            }
            if terminating {
                if let Err(e) = dir.remove_records().await {
                    warn!(volume = %key.volume, error = %e, "Failed to remove protocol records");
                }
                return VolumePhase::Unmounted;
            }
            return VolumePhase::MountFailed(status.failure.unwrap_or(FailureKind::MountProcessFailure));
        }

        if terminating {
            return VolumePhase::UnmountRequested;
        }
        if status.as_ref().is_some_and(MountStatus::is_running) && is_mounted {
            return VolumePhase::Mounted;
        }
        let target_dir_exists = match target.parent() {
            Some(parent) => tokio::fs::try_exists(parent).await.unwrap_or(false),
            None => false,
        };
        if !target_dir_exists {
            return VolumePhase::Orphaned;
        }
        VolumePhase::MountInProgress
    }

    async fn lookup_pod(&self, namespace: &str, name: &str, uid: &str) -> Result<PodInfo, NodeError> {
        let pod = self.pods.get(namespace, name).await?;
        if pod.uid == uid {
            return Ok(pod);
        }

        // Same name, new pod: the cached copy is stale.
        self.pods.invalidate(namespace, name).await;
        let pod = self.pods.get(namespace, name).await?;
        if pod.uid != uid {
            return Err(NodeError::FailedPrecondition(format!(
                "pod {namespace}/{name} has uid {}, target path belongs to {uid}",
                pod.uid
            )));
        }
        Ok(pod)
    }

    async fn wait_for_status<F>(&self, dir: &VolumeDir, timeout: Duration, done: F) -> Option<MountStatus>
    where
        F: Fn(&MountStatus) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut backoff = Backoff::from_config(&self.config);

        loop {
            match dir.read_status().await {
                Ok(Some(status)) if done(&status) => return Some(status),
                Ok(_) => {}
                Err(e) => debug!(volume = %dir.volume(), error = %e, "Status not readable yet"),
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return None;
            }
            let delay = backoff.next_delay().min(deadline - now);
            tokio::time::sleep(delay).await;
        }
    }

    /// Unmount a target path and remove its directory.
    async fn release_target(&self, target: &Path) {
        if !matches!(self.mounter.is_mount_point(target).await, Ok(false)) {
            if let Err(e) = self.mounter.unmount(target, false).await {
                debug!(target = %target.display(), error = %e, "Unmount failed, detaching lazily");
                if let Err(e) = self.mounter.unmount(target, true).await {
                    warn!(target = %target.display(), error = %e, "Failed to unmount target");
                }
            }
        }

        match tokio::fs::remove_dir(target).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => debug!(target = %target.display(), error = %e, "Failed to remove target directory"),
        }
    }

    async fn force_cleanup(&self, key: &TargetPath, dir: &VolumeDir, waited: Duration) {
        warn!(
            volume = %key.volume,
            pod_uid = %key.pod_uid,
            failure = %FailureKind::UnpublishForced,
            waited_ms = waited.as_millis() as u64,
            "Helper did not acknowledge termination, cleaning up without it"
        );

        if let Err(e) = self.mounter.unmount(&dir.mount_dir(), true).await {
            debug!(volume = %key.volume, error = %e, "Helper mount point already gone");
        }
        if let Err(e) = dir.write_cleanup(&ForcedCleanup::new(&key.volume, "unpublish grace expired")).await {
            warn!(volume = %key.volume, error = %e, "Failed to record forced cleanup");
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_failure(FailureKind::UnpublishForced);
        }
        self.table.remove(key);
    }

    fn observe<T>(&self, method: &str, started: Instant, result: &Result<T, NodeError>) {
        let Some(metrics) = &self.metrics else {
            return;
        };
        metrics.record_operation(method, started.elapsed().as_secs_f64(), result.is_ok());
        if let Err(e) = result {
            if let Some(kind) = e.failure_kind() {
                metrics.record_failure(kind);
            }
        }
        self.update_volume_gauges();
    }

    fn update_volume_gauges(&self) {
        let Some(metrics) = &self.metrics else {
            return;
        };
        for (label, phase) in [
            ("mount_in_progress", VolumePhase::MountInProgress),
            ("mounted", VolumePhase::Mounted),
            ("unmount_requested", VolumePhase::UnmountRequested),
            ("orphaned", VolumePhase::Orphaned),
        ] {
            metrics.set_volumes(label, self.table.count(phase));
        }
    }
}

#[tonic::async_trait]
impl Node for NodeService {
    async fn node_stage_volume(
        &self,
        _request: Request<NodeStageVolumeRequest>,
    ) -> Result<Response<NodeStageVolumeResponse>, Status> {
        Err(Status::unimplemented("Bucket volumes are not staged"))
    }

    async fn node_unstage_volume(
        &self,
        _request: Request<NodeUnstageVolumeRequest>,
    ) -> Result<Response<NodeUnstageVolumeResponse>, Status> {
        Err(Status::unimplemented("Bucket volumes are not staged"))
    }

    async fn node_publish_volume(
        &self,
        request: Request<NodePublishVolumeRequest>,
    ) -> Result<Response<NodePublishVolumeResponse>, Status> {
        let timeout = self.publish_deadline(grpc_timeout(request.metadata()));
        let req = request.into_inner();
        let started = Instant::now();

        let result = self.publish(&req, timeout).await;
        self.observe("NodePublishVolume", started, &result);

        result.map(|()| Response::new(NodePublishVolumeResponse {})).map_err(|e| {
            warn!(
                volume_id = %req.volume_id,
                target = %req.target_path,
                failure = e.failure_kind().map(|k| k.as_str()).unwrap_or("none"),
                error = %e,
                "NodePublishVolume failed"
            );
            Status::from(e)
        })
    }

    async fn node_unpublish_volume(
        &self,
        request: Request<NodeUnpublishVolumeRequest>,
    ) -> Result<Response<NodeUnpublishVolumeResponse>, Status> {
        let grace = self.unpublish_grace(grpc_timeout(request.metadata()));
        let req = request.into_inner();
        let started = Instant::now();

        let result = self.unpublish(&req, grace).await;
        self.observe("NodeUnpublishVolume", started, &result);

        result.map(|()| Response::new(NodeUnpublishVolumeResponse {})).map_err(|e| {
            warn!(volume_id = %req.volume_id, target = %req.target_path, error = %e, "NodeUnpublishVolume failed");
            Status::from(e)
        })
    }

    async fn node_get_volume_stats(
        &self,
        request: Request<NodeGetVolumeStatsRequest>,
    ) -> Result<Response<NodeGetVolumeStatsResponse>, Status> {
        let req = request.into_inner();
        if req.volume_path.is_empty() {
            return Err(Status::invalid_argument("volume_path is required"));
        }

        let volume_path = PathBuf::from(&req.volume_path);
        if !tokio::fs::try_exists(&volume_path).await.unwrap_or(false) {
            return Err(Status::not_found(format!("{} does not exist", req.volume_path)));
        }

        // statvfs on a hung FUSE mount blocks, keep it off the runtime threads
        let stats = tokio::task::spawn_blocking(move || nix::sys::statvfs::statvfs(&volume_path))
            .await
            .map_err(|e| Status::internal(format!("Volume stats task failed: {}", e)))?
            .map_err(|e| Status::internal(format!("Failed to get volume stats: {}", e)))?;

        let block_size = stats.fragment_size() as i64;
        let total_bytes = stats.blocks() as i64 * block_size;
        let available_bytes = stats.blocks_available() as i64 * block_size;
        let used_bytes = total_bytes - stats.blocks_free() as i64 * block_size;

        let total_inodes = stats.files() as i64;
        let available_inodes = stats.files_available() as i64;
        let used_inodes = total_inodes - stats.files_free() as i64;

        Ok(Response::new(NodeGetVolumeStatsResponse {
            usage: vec![
                crate::csi::proto::VolumeUsage {
                    total: total_bytes,
                    available: available_bytes,
                    used: used_bytes,
                    unit: crate::csi::proto::volume_usage::Unit::Bytes as i32,
                },
                crate::csi::proto::VolumeUsage {
                    total: total_inodes,
                    available: available_inodes,
                    used: used_inodes,
                    unit: crate::csi::proto::volume_usage::Unit::Inodes as i32,
                },
            ],
            volume_condition: None,
        }))
    }

    async fn node_expand_volume(
        &self,
        _request: Request<NodeExpandVolumeRequest>,
    ) -> Result<Response<NodeExpandVolumeResponse>, Status> {
        Err(Status::unimplemented("Bucket volumes have no size to expand"))
    }

    async fn node_get_capabilities(
        &self,
        _request: Request<NodeGetCapabilitiesRequest>,
    ) -> Result<Response<NodeGetCapabilitiesResponse>, Status> {
        use crate::csi::proto::node_service_capability::{Rpc, rpc::Type};

        let capabilities = vec![Type::GetVolumeStats]
            .into_iter()
            .map(|t| crate::csi::proto::NodeServiceCapability {
                r#type: Some(crate::csi::proto::node_service_capability::Type::Rpc(Rpc {
                    r#type: t as i32,
                })),
            })
            .collect();

        Ok(Response::new(NodeGetCapabilitiesResponse { capabilities }))
    }

    async fn node_get_info(
        &self,
        _request: Request<NodeGetInfoRequest>,
    ) -> Result<Response<NodeGetInfoResponse>, Status> {
        Ok(Response::new(NodeGetInfoResponse {
            node_id: self.node_id.clone(),
            max_volumes_per_node: 0, // No limit
            accessible_topology: None,
        }))
    }
}
