// End-to-end volume lifecycle: the node service and a real sidecar mounter
// talk through one communication directory. The mount executable is a shell
// script and a directory containing `.ready` counts as a mounted filesystem.

use async_trait::async_trait;
use gcsfuse_csi::config::{NodeConfig, SidecarConfig};
use gcsfuse_csi::csi::proto::{
    NodePublishVolumeRequest, NodeUnpublishVolumeRequest, VolumeCapability, volume_capability,
};
use gcsfuse_csi::csi::{NodeError, NodeService, PodInfo, PodLookup, TargetPath, VolumePhase};
use gcsfuse_csi::error::FailureKind;
use gcsfuse_csi::mount::{MountEntry, MountError, Mounter};
use gcsfuse_csi::protocol::{CommDir, MountStatus};
use gcsfuse_csi::sidecar::SidecarMounter;
use gcsfuse_csi::token::TokenManager;
use std::collections::{HashMap, HashSet};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const POD_UID: &str = "u1";
const VOLUME: &str = "data";
const GRACE: Duration = Duration::from_secs(3);

const FAKE_MOUNT: &str = r#"#!/bin/sh
for arg; do bucket="$mp"; mp="$arg"; done
echo "$@" > "$mp/../args"
case "$bucket" in
  missing-*) echo "bucket $bucket does not exist" >&2; exit 3 ;;
esac
touch "$mp/.ready"
exec sleep 1000
"#;

#[derive(Default)]
struct HostMounter {
    binds: Mutex<HashSet<PathBuf>>,
}

#[async_trait]
impl Mounter for HostMounter {
    async fn bind_mount(&self, _source: &Path, target: &Path, _read_only: bool) -> Result<(), MountError> {
        self.binds.lock().unwrap().insert(target.to_path_buf());
        Ok(())
    }

    async fn unmount(&self, target: &Path, _lazy: bool) -> Result<(), MountError> {
        if self.binds.lock().unwrap().remove(target) {
            return Ok(());
        }
        match std::fs::remove_file(target.join(".ready")) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(MountError::Io(e)),
        }
    }

    async fn is_mount_point(&self, path: &Path) -> Result<bool, MountError> {
        Ok(self.binds.lock().unwrap().contains(path) || path.join(".ready").exists())
    }

    async fn list_mounts(&self) -> Result<Vec<MountEntry>, MountError> {
        Ok(self
            .binds
            .lock()
            .unwrap()
            .iter()
            .map(|target| MountEntry {
                mount_point: target.clone(),
                device: "0:61".into(),
                fs_type: "fuse.gcsfuse".into(),
                source: "my-bucket".into(),
            })
            .collect())
    }
}

struct InjectedPod;

#[async_trait]
impl PodLookup for InjectedPod {
    async fn get(&self, namespace: &str, name: &str) -> Result<PodInfo, NodeError> {
        Ok(PodInfo {
            namespace: namespace.into(),
            name: name.into(),
            uid: POD_UID.into(),
            annotations: Default::default(),
            has_helper: true,
        })
    }

    async fn invalidate(&self, _namespace: &str, _name: &str) {}
}

struct Cluster {
    tmp: TempDir,
    mounter: Arc<HostMounter>,
    node: NodeService,
    shutdown: CancellationToken,
    sidecar: JoinHandle<()>,
}

impl Cluster {
    fn start() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let mounter = Arc::new(HostMounter::default());
        let node = node_service(tmp.path(), mounter.clone());

        let script = tmp.path().join("fake-gcsfuse");
        std::fs::write(&script, FAKE_MOUNT).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let comm_dir = TargetPath::new(POD_UID, VOLUME).comm_dir(tmp.path());
        std::fs::create_dir_all(&comm_dir).unwrap();
        let config = SidecarConfig {
            comm_dir,
            cache_root: tmp.path().join("cache"),
            mount_binary: script.display().to_string(),
            scan_interval_ms: 20,
            ready_timeout_ms: 3_000,
            stop_grace_ms: 500,
            shutdown_grace_ms: 1_000,
            sysfs_bdi_dir: tmp.path().join("bdi"),
            ..Default::default()
        };

        let shutdown = CancellationToken::new();
        let mounter_for_sidecar: Arc<dyn Mounter> = mounter.clone();
        let sidecar = tokio::spawn({
            let shutdown = shutdown.clone();
            let helper = SidecarMounter::new(config, TokenManager::default(), mounter_for_sidecar);
            async move { helper.run(shutdown).await.unwrap() }
        });

        Self { tmp, mounter, node, shutdown, sidecar }
    }

    fn target(&self) -> PathBuf {
        TargetPath::new(POD_UID, VOLUME).format(self.tmp.path())
    }

    fn volume_dir(&self) -> gcsfuse_csi::protocol::VolumeDir {
        CommDir::new(TargetPath::new(POD_UID, VOLUME).comm_dir(self.tmp.path())).volume(VOLUME).unwrap()
    }

    fn publish_request(&self, bucket: &str) -> NodePublishVolumeRequest {
        let tokens = r#"{"my-project.svc.id.goog":{"token":"eyJhbGci","expirationTimestamp":"2099-01-01T00:00:00Z"}}"#;
        NodePublishVolumeRequest {
            volume_id: "csi-9f3c".into(),
            target_path: self.target().display().to_string(),
            volume_capability: Some(VolumeCapability {
                access_type: Some(volume_capability::AccessType::Mount(Default::default())),
                access_mode: None,
            }),
            volume_context: HashMap::from([
                ("csi.storage.k8s.io/pod.name".to_string(), "web".to_string()),
                ("csi.storage.k8s.io/pod.namespace".to_string(), "prod".to_string()),
                ("csi.storage.k8s.io/ephemeral".to_string(), "true".to_string()),
                ("csi.storage.k8s.io/serviceAccount.tokens".to_string(), tokens.to_string()),
                ("bucketName".to_string(), bucket.to_string()),
                ("implicitDirs".to_string(), "true".to_string()),
            ]),
            ..Default::default()
        }
    }

    fn unpublish_request(&self) -> NodeUnpublishVolumeRequest {
        NodeUnpublishVolumeRequest {
            volume_id: "csi-9f3c".into(),
            target_path: self.target().display().to_string(),
        }
    }

    fn args(&self) -> String {
        std::fs::read_to_string(self.volume_dir().path().join("args")).unwrap()
    }
}

fn node_service(root: &Path, mounter: Arc<HostMounter>) -> NodeService {
    let config = NodeConfig {
        kubelet_root_dir: root.to_path_buf(),
        publish_timeout_ms: 5_000,
        poll_initial_ms: 10,
        poll_max_ms: 50,
        unpublish_grace_ms: 3_000,
        ..Default::default()
    };
    NodeService::new("node-1", config, root.join("cache"), mounter, Arc::new(InjectedPod))
}

#[tokio::test]
async fn test_publish_and_unpublish_through_sidecar() {
    let cluster = Cluster::start();

    cluster.node.publish(&cluster.publish_request("my-bucket"), Duration::from_secs(5)).await.unwrap();

    let dir = cluster.volume_dir();
    assert!(dir.mount_dir().join(".ready").exists());
    assert!(cluster.mounter.is_mount_point(&cluster.target()).await.unwrap());
    assert!(dir.read_status().await.unwrap().unwrap().is_running());
    let args = cluster.args();
    assert!(args.contains("--implicit-dirs"), "{args}");
    assert!(args.contains("--token-url unix://"), "{args}");
    assert!(args.contains("--cache-dir"), "{args}");

    cluster.node.unpublish(&cluster.unpublish_request(), GRACE).await.unwrap();

    assert!(!cluster.target().exists());
    assert!(!dir.mount_dir().join(".ready").exists());
    assert!(!dir.request_path().exists());
    assert!(!dir.cleanup_path().exists());
    assert!(cluster.node.table().is_empty());

    // The last volume is gone, so the helper exits without a shutdown signal.
    tokio::time::timeout(Duration::from_secs(5), cluster.sidecar).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_missing_bucket_fails_publish() {
    let cluster = Cluster::start();

    let err = cluster
        .node
        .publish(&cluster.publish_request("missing-bucket"), Duration::from_secs(5))
        .await
        .unwrap_err();
    match &err {
        NodeError::MountFailed { kind, message, .. } => {
            assert_eq!(*kind, FailureKind::MountProcessFailure);
            assert!(message.contains("does not exist"), "{message}");
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(!cluster.mounter.is_mount_point(&cluster.target()).await.unwrap());

    // Unpublish of a failed volume needs no helper round trip.
    cluster.node.unpublish(&cluster.unpublish_request(), GRACE).await.unwrap();
    assert!(!cluster.volume_dir().request_path().exists());

    cluster.shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), cluster.sidecar).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_restarted_node_recovers_published_volume() {
    let cluster = Cluster::start();
    cluster.node.publish(&cluster.publish_request("my-bucket"), Duration::from_secs(5)).await.unwrap();

    let restarted = node_service(cluster.tmp.path(), cluster.mounter.clone());
    let report = restarted.reconcile().await.unwrap();
    assert_eq!(report.mounted, 1);
    assert_eq!(
        restarted.table().phase(&TargetPath::new(POD_UID, VOLUME)),
        Some(VolumePhase::Mounted)
    );

    // Kubelet's periodic republish is answered from the rebuilt table.
    restarted.publish(&cluster.publish_request("my-bucket"), Duration::from_secs(5)).await.unwrap();
    let status = cluster.volume_dir().read_status().await.unwrap().unwrap();
    assert!(MountStatus::is_running(&status));

    restarted.unpublish(&cluster.unpublish_request(), GRACE).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), cluster.sidecar).await.unwrap().unwrap();
}
