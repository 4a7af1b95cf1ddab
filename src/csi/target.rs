use std::path::{Component, Path, PathBuf};

use crate::options::COMM_VOLUME_NAME;

const CSI_PLUGIN_DIR: &str = "kubernetes.io~csi";
const EMPTY_DIR_PLUGIN_DIR: &str = "kubernetes.io~empty-dir";

/// The (pod, volume) a kubelet target path belongs to.
///
/// Kubelet publishes CSI volumes at
/// `<kubelet-root>/pods/<pod-uid>/volumes/kubernetes.io~csi/<volume>/mount`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetPath {
    pub pod_uid: String,
    pub volume: String,
}

impl TargetPath {
    pub fn new(pod_uid: impl Into<String>, volume: impl Into<String>) -> Self {
        Self { pod_uid: pod_uid.into(), volume: volume.into() }
    }

    pub fn parse(kubelet_root: &Path, target: &Path) -> Option<Self> {
        let relative = target.strip_prefix(kubelet_root.join("pods")).ok()?;
        let parts: Vec<&str> = relative
            .components()
            .map(|c| match c {
                Component::Normal(part) => part.to_str(),
                _ => None,
            })
            .collect::<Option<_>>()?;

        match parts.as_slice() {
            [uid, "volumes", CSI_PLUGIN_DIR, volume, "mount"] => Some(Self::new(*uid, *volume)),
            _ => None,
        }
    }

    pub fn format(&self, kubelet_root: &Path) -> PathBuf {
        pod_dir(kubelet_root, &self.pod_uid)
            .join("volumes")
            .join(CSI_PLUGIN_DIR)
            .join(&self.volume)
            .join("mount")
    }

    /// Host view of the pod's communication volume.
    pub fn comm_dir(&self, kubelet_root: &Path) -> PathBuf {
        comm_dir(kubelet_root, &self.pod_uid)
    }
}

pub fn pod_dir(kubelet_root: &Path, pod_uid: &str) -> PathBuf {
    kubelet_root.join("pods").join(pod_uid)
}

pub fn comm_dir(kubelet_root: &Path, pod_uid: &str) -> PathBuf {
    pod_dir(kubelet_root, pod_uid).join("volumes").join(EMPTY_DIR_PLUGIN_DIR).join(COMM_VOLUME_NAME)
}
