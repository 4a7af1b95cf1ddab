//! Mount-option variants and their single point of interpretation.
//!
//! Pod annotations are parsed once into [`PodAnnotations`]; the admission
//! injector uses the result to shape the helper container and the node daemon
//! uses the same result to build each [`MountOptions`] it writes into a
//! request. Nothing downstream looks at raw annotation strings again.

pub mod annotations;
pub mod quantity;

pub use annotations::{AnnotationError, HelperResources, PodAnnotations};

use std::path::{Path, PathBuf};

use crate::protocol::MountOptions;

/// Name of the injected helper container.
pub const SIDECAR_CONTAINER_NAME: &str = "gke-gcsfuse-sidecar";
/// Pod-scoped emptyDir shared by the node daemon and the helper.
pub const COMM_VOLUME_NAME: &str = "gcsfuse-tmp";
/// Pod-scoped emptyDir backing the file cache.
pub const CACHE_VOLUME_NAME: &str = "gcsfuse-cache";

/// Flags the helper sets itself. User mount options may not carry them.
pub const HELPER_OWNED_FLAGS: &[&str] = &[
    "foreground",
    "token-url",
    "key-file",
    "cache-dir",
    "temp-dir",
    "uid",
    "gid",
    "o",
    "config-file",
];

/// The helper-owned flag that `flag` would set, if any. Accepts `name`,
/// `--name`, `name=value` and `-name value` spellings.
pub fn helper_owned_flag(flag: &str) -> Option<&'static str> {
    let name = flag.trim().trim_start_matches('-');
    let name = name.split(|c: char| c == '=' || c.is_whitespace()).next().unwrap_or_default();
    let name = name.replace('_', "-").to_ascii_lowercase();
    HELPER_OWNED_FLAGS.iter().copied().find(|owned| *owned == name)
}

/// Where a pod's file cache lives.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CacheMode {
    /// No cache volume; requests carry no cache directory.
    Disabled,
    /// A pod-scoped emptyDir added by the injector.
    #[default]
    Ephemeral,
    /// An existing pod volume named by the user.
    Custom(String),
}

impl CacheMode {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, CacheMode::Disabled)
    }
}

/// Per-volume inputs that do not come from pod annotations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolumeInputs {
    pub read_only: bool,
    pub implicit_dirs: bool,
    pub disable_cache: bool,
    pub extra_flags: Vec<String>,
}

/// Cache directory of one volume inside the helper's cache volume.
pub fn cache_dir_for(cache_root: &Path, volume: &str) -> PathBuf {
    cache_root.join(crate::protocol::layout::VOLUMES_DIR).join(volume)
}

/// Combine pod-level and volume-level choices into the options of one mount.
pub fn resolve_mount_options(
    pod: &PodAnnotations,
    volume: &VolumeInputs,
    cache_root: &Path,
    volume_name: &str,
) -> MountOptions {
    let cache_dir = (pod.cache.is_enabled() && !volume.disable_cache)
        .then(|| cache_dir_for(cache_root, volume_name));

    MountOptions {
        read_only: volume.read_only,
        implicit_dirs: volume.implicit_dirs,
        read_ahead_kb: pod.read_ahead_kb,
        cache_dir,
        uid: pod.uid,
        gid: pod.gid,
        extra_flags: volume.extra_flags.clone(),
    }
}
