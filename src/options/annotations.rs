use std::collections::BTreeMap;
use thiserror::Error;

use super::{CacheMode, quantity};

pub const ANNOTATION_PREFIX: &str = "gke-gcsfuse/";
pub const INJECT_VOLUMES: &str = "gke-gcsfuse/volumes";
pub const DISABLE_FILE_CACHE: &str = "gke-gcsfuse/disable-file-cache";
pub const CUSTOM_CACHE_VOLUME: &str = "gke-gcsfuse/custom-cache-volume";
pub const READ_AHEAD_KB: &str = "gke-gcsfuse/read-ahead-kb";
pub const CPU_REQUEST: &str = "gke-gcsfuse/cpu-request";
pub const CPU_LIMIT: &str = "gke-gcsfuse/cpu-limit";
pub const MEMORY_REQUEST: &str = "gke-gcsfuse/memory-request";
pub const MEMORY_LIMIT: &str = "gke-gcsfuse/memory-limit";
pub const EPHEMERAL_STORAGE_REQUEST: &str = "gke-gcsfuse/ephemeral-storage-request";
pub const EPHEMERAL_STORAGE_LIMIT: &str = "gke-gcsfuse/ephemeral-storage-limit";
pub const UID: &str = "gke-gcsfuse/uid";
pub const GID: &str = "gke-gcsfuse/gid";
pub const FS_GROUP: &str = "gke-gcsfuse/fs-group";
/// Set on the first mutation; its presence makes admission a no-op.
pub const SIDECAR_INJECTED: &str = "gke-gcsfuse/sidecar-injected";

/// Largest read-ahead accepted, in KiB.
pub const MAX_READ_AHEAD_KB: i64 = 131_072;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Malformed annotation {key}={value:?}: {reason}")]
pub struct AnnotationError {
    pub key: String,
    pub value: String,
    pub reason: String,
}

impl AnnotationError {
    fn new(key: &str, value: &str, reason: impl Into<String>) -> Self {
        Self { key: key.to_string(), value: value.to_string(), reason: reason.into() }
    }
}

/// Resource overrides for the helper container, as validated quantity strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HelperResources {
    pub cpu_request: Option<String>,
    pub cpu_limit: Option<String>,
    pub memory_request: Option<String>,
    pub memory_limit: Option<String>,
    pub ephemeral_storage_request: Option<String>,
    pub ephemeral_storage_limit: Option<String>,
}

/// Everything the driver reads from a pod's annotations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodAnnotations {
    pub inject_requested: bool,
    pub already_injected: bool,
    pub cache: CacheMode,
    pub read_ahead_kb: Option<u32>,
    pub resources: HelperResources,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub fs_group: Option<u32>,
}

impl PodAnnotations {
    /// Parse the recognized annotations.
    ///
    /// Unparseable values fail the whole parse; values outside their physical
    /// range are clamped and reported in the returned warnings.
    pub fn parse(
        annotations: &BTreeMap<String, String>,
    ) -> Result<(Self, Vec<String>), AnnotationError> {
        let mut warnings = Vec::new();
        let get = |key: &str| annotations.get(key).map(|v| v.trim());

        let inject_requested = get(INJECT_VOLUMES).map(|v| parse_bool(INJECT_VOLUMES, v)).transpose()?;
        let already_injected =
            get(SIDECAR_INJECTED).map(|v| parse_bool(SIDECAR_INJECTED, v)).transpose()?;
        let disable_cache =
            get(DISABLE_FILE_CACHE).map(|v| parse_bool(DISABLE_FILE_CACHE, v)).transpose()?;

        let cache = match (disable_cache.unwrap_or(false), get(CUSTOM_CACHE_VOLUME)) {
            (true, Some(custom)) => {
                warnings.push(format!(
                    "{DISABLE_FILE_CACHE} is set, ignoring {CUSTOM_CACHE_VOLUME}={custom}"
                ));
                CacheMode::Disabled
            }
            (true, None) => CacheMode::Disabled,
            (false, Some("")) => {
                return Err(AnnotationError::new(CUSTOM_CACHE_VOLUME, "", "empty volume name"));
            }
            (false, Some(custom)) => CacheMode::Custom(custom.to_string()),
            (false, None) => CacheMode::Ephemeral,
        };

        let read_ahead_kb = match get(READ_AHEAD_KB) {
            Some(value) => {
                let parsed: i64 = value
                    .parse()
                    .map_err(|_| AnnotationError::new(READ_AHEAD_KB, value, "not an integer"))?;
                let clamped = parsed.clamp(0, MAX_READ_AHEAD_KB);
                if clamped != parsed {
                    warnings.push(format!("{READ_AHEAD_KB}={parsed} clamped to {clamped}"));
                }
                Some(clamped as u32)
            }
            None => None,
        };

        let mut quantity = |key: &str| -> Result<Option<String>, AnnotationError> {
            let Some(value) = get(key) else {
                return Ok(None);
            };
            let negative =
                quantity::validate(value).map_err(|reason| AnnotationError::new(key, value, reason))?;
            if negative {
                warnings.push(format!("{key}={value} is negative, clamped to 0"));
                return Ok(Some("0".to_string()));
            }
            Ok(Some(value.to_string()))
        };

        let resources = HelperResources {
            cpu_request: quantity(CPU_REQUEST)?,
            cpu_limit: quantity(CPU_LIMIT)?,
            memory_request: quantity(MEMORY_REQUEST)?,
            memory_limit: quantity(MEMORY_LIMIT)?,
            ephemeral_storage_request: quantity(EPHEMERAL_STORAGE_REQUEST)?,
            ephemeral_storage_limit: quantity(EPHEMERAL_STORAGE_LIMIT)?,
        };

        let parsed = Self {
            inject_requested: inject_requested.unwrap_or(false),
            already_injected: already_injected.unwrap_or(false),
            cache,
            read_ahead_kb,
            resources,
            uid: get(UID).map(|v| parse_id(UID, v)).transpose()?,
            gid: get(GID).map(|v| parse_id(GID, v)).transpose()?,
            fs_group: get(FS_GROUP).map(|v| parse_id(FS_GROUP, v)).transpose()?,
        };
        Ok((parsed, warnings))
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, AnnotationError> {
    match value.to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(AnnotationError::new(key, value, "expected true or false")),
    }
}

fn parse_id(key: &str, value: &str) -> Result<u32, AnnotationError> {
    value
        .parse::<u32>()
        .map_err(|_| AnnotationError::new(key, value, "expected a non-negative 32-bit id"))
}
