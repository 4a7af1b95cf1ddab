//! Pod mutation: add the helper container and its companion volumes.
//!
//! [`inject`] is pure. It never fails admission: a pod whose annotations
//! cannot be interpreted is admitted unmodified with a warning, and its
//! volumes then fail at publish time with a precondition error.

use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, Pod, PodSecurityContext, ResourceRequirements,
    SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::config::Config;
use crate::options::annotations::SIDECAR_INJECTED;
use crate::options::{
    AnnotationError, CACHE_VOLUME_NAME, COMM_VOLUME_NAME, CacheMode, PodAnnotations,
    SIDECAR_CONTAINER_NAME,
};

/// Where the helper sees the communication volume.
pub const COMM_MOUNT_PATH: &str = "/gcsfuse-tmp";
/// Where the helper sees the cache volume.
pub const CACHE_MOUNT_PATH: &str = "/gcsfuse-cache";

#[derive(Error, Debug)]
pub enum AdmissionError {
    #[error(transparent)]
    Annotation(#[from] AnnotationError),

    #[error("Custom cache volume {0:?} is not a volume of this pod")]
    UnknownCacheVolume(String),

    #[error("Pod has no spec")]
    MissingSpec,
}

/// Settings the injector needs, flattened from [`Config`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectorConfig {
    pub driver_name: String,
    pub sidecar_image: String,
    pub image_pull_policy: String,
    pub cpu_request: String,
    pub memory_request: String,
    pub ephemeral_storage_request: String,
}

impl InjectorConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            driver_name: config.driver.name.clone(),
            sidecar_image: config.webhook.sidecar_image.clone(),
            image_pull_policy: config.webhook.image_pull_policy.clone(),
            cpu_request: config.webhook.cpu_request.clone(),
            memory_request: config.webhook.memory_request.clone(),
            ephemeral_storage_request: config.webhook.ephemeral_storage_request.clone(),
        }
    }
}

impl Default for InjectorConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

#[derive(Debug, Default)]
pub struct InjectionOutcome {
    /// The mutated pod, `None` when the pod is admitted unchanged.
    pub patched: Option<Pod>,
    pub warnings: Vec<String>,
    pub error: Option<AdmissionError>,
}

impl InjectionOutcome {
    fn unchanged() -> Self {
        Self::default()
    }

    fn rejected(error: AdmissionError) -> Self {
        Self {
            patched: None,
            warnings: vec![format!("gcsfuse sidecar not injected: {error}")],
            error: Some(error),
        }
    }
}

/// Whether any inline volume of the pod is served by the driver.
fn uses_driver(pod: &Pod, driver_name: &str) -> bool {
    pod.spec
        .as_ref()
        .and_then(|spec| spec.volumes.as_ref())
        .is_some_and(|volumes| volumes.iter().any(|v| v.csi.as_ref().is_some_and(|csi| csi.driver == driver_name)))
}

fn has_helper_container(pod: &Pod) -> bool {
    pod.spec.as_ref().is_some_and(|spec| {
        spec.containers
            .iter()
            .chain(spec.init_containers.iter().flatten())
            .any(|c| c.name == SIDECAR_CONTAINER_NAME)
    })
}

pub fn inject(pod: &Pod, config: &InjectorConfig) -> InjectionOutcome {
    if has_helper_container(pod) {
        return InjectionOutcome::unchanged();
    }

    let empty = BTreeMap::new();
    let (annotations, warnings) =
        match PodAnnotations::parse(pod.metadata.annotations.as_ref().unwrap_or(&empty)) {
            Ok(parsed) => parsed,
            Err(e) => return InjectionOutcome::rejected(e.into()),
        };
    if annotations.already_injected
        || !(annotations.inject_requested || uses_driver(pod, &config.driver_name))
    {
        return InjectionOutcome::unchanged();
    }

    match mutate(pod, &annotations, config) {
        Ok(patched) => InjectionOutcome { patched: Some(patched), warnings, error: None },
        Err(e) => {
            let mut outcome = InjectionOutcome::rejected(e);
            outcome.warnings.extend(warnings);
            outcome
        }
    }
}

fn mutate(
    pod: &Pod,
    annotations: &PodAnnotations,
    config: &InjectorConfig,
) -> Result<Pod, AdmissionError> {
    let mut pod = pod.clone();
    let spec = pod.spec.as_mut().ok_or(AdmissionError::MissingSpec)?;

    let cache_volume = match &annotations.cache {
        CacheMode::Disabled => None,
        CacheMode::Ephemeral => Some(CACHE_VOLUME_NAME.to_string()),
        CacheMode::Custom(name) => {
            let exists = spec.volumes.iter().flatten().any(|v| &v.name == name);
            if !exists {
                return Err(AdmissionError::UnknownCacheVolume(name.clone()));
            }
            Some(name.clone())
        }
    };

    spec.containers.insert(0, helper_container(annotations, config, cache_volume.as_deref()));

    let volumes = spec.volumes.get_or_insert_with(Vec::new);
    volumes.push(empty_dir(COMM_VOLUME_NAME));
    if annotations.cache == CacheMode::Ephemeral {
        volumes.push(empty_dir(CACHE_VOLUME_NAME));
    }

    if let Some(fs_group) = annotations.fs_group {
        spec.security_context.get_or_insert_with(PodSecurityContext::default).fs_group =
            Some(i64::from(fs_group));
    }

    pod.metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(SIDECAR_INJECTED.to_string(), "true".to_string());

    Ok(pod)
}

fn helper_container(
    annotations: &PodAnnotations,
    config: &InjectorConfig,
    cache_volume: Option<&str>,
) -> Container {
    let mut args = vec!["sidecar".to_string(), format!("--comm-dir={COMM_MOUNT_PATH}")];
    let mut volume_mounts = vec![VolumeMount {
        name: COMM_VOLUME_NAME.to_string(),
        mount_path: COMM_MOUNT_PATH.to_string(),
        mount_propagation: Some("Bidirectional".to_string()),
        ..Default::default()
    }];

    if let Some(volume) = cache_volume {
        args.push(format!("--cache-root={CACHE_MOUNT_PATH}"));
        volume_mounts.push(VolumeMount {
            name: volume.to_string(),
            mount_path: CACHE_MOUNT_PATH.to_string(),
            ..Default::default()
        });
    }

    Container {
        name: SIDECAR_CONTAINER_NAME.to_string(),
        image: Some(config.sidecar_image.clone()),
        image_pull_policy: Some(config.image_pull_policy.clone()),
        args: Some(args),
        volume_mounts: Some(volume_mounts),
        resources: Some(resources(annotations, config)),
        security_context: Some(SecurityContext { privileged: Some(true), ..Default::default() }),
        ..Default::default()
    }
}

fn resources(annotations: &PodAnnotations, config: &InjectorConfig) -> ResourceRequirements {
    let ask = &annotations.resources;
    let requests: BTreeMap<String, Quantity> = [
        ("cpu", ask.cpu_request.as_ref().unwrap_or(&config.cpu_request)),
        ("memory", ask.memory_request.as_ref().unwrap_or(&config.memory_request)),
        (
            "ephemeral-storage",
            ask.ephemeral_storage_request.as_ref().unwrap_or(&config.ephemeral_storage_request),
        ),
    ]
    .into_iter()
    .map(|(name, value)| (name.to_string(), Quantity(value.clone())))
    .collect();

    let limits: BTreeMap<String, Quantity> = [
        ("cpu", &ask.cpu_limit),
        ("memory", &ask.memory_limit),
        ("ephemeral-storage", &ask.ephemeral_storage_limit),
    ]
    .into_iter()
    .filter_map(|(name, value)| value.as_ref().map(|v| (name.to_string(), Quantity(v.clone()))))
    .collect();

    ResourceRequirements {
        requests: Some(requests),
        limits: (!limits.is_empty()).then_some(limits),
        ..Default::default()
    }
}

fn empty_dir(name: &str) -> Volume {
    Volume {
        name: name.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{CSIVolumeSource, PodSpec};
    use kube::api::ObjectMeta;

    const DRIVER: &str = "gcsfuse.csi.storage.gke.io";

    fn pod(annotations: &[(&str, &str)], volumes: Vec<Volume>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("web".into()),
                namespace: Some("prod".into()),
                annotations: Some(
                    annotations.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
                ),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container { name: "app".into(), ..Default::default() }],
                volumes: Some(volumes),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn csi_volume(name: &str) -> Volume {
        Volume {
            name: name.into(),
            csi: Some(CSIVolumeSource { driver: DRIVER.into(), ..Default::default() }),
            ..Default::default()
        }
    }

    fn volume_names(pod: &Pod) -> Vec<String> {
        pod.spec.as_ref().unwrap().volumes.iter().flatten().map(|v| v.name.clone()).collect()
    }

    #[test]
    fn test_pod_without_bucket_volume_is_untouched() {
        let outcome = inject(&pod(&[], vec![]), &InjectorConfig::default());
        assert!(outcome.patched.is_none());
        assert!(outcome.warnings.is_empty());
    }

    #[test]
    fn test_inline_volume_triggers_injection() {
        let outcome = inject(&pod(&[], vec![csi_volume("data")]), &InjectorConfig::default());
        let patched = outcome.patched.unwrap();
        let spec = patched.spec.as_ref().unwrap();

        assert_eq!(spec.containers[0].name, SIDECAR_CONTAINER_NAME);
        assert_eq!(spec.containers[1].name, "app");
        assert_eq!(volume_names(&patched), vec!["data", COMM_VOLUME_NAME, CACHE_VOLUME_NAME]);
        assert_eq!(
            patched.metadata.annotations.as_ref().unwrap().get(SIDECAR_INJECTED).map(String::as_str),
            Some("true")
        );

        let helper = &spec.containers[0];
        assert_eq!(helper.security_context.as_ref().unwrap().privileged, Some(true));
        let mounts = helper.volume_mounts.as_ref().unwrap();
        assert_eq!(mounts[0].mount_propagation.as_deref(), Some("Bidirectional"));
        assert_eq!(mounts[1].mount_path, CACHE_MOUNT_PATH);
    }

    #[test]
    fn test_opt_in_annotation_triggers_injection() {
        let outcome = inject(&pod(&[("gke-gcsfuse/volumes", "true")], vec![]), &InjectorConfig::default());
        assert!(outcome.patched.is_some());
    }

    #[test]
    fn test_injection_is_idempotent() {
        let config = InjectorConfig::default();
        let once = inject(&pod(&[], vec![csi_volume("data")]), &config).patched.unwrap();
        assert!(inject(&once, &config).patched.is_none());
    }

    #[test]
    fn test_opt_out_values_do_not_trigger_injection() {
        let config = InjectorConfig::default();
        assert!(inject(&pod(&[("gke-gcsfuse/volumes", "false")], vec![]), &config).patched.is_none());
        assert!(inject(&pod(&[("gke-gcsfuse/volumes", "FALSE")], vec![]), &config).patched.is_none());
        assert!(inject(&pod(&[("gke-gcsfuse/volumes", "True")], vec![]), &config).patched.is_some());
    }

    #[test]
    fn test_injected_marker_is_read_as_a_flag() {
        let config = InjectorConfig::default();
        let marked = pod(&[("gke-gcsfuse/sidecar-injected", "true")], vec![csi_volume("data")]);
        assert!(inject(&marked, &config).patched.is_none());

        let cleared = pod(&[("gke-gcsfuse/sidecar-injected", "false")], vec![csi_volume("data")]);
        assert!(inject(&cleared, &config).patched.is_some());
    }

    #[test]
    fn test_existing_helper_container_is_respected() {
        let mut existing = pod(&[], vec![csi_volume("data")]);
        existing.spec.as_mut().unwrap().containers.push(Container {
            name: SIDECAR_CONTAINER_NAME.into(),
            ..Default::default()
        });
        assert!(inject(&existing, &InjectorConfig::default()).patched.is_none());
    }

    #[test]
    fn test_disabled_cache_adds_no_cache_volume() {
        let outcome = inject(
            &pod(&[("gke-gcsfuse/disable-file-cache", "true")], vec![csi_volume("data")]),
            &InjectorConfig::default(),
        );
        let patched = outcome.patched.unwrap();
        assert_eq!(volume_names(&patched), vec!["data", COMM_VOLUME_NAME]);

        let helper = &patched.spec.as_ref().unwrap().containers[0];
        assert_eq!(helper.volume_mounts.as_ref().unwrap().len(), 1);
        assert!(!helper.args.as_ref().unwrap().iter().any(|a| a.starts_with("--cache-root")));
    }

    #[test]
    fn test_custom_cache_volume_is_mounted() {
        let cache = Volume { name: "fast-ssd".into(), ..Default::default() };
        let outcome = inject(
            &pod(&[("gke-gcsfuse/custom-cache-volume", "fast-ssd")], vec![csi_volume("data"), cache]),
            &InjectorConfig::default(),
        );
        let patched = outcome.patched.unwrap();
        assert_eq!(volume_names(&patched), vec!["data", "fast-ssd", COMM_VOLUME_NAME]);

        let helper = &patched.spec.as_ref().unwrap().containers[0];
        assert_eq!(helper.volume_mounts.as_ref().unwrap()[1].name, "fast-ssd");
    }

    #[test]
    fn test_unknown_custom_cache_volume_is_rejected() {
        let outcome = inject(
            &pod(&[("gke-gcsfuse/custom-cache-volume", "missing")], vec![csi_volume("data")]),
            &InjectorConfig::default(),
        );
        assert!(outcome.patched.is_none());
        assert!(matches!(outcome.error, Some(AdmissionError::UnknownCacheVolume(_))));
        assert_eq!(outcome.warnings.len(), 1);
    }

    #[test]
    fn test_malformed_annotation_admits_unmodified() {
        let outcome = inject(
            &pod(&[("gke-gcsfuse/cpu-limit", "lots")], vec![csi_volume("data")]),
            &InjectorConfig::default(),
        );
        assert!(outcome.patched.is_none());
        assert!(matches!(outcome.error, Some(AdmissionError::Annotation(_))));
        assert!(outcome.warnings[0].contains("gke-gcsfuse/cpu-limit"));
    }

    #[test]
    fn test_resources_from_annotations_and_config() {
        let outcome = inject(
            &pod(
                &[("gke-gcsfuse/memory-request", "1Gi"), ("gke-gcsfuse/cpu-limit", "-2")],
                vec![csi_volume("data")],
            ),
            &InjectorConfig::default(),
        );
        assert_eq!(outcome.warnings.len(), 1);

        let patched = outcome.patched.unwrap();
        let resources = patched.spec.as_ref().unwrap().containers[0].resources.clone().unwrap();
        let requests = resources.requests.unwrap();
        assert_eq!(requests["memory"], Quantity("1Gi".into()));
        assert_eq!(requests["cpu"], Quantity("250m".into()));
        assert_eq!(resources.limits.unwrap()["cpu"], Quantity("0".into()));
    }

    #[test]
    fn test_fs_group_is_applied() {
        let outcome = inject(
            &pod(&[("gke-gcsfuse/fs-group", "2000")], vec![csi_volume("data")]),
            &InjectorConfig::default(),
        );
        let patched = outcome.patched.unwrap();
        let security = patched.spec.unwrap().security_context.unwrap();
        assert_eq!(security.fs_group, Some(2000));
    }

    #[test]
    fn test_other_driver_is_ignored() {
        let mut volume = csi_volume("data");
        volume.csi.as_mut().unwrap().driver = "other.csi.example.com".into();
        assert!(inject(&pod(&[], vec![volume]), &InjectorConfig::default()).patched.is_none());
    }
}
