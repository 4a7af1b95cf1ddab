use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};

use super::NodeError;
use crate::options::helper_owned_flag;
use crate::protocol::BaseCredential;

pub const POD_NAME: &str = "csi.storage.k8s.io/pod.name";
pub const POD_NAMESPACE: &str = "csi.storage.k8s.io/pod.namespace";
pub const POD_UID: &str = "csi.storage.k8s.io/pod.uid";
pub const EPHEMERAL: &str = "csi.storage.k8s.io/ephemeral";
pub const SERVICE_ACCOUNT_TOKENS: &str = "csi.storage.k8s.io/serviceAccount.tokens";

pub const BUCKET_NAME: &str = "bucketName";
pub const IMPLICIT_DIRS: &str = "implicitDirs";
pub const MOUNT_OPTIONS: &str = "mountOptions";
pub const DISABLE_FILE_CACHE: &str = "disableFileCache";

#[derive(Debug, Deserialize)]
struct ServiceAccountToken {
    token: String,
    #[serde(rename = "expirationTimestamp")]
    expiration: DateTime<Utc>,
}

/// What kubelet and the volume attributes tell us about one publish call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolumeContext {
    pub pod_name: Option<String>,
    pub pod_namespace: Option<String>,
    pub pod_uid: Option<String>,
    pub ephemeral: bool,
    pub bucket: Option<String>,
    pub implicit_dirs: bool,
    pub disable_cache: bool,
    pub mount_options: Vec<String>,
    pub credential: Option<BaseCredential>,
}

impl VolumeContext {
    pub fn parse(context: &HashMap<String, String>) -> Result<Self, NodeError> {
        let get = |key: &str| context.get(key).map(|v| v.trim()).filter(|v| !v.is_empty());

        let credential = match get(SERVICE_ACCOUNT_TOKENS) {
            Some(raw) => parse_tokens(raw)?,
            None => None,
        };

        let mount_options: Vec<String> = get(MOUNT_OPTIONS)
            .map(|raw| raw.split(',').map(str::trim).filter(|o| !o.is_empty()).map(str::to_string).collect())
            .unwrap_or_default();
        check_mount_options(MOUNT_OPTIONS, &mount_options)?;

        Ok(Self {
            pod_name: get(POD_NAME).map(str::to_string),
            pod_namespace: get(POD_NAMESPACE).map(str::to_string),
            pod_uid: get(POD_UID).map(str::to_string),
            ephemeral: parse_flag(EPHEMERAL, get(EPHEMERAL))?,
            bucket: get(BUCKET_NAME).map(str::to_string),
            implicit_dirs: parse_flag(IMPLICIT_DIRS, get(IMPLICIT_DIRS))?,
            disable_cache: parse_flag(DISABLE_FILE_CACHE, get(DISABLE_FILE_CACHE))?,
            mount_options,
            credential,
        })
    }

    /// Bucket to mount. Inline volumes have no meaningful handle and must name
    /// the bucket; persistent volumes fall back to the volume handle.
    pub fn bucket<'a>(&'a self, volume_id: &'a str) -> Result<&'a str, NodeError> {
        match (&self.bucket, self.ephemeral) {
            (Some(bucket), _) => Ok(bucket),
            (None, true) => Err(NodeError::InvalidArgument(format!(
                "inline volume {volume_id} needs the {BUCKET_NAME} attribute"
            ))),
            (None, false) => Ok(volume_id),
        }
    }

    /// Kubelet's pod uid, when given, must be the pod the target path belongs to.
    pub fn check_pod_uid(&self, target_pod_uid: &str) -> Result<(), NodeError> {
        match self.pod_uid.as_deref() {
            Some(uid) if uid != target_pod_uid => Err(NodeError::InvalidArgument(format!(
                "volume context pod uid {uid} does not own target path of pod {target_pod_uid}"
            ))),
            _ => Ok(()),
        }
    }
}

/// Reject user mount options that would override a helper-owned flag.
pub fn check_mount_options(source: &str, options: &[String]) -> Result<(), NodeError> {
    match options.iter().find_map(|o| helper_owned_flag(o).map(|flag| (o, flag))) {
        Some((option, flag)) => Err(NodeError::InvalidArgument(format!(
            "{source} entry {option:?} sets {flag}, which the mount helper manages"
        ))),
        None => Ok(()),
    }
}

fn parse_flag(key: &str, value: Option<&str>) -> Result<bool, NodeError> {
    match value.map(str::to_ascii_lowercase).as_deref() {
        None | Some("false") => Ok(false),
        Some("true") => Ok(true),
        Some(other) => Err(NodeError::InvalidArgument(format!(
            "volume attribute {key} must be true or false, got {other:?}"
        ))),
    }
}

// {"<audience>": {"token": "...", "expirationTimestamp": "..."}}
fn parse_tokens(raw: &str) -> Result<Option<BaseCredential>, NodeError> {
    let tokens: BTreeMap<String, ServiceAccountToken> = serde_json::from_str(raw).map_err(|e| {
        NodeError::InvalidArgument(format!("malformed {SERVICE_ACCOUNT_TOKENS}: {e}"))
    })?;

    Ok(tokens.into_values().next().map(|t| BaseCredential {
        access_token: t.token,
        expiry: t.expiration,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_parse_inline_volume_context() {
        let ctx = VolumeContext::parse(&context(&[
            (POD_NAME, "web-0"),
            (POD_NAMESPACE, "prod"),
            (POD_UID, "uid-1"),
            (EPHEMERAL, "true"),
            (BUCKET_NAME, "b1"),
            (IMPLICIT_DIRS, "True"),
            (MOUNT_OPTIONS, "stat-cache-ttl=60s, ,debug_fuse"),
        ]))
        .unwrap();

        assert_eq!(ctx.pod_name.as_deref(), Some("web-0"));
        assert_eq!(ctx.pod_namespace.as_deref(), Some("prod"));
        assert!(ctx.ephemeral);
        assert!(ctx.implicit_dirs);
        assert!(!ctx.disable_cache);
        assert_eq!(ctx.bucket("handle").unwrap(), "b1");
        assert!(ctx.check_pod_uid("uid-1").is_ok());
        assert_eq!(ctx.mount_options, vec!["stat-cache-ttl=60s", "debug_fuse"]);
        assert!(ctx.credential.is_none());
    }

    #[test]
    fn test_persistent_volume_bucket_defaults_to_volume_handle() {
        let ctx = VolumeContext::parse(&HashMap::new()).unwrap();
        assert_eq!(ctx.bucket("my-bucket").unwrap(), "my-bucket");
    }

    #[test]
    fn test_inline_volume_requires_bucket_name() {
        let ctx = VolumeContext::parse(&context(&[(EPHEMERAL, "true")])).unwrap();
        let err = ctx.bucket("csi-4f1d0e").unwrap_err();
        assert!(matches!(err, NodeError::InvalidArgument(msg) if msg.contains(BUCKET_NAME)));
    }

    #[test]
    fn test_pod_uid_must_match_target() {
        let ctx = VolumeContext::parse(&context(&[(POD_UID, "uid-1")])).unwrap();
        assert!(ctx.check_pod_uid("uid-1").is_ok());
        assert!(matches!(ctx.check_pod_uid("uid-2"), Err(NodeError::InvalidArgument(_))));
        assert!(VolumeContext::default().check_pod_uid("uid-2").is_ok());
    }

    #[test]
    fn test_mount_options_cannot_override_helper_flags() {
        for options in ["token-url=http://attacker", "implicit-dirs,cache-dir=/etc", "o=rw", "--uid=0"] {
            let err = VolumeContext::parse(&context(&[(MOUNT_OPTIONS, options)])).unwrap_err();
            assert!(matches!(err, NodeError::InvalidArgument(_)), "{options}");
        }
    }

    #[test]
    fn test_service_account_token_becomes_base_credential() {
        let tokens = r#"{"my-project.svc.id.goog":{"token":"eyJhbGci","expirationTimestamp":"2030-01-01T00:00:00Z"}}"#;
        let ctx = VolumeContext::parse(&context(&[(SERVICE_ACCOUNT_TOKENS, tokens)])).unwrap();

        let credential = ctx.credential.unwrap();
        assert_eq!(credential.access_token, "eyJhbGci");
        assert_eq!(credential.expiry.to_rfc3339(), "2030-01-01T00:00:00+00:00");
    }

    #[test]
    fn test_malformed_attributes_are_invalid_arguments() {
        for (key, value) in [(IMPLICIT_DIRS, "yes"), (SERVICE_ACCOUNT_TOKENS, "{not json")] {
            let err = VolumeContext::parse(&context(&[(key, value)])).unwrap_err();
            assert!(matches!(err, NodeError::InvalidArgument(_)), "{key}");
        }
    }
}
