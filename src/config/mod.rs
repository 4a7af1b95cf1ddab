use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub driver: DriverConfig,
    pub node: NodeConfig,
    pub sidecar: SidecarConfig,
    pub token: TokenConfig,
    pub webhook: WebhookConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// CSI driver name; inline volumes using it trigger sidecar injection.
    pub name: String,
}

/// Node daemon settings. Timings are policy, not structure, so all of them are tunable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub endpoint: String,
    pub node_id: Option<String>,
    pub kubelet_root_dir: PathBuf,
    pub publish_timeout_ms: u64,
    pub poll_initial_ms: u64,
    pub poll_max_ms: u64,
    pub poll_multiplier: f64,
    pub deadline_margin_ms: u64,
    pub unpublish_grace_ms: u64,
    pub pod_cache_ttl_secs: u64,
    pub metrics_addr: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SidecarConfig {
    pub comm_dir: PathBuf,
    pub cache_root: PathBuf,
    pub mount_binary: String,
    pub scan_interval_ms: u64,
    pub ready_timeout_ms: u64,
    pub stop_grace_ms: u64,
    pub shutdown_grace_ms: u64,
    pub refresh_margin_secs: u64,
    pub sysfs_bdi_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    pub expiry_delta_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub listen_addr: String,
    pub tls_cert_path: PathBuf,
    pub tls_key_path: PathBuf,
    pub sidecar_image: String,
    pub image_pull_policy: String,
    pub cpu_request: String,
    pub memory_request: String,
    pub ephemeral_storage_request: String,
}

impl Config {
    /// Load configuration from an optional file and `GCSFUSE_CSI__*` environment variables.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder();
        builder = match path {
            Some(path) => builder.add_source(config::File::from(path).required(true)),
            None => builder.add_source(config::File::with_name("gcsfuse-csi").required(false)),
        };

        let config = builder
            .add_source(config::Environment::with_prefix("GCSFUSE_CSI").separator("__"))
            .build()?;

        Ok(config.try_deserialize()?)
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self { name: "gcsfuse.csi.storage.gke.io".to_string() }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            endpoint: "unix:///csi/csi.sock".to_string(),
            node_id: None,
            kubelet_root_dir: PathBuf::from("/var/lib/kubelet"),
            publish_timeout_ms: 30_000,
            poll_initial_ms: 100,
            poll_max_ms: 2_000,
            poll_multiplier: 2.0,
            deadline_margin_ms: 1_000,
            unpublish_grace_ms: 15_000,
            pod_cache_ttl_secs: 30,
            metrics_addr: None,
        }
    }
}

impl NodeConfig {
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn unpublish_grace(&self) -> Duration {
        Duration::from_millis(self.unpublish_grace_ms)
    }

    pub fn deadline_margin(&self) -> Duration {
        Duration::from_millis(self.deadline_margin_ms)
    }
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            comm_dir: PathBuf::from("/gcsfuse-tmp"),
            cache_root: PathBuf::from("/gcsfuse-cache"),
            mount_binary: "gcsfuse".to_string(),
            scan_interval_ms: 500,
            ready_timeout_ms: 20_000,
            stop_grace_ms: 10_000,
            shutdown_grace_ms: 30_000,
            refresh_margin_secs: 300,
            sysfs_bdi_dir: PathBuf::from("/sys/class/bdi"),
        }
    }
}

impl SidecarConfig {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn refresh_margin(&self) -> Duration {
        Duration::from_secs(self.refresh_margin_secs)
    }
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self { expiry_delta_secs: 10 }
    }
}

impl TokenConfig {
    pub fn expiry_delta(&self) -> Duration {
        Duration::from_secs(self.expiry_delta_secs)
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:22030".to_string(),
            tls_cert_path: PathBuf::from("/etc/tls-certs/cert.pem"),
            tls_key_path: PathBuf::from("/etc/tls-certs/key.pem"),
            sidecar_image: "gcr.io/gke-release/gcsfuse-sidecar:latest".to_string(),
            image_pull_policy: "IfNotPresent".to_string(),
            cpu_request: "250m".to_string(),
            memory_request: "256Mi".to_string(),
            ephemeral_storage_request: "5Gi".to_string(),
        }
    }
}
