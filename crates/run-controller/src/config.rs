//! Run Controller Configuration
//!
//! Loaded once at startup from a mounted YAML file. Declares the target
//! namespace, the clusters runs may be placed on (with their user node pools),
//! the helper images injected into run pods and the sweeper timings.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Main controller configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ControllerConfig {
    /// Kubernetes placement configuration
    pub kubernetes: KubernetesConfig,

    /// Buffer plumbing images
    #[serde(default)]
    pub buffers: BufferConfig,

    /// Optional storage server exposed to run containers
    #[serde(default, rename = "storageServer")]
    pub storage_server: Option<StorageServerConfig>,

    /// Run defaults
    #[serde(default)]
    pub runs: RunDefaultsConfig,

    /// Reconciliation loop timings
    #[serde(default)]
    pub sweeper: SweeperConfig,

    /// Health endpoint server
    #[serde(default)]
    pub server: ServerConfig,

    /// Where archived run logs are written
    #[serde(default, rename = "logArchive")]
    pub log_archive: LogArchiveConfig,
}

/// Kubernetes configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KubernetesConfig {
    /// Namespace all run objects are created in
    pub namespace: String,

    /// Optional kubeconfig path; in-cluster configuration is inferred otherwise
    #[serde(default, rename = "kubeconfigPath")]
    pub kubeconfig_path: Option<String>,

    /// ServiceAccount for jobs that must wait on their workers (needs pod read access)
    #[serde(default = "default_job_service_account", rename = "jobServiceAccount")]
    pub job_service_account: String,

    /// ConfigMap carrying the no-op entrypoint used to pre-pull the main image
    #[serde(default = "default_no_op_config_map", rename = "noOpConfigMap")]
    pub no_op_config_map: String,

    /// Image with kubectl and nslookup used to wait for workers
    #[serde(default = "default_worker_waiter_image", rename = "workerWaiterImage")]
    pub worker_waiter_image: String,

    /// Declared clusters keyed by name
    #[serde(default)]
    pub clusters: BTreeMap<String, ClusterConfig>,
}

/// A cluster runs can be placed on
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ClusterConfig {
    pub region: String,

    /// The primary cluster is the default target for new runs
    #[serde(default, rename = "isPrimary")]
    pub is_primary: bool,

    /// User node pools keyed by their user-facing name
    #[serde(default, rename = "userNodePools")]
    pub user_node_pools: BTreeMap<String, NodePoolConfig>,
}

impl ClusterConfig {
    #[must_use]
    pub fn node_pool(&self, name: &str) -> Option<&NodePoolConfig> {
        self.user_node_pools.get(name)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct NodePoolConfig {
    #[serde(rename = "vmSize")]
    pub vm_size: String,
}

/// Buffer configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BufferConfig {
    /// Sidecar image bridging a buffer access URI and a named pipe
    #[serde(default = "default_buffer_proxy_image", rename = "bufferProxyImage")]
    pub buffer_proxy_image: String,

    /// Image used by the init container that creates the named pipes
    #[serde(default = "default_fifo_init_image", rename = "fifoInitImage")]
    pub fifo_init_image: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageServerConfig {
    pub uri: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunDefaultsConfig {
    /// Wall-clock timeout applied to the main job when a run does not set one
    #[serde(default = "default_timeout_seconds", rename = "defaultTimeoutSeconds")]
    pub default_timeout_seconds: i64,
}

/// Sweeper configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SweeperConfig {
    /// Seconds between two sweeps
    #[serde(default = "default_sweep_interval", rename = "intervalSeconds")]
    pub interval_seconds: u64,

    /// Seconds to wait after archiving logs before finalizing a run
    #[serde(default = "default_archive_grace", rename = "archiveGraceSeconds")]
    pub archive_grace_seconds: u64,

    /// Upper bound on how long shutdown waits for an in-flight sweep
    #[serde(default = "default_shutdown_timeout", rename = "shutdownTimeoutSeconds")]
    pub shutdown_timeout_seconds: u64,
}

impl SweeperConfig {
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    #[must_use]
    pub fn archive_grace(&self) -> Duration {
        Duration::from_secs(self.archive_grace_seconds)
    }

    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_seconds)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_address", rename = "listenAddress")]
    pub listen_address: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogArchiveConfig {
    #[serde(default = "default_log_archive_directory")]
    pub directory: String,
}

fn default_job_service_account() -> String {
    "run-job".to_string()
}

fn default_no_op_config_map() -> String {
    "run-no-op".to_string()
}

fn default_worker_waiter_image() -> String {
    "bitnami/kubectl:1.31".to_string()
}

fn default_buffer_proxy_image() -> String {
    "ghcr.io/run-platform/buffer-proxy:latest".to_string()
}

fn default_fifo_init_image() -> String {
    "busybox:1.36".to_string()
}

fn default_timeout_seconds() -> i64 {
    43200 // 12 hours
}

fn default_sweep_interval() -> u64 {
    30
}

fn default_archive_grace() -> u64 {
    30
}

fn default_shutdown_timeout() -> u64 {
    10
}

fn default_listen_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_archive_directory() -> String {
    "/var/lib/run-controller/logs".to_string()
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            buffer_proxy_image: default_buffer_proxy_image(),
            fifo_init_image: default_fifo_init_image(),
        }
    }
}

impl Default for RunDefaultsConfig {
    fn default() -> Self {
        Self {
            default_timeout_seconds: default_timeout_seconds(),
        }
    }
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_sweep_interval(),
            archive_grace_seconds: default_archive_grace(),
            shutdown_timeout_seconds: default_shutdown_timeout(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
        }
    }
}

impl Default for LogArchiveConfig {
    fn default() -> Self {
        Self {
            directory: default_log_archive_directory(),
        }
    }
}

impl ControllerConfig {
    /// Validate that configuration has required fields
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.kubernetes.namespace.trim().is_empty() {
            return Err(anyhow::anyhow!("kubernetes.namespace must be set"));
        }

        if self.kubernetes.clusters.is_empty() {
            return Err(anyhow::anyhow!(
                "At least one cluster must be declared under kubernetes.clusters"
            ));
        }

        let primaries: Vec<&String> = self
            .kubernetes
            .clusters
            .iter()
            .filter(|(_, cluster)| cluster.is_primary)
            .map(|(name, _)| name)
            .collect();
        if primaries.len() != 1 {
            return Err(anyhow::anyhow!(
                "Exactly one cluster must be marked isPrimary, found {}",
                primaries.len()
            ));
        }

        for (cluster_name, cluster) in &self.kubernetes.clusters {
            for (pool_name, pool) in &cluster.user_node_pools {
                if pool.vm_size.trim().is_empty() {
                    return Err(anyhow::anyhow!(
                        "Node pool '{pool_name}' in cluster '{cluster_name}' is missing vmSize"
                    ));
                }
            }
        }

        if self.sweeper.interval_seconds == 0 {
            return Err(anyhow::anyhow!("sweeper.intervalSeconds must be greater than zero"));
        }

        Ok(())
    }

    /// Load configuration from mounted ConfigMap file
    pub fn from_mounted_file(config_path: &str) -> Result<Self, anyhow::Error> {
        let config_str = std::fs::read_to_string(config_path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {config_path}: {e}"))?;

        Self::from_yaml(&config_str)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, anyhow::Error> {
        serde_yaml::from_str(yaml).map_err(|e| anyhow::anyhow!("Failed to parse config YAML: {e}"))
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.kubernetes.namespace
    }

    #[must_use]
    pub fn cluster(&self, name: &str) -> Option<(&str, &ClusterConfig)> {
        self.kubernetes
            .clusters
            .get_key_value(name)
            .map(|(name, cluster)| (name.as_str(), cluster))
    }

    /// The cluster new runs land on when they do not name one.
    #[must_use]
    pub fn primary_cluster(&self) -> Option<(&str, &ClusterConfig)> {
        self.kubernetes
            .clusters
            .iter()
            .find(|(_, cluster)| cluster.is_primary)
            .map(|(name, cluster)| (name.as_str(), cluster))
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        let mut clusters = BTreeMap::new();
        clusters.insert(
            "default".to_string(),
            ClusterConfig {
                region: "local".to_string(),
                is_primary: true,
                user_node_pools: BTreeMap::new(),
            },
        );

        Self {
            kubernetes: KubernetesConfig {
                namespace: "runs".to_string(),
                kubeconfig_path: None,
                job_service_account: default_job_service_account(),
                no_op_config_map: default_no_op_config_map(),
                worker_waiter_image: default_worker_waiter_image(),
                clusters,
            },
            buffers: BufferConfig::default(),
            storage_server: None,
            runs: RunDefaultsConfig::default(),
            sweeper: SweeperConfig::default(),
            server: ServerConfig::default(),
            log_archive: LogArchiveConfig::default(),
        }
    }
}
