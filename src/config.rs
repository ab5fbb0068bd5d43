//! Configuration for peersync
//!
//! A `peersync.toml` file supplies defaults for every setting; command line
//! flags override individual values (see `cli`). The resulting `SyncConfig`
//! is validated once and then treated as immutable.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::{Deserialize, Serialize};

use crate::api::ApiCredentials;
use crate::error::{SyncError, SyncResult};
use crate::worker::WorkerSettings;

pub use crate::transaction::EntryFailurePolicy;

/// Default API base URL of a Data Plane API sidecar
pub const DEFAULT_API_URL: &str = "http://127.0.0.1:5555/v2/services/haproxy";

/// Service account mount inside a pod
pub const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Complete peersync configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub peers: PeersConfig,
    #[serde(default)]
    pub local: LocalConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
}

/// Connection to the configuration API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApiConfig {
    #[serde(default = "default_api_url")]
    pub url: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    /// Bound on a single HTTP request
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// The peer section being managed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PeersConfig {
    #[serde(default = "default_section_name")]
    pub section_name: String,
    #[serde(default = "default_peer_port")]
    pub port: u16,
    #[serde(default)]
    pub entry_failure_policy: EntryFailurePolicy,
}

/// How this process identifies itself
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LocalConfig {
    /// Falls back to `$HOSTNAME`
    #[serde(default)]
    pub hostname: Option<String>,
    /// Skips interface inspection when set
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default = "default_interface")]
    pub interface: String,
}

/// Where membership comes from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    #[default]
    Kubernetes,
    File,
}

/// Membership source settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    #[serde(default)]
    pub kind: SourceKind,
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    /// Defaults to the in-cluster service address
    #[serde(default)]
    pub api_server: Option<String>,
    #[serde(default)]
    pub token_path: Option<PathBuf>,
    #[serde(default)]
    pub ca_path: Option<PathBuf>,
    /// Snapshot file for the `file` kind
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

/// Reconciliation worker settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerConfig {
    #[serde(default = "default_reconcile_timeout_secs")]
    pub reconcile_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default)]
    pub startup_delay_secs: u64,
}

fn default_api_url() -> String {
    DEFAULT_API_URL.to_string()
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_section_name() -> String {
    "haproxy-peers".to_string()
}

fn default_peer_port() -> u16 {
    3000
}

fn default_interface() -> String {
    "eth0".to_string()
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_reconcile_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            url: default_api_url(),
            user: String::new(),
            password: String::new(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for PeersConfig {
    fn default() -> Self {
        Self {
            section_name: default_section_name(),
            port: default_peer_port(),
            entry_failure_policy: EntryFailurePolicy::default(),
        }
    }
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            hostname: None,
            address: None,
            interface: default_interface(),
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: SourceKind::default(),
            service: None,
            namespace: None,
            api_server: None,
            token_path: None,
            ca_path: None,
            path: None,
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            reconcile_timeout_secs: default_reconcile_timeout_secs(),
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            startup_delay_secs: 0,
        }
    }
}

impl SyncConfig {
    /// Parse a TOML document
    pub fn from_toml(text: &str) -> SyncResult<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Load configuration from a file
    pub fn from_file<P: AsRef<Path>>(path: P) -> SyncResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            SyncError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    /// Reject settings that cannot work
    pub fn validate(&self) -> SyncResult<()> {
        if self.peers.section_name.trim().is_empty() {
            return Err(SyncError::Config("peer section name must not be empty".to_string()));
        }
        if self.peers.port == 0 {
            return Err(SyncError::Config("peer port must be non-zero".to_string()));
        }
        let url = reqwest::Url::parse(&self.api.url)
            .map_err(|e| SyncError::Config(format!("invalid API url '{}': {}", self.api.url, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(SyncError::Config(format!(
                "API url '{}' must use http or https",
                self.api.url
            )));
        }
        if self.local.interface.trim().is_empty() && self.local.address.is_none() {
            return Err(SyncError::Config(
                "either an interface or a local address is required".to_string(),
            ));
        }
        if self.source.poll_interval_secs == 0 {
            return Err(SyncError::Config("poll interval must be non-zero".to_string()));
        }
        if self.worker.reconcile_timeout_secs == 0 {
            return Err(SyncError::Config("reconcile timeout must be non-zero".to_string()));
        }

        match self.source.kind {
            SourceKind::Kubernetes => {
                if is_blank(&self.source.service) {
                    return Err(SyncError::Config(
                        "kubernetes source requires a service".to_string(),
                    ));
                }
                if is_blank(&self.source.namespace) {
                    return Err(SyncError::Config(
                        "kubernetes source requires a namespace".to_string(),
                    ));
                }
            }
            SourceKind::File => {
                if self.source.path.is_none() {
                    return Err(SyncError::Config("file source requires a path".to_string()));
                }
            }
        }
        Ok(())
    }

    pub fn credentials(&self) -> ApiCredentials {
        ApiCredentials {
            user: self.api.user.clone(),
            password: self.api.password.clone(),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.api.request_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.source.poll_interval_secs)
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            reconcile_timeout: Duration::from_secs(self.worker.reconcile_timeout_secs),
            max_retries: self.worker.max_retries,
            initial_backoff: Duration::from_millis(self.worker.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.worker.max_backoff_ms),
            startup_delay: Duration::from_secs(self.worker.startup_delay_secs),
        }
    }
}

impl SourceConfig {
    /// Kubernetes API address: configured, else the in-cluster service
    /// environment
    pub fn kube_api_server(&self) -> SyncResult<String> {
        if let Some(server) = self.api_server.as_ref().filter(|s| !s.trim().is_empty()) {
            return Ok(server.clone());
        }
        let host = std::env::var("KUBERNETES_SERVICE_HOST").map_err(|_| {
            SyncError::Config(
                "kubernetes api server unknown: set source.api_server or KUBERNETES_SERVICE_HOST"
                    .to_string(),
            )
        })?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string());
        if host.contains(':') {
            Ok(format!("https://[{}]:{}", host, port))
        } else {
            Ok(format!("https://{}:{}", host, port))
        }
    }

    /// Service account token, defaulting to the pod mount
    pub fn kube_token_path(&self) -> PathBuf {
        self.token_path
            .clone()
            .unwrap_or_else(|| Path::new(SERVICE_ACCOUNT_DIR).join("token"))
    }

    /// Cluster CA bundle, defaulting to the pod mount when present
    pub fn kube_ca_path(&self) -> Option<PathBuf> {
        self.ca_path.clone().or_else(|| {
            let mounted = Path::new(SERVICE_ACCOUNT_DIR).join("ca.crt");
            mounted.exists().then_some(mounted)
        })
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |v| v.trim().is_empty())
}
