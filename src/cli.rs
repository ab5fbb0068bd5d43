use clap::Parser;
use std::path::PathBuf;

use crate::config::{EntryFailurePolicy, SourceKind, SyncConfig};
use crate::error::SyncResult;

/// peersync - keep an HAProxy peer section in step with service membership
///
/// Watches the endpoints of a service and rewrites the peer section of the
/// local HAProxy through its Data Plane API whenever membership changes.
#[derive(Parser, Debug)]
#[command(name = "peersync")]
#[command(version)]
#[command(long_about = "
peersync runs next to an HAProxy instance and keeps its `peers` section
listing every other replica of the same service.

Usage examples:
  peersync --service haproxy --namespace default --user admin --password secret
  peersync --config /etc/peersync.toml
  peersync --snapshot-file slices.json --hostname web-0 --self-address 10.0.0.1
")]
pub struct Cli {
    /// TOML configuration file; flags override its values
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Service whose endpoints form the peer set
    #[arg(long)]
    pub service: Option<String>,

    /// Namespace of the service
    #[arg(long)]
    pub namespace: Option<String>,

    /// Data Plane API user
    #[arg(long)]
    pub user: Option<String>,

    /// Data Plane API password
    #[arg(long)]
    pub password: Option<String>,

    /// Data Plane API address as host:port
    #[arg(long, value_name = "HOST:PORT", conflicts_with = "api_url")]
    pub data_plane_api_address: Option<String>,

    /// Full Data Plane API base URL
    #[arg(long, value_name = "URL")]
    pub api_url: Option<String>,

    /// Name of the managed peer section
    #[arg(long)]
    pub peer_section_name: Option<String>,

    /// Port every peer entry listens on
    #[arg(long)]
    pub peer_port: Option<u16>,

    /// Interface whose IPv4 address identifies this instance
    #[arg(long)]
    pub interface: Option<String>,

    /// Identity of this instance (defaults to $HOSTNAME)
    #[arg(long)]
    pub hostname: Option<String>,

    /// Address of this instance, skipping interface lookup
    #[arg(long, env = "POD_IP")]
    pub self_address: Option<String>,

    /// Read EndpointSlices from a JSON file instead of the Kubernetes API
    #[arg(long, value_name = "FILE")]
    pub snapshot_file: Option<PathBuf>,

    /// What to do when one peer entry fails: best-effort or abort
    #[arg(long)]
    pub entry_failure_policy: Option<EntryFailurePolicy>,

    /// Seconds to wait before the first reconciliation
    #[arg(long)]
    pub startup_delay_secs: Option<u64>,

    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    /// Build the effective configuration: file, then flags, then validation
    pub fn into_config(self) -> SyncResult<SyncConfig> {
        let mut config = match &self.config {
            Some(path) => SyncConfig::from_file(path)?,
            None => SyncConfig::default(),
        };
        self.apply_to(&mut config);
        config.validate()?;
        Ok(config)
    }

    fn apply_to(self, config: &mut SyncConfig) {
        if let Some(address) = self.data_plane_api_address {
            config.api.url = format!("http://{}/v2/services/haproxy", address);
        }
        if let Some(url) = self.api_url {
            config.api.url = url;
        }
        if let Some(user) = self.user {
            config.api.user = user;
        }
        if let Some(password) = self.password {
            config.api.password = password;
        }
        if let Some(section) = self.peer_section_name {
            config.peers.section_name = section;
        }
        if let Some(port) = self.peer_port {
            config.peers.port = port;
        }
        if let Some(policy) = self.entry_failure_policy {
            config.peers.entry_failure_policy = policy;
        }
        if let Some(interface) = self.interface {
            config.local.interface = interface;
        }
        if self.hostname.is_some() {
            config.local.hostname = self.hostname;
        }
        if self.self_address.is_some() {
            config.local.address = self.self_address;
        }
        if self.service.is_some() {
            config.source.kind = SourceKind::Kubernetes;
            config.source.service = self.service;
        }
        if self.namespace.is_some() {
            config.source.namespace = self.namespace;
        }
        if let Some(path) = self.snapshot_file {
            config.source.kind = SourceKind::File;
            config.source.path = Some(path);
        }
        if let Some(delay) = self.startup_delay_secs {
            config.worker.startup_delay_secs = delay;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_original_flags() {
        let cli = Cli::parse_from([
            "peersync",
            "--service",
            "haproxy",
            "--namespace",
            "prod",
            "--user",
            "admin",
            "--password",
            "secret",
            "--data-plane-api-address",
            "127.0.0.1:5556",
            "--peer-section-name",
            "mypeers",
            "--peer-port",
            "10000",
            "--self-address",
            "10.0.0.1",
        ]);
        let config = cli.into_config().unwrap();
        assert_eq!(config.api.url, "http://127.0.0.1:5556/v2/services/haproxy");
        assert_eq!(config.api.user, "admin");
        assert_eq!(config.peers.section_name, "mypeers");
        assert_eq!(config.peers.port, 10000);
        assert_eq!(config.source.service.as_deref(), Some("haproxy"));
        assert_eq!(config.source.namespace.as_deref(), Some("prod"));
        assert_eq!(config.local.address.as_deref(), Some("10.0.0.1"));
    }

    #[test]
    fn test_flags_override_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let document = r#"
[peers]
port = 4000
entry_failure_policy = "abort"

[source]
kind = "file"
path = "/a.json"
"#;
        file.write_all(document.as_bytes()).unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let cli = Cli::parse_from([
            "peersync",
            "--config",
            path.as_str(),
            "--peer-port",
            "5000",
            "--snapshot-file",
            "/b.json",
        ]);
        let config = cli.into_config().unwrap();
        assert_eq!(config.peers.port, 5000);
        assert_eq!(config.peers.entry_failure_policy, EntryFailurePolicy::Abort);
        assert_eq!(config.source.kind, SourceKind::File);
        assert_eq!(config.source.path, Some(PathBuf::from("/b.json")));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let cli = Cli::parse_from(["peersync", "--snapshot-file", "/s.json", "--peer-port", "0"]);
        assert!(cli.into_config().is_err());

        let cli = Cli::parse_from(["peersync", "--service", "haproxy"]);
        assert!(cli.into_config().is_err());

        assert!(Cli::try_parse_from(["peersync", "--entry-failure-policy", "sometimes"]).is_err());
        assert!(Cli::try_parse_from([
            "peersync",
            "--api-url",
            "http://a/v2",
            "--data-plane-api-address",
            "b:1",
        ])
        .is_err());
    }

    #[test]
    fn test_verbose_flag() {
        let cli = Cli::parse_from(["peersync", "-v"]);
        assert!(cli.verbose);
    }
}
