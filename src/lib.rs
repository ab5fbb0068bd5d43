//! # peersync: HAProxy peer section synchronization
//!
//! Keeps the `peers` section of an HAProxy instance equal to the current
//! membership of its service, minus the instance itself.
//!
//! Membership snapshots arrive from a source (`source`), are diffed against
//! the last committed peer set (`diff`), and the difference is applied in a
//! single versioned transaction against the Data Plane API (`transaction`).
//! A single worker (`worker`) serializes reconciliations and retries
//! transient failures.

#![warn(clippy::all)]

pub mod api;
pub mod config;
pub mod diff;
pub mod error;
pub mod netif;
pub mod reconciler;
pub mod shutdown;
pub mod source;
pub mod transaction;
pub mod types;
pub mod worker;
/// Command-line interface and argument parsing
pub mod cli;

// Re-export main types
pub use api::{ConfigApi, DataPlaneClient, InMemoryConfigApi};
pub use config::SyncConfig;
pub use diff::{diff, PeerDiff};
pub use error::{ApiError, ApiStep, SyncError, SyncResult};
pub use reconciler::{ReconcileOutcome, Reconciler};
pub use transaction::{ApplyReport, CallGuard, EntryFailurePolicy, TransactionClient};
pub use types::{LocalPeer, MembershipEvent, Peer, PeerSet, RawPeer};
pub use worker::{Worker, WorkerSettings};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Create a reconciler for `local` talking to `api` with the configured
/// section, port and failure policy
pub fn new_reconciler<A: ConfigApi>(
    config: &SyncConfig,
    local: LocalPeer,
    api: A,
) -> Reconciler<A> {
    let client = TransactionClient::new(api, config.peers.section_name.clone(), config.peers.port)
        .with_policy(config.peers.entry_failure_policy);
    Reconciler::new(local, client)
}

/// Create the HTTP client for the configured Data Plane API
pub fn new_api_client(config: &SyncConfig) -> SyncResult<DataPlaneClient> {
    DataPlaneClient::new(config.api.url.clone(), config.credentials(), config.request_timeout())
}
