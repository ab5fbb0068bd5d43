//! Configuration API seam
//!
//! [`ConfigApi`] is the contract the transaction client drives: a versioned
//! configuration with transactions, a named peer section and peer entries.
//! [`http::DataPlaneClient`] speaks it over REST; [`memory::InMemoryConfigApi`]
//! keeps the same state in process.

pub mod schema;
pub mod http;
pub mod memory;

pub use schema::{PeerEntry, TransactionId};
pub use http::{ApiCredentials, DataPlaneClient};
pub use memory::{InMemoryConfigApi, FaultPlan};

use async_trait::async_trait;
use crate::error::ApiResult;

/// Outcome of the create-if-absent peer section call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionStatus {
    Created,
    AlreadyExists,
}

/// Outcome of a peer entry create or delete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    /// The change was recorded in the transaction
    Applied,
    /// Create found the entry already present
    AlreadyPresent,
    /// Delete found no such entry
    AlreadyAbsent,
}

/// Outcome of a successful commit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitStatus {
    /// Committed and applied
    Committed,
    /// Committed; the load balancer reload is still pending
    ReloadPending,
}

/// Transactional configuration API
#[async_trait]
pub trait ConfigApi: Send + Sync {
    /// Read the configuration version counter
    async fn configuration_version(&self) -> ApiResult<u64>;

    /// Open a transaction against `version`
    async fn open_transaction(&self, version: u64) -> ApiResult<TransactionId>;

    /// Create the peer section inside the transaction if it does not exist
    async fn ensure_peer_section(
        &self,
        transaction: &TransactionId,
        section: &str,
    ) -> ApiResult<SectionStatus>;

    /// Create a peer entry inside the transaction
    async fn create_peer_entry(
        &self,
        transaction: &TransactionId,
        section: &str,
        entry: &PeerEntry,
    ) -> ApiResult<EntryStatus>;

    /// Delete a peer entry by name inside the transaction
    async fn delete_peer_entry(
        &self,
        transaction: &TransactionId,
        section: &str,
        name: &str,
    ) -> ApiResult<EntryStatus>;

    /// Commit the transaction
    async fn commit_transaction(&self, transaction: &TransactionId) -> ApiResult<CommitStatus>;
}

#[async_trait]
impl<T: ConfigApi + ?Sized> ConfigApi for std::sync::Arc<T> {
    async fn configuration_version(&self) -> ApiResult<u64> {
        (**self).configuration_version().await
    }

    async fn open_transaction(&self, version: u64) -> ApiResult<TransactionId> {
        (**self).open_transaction(version).await
    }

    async fn ensure_peer_section(
        &self,
        transaction: &TransactionId,
        section: &str,
    ) -> ApiResult<SectionStatus> {
        (**self).ensure_peer_section(transaction, section).await
    }

    async fn create_peer_entry(
        &self,
        transaction: &TransactionId,
        section: &str,
        entry: &PeerEntry,
    ) -> ApiResult<EntryStatus> {
        (**self).create_peer_entry(transaction, section, entry).await
    }

    async fn delete_peer_entry(
        &self,
        transaction: &TransactionId,
        section: &str,
        name: &str,
    ) -> ApiResult<EntryStatus> {
        (**self).delete_peer_entry(transaction, section, name).await
    }

    async fn commit_transaction(&self, transaction: &TransactionId) -> ApiResult<CommitStatus> {
        (**self).commit_transaction(transaction).await
    }
}
