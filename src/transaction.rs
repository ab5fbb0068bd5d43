//! Transaction client
//!
//! Turns a [`PeerDiff`] into the ordered call sequence of the configuration
//! API: read version, open transaction, ensure the peer section, add
//! entries, remove entries, commit. Every call is bounded by a
//! [`CallGuard`]. The local process's entry is never touched.

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::api::{CommitStatus, ConfigApi, EntryStatus, PeerEntry, SectionStatus, TransactionId};
use crate::diff::PeerDiff;
use crate::error::{ApiError, ApiResult, ApiStep, SyncError, SyncResult};
use crate::shutdown::Shutdown;

/// What to do when a single peer entry add or delete fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntryFailurePolicy {
    /// Record the failure and keep going; the commit still happens
    #[default]
    BestEffort,
    /// Stop at the first failure and leave the transaction uncommitted
    Abort,
}

impl FromStr for EntryFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "best-effort" => Ok(EntryFailurePolicy::BestEffort),
            "abort" => Ok(EntryFailurePolicy::Abort),
            other => Err(format!(
                "unknown entry failure policy '{}', expected 'best-effort' or 'abort'",
                other
            )),
        }
    }
}

impl fmt::Display for EntryFailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryFailurePolicy::BestEffort => f.write_str("best-effort"),
            EntryFailurePolicy::Abort => f.write_str("abort"),
        }
    }
}

/// Deadline and cancellation bound shared by every call of one run
#[derive(Debug, Clone)]
pub struct CallGuard {
    deadline: Instant,
    shutdown: Shutdown,
}

impl CallGuard {
    pub fn new(deadline: Instant, shutdown: Shutdown) -> Self {
        Self { deadline, shutdown }
    }

    pub fn with_timeout(timeout: Duration, shutdown: Shutdown) -> Self {
        Self::new(Instant::now() + timeout, shutdown)
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Run one API call under the guard.
    ///
    /// The outer result reports cancellation or deadline expiry, the inner
    /// one what the API said.
    pub async fn call<T, F>(&self, step: ApiStep, call: F) -> SyncResult<ApiResult<T>>
    where
        F: Future<Output = ApiResult<T>>,
    {
        if self.shutdown.is_triggered() {
            return Err(SyncError::Cancelled { step });
        }
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(SyncError::Cancelled { step }),
            result = tokio::time::timeout_at(self.deadline, call) => {
                result.map_err(|_| SyncError::DeadlineExceeded { step })
            }
        }
    }
}

/// Entry operation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryOp {
    Add,
    Remove,
}

/// A peer entry change the API refused
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryFailure {
    pub identity: String,
    pub op: EntryOp,
    pub error: ApiError,
}

/// Everything one committed transaction did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyReport {
    pub version: u64,
    pub transaction: TransactionId,
    pub section: SectionStatus,
    /// Entries created by this transaction
    pub added: Vec<String>,
    /// Entries deleted by this transaction
    pub removed: Vec<String>,
    /// Adds that found the entry present and deletes that found it absent
    pub unchanged: Vec<String>,
    /// Peers skipped because their primary address is the local address
    pub skipped_local: Vec<String>,
    /// Entry changes that failed under the best-effort policy
    pub failures: Vec<EntryFailure>,
    pub commit: CommitStatus,
}

impl ApplyReport {
    /// True when every requested entry change went through
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failed(&self, op: EntryOp) -> impl Iterator<Item = &str> {
        self.failures
            .iter()
            .filter(move |f| f.op == op)
            .map(|f| f.identity.as_str())
    }
}

/// Applies peer diffs through a [`ConfigApi`]
#[derive(Debug)]
pub struct TransactionClient<A> {
    api: A,
    section: String,
    port: u16,
    policy: EntryFailurePolicy,
}

impl<A: ConfigApi> TransactionClient<A> {
    pub fn new(api: A, section: impl Into<String>, port: u16) -> Self {
        Self {
            api,
            section: section.into(),
            port,
            policy: EntryFailurePolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: EntryFailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    pub fn section(&self) -> &str {
        &self.section
    }

    /// Apply `diff` in one transaction and commit it.
    ///
    /// Returns only after the commit succeeded; any error means nothing
    /// was committed by this call.
    pub async fn apply(
        &self,
        diff: &PeerDiff,
        local_address: &str,
        guard: &CallGuard,
    ) -> SyncResult<ApplyReport> {
        let version = guard
            .call(ApiStep::Version, self.api.configuration_version())
            .await??;

        let transaction = guard
            .call(ApiStep::OpenTransaction, self.api.open_transaction(version))
            .await??;
        info!(version, transaction_id = %transaction, "transaction opened");

        let section = guard
            .call(
                ApiStep::EnsureSection,
                self.api.ensure_peer_section(&transaction, &self.section),
            )
            .await??;
        debug!(
            section = %self.section,
            status = ?section,
            transaction_id = %transaction,
            "peer section ensured"
        );

        let mut report = ApplyReport {
            version,
            transaction,
            section,
            added: Vec::new(),
            removed: Vec::new(),
            unchanged: Vec::new(),
            skipped_local: Vec::new(),
            failures: Vec::new(),
            commit: CommitStatus::Committed,
        };

        for peer in &diff.to_add {
            if peer.primary_address() == local_address {
                report.skipped_local.push(peer.identity().to_string());
                continue;
            }
            let entry = PeerEntry {
                name: peer.identity().to_string(),
                address: peer.primary_address().to_string(),
                port: self.port,
            };
            let result = guard
                .call(
                    ApiStep::AddEntry,
                    self.api.create_peer_entry(&report.transaction, &self.section, &entry),
                )
                .await?;
            match result {
                Ok(status) => {
                    info!(entry = %entry, status = ?status, "peer entry created");
                    record(&mut report, peer.identity(), EntryOp::Add, status);
                }
                Err(error) => self.entry_failed(&mut report, peer.identity(), EntryOp::Add, error)?,
            }
        }

        for peer in &diff.to_remove {
            if peer.primary_address() == local_address {
                report.skipped_local.push(peer.identity().to_string());
                continue;
            }
            let result = guard
                .call(
                    ApiStep::DeleteEntry,
                    self.api
                        .delete_peer_entry(&report.transaction, &self.section, peer.identity()),
                )
                .await?;
            match result {
                Ok(status) => {
                    info!(peer = %peer, port = self.port, status = ?status, "peer entry deleted");
                    record(&mut report, peer.identity(), EntryOp::Remove, status);
                }
                Err(error) => {
                    self.entry_failed(&mut report, peer.identity(), EntryOp::Remove, error)?
                }
            }
        }

        report.commit = guard
            .call(
                ApiStep::Commit,
                self.api.commit_transaction(&report.transaction),
            )
            .await??;
        info!(
            transaction_id = %report.transaction,
            added = report.added.len(),
            removed = report.removed.len(),
            failed = report.failures.len(),
            commit = ?report.commit,
            "transaction committed"
        );
        Ok(report)
    }

    fn entry_failed(
        &self,
        report: &mut ApplyReport,
        identity: &str,
        op: EntryOp,
        error: ApiError,
    ) -> SyncResult<()> {
        warn!(
            peer = identity,
            op = ?op,
            transaction_id = %report.transaction,
            error = %error,
            "peer entry change failed"
        );
        match self.policy {
            EntryFailurePolicy::Abort => Err(SyncError::EntryFailed {
                identity: identity.to_string(),
                source: error,
            }),
            EntryFailurePolicy::BestEffort => {
                report.failures.push(EntryFailure {
                    identity: identity.to_string(),
                    op,
                    error,
                });
                Ok(())
            }
        }
    }
}

fn record(report: &mut ApplyReport, identity: &str, op: EntryOp, status: EntryStatus) {
    let identity = identity.to_string();
    match (op, status) {
        (_, EntryStatus::AlreadyPresent) | (_, EntryStatus::AlreadyAbsent) => {
            report.unchanged.push(identity)
        }
        (EntryOp::Add, EntryStatus::Applied) => report.added.push(identity),
        (EntryOp::Remove, EntryStatus::Applied) => report.removed.push(identity),
    }
}
