//! Reconciler
//!
//! Owns the local peer and the last peer set known to be committed. Each
//! call to [`Reconciler::reconcile`] derives the desired set from a full
//! membership snapshot, diffs it against the last committed set and hands
//! the difference to the transaction client. The committed set only moves
//! after a successful commit, so a failed run is repaired by the next one.

use std::collections::HashSet;
use tracing::{debug, info, warn};

use crate::api::ConfigApi;
use crate::diff::{diff, PeerDiff};
use crate::error::{InputError, SyncResult};
use crate::transaction::{ApplyReport, CallGuard, EntryOp, TransactionClient};
use crate::types::{LocalPeer, MembershipEvent, Peer, PeerSet, PeerSetBuilder, RawPeer};

/// Result of one reconciliation run
#[derive(Debug, Clone)]
pub struct ReconcileOutcome {
    /// Desired set derived from the snapshot, local peer included
    pub desired: PeerSet,
    /// Raw peers excluded from the desired set
    pub rejected: Vec<InputError>,
    /// Changes that were sent to the API
    pub diff: PeerDiff,
    /// Present when a transaction was committed
    pub report: Option<ApplyReport>,
}

impl ReconcileOutcome {
    pub fn committed(&self) -> bool {
        self.report.is_some()
    }
}

/// Serial reconciler of one peer section
#[derive(Debug)]
pub struct Reconciler<A> {
    local: LocalPeer,
    client: TransactionClient<A>,
    last_applied: PeerSet,
}

impl<A: ConfigApi> Reconciler<A> {
    /// Start with an empty committed set
    pub fn new(local: LocalPeer, client: TransactionClient<A>) -> Self {
        Self {
            local,
            client,
            last_applied: PeerSet::new(),
        }
    }

    pub fn local(&self) -> &LocalPeer {
        &self.local
    }

    pub fn last_applied(&self) -> &PeerSet {
        &self.last_applied
    }

    pub fn client(&self) -> &TransactionClient<A> {
        &self.client
    }

    /// The local peer plus every valid remote peer of the snapshot.
    ///
    /// Remote peers whose primary address is the local address are folded
    /// into the local peer. Malformed peers are returned, not fatal.
    pub fn desired_set(&self, snapshot: &[RawPeer]) -> (PeerSet, Vec<InputError>) {
        let mut builder = PeerSetBuilder::default();
        builder.push(self.local.as_peer());
        for raw in snapshot {
            match Peer::try_from(raw.clone()) {
                Ok(peer) if peer.primary_address() == self.local.address() => {}
                Ok(peer) => builder.push(peer),
                Err(err) => builder.reject(err),
            }
        }
        builder.finish()
    }

    /// Reconcile against the newest snapshot of an event
    pub async fn reconcile_event(
        &mut self,
        event: &MembershipEvent,
        guard: &CallGuard,
    ) -> SyncResult<ReconcileOutcome> {
        debug!(
            previous = event.previous.len(),
            current = event.current.len(),
            "membership changed"
        );
        self.reconcile(&event.current, guard).await
    }

    /// Bring the peer section in line with `snapshot`
    pub async fn reconcile(
        &mut self,
        snapshot: &[RawPeer],
        guard: &CallGuard,
    ) -> SyncResult<ReconcileOutcome> {
        let (desired, rejected) = self.desired_set(snapshot);
        for err in &rejected {
            warn!(error = %err, "peer excluded from desired set");
        }

        let changes = diff(&self.last_applied, &desired).without_local(&self.local);
        if changes.is_empty() {
            debug!(peers = desired.len(), "peer section already up to date");
            return Ok(ReconcileOutcome {
                desired,
                rejected,
                diff: changes,
                report: None,
            });
        }

        info!(
            add = ?changes.to_add.iter().map(Peer::identity).collect::<Vec<_>>(),
            remove = ?changes.to_remove.iter().map(Peer::identity).collect::<Vec<_>>(),
            "applying peer changes"
        );
        let report = self
            .client
            .apply(&changes, self.local.address(), guard)
            .await?;

        self.last_applied = committed_set(&desired, &self.last_applied, &report);
        Ok(ReconcileOutcome {
            desired,
            rejected,
            diff: changes,
            report: Some(report),
        })
    }
}

/// The set the API now holds: `desired`, except that failed adds are still
/// missing and failed removals are still present.
fn committed_set(desired: &PeerSet, previous: &PeerSet, report: &ApplyReport) -> PeerSet {
    if report.is_complete() {
        return desired.clone();
    }
    let failed_adds: HashSet<&str> = report.failed(EntryOp::Add).collect();
    let failed_removes: HashSet<&str> = report.failed(EntryOp::Remove).collect();

    desired
        .iter()
        .filter(|p| !failed_adds.contains(p.identity()))
        .chain(previous.iter().filter(|p| failed_removes.contains(p.identity())))
        .cloned()
        .collect()
}
