//! Reconciliation worker
//!
//! One task consumes membership events from a latest-value channel and runs
//! them through the [`Reconciler`] strictly one at a time. Events that
//! arrive while a run is in flight collapse into the newest one. Retryable
//! failures are retried with exponential backoff unless a newer snapshot
//! shows up first.

use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::api::ConfigApi;
use crate::reconciler::Reconciler;
use crate::shutdown::Shutdown;
use crate::transaction::CallGuard;
use crate::types::MembershipEvent;

/// Timing knobs of the worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    /// Deadline for one whole reconciliation run
    pub reconcile_timeout: Duration,
    /// Retries of a retryable failure before waiting for the next event
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Wait before the first run
    pub startup_delay: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            reconcile_timeout: Duration::from_secs(30),
            max_retries: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
            startup_delay: Duration::ZERO,
        }
    }
}

impl WorkerSettings {
    /// Backoff before retry number `attempt` (0-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.initial_backoff
            .saturating_mul(1u32 << attempt.min(16))
            .min(self.max_backoff)
    }
}

/// Counters of what the worker did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Reconciliation attempts, retries included
    pub runs: u64,
    pub committed: u64,
    pub unchanged: u64,
    pub failed: u64,
    pub retries: u64,
    /// Retries abandoned because a newer snapshot arrived
    pub superseded: u64,
}

/// Serial consumer of membership events
#[derive(Debug)]
pub struct Worker<A> {
    reconciler: Reconciler<A>,
    settings: WorkerSettings,
    shutdown: Shutdown,
    stats: WorkerStats,
}

impl<A: ConfigApi> Worker<A> {
    pub fn new(reconciler: Reconciler<A>, settings: WorkerSettings, shutdown: Shutdown) -> Self {
        Self {
            reconciler,
            settings,
            shutdown,
            stats: WorkerStats::default(),
        }
    }

    pub fn reconciler(&self) -> &Reconciler<A> {
        &self.reconciler
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Consume events until shutdown or until the source goes away
    pub async fn run(
        &mut self,
        mut events: watch::Receiver<Option<MembershipEvent>>,
    ) -> WorkerStats {
        if !self.settings.startup_delay.is_zero() {
            info!(delay = ?self.settings.startup_delay, "waiting before first reconciliation");
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return self.stats.clone(),
                _ = tokio::time::sleep(self.settings.startup_delay) => {}
            }
        }

        let mut pending: Option<MembershipEvent> = None;
        loop {
            let event = match pending.take() {
                Some(event) => event,
                None => {
                    tokio::select! {
                        biased;
                        _ = self.shutdown.cancelled() => break,
                        changed = events.changed() => {
                            if changed.is_err() {
                                info!("membership source closed");
                                break;
                            }
                        }
                    }
                    match events.borrow_and_update().clone() {
                        Some(event) => event,
                        None => continue,
                    }
                }
            };
            if self.shutdown.is_triggered() {
                break;
            }
            pending = self.process(event, &mut events).await;
        }

        info!(stats = ?self.stats, "reconciliation worker stopped");
        self.stats.clone()
    }

    /// Run one event, retrying retryable failures.
    ///
    /// Returns a newer event that superseded a pending retry.
    async fn process(
        &mut self,
        event: MembershipEvent,
        events: &mut watch::Receiver<Option<MembershipEvent>>,
    ) -> Option<MembershipEvent> {
        let mut attempt = 0u32;
        let mut source_open = true;
        loop {
            if self.shutdown.is_triggered() {
                return None;
            }
            let guard =
                CallGuard::with_timeout(self.settings.reconcile_timeout, self.shutdown.clone());
            self.stats.runs += 1;
            let err = match self.reconciler.reconcile_event(&event, &guard).await {
                Ok(outcome) => {
                    if outcome.committed() {
                        self.stats.committed += 1;
                    } else {
                        self.stats.unchanged += 1;
                    }
                    return None;
                }
                Err(err) => err,
            };
            self.stats.failed += 1;

            if self.shutdown.is_triggered() {
                warn!(error = %err, "reconciliation abandoned on shutdown");
                return None;
            }
            if !err.is_retryable() || attempt >= self.settings.max_retries {
                error!(error = %err, attempts = attempt + 1, "reconciliation failed");
                return None;
            }

            let delay = self.settings.backoff(attempt);
            attempt += 1;
            self.stats.retries += 1;
            warn!(error = %err, retry_in = ?delay, attempt, "reconciliation failed, retrying");

            let backoff = tokio::time::sleep(delay);
            tokio::pin!(backoff);
            loop {
                tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => return None,
                    changed = events.changed(), if source_open => match changed {
                        Ok(()) => {
                            if let Some(newer) = events.borrow_and_update().clone() {
                                self.stats.superseded += 1;
                                info!("newer membership snapshot replaces pending retry");
                                return Some(newer);
                            }
                        }
                        Err(_) => source_open = false,
                    },
                    _ = &mut backoff => break,
                }
            }
        }
    }
}
