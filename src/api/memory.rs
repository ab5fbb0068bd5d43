//! In-process configuration API
//!
//! Keeps a versioned configuration with optimistic transactions, the same
//! contract the REST API exposes. Faults and latency can be injected per
//! step so callers can be exercised against every failure the protocol
//! distinguishes.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use async_trait::async_trait;
use tokio::sync::Mutex;

use super::schema::{PeerEntry, TransactionId};
use super::{CommitStatus, ConfigApi, EntryStatus, SectionStatus};
use crate::error::{ApiError, ApiResult, ApiStep};

/// One call observed by the in-memory API
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiCall {
    pub step: ApiStep,
    /// Version, transaction id, section or entry name the call targeted
    pub target: String,
}

/// Failures and latency to inject
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    once: HashMap<ApiStep, ApiError>,
    entries: HashMap<String, u16>,
    delays: HashMap<ApiStep, Duration>,
}

impl FaultPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next call of `error.step()` with `error`
    pub fn fail_once(mut self, error: ApiError) -> Self {
        self.once.insert(error.step(), error);
        self
    }

    /// Fail every add or delete of the entry `name` with `status`
    pub fn fail_entry(mut self, name: impl Into<String>, status: u16) -> Self {
        self.entries.insert(name.into(), status);
        self
    }

    /// Hold every call of `step` for `delay` before answering
    pub fn delay(mut self, step: ApiStep, delay: Duration) -> Self {
        self.delays.insert(step, delay);
        self
    }
}

#[derive(Debug, Clone)]
enum StagedOp {
    CreateSection(String),
    CreateEntry(String, PeerEntry),
    DeleteEntry(String, String),
}

#[derive(Debug)]
struct OpenTransaction {
    version: u64,
    ops: Vec<StagedOp>,
}

#[derive(Debug, Default)]
struct State {
    version: u64,
    sections: BTreeMap<String, BTreeMap<String, PeerEntry>>,
    transactions: HashMap<TransactionId, OpenTransaction>,
    next_transaction: u64,
    calls: Vec<ApiCall>,
    faults: FaultPlan,
}

impl State {
    fn record(&mut self, step: ApiStep, target: impl Into<String>) -> ApiResult<()> {
        self.calls.push(ApiCall {
            step,
            target: target.into(),
        });
        match self.faults.once.remove(&step) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn transaction(&self, step: ApiStep, id: &TransactionId) -> ApiResult<&OpenTransaction> {
        self.transactions.get(id).ok_or_else(|| ApiError::Status {
            step,
            status: 404,
            body: format!("transaction {} not found", id),
        })
    }

    /// Sections and entries as seen from inside a transaction
    fn staged_view(&self, id: &TransactionId) -> BTreeMap<String, BTreeMap<String, PeerEntry>> {
        let mut view = self.sections.clone();
        if let Some(tx) = self.transactions.get(id) {
            for op in &tx.ops {
                apply_op(&mut view, op);
            }
        }
        view
    }

    fn entry_fault(&self, step: ApiStep, name: &str) -> ApiResult<()> {
        match self.faults.entries.get(name) {
            Some(status) => Err(ApiError::Status {
                step,
                status: *status,
                body: format!("injected failure for {}", name),
            }),
            None => Ok(()),
        }
    }
}

fn apply_op(view: &mut BTreeMap<String, BTreeMap<String, PeerEntry>>, op: &StagedOp) {
    match op {
        StagedOp::CreateSection(name) => {
            view.entry(name.clone()).or_default();
        }
        StagedOp::CreateEntry(section, entry) => {
            view.entry(section.clone())
                .or_default()
                .insert(entry.name.clone(), entry.clone());
        }
        StagedOp::DeleteEntry(section, name) => {
            if let Some(entries) = view.get_mut(section) {
                entries.remove(name);
            }
        }
    }
}

/// Versioned configuration store implementing [`ConfigApi`]
#[derive(Debug, Default)]
pub struct InMemoryConfigApi {
    state: Mutex<State>,
}

impl InMemoryConfigApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing version counter
    pub fn with_version(version: u64) -> Self {
        Self {
            state: Mutex::new(State {
                version,
                ..State::default()
            }),
        }
    }

    pub async fn set_faults(&self, faults: FaultPlan) {
        self.state.lock().await.faults = faults;
    }

    /// Simulate another writer committing a change
    pub async fn bump_version(&self) {
        self.state.lock().await.version += 1;
    }

    /// Seed a committed entry, creating the section if needed
    pub async fn seed_entry(&self, section: &str, entry: PeerEntry) {
        let mut state = self.state.lock().await;
        state
            .sections
            .entry(section.to_string())
            .or_default()
            .insert(entry.name.clone(), entry);
    }

    pub async fn version(&self) -> u64 {
        self.state.lock().await.version
    }

    pub async fn has_section(&self, section: &str) -> bool {
        self.state.lock().await.sections.contains_key(section)
    }

    /// Committed entries of `section`, in name order
    pub async fn entries(&self, section: &str) -> Vec<PeerEntry> {
        self.state
            .lock()
            .await
            .sections
            .get(section)
            .map(|entries| entries.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Committed entry names of `section`, in name order
    pub async fn entry_names(&self, section: &str) -> Vec<String> {
        self.entries(section).await.into_iter().map(|e| e.name).collect()
    }

    pub async fn open_transactions(&self) -> usize {
        self.state.lock().await.transactions.len()
    }

    pub async fn calls(&self) -> Vec<ApiCall> {
        self.state.lock().await.calls.clone()
    }

    /// Targets of every call made for `step`, in call order
    pub async fn calls_for(&self, step: ApiStep) -> Vec<String> {
        self.calls()
            .await
            .into_iter()
            .filter(|c| c.step == step)
            .map(|c| c.target)
            .collect()
    }

    pub async fn clear_calls(&self) {
        self.state.lock().await.calls.clear();
    }

    async fn pause(&self, step: ApiStep) {
        let delay = self.state.lock().await.faults.delays.get(&step).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl ConfigApi for InMemoryConfigApi {
    async fn configuration_version(&self) -> ApiResult<u64> {
        self.pause(ApiStep::Version).await;
        let mut state = self.state.lock().await;
        state.record(ApiStep::Version, "")?;
        Ok(state.version)
    }

    async fn open_transaction(&self, version: u64) -> ApiResult<TransactionId> {
        let step = ApiStep::OpenTransaction;
        self.pause(step).await;
        let mut state = self.state.lock().await;
        state.record(step, version.to_string())?;
        if version != state.version {
            return Err(ApiError::Status {
                step,
                status: 409,
                body: format!("version mismatch: have {}, got {}", state.version, version),
            });
        }
        state.next_transaction += 1;
        let id = TransactionId::new(format!("tx-{}", state.next_transaction));
        state.transactions.insert(
            id.clone(),
            OpenTransaction {
                version,
                ops: Vec::new(),
            },
        );
        Ok(id)
    }

    async fn ensure_peer_section(
        &self,
        transaction: &TransactionId,
        section: &str,
    ) -> ApiResult<SectionStatus> {
        let step = ApiStep::EnsureSection;
        self.pause(step).await;
        let mut state = self.state.lock().await;
        state.record(step, section)?;
        state.transaction(step, transaction)?;
        if state.staged_view(transaction).contains_key(section) {
            return Ok(SectionStatus::AlreadyExists);
        }
        if let Some(tx) = state.transactions.get_mut(transaction) {
            tx.ops.push(StagedOp::CreateSection(section.to_string()));
        }
        Ok(SectionStatus::Created)
    }

    async fn create_peer_entry(
        &self,
        transaction: &TransactionId,
        section: &str,
        entry: &PeerEntry,
    ) -> ApiResult<EntryStatus> {
        let step = ApiStep::AddEntry;
        self.pause(step).await;
        let mut state = self.state.lock().await;
        state.record(step, entry.name.as_str())?;
        state.transaction(step, transaction)?;
        state.entry_fault(step, &entry.name)?;
        let view = state.staged_view(transaction);
        let entries = view.get(section).ok_or_else(|| ApiError::Status {
            step,
            status: 404,
            body: format!("peer section {} not found", section),
        })?;
        if entries.contains_key(&entry.name) {
            return Ok(EntryStatus::AlreadyPresent);
        }
        if let Some(tx) = state.transactions.get_mut(transaction) {
            tx.ops
                .push(StagedOp::CreateEntry(section.to_string(), entry.clone()));
        }
        Ok(EntryStatus::Applied)
    }

    async fn delete_peer_entry(
        &self,
        transaction: &TransactionId,
        section: &str,
        name: &str,
    ) -> ApiResult<EntryStatus> {
        let step = ApiStep::DeleteEntry;
        self.pause(step).await;
        let mut state = self.state.lock().await;
        state.record(step, name)?;
        state.transaction(step, transaction)?;
        state.entry_fault(step, name)?;
        let present = state
            .staged_view(transaction)
            .get(section)
            .map_or(false, |entries| entries.contains_key(name));
        if !present {
            return Ok(EntryStatus::AlreadyAbsent);
        }
        if let Some(tx) = state.transactions.get_mut(transaction) {
            tx.ops
                .push(StagedOp::DeleteEntry(section.to_string(), name.to_string()));
        }
        Ok(EntryStatus::Applied)
    }

    async fn commit_transaction(&self, transaction: &TransactionId) -> ApiResult<CommitStatus> {
        let step = ApiStep::Commit;
        self.pause(step).await;
        let mut state = self.state.lock().await;
        state.record(step, transaction.as_str())?;
        state.transaction(step, transaction)?;
        let tx = state.transactions.remove(transaction).ok_or_else(|| ApiError::Status {
            step,
            status: 404,
            body: format!("transaction {} not found", transaction),
        })?;
        if tx.version != state.version {
            return Err(ApiError::Status {
                step,
                status: 409,
                body: format!("transaction {} is outdated", transaction),
            });
        }
        for op in &tx.ops {
            apply_op(&mut state.sections, op);
        }
        state.version += 1;
        Ok(CommitStatus::Committed)
    }
}
