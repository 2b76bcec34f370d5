//! Optimistic read-modify-write transactions.
//!
//! A transaction reads the current overlay value at its path, hands it to a
//! caller-supplied update function and records the proposal as a
//! provisional overwrite. The proposal is sent with the value it was based
//! on; the server applies it only if that base is still current. A stale
//! answer reruns the update on fresh data, up to a retry limit.
//!
//! # Lifecycle
//!
//! ```text
//! Run ──send──► Sent ──Ok──► Committed
//!  ▲              │
//!  └────Stale─────┘ (retries += 1, fails past the limit)
//!
//! Sent ──plain write at related path──► SentNeedsAbort ──any answer──► Superseded
//! ```

use crate::{
    effects::{Delivery, Effects, WriteResponse},
    engine::SyncEngine,
    overlay, Callback, CancelReason, Completion, Node, Path, WriteId, WriteKind, WriteOutcome,
    WriteOwner, WritePayload,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use tracing::{debug, warn};

/// Identifier of a transaction. Total order = submission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(pub u64);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// What the update function wants done with the value it was shown.
#[derive(Debug, Clone, PartialEq)]
pub enum TransactionDecision {
    Commit(Node),
    Abort,
}

/// Caller-supplied update. May run several times.
pub type TransactionUpdate = Box<dyn FnMut(&Node) -> TransactionDecision + Send>;

/// Why a transaction did not commit.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransactionFailure {
    #[error("gave up after {retries} stale retries")]
    ConflictExhausted { retries: u32 },

    #[error("canceled: {0}")]
    Canceled(CancelReason),

    #[error("superseded by a later write")]
    Superseded,

    #[error("rejected by server: {0}")]
    Rejected(String),
}

/// Final result of a transaction. Exactly one is reported per transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum TransactionOutcome {
    Committed(Node),
    /// The update function declined to write
    Aborted,
    Failed(TransactionFailure),
}

pub type TransactionCompletion = Callback<TransactionOutcome>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionOptions {
    /// Show the proposal to local observers before the server confirms it
    pub apply_locally: bool,
    /// Overrides the engine's retry limit
    pub max_retries: Option<u32>,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self {
            apply_locally: true,
            max_retries: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Waiting to be sent
    Run,
    /// Proposal is with the server
    Sent,
    /// Proposal is with the server but a plain write has replaced it locally
    SentNeedsAbort,
}

pub struct TransactionRecord {
    pub id: TransactionId,
    pub path: Path,
    pub status: TransactionStatus,
    pub retries: u32,
    pub max_retries: u32,
    pub apply_locally: bool,
    /// Provisional write of the current attempt
    pub write: Option<WriteId>,
    /// Value the current proposal was computed from
    pub base: Node,
    pub proposed: Node,
    update: TransactionUpdate,
    completion: TransactionCompletion,
}

impl TransactionRecord {
    fn finish(self, outcome: TransactionOutcome) -> Delivery {
        Delivery::Transaction {
            id: self.id,
            completion: self.completion,
            outcome,
        }
    }
}

impl fmt::Debug for TransactionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionRecord")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("status", &self.status)
            .field("retries", &self.retries)
            .field("write", &self.write)
            .finish()
    }
}

/// Live transactions, in submission order.
#[derive(Debug, Default)]
pub struct TransactionQueue {
    records: BTreeMap<TransactionId, TransactionRecord>,
    next_id: u64,
}

impl TransactionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate(&mut self) -> TransactionId {
        self.next_id += 1;
        TransactionId(self.next_id)
    }

    fn insert(&mut self, record: TransactionRecord) {
        self.records.insert(record.id, record);
    }

    fn remove(&mut self, id: TransactionId) -> Option<TransactionRecord> {
        self.records.remove(&id)
    }

    pub fn get(&self, id: TransactionId) -> Option<&TransactionRecord> {
        self.records.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TransactionRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The compare-and-set base for a transaction's outbound proposal.
    pub(crate) fn base_of(&self, id: TransactionId) -> Option<Node> {
        self.records.get(&id).map(|record| record.base.clone())
    }

    pub(crate) fn mark_sent(&mut self, id: TransactionId) {
        if let Some(record) = self.records.get_mut(&id) {
            if record.status == TransactionStatus::Run {
                record.status = TransactionStatus::Sent;
            }
        }
    }

    fn ids(&self) -> Vec<TransactionId> {
        self.records.keys().copied().collect()
    }
}

impl SyncEngine {
    /// Start a transaction at `path`.
    ///
    /// The update runs synchronously against the current overlay before
    /// this returns.
    pub fn run_transaction(
        &mut self,
        path: Path,
        update: TransactionUpdate,
        options: TransactionOptions,
        completion: TransactionCompletion,
    ) -> (TransactionId, Effects) {
        let id = self.transactions.allocate();
        let record = TransactionRecord {
            id,
            path: path.clone(),
            status: TransactionStatus::Run,
            retries: 0,
            max_retries: options
                .max_retries
                .unwrap_or(self.config.max_transaction_retries),
            apply_locally: options.apply_locally,
            write: None,
            base: Node::Empty,
            proposed: Node::Empty,
            update,
            completion,
        };
        debug!(txn = %id, path = %path, "transaction started");

        let mut effects = Effects::new();
        let finished = self.attempt(record);
        effects.events(self.raise(&path));
        effects.deliveries.extend(finished);
        self.flush_outbound(&mut effects);
        (id, effects)
    }

    /// Run the update on fresh data and record the proposal.
    ///
    /// Returns the completion delivery when the update aborts.
    fn attempt(&mut self, mut record: TransactionRecord) -> Option<Delivery> {
        let base = overlay::resolve(&self.server, &self.writes, &record.path).node;
        let value = match (record.update)(&base) {
            TransactionDecision::Commit(value) => value,
            TransactionDecision::Abort => {
                debug!(txn = %record.id, "transaction aborted by its update");
                return Some(record.finish(TransactionOutcome::Aborted));
            }
        };

        let added = self.writes.add_write(
            WriteKind::Overwrite,
            record.path.clone(),
            WritePayload::Node(value.clone()),
            record.apply_locally,
            WriteOwner::Transaction(record.id),
            Completion::none(),
        );
        match added {
            Ok(write) => {
                record.write = Some(write);
                record.base = base;
                record.proposed = value;
                record.status = TransactionStatus::Run;
                self.transactions.insert(record);
                None
            }
            Err(err) => {
                warn!(txn = %record.id, error = %err, "transaction proposal refused");
                let reason = err.to_string();
                Some(record.finish(TransactionOutcome::Failed(TransactionFailure::Rejected(
                    reason,
                ))))
            }
        }
    }

    /// The server answered a transaction's proposal.
    pub(crate) fn on_transaction_response(
        &mut self,
        id: TransactionId,
        write: WriteId,
        response: WriteResponse,
    ) -> Effects {
        let write_outcome = match &response {
            WriteResponse::Ok => WriteOutcome::Acknowledged,
            WriteResponse::Stale => WriteOutcome::Canceled(CancelReason::Rejected("datastale".into())),
            WriteResponse::Rejected(reason) => {
                WriteOutcome::Canceled(CancelReason::Rejected(reason.clone()))
            }
        };
        // Provisional writes carry no completion of their own.
        let _ = self.writes.remove_write(write, write_outcome);

        let mut effects = Effects::new();
        let Some(mut record) = self.transactions.remove(id) else {
            warn!(txn = %id, write_id = %write, "response for a finished transaction");
            return effects;
        };
        record.write = None;
        let path = record.path.clone();

        let finished = match response {
            WriteResponse::Ok => {
                debug!(txn = %id, path = %path, "transaction committed");
                self.server.apply_overwrite(&path, record.proposed.clone());
                self.persist_server_cache();
                let committed = record.proposed.clone();
                Some(record.finish(TransactionOutcome::Committed(committed)))
            }
            _ if record.status == TransactionStatus::SentNeedsAbort => {
                debug!(txn = %id, "transaction superseded while in flight");
                Some(record.finish(TransactionOutcome::Failed(TransactionFailure::Superseded)))
            }
            WriteResponse::Stale => {
                record.retries += 1;
                if record.retries > record.max_retries {
                    warn!(txn = %id, retries = record.max_retries, "transaction retries exhausted");
                    let retries = record.max_retries;
                    Some(record.finish(TransactionOutcome::Failed(
                        TransactionFailure::ConflictExhausted { retries },
                    )))
                } else {
                    debug!(txn = %id, attempt = record.retries, "transaction base was stale, retrying");
                    self.attempt(record)
                }
            }
            WriteResponse::Rejected(reason) => {
                warn!(txn = %id, %reason, "transaction rejected by server");
                Some(record.finish(TransactionOutcome::Failed(TransactionFailure::Rejected(
                    reason,
                ))))
            }
        };

        effects.events(self.raise(&path));
        effects.deliveries.extend(finished);
        self.flush_outbound(&mut effects);
        effects
    }

    /// A plain write at `path` invalidates related transactions.
    ///
    /// Unsent ones fail immediately with their provisional write removed.
    /// Sent ones fail once the server answers. Returns each failed
    /// transaction's path with its completion, in submission order.
    pub(crate) fn abort_transactions_for(&mut self, path: &Path) -> Vec<(Path, Delivery)> {
        let mut aborted = Vec::new();
        for id in self.transactions.ids() {
            let Some(record) = self.transactions.records.get_mut(&id) else {
                continue;
            };
            if !record.path.is_related(path) {
                continue;
            }
            let status = record.status;
            match status {
                TransactionStatus::SentNeedsAbort => {}
                TransactionStatus::Sent => {
                    debug!(txn = %id, "in-flight transaction will be superseded");
                    record.status = TransactionStatus::SentNeedsAbort;
                }
                TransactionStatus::Run => {
                    if let Some(record) = self.transactions.remove(id) {
                        debug!(txn = %id, "transaction superseded before sending");
                        if let Some(write) = record.write {
                            let _ = self
                                .writes
                                .remove_write(write, WriteOutcome::Canceled(CancelReason::Superseded));
                        }
                        let txn_path = record.path.clone();
                        aborted.push((
                            txn_path,
                            record.finish(TransactionOutcome::Failed(TransactionFailure::Superseded)),
                        ));
                    }
                }
            }
        }
        aborted
    }

    /// Fail a transaction whose provisional write was purged.
    pub(crate) fn cancel_transaction(&mut self, id: TransactionId, reason: CancelReason) -> Option<Delivery> {
        let record = self.transactions.remove(id)?;
        debug!(txn = %id, %reason, "transaction canceled");
        Some(record.finish(TransactionOutcome::Failed(TransactionFailure::Canceled(reason))))
    }

    /// Fail every remaining transaction, in submission order.
    pub(crate) fn cancel_all_transactions(&mut self, reason: CancelReason) -> Vec<Delivery> {
        self.transactions
            .ids()
            .into_iter()
            .filter_map(|id| self.cancel_transaction(id, reason.clone()))
            .collect()
    }

    /// The connection dropped: sent proposals go back to waiting, and those
    /// already replaced locally fail now.
    pub(crate) fn reset_transactions_after_disconnect(&mut self) -> Vec<Delivery> {
        let mut failed = Vec::new();
        for id in self.transactions.ids() {
            let Some(record) = self.transactions.records.get_mut(&id) else {
                continue;
            };
            let status = record.status;
            match status {
                TransactionStatus::Run => {}
                TransactionStatus::Sent => record.status = TransactionStatus::Run,
                TransactionStatus::SentNeedsAbort => {
                    if let Some(record) = self.transactions.remove(id) {
                        if let Some(write) = record.write {
                            let _ = self
                                .writes
                                .remove_write(write, WriteOutcome::Canceled(CancelReason::Superseded));
                        }
                        failed.push(
                            record.finish(TransactionOutcome::Failed(TransactionFailure::Superseded)),
                        );
                    }
                }
            }
        }
        failed
    }
}
