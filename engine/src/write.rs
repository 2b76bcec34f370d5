//! Pending local writes.
//!
//! Every accepted mutation becomes a [`WriteRecord`] in the [`WriteStore`],
//! tagged with a strictly increasing [`WriteId`]. A record leaves the store
//! exactly once: acknowledged by the server, rejected, or canceled. Leaving
//! hands back a [`Resolution`] whose completion the caller fires.

use crate::{error::Result, Children, Error, Node, Path, TransactionId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identifier of a pending write. Total order = submission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WriteId(pub u64);

impl fmt::Display for WriteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w{}", self.0)
    }
}

/// What a write does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WriteKind {
    /// Replace the subtree at the path
    Overwrite,
    /// Replace named children at the path, leaving siblings intact
    Merge,
    /// Overwrite executed by the server when this client disconnects
    DisconnectOverwrite,
    /// Merge executed by the server when this client disconnects
    DisconnectMerge,
    /// Drop disconnect registrations at and below the path
    DisconnectCancel,
}

impl WriteKind {
    /// Disconnect kinds never contribute to the local overlay.
    pub fn is_disconnect(self) -> bool {
        matches!(
            self,
            WriteKind::DisconnectOverwrite | WriteKind::DisconnectMerge | WriteKind::DisconnectCancel
        )
    }
}

/// Data carried by a write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum WritePayload {
    Node(Node),
    Children(Children),
    None,
}

impl WritePayload {
    fn matches(&self, kind: WriteKind) -> bool {
        matches!(
            (kind, self),
            (WriteKind::Overwrite | WriteKind::DisconnectOverwrite, WritePayload::Node(_))
                | (WriteKind::Merge | WriteKind::DisconnectMerge, WritePayload::Children(_))
                | (WriteKind::DisconnectCancel, WritePayload::None)
        )
    }

    /// Apply this payload at `path` on top of `base`.
    pub fn apply_to(&self, base: &Node, path: &Path) -> Node {
        match self {
            WritePayload::Node(node) => base.update_at(path, node.clone()),
            WritePayload::Children(children) => base.update_children_at(path, children),
            WritePayload::None => base.clone(),
        }
    }
}

/// Why a write was canceled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CancelReason {
    /// Purged locally, by explicit purge or going offline
    WriteCanceled,
    /// Replaced by a later overwrite at an ancestor path
    Superseded,
    /// Refused by the server
    Rejected(String),
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::WriteCanceled => f.write_str("write-canceled"),
            CancelReason::Superseded => f.write_str("superseded"),
            CancelReason::Rejected(reason) => write!(f, "rejected: {reason}"),
        }
    }
}

/// Final result of a write. Exactly one is reported per write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WriteOutcome {
    Acknowledged,
    Canceled(CancelReason),
}

impl WriteOutcome {
    pub fn is_acknowledged(&self) -> bool {
        matches!(self, WriteOutcome::Acknowledged)
    }
}

/// A fire-once callback. Firing consumes it, so it can never run twice.
pub struct Callback<T>(Option<Box<dyn FnOnce(T) + Send>>);

/// Completion of a single write.
pub type Completion = Callback<WriteOutcome>;

impl<T> Callback<T> {
    pub fn new(f: impl FnOnce(T) + Send + 'static) -> Self {
        Self(Some(Box::new(f)))
    }

    /// A callback that ignores its result.
    pub fn none() -> Self {
        Self(None)
    }

    pub fn is_none(&self) -> bool {
        self.0.is_none()
    }

    pub fn fire(self, value: T) {
        if let Some(f) = self.0 {
            f(value);
        }
    }
}

impl<T> Default for Callback<T> {
    fn default() -> Self {
        Self::none()
    }
}

impl<T> fmt::Debug for Callback<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.0.is_some() {
            "Callback(set)"
        } else {
            "Callback(none)"
        })
    }
}

/// Who owns a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOwner {
    Plain,
    Transaction(TransactionId),
}

/// One outstanding local mutation.
#[derive(Debug)]
pub struct WriteRecord {
    pub id: WriteId,
    pub path: Path,
    pub kind: WriteKind,
    pub payload: WritePayload,
    /// Whether this write contributes to the overlay
    pub visible: bool,
    pub owner: WriteOwner,
    /// Whether the write has been handed to the transport on the current connection
    pub sent: bool,
    completion: Completion,
}

impl WriteRecord {
    /// True when the record takes part in overlay resolution.
    pub fn contributes_locally(&self) -> bool {
        self.visible && !self.kind.is_disconnect()
    }
}

/// A write that left the store, with the completion still to fire.
#[derive(Debug)]
pub struct Resolution {
    pub id: WriteId,
    pub path: Path,
    pub kind: WriteKind,
    pub owner: WriteOwner,
    pub outcome: WriteOutcome,
    completion: Completion,
}

impl Resolution {
    pub fn fire(self) {
        self.completion.fire(self.outcome);
    }
}

/// Ordered collection of pending writes.
#[derive(Debug, Default)]
pub struct WriteStore {
    records: BTreeMap<WriteId, WriteRecord>,
    next_id: u64,
}

impl WriteStore {
    pub fn new() -> Self {
        Self {
            records: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// Append a write with a fresh id.
    pub fn add_write(
        &mut self,
        kind: WriteKind,
        path: Path,
        payload: WritePayload,
        visible: bool,
        owner: WriteOwner,
        completion: Completion,
    ) -> Result<WriteId> {
        if !payload.matches(kind) {
            return Err(Error::InvalidPayload(format!(
                "{kind:?} write cannot carry this payload"
            )));
        }
        let id = WriteId(self.next_id.max(1));
        self.next_id = id.0 + 1;
        self.records.insert(
            id,
            WriteRecord {
                id,
                path,
                kind,
                payload,
                visible,
                owner,
                sent: false,
                completion,
            },
        );
        Ok(id)
    }

    /// Re-insert a write recovered from persistence, keeping its id.
    pub fn restore_write(
        &mut self,
        id: WriteId,
        kind: WriteKind,
        path: Path,
        payload: WritePayload,
    ) -> Result<()> {
        if !payload.matches(kind) {
            return Err(Error::InvalidPersistedState(format!(
                "write {id} has a payload that does not match {kind:?}"
            )));
        }
        self.next_id = self.next_id.max(id.0 + 1);
        self.records.insert(
            id,
            WriteRecord {
                id,
                path,
                kind,
                payload,
                visible: true,
                owner: WriteOwner::Plain,
                sent: false,
                completion: Completion::none(),
            },
        );
        Ok(())
    }

    pub fn get(&self, id: WriteId) -> Option<&WriteRecord> {
        self.records.get(&id)
    }

    pub fn get_mut(&mut self, id: WriteId) -> Option<&mut WriteRecord> {
        self.records.get_mut(&id)
    }

    /// All records in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = &WriteRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Resolve one write. `None` when the id is not pending.
    pub fn remove_write(&mut self, id: WriteId, outcome: WriteOutcome) -> Option<Resolution> {
        self.records
            .remove(&id)
            .map(|record| Self::resolution(record, outcome))
    }

    /// Cancel every pending write, disconnect writes included, in ascending
    /// id order.
    pub fn purge_all(&mut self, reason: CancelReason) -> Vec<Resolution> {
        std::mem::take(&mut self.records)
            .into_values()
            .map(|record| Self::resolution(record, WriteOutcome::Canceled(reason.clone())))
            .collect()
    }

    /// Cancel plain writes older than `before` that sit strictly below `path`.
    pub fn purge_writes_at_and_below(&mut self, path: &Path, before: WriteId) -> Vec<Resolution> {
        let superseded: Vec<WriteId> = self
            .records
            .values()
            .filter(|r| {
                r.id < before
                    && r.owner == WriteOwner::Plain
                    && !r.kind.is_disconnect()
                    && path.contains(&r.path)
                    && r.path != *path
            })
            .map(|r| r.id)
            .collect();

        superseded
            .into_iter()
            .filter_map(|id| {
                self.remove_write(id, WriteOutcome::Canceled(CancelReason::Superseded))
            })
            .collect()
    }

    /// Forget that anything was sent, after the connection dropped.
    pub fn mark_all_unsent(&mut self) {
        for record in self.records.values_mut() {
            record.sent = false;
        }
    }

    /// Ids of writes not yet handed to the transport, ascending.
    pub fn unsent(&self) -> Vec<WriteId> {
        self.records
            .values()
            .filter(|r| !r.sent)
            .map(|r| r.id)
            .collect()
    }

    fn resolution(record: WriteRecord, outcome: WriteOutcome) -> Resolution {
        Resolution {
            id: record.id,
            path: record.path,
            kind: record.kind,
            owner: record.owner,
            outcome,
            completion: record.completion,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn path(raw: &str) -> Path {
        Path::parse(raw).unwrap()
    }

    fn leaf(value: serde_json::Value) -> WritePayload {
        WritePayload::Node(Node::from_json(&value).unwrap())
    }

    fn recording(log: &Arc<Mutex<Vec<String>>>, label: &str) -> Completion {
        let log = Arc::clone(log);
        let label = label.to_string();
        Completion::new(move |outcome| {
            log.lock().unwrap().push(format!("{label}:{outcome:?}"));
        })
    }

    fn add(store: &mut WriteStore, raw: &str, completion: Completion) -> WriteId {
        store
            .add_write(
                WriteKind::Overwrite,
                path(raw),
                leaf(json!(1)),
                true,
                WriteOwner::Plain,
                completion,
            )
            .unwrap()
    }

    #[test]
    fn ids_increase_strictly() {
        let mut store = WriteStore::new();
        let a = add(&mut store, "a", Completion::none());
        let b = add(&mut store, "b", Completion::none());
        assert_eq!(a, WriteId(1));
        assert!(a < b);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn payload_must_match_kind() {
        let mut store = WriteStore::new();
        let result = store.add_write(
            WriteKind::Merge,
            path("a"),
            leaf(json!(1)),
            true,
            WriteOwner::Plain,
            Completion::none(),
        );
        assert!(matches!(result, Err(Error::InvalidPayload(_))));
        assert!(store.is_empty());
    }

    #[test]
    fn remove_fires_once() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut store = WriteStore::new();
        let id = add(&mut store, "a", recording(&log, "a"));

        store
            .remove_write(id, WriteOutcome::Acknowledged)
            .unwrap()
            .fire();
        assert!(store
            .remove_write(id, WriteOutcome::Canceled(CancelReason::WriteCanceled))
            .is_none());
        assert_eq!(*log.lock().unwrap(), vec!["a:Acknowledged"]);
    }

    #[test]
    fn purge_all_is_in_submission_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut store = WriteStore::new();
        for label in ["1", "2", "3", "4"] {
            add(&mut store, &format!("p{label}"), recording(&log, label));
        }

        for resolution in store.purge_all(CancelReason::WriteCanceled) {
            resolution.fire();
        }
        let order: Vec<String> = log
            .lock()
            .unwrap()
            .iter()
            .map(|entry| entry.split(':').next().unwrap().to_string())
            .collect();
        assert_eq!(order, vec!["1", "2", "3", "4"]);
        assert!(store.is_empty());
    }

    #[test]
    fn supersession_only_cancels_strict_descendants() {
        let mut store = WriteStore::new();
        let nested = add(&mut store, "bar/qux", Completion::none());
        let same = add(&mut store, "bar", Completion::none());
        let sibling = add(&mut store, "baz", Completion::none());
        let newer = add(&mut store, "bar", Completion::none());

        let canceled = store.purge_writes_at_and_below(&path("bar"), newer);
        let ids: Vec<_> = canceled.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![nested]);
        assert_eq!(
            canceled[0].outcome,
            WriteOutcome::Canceled(CancelReason::Superseded)
        );
        assert!(store.get(same).is_some());
        assert!(store.get(sibling).is_some());
    }

    #[test]
    fn unsent_tracking() {
        let mut store = WriteStore::new();
        let a = add(&mut store, "a", Completion::none());
        let b = add(&mut store, "b", Completion::none());
        store.get_mut(a).unwrap().sent = true;
        assert_eq!(store.unsent(), vec![b]);
        store.mark_all_unsent();
        assert_eq!(store.unsent(), vec![a, b]);
    }

    #[test]
    fn restored_ids_advance_the_counter() {
        let mut store = WriteStore::new();
        store
            .restore_write(WriteId(7), WriteKind::Overwrite, path("a"), leaf(json!(1)))
            .unwrap();
        let next = add(&mut store, "b", Completion::none());
        assert_eq!(next, WriteId(8));
    }
}
