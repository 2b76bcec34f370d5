//! The engine - the single owner of all overlay state.
//!
//! `SyncEngine` holds the server cache, the pending writes, the listener
//! registry and the transaction queue. It is synchronous and must only be
//! driven from one execution context; each mutating call returns the
//! [`Effects`] the caller has to carry out, in order.

use crate::{
    connection::{ConnectionState, DisconnectRegistration},
    effects::{Effects, OutboundRequest, WriteResponse},
    error::Result,
    event::{ChildOrder, EventKind, EventRegistry, EventSink, PendingEvent, RegistrationId},
    overlay::{self, ServerCache, View},
    persistence::{PersistedWrite, PersistenceAdapter},
    transaction::TransactionQueue,
    CancelReason, Children, Completion, Node, Path, WriteId, WriteKind, WriteOutcome, WriteOwner,
    WritePayload, WriteRecord, WriteStore,
};
use tracing::{debug, info, warn};

/// Default number of retries after a stale transaction response.
pub const DEFAULT_MAX_TRANSACTION_RETRIES: u32 = 25;

/// Engine tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Retries allowed after the server reports a stale transaction base
    pub max_transaction_retries: u32,
    /// Cancel older writes strictly below a new overwrite
    pub supersede_nested_writes: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_transaction_retries: DEFAULT_MAX_TRANSACTION_RETRIES,
            supersede_nested_writes: false,
        }
    }
}

/// The write-overlay and event engine.
pub struct SyncEngine {
    pub(crate) config: EngineConfig,
    pub(crate) server: ServerCache,
    pub(crate) writes: WriteStore,
    pub(crate) registry: EventRegistry,
    pub(crate) transactions: TransactionQueue,
    pub(crate) connection: ConnectionState,
    /// Disconnect writes the server has accepted, in acknowledgment order
    pub(crate) disconnects: Vec<DisconnectRegistration>,
    pub(crate) persistence: Option<Box<dyn PersistenceAdapter>>,
}

impl SyncEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            server: ServerCache::new(),
            writes: WriteStore::new(),
            registry: EventRegistry::new(),
            transactions: TransactionQueue::new(),
            connection: ConnectionState::new(),
            disconnects: Vec::new(),
            persistence: None,
        }
    }

    /// Create an engine backed by `persistence`, restoring the server cache
    /// and every pending write it holds.
    ///
    /// Restored writes have no completion and are sent once connected.
    pub fn restore(
        config: EngineConfig,
        persistence: Box<dyn PersistenceAdapter>,
    ) -> Result<Self> {
        let mut engine = Self::new(config);
        engine.server = persistence.load_server_cache()?;

        let mut restored = persistence.load_user_writes()?;
        restored.sort_by_key(|write| write.id);
        for write in &restored {
            engine
                .writes
                .restore_write(write.id, write.kind, write.path.clone(), write.payload.clone())?;
        }
        if !restored.is_empty() {
            info!(count = restored.len(), "restored pending writes");
        }

        engine.persistence = Some(persistence);
        Ok(engine)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn server_cache(&self) -> &ServerCache {
        &self.server
    }

    pub fn writes(&self) -> &WriteStore {
        &self.writes
    }

    pub fn registry(&self) -> &EventRegistry {
        &self.registry
    }

    pub fn connection(&self) -> &ConnectionState {
        &self.connection
    }

    pub fn pending_write_count(&self) -> usize {
        self.writes.len()
    }

    pub fn pending_transaction_count(&self) -> usize {
        self.transactions.len()
    }

    /// Disconnect writes registered with the server.
    pub fn disconnect_registrations(&self) -> &[DisconnectRegistration] {
        &self.disconnects
    }

    /// The overlay view at `path`.
    pub fn resolve(&self, path: &Path) -> View {
        overlay::resolve(&self.server, &self.writes, path)
    }

    /// The visible value at `path`, if it is fully known.
    pub fn cached_value(&self, path: &Path) -> Option<Node> {
        let view = self.resolve(path);
        view.complete.then_some(view.node)
    }

    /// Overwrite the subtree at `path`.
    pub fn submit_write(
        &mut self,
        path: Path,
        node: Node,
        completion: Completion,
    ) -> Result<(WriteId, Effects)> {
        self.submit(WriteKind::Overwrite, path, WritePayload::Node(node), completion)
    }

    /// Replace named children at `path`.
    pub fn submit_merge(
        &mut self,
        path: Path,
        children: Children,
        completion: Completion,
    ) -> Result<(WriteId, Effects)> {
        self.submit(
            WriteKind::Merge,
            path,
            WritePayload::Children(children),
            completion,
        )
    }

    /// Ask the server to overwrite `path` when this client disconnects.
    pub fn register_disconnect_write(
        &mut self,
        path: Path,
        node: Node,
        completion: Completion,
    ) -> Result<(WriteId, Effects)> {
        self.submit(
            WriteKind::DisconnectOverwrite,
            path,
            WritePayload::Node(node),
            completion,
        )
    }

    /// Ask the server to merge children at `path` when this client disconnects.
    pub fn register_disconnect_merge(
        &mut self,
        path: Path,
        children: Children,
        completion: Completion,
    ) -> Result<(WriteId, Effects)> {
        self.submit(
            WriteKind::DisconnectMerge,
            path,
            WritePayload::Children(children),
            completion,
        )
    }

    /// Drop disconnect writes registered at and below `path`.
    pub fn cancel_disconnect_write(
        &mut self,
        path: Path,
        completion: Completion,
    ) -> Result<(WriteId, Effects)> {
        self.submit(
            WriteKind::DisconnectCancel,
            path,
            WritePayload::None,
            completion,
        )
    }

    fn submit(
        &mut self,
        kind: WriteKind,
        path: Path,
        payload: WritePayload,
        completion: Completion,
    ) -> Result<(WriteId, Effects)> {
        let visible = !kind.is_disconnect();
        let id = self.writes.add_write(
            kind,
            path.clone(),
            payload,
            visible,
            WriteOwner::Plain,
            completion,
        )?;
        debug!(write_id = %id, path = %path, ?kind, "write submitted");
        self.persist_write(id);

        let mut effects = Effects::new();
        if !kind.is_disconnect() {
            let superseded = if kind == WriteKind::Overwrite && self.config.supersede_nested_writes
            {
                self.writes.purge_writes_at_and_below(&path, id)
            } else {
                Vec::new()
            };
            for resolution in &superseded {
                debug!(write_id = %resolution.id, by = %id, "write superseded");
                self.forget_write(resolution.id);
            }

            let aborted = self.abort_transactions_for(&path);
            let changed = aborted
                .iter()
                .map(|(txn_path, _)| txn_path)
                .fold(path.clone(), |shallowest, txn_path| {
                    if txn_path.contains(&shallowest) {
                        txn_path.clone()
                    } else {
                        shallowest
                    }
                });

            let events = self.raise(&changed);
            effects.events(events);
            for resolution in superseded {
                effects.resolved(resolution);
            }
            effects
                .deliveries
                .extend(aborted.into_iter().map(|(_, delivery)| delivery));
        }

        self.flush_outbound(&mut effects);
        Ok((id, effects))
    }

    /// Register an observer and synthesise its initial events.
    pub fn attach_listener(
        &mut self,
        path: Path,
        kind: EventKind,
        order: ChildOrder,
        sink: EventSink,
    ) -> (RegistrationId, Effects) {
        let id = self.registry.attach(path.clone(), kind, order, sink);
        debug!(registration = %id, path = %path, ?kind, "listener attached");

        let view = self.resolve(&path);
        let mut effects = Effects::new();
        effects.events(self.registry.raise_initial(id, &view));
        (id, effects)
    }

    pub fn detach_listener(&mut self, id: RegistrationId) -> Result<()> {
        let registration = self.registry.detach(id)?;
        debug!(registration = %id, path = %registration.path, "listener detached");
        Ok(())
    }

    /// The server answered an outbound request.
    pub fn on_write_response(&mut self, id: WriteId, response: WriteResponse) -> Effects {
        let Some(record) = self.writes.get(id) else {
            warn!(write_id = %id, ?response, "response for a write that is no longer pending");
            return Effects::new();
        };
        if let WriteOwner::Transaction(txn) = record.owner {
            return self.on_transaction_response(txn, id, response);
        }

        let path = record.path.clone();
        let kind = record.kind;
        let payload = record.payload.clone();

        let outcome = match response {
            WriteResponse::Ok => {
                debug!(write_id = %id, path = %path, "write acknowledged");
                self.confirm(kind, &path, payload);
                WriteOutcome::Acknowledged
            }
            WriteResponse::Stale => {
                warn!(write_id = %id, path = %path, "plain write reported stale");
                WriteOutcome::Canceled(CancelReason::Rejected("datastale".into()))
            }
            WriteResponse::Rejected(reason) => {
                warn!(write_id = %id, path = %path, %reason, "write rejected by server");
                WriteOutcome::Canceled(CancelReason::Rejected(reason))
            }
        };

        let resolution = self.writes.remove_write(id, outcome);
        self.forget_write(id);

        let mut effects = Effects::new();
        if !kind.is_disconnect() {
            effects.events(self.raise(&path));
        }
        if let Some(resolution) = resolution {
            effects.resolved(resolution);
        }
        effects
    }

    /// Fold an acknowledged plain write into confirmed state.
    fn confirm(&mut self, kind: WriteKind, path: &Path, payload: WritePayload) {
        match kind {
            WriteKind::Overwrite | WriteKind::Merge => {
                self.server.apply_payload(path, &payload);
                self.persist_server_cache();
            }
            WriteKind::DisconnectOverwrite | WriteKind::DisconnectMerge => {
                self.disconnects.push(DisconnectRegistration {
                    path: path.clone(),
                    payload,
                });
            }
            WriteKind::DisconnectCancel => {
                self.disconnects
                    .retain(|registration| !path.contains(&registration.path));
            }
        }
    }

    /// The server pushed a new value for `path`.
    pub fn on_server_overwrite(&mut self, path: &Path, node: Node) -> Effects {
        self.server.apply_overwrite(path, node);
        self.persist_server_cache();
        let mut effects = Effects::new();
        effects.events(self.raise(path));
        effects
    }

    /// The server pushed new values for children of `path`.
    pub fn on_server_merge(&mut self, path: &Path, children: &Children) -> Effects {
        self.server.apply_merge(path, children);
        self.persist_server_cache();
        let mut effects = Effects::new();
        effects.events(self.raise(path));
        effects
    }

    /// Refresh registrations related to `changed`.
    pub(crate) fn raise(&mut self, changed: &Path) -> Vec<PendingEvent> {
        let server = &self.server;
        let writes = &self.writes;
        self.registry
            .raise(changed, |path| overlay::resolve(server, writes, path))
    }

    /// Hand every unsent write to the transport, oldest first.
    pub(crate) fn flush_outbound(&mut self, effects: &mut Effects) {
        if !self.connection.can_send() {
            return;
        }
        for id in self.writes.unsent() {
            let Some(record) = self.writes.get(id) else {
                continue;
            };
            let owner = record.owner;
            effects
                .outbound
                .push(outbound_request(record, &self.transactions));

            if let WriteOwner::Transaction(txn) = owner {
                self.transactions.mark_sent(txn);
            }
            if let Some(record) = self.writes.get_mut(id) {
                record.sent = true;
            }
        }
    }

    pub(crate) fn persist_write(&mut self, id: WriteId) {
        let (Some(persistence), Some(record)) = (self.persistence.as_mut(), self.writes.get(id))
        else {
            return;
        };
        if record.owner != WriteOwner::Plain {
            return;
        }
        if let Err(err) = persistence.save_user_write(&PersistedWrite::from_record(record)) {
            warn!(write_id = %id, error = %err, "failed to persist write");
        }
    }

    pub(crate) fn forget_write(&mut self, id: WriteId) {
        if let Some(persistence) = self.persistence.as_mut() {
            if let Err(err) = persistence.remove_user_write(id) {
                warn!(write_id = %id, error = %err, "failed to remove persisted write");
            }
        }
    }

    pub(crate) fn persist_server_cache(&mut self) {
        if let Some(persistence) = self.persistence.as_mut() {
            if let Err(err) = persistence.update_server_cache(&self.server) {
                warn!(error = %err, "failed to persist server cache");
            }
        }
    }
}

/// The transport request for a pending write.
fn outbound_request(record: &WriteRecord, transactions: &TransactionQueue) -> OutboundRequest {
    let id = record.id;
    let path = record.path.clone();
    // Payload shape is checked against the kind when the record is created.
    match (record.kind, &record.payload) {
        (WriteKind::Overwrite, WritePayload::Node(node)) => OutboundRequest::Put {
            id,
            path,
            node: node.clone(),
            expected: match record.owner {
                WriteOwner::Transaction(txn) => transactions.base_of(txn),
                WriteOwner::Plain => None,
            },
        },
        (WriteKind::Merge, WritePayload::Children(children)) => OutboundRequest::Merge {
            id,
            path,
            children: children.clone(),
        },
        (WriteKind::DisconnectOverwrite, WritePayload::Node(node)) => {
            OutboundRequest::OnDisconnectPut {
                id,
                path,
                node: node.clone(),
            }
        }
        (WriteKind::DisconnectMerge, WritePayload::Children(children)) => {
            OutboundRequest::OnDisconnectMerge {
                id,
                path,
                children: children.clone(),
            }
        }
        _ => OutboundRequest::OnDisconnectCancel { id, path },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use serde_json::{json, Value};
    use std::sync::{Arc, Mutex};

    fn path(raw: &str) -> Path {
        Path::parse(raw).unwrap()
    }

    fn node(value: Value) -> Node {
        Node::from_json(&value).unwrap()
    }

    fn connected_engine() -> SyncEngine {
        let mut engine = SyncEngine::new(EngineConfig::default());
        engine.on_connected().deliver_now();
        engine
    }

    fn value_log(engine: &mut SyncEngine, raw: &str) -> Arc<Mutex<Vec<Value>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink_log = Arc::clone(&log);
        let sink: EventSink =
            Arc::new(move |event: Event| sink_log.lock().unwrap().push(event.snapshot.to_json()));
        let (_, effects) = engine.attach_listener(path(raw), EventKind::Value, ChildOrder::Key, sink);
        effects.deliver_now();
        log
    }

    #[test]
    fn write_is_visible_immediately_and_sent() {
        let mut engine = connected_engine();
        let log = value_log(&mut engine, "foo");

        let (id, effects) = engine
            .submit_write(path("foo"), node(json!("new")), Completion::none())
            .unwrap();
        let outbound = effects.deliver_now();

        assert_eq!(*log.lock().unwrap(), vec![json!("new")]);
        assert_eq!(outbound.len(), 1);
        assert_eq!(outbound[0].write_id(), id);
        assert!(engine.writes().get(id).unwrap().sent);
    }

    #[test]
    fn nothing_is_sent_before_connecting() {
        let mut engine = SyncEngine::new(EngineConfig::default());
        let (id, effects) = engine
            .submit_write(path("foo"), node(json!(1)), Completion::none())
            .unwrap();
        assert!(effects.outbound.is_empty());

        let outbound = engine.on_connected().deliver_now();
        assert_eq!(outbound.len(), 1);
        assert_eq!(outbound[0].write_id(), id);
    }

    #[test]
    fn acknowledgment_moves_value_into_server_cache() {
        let mut engine = connected_engine();
        let outcome = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&outcome);
        let (id, effects) = engine
            .submit_write(
                path("foo"),
                node(json!("new")),
                Completion::new(move |o| *slot.lock().unwrap() = Some(o)),
            )
            .unwrap();
        effects.deliver_now();

        engine.on_write_response(id, WriteResponse::Ok).deliver_now();
        assert_eq!(*outcome.lock().unwrap(), Some(WriteOutcome::Acknowledged));
        assert_eq!(engine.pending_write_count(), 0);
        assert_eq!(engine.server_cache().node_at(&path("foo")), node(json!("new")));
    }

    #[test]
    fn rejection_reverts_and_reports() {
        let mut engine = connected_engine();
        engine
            .on_server_overwrite(&path("foo"), node(json!("foo-value")))
            .deliver_now();
        let log = value_log(&mut engine, "foo");

        let (id, effects) = engine
            .submit_write(path("foo"), node(json!("new")), Completion::none())
            .unwrap();
        effects.deliver_now();
        engine
            .on_write_response(id, WriteResponse::Rejected("permission_denied".into()))
            .deliver_now();

        assert_eq!(
            *log.lock().unwrap(),
            vec![json!("foo-value"), json!("new"), json!("foo-value")]
        );
    }

    #[test]
    fn response_for_unknown_write_is_ignored() {
        let mut engine = connected_engine();
        let effects = engine.on_write_response(WriteId(42), WriteResponse::Ok);
        assert!(effects.is_empty());
    }

    #[test]
    fn supersession_when_enabled() {
        let mut engine = SyncEngine::new(EngineConfig {
            supersede_nested_writes: true,
            ..EngineConfig::default()
        });
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let record = |label: &'static str| {
            let outcomes = Arc::clone(&outcomes);
            Completion::new(move |o| outcomes.lock().unwrap().push((label, o)))
        };

        engine
            .submit_write(path("bar/qux"), node(json!(1)), record("nested"))
            .unwrap()
            .1
            .deliver_now();
        engine
            .submit_merge(path("bar"), Children::new(), record("merge"))
            .unwrap()
            .1
            .deliver_now();
        assert!(outcomes.lock().unwrap().is_empty());

        engine
            .submit_write(path("bar"), node(json!({"baz": 2})), record("cover"))
            .unwrap()
            .1
            .deliver_now();
        assert_eq!(
            *outcomes.lock().unwrap(),
            vec![("nested", WriteOutcome::Canceled(CancelReason::Superseded))]
        );
        assert_eq!(engine.pending_write_count(), 2);
    }

    #[test]
    fn cached_value_requires_completeness() {
        let mut engine = connected_engine();
        assert!(engine.cached_value(&path("foo")).is_none());
        engine
            .submit_write(path("foo"), node(json!({"a": 1})), Completion::none())
            .unwrap();
        assert_eq!(engine.cached_value(&path("foo/a")), Some(node(json!(1))));
    }
}
