//! The public database handle.

use crate::{
    config::ClientConfig,
    delivery::DeliveryQueue,
    error::{ClientError, Result},
    transport::{ServerEvents, Transport},
    worker::{Command, Settings, WriteOp, Worker},
};
use drift_engine::{
    ChildKey, ChildOrder, Children, Completion, Event, EventKind, EventSink, Node, Path,
    PersistedState, RegistrationId, TransactionCompletion, TransactionDecision, TransactionId,
    TransactionOptions, TransactionOutcome, WriteId, WriteOutcome,
};
use futures::{channel::mpsc as event_channel, Stream, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::Instrument;
use uuid::Uuid;

/// A pending write's id and its eventual outcome.
#[derive(Debug)]
pub struct WriteTicket {
    id: WriteId,
    outcome: oneshot::Receiver<WriteOutcome>,
}

impl WriteTicket {
    pub fn id(&self) -> WriteId {
        self.id
    }

    /// Wait until the server acknowledges or the write is canceled.
    pub async fn outcome(self) -> Result<WriteOutcome> {
        self.outcome.await.map_err(|_| ClientError::Closed)
    }
}

/// A running transaction's id and its eventual outcome.
#[derive(Debug)]
pub struct TransactionTicket {
    id: TransactionId,
    outcome: oneshot::Receiver<TransactionOutcome>,
}

impl TransactionTicket {
    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub async fn outcome(self) -> Result<TransactionOutcome> {
        self.outcome.await.map_err(|_| ClientError::Closed)
    }
}

/// Events for one listener registration.
#[derive(Debug)]
pub struct EventStream {
    id: RegistrationId,
    events: event_channel::UnboundedReceiver<Event>,
}

impl EventStream {
    pub fn registration(&self) -> RegistrationId {
        self.id
    }
}

impl Stream for EventStream {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        self.events.poll_next_unpin(cx)
    }
}

/// Client handle for a realtime tree database.
///
/// Writes are visible to local listeners immediately and sent to the server
/// through the [`Transport`] in submission order. Must be created inside a
/// tokio runtime.
pub struct Database {
    session: Uuid,
    commands: mpsc::UnboundedSender<Command>,
    settings: Arc<Mutex<Settings>>,
    worker: JoinHandle<()>,
    delivery: JoinHandle<()>,
}

impl Database {
    pub fn new(config: ClientConfig, transport: impl Transport) -> Result<Self> {
        Self::start(config, transport, None)
    }

    /// Start with persistence enabled, resuming from previously exported
    /// state.
    pub fn restore(
        config: ClientConfig,
        transport: impl Transport,
        state: PersistedState,
    ) -> Result<Self> {
        let config = ClientConfig {
            persistence_enabled: true,
            ..config
        };
        Self::start(config, transport, Some(state))
    }

    fn start(
        config: ClientConfig,
        transport: impl Transport,
        restore_from: Option<PersistedState>,
    ) -> Result<Self> {
        let settings = Arc::new(Mutex::new(Settings {
            engine: config.engine_config(),
            cache_size: config.cache_size()?,
            persistence_enabled: config.persistence_enabled,
            restore_from,
        }));

        let session = Uuid::new_v4();
        let (delivery_queue, delivery) = DeliveryQueue::spawn();
        let (commands, receiver) = mpsc::unbounded_channel();
        let worker = Worker::new(transport, delivery_queue, Arc::clone(&settings));
        let worker = tokio::spawn(
            worker
                .run(receiver)
                .instrument(tracing::info_span!("drift_worker", session = %session)),
        );

        tracing::info!(
            session = %session,
            persistence = config.persistence_enabled,
            cache_size = config.cache_size_bytes,
            "database created"
        );

        Ok(Self {
            session,
            commands,
            settings,
            worker,
            delivery,
        })
    }

    pub fn session_id(&self) -> Uuid {
        self.session
    }

    /// Handle the transport uses to report what the server said.
    pub fn server_events(&self) -> ServerEvents {
        ServerEvents::new(self.commands.clone())
    }

    pub fn cache_size_bytes(&self) -> u64 {
        self.settings.lock().cache_size.bytes()
    }

    /// Change the persisted-cache budget. Fails once the database is in use.
    pub fn set_cache_size_bytes(&self, bytes: u64) -> Result<()> {
        self.settings.lock().cache_size.set(bytes)?;
        Ok(())
    }

    /// Turn persistence on or off. Fails once the database is in use.
    pub fn set_persistence_enabled(&self, enabled: bool) -> Result<()> {
        let mut settings = self.settings.lock();
        if settings.is_frozen() {
            return Err(drift_engine::Error::Configuration(
                "persistence cannot change after the database is in use".into(),
            )
            .into());
        }
        settings.persistence_enabled = enabled;
        Ok(())
    }

    fn dispatch(&self, command: Command) -> Result<()> {
        self.settings.lock().cache_size.freeze();
        self.commands.send(command).map_err(|_| ClientError::Closed)
    }

    async fn request<R>(
        &self,
        command: impl FnOnce(oneshot::Sender<R>) -> Command,
    ) -> Result<R> {
        let (reply, response) = oneshot::channel();
        self.dispatch(command(reply))?;
        response.await.map_err(|_| ClientError::Closed)
    }

    /// Submit a write with a caller-supplied completion.
    pub async fn write(&self, path: &str, op: WriteOp, completion: Completion) -> Result<WriteId> {
        let path = Path::parse(path)?;
        let id = self
            .request(|reply| Command::Write {
                path,
                op,
                completion,
                reply,
            })
            .await??;
        Ok(id)
    }

    async fn write_ticket(&self, path: &str, op: WriteOp) -> Result<WriteTicket> {
        let (tx, outcome) = oneshot::channel();
        let completion = Completion::new(move |result| {
            let _ = tx.send(result);
        });
        let id = self.write(path, op, completion).await?;
        Ok(WriteTicket { id, outcome })
    }

    /// Overwrite the value at `path`.
    pub async fn set<V: Serialize + ?Sized>(&self, path: &str, value: &V) -> Result<WriteTicket> {
        let node = to_node(value)?;
        self.write_ticket(path, WriteOp::Set(node)).await
    }

    /// Replace the named children at `path`, leaving the others alone.
    pub async fn update<V: Serialize + ?Sized>(
        &self,
        path: &str,
        values: &V,
    ) -> Result<WriteTicket> {
        let children = to_children(values)?;
        self.write_ticket(path, WriteOp::Update(children)).await
    }

    /// Have the server overwrite `path` when this client disconnects.
    pub async fn on_disconnect_set<V: Serialize + ?Sized>(
        &self,
        path: &str,
        value: &V,
    ) -> Result<WriteTicket> {
        let node = to_node(value)?;
        self.write_ticket(path, WriteOp::OnDisconnectSet(node)).await
    }

    pub async fn on_disconnect_update<V: Serialize + ?Sized>(
        &self,
        path: &str,
        values: &V,
    ) -> Result<WriteTicket> {
        let children = to_children(values)?;
        self.write_ticket(path, WriteOp::OnDisconnectUpdate(children))
            .await
    }

    /// Drop disconnect writes at and below `path`.
    pub async fn cancel_on_disconnect(&self, path: &str) -> Result<WriteTicket> {
        self.write_ticket(path, WriteOp::CancelOnDisconnect).await
    }

    /// Listen for `kind` events at `path`.
    pub async fn attach_listener(
        &self,
        path: &str,
        kind: EventKind,
        order: ChildOrder,
    ) -> Result<EventStream> {
        let (tx, events) = event_channel::unbounded();
        let sink: EventSink = Arc::new(move |event: Event| {
            let _ = tx.unbounded_send(event);
        });
        let id = self.attach_sink(path, kind, order, sink).await?;
        Ok(EventStream { id, events })
    }

    /// Listen with a callback run on the delivery task.
    pub async fn attach_sink(
        &self,
        path: &str,
        kind: EventKind,
        order: ChildOrder,
        sink: EventSink,
    ) -> Result<RegistrationId> {
        let path = Path::parse(path)?;
        self.request(|reply| Command::Attach {
            path,
            kind,
            order,
            sink,
            reply,
        })
        .await
    }

    pub async fn detach_listener(&self, id: RegistrationId) -> Result<()> {
        self.request(|reply| Command::Detach { id, reply }).await??;
        Ok(())
    }

    /// Run an optimistic transaction at `path`.
    ///
    /// `update` may run several times; it must not assume it runs once.
    pub async fn run_transaction<F>(
        &self,
        path: &str,
        update: F,
        options: TransactionOptions,
    ) -> Result<TransactionTicket>
    where
        F: FnMut(&Node) -> TransactionDecision + Send + 'static,
    {
        let path = Path::parse(path)?;
        let (tx, outcome) = oneshot::channel();
        let completion = TransactionCompletion::new(move |result| {
            let _ = tx.send(result);
        });
        let id = self
            .request(|reply| Command::Transaction {
                path,
                update: Box::new(update),
                options,
                completion,
                reply,
            })
            .await?;
        Ok(TransactionTicket { id, outcome })
    }

    /// Cancel all pending writes and stop talking to the server.
    pub fn go_offline(&self) -> Result<()> {
        self.dispatch(Command::GoOffline)
    }

    pub fn go_online(&self) -> Result<()> {
        self.dispatch(Command::GoOnline)
    }

    /// Cancel every pending write and transaction.
    pub fn purge_outstanding_writes(&self) -> Result<()> {
        self.dispatch(Command::Purge)
    }

    /// The locally known value at `path`, if it is complete.
    pub async fn get_cached(&self, path: &str) -> Result<Option<Node>> {
        let path = Path::parse(path)?;
        self.request(|reply| Command::GetCached { path, reply })
            .await
    }

    /// Persisted state, when persistence is enabled.
    pub async fn export_state(&self) -> Result<Option<PersistedState>> {
        self.request(|reply| Command::ExportState { reply }).await
    }

    /// Wait until every call made so far has been handled and every
    /// resulting event and completion has been delivered.
    pub async fn flush(&self) -> Result<()> {
        self.request(|reply| Command::Flush { reply }).await
    }

    /// Stop the worker after it handles everything already queued.
    pub async fn shutdown(self) {
        let _ = self.commands.send(Command::Shutdown);
        drop(self.commands);
        if let Err(err) = self.worker.await {
            tracing::error!(error = %err, "worker task failed");
        }
        if let Err(err) = self.delivery.await {
            tracing::error!(error = %err, "delivery task failed");
        }
        tracing::info!(session = %self.session, "database shut down");
    }
}

fn to_node<V: Serialize + ?Sized>(value: &V) -> Result<Node> {
    let json = serde_json::to_value(value)?;
    Ok(Node::from_json(&json)?)
}

/// Children for a merge. Null values are kept so the merge removes them.
fn to_children<V: Serialize + ?Sized>(values: &V) -> Result<Children> {
    match serde_json::to_value(values)? {
        serde_json::Value::Object(map) => map
            .iter()
            .map(|(key, value)| -> Result<(ChildKey, Node)> {
                Ok((ChildKey::new(key.as_str())?, Node::from_json(value)?))
            })
            .collect(),
        serde_json::Value::Null => Ok(Children::new()),
        _ => Err(drift_engine::Error::InvalidPayload(
            "update expects an object of children".into(),
        )
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_to_children_rejects_scalars() {
        assert!(matches!(
            to_children(&json!(5)),
            Err(ClientError::Engine(drift_engine::Error::InvalidPayload(_)))
        ));
        assert!(to_children(&json!(null)).unwrap().is_empty());

        let children = to_children(&json!({"a": 1, "b": null})).unwrap();
        assert_eq!(children.len(), 2);
        assert!(children[&ChildKey::new("b").unwrap()].is_empty());
    }
}
