//! The serial execution context.
//!
//! A single tokio task owns the [`SyncEngine`]. Public calls arrive as
//! [`Command`]s over an unbounded channel and are handled strictly in
//! arrival order; synchronous results go back over oneshot channels.
//! Transport calls happen on this task; sinks and completions are handed to
//! the delivery queue.

use crate::{
    delivery::DeliveryQueue,
    transport::{ServerEvent, Transport},
};
use drift_engine::{
    CacheSizeConfig, ChildOrder, Children, Completion, EngineConfig, Effects, EventKind,
    EventSink, MemoryPersistence, Node, Path, PersistedState, RegistrationId, SyncEngine,
    TransactionCompletion, TransactionId, TransactionOptions, TransactionUpdate, WriteId,
};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Kind of write a caller asked for.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Set(Node),
    Update(Children),
    OnDisconnectSet(Node),
    OnDisconnectUpdate(Children),
    CancelOnDisconnect,
}

/// Settings the caller may change until the database is first used.
#[derive(Debug, Clone)]
pub(crate) struct Settings {
    pub(crate) engine: EngineConfig,
    pub(crate) cache_size: CacheSizeConfig,
    pub(crate) persistence_enabled: bool,
    /// State to resume from when persistence is enabled
    pub(crate) restore_from: Option<PersistedState>,
}

impl Settings {
    pub(crate) fn is_frozen(&self) -> bool {
        self.cache_size.is_frozen()
    }
}

pub(crate) enum Command {
    Write {
        path: Path,
        op: WriteOp,
        completion: Completion,
        reply: oneshot::Sender<drift_engine::Result<WriteId>>,
    },
    Attach {
        path: Path,
        kind: EventKind,
        order: ChildOrder,
        sink: EventSink,
        reply: oneshot::Sender<RegistrationId>,
    },
    Detach {
        id: RegistrationId,
        reply: oneshot::Sender<drift_engine::Result<()>>,
    },
    Transaction {
        path: Path,
        update: TransactionUpdate,
        options: TransactionOptions,
        completion: TransactionCompletion,
        reply: oneshot::Sender<TransactionId>,
    },
    GoOnline,
    GoOffline,
    Purge,
    GetCached {
        path: Path,
        reply: oneshot::Sender<Option<Node>>,
    },
    ExportState {
        reply: oneshot::Sender<Option<PersistedState>>,
    },
    Server(ServerEvent),
    Flush {
        reply: oneshot::Sender<()>,
    },
    Shutdown,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Write { path, op, .. } => f
                .debug_struct("Write")
                .field("path", path)
                .field("op", op)
                .finish(),
            Command::Attach { path, kind, .. } => f
                .debug_struct("Attach")
                .field("path", path)
                .field("kind", kind)
                .finish(),
            Command::Detach { id, .. } => f.debug_struct("Detach").field("id", id).finish(),
            Command::Transaction { path, .. } => {
                f.debug_struct("Transaction").field("path", path).finish()
            }
            Command::GoOnline => f.write_str("GoOnline"),
            Command::GoOffline => f.write_str("GoOffline"),
            Command::Purge => f.write_str("Purge"),
            Command::GetCached { path, .. } => {
                f.debug_struct("GetCached").field("path", path).finish()
            }
            Command::ExportState { .. } => f.write_str("ExportState"),
            Command::Server(event) => f.debug_tuple("Server").field(event).finish(),
            Command::Flush { .. } => f.write_str("Flush"),
            Command::Shutdown => f.write_str("Shutdown"),
        }
    }
}

pub(crate) struct Worker<T: Transport> {
    transport: T,
    delivery: DeliveryQueue,
    settings: Arc<Mutex<Settings>>,
    engine: Option<SyncEngine>,
    storage: Option<MemoryPersistence>,
}

impl<T: Transport> Worker<T> {
    pub(crate) fn new(
        transport: T,
        delivery: DeliveryQueue,
        settings: Arc<Mutex<Settings>>,
    ) -> Self {
        Self {
            transport,
            delivery,
            settings,
            engine: None,
            storage: None,
        }
    }

    pub(crate) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        tracing::debug!("worker started");
        while let Some(command) = commands.recv().await {
            tracing::trace!(?command, "handling command");
            if matches!(command, Command::Shutdown) {
                break;
            }
            self.handle(command);
        }
        tracing::info!("worker stopped");
    }

    /// The engine, built from the frozen settings on first use.
    fn engine(&mut self) -> &mut SyncEngine {
        let engine = match self.engine.take() {
            Some(engine) => engine,
            None => self.build_engine(),
        };
        self.engine.insert(engine)
    }

    fn build_engine(&mut self) -> SyncEngine {
        let settings = {
            let mut settings = self.settings.lock();
            settings.cache_size.freeze();
            settings.clone()
        };

        if !settings.persistence_enabled {
            return SyncEngine::new(settings.engine);
        }

        let storage = match settings.restore_from {
            Some(state) => MemoryPersistence::from_state(state, settings.cache_size),
            None => MemoryPersistence::new(settings.cache_size),
        };
        self.storage = Some(storage.clone());
        match SyncEngine::restore(settings.engine.clone(), Box::new(storage)) {
            Ok(engine) => engine,
            Err(err) => {
                tracing::error!(
                    error = %err,
                    "failed to restore persisted state, running without persistence"
                );
                self.storage = None;
                SyncEngine::new(settings.engine)
            }
        }
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Write {
                path,
                op,
                completion,
                reply,
            } => {
                let engine = self.engine();
                let submitted = match op {
                    WriteOp::Set(node) => engine.submit_write(path, node, completion),
                    WriteOp::Update(children) => engine.submit_merge(path, children, completion),
                    WriteOp::OnDisconnectSet(node) => {
                        engine.register_disconnect_write(path, node, completion)
                    }
                    WriteOp::OnDisconnectUpdate(children) => {
                        engine.register_disconnect_merge(path, children, completion)
                    }
                    WriteOp::CancelOnDisconnect => engine.cancel_disconnect_write(path, completion),
                };
                let result = match submitted {
                    Ok((id, effects)) => {
                        self.apply(effects);
                        Ok(id)
                    }
                    Err(err) => Err(err),
                };
                let _ = reply.send(result);
            }
            Command::Attach {
                path,
                kind,
                order,
                sink,
                reply,
            } => {
                let (id, effects) = self.engine().attach_listener(path, kind, order, sink);
                self.apply(effects);
                let _ = reply.send(id);
            }
            Command::Detach { id, reply } => {
                let _ = reply.send(self.engine().detach_listener(id));
            }
            Command::Transaction {
                path,
                update,
                options,
                completion,
                reply,
            } => {
                let (id, effects) = self
                    .engine()
                    .run_transaction(path, update, options, completion);
                self.apply(effects);
                let _ = reply.send(id);
            }
            Command::GoOnline => {
                let effects = self.engine().go_online();
                self.transport.resume();
                self.apply(effects);
            }
            Command::GoOffline => {
                let effects = self.engine().go_offline();
                self.transport.interrupt();
                self.apply(effects);
            }
            Command::Purge => {
                let effects = self.engine().purge_outstanding_writes();
                self.apply(effects);
            }
            Command::GetCached { path, reply } => {
                let _ = reply.send(self.engine().cached_value(&path));
            }
            Command::ExportState { reply } => {
                self.engine();
                let _ = reply.send(self.storage.as_ref().map(MemoryPersistence::snapshot));
            }
            Command::Server(event) => {
                let effects = self.on_server_event(event);
                self.apply(effects);
            }
            Command::Flush { reply } => self.delivery.barrier(reply),
            Command::Shutdown => {}
        }
    }

    fn on_server_event(&mut self, event: ServerEvent) -> Effects {
        let engine = self.engine();
        match event {
            ServerEvent::Connected => engine.on_connected(),
            ServerEvent::Disconnected => engine.on_connection_lost(),
            ServerEvent::WriteResponse { id, response } => engine.on_write_response(id, response),
            ServerEvent::DataUpdate { path, node } => engine.on_server_overwrite(&path, node),
            ServerEvent::DataMerge { path, children } => engine.on_server_merge(&path, &children),
        }
    }

    /// Carry out what the engine asked for.
    fn apply(&mut self, mut effects: Effects) {
        self.delivery.push(&mut effects);
        for request in effects.outbound {
            tracing::debug!(write_id = %request.write_id(), "sending request");
            self.transport.send(request);
        }
    }
}
