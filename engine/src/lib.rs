//! # Drift Engine
//!
//! The deterministic core of a realtime tree-database client.
//!
//! Local writes are visible immediately: every read composes the last
//! confirmed server snapshot with the pending writes layered on top, and
//! observers are notified whenever that composed view changes. Writes are
//! later acknowledged, rejected, or canceled, each exactly once.
//!
//! ## Design Principles
//!
//! - **No IO**: The engine never touches the network, threads, or files
//! - **Effects out**: Every mutating call returns [`Effects`] listing the
//!   deliveries and transport requests the host must carry out, in order
//! - **Single owner**: [`SyncEngine`] is `&mut self` throughout; the host
//!   serializes access
//!
//! ## Core Concepts
//!
//! ### Tree and paths
//!
//! Data is an immutable tree of [`Node`]s addressed by [`Path`]. Updates
//! return new trees that share unchanged subtrees.
//!
//! ### Pending writes
//!
//! The [`WriteStore`] keeps outstanding writes in submission order. Plain
//! overwrites and merges are visible locally; disconnect writes only take
//! effect on the server after this client goes away.
//!
//! ### Events
//!
//! The [`EventRegistry`] diffs old and new views per registration and emits
//! child removals, changes, moves, additions, then values.
//!
//! ### Transactions
//!
//! [`SyncEngine::run_transaction`] runs an update function against the
//! current view and retries on stale data.
//!
//! ## Quick Start
//!
//! ```rust
//! use drift_engine::{
//!     ChildOrder, Completion, EngineConfig, Event, EventKind, EventSink, Node, Path,
//!     SyncEngine, WriteResponse,
//! };
//! use serde_json::json;
//! use std::sync::{Arc, Mutex};
//!
//! let mut engine = SyncEngine::new(EngineConfig::default());
//! engine.on_connected();
//!
//! let seen = Arc::new(Mutex::new(Vec::new()));
//! let log = Arc::clone(&seen);
//! let sink: EventSink =
//!     Arc::new(move |event: Event| log.lock().unwrap().push(event.snapshot.to_json()));
//! let path = Path::parse("users/alice/name").unwrap();
//! engine
//!     .attach_listener(path.clone(), EventKind::Value, ChildOrder::Key, sink)
//!     .1
//!     .deliver_now();
//!
//! let (id, effects) = engine
//!     .submit_write(path, Node::from_json(&json!("Alice")).unwrap(), Completion::none())
//!     .unwrap();
//! let outbound = effects.deliver_now();
//! assert_eq!(outbound.len(), 1);
//! assert_eq!(*seen.lock().unwrap(), vec![json!("Alice")]);
//!
//! engine.on_write_response(id, WriteResponse::Ok).deliver_now();
//! assert_eq!(engine.pending_write_count(), 0);
//! ```

pub mod connection;
pub mod effects;
pub mod engine;
pub mod error;
pub mod event;
pub mod node;
pub mod overlay;
pub mod path;
pub mod persistence;
pub mod transaction;
pub mod write;

// Re-exports for convenience
pub use connection::{ConnectionMode, ConnectionState, DisconnectRegistration};
pub use effects::{Delivery, Effects, OutboundRequest, WriteResponse};
pub use engine::{EngineConfig, SyncEngine, DEFAULT_MAX_TRANSACTION_RETRIES};
pub use error::{Error, Result};
pub use event::{
    ChildOrder, Event, EventKind, EventRegistry, EventSink, PendingEvent, Registration,
    RegistrationId,
};
pub use node::{Children, Node};
pub use overlay::{resolve, ServerCache, View};
pub use path::{ChildKey, Path, MAX_KEY_BYTES, MAX_PATH_DEPTH};
pub use persistence::{
    CacheSizeConfig, MemoryPersistence, PersistedState, PersistedWrite, PersistenceAdapter,
    DEFAULT_CACHE_SIZE_BYTES, MAX_CACHE_SIZE_BYTES, MIN_CACHE_SIZE_BYTES,
    PERSISTENCE_FORMAT_VERSION,
};
pub use transaction::{
    TransactionCompletion, TransactionDecision, TransactionFailure, TransactionId,
    TransactionOptions, TransactionOutcome, TransactionQueue, TransactionRecord,
    TransactionStatus, TransactionUpdate,
};
pub use write::{
    Callback, CancelReason, Completion, Resolution, WriteId, WriteKind, WriteOutcome, WriteOwner,
    WritePayload, WriteRecord, WriteStore,
};
