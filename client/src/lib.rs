//! # Drift Client
//!
//! Async runtime around [`drift_engine`]. A [`Database`] owns one worker
//! task that drives the engine, one delivery task that runs listener
//! callbacks and completions, and a [`Transport`] that carries requests to
//! the server.
//!
//! ```no_run
//! use drift_client::{ClientConfig, Database, MockTransport};
//! use drift_engine::{ChildOrder, EventKind};
//! use futures::StreamExt;
//! use serde_json::json;
//!
//! # async fn demo() -> drift_client::Result<()> {
//! let db = Database::new(ClientConfig::load()?, MockTransport::new())?;
//! let mut names = db
//!     .attach_listener("users/alice/name", EventKind::Value, ChildOrder::Key)
//!     .await?;
//!
//! let ticket = db.set("users/alice/name", &json!("Alice")).await?;
//! let event = names.next().await;
//! assert!(event.is_some());
//!
//! db.server_events().connected()?;
//! let _outcome = ticket.outcome().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
mod database;
mod delivery;
pub mod error;
pub mod transport;
mod worker;

pub use config::{ClientConfig, ConfigError};
pub use database::{Database, EventStream, TransactionTicket, WriteTicket};
pub use error::{ClientError, Result};
pub use transport::{MockTransport, ServerEvent, ServerEvents, Transport};
pub use worker::WriteOp;
