//! Connection mode, purge, and disconnect registrations.

use crate::{
    effects::{Delivery, Effects},
    engine::SyncEngine,
    CancelReason, Path, WriteOwner, WritePayload,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Whether the client wants to be connected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionMode {
    #[default]
    Online,
    Offline,
}

/// Requested mode plus what the transport last reported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionState {
    mode: ConnectionMode,
    connected: bool,
}

impl ConnectionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(&self) -> ConnectionMode {
        self.mode
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Writes go out only while online and connected.
    pub fn can_send(&self) -> bool {
        self.mode == ConnectionMode::Online && self.connected
    }
}

/// A disconnect write the server has accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisconnectRegistration {
    pub path: Path,
    pub payload: WritePayload,
}

impl SyncEngine {
    /// Cancel every pending write and transaction.
    ///
    /// Events for the reverted values are delivered first. Completions
    /// follow in ascending write id order, each with
    /// [`CancelReason::WriteCanceled`].
    pub fn purge_outstanding_writes(&mut self) -> Effects {
        let resolutions = self.writes.purge_all(CancelReason::WriteCanceled);
        self.disconnects.clear();
        if let Some(persistence) = self.persistence.as_mut() {
            if let Err(err) = persistence.remove_all_user_writes() {
                warn!(error = %err, "failed to clear persisted writes");
            }
        }
        info!(
            writes = resolutions.len(),
            transactions = self.transactions.len(),
            "purging outstanding writes"
        );

        let mut effects = Effects::new();
        effects.events(self.raise(&Path::root()));

        for resolution in resolutions {
            match resolution.owner {
                WriteOwner::Plain => effects.resolved(resolution),
                WriteOwner::Transaction(txn) => {
                    let canceled = self.cancel_transaction(txn, CancelReason::WriteCanceled);
                    effects.deliveries.extend(canceled);
                }
            }
        }
        // Transactions between attempts hold no write.
        let remaining: Vec<Delivery> = self.cancel_all_transactions(CancelReason::WriteCanceled);
        effects.deliveries.extend(remaining);
        effects
    }

    /// Purge everything and stop sending until [`SyncEngine::go_online`].
    pub fn go_offline(&mut self) -> Effects {
        info!("going offline");
        let effects = self.purge_outstanding_writes();
        self.connection.mode = ConnectionMode::Offline;
        effects
    }

    /// Resume sending; anything written while offline goes out now.
    pub fn go_online(&mut self) -> Effects {
        info!("going online");
        self.connection.mode = ConnectionMode::Online;
        let mut effects = Effects::new();
        self.flush_outbound(&mut effects);
        effects
    }

    /// The transport established a connection.
    pub fn on_connected(&mut self) -> Effects {
        info!(pending = self.writes.len(), "connected");
        self.connection.connected = true;
        let mut effects = Effects::new();
        self.flush_outbound(&mut effects);
        effects
    }

    /// The transport lost its connection.
    ///
    /// Pending writes stay and are resent on reconnect. Accepted disconnect
    /// writes have now run on the server, so they are folded into the
    /// server cache.
    pub fn on_connection_lost(&mut self) -> Effects {
        info!(
            pending = self.writes.len(),
            disconnect_writes = self.disconnects.len(),
            "connection lost"
        );
        self.connection.connected = false;
        self.writes.mark_all_unsent();
        let failed = self.reset_transactions_after_disconnect();

        let fired = std::mem::take(&mut self.disconnects);
        for registration in &fired {
            debug!(path = %registration.path, "applying disconnect write");
            self.server
                .apply_payload(&registration.path, &registration.payload);
        }
        if !fired.is_empty() {
            self.persist_server_cache();
        }

        let mut effects = Effects::new();
        effects.events(self.raise(&Path::root()));
        effects.deliveries.extend(failed);
        effects
    }
}
