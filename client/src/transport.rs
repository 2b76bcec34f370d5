//! The seam between the client and the network.
//!
//! Outbound requests go through [`Transport`]. Whatever the transport learns
//! from the server comes back as [`ServerEvent`]s posted to a
//! [`ServerEvents`] handle, which feeds the worker in order.

use crate::{
    error::{ClientError, Result},
    worker::Command,
};
use drift_engine::{Children, Node, OutboundRequest, Path, WriteId, WriteResponse};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Connection to the database server.
///
/// Calls come from the worker task and must not block.
pub trait Transport: Send + 'static {
    /// Queue a request for the server.
    fn send(&mut self, request: OutboundRequest);

    /// Drop the connection and stay disconnected.
    fn interrupt(&mut self);

    /// Reconnect after [`Transport::interrupt`].
    fn resume(&mut self);
}

/// Something the server (or the connection) reported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Connected,
    Disconnected,
    WriteResponse {
        id: WriteId,
        response: WriteResponse,
    },
    /// New value for a whole subtree
    DataUpdate { path: Path, node: Node },
    /// New values for named children
    DataMerge { path: Path, children: Children },
}

/// Handle for reporting [`ServerEvent`]s. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ServerEvents {
    commands: mpsc::UnboundedSender<Command>,
}

impl ServerEvents {
    pub(crate) fn new(commands: mpsc::UnboundedSender<Command>) -> Self {
        Self { commands }
    }

    pub fn send(&self, event: ServerEvent) -> Result<()> {
        self.commands
            .send(Command::Server(event))
            .map_err(|_| ClientError::Closed)
    }

    pub fn connected(&self) -> Result<()> {
        self.send(ServerEvent::Connected)
    }

    pub fn disconnected(&self) -> Result<()> {
        self.send(ServerEvent::Disconnected)
    }

    pub fn write_response(&self, id: WriteId, response: WriteResponse) -> Result<()> {
        self.send(ServerEvent::WriteResponse { id, response })
    }

    pub fn data_update(&self, path: Path, node: Node) -> Result<()> {
        self.send(ServerEvent::DataUpdate { path, node })
    }

    pub fn data_merge(&self, path: Path, children: Children) -> Result<()> {
        self.send(ServerEvent::DataMerge { path, children })
    }
}

#[derive(Debug, Default)]
struct MockState {
    sent: Vec<OutboundRequest>,
    interrupted: bool,
}

/// In-memory transport that records requests.
///
/// Clones share state, so a test can keep one and hand the other to the
/// database.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every request sent so far.
    pub fn sent(&self) -> Vec<OutboundRequest> {
        self.state.lock().sent.clone()
    }

    /// Requests sent since the last call.
    pub fn take_sent(&self) -> Vec<OutboundRequest> {
        std::mem::take(&mut self.state.lock().sent)
    }

    pub fn is_interrupted(&self) -> bool {
        self.state.lock().interrupted
    }
}

impl Transport for MockTransport {
    fn send(&mut self, request: OutboundRequest) {
        tracing::trace!(write_id = %request.write_id(), "mock transport recorded request");
        self.state.lock().sent.push(request);
    }

    fn interrupt(&mut self) {
        self.state.lock().interrupted = true;
    }

    fn resume(&mut self) {
        self.state.lock().interrupted = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_server_event_deserialization() {
        let json = r#"{
            "type": "write_response",
            "id": 7,
            "response": {"status": "rejected", "reason": "permission_denied"}
        }"#;
        let event: ServerEvent = serde_json::from_str(json).unwrap();
        assert_eq!(
            event,
            ServerEvent::WriteResponse {
                id: WriteId(7),
                response: WriteResponse::Rejected("permission_denied".into()),
            }
        );

        let json = r#"{"type": "data_update", "path": "/users/alice", "node": {"age": 30}}"#;
        match serde_json::from_str::<ServerEvent>(json).unwrap() {
            ServerEvent::DataUpdate { path, node } => {
                assert_eq!(path.to_string(), "/users/alice");
                assert_eq!(node.to_json(), json!({"age": 30}));
            }
            other => panic!("Expected DataUpdate, got {other:?}"),
        }
    }

    #[test]
    fn test_mock_transport_records() {
        let transport = MockTransport::new();
        let mut handle = transport.clone();
        handle.send(OutboundRequest::OnDisconnectCancel {
            id: WriteId(1),
            path: Path::root(),
        });
        handle.interrupt();

        assert!(transport.is_interrupted());
        assert_eq!(transport.take_sent().len(), 1);
        assert!(transport.sent().is_empty());

        handle.resume();
        assert!(!transport.is_interrupted());
    }

    #[test]
    fn test_closed_worker_reports_closed() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let events = ServerEvents::new(tx);
        assert!(matches!(events.connected(), Err(ClientError::Closed)));
    }
}
