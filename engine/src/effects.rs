//! Side effects requested by the engine.
//!
//! The engine never talks to the network or to observers directly. Every
//! mutating call returns [`Effects`]: deliveries, in the exact order they
//! must reach observers and completions, and requests for the transport.

use crate::{
    event::PendingEvent, Children, Node, Path, Resolution, TransactionCompletion, TransactionId,
    TransactionOutcome, WriteId,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A request for the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundRequest {
    /// Overwrite `path`. With `expected` set, the server must only apply it
    /// while its current value equals `expected`.
    Put {
        id: WriteId,
        path: Path,
        node: Node,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expected: Option<Node>,
    },
    Merge {
        id: WriteId,
        path: Path,
        children: Children,
    },
    OnDisconnectPut {
        id: WriteId,
        path: Path,
        node: Node,
    },
    OnDisconnectMerge {
        id: WriteId,
        path: Path,
        children: Children,
    },
    OnDisconnectCancel {
        id: WriteId,
        path: Path,
    },
}

impl OutboundRequest {
    pub fn write_id(&self) -> WriteId {
        match self {
            OutboundRequest::Put { id, .. }
            | OutboundRequest::Merge { id, .. }
            | OutboundRequest::OnDisconnectPut { id, .. }
            | OutboundRequest::OnDisconnectMerge { id, .. }
            | OutboundRequest::OnDisconnectCancel { id, .. } => *id,
        }
    }
}

/// The server's answer to one outbound request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum WriteResponse {
    Ok,
    /// A compare-and-set found a different base value
    Stale,
    Rejected(String),
}

/// One item for the delivery context.
pub enum Delivery {
    Event(PendingEvent),
    Write(Resolution),
    Transaction {
        id: TransactionId,
        completion: TransactionCompletion,
        outcome: TransactionOutcome,
    },
}

impl Delivery {
    /// Hand the item to its sink or completion.
    pub fn deliver(self) {
        match self {
            Delivery::Event(pending) => pending.deliver(),
            Delivery::Write(resolution) => resolution.fire(),
            Delivery::Transaction {
                completion,
                outcome,
                ..
            } => completion.fire(outcome),
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Delivery::Event(pending) => f.debug_tuple("Event").field(pending).finish(),
            Delivery::Write(resolution) => f.debug_tuple("Write").field(resolution).finish(),
            Delivery::Transaction { id, outcome, .. } => f
                .debug_struct("Transaction")
                .field("id", id)
                .field("outcome", outcome)
                .finish(),
        }
    }
}

/// Everything one engine call wants done, in order.
#[derive(Debug, Default)]
pub struct Effects {
    pub deliveries: Vec<Delivery>,
    pub outbound: Vec<OutboundRequest>,
}

impl Effects {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.deliveries.is_empty() && self.outbound.is_empty()
    }

    pub fn events(&mut self, events: Vec<PendingEvent>) {
        self.deliveries.extend(events.into_iter().map(Delivery::Event));
    }

    pub fn resolved(&mut self, resolution: Resolution) {
        self.deliveries.push(Delivery::Write(resolution));
    }

    pub fn extend(&mut self, other: Effects) {
        self.deliveries.extend(other.deliveries);
        self.outbound.extend(other.outbound);
    }

    /// Run every delivery on the current thread and return the outbound
    /// requests.
    pub fn deliver_now(self) -> Vec<OutboundRequest> {
        for delivery in self.deliveries {
            delivery.deliver();
        }
        self.outbound
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn outbound_wire_format() {
        let request = OutboundRequest::Put {
            id: WriteId(3),
            path: Path::parse("foo").unwrap(),
            node: Node::from_json(&json!("new")).unwrap(),
            expected: None,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            value,
            json!({"type": "put", "id": 3, "path": "/foo", "node": "new"})
        );
        assert_eq!(request.write_id(), WriteId(3));
    }

    #[test]
    fn response_wire_format() {
        let parsed: WriteResponse =
            serde_json::from_str(r#"{"status":"rejected","reason":"permission_denied"}"#).unwrap();
        assert_eq!(parsed, WriteResponse::Rejected("permission_denied".into()));
        let ok: WriteResponse = serde_json::from_str(r#"{"status":"ok"}"#).unwrap();
        assert_eq!(ok, WriteResponse::Ok);
    }
}
