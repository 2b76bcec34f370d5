//! Delivery context.
//!
//! Event sinks and completions never run on the worker. The worker hands
//! them to a dedicated task that runs them one at a time, in the order the
//! engine produced them.

use drift_engine::{Delivery, Effects};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

enum DeliveryItem {
    Deliver(Delivery),
    /// Answered once everything queued before it has run
    Barrier(oneshot::Sender<()>),
}

/// Sending half of the delivery queue.
#[derive(Clone)]
pub(crate) struct DeliveryQueue {
    tx: mpsc::UnboundedSender<DeliveryItem>,
}

impl DeliveryQueue {
    /// Start the delivery task on the current runtime.
    pub(crate) fn spawn() -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run(rx));
        (Self { tx }, handle)
    }

    /// Queue the deliveries of `effects`, keeping their order.
    pub(crate) fn push(&self, effects: &mut Effects) {
        for delivery in effects.deliveries.drain(..) {
            if self.tx.send(DeliveryItem::Deliver(delivery)).is_err() {
                tracing::warn!("delivery task has stopped, dropping notification");
                return;
            }
        }
    }

    pub(crate) fn barrier(&self, reply: oneshot::Sender<()>) {
        if let Err(mpsc::error::SendError(DeliveryItem::Barrier(reply))) =
            self.tx.send(DeliveryItem::Barrier(reply))
        {
            // Nothing left to wait for.
            let _ = reply.send(());
        }
    }
}

async fn run(mut rx: mpsc::UnboundedReceiver<DeliveryItem>) {
    while let Some(item) = rx.recv().await {
        match item {
            DeliveryItem::Deliver(delivery) => {
                tracing::trace!(?delivery, "delivering");
                delivery.deliver();
            }
            DeliveryItem::Barrier(reply) => {
                let _ = reply.send(());
            }
        }
    }
    tracing::debug!("delivery task stopped");
}
