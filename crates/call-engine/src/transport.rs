//! Transport boundaries.
//!
//! The event transport delivers switch events at least once and unordered;
//! each message can be acked or rejected (with or without requeue). The
//! command transport is fire-and-forget: enqueue a command string to a named
//! destination, match the asynchronous response later by correlation id.

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::error::Result;

/// One delivered message. Settling it (ack/reject) consumes it; a message
/// that is never settled is redelivered by the transport.
#[async_trait]
pub trait InboundMessage: Send {
    fn payload(&self) -> &[u8];

    /// Positive acknowledgement: the message is done.
    async fn ack(self: Box<Self>);

    /// Negative acknowledgement; `requeue` asks the transport to redeliver.
    async fn reject(self: Box<Self>, requeue: bool);
}

/// At-least-once, unordered event delivery.
#[async_trait]
pub trait EventTransport: Send + Sync {
    /// Next message, or `None` once the transport is closed.
    async fn next_message(&self) -> Option<Box<dyn InboundMessage>>;
}

/// Fire-and-forget outbound command enqueue.
#[async_trait]
pub trait CommandTransport: Send + Sync {
    async fn enqueue(&self, destination: &str, command: &str, correlation_id: &str) -> Result<()>;
}

// ----- in-memory implementation -----

/// How a published message was finally settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Acked,
    Rejected { requeue: bool },
}

struct MemoryDelivery {
    payload: Vec<u8>,
    outcome: oneshot::Sender<DeliveryOutcome>,
}

#[async_trait]
impl InboundMessage for MemoryDelivery {
    fn payload(&self) -> &[u8] {
        &self.payload
    }

    async fn ack(self: Box<Self>) {
        let _ = self.outcome.send(DeliveryOutcome::Acked);
    }

    async fn reject(self: Box<Self>, requeue: bool) {
        let _ = self.outcome.send(DeliveryOutcome::Rejected { requeue });
    }
}

/// Channel-backed [`EventTransport`] for tests and embedded runs.
pub struct MemoryTransport {
    rx: Mutex<mpsc::UnboundedReceiver<MemoryDelivery>>,
}

/// Publishing side of a [`MemoryTransport`].
#[derive(Clone)]
pub struct MemoryPublisher {
    tx: mpsc::UnboundedSender<MemoryDelivery>,
}

impl MemoryTransport {
    pub fn channel() -> (Self, MemoryPublisher) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { rx: Mutex::new(rx) }, MemoryPublisher { tx })
    }
}

impl MemoryPublisher {
    /// Publish a payload; the returned receiver resolves with the final
    /// settlement of this delivery.
    pub fn publish(&self, payload: Vec<u8>) -> oneshot::Receiver<DeliveryOutcome> {
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let _ = self.tx.send(MemoryDelivery {
            payload,
            outcome: outcome_tx,
        });
        outcome_rx
    }
}

#[async_trait]
impl EventTransport for MemoryTransport {
    async fn next_message(&self) -> Option<Box<dyn InboundMessage>> {
        let delivery = self.rx.lock().await.recv().await?;
        Some(Box::new(delivery))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivery_reports_settlement() {
        let (transport, publisher) = MemoryTransport::channel();
        let outcome = publisher.publish(b"hello".to_vec());
        let msg = transport.next_message().await.unwrap();
        assert_eq!(msg.payload(), b"hello");
        msg.ack().await;
        assert_eq!(outcome.await.unwrap(), DeliveryOutcome::Acked);
    }

    #[tokio::test]
    async fn rejection_carries_requeue_flag() {
        let (transport, publisher) = MemoryTransport::channel();
        let outcome = publisher.publish(b"x".to_vec());
        let msg = transport.next_message().await.unwrap();
        msg.reject(true).await;
        assert_eq!(
            outcome.await.unwrap(),
            DeliveryOutcome::Rejected { requeue: true }
        );
    }

    #[tokio::test]
    async fn closed_publisher_ends_the_stream() {
        let (transport, publisher) = MemoryTransport::channel();
        drop(publisher);
        assert!(transport.next_message().await.is_none());
    }
}
