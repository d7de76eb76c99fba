//! One unit of event-processing work.

use std::cmp::Ordering;
use std::sync::Arc;

use tracing::{debug, warn};

use callgrid_switch_events::{params, Event};

use crate::handlers::EventHandler;
use crate::transport::InboundMessage;

/// An event bound to its handler and to the transport message it arrived
/// on. Tasks for the same channel are ordered by ascending sequence number.
pub struct EventTask {
    event: Event,
    handler: Arc<dyn EventHandler>,
    message: Box<dyn InboundMessage>,
}

impl EventTask {
    pub fn new(event: Event, handler: Arc<dyn EventHandler>, message: Box<dyn InboundMessage>) -> Self {
        Self {
            event,
            handler,
            message,
        }
    }

    pub fn sequence(&self) -> u64 {
        self.event.sequence()
    }

    pub fn event(&self) -> &Event {
        &self.event
    }

    /// Queue key for channel-scoped ordering.
    pub fn channel_key(&self) -> Option<String> {
        self.event
            .str_param(params::CHANNEL_CALL_UUID)
            .or_else(|| self.event.str_param(params::UNIQUE_ID))
            .map(str::to_string)
    }

    /// Run the handler and settle the message: ack on success, nack without
    /// requeue on handler failure. Handler errors never propagate.
    pub async fn run(self) {
        debug!(
            "processing event {} sequence {}",
            self.event.event_type(),
            self.event.sequence()
        );
        match self.handler.handle_event(&self.event).await {
            Ok(()) => self.message.ack().await,
            Err(err) => {
                warn!(
                    "handler failed for {} sequence {}: {}",
                    self.event.event_type(),
                    self.event.sequence(),
                    err
                );
                self.message.reject(false).await;
            }
        }
    }

    /// Negatively acknowledge without running the handler.
    pub async fn nack(self, requeue: bool) {
        warn!(
            "task rejected: {} sequence {}",
            self.event.event_type(),
            self.event.sequence()
        );
        self.message.reject(requeue).await;
    }
}

impl PartialEq for EventTask {
    fn eq(&self, other: &Self) -> bool {
        self.sequence() == other.sequence()
    }
}

impl Eq for EventTask {}

impl PartialOrd for EventTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EventTask {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sequence().cmp(&other.sequence())
    }
}
