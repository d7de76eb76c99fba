//! Event handler dispatch.
//!
//! A closed map from event type to handler, with an explicit fallback for
//! types the schema knows but nobody handles specifically — those are
//! logged and acknowledged, never silently dropped.

pub mod background_job;
pub mod channel;
pub mod custom;
pub mod heartbeat;

pub use background_job::BackgroundJobEventHandler;
pub use channel::ChannelEventHandler;
pub use custom::CustomEventHandler;
pub use heartbeat::HeartbeatEventHandler;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use callgrid_switch_events::{Event, EventType};

use crate::commands::CommandBroker;
use crate::error::Result;
use crate::nodes::NodeRegistry;
use crate::registry::CallRegistry;

/// Processes one decoded event.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle_event(&self, event: &Event) -> Result<()>;
}

/// Handler for recognized-but-unrouted event types.
pub struct FallbackEventHandler;

#[async_trait]
impl EventHandler for FallbackEventHandler {
    async fn handle_event(&self, event: &Event) -> Result<()> {
        debug!(
            "no handler for event type {}, sequence {}",
            event.event_type(),
            event.sequence()
        );
        Ok(())
    }
}

/// Closed event-type -> handler map with a fallback.
pub struct HandlerRegistry {
    handlers: HashMap<EventType, Arc<dyn EventHandler>>,
    fallback: Arc<dyn EventHandler>,
}

impl HandlerRegistry {
    /// An empty registry with the default fallback. Used directly by tests;
    /// production wiring goes through [`standard`](Self::standard).
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            fallback: Arc::new(FallbackEventHandler),
        }
    }

    /// The production handler set.
    pub fn standard(
        registry: Arc<CallRegistry>,
        nodes: Arc<NodeRegistry>,
        broker: Arc<CommandBroker>,
    ) -> Self {
        let mut map = Self::new();

        map.register(
            EventType::Heartbeat,
            Arc::new(HeartbeatEventHandler::new(nodes)),
        );
        map.register(
            EventType::BackgroundJob,
            Arc::new(BackgroundJobEventHandler::new(broker)),
        );

        // All channel events share one handler.
        let channel_handler: Arc<dyn EventHandler> =
            Arc::new(ChannelEventHandler::new(registry.clone()));
        for event_type in [
            EventType::ChannelCreate,
            EventType::ChannelProgress,
            EventType::ChannelAnswer,
            EventType::ChannelCallstate,
            EventType::ChannelHangup,
            EventType::ChannelHangupComplete,
            EventType::ChannelBridge,
            EventType::ChannelUnbridge,
            EventType::ChannelHold,
            EventType::ChannelUnhold,
            EventType::ChannelExecute,
            EventType::Dtmf,
        ] {
            map.handlers.insert(event_type, channel_handler.clone());
        }

        map.register(EventType::Custom, Arc::new(CustomEventHandler::new(registry)));

        info!("handler registry initialized with {} routes", map.handlers.len());
        map
    }

    pub fn register(&mut self, event_type: EventType, handler: Arc<dyn EventHandler>) {
        self.handlers.insert(event_type, handler);
    }

    pub fn handler_for(&self, event_type: EventType) -> Arc<dyn EventHandler> {
        self.handlers
            .get(&event_type)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
