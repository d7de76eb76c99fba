//! Application-defined (CUSTOM) events.
//!
//! Only the conference maintenance subclass is interpreted; other
//! subclasses are acknowledged untouched.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use callgrid_call_model::CallState;
use callgrid_switch_events::{params, Event};

use crate::error::Result;
use crate::registry::{CallRegistry, SharedCall};

pub struct CustomEventHandler {
    registry: Arc<CallRegistry>,
}

impl CustomEventHandler {
    pub fn new(registry: Arc<CallRegistry>) -> Self {
        Self { registry }
    }

    async fn resolve_call(&self, event: &Event) -> Option<SharedCall> {
        for var in [params::CALL_ID_VARIABLE, params::CALL_ID_SIP_HEADER_VARIABLE] {
            if let Some(call_uuid) = event.str_param(var) {
                if let Some(call) = self.registry.get_call(call_uuid).await {
                    return Some(call);
                }
            }
        }
        for key in [params::UNIQUE_ID, params::OTHER_LEG_UNIQUE_ID] {
            if let Some(channel_uuid) = event.str_param(key) {
                if let Some(call) = self.registry.get_call_by_channel(channel_uuid).await {
                    return Some(call);
                }
            }
        }
        None
    }
}

#[async_trait]
impl crate::handlers::EventHandler for CustomEventHandler {
    async fn handle_event(&self, event: &Event) -> Result<()> {
        let subclass = event.str_param(params::EVENT_SUBCLASS).unwrap_or_default();
        if subclass != "conference::maintenance" {
            debug!("ignoring custom event subclass {:?}", subclass);
            return Ok(());
        }

        let Some(call) = self.resolve_call(event).await else {
            warn!("no active call found for custom event sequence {}", event.sequence());
            return Ok(());
        };

        if event.str_param("Action") == Some("add-member") {
            let call_uuid = call.read().call_uuid.clone();
            match self.registry.update_call_state(&call_uuid, CallState::Conferencing).await {
                Ok(()) => info!("call added to conference: {}", call_uuid),
                Err(err) => debug!("conference join ignored for {}: {}", call_uuid, err),
            }
        }
        Ok(())
    }
}
