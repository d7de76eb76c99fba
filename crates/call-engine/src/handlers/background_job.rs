//! Responses to commands sent to the switch.
//!
//! A BACKGROUND_JOB event echoes the command text; the correlation id
//! embedded there routes the response body back to the waiting caller.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use callgrid_switch_events::{params, Event};

use crate::commands::{extract_correlation_id, CommandBroker};
use crate::error::Result;

pub struct BackgroundJobEventHandler {
    broker: Arc<CommandBroker>,
}

impl BackgroundJobEventHandler {
    pub fn new(broker: Arc<CommandBroker>) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl crate::handlers::EventHandler for BackgroundJobEventHandler {
    async fn handle_event(&self, event: &Event) -> Result<()> {
        let command = event.str_param(params::JOB_COMMAND).unwrap_or_default();
        let args = event.str_param(params::JOB_COMMAND_ARG).unwrap_or_default();
        let full_command = format!("{command} {args}");

        let body = event.str_param(params::BODY).unwrap_or_default().to_string();
        match extract_correlation_id(&full_command) {
            Some(correlation_id) => {
                self.broker.complete(correlation_id, body);
                debug!(
                    "completed background job, correlation id {}",
                    correlation_id
                );
            }
            None => warn!("no correlation id found in command: {}", full_command),
        }
        Ok(())
    }
}
