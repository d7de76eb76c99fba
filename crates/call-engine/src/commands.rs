//! Outbound command correlation.
//!
//! Commands are enqueued fire-and-forget to a switch node's command queue;
//! the switch answers asynchronously with a BACKGROUND_JOB event carrying
//! the original command text. The broker matches that response back to the
//! waiting caller through the correlation id embedded in the command.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::transport::CommandTransport;

/// Tracks pending correlation ids and completes them when the matching
/// response event arrives.
pub struct CommandBroker {
    transport: Arc<dyn CommandTransport>,
    pending: DashMap<String, oneshot::Sender<String>>,
}

impl CommandBroker {
    pub fn new(transport: Arc<dyn CommandTransport>) -> Self {
        Self {
            transport,
            pending: DashMap::new(),
        }
    }

    /// Enqueue `command` to `destination` and return a receiver for the
    /// asynchronous response body.
    pub async fn send(
        &self,
        destination: &str,
        command: &str,
    ) -> Result<oneshot::Receiver<String>> {
        let correlation_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(correlation_id.clone(), tx);
        if let Err(err) = self
            .transport
            .enqueue(destination, command, &correlation_id)
            .await
        {
            self.pending.remove(&correlation_id);
            return Err(err);
        }
        debug!("enqueued command to {} correlation {}", destination, correlation_id);
        Ok(rx)
    }

    /// Complete a pending command. Returns false when the correlation id is
    /// unknown (caller gave up, or the response was duplicated).
    pub fn complete(&self, correlation_id: &str, body: String) -> bool {
        match self.pending.remove(correlation_id) {
            Some((_, tx)) => tx.send(body).is_ok(),
            None => {
                warn!("no pending command for correlation id {}", correlation_id);
                false
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Drop all pending commands; their receivers resolve with an error.
    pub fn abort_pending(&self) {
        self.pending.clear();
    }
}

/// Pull a correlation id out of a command string.
///
/// Two placements exist: `{correlation_id=xxx,...}` variable blocks at the
/// front of an originate, and a trailing `correlation_id:xxx` for other
/// commands.
pub fn extract_correlation_id(command: &str) -> Option<&str> {
    if let Some(open) = command.find('{') {
        if let Some(close) = command[open..].find('}') {
            let block = &command[open + 1..open + close];
            for pair in block.split(',') {
                if let Some(value) = pair.trim().strip_prefix("correlation_id=") {
                    if !value.is_empty() {
                        return Some(value);
                    }
                }
            }
        }
    }
    if let Some(pos) = command.rfind("correlation_id:") {
        let value = command[pos + "correlation_id:".len()..].trim();
        if !value.is_empty() && !value.contains(char::is_whitespace) {
            return Some(value);
        }
    }
    None
}

/// A command transport that drops everything, for tests and degraded runs.
pub struct NullCommandTransport;

#[async_trait::async_trait]
impl CommandTransport for NullCommandTransport {
    async fn enqueue(&self, destination: &str, _command: &str, correlation_id: &str) -> Result<()> {
        debug!(
            "dropping command to {} correlation {} (null transport)",
            destination, correlation_id
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_from_originate_variable_block() {
        let cmd = "originate {correlation_id=abc-123,ignore_early_media=true}sofia/external/1003@pbx &park()";
        assert_eq!(extract_correlation_id(cmd), Some("abc-123"));
    }

    #[test]
    fn extracts_from_trailing_form() {
        let cmd = "uuid_kill 504a5b51 correlation_id:xyz-9";
        assert_eq!(extract_correlation_id(cmd), Some("xyz-9"));
    }

    #[test]
    fn absent_id_yields_none() {
        assert_eq!(extract_correlation_id("status"), None);
        assert_eq!(extract_correlation_id("originate {ignore=1}x"), None);
    }

    #[tokio::test]
    async fn complete_resolves_pending_send() {
        let broker = CommandBroker::new(Arc::new(NullCommandTransport));
        let rx = broker.send("sw01_command", "originate ...").await.unwrap();
        assert_eq!(broker.pending_count(), 1);
        let id = {
            let entry = broker.pending.iter().next().unwrap();
            entry.key().clone()
        };
        assert!(broker.complete(&id, "+OK 504a".to_string()));
        assert_eq!(rx.await.unwrap(), "+OK 504a");
        assert_eq!(broker.pending_count(), 0);
        assert!(!broker.complete(&id, "dup".to_string()));
    }
}
