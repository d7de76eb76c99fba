//! Switch node heartbeats.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use callgrid_switch_events::Event;

use crate::error::{CallEngineError, Result};
use crate::nodes::NodeRegistry;

/// Feeds heartbeat attribute sets into the node registry.
pub struct HeartbeatEventHandler {
    nodes: Arc<NodeRegistry>,
}

impl HeartbeatEventHandler {
    pub fn new(nodes: Arc<NodeRegistry>) -> Self {
        Self { nodes }
    }
}

#[async_trait]
impl crate::handlers::EventHandler for HeartbeatEventHandler {
    async fn handle_event(&self, event: &Event) -> Result<()> {
        let node_id = event
            .switch_node_id()
            .ok_or_else(|| CallEngineError::transport("heartbeat without a node id"))?;
        debug!(
            "heartbeat sequence {} from node {} ({})",
            event.sequence(),
            node_id,
            event.switch_hostname().unwrap_or("unknown")
        );
        self.nodes.update_node_status(node_id, event).await?;
        Ok(())
    }
}
