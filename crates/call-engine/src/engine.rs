//! The engine facade: wiring and lifecycle.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::commands::CommandBroker;
use crate::config::CallEngineConfig;
use crate::error::{CallEngineError, Result};
use crate::handlers::HandlerRegistry;
use crate::cluster::InstanceManager;
use crate::nodes::NodeRegistry;
use crate::pipeline::EventProcessor;
use crate::registry::CallRegistry;
use crate::shutdown::ShutdownGuard;
use crate::store::SharedStore;
use crate::transport::{CommandTransport, EventTransport};

/// Control plane of the call-handling service.
///
/// Owns the event pipeline, the two-tier call registry, cluster membership
/// and switch-node tracking, and enforces the ordered teardown contract:
/// stop accepting input, drain, persist, release cluster membership.
pub struct CallEngine {
    config: CallEngineConfig,
    registry: Arc<CallRegistry>,
    cluster: Arc<InstanceManager>,
    nodes: Arc<NodeRegistry>,
    processor: Arc<EventProcessor>,
    broker: Arc<CommandBroker>,
    shutdown: ShutdownGuard,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CallEngine {
    pub fn new(
        config: CallEngineConfig,
        store: Arc<dyn SharedStore>,
        command_transport: Arc<dyn CommandTransport>,
    ) -> Arc<Self> {
        let shutdown = ShutdownGuard::new();

        let registry = CallRegistry::new(config.cache.clone(), store.clone(), shutdown.clone());
        let cluster = Arc::new(InstanceManager::new(
            store.clone(),
            config.cluster.clone(),
            shutdown.clone(),
        ));
        let nodes = Arc::new(NodeRegistry::new(
            store,
            config.nodes.clone(),
            shutdown.clone(),
        ));
        let broker = Arc::new(CommandBroker::new(command_transport));

        let handlers = Arc::new(HandlerRegistry::standard(
            registry.clone(),
            nodes.clone(),
            broker.clone(),
        ));
        let processor = Arc::new(EventProcessor::new(
            handlers,
            config.pipeline.clone(),
            shutdown.clone(),
        ));

        info!("🚀 call engine assembled");
        Arc::new(Self {
            config,
            registry,
            cluster,
            nodes,
            processor,
            broker,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Bind this process to its cluster identity. Must be called exactly
    /// once before [`start`](Self::start): registers the instance and
    /// recovers any orphaned calls.
    pub async fn set_instance_id(&self, instance_id: &str) -> Result<()> {
        if self.cluster.instance_id().is_some() {
            return Err(CallEngineError::AlreadyExists(format!(
                "instance id already set to {}",
                self.cluster.instance_id().unwrap_or_default()
            )));
        }
        self.cluster
            .register_instance(
                instance_id,
                &self.config.general.host,
                self.config.general.port,
                &self.config.general.version,
            )
            .await?;
        self.registry.set_instance_id(instance_id).await?;

        match self.cluster.active_instance_ids().await {
            Ok(active) => info!("currently active instances: {:?}", active),
            Err(err) => warn!("could not list active instances: {}", err),
        }
        Ok(())
    }

    /// Start consuming events and spawn every periodic loop.
    pub fn start(self: &Arc<Self>, transport: Arc<dyn EventTransport>) -> Result<()> {
        if self.cluster.instance_id().is_none() {
            return Err(CallEngineError::cluster(
                "set_instance_id must be called before start",
            ));
        }

        let mut tasks = self.tasks.lock();
        tasks.extend(self.cluster.spawn_loops());
        tasks.extend(self.registry.spawn_maintenance());
        tasks.extend(self.nodes.spawn_loops());

        let processor = self.processor.clone();
        tasks.push(tokio::spawn(async move {
            processor.run(transport).await;
        }));

        info!("🚀 call engine started");
        Ok(())
    }

    pub fn registry(&self) -> &Arc<CallRegistry> {
        &self.registry
    }

    pub fn cluster(&self) -> &Arc<InstanceManager> {
        &self.cluster
    }

    pub fn nodes(&self) -> &Arc<NodeRegistry> {
        &self.nodes
    }

    pub fn commands(&self) -> &Arc<CommandBroker> {
        &self.broker
    }

    pub fn processor(&self) -> &Arc<EventProcessor> {
        &self.processor
    }

    pub fn config(&self) -> &CallEngineConfig {
        &self.config
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_shutting_down()
    }

    /// Ordered teardown: stop accepting input, drain the pipeline, persist
    /// the registry, release cluster membership, stop the loops.
    pub async fn shutdown(&self) {
        if !self.shutdown.trigger() {
            return;
        }
        info!("🛑 call engine shutting down");

        // 1. Stop intake and drain queued per-channel work.
        self.processor.shutdown().await;

        // 2. Persist local state.
        self.registry.shutdown().await;

        // 3. Release cluster membership: orphan our calls for fast pickup,
        //    mark down, unregister.
        if let Err(err) = self.cluster.shutdown().await {
            error!("cluster release failed during shutdown: {}", err);
        }

        self.broker.abort_pending();

        // 4. Reap the periodic loops (they observe the shutdown flag).
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(err) =
                tokio::time::timeout(std::time::Duration::from_secs(5), task).await
            {
                warn!("background task did not stop in time: {}", err);
            }
        }

        info!("🛑 call engine shutdown complete");
    }
}
