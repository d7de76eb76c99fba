//! # Callgrid Call Engine
//!
//! Control plane of a telephony call-handling service: tracks the lifecycle
//! of calls and their media channels as asynchronous events arrive from the
//! switches, keeps that state consistent across a fleet of instances
//! sharing one durable store, and recovers call ownership when an instance
//! dies mid-call.
//!
//! ## Architecture
//!
//! - [`pipeline`]: event ingestion with strict per-channel ordering over an
//!   unordered, at-least-once transport
//! - [`handlers`]: event-type dispatch (channel lifecycle, heartbeats,
//!   command responses) with an explicit fallback
//! - [`registry`]: the two-tier call registry — bounded local cache with
//!   write-through-on-eviction over the shared store
//! - [`cluster`]: instance membership, heartbeats and the failover sweep
//!   that moves a dead instance's calls into the orphan pool
//! - [`nodes`]: switch-node health tracking fed by heartbeat events
//! - [`store`]: the durable shared-store boundary (Redis in production,
//!   in-memory for tests) with the distributed-lock primitive
//! - [`transport`]: event/command transport boundaries
//! - [`engine`]: the facade wiring it all together with ordered teardown
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use callgrid_call_engine::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
//!     let (transport, _publisher) = MemoryTransport::channel();
//!
//!     let engine = CallEngine::new(
//!         CallEngineConfig::default(),
//!         store,
//!         Arc::new(NullCommandTransport),
//!     );
//!     engine.set_instance_id("instance-1").await?;
//!     engine.start(Arc::new(transport))?;
//!
//!     // ... serve until asked to stop ...
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod config;

pub mod cluster;
pub mod commands;
pub mod engine;
pub mod handlers;
pub mod logging;
pub mod nodes;
pub mod pipeline;
pub mod registry;
pub mod shutdown;
pub mod store;
pub mod transport;

pub use config::CallEngineConfig;
pub use engine::CallEngine;
pub use error::{CallEngineError, Result};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{
        CacheConfig, CallEngineConfig, ClusterConfig, GeneralConfig, NodeConfig, PipelineConfig,
    };
    pub use crate::engine::CallEngine;
    pub use crate::error::{CallEngineError, Result};

    pub use crate::cluster::{InstanceManager, InstanceRecord, InstanceStatus};
    pub use crate::commands::{CommandBroker, NullCommandTransport};
    pub use crate::handlers::{EventHandler, HandlerRegistry};
    pub use crate::nodes::{NodeRegistry, SwitchNode};
    pub use crate::pipeline::{EventProcessor, EventTask};
    pub use crate::registry::{CallRegistry, CallStore, CacheStats, SharedCall};
    pub use crate::shutdown::ShutdownGuard;
    pub use crate::store::{
        DistributedLock, MemoryStore, RedisStore, SharedStore, StoreError, StoreOp,
    };
    pub use crate::transport::{
        CommandTransport, DeliveryOutcome, EventTransport, InboundMessage, MemoryPublisher,
        MemoryTransport,
    };

    pub use callgrid_call_model::{
        Call, CallState, Channel, ChannelRole, ChannelState, DialParams, DtmfEvent, DtmfKind,
        InvalidTransition,
    };
    pub use callgrid_switch_events::{Event, EventType};

    pub use chrono::{DateTime, Utc};
    pub use uuid::Uuid;
}
