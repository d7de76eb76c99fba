use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Call engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallEngineConfig {
    /// General service settings
    pub general: GeneralConfig,

    /// Local cache tier configuration
    pub cache: CacheConfig,

    /// Event pipeline configuration
    pub pipeline: PipelineConfig,

    /// Cluster membership and failover configuration
    pub cluster: ClusterConfig,

    /// Switch node tracking configuration
    pub nodes: NodeConfig,
}

/// General service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Hostname reported in the instance metadata record
    pub host: String,

    /// Port reported in the instance metadata record
    pub port: u16,

    /// Version string reported in the instance metadata record
    pub version: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8080,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Local cache tier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of cached calls
    pub max_calls: u64,

    /// Time-to-live for a cached call after its last write
    pub call_ttl: Duration,

    /// Periodic local/shared consistency validation
    pub validation_enabled: bool,
    pub validation_interval: Duration,

    /// Periodic full local -> shared sync (safety net)
    pub full_sync_enabled: bool,
    pub full_sync_interval: Duration,

    /// Cache statistics sampling
    pub stats_interval: Duration,

    /// Orphan recovery on startup
    pub orphan_recovery_enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_calls: 10_000,
            call_ttl: Duration::from_secs(3600),
            validation_enabled: true,
            validation_interval: Duration::from_secs(30 * 60),
            full_sync_enabled: true,
            full_sync_interval: Duration::from_secs(60 * 60),
            stats_interval: Duration::from_secs(30 * 60),
            orphan_recovery_enabled: true,
        }
    }
}

/// Event pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Number of concurrent event-processing workers
    pub max_workers: usize,

    /// Per-channel queue capacity; events beyond it are rejected
    pub channel_queue_capacity: usize,

    /// Grace period for in-flight messages at shutdown
    pub inflight_wait: Duration,

    /// Upper bound on draining the channel queues at shutdown
    pub drain_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_workers: 50,
            channel_queue_capacity: 100,
            inflight_wait: Duration::from_millis(500),
            drain_timeout: Duration::from_secs(20),
        }
    }
}

/// Cluster membership and failover configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Interval between liveness writes
    pub heartbeat_interval: Duration,

    /// An instance is dead once its last heartbeat is older than
    /// `dead_after_missed * instance_ttl`
    pub instance_ttl: Duration,
    pub dead_after_missed: u32,

    /// Interval between orphan sweeps
    pub sweep_interval: Duration,

    /// Orphans older than this are deleted by the cleanup pass
    pub orphan_retention: Duration,

    /// Lock TTLs
    pub recovery_lock_ttl: Duration,
    pub sweep_lock_ttl: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            instance_ttl: Duration::from_secs(90),
            dead_after_missed: 2,
            sweep_interval: Duration::from_secs(60),
            orphan_retention: Duration::from_secs(86_400),
            recovery_lock_ttl: Duration::from_secs(30),
            sweep_lock_ttl: Duration::from_secs(60),
        }
    }
}

/// Switch node tracking configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Local node cache capacity
    pub cache_size: u64,

    /// Local node cache TTL
    pub cache_ttl: Duration,

    /// Interval of the stale-node cleanup task
    pub cleanup_interval: Duration,

    /// Nodes silent for longer than this are removed
    pub stale_after: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            cache_size: 50,
            cache_ttl: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(5 * 60),
            stale_after: Duration::from_secs(2 * 60),
        }
    }
}
