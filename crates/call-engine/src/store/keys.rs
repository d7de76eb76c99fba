//! Shared-store key layout and retention constants.
//!
//! Key pattern                          Type     Purpose                          TTL
//! -------------------------------------------------------------------------------------------
//! cluster:registry                     Set      All registered instance ids      pruned explicitly
//! cluster:heartbeats                   ZSet     instance id -> epoch seconds     pruned explicitly
//! cluster:instance:{id}:metadata       Hash     Instance details                 24h
//! cluster:instance:{id}:calls          Set      Call ids owned by the instance   removed on death
//! cluster:call:doc:{uuid}              String   Serialized call document         24h
//! cluster:channel:{uuid}               String   channel id -> call id index      24h
//! cluster:calls:global                 Set      All call ids                     pruned explicitly
//! cluster:calls:orphaned               ZSet     orphaned call ids -> epoch ms    cleaned by sweep
//! cluster:stats:global                 Hash     Global call counters             24h
//! switch:nodes:{id}                    Hash     Switch node status               cleaned when stale
//! switch:nodes:healthy                 Set      Healthy switch node ids          maintained inline

pub const CALL_KEY_PREFIX: &str = "cluster:call:doc:";
pub fn call_key(call_uuid: &str) -> String {
    format!("{CALL_KEY_PREFIX}{call_uuid}")
}

pub const CHANNEL_MAPPING_PREFIX: &str = "cluster:channel:";
pub fn channel_mapping_key(channel_uuid: &str) -> String {
    format!("{CHANNEL_MAPPING_PREFIX}{channel_uuid}")
}

pub fn instance_calls_key(instance_id: &str) -> String {
    format!("cluster:instance:{instance_id}:calls")
}

pub const GLOBAL_CALLS_KEY: &str = "cluster:calls:global";
pub const ORPHANED_CALLS_ZSET: &str = "cluster:calls:orphaned";

pub const INSTANCE_REGISTRY_KEY: &str = "cluster:registry";
pub const HEARTBEAT_KEY: &str = "cluster:heartbeats";

pub fn instance_metadata_key(instance_id: &str) -> String {
    format!("cluster:instance:{instance_id}:metadata")
}

pub const GLOBAL_STATS_KEY: &str = "cluster:stats:global";

/// Instance metadata hash fields.
pub mod instance_fields {
    pub const ID: &str = "id";
    pub const HOST: &str = "host";
    pub const PORT: &str = "port";
    pub const VERSION: &str = "version";
    pub const LAST_SEEN: &str = "lastSeen";
    pub const STATUS: &str = "status";
    pub const REMOVED_AT: &str = "removedAt";

    pub const STATUS_ACTIVE: &str = "ACTIVE";
    pub const STATUS_DOWN: &str = "DOWN";
    pub const STATUS_WARNING: &str = "WARNING";
}

/// Global stats hash fields.
pub mod stats_fields {
    pub const TOTAL_CALLS: &str = "totalCalls";
    pub const ACTIVE_CALLS: &str = "activeCalls";
    pub const COMPLETED_CALLS: &str = "completedCalls";
}

pub fn call_recovery_lock_key(call_uuid: &str) -> String {
    format!("cluster:lock:call_recovery:{call_uuid}")
}

pub const ORPHAN_SWEEP_LOCK: &str = "cluster:lock:orphan_sweep";

// Switch node tracking
pub const NODE_KEY_PREFIX: &str = "switch:nodes:";
pub fn node_key(node_id: &str) -> String {
    format!("{NODE_KEY_PREFIX}{node_id}")
}
pub const HEALTHY_NODES_KEY: &str = "switch:nodes:healthy";
pub const NODE_INDEX_KEY: &str = "switch:nodes:index";
pub const NODE_UPDATES_CHANNEL: &str = "switch:node_updates";

/// Retention windows, in seconds.
pub mod ttl {
    /// Call documents and channel indices
    pub const CALL_SECONDS: u64 = 86_400;
    /// Instance metadata kept for audit after death
    pub const METADATA_RETENTION_SECONDS: u64 = 86_400;
    /// Global stats hash
    pub const STATS_SECONDS: u64 = 86_400;
    /// Per-call recovery lock
    pub const RECOVERY_LOCK_SECONDS: u64 = 30;
    /// Cluster-wide orphan sweep lock
    pub const SWEEP_LOCK_SECONDS: u64 = 60;
}
