//! Switch node health tracking.
//!
//! Every switch node reports a periodic heartbeat with its session count and
//! idle-CPU percentage. Nodes are kept in a small local cache over store
//! hashes, with a healthy-node set and a pub/sub channel other instances use
//! to refresh their caches. Node *selection* for call placement lives with
//! the load-balancer collaborator, not here.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use moka::sync::Cache;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use callgrid_switch_events::{params, Event};

use crate::config::NodeConfig;
use crate::error::Result;
use crate::shutdown::ShutdownGuard;
use crate::store::{keys, SharedStore};

/// Heartbeats kept for the CPU usage window.
const CPU_SAMPLE_WINDOW: usize = 5;
/// CPU usage above this counts as a high sample.
const MAX_CPU_USAGE_THRESHOLD: f64 = 80.0;
/// A node is stale once it has been silent this long.
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(30);

/// One telephony switch node, as seen through its heartbeats.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchNode {
    pub node_id: String,
    pub hostname: String,
    pub ip_address: Option<String>,
    pub max_sessions: i64,
    pub session_count: i64,
    /// 100 - Idle-CPU from the last heartbeat
    pub cpu_usage: f64,
    #[serde(default)]
    pub recent_cpu_usages: VecDeque<f64>,
    pub last_heartbeat: DateTime<Utc>,
    pub last_update_timestamp: DateTime<Utc>,
}

impl SwitchNode {
    pub fn new(node_id: impl Into<String>, hostname: impl Into<String>, max_sessions: i64) -> Self {
        let now = Utc::now();
        Self {
            node_id: node_id.into(),
            hostname: hostname.into(),
            ip_address: None,
            max_sessions,
            session_count: 0,
            cpu_usage: 0.0,
            recent_cpu_usages: VecDeque::new(),
            last_heartbeat: now,
            last_update_timestamp: now,
        }
    }

    /// Fold one heartbeat event into the node status.
    pub fn update_from_heartbeat(&mut self, event: &Event) {
        self.session_count = event.int_param_or(params::SESSION_COUNT, 0);
        let idle_cpu = event.f64_param_or(params::IDLE_CPU, 0.0);
        self.cpu_usage = 100.0 - idle_cpu;
        if self.recent_cpu_usages.len() >= CPU_SAMPLE_WINDOW {
            self.recent_cpu_usages.pop_front();
        }
        self.recent_cpu_usages.push_back(self.cpu_usage);
        self.last_heartbeat = Utc::now();
    }

    /// More than half of the recent samples above the threshold.
    pub fn is_cpu_high(&self) -> bool {
        let high = self
            .recent_cpu_usages
            .iter()
            .filter(|usage| **usage >= MAX_CPU_USAGE_THRESHOLD)
            .count();
        high >= CPU_SAMPLE_WINDOW / 2
    }

    pub fn is_stale(&self, threshold: Duration) -> bool {
        (Utc::now() - self.last_heartbeat).to_std().unwrap_or_default() > threshold
    }

    /// No heartbeat within the default timeout window.
    pub fn is_inactive(&self) -> bool {
        self.is_stale(HEARTBEAT_TIMEOUT)
    }

    /// Healthy while session count leaves headroom under the maximum.
    pub fn is_healthy(&self) -> bool {
        self.session_count < self.max_sessions
    }

    /// Name of the node's command queue on the command transport.
    pub fn command_queue_name(&self) -> String {
        format!("{}_command", self.hostname)
    }

    pub fn to_hash(&self) -> Vec<(String, String)> {
        vec![
            ("nodeId".into(), self.node_id.clone()),
            ("hostname".into(), self.hostname.clone()),
            ("ipAddress".into(), self.ip_address.clone().unwrap_or_default()),
            ("maxSessions".into(), self.max_sessions.to_string()),
            ("sessionCount".into(), self.session_count.to_string()),
            ("cpuUsage".into(), self.cpu_usage.to_string()),
            (
                "recentCpuUsages".into(),
                serde_json::to_string(&self.recent_cpu_usages).unwrap_or_else(|_| "[]".into()),
            ),
            ("lastHeartbeat".into(), self.last_heartbeat.to_rfc3339()),
            (
                "lastUpdateTimestamp".into(),
                self.last_update_timestamp.to_rfc3339(),
            ),
        ]
    }

    pub fn from_hash(hash: &HashMap<String, String>) -> Option<Self> {
        let parse_time = |field: &str| {
            hash.get(field)
                .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
                .map(|t| t.with_timezone(&Utc))
        };
        Some(Self {
            node_id: hash.get("nodeId")?.clone(),
            hostname: hash.get("hostname")?.clone(),
            ip_address: hash.get("ipAddress").filter(|v| !v.is_empty()).cloned(),
            max_sessions: hash.get("maxSessions")?.parse().ok()?,
            session_count: hash.get("sessionCount").and_then(|v| v.parse().ok()).unwrap_or(0),
            cpu_usage: hash.get("cpuUsage").and_then(|v| v.parse().ok()).unwrap_or(0.0),
            recent_cpu_usages: hash
                .get("recentCpuUsages")
                .and_then(|v| serde_json::from_str(v).ok())
                .unwrap_or_default(),
            last_heartbeat: parse_time("lastHeartbeat").unwrap_or_else(Utc::now),
            last_update_timestamp: parse_time("lastUpdateTimestamp").unwrap_or_else(Utc::now),
        })
    }
}

/// Local cache + shared hashes of every known switch node.
pub struct NodeRegistry {
    store: Arc<dyn SharedStore>,
    cache: Cache<String, SwitchNode>,
    config: NodeConfig,
    shutdown: ShutdownGuard,
}

impl NodeRegistry {
    pub fn new(store: Arc<dyn SharedStore>, config: NodeConfig, shutdown: ShutdownGuard) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.cache_size)
            .time_to_live(config.cache_ttl)
            .build();
        Self {
            store,
            cache,
            config,
            shutdown,
        }
    }

    /// Apply one heartbeat to the node it came from, creating the node on
    /// first sight.
    pub async fn update_node_status(&self, node_id: &str, event: &Event) -> Result<SwitchNode> {
        let mut node = match self.get_node(node_id).await? {
            Some(node) => node,
            None => {
                info!(
                    "👋 new switch node {} ({})",
                    node_id,
                    event.switch_hostname().unwrap_or("unknown")
                );
                let mut node = SwitchNode::new(
                    node_id,
                    event.switch_hostname().unwrap_or("unknown"),
                    event.int_param_or(params::MAX_SESSIONS, 0),
                );
                node.ip_address = event.switch_ip().map(str::to_string);
                node
            }
        };

        node.update_from_heartbeat(event);
        self.save_node(&mut node).await?;
        Ok(node)
    }

    pub async fn get_node(&self, node_id: &str) -> Result<Option<SwitchNode>> {
        if let Some(node) = self.cache.get(node_id) {
            return Ok(Some(node));
        }
        let hash = self.store.hget_all(&keys::node_key(node_id)).await?;
        if hash.is_empty() {
            return Ok(None);
        }
        let node = SwitchNode::from_hash(&hash);
        if let Some(ref node) = node {
            self.cache.insert(node_id.to_string(), node.clone());
        }
        Ok(node)
    }

    async fn save_node(&self, node: &mut SwitchNode) -> Result<()> {
        node.last_update_timestamp = Utc::now();
        self.cache.insert(node.node_id.clone(), node.clone());
        self.store
            .hset_all(&keys::node_key(&node.node_id), node.to_hash())
            .await?;
        self.store.sadd(keys::NODE_INDEX_KEY, &node.node_id).await?;
        if node.is_healthy() {
            self.store.sadd(keys::HEALTHY_NODES_KEY, &node.node_id).await?;
        } else {
            warn!(
                "switch node {} unhealthy: {}/{} sessions",
                node.node_id, node.session_count, node.max_sessions
            );
            self.store.srem(keys::HEALTHY_NODES_KEY, &node.node_id).await?;
        }
        self.store
            .publish(keys::NODE_UPDATES_CHANNEL, &node.node_id)
            .await?;
        Ok(())
    }

    pub async fn healthy_nodes(&self) -> Result<Vec<SwitchNode>> {
        let ids = self.store.smembers(keys::HEALTHY_NODES_KEY).await?;
        let mut nodes = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(node) = self.get_node(&id).await? {
                nodes.push(node);
            }
        }
        Ok(nodes)
    }

    /// Drop nodes whose last update is older than the configured staleness
    /// window.
    pub async fn cleanup_stale_nodes(&self) -> Result<usize> {
        let ids = self.store.smembers(keys::NODE_INDEX_KEY).await?;
        let mut removed = 0;
        for id in ids {
            let hash = self.store.hget_all(&keys::node_key(&id)).await?;
            let Some(node) = SwitchNode::from_hash(&hash) else {
                continue;
            };
            let silent = Utc::now() - node.last_update_timestamp;
            if silent.to_std().unwrap_or_default() > self.config.stale_after {
                self.store.del(&keys::node_key(&id)).await?;
                self.store.srem(keys::HEALTHY_NODES_KEY, &id).await?;
                self.store.srem(keys::NODE_INDEX_KEY, &id).await?;
                self.cache.invalidate(&id);
                removed += 1;
            }
        }
        if removed > 0 {
            info!("🧹 cleaned up {} inactive switch nodes", removed);
        }
        Ok(removed)
    }

    /// Background loops: pub/sub cache refresh and the stale-node cleanup.
    pub fn spawn_loops(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let registry = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            let mut rx = match registry.store.subscribe(keys::NODE_UPDATES_CHANNEL).await {
                Ok(rx) => rx,
                Err(err) => {
                    warn!("node update subscription failed: {}", err);
                    return;
                }
            };
            loop {
                tokio::select! {
                    _ = registry.shutdown.wait() => break,
                    msg = rx.recv() => {
                        let Some(node_id) = msg else { break };
                        registry.cache.invalidate(&node_id);
                        debug!("refreshed node {} from update notice", node_id);
                    }
                }
            }
        }));

        let registry = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(registry.config.cleanup_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = registry.shutdown.wait() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = registry.cleanup_stale_nodes().await {
                            warn!("stale node cleanup failed: {}", err);
                        }
                    }
                }
            }
        }));

        handles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn heartbeat(sessions: i64, idle_cpu: f64) -> Event {
        let payload = serde_json::to_vec(&json!({
            "Event-Name": "HEARTBEAT",
            "Event-Sequence": "10",
            "Core-UUID": "node-1",
            "FreeSWITCH-Hostname": "sw01",
            "FreeSWITCH-IPv4": "10.0.0.5",
            "Session-Count": sessions,
            "Max-Sessions": 1000,
            "Idle-CPU": idle_cpu,
        }))
        .unwrap();
        Event::from_payload(&payload).unwrap()
    }

    #[test]
    fn health_is_session_headroom_only() {
        let mut node = SwitchNode::new("n1", "sw01", 2);
        node.update_from_heartbeat(&heartbeat(1, 1.0)); // 99% cpu
        assert!(node.is_healthy());
        node.update_from_heartbeat(&heartbeat(2, 99.0));
        assert!(!node.is_healthy());
    }

    #[test]
    fn cpu_window_tracks_high_usage() {
        let mut node = SwitchNode::new("n1", "sw01", 1000);
        for _ in 0..5 {
            node.update_from_heartbeat(&heartbeat(0, 5.0)); // 95% usage
        }
        assert!(node.is_cpu_high());
        assert_eq!(node.recent_cpu_usages.len(), CPU_SAMPLE_WINDOW);
        for _ in 0..5 {
            node.update_from_heartbeat(&heartbeat(0, 95.0)); // 5% usage
        }
        assert!(!node.is_cpu_high());
    }

    #[test]
    fn hash_round_trip_preserves_node() {
        let mut node = SwitchNode::new("n1", "sw01", 1000);
        node.update_from_heartbeat(&heartbeat(7, 90.0));
        let hash: HashMap<String, String> = node.to_hash().into_iter().collect();
        let back = SwitchNode::from_hash(&hash).unwrap();
        assert_eq!(back.node_id, "n1");
        assert_eq!(back.session_count, 7);
        assert_eq!(back.max_sessions, 1000);
        assert_eq!(back.recent_cpu_usages.len(), 1);
    }

    #[tokio::test]
    async fn registry_tracks_health_set() {
        use crate::store::MemoryStore;
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let registry = NodeRegistry::new(
            store.clone(),
            NodeConfig::default(),
            ShutdownGuard::new(),
        );

        registry
            .update_node_status("node-1", &heartbeat(10, 95.0))
            .await
            .unwrap();
        let healthy = registry.healthy_nodes().await.unwrap();
        assert_eq!(healthy.len(), 1);
        assert_eq!(healthy[0].hostname, "sw01");
        assert_eq!(healthy[0].command_queue_name(), "sw01_command");

        // Saturate the node; it must leave the healthy set.
        registry
            .update_node_status("node-1", &heartbeat(1000, 95.0))
            .await
            .unwrap();
        assert!(registry.healthy_nodes().await.unwrap().is_empty());
    }
}
