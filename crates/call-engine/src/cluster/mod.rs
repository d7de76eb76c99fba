//! Cluster membership and failover.
//!
//! Every live instance heartbeats its id into a liveness sorted set and
//! refreshes its metadata record. A periodic sweep diffs the registered set
//! against the recently-heartbeating set to find dead instances, then moves
//! each dead instance's calls into the orphan pool as one atomic batch so a
//! crash mid-sweep can never leave a call simultaneously owned and orphaned.
//! A second pass expires orphans nobody recovered.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ClusterConfig;
use crate::error::Result;
use crate::shutdown::ShutdownGuard;
use crate::store::{keys, DistributedLock, SharedStore, StoreOp};

/// Status of a service instance in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
    Active,
    Down,
    Warning,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Active => keys::instance_fields::STATUS_ACTIVE,
            InstanceStatus::Down => keys::instance_fields::STATUS_DOWN,
            InstanceStatus::Warning => keys::instance_fields::STATUS_WARNING,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            keys::instance_fields::STATUS_ACTIVE => Some(InstanceStatus::Active),
            keys::instance_fields::STATUS_DOWN => Some(InstanceStatus::Down),
            keys::instance_fields::STATUS_WARNING => Some(InstanceStatus::Warning),
            _ => None,
        }
    }
}

/// Cluster-membership entry for one service instance.
#[derive(Debug, Clone)]
pub struct InstanceRecord {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub version: String,
    pub status: InstanceStatus,
    pub last_seen: Option<DateTime<Utc>>,
    pub removed_at: Option<DateTime<Utc>>,
}

impl InstanceRecord {
    fn from_hash(hash: &std::collections::HashMap<String, String>) -> Option<Self> {
        let parse_time = |field: &str| {
            hash.get(field)
                .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
                .map(|t| t.with_timezone(&Utc))
        };
        Some(Self {
            id: hash.get(keys::instance_fields::ID)?.clone(),
            host: hash.get(keys::instance_fields::HOST).cloned().unwrap_or_default(),
            port: hash
                .get(keys::instance_fields::PORT)
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            version: hash
                .get(keys::instance_fields::VERSION)
                .cloned()
                .unwrap_or_default(),
            status: hash
                .get(keys::instance_fields::STATUS)
                .and_then(|v| InstanceStatus::parse(v))
                .unwrap_or(InstanceStatus::Warning),
            last_seen: parse_time(keys::instance_fields::LAST_SEEN),
            removed_at: parse_time(keys::instance_fields::REMOVED_AT),
        })
    }
}

fn epoch_seconds() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

/// Membership, heartbeats and the failover sweep for one instance.
pub struct InstanceManager {
    store: Arc<dyn SharedStore>,
    instance_id: RwLock<Option<String>>,
    config: ClusterConfig,
    sweep_in_progress: AtomicBool,
    shutdown: ShutdownGuard,
}

impl InstanceManager {
    pub fn new(store: Arc<dyn SharedStore>, config: ClusterConfig, shutdown: ShutdownGuard) -> Self {
        Self {
            store,
            instance_id: RwLock::new(None),
            config,
            sweep_in_progress: AtomicBool::new(false),
            shutdown,
        }
    }

    pub fn instance_id(&self) -> Option<String> {
        self.instance_id.read().clone()
    }

    // ========== registration & liveness ==========

    /// Register this instance: metadata record, registry set and first
    /// heartbeat, in one atomic batch.
    pub async fn register_instance(
        &self,
        instance_id: &str,
        host: &str,
        port: u16,
        version: &str,
    ) -> Result<()> {
        info!("🖥️ registering instance {}", instance_id);
        *self.instance_id.write() = Some(instance_id.to_string());

        let metadata_key = keys::instance_metadata_key(instance_id);
        self.store
            .apply_batch(vec![
                StoreOp::HSetAll {
                    key: metadata_key.clone(),
                    fields: vec![
                        (keys::instance_fields::ID.into(), instance_id.to_string()),
                        (keys::instance_fields::HOST.into(), host.to_string()),
                        (keys::instance_fields::PORT.into(), port.to_string()),
                        (keys::instance_fields::VERSION.into(), version.to_string()),
                        (
                            keys::instance_fields::LAST_SEEN.into(),
                            Utc::now().to_rfc3339(),
                        ),
                        (
                            keys::instance_fields::STATUS.into(),
                            InstanceStatus::Active.as_str().to_string(),
                        ),
                    ],
                },
                StoreOp::Expire {
                    key: metadata_key,
                    ttl_secs: keys::ttl::METADATA_RETENTION_SECONDS,
                },
                StoreOp::SAdd {
                    key: keys::INSTANCE_REGISTRY_KEY.into(),
                    member: instance_id.to_string(),
                },
                StoreOp::ZAdd {
                    key: keys::HEARTBEAT_KEY.into(),
                    score: epoch_seconds(),
                    member: instance_id.to_string(),
                },
            ])
            .await?;
        Ok(())
    }

    /// Remove this instance from the registry and liveness structures. The
    /// metadata record is retained for audit and ages out via its TTL.
    pub async fn unregister_instance(&self) -> Result<()> {
        let Some(instance_id) = self.instance_id() else {
            return Ok(());
        };
        info!("🖥️ unregistering instance {}", instance_id);
        self.store
            .apply_batch(vec![
                StoreOp::SRem {
                    key: keys::INSTANCE_REGISTRY_KEY.into(),
                    member: instance_id.clone(),
                },
                StoreOp::ZRem {
                    key: keys::HEARTBEAT_KEY.into(),
                    member: instance_id.clone(),
                },
                StoreOp::Del {
                    key: keys::instance_calls_key(&instance_id),
                },
            ])
            .await?;
        Ok(())
    }

    /// The one write a healthy instance needs to stay "active": refresh the
    /// liveness score and the metadata last-seen / TTL.
    pub async fn heartbeat(&self) -> Result<()> {
        let Some(instance_id) = self.instance_id() else {
            return Ok(());
        };
        let metadata_key = keys::instance_metadata_key(&instance_id);
        self.store
            .apply_batch(vec![
                StoreOp::ZAdd {
                    key: keys::HEARTBEAT_KEY.into(),
                    score: epoch_seconds(),
                    member: instance_id.clone(),
                },
                StoreOp::HSet {
                    key: metadata_key.clone(),
                    field: keys::instance_fields::LAST_SEEN.into(),
                    value: Utc::now().to_rfc3339(),
                },
                StoreOp::Expire {
                    key: metadata_key,
                    ttl_secs: keys::ttl::METADATA_RETENTION_SECONDS,
                },
            ])
            .await?;
        debug!("heartbeat written for {}", instance_id);
        Ok(())
    }

    // ========== queries ==========

    fn liveness_cutoff(&self) -> f64 {
        epoch_seconds()
            - (self.config.instance_ttl.as_secs() * self.config.dead_after_missed as u64) as f64
    }

    /// Instances with a heartbeat newer than the dead-instance cutoff.
    pub async fn active_instance_ids(&self) -> Result<HashSet<String>> {
        Ok(self
            .store
            .zrange_by_score(keys::HEARTBEAT_KEY, self.liveness_cutoff(), f64::MAX)
            .await?
            .into_iter()
            .collect())
    }

    pub async fn active_instance_count(&self) -> Result<u64> {
        Ok(self.active_instance_ids().await?.len() as u64)
    }

    pub async fn orphaned_calls_count(&self) -> Result<u64> {
        Ok(self.store.zcard(keys::ORPHANED_CALLS_ZSET).await?)
    }

    pub async fn instance_record(&self, instance_id: &str) -> Result<Option<InstanceRecord>> {
        let hash = self
            .store
            .hget_all(&keys::instance_metadata_key(instance_id))
            .await?;
        if hash.is_empty() {
            return Ok(None);
        }
        Ok(InstanceRecord::from_hash(&hash))
    }

    // ========== failover ==========

    /// Registered minus recently-heartbeating: the dead set.
    pub async fn detect_down_instances(&self) -> Result<Vec<String>> {
        let registered = self.store.smembers(keys::INSTANCE_REGISTRY_KEY).await?;
        let active = self.active_instance_ids().await?;
        Ok(registered
            .into_iter()
            .filter(|id| !active.contains(id))
            .collect())
    }

    /// Move every call owned by `instance_id` into the orphan pool and tear
    /// down the instance's cluster entries, as a single atomic batch.
    pub async fn transfer_calls_to_orphan_pool(&self, instance_id: &str) -> Result<usize> {
        let call_ids = self
            .store
            .smembers(&keys::instance_calls_key(instance_id))
            .await?;

        let now = Utc::now();
        let orphan_score = now.timestamp_millis() as f64;
        let mut ops = Vec::with_capacity(call_ids.len() * 2 + 1);
        for call_id in &call_ids {
            ops.push(StoreOp::ZAdd {
                key: keys::ORPHANED_CALLS_ZSET.into(),
                score: orphan_score,
                member: call_id.clone(),
            });
            if let Some(doc) = self.orphan_flagged_document(call_id, instance_id, now).await {
                ops.push(StoreOp::SetEx {
                    key: keys::call_key(call_id),
                    value: doc,
                    ttl_secs: keys::ttl::CALL_SECONDS,
                });
            }
        }
        ops.push(StoreOp::Del {
            key: keys::instance_calls_key(instance_id),
        });
        self.store.apply_batch(ops).await?;

        if !call_ids.is_empty() {
            info!(
                "🛟 transferred {} calls from {} to the orphan pool",
                call_ids.len(),
                instance_id
            );
        }
        Ok(call_ids.len())
    }

    /// Rewrite a call document with its orphan marker set. Returns `None`
    /// when the document is gone or unreadable (the zset entry still marks
    /// the orphan in that case).
    async fn orphan_flagged_document(
        &self,
        call_id: &str,
        instance_id: &str,
        at: DateTime<Utc>,
    ) -> Option<String> {
        let doc = self.store.get(&keys::call_key(call_id)).await.ok()??;
        let mut call: callgrid_call_model::Call = match serde_json::from_str(&doc) {
            Ok(call) => call,
            Err(err) => {
                warn!("unreadable call document {}: {}", call_id, err);
                return None;
            }
        };
        call.mark_orphaned(instance_id, at);
        serde_json::to_string(&call).ok()
    }

    /// Mark an instance DOWN and drop it from the registry and liveness
    /// structures. Metadata TTL is set only when none exists yet.
    pub async fn mark_instance_down(&self, instance_id: &str) -> Result<()> {
        info!("🖥️ marking instance {} as down", instance_id);
        let metadata_key = keys::instance_metadata_key(instance_id);
        self.store
            .apply_batch(vec![
                StoreOp::HSetAll {
                    key: metadata_key.clone(),
                    fields: vec![
                        (
                            keys::instance_fields::STATUS.into(),
                            InstanceStatus::Down.as_str().to_string(),
                        ),
                        (
                            keys::instance_fields::REMOVED_AT.into(),
                            Utc::now().to_rfc3339(),
                        ),
                    ],
                },
                StoreOp::SRem {
                    key: keys::INSTANCE_REGISTRY_KEY.into(),
                    member: instance_id.to_string(),
                },
                StoreOp::ZRem {
                    key: keys::HEARTBEAT_KEY.into(),
                    member: instance_id.to_string(),
                },
            ])
            .await?;
        if self.store.ttl(&metadata_key).await?.is_none() {
            self.store
                .expire(&metadata_key, keys::ttl::METADATA_RETENTION_SECONDS)
                .await?;
        }
        Ok(())
    }

    /// One failover sweep: find dead instances, orphan their calls, tear
    /// them down, then expire old orphans. Runs under the cluster-wide sweep
    /// lock; losing the lock is a normal "another instance is sweeping"
    /// outcome. Every step is idempotent, so a redundant sweep is safe.
    pub async fn run_sweep(&self) -> Result<()> {
        if self.sweep_in_progress.swap(true, Ordering::SeqCst) {
            debug!("orphan sweep already in progress");
            return Ok(());
        }
        let result = self.run_sweep_inner().await;
        self.sweep_in_progress.store(false, Ordering::SeqCst);
        result
    }

    async fn run_sweep_inner(&self) -> Result<()> {
        let lock = match DistributedLock::acquire(
            self.store.clone(),
            keys::ORPHAN_SWEEP_LOCK,
            self.config.sweep_lock_ttl.as_secs(),
        )
        .await?
        {
            Some(lock) => lock,
            None => {
                debug!("orphan sweep held by another instance");
                return Ok(());
            }
        };

        let dead = self.detect_down_instances().await?;
        if !dead.is_empty() {
            warn!("detected {} dead instances: {:?}", dead.len(), dead);
            for instance_id in &dead {
                if let Err(err) = self.fail_over_instance(instance_id).await {
                    error!("failover of {} failed: {}", instance_id, err);
                }
            }
        }

        if let Err(err) = self.cleanup_expired_orphans().await {
            error!("orphan cleanup failed: {}", err);
        }

        if let Err(err) = lock.release().await {
            debug!("sweep lock release failed: {}", err);
        }
        Ok(())
    }

    /// Full failover of one dead instance: orphan its calls and remove it
    /// from the cluster, each phase an atomic batch.
    async fn fail_over_instance(&self, instance_id: &str) -> Result<()> {
        self.transfer_calls_to_orphan_pool(instance_id).await?;
        self.mark_instance_down(instance_id).await?;
        Ok(())
    }

    /// Delete orphans older than the retention window together with their
    /// call documents, bounded per cycle.
    pub async fn cleanup_expired_orphans(&self) -> Result<usize> {
        const MAX_PER_CYCLE: usize = 1000;

        let cutoff =
            Utc::now().timestamp_millis() as f64 - self.config.orphan_retention.as_millis() as f64;
        let entries = self.store.zrange_with_scores(keys::ORPHANED_CALLS_ZSET).await?;

        let mut deleted = 0;
        let mut ops = Vec::new();
        for (call_id, score) in entries {
            if score >= cutoff || deleted >= MAX_PER_CYCLE {
                continue;
            }
            ops.push(StoreOp::ZRem {
                key: keys::ORPHANED_CALLS_ZSET.into(),
                member: call_id.clone(),
            });
            ops.push(StoreOp::Del {
                key: keys::call_key(&call_id),
            });
            deleted += 1;
            if ops.len() >= 200 {
                self.store.apply_batch(std::mem::take(&mut ops)).await?;
            }
        }
        if !ops.is_empty() {
            self.store.apply_batch(ops).await?;
        }
        if deleted > 0 {
            info!("🧹 cleaned up {} expired orphaned calls", deleted);
        }
        Ok(deleted)
    }

    // ========== background loops ==========

    /// Heartbeat and sweep loops.
    pub fn spawn_loops(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let manager = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.config.heartbeat_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = manager.shutdown.wait() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = manager.heartbeat().await {
                            warn!("heartbeat failed: {}", err);
                        }
                    }
                }
            }
        }));

        let manager = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.config.sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = manager.shutdown.wait() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = manager.run_sweep().await {
                            error!("failover sweep failed: {}", err);
                        }
                    }
                }
            }
        }));

        handles
    }

    /// Graceful shutdown: proactively run the same sequence the sweep would
    /// eventually apply, so planned restarts fail over in near-zero time.
    pub async fn shutdown(&self) -> Result<()> {
        let Some(instance_id) = self.instance_id() else {
            return Ok(());
        };
        info!("🖥️ instance {} leaving the cluster", instance_id);
        self.transfer_calls_to_orphan_pool(&instance_id).await?;
        self.mark_instance_down(&instance_id).await?;
        self.unregister_instance().await?;
        info!("🖥️ instance {} shutdown complete", instance_id);
        Ok(())
    }
}
