//! Two-tier call registry.
//!
//! The authoritative "calls owned by this instance" table: a bounded,
//! time-and-size-evicting local cache in front of the durable shared store.
//! Local mutations are synchronous and always win; shared-tier writes are a
//! separate, observable, best-effort step compensated by the periodic
//! reconciliation jobs. Eviction hands the evicted call to a write-through
//! flusher before the entry disappears, so evicted calls are never lost.
//!
//! Cache characteristics:
//!   - max calls: 10 000 (configurable), TTL 1 hour after write
//!   - channel index: 2x call capacity, expires after access
//!   - write-through to the shared store on eviction
//!   - consistency validation every 30 minutes, full sync every 60 minutes

pub mod shared;

pub use shared::CallStore;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use moka::sync::Cache;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use callgrid_call_model::{Call, CallState, Channel, DtmfEvent};

use crate::config::CacheConfig;
use crate::error::{CallEngineError, Result};
use crate::shutdown::ShutdownGuard;
use crate::store::{keys, DistributedLock, SharedStore};

/// A call shared between concurrent handlers. Mutations lock the call so a
/// read-modify-write can never interleave with another handler's.
pub type SharedCall = Arc<RwLock<Call>>;

/// Sampled local-cache statistics.
#[derive(Debug, Clone, Copy)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub size: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            1.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

/// The registry itself. One per service instance.
pub struct CallRegistry {
    instance_id: RwLock<Option<String>>,
    active_calls: Cache<String, SharedCall>,
    channel_to_call: Cache<String, String>,
    call_store: CallStore,
    store: Arc<dyn SharedStore>,
    counters: Arc<Counters>,
    config: CacheConfig,
    validation_enabled: AtomicBool,
    full_sync_enabled: AtomicBool,
    shutdown: ShutdownGuard,
}

impl CallRegistry {
    /// Build the registry and start its eviction write-through flusher.
    pub fn new(
        config: CacheConfig,
        store: Arc<dyn SharedStore>,
        shutdown: ShutdownGuard,
    ) -> Arc<Self> {
        let call_store = CallStore::new(store.clone());
        let counters = Arc::new(Counters::default());

        let channel_to_call: Cache<String, String> = Cache::builder()
            .max_capacity(config.max_calls * 2)
            .time_to_idle(config.call_ttl)
            .build();

        let (flush_tx, mut flush_rx) = mpsc::unbounded_channel::<Call>();

        // The flusher owns evicted calls until they are persisted; losing the
        // cache entry therefore never loses the call's final state.
        {
            let call_store = call_store.clone();
            tokio::spawn(async move {
                while let Some(call) = flush_rx.recv().await {
                    if let Err(err) = call_store.update_call(&call).await {
                        error!(
                            "write-through of evicted call {} failed: {}",
                            call.call_uuid, err
                        );
                    }
                }
            });
        }

        let active_calls: Cache<String, SharedCall> = {
            let channel_map = channel_to_call.clone();
            let counters = Arc::clone(&counters);
            Cache::builder()
                .max_capacity(config.max_calls)
                .time_to_live(config.call_ttl)
                .eviction_listener(move |key: Arc<String>, value: SharedCall, cause| {
                    if !cause.was_evicted() {
                        return;
                    }
                    counters.evictions.fetch_add(1, Ordering::Relaxed);
                    warn!("call {} evicted from cache: {:?}", key, cause);
                    let call = value.read().clone();
                    for channel_uuid in call.channel_ids() {
                        channel_map.invalidate(channel_uuid);
                        debug!("channel {} removed from channel map", channel_uuid);
                    }
                    let _ = flush_tx.send(call);
                })
                .build()
        };

        info!("📇 call registry initialized (capacity {})", config.max_calls);

        Arc::new(Self {
            instance_id: RwLock::new(None),
            active_calls,
            channel_to_call,
            call_store,
            store,
            counters,
            validation_enabled: AtomicBool::new(config.validation_enabled),
            full_sync_enabled: AtomicBool::new(config.full_sync_enabled),
            config,
            shutdown,
        })
    }

    /// Must be called exactly once before any other registry operation.
    /// Kicks off orphan recovery when enabled.
    pub async fn set_instance_id(&self, instance_id: &str) -> Result<()> {
        {
            let mut guard = self.instance_id.write();
            if guard.is_some() {
                warn!("instance id already set for call registry");
                return Ok(());
            }
            *guard = Some(instance_id.to_string());
        }
        info!("📇 call registry bound to instance {}", instance_id);
        if self.config.orphan_recovery_enabled {
            self.recover_orphaned_calls().await;
        }
        Ok(())
    }

    pub fn instance_id(&self) -> Option<String> {
        self.instance_id.read().clone()
    }

    fn require_instance_id(&self) -> Result<String> {
        self.instance_id
            .read()
            .clone()
            .ok_or_else(|| CallEngineError::registry("instance id not set"))
    }

    // ========== call lifecycle ==========

    /// Register a new call owned by this instance. The local tier is updated
    /// synchronously; the shared tier write is scheduled best-effort.
    pub fn register_call(&self, mut call: Call) -> Result<SharedCall> {
        let instance_id = self.require_instance_id()?;
        call.instance_id = Some(instance_id.clone());
        call.touch();

        let call_uuid = call.call_uuid.clone();
        for channel_uuid in call.channel_ids() {
            self.channel_to_call
                .insert(channel_uuid.clone(), call_uuid.clone());
        }

        let shared: SharedCall = Arc::new(RwLock::new(call.clone()));
        self.active_calls.insert(call_uuid.clone(), shared.clone());

        let call_store = self.call_store.clone();
        tokio::spawn(async move {
            if let Err(err) = call_store.register_call(&call, &instance_id).await {
                error!("failed to register call {} in shared store: {}", call.call_uuid, err);
            }
        });

        info!("📞 registered call {}", call_uuid);
        Ok(shared)
    }

    /// Fetch a call, falling back to the shared store on a local miss. A
    /// store hit is re-cached locally.
    pub async fn get_call(&self, call_uuid: &str) -> Option<SharedCall> {
        if let Some(call) = self.active_calls.get(call_uuid) {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Some(call);
        }
        self.counters.misses.fetch_add(1, Ordering::Relaxed);

        let call = match self.call_store.get_call(call_uuid).await {
            Ok(Some(call)) => call,
            Ok(None) => return None,
            Err(err) => {
                warn!("shared store fetch failed for call {}: {}", call_uuid, err);
                return None;
            }
        };
        for channel_uuid in call.channel_ids() {
            self.channel_to_call
                .insert(channel_uuid.clone(), call_uuid.to_string());
        }
        let shared: SharedCall = Arc::new(RwLock::new(call));
        self.active_calls
            .insert(call_uuid.to_string(), shared.clone());
        Some(shared)
    }

    /// Resolve a channel id to its call, consulting the shared index when
    /// the local mapping is gone.
    pub async fn get_call_by_channel(&self, channel_uuid: &str) -> Option<SharedCall> {
        if let Some(call_uuid) = self.channel_to_call.get(channel_uuid) {
            return self.get_call(&call_uuid).await;
        }
        match self.call_store.call_for_channel(channel_uuid).await {
            Ok(Some(call_uuid)) => self.get_call(&call_uuid).await,
            Ok(None) => None,
            Err(err) => {
                warn!("channel index lookup failed for {}: {}", channel_uuid, err);
                None
            }
        }
    }

    /// Apply a validated state transition and schedule the persist.
    pub async fn update_call_state(&self, call_uuid: &str, new_state: CallState) -> Result<()> {
        let shared = self
            .get_call(call_uuid)
            .await
            .ok_or_else(|| CallEngineError::not_found(format!("call {call_uuid}")))?;

        let (previous, snapshot) = {
            let mut call = shared.write();
            let previous = call.current_state();
            call.transition_to(new_state)?;
            (previous, call.clone())
        };

        info!(
            "📞 call {} state {} -> {}",
            call_uuid, previous, new_state
        );
        self.schedule_persist(snapshot);
        Ok(())
    }

    /// Attach a channel to a call and index it.
    pub async fn add_channel_to_call(&self, call_uuid: &str, channel: Channel) -> Result<()> {
        let shared = self
            .get_call(call_uuid)
            .await
            .ok_or_else(|| CallEngineError::not_found(format!("call {call_uuid}")))?;

        let channel_uuid = channel.channel_uuid.clone();
        let snapshot = {
            let mut call = shared.write();
            call.add_channel(channel);
            call.touch();
            call.clone()
        };
        self.channel_to_call
            .insert(channel_uuid.clone(), call_uuid.to_string());
        self.schedule_persist(snapshot);
        info!("🔗 added channel {} to call {}", channel_uuid, call_uuid);
        Ok(())
    }

    /// Append a keypress to the call's DTMF history.
    pub async fn append_dtmf(&self, call_uuid: &str, event: DtmfEvent) -> Result<()> {
        let shared = self
            .get_call(call_uuid)
            .await
            .ok_or_else(|| CallEngineError::not_found(format!("call {call_uuid}")))?;
        let snapshot = {
            let mut call = shared.write();
            call.add_dtmf_event(event);
            call.touch();
            call.clone()
        };
        self.schedule_persist(snapshot);
        Ok(())
    }

    /// Hang up a channel administratively and persist the change.
    pub async fn remove_channel(&self, channel_uuid: &str) -> Result<()> {
        let Some(shared) = self.get_call_by_channel(channel_uuid).await else {
            return Ok(());
        };
        let snapshot = {
            let mut call = shared.write();
            if let Some(channel) = call.channel_mut(channel_uuid) {
                if let Err(err) = channel.hangup("REMOVED_BY_SYSTEM") {
                    debug!("channel {} already terminal: {}", channel_uuid, err);
                }
            }
            call.touch();
            call.clone()
        };
        info!("🔗 removed channel {} from call {}", channel_uuid, snapshot.call_uuid);
        self.schedule_persist(snapshot);
        Ok(())
    }

    /// Drop a channel whose call is gone; invalidates the mapping and
    /// removes the leg from the cached call when one is still present.
    pub async fn cleanup_orphaned_channel(&self, channel_uuid: &str) {
        let Some(call_uuid) = self.channel_to_call.get(channel_uuid) else {
            return;
        };
        self.channel_to_call.invalidate(channel_uuid);
        if let Some(shared) = self.active_calls.get(&call_uuid) {
            let empty = {
                let mut call = shared.write();
                call.remove_channel(channel_uuid);
                call.channels().is_empty()
            };
            if empty {
                self.active_calls.invalidate(&call_uuid);
            }
        }
    }

    /// Take a call out of the active books. The local entry and the shared
    /// document age out through their TTLs for auditability; only the
    /// counters move.
    pub async fn unregister_call(&self, call_uuid: &str) -> Result<()> {
        let Some(shared) = self.active_calls.get(call_uuid) else {
            return Ok(());
        };
        let duration = shared.read().duration();
        if let Err(err) = self.call_store.unregister_call(call_uuid).await {
            error!("failed to unregister call {} from shared store: {}", call_uuid, err);
        }
        info!(
            "📴 unregistered call {} after {}s",
            call_uuid,
            duration.num_seconds()
        );
        Ok(())
    }

    /// Close out a finished call: persist its final state and unregister it.
    pub async fn finalize_call(&self, call_uuid: &str) -> Result<()> {
        let Some(shared) = self.get_call(call_uuid).await else {
            return Ok(());
        };
        let snapshot = shared.read().clone();
        self.schedule_persist(snapshot);
        self.unregister_call(call_uuid).await?;
        info!("✅ call {} finalized", call_uuid);
        Ok(())
    }

    // ========== two-phase persistence ==========

    /// Schedule a best-effort shared-tier write of this snapshot.
    fn schedule_persist(&self, call: Call) {
        let call_store = self.call_store.clone();
        tokio::spawn(async move {
            if let Err(err) = call_store.update_call(&call).await {
                error!("failed to persist call {}: {}", call.call_uuid, err);
            }
        });
    }

    /// Synchronously persist one call. The retryable arm of the two-phase
    /// contract: local apply happened already, this is the observable
    /// persist step.
    pub async fn persist_call(&self, call_uuid: &str) -> Result<()> {
        let shared = self
            .active_calls
            .get(call_uuid)
            .ok_or_else(|| CallEngineError::not_found(format!("call {call_uuid}")))?;
        let snapshot = shared.read().clone();
        self.call_store.update_call(&snapshot).await
    }

    // ========== queries ==========

    pub async fn is_call_active(&self, call_uuid: &str) -> bool {
        match self.get_call(call_uuid).await {
            Some(shared) => shared.read().current_state().is_active(),
            None => false,
        }
    }

    pub fn calls_by_state(&self, state: CallState) -> Vec<SharedCall> {
        self.active_calls
            .iter()
            .filter(|(_, call)| call.read().current_state() == state)
            .map(|(_, call)| call)
            .collect()
    }

    pub fn active_calls(&self) -> Vec<SharedCall> {
        self.active_calls.iter().map(|(_, call)| call).collect()
    }

    pub fn call_state_statistics(&self) -> HashMap<CallState, usize> {
        let mut stats = HashMap::new();
        for (_, call) in self.active_calls.iter() {
            *stats.entry(call.read().current_state()).or_insert(0) += 1;
        }
        stats
    }

    pub fn long_running_calls(&self, threshold: chrono::Duration) -> Vec<SharedCall> {
        let cutoff = Utc::now() - threshold;
        self.active_calls
            .iter()
            .filter(|(_, call)| {
                call.read()
                    .answer_time
                    .map(|answered| answered < cutoff)
                    .unwrap_or(false)
            })
            .map(|(_, call)| call)
            .collect()
    }

    pub fn cache_stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            size: self.active_calls.entry_count(),
        }
    }

    /// Process pending cache maintenance (evictions and their write-through
    /// notifications) synchronously.
    pub fn run_pending_cache_tasks(&self) {
        self.active_calls.run_pending_tasks();
        self.channel_to_call.run_pending_tasks();
    }

    // ========== orphan recovery ==========

    /// Recover orphaned calls into this instance, one short-lived lock per
    /// call. Lock failure means another instance is recovering that call —
    /// skipped, not an error.
    pub async fn recover_orphaned_calls(&self) {
        let Ok(instance_id) = self.require_instance_id() else {
            warn!("orphan recovery skipped: instance id not set");
            return;
        };
        info!("🛟 started recovering orphaned calls");

        let orphans = match self.call_store.orphaned_calls().await {
            Ok(orphans) => orphans,
            Err(err) => {
                error!("orphan recovery failed: {}", err);
                return;
            }
        };
        let orphans: Vec<Call> = orphans
            .into_iter()
            .filter(|call| self.active_calls.get(&call.call_uuid).is_none())
            .collect();
        if orphans.is_empty() {
            return;
        }

        info!("🛟 recovering {} orphaned calls", orphans.len());
        for call in orphans {
            self.recover_call(call, &instance_id).await;
        }
    }

    async fn recover_call(&self, call: Call, instance_id: &str) {
        let call_uuid = call.call_uuid.clone();
        let old_instance = call.orphaned_from.clone().unwrap_or_default();

        let lock = match DistributedLock::acquire(
            self.store.clone(),
            keys::call_recovery_lock_key(&call_uuid),
            keys::ttl::RECOVERY_LOCK_SECONDS,
        )
        .await
        {
            Ok(Some(lock)) => lock,
            Ok(None) => {
                debug!(
                    "skipping recovery - call {} is being recovered by another instance",
                    call_uuid
                );
                return;
            }
            Err(err) => {
                error!("lock acquisition failed for call {}: {}", call_uuid, err);
                return;
            }
        };

        // Re-read under the lock: a holder that beat us to it has already
        // cleared the orphan flag.
        let mut call = match self.call_store.get_call(&call_uuid).await {
            Ok(Some(fresh)) if fresh.orphaned => fresh,
            Ok(_) => {
                debug!("call {} no longer orphaned, skipping recovery", call_uuid);
                if let Err(err) = lock.release().await {
                    debug!("recovery lock release for {} failed: {}", call_uuid, err);
                }
                return;
            }
            Err(_) => call,
        };

        // Rebuild channel mappings and adopt the call.
        for channel_uuid in call.channel_ids() {
            self.channel_to_call
                .insert(channel_uuid.clone(), call_uuid.clone());
        }
        call.adopt(instance_id);
        let shared: SharedCall = Arc::new(RwLock::new(call.clone()));
        self.active_calls.insert(call_uuid.clone(), shared);

        if let Err(err) = self.call_store.update_call(&call).await {
            warn!("failed to update shared state for recovered call {}: {}", call_uuid, err);
        }
        if let Err(err) = self.store.sadd(&keys::instance_calls_key(instance_id), &call_uuid).await {
            warn!("failed to claim ownership of recovered call {}: {}", call_uuid, err);
        }
        if let Err(err) = self.call_store.clear_orphan(&call_uuid).await {
            warn!("failed to clear orphan marker for call {}: {}", call_uuid, err);
        }
        info!("🛟 recovered call {} from instance {}", call_uuid, old_instance);

        if let Err(err) = lock.release().await {
            debug!("recovery lock release for {} failed: {}", call_uuid, err);
        }
    }

    // ========== reconciliation jobs ==========

    /// Validate that every locally-cached call still exists in the shared
    /// store, re-registering the ones that are missing.
    pub async fn validate_cache_consistency(&self) {
        if !self.validation_enabled.load(Ordering::Relaxed) {
            return;
        }
        if self.active_calls.entry_count() == 0 {
            return;
        }
        let Ok(instance_id) = self.require_instance_id() else {
            return;
        };
        for (call_uuid, shared) in self.active_calls.iter() {
            match self.call_store.get_call(call_uuid.as_str()).await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    warn!(
                        "call {} in cache but missing in shared store - re-registering",
                        call_uuid
                    );
                    let snapshot = shared.read().clone();
                    if let Err(err) = self.call_store.register_call(&snapshot, &instance_id).await {
                        error!("re-registration of call {} failed: {}", call_uuid, err);
                    }
                }
                Err(err) => {
                    warn!("cache validation fetch failed for {}: {}", call_uuid, err);
                }
            }
        }
    }

    /// Push every locally-cached call to the shared store. Safety net on a
    /// longer interval.
    pub async fn full_cache_sync(&self) {
        if !self.full_sync_enabled.load(Ordering::Relaxed) {
            return;
        }
        self.sync_all_cached().await;
    }

    async fn sync_all_cached(&self) {
        if self.active_calls.entry_count() == 0 {
            return;
        }
        for (call_uuid, shared) in self.active_calls.iter() {
            let snapshot = shared.read().clone();
            if let Err(err) = self.call_store.update_call(&snapshot).await {
                error!("failed to sync call {} to shared store: {}", call_uuid, err);
            }
        }
    }

    /// Sample and log cache statistics. Sustained low hit rate or high
    /// eviction counts are warnings only, never auto-remediated.
    pub fn log_cache_stats(&self) {
        self.run_pending_cache_tasks();
        let stats = self.cache_stats();
        info!(
            "📊 call cache stats - hit rate: {:.1}%, size: {}, evictions: {}",
            stats.hit_rate() * 100.0,
            stats.size,
            stats.evictions
        );
        if stats.evictions > 1000 {
            warn!("high call cache eviction count: {}", stats.evictions);
        }
        if stats.hit_rate() < 0.7 {
            warn!("low call cache hit rate: {:.1}%", stats.hit_rate() * 100.0);
        }
    }

    pub fn stop_cache_validation(&self) {
        self.validation_enabled.store(false, Ordering::Relaxed);
        info!("cache validation task disabled");
    }

    pub fn stop_full_sync(&self) {
        self.full_sync_enabled.store(false, Ordering::Relaxed);
        info!("full cache sync task disabled");
    }

    pub fn restart_cache_validation(&self) {
        self.validation_enabled.store(true, Ordering::Relaxed);
        info!("cache validation task restarted");
    }

    pub fn restart_full_sync(&self) {
        self.full_sync_enabled.store(true, Ordering::Relaxed);
        info!("full cache sync task restarted");
    }

    /// Spawn the periodic reconciliation and statistics loops.
    pub fn spawn_maintenance(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let registry = Arc::clone(self);
        let interval = self.config.validation_interval;
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = registry.shutdown.wait() => break,
                    _ = ticker.tick() => registry.validate_cache_consistency().await,
                }
            }
        }));

        let registry = Arc::clone(self);
        let interval = self.config.full_sync_interval;
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = registry.shutdown.wait() => break,
                    _ = ticker.tick() => registry.full_cache_sync().await,
                }
            }
        }));

        let registry = Arc::clone(self);
        let interval = self.config.stats_interval;
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = registry.shutdown.wait() => break,
                    _ = ticker.tick() => registry.log_cache_stats(),
                }
            }
        }));

        handles
    }

    /// Persist everything and stop the reconciliation jobs. Cluster
    /// membership release is the instance manager's job.
    pub async fn shutdown(&self) {
        info!("📇 shutting down call registry");
        self.stop_cache_validation();
        self.stop_full_sync();
        self.sync_all_cached().await;
        info!("📇 call registry shutdown complete");
    }
}
