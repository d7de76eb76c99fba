//! Shared-tier call persistence.
//!
//! One serialized document per call, a per-instance owned-call-id set, a
//! global call-id set, and a channel -> call-id index, all TTL-bounded.
//! Writes that span several keys go through one atomic batch.

use std::sync::Arc;

use tracing::{debug, warn};

use callgrid_call_model::Call;

use crate::error::Result;
use crate::store::{keys, SharedStore, StoreError, StoreOp};

/// Facade over the shared store for call documents and their indices.
#[derive(Clone)]
pub struct CallStore {
    store: Arc<dyn SharedStore>,
}

impl CallStore {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self { store }
    }

    fn serialize(call: &Call) -> Result<String> {
        serde_json::to_string(call)
            .map_err(|e| StoreError::Serialization(e.to_string()).into())
    }

    /// First write of a call: document, ownership, global index, counters
    /// and channel mappings in one atomic batch.
    pub async fn register_call(&self, call: &Call, instance_id: &str) -> Result<()> {
        let doc = Self::serialize(call)?;
        let mut ops = vec![
            StoreOp::SetEx {
                key: keys::call_key(&call.call_uuid),
                value: doc,
                ttl_secs: keys::ttl::CALL_SECONDS,
            },
            StoreOp::SAdd {
                key: keys::instance_calls_key(instance_id),
                member: call.call_uuid.clone(),
            },
            StoreOp::SAdd {
                key: keys::GLOBAL_CALLS_KEY.to_string(),
                member: call.call_uuid.clone(),
            },
            StoreOp::HIncrBy {
                key: keys::GLOBAL_STATS_KEY.to_string(),
                field: keys::stats_fields::TOTAL_CALLS.to_string(),
                delta: 1,
            },
            StoreOp::HIncrBy {
                key: keys::GLOBAL_STATS_KEY.to_string(),
                field: keys::stats_fields::ACTIVE_CALLS.to_string(),
                delta: 1,
            },
        ];
        Self::push_channel_mappings(&mut ops, call);
        self.store.apply_batch(ops).await?;
        debug!("registered call {} in shared store", call.call_uuid);
        Ok(())
    }

    /// Rewrite the call document and refresh its channel mappings.
    pub async fn update_call(&self, call: &Call) -> Result<()> {
        let doc = Self::serialize(call)?;
        let mut ops = vec![StoreOp::SetEx {
            key: keys::call_key(&call.call_uuid),
            value: doc,
            ttl_secs: keys::ttl::CALL_SECONDS,
        }];
        Self::push_channel_mappings(&mut ops, call);
        self.store.apply_batch(ops).await?;
        Ok(())
    }

    fn push_channel_mappings(ops: &mut Vec<StoreOp>, call: &Call) {
        for channel_uuid in call.channel_ids() {
            ops.push(StoreOp::SetEx {
                key: keys::channel_mapping_key(channel_uuid),
                value: call.call_uuid.clone(),
                ttl_secs: keys::ttl::CALL_SECONDS,
            });
        }
    }

    /// Close out a finished call. The document and indices age out through
    /// their TTLs; only the counters move.
    pub async fn unregister_call(&self, call_uuid: &str) -> Result<()> {
        self.store
            .apply_batch(vec![
                StoreOp::HIncrBy {
                    key: keys::GLOBAL_STATS_KEY.to_string(),
                    field: keys::stats_fields::ACTIVE_CALLS.to_string(),
                    delta: -1,
                },
                StoreOp::HIncrBy {
                    key: keys::GLOBAL_STATS_KEY.to_string(),
                    field: keys::stats_fields::COMPLETED_CALLS.to_string(),
                    delta: 1,
                },
            ])
            .await?;
        debug!("unregistered call {}", call_uuid);
        Ok(())
    }

    pub async fn get_call(&self, call_uuid: &str) -> Result<Option<Call>> {
        let Some(doc) = self.store.get(&keys::call_key(call_uuid)).await? else {
            debug!("call {} not found in shared store", call_uuid);
            return Ok(None);
        };
        match serde_json::from_str(&doc) {
            Ok(call) => Ok(Some(call)),
            Err(err) => {
                warn!("failed to parse call document {}: {}", call_uuid, err);
                Ok(None)
            }
        }
    }

    pub async fn call_for_channel(&self, channel_uuid: &str) -> Result<Option<String>> {
        Ok(self.store.get(&keys::channel_mapping_key(channel_uuid)).await?)
    }

    /// All calls currently flagged orphaned, oldest first.
    pub async fn orphaned_calls(&self) -> Result<Vec<Call>> {
        let ids = self
            .store
            .zrange_by_score(keys::ORPHANED_CALLS_ZSET, f64::MIN, f64::MAX)
            .await?;
        let mut calls = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(call) = self.get_call(&id).await? {
                if call.orphaned {
                    calls.push(call);
                }
            }
        }
        Ok(calls)
    }

    /// Remove a recovered call from the orphan pool.
    pub async fn clear_orphan(&self, call_uuid: &str) -> Result<()> {
        self.store.zrem(keys::ORPHANED_CALLS_ZSET, call_uuid).await?;
        Ok(())
    }

    pub async fn calls_owned_by(&self, instance_id: &str) -> Result<Vec<String>> {
        Ok(self.store.smembers(&keys::instance_calls_key(instance_id)).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use callgrid_call_model::{CallState, Channel, ChannelRole, DialParams};

    fn sample_call(uuid: &str) -> Call {
        let mut call = Call::new(uuid, DialParams::default());
        call.add_channel(Channel::new(format!("{uuid}-leg"), uuid, ChannelRole::Originator));
        call
    }

    #[tokio::test]
    async fn register_creates_document_and_indices() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let calls = CallStore::new(store.clone());
        let call = sample_call("c1");
        calls.register_call(&call, "i1").await.unwrap();

        let fetched = calls.get_call("c1").await.unwrap().unwrap();
        assert_eq!(fetched.call_uuid, "c1");
        assert_eq!(
            calls.call_for_channel("c1-leg").await.unwrap().as_deref(),
            Some("c1")
        );
        assert_eq!(calls.calls_owned_by("i1").await.unwrap(), vec!["c1".to_string()]);
        assert!(store
            .smembers(keys::GLOBAL_CALLS_KEY)
            .await
            .unwrap()
            .contains(&"c1".to_string()));
    }

    #[tokio::test]
    async fn update_rewrites_latest_state() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let calls = CallStore::new(store);
        let mut call = sample_call("c2");
        calls.register_call(&call, "i1").await.unwrap();

        call.transition_to(CallState::Ringing).unwrap();
        calls.update_call(&call).await.unwrap();

        let fetched = calls.get_call("c2").await.unwrap().unwrap();
        assert_eq!(fetched.current_state(), CallState::Ringing);
    }

    #[tokio::test]
    async fn orphan_queries_filter_by_flag() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let calls = CallStore::new(store.clone());

        let mut orphan = sample_call("c3");
        orphan.mark_orphaned("i-dead", chrono::Utc::now());
        calls.register_call(&orphan, "i-dead").await.unwrap();
        store
            .zadd(keys::ORPHANED_CALLS_ZSET, 1.0, "c3")
            .await
            .unwrap();
        // Stale zset entry whose document is already gone.
        store
            .zadd(keys::ORPHANED_CALLS_ZSET, 2.0, "ghost")
            .await
            .unwrap();

        let orphans = calls.orphaned_calls().await.unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].call_uuid, "c3");

        calls.clear_orphan("c3").await.unwrap();
        assert!(calls.orphaned_calls().await.unwrap().is_empty());
    }
}
