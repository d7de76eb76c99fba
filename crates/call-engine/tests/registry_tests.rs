//! Two-tier registry behavior: the public surface, eviction write-through,
//! cache/store convergence and orphan recovery.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use callgrid_call_engine::config::CacheConfig;
use callgrid_call_engine::registry::{CallRegistry, CallStore};
use callgrid_call_engine::shutdown::ShutdownGuard;
use callgrid_call_engine::store::{keys, MemoryStore, SharedStore};
use callgrid_call_model::{Call, CallState, Channel, ChannelRole, DialParams};

fn sample_call(uuid: &str) -> Call {
    let mut call = Call::new(
        uuid,
        DialParams {
            extension: "1003".into(),
            caller_id_name: "Acceptance".into(),
            caller_id_number: "9876543210".into(),
            ..Default::default()
        },
    );
    call.add_channel(Channel::new(
        format!("{uuid}-leg"),
        uuid,
        ChannelRole::Originator,
    ));
    call
}

async fn registry_with(
    store: Arc<dyn SharedStore>,
    config: CacheConfig,
    instance_id: &str,
) -> Arc<CallRegistry> {
    let registry = CallRegistry::new(config, store, ShutdownGuard::new());
    registry.set_instance_id(instance_id).await.unwrap();
    registry
}

/// Poll the shared store until the call document satisfies `predicate`.
async fn await_document(
    store: &Arc<dyn SharedStore>,
    call_uuid: &str,
    predicate: impl Fn(&Call) -> bool,
) -> Call {
    let calls = CallStore::new(store.clone());
    for _ in 0..200 {
        if let Some(call) = calls.get_call(call_uuid).await.unwrap() {
            if predicate(&call) {
                return call;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("call {call_uuid} never reached the expected state in the shared store");
}

#[tokio::test]
async fn register_then_transition_scenario() {
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let registry = registry_with(store.clone(), CacheConfig::default(), "i1").await;

    registry.register_call(sample_call("c1")).unwrap();
    registry
        .update_call_state("c1", CallState::Ringing)
        .await
        .unwrap();
    registry
        .update_call_state("c1", CallState::Active)
        .await
        .unwrap();

    let call = registry.get_call("c1").await.unwrap();
    {
        let call = call.read();
        assert_eq!(call.current_state(), CallState::Active);
        assert_eq!(call.previous_state(), CallState::Ringing);
        assert!(call.answer_time.is_some());
        assert_eq!(call.instance_id.as_deref(), Some("i1"));
    }

    // ACTIVE -> RINGING is not in the table: rejected, state unchanged.
    let err = registry
        .update_call_state("c1", CallState::Ringing)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("invalid transition"));
    assert_eq!(call.read().current_state(), CallState::Active);

    // The shared tier converges on the applied state.
    await_document(&store, "c1", |c| c.current_state() == CallState::Active).await;
}

#[tokio::test]
async fn channel_lookup_uses_both_tiers() {
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let registry = registry_with(store.clone(), CacheConfig::default(), "i1").await;

    registry.register_call(sample_call("c2")).unwrap();
    registry
        .add_channel_to_call("c2", Channel::new("c2-dest", "c2", ChannelRole::Destination))
        .await
        .unwrap();

    let by_channel = registry.get_call_by_channel("c2-dest").await.unwrap();
    assert_eq!(by_channel.read().call_uuid, "c2");

    // Shared-index fallback: another instance resolves the same channel
    // without any local mapping.
    await_document(&store, "c2", |c| c.channel("c2-dest").is_some()).await;
    let other = registry_with(store.clone(), CacheConfig::default(), "i2").await;
    let resolved = other.get_call_by_channel("c2-dest").await.unwrap();
    assert_eq!(resolved.read().call_uuid, "c2");
}

#[tokio::test]
async fn eviction_writes_through_and_fetch_converges() {
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let config = CacheConfig {
        call_ttl: Duration::from_millis(100),
        ..Default::default()
    };
    let registry = registry_with(store.clone(), config, "i1").await;

    registry.register_call(sample_call("c3")).unwrap();
    registry
        .update_call_state("c3", CallState::Ringing)
        .await
        .unwrap();
    await_document(&store, "c3", |c| c.current_state() == CallState::Ringing).await;

    // Lose the shared copy, then let the cache entry expire: the eviction
    // write-through must restore the last locally-applied state.
    store.del(&keys::call_key("c3")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    registry.run_pending_cache_tasks();

    let restored =
        await_document(&store, "c3", |c| c.current_state() == CallState::Ringing).await;
    assert_eq!(restored.previous_state(), CallState::Idle);

    // Local miss now resolves through the shared store.
    let fetched = registry.get_call("c3").await.unwrap();
    assert_eq!(fetched.read().current_state(), CallState::Ringing);
    assert!(registry.cache_stats().evictions >= 1);
}

#[tokio::test]
async fn orphan_recovery_adopts_flagged_calls() {
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let calls = CallStore::new(store.clone());

    let mut lost = sample_call("c4");
    lost.instance_id = Some("i-dead".into());
    lost.transition_to(CallState::Ringing).unwrap();
    lost.mark_orphaned("i-dead", Utc::now());
    calls.register_call(&lost, "i-dead").await.unwrap();
    store
        .zadd(keys::ORPHANED_CALLS_ZSET, Utc::now().timestamp_millis() as f64, "c4")
        .await
        .unwrap();

    // set_instance_id runs recovery on startup.
    let registry = registry_with(store.clone(), CacheConfig::default(), "i-new").await;

    let call = registry.get_call("c4").await.expect("recovered locally");
    {
        let call = call.read();
        assert!(!call.orphaned);
        assert_eq!(call.instance_id.as_deref(), Some("i-new"));
        assert_eq!(call.current_state(), CallState::Ringing);
    }
    // Channel mapping rebuilt, orphan pool cleared, ownership claimed.
    assert!(registry.get_call_by_channel("c4-leg").await.is_some());
    assert_eq!(store.zcard(keys::ORPHANED_CALLS_ZSET).await.unwrap(), 0);
    assert!(store
        .smembers(&keys::instance_calls_key("i-new"))
        .await
        .unwrap()
        .contains(&"c4".to_string()));
}

#[tokio::test]
async fn concurrent_recovery_admits_exactly_one_winner() {
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let calls = CallStore::new(store.clone());

    let mut lost = sample_call("c5");
    lost.mark_orphaned("i-dead", Utc::now());
    calls.register_call(&lost, "i-dead").await.unwrap();
    store
        .zadd(keys::ORPHANED_CALLS_ZSET, Utc::now().timestamp_millis() as f64, "c5")
        .await
        .unwrap();

    let quiet = CacheConfig {
        orphan_recovery_enabled: false,
        ..Default::default()
    };
    let r1 = registry_with(store.clone(), quiet.clone(), "i1").await;
    let r2 = registry_with(store.clone(), quiet, "i2").await;

    tokio::join!(r1.recover_orphaned_calls(), r2.recover_orphaned_calls());

    let doc = calls.get_call("c5").await.unwrap().unwrap();
    assert!(!doc.orphaned);
    let owner = doc.instance_id.clone().expect("an owner was assigned");
    assert!(owner == "i1" || owner == "i2");

    // Exactly one registry holds the call locally.
    let locally_held = [&r1, &r2]
        .iter()
        .filter(|r| !r.active_calls().is_empty())
        .count();
    assert_eq!(locally_held, 1);

    // The loser performed no ownership mutation.
    let loser = if owner == "i1" { "i2" } else { "i1" };
    assert!(store
        .smembers(&keys::instance_calls_key(loser))
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn reconciliation_restores_missing_documents() {
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let registry = registry_with(store.clone(), CacheConfig::default(), "i1").await;

    registry.register_call(sample_call("c6")).unwrap();
    await_document(&store, "c6", |_| true).await;

    // Simulate a lost shared-tier write.
    store.del(&keys::call_key("c6")).await.unwrap();
    registry.validate_cache_consistency().await;

    await_document(&store, "c6", |_| true).await;
}

#[tokio::test]
async fn finalize_moves_counters_but_keeps_the_document() {
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let registry = registry_with(store.clone(), CacheConfig::default(), "i1").await;

    registry.register_call(sample_call("c7")).unwrap();
    registry
        .update_call_state("c7", CallState::Ringing)
        .await
        .unwrap();
    registry
        .update_call_state("c7", CallState::Active)
        .await
        .unwrap();
    registry
        .update_call_state("c7", CallState::Ended)
        .await
        .unwrap();
    registry.finalize_call("c7").await.unwrap();

    // Retained for auditability; only the counters moved.
    await_document(&store, "c7", |c| c.current_state() == CallState::Ended).await;
    let stats = store.hget_all(keys::GLOBAL_STATS_KEY).await.unwrap();
    assert_eq!(stats.get("completedCalls").map(String::as_str), Some("1"));
    assert_eq!(stats.get("activeCalls").map(String::as_str), Some("0"));
}

#[tokio::test]
async fn state_queries_reflect_local_cache() {
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let registry = registry_with(store, CacheConfig::default(), "i1").await;

    registry.register_call(sample_call("c8")).unwrap();
    registry.register_call(sample_call("c9")).unwrap();
    registry
        .update_call_state("c8", CallState::Ringing)
        .await
        .unwrap();

    assert_eq!(registry.calls_by_state(CallState::Ringing).len(), 1);
    assert_eq!(registry.calls_by_state(CallState::Idle).len(), 1);
    assert_eq!(registry.active_calls().len(), 2);
    let stats = registry.call_state_statistics();
    assert_eq!(stats.get(&CallState::Ringing), Some(&1));

    assert!(!registry.is_call_active("c8").await);
    registry
        .update_call_state("c8", CallState::Active)
        .await
        .unwrap();
    assert!(registry.is_call_active("c8").await);
}
