//! End-to-end: events through the pipeline into the registry, then ordered
//! teardown.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use callgrid_call_engine::prelude::*;
use callgrid_call_engine::store::keys;

fn event(fields: serde_json::Value) -> Vec<u8> {
    serde_json::to_vec(&fields).unwrap()
}

async fn settled(outcome: tokio::sync::oneshot::Receiver<DeliveryOutcome>) -> DeliveryOutcome {
    tokio::time::timeout(Duration::from_secs(5), outcome)
        .await
        .expect("message settled")
        .expect("outcome delivered")
}

fn engine_config() -> CallEngineConfig {
    let mut config = CallEngineConfig::default();
    config.pipeline.inflight_wait = Duration::from_millis(10);
    config
}

#[tokio::test]
async fn call_lifecycle_flows_from_events_to_registry() {
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let (transport, publisher) = MemoryTransport::channel();
    let engine = CallEngine::new(engine_config(), store.clone(), Arc::new(NullCommandTransport));
    engine.set_instance_id("i1").await.unwrap();
    engine.start(Arc::new(transport)).unwrap();

    // The origination path registers the call before switch events arrive.
    engine
        .registry()
        .register_call(Call::new(
            "c1",
            DialParams {
                extension: "1003".into(),
                caller_id_name: "Inc".into(),
                caller_id_number: "9876543210".into(),
                ..Default::default()
            },
        ))
        .unwrap();

    let created = publisher.publish(event(json!({
        "Event-Name": "CHANNEL_CREATE",
        "Event-Sequence": "1",
        "Unique-ID": "ch1",
        "Channel-Call-UUID": "ch1",
        "Call-Direction": "outbound",
        "variable_cg_call_id": "c1",
        "variable_sip_profile_name": "external",
    })));
    assert_eq!(settled(created).await, DeliveryOutcome::Acked);

    let answered = publisher.publish(event(json!({
        "Event-Name": "CHANNEL_ANSWER",
        "Event-Sequence": "2",
        "Unique-ID": "ch1",
        "Channel-Call-UUID": "ch1",
    })));
    assert_eq!(settled(answered).await, DeliveryOutcome::Acked);

    let call = engine.registry().get_call("c1").await.expect("call cached");
    {
        let call = call.read();
        assert_eq!(call.current_state(), CallState::Active);
        assert_eq!(call.previous_state(), CallState::Ringing);
        assert!(call.answer_time.is_some());
        let leg = call.channel("ch1").expect("channel attached");
        assert_eq!(leg.state(), ChannelState::Answered);
        assert_eq!(
            leg.variables.get("sip_profile_name").map(String::as_str),
            Some("external")
        );
    }

    let hangup = publisher.publish(event(json!({
        "Event-Name": "CHANNEL_HANGUP",
        "Event-Sequence": "3",
        "Unique-ID": "ch1",
        "Channel-Call-UUID": "ch1",
        "Hangup-Cause": "NORMAL_CLEARING",
    })));
    assert_eq!(settled(hangup).await, DeliveryOutcome::Acked);

    let complete = publisher.publish(event(json!({
        "Event-Name": "CHANNEL_HANGUP_COMPLETE",
        "Event-Sequence": "4",
        "Unique-ID": "ch1",
        "Channel-Call-UUID": "ch1",
    })));
    assert_eq!(settled(complete).await, DeliveryOutcome::Acked);

    {
        let call = call.read();
        assert_eq!(call.current_state(), CallState::Ended);
        assert!(call.end_time.is_some());
        assert!(call.all_channels_hangup());
    }

    engine.shutdown().await;
}

#[tokio::test]
async fn heartbeats_feed_node_tracking_through_the_engine() {
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let (transport, publisher) = MemoryTransport::channel();
    let engine = CallEngine::new(engine_config(), store, Arc::new(NullCommandTransport));
    engine.set_instance_id("i1").await.unwrap();
    engine.start(Arc::new(transport)).unwrap();

    let beat = publisher.publish(event(json!({
        "Event-Name": "HEARTBEAT",
        "Event-Sequence": "100",
        "Core-UUID": "node-1",
        "FreeSWITCH-Hostname": "sw01",
        "FreeSWITCH-IPv4": "10.0.0.9",
        "Session-Count": 3,
        "Max-Sessions": 1000,
        "Idle-CPU": "97.2",
    })));
    assert_eq!(settled(beat).await, DeliveryOutcome::Acked);

    let node = engine
        .nodes()
        .get_node("node-1")
        .await
        .unwrap()
        .expect("node tracked");
    assert_eq!(node.hostname, "sw01");
    assert_eq!(node.session_count, 3);
    assert!(node.is_healthy());

    engine.shutdown().await;
}

#[tokio::test]
async fn shutdown_releases_membership_and_orphans_calls() {
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let (transport, _publisher) = MemoryTransport::channel();
    let engine = CallEngine::new(engine_config(), store.clone(), Arc::new(NullCommandTransport));
    engine.set_instance_id("i1").await.unwrap();
    engine.start(Arc::new(transport)).unwrap();

    engine
        .registry()
        .register_call(Call::new("c1", DialParams::default()))
        .unwrap();
    // Wait until ownership is visible in the shared store.
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let owned = store
                .smembers(&keys::instance_calls_key("i1"))
                .await
                .unwrap();
            if owned.contains(&"c1".to_string()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    engine.shutdown().await;
    assert!(engine.is_shutting_down());

    // Planned restart: our calls are already in the orphan pool and the
    // instance has left the cluster.
    let orphans = store
        .zrange_by_score(keys::ORPHANED_CALLS_ZSET, f64::MIN, f64::MAX)
        .await
        .unwrap();
    assert_eq!(orphans, vec!["c1"]);
    assert!(store
        .smembers(keys::INSTANCE_REGISTRY_KEY)
        .await
        .unwrap()
        .is_empty());
    let record = engine.cluster().instance_record("i1").await.unwrap().unwrap();
    assert_eq!(record.status, InstanceStatus::Down);

    // A second shutdown is a no-op.
    engine.shutdown().await;
}

#[tokio::test]
async fn set_instance_id_twice_is_rejected() {
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let engine = CallEngine::new(engine_config(), store, Arc::new(NullCommandTransport));
    engine.set_instance_id("i1").await.unwrap();
    assert!(engine.set_instance_id("i2").await.is_err());
}
