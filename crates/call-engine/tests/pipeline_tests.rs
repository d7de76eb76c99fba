//! Ordering and acknowledgement behavior of the event pipeline.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;

use callgrid_call_engine::config::PipelineConfig;
use callgrid_call_engine::handlers::{EventHandler, HandlerRegistry};
use callgrid_call_engine::pipeline::EventProcessor;
use callgrid_call_engine::shutdown::ShutdownGuard;
use callgrid_call_engine::transport::{DeliveryOutcome, EventTransport, MemoryTransport};
use callgrid_call_engine::Result;
use callgrid_switch_events::{Event, EventType};

/// Records (channel id, sequence) pairs in handler invocation order.
struct RecordingHandler {
    seen: Arc<Mutex<Vec<(String, u64)>>>,
}

#[async_trait::async_trait]
impl EventHandler for RecordingHandler {
    async fn handle_event(&self, event: &Event) -> Result<()> {
        let channel = event
            .str_param("Channel-Call-UUID")
            .unwrap_or_default()
            .to_string();
        self.seen.lock().push((channel, event.sequence()));
        Ok(())
    }
}

struct FailingHandler;

#[async_trait::async_trait]
impl EventHandler for FailingHandler {
    async fn handle_event(&self, _event: &Event) -> Result<()> {
        Err(callgrid_call_engine::CallEngineError::registry("boom"))
    }
}

fn channel_event(channel: &str, sequence: u64) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "Event-Name": "CHANNEL_ANSWER",
        "Event-Sequence": sequence.to_string(),
        "Channel-Call-UUID": channel,
        "Unique-ID": channel,
    }))
    .unwrap()
}

fn recording_processor(
    config: PipelineConfig,
) -> (EventProcessor, Arc<Mutex<Vec<(String, u64)>>>, ShutdownGuard) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut handlers = HandlerRegistry::new();
    handlers.register(
        EventType::ChannelAnswer,
        Arc::new(RecordingHandler { seen: seen.clone() }),
    );
    let shutdown = ShutdownGuard::new();
    let processor = EventProcessor::new(Arc::new(handlers), config, shutdown.clone());
    (processor, seen, shutdown)
}

#[tokio::test]
async fn events_enqueued_out_of_order_run_in_sequence_order() {
    let (processor, seen, _shutdown) = recording_processor(PipelineConfig::default());
    let (transport, publisher) = MemoryTransport::channel();

    // Sequence 5 arrives before sequence 3.
    let outcome5 = publisher.publish(channel_event("ch1", 5));
    let outcome3 = publisher.publish(channel_event("ch1", 3));
    let first = transport.next_message().await.unwrap();
    let second = transport.next_message().await.unwrap();
    // Both deliveries are enqueued before any worker drains the channel.
    processor.ingest(first).await;
    processor.ingest(second).await;

    assert_eq!(outcome3.await.unwrap(), DeliveryOutcome::Acked);
    assert_eq!(outcome5.await.unwrap(), DeliveryOutcome::Acked);

    let order: Vec<u64> = seen.lock().iter().map(|(_, seq)| *seq).collect();
    assert_eq!(order, vec![3, 5]);
}

#[tokio::test]
async fn per_channel_order_holds_across_many_channels() {
    let (processor, seen, _shutdown) = recording_processor(PipelineConfig::default());
    let (transport, publisher) = MemoryTransport::channel();

    // Interleave three channels with per-channel sequences shuffled.
    let mut outcomes = Vec::new();
    for sequence in [9u64, 3, 7, 1, 5] {
        for channel in ["ch-a", "ch-b", "ch-c"] {
            outcomes.push(publisher.publish(channel_event(channel, sequence)));
        }
    }
    let mut messages = Vec::new();
    for _ in 0..outcomes.len() {
        messages.push(transport.next_message().await.unwrap());
    }
    for message in messages {
        processor.ingest(message).await;
    }
    for outcome in outcomes {
        assert_eq!(outcome.await.unwrap(), DeliveryOutcome::Acked);
    }

    for channel in ["ch-a", "ch-b", "ch-c"] {
        let sequences: Vec<u64> = seen
            .lock()
            .iter()
            .filter(|(ch, _)| ch == channel)
            .map(|(_, seq)| *seq)
            .collect();
        assert_eq!(sequences, vec![1, 3, 5, 7, 9], "channel {channel}");
    }
}

#[tokio::test]
async fn full_channel_queue_rejects_new_events() {
    let config = PipelineConfig {
        channel_queue_capacity: 2,
        ..Default::default()
    };
    let (processor, _seen, _shutdown) = recording_processor(config);
    let (transport, publisher) = MemoryTransport::channel();

    let o1 = publisher.publish(channel_event("ch1", 1));
    let o2 = publisher.publish(channel_event("ch1", 2));
    let o3 = publisher.publish(channel_event("ch1", 3));
    let mut messages = Vec::new();
    for _ in 0..3 {
        messages.push(transport.next_message().await.unwrap());
    }
    for message in messages {
        processor.ingest(message).await;
    }

    assert_eq!(
        o3.await.unwrap(),
        DeliveryOutcome::Rejected { requeue: false }
    );
    assert_eq!(o1.await.unwrap(), DeliveryOutcome::Acked);
    assert_eq!(o2.await.unwrap(), DeliveryOutcome::Acked);
}

#[tokio::test]
async fn undecodable_message_is_rejected_without_requeue() {
    let (processor, seen, _shutdown) = recording_processor(PipelineConfig::default());
    let (transport, publisher) = MemoryTransport::channel();

    let garbage = publisher.publish(b"not json at all".to_vec());
    let unknown = publisher.publish(
        serde_json::to_vec(&json!({"Event-Name": "NOT_IN_SCHEMA"})).unwrap(),
    );
    processor.ingest(transport.next_message().await.unwrap()).await;
    processor.ingest(transport.next_message().await.unwrap()).await;

    assert_eq!(
        garbage.await.unwrap(),
        DeliveryOutcome::Rejected { requeue: false }
    );
    assert_eq!(
        unknown.await.unwrap(),
        DeliveryOutcome::Rejected { requeue: false }
    );
    assert!(seen.lock().is_empty());
}

#[tokio::test]
async fn heartbeats_are_handled_inline() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut handlers = HandlerRegistry::new();
    handlers.register(
        EventType::Heartbeat,
        Arc::new(RecordingHandler { seen: seen.clone() }),
    );
    let processor = EventProcessor::new(
        Arc::new(handlers),
        PipelineConfig::default(),
        ShutdownGuard::new(),
    );
    let (transport, publisher) = MemoryTransport::channel();

    let outcome = publisher.publish(
        serde_json::to_vec(&json!({
            "Event-Name": "HEARTBEAT",
            "Event-Sequence": "11",
            "Core-UUID": "node-1",
        }))
        .unwrap(),
    );
    processor.ingest(transport.next_message().await.unwrap()).await;

    // Handled before ingest returned, no queue involved.
    assert_eq!(seen.lock().len(), 1);
    assert_eq!(processor.queued_channels(), 0);
    assert_eq!(outcome.await.unwrap(), DeliveryOutcome::Acked);
}

#[tokio::test]
async fn handler_failure_nacks_without_requeue() {
    let mut handlers = HandlerRegistry::new();
    handlers.register(EventType::ChannelAnswer, Arc::new(FailingHandler));
    let processor = EventProcessor::new(
        Arc::new(handlers),
        PipelineConfig::default(),
        ShutdownGuard::new(),
    );
    let (transport, publisher) = MemoryTransport::channel();

    let outcome = publisher.publish(channel_event("ch1", 1));
    processor.ingest(transport.next_message().await.unwrap()).await;

    assert_eq!(
        outcome.await.unwrap(),
        DeliveryOutcome::Rejected { requeue: false }
    );
}

#[tokio::test]
async fn unrouted_event_types_fall_back_and_ack() {
    let (processor, _seen, _shutdown) = recording_processor(PipelineConfig::default());
    let (transport, publisher) = MemoryTransport::channel();

    let outcome = publisher.publish(
        serde_json::to_vec(&json!({
            "Event-Name": "PLAYBACK_START",
            "Event-Sequence": "4",
        }))
        .unwrap(),
    );
    processor.ingest(transport.next_message().await.unwrap()).await;
    assert_eq!(outcome.await.unwrap(), DeliveryOutcome::Acked);
}

#[tokio::test]
async fn empty_channel_queues_are_garbage_collected() {
    let (processor, seen, _shutdown) = recording_processor(PipelineConfig::default());
    let (transport, publisher) = MemoryTransport::channel();

    let outcome = publisher.publish(channel_event("ch1", 1));
    processor.ingest(transport.next_message().await.unwrap()).await;
    assert_eq!(outcome.await.unwrap(), DeliveryOutcome::Acked);
    assert_eq!(seen.lock().len(), 1);

    // The drainer removes the entry once the queue empties.
    tokio::time::timeout(Duration::from_secs(2), async {
        while processor.queued_channels() != 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("queue entry should be garbage collected");
}

#[tokio::test]
async fn shutdown_drains_queued_events_and_rejects_new_input() {
    let config = PipelineConfig {
        inflight_wait: Duration::from_millis(10),
        drain_timeout: Duration::from_secs(5),
        ..Default::default()
    };
    let (processor, seen, shutdown) = recording_processor(config);
    let (transport, publisher) = MemoryTransport::channel();

    let o1 = publisher.publish(channel_event("ch1", 1));
    let o2 = publisher.publish(channel_event("ch1", 2));
    let first = transport.next_message().await.unwrap();
    let second = transport.next_message().await.unwrap();
    processor.ingest(first).await;
    processor.ingest(second).await;

    // Trigger before the drainer gets scheduled: the shutdown drain must
    // still run both tasks to completion.
    shutdown.trigger();
    processor.shutdown().await;

    assert_eq!(o1.await.unwrap(), DeliveryOutcome::Acked);
    assert_eq!(o2.await.unwrap(), DeliveryOutcome::Acked);
    let order: Vec<u64> = seen.lock().iter().map(|(_, seq)| *seq).collect();
    assert_eq!(order, vec![1, 2]);

    // New input after shutdown is rejected immediately.
    let late = publisher.publish(channel_event("ch1", 3));
    processor.ingest(transport.next_message().await.unwrap()).await;
    assert_eq!(
        late.await.unwrap(),
        DeliveryOutcome::Rejected { requeue: false }
    );
}
