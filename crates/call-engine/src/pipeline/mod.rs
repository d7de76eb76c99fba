//! Event ingestion and per-channel ordering.
//!
//! Messages arrive unordered and at least once. Heartbeats are handled
//! inline; channel-scoped events go into a bounded per-channel priority
//! queue drained by exactly one worker at a time, so events for one channel
//! are applied in ascending sequence order no matter how many workers the
//! pool runs; everything else dispatches immediately. The queue itself is
//! the serialization point — there is no lock around the handlers.

pub mod task;

pub use task::EventTask;

use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use callgrid_switch_events::Event;

use crate::config::PipelineConfig;
use crate::handlers::HandlerRegistry;
use crate::shutdown::ShutdownGuard;
use crate::transport::{EventTransport, InboundMessage};

struct QueueState {
    heap: BinaryHeap<std::cmp::Reverse<EventTask>>,
    /// A drainer is currently active for this channel.
    draining: bool,
    /// Set when the queue emptied and its map entry is being removed; a
    /// racing enqueue that still holds this queue must retry on a fresh one.
    closed: bool,
}

struct ChannelQueue {
    state: Mutex<QueueState>,
}

impl ChannelQueue {
    fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                heap: BinaryHeap::new(),
                draining: false,
                closed: false,
            }),
        }
    }
}

/// Consumes the event transport and dispatches to handlers under the
/// per-channel ordering guarantee.
pub struct EventProcessor {
    handlers: Arc<HandlerRegistry>,
    queues: Arc<DashMap<String, Arc<ChannelQueue>>>,
    workers: Arc<Semaphore>,
    config: PipelineConfig,
    shutdown: ShutdownGuard,
}

impl EventProcessor {
    pub fn new(
        handlers: Arc<HandlerRegistry>,
        config: PipelineConfig,
        shutdown: ShutdownGuard,
    ) -> Self {
        Self {
            handlers,
            queues: Arc::new(DashMap::new()),
            workers: Arc::new(Semaphore::new(config.max_workers)),
            config,
            shutdown,
        }
    }

    /// Consume the transport until it closes or shutdown triggers.
    pub async fn run(&self, transport: Arc<dyn EventTransport>) {
        info!("📥 event processor consuming");
        loop {
            tokio::select! {
                _ = self.shutdown.wait() => break,
                message = transport.next_message() => {
                    let Some(message) = message else { break };
                    self.ingest(message).await;
                }
            }
        }
        info!("📥 event processor stopped consuming");
    }

    /// Decode, classify and dispatch one message.
    pub async fn ingest(&self, message: Box<dyn InboundMessage>) {
        if self.shutdown.is_shutting_down() {
            message.reject(false).await;
            return;
        }

        let event = match Event::from_payload(message.payload()) {
            Ok(event) => event,
            Err(err) => {
                // Terminal per-message error: rejected, never retried.
                error!("failed to decode event message: {}", err);
                message.reject(false).await;
                return;
            }
        };

        let event_type = event.event_type();
        let handler = self.handlers.handler_for(event_type);

        if event_type.is_heartbeat() {
            match handler.handle_event(&event).await {
                Ok(()) => message.ack().await,
                Err(err) => {
                    error!("heartbeat handler failed: {}", err);
                    message.reject(false).await;
                }
            }
            return;
        }

        let task = EventTask::new(event, handler, message);
        if event_type.is_channel_event() {
            let Some(channel_id) = task.channel_key() else {
                warn!("channel event {} without a channel id", event_type);
                task.nack(false).await;
                return;
            };
            self.enqueue_channel_task(channel_id, task).await;
        } else {
            self.dispatch_general(task);
        }
    }

    /// Put a channel-scoped task into its channel's queue and make sure one
    /// drainer is running. A full queue rejects the new event rather than
    /// applying it out of order or dropping it silently.
    async fn enqueue_channel_task(&self, channel_id: String, task: EventTask) {
        let mut task = Some(task);
        loop {
            let queue = self
                .queues
                .entry(channel_id.clone())
                .or_insert_with(|| Arc::new(ChannelQueue::new()))
                .clone();

            let spawn = {
                let mut state = queue.state.lock();
                if state.closed {
                    // Lost the race against queue GC; retry on a fresh entry.
                    continue;
                }
                if state.heap.len() >= self.config.channel_queue_capacity {
                    None
                } else {
                    state.heap.push(std::cmp::Reverse(task.take().unwrap()));
                    if state.draining {
                        Some(false)
                    } else {
                        state.draining = true;
                        Some(true)
                    }
                }
            };

            match spawn {
                None => {
                    warn!("channel queue full for {}, rejecting message", channel_id);
                    task.take().unwrap().nack(false).await;
                    return;
                }
                Some(true) => {
                    self.spawn_drainer(channel_id, queue);
                    return;
                }
                Some(false) => return,
            }
        }
    }

    /// One drainer per channel: pops tasks in sequence order and runs each
    /// to completion before the next. When the queue empties its entry is
    /// garbage-collected so idle channels hold no memory.
    fn spawn_drainer(&self, channel_id: String, queue: Arc<ChannelQueue>) {
        let workers = Arc::clone(&self.workers);
        let queues = Arc::clone(&self.queues);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let Ok(_permit) = workers.acquire_owned().await else {
                // Pool closed; the shutdown drain owns the rest.
                return;
            };
            loop {
                if shutdown.is_shutting_down() {
                    // Remaining tasks are drained synchronously at shutdown.
                    break;
                }
                let next = {
                    let mut state = queue.state.lock();
                    match state.heap.pop() {
                        Some(std::cmp::Reverse(task)) => Some(task),
                        None => {
                            state.draining = false;
                            state.closed = true;
                            None
                        }
                    }
                };
                match next {
                    Some(task) => task.run().await,
                    None => {
                        queues.remove_if(&channel_id, |_, q| q.state.lock().closed);
                        debug!("channel queue {} drained and removed", channel_id);
                        break;
                    }
                }
            }
        });
    }

    /// General events carry no ordering requirement and dispatch straight
    /// into the worker pool.
    fn dispatch_general(&self, task: EventTask) {
        let workers = Arc::clone(&self.workers);
        tokio::spawn(async move {
            let Ok(_permit) = workers.acquire_owned().await else {
                task.nack(false).await;
                return;
            };
            task.run().await;
        });
    }

    /// Number of channels currently holding a queue entry.
    pub fn queued_channels(&self) -> usize {
        self.queues.len()
    }

    /// Graceful shutdown: reject new input, give in-flight work a moment,
    /// then synchronously drain every channel queue under a bounded timeout
    /// and close the worker pool.
    pub async fn shutdown(&self) {
        self.shutdown.trigger();
        info!("📥 event processor starting graceful shutdown");

        tokio::time::sleep(self.config.inflight_wait).await;
        self.drain_channel_queues().await;

        self.workers.close();
        info!("📥 event processor shutdown complete");
    }

    /// Run every remaining queued task to completion, nacking whatever is
    /// left when the timeout expires.
    async fn drain_channel_queues(&self) {
        let deadline = Instant::now() + self.config.drain_timeout;

        loop {
            let mut all_empty = true;
            let channels: Vec<Arc<ChannelQueue>> = self
                .queues
                .iter()
                .map(|entry| entry.value().clone())
                .collect();
            for queue in channels {
                loop {
                    if Instant::now() >= deadline {
                        break;
                    }
                    let next = {
                        let mut state = queue.state.lock();
                        state.heap.pop().map(|rev| rev.0)
                    };
                    match next {
                        Some(task) => task.run().await,
                        None => break,
                    }
                }
                if !queue.state.lock().heap.is_empty() {
                    all_empty = false;
                }
            }

            if all_empty {
                info!("all channel queues drained");
                self.queues.clear();
                return;
            }
            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }

        warn!("timeout reached while draining queues, rejecting remaining events");
        let channels: Vec<Arc<ChannelQueue>> = self
            .queues
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for queue in channels {
            loop {
                let next = {
                    let mut state = queue.state.lock();
                    state.heap.pop().map(|rev| rev.0)
                };
                match next {
                    Some(task) => task.nack(false).await,
                    None => break,
                }
            }
        }
        self.queues.clear();
    }
}
