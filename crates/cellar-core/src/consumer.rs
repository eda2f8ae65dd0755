//! Receiving half of the event transport.
//!
//! A consumer hands an event to the [`EventDispatcher`] only when the local
//! node is a destination and either the consumer switch is ON or the event is
//! forced. Events published by the local node itself are skipped unless they
//! carry the post-publish marker.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config_store::ConfigStore;
use crate::configuration::{CONSUMER_KEY, EVENT_QUEUE, EVENT_TOPIC, NODE_PID};
use crate::dispatcher::EventDispatcher;
use crate::event::Event;
use crate::substrate::Substrate;
use crate::switch::{Switch, SwitchStatus};

/// Default bound on one blocking queue poll.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Delivery counters of one consumer.
#[derive(Debug, Default)]
pub struct ConsumerStats {
    received: AtomicU64,
    dispatched: AtomicU64,
    filtered: AtomicU64,
}

impl ConsumerStats {
    /// Messages taken off the transport.
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Messages handed to the dispatcher.
    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    /// Messages dropped by the destination, source or switch filters.
    pub fn filtered(&self) -> u64 {
        self.filtered.load(Ordering::Relaxed)
    }
}

struct Delivery {
    substrate: Arc<dyn Substrate>,
    dispatcher: Arc<EventDispatcher>,
    switch: Switch,
    stats: ConsumerStats,
}

impl Delivery {
    fn new(
        substrate: Arc<dyn Substrate>,
        dispatcher: Arc<EventDispatcher>,
        store: Arc<ConfigStore>,
    ) -> Self {
        Self {
            substrate,
            dispatcher,
            switch: Switch::backed_by("consumer", store, NODE_PID, CONSUMER_KEY, SwitchStatus::On),
            stats: ConsumerStats::default(),
        }
    }

    fn accepts(&self, event: &Event) -> bool {
        let local = self.substrate.local_node();
        if !event.header.is_addressed_to(&local) {
            trace!(id = %event.header.id, "event not addressed to this node");
            return false;
        }
        if event.header.source_node.as_ref() == Some(&local) && !event.header.post_publish {
            trace!(id = %event.header.id, "skipping own event");
            return false;
        }
        if !event.header.force && !self.switch.is_on() {
            debug!(id = %event.header.id, "consumer is OFF, event dropped");
            return false;
        }
        true
    }

    async fn deliver(&self, bytes: &[u8]) {
        self.stats.received.fetch_add(1, Ordering::Relaxed);
        let event = match Event::decode(bytes) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "discarding undecodable event");
                self.stats.filtered.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        if !self.accepts(&event) {
            self.stats.filtered.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.stats.dispatched.fetch_add(1, Ordering::Relaxed);
        self.dispatcher.dispatch(&event).await;
    }
}

/// Subscriber of the broadcast event topic.
pub struct TopicConsumer {
    delivery: Arc<Delivery>,
    topic: String,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TopicConsumer {
    /// Creates a consumer of the well-known event topic.
    pub fn new(
        substrate: Arc<dyn Substrate>,
        dispatcher: Arc<EventDispatcher>,
        store: Arc<ConfigStore>,
    ) -> Self {
        Self::with_topic(substrate, dispatcher, store, EVENT_TOPIC)
    }

    /// Creates a consumer of a named topic.
    pub fn with_topic(
        substrate: Arc<dyn Substrate>,
        dispatcher: Arc<EventDispatcher>,
        store: Arc<ConfigStore>,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            delivery: Arc::new(Delivery::new(substrate, dispatcher, store)),
            topic: topic.into(),
            task: Mutex::new(None),
        }
    }

    /// Consumer switch.
    pub fn switch(&self) -> &Switch {
        &self.delivery.switch
    }

    /// Delivery counters.
    pub fn stats(&self) -> &ConsumerStats {
        &self.delivery.stats
    }

    /// Subscribes and starts delivering. Calling it again is a no-op.
    ///
    /// The subscription is in place when this returns, so events published
    /// afterwards are not missed.
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }
        let mut rx = self.delivery.substrate.subscribe_topic(&self.topic);
        let delivery = self.delivery.clone();
        let topic = self.topic.clone();
        *task = Some(tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(bytes) => delivery.deliver(&bytes).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(topic = %topic, skipped, "topic consumer lagged, events lost");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!(topic = %topic, "topic consumer exited");
        }));
        info!(topic = %self.topic, "topic consumer started");
    }

    /// Stops delivering. Calling it again is a no-op.
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
            info!(topic = %self.topic, "topic consumer stopped");
        }
    }

    /// True between `start` and `stop`.
    pub fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }
}

impl Drop for TopicConsumer {
    fn drop(&mut self) {
        self.stop();
    }
}

struct PollLoop {
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Competing consumer of the point-to-point event queue.
///
/// A dedicated task polls with a bounded timeout so that `stop` is observed
/// within one poll interval.
pub struct QueueConsumer {
    delivery: Arc<Delivery>,
    queue: String,
    poll_interval: Duration,
    poll_loop: Mutex<Option<PollLoop>>,
}

impl QueueConsumer {
    /// Creates a consumer of the well-known event queue.
    pub fn new(
        substrate: Arc<dyn Substrate>,
        dispatcher: Arc<EventDispatcher>,
        store: Arc<ConfigStore>,
    ) -> Self {
        Self::with_queue(substrate, dispatcher, store, EVENT_QUEUE, DEFAULT_POLL_INTERVAL)
    }

    /// Creates a consumer of a named queue.
    pub fn with_queue(
        substrate: Arc<dyn Substrate>,
        dispatcher: Arc<EventDispatcher>,
        store: Arc<ConfigStore>,
        queue: impl Into<String>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            delivery: Arc::new(Delivery::new(substrate, dispatcher, store)),
            queue: queue.into(),
            poll_interval,
            poll_loop: Mutex::new(None),
        }
    }

    /// Consumer switch.
    pub fn switch(&self) -> &Switch {
        &self.delivery.switch
    }

    /// Delivery counters.
    pub fn stats(&self) -> &ConsumerStats {
        &self.delivery.stats
    }

    /// Starts the poll loop. Calling it again while running is a no-op.
    pub fn start(&self) {
        let mut poll_loop = self.poll_loop.lock();
        if let Some(current) = poll_loop.as_ref() {
            if current.running.load(Ordering::SeqCst) {
                return;
            }
        }
        let running = Arc::new(AtomicBool::new(true));
        let delivery = self.delivery.clone();
        let flag = running.clone();
        let queue = self.queue.clone();
        let interval = self.poll_interval;
        let handle = tokio::spawn(async move {
            while flag.load(Ordering::SeqCst) {
                match delivery.substrate.poll(&queue, interval).await {
                    Ok(Some(bytes)) => delivery.deliver(&bytes).await,
                    Ok(None) => {}
                    Err(e) => {
                        warn!(queue = %queue, error = %e, "queue poll failed");
                        tokio::time::sleep(interval).await;
                    }
                }
            }
            debug!(queue = %queue, "queue consumer exited");
        });
        *poll_loop = Some(PollLoop { running, handle });
        info!(queue = %self.queue, "queue consumer started");
    }

    /// Asks the poll loop to exit. Safe to call from any thread, repeatedly.
    pub fn stop(&self) {
        if let Some(current) = self.poll_loop.lock().as_ref() {
            if current.running.swap(false, Ordering::SeqCst) {
                info!(queue = %self.queue, "queue consumer stopping");
            }
        }
    }

    /// Stops the loop and waits for it to exit.
    pub async fn shutdown(&self) {
        self.stop();
        let poll_loop = self.poll_loop.lock().take();
        if let Some(poll_loop) = poll_loop {
            let _ = poll_loop.handle.await;
        }
    }

    /// True between `start` and `stop`.
    pub fn is_running(&self) -> bool {
        self.poll_loop
            .lock()
            .as_ref()
            .map_or(false, |l| l.running.load(Ordering::SeqCst))
    }
}

impl Drop for QueueConsumer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::EventHandler;
    use crate::error::Result;
    use crate::event::{EventPayload, EventType};
    use crate::memory::MemoryGrid;
    use crate::producer::{EventProducer, QueueProducer, TopicProducer};
    use async_trait::async_trait;
    use std::collections::HashSet;

    struct Recorder {
        switch: Switch,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl EventHandler for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn event_type(&self) -> EventType {
            EventType::FeatureRepository
        }

        fn switch(&self) -> &Switch {
            &self.switch
        }

        async fn handle(&self, event: &Event) -> Result<()> {
            self.seen.lock().push(event.header.id.clone());
            Ok(())
        }
    }

    fn recorder() -> (Arc<EventDispatcher>, Arc<Recorder>) {
        let dispatcher = Arc::new(EventDispatcher::new());
        let recorder = Arc::new(Recorder {
            switch: Switch::new("recorder", SwitchStatus::On),
            seen: Mutex::new(Vec::new()),
        });
        dispatcher.register(recorder.clone());
        (dispatcher, recorder)
    }

    fn event() -> Event {
        Event::new(EventPayload::FeatureRepository {
            url: "mvn:repo".to_string(),
            installed: true,
        })
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_topic_delivery_to_other_nodes_only() {
        let grid = MemoryGrid::new();
        let a = Arc::new(grid.join("a", 1));
        let b = Arc::new(grid.join("b", 1));
        let store = Arc::new(ConfigStore::in_memory());

        let (disp_a, rec_a) = recorder();
        let (disp_b, rec_b) = recorder();
        let consumer_a = TopicConsumer::new(a.clone(), disp_a, store.clone());
        let consumer_b = TopicConsumer::new(b.clone(), disp_b, store.clone());
        consumer_a.start();
        consumer_b.start();

        let producer = TopicProducer::new(a.clone(), store);
        producer.produce(event()).unwrap();
        settle().await;

        assert!(rec_a.seen.lock().is_empty());
        assert_eq!(rec_b.seen.lock().len(), 1);
        assert_eq!(consumer_a.stats().filtered(), 1);
    }

    #[tokio::test]
    async fn test_post_publish_reaches_publisher() {
        let grid = MemoryGrid::new();
        let a = Arc::new(grid.join("a", 1));
        let store = Arc::new(ConfigStore::in_memory());
        let (dispatcher, rec) = recorder();
        let consumer = TopicConsumer::new(a.clone(), dispatcher, store.clone());
        consumer.start();

        TopicProducer::new(a.clone(), store)
            .produce(event().post_publish())
            .unwrap();
        settle().await;
        assert_eq!(rec.seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_destination_filter() {
        let grid = MemoryGrid::new();
        let a = Arc::new(grid.join("a", 1));
        let b = Arc::new(grid.join("b", 1));
        let c = Arc::new(grid.join("c", 1));
        let store = Arc::new(ConfigStore::in_memory());

        let (disp_b, rec_b) = recorder();
        let (disp_c, rec_c) = recorder();
        let consumer_b = TopicConsumer::new(b.clone(), disp_b, store.clone());
        let consumer_c = TopicConsumer::new(c.clone(), disp_c, store.clone());
        consumer_b.start();
        consumer_c.start();

        let mut only_b = HashSet::new();
        only_b.insert(b.local_node());
        TopicProducer::new(a.clone(), store)
            .produce(event().with_destinations(only_b))
            .unwrap();
        settle().await;

        assert_eq!(rec_b.seen.lock().len(), 1);
        assert!(rec_c.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_consumer_switch_and_force() {
        let grid = MemoryGrid::new();
        let a = Arc::new(grid.join("a", 1));
        let b = Arc::new(grid.join("b", 1));
        let producer_store = Arc::new(ConfigStore::in_memory());
        let consumer_store = Arc::new(ConfigStore::in_memory());
        consumer_store
            .set_property(NODE_PID, CONSUMER_KEY, "false")
            .unwrap();

        let (dispatcher, rec) = recorder();
        let consumer = TopicConsumer::new(b.clone(), dispatcher, consumer_store.clone());
        consumer.start();
        let producer = TopicProducer::new(a.clone(), producer_store);

        producer.produce(event()).unwrap();
        settle().await;
        assert!(rec.seen.lock().is_empty());

        producer.produce(event().forced(true)).unwrap();
        settle().await;
        assert_eq!(rec.seen.lock().len(), 1);

        consumer_store
            .set_property(NODE_PID, CONSUMER_KEY, "true")
            .unwrap();
        producer.produce(event()).unwrap();
        settle().await;
        assert_eq!(rec.seen.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_queue_item_consumed_once() {
        let grid = MemoryGrid::new();
        let a = Arc::new(grid.join("a", 1));
        let b = Arc::new(grid.join("b", 1));
        let c = Arc::new(grid.join("c", 1));
        let store = Arc::new(ConfigStore::in_memory());

        let (disp_b, rec_b) = recorder();
        let (disp_c, rec_c) = recorder();
        let interval = Duration::from_millis(20);
        let consumer_b =
            QueueConsumer::with_queue(b.clone(), disp_b, store.clone(), EVENT_QUEUE, interval);
        let consumer_c =
            QueueConsumer::with_queue(c.clone(), disp_c, store.clone(), EVENT_QUEUE, interval);
        consumer_b.start();
        consumer_c.start();

        QueueProducer::new(a.clone(), store).produce(event()).unwrap();
        settle().await;

        let total = rec_b.seen.lock().len() + rec_c.seen.lock().len();
        assert_eq!(total, 1);
        consumer_b.shutdown().await;
        consumer_c.shutdown().await;
    }

    #[tokio::test]
    async fn test_queue_consumer_stops_within_poll_interval() {
        let grid = MemoryGrid::new();
        let a = Arc::new(grid.join("a", 1));
        let (dispatcher, _rec) = recorder();
        let consumer = QueueConsumer::with_queue(
            a,
            dispatcher,
            Arc::new(ConfigStore::in_memory()),
            EVENT_QUEUE,
            Duration::from_millis(50),
        );
        consumer.start();
        consumer.start();
        assert!(consumer.is_running());

        consumer.stop();
        consumer.stop();
        assert!(!consumer.is_running());
        let stopped = tokio::time::timeout(Duration::from_millis(500), consumer.shutdown()).await;
        assert!(stopped.is_ok());
    }
}
