//! Sending half of the event transport.
//!
//! A [`TopicProducer`] broadcasts to every subscribed node; a [`QueueProducer`]
//! enqueues for exactly one consumer. Both stamp the local node as source and
//! drop the event when the producer switch is OFF, unless the event is forced.

use std::sync::Arc;
use tracing::{debug, trace};

use crate::config_store::ConfigStore;
use crate::configuration::{EVENT_QUEUE, EVENT_TOPIC, NODE_PID, PRODUCER_KEY};
use crate::error::Result;
use crate::event::Event;
use crate::substrate::Substrate;
use crate::switch::{Switch, SwitchStatus};

/// Sends events to other nodes.
pub trait EventProducer: Send + Sync {
    /// Producer switch.
    fn switch(&self) -> &Switch;

    /// Sends an event. Returns false when the switch suppressed it.
    fn produce(&self, event: Event) -> Result<bool>;
}

fn producer_switch(store: Arc<ConfigStore>) -> Switch {
    Switch::backed_by("producer", store, NODE_PID, PRODUCER_KEY, SwitchStatus::On)
}

/// Applies the switch gate and stamps the source. `None` means suppressed.
fn prepare(substrate: &dyn Substrate, switch: &Switch, mut event: Event) -> Result<Option<Vec<u8>>> {
    if !event.header.force && !switch.is_on() {
        debug!(id = %event.header.id, event_type = %event.event_type(), "producer is OFF, event dropped");
        return Ok(None);
    }
    event.header.source_node = Some(substrate.local_node());
    Ok(Some(event.encode()?))
}

/// Broadcast producer over the event topic.
pub struct TopicProducer {
    substrate: Arc<dyn Substrate>,
    topic: String,
    switch: Switch,
}

impl TopicProducer {
    /// Creates a producer on the well-known event topic.
    pub fn new(substrate: Arc<dyn Substrate>, store: Arc<ConfigStore>) -> Self {
        Self::with_topic(substrate, store, EVENT_TOPIC)
    }

    /// Creates a producer on a named topic.
    pub fn with_topic(
        substrate: Arc<dyn Substrate>,
        store: Arc<ConfigStore>,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            substrate,
            topic: topic.into(),
            switch: producer_switch(store),
        }
    }
}

impl EventProducer for TopicProducer {
    fn switch(&self) -> &Switch {
        &self.switch
    }

    fn produce(&self, event: Event) -> Result<bool> {
        let id = event.header.id.clone();
        match prepare(self.substrate.as_ref(), &self.switch, event)? {
            Some(bytes) => {
                self.substrate.publish(&self.topic, bytes)?;
                trace!(topic = %self.topic, id = %id, "event published");
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Point-to-point producer over the event queue.
pub struct QueueProducer {
    substrate: Arc<dyn Substrate>,
    queue: String,
    switch: Switch,
}

impl QueueProducer {
    /// Creates a producer on the well-known event queue.
    pub fn new(substrate: Arc<dyn Substrate>, store: Arc<ConfigStore>) -> Self {
        Self::with_queue(substrate, store, EVENT_QUEUE)
    }

    /// Creates a producer on a named queue.
    pub fn with_queue(
        substrate: Arc<dyn Substrate>,
        store: Arc<ConfigStore>,
        queue: impl Into<String>,
    ) -> Self {
        Self {
            substrate,
            queue: queue.into(),
            switch: producer_switch(store),
        }
    }
}

impl EventProducer for QueueProducer {
    fn switch(&self) -> &Switch {
        &self.switch
    }

    fn produce(&self, event: Event) -> Result<bool> {
        let id = event.header.id.clone();
        match prepare(self.substrate.as_ref(), &self.switch, event)? {
            Some(bytes) => {
                self.substrate.offer(&self.queue, bytes)?;
                trace!(queue = %self.queue, id = %id, "event enqueued");
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventPayload;
    use crate::memory::MemoryGrid;
    use std::time::Duration;

    fn event() -> Event {
        Event::new(EventPayload::Features {
            name: "eventadmin".to_string(),
            version: "1.0".to_string(),
            installed: true,
        })
    }

    #[tokio::test]
    async fn test_topic_producer_stamps_source() {
        let grid = MemoryGrid::new();
        let member = Arc::new(grid.join("a", 1));
        let mut rx = member.subscribe_topic(EVENT_TOPIC);
        let producer = TopicProducer::new(member.clone(), Arc::new(ConfigStore::in_memory()));

        assert!(producer.produce(event()).unwrap());
        let received = Event::decode(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(received.header.source_node, Some(member.local_node()));
    }

    #[tokio::test]
    async fn test_switched_off_producer_drops_unforced() {
        let grid = MemoryGrid::new();
        let member = Arc::new(grid.join("a", 1));
        let store = Arc::new(ConfigStore::in_memory());
        store.set_property(NODE_PID, PRODUCER_KEY, "false").unwrap();
        let producer = QueueProducer::new(member.clone(), store);

        assert!(!producer.produce(event()).unwrap());
        assert!(member
            .poll(EVENT_QUEUE, Duration::from_millis(20))
            .await
            .unwrap()
            .is_none());

        assert!(producer.produce(event().forced(true)).unwrap());
        assert!(member
            .poll(EVENT_QUEUE, Duration::from_millis(20))
            .await
            .unwrap()
            .is_some());
    }
}
