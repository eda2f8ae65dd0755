//! Wiring of one cellar node.
//!
//! Components are built leaf-first and receive their collaborators through
//! their constructors: configuration store, clusters, policy, registries,
//! group manager, transports. Domain adapters are registered between
//! [`CellarNode::init`] and [`CellarNode::start`].

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::admin::ClusterAdmin;
use crate::cluster::Cluster;
use crate::cluster_manager::ClusterManager;
use crate::config::CellarConfig;
use crate::config_store::ConfigStore;
use crate::configuration::{NodeConfig, DEFAULT_GROUP_NAME, NODE_PID};
use crate::consumer::{QueueConsumer, TopicConsumer};
use crate::dispatcher::{CommandDispatcher, CommandHandler, EventDispatcher, EventHandler};
use crate::error::Result;
use crate::execution::DistributedExecutionContext;
use crate::group_manager::GroupManager;
use crate::handlers::core_handlers;
use crate::node::Node;
use crate::producer::{EventProducer, QueueProducer, TopicProducer};
use crate::substrate::Substrate;
use crate::support::CellarSupport;
use crate::synchronizer::{SyncReport, Synchronizer, SynchronizerRegistry};

/// A component with background tasks bound to the node's lifetime.
pub trait NodeService: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Stops the component's tasks. Safe to call more than once.
    fn stop(&self);
}

/// A fully wired node.
pub struct CellarNode {
    config: CellarConfig,
    substrate: Arc<dyn Substrate>,
    store: Arc<ConfigStore>,
    clusters: Arc<ClusterManager>,
    support: Arc<CellarSupport>,
    synchronizers: Arc<SynchronizerRegistry>,
    event_dispatcher: Arc<EventDispatcher>,
    command_dispatcher: Arc<CommandDispatcher>,
    groups: Arc<GroupManager>,
    execution: DistributedExecutionContext,
    topic_producer: Arc<TopicProducer>,
    queue_producer: Arc<QueueProducer>,
    topic_consumer: TopicConsumer,
    queue_consumer: QueueConsumer,
    services: Mutex<Vec<Arc<dyn NodeService>>>,
    started: AtomicBool,
}

impl CellarNode {
    /// Builds a node over a joined substrate and an opened configuration store.
    ///
    /// On first start the node PID is seeded from the bootstrap groups.
    pub fn init(
        config: CellarConfig,
        substrate: Arc<dyn Substrate>,
        store: Arc<ConfigStore>,
    ) -> Result<Self> {
        if store.get(NODE_PID).is_none() {
            let mut node_config = NodeConfig::default();
            node_config.groups.extend(config.groups.iter().cloned());
            node_config.groups.insert(DEFAULT_GROUP_NAME.to_string());
            store.update(NODE_PID, node_config.to_properties())?;
        }

        let clusters = Arc::new(ClusterManager::new(substrate.clone(), store.clone()));
        let cluster = clusters.default_cluster();
        let support = Arc::new(CellarSupport::new(store.clone()));
        let synchronizers = Arc::new(SynchronizerRegistry::new());
        let event_dispatcher = Arc::new(EventDispatcher::new());
        let command_dispatcher = Arc::new(CommandDispatcher::new(substrate.local_node()));
        let groups = Arc::new(GroupManager::new(cluster, synchronizers.clone()));
        let execution =
            DistributedExecutionContext::with_timeout(substrate.clone(), config.rpc_timeout());

        let topic_producer = Arc::new(TopicProducer::with_topic(
            substrate.clone(),
            store.clone(),
            config.topic.clone(),
        ));
        let queue_producer = Arc::new(QueueProducer::with_queue(
            substrate.clone(),
            store.clone(),
            config.queue.clone(),
        ));
        let topic_consumer = TopicConsumer::with_topic(
            substrate.clone(),
            event_dispatcher.clone(),
            store.clone(),
            config.topic.clone(),
        );
        let queue_consumer = QueueConsumer::with_queue(
            substrate.clone(),
            event_dispatcher.clone(),
            store.clone(),
            config.queue.clone(),
            config.poll_interval(),
        );

        for handler in core_handlers(
            groups.clone(),
            event_dispatcher.clone(),
            clusters.clone(),
            store.clone(),
        ) {
            command_dispatcher.register(handler);
        }

        Ok(Self {
            config,
            substrate,
            store,
            clusters,
            support,
            synchronizers,
            event_dispatcher,
            command_dispatcher,
            groups,
            execution,
            topic_producer,
            queue_producer,
            topic_consumer,
            queue_consumer,
            services: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }

    /// Builds a node, opening the configuration store named by the bootstrap
    /// file or an in-memory one.
    pub fn open(config: CellarConfig, substrate: Arc<dyn Substrate>) -> Result<Self> {
        let store = match &config.storage_dir {
            Some(dir) => ConfigStore::open(dir)?,
            None => ConfigStore::in_memory(),
        };
        Self::init(config, substrate, Arc::new(store))
    }

    /// Registers a domain event handler.
    pub fn register_event_handler(&self, handler: Arc<dyn EventHandler>) {
        self.event_dispatcher.register(handler);
    }

    /// Registers a domain synchronizer.
    pub fn register_synchronizer(&self, synchronizer: Arc<dyn Synchronizer>) {
        self.synchronizers.register(synchronizer);
    }

    /// Registers an additional command handler.
    pub fn register_command_handler(&self, handler: Arc<dyn CommandHandler>) {
        self.command_dispatcher.register(handler);
    }

    /// Registers a component stopped on [`CellarNode::shutdown`].
    pub fn register_service(&self, service: Arc<dyn NodeService>) {
        debug!(service = service.name(), "service registered");
        self.services.lock().push(service);
    }

    /// Starts serving: commands, consumers, group watchers, then one
    /// synchronization pass over every local group.
    pub async fn start(&self) -> Result<SyncReport> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(SyncReport::default());
        }
        self.substrate
            .register_executor(self.command_dispatcher.clone());
        self.topic_consumer.start();
        self.queue_consumer.start();
        self.groups.init().await?;
        self.groups.start();
        let report = self.groups.synchronize_all().await;
        info!(
            node = %self.local_node(),
            groups = self.groups.list_group_names().len(),
            changes = report.changes(),
            "cellar node started"
        );
        Ok(report)
    }

    /// Stops every task and leaves the cluster.
    pub async fn shutdown(&self) -> Result<()> {
        if !self.started.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.groups.stop();
        for service in self.services.lock().iter() {
            service.stop();
            debug!(service = service.name(), "service stopped");
        }
        self.topic_consumer.stop();
        self.queue_consumer.shutdown().await;
        self.substrate.leave().await?;
        info!(node = %self.local_node(), "cellar node stopped");
        Ok(())
    }

    /// Identity of the local process.
    pub fn local_node(&self) -> Node {
        self.substrate.local_node()
    }

    /// Bootstrap settings.
    pub fn config(&self) -> &CellarConfig {
        &self.config
    }

    /// Node-local configuration store.
    pub fn store(&self) -> &Arc<ConfigStore> {
        &self.store
    }

    /// Underlying substrate.
    pub fn substrate(&self) -> &Arc<dyn Substrate> {
        &self.substrate
    }

    /// Joined logical clusters.
    pub fn clusters(&self) -> &Arc<ClusterManager> {
        &self.clusters
    }

    /// The default logical cluster.
    pub fn cluster(&self) -> Arc<Cluster> {
        self.clusters.default_cluster()
    }

    /// Policy engine.
    pub fn support(&self) -> &Arc<CellarSupport> {
        &self.support
    }

    /// Group manager.
    pub fn groups(&self) -> &Arc<GroupManager> {
        &self.groups
    }

    /// Event handler registry.
    pub fn event_dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.event_dispatcher
    }

    /// Synchronizer registry.
    pub fn synchronizers(&self) -> &Arc<SynchronizerRegistry> {
        &self.synchronizers
    }

    /// Command execution context.
    pub fn execution(&self) -> &DistributedExecutionContext {
        &self.execution
    }

    /// Broadcast producer.
    pub fn producer(&self) -> Arc<dyn EventProducer> {
        self.topic_producer.clone()
    }

    /// Point-to-point producer.
    pub fn queue_producer(&self) -> Arc<dyn EventProducer> {
        self.queue_producer.clone()
    }

    /// Topic consumer.
    pub fn topic_consumer(&self) -> &TopicConsumer {
        &self.topic_consumer
    }

    /// Queue consumer.
    pub fn queue_consumer(&self) -> &QueueConsumer {
        &self.queue_consumer
    }

    /// Administrative facade.
    pub fn admin(&self) -> ClusterAdmin {
        ClusterAdmin::new(
            self.clusters.clone(),
            self.groups.clone(),
            self.execution.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryGrid;

    #[tokio::test]
    async fn test_init_seeds_node_configuration() {
        let grid = MemoryGrid::new();
        let config = CellarConfig {
            groups: vec!["east".to_string()],
            ..CellarConfig::default()
        };
        let node = CellarNode::open(config, Arc::new(grid.join("a", 5701))).unwrap();
        let groups = node.groups().node_config().groups;
        assert!(groups.contains("east"));
        assert!(groups.contains(DEFAULT_GROUP_NAME));
    }

    #[tokio::test]
    async fn test_start_joins_groups_and_shutdown_leaves() {
        let grid = MemoryGrid::new();
        let node = CellarNode::open(CellarConfig::default(), Arc::new(grid.join("a", 5701))).unwrap();
        node.start().await.unwrap();
        assert!(node.groups().is_local_group(DEFAULT_GROUP_NAME).unwrap());
        assert!(node.topic_consumer().is_running());

        node.shutdown().await.unwrap();
        assert!(grid.members().is_empty());
        assert!(!node.queue_consumer().is_running());
    }

    #[derive(Default)]
    struct StopCounter {
        stops: std::sync::atomic::AtomicUsize,
    }

    impl NodeService for StopCounter {
        fn name(&self) -> &str {
            "counter"
        }

        fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_shutdown_stops_registered_services() {
        let grid = MemoryGrid::new();
        let node = CellarNode::open(CellarConfig::default(), Arc::new(grid.join("a", 5701))).unwrap();
        let service = Arc::new(StopCounter::default());
        node.register_service(service.clone());
        node.start().await.unwrap();

        node.shutdown().await.unwrap();
        node.shutdown().await.unwrap();
        assert_eq!(service.stops.load(Ordering::SeqCst), 1);
    }
}
