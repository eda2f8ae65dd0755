#![warn(missing_docs)]

//! Cellar core: cluster groups, event dispatch, distributed execution and
//! pull/push synchronization over a pluggable clustering substrate.

pub mod admin;
pub mod cluster;
pub mod cluster_manager;
pub mod collections;
/// Bootstrap configuration file.
pub mod config;
pub mod config_store;
pub mod configuration;
pub mod consumer;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod execution;
pub mod group;
pub mod group_manager;
pub mod handlers;
pub mod memory;
pub mod node;
pub mod producer;
pub mod runtime;
pub mod substrate;
pub mod support;
pub mod switch;
pub mod synchronizer;

pub use admin::ClusterAdmin;
pub use cluster::Cluster;
pub use cluster_manager::ClusterManager;
pub use config::CellarConfig;
pub use config_store::{ConfigStore, Properties};
pub use dispatcher::{CommandHandler, EventDispatcher, EventHandler};
pub use error::{CellarError, Result};
pub use event::{Command, CommandResult, Event, EventPayload, EventType};
pub use execution::DistributedExecutionContext;
pub use group::Group;
pub use group_manager::GroupManager;
pub use memory::{MemoryGrid, MemoryMember};
pub use node::Node;
pub use producer::EventProducer;
pub use runtime::{CellarNode, NodeService};
pub use substrate::Substrate;
pub use support::CellarSupport;
pub use switch::{Switch, SwitchStatus};
pub use synchronizer::{SyncReport, Synchronizer, SynchronizerRegistry};
