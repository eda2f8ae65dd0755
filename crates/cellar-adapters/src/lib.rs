#![warn(missing_docs)]

//! Domain adapters for cellar: features, bundles, configuration PIDs and
//! remote service endpoints.
//!
//! Each adapter pairs a [`Synchronizer`](cellar_core::Synchronizer) with an
//! event handler and an entry point for local or administrative changes, and
//! is wired onto a [`CellarNode`](cellar_core::CellarNode) by its `register`
//! function before the node starts.

pub mod bundle;
pub mod config;
pub mod context;
pub mod endpoint;
pub mod error;
pub mod features;

pub use bundle::{BundleService, BundleState, BundleSupport, MemoryBundleService};
pub use config::ConfigurationSupport;
pub use context::AdapterContext;
pub use endpoint::{EndpointDescription, EndpointRegistry};
pub use error::{AdapterError, Result};
pub use features::{FeatureInfo, FeaturesService, FeaturesSupport, MemoryFeaturesService};
