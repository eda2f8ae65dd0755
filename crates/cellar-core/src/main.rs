#![warn(missing_docs)]

//! Boots an in-process cellar cluster and keeps it running until Ctrl-C.

use anyhow::{anyhow, Result};
use cellar_core::{CellarConfig, CellarNode, MemoryGrid};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "cellar-node")]
#[command(about = "Cellar cluster node over an in-process grid", long_about = None)]
struct Cli {
    /// Bootstrap file (.toml or .json).
    #[arg(short, long, env = "CELLAR_CONFIG")]
    config: Option<PathBuf>,

    /// Number of nodes to start.
    #[arg(short, long, default_value = "3")]
    nodes: u16,

    /// Groups every node joins besides the default group.
    #[arg(short, long, value_delimiter = ',')]
    groups: Vec<String>,
}

/// Port of the `index`-th local node, counting up from the bootstrap port.
fn node_port(base: u16, index: u16) -> Result<u16> {
    base.checked_add(index).ok_or_else(|| {
        anyhow!(
            "node {} would listen past port {} (base port {})",
            index,
            u16::MAX,
            base
        )
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut base = match &cli.config {
        Some(path) if path.exists() => CellarConfig::from_file(path)?,
        Some(path) => {
            tracing::warn!(path = %path.display(), "config file not found, using defaults");
            CellarConfig::default()
        }
        None => CellarConfig::default(),
    };
    base.groups.extend(cli.groups.iter().cloned());

    if let Some(last) = cli.nodes.checked_sub(1) {
        node_port(base.port, last)?;
    }

    let grid = MemoryGrid::new();
    let mut nodes = Vec::with_capacity(cli.nodes as usize);
    for i in 0..cli.nodes {
        let mut config = base.clone();
        config.port = node_port(base.port, i)?;
        config.storage_dir = base.storage_dir.as_ref().map(|d| d.join(format!("node{}", i)));
        let member = grid.join(&config.host, config.port);
        let node = CellarNode::open(config, Arc::new(member))?;
        node.start().await?;
        nodes.push(node);
    }

    if let Some(first) = nodes.first() {
        for (name, group) in first.admin().list_groups()? {
            let members: Vec<String> = group.sorted_nodes().iter().map(|n| n.name()).collect();
            println!("group {}: {}", name, members.join(", "));
        }
        for node in first.admin().list_nodes() {
            println!("node {}", node);
        }
    }

    tracing::info!(nodes = nodes.len(), "cluster running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    for node in &nodes {
        if let Err(e) = node.shutdown().await {
            tracing::warn!(node = %node.local_node(), error = %e, "shutdown failed");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_port_counts_up() {
        assert_eq!(node_port(5701, 0).unwrap(), 5701);
        assert_eq!(node_port(5701, 2).unwrap(), 5703);
        assert_eq!(node_port(u16::MAX - 1, 1).unwrap(), u16::MAX);
    }

    #[test]
    fn test_node_port_overflow_is_an_error() {
        let err = node_port(u16::MAX - 1, 2).unwrap_err();
        assert!(err.to_string().contains("base port 65534"));
    }
}
