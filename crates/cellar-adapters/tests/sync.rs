//! Adapter scenarios across nodes of one in-process grid.

mod common;

use cellar_adapters::{BundleState, FeaturesService, BundleService};
use cellar_core::configuration::{
    handler_key, list_key, Category, Direction, ListType, DEFAULT_GROUP_NAME, GROUPS_PID, NODE_PID,
};
use cellar_core::event::BundleStatus;
use common::{eventually, settle, AdaptedCluster};

const SHELL: &str = "mvn:org.example/shell/1.0";

#[tokio::test]
async fn test_eventadmin_pull_installs_once() {
    let cluster = AdaptedCluster::start(2).await;
    let (x, y) = (cluster.node(0), cluster.node(1));
    for n in [x, y] {
        for direction in [Direction::Inbound, Direction::Outbound] {
            n.node
                .store()
                .set_property(
                    GROUPS_PID,
                    &list_key(DEFAULT_GROUP_NAME, Category::Features, ListType::Whitelist, direction),
                    "*",
                )
                .unwrap();
        }
    }

    x.features.install("eventadmin", "1.0").await.unwrap();
    let pushed = x.node.groups().synchronize(DEFAULT_GROUP_NAME).await;
    assert_eq!(pushed.pushed, 1);

    let first = y.node.groups().synchronize(DEFAULT_GROUP_NAME).await;
    assert_eq!(first.pulled, 1);
    assert!(y.features.is_installed("eventadmin", "1.0").await.unwrap());
    let operations = y.features.operations();

    let second = y.node.groups().synchronize(DEFAULT_GROUP_NAME).await;
    assert!(second.is_noop());
    assert_eq!(y.features.operations(), operations);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_startup_sync_pulls_existing_state() {
    let cluster = AdaptedCluster::build(2).await;
    let (x, y) = (cluster.node(0), cluster.node(1));
    x.features.install("eventadmin", "1.0").await.unwrap();
    x.node.start().await.unwrap();

    let report = y.node.start().await.unwrap();
    assert!(report.pulled >= 1);
    assert!(y.features.is_installed("eventadmin", "1.0").await.unwrap());
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_cluster_feature_install_reaches_group() {
    let cluster = AdaptedCluster::start(3).await;
    cluster
        .node(0)
        .feature_support
        .install(DEFAULT_GROUP_NAME, "webconsole", "2.0", false)
        .await
        .unwrap();

    for i in 1..3 {
        let features = cluster.node(i).features.clone();
        assert!(eventually(|| {
            let features = features.clone();
            async move { features.is_installed("webconsole", "2.0").await.unwrap() }
        })
        .await);
    }
    assert!(!cluster
        .node(0)
        .features
        .is_installed("webconsole", "2.0")
        .await
        .unwrap());
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_handler_switch_off_unless_forced() {
    let cluster = AdaptedCluster::start(2).await;
    let y = cluster.node(1);
    y.node
        .store()
        .set_property(NODE_PID, &handler_key("features"), "false")
        .unwrap();

    let support = &cluster.node(0).feature_support;
    support
        .install(DEFAULT_GROUP_NAME, "webconsole", "2.0", false)
        .await
        .unwrap();
    settle().await;
    assert!(!y.features.is_installed("webconsole", "2.0").await.unwrap());

    support
        .install(DEFAULT_GROUP_NAME, "scheduler", "1.1", true)
        .await
        .unwrap();
    let features = y.features.clone();
    assert!(eventually(|| {
        let features = features.clone();
        async move { features.is_installed("scheduler", "1.1").await.unwrap() }
    })
    .await);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_join_group_pulls_group_state() {
    let cluster = AdaptedCluster::start(2).await;
    let (x, y) = (cluster.node(0), cluster.node(1));
    let admin = x.node.admin();
    admin.join_group("east", &[]).await.unwrap();

    x.feature_support
        .install("east", "camel", "3.0", false)
        .await
        .unwrap();
    settle().await;
    assert!(!y.features.is_installed("camel", "3.0").await.unwrap());

    let results = admin
        .join_group("east", &[y.node.local_node().id().to_string()])
        .await
        .unwrap();
    assert!(results.values().all(|r| r.successful));
    assert!(y.features.is_installed("camel", "3.0").await.unwrap());
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_configuration_change_propagates() {
    let cluster = AdaptedCluster::start(2).await;
    let (x, y) = (cluster.node(0), cluster.node(1));
    let props = [("port".to_string(), "8181".to_string())].into_iter().collect();
    x.node.store().update("org.example.app", props).unwrap();

    let store = y.node.store().clone();
    assert!(eventually(|| {
        let store = store.clone();
        async move { store.get_property("org.example.app", "port").as_deref() == Some("8181") }
    })
    .await);

    x.node.store().delete("org.example.app").unwrap();
    let store = y.node.store().clone();
    assert!(eventually(|| {
        let store = store.clone();
        async move { store.get("org.example.app").is_none() }
    })
    .await);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_internal_configuration_stays_local() {
    let cluster = AdaptedCluster::start(2).await;
    cluster
        .node(0)
        .node
        .store()
        .set_property(NODE_PID, "custom", "x")
        .unwrap();
    settle().await;
    assert!(cluster
        .node(1)
        .node
        .store()
        .get_property(NODE_PID, "custom")
        .is_none());
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_bundle_lifecycle_propagates() {
    let cluster = AdaptedCluster::start(2).await;
    let (x, y) = (cluster.node(0), cluster.node(1));
    x.bundle_support
        .install(DEFAULT_GROUP_NAME, "shell", "1.0", SHELL, false)
        .await
        .unwrap();

    let bundles = y.bundles.clone();
    assert!(eventually(|| {
        let bundles = bundles.clone();
        async move { bundles.bundle("shell", "1.0").await.unwrap().is_some() }
    })
    .await);

    let active = BundleState::new("shell", "1.0", SHELL, BundleStatus::Active);
    x.bundle_support
        .update(DEFAULT_GROUP_NAME, active, false)
        .await
        .unwrap();
    let bundles = y.bundles.clone();
    assert!(eventually(|| {
        let bundles = bundles.clone();
        async move {
            bundles
                .bundle("shell", "1.0")
                .await
                .unwrap()
                .map(|b| b.status == BundleStatus::Active)
                .unwrap_or(false)
        }
    })
    .await);

    x.bundle_support
        .uninstall(DEFAULT_GROUP_NAME, "shell", "1.0", false)
        .await
        .unwrap();
    let bundles = y.bundles.clone();
    assert!(eventually(|| {
        let bundles = bundles.clone();
        async move { bundles.bundle("shell", "1.0").await.unwrap().is_none() }
    })
    .await);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_departed_node_pruned_from_endpoints() {
    let cluster = AdaptedCluster::start(3).await;
    cluster
        .node(0)
        .endpoints
        .export("org.example.Greeter", "1.0")
        .await
        .unwrap();
    cluster
        .node(2)
        .endpoints
        .export("org.example.Greeter", "1.0")
        .await
        .unwrap();
    cluster
        .node(2)
        .endpoints
        .export("org.example.Clock", "2.0")
        .await
        .unwrap();

    let departed = cluster.node(2).node.local_node();
    cluster.node(2).node.shutdown().await.unwrap();
    assert!(!cluster.node(2).endpoints.is_running());

    let registry = cluster.node(1).endpoints.clone();
    assert!(eventually(|| {
        let registry = registry.clone();
        let departed = departed.clone();
        async move {
            let endpoints = registry.endpoints().unwrap();
            endpoints.len() == 1 && !endpoints[0].nodes.contains(&departed)
        }
    })
    .await);
    cluster.shutdown().await;
}
