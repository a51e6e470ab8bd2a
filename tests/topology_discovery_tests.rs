/// Topology discovery tests
///
/// Tests for seed-list discovery, etag handling, and server-hinted
/// topology refresh against an in-process mock cluster.
/// Run with: cargo test --test topology_discovery_tests

mod support;

use std::time::Duration;

use clusterdoc::{ClientConfig, ClientError, RequestExecutor};
use clusterdoc::executor::GetStatisticsCommand;
use support::{topology_body, wait_until, MockNode};

#[tokio::test]
async fn test_discovery_skips_dead_seed() {
    let node = MockNode::start("A").await;
    node.set_topology(topology_body(1, "northwind", &[&node]));

    // nothing listens on the first seed
    let seeds = ["http://127.0.0.1:1".to_string(), node.url().to_string()];
    let executor = RequestExecutor::create(&seeds, "northwind", ClientConfig::new())
        .await
        .unwrap();

    assert_eq!(executor.topology_etag(), 1);
    let nodes = executor.topology_nodes();
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].url(), node.url());
    assert_eq!(nodes[0].cluster_tag(), "A");
}

#[tokio::test]
async fn test_discovery_failure_is_retried_on_first_request() {
    let node = MockNode::start("A").await;
    node.set_topology(topology_body(1, "northwind", &[&node]));
    node.set_failing(true);

    // every seed is down, yet the executor is handed out
    let seeds = [node.url().to_string()];
    let executor = RequestExecutor::create(&seeds, "northwind", ClientConfig::new())
        .await
        .unwrap();
    assert!(executor.topology().is_none());

    // the node comes back before the first real request
    node.set_failing(false);
    let command = GetStatisticsCommand::new();
    executor.execute(&command).await.unwrap();
    assert_eq!(executor.topology_etag(), 1);
}

#[tokio::test]
async fn test_missing_database_stops_the_seed_scan() {
    let broken = MockNode::start("A").await;
    broken.set_missing_database(true);
    let healthy = MockNode::start("B").await;
    healthy.set_topology(topology_body(1, "northwind", &[&healthy]));

    let seeds = [broken.url().to_string(), healthy.url().to_string()];
    let executor = RequestExecutor::create(&seeds, "northwind", ClientConfig::new())
        .await
        .unwrap();

    let command = GetStatisticsCommand::new();
    let result = executor.execute(&command).await;
    assert!(matches!(result, Err(ClientError::DatabaseDoesNotExist(_))));

    // later seeds are never consulted for a database that does not exist
    assert_eq!(healthy.topology_hits(), 0);
}

#[tokio::test]
async fn test_refresh_header_triggers_background_update() {
    let node = MockNode::start("A").await;
    node.set_topology(topology_body(1, "northwind", &[&node]));

    let seeds = [node.url().to_string()];
    let executor = RequestExecutor::create(&seeds, "northwind", ClientConfig::new())
        .await
        .unwrap();
    assert_eq!(executor.topology_etag(), 1);

    // the cluster moved on; the server starts hinting at a refresh
    node.set_topology(topology_body(2, "northwind", &[&node]));
    node.set_request_refresh(true);

    let command = GetStatisticsCommand::new();
    executor.execute(&command).await.unwrap();

    let updated = wait_until(Duration::from_secs(2), || executor.topology_etag() == 2).await;
    assert!(updated, "refresh hint should bump the topology etag");
}

#[tokio::test]
async fn test_stale_topology_is_discarded() {
    let node = MockNode::start("A").await;
    node.set_topology(topology_body(5, "northwind", &[&node]));

    let seeds = [node.url().to_string()];
    let executor = RequestExecutor::create(&seeds, "northwind", ClientConfig::new())
        .await
        .unwrap();
    assert_eq!(executor.topology_etag(), 5);

    // the node regresses to an older document
    node.set_topology(topology_body(4, "northwind", &[&node]));
    let (_, source) = executor.preferred_node().unwrap();
    let accepted = executor.update_topology(source, false).await.unwrap();

    assert!(!accepted);
    assert_eq!(executor.topology_etag(), 5);
}

#[tokio::test]
async fn test_single_node_mode_sends_no_topology_requests() {
    let node = MockNode::start("A").await;
    node.set_topology(topology_body(1, "northwind", &[&node]));

    let executor =
        RequestExecutor::create_for_single_node(node.url(), "northwind", ClientConfig::new())
            .unwrap();

    let command = GetStatisticsCommand::new();
    executor.execute(&command).await.unwrap();

    assert_eq!(node.topology_hits(), 0);
    assert_eq!(node.stats_hits(), 1);
    assert_eq!(executor.topology_etag(), -2);
}
