//! End-to-end coordinator tests, driven against the public `Coordinator`
//! API with an in-process `MockProxyClient` pool (no real network).

use std::collections::HashMap;
use std::sync::Arc;

use lrc_coordinator::adapters::{InMemoryEventCollector, MockProxyClient};
use lrc_coordinator::domain::model::{
    Cluster, ClusterId, EcSchema, EncodeType, MultiStripePlacement, Node, NodeId, Operation,
    SingleStripePlacement,
};
use lrc_coordinator::domain::ports::ProxyClient;
use lrc_coordinator::merge::PollConfig;
use lrc_coordinator::rng;
use lrc_coordinator::state::Tables;
use lrc_coordinator::topology::ProxyPool;
use lrc_coordinator::Coordinator;

/// `num_clusters` clusters of `nodes_per_cluster` nodes each, with a mock
/// proxy stub (always reports `checkStep` done) behind every cluster.
fn topology_and_proxies(
    num_clusters: u32,
    nodes_per_cluster: u32,
) -> (HashMap<ClusterId, Cluster>, HashMap<NodeId, Node>, ProxyPool) {
    let mut clusters = HashMap::new();
    let mut nodes = HashMap::new();
    let mut stubs: HashMap<ClusterId, Arc<dyn ProxyClient>> = HashMap::new();
    let mut next_node = 0u32;
    for c in 0..num_clusters {
        let mut node_ids = Vec::new();
        for _ in 0..nodes_per_cluster {
            nodes.insert(
                next_node,
                Node {
                    node_id: next_node,
                    endpoint: format!("10.0.{c}.{next_node}:9000"),
                    cluster_id: c,
                    stripe_block_counts: HashMap::new(),
                },
            );
            node_ids.push(next_node);
            next_node += 1;
        }
        clusters.insert(
            c,
            Cluster {
                cluster_id: c,
                proxy_endpoint: format!("10.1.0.{c}:9100"),
                node_ids,
                blocks: Vec::new(),
                stripes: Default::default(),
            },
        );
        let mock = Arc::new(MockProxyClient::new());
        mock.set_step_done(true);
        stubs.insert(c, mock);
    }
    (clusters, nodes, ProxyPool::from_stubs(stubs))
}

fn scenario_schema() -> EcSchema {
    EcSchema {
        k: 8,
        g: 2,
        l: 2,
        b: 4,
        x: 2,
        encode_type: EncodeType::AzureLrc,
        single_stripe_placement: SingleStripePlacement::Optimal,
        multi_stripe_placement: MultiStripePlacement::Dis,
        partial_decoding: false,
    }
}

fn scenario_coordinator(seed: u64) -> Coordinator {
    rng::seed_from_u64(seed);
    let (clusters, nodes, proxies) = topology_and_proxies(10, 5);
    let mut tables = Tables::new(clusters, nodes);
    tables.set_parameter(scenario_schema()).unwrap();
    Coordinator::new(
        tables,
        proxies,
        Arc::new(InMemoryEventCollector::new()),
        PollConfig::default(),
    )
}

async fn set_and_commit(coordinator: &Coordinator, key: &str, size: u64) -> u64 {
    let placement = coordinator.upload_origin_key_value(key, size).await.unwrap();
    coordinator
        .report_commit_abort(key, Operation::Set, placement.stripe_id, true)
        .await;
    assert!(coordinator.check_commit_abort(key, Operation::Set, placement.stripe_id).await);
    placement.stripe_id
}

/// S1: SET("obj1", 4 KiB) with checkCommitAbort -> committed; the stripe
/// has 8 data, 2 global, 2 local blocks; exactly 5 distinct clusters host
/// blocks (DIS placement for k=8, g=2, l=2, b=4).
#[tokio::test]
async fn s1_set_commits_with_expected_block_layout() {
    let coordinator = scenario_coordinator(1000);

    set_and_commit(&coordinator, "obj1", 4096).await;

    let get = coordinator.get_value("obj1", "client:9000").await.unwrap();
    assert_eq!(get.stripe.data_blocks().len(), 8);
    assert_eq!(get.stripe.global_blocks().len(), 2);
    assert_eq!(get.stripe.local_blocks().len(), 2);
    assert_eq!(get.stripe.place2clusters.len(), 5);
    assert!(!get.serving_proxy_endpoint.is_empty());
}

/// S2: two SETs both commit into distinct stripes.
#[tokio::test]
async fn s2_two_sets_land_in_distinct_stripes() {
    let coordinator = scenario_coordinator(1001);

    let s1 = set_and_commit(&coordinator, "obj1", 4096).await;
    let s2 = set_and_commit(&coordinator, "obj2", 4096).await;

    assert_ne!(s1, s2);
    assert_eq!(coordinator.list_stripes().len(), 2);
}

/// S3: requestMerge(step=2) merges a pending pair into one stripe with
/// doubled data-block count, unchanged g/l, and both objects still
/// resolvable through the merged stripe.
#[tokio::test]
async fn s3_merge_combines_two_stripes() {
    let coordinator = scenario_coordinator(1002);

    set_and_commit(&coordinator, "obj1", 4096).await;
    set_and_commit(&coordinator, "obj2", 4096).await;
    assert_eq!(coordinator.list_stripes().len(), 2);

    let outcome = coordinator.request_merge(2).await;
    assert!(outcome.merged);

    let stripes = coordinator.list_stripes();
    assert_eq!(stripes.len(), 1);
    let merged = &stripes[0];
    assert_eq!(merged.data_blocks().len(), 16);
    assert_eq!(merged.global_blocks().len(), 2);
    assert_eq!(merged.local_blocks().len(), 2);

    assert!(coordinator.get_value("obj1", "client:9000").await.is_ok());
    assert!(coordinator.get_value("obj2", "client:9000").await.is_ok());
}

/// S4: SET then DEL (by key); the stripe is dropped once its last object
/// is removed.
#[tokio::test]
async fn s4_set_then_delete_drops_the_stripe() {
    let coordinator = scenario_coordinator(1003);
    let placed = set_and_commit(&coordinator, "obj1", 4096).await;

    let stripe_id = coordinator.del_by_key("obj1").await.unwrap();
    assert_eq!(stripe_id, placed);
    coordinator
        .report_commit_abort("obj1", Operation::DelKey, stripe_id, true)
        .await;
    let deleted = coordinator.check_commit_abort("obj1", Operation::DelKey, stripe_id).await;
    assert!(deleted);

    assert!(coordinator.get_value("obj1", "client:9000").await.is_err());
    assert!(coordinator.list_stripes().is_empty());
}

/// S5: GET resolves to a plan whose stripe lists at least one hosting
/// cluster and a usable serving endpoint.
#[tokio::test]
async fn s5_get_targets_a_hosting_cluster() {
    let coordinator = scenario_coordinator(1004);
    set_and_commit(&coordinator, "obj1", 4096).await;

    let get = coordinator.get_value("obj1", "client:9000").await.unwrap();
    assert!(!get.stripe.place2clusters.is_empty());
    assert!(!get.serving_proxy_endpoint.is_empty());
}

/// S6: requestMerge with an ineligible step size is a no-op; nothing in
/// the stripe table changes.
#[tokio::test]
async fn s6_bad_step_size_is_a_no_op() {
    let coordinator = scenario_coordinator(1005);
    for i in 0..4 {
        set_and_commit(&coordinator, &format!("obj{i}"), 1024).await;
    }
    assert_eq!(coordinator.list_stripes().len(), 4);

    let outcome = coordinator.request_merge(3).await;
    assert!(!outcome.merged);
    assert_eq!(coordinator.list_stripes().len(), 4);
}

/// An aborted SET never becomes visible and leaves no lookup path to the
/// object.
#[tokio::test]
async fn aborted_set_never_becomes_visible() {
    let coordinator = scenario_coordinator(1006);
    let placement = coordinator.upload_origin_key_value("obj1", 4096).await.unwrap();
    coordinator
        .report_commit_abort("obj1", Operation::Set, placement.stripe_id, false)
        .await;

    assert!(coordinator.get_value("obj1", "client:9000").await.is_err());
}

/// spec.md §4.4: SET replies carry the byte-transfer port, one above the
/// cluster's RPC proxy port.
#[tokio::test]
async fn set_reply_uses_the_byte_transfer_port() {
    let coordinator = scenario_coordinator(1007);
    let placement = coordinator.upload_origin_key_value("obj1", 4096).await.unwrap();

    let expected = format!("10.1.0.{}:9101", placement.serving_cluster);
    assert_eq!(placement.serving_proxy_endpoint, expected);
}

/// `setParameter` resets placement state even after prior commits.
#[tokio::test]
async fn set_parameter_resets_state_across_calls() {
    let (clusters, nodes, proxies) = topology_and_proxies(10, 5);
    let tables = Tables::new(clusters, nodes);
    let coordinator = Coordinator::new(
        tables,
        proxies,
        Arc::new(InMemoryEventCollector::new()),
        PollConfig::default(),
    );

    coordinator.set_parameter(scenario_schema()).await.unwrap();
    set_and_commit(&coordinator, "obj1", 1024).await;
    assert_eq!(coordinator.list_stripes().len(), 1);

    coordinator.set_parameter(scenario_schema()).await.unwrap();
    assert!(coordinator.list_stripes().is_empty());
    assert!(coordinator.get_value("obj1", "client:9000").await.is_err());
}

/// `checkalive` reaches the right proxy stub and reports a clean error
/// for an unknown cluster id without affecting the rest of the pool.
#[tokio::test]
async fn checkalive_reports_per_cluster_health() {
    let coordinator = scenario_coordinator(1007);
    assert!(coordinator.checkalive(0).await.is_ok());
    assert!(coordinator.checkalive(9999).await.is_err());
}

/// `delByStripe` against a stripe id that doesn't exist is an error, and
/// never touches the live stripe table.
#[tokio::test]
async fn del_by_stripe_rejects_unknown_stripe() {
    let coordinator = scenario_coordinator(1008);
    set_and_commit(&coordinator, "obj1", 4096).await;
    assert!(coordinator.del_by_stripe(999_999).await.is_err());
    assert_eq!(coordinator.list_stripes().len(), 1);
}
