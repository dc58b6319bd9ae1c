mod support;

use std::sync::Arc;
use std::time::Duration;

use kbshard::cluster::NodeSpec;
use kbshard::config::DeploymentMode;
use kbshard::index_node::{IndexNodeClient, MemoryIndexNode, ShardInfo};
use kbshard::model::{BrokerMessage, KbId, KnowledgeBoxConfig, MessageSource, NodeId, ResourceId};
use kbshard::placement::choose_replica;
use kbshard::CoordError;
use support::{test_config, Harness, GB};

#[tokio::test]
async fn too_small_cluster_creates_nothing() {
    let h = Harness::new(1, test_config(2));
    let err = h
        .coordinator
        .create_knowledge_box(KnowledgeBoxConfig::new(KbId::from("t1")))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CoordError::ClusterTooSmall {
            required: 2,
            available: 1
        }
    ));
    assert_eq!(h.total_replicas(), 0);
    assert_eq!(h.node("n1").new_shard_calls(), 0);
    assert!(h
        .coordinator
        .shards()
        .get_committed_shards(&KbId::from("t1"))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn replicas_land_on_distinct_nodes_with_most_disk() {
    let h = Harness::with_disks(&[10 * GB, 300 * GB, 200 * GB], test_config(2));
    let shard = h.create_kb("t1").await;
    let nodes: Vec<&str> = shard.replicas.iter().map(|r| r.node.as_str()).collect();
    assert_eq!(nodes, vec!["n2", "n3"]);
    assert_eq!(h.node("n1").replica_count(), 0);
}

#[tokio::test]
async fn refusing_node_is_skipped() {
    let h = Harness::new(3, test_config(2));
    h.node("n1").fail_new_shard(true);
    let shard = h.create_kb("t1").await;
    assert_eq!(shard.replicas.len(), 2);
    assert!(shard.node_ids().all(|node| node.as_str() != "n1"));
}

#[tokio::test]
async fn exhausted_nodes_roll_back_created_replicas() {
    let h = Harness::new(2, test_config(2));
    h.node("n2").fail_new_shard(true);
    let err = h
        .coordinator
        .create_knowledge_box(KnowledgeBoxConfig::new(KbId::from("t1")))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CoordError::ExhaustedNodes {
            required: 2,
            created: 1
        }
    ));
    assert_eq!(h.node("n1").new_shard_calls(), 1);
    assert_eq!(h.total_replicas(), 0);
}

#[tokio::test]
async fn full_active_shard_is_split_onto_another_node() {
    let h = Harness::new(2, test_config(1));
    let first = h.create_kb("t1").await;
    let first_node = first.replicas[0].node.clone();
    h.node(first_node.as_str()).report_size(Some(ShardInfo {
        paragraph_count: 600_000,
        field_count: 10,
        resource_count: 10,
    }));

    let created = h
        .coordinator
        .shards()
        .check_active_shard(&KbId::from("t1"))
        .await
        .unwrap()
        .expect("new shard");
    assert_ne!(created.replicas[0].node, first_node);

    let catalog = h.catalog("t1").await;
    assert_eq!(catalog.shards.len(), 2);
    assert_eq!(catalog.actual, Some(1));
    assert_eq!(catalog.actual_shard().map(|s| &s.shard), Some(&created.shard));
}

#[tokio::test]
async fn small_active_shard_is_left_alone() {
    let h = Harness::new(1, test_config(1));
    h.create_kb("t1").await;
    let created = h
        .coordinator
        .shards()
        .check_active_shard(&KbId::from("t1"))
        .await
        .unwrap();
    assert!(created.is_none());
    assert_eq!(h.catalog("t1").await.shards.len(), 1);
}

#[tokio::test]
async fn read_replicas_serve_reads_but_never_hold_primaries() {
    let h = Harness::new(1, test_config(1));
    let secondary = Arc::new(MemoryIndexNode::new("n1-rr"));
    h.cluster
        .add_node(NodeSpec::read_replica_of("n1-rr", "n1", 500 * GB), secondary.clone());

    let shard = h.create_kb("t1").await;
    assert_eq!(shard.replicas[0].node.as_str(), "n1");
    assert_eq!(secondary.new_shard_calls(), 0);

    let (node, replica) = choose_replica(&h.cluster, &shard, &[], true).unwrap();
    assert_eq!(node.id, NodeId::from("n1-rr"));
    assert_eq!(replica, shard.replicas[0].replica);

    let (node, _) = choose_replica(&h.cluster, &shard, &[], false).unwrap();
    assert_eq!(node.id, NodeId::from("n1"));
}

#[tokio::test]
async fn cluster_mode_times_out_slow_replicas() {
    let mut config = test_config(2);
    config.mode = DeploymentMode::Cluster;
    config.rpc.timeout_ms = 50;
    let h = Harness::new(2, config);
    h.create_kb("t1").await;
    h.node("n2").set_write_delay(Duration::from_millis(500));

    let message = BrokerMessage::autocommit(KbId::from("t1"), ResourceId::from("r1"), MessageSource::Writer)
        .with_text_field("body", "hello");
    let err = h.coordinator.process(message, None, "p0").await.unwrap_err();
    match err {
        CoordError::NodeUnavailable { node, .. } => assert_eq!(node, "n2"),
        other => panic!("expected node unavailable, got {other:?}"),
    }
    assert_eq!(h.node("n1").write_calls(), 1);
}

#[tokio::test]
async fn operations_fan_out_to_every_shard() {
    let h = Harness::new(2, test_config(1));
    h.create_kb("t1").await;
    let kbid = KbId::from("t1");
    h.node("n1").report_size(Some(ShardInfo {
        paragraph_count: 600_000,
        field_count: 1,
        resource_count: 1,
    }));
    h.node("n2").report_size(Some(ShardInfo {
        paragraph_count: 600_000,
        field_count: 1,
        resource_count: 1,
    }));
    h.coordinator.shards().check_active_shard(&kbid).await.unwrap();

    let outcomes = h
        .coordinator
        .shards()
        .apply_for_all_shards(
            &kbid,
            |node, replica| async move { node.client.get_shard_info(&replica).await },
            Duration::from_secs(1),
            false,
        )
        .await
        .unwrap();
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.iter().all(|outcome| outcome.result.is_ok()));

    let missing = h
        .coordinator
        .shards()
        .apply_for_all_shards(
            &KbId::from("nope"),
            |node, replica| async move { node.client.get_shard_info(&replica).await },
            Duration::from_secs(1),
            false,
        )
        .await
        .unwrap_err();
    assert!(matches!(missing, CoordError::KnowledgeBoxNotFound(_)));
}
