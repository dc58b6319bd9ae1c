use std::sync::Arc;

use kbshard::cluster::{ClusterState, NodeSpec};
use kbshard::config::CoordinatorConfig;
use kbshard::external::MemoryProcessingQueue;
use kbshard::index_node::MemoryIndexNode;
use kbshard::locks::LocalLocks;
use kbshard::model::{KbId, KnowledgeBoxConfig, ShardObject, Shards};
use kbshard::notify::{MemoryPublisher, Notification};
use kbshard::store::MemoryStore;
use kbshard::Coordinator;

pub const GB: u64 = 1024 * 1024 * 1024;

/// Config with fast retries and small rollover batches.
#[allow(dead_code)]
pub fn test_config(replica_factor: usize) -> CoordinatorConfig {
    let mut config = CoordinatorConfig::default();
    config.cluster.replica_factor = replica_factor;
    config.retry.base_delay_ms = 1;
    config.retry.max_delay_ms = 5;
    config.rollover.batch_size = 11;
    config.rollover.poll_interval_ms = 1;
    config
}

/// In-process cluster of memory index nodes around one coordinator.
#[allow(dead_code)]
pub struct Harness {
    pub store: MemoryStore,
    pub cluster: Arc<ClusterState>,
    pub nodes: Vec<Arc<MemoryIndexNode>>,
    pub publisher: MemoryPublisher,
    pub queue: Arc<MemoryProcessingQueue>,
    pub coordinator: Coordinator,
}

#[allow(dead_code)]
impl Harness {
    /// Nodes `n1..=n{node_count}`, each with 100GB free.
    pub fn new(node_count: usize, config: CoordinatorConfig) -> Self {
        let disks: Vec<u64> = (0..node_count).map(|_| 100 * GB).collect();
        Self::with_disks(&disks, config)
    }

    pub fn with_disks(disks: &[u64], config: CoordinatorConfig) -> Self {
        let cluster = Arc::new(ClusterState::new());
        let mut nodes = Vec::with_capacity(disks.len());
        for (idx, disk) in disks.iter().enumerate() {
            let id = format!("n{}", idx + 1);
            let node = Arc::new(MemoryIndexNode::new(id.as_str()));
            cluster.add_node(NodeSpec::primary(id.as_str(), *disk), node.clone());
            nodes.push(node);
        }
        let store = MemoryStore::new();
        let publisher = MemoryPublisher::default();
        let queue = Arc::new(MemoryProcessingQueue::new());
        let coordinator = Coordinator::with_parts(
            config,
            cluster.clone(),
            Arc::new(store.clone()),
            Arc::new(publisher.clone()),
            Arc::new(LocalLocks::new()),
        )
        .with_processing_queue(queue.clone());
        Self {
            store,
            cluster,
            nodes,
            publisher,
            queue,
            coordinator,
        }
    }

    pub fn node(&self, id: &str) -> &Arc<MemoryIndexNode> {
        self.nodes
            .iter()
            .find(|node| node.id().as_str() == id)
            .expect("unknown node")
    }

    pub async fn create_kb(&self, kbid: &str) -> ShardObject {
        self.coordinator
            .create_knowledge_box(KnowledgeBoxConfig::new(KbId::from(kbid)))
            .await
            .expect("create knowledge box")
            .expect("first shard")
    }

    pub async fn catalog(&self, kbid: &str) -> Shards {
        self.coordinator
            .shards()
            .get_committed_shards(&KbId::from(kbid))
            .await
            .expect("read catalog")
            .expect("catalog exists")
    }

    pub fn total_writes(&self) -> u64 {
        self.nodes.iter().map(|node| node.write_calls()).sum()
    }

    pub fn total_replicas(&self) -> usize {
        self.nodes.iter().map(|node| node.replica_count()).sum()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.publisher.notifications()
    }
}
