//! # Shard Manager
//!
//! Creates logical shards (replica fan-out with compensating rollback), fans
//! resource writes and deletes out to every replica of a shard, and decides
//! when the active shard is full.
//!
//! The fan-out style and the retry policy are chosen once from the
//! deployment mode when the manager is built:
//! - standalone: replicas are written one after another
//! - cluster: replicas are written concurrently, joined under an overall
//!   timeout that turns pending calls into `NodeUnavailable`

use crate::cluster::{ClusterState, IndexNode};
use crate::config::{CoordinatorConfig, DeploymentMode, RetryConfig};
use crate::error::{CoordError, Result};
use crate::index_node::{IndexNodeClient, ShardInfo};
use crate::indexing::IndexMessage;
use crate::model::{
    KbId, KnowledgeBoxConfig, NodeId, ReleaseChannel, ReplicaId, ResourceId, SemanticModel,
    ShardId, ShardObject, ShardReplica, Shards,
};
use crate::placement::{self, check_capacity, is_saturated, rank_primaries_for_placement};
use crate::store::{self, keys, KvStore, Transaction};
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Backoff for replica calls failing with `NodesUnsynchronized`.
#[derive(Debug, Clone)]
pub enum RetryPolicy {
    None,
    Backoff {
        attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
    },
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig, mode: DeploymentMode) -> Self {
        if !config.enabled_for(mode) {
            return RetryPolicy::None;
        }
        RetryPolicy::Backoff {
            attempts: config.attempts,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    /// Delay before retry number `attempt` (1-based): exponential, capped,
    /// with the upper half randomized.
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            RetryPolicy::None => Duration::ZERO,
            RetryPolicy::Backoff {
                base_delay,
                max_delay,
                ..
            } => {
                let factor = 1u32 << attempt.saturating_sub(1).min(16);
                let capped = base_delay.saturating_mul(factor).min(*max_delay);
                let half = capped.as_millis() as u64 / 2;
                let jitter = rand::rng().random_range(0..=half);
                Duration::from_millis(half + jitter)
            }
        }
    }

    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = match self {
            RetryPolicy::None => 1,
            RetryPolicy::Backoff { attempts, .. } => (*attempts).max(1),
        };
        let mut attempt = 1;
        loop {
            match op().await {
                Err(err) if err.is_transient() && attempt < attempts => {
                    let delay = self.delay(attempt);
                    debug!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying replica call");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum FanOut {
    Sequential,
    Parallel { timeout: Duration },
}

#[derive(Debug, Clone)]
enum ReplicaOp {
    Write(Arc<IndexMessage>),
    Delete(ResourceId),
}

impl ReplicaOp {
    async fn apply(&self, client: &dyn IndexNodeClient, replica: &ReplicaId) -> Result<()> {
        match self {
            ReplicaOp::Write(message) => client.write_resource(replica, message).await,
            ReplicaOp::Delete(rid) => client.delete_resource(replica, rid).await,
        }
    }
}

/// Undo actions recorded while creating replicas, unwound in reverse.
#[derive(Debug, Default)]
pub(crate) struct Compensations {
    actions: Vec<Compensation>,
}

#[derive(Debug)]
enum Compensation {
    DeleteReplica { node: NodeId, replica: ReplicaId },
}

impl Compensations {
    pub(crate) fn for_shard(shard: &ShardObject) -> Self {
        Self {
            actions: shard
                .replicas
                .iter()
                .map(|r| Compensation::DeleteReplica {
                    node: r.node.clone(),
                    replica: r.replica.clone(),
                })
                .collect(),
        }
    }

    fn push_replica(&mut self, node: NodeId, replica: ReplicaId) {
        self.actions
            .push(Compensation::DeleteReplica { node, replica });
    }

    pub(crate) fn len(&self) -> usize {
        self.actions.len()
    }

    /// Best effort: failures are logged and the unwind continues.
    pub(crate) async fn unwind(self, cluster: &ClusterState) {
        for action in self.actions.into_iter().rev() {
            match action {
                Compensation::DeleteReplica { node, replica } => {
                    let Some(handle) = cluster.get_node(&node) else {
                        warn!(node = %node, replica = %replica, "cannot delete replica: node unknown");
                        continue;
                    };
                    match handle.client.delete_shard(&replica).await {
                        Ok(()) => cluster.record_removed_replica(&node),
                        Err(err) => {
                            warn!(node = %node, replica = %replica, error = %err, "replica rollback failed")
                        }
                    }
                }
            }
        }
    }
}

/// Result of a read fanned out to one shard.
#[derive(Debug)]
pub struct ShardOutcome<T> {
    pub shard: ShardId,
    pub node: Option<NodeId>,
    pub result: Result<T>,
}

pub struct ShardManager {
    cluster: Arc<ClusterState>,
    store: Arc<dyn KvStore>,
    replica_factor: usize,
    max_replicas_per_node: usize,
    max_shard_paragraphs: u64,
    max_shard_fields: u64,
    fan_out: FanOut,
    retry: RetryPolicy,
}

impl ShardManager {
    pub fn new(
        cluster: Arc<ClusterState>,
        store: Arc<dyn KvStore>,
        config: &CoordinatorConfig,
    ) -> Self {
        let fan_out = match config.mode {
            DeploymentMode::Standalone => FanOut::Sequential,
            DeploymentMode::Cluster => FanOut::Parallel {
                timeout: config.rpc.timeout(),
            },
        };
        Self {
            cluster,
            store,
            replica_factor: config.cluster.replica_factor,
            max_replicas_per_node: config.cluster.max_replicas_per_node,
            max_shard_paragraphs: config.shards.max_paragraphs,
            max_shard_fields: config.shards.max_fields,
            fan_out,
            retry: RetryPolicy::from_config(&config.retry, config.mode),
        }
    }

    /// Replace the retry policy chosen from configuration.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn cluster(&self) -> &Arc<ClusterState> {
        &self.cluster
    }

    pub fn replica_factor(&self) -> usize {
        self.replica_factor
    }

    pub async fn get_shards_by_kb(
        &self,
        txn: &mut dyn Transaction,
        kbid: &KbId,
    ) -> Result<Option<Shards>> {
        store::get_value(txn, &keys::shards(kbid)).await
    }

    /// Last committed catalog, read outside any transaction.
    pub async fn get_committed_shards(&self, kbid: &KbId) -> Result<Option<Shards>> {
        self.store
            .read(&keys::shards(kbid))
            .await?
            .map(|bytes| store::decode(&bytes))
            .transpose()
    }

    /// Create a logical shard with `replica_factor` replicas and make it the
    /// active shard of the catalog, written into `txn`.
    ///
    /// On failure every replica created so far is deleted and nothing is
    /// written to `txn`.
    #[instrument(skip_all, fields(kbid = %kbid))]
    pub async fn create_shard(
        &self,
        txn: &mut dyn Transaction,
        kbid: &KbId,
        semantic_model: &SemanticModel,
        release_channel: ReleaseChannel,
    ) -> Result<ShardObject> {
        check_capacity(&self.cluster, self.replica_factor, self.max_replicas_per_node)?;

        let mut shards = self
            .get_shards_by_kb(txn, kbid)
            .await?
            .unwrap_or_else(|| Shards::new(kbid.clone(), semantic_model.clone(), release_channel));
        let avoid = shards.node_ids();

        let mut compensations = Compensations::default();
        let created = self
            .create_replicas(
                kbid,
                ShardId::generate(),
                semantic_model,
                release_channel,
                &avoid,
                &mut compensations,
            )
            .await;
        let shard = match created {
            Ok(shard) => shard,
            Err(err) => {
                warn!(error = %err, replicas = compensations.len(), "shard creation failed, rolling back");
                compensations.unwind(&self.cluster).await;
                return Err(err);
            }
        };

        shards.push_active(shard.clone());
        if let Err(err) = store::set_value(txn, &keys::shards(kbid), &shards).await {
            compensations.unwind(&self.cluster).await;
            return Err(err);
        }
        info!(shard = %shard.shard, replicas = shard.replicas.len(), "shard created");
        Ok(shard)
    }

    /// Place `replica_factor` replicas of `shard_id`, one per node.
    ///
    /// Nodes refusing the call are skipped. Every created replica is recorded
    /// in `compensations`; the caller unwinds them on error.
    pub(crate) async fn create_replicas(
        &self,
        kbid: &KbId,
        shard_id: ShardId,
        semantic_model: &SemanticModel,
        release_channel: ReleaseChannel,
        avoid: &[NodeId],
        compensations: &mut Compensations,
    ) -> Result<ShardObject> {
        let mut shard = ShardObject::new(shard_id);
        let candidates: Vec<IndexNode> = rank_primaries_for_placement(&self.cluster, avoid)
            .into_iter()
            .filter(|node| !is_saturated(node, self.max_replicas_per_node))
            .collect();

        for node in candidates {
            if shard.replicas.len() >= self.replica_factor {
                break;
            }
            match node
                .client
                .new_shard(kbid, semantic_model.similarity, release_channel)
                .await
            {
                Ok(replica) => {
                    compensations.push_replica(node.id.clone(), replica.clone());
                    self.cluster.record_new_replica(&node.id);
                    debug!(node = %node.id, replica = %replica, shard = %shard.shard, "replica created");
                    shard.replicas.push(ShardReplica {
                        node: node.id,
                        replica,
                    });
                }
                Err(err) => {
                    warn!(node = %node.id, error = %err, "replica creation failed, trying next node");
                }
            }
        }

        if shard.replicas.len() < self.replica_factor {
            return Err(CoordError::ExhaustedNodes {
                required: self.replica_factor,
                created: shard.replicas.len(),
            });
        }
        Ok(shard)
    }

    /// Delete every replica of `shard`, logging the ones that cannot be deleted.
    pub async fn rollback_shard(&self, shard: &ShardObject) {
        info!(shard = %shard.shard, "rolling back shard replicas");
        Compensations::for_shard(shard).unwind(&self.cluster).await;
    }

    /// Write `message` to every replica of `shard`.
    #[instrument(skip_all, fields(shard = %shard.shard, rid = %message.resource))]
    pub async fn add_resource(&self, shard: &ShardObject, message: &IndexMessage) -> Result<()> {
        self.fan_out(shard, ReplicaOp::Write(Arc::new(message.clone())))
            .await
    }

    /// Delete `rid` from every replica of `shard`.
    #[instrument(skip_all, fields(shard = %shard.shard, rid = %rid))]
    pub async fn delete_resource(&self, shard: &ShardObject, rid: &ResourceId) -> Result<()> {
        self.fan_out(shard, ReplicaOp::Delete(rid.clone())).await
    }

    async fn fan_out(&self, shard: &ShardObject, op: ReplicaOp) -> Result<()> {
        match self.fan_out {
            FanOut::Sequential => {
                for replica in &shard.replicas {
                    let node = self.resolve(&replica.node)?;
                    self.retry
                        .run(|| op.apply(node.client.as_ref(), &replica.replica))
                        .await?;
                }
                Ok(())
            }
            FanOut::Parallel { timeout } => {
                let mut pending: Vec<(NodeId, JoinHandle<Result<()>>)> = Vec::new();
                for replica in &shard.replicas {
                    let node = self.resolve(&replica.node)?;
                    let retry = self.retry.clone();
                    let op = op.clone();
                    let replica_id = replica.replica.clone();
                    let client = node.client.clone();
                    let handle = tokio::spawn(async move {
                        retry
                            .run(|| op.apply(client.as_ref(), &replica_id))
                            .await
                    });
                    pending.push((node.id, handle));
                }
                first_error(join_until(pending, Instant::now() + timeout).await)
            }
        }
    }

    fn resolve(&self, node: &NodeId) -> Result<IndexNode> {
        self.cluster
            .get_node(node)
            .ok_or_else(|| CoordError::NodeUnavailable {
                node: node.to_string(),
                reason: "not registered".to_string(),
            })
    }

    pub fn should_create_new_shard(&self, num_paragraphs: u64, num_fields: u64) -> bool {
        num_paragraphs > self.max_shard_paragraphs || num_fields > self.max_shard_fields
    }

    /// Create a new active shard when the reported size crosses a threshold.
    ///
    /// Opens its own transaction. The semantic model is re-read from the
    /// catalog (or the knowledge box config when there is none yet).
    #[instrument(skip(self, kbid), fields(kbid = %kbid))]
    pub async fn maybe_create_new_shard(
        &self,
        kbid: &KbId,
        num_paragraphs: u64,
        num_fields: u64,
    ) -> Result<Option<ShardObject>> {
        if !self.should_create_new_shard(num_paragraphs, num_fields) {
            return Ok(None);
        }
        let mut txn = self.store.begin().await?;
        let kb_config: Option<KnowledgeBoxConfig> =
            store::get_value(txn.as_mut(), &keys::kb_config(kbid)).await?;
        let Some(kb_config) = kb_config else {
            txn.abort().await?;
            warn!("knowledge box vanished before shard split");
            return Ok(None);
        };
        let (semantic_model, release_channel) = match self.get_shards_by_kb(txn.as_mut(), kbid).await? {
            Some(shards) => (shards.semantic_model, shards.release_channel),
            None => (kb_config.semantic_model, kb_config.release_channel),
        };

        let shard = match self
            .create_shard(txn.as_mut(), kbid, &semantic_model, release_channel)
            .await
        {
            Ok(shard) => shard,
            Err(err) => {
                txn.abort().await?;
                return Err(err);
            }
        };
        if let Err(err) = txn.commit().await {
            self.rollback_shard(&shard).await;
            return Err(err);
        }
        info!(
            shard = %shard.shard,
            num_paragraphs,
            num_fields,
            "active shard full, new shard created"
        );
        Ok(Some(shard))
    }

    /// Size of the active shard as reported by one of its replicas.
    pub async fn active_shard_info(&self, kbid: &KbId) -> Result<Option<ShardInfo>> {
        let Some(shards) = self.get_committed_shards(kbid).await? else {
            return Ok(None);
        };
        let Some(active) = shards.actual_shard() else {
            return Ok(None);
        };
        let (node, replica) = placement::choose_replica(&self.cluster, active, &[], false)?;
        Ok(Some(node.client.get_shard_info(&replica).await?))
    }

    /// Check the active shard and split it when full.
    pub async fn check_active_shard(&self, kbid: &KbId) -> Result<Option<ShardObject>> {
        match self.active_shard_info(kbid).await? {
            Some(info) => {
                self.maybe_create_new_shard(kbid, info.paragraph_count, info.field_count)
                    .await
            }
            None => Ok(None),
        }
    }

    /// Run `op` against one chosen replica of every shard of `kbid`.
    ///
    /// Failures are reported per shard; a shard still pending when `timeout`
    /// expires reports `NodeUnavailable`.
    pub async fn apply_for_all_shards<T, F, Fut>(
        &self,
        kbid: &KbId,
        op: F,
        timeout: Duration,
        use_read_replicas: bool,
    ) -> Result<Vec<ShardOutcome<T>>>
    where
        T: Send + 'static,
        F: Fn(IndexNode, ReplicaId) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let shards = self
            .get_committed_shards(kbid)
            .await?
            .ok_or_else(|| CoordError::KnowledgeBoxNotFound(kbid.to_string()))?;

        let deadline = Instant::now() + timeout;
        let mut outcomes = Vec::with_capacity(shards.shards.len());
        let mut pending = Vec::new();
        for shard in &shards.shards {
            match placement::choose_replica(&self.cluster, shard, &[], use_read_replicas) {
                Ok((node, replica)) => {
                    let node_id = node.id.clone();
                    pending.push((shard.shard.clone(), node_id, tokio::spawn(op(node, replica))));
                }
                Err(err) => outcomes.push(ShardOutcome {
                    shard: shard.shard.clone(),
                    node: None,
                    result: Err(err),
                }),
            }
        }
        for (shard, node, mut handle) in pending {
            let result = await_handle(&node, &mut handle, deadline).await;
            outcomes.push(ShardOutcome {
                shard,
                node: Some(node),
                result,
            });
        }
        Ok(outcomes)
    }

    /// Block until `node` reports a backlog below `low_water`.
    ///
    /// Polls with a fixed sleep and has no deadline.
    pub async fn wait_for_node(
        &self,
        node: &NodeId,
        low_water: u64,
        poll_interval: Duration,
    ) -> Result<()> {
        loop {
            let Some(handle) = self.cluster.get_node(node) else {
                warn!(node = %node, "node left the cluster while waiting for its backlog");
                return Ok(());
            };
            let backlog = handle.client.pending_backlog().await?;
            if backlog < low_water {
                return Ok(());
            }
            debug!(node = %node, backlog, low_water, "waiting for node backlog to drain");
            tokio::time::sleep(poll_interval).await;
        }
    }
}

/// Join spawned replica calls against a shared deadline. Calls still running
/// at the deadline are detached, not cancelled.
async fn join_until(
    pending: Vec<(NodeId, JoinHandle<Result<()>>)>,
    deadline: Instant,
) -> Vec<Result<()>> {
    let mut results = Vec::with_capacity(pending.len());
    for (node, mut handle) in pending {
        results.push(await_handle(&node, &mut handle, deadline).await);
    }
    results
}

async fn await_handle<T>(
    node: &NodeId,
    handle: &mut JoinHandle<Result<T>>,
    deadline: Instant,
) -> Result<T> {
    match tokio::time::timeout_at(deadline, handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(CoordError::rpc(node.as_str(), join_err.to_string())),
        Err(_) => Err(CoordError::NodeUnavailable {
            node: node.to_string(),
            reason: "timed out".to_string(),
        }),
    }
}

fn first_error(results: Vec<Result<()>>) -> Result<()> {
    results.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::NodeSpec;
    use crate::index_node::MemoryIndexNode;
    use crate::model::Resource;
    use crate::store::MemoryStore;
    use chrono::Utc;

    struct Harness {
        cluster: Arc<ClusterState>,
        store: Arc<MemoryStore>,
        nodes: Vec<Arc<MemoryIndexNode>>,
    }

    fn harness(disks: &[(&str, u64)]) -> Harness {
        let cluster = Arc::new(ClusterState::new());
        let mut nodes = Vec::new();
        for (id, disk) in disks {
            let node = Arc::new(MemoryIndexNode::new(*id));
            cluster.add_node(NodeSpec::primary(*id, *disk), node.clone());
            nodes.push(node);
        }
        Harness {
            cluster,
            store: Arc::new(MemoryStore::new()),
            nodes,
        }
    }

    fn config(mode: DeploymentMode, replica_factor: usize) -> CoordinatorConfig {
        let mut config = CoordinatorConfig::default();
        config.mode = mode;
        config.cluster.replica_factor = replica_factor;
        config.retry.base_delay_ms = 1;
        config.retry.max_delay_ms = 2;
        config.rpc.timeout_ms = 50;
        config
    }

    async fn create(manager: &ShardManager, store: &MemoryStore, kb: &KbId) -> Result<ShardObject> {
        let mut txn = store.begin().await?;
        let shard = manager
            .create_shard(txn.as_mut(), kb, &SemanticModel::default(), ReleaseChannel::Stable)
            .await?;
        txn.commit().await?;
        Ok(shard)
    }

    #[tokio::test]
    async fn skips_failing_node_and_places_on_distinct_nodes() {
        let h = harness(&[("a", 300), ("b", 200), ("c", 100)]);
        h.nodes[0].fail_new_shard(true);
        let manager = ShardManager::new(
            h.cluster.clone(),
            h.store.clone(),
            &config(DeploymentMode::Standalone, 2),
        );
        let shard = create(&manager, &h.store, &KbId::from("kb")).await.unwrap();
        let nodes: Vec<&str> = shard.node_ids().map(|n| n.as_str()).collect();
        assert_eq!(nodes, vec!["b", "c"]);
        assert_eq!(h.cluster.get_node(&NodeId::from("b")).unwrap().shard_count, 1);
    }

    #[tokio::test]
    async fn exhausted_nodes_roll_back_created_replicas() {
        let h = harness(&[("a", 300), ("b", 200)]);
        h.nodes[1].fail_new_shard(true);
        let manager = ShardManager::new(
            h.cluster.clone(),
            h.store.clone(),
            &config(DeploymentMode::Standalone, 2),
        );
        let err = create(&manager, &h.store, &KbId::from("kb")).await.unwrap_err();
        assert!(matches!(err, CoordError::ExhaustedNodes { required: 2, created: 1 }));
        assert_eq!(h.nodes[0].new_shard_calls(), 1);
        assert_eq!(h.nodes[0].replica_count(), 0);
        assert!(h.store.snapshot().is_empty());
    }

    #[tokio::test]
    async fn second_shard_avoids_nodes_of_the_first() {
        let h = harness(&[("a", 300), ("b", 200)]);
        let manager = ShardManager::new(
            h.cluster.clone(),
            h.store.clone(),
            &config(DeploymentMode::Standalone, 1),
        );
        let kb = KbId::from("kb");
        let first = create(&manager, &h.store, &kb).await.unwrap();
        let second = create(&manager, &h.store, &kb).await.unwrap();
        assert_eq!(first.replicas[0].node, NodeId::from("a"));
        assert_eq!(second.replicas[0].node, NodeId::from("b"));
        let shards = manager.get_committed_shards(&kb).await.unwrap().unwrap();
        assert_eq!(shards.shards.len(), 2);
        assert_eq!(shards.actual, Some(1));
    }

    #[tokio::test]
    async fn standalone_writes_retry_unsynchronized_nodes() {
        let h = harness(&[("a", 300)]);
        let manager = ShardManager::new(
            h.cluster.clone(),
            h.store.clone(),
            &config(DeploymentMode::Standalone, 1),
        );
        let kb = KbId::from("kb");
        let shard = create(&manager, &h.store, &kb).await.unwrap();
        let resource = Resource::new(kb, ResourceId::from("r1"), Utc::now());
        h.nodes[0].unsynchronized_for(2);
        manager
            .add_resource(&shard, &IndexMessage::from_resource(&resource))
            .await
            .unwrap();
        assert_eq!(h.nodes[0].write_calls(), 3);
    }

    #[tokio::test]
    async fn retries_stop_after_configured_attempts() {
        let h = harness(&[("a", 300)]);
        let manager = ShardManager::new(
            h.cluster.clone(),
            h.store.clone(),
            &config(DeploymentMode::Standalone, 1),
        );
        let kb = KbId::from("kb");
        let shard = create(&manager, &h.store, &kb).await.unwrap();
        h.nodes[0].unsynchronized_for(10);
        let err = manager
            .delete_resource(&shard, &ResourceId::from("r1"))
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(h.nodes[0].delete_calls(), 3);
    }

    #[tokio::test]
    async fn disabled_retry_policy_fails_fast() {
        let h = harness(&[("a", 300)]);
        let manager = ShardManager::new(
            h.cluster.clone(),
            h.store.clone(),
            &config(DeploymentMode::Standalone, 1),
        )
        .with_retry_policy(RetryPolicy::None);
        let kb = KbId::from("kb");
        let shard = create(&manager, &h.store, &kb).await.unwrap();
        h.nodes[0].unsynchronized_for(1);
        assert!(manager
            .delete_resource(&shard, &ResourceId::from("r1"))
            .await
            .is_err());
        assert_eq!(h.nodes[0].delete_calls(), 1);
    }

    #[tokio::test]
    async fn parallel_fan_out_times_out_slow_replicas() {
        let h = harness(&[("a", 300), ("b", 200)]);
        let manager = ShardManager::new(
            h.cluster.clone(),
            h.store.clone(),
            &config(DeploymentMode::Cluster, 2),
        );
        let kb = KbId::from("kb");
        let shard = create(&manager, &h.store, &kb).await.unwrap();
        h.nodes[1].set_write_delay(Duration::from_millis(500));
        let resource = Resource::new(kb, ResourceId::from("r1"), Utc::now());
        let err = manager
            .add_resource(&shard, &IndexMessage::from_resource(&resource))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordError::NodeUnavailable { ref node, .. } if node == "b"));
        assert_eq!(h.nodes[0].documents(&shard.replicas[0].replica).len(), 1);
    }

    #[tokio::test]
    async fn apply_for_all_shards_reports_per_shard() {
        let h = harness(&[("a", 300), ("b", 200)]);
        let manager = ShardManager::new(
            h.cluster.clone(),
            h.store.clone(),
            &config(DeploymentMode::Standalone, 1),
        );
        let kb = KbId::from("kb");
        create(&manager, &h.store, &kb).await.unwrap();
        create(&manager, &h.store, &kb).await.unwrap();
        h.cluster.remove_node(&NodeId::from("b"));

        let outcomes = manager
            .apply_for_all_shards(
                &kb,
                |node, replica| async move { node.client.get_shard_info(&replica).await },
                Duration::from_secs(1),
                false,
            )
            .await
            .unwrap();
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes.iter().filter(|o| o.result.is_ok()).count(), 1);
        assert!(outcomes
            .iter()
            .any(|o| matches!(o.result, Err(CoordError::NoHealthyNode(_)))));
    }

    #[tokio::test]
    async fn maybe_create_new_shard_uses_thresholds() {
        let h = harness(&[("a", 300), ("b", 200)]);
        let mut cfg = config(DeploymentMode::Standalone, 1);
        cfg.shards.max_paragraphs = 10;
        let manager = ShardManager::new(h.cluster.clone(), h.store.clone(), &cfg);
        let kb = KbId::from("kb");
        let mut txn = h.store.begin().await.unwrap();
        store::set_value(txn.as_mut(), &keys::kb_config(&kb), &KnowledgeBoxConfig::new(kb.clone()))
            .await
            .unwrap();
        txn.commit().await.unwrap();
        create(&manager, &h.store, &kb).await.unwrap();

        assert!(manager.maybe_create_new_shard(&kb, 10, 0).await.unwrap().is_none());
        let created = manager.maybe_create_new_shard(&kb, 11, 0).await.unwrap();
        assert!(created.is_some());
        let shards = manager.get_committed_shards(&kb).await.unwrap().unwrap();
        assert_eq!(shards.shards.len(), 2);
    }

    #[tokio::test]
    async fn wait_for_node_returns_once_backlog_drains() {
        let h = harness(&[("a", 300)]);
        let manager = ShardManager::new(
            h.cluster.clone(),
            h.store.clone(),
            &config(DeploymentMode::Standalone, 1),
        );
        h.nodes[0].set_backlog(50, 20);
        manager
            .wait_for_node(&NodeId::from("a"), 20, Duration::from_millis(1))
            .await
            .unwrap();
        // Polls see 50, 30, then 10, which is under the low-water mark.
        assert_eq!(h.nodes[0].backlog_polls(), 3);
        assert_eq!(h.nodes[0].pending_backlog().await.unwrap(), 0);
    }

    #[test]
    fn backoff_delay_is_capped() {
        let policy = RetryPolicy::Backoff {
            attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
        };
        for attempt in 1..6 {
            let delay = policy.delay(attempt);
            assert!(delay <= Duration::from_millis(300));
        }
        assert!(policy.delay(1) >= Duration::from_millis(50));
    }
}
