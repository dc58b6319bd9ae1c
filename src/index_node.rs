//! # Index Node Client
//!
//! The RPC surface of an index node as seen by the coordinator, plus an
//! in-process node used by the local binary and the test harness.

use crate::error::{CoordError, Result};
use crate::indexing::IndexMessage;
use crate::model::{KbId, NodeId, ReleaseChannel, ReplicaId, ResourceId, VectorSimilarity};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

/// Size counters reported by a replica.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShardInfo {
    pub paragraph_count: u64,
    pub field_count: u64,
    pub resource_count: u64,
}

#[async_trait]
pub trait IndexNodeClient: Send + Sync {
    async fn new_shard(
        &self,
        kbid: &KbId,
        similarity: VectorSimilarity,
        release_channel: ReleaseChannel,
    ) -> Result<ReplicaId>;

    async fn delete_shard(&self, replica: &ReplicaId) -> Result<()>;

    /// Full overwrite of the resource on the replica.
    async fn write_resource(&self, replica: &ReplicaId, message: &IndexMessage) -> Result<()>;

    async fn delete_resource(&self, replica: &ReplicaId, rid: &ResourceId) -> Result<()>;

    async fn get_shard_info(&self, replica: &ReplicaId) -> Result<ShardInfo>;

    /// Deliveries accepted but not yet applied by the node.
    async fn pending_backlog(&self) -> Result<u64>;
}

#[derive(Debug)]
struct MemoryReplica {
    kbid: KbId,
    documents: BTreeMap<ResourceId, IndexMessage>,
}

/// In-memory index node with fault injection and call counters.
#[derive(Debug)]
pub struct MemoryIndexNode {
    id: NodeId,
    replicas: Mutex<HashMap<ReplicaId, MemoryReplica>>,
    next_replica: AtomicU64,
    fail_new_shard: AtomicBool,
    fail_writes: AtomicBool,
    fail_delete_shard: AtomicBool,
    unsynchronized: AtomicU32,
    backlog: AtomicU64,
    backlog_drain: AtomicU64,
    write_delay_ms: AtomicU64,
    reported_size: Mutex<Option<ShardInfo>>,
    new_shard_calls: AtomicU64,
    write_calls: AtomicU64,
    delete_calls: AtomicU64,
    backlog_polls: AtomicU64,
}

impl MemoryIndexNode {
    pub fn new(id: impl Into<NodeId>) -> Self {
        Self {
            id: id.into(),
            replicas: Mutex::new(HashMap::new()),
            next_replica: AtomicU64::new(1),
            fail_new_shard: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            fail_delete_shard: AtomicBool::new(false),
            unsynchronized: AtomicU32::new(0),
            backlog: AtomicU64::new(0),
            backlog_drain: AtomicU64::new(0),
            write_delay_ms: AtomicU64::new(0),
            reported_size: Mutex::new(None),
            new_shard_calls: AtomicU64::new(0),
            write_calls: AtomicU64::new(0),
            delete_calls: AtomicU64::new(0),
            backlog_polls: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn fail_new_shard(&self, fail: bool) {
        self.fail_new_shard.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_delete_shard(&self, fail: bool) {
        self.fail_delete_shard.store(fail, Ordering::SeqCst);
    }

    /// The next `times` writes or deletes fail with `NodesUnsynchronized`.
    pub fn unsynchronized_for(&self, times: u32) {
        self.unsynchronized.store(times, Ordering::SeqCst);
    }

    /// Set the pending backlog; each poll drains `drain_per_poll` from it.
    pub fn set_backlog(&self, backlog: u64, drain_per_poll: u64) {
        self.backlog.store(backlog, Ordering::SeqCst);
        self.backlog_drain.store(drain_per_poll, Ordering::SeqCst);
    }

    pub fn set_write_delay(&self, delay: Duration) {
        self.write_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Report fixed counters from `get_shard_info` instead of real ones.
    pub fn report_size(&self, info: Option<ShardInfo>) {
        *self.reported_size.lock() = info;
    }

    pub fn replica_count(&self) -> usize {
        self.replicas.lock().len()
    }

    pub fn replica_ids(&self) -> Vec<ReplicaId> {
        let mut ids: Vec<ReplicaId> = self.replicas.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn has_replica(&self, replica: &ReplicaId) -> bool {
        self.replicas.lock().contains_key(replica)
    }

    pub fn replica_kb(&self, replica: &ReplicaId) -> Option<KbId> {
        self.replicas.lock().get(replica).map(|r| r.kbid.clone())
    }

    pub fn documents(&self, replica: &ReplicaId) -> Vec<ResourceId> {
        self.replicas
            .lock()
            .get(replica)
            .map(|r| r.documents.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn document(&self, replica: &ReplicaId, rid: &ResourceId) -> Option<IndexMessage> {
        self.replicas
            .lock()
            .get(replica)
            .and_then(|r| r.documents.get(rid).cloned())
    }

    pub fn new_shard_calls(&self) -> u64 {
        self.new_shard_calls.load(Ordering::SeqCst)
    }

    pub fn write_calls(&self) -> u64 {
        self.write_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> u64 {
        self.delete_calls.load(Ordering::SeqCst)
    }

    pub fn backlog_polls(&self) -> u64 {
        self.backlog_polls.load(Ordering::SeqCst)
    }

    fn check_synchronized(&self) -> Result<()> {
        let pending = self.unsynchronized.load(Ordering::SeqCst);
        if pending > 0 {
            self.unsynchronized.store(pending - 1, Ordering::SeqCst);
            return Err(CoordError::NodesUnsynchronized(self.id.to_string()));
        }
        Ok(())
    }

    fn missing_replica(&self, replica: &ReplicaId) -> CoordError {
        CoordError::rpc(self.id.as_str(), format!("replica {replica} not found"))
    }
}

#[async_trait]
impl IndexNodeClient for MemoryIndexNode {
    async fn new_shard(
        &self,
        kbid: &KbId,
        _similarity: VectorSimilarity,
        _release_channel: ReleaseChannel,
    ) -> Result<ReplicaId> {
        self.new_shard_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_new_shard.load(Ordering::SeqCst) {
            return Err(CoordError::rpc(self.id.as_str(), "new_shard refused"));
        }
        let seq = self.next_replica.fetch_add(1, Ordering::SeqCst);
        let replica = ReplicaId::new(format!("{}-{}", self.id, seq));
        self.replicas.lock().insert(
            replica.clone(),
            MemoryReplica {
                kbid: kbid.clone(),
                documents: BTreeMap::new(),
            },
        );
        debug!(node = %self.id, replica = %replica, kbid = %kbid, "replica created");
        Ok(replica)
    }

    async fn delete_shard(&self, replica: &ReplicaId) -> Result<()> {
        if self.fail_delete_shard.load(Ordering::SeqCst) {
            return Err(CoordError::rpc(self.id.as_str(), "delete_shard refused"));
        }
        self.replicas.lock().remove(replica);
        Ok(())
    }

    async fn write_resource(&self, replica: &ReplicaId, message: &IndexMessage) -> Result<()> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.write_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(CoordError::rpc(self.id.as_str(), "write refused"));
        }
        self.check_synchronized()?;
        let mut replicas = self.replicas.lock();
        let target = replicas
            .get_mut(replica)
            .ok_or_else(|| self.missing_replica(replica))?;
        target
            .documents
            .insert(message.resource.clone(), message.clone());
        Ok(())
    }

    async fn delete_resource(&self, replica: &ReplicaId, rid: &ResourceId) -> Result<()> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(CoordError::rpc(self.id.as_str(), "delete refused"));
        }
        self.check_synchronized()?;
        let mut replicas = self.replicas.lock();
        let target = replicas
            .get_mut(replica)
            .ok_or_else(|| self.missing_replica(replica))?;
        target.documents.remove(rid);
        Ok(())
    }

    async fn get_shard_info(&self, replica: &ReplicaId) -> Result<ShardInfo> {
        if let Some(info) = *self.reported_size.lock() {
            return Ok(info);
        }
        let replicas = self.replicas.lock();
        let target = replicas
            .get(replica)
            .ok_or_else(|| self.missing_replica(replica))?;
        Ok(ShardInfo {
            paragraph_count: target
                .documents
                .values()
                .map(|doc| doc.paragraph_count() as u64)
                .sum(),
            field_count: target
                .documents
                .values()
                .map(|doc| doc.field_count() as u64)
                .sum(),
            resource_count: target.documents.len() as u64,
        })
    }

    async fn pending_backlog(&self) -> Result<u64> {
        self.backlog_polls.fetch_add(1, Ordering::SeqCst);
        let drain = self.backlog_drain.load(Ordering::SeqCst);
        let current = self.backlog.load(Ordering::SeqCst);
        self.backlog
            .store(current.saturating_sub(drain), Ordering::SeqCst);
        Ok(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Resource;
    use chrono::Utc;

    #[tokio::test]
    async fn writes_overwrite_by_resource_id() {
        let node = MemoryIndexNode::new("n1");
        let kb = KbId::from("kb");
        let replica = node
            .new_shard(&kb, VectorSimilarity::Cosine, ReleaseChannel::Stable)
            .await
            .unwrap();
        let resource = Resource::new(kb.clone(), ResourceId::from("r1"), Utc::now());
        let message = IndexMessage::from_resource(&resource);
        node.write_resource(&replica, &message).await.unwrap();
        node.write_resource(&replica, &message).await.unwrap();
        assert_eq!(node.documents(&replica), vec![ResourceId::from("r1")]);
        assert_eq!(node.write_calls(), 2);
        let info = node.get_shard_info(&replica).await.unwrap();
        assert_eq!(info.resource_count, 1);
    }

    #[tokio::test]
    async fn unsynchronized_failures_are_consumed() {
        let node = MemoryIndexNode::new("n1");
        let kb = KbId::from("kb");
        let replica = node
            .new_shard(&kb, VectorSimilarity::Cosine, ReleaseChannel::Stable)
            .await
            .unwrap();
        node.unsynchronized_for(1);
        let rid = ResourceId::from("r1");
        let first = node.delete_resource(&replica, &rid).await;
        assert!(matches!(first, Err(CoordError::NodesUnsynchronized(_))));
        assert!(node.delete_resource(&replica, &rid).await.is_ok());
    }

    #[tokio::test]
    async fn backlog_drains_per_poll() {
        let node = MemoryIndexNode::new("n1");
        node.set_backlog(10, 4);
        assert_eq!(node.pending_backlog().await.unwrap(), 10);
        assert_eq!(node.pending_backlog().await.unwrap(), 6);
        assert_eq!(node.pending_backlog().await.unwrap(), 2);
        assert_eq!(node.pending_backlog().await.unwrap(), 0);
    }
}
