//! # Node Registry
//!
//! Directory of the index nodes known to this process: primaries and their
//! read replicas. Owned by the process and passed by reference to the shard
//! manager and the processor.

use crate::index_node::IndexNodeClient;
use crate::model::NodeId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::info;

/// Handle to one index node.
#[derive(Clone)]
pub struct IndexNode {
    pub id: NodeId,
    pub address: String,
    pub shard_count: u64,
    pub available_disk: u64,
    /// Set when this node is a read replica of another node.
    pub primary_id: Option<NodeId>,
    pub client: Arc<dyn IndexNodeClient>,
}

impl IndexNode {
    pub fn is_read_replica(&self) -> bool {
        self.primary_id.is_some()
    }
}

impl fmt::Debug for IndexNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexNode")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("shard_count", &self.shard_count)
            .field("available_disk", &self.available_disk)
            .field("primary_id", &self.primary_id)
            .finish()
    }
}

/// Registration parameters for a node.
#[derive(Debug, Clone)]
pub struct NodeSpec {
    pub id: NodeId,
    pub address: String,
    pub shard_count: u64,
    pub available_disk: u64,
    pub primary_id: Option<NodeId>,
}

impl NodeSpec {
    pub fn primary(id: impl Into<NodeId>, available_disk: u64) -> Self {
        let id = id.into();
        Self {
            address: format!("{id}:10009"),
            id,
            shard_count: 0,
            available_disk,
            primary_id: None,
        }
    }

    pub fn read_replica_of(
        id: impl Into<NodeId>,
        primary: impl Into<NodeId>,
        available_disk: u64,
    ) -> Self {
        Self {
            primary_id: Some(primary.into()),
            ..Self::primary(id, available_disk)
        }
    }
}

#[derive(Debug, Default)]
pub struct ClusterState {
    nodes: RwLock<HashMap<NodeId, IndexNode>>,
}

impl ClusterState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a node.
    pub fn add_node(&self, spec: NodeSpec, client: Arc<dyn IndexNodeClient>) {
        info!(
            node = %spec.id,
            address = %spec.address,
            read_replica = spec.primary_id.is_some(),
            "index node registered"
        );
        let node = IndexNode {
            id: spec.id.clone(),
            address: spec.address,
            shard_count: spec.shard_count,
            available_disk: spec.available_disk,
            primary_id: spec.primary_id,
            client,
        };
        self.nodes.write().insert(spec.id, node);
    }

    pub fn remove_node(&self, id: &NodeId) -> Option<IndexNode> {
        let removed = self.nodes.write().remove(id);
        if removed.is_some() {
            info!(node = %id, "index node removed");
        }
        removed
    }

    pub fn get_node(&self, id: &NodeId) -> Option<IndexNode> {
        self.nodes.read().get(id).cloned()
    }

    /// Nodes sorted by id. Read replicas only when `include_secondary`.
    pub fn list_nodes(&self, include_secondary: bool) -> Vec<IndexNode> {
        let mut nodes: Vec<IndexNode> = self
            .nodes
            .read()
            .values()
            .filter(|node| include_secondary || !node.is_read_replica())
            .cloned()
            .collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    pub fn list_read_replicas_of(&self, primary: &NodeId) -> Vec<IndexNode> {
        let mut nodes: Vec<IndexNode> = self
            .nodes
            .read()
            .values()
            .filter(|node| node.primary_id.as_ref() == Some(primary))
            .cloned()
            .collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    /// Refresh the counters a node reports about itself.
    pub fn update_stats(&self, id: &NodeId, shard_count: u64, available_disk: u64) -> bool {
        match self.nodes.write().get_mut(id) {
            Some(node) => {
                node.shard_count = shard_count;
                node.available_disk = available_disk;
                true
            }
            None => false,
        }
    }

    pub(crate) fn record_new_replica(&self, id: &NodeId) {
        if let Some(node) = self.nodes.write().get_mut(id) {
            node.shard_count += 1;
        }
    }

    pub(crate) fn record_removed_replica(&self, id: &NodeId) {
        if let Some(node) = self.nodes.write().get_mut(id) {
            node.shard_count = node.shard_count.saturating_sub(1);
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }
}
