//! # Shard Placement
//!
//! Pure ranking over the node registry: replica selection for reads and
//! writes, primary ranking for new replicas, and the capacity gate checked
//! before any replica is created.

use crate::cluster::{ClusterState, IndexNode};
use crate::error::{CoordError, Result};
use crate::model::{NodeId, ReplicaId, ShardObject};
use rand::seq::IndexedRandom;

const PREFERRED_BIT: u8 = 0b10;
const READ_REPLICA_BIT: u8 = 0b01;

/// A node able to serve a given replica.
#[derive(Debug, Clone)]
pub struct ReplicaCandidate {
    pub node: IndexNode,
    pub replica: ReplicaId,
    pub score: u8,
}

/// Score every node backing `shard` and return the candidates, unordered.
pub fn replica_candidates(
    cluster: &ClusterState,
    shard: &ShardObject,
    preferred: &[ReplicaId],
    use_read_replicas: bool,
) -> Vec<ReplicaCandidate> {
    let mut candidates = Vec::new();
    for shard_replica in &shard.replicas {
        let preferred_bit = if preferred.contains(&shard_replica.replica) {
            PREFERRED_BIT
        } else {
            0
        };
        if use_read_replicas {
            // Read replicas mirror the primary's replica id, and stay eligible
            // after the primary itself deregisters.
            for secondary in cluster.list_read_replicas_of(&shard_replica.node) {
                candidates.push(ReplicaCandidate {
                    node: secondary,
                    replica: shard_replica.replica.clone(),
                    score: preferred_bit | READ_REPLICA_BIT,
                });
            }
        }
        let Some(primary) = cluster.get_node(&shard_replica.node) else {
            continue;
        };
        candidates.push(ReplicaCandidate {
            node: primary,
            replica: shard_replica.replica.clone(),
            score: preferred_bit,
        });
    }
    candidates
}

/// Pick the node and replica to serve a request for `shard`.
///
/// Candidates are grouped by score (pinned replica first, then read replica
/// when requested); one member of the best group is chosen at random.
pub fn choose_replica(
    cluster: &ClusterState,
    shard: &ShardObject,
    preferred: &[ReplicaId],
    use_read_replicas: bool,
) -> Result<(IndexNode, ReplicaId)> {
    let candidates = replica_candidates(cluster, shard, preferred, use_read_replicas);
    let best = candidates
        .iter()
        .map(|candidate| candidate.score)
        .max()
        .ok_or_else(|| CoordError::NoHealthyNode(shard.shard.to_string()))?;
    let group: Vec<&ReplicaCandidate> = candidates
        .iter()
        .filter(|candidate| candidate.score == best)
        .collect();
    let chosen = group
        .choose(&mut rand::rng())
        .ok_or_else(|| CoordError::NoHealthyNode(shard.shard.to_string()))?;
    Ok((chosen.node.clone(), chosen.replica.clone()))
}

/// Primaries by descending available disk, with `avoid` moved to the tail.
pub fn rank_primaries_for_placement(cluster: &ClusterState, avoid: &[NodeId]) -> Vec<IndexNode> {
    let mut nodes = cluster.list_nodes(false);
    nodes.sort_by(|a, b| {
        b.available_disk
            .cmp(&a.available_disk)
            .then_with(|| a.id.cmp(&b.id))
    });
    let (preferred, avoided): (Vec<IndexNode>, Vec<IndexNode>) = nodes
        .into_iter()
        .partition(|node| !avoid.contains(&node.id));
    preferred.into_iter().chain(avoided).collect()
}

pub fn is_saturated(node: &IndexNode, max_replicas_per_node: usize) -> bool {
    node.shard_count >= max_replicas_per_node as u64
}

/// Fail with `ClusterTooSmall` unless `replica_factor` unsaturated primaries exist.
pub fn check_capacity(
    cluster: &ClusterState,
    replica_factor: usize,
    max_replicas_per_node: usize,
) -> Result<()> {
    let primaries = cluster.list_nodes(false);
    if primaries.len() < replica_factor {
        return Err(CoordError::ClusterTooSmall {
            required: replica_factor,
            available: primaries.len(),
        });
    }
    let available = primaries
        .iter()
        .filter(|node| !is_saturated(node, max_replicas_per_node))
        .count();
    if available < replica_factor {
        return Err(CoordError::ClusterTooSmall {
            required: replica_factor,
            available,
        });
    }
    Ok(())
}
