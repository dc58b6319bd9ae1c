//! # Rollover
//!
//! Live resharding of one knowledge box, in four steps run in order:
//!
//! 1. create a parallel shard set under the rollover key
//! 2. reindex every resource into it, pausing between batches for node
//!    backlogs to drain
//! 3. cut the catalog over to the new set and delete the old replicas
//! 4. reindex resources modified during the window, drop deleted ones
//!
//! Progress is persisted after each step so an interrupted run resumes from
//! the last completed step. There is no rollback once the cutover is
//! committed; the validation step repairs forward.

use crate::config::CoordinatorConfig;
use crate::error::{CoordError, Result};
use crate::indexing::IndexMessage;
use crate::locks::{LockGuard, LockProvider};
use crate::model::{KbId, NodeId, Resource, ResourceId, ShardId, ShardObject, Shards};
use crate::shards::{Compensations, ShardManager};
use crate::store::{self, keys, KvStore, Transaction};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

/// Completed steps of the current run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RolloverState {
    pub rollover_shards_created: bool,
    pub resources_indexed: bool,
    pub cutover_shards: bool,
    pub validated: bool,
}

/// Where and when a resource was indexed during rollover.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedRecord {
    pub shard: ShardId,
    pub modified: DateTime<Utc>,
}

pub struct RolloverCoordinator {
    shards: Arc<ShardManager>,
    store: Arc<dyn KvStore>,
    locks: Arc<dyn LockProvider>,
    batch_size: usize,
    low_water_backlog: u64,
    poll_interval: Duration,
    max_paragraphs_per_resource: usize,
}

impl RolloverCoordinator {
    pub fn new(
        shards: Arc<ShardManager>,
        store: Arc<dyn KvStore>,
        locks: Arc<dyn LockProvider>,
        config: &CoordinatorConfig,
    ) -> Self {
        Self {
            shards,
            store,
            locks,
            batch_size: config.rollover.batch_size,
            low_water_backlog: config.rollover.low_water_backlog,
            poll_interval: config.rollover.poll_interval(),
            max_paragraphs_per_resource: config.processor.max_paragraphs_per_resource,
        }
    }

    /// Run (or resume) a full rollover. Returns the resources repaired by
    /// validation.
    #[instrument(skip_all, fields(kbid = %kbid))]
    pub async fn rollover_kb(&self, kbid: &KbId) -> Result<Vec<ResourceId>> {
        let _guard = self.lock(kbid).await?;
        let mut state = self.state(kbid).await?;
        if state.validated {
            state = RolloverState::default();
            self.save_state(kbid, state).await?;
        }

        if !state.rollover_shards_created {
            self.create_rollover_shards(kbid)
                .await
                .map_err(|err| unexpected("create rollover shards", err))?;
        }
        if !self.state(kbid).await?.resources_indexed {
            self.index_rollover_shards(kbid)
                .await
                .map_err(|err| unexpected("index rollover shards", err))?;
        }
        if !self.state(kbid).await?.cutover_shards {
            self.cutover_shards(kbid)
                .await
                .map_err(|err| unexpected("cutover shards", err))?;
        }
        let repaired = self
            .validate_indexed_data(kbid)
            .await
            .map_err(|err| unexpected("validate indexed data", err))?;
        info!(repaired = repaired.len(), "rollover completed");
        Ok(repaired)
    }

    async fn lock(&self, kbid: &KbId) -> Result<LockGuard> {
        self.locks.acquire(&format!("rollover-{kbid}")).await
    }

    pub async fn state(&self, kbid: &KbId) -> Result<RolloverState> {
        Ok(self
            .store
            .read(&keys::rollover_state(kbid))
            .await?
            .map(|bytes| store::decode(&bytes))
            .transpose()?
            .unwrap_or_default())
    }

    async fn save_state(&self, kbid: &KbId, state: RolloverState) -> Result<()> {
        let mut txn = self.store.begin().await?;
        store::set_value(txn.as_mut(), &keys::rollover_state(kbid), &state).await?;
        txn.commit().await
    }

    /// Allocate a new replica set for every shard of the catalog and store it
    /// under the rollover key. A stale set from an earlier run is deleted first.
    #[instrument(skip_all, fields(kbid = %kbid))]
    pub async fn create_rollover_shards(&self, kbid: &KbId) -> Result<Shards> {
        let mut txn = self.store.begin().await?;
        let result = self.create_rollover_shards_in(txn.as_mut(), kbid).await;
        match result {
            Ok((rollover, compensations)) => {
                if let Err(err) = txn.commit().await {
                    compensations.unwind(self.shards.cluster()).await;
                    return Err(err);
                }
                info!(shards = rollover.shards.len(), "rollover shards created");
                Ok(rollover)
            }
            Err(err) => {
                txn.abort().await?;
                Err(err)
            }
        }
    }

    async fn create_rollover_shards_in(
        &self,
        txn: &mut dyn Transaction,
        kbid: &KbId,
    ) -> Result<(Shards, Compensations)> {
        let current = self
            .shards
            .get_shards_by_kb(txn, kbid)
            .await?
            .ok_or_else(|| CoordError::UnexpectedRollover(format!("knowledge box {kbid} has no shards")))?;

        let stale: Option<Shards> = store::get_value(txn, &keys::rollover_shards(kbid)).await?;
        if let Some(stale) = stale {
            warn!(shards = stale.shards.len(), "rolling back stale rollover shards");
            for shard in &stale.shards {
                self.shards.rollback_shard(shard).await;
            }
            txn.delete(&keys::rollover_shards(kbid)).await?;
        }
        for key in txn.scan_keys(&keys::rollover_indexed_prefix(kbid)).await? {
            txn.delete(&key).await?;
        }

        let mut rollover = Shards {
            kbid: kbid.clone(),
            shards: Vec::with_capacity(current.shards.len()),
            actual: current.actual,
            semantic_model: current.semantic_model.clone(),
            release_channel: current.release_channel,
        };
        let mut compensations = Compensations::default();
        for shard in &current.shards {
            let avoid: Vec<NodeId> = rollover.node_ids();
            let created = self
                .shards
                .create_replicas(
                    kbid,
                    ShardId::generate(),
                    &current.semantic_model,
                    current.release_channel,
                    &avoid,
                    &mut compensations,
                )
                .await;
            match created {
                Ok(mut replacement) => {
                    replacement.read_only = shard.read_only;
                    rollover.shards.push(replacement);
                }
                Err(err) => {
                    warn!(error = %err, "rollover shard creation failed, rolling back");
                    compensations.unwind(self.shards.cluster()).await;
                    return Err(err);
                }
            }
        }

        store::set_value(txn, &keys::rollover_shards(kbid), &rollover).await?;
        let state = RolloverState {
            rollover_shards_created: true,
            ..RolloverState::default()
        };
        store::set_value(txn, &keys::rollover_state(kbid), &state).await?;
        Ok((rollover, compensations))
    }

    /// Reindex every resource into the matching rollover shard.
    #[instrument(skip_all, fields(kbid = %kbid))]
    pub async fn index_rollover_shards(&self, kbid: &KbId) -> Result<usize> {
        let current = self.committed_catalog(kbid).await?;
        let rollover: Shards = self
            .read_value(&keys::rollover_shards(kbid))
            .await?
            .ok_or_else(|| CoordError::UnexpectedRollover("rollover shards missing".to_string()))?;

        let rids = self.resource_ids(kbid).await?;
        let nodes = rollover.node_ids();
        let mut indexed = 0;
        for batch in rids.chunks(self.batch_size) {
            for rid in batch {
                let Some(resource) = self.read_resource(kbid, rid).await? else {
                    continue;
                };
                let record: Option<IndexedRecord> =
                    self.read_value(&keys::rollover_indexed(kbid, rid)).await?;
                if record.is_some_and(|r| r.modified == resource.basic.modified) {
                    continue;
                }
                let assigned: Option<ShardId> =
                    self.read_value(&keys::resource_shard(kbid, rid)).await?;
                let target = matching_rollover_shard(&current, &rollover, assigned.as_ref())?;
                self.index_resource(&resource, target, false).await?;
                indexed += 1;
            }
            for node in &nodes {
                self.shards
                    .wait_for_node(node, self.low_water_backlog, self.poll_interval)
                    .await?;
            }
        }

        let mut state = self.state(kbid).await?;
        state.resources_indexed = true;
        self.save_state(kbid, state).await?;
        info!(resources = rids.len(), indexed, "rollover shards indexed");
        Ok(indexed)
    }

    /// Swap the catalog to the rollover set, then delete the old replicas.
    #[instrument(skip_all, fields(kbid = %kbid))]
    pub async fn cutover_shards(&self, kbid: &KbId) -> Result<()> {
        let mut txn = self.store.begin().await?;
        let previous = match self.cutover_in(txn.as_mut(), kbid).await {
            Ok(previous) => previous,
            Err(err) => {
                txn.abort().await?;
                return Err(err);
            }
        };
        txn.commit().await?;
        info!(old_shards = previous.shards.len(), "catalog cut over to rollover shards");

        for shard in &previous.shards {
            self.shards.rollback_shard(shard).await;
        }
        Ok(())
    }

    async fn cutover_in(&self, txn: &mut dyn Transaction, kbid: &KbId) -> Result<Shards> {
        let previous = self
            .shards
            .get_shards_by_kb(txn, kbid)
            .await?
            .ok_or_else(|| CoordError::UnexpectedRollover(format!("knowledge box {kbid} has no shards")))?;
        let rollover: Shards = store::get_value(txn, &keys::rollover_shards(kbid))
            .await?
            .ok_or_else(|| CoordError::UnexpectedRollover("rollover shards missing".to_string()))?;

        store::set_value(txn, &keys::shards(kbid), &rollover).await?;
        txn.delete(&keys::rollover_shards(kbid)).await?;

        for key in txn.scan_keys(&keys::rollover_indexed_prefix(kbid)).await? {
            let rid = ResourceId::from(keys::leaf(&key));
            let record: Option<IndexedRecord> = store::get_value(txn, &key).await?;
            if let Some(record) = record {
                store::set_value(txn, &keys::resource_shard(kbid, &rid), &record.shard).await?;
            }
        }

        let mut state: RolloverState = store::get_value(txn, &keys::rollover_state(kbid))
            .await?
            .unwrap_or_default();
        state.cutover_shards = true;
        store::set_value(txn, &keys::rollover_state(kbid), &state).await?;
        Ok(previous)
    }

    /// Reindex resources changed since they were indexed and remove the
    /// ones deleted meanwhile. Returns the repaired resource ids.
    #[instrument(skip_all, fields(kbid = %kbid))]
    pub async fn validate_indexed_data(&self, kbid: &KbId) -> Result<Vec<ResourceId>> {
        let catalog = self.committed_catalog(kbid).await?;
        let rids = self.resource_ids(kbid).await?;
        let mut repaired = Vec::new();

        for rid in &rids {
            let Some(resource) = self.read_resource(kbid, rid).await? else {
                continue;
            };
            let record: Option<IndexedRecord> =
                self.read_value(&keys::rollover_indexed(kbid, rid)).await?;
            let stale = match &record {
                None => true,
                Some(record) => {
                    resource.basic.modified > record.modified || catalog.find(&record.shard).is_none()
                }
            };
            if !stale {
                continue;
            }
            let assigned: Option<ShardId> =
                self.read_value(&keys::resource_shard(kbid, rid)).await?;
            let target = assigned
                .as_ref()
                .and_then(|shard| catalog.find(shard))
                .or_else(|| catalog.actual_shard())
                .ok_or_else(|| CoordError::UnexpectedRollover("catalog has no active shard".to_string()))?;
            self.index_resource(&resource, target, true).await?;
            repaired.push(rid.clone());
        }

        let live: BTreeSet<&ResourceId> = rids.iter().collect();
        for (rid, record) in self.indexed_records(kbid).await? {
            if live.contains(&rid) {
                continue;
            }
            if let Some(shard) = catalog.find(&record.shard) {
                self.shards.delete_resource(shard, &rid).await?;
            }
            let mut txn = self.store.begin().await?;
            txn.delete(&keys::rollover_indexed(kbid, &rid)).await?;
            txn.delete(&keys::resource_shard(kbid, &rid)).await?;
            txn.commit().await?;
            repaired.push(rid);
        }

        let mut state = self.state(kbid).await?;
        state.validated = true;
        self.save_state(kbid, state).await?;
        if !repaired.is_empty() {
            info!(repaired = repaired.len(), "rollover validation repaired resources");
        }
        Ok(repaired)
    }

    /// Write `resource` into `target` and record it as indexed. After cutover
    /// `assign` also points the resource's shard assignment at `target`.
    async fn index_resource(
        &self,
        resource: &Resource,
        target: &ShardObject,
        assign: bool,
    ) -> Result<()> {
        let kbid = &resource.kbid;
        let mut message = IndexMessage::from_resource(resource);
        if message
            .check_indexable(self.max_paragraphs_per_resource)
            .is_err()
        {
            let dropped = message.shed_fields(self.max_paragraphs_per_resource);
            warn!(rid = %resource.uuid, ?dropped, "resource too large, fields left out of rollover index");
        }
        message.shard = Some(target.shard.clone());
        self.shards.add_resource(target, &message).await?;

        let record = IndexedRecord {
            shard: target.shard.clone(),
            modified: resource.basic.modified,
        };
        let mut txn = self.store.begin().await?;
        store::set_value(txn.as_mut(), &keys::rollover_indexed(kbid, &resource.uuid), &record).await?;
        if assign {
            store::set_value(txn.as_mut(), &keys::resource_shard(kbid, &resource.uuid), &target.shard)
                .await?;
        }
        txn.commit().await
    }

    async fn committed_catalog(&self, kbid: &KbId) -> Result<Shards> {
        self.shards
            .get_committed_shards(kbid)
            .await?
            .ok_or_else(|| CoordError::UnexpectedRollover(format!("knowledge box {kbid} has no shards")))
    }

    async fn read_value<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.store
            .read(key)
            .await?
            .map(|bytes| store::decode(&bytes))
            .transpose()
    }

    async fn read_resource(&self, kbid: &KbId, rid: &ResourceId) -> Result<Option<Resource>> {
        self.read_value(&keys::resource(kbid, rid)).await
    }

    async fn resource_ids(&self, kbid: &KbId) -> Result<Vec<ResourceId>> {
        let mut txn = self.store.begin().await?;
        let keys = txn.scan_keys(&keys::resources_prefix(kbid)).await?;
        txn.abort().await?;
        Ok(keys
            .iter()
            .map(|key| ResourceId::from(keys::leaf(key)))
            .collect())
    }

    async fn indexed_records(&self, kbid: &KbId) -> Result<Vec<(ResourceId, IndexedRecord)>> {
        let mut txn = self.store.begin().await?;
        let mut records = Vec::new();
        for key in txn.scan_keys(&keys::rollover_indexed_prefix(kbid)).await? {
            if let Some(record) = store::get_value(txn.as_mut(), &key).await? {
                records.push((ResourceId::from(keys::leaf(&key)), record));
            }
        }
        txn.abort().await?;
        Ok(records)
    }
}

/// Rollover shard taking the place of the resource's current shard.
fn matching_rollover_shard<'a>(
    current: &Shards,
    rollover: &'a Shards,
    assigned: Option<&ShardId>,
) -> Result<&'a ShardObject> {
    assigned
        .and_then(|shard| current.position(shard))
        .and_then(|idx| rollover.shards.get(idx))
        .or_else(|| rollover.actual_shard())
        .ok_or_else(|| CoordError::UnexpectedRollover("rollover set has no active shard".to_string()))
}

fn unexpected(step: &str, err: CoordError) -> CoordError {
    match err {
        CoordError::UnexpectedRollover(_) => err,
        other => CoordError::UnexpectedRollover(format!("{step}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ReleaseChannel, SemanticModel, ShardReplica};

    fn catalog(ids: &[&str]) -> Shards {
        let mut shards = Shards::new(KbId::from("kb"), SemanticModel::default(), ReleaseChannel::Stable);
        for id in ids {
            let mut shard = ShardObject::new(ShardId::from(*id));
            shard.replicas.push(ShardReplica {
                node: NodeId::from("n1"),
                replica: (*id).into(),
            });
            shards.push_active(shard);
        }
        shards
    }

    #[test]
    fn rollover_shard_matches_by_position() {
        let current = catalog(&["old-a", "old-b"]);
        let rollover = catalog(&["new-a", "new-b"]);
        let target =
            matching_rollover_shard(&current, &rollover, Some(&ShardId::from("old-a"))).unwrap();
        assert_eq!(target.shard, ShardId::from("new-a"));
        let fallback = matching_rollover_shard(&current, &rollover, None).unwrap();
        assert_eq!(fallback.shard, ShardId::from("new-b"));
    }

    #[test]
    fn errors_are_reported_as_unexpected_rollover() {
        let err = unexpected("cutover shards", CoordError::Store("disk".to_string()));
        assert!(matches!(err, CoordError::UnexpectedRollover(msg) if msg.starts_with("cutover shards")));
    }
}
