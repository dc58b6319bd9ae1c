//! # kbshard
//!
//! Coordination layer of a multi-tenant sharded document index.
//!
//! Knowledge boxes (tenants) store resources in logical shards, each
//! replicated across index nodes. This crate places replicas, keeps a
//! per-knowledge-box shard catalog, moves a knowledge box onto fresh shards
//! without downtime (rollover), and applies broker messages exactly once
//! per partition with deadlettering and change notifications.

pub mod auto_split;
pub mod cluster;
pub mod config;
pub mod deadletter;
pub mod error;
pub mod external;
pub mod index_node;
pub mod indexing;
pub mod ledger;
pub mod locks;
pub mod model;
pub mod notify;
pub mod persistence;
pub mod placement;
pub mod processor;
pub mod rollover;
pub mod shards;
pub mod store;

pub use cluster::{ClusterState, IndexNode, NodeSpec};
pub use config::{CoordinatorConfig, DeploymentMode};
pub use error::{CoordError, Result};
pub use model::{BrokerMessage, KbId, KnowledgeBoxConfig, ResourceId, ShardId, ShardObject, Shards};
pub use processor::{ProcessOutcome, Processor};
pub use rollover::RolloverCoordinator;
pub use shards::ShardManager;
pub use store::{KvStore, MemoryStore, Transaction};

use auto_split::ShardCreatorHandler;
use external::{ExternalIndexRegistry, ProcessingQueue};
use locks::{LocalLocks, LockProvider};
use notify::{MemoryPublisher, Publisher};
use persistence::RocksStore;
use std::sync::Arc;
use tracing::info;

/// Wires the store, cluster, shard manager, processor and rollover
/// coordinator together.
pub struct Coordinator {
    config: CoordinatorConfig,
    store: Arc<dyn KvStore>,
    publisher: Arc<dyn Publisher>,
    shards: Arc<ShardManager>,
    processor: Processor,
    rollover: RolloverCoordinator,
    external: Arc<ExternalIndexRegistry>,
}

impl Coordinator {
    /// Build from configuration. Opens a RocksDB store when
    /// `storage.data_dir` is set, an in-memory one otherwise.
    pub fn open(config: CoordinatorConfig, cluster: Arc<ClusterState>) -> Result<Self> {
        let store: Arc<dyn KvStore> = match &config.storage.data_dir {
            Some(dir) => {
                info!(data_dir = %dir.display(), "opening persistent store");
                Arc::new(RocksStore::open(dir)?)
            }
            None => Arc::new(MemoryStore::new()),
        };
        Ok(Self::with_parts(
            config,
            cluster,
            store,
            Arc::new(MemoryPublisher::default()),
            Arc::new(LocalLocks::new()),
        ))
    }

    pub fn with_parts(
        config: CoordinatorConfig,
        cluster: Arc<ClusterState>,
        store: Arc<dyn KvStore>,
        publisher: Arc<dyn Publisher>,
        locks: Arc<dyn LockProvider>,
    ) -> Self {
        let shards = Arc::new(ShardManager::new(cluster, store.clone(), &config));
        let external = Arc::new(ExternalIndexRegistry::new());
        let processor = Processor::new(
            store.clone(),
            shards.clone(),
            publisher.clone(),
            locks.clone(),
            &config,
        )
        .with_external_indexes(external.clone());
        let rollover = RolloverCoordinator::new(shards.clone(), store.clone(), locks, &config);
        Self {
            config,
            store,
            publisher,
            shards,
            processor,
            rollover,
            external,
        }
    }

    pub fn with_processing_queue(mut self, queue: Arc<dyn ProcessingQueue>) -> Self {
        self.processor = self.processor.with_processing_queue(queue);
        self
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    pub fn publisher(&self) -> &Arc<dyn Publisher> {
        &self.publisher
    }

    pub fn shards(&self) -> &Arc<ShardManager> {
        &self.shards
    }

    pub fn processor(&self) -> &Processor {
        &self.processor
    }

    pub fn rollover(&self) -> &RolloverCoordinator {
        &self.rollover
    }

    pub fn external_indexes(&self) -> &Arc<ExternalIndexRegistry> {
        &self.external
    }

    /// Sampling auto-split handler for cluster deployments.
    pub fn shard_creator(&self) -> ShardCreatorHandler {
        ShardCreatorHandler::new(self.shards.clone(), self.config.auto_split.sample_every)
    }

    /// Register a knowledge box and create its first shard in one
    /// transaction. External-index knowledge boxes get no shard.
    pub async fn create_knowledge_box(&self, kb: KnowledgeBoxConfig) -> Result<Option<ShardObject>> {
        let mut txn = self.store.begin().await?;
        let key = store::keys::kb_config(&kb.kbid);
        if txn.get(&key).await?.is_some() {
            txn.abort().await?;
            return Err(CoordError::KnowledgeBoxExists(kb.kbid.to_string()));
        }
        if let Err(err) = store::set_value(txn.as_mut(), &key, &kb).await {
            txn.abort().await?;
            return Err(err);
        }
        if kb.external_index {
            txn.commit().await?;
            info!(kbid = %kb.kbid, "knowledge box created with external index");
            return Ok(None);
        }

        let shard = match self
            .shards
            .create_shard(txn.as_mut(), &kb.kbid, &kb.semantic_model, kb.release_channel)
            .await
        {
            Ok(shard) => shard,
            Err(err) => {
                txn.abort().await?;
                return Err(err);
            }
        };
        if let Err(err) = txn.commit().await {
            self.shards.rollback_shard(&shard).await;
            return Err(err);
        }
        info!(kbid = %kb.kbid, shard = %shard.shard, "knowledge box created");
        Ok(Some(shard))
    }

    pub async fn process(
        &self,
        message: BrokerMessage,
        seqid: Option<u64>,
        partition: &str,
    ) -> Result<ProcessOutcome> {
        self.processor.process(message, seqid, partition).await
    }

    pub async fn rollover_kb(&self, kbid: &KbId) -> Result<Vec<ResourceId>> {
        self.rollover.rollover_kb(kbid).await
    }
}
