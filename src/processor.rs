//! # Processor
//!
//! Applies ordered broker messages to the store and the index:
//!
//! ```text
//! received -> ordering checked -> applying -> indexed -> committed
//!                                                     \-> aborted / deadlettered
//! ```
//!
//! The sequence ledger is checked before any transaction is opened, so a
//! stale or duplicate delivery never touches the store. The ledger is then
//! advanced in the same transaction as the mutation it guards.

use crate::config::{CoordinatorConfig, DeploymentMode};
use crate::deadletter::Deadletter;
use crate::error::{CoordError, Result};
use crate::external::{ExternalIndexRegistry, ProcessingQueue, ProcessingRequest};
use crate::indexing::{field_key, IndexMessage};
use crate::ledger::SequenceLedger;
use crate::locks::{resource_lock_key, LockProvider};
use crate::model::{
    BrokerMessage, CatalogEntry, FieldError, FieldErrorCode, FieldId, FieldType, KbId,
    KnowledgeBoxConfig, MessageSource, MessageType, Resource, ResourceId, ResourceStatus, ShardId,
    ShardObject, WriteType,
};
use crate::notify::{self, AuditInfo, Notification, NotificationAction, Publisher};
use crate::shards::ShardManager;
use crate::store::{self, keys, KvStore, Transaction};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// Terminal outcome of a successfully processed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Committed { write_type: WriteType },
    /// The knowledge box does not exist; the message was dropped.
    Skipped,
}

struct Applied {
    write_type: WriteType,
    slug: Option<String>,
    generated: Vec<FieldId>,
    audit: AuditInfo,
    indexed: bool,
}

enum Step {
    Applied(Applied),
    Skipped,
}

pub struct Processor {
    store: Arc<dyn KvStore>,
    shards: Arc<ShardManager>,
    ledger: SequenceLedger,
    deadletter: Deadletter,
    publisher: Arc<dyn Publisher>,
    locks: Arc<dyn LockProvider>,
    external: Arc<ExternalIndexRegistry>,
    processing: Option<Arc<dyn ProcessingQueue>>,
    enforce_ordering: bool,
    max_paragraphs_per_resource: usize,
    auto_split_on_write: bool,
}

impl Processor {
    pub fn new(
        store: Arc<dyn KvStore>,
        shards: Arc<ShardManager>,
        publisher: Arc<dyn Publisher>,
        locks: Arc<dyn LockProvider>,
        config: &CoordinatorConfig,
    ) -> Self {
        Self {
            ledger: SequenceLedger::new(store.clone()),
            deadletter: Deadletter::new(store.clone()),
            store,
            shards,
            publisher,
            locks,
            external: Arc::new(ExternalIndexRegistry::new()),
            processing: None,
            enforce_ordering: config.processor.enforce_ordering,
            max_paragraphs_per_resource: config.processor.max_paragraphs_per_resource,
            // Cluster deployments split from the sampling notification handler.
            auto_split_on_write: config.processor.auto_split_on_write
                && config.mode == DeploymentMode::Standalone,
        }
    }

    pub fn with_external_indexes(mut self, registry: Arc<ExternalIndexRegistry>) -> Self {
        self.external = registry;
        self
    }

    pub fn with_processing_queue(mut self, queue: Arc<dyn ProcessingQueue>) -> Self {
        self.processing = Some(queue);
        self
    }

    pub fn ledger(&self) -> &SequenceLedger {
        &self.ledger
    }

    pub fn deadletter(&self) -> &Deadletter {
        &self.deadletter
    }

    /// Apply one delivery. `seqid` is `None` for unpartitioned synchronous
    /// calls, which skip the ordering gate and surface errors unwrapped.
    #[instrument(
        skip_all,
        fields(kbid = %message.kbid, rid = %message.uuid, seqid = ?seqid, partition = %partition)
    )]
    pub async fn process(
        &self,
        message: BrokerMessage,
        seqid: Option<u64>,
        partition: &str,
    ) -> Result<ProcessOutcome> {
        if let Some(seqid) = seqid {
            if self.enforce_ordering {
                self.ledger.check(partition, seqid).await?;
            }
        }
        match message.message_type {
            MessageType::Delete => self.delete_resource(&message, seqid, partition).await,
            MessageType::Autocommit => self.apply_transaction(vec![message], seqid, partition).await,
            MessageType::Multi | MessageType::Commit | MessageType::Rollback => {
                Err(CoordError::Unsupported(format!(
                    "{:?} messages are not supported",
                    message.message_type
                )))
            }
        }
    }

    /// Delete a resource from its shard replicas (or external index) and
    /// from the store.
    pub async fn delete_resource(
        &self,
        message: &BrokerMessage,
        seqid: Option<u64>,
        partition: &str,
    ) -> Result<ProcessOutcome> {
        let mut txn = self.store.begin().await?;
        let applied = self
            .delete_in(txn.as_mut(), message, seqid, partition)
            .await;
        let result = match applied {
            Ok(outcome) => txn.commit().await.map(|_| outcome),
            Err(err) => {
                abort_quietly(txn).await;
                Err(err)
            }
        };

        match result {
            Ok(ProcessOutcome::Skipped) => Ok(ProcessOutcome::Skipped),
            Ok(outcome) => {
                info!("resource deleted");
                let audit = audit_for(message, None);
                self.notify(message, seqid, partition, NotificationAction::Commit, WriteType::Deleted, audit)
                    .await;
                Ok(outcome)
            }
            Err(err) => {
                warn!(error = %err, "resource delete aborted");
                let audit = audit_for(message, Some(&err));
                self.notify(message, seqid, partition, NotificationAction::Abort, WriteType::Deleted, audit)
                    .await;
                Err(err)
            }
        }
    }

    async fn delete_in(
        &self,
        txn: &mut dyn Transaction,
        message: &BrokerMessage,
        seqid: Option<u64>,
        partition: &str,
    ) -> Result<ProcessOutcome> {
        let kbid = &message.kbid;
        let rid = &message.uuid;
        let Some(kb) = self.kb_config(txn, kbid).await? else {
            warn!("knowledge box not found, dropping delete");
            self.advance_ledger(txn, seqid, partition).await?;
            return Ok(ProcessOutcome::Skipped);
        };

        {
            let _guard = self.locks.acquire(&resource_lock_key(kbid, rid)).await?;
            if kb.external_index {
                self.external_provider(kbid)?.delete_resource(rid).await?;
            } else {
                let assigned: Option<ShardId> =
                    store::get_value(txn, &keys::resource_shard(kbid, rid)).await?;
                if let Some(assigned) = assigned {
                    let catalog = self.shards.get_shards_by_kb(txn, kbid).await?;
                    match catalog.as_ref().map(|c| (c.find(&assigned), c)) {
                        Some((Some(shard), _)) => self.shards.delete_resource(shard, rid).await?,
                        Some((None, catalog)) => {
                            // Deletes are keyed by resource id; shards without it are unaffected.
                            warn!(shard = %assigned, "assigned shard no longer in catalog, deleting from all shards");
                            for shard in &catalog.shards {
                                self.shards.delete_resource(shard, rid).await?;
                            }
                        }
                        None => warn!(shard = %assigned, "knowledge box has no shards"),
                    }
                }
            }
            txn.delete(&keys::resource_shard(kbid, rid)).await?;
        }

        let existing: Option<Resource> = store::get_value(txn, &keys::resource(kbid, rid)).await?;
        if let Some(slug) = existing.and_then(|resource| resource.slug) {
            let owner: Option<ResourceId> = store::get_value(txn, &keys::slug(kbid, &slug)).await?;
            if owner.as_ref() == Some(rid) {
                txn.delete(&keys::slug(kbid, &slug)).await?;
            }
        }
        txn.delete(&keys::catalog(kbid, rid)).await?;
        txn.delete(&keys::resource(kbid, rid)).await?;
        self.advance_ledger(txn, seqid, partition).await?;
        Ok(ProcessOutcome::Committed {
            write_type: WriteType::Deleted,
        })
    }

    /// Fold `messages` into their resource, index it and commit, all in one
    /// transaction. Every message must target the same resource.
    pub async fn apply_transaction(
        &self,
        messages: Vec<BrokerMessage>,
        seqid: Option<u64>,
        partition: &str,
    ) -> Result<ProcessOutcome> {
        let first = messages
            .first()
            .ok_or_else(|| CoordError::InvalidMessage("empty message batch".to_string()))?;
        if messages
            .iter()
            .any(|m| m.kbid != first.kbid || m.uuid != first.uuid)
        {
            return Err(CoordError::InvalidMessage(
                "batch spans more than one resource".to_string(),
            ));
        }

        let mut created_shard: Option<ShardObject> = None;
        let mut txn = self.store.begin().await?;
        let applied = self
            .apply_in(txn.as_mut(), &messages, seqid, partition, &mut created_shard)
            .await;
        let result = match applied {
            Ok(step) => txn.commit().await.map(|_| step),
            Err(err) => {
                abort_quietly(txn).await;
                Err(err)
            }
        };

        match result {
            Ok(Step::Skipped) => Ok(ProcessOutcome::Skipped),
            Ok(Step::Applied(applied)) => {
                self.after_commit(first, seqid, partition, applied).await
            }
            Err(err) => {
                if let Some(shard) = created_shard {
                    self.shards.rollback_shard(&shard).await;
                }
                Err(self.handle_failure(&messages, seqid, partition, err).await)
            }
        }
    }

    async fn apply_in(
        &self,
        txn: &mut dyn Transaction,
        messages: &[BrokerMessage],
        seqid: Option<u64>,
        partition: &str,
        created_shard: &mut Option<ShardObject>,
    ) -> Result<Step> {
        let Some(first) = messages.first() else {
            return Ok(Step::Skipped);
        };
        let kbid = &first.kbid;
        let rid = &first.uuid;
        let Some(kb) = self.kb_config(txn, kbid).await? else {
            warn!("knowledge box not found, dropping message");
            self.advance_ledger(txn, seqid, partition).await?;
            return Ok(Step::Skipped);
        };

        let now = Utc::now();
        let existing: Option<Resource> = store::get_value(txn, &keys::resource(kbid, rid)).await?;
        let created = existing.is_none();
        let mut resource = existing.unwrap_or_else(|| Resource::new(kbid.clone(), rid.clone(), now));
        let mut generated = Vec::new();
        for message in messages {
            apply_message(&mut resource, message, now, &mut generated);
        }

        let reindex = messages.iter().any(|m| m.reindex);
        if !resource.modified && !reindex {
            debug!("message carried no changes");
            self.advance_ledger(txn, seqid, partition).await?;
            return Ok(Step::Applied(Applied {
                write_type: WriteType::Unset,
                slug: None,
                generated,
                audit: audit_for(first, None),
                indexed: false,
            }));
        }

        let mut index_message = IndexMessage::from_resource(&resource);
        if let Err(err) = index_message.check_indexable(self.max_paragraphs_per_resource) {
            warn!(error = %err, "resource not indexable, leaving oversized fields out");
            let dropped = index_message.shed_fields(self.max_paragraphs_per_resource);
            for (id, field) in resource.fields.iter_mut() {
                if dropped.contains(&field_key(id)) {
                    field.error = Some(FieldError {
                        code: FieldErrorCode::Index,
                        message: err.to_string(),
                    });
                }
            }
            resource.basic.status = ResourceStatus::Error;
            index_message.set_status(ResourceStatus::Error);
        }
        index_message.txid = first.transaction_id.clone();
        index_message.partition = seqid.map(|_| partition.to_string());

        let shard = if kb.external_index {
            self.external_provider(kbid)?
                .index_resource(rid, &index_message)
                .await?;
            None
        } else {
            let shard = self.assign_shard(txn, &kb, rid, created_shard).await?;
            index_message.shard = Some(shard.shard.clone());
            self.shards.add_resource(&shard, &index_message).await?;
            Some(shard.shard)
        };

        store::set_value(txn, &keys::resource(kbid, rid), &resource).await?;
        store::set_value(
            txn,
            &keys::catalog(kbid, rid),
            &CatalogEntry::from_resource(&resource, shard),
        )
        .await?;
        self.advance_ledger(txn, seqid, partition).await?;

        let mut audit = audit_for(first, None);
        audit.field_count = index_message.field_count();
        audit.paragraph_count = index_message.paragraph_count();
        Ok(Step::Applied(Applied {
            write_type: if created {
                WriteType::Created
            } else {
                WriteType::Modified
            },
            slug: resource.slug.clone(),
            generated,
            audit,
            indexed: !kb.external_index,
        }))
    }

    /// Resolve the shard of `rid`, assigning the active shard (creating the
    /// first one when needed) if it has none or its shard is gone.
    async fn assign_shard(
        &self,
        txn: &mut dyn Transaction,
        kb: &KnowledgeBoxConfig,
        rid: &ResourceId,
        created_shard: &mut Option<ShardObject>,
    ) -> Result<ShardObject> {
        let kbid = &kb.kbid;
        let _guard = self.locks.acquire(&resource_lock_key(kbid, rid)).await?;
        let catalog = self.shards.get_shards_by_kb(txn, kbid).await?;
        let assigned: Option<ShardId> =
            store::get_value(txn, &keys::resource_shard(kbid, rid)).await?;

        if let Some(assigned) = &assigned {
            if let Some(shard) = catalog.as_ref().and_then(|c| c.find(assigned)) {
                return Ok(shard.clone());
            }
            warn!(shard = %assigned, "assigned shard no longer in catalog, reassigning");
        }

        let shard = match catalog.as_ref().and_then(|c| c.actual_shard()) {
            Some(active) => active.clone(),
            None => {
                let shard = self
                    .shards
                    .create_shard(txn, kbid, &kb.semantic_model, kb.release_channel)
                    .await?;
                *created_shard = Some(shard.clone());
                shard
            }
        };
        store::set_value(txn, &keys::resource_shard(kbid, rid), &shard.shard).await?;
        Ok(shard)
    }

    async fn after_commit(
        &self,
        first: &BrokerMessage,
        seqid: Option<u64>,
        partition: &str,
        applied: Applied,
    ) -> Result<ProcessOutcome> {
        let kbid = &first.kbid;
        let rid = &first.uuid;
        if let Some(slug) = &applied.slug {
            self.reserve_slug(kbid, rid, slug).await;
        }
        if !applied.generated.is_empty() {
            self.queue_generated(kbid, rid, applied.generated).await;
        }
        info!(write_type = ?applied.write_type, "resource committed");
        self.notify(
            first,
            seqid,
            partition,
            NotificationAction::Commit,
            applied.write_type,
            applied.audit,
        )
        .await;
        if applied.indexed && self.auto_split_on_write {
            if let Err(err) = self.shards.check_active_shard(kbid).await {
                warn!(error = %err, "shard size check failed");
            }
        }
        Ok(ProcessOutcome::Committed {
            write_type: applied.write_type,
        })
    }

    /// Deadletter, publish the abort and flag the resource. Returns the
    /// error to hand back to the caller.
    async fn handle_failure(
        &self,
        messages: &[BrokerMessage],
        seqid: Option<u64>,
        partition: &str,
        err: CoordError,
    ) -> CoordError {
        error!(error = %err, "transaction aborted");
        let Some(first) = messages.first() else {
            return err;
        };
        if let Some(seqid) = seqid {
            if let Err(dl_err) = self.deadletter.put(partition, seqid, messages, &err).await {
                error!(error = %dl_err, "failed to deadletter message");
            }
        }
        let audit = audit_for(first, Some(&err));
        self.notify(first, seqid, partition, NotificationAction::Abort, WriteType::Unset, audit)
            .await;

        match seqid {
            Some(seqid) => {
                self.mark_error(&first.kbid, &first.uuid).await;
                CoordError::Deadlettered {
                    partition: partition.to_string(),
                    seqid,
                    source: Box::new(err),
                }
            }
            None => err,
        }
    }

    /// Best effort: flag an existing resource as failed.
    async fn mark_error(&self, kbid: &KbId, rid: &ResourceId) {
        let result: Result<()> = async {
            let mut txn = self.store.begin().await?;
            let existing: Option<Resource> =
                store::get_value(txn.as_mut(), &keys::resource(kbid, rid)).await?;
            let Some(mut resource) = existing else {
                return txn.abort().await;
            };
            resource.basic.status = ResourceStatus::Error;
            resource.touch(Utc::now());
            let shard: Option<ShardId> =
                store::get_value(txn.as_mut(), &keys::resource_shard(kbid, rid)).await?;
            store::set_value(txn.as_mut(), &keys::resource(kbid, rid), &resource).await?;
            store::set_value(
                txn.as_mut(),
                &keys::catalog(kbid, rid),
                &CatalogEntry::from_resource(&resource, shard),
            )
            .await?;
            txn.commit().await
        }
        .await;
        if let Err(err) = result {
            warn!(error = %err, "failed to mark resource as errored");
        }
    }

    /// Slugs are reserved after the main commit in their own transaction so
    /// a conflict never rolls back the write.
    async fn reserve_slug(&self, kbid: &KbId, rid: &ResourceId, slug: &str) {
        let result: Result<()> = async {
            let mut txn = self.store.begin().await?;
            let key = keys::slug(kbid, slug);
            let owner: Option<ResourceId> = store::get_value(txn.as_mut(), &key).await?;
            match owner {
                Some(owner) if &owner == rid => txn.abort().await,
                Some(owner) => {
                    warn!(slug, owner = %owner, "slug already taken");
                    txn.abort().await
                }
                None => {
                    store::set_value(txn.as_mut(), &key, rid).await?;
                    txn.commit().await
                }
            }
        }
        .await;
        if let Err(err) = result {
            warn!(slug, error = %err, "slug reservation failed");
        }
    }

    async fn queue_generated(&self, kbid: &KbId, rid: &ResourceId, fields: Vec<FieldId>) {
        let Some(queue) = &self.processing else {
            debug!(fields = fields.len(), "no processing queue, generated fields not sent");
            return;
        };
        let request = ProcessingRequest {
            kbid: kbid.clone(),
            uuid: rid.clone(),
            fields,
        };
        if let Err(err) = queue.send(request).await {
            warn!(error = %err, "failed to queue generated fields");
        }
    }

    async fn notify(
        &self,
        message: &BrokerMessage,
        seqid: Option<u64>,
        partition: &str,
        action: NotificationAction,
        write_type: WriteType,
        audit: AuditInfo,
    ) {
        let notification = Notification {
            kbid: message.kbid.clone(),
            uuid: message.uuid.clone(),
            seqid,
            partition: seqid.map(|_| partition.to_string()),
            action,
            write_type,
            timestamp: Utc::now(),
            audit,
        };
        if let Err(err) = notify::publish(self.publisher.as_ref(), &notification).await {
            warn!(error = %err, "failed to publish notification");
        }
    }

    async fn kb_config(
        &self,
        txn: &mut dyn Transaction,
        kbid: &KbId,
    ) -> Result<Option<KnowledgeBoxConfig>> {
        store::get_value(txn, &keys::kb_config(kbid)).await
    }

    async fn advance_ledger(
        &self,
        txn: &mut dyn Transaction,
        seqid: Option<u64>,
        partition: &str,
    ) -> Result<()> {
        match seqid {
            Some(seqid) => SequenceLedger::advance(txn, partition, seqid).await,
            None => Ok(()),
        }
    }

    fn external_provider(
        &self,
        kbid: &KbId,
    ) -> Result<Arc<dyn crate::external::ExternalIndexProvider>> {
        self.external.get(kbid).ok_or_else(|| {
            CoordError::Unsupported(format!("no external index provider registered for {kbid}"))
        })
    }
}

async fn abort_quietly(txn: Box<dyn Transaction>) {
    if let Err(err) = txn.abort().await {
        warn!(error = %err, "transaction abort failed");
    }
}

fn audit_for(message: &BrokerMessage, err: Option<&CoordError>) -> AuditInfo {
    AuditInfo {
        source: message.source,
        transaction_id: message.transaction_id.clone(),
        processing_id: message.processing_id.clone(),
        field_count: 0,
        paragraph_count: 0,
        error: err.map(|e| e.to_string()),
    }
}

fn carries_changes(message: &BrokerMessage) -> bool {
    message.slug.is_some()
        || message.basic.is_some()
        || !message.fields.is_empty()
        || !message.delete_fields.is_empty()
        || !message.extracted_text.is_empty()
        || !message.vectors.is_empty()
        || !message.relations.is_empty()
        || !message.generated.is_empty()
        || !message.errors.is_empty()
}

/// Fold one message into the resource. Generated field ids are appended to
/// `generated`.
fn apply_message(
    resource: &mut Resource,
    message: &BrokerMessage,
    now: DateTime<Utc>,
    generated: &mut Vec<FieldId>,
) {
    if !carries_changes(message) {
        return;
    }
    if let Some(slug) = &message.slug {
        resource.slug = Some(slug.clone());
    }
    if let Some(basic) = &message.basic {
        if let Some(title) = &basic.title {
            resource.basic.title = title.clone();
        }
        if let Some(summary) = &basic.summary {
            resource.basic.summary = summary.clone();
        }
        if let Some(labels) = &basic.labels {
            resource.basic.labels = labels.clone();
        }
    }
    for update in &message.fields {
        let field = resource.field_mut(&update.field);
        field.value = Some(update.value.clone());
        field.error = None;
    }
    for id in &message.delete_fields {
        resource.fields.remove(id);
    }
    for extracted in &message.extracted_text {
        resource.field_mut(&extracted.field).extracted_text = Some(extracted.text.clone());
    }
    for vectors in &message.vectors {
        resource.field_mut(&vectors.field).vectors = vectors.vectors.clone();
    }
    for relations in &message.relations {
        resource.field_mut(&relations.field).relations = relations.relations.clone();
    }

    match message.source {
        MessageSource::Writer => {
            resource.basic.status = ResourceStatus::Pending;
        }
        MessageSource::Processor => {
            for field in &message.generated {
                let id = FieldId::new(FieldType::Generated, field.name.clone());
                resource.field_mut(&id).value = Some(field.text.clone());
                generated.push(id);
            }
            for failure in &message.errors {
                resource.field_mut(&failure.field).error = Some(FieldError {
                    code: FieldErrorCode::Processing,
                    message: failure.message.clone(),
                });
            }
            resource.basic.status = if message.errors.is_empty() {
                ResourceStatus::Processed
            } else {
                ResourceStatus::Error
            };
        }
    }
    resource.touch(now);
}
