//! External collaborators the processor hands work to: third-party index
//! providers that replace index nodes for a knowledge box, and the queue
//! feeding generated fields back into background processing.

use crate::error::Result;
use crate::indexing::IndexMessage;
use crate::model::{FieldId, KbId, ResourceId};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

#[async_trait]
pub trait ExternalIndexProvider: Send + Sync {
    async fn index_resource(&self, rid: &ResourceId, payload: &IndexMessage) -> Result<()>;
    async fn delete_resource(&self, rid: &ResourceId) -> Result<()>;
}

/// Providers by knowledge box.
#[derive(Default)]
pub struct ExternalIndexRegistry {
    providers: DashMap<KbId, Arc<dyn ExternalIndexProvider>>,
}

impl ExternalIndexRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, kbid: KbId, provider: Arc<dyn ExternalIndexProvider>) {
        self.providers.insert(kbid, provider);
    }

    pub fn get(&self, kbid: &KbId) -> Option<Arc<dyn ExternalIndexProvider>> {
        self.providers.get(kbid).map(|entry| entry.value().clone())
    }
}

#[derive(Debug, Default)]
pub struct MemoryExternalIndex {
    documents: Mutex<BTreeMap<ResourceId, IndexMessage>>,
}

impl MemoryExternalIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, rid: &ResourceId) -> bool {
        self.documents.lock().contains_key(rid)
    }

    pub fn len(&self) -> usize {
        self.documents.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.lock().is_empty()
    }
}

#[async_trait]
impl ExternalIndexProvider for MemoryExternalIndex {
    async fn index_resource(&self, rid: &ResourceId, payload: &IndexMessage) -> Result<()> {
        self.documents.lock().insert(rid.clone(), payload.clone());
        Ok(())
    }

    async fn delete_resource(&self, rid: &ResourceId) -> Result<()> {
        self.documents.lock().remove(rid);
        Ok(())
    }
}

/// Generated fields sent back for processing.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessingRequest {
    pub kbid: KbId,
    pub uuid: ResourceId,
    pub fields: Vec<FieldId>,
}

#[async_trait]
pub trait ProcessingQueue: Send + Sync {
    async fn send(&self, request: ProcessingRequest) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryProcessingQueue {
    sent: Mutex<Vec<ProcessingRequest>>,
}

impl MemoryProcessingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<ProcessingRequest> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl ProcessingQueue for MemoryProcessingQueue {
    async fn send(&self, request: ProcessingRequest) -> Result<()> {
        self.sent.lock().push(request);
        Ok(())
    }
}
