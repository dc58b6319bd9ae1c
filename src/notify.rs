//! # Resource Notifications
//!
//! Every terminal outcome of the processor (commit or abort) is published on
//! the per-knowledge-box channel `{kbid}/resource-notify`. Downstream
//! handlers (auto-split, audit) learn about changes only through here.

use crate::error::Result;
use crate::model::{KbId, MessageSource, ResourceId, WriteType};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NotificationAction {
    Commit,
    Abort,
}

/// Audit metadata carried with each notification.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AuditInfo {
    pub source: MessageSource,
    pub transaction_id: Option<String>,
    pub processing_id: Option<String>,
    pub field_count: usize,
    pub paragraph_count: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub kbid: KbId,
    pub uuid: ResourceId,
    /// `None` for unpartitioned synchronous calls.
    pub seqid: Option<u64>,
    pub partition: Option<String>,
    pub action: NotificationAction,
    pub write_type: WriteType,
    pub timestamp: DateTime<Utc>,
    pub audit: AuditInfo,
}

impl Notification {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

pub fn channel(kbid: &KbId) -> String {
    format!("{kbid}/resource-notify")
}

/// Publish/subscribe transport.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<()>;
}

/// Encode and publish `notification` on its knowledge box channel.
pub async fn publish(publisher: &dyn Publisher, notification: &Notification) -> Result<()> {
    publisher
        .publish(&channel(&notification.kbid), notification.encode()?)
        .await
}

/// In-process publisher.
///
/// Cheap to clone. Keeps a log of everything published and fans out to
/// subscribers through a broadcast channel; sends without subscribers are
/// dropped.
#[derive(Clone)]
pub struct MemoryPublisher {
    tx: broadcast::Sender<(String, Vec<u8>)>,
    log: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
}

impl MemoryPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<(String, Vec<u8>)> {
        self.tx.subscribe()
    }

    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.log.lock().clone()
    }

    /// Decoded notifications published so far, in order.
    pub fn notifications(&self) -> Vec<Notification> {
        self.log
            .lock()
            .iter()
            .filter_map(|(_, payload)| Notification::decode(payload).ok())
            .collect()
    }
}

impl Default for MemoryPublisher {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl Publisher for MemoryPublisher {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<()> {
        self.log.lock().push((channel.to_string(), payload.clone()));
        let _ = self.tx.send((channel.to_string(), payload));
        Ok(())
    }
}
