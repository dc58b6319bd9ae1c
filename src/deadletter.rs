//! Durable side channel for messages that failed to apply.

use crate::error::{CoordError, Result};
use crate::model::BrokerMessage;
use crate::store::{self, keys, KvStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadletterEntry {
    pub partition: String,
    pub seqid: u64,
    pub messages: Vec<BrokerMessage>,
    pub error_code: String,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct Deadletter {
    store: Arc<dyn KvStore>,
}

impl Deadletter {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Persist the failed batch in its own transaction.
    pub async fn put(
        &self,
        partition: &str,
        seqid: u64,
        messages: &[BrokerMessage],
        cause: &CoordError,
    ) -> Result<()> {
        warn!(partition, seqid, error = %cause, "deadlettering message");
        let entry = DeadletterEntry {
            partition: partition.to_string(),
            seqid,
            messages: messages.to_vec(),
            error_code: cause.code().to_string(),
            error: cause.to_string(),
            failed_at: Utc::now(),
        };
        let mut txn = self.store.begin().await?;
        store::set_value(txn.as_mut(), &keys::deadletter(partition, seqid), &entry).await?;
        txn.commit().await
    }

    pub async fn get(&self, partition: &str, seqid: u64) -> Result<Option<DeadletterEntry>> {
        self.store
            .read(&keys::deadletter(partition, seqid))
            .await?
            .map(|bytes| store::decode(&bytes))
            .transpose()
    }

    /// Entries of `partition` in sequence order.
    pub async fn list(&self, partition: &str) -> Result<Vec<DeadletterEntry>> {
        let mut txn = self.store.begin().await?;
        let keys = txn.scan_keys(&keys::deadletter_prefix(partition)).await?;
        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(entry) = store::get_value(txn.as_mut(), &key).await? {
                entries.push(entry);
            }
        }
        txn.abort().await?;
        Ok(entries)
    }
}
