//! Last applied sequence id per delivery partition.

use crate::error::{CoordError, Result};
use crate::store::{self, keys, KvStore, Transaction};
use std::sync::Arc;

#[derive(Clone)]
pub struct SequenceLedger {
    store: Arc<dyn KvStore>,
}

impl SequenceLedger {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Last committed seqid, read without opening a transaction.
    pub async fn last_seqid(&self, partition: &str) -> Result<Option<u64>> {
        self.store
            .read(&keys::last_seqid(partition))
            .await?
            .map(|bytes| store::decode(&bytes))
            .transpose()
    }

    /// Reject `seqid` unless it is strictly above the ledger for `partition`.
    pub async fn check(&self, partition: &str, seqid: u64) -> Result<()> {
        if let Some(last_seqid) = self.last_seqid(partition).await? {
            if seqid <= last_seqid {
                return Err(CoordError::SequenceOrderViolation { last_seqid });
            }
        }
        Ok(())
    }

    /// Record `seqid` inside `txn`. The ledger never moves backwards.
    pub async fn advance(txn: &mut dyn Transaction, partition: &str, seqid: u64) -> Result<()> {
        let key = keys::last_seqid(partition);
        let current: Option<u64> = store::get_value(txn, &key).await?;
        if current.is_some_and(|last| last >= seqid) {
            return Ok(());
        }
        store::set_value(txn, &key, &seqid).await
    }
}
