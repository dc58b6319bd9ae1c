//! # Store Module
//!
//! Transactional key-value access used by every coordination component.
//! `KvStore` opens transactions; a `Transaction` buffers writes and commits
//! them atomically, failing with `TransactionConflict` when a key it read
//! was changed by a concurrent commit.

use crate::error::{CoordError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn Transaction>>;

    /// Read the last committed value outside of any transaction.
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>>;
}

#[async_trait]
pub trait Transaction: Send {
    async fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn set(&mut self, key: &str, value: Vec<u8>) -> Result<()>;
    async fn delete(&mut self, key: &str) -> Result<()>;
    /// Keys starting with `prefix`, in order, including uncommitted writes.
    async fn scan_keys(&mut self, prefix: &str) -> Result<Vec<String>>;
    async fn commit(self: Box<Self>) -> Result<()>;
    async fn abort(self: Box<Self>) -> Result<()>;
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

/// Typed get over a transaction.
pub async fn get_value<T: DeserializeOwned>(
    txn: &mut dyn Transaction,
    key: &str,
) -> Result<Option<T>> {
    txn.get(key).await?.map(|bytes| decode(&bytes)).transpose()
}

/// Typed set over a transaction.
pub async fn set_value<T: Serialize + Sync>(
    txn: &mut dyn Transaction,
    key: &str,
    value: &T,
) -> Result<()> {
    txn.set(key, encode(value)?).await
}

/// Fixed key scheme.
pub mod keys {
    use crate::model::{KbId, ResourceId};

    pub fn kb_config(kbid: &KbId) -> String {
        format!("/kbs/{kbid}/config")
    }

    pub fn kb_prefix(kbid: &KbId) -> String {
        format!("/kbs/{kbid}/")
    }

    pub fn shards(kbid: &KbId) -> String {
        format!("/kbs/{kbid}/shards")
    }

    pub fn rollover_shards(kbid: &KbId) -> String {
        format!("/kbs/{kbid}/shards/rollover")
    }

    pub fn resource(kbid: &KbId, rid: &ResourceId) -> String {
        format!("/kbs/{kbid}/r/{rid}")
    }

    pub fn resources_prefix(kbid: &KbId) -> String {
        format!("/kbs/{kbid}/r/")
    }

    pub fn resource_shard(kbid: &KbId, rid: &ResourceId) -> String {
        format!("/kbs/{kbid}/rshard/{rid}")
    }

    pub fn catalog(kbid: &KbId, rid: &ResourceId) -> String {
        format!("/kbs/{kbid}/catalog/{rid}")
    }

    pub fn slug(kbid: &KbId, slug: &str) -> String {
        format!("/kbs/{kbid}/s/{slug}")
    }

    pub fn rollover_state(kbid: &KbId) -> String {
        format!("/kbs/{kbid}/rollover/state")
    }

    pub fn rollover_indexed(kbid: &KbId, rid: &ResourceId) -> String {
        format!("/kbs/{kbid}/rollover/indexed/{rid}")
    }

    pub fn rollover_indexed_prefix(kbid: &KbId) -> String {
        format!("/kbs/{kbid}/rollover/indexed/")
    }

    pub fn last_seqid(partition: &str) -> String {
        format!("/partitions/{partition}/lastseq")
    }

    pub fn deadletter(partition: &str, seqid: u64) -> String {
        // Zero padded so prefix scans come back in sequence order.
        format!("/deadletter/{partition}/{seqid:020}")
    }

    pub fn deadletter_prefix(partition: &str) -> String {
        format!("/deadletter/{partition}/")
    }

    /// Last path segment of a key.
    pub fn leaf(key: &str) -> &str {
        key.rsplit('/').next().unwrap_or(key)
    }
}

#[derive(Debug, Clone)]
struct Versioned {
    version: u64,
    value: Option<Vec<u8>>,
}

#[derive(Debug, Default)]
struct MemoryState {
    data: BTreeMap<String, Versioned>,
    clock: u64,
}

/// In-memory transactional store with optimistic conflict detection.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    started: Arc<AtomicU64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of transactions opened so far.
    pub fn transactions_started(&self) -> u64 {
        self.started.load(Ordering::Relaxed)
    }

    /// Committed, live key/value pairs.
    pub fn snapshot(&self) -> BTreeMap<String, Vec<u8>> {
        self.state
            .lock()
            .data
            .iter()
            .filter_map(|(key, entry)| entry.value.clone().map(|value| (key.clone(), value)))
            .collect()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        self.started.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(MemoryTransaction {
            state: self.state.clone(),
            reads: HashMap::new(),
            writes: BTreeMap::new(),
        }))
    }

    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .state
            .lock()
            .data
            .get(key)
            .and_then(|entry| entry.value.clone()))
    }
}

struct MemoryTransaction {
    state: Arc<Mutex<MemoryState>>,
    /// Version observed for every key read (0 = absent).
    reads: HashMap<String, u64>,
    writes: BTreeMap<String, Option<Vec<u8>>>,
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>> {
        if let Some(pending) = self.writes.get(key) {
            return Ok(pending.clone());
        }
        let state = self.state.lock();
        let entry = state.data.get(key);
        self.reads
            .entry(key.to_string())
            .or_insert_with(|| entry.map(|e| e.version).unwrap_or(0));
        Ok(entry.and_then(|e| e.value.clone()))
    }

    async fn set(&mut self, key: &str, value: Vec<u8>) -> Result<()> {
        self.writes.insert(key.to_string(), Some(value));
        Ok(())
    }

    async fn delete(&mut self, key: &str) -> Result<()> {
        self.writes.insert(key.to_string(), None);
        Ok(())
    }

    async fn scan_keys(&mut self, prefix: &str) -> Result<Vec<String>> {
        let mut keys: BTreeMap<String, bool> = {
            let state = self.state.lock();
            state
                .data
                .range(prefix.to_string()..)
                .take_while(|(key, _)| key.starts_with(prefix))
                .map(|(key, entry)| (key.clone(), entry.value.is_some()))
                .collect()
        };
        for (key, value) in self.writes.range(prefix.to_string()..) {
            if !key.starts_with(prefix) {
                break;
            }
            keys.insert(key.clone(), value.is_some());
        }
        Ok(keys
            .into_iter()
            .filter_map(|(key, live)| live.then_some(key))
            .collect())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut state = self.state.lock();
        for (key, seen) in &self.reads {
            let current = state.data.get(key).map(|e| e.version).unwrap_or(0);
            if current != *seen {
                return Err(CoordError::TransactionConflict(key.clone()));
            }
        }
        if self.writes.is_empty() {
            return Ok(());
        }
        state.clock += 1;
        let version = state.clock;
        for (key, value) in self.writes {
            state.data.insert(key, Versioned { version, value });
        }
        Ok(())
    }

    async fn abort(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
