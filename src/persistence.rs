use crate::error::{CoordError, Result};
use crate::store::{KvStore, Transaction};
use async_trait::async_trait;
use rocksdb::{Direction, IteratorMode, Options, WriteBatch, DB};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

const KEY_MANIFEST: &[u8] = b"\0manifest";
const STORAGE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct StorageManifest {
    format_version: u32,
    app_version: String,
}

/// RocksDB-backed transactional store.
///
/// Writes are buffered per transaction and applied as one `WriteBatch`.
/// Commits are serialized by a process-wide mutex, under which the read set
/// is re-validated against the database.
pub struct RocksStore {
    db: Arc<DB>,
    commit_lock: Arc<tokio::sync::Mutex<()>>,
}

impl RocksStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut options = Options::default();
        options.create_if_missing(true);
        let db = DB::open(&options, path)?;
        validate_or_init_manifest(&db)?;
        Ok(Self {
            db: Arc::new(db),
            commit_lock: Arc::new(tokio::sync::Mutex::new(())),
        })
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

#[async_trait]
impl KvStore for RocksStore {
    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        Ok(Box::new(RocksTransaction {
            db: self.db.clone(),
            commit_lock: self.commit_lock.clone(),
            reads: HashMap::new(),
            writes: BTreeMap::new(),
        }))
    }

    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get(key.as_bytes())?)
    }
}

struct RocksTransaction {
    db: Arc<DB>,
    commit_lock: Arc<tokio::sync::Mutex<()>>,
    reads: HashMap<String, Option<Vec<u8>>>,
    writes: BTreeMap<String, Option<Vec<u8>>>,
}

#[async_trait]
impl Transaction for RocksTransaction {
    async fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>> {
        if let Some(pending) = self.writes.get(key) {
            return Ok(pending.clone());
        }
        if let Some(seen) = self.reads.get(key) {
            return Ok(seen.clone());
        }
        let value = self.db.get(key.as_bytes())?;
        self.reads.insert(key.to_string(), value.clone());
        Ok(value)
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
        let mut keys: BTreeMap<String, bool> = BTreeMap::new();
        let iter = self
            .db
            .iterator(IteratorMode::From(prefix.as_bytes(), Direction::Forward));
        for entry in iter {
            let (key, _) = entry?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            let key = String::from_utf8(key.to_vec())
                .map_err(|err| CoordError::Store(format!("non utf8 key: {err}")))?;
            keys.insert(key, true);
        }
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
        let _guard = self.commit_lock.lock().await;
        for (key, seen) in &self.reads {
            let current = self.db.get(key.as_bytes())?;
            if &current != seen {
                return Err(CoordError::TransactionConflict(key.clone()));
            }
        }
        if self.writes.is_empty() {
            return Ok(());
        }
        let mut batch = WriteBatch::default();
        for (key, value) in &self.writes {
            match value {
                Some(value) => batch.put(key.as_bytes(), value),
                None => batch.delete(key.as_bytes()),
            }
        }
        self.db.write(batch)?;
        Ok(())
    }

    async fn abort(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

fn validate_or_init_manifest(db: &DB) -> Result<()> {
    match db.get(KEY_MANIFEST)? {
        Some(bytes) => {
            let manifest: StorageManifest = bincode::deserialize(&bytes)?;
            if manifest.format_version != STORAGE_FORMAT_VERSION {
                return Err(CoordError::Store(format!(
                    "unsupported storage format {} (expected {})",
                    manifest.format_version, STORAGE_FORMAT_VERSION
                )));
            }
            Ok(())
        }
        None => {
            let manifest = StorageManifest {
                format_version: STORAGE_FORMAT_VERSION,
                app_version: env!("CARGO_PKG_VERSION").to_string(),
            };
            db.put(KEY_MANIFEST, bincode::serialize(&manifest)?)?;
            Ok(())
        }
    }
}
