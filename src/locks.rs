//! Per-resource locks around shard assignment.

use crate::error::Result;
use crate::model::{KbId, ResourceId};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Held lock. Released on drop.
pub struct LockGuard {
    _inner: Box<dyn Send>,
}

impl LockGuard {
    pub fn new(inner: impl Send + 'static) -> Self {
        Self {
            _inner: Box::new(inner),
        }
    }
}

/// Lock service keyed by string. A distributed deployment plugs in its own.
#[async_trait]
pub trait LockProvider: Send + Sync {
    async fn acquire(&self, key: &str) -> Result<LockGuard>;
}

pub fn resource_lock_key(kbid: &KbId, rid: &ResourceId) -> String {
    format!("resource-shard-{kbid}-{rid}")
}

/// Process-local locks.
#[derive(Debug, Default)]
pub struct LocalLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl LocalLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_locked(&self, key: &str) -> bool {
        self.locks
            .get(key)
            .map(|lock| lock.try_lock().is_err())
            .unwrap_or(false)
    }
}

#[async_trait]
impl LockProvider for LocalLocks {
    async fn acquire(&self, key: &str) -> Result<LockGuard> {
        let lock = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        Ok(LockGuard::new(lock.lock_owned().await))
    }
}
