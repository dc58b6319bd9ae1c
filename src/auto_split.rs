//! Sampling handler that splits full shards in cluster deployments.
//!
//! Standalone deployments check the active shard inline after each write;
//! clustered ones subscribe this handler to resource notifications instead.

use crate::error::Result;
use crate::model::{KbId, ShardObject};
use crate::notify::{Notification, NotificationAction};
use crate::shards::ShardManager;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

pub struct ShardCreatorHandler {
    shards: Arc<ShardManager>,
    sample_every: u64,
    seen: DashMap<KbId, u64>,
}

impl ShardCreatorHandler {
    pub fn new(shards: Arc<ShardManager>, sample_every: u64) -> Self {
        Self {
            shards,
            sample_every: sample_every.max(1),
            seen: DashMap::new(),
        }
    }

    /// Handle one notification. Only every `sample_every`-th commit of a
    /// knowledge box triggers a size check.
    pub async fn handle(&self, notification: &Notification) -> Result<Option<ShardObject>> {
        if notification.action != NotificationAction::Commit {
            return Ok(None);
        }
        let count = {
            let mut entry = self.seen.entry(notification.kbid.clone()).or_insert(0);
            *entry += 1;
            *entry
        };
        if count % self.sample_every != 0 {
            return Ok(None);
        }
        debug!(kbid = %notification.kbid, count, "sampled commit, checking active shard");
        let created = self.shards.check_active_shard(&notification.kbid).await?;
        if let Some(shard) = &created {
            info!(kbid = %notification.kbid, shard = %shard.shard, "auto split created shard");
        }
        Ok(created)
    }

    /// Consume notifications until the sender side closes.
    pub async fn run(self: Arc<Self>, mut rx: broadcast::Receiver<(String, Vec<u8>)>) {
        loop {
            match rx.recv().await {
                Ok((channel, payload)) => {
                    if !channel.ends_with("/resource-notify") {
                        continue;
                    }
                    let notification = match Notification::decode(&payload) {
                        Ok(notification) => notification,
                        Err(err) => {
                            warn!(channel, error = %err, "undecodable notification");
                            continue;
                        }
                    };
                    if let Err(err) = self.handle(&notification).await {
                        warn!(kbid = %notification.kbid, error = %err, "shard size check failed");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "auto split handler lagged behind notifications");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}
