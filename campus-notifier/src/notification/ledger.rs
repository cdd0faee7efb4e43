//! Dedup ledger: durable idempotency store with an in-process fast path.
//!
//! The durable side is the insert-only `sent_notifications` table. The cache
//! only ever holds keys known to be recorded, so a cache hit is authoritative
//! and a miss falls through to the store. Pruning the cache never touches the
//! table.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::events::NotificationType;
use crate::Result;
use crate::database::repositories::LedgerRepository;
use crate::database::time::now_ms;

/// Ledger cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Cached keys older than this are dropped by [`DedupLedger::prune`].
    pub cache_horizon_secs: u64,
    /// How often the coordinator prunes the cache.
    pub prune_interval_secs: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            cache_horizon_secs: 24 * 60 * 60,
            prune_interval_secs: 60 * 60,
        }
    }
}

impl LedgerConfig {
    pub fn cache_horizon(&self) -> Duration {
        Duration::from_secs(self.cache_horizon_secs)
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_secs)
    }
}

/// Unique idempotency key: one change instance delivered to one recipient.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LedgerKey {
    pub notification_type: NotificationType,
    pub entity_key: String,
    pub recipient_id: i64,
}

impl LedgerKey {
    pub fn new(
        notification_type: NotificationType,
        entity_key: impl Into<String>,
        recipient_id: i64,
    ) -> Self {
        Self {
            notification_type,
            entity_key: entity_key.into(),
            recipient_id,
        }
    }
}

impl fmt::Display for LedgerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {}, {})",
            self.notification_type, self.entity_key, self.recipient_id
        )
    }
}

/// Durable de-duplication ledger.
///
/// Safe to share across delivery tasks: the cache is a sharded concurrent map,
/// so calls for different keys never block each other.
pub struct DedupLedger {
    repo: Arc<dyn LedgerRepository>,
    /// Keys known to be recorded, with the instant they were cached.
    recent: DashMap<LedgerKey, Instant>,
}

impl DedupLedger {
    pub fn new(repo: Arc<dyn LedgerRepository>) -> Self {
        Self {
            repo,
            recent: DashMap::new(),
        }
    }

    /// Whether a successful delivery for `key` has been recorded.
    pub async fn already_sent(&self, key: &LedgerKey) -> Result<bool> {
        if self.recent.contains_key(key) {
            return Ok(true);
        }

        let exists = self.repo.exists(key).await?;
        if exists {
            self.recent.insert(key.clone(), Instant::now());
        }
        Ok(exists)
    }

    /// Record a confirmed delivery. Must only be called after the transport
    /// reported success.
    pub async fn mark_sent(&self, key: &LedgerKey) -> Result<()> {
        self.repo.insert(key, now_ms()).await?;
        self.recent.insert(key.clone(), Instant::now());
        Ok(())
    }

    /// Drop cached keys older than `horizon`. Returns how many were removed.
    pub fn prune(&self, horizon: Duration) -> usize {
        let before = self.recent.len();
        self.recent.retain(|_, cached_at| cached_at.elapsed() < horizon);
        let removed = before.saturating_sub(self.recent.len());
        if removed > 0 {
            debug!(removed, remaining = self.recent.len(), "Pruned ledger cache");
        }
        removed
    }

    pub fn cached_len(&self) -> usize {
        self.recent.len()
    }
}
