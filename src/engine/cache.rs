//! In-memory TTL cache of per-device price statistics.
//!
//! The refresh cycle fills it after each successful fetch; the stonks finder
//! reads from it so that several offers for the same device share one
//! marketplace query.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::aggregator::PriceSummary;

struct CacheEntry {
    summary: PriceSummary,
    inserted_at: DateTime<Utc>,
}

/// Device name → latest `PriceSummary`, valid for `ttl`.
pub struct StatsCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    ttl: Duration,
}

impl StatsCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn get(&self, device: &str) -> Option<PriceSummary> {
        let now = Utc::now();
        let entries = self.entries.read().await;
        entries.get(device).and_then(|entry| {
            if now - entry.inserted_at < self.ttl {
                Some(entry.summary.clone())
            } else {
                None
            }
        })
    }

    pub async fn insert(&self, device: &str, summary: PriceSummary) {
        self.entries.write().await.insert(
            device.to_string(),
            CacheEntry {
                summary,
                inserted_at: Utc::now(),
            },
        );
    }

    /// Forget a device's statistics. Returns whether an entry was present.
    pub async fn remove(&self, device: &str) -> bool {
        self.entries.write().await.remove(device).is_some()
    }

    /// Drop expired entries. Returns how many were removed.
    pub async fn evict_expired(&self) -> usize {
        let now = Utc::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| now - entry.inserted_at < self.ttl);
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
