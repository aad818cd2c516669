//! Staleness selector.
//!
//! Picks the devices whose prices are due for a refresh: never updated, or
//! last updated before `now - older_than`. Never-updated devices come first,
//! then oldest update first, capped at `limit`.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::backend::StonksBackend;
use crate::types::{Device, WatcherError};

/// How old a price update may get before the device is picked again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StalenessPolicy {
    pub older_than: Duration,
    pub limit: usize,
}

impl StalenessPolicy {
    pub fn new(older_than: Duration, limit: usize) -> Self {
        Self { older_than, limit }
    }

    /// Cut-off instant: updates strictly before this are stale.
    pub fn threshold(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.older_than
    }
}

/// Filter, order and cap a device list.
///
/// Applied to whatever the backend returns, so the ordering contract holds
/// even if the backend ignores the query parameters.
pub fn select_stale(
    mut devices: Vec<Device>,
    updated_before: DateTime<Utc>,
    limit: usize,
) -> Vec<Device> {
    devices.retain(|d| match d.last_price_update {
        None => true,
        Some(ts) => ts < updated_before,
    });
    // `None < Some(_)`, and the sort is stable for equal timestamps.
    devices.sort_by_key(|d| d.last_price_update);
    devices.truncate(limit);
    devices
}

pub struct StalenessSelector {
    backend: Arc<dyn StonksBackend>,
    policy: StalenessPolicy,
}

impl StalenessSelector {
    pub fn new(backend: Arc<dyn StonksBackend>, policy: StalenessPolicy) -> Self {
        Self { backend, policy }
    }

    pub fn policy(&self) -> StalenessPolicy {
        self.policy
    }

    /// Devices due for a refresh as of `now`. Backend failures propagate.
    pub async fn select(&self, now: DateTime<Utc>) -> Result<Vec<Device>, WatcherError> {
        if self.policy.limit == 0 {
            return Ok(Vec::new());
        }
        let threshold = self.policy.threshold(now);
        let fetched = self.backend.devices_due(threshold, self.policy.limit).await?;
        let fetched_count = fetched.len();
        let selected = select_stale(fetched, threshold, self.policy.limit);

        debug!(
            threshold = %threshold,
            fetched = fetched_count,
            selected = selected.len(),
            "Selected stale devices"
        );
        Ok(selected)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
