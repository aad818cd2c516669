//! Price refresh cycle.
//!
//! One cycle: select stale devices, then for every device independently map
//! its category, fetch marketplace prices and post them to stonks-api. The
//! per-device units run as a bounded unordered stream and are collected into
//! a `RefreshReport`. A failing device never affects the others; only the
//! initial selection query can fail the cycle.

use std::fmt;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, StreamExt};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::aggregator::{summarize, PriceSummary};
use super::cache::StatsCache;
use super::selector::{StalenessPolicy, StalenessSelector};
use crate::backend::StonksBackend;
use crate::categories::CategoryMapper;
use crate::config::PricesConfig;
use crate::marketplace::PriceSource;
use crate::types::{Device, Price, WatcherError};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RefreshConfig {
    pub policy: StalenessPolicy,
    pub max_concurrency: usize,
    /// Upper bound on a single marketplace lookup.
    pub fetch_timeout: StdDuration,
    /// Post an empty price list so the backend advances the device's
    /// staleness clock. When off, such devices are deferred to a later cycle.
    pub advance_on_empty: bool,
}

impl From<&PricesConfig> for RefreshConfig {
    fn from(cfg: &PricesConfig) -> Self {
        Self {
            policy: StalenessPolicy::new(
                Duration::days(cfg.update_older_than_days),
                cfg.update_count,
            ),
            max_concurrency: cfg.max_concurrency,
            fetch_timeout: StdDuration::from_secs(cfg.fetch_timeout_secs),
            advance_on_empty: cfg.advance_on_empty,
        }
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Where a device's refresh stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStage {
    Category,
    Fetch,
    Persist,
}

impl fmt::Display for DeviceStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceStage::Category => "category",
            DeviceStage::Fetch => "fetch",
            DeviceStage::Persist => "persist",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeviceOutcome {
    /// Prices (possibly none) were stored. `summary` is present when the
    /// sample was non-empty.
    Persisted {
        device: Device,
        prices: Vec<Price>,
        summary: Option<PriceSummary>,
    },
    /// Nothing found and the empty-result policy says to retry next cycle.
    Deferred { device: Device },
    Failed {
        device: Device,
        stage: DeviceStage,
        error: WatcherError,
    },
}

impl DeviceOutcome {
    pub fn device(&self) -> &Device {
        match self {
            DeviceOutcome::Persisted { device, .. }
            | DeviceOutcome::Deferred { device }
            | DeviceOutcome::Failed { device, .. } => device,
        }
    }

    pub fn is_persisted(&self) -> bool {
        matches!(self, DeviceOutcome::Persisted { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, DeviceOutcome::Failed { .. })
    }

    pub fn summary(&self) -> Option<&PriceSummary> {
        match self {
            DeviceOutcome::Persisted { summary, .. } => summary.as_ref(),
            _ => None,
        }
    }
}

/// Result of one refresh cycle, one outcome per selected device.
#[derive(Debug, Clone)]
pub struct RefreshReport {
    pub cycle_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub selected: usize,
    pub outcomes: Vec<DeviceOutcome>,
}

impl RefreshReport {
    pub fn persisted(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_persisted()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_failed()).count()
    }

    pub fn deferred(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, DeviceOutcome::Deferred { .. }))
            .count()
    }

    /// Devices that produced price statistics this cycle.
    pub fn stonks_computed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.summary().is_some()).count()
    }

    pub fn outcome_for(&self, device_name: &str) -> Option<&DeviceOutcome> {
        self.outcomes.iter().find(|o| o.device().name == device_name)
    }
}

// ---------------------------------------------------------------------------
// Refresher
// ---------------------------------------------------------------------------

pub struct PriceRefresher {
    config: RefreshConfig,
    selector: StalenessSelector,
    categories: Arc<CategoryMapper>,
    source: Arc<dyn PriceSource>,
    backend: Arc<dyn StonksBackend>,
    cache: Arc<StatsCache>,
}

impl PriceRefresher {
    pub fn new(
        config: RefreshConfig,
        categories: Arc<CategoryMapper>,
        source: Arc<dyn PriceSource>,
        backend: Arc<dyn StonksBackend>,
        cache: Arc<StatsCache>,
    ) -> Self {
        let selector = StalenessSelector::new(backend.clone(), config.policy);
        Self {
            config,
            selector,
            categories,
            source,
            backend,
            cache,
        }
    }

    pub async fn run_cycle(&self) -> Result<RefreshReport, WatcherError> {
        self.run_cycle_at(Utc::now()).await
    }

    /// Run one cycle treating `now` as the current time for staleness.
    pub async fn run_cycle_at(&self, now: DateTime<Utc>) -> Result<RefreshReport, WatcherError> {
        let cycle_id = Uuid::new_v4();
        self.cycle(cycle_id, now)
            .instrument(info_span!("refresh_cycle", cycle_id = %cycle_id))
            .await
    }

    async fn cycle(&self, cycle_id: Uuid, now: DateTime<Utc>) -> Result<RefreshReport, WatcherError> {
        let started_at = Utc::now();

        let devices = self.selector.select(now).await.map_err(|e| {
            error!(error = %e, "Failed to select devices for price refresh");
            e
        })?;
        let selected = devices.len();

        if devices.is_empty() {
            info!("No devices need a price refresh");
            return Ok(RefreshReport {
                cycle_id,
                started_at,
                finished_at: Utc::now(),
                selected,
                outcomes: Vec::new(),
            });
        }

        info!(devices = selected, "Refreshing device prices");

        let outcomes: Vec<DeviceOutcome> = stream::iter(devices)
            .map(|device| self.refresh_device(device))
            .buffer_unordered(self.config.max_concurrency.max(1))
            .collect()
            .await;

        let report = RefreshReport {
            cycle_id,
            started_at,
            finished_at: Utc::now(),
            selected,
            outcomes,
        };

        info!(
            selected = report.selected,
            persisted = report.persisted(),
            deferred = report.deferred(),
            failed = report.failed(),
            stonks = report.stonks_computed(),
            "Refresh cycle complete"
        );
        Ok(report)
    }

    async fn refresh_device(&self, device: Device) -> DeviceOutcome {
        let category_id = match self.categories.map(&device.category) {
            Ok(id) => id,
            Err(error) => {
                warn!(
                    device = %device.name,
                    category = %device.category,
                    "Skipping device with unmapped category"
                );
                return DeviceOutcome::Failed {
                    device,
                    stage: DeviceStage::Category,
                    error,
                };
            }
        };

        let prices = match self.fetch(&device, category_id).await {
            Ok(prices) => prices,
            Err(error) => {
                warn!(device = %device.name, error = %error, "Price lookup failed");
                return DeviceOutcome::Failed {
                    device,
                    stage: DeviceStage::Fetch,
                    error,
                };
            }
        };

        if prices.is_empty() && !self.config.advance_on_empty {
            info!(device = %device.name, "No listings found, deferring device");
            self.cache.remove(&device.name).await;
            return DeviceOutcome::Deferred { device };
        }

        if let Err(error) = self.backend.update_device_prices(&device.name, &prices).await {
            warn!(device = %device.name, error = %error, "Failed to store device prices");
            return DeviceOutcome::Failed {
                device,
                stage: DeviceStage::Persist,
                error,
            };
        }

        let summary = if prices.is_empty() {
            debug!(device = %device.name, "No listings found, staleness clock advanced");
            None
        } else {
            match summarize(&prices) {
                Ok(summary) => Some(summary),
                Err(error) => {
                    warn!(device = %device.name, error = %error, "No usable prices to aggregate");
                    None
                }
            }
        };

        // The cached statistics must describe the sample just stored.
        match &summary {
            Some(summary) => self.cache.insert(&device.name, summary.clone()).await,
            None => {
                self.cache.remove(&device.name).await;
            }
        }

        info!(
            device = %device.name,
            prices = prices.len(),
            aggregated = summary.is_some(),
            "Device prices updated"
        );

        DeviceOutcome::Persisted {
            device,
            prices,
            summary,
        }
    }

    async fn fetch(&self, device: &Device, category_id: u64) -> Result<Vec<Price>, WatcherError> {
        let lookup = self.source.fetch_prices(&device.name, category_id);
        match tokio::time::timeout(self.config.fetch_timeout, lookup).await {
            Ok(result) => result,
            Err(_) => Err(WatcherError::unavailable(
                self.source.name(),
                format!("no response within {:?}", self.config.fetch_timeout),
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
