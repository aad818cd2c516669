//! Stonks finder cycle.
//!
//! Periodically picks offers whose stonks check is outdated and that have a
//! recognised device, works out the device's current price statistics and
//! records a new stonks entry on the offer: the statistics, the fee
//! annotations, and the margin left after buying at the offer price.

use std::fmt;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, StreamExt};
use rust_decimal::{Decimal, RoundingStrategy};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::aggregator::{checked_sum, summarize, PriceSummary, PRICE_SCALE};
use super::cache::StatsCache;
use super::selector::StalenessPolicy;
use crate::backend::StonksBackend;
use crate::categories::CategoryMapper;
use crate::config::{PricesConfig, StonksConfig};
use crate::marketplace::PriceSource;
use crate::types::{Device, Fee, Offer, Stonks, StonksCreate, WatcherError};

/// Fee title used for a delivery option that has none.
const DEFAULT_DELIVERY_TITLE: &str = "delivery";

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct FinderConfig {
    pub policy: StalenessPolicy,
    pub max_concurrency: usize,
    pub fetch_timeout: StdDuration,
    /// Fixed fees recorded on every stonks entry.
    pub fees: Vec<Fee>,
}

impl FinderConfig {
    pub fn from_config(stonks: &StonksConfig, prices: &PricesConfig) -> Self {
        Self {
            policy: StalenessPolicy::new(
                Duration::minutes(stonks.older_than_minutes),
                stonks.batch_size,
            ),
            max_concurrency: stonks.max_concurrency,
            fetch_timeout: StdDuration::from_secs(prices.fetch_timeout_secs),
            fees: stonks.fees.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Pricing
// ---------------------------------------------------------------------------

/// Configured fees plus the offer's cheapest delivery.
pub fn build_fees(configured: &[Fee], offer: &Offer) -> Vec<Fee> {
    let mut fees = configured.to_vec();
    if let Some(delivery) = offer.cheapest_delivery() {
        fees.push(Fee {
            title: delivery
                .title
                .clone()
                .unwrap_or_else(|| DEFAULT_DELIVERY_TITLE.to_string()),
            amount: delivery.price,
            currency: delivery.currency.clone(),
        });
    }
    fees
}

/// Expected margin: market median minus what it costs to acquire the offer.
/// Fees quoted in another currency than the offer are not counted.
pub fn stonks_amount(
    median: Decimal,
    offer: &Offer,
    fees: &[Fee],
) -> Result<Decimal, WatcherError> {
    let fee_total = checked_sum(
        fees.iter()
            .filter(|fee| fee.currency == offer.currency)
            .map(|fee| fee.amount),
    );
    fee_total
        .and_then(|total| median.checked_sub(offer.price)?.checked_sub(total))
        .map(|amount| {
            amount.round_dp_with_strategy(PRICE_SCALE, RoundingStrategy::MidpointAwayFromZero)
        })
        .ok_or_else(|| {
            WatcherError::InvalidInput(format!("stonks amount for offer {} overflows", offer.id))
        })
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NoDevice,
    Inactive,
    NoPrices,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SkipReason::NoDevice => "no device",
            SkipReason::Inactive => "inactive",
            SkipReason::NoPrices => "no prices",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OfferOutcome {
    Created { offer_id: String, stonks: Stonks },
    Skipped { offer_id: String, reason: SkipReason },
    Failed { offer_id: String, error: WatcherError },
}

impl OfferOutcome {
    pub fn offer_id(&self) -> &str {
        match self {
            OfferOutcome::Created { offer_id, .. }
            | OfferOutcome::Skipped { offer_id, .. }
            | OfferOutcome::Failed { offer_id, .. } => offer_id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StonksReport {
    pub cycle_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub selected: usize,
    pub outcomes: Vec<OfferOutcome>,
}

impl StonksReport {
    pub fn created(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, OfferOutcome::Created { .. }))
            .count()
    }

    pub fn skipped(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, OfferOutcome::Skipped { .. }))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, OfferOutcome::Failed { .. }))
            .count()
    }

    pub fn outcome_for(&self, offer_id: &str) -> Option<&OfferOutcome> {
        self.outcomes.iter().find(|o| o.offer_id() == offer_id)
    }
}

// ---------------------------------------------------------------------------
// Finder
// ---------------------------------------------------------------------------

pub struct StonksFinder {
    config: FinderConfig,
    categories: Arc<CategoryMapper>,
    source: Arc<dyn PriceSource>,
    backend: Arc<dyn StonksBackend>,
    cache: Arc<StatsCache>,
}

impl StonksFinder {
    pub fn new(
        config: FinderConfig,
        categories: Arc<CategoryMapper>,
        source: Arc<dyn PriceSource>,
        backend: Arc<dyn StonksBackend>,
        cache: Arc<StatsCache>,
    ) -> Self {
        Self {
            config,
            categories,
            source,
            backend,
            cache,
        }
    }

    pub async fn run_cycle(&self) -> Result<StonksReport, WatcherError> {
        self.run_cycle_at(Utc::now()).await
    }

    pub async fn run_cycle_at(&self, now: DateTime<Utc>) -> Result<StonksReport, WatcherError> {
        let cycle_id = Uuid::new_v4();
        self.cycle(cycle_id, now)
            .instrument(info_span!("stonks_cycle", cycle_id = %cycle_id))
            .await
    }

    async fn cycle(&self, cycle_id: Uuid, now: DateTime<Utc>) -> Result<StonksReport, WatcherError> {
        let started_at = Utc::now();

        let evicted = self.cache.evict_expired().await;
        if evicted > 0 {
            debug!(evicted, "Evicted expired price statistics");
        }

        let threshold = self.config.policy.threshold(now);
        let mut offers = self
            .backend
            .offers_due(threshold, self.config.policy.limit)
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to fetch offers with outdated stonks");
                e
            })?;
        offers.truncate(self.config.policy.limit);
        let selected = offers.len();

        if offers.is_empty() {
            info!("No offers need a stonks check");
        } else {
            info!(offers = selected, "Downloaded offers with outdated stonks");
        }

        let outcomes: Vec<OfferOutcome> = stream::iter(offers)
            .map(|offer| self.evaluate(offer))
            .buffer_unordered(self.config.max_concurrency.max(1))
            .collect()
            .await;

        let report = StonksReport {
            cycle_id,
            started_at,
            finished_at: Utc::now(),
            selected,
            outcomes,
        };

        if report.selected > 0 {
            info!(
                selected = report.selected,
                created = report.created(),
                skipped = report.skipped(),
                failed = report.failed(),
                "Stonks cycle complete"
            );
        }
        Ok(report)
    }

    async fn evaluate(&self, offer: Offer) -> OfferOutcome {
        let offer_id = offer.id.clone();

        let device = match (&offer.device, offer.is_active) {
            (None, _) => {
                debug!(offer = %offer_id, "Skipping offer without device");
                return OfferOutcome::Skipped {
                    offer_id,
                    reason: SkipReason::NoDevice,
                };
            }
            (Some(_), false) => {
                debug!(offer = %offer_id, "Skipping inactive offer");
                return OfferOutcome::Skipped {
                    offer_id,
                    reason: SkipReason::Inactive,
                };
            }
            (Some(device), true) => device,
        };

        let summary = match self.device_summary(device).await {
            Ok(Some(summary)) => summary,
            Ok(None) => {
                info!(offer = %offer_id, device = %device.name, "No prices for device, no stonks");
                return OfferOutcome::Skipped {
                    offer_id,
                    reason: SkipReason::NoPrices,
                };
            }
            Err(error) => {
                warn!(offer = %offer_id, device = %device.name, error = %error, "Failed to price device");
                return OfferOutcome::Failed { offer_id, error };
            }
        };

        if summary.currency != offer.currency {
            let error = WatcherError::InvalidInput(format!(
                "offer priced in {} but market prices are in {}",
                offer.currency, summary.currency
            ));
            warn!(offer = %offer_id, error = %error, "Currency mismatch");
            return OfferOutcome::Failed { offer_id, error };
        }

        let fees = build_fees(&self.config.fees, &offer);
        let amount = match stonks_amount(summary.stats.median, &offer, &fees) {
            Ok(amount) => amount,
            Err(error) => {
                warn!(offer = %offer_id, error = %error, "Cannot compute stonks amount");
                return OfferOutcome::Failed { offer_id, error };
            }
        };
        let body = StonksCreate {
            stonks_amount: amount,
            stats: summary.stats,
            fees,
        };

        match self.backend.create_stonks(&offer_id, &body).await {
            Ok(stonks) => {
                info!(
                    offer = %offer_id,
                    device = %device.name,
                    stonks_amount = %stonks.stonks_amount,
                    "Stonks created"
                );
                OfferOutcome::Created { offer_id, stonks }
            }
            Err(error) => {
                warn!(offer = %offer_id, error = %error, "Failed to create stonks");
                OfferOutcome::Failed { offer_id, error }
            }
        }
    }

    /// Current statistics for a device, from cache or a fresh lookup.
    /// `Ok(None)` means the marketplace has no usable prices.
    async fn device_summary(&self, device: &Device) -> Result<Option<PriceSummary>, WatcherError> {
        if let Some(summary) = self.cache.get(&device.name).await {
            debug!(device = %device.name, "Using cached price statistics");
            return Ok(Some(summary));
        }

        let category_id = self.categories.map(&device.category)?;
        let lookup = self.source.fetch_prices(&device.name, category_id);
        let prices = match tokio::time::timeout(self.config.fetch_timeout, lookup).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(WatcherError::unavailable(
                    self.source.name(),
                    format!("no response within {:?}", self.config.fetch_timeout),
                ))
            }
        };

        match summarize(&prices) {
            Ok(summary) => {
                self.cache.insert(&device.name, summary.clone()).await;
                Ok(Some(summary))
            }
            Err(WatcherError::EmptyPriceSet) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
