//! Price aggregator.
//!
//! Reduces a sample of listing prices to the five statistics stored on a
//! stonks record: low, high, average, median and harmonic mean. Everything
//! stays in `Decimal` and is rounded to 4 decimal places, matching the
//! backend's `NUMERIC(15, 4)` columns.
//!
//! Fees never enter these numbers. They are annotations on the stonks record.

use rust_decimal::{Decimal, RoundingStrategy};
use tracing::warn;

use crate::types::{Price, PriceStats, WatcherError};

/// Decimal places kept on persisted prices.
pub const PRICE_SCALE: u32 = 4;

/// Statistics for one device's price sample, with the sample's currency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceSummary {
    pub currency: String,
    pub sample_size: usize,
    pub stats: PriceStats,
}

fn round(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(PRICE_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

fn overflow(what: &str) -> WatcherError {
    WatcherError::InvalidInput(format!("{what} overflows the decimal range"))
}

/// Overflow-checked sum.
pub(crate) fn checked_sum<I>(values: I) -> Option<Decimal>
where
    I: IntoIterator<Item = Decimal>,
{
    values
        .into_iter()
        .try_fold(Decimal::ZERO, |acc, value| acc.checked_add(value))
}

/// Median of an ascending-sorted, non-empty slice.
fn median_sorted(sorted: &[Decimal]) -> Result<Decimal, WatcherError> {
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        Ok(sorted[mid])
    } else {
        sorted[mid - 1]
            .checked_add(sorted[mid])
            .and_then(|pair| pair.checked_div(Decimal::TWO))
            .ok_or_else(|| overflow("median"))
    }
}

/// `n / Σ(1/pᵢ)`. Defined only for strictly positive prices.
pub fn harmonic_mean(prices: &[Decimal]) -> Result<Decimal, WatcherError> {
    if prices.is_empty() {
        return Err(WatcherError::EmptyPriceSet);
    }
    if let Some(bad) = prices.iter().find(|p| **p <= Decimal::ZERO) {
        return Err(WatcherError::InvalidInput(format!(
            "harmonic mean needs positive prices, got {bad}"
        )));
    }
    let reciprocals = prices
        .iter()
        .map(|p| Decimal::ONE.checked_div(*p))
        .collect::<Option<Vec<Decimal>>>()
        .ok_or_else(|| overflow("harmonic mean"))?;
    checked_sum(reciprocals)
        .and_then(|sum| Decimal::from(prices.len()).checked_div(sum))
        .map(round)
        .ok_or_else(|| overflow("harmonic mean"))
}

/// Aggregate raw amounts into `PriceStats`.
///
/// Non-positive amounts are data-quality bugs upstream: they are logged and
/// dropped rather than failing the whole sample. An input that is empty
/// (before or after that filtering) yields `EmptyPriceSet`. A sample whose
/// sums leave the `Decimal` range yields `InvalidInput`.
pub fn aggregate(amounts: &[Decimal]) -> Result<PriceStats, WatcherError> {
    let mut sorted: Vec<Decimal> = amounts
        .iter()
        .copied()
        .filter(|amount| {
            let valid = *amount > Decimal::ZERO;
            if !valid {
                warn!(amount = %amount, "Dropping non-positive price from aggregation");
            }
            valid
        })
        .collect();

    if sorted.is_empty() {
        return Err(WatcherError::EmptyPriceSet);
    }
    sorted.sort();

    let count = Decimal::from(sorted.len());
    let average = checked_sum(sorted.iter().copied())
        .and_then(|sum| sum.checked_div(count))
        .ok_or_else(|| overflow("average"))?;

    Ok(PriceStats {
        low: round(sorted[0]),
        high: round(sorted[sorted.len() - 1]),
        average: round(average),
        median: round(median_sorted(&sorted)?),
        harmonic: harmonic_mean(&sorted)?,
    })
}

/// Aggregate a marketplace price sample.
///
/// The sample's currency is taken from the first price; prices quoted in a
/// different currency are dropped with a warning.
pub fn summarize(prices: &[Price]) -> Result<PriceSummary, WatcherError> {
    let currency = match prices.first() {
        Some(first) => first.currency.clone(),
        None => return Err(WatcherError::EmptyPriceSet),
    };

    let amounts: Vec<Decimal> = prices
        .iter()
        .filter(|p| {
            let same = p.currency == currency;
            if !same {
                warn!(
                    expected = %currency,
                    got = %p.currency,
                    amount = %p.amount,
                    "Dropping price in foreign currency"
                );
            }
            same
        })
        .map(|p| p.amount)
        .collect();

    let stats = aggregate(&amounts)?;
    Ok(PriceSummary {
        currency,
        sample_size: amounts.iter().filter(|a| **a > Decimal::ZERO).count(),
        stats,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
