//! Shared types for the stonks watcher.
//!
//! These mirror the records exchanged with stonks-api (devices, offers,
//! prices, fees, stonks) plus the error taxonomy used across the engine.
//! Money is always `Decimal`; the backend stores `NUMERIC(15, 4)`.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Device
// ---------------------------------------------------------------------------

/// A tracked device model, e.g. "iphone 12 mini".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    /// Internal slash-delimited category key, e.g. `smartphones/iphone`.
    pub category: String,
    /// `None` means prices were never fetched; such devices are always stale.
    #[serde(default, with = "backend_time::option")]
    pub last_price_update: Option<DateTime<Utc>>,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.last_price_update {
            Some(ts) => write!(f, "{} [{}] (updated {})", self.name, self.category, ts),
            None => write!(f, "{} [{}] (never updated)", self.name, self.category),
        }
    }
}

// ---------------------------------------------------------------------------
// Prices
// ---------------------------------------------------------------------------

/// A single candidate price observed on a marketplace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Price {
    /// Origin marketplace tag, e.g. `allegro`.
    pub source: String,
    #[serde(rename = "price")]
    pub amount: Decimal,
    pub currency: String,
}

impl Price {
    pub fn new(source: impl Into<String>, amount: Decimal, currency: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            amount,
            currency: currency.into(),
        }
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({})", self.amount, self.currency, self.source)
    }
}

/// Body of `POST /v1/prices/{device}`.
#[derive(Debug, Clone, Serialize)]
pub struct PricesCreate<'a> {
    pub prices: &'a [Price],
}

/// The five summary statistics persisted on a stonks record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceStats {
    #[serde(rename = "low_price")]
    pub low: Decimal,
    #[serde(rename = "high_price")]
    pub high: Decimal,
    #[serde(rename = "average_price")]
    pub average: Decimal,
    #[serde(rename = "median_price")]
    pub median: Decimal,
    #[serde(rename = "harmonic_price")]
    pub harmonic: Decimal,
}

impl fmt::Display for PriceStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "low={} high={} avg={} median={} harmonic={}",
            self.low, self.high, self.average, self.median, self.harmonic,
        )
    }
}

// ---------------------------------------------------------------------------
// Offers
// ---------------------------------------------------------------------------

/// A shipping option attached to an offer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub title: Option<String>,
    pub price: Decimal,
    pub currency: String,
}

/// A scraped marketplace listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offer {
    pub id: String,
    #[serde(default)]
    pub url: Option<String>,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub category: String,
    pub price: Decimal,
    pub currency: String,
    #[serde(default)]
    pub deliveries: Vec<Delivery>,
    #[serde(default)]
    pub photos: Vec<String>,
    pub is_active: bool,
    /// Weak reference to the recognised device, looked up by name.
    #[serde(default)]
    pub device: Option<Device>,
}

impl Offer {
    /// Cheapest delivery option quoted in the offer's own currency.
    pub fn cheapest_delivery(&self) -> Option<&Delivery> {
        self.deliveries
            .iter()
            .filter(|d| d.currency == self.currency)
            .min_by_key(|d| d.price)
    }
}

impl fmt::Display for Offer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {} ({} {})", self.id, self.title, self.price, self.currency)
    }
}

// ---------------------------------------------------------------------------
// Stonks & fees
// ---------------------------------------------------------------------------

/// A fee annotation recorded alongside a stonks record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fee {
    pub title: String,
    pub amount: Decimal,
    pub currency: String,
}

/// Body of `POST /v1/offers/{id}/stonks`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StonksCreate {
    pub stonks_amount: Decimal,
    #[serde(flatten)]
    pub stats: PriceStats,
    pub fees: Vec<Fee>,
}

/// A persisted stonks record as returned by the backend. Immutable: a new
/// aggregation always creates a new record.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Stonks {
    pub id: i64,
    pub stonks_amount: Decimal,
    #[serde(flatten)]
    pub stats: PriceStats,
    #[serde(default)]
    pub fees: Vec<Fee>,
    #[serde(with = "backend_time")]
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors raised by the watcher engine and its collaborators.
///
/// Everything except a failed selection query is handled at the granularity
/// of a single device or offer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WatcherError {
    #[error("Unknown category: {0}")]
    UnknownCategory(String),

    #[error("{service} unavailable: {message}")]
    UpstreamUnavailable { service: String, message: String },

    #[error("{service} returned {status}: {body}")]
    UpstreamError {
        service: String,
        status: u16,
        body: String,
    },

    #[error("Empty price set")]
    EmptyPriceSet,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Failed to decode {service} response: {message}")]
    Decode { service: String, message: String },

    #[error("Authentication failed: {0}")]
    Auth(String),
}

impl WatcherError {
    pub fn unavailable(service: &str, message: impl Into<String>) -> Self {
        Self::UpstreamUnavailable {
            service: service.to_string(),
            message: message.into(),
        }
    }

    pub fn decode(service: &str, message: impl Into<String>) -> Self {
        Self::Decode {
            service: service.to_string(),
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Backend timestamps
// ---------------------------------------------------------------------------

/// stonks-api emits naive ISO-8601 timestamps (`2021-05-04T14:59:37.321983`)
/// that are UTC by convention. Accept those as well as RFC 3339.
pub mod backend_time {
    use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn parse(value: &str) -> Option<DateTime<Utc>> {
        if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
            return Some(ts.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .map(|naive| Utc.from_utc_datetime(&naive))
    }

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&value.to_rfc3339())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        parse(&raw).ok_or_else(|| de::Error::custom(format!("invalid timestamp: {raw}")))
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(
            value: &Option<DateTime<Utc>>,
            s: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(ts) => s.serialize_some(&ts.to_rfc3339()),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            d: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            match Option::<String>::deserialize(d)? {
                Some(raw) => parse(&raw)
                    .map(Some)
                    .ok_or_else(|| de::Error::custom(format!("invalid timestamp: {raw}"))),
                None => Ok(None),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
