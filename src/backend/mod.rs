//! Persistence boundary.
//!
//! The watcher owns no database: devices, prices, offers and stonks live in
//! stonks-api and are reached over HTTP. `StonksBackend` is the seam the
//! engine depends on, so cycles can be driven against in-memory fakes.

pub mod api;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::types::{Device, Offer, Price, Stonks, StonksCreate, WatcherError};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StonksBackend: Send + Sync {
    /// Devices whose last price update is older than `updated_before` (or
    /// missing), oldest first, at most `limit`.
    async fn devices_due(
        &self,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Device>, WatcherError>;

    /// Store a fresh (possibly empty) price sample for a device. The backend
    /// advances the device's `last_price_update` as a side effect.
    async fn update_device_prices(
        &self,
        device_name: &str,
        prices: &[Price],
    ) -> Result<(), WatcherError>;

    /// Active offers with a device whose stonks were last checked before
    /// `checked_before`, at most `limit`.
    async fn offers_due(
        &self,
        checked_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Offer>, WatcherError>;

    /// Create a new stonks record for an offer.
    async fn create_stonks(
        &self,
        offer_id: &str,
        stonks: &StonksCreate,
    ) -> Result<Stonks, WatcherError>;
}
