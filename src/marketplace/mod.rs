//! Marketplace integrations.
//!
//! Defines the `PriceSource` trait: anything that can turn a device name and
//! a marketplace category id into candidate prices. Allegro is the only
//! production implementation.

pub mod allegro;

use async_trait::async_trait;

use crate::types::{Price, WatcherError};

/// A marketplace queried for current listing prices.
///
/// An empty `Vec` means "no listings matched" and is not an error.
/// Transport failures map to `UpstreamUnavailable`, non-success statuses to
/// `UpstreamError`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn fetch_prices(
        &self,
        phrase: &str,
        category_id: u64,
    ) -> Result<Vec<Price>, WatcherError>;

    /// Source tag written on every produced `Price`.
    fn name(&self) -> &'static str;
}
