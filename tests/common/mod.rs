//! In-memory fakes for integration testing.
//!
//! `FakeBackend` stands in for stonks-api and `FakeMarketplace` for Allegro.
//! Both are deterministic, keep all state behind `Arc<Mutex<..>>` and record
//! every call so tests can assert on what the engine did.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use stonks_watcher::backend::StonksBackend;
use stonks_watcher::marketplace::PriceSource;
use stonks_watcher::types::*;

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeBackend {
    devices: Arc<Mutex<Vec<Device>>>,
    offers: Arc<Mutex<Vec<Offer>>>,
    posted: Arc<Mutex<Vec<(String, Vec<Price>)>>>,
    stonks: Arc<Mutex<Vec<(String, StonksCreate)>>>,
    /// If set, every call fails as if stonks-api were down.
    force_error: Arc<Mutex<Option<String>>>,
}

impl FakeBackend {
    pub fn with_devices(devices: Vec<Device>) -> Self {
        let backend = Self::default();
        *backend.devices.lock().unwrap() = devices;
        backend
    }

    pub fn add_offer(&self, offer: Offer) {
        self.offers.lock().unwrap().push(offer);
    }

    pub fn set_error(&self, msg: &str) {
        *self.force_error.lock().unwrap() = Some(msg.to_string());
    }

    /// Device names with their posted price lists, in posting order.
    pub fn posted(&self) -> Vec<(String, Vec<Price>)> {
        self.posted.lock().unwrap().clone()
    }

    pub fn posted_names(&self) -> HashSet<String> {
        self.posted().into_iter().map(|(name, _)| name).collect()
    }

    pub fn stonks(&self) -> Vec<(String, StonksCreate)> {
        self.stonks.lock().unwrap().clone()
    }

    pub fn device(&self, name: &str) -> Option<Device> {
        self.devices.lock().unwrap().iter().find(|d| d.name == name).cloned()
    }

    fn check_error(&self) -> Result<(), WatcherError> {
        match self.force_error.lock().unwrap().as_ref() {
            Some(msg) => Err(WatcherError::unavailable("stonks-api", msg.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl StonksBackend for FakeBackend {
    async fn devices_due(
        &self,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Device>, WatcherError> {
        self.check_error()?;
        // Unordered and uncapped on purpose: the selector must not rely on
        // the backend for either.
        let _ = limit;
        Ok(self
            .devices
            .lock()
            .unwrap()
            .iter()
            .filter(|d| d.last_price_update.map_or(true, |ts| ts < updated_before))
            .cloned()
            .collect())
    }

    async fn update_device_prices(
        &self,
        device_name: &str,
        prices: &[Price],
    ) -> Result<(), WatcherError> {
        self.check_error()?;
        let mut devices = self.devices.lock().unwrap();
        let device = devices
            .iter_mut()
            .find(|d| d.name == device_name)
            .ok_or_else(|| WatcherError::UpstreamError {
                service: "stonks-api".to_string(),
                status: 404,
                body: format!("device {device_name} not found"),
            })?;
        device.last_price_update = Some(Utc::now());
        self.posted
            .lock()
            .unwrap()
            .push((device_name.to_string(), prices.to_vec()));
        Ok(())
    }

    async fn offers_due(
        &self,
        _checked_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Offer>, WatcherError> {
        self.check_error()?;
        Ok(self.offers.lock().unwrap().iter().take(limit).cloned().collect())
    }

    async fn create_stonks(
        &self,
        offer_id: &str,
        stonks: &StonksCreate,
    ) -> Result<Stonks, WatcherError> {
        self.check_error()?;
        let mut created = self.stonks.lock().unwrap();
        created.push((offer_id.to_string(), stonks.clone()));
        Ok(Stonks {
            id: created.len() as i64,
            stonks_amount: stonks.stonks_amount,
            stats: stonks.stats,
            fees: stonks.fees.clone(),
            created_at: Utc::now(),
        })
    }
}

// ---------------------------------------------------------------------------
// Marketplace
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeMarketplace {
    listings: HashMap<String, Vec<Price>>,
    stalled: HashSet<String>,
    failing: HashMap<String, WatcherError>,
    calls: Arc<Mutex<Vec<(String, u64)>>>,
}

impl FakeMarketplace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Listings in PLN for a device.
    pub fn with_listings(mut self, device: &str, amounts: &[Decimal]) -> Self {
        let prices = amounts
            .iter()
            .map(|amount| Price::new("allegro", *amount, "PLN"))
            .collect();
        self.listings.insert(device.to_string(), prices);
        self
    }

    /// Lookups for this device never answer.
    pub fn stalled_for(mut self, device: &str) -> Self {
        self.stalled.insert(device.to_string());
        self
    }

    pub fn failing_for(mut self, device: &str, error: WatcherError) -> Self {
        self.failing.insert(device.to_string(), error);
        self
    }

    pub fn calls(&self) -> Vec<(String, u64)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, device: &str) -> usize {
        self.calls().iter().filter(|(name, _)| name == device).count()
    }
}

#[async_trait]
impl PriceSource for FakeMarketplace {
    async fn fetch_prices(
        &self,
        phrase: &str,
        category_id: u64,
    ) -> Result<Vec<Price>, WatcherError> {
        self.calls
            .lock()
            .unwrap()
            .push((phrase.to_string(), category_id));

        if self.stalled.contains(phrase) {
            tokio::time::sleep(Duration::from_secs(10)).await;
        }
        if let Some(error) = self.failing.get(phrase) {
            return Err(error.clone());
        }
        Ok(self.listings.get(phrase).cloned().unwrap_or_default())
    }

    fn name(&self) -> &'static str {
        "allegro"
    }
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

pub fn device(name: &str, category: &str, last_price_update: Option<DateTime<Utc>>) -> Device {
    Device {
        id: 0,
        name: name.to_string(),
        category: category.to_string(),
        last_price_update,
    }
}

pub fn offer(id: &str, device: Option<Device>, price: Decimal) -> Offer {
    Offer {
        id: id.to_string(),
        url: Some(format!("https://www.olx.pl/oferta/{id}")),
        title: format!("Offer {id}"),
        description: None,
        category: "consoles".to_string(),
        price,
        currency: "PLN".to_string(),
        deliveries: vec![],
        photos: vec![],
        is_active: true,
        device,
    }
}
