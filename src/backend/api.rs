//! stonks-api HTTP client.
//!
//! Routes used (all under `/v1`):
//! - `GET devices?last_price_update_before=&limit=`
//! - `POST prices/{device name}`
//! - `GET offers?last_stonks_check_before=&has_device=true&limit=`
//! - `POST offers/{offer id}/stonks`

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use tracing::debug;

use super::StonksBackend;
use crate::config::ApiConfig;
use crate::types::{Device, Offer, Price, PricesCreate, Stonks, StonksCreate, WatcherError};

const SERVICE_NAME: &str = "stonks-api";

/// HTTP client for stonks-api.
pub struct ApiClient {
    http: Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(cfg: &ApiConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(cfg.timeout_secs))
            .user_agent("stonks-watcher/0.1.0")
            .build()
            .context("Failed to build HTTP client for stonks-api")?;

        Ok(Self {
            http,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{path}", self.base_url)
    }

    /// Query-string form of a timestamp, e.g. `2021-05-04T14:59:37Z`.
    fn timestamp_param(ts: DateTime<Utc>) -> String {
        ts.to_rfc3339_opts(SecondsFormat::Secs, true)
    }

    /// Turn a non-success status into `UpstreamError`.
    async fn check_status(resp: Response) -> Result<Response, WatcherError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(WatcherError::UpstreamError {
            service: SERVICE_NAME.to_string(),
            status: status.as_u16(),
            body,
        })
    }

    async fn decode<T: DeserializeOwned>(resp: Response) -> Result<T, WatcherError> {
        resp.json()
            .await
            .map_err(|e| WatcherError::decode(SERVICE_NAME, e.to_string()))
    }

    fn transport(e: reqwest::Error) -> WatcherError {
        WatcherError::unavailable(SERVICE_NAME, e.to_string())
    }
}

#[async_trait]
impl StonksBackend for ApiClient {
    async fn devices_due(
        &self,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Device>, WatcherError> {
        let url = self.url("devices");
        debug!(url = %url, %updated_before, limit, "Fetching stale devices");

        let resp = self
            .http
            .get(&url)
            .query(&[
                ("last_price_update_before", Self::timestamp_param(updated_before)),
                ("limit", limit.to_string()),
            ])
            .send()
            .await
            .map_err(Self::transport)?;

        Self::decode(Self::check_status(resp).await?).await
    }

    async fn update_device_prices(
        &self,
        device_name: &str,
        prices: &[Price],
    ) -> Result<(), WatcherError> {
        let url = self.url(&format!("prices/{}", urlencoding::encode(device_name)));
        debug!(url = %url, count = prices.len(), "Posting device prices");

        let resp = self
            .http
            .post(&url)
            .json(&PricesCreate { prices })
            .send()
            .await
            .map_err(Self::transport)?;

        Self::check_status(resp).await?;
        Ok(())
    }

    async fn offers_due(
        &self,
        checked_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Offer>, WatcherError> {
        let url = self.url("offers");
        debug!(url = %url, %checked_before, limit, "Fetching offers with outdated stonks");

        let resp = self
            .http
            .get(&url)
            .query(&[
                ("last_stonks_check_before", Self::timestamp_param(checked_before)),
                ("has_device", "true".to_string()),
                ("limit", limit.to_string()),
            ])
            .send()
            .await
            .map_err(Self::transport)?;

        Self::decode(Self::check_status(resp).await?).await
    }

    async fn create_stonks(
        &self,
        offer_id: &str,
        stonks: &StonksCreate,
    ) -> Result<Stonks, WatcherError> {
        let url = self.url(&format!("offers/{}/stonks", urlencoding::encode(offer_id)));
        debug!(url = %url, stonks_amount = %stonks.stonks_amount, "Creating stonks");

        let resp = self
            .http
            .post(&url)
            .json(stonks)
            .send()
            .await
            .map_err(Self::transport)?;

        Self::decode(Self::check_status(resp).await?).await
    }
}
