//! Allegro REST API integration.
//!
//! Used to sample current buy-now prices for a device. Listings are
//! requested cheapest-first within the mapped Allegro category.
//!
//! API docs: https://developer.allegro.pl/documentation
//! Listing: GET {api_url}/offers/listing
//! Auth: client-credentials OAuth at {auth_url}/auth/oauth/token
//! Content type: `application/vnd.allegro.public.v1+json`

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::str::FromStr;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::PriceSource;
use crate::config::AllegroConfig;
use crate::types::{Price, WatcherError};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

const SOURCE_NAME: &str = "allegro";
const ACCEPT: &str = "application/vnd.allegro.public.v1+json";

/// Refresh the access token when it has less than this left.
const TOKEN_REFRESH_MARGIN_SECS: i64 = 60;

// ---------------------------------------------------------------------------
// API response types
// ---------------------------------------------------------------------------

/// OAuth token returned by `/auth/oauth/token`.
#[derive(Debug, Deserialize)]
struct Token {
    access_token: String,
    #[serde(default)]
    token_type: String,
    expires_in: i64,
    #[serde(default)]
    scope: String,
    #[serde(default)]
    allegro_api: bool,
    #[serde(default)]
    jti: String,
}

#[derive(Debug, Deserialize)]
struct ListingResponse {
    #[serde(default)]
    items: ListingItems,
}

#[derive(Debug, Default, Deserialize)]
struct ListingItems {
    #[serde(default)]
    promoted: Vec<ListingOffer>,
    #[serde(default)]
    regular: Vec<ListingOffer>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListingOffer {
    #[serde(default)]
    id: String,
    #[serde(default)]
    name: String,
    selling_mode: SellingMode,
}

#[derive(Debug, Deserialize)]
struct SellingMode {
    #[serde(default)]
    format: Option<String>,
    price: ListingPrice,
}

/// Allegro sends amounts as decimal strings, e.g. `"1299.00"`.
#[derive(Debug, Deserialize)]
struct ListingPrice {
    amount: String,
    currency: String,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

struct CachedToken {
    bearer: SecretString,
    expires_at: DateTime<Utc>,
}

impl CachedToken {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_at - now > Duration::seconds(TOKEN_REFRESH_MARGIN_SECS)
    }
}

/// Allegro listing client with a lazily refreshed client-credentials token.
pub struct AllegroClient {
    http: Client,
    api_url: String,
    auth_url: String,
    client_id: String,
    client_secret: SecretString,
    listing_limit: u32,
    extra_params: Vec<(String, String)>,
    token: RwLock<Option<CachedToken>>,
}

impl AllegroClient {
    /// Create a new client. Credentials are resolved by the caller from the
    /// env vars named in the config.
    pub fn new(cfg: &AllegroConfig, client_id: String, client_secret: SecretString) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(cfg.timeout_secs))
            .user_agent("stonks-watcher/0.1.0")
            .build()
            .context("Failed to build HTTP client for Allegro")?;

        Ok(Self {
            http,
            api_url: cfg.api_url.trim_end_matches('/').to_string(),
            auth_url: cfg.auth_url.trim_end_matches('/').to_string(),
            client_id,
            client_secret,
            listing_limit: cfg.listing_limit,
            extra_params: cfg
                .extra_params
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            token: RwLock::new(None),
        })
    }

    // -- Authentication ----------------------------------------------------

    /// Request a new access token from the OAuth endpoint.
    async fn request_token(&self) -> Result<CachedToken, WatcherError> {
        info!("Authenticating with Allegro...");

        let resp = self
            .http
            .post(format!("{}/auth/oauth/token", self.auth_url))
            .query(&[("grant_type", "client_credentials")])
            .basic_auth(&self.client_id, Some(self.client_secret.expose_secret()))
            .send()
            .await
            .map_err(|e| WatcherError::unavailable(SOURCE_NAME, e.to_string()))?;

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(WatcherError::Auth(format!(
                "Allegro rejected client credentials ({status})"
            )));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(WatcherError::UpstreamError {
                service: SOURCE_NAME.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        let token: Token = resp
            .json()
            .await
            .map_err(|e| WatcherError::decode(SOURCE_NAME, e.to_string()))?;

        debug!(
            token_type = %token.token_type,
            scope = %token.scope,
            allegro_api = token.allegro_api,
            jti = %token.jti,
            expires_in = token.expires_in,
            "Allegro token issued"
        );
        info!("Allegro authentication successful");

        Ok(CachedToken {
            bearer: SecretString::new(format!("Bearer {}", token.access_token)),
            expires_at: Utc::now() + Duration::seconds(token.expires_in),
        })
    }

    /// Get a valid `Authorization` header value, authenticating if necessary.
    ///
    /// Refreshes are serialized on the write lock, so concurrent lookups
    /// that find a stale token trigger a single token request.
    async fn authorization(&self) -> Result<String, WatcherError> {
        {
            let guard = self.token.read().await;
            if let Some(token) = guard.as_ref().filter(|t| t.is_fresh(Utc::now())) {
                return Ok(token.bearer.expose_secret().clone());
            }
        }

        let mut guard = self.token.write().await;
        // Another task may have refreshed the token while we waited.
        if let Some(token) = guard.as_ref().filter(|t| t.is_fresh(Utc::now())) {
            return Ok(token.bearer.expose_secret().clone());
        }
        let token = self.request_token().await?;
        let bearer = token.bearer.expose_secret().clone();
        *guard = Some(token);
        Ok(bearer)
    }

    /// Drop the cached token if it is still the one the API rejected.
    async fn invalidate_token(&self, rejected: &str) {
        let mut guard = self.token.write().await;
        if guard
            .as_ref()
            .is_some_and(|t| t.bearer.expose_secret() == rejected)
        {
            *guard = None;
        }
    }

    // -- Listing -----------------------------------------------------------

    /// Query parameters for a cheapest-first buy-now listing search.
    fn listing_query(&self, phrase: &str, category_id: u64) -> Vec<(String, String)> {
        let mut query = vec![
            ("category.id".to_string(), category_id.to_string()),
            ("phrase".to_string(), phrase.to_string()),
            ("include".to_string(), "-all".to_string()),
            ("include".to_string(), "items".to_string()),
            ("sellingMode.format".to_string(), "BUY_NOW".to_string()),
            ("limit".to_string(), self.listing_limit.to_string()),
            ("sort".to_string(), "+price".to_string()),
            ("offset".to_string(), "0".to_string()),
            ("fallback".to_string(), "false".to_string()),
        ];
        query.extend(self.extra_params.iter().cloned());
        query
    }

    async fn send_listing(
        &self,
        query: &[(String, String)],
        authorization: &str,
    ) -> Result<reqwest::Response, WatcherError> {
        self.http
            .get(format!("{}/offers/listing", self.api_url))
            .header(reqwest::header::ACCEPT, ACCEPT)
            .header(reqwest::header::AUTHORIZATION, authorization)
            .query(query)
            .send()
            .await
            .map_err(|e| WatcherError::unavailable(SOURCE_NAME, e.to_string()))
    }

    /// Convert listings to prices, skipping any with an unparseable amount.
    fn to_prices(listing: ListingResponse) -> Vec<Price> {
        let ListingItems { promoted, regular } = listing.items;
        promoted
            .into_iter()
            .chain(regular)
            .filter_map(|offer| {
                if offer.selling_mode.format.as_deref().is_some_and(|f| f != "BUY_NOW") {
                    debug!(offer_id = %offer.id, "Skipping non buy-now listing");
                    return None;
                }
                match Decimal::from_str(offer.selling_mode.price.amount.trim()) {
                    Ok(amount) => Some(Price::new(
                        SOURCE_NAME,
                        amount,
                        offer.selling_mode.price.currency,
                    )),
                    Err(e) => {
                        warn!(
                            offer_id = %offer.id,
                            name = %offer.name,
                            amount = %offer.selling_mode.price.amount,
                            error = %e,
                            "Unparseable Allegro price, skipping listing"
                        );
                        None
                    }
                }
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// PriceSource trait implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl PriceSource for AllegroClient {
    async fn fetch_prices(
        &self,
        phrase: &str,
        category_id: u64,
    ) -> Result<Vec<Price>, WatcherError> {
        let query = self.listing_query(phrase, category_id);
        debug!(phrase, category_id, "Fetching Allegro listing");

        let authorization = self.authorization().await?;
        let mut resp = self.send_listing(&query, &authorization).await?;

        if resp.status() == StatusCode::UNAUTHORIZED {
            // Token revoked or expired early: re-authenticate once.
            warn!("Allegro token rejected, re-authenticating...");
            self.invalidate_token(&authorization).await;
            let authorization = self.authorization().await?;
            resp = self.send_listing(&query, &authorization).await?;
        }

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(WatcherError::UpstreamError {
                service: SOURCE_NAME.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        let listing: ListingResponse = resp
            .json()
            .await
            .map_err(|e| WatcherError::decode(SOURCE_NAME, e.to_string()))?;

        let prices = Self::to_prices(listing);
        info!(
            phrase,
            count = prices.len(),
            "Downloaded offers from Allegro"
        );
        Ok(prices)
    }

    fn name(&self) -> &'static str {
        SOURCE_NAME
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::http::HeaderMap;
    use axum::response::{IntoResponse, Response};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use futures::future::join_all;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn test_config() -> AllegroConfig {
        let mut extra_params = BTreeMap::new();
        extra_params.insert("parameter.11323".to_string(), "11323_2".to_string());
        AllegroConfig {
            api_url: "https://api.allegro.pl.allegrosandbox.pl/".into(),
            auth_url: "https://allegro.pl.allegrosandbox.pl".into(),
            client_id_env: "ALLEGRO_CLIENT_ID".into(),
            client_secret_env: "ALLEGRO_CLIENT_SECRET".into(),
            timeout_secs: 5,
            listing_limit: 10,
            extra_params,
        }
    }

    fn test_client() -> AllegroClient {
        AllegroClient::new(
            &test_config(),
            "client-id".into(),
            SecretString::new("client-secret".into()),
        )
        .unwrap()
    }

    #[test]
    fn test_new_client() {
        let client = test_client();
        assert_eq!(client.name(), "allegro");
        assert_eq!(client.api_url, "https://api.allegro.pl.allegrosandbox.pl");
    }

    #[test]
    fn test_listing_query() {
        let client = test_client();
        let query = client.listing_query("iphone 12 mini", 48978);
        let get = |key: &str| -> Vec<&str> {
            query
                .iter()
                .filter(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
                .collect()
        };

        assert_eq!(get("category.id"), vec!["48978"]);
        assert_eq!(get("phrase"), vec!["iphone 12 mini"]);
        assert_eq!(get("include"), vec!["-all", "items"]);
        assert_eq!(get("sellingMode.format"), vec!["BUY_NOW"]);
        assert_eq!(get("limit"), vec!["10"]);
        assert_eq!(get("sort"), vec!["+price"]);
        assert_eq!(get("offset"), vec!["0"]);
        assert_eq!(get("fallback"), vec!["false"]);
        assert_eq!(get("parameter.11323"), vec!["11323_2"]);
    }

    #[test]
    fn test_to_prices_promoted_and_regular() {
        let json = r#"{
            "items": {
                "promoted": [
                    {"id": "1", "name": "iPhone 12 mini",
                     "sellingMode": {"format": "BUY_NOW", "price": {"amount": "1899.00", "currency": "PLN"}}}
                ],
                "regular": [
                    {"id": "2", "name": "iPhone 12 mini 64GB",
                     "sellingMode": {"format": "BUY_NOW", "price": {"amount": "1750.50", "currency": "PLN"}}},
                    {"id": "3", "name": "iPhone 12 mini 128GB",
                     "sellingMode": {"price": {"amount": "2100", "currency": "PLN"}}}
                ]
            }
        }"#;
        let listing: ListingResponse = serde_json::from_str(json).unwrap();
        let prices = AllegroClient::to_prices(listing);

        assert_eq!(prices.len(), 3);
        assert_eq!(prices[0].amount, dec!(1899.00));
        assert_eq!(prices[1].amount, dec!(1750.50));
        assert_eq!(prices[2].amount, dec!(2100));
        assert!(prices.iter().all(|p| p.source == "allegro" && p.currency == "PLN"));
    }

    #[test]
    fn test_to_prices_skips_bad_amount_and_auctions() {
        let json = r#"{
            "items": {
                "regular": [
                    {"id": "1", "sellingMode": {"format": "BUY_NOW", "price": {"amount": "n/a", "currency": "PLN"}}},
                    {"id": "2", "sellingMode": {"format": "AUCTION", "price": {"amount": "10.00", "currency": "PLN"}}},
                    {"id": "3", "sellingMode": {"format": "BUY_NOW", "price": {"amount": " 99.99 ", "currency": "PLN"}}}
                ]
            }
        }"#;
        let listing: ListingResponse = serde_json::from_str(json).unwrap();
        let prices = AllegroClient::to_prices(listing);
        assert_eq!(prices.len(), 1);
        assert_eq!(prices[0].amount, dec!(99.99));
    }

    #[test]
    fn test_to_prices_empty_listing() {
        let listing: ListingResponse = serde_json::from_str(r#"{"items": {}}"#).unwrap();
        assert!(AllegroClient::to_prices(listing).is_empty());

        let listing: ListingResponse = serde_json::from_str("{}").unwrap();
        assert!(AllegroClient::to_prices(listing).is_empty());
    }

    #[test]
    fn test_token_freshness() {
        let now = Utc::now();
        let fresh = CachedToken {
            bearer: SecretString::new("Bearer a".into()),
            expires_at: now + Duration::hours(12),
        };
        let stale = CachedToken {
            bearer: SecretString::new("Bearer b".into()),
            expires_at: now + Duration::seconds(30),
        };
        assert!(fresh.is_fresh(now));
        assert!(!stale.is_fresh(now));
    }

    #[test]
    fn test_token_parses() {
        let json = r#"{"access_token": "eyJ...", "token_type": "bearer", "expires_in": 43199,
                       "scope": "allegro:api:read", "allegro_api": true, "jti": "abc"}"#;
        let token: Token = serde_json::from_str(json).unwrap();
        assert_eq!(token.expires_in, 43199);
        assert!(token.allegro_api);
    }

    // -- Local Allegro stand-in ---------------------------------------------

    #[derive(Default)]
    struct FakeAllegro {
        reject_credentials: bool,
        listing_status: Option<u16>,
        revoked: Vec<String>,
        token_requests: AtomicUsize,
        listing_requests: AtomicUsize,
        bearers_seen: Mutex<Vec<String>>,
    }

    async fn issue_token(State(fake): State<Arc<FakeAllegro>>) -> Response {
        let n = fake.token_requests.fetch_add(1, Ordering::SeqCst) + 1;
        if fake.reject_credentials {
            return (StatusCode::UNAUTHORIZED, "invalid_client").into_response();
        }
        // Keep the request open long enough for concurrent callers to pile up.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        Json(json!({
            "access_token": format!("token-{n}"),
            "token_type": "bearer",
            "expires_in": 43199,
        }))
        .into_response()
    }

    async fn listing(State(fake): State<Arc<FakeAllegro>>, headers: HeaderMap) -> Response {
        fake.listing_requests.fetch_add(1, Ordering::SeqCst);
        let bearer = headers
            .get(reqwest::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        fake.bearers_seen.lock().unwrap().push(bearer.clone());

        if fake.revoked.contains(&bearer) {
            return (StatusCode::UNAUTHORIZED, "token revoked").into_response();
        }
        if let Some(code) = fake.listing_status {
            return (StatusCode::from_u16(code).unwrap(), "listing unavailable").into_response();
        }
        Json(json!({
            "items": {
                "regular": [
                    {"id": "1", "sellingMode": {"format": "BUY_NOW",
                     "price": {"amount": "1899.00", "currency": "PLN"}}}
                ]
            }
        }))
        .into_response()
    }

    async fn client_for(fake: Arc<FakeAllegro>) -> AllegroClient {
        let app = Router::new()
            .route("/auth/oauth/token", post(issue_token))
            .route("/offers/listing", get(listing))
            .with_state(fake);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let mut cfg = test_config();
        cfg.api_url = url.clone();
        cfg.auth_url = url;
        AllegroClient::new(&cfg, "id".into(), SecretString::new("secret".into())).unwrap()
    }

    fn revoked(bearers: &[&str]) -> Vec<String> {
        bearers.iter().map(|b| b.to_string()).collect()
    }

    #[tokio::test]
    async fn test_listing_error_status_is_upstream_error() {
        let fake = Arc::new(FakeAllegro {
            listing_status: Some(503),
            ..Default::default()
        });
        let client = client_for(fake.clone()).await;

        let err = client.fetch_prices("ps5", 122233).await.unwrap_err();
        assert_eq!(
            err,
            WatcherError::UpstreamError {
                service: "allegro".to_string(),
                status: 503,
                body: "listing unavailable".to_string(),
            }
        );
        assert_eq!(fake.token_requests.load(Ordering::SeqCst), 1);
        assert_eq!(fake.listing_requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rejected_token_reauthenticates_once() {
        let fake = Arc::new(FakeAllegro {
            revoked: revoked(&["Bearer token-1"]),
            ..Default::default()
        });
        let client = client_for(fake.clone()).await;

        let prices = client.fetch_prices("ps5", 122233).await.unwrap();
        assert_eq!(prices.len(), 1);
        assert_eq!(prices[0].amount, dec!(1899.00));
        assert_eq!(fake.token_requests.load(Ordering::SeqCst), 2);
        assert_eq!(fake.listing_requests.load(Ordering::SeqCst), 2);
        assert_eq!(
            *fake.bearers_seen.lock().unwrap(),
            vec!["Bearer token-1".to_string(), "Bearer token-2".to_string()]
        );

        // The refreshed token is reused afterwards.
        client.fetch_prices("ps5", 122233).await.unwrap();
        assert_eq!(fake.token_requests.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_second_rejection_is_upstream_error() {
        let fake = Arc::new(FakeAllegro {
            revoked: revoked(&["Bearer token-1", "Bearer token-2"]),
            ..Default::default()
        });
        let client = client_for(fake.clone()).await;

        let err = client.fetch_prices("ps5", 122233).await.unwrap_err();
        assert!(matches!(err, WatcherError::UpstreamError { status: 401, .. }));
        assert_eq!(fake.token_requests.load(Ordering::SeqCst), 2);
        assert_eq!(fake.listing_requests.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_rejected_credentials_is_auth_error() {
        let fake = Arc::new(FakeAllegro {
            reject_credentials: true,
            ..Default::default()
        });
        let client = client_for(fake.clone()).await;

        let err = client.fetch_prices("ps5", 122233).await.unwrap_err();
        assert!(matches!(err, WatcherError::Auth(_)));
        assert_eq!(fake.token_requests.load(Ordering::SeqCst), 1);
        assert_eq!(fake.listing_requests.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_concurrent_fetches_share_one_token() {
        let fake = Arc::new(FakeAllegro::default());
        let client = client_for(fake.clone()).await;

        let results = join_all((0..8).map(|_| client.fetch_prices("ps5", 122233))).await;
        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(fake.token_requests.load(Ordering::SeqCst), 1);
        assert_eq!(fake.listing_requests.load(Ordering::SeqCst), 8);
    }

    #[tokio::test]
    async fn test_concurrent_rejections_share_one_refresh() {
        let fake = Arc::new(FakeAllegro {
            revoked: revoked(&["Bearer token-1"]),
            ..Default::default()
        });
        let client = client_for(fake.clone()).await;

        let results = join_all((0..8).map(|_| client.fetch_prices("ps5", 122233))).await;
        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(fake.token_requests.load(Ordering::SeqCst), 2);

        // Every rejected lookup was retried once with the refreshed token.
        let seen = fake.bearers_seen.lock().unwrap();
        let rejected = seen.iter().filter(|b| b.as_str() == "Bearer token-1").count();
        assert!(rejected >= 1);
        assert_eq!(seen.len(), 8 + rejected);
    }

    #[tokio::test]
    async fn test_unreachable_marketplace_is_unavailable() {
        let mut cfg = test_config();
        cfg.api_url = "http://127.0.0.1:9".into();
        cfg.auth_url = "http://127.0.0.1:9".into();
        cfg.timeout_secs = 2;
        let client = AllegroClient::new(&cfg, "id".into(), SecretString::new("s".into())).unwrap();

        let err = client.fetch_prices("ps5", 122233).await.unwrap_err();
        assert!(matches!(err, WatcherError::UpstreamUnavailable { .. }));
    }
}
