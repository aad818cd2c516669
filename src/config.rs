//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! Marketplace credentials are referenced by env-var name in the config and
//! resolved at runtime via `std::env::var`.

use anyhow::{ensure, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;

use crate::types::Fee;

/// Longest staleness window accepted for devices (ten years).
const MAX_STALENESS_DAYS: i64 = 3650;
/// Longest staleness window accepted for offers (one year).
const MAX_STALENESS_MINUTES: i64 = 525_600;
/// Longest lifetime of a cached price summary (one week).
const MAX_CACHE_TTL_MINS: i64 = 10_080;

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub watcher: WatcherConfig,
    pub api: ApiConfig,
    pub allegro: AllegroConfig,
    pub prices: PricesConfig,
    pub stonks: StonksConfig,
    #[serde(default)]
    pub categories: CategoriesConfig,
    #[serde(default)]
    pub status: StatusConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WatcherConfig {
    pub name: String,
}

/// stonks-api (the persistence boundary).
#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    pub base_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AllegroConfig {
    pub api_url: String,
    pub auth_url: String,
    pub client_id_env: String,
    pub client_secret_env: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Maximum listings requested per device.
    #[serde(default = "default_listing_limit")]
    pub listing_limit: u32,
    /// Extra listing filters pinned to cut noise (accessories, cases, ...).
    #[serde(default)]
    pub extra_params: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PricesConfig {
    /// Devices whose prices are older than this are refreshed.
    pub update_older_than_days: i64,
    /// Maximum devices per refresh cycle.
    pub update_count: usize,
    pub interval_secs: u64,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    /// Post an empty price list when nothing is found so the device's
    /// staleness clock still advances.
    #[serde(default = "default_true")]
    pub advance_on_empty: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StonksConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Offers whose stonks were checked longer ago than this are re-evaluated.
    pub older_than_minutes: i64,
    pub batch_size: usize,
    pub interval_secs: u64,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// How long refreshed device statistics are reused.
    #[serde(default = "default_cache_ttl_mins")]
    pub cache_ttl_mins: i64,
    /// Fixed fees recorded on every stonks record.
    #[serde(default)]
    pub fees: Vec<Fee>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct CategoriesConfig {
    /// External category table; the built-in table is used when absent.
    pub path: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StatusConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 8090,
        }
    }
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_listing_limit() -> u32 {
    10
}

fn default_max_concurrency() -> usize {
    8
}

fn default_fetch_timeout_secs() -> u64 {
    45
}

fn default_cache_ttl_mins() -> i64 {
    60
}

fn default_true() -> bool {
    true
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::from_toml_str(&contents)
            .with_context(|| format!("Failed to parse config file: {path}"))
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        ensure!(self.prices.update_count > 0, "prices.update_count must be positive");
        ensure!(self.prices.max_concurrency > 0, "prices.max_concurrency must be positive");
        ensure!(self.prices.interval_secs > 0, "prices.interval_secs must be positive");
        ensure!(self.stonks.batch_size > 0, "stonks.batch_size must be positive");
        ensure!(self.stonks.max_concurrency > 0, "stonks.max_concurrency must be positive");
        ensure!(self.stonks.interval_secs > 0, "stonks.interval_secs must be positive");
        ensure!(self.allegro.listing_limit > 0, "allegro.listing_limit must be positive");
        ensure!(self.prices.fetch_timeout_secs > 0, "prices.fetch_timeout_secs must be positive");
        ensure!(
            (0..=MAX_STALENESS_DAYS).contains(&self.prices.update_older_than_days),
            "prices.update_older_than_days must be within 0..={MAX_STALENESS_DAYS}"
        );
        ensure!(
            (0..=MAX_STALENESS_MINUTES).contains(&self.stonks.older_than_minutes),
            "stonks.older_than_minutes must be within 0..={MAX_STALENESS_MINUTES}"
        );
        ensure!(
            (0..=MAX_CACHE_TTL_MINS).contains(&self.stonks.cache_ttl_mins),
            "stonks.cache_ttl_mins must be within 0..={MAX_CACHE_TTL_MINS}"
        );
        Ok(())
    }

    /// Resolve an environment variable name to its value.
    /// Useful for loading secrets referenced in the config.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }
}
