//! stonks-watcher entry point.
//!
//! Loads configuration, initialises structured logging, wires the Allegro
//! client and stonks-api client into the two engines, and runs the price
//! refresh and stonks finder loops until Ctrl+C.

use anyhow::{Context, Result};
use secrecy::SecretString;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use stonks_watcher::backend::api::ApiClient;
use stonks_watcher::backend::StonksBackend;
use stonks_watcher::categories::CategoryMapper;
use stonks_watcher::config::AppConfig;
use stonks_watcher::engine::{
    FinderConfig, PriceRefresher, RefreshConfig, StatsCache, StonksFinder,
};
use stonks_watcher::marketplace::allegro::AllegroClient;
use stonks_watcher::marketplace::PriceSource;
use stonks_watcher::status::{self, CycleKind, StatusState};

const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let config_path =
        std::env::var("STONKS_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let cfg = AppConfig::load(&config_path)?;

    init_logging();

    info!(
        name = %cfg.watcher.name,
        config = %config_path,
        api = %cfg.api.base_url,
        prices_interval_secs = cfg.prices.interval_secs,
        stonks_interval_secs = cfg.stonks.interval_secs,
        "stonks-watcher starting up"
    );

    // -- Initialise components -------------------------------------------

    let categories = Arc::new(match &cfg.categories.path {
        Some(path) => CategoryMapper::load(path)?,
        None => {
            let mapper = CategoryMapper::builtin()?;
            info!(categories = mapper.len(), "Using built-in category table");
            mapper
        }
    });

    let client_id = AppConfig::resolve_env(&cfg.allegro.client_id_env)?;
    let client_secret = SecretString::new(AppConfig::resolve_env(&cfg.allegro.client_secret_env)?);
    let source: Arc<dyn PriceSource> = Arc::new(
        AllegroClient::new(&cfg.allegro, client_id, client_secret)
            .context("Failed to initialise Allegro client")?,
    );
    let backend: Arc<dyn StonksBackend> =
        Arc::new(ApiClient::new(&cfg.api).context("Failed to initialise stonks-api client")?);

    let cache = Arc::new(StatsCache::new(chrono::Duration::minutes(
        cfg.stonks.cache_ttl_mins,
    )));

    let refresher = Arc::new(PriceRefresher::new(
        RefreshConfig::from(&cfg.prices),
        categories.clone(),
        source.clone(),
        backend.clone(),
        cache.clone(),
    ));
    let finder = Arc::new(StonksFinder::new(
        FinderConfig::from_config(&cfg.stonks, &cfg.prices),
        categories,
        source,
        backend,
        cache,
    ));

    let status_state = Arc::new(StatusState::new(cfg.watcher.name.clone()));
    if cfg.status.enabled {
        status::spawn_status_server(status_state.clone(), cfg.status.port);
    }
    if !cfg.stonks.enabled {
        warn!("Stonks finder disabled, only refreshing prices");
    }

    // -- Main loop -------------------------------------------------------

    let mut prices_interval = tokio::time::interval(Duration::from_secs(cfg.prices.interval_secs));
    let mut stonks_interval = tokio::time::interval(Duration::from_secs(cfg.stonks.interval_secs));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!("Entering main loop. Press Ctrl+C to stop.");

    loop {
        tokio::select! {
            _ = prices_interval.tick() => {
                spawn_refresh(refresher.clone(), status_state.clone());
            }
            _ = stonks_interval.tick(), if cfg.stonks.enabled => {
                spawn_stonks(finder.clone(), status_state.clone());
            }
            _ = &mut shutdown => {
                info!("Shutdown signal received.");
                break;
            }
        }
    }

    info!("stonks-watcher shut down.");
    Ok(())
}

/// Run one price refresh cycle in its own task so a slow cycle never delays
/// the next tick.
fn spawn_refresh(refresher: Arc<PriceRefresher>, status: Arc<StatusState>) {
    tokio::spawn(async move {
        let started_at = chrono::Utc::now();
        match refresher.run_cycle().await {
            Ok(report) => status.record_refresh(&report).await,
            Err(e) => {
                error!(error = %e, "Refresh cycle failed, retrying next tick");
                status.record_failure(CycleKind::Refresh, started_at, &e).await;
            }
        }
    });
}

fn spawn_stonks(finder: Arc<StonksFinder>, status: Arc<StatusState>) {
    tokio::spawn(async move {
        let started_at = chrono::Utc::now();
        match finder.run_cycle().await {
            Ok(report) => status.record_stonks(&report).await,
            Err(e) => {
                error!(error = %e, "Stonks cycle failed, retrying next tick");
                status.record_failure(CycleKind::Stonks, started_at, &e).await;
            }
        }
    });
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("stonks_watcher=info"));

    let json_logging = std::env::var("STONKS_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
