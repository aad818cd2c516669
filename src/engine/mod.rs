//! Core engine: the price refresh and stonks finder cycles.

pub mod aggregator;
pub mod cache;
pub mod finder;
pub mod refresher;
pub mod selector;

pub use aggregator::{aggregate, summarize, PriceSummary};
pub use cache::StatsCache;
pub use finder::{FinderConfig, OfferOutcome, StonksFinder, StonksReport};
pub use refresher::{DeviceOutcome, DeviceStage, PriceRefresher, RefreshConfig, RefreshReport};
pub use selector::{StalenessPolicy, StalenessSelector};
