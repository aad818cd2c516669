//! Status API route handlers.
//!
//! All endpoints return JSON. State is shared via `Arc<StatusState>`.

use axum::{extract::State, http::StatusCode, Json};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::engine::{RefreshReport, StonksReport};
use crate::types::WatcherError;

/// Most recent cycles kept in memory.
pub const MAX_CYCLE_LOG: usize = 100;

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleKind {
    Refresh,
    Stonks,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Totals {
    pub refresh_cycles: u64,
    pub stonks_cycles: u64,
    pub failed_cycles: u64,
    pub devices_refreshed: u64,
    pub devices_failed: u64,
    pub stonks_created: u64,
    pub offers_failed: u64,
    pub last_refresh_at: Option<DateTime<Utc>>,
    pub last_stonks_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleLogEntry {
    pub kind: CycleKind,
    pub cycle_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub selected: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Empty on success, otherwise the cycle-fatal error.
    pub error: Option<String>,
}

/// Shared state accessible by all route handlers.
pub struct StatusState {
    pub service: String,
    pub started_at: DateTime<Utc>,
    pub totals: RwLock<Totals>,
    pub cycle_log: RwLock<Vec<CycleLogEntry>>,
}

impl StatusState {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            started_at: Utc::now(),
            totals: RwLock::new(Totals::default()),
            cycle_log: RwLock::new(Vec::new()),
        }
    }

    pub async fn record_refresh(&self, report: &RefreshReport) {
        {
            let mut totals = self.totals.write().await;
            totals.refresh_cycles += 1;
            totals.devices_refreshed += report.persisted() as u64;
            totals.devices_failed += report.failed() as u64;
            totals.last_refresh_at = Some(report.finished_at);
        }
        self.push(CycleLogEntry {
            kind: CycleKind::Refresh,
            cycle_id: Some(report.cycle_id.to_string()),
            started_at: report.started_at,
            finished_at: report.finished_at,
            selected: report.selected,
            succeeded: report.persisted(),
            skipped: report.deferred(),
            failed: report.failed(),
            error: None,
        })
        .await;
    }

    pub async fn record_stonks(&self, report: &StonksReport) {
        {
            let mut totals = self.totals.write().await;
            totals.stonks_cycles += 1;
            totals.stonks_created += report.created() as u64;
            totals.offers_failed += report.failed() as u64;
            totals.last_stonks_at = Some(report.finished_at);
        }
        self.push(CycleLogEntry {
            kind: CycleKind::Stonks,
            cycle_id: Some(report.cycle_id.to_string()),
            started_at: report.started_at,
            finished_at: report.finished_at,
            selected: report.selected,
            succeeded: report.created(),
            skipped: report.skipped(),
            failed: report.failed(),
            error: None,
        })
        .await;
    }

    /// Record a cycle that failed before any device or offer was processed.
    pub async fn record_failure(
        &self,
        kind: CycleKind,
        started_at: DateTime<Utc>,
        error: &WatcherError,
    ) {
        self.totals.write().await.failed_cycles += 1;
        self.push(CycleLogEntry {
            kind,
            cycle_id: None,
            started_at,
            finished_at: Utc::now(),
            selected: 0,
            succeeded: 0,
            skipped: 0,
            failed: 0,
            error: Some(error.to_string()),
        })
        .await;
    }

    async fn push(&self, entry: CycleLogEntry) {
        let mut log = self.cycle_log.write().await;
        log.push(entry);
        let excess = log.len().saturating_sub(MAX_CYCLE_LOG);
        if excess > 0 {
            log.drain(..excess);
        }
    }
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub service: String,
    pub uptime_secs: i64,
    #[serde(flatten)]
    pub totals: Totals,
}

// ---------------------------------------------------------------------------
// Route handlers
// ---------------------------------------------------------------------------

pub type AppState = Arc<StatusState>;

/// GET /api/status
pub async fn get_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let totals = state.totals.read().await.clone();
    Json(StatusResponse {
        service: state.service.clone(),
        uptime_secs: (Utc::now() - state.started_at).num_seconds(),
        totals,
    })
}

/// GET /api/cycles
pub async fn get_cycles(State(state): State<AppState>) -> Json<Vec<CycleLogEntry>> {
    Json(state.cycle_log.read().await.clone())
}

/// GET /health
pub async fn health() -> StatusCode {
    StatusCode::OK
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
