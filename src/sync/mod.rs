pub mod buckets;
pub mod document;
pub mod engine;
pub mod loader;
pub mod rate_limit;
pub mod retry;
pub mod syncer;
pub mod upload;

#[cfg(test)]
pub(crate) mod testing;

use chrono::NaiveDate;
use serde::Serialize;

use crate::storage::repository::RunTotals;
use crate::sync::engine::{FetchOutcome, FetchReport};

/// Options controlling a sync operation.
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Treat this date as today when enumerating buckets.
    pub today: Option<NaiveDate>,
}

impl SyncOptions {
    pub fn today(&self) -> NaiveDate {
        self.today
            .unwrap_or_else(|| chrono::Local::now().date_naive())
    }
}

/// Report returned after a sync operation completes.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub oh_id: String,
    pub status: SyncStatus,
    pub requests: u64,
    pub buckets_fetched: u64,
    pub buckets_skipped: u64,
    pub buckets_failed: u64,
    pub uploaded: bool,
    pub retry_scheduled: bool,
    pub error: Option<String>,
}

impl SyncReport {
    pub fn new(oh_id: &str, status: SyncStatus) -> Self {
        Self {
            oh_id: oh_id.to_string(),
            status,
            requests: 0,
            buckets_fetched: 0,
            buckets_skipped: 0,
            buckets_failed: 0,
            uploaded: false,
            retry_scheduled: false,
            error: None,
        }
    }

    /// Take over the counters and outcome of a fetch pass.
    pub fn absorb(&mut self, fetch: &FetchReport) {
        self.requests = fetch.requests;
        self.buckets_fetched = fetch.buckets_fetched;
        self.buckets_skipped = fetch.buckets_skipped;
        self.buckets_failed = fetch.buckets_failed;
        match &fetch.outcome {
            FetchOutcome::Complete => self.status = SyncStatus::Completed,
            FetchOutcome::RateLimited { .. } => self.status = SyncStatus::RateLimited,
            FetchOutcome::Failed(e) => self.fail(e),
        }
    }

    pub fn fail(&mut self, error: &dyn std::fmt::Display) {
        self.status = SyncStatus::Failed;
        self.error = Some(error.to_string());
    }

    pub fn totals(&self) -> RunTotals<'_> {
        RunTotals {
            status: self.status.as_str(),
            requests: self.requests,
            buckets_fetched: self.buckets_fetched,
            buckets_skipped: self.buckets_skipped,
            buckets_failed: self.buckets_failed,
            uploaded: self.uploaded,
            retry_scheduled: self.retry_scheduled,
            error_message: self.error.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SyncStatus {
    /// Accepted for background processing.
    Queued,
    Completed,
    /// Partial data uploaded; a retry is due after the cooldown.
    RateLimited,
    Failed,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncStatus::Queued => "queued",
            SyncStatus::Completed => "completed",
            SyncStatus::RateLimited => "rate_limited",
            SyncStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
