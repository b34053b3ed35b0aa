//! Per-run statistics and reporting.
//!
//! Every run attempt yields a `RunReport`, success or not, so "why did
//! this search stop finding listings" is answerable per run rather than
//! from the latest state only.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::crawler::CrawlOutcome;
use crate::dispatch::DispatchSummary;
use crate::filter::FilterOutcome;

/// Stages of one run, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Idle,
    Authenticating,
    Crawling,
    Filtering,
    Composing,
    Dispatching,
    Completed,
}

impl std::fmt::Display for RunStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStage::Idle => "idle",
            RunStage::Authenticating => "authenticating",
            RunStage::Crawling => "crawling",
            RunStage::Filtering => "filtering",
            RunStage::Composing => "composing",
            RunStage::Dispatching => "dispatching",
            RunStage::Completed => "completed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RunCounters {
    pub pages_fetched: u32,
    pub parse_failures: u32,
    pub promoted_skipped: u32,
    /// Raw listings enumerated from the source this run.
    pub found: u32,
    pub duplicates: u32,
    pub rejected_by_filter: u32,
    pub accepted: u32,
    pub dispatched: u32,
    pub skipped: u32,
}

impl RunCounters {
    pub fn record_crawl(&mut self, crawl: &CrawlOutcome) {
        self.pages_fetched = crawl.pages_fetched;
        self.parse_failures = crawl.parse_failures;
        self.promoted_skipped = crawl.promoted_skipped;
        self.found = crawl.raw.len() as u32;
    }

    pub fn record_filter(&mut self, filter: &FilterOutcome) {
        self.duplicates = filter.duplicates;
        self.rejected_by_filter = filter.rejected_by_filter;
        self.accepted = filter.accepted.len() as u32;
    }

    pub fn record_dispatch(&mut self, summary: &DispatchSummary) {
        self.dispatched = summary.sent;
        self.skipped = summary.skipped;
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Failed { stage: RunStage, cause: String },
}

impl RunOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, RunOutcome::Completed)
    }
}

/// Outcome of one run of one search.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub search_id: Uuid,
    pub search_name: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub counters: RunCounters,
    pub outcome: RunOutcome,
}
