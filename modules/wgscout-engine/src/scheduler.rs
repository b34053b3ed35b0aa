//! Search scheduler.
//!
//! Drives each active search through one run: crawl, filter/dedup,
//! compose, dispatch. Runs are independent; one search failing or being
//! rate limited never blocks the others. A global semaphore caps how many
//! runs hit the site at once.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use wgscout_common::{Credential, EngineError, Listing, OutreachMessage, SearchConfig};
use wgscout_store::ListingStore;

use crate::cancel::CancelFlag;
use crate::compose::MessageComposer;
use crate::crawler::ListingCrawler;
use crate::dispatch::OutreachDispatcher;
use crate::filter::FilterAndDedupEngine;
use crate::stats::{RunCounters, RunOutcome, RunReport, RunStage};

#[derive(Clone)]
pub struct SearchScheduler {
    store: Arc<dyn ListingStore>,
    crawler: Arc<ListingCrawler>,
    composer: Arc<MessageComposer>,
    dispatcher: Arc<OutreachDispatcher>,
    credential: Credential,
    base_url: String,
    /// Used when a search does not set its own send delay.
    default_message_delay: Duration,
    max_concurrent_runs: usize,
}

impl SearchScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn ListingStore>,
        crawler: Arc<ListingCrawler>,
        composer: Arc<MessageComposer>,
        dispatcher: Arc<OutreachDispatcher>,
        credential: Credential,
        base_url: impl Into<String>,
        default_message_delay: Duration,
        max_concurrent_runs: usize,
    ) -> Self {
        Self {
            store,
            crawler,
            composer,
            dispatcher,
            credential,
            base_url: base_url.into(),
            default_message_delay,
            max_concurrent_runs: max_concurrent_runs.max(1),
        }
    }

    /// Run every active search once, at most `max_concurrent_runs` at a
    /// time. Always returns one report per search; a run's failure is
    /// recorded in its report, not bubbled up.
    pub async fn run_all(&self, cancel: &CancelFlag) -> Result<Vec<RunReport>, EngineError> {
        let searches = self.store.active_searches().await?;
        info!(count = searches.len(), "scheduling active searches");

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent_runs));
        let mut set = JoinSet::new();

        for search in searches {
            let scheduler = self.clone();
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            set.spawn(async move {
                // Closed only if the semaphore is dropped, which it is not.
                let _permit = semaphore.acquire_owned().await;
                scheduler.run_one(search, &cancel).await
            });
        }

        let mut reports = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(report) => reports.push(report),
                Err(e) => error!(error = %e, "run task panicked"),
            }
        }
        Ok(reports)
    }

    /// One complete run of one search. `last_run` moves on every attempt;
    /// the found/new counters move only when the run completes.
    pub async fn run_one(&self, search: SearchConfig, cancel: &CancelFlag) -> RunReport {
        let started_at = Utc::now();
        let mut counters = RunCounters::default();

        let outcome = match self.run_stages(&search, cancel, &mut counters).await {
            Ok(()) => {
                let total = search.stats.total_found + i64::from(counters.accepted);
                let stats_result = self
                    .store
                    .update_stats(search.id, total, i64::from(counters.accepted), Utc::now())
                    .await;
                match stats_result {
                    Ok(()) => RunOutcome::Completed,
                    Err(e) => {
                        // The attempt still happened even if the counters
                        // could not be written.
                        if let Err(touch_err) =
                            self.store.touch_last_run(search.id, Utc::now()).await
                        {
                            error!(
                                search = search.name.as_str(),
                                error = %touch_err,
                                "last_run update failed"
                            );
                        }
                        RunOutcome::Failed {
                            stage: RunStage::Completed,
                            cause: e.to_string(),
                        }
                    }
                }
            }
            Err((stage, e)) => {
                warn!(
                    search = search.name.as_str(),
                    stage = %stage,
                    error = %e,
                    "run failed"
                );
                if let Err(touch_err) = self.store.touch_last_run(search.id, Utc::now()).await {
                    error!(search = search.name.as_str(), error = %touch_err, "last_run update failed");
                }
                RunOutcome::Failed {
                    stage,
                    cause: e.to_string(),
                }
            }
        };

        let report = RunReport {
            search_id: search.id,
            search_name: search.name.clone(),
            started_at,
            finished_at: Utc::now(),
            counters,
            outcome,
        };
        info!(
            search = report.search_name.as_str(),
            found = report.counters.found,
            new = report.counters.accepted,
            dispatched = report.counters.dispatched,
            completed = report.outcome.is_completed(),
            "run finished"
        );
        report
    }

    async fn run_stages(
        &self,
        search: &SearchConfig,
        cancel: &CancelFlag,
        counters: &mut RunCounters,
    ) -> Result<(), (RunStage, EngineError)> {
        if cancel.is_cancelled() {
            return Err((RunStage::Idle, EngineError::Cancelled));
        }

        // Crawl. A cancelled crawl still yields its pages so far; they go
        // through filtering so accepted listings persist before we stop.
        // A failed or rejected login is an auth-stage failure, not a crawl
        // failure.
        let crawl = self
            .crawler
            .fetch(&self.credential, search, cancel)
            .await
            .map_err(|e| match e {
                EngineError::Auth(_) => (RunStage::Authenticating, e),
                other => (RunStage::Crawling, other),
            })?;
        counters.record_crawl(&crawl);

        let filter = FilterAndDedupEngine::new(self.store.as_ref(), &self.base_url)
            .process(&crawl.raw, search)
            .await
            .map_err(|e| (RunStage::Filtering, e))?;
        counters.record_filter(&filter);

        if crawl.cancelled {
            return Err((RunStage::Crawling, EngineError::Cancelled));
        }

        // Compose, in acceptance order. Detail fetch is best effort; a
        // missing detail page only degrades the message.
        let mut items: Vec<(Listing, OutreachMessage)> = Vec::with_capacity(filter.accepted.len());
        for mut listing in filter.accepted {
            if cancel.is_cancelled() {
                return Err((RunStage::Composing, EngineError::Cancelled));
            }
            if listing.detail_text.is_none() {
                match self
                    .crawler
                    .fetch_detail(&self.credential, &listing.listing_id)
                    .await
                {
                    Ok(detail) => listing.detail_text = detail,
                    Err(e) => warn!(
                        listing_id = listing.listing_id.as_str(),
                        error = %e,
                        "detail fetch failed, composing from summary"
                    ),
                }
            }
            let message = self.composer.compose(&listing).await;
            items.push((listing, message));
        }

        let summary = self
            .dispatcher
            .send_batch(
                &self.credential,
                &items,
                search.policy,
                self.message_delay(search),
                cancel,
            )
            .await
            .map_err(|e| (RunStage::Dispatching, e))?;
        counters.record_dispatch(&summary);

        if summary.cancelled {
            return Err((RunStage::Dispatching, EngineError::Cancelled));
        }

        Ok(())
    }

    fn message_delay(&self, search: &SearchConfig) -> Duration {
        if search.message_delay_secs > 0 {
            Duration::from_secs(search.message_delay_secs)
        } else {
            self.default_message_delay
        }
    }
}
