//! Filter and dedup stage.
//!
//! Dedup is global across the entire listing history, not per search: the
//! site surfaces the same ad under multiple searches, and the unique
//! `listing_id` at the persistence boundary is the authority. Acceptance
//! inserts the row in the same step, so a listing appearing on two pages
//! of one run is accepted once.

use tracing::info;

use wgscout_common::{EngineError, Listing, RawListing, SearchConfig};
use wgscout_store::ListingStore;

/// Counts out of one filter/dedup pass. `new_listings` for the run is
/// `accepted.len()`; acceptance order follows source enumeration order.
#[derive(Debug, Default)]
pub struct FilterOutcome {
    pub accepted: Vec<Listing>,
    pub duplicates: u32,
    pub rejected_by_filter: u32,
}

pub struct FilterAndDedupEngine<'a> {
    store: &'a dyn ListingStore,
    base_url: &'a str,
}

impl<'a> FilterAndDedupEngine<'a> {
    pub fn new(store: &'a dyn ListingStore, base_url: &'a str) -> Self {
        Self { store, base_url }
    }

    pub async fn process(
        &self,
        raw: &[RawListing],
        config: &SearchConfig,
    ) -> Result<FilterOutcome, EngineError> {
        let mut outcome = FilterOutcome::default();

        for candidate in raw {
            // Seen before, under any search: duplicate.
            if self.store.is_seen(&candidate.listing_ref).await? {
                outcome.duplicates += 1;
                continue;
            }

            if !self.passes_filters(candidate, config).await? {
                outcome.rejected_by_filter += 1;
                continue;
            }

            let listing = Listing::from_raw(candidate, config.id, self.base_url);
            // Insert-if-absent is the acceptance step. A false here means
            // the same ad appeared earlier in this run (or a concurrent
            // run won the insert); either way it is a duplicate, not ours.
            if self.store.insert_listing_if_absent(&listing).await? {
                outcome.accepted.push(listing);
            } else {
                outcome.duplicates += 1;
            }
        }

        info!(
            search = config.name.as_str(),
            accepted = outcome.accepted.len(),
            duplicates = outcome.duplicates,
            rejected = outcome.rejected_by_filter,
            "filter/dedup pass complete"
        );

        Ok(outcome)
    }

    async fn passes_filters(
        &self,
        candidate: &RawListing,
        config: &SearchConfig,
    ) -> Result<bool, EngineError> {
        let filters = &config.filters;

        // Bounds are inclusive. Unknown values pass: the site already
        // applied the server-side form of each filter, so a missing field
        // is a parse gap, not a violation.
        if let (Some(price), Some(max)) = (candidate.price_eur, filters.max_price) {
            if price > max {
                return Ok(false);
            }
        }
        if let (Some(size), Some(min)) = (candidate.size_sqm, filters.min_size) {
            if size < min {
                return Ok(false);
            }
        }

        // District membership is enforced by the site through the query
        // string (`ot[]` takes numeric ids); result rows only expose the
        // district name, so there is nothing comparable to re-check here.

        // Date-range overlap: the rental must not start after our window
        // ends, nor end before it begins. Open-ended rentals overlap any
        // window they start inside.
        if let (Some(window_start), Some(window_end)) =
            (filters.date_range_start, filters.date_range_end)
        {
            if let Some(start) = candidate.rental_start {
                if start > window_end {
                    return Ok(false);
                }
            }
            if let Some(end) = candidate.rental_end {
                if end < window_start {
                    return Ok(false);
                }
            }
        }

        // Contacted history is shared across all searches.
        if filters.exclude_contacted && self.store.is_contacted(&candidate.listing_ref).await? {
            return Ok(false);
        }

        Ok(true)
    }
}
