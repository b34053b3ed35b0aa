//! Persistence for searches and listings.
//!
//! The dedup index is not an in-memory set: "have we seen this listing"
//! is answered by the UNIQUE constraint on `individual_listings.listing_id`
//! and an atomic insert-if-absent, so correctness does not depend on
//! process lifetime or single-instance deployment.

pub mod memory;
pub mod migrate;
pub mod pg;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use wgscout_common::{EngineError, Listing, SearchConfig};

pub use memory::MemoryStore;
pub use pg::PgStore;

/// Storage operations the engine depends on. Postgres in production,
/// in-memory for tests.
#[async_trait]
pub trait ListingStore: Send + Sync {
    /// Atomic insert-if-absent keyed on the external `listing_id`.
    /// Returns true if the row was inserted, false if it already existed.
    async fn insert_listing_if_absent(&self, listing: &Listing) -> Result<bool, EngineError>;

    /// Whether this external id exists in history, across all searches.
    async fn is_seen(&self, listing_id: &str) -> Result<bool, EngineError>;

    /// Whether this listing has ever been contacted, across all searches.
    async fn is_contacted(&self, listing_id: &str) -> Result<bool, EngineError>;

    /// Flip `contacted` false -> true. Returns true if this call made the
    /// transition, false if it was already set (or the row is missing).
    async fn mark_contacted(&self, listing_id: &str) -> Result<bool, EngineError>;

    /// All searches with `active = true`, eligible for scheduling.
    async fn active_searches(&self) -> Result<Vec<SearchConfig>, EngineError>;

    /// Create a search. Duplicate (user, name) pairs are rejected with
    /// `ConfigError::DuplicateName`.
    async fn insert_search(&self, config: &SearchConfig) -> Result<(), EngineError>;

    /// Replace a search's filters, policy, and active flag.
    async fn update_search(&self, config: &SearchConfig) -> Result<(), EngineError>;

    async fn delete_search(&self, search_id: Uuid) -> Result<(), EngineError>;

    /// Successful run: update all three stats fields atomically.
    async fn update_stats(
        &self,
        search_id: Uuid,
        total_found: i64,
        new_listings: i64,
        last_run: DateTime<Utc>,
    ) -> Result<(), EngineError>;

    /// Failed run: a run attempt still happened, so `last_run` moves while
    /// the counters keep their prior values.
    async fn touch_last_run(
        &self,
        search_id: Uuid,
        last_run: DateTime<Utc>,
    ) -> Result<(), EngineError>;
}
