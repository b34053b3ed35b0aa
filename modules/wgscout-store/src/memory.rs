//! In-memory store for deterministic engine tests. Same contract as the
//! Postgres store, including the insert-if-absent semantics.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use wgscout_common::{ConfigError, EngineError, Listing, SearchConfig};

use crate::ListingStore;

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    searches: HashMap<Uuid, SearchConfig>,
    // Keyed by external listing_id; the unique constraint.
    listings: HashMap<String, Listing>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test helper: a snapshot of one listing by external id.
    pub fn listing(&self, listing_id: &str) -> Option<Listing> {
        self.inner.lock().unwrap().listings.get(listing_id).cloned()
    }

    /// Test helper: number of persisted listing rows.
    pub fn listing_count(&self) -> usize {
        self.inner.lock().unwrap().listings.len()
    }

    /// Test helper: a snapshot of one search config.
    pub fn search(&self, search_id: Uuid) -> Option<SearchConfig> {
        self.inner.lock().unwrap().searches.get(&search_id).cloned()
    }

    /// Test helper: pre-seed a listing row (e.g. an already-seen or
    /// already-contacted one).
    pub fn seed_listing(&self, listing: Listing) {
        self.inner
            .lock()
            .unwrap()
            .listings
            .insert(listing.listing_id.clone(), listing);
    }
}

#[async_trait]
impl ListingStore for MemoryStore {
    async fn insert_listing_if_absent(&self, listing: &Listing) -> Result<bool, EngineError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.listings.contains_key(&listing.listing_id) {
            return Ok(false);
        }
        inner
            .listings
            .insert(listing.listing_id.clone(), listing.clone());
        Ok(true)
    }

    async fn is_seen(&self, listing_id: &str) -> Result<bool, EngineError> {
        Ok(self.inner.lock().unwrap().listings.contains_key(listing_id))
    }

    async fn is_contacted(&self, listing_id: &str) -> Result<bool, EngineError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .listings
            .get(listing_id)
            .map(|l| l.contacted)
            .unwrap_or(false))
    }

    async fn mark_contacted(&self, listing_id: &str) -> Result<bool, EngineError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.listings.get_mut(listing_id) {
            Some(l) if !l.contacted => {
                l.contacted = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn active_searches(&self) -> Result<Vec<SearchConfig>, EngineError> {
        let inner = self.inner.lock().unwrap();
        let mut searches: Vec<_> = inner
            .searches
            .values()
            .filter(|s| s.active)
            .cloned()
            .collect();
        searches.sort_by_key(|s| s.created_at);
        Ok(searches)
    }

    async fn insert_search(&self, config: &SearchConfig) -> Result<(), EngineError> {
        config.validate()?;
        let mut inner = self.inner.lock().unwrap();
        let duplicate = inner
            .searches
            .values()
            .any(|s| s.user_id == config.user_id && s.name == config.name);
        if duplicate {
            return Err(EngineError::Config(ConfigError::DuplicateName(
                config.name.clone(),
            )));
        }
        inner.searches.insert(config.id, config.clone());
        Ok(())
    }

    async fn update_search(&self, config: &SearchConfig) -> Result<(), EngineError> {
        config.validate()?;
        self.inner
            .lock()
            .unwrap()
            .searches
            .insert(config.id, config.clone());
        Ok(())
    }

    async fn delete_search(&self, search_id: Uuid) -> Result<(), EngineError> {
        self.inner.lock().unwrap().searches.remove(&search_id);
        Ok(())
    }

    async fn update_stats(
        &self,
        search_id: Uuid,
        total_found: i64,
        new_listings: i64,
        last_run: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(s) = inner.searches.get_mut(&search_id) {
            s.stats.total_found = total_found;
            s.stats.new_listings = new_listings;
            s.stats.last_run = Some(last_run);
        }
        Ok(())
    }

    async fn touch_last_run(
        &self,
        search_id: Uuid,
        last_run: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(s) = inner.searches.get_mut(&search_id) {
            s.stats.last_run = Some(last_run);
        }
        Ok(())
    }
}
