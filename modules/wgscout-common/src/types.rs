use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ConfigError;

// --- Preferences ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GenderPreference {
    /// "egal" on the site: no preference.
    #[default]
    Any,
    Male,
    Female,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SmokingPreference {
    #[default]
    Any,
    NonSmoking,
    Smoking,
}

// --- SearchConfig ---

/// Filter set for one saved search, translated into the site's query form
/// by the crawler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchFilters {
    /// City name as shown in the site URL, e.g. "Berlin".
    pub location: String,
    /// The site's numeric city id, e.g. 8 for Berlin.
    pub city_id: u32,
    pub max_price: Option<i32>,
    pub min_size: Option<i32>,
    pub date_range_start: Option<NaiveDate>,
    pub date_range_end: Option<NaiveDate>,
    pub property_types: Vec<String>,
    pub rent_types: Vec<String>,
    pub wg_types: Vec<String>,
    /// District ids ("ot" query params). Empty means no district filter.
    pub districts: Vec<String>,
    pub gender: GenderPreference,
    pub smoking: SmokingPreference,
    pub min_age: Option<i32>,
    pub max_age: Option<i32>,
    pub images_only: bool,
    pub exclude_contacted: bool,
}

impl SearchFilters {
    /// Reject out-of-range values with a typed error. Inputs arrive
    /// pre-validated from the UI layer, but the engine never silently
    /// clamps.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(p) = self.max_price {
            if p < 0 {
                return Err(ConfigError::InvalidRange {
                    field: "max_price",
                    detail: format!("must be non-negative, got {p}"),
                });
            }
        }
        if let Some(s) = self.min_size {
            if s < 0 {
                return Err(ConfigError::InvalidRange {
                    field: "min_size",
                    detail: format!("must be non-negative, got {s}"),
                });
            }
        }
        if let (Some(min), Some(max)) = (self.min_age, self.max_age) {
            if min < 0 || max < 0 || min > max {
                return Err(ConfigError::InvalidRange {
                    field: "age_range",
                    detail: format!("invalid bounds {min}..{max}"),
                });
            }
        }
        if let (Some(start), Some(end)) = (self.date_range_start, self.date_range_end) {
            if start > end {
                return Err(ConfigError::InvalidRange {
                    field: "date_range",
                    detail: format!("start {start} is after end {end}"),
                });
            }
        }
        Ok(())
    }
}

/// Per-search run statistics, mutated only by the scheduler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchStats {
    pub total_found: i64,
    pub new_listings: i64,
    pub last_run: Option<DateTime<Utc>>,
}

/// How dispatch behaves for a given search. An explicit value instead of
/// scattered boolean checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchPolicy {
    /// Compose only; queue for manual review, never contact the site.
    Manual,
    /// Send immediately after composing.
    AutoSend,
}

/// A saved, named search: filters plus run statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub active: bool,
    pub filters: SearchFilters,
    pub policy: DispatchPolicy,
    /// Seconds between sends within this search's run.
    pub message_delay_secs: u64,
    pub stats: SearchStats,
    pub created_at: DateTime<Utc>,
}

/// Upper bound on the per-search send delay the UI may configure.
pub const MAX_MESSAGE_DELAY_SECS: u64 = 3600;

impl SearchConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.filters.validate()?;
        if self.message_delay_secs > MAX_MESSAGE_DELAY_SECS {
            return Err(ConfigError::InvalidRange {
                field: "message_delay_secs",
                detail: format!(
                    "must be at most {MAX_MESSAGE_DELAY_SECS}, got {}",
                    self.message_delay_secs
                ),
            });
        }
        Ok(())
    }
}

// --- Listings ---

/// One listing row as parsed off a result page, before filtering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawListing {
    /// Site-relative URL of the ad. The unique external identity.
    pub listing_ref: String,
    pub contact_name: String,
    pub address: String,
    pub wg_type: String,
    pub district: Option<String>,
    pub price_eur: Option<i32>,
    pub size_sqm: Option<i32>,
    pub rental_start: Option<NaiveDate>,
    /// None means "unbefristet" (open-ended).
    pub rental_end: Option<NaiveDate>,
    pub online_since: Option<String>,
    /// Free text from the detail page, when fetched.
    pub detail_text: Option<String>,
}

impl RawListing {
    /// Rental duration in whole months, or -1 for open-ended rentals.
    pub fn rental_duration_months(&self) -> i32 {
        use chrono::Datelike;
        match (self.rental_start, self.rental_end) {
            (Some(start), Some(end)) => {
                (end.year() - start.year()) * 12 + (end.month() as i32 - start.month() as i32)
            }
            _ => -1,
        }
    }

    /// First name of the listing's contact, used for the message greeting.
    pub fn contact_first_name(&self) -> &str {
        self.contact_name
            .split_whitespace()
            .next()
            .unwrap_or(&self.contact_name)
    }
}

/// A persisted listing. Immutable after insert except for `contacted`,
/// which transitions false -> true exactly once on successful dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Listing {
    pub id: Uuid,
    /// External unique id (the site-relative ad URL). Dedup key.
    pub listing_id: String,
    /// The search that first discovered this listing.
    pub search_id: Uuid,
    pub title: String,
    pub url: String,
    pub location: String,
    pub price_eur: Option<i32>,
    pub size_sqm: Option<i32>,
    pub rental_start: Option<NaiveDate>,
    pub rental_end: Option<NaiveDate>,
    pub deposit_eur: Option<i32>,
    pub utilities_eur: Option<i32>,
    pub other_costs_eur: Option<i32>,
    pub schufa_required: bool,
    pub online_since: Option<String>,
    pub detail_text: Option<String>,
    pub contact_name: String,
    pub contacted: bool,
    pub created_at: DateTime<Utc>,
}

/// Base URL of the external site, overridable for tests.
pub const DEFAULT_SITE_BASE_URL: &str = "https://www.wg-gesucht.de";

impl Listing {
    /// Build a persistable listing from an accepted raw row.
    pub fn from_raw(raw: &RawListing, search_id: Uuid, base_url: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            listing_id: raw.listing_ref.clone(),
            search_id,
            title: format!("{} ({})", raw.address, raw.wg_type),
            url: format!("{}{}", base_url.trim_end_matches('/'), raw.listing_ref),
            location: raw.address.clone(),
            price_eur: raw.price_eur,
            size_sqm: raw.size_sqm,
            rental_start: raw.rental_start,
            rental_end: raw.rental_end,
            deposit_eur: None,
            utilities_eur: None,
            other_costs_eur: None,
            schufa_required: false,
            online_since: raw.online_since.clone(),
            detail_text: raw.detail_text.clone(),
            contact_name: raw.contact_name.clone(),
            contacted: false,
            created_at: Utc::now(),
        }
    }

    pub fn contact_first_name(&self) -> &str {
        self.contact_name
            .split_whitespace()
            .next()
            .unwrap_or(&self.contact_name)
    }
}

// --- Outreach ---

/// Composed message, attached to a listing at send time. Not persisted
/// as its own entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutreachMessage {
    pub language: String,
    pub keyword: Option<String>,
    pub body: String,
}

// --- Credentials ---

/// Site login pair plus optional LLM API key. Debug output is redacted;
/// this type never crosses the engine boundary.
#[derive(Clone, Serialize, Deserialize)]
pub struct Credential {
    pub email: String,
    pub password: String,
    pub llm_api_key: Option<String>,
}

impl Credential {
    /// Cache key for the session manager. One session per credential.
    pub fn cache_key(&self) -> &str {
        &self.email
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("email", &self.email)
            .field("password", &"***")
            .field("llm_api_key", &self.llm_api_key.as_ref().map(|_| "***"))
            .finish()
    }
}
