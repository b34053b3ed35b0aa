//! Postgres-backed store.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use wgscout_common::{
    ConfigError, DispatchPolicy, EngineError, GenderPreference, Listing, SearchConfig,
    SearchFilters, SearchStats, SmokingPreference,
};

use crate::ListingStore;

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn storage(e: sqlx::Error) -> EngineError {
    EngineError::Storage(e.to_string())
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

#[derive(FromRow)]
struct SearchRow {
    id: Uuid,
    user_id: Uuid,
    name: String,
    active: bool,
    location: String,
    city_id: i32,
    max_price: Option<i32>,
    min_size: Option<i32>,
    date_range_start: Option<NaiveDate>,
    date_range_end: Option<NaiveDate>,
    property_types: Json<Vec<String>>,
    rent_types: Json<Vec<String>>,
    wg_types: Json<Vec<String>>,
    districts: Json<Vec<String>>,
    gender_preference: String,
    smoking_preference: String,
    min_age: Option<i32>,
    max_age: Option<i32>,
    images_only: bool,
    exclude_contacted: bool,
    policy: String,
    message_delay_secs: i64,
    total_found: i64,
    new_listings: i64,
    last_run: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl From<SearchRow> for SearchConfig {
    fn from(row: SearchRow) -> Self {
        SearchConfig {
            id: row.id,
            user_id: row.user_id,
            name: row.name,
            active: row.active,
            filters: SearchFilters {
                location: row.location,
                city_id: row.city_id as u32,
                max_price: row.max_price,
                min_size: row.min_size,
                date_range_start: row.date_range_start,
                date_range_end: row.date_range_end,
                property_types: row.property_types.0,
                rent_types: row.rent_types.0,
                wg_types: row.wg_types.0,
                districts: row.districts.0,
                gender: gender_from_str(&row.gender_preference),
                smoking: smoking_from_str(&row.smoking_preference),
                min_age: row.min_age,
                max_age: row.max_age,
                images_only: row.images_only,
                exclude_contacted: row.exclude_contacted,
            },
            policy: policy_from_str(&row.policy),
            message_delay_secs: row.message_delay_secs.max(0) as u64,
            stats: SearchStats {
                total_found: row.total_found,
                new_listings: row.new_listings,
                last_run: row.last_run,
            },
            created_at: row.created_at,
        }
    }
}

fn gender_from_str(s: &str) -> GenderPreference {
    match s {
        "male" => GenderPreference::Male,
        "female" => GenderPreference::Female,
        _ => GenderPreference::Any,
    }
}

fn gender_to_str(g: GenderPreference) -> &'static str {
    match g {
        GenderPreference::Any => "any",
        GenderPreference::Male => "male",
        GenderPreference::Female => "female",
    }
}

fn smoking_from_str(s: &str) -> SmokingPreference {
    match s {
        "non_smoking" => SmokingPreference::NonSmoking,
        "smoking" => SmokingPreference::Smoking,
        _ => SmokingPreference::Any,
    }
}

fn smoking_to_str(s: SmokingPreference) -> &'static str {
    match s {
        SmokingPreference::Any => "any",
        SmokingPreference::NonSmoking => "non_smoking",
        SmokingPreference::Smoking => "smoking",
    }
}

fn policy_from_str(s: &str) -> DispatchPolicy {
    match s {
        "auto_send" => DispatchPolicy::AutoSend,
        _ => DispatchPolicy::Manual,
    }
}

fn policy_to_str(p: DispatchPolicy) -> &'static str {
    match p {
        DispatchPolicy::Manual => "manual",
        DispatchPolicy::AutoSend => "auto_send",
    }
}

const SEARCH_FIELDS: &str = "id, user_id, name, active, location, city_id, max_price, min_size, \
     date_range_start, date_range_end, property_types, rent_types, wg_types, districts, \
     gender_preference, smoking_preference, min_age, max_age, images_only, exclude_contacted, \
     policy, message_delay_secs, total_found, new_listings, last_run, created_at";

// ---------------------------------------------------------------------------
// ListingStore impl
// ---------------------------------------------------------------------------

#[async_trait]
impl ListingStore for PgStore {
    async fn insert_listing_if_absent(&self, listing: &Listing) -> Result<bool, EngineError> {
        let result = sqlx::query(
            r#"
            INSERT INTO individual_listings (
                id, listing_id, search_id, title, url, location, price_eur, size_sqm,
                rental_start, rental_end, deposit_eur, utilities_eur, other_costs_eur,
                schufa_required, online_since, detail_text, contact_name, contacted, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
            ON CONFLICT (listing_id) DO NOTHING
            "#,
        )
        .bind(listing.id)
        .bind(&listing.listing_id)
        .bind(listing.search_id)
        .bind(&listing.title)
        .bind(&listing.url)
        .bind(&listing.location)
        .bind(listing.price_eur)
        .bind(listing.size_sqm)
        .bind(listing.rental_start)
        .bind(listing.rental_end)
        .bind(listing.deposit_eur)
        .bind(listing.utilities_eur)
        .bind(listing.other_costs_eur)
        .bind(listing.schufa_required)
        .bind(&listing.online_since)
        .bind(&listing.detail_text)
        .bind(&listing.contact_name)
        .bind(listing.contacted)
        .bind(listing.created_at)
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        Ok(result.rows_affected() == 1)
    }

    async fn is_seen(&self, listing_id: &str) -> Result<bool, EngineError> {
        let row: Option<(i32,)> =
            sqlx::query_as("SELECT 1 FROM individual_listings WHERE listing_id = $1")
                .bind(listing_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(storage)?;
        Ok(row.is_some())
    }

    async fn is_contacted(&self, listing_id: &str) -> Result<bool, EngineError> {
        let row: Option<(bool,)> =
            sqlx::query_as("SELECT contacted FROM individual_listings WHERE listing_id = $1")
                .bind(listing_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(storage)?;
        Ok(row.map(|(c,)| c).unwrap_or(false))
    }

    async fn mark_contacted(&self, listing_id: &str) -> Result<bool, EngineError> {
        let result = sqlx::query(
            "UPDATE individual_listings SET contacted = TRUE \
             WHERE listing_id = $1 AND contacted = FALSE",
        )
        .bind(listing_id)
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(result.rows_affected() == 1)
    }

    async fn active_searches(&self) -> Result<Vec<SearchConfig>, EngineError> {
        let rows: Vec<SearchRow> = sqlx::query_as(&format!(
            "SELECT {SEARCH_FIELDS} FROM searches WHERE active = TRUE ORDER BY created_at"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;
        Ok(rows.into_iter().map(SearchConfig::from).collect())
    }

    async fn insert_search(&self, config: &SearchConfig) -> Result<(), EngineError> {
        config.validate()?;
        let result = sqlx::query(
            r#"
            INSERT INTO searches (
                id, user_id, name, active, location, city_id, max_price, min_size,
                date_range_start, date_range_end, property_types, rent_types, wg_types,
                districts, gender_preference, smoking_preference, min_age, max_age,
                images_only, exclude_contacted, policy, message_delay_secs,
                total_found, new_listings, last_run, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                    $17, $18, $19, $20, $21, $22, $23, $24, $25, $26)
            "#,
        )
        .bind(config.id)
        .bind(config.user_id)
        .bind(&config.name)
        .bind(config.active)
        .bind(&config.filters.location)
        .bind(config.filters.city_id as i32)
        .bind(config.filters.max_price)
        .bind(config.filters.min_size)
        .bind(config.filters.date_range_start)
        .bind(config.filters.date_range_end)
        .bind(Json(&config.filters.property_types))
        .bind(Json(&config.filters.rent_types))
        .bind(Json(&config.filters.wg_types))
        .bind(Json(&config.filters.districts))
        .bind(gender_to_str(config.filters.gender))
        .bind(smoking_to_str(config.filters.smoking))
        .bind(config.filters.min_age)
        .bind(config.filters.max_age)
        .bind(config.filters.images_only)
        .bind(config.filters.exclude_contacted)
        .bind(policy_to_str(config.policy))
        .bind(config.message_delay_secs as i64)
        .bind(config.stats.total_found)
        .bind(config.stats.new_listings)
        .bind(config.stats.last_run)
        .bind(config.created_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(EngineError::Config(
                ConfigError::DuplicateName(config.name.clone()),
            )),
            Err(e) => Err(storage(e)),
        }
    }

    async fn update_search(&self, config: &SearchConfig) -> Result<(), EngineError> {
        config.validate()?;
        sqlx::query(
            r#"
            UPDATE searches SET
                name = $2, active = $3, location = $4, city_id = $5, max_price = $6,
                min_size = $7, date_range_start = $8, date_range_end = $9,
                property_types = $10, rent_types = $11, wg_types = $12, districts = $13,
                gender_preference = $14, smoking_preference = $15, min_age = $16,
                max_age = $17, images_only = $18, exclude_contacted = $19,
                policy = $20, message_delay_secs = $21
            WHERE id = $1
            "#,
        )
        .bind(config.id)
        .bind(&config.name)
        .bind(config.active)
        .bind(&config.filters.location)
        .bind(config.filters.city_id as i32)
        .bind(config.filters.max_price)
        .bind(config.filters.min_size)
        .bind(config.filters.date_range_start)
        .bind(config.filters.date_range_end)
        .bind(Json(&config.filters.property_types))
        .bind(Json(&config.filters.rent_types))
        .bind(Json(&config.filters.wg_types))
        .bind(Json(&config.filters.districts))
        .bind(gender_to_str(config.filters.gender))
        .bind(smoking_to_str(config.filters.smoking))
        .bind(config.filters.min_age)
        .bind(config.filters.max_age)
        .bind(config.filters.images_only)
        .bind(config.filters.exclude_contacted)
        .bind(policy_to_str(config.policy))
        .bind(config.message_delay_secs as i64)
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(())
    }

    async fn delete_search(&self, search_id: Uuid) -> Result<(), EngineError> {
        sqlx::query("DELETE FROM searches WHERE id = $1")
            .bind(search_id)
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        Ok(())
    }

    async fn update_stats(
        &self,
        search_id: Uuid,
        total_found: i64,
        new_listings: i64,
        last_run: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        sqlx::query(
            "UPDATE searches SET total_found = $2, new_listings = $3, last_run = $4 WHERE id = $1",
        )
        .bind(search_id)
        .bind(total_found)
        .bind(new_listings)
        .bind(last_run)
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(())
    }

    async fn touch_last_run(
        &self,
        search_id: Uuid,
        last_run: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        sqlx::query("UPDATE searches SET last_run = $2 WHERE id = $1")
            .bind(search_id)
            .bind(last_run)
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        Ok(())
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .map(|db| db.is_unique_violation())
        .unwrap_or(false)
}
