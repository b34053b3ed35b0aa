//! Idempotent schema bootstrap. Run once at startup.

use anyhow::Result;
use sqlx::PgPool;
use tracing::info;

pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS searches (
            id                 UUID         PRIMARY KEY,
            user_id            UUID         NOT NULL,
            name               TEXT         NOT NULL,
            active             BOOLEAN      NOT NULL DEFAULT TRUE,
            location           TEXT         NOT NULL,
            city_id            INTEGER      NOT NULL,
            max_price          INTEGER,
            min_size           INTEGER,
            date_range_start   DATE,
            date_range_end     DATE,
            property_types     JSONB        NOT NULL DEFAULT '[]',
            rent_types         JSONB        NOT NULL DEFAULT '[]',
            wg_types           JSONB        NOT NULL DEFAULT '[]',
            districts          JSONB        NOT NULL DEFAULT '[]',
            gender_preference  TEXT         NOT NULL DEFAULT 'any',
            smoking_preference TEXT         NOT NULL DEFAULT 'any',
            min_age            INTEGER,
            max_age            INTEGER,
            images_only        BOOLEAN      NOT NULL DEFAULT FALSE,
            exclude_contacted  BOOLEAN      NOT NULL DEFAULT TRUE,
            policy             TEXT         NOT NULL DEFAULT 'manual',
            message_delay_secs BIGINT       NOT NULL DEFAULT 30,
            total_found        BIGINT       NOT NULL DEFAULT 0,
            new_listings       BIGINT       NOT NULL DEFAULT 0,
            last_run           TIMESTAMPTZ,
            created_at         TIMESTAMPTZ  NOT NULL DEFAULT now(),
            UNIQUE (user_id, name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS individual_listings (
            id              UUID         PRIMARY KEY,
            listing_id      TEXT         NOT NULL UNIQUE,
            search_id       UUID         NOT NULL REFERENCES searches(id) ON DELETE CASCADE,
            title           TEXT         NOT NULL,
            url             TEXT         NOT NULL,
            location        TEXT         NOT NULL,
            price_eur       INTEGER,
            size_sqm        INTEGER,
            rental_start    DATE,
            rental_end      DATE,
            deposit_eur     INTEGER,
            utilities_eur   INTEGER,
            other_costs_eur INTEGER,
            schufa_required BOOLEAN      NOT NULL DEFAULT FALSE,
            online_since    TEXT,
            detail_text     TEXT,
            contact_name    TEXT         NOT NULL,
            contacted       BOOLEAN      NOT NULL DEFAULT FALSE,
            created_at      TIMESTAMPTZ  NOT NULL DEFAULT now()
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_listings_search ON individual_listings (search_id)",
    )
    .execute(pool)
    .await?;

    info!("Schema migration complete");
    Ok(())
}
