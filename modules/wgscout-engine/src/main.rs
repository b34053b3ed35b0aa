use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ai_client::{ChatModel, OpenAiClient};
use wgscout_common::Config;
use wgscout_engine::compose::{LanguageModel, MessageComposer, OpenAiLanguageModel, TemplateSet};
use wgscout_engine::crawler::{CrawlerConfig, ListingCrawler};
use wgscout_engine::dispatch::OutreachDispatcher;
use wgscout_engine::session::SessionManager;
use wgscout_engine::site::WgGesuchtClient;
use wgscout_engine::{CancelFlag, SearchScheduler};
use wgscout_store::{migrate, PgStore};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("wgscout=info".parse()?))
        .init();

    info!("WG-Scout starting...");

    // Load config
    let config = Config::from_env();
    config.log_redacted();

    // Connect to Postgres and run migrations
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await
        .context("connecting to postgres")?;
    migrate::migrate(&pool).await?;
    let store = Arc::new(PgStore::new(pool));

    // Site client and shared session cache
    let site = Arc::new(WgGesuchtClient::new(&config.site_base_url)?);
    let sessions = Arc::new(SessionManager::new(site.clone(), config.session_idle_ttl));

    let templates = load_templates(&config.template_dir, &config.default_language)?;

    let llm: Option<Arc<dyn LanguageModel>> = match &config.openai_api_key {
        Some(key) => {
            let chat: Arc<dyn ChatModel> = Arc::new(OpenAiClient::new(key));
            Some(Arc::new(OpenAiLanguageModel::new(
                chat,
                config.openai_model.clone(),
            )))
        }
        None => {
            info!("No LLM API key configured; composing from templates only");
            None
        }
    };

    let crawler = Arc::new(ListingCrawler::new(
        sessions.clone(),
        site.clone(),
        CrawlerConfig::new(config.crawl_delay),
    ));
    let composer = Arc::new(MessageComposer::new(
        templates,
        config.do_list.clone(),
        config.dont_list.clone(),
        llm,
    ));
    let dispatcher = Arc::new(OutreachDispatcher::new(
        sessions.clone(),
        site,
        store.clone(),
    ));

    let scheduler = SearchScheduler::new(
        store,
        crawler,
        composer,
        dispatcher,
        config.credential(),
        config.site_base_url.clone(),
        config.message_delay,
        config.max_concurrent_runs,
    );

    // Ctrl-C flips the flag; in-flight runs stop at the next page or send.
    let cancel = CancelFlag::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Shutdown requested; finishing current stage");
                cancel.cancel();
            }
        });
    }

    loop {
        let reports = scheduler.run_all(&cancel).await?;
        let completed = reports.iter().filter(|r| r.outcome.is_completed()).count();
        info!(
            runs = reports.len(),
            completed,
            failed = reports.len() - completed,
            "Cycle finished"
        );

        if cancel.is_cancelled() {
            break;
        }
        info!(secs = config.poll_interval.as_secs(), "Sleeping until next cycle");
        sleep_cancellable(config.poll_interval, &cancel).await;
        if cancel.is_cancelled() {
            break;
        }
    }

    info!("WG-Scout stopped");
    Ok(())
}

/// Load one template per language from `dir` (`<language>.txt`), with the
/// default language's template first so the composer's fallback uses it.
fn load_templates(dir: &str, default_language: &str) -> Result<TemplateSet> {
    let default_path = Path::new(dir).join(format!("{default_language}.txt"));
    let default_body = fs::read_to_string(&default_path)
        .with_context(|| format!("reading default template {}", default_path.display()))?;
    if default_body.trim().is_empty() {
        bail!("default template {} is empty", default_path.display());
    }

    let mut templates = TemplateSet::new(default_language, default_body.trim_end());

    for entry in fs::read_dir(dir).with_context(|| format!("listing template dir {dir}"))? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("txt") {
            continue;
        }
        let Some(language) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if language.eq_ignore_ascii_case(default_language) {
            continue;
        }
        let body = fs::read_to_string(&path)
            .with_context(|| format!("reading template {}", path.display()))?;
        if body.trim().is_empty() {
            warn!(template = %path.display(), "Skipping empty template");
            continue;
        }
        templates = templates.with(language, body.trim_end());
    }

    Ok(templates)
}

/// Sleep that wakes early once the flag is set.
async fn sleep_cancellable(duration: Duration, cancel: &CancelFlag) {
    const TICK: Duration = Duration::from_secs(1);
    let mut remaining = duration;
    while !cancel.is_cancelled() && remaining > Duration::ZERO {
        let step = remaining.min(TICK);
        tokio::time::sleep(step).await;
        remaining -= step;
    }
}
