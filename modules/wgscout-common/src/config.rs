use std::env;
use std::time::Duration;

use tracing::info;

use crate::types::{Credential, DEFAULT_SITE_BASE_URL};

/// Engine configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // Persistence
    pub database_url: String,

    // External site
    pub site_base_url: String,
    pub wg_email: String,
    pub wg_password: String,

    // LLM (optional; engine degrades to template fallback without it)
    pub openai_api_key: Option<String>,
    pub openai_model: String,

    // Pacing
    /// Minimum delay between result-page requests.
    pub crawl_delay: Duration,
    /// Default delay between sends, overridable per search.
    pub message_delay: Duration,
    /// How often the scheduler re-runs active searches.
    pub poll_interval: Duration,

    // Concurrency
    /// Global cap on simultaneous runs (and thus sessions) to the site.
    pub max_concurrent_runs: usize,
    /// Idle TTL after which a cached session is re-established.
    pub session_idle_ttl: Duration,

    // Composition
    /// Directory holding one message template per language, named
    /// `<language>.txt`.
    pub template_dir: String,
    /// Language whose template is the fallback when detection finds no match.
    pub default_language: String,
    /// Instructions the generated message must follow / avoid.
    pub do_list: Vec<String>,
    pub dont_list: Vec<String>,
}

impl Config {
    /// Load configuration from environment variables.
    /// Panics with a clear message if required vars are missing.
    pub fn from_env() -> Self {
        Self {
            database_url: required_env("DATABASE_URL"),
            site_base_url: env::var("SITE_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_SITE_BASE_URL.to_string()),
            wg_email: required_env("WG_EMAIL"),
            wg_password: required_env("WG_PASSWORD"),
            openai_api_key: env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty()),
            openai_model: env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            crawl_delay: duration_env("CRAWL_DELAY_SECS", 2),
            message_delay: duration_env("MESSAGE_DELAY_SECS", 30),
            poll_interval: duration_env("POLL_INTERVAL_SECS", 600),
            max_concurrent_runs: env::var("MAX_CONCURRENT_RUNS")
                .unwrap_or_else(|_| "2".to_string())
                .parse()
                .expect("MAX_CONCURRENT_RUNS must be a number"),
            session_idle_ttl: duration_env("SESSION_IDLE_TTL_SECS", 1800),
            template_dir: env::var("TEMPLATE_DIR").unwrap_or_else(|_| "templates".to_string()),
            default_language: env::var("DEFAULT_LANGUAGE")
                .unwrap_or_else(|_| "english".to_string())
                .to_lowercase(),
            do_list: list_env("COMPOSE_DO_LIST"),
            dont_list: list_env("COMPOSE_DONT_LIST"),
        }
    }

    /// The site credential this process runs under.
    pub fn credential(&self) -> Credential {
        Credential {
            email: self.wg_email.clone(),
            password: self.wg_password.clone(),
            llm_api_key: self.openai_api_key.clone(),
        }
    }

    /// Log a startup summary with secrets redacted.
    pub fn log_redacted(&self) {
        info!(
            site = self.site_base_url.as_str(),
            email = self.wg_email.as_str(),
            llm = self.openai_api_key.is_some(),
            model = self.openai_model.as_str(),
            crawl_delay_secs = self.crawl_delay.as_secs(),
            message_delay_secs = self.message_delay.as_secs(),
            poll_interval_secs = self.poll_interval.as_secs(),
            max_concurrent_runs = self.max_concurrent_runs,
            "Config loaded"
        );
    }
}

fn required_env(key: &str) -> String {
    env::var(key).unwrap_or_else(|_| panic!("{key} environment variable is required"))
}

/// Semicolon-separated list, empty when unset.
fn list_env(key: &str) -> Vec<String> {
    env::var(key)
        .map(|v| {
            v.split(';')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn duration_env(key: &str, default_secs: u64) -> Duration {
    let secs = env::var(key)
        .ok()
        .map(|v| v.parse().unwrap_or_else(|_| panic!("{key} must be a number")))
        .unwrap_or(default_secs);
    Duration::from_secs(secs)
}
