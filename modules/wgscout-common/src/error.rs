use thiserror::Error;

/// Authentication failures against the external site.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Wrong email/password. Fatal for this credential until the owner
    /// updates it; never retried automatically.
    #[error("invalid credentials for {email}")]
    InvalidCredentials { email: String },

    /// The site throttled the login. Retried with exponential backoff.
    #[error("login rate limited by site")]
    RateLimited,

    /// Transport-level failure reaching the site.
    #[error("site unreachable: {0}")]
    Unreachable(String),
}

/// Failures while enumerating result pages.
#[derive(Debug, Error)]
pub enum CrawlError {
    /// A page-level fetch failed. Aborts the remaining pages of this run
    /// but not the scheduler loop.
    #[error("page {page} fetch failed: {cause}")]
    PageFetchFailed { page: u32, cause: String },

    /// The result markup no longer matches what the parser expects.
    #[error("source markup changed: {0}")]
    SourceChanged(String),
}

/// Failures inside the LLM-backed composition path. Always recoverable:
/// the composer falls back to the deterministic template on any of these.
#[derive(Debug, Error)]
pub enum ComposeError {
    #[error("llm call timed out")]
    LlmTimeout,

    #[error("llm response invalid: {0}")]
    LlmInvalidResponse(String),
}

/// Failures while sending an outreach message.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The listing was already contacted. Treated as a no-op skip.
    #[error("listing already contacted")]
    AlreadyContacted,

    /// The site refused the message (missing form, blocked account, ...).
    #[error("send rejected by site: {0}")]
    SendRejected(String),

    #[error("site unreachable: {0}")]
    Unreachable(String),
}

/// Invalid owner-supplied configuration. Never retried automatically.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid range for {field}: {detail}")]
    InvalidRange {
        field: &'static str,
        detail: String,
    },

    #[error("duplicate search name: {0}")]
    DuplicateName(String),
}

/// Unified error surfaced by a run. Wraps the per-stage taxonomy so the
/// scheduler can record which stage failed without losing the cause.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Crawl(#[from] CrawlError),

    #[error(transparent)]
    Compose(#[from] ComposeError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("run cancelled")]
    Cancelled,
}
