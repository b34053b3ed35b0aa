//! The external site as a capability: an authenticated session exposing
//! page fetches and message sends. Production talks HTTP with a cookie
//! session; tests substitute a stub.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use wgscout_common::Credential;

/// Opaque handle to one authenticated session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: Uuid,
    /// CSRF token issued at login, echoed on form posts.
    pub csrf_token: String,
}

/// Site-level failures, as the transport reports them. The session
/// manager and dispatcher translate these into the engine taxonomy.
#[derive(Debug, Error)]
pub enum SiteError {
    /// The site no longer recognizes the session cookie.
    #[error("session expired")]
    SessionExpired,

    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("rate limited")]
    RateLimited,

    /// The message form exists but the site refused the submission.
    #[error("send rejected: {0}")]
    Rejected(String),

    /// The conversation already has a sent message for this listing.
    #[error("message already sent for this listing")]
    AlreadyMessaged,

    #[error("transport error: {0}")]
    Transport(String),
}

/// Everything the engine needs from the external site.
#[async_trait]
pub trait SiteClient: Send + Sync {
    async fn login(&self, credential: &Credential) -> Result<Session, SiteError>;

    /// Fetch one page (search results or listing detail) as HTML.
    async fn fetch_page(&self, session: &Session, url: &str) -> Result<String, SiteError>;

    /// Post an outreach message to the listing's conversation thread.
    async fn send_message(
        &self,
        session: &Session,
        listing_ref: &str,
        body: &str,
    ) -> Result<(), SiteError>;
}

// ---------------------------------------------------------------------------
// Production client
// ---------------------------------------------------------------------------

const CALL_TIMEOUT: Duration = Duration::from_secs(30);
const USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64; rv:124.0) Gecko/20100101 Firefox/124.0";

/// Cookie-session HTTP client for wg-gesucht.de.
pub struct WgGesuchtClient {
    http: reqwest::Client,
    base_url: String,
}

impl WgGesuchtClient {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(CALL_TIMEOUT)
            .cookie_store(true)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn absolute(&self, path_or_url: &str) -> String {
        if path_or_url.starts_with("http") {
            path_or_url.to_string()
        } else {
            format!("{}{}", self.base_url, path_or_url)
        }
    }

    fn transport(e: reqwest::Error) -> SiteError {
        if e.is_timeout() {
            SiteError::Transport("timeout".to_string())
        } else {
            SiteError::Transport(e.to_string())
        }
    }
}

#[async_trait]
impl SiteClient for WgGesuchtClient {
    async fn login(&self, credential: &Credential) -> Result<Session, SiteError> {
        let url = format!("{}/ajax/sessions.php?action=login", self.base_url);

        debug!(email = credential.email.as_str(), "logging in");

        let response = self
            .http
            .post(&url)
            .form(&[
                ("login_email_username", credential.email.as_str()),
                ("login_password", credential.password.as_str()),
                ("login_form_auto_login", "1"),
                ("display_language", "de"),
            ])
            .send()
            .await
            .map_err(Self::transport)?;

        match response.status().as_u16() {
            429 => return Err(SiteError::RateLimited),
            401 | 403 => return Err(SiteError::InvalidCredentials),
            s if s >= 500 => return Err(SiteError::Transport(format!("status {s}"))),
            _ => {}
        }

        let body = response.text().await.map_err(Self::transport)?;

        // The login endpoint answers 200 with an error payload on bad
        // credentials; the success payload carries the csrf token.
        if body.contains("\"success\":false") || body.contains("login_error") {
            return Err(SiteError::InvalidCredentials);
        }
        let csrf_token = extract_csrf(&body).unwrap_or_default();

        info!(email = credential.email.as_str(), "session established");

        Ok(Session {
            id: Uuid::new_v4(),
            csrf_token,
        })
    }

    async fn fetch_page(&self, _session: &Session, url: &str) -> Result<String, SiteError> {
        let url = self.absolute(url);

        let response = self.http.get(&url).send().await.map_err(Self::transport)?;

        match response.status().as_u16() {
            429 => return Err(SiteError::RateLimited),
            s if s >= 500 => return Err(SiteError::Transport(format!("status {s}"))),
            _ => {}
        }

        let html = response.text().await.map_err(Self::transport)?;

        // A dead session gets bounced to the login form instead of content.
        if html.contains("id=\"login_email_username\"") && !html.contains("logout") {
            return Err(SiteError::SessionExpired);
        }

        Ok(html)
    }

    async fn send_message(
        &self,
        session: &Session,
        listing_ref: &str,
        body: &str,
    ) -> Result<(), SiteError> {
        let form_url = self.absolute(&format!("/nachricht-senden{listing_ref}"));

        let page = self.fetch_page(session, &form_url).await?;

        // Conversation already has a message: sending again is refused.
        if page.contains("message_timestamp") {
            return Err(SiteError::AlreadyMessaged);
        }
        if !page.contains("message_input") {
            return Err(SiteError::Rejected("message form not present".to_string()));
        }

        let response = self
            .http
            .post(&form_url)
            .form(&[
                ("message", body),
                ("csrf_token", session.csrf_token.as_str()),
                ("u_anrede", "0"),
            ])
            .send()
            .await
            .map_err(Self::transport)?;

        match response.status().as_u16() {
            401 | 403 => Err(SiteError::SessionExpired),
            429 => Err(SiteError::RateLimited),
            s if s >= 400 => Err(SiteError::Rejected(format!("status {s}"))),
            _ => Ok(()),
        }
    }
}

fn extract_csrf(body: &str) -> Option<String> {
    let start = body.find("csrf_token")?;
    let rest = &body[start..];
    let value_start = rest.find(':').or_else(|| rest.find('='))? + 1;
    let token: String = rest[value_start..]
        .chars()
        .skip_while(|c| *c == '"' || *c == '\'' || c.is_whitespace())
        .take_while(|c| c.is_ascii_hexdigit())
        .collect();
    (!token.is_empty()).then_some(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csrf_extracted_from_json_payload() {
        let body = r#"{"success":true,"csrf_token":"c9280a89ddcd"}"#;
        assert_eq!(extract_csrf(body).as_deref(), Some("c9280a89ddcd"));
    }

    #[test]
    fn missing_csrf_yields_none() {
        assert_eq!(extract_csrf(r#"{"success":true}"#), None);
    }
}
