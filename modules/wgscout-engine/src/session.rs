//! Session lifecycle for the external site.
//!
//! One cached session per credential, reused across runs until the site
//! invalidates it or the idle TTL elapses. Acquisition is single-flight:
//! concurrent runs sharing a credential never race to log in twice.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use wgscout_common::{AuthError, Credential};

use crate::site::{Session, SiteClient, SiteError};

/// Max login attempts per acquisition for retryable failures.
const AUTH_MAX_ATTEMPTS: u32 = 3;
/// Base backoff for retryable login failures. Actual delay is
/// base * 2^attempt + jitter, capped.
const AUTH_RETRY_BASE: Duration = Duration::from_secs(2);
const AUTH_RETRY_CAP: Duration = Duration::from_secs(30);

/// Error from a session-scoped operation: either we could not get a
/// session at all, or the operation itself failed at the site.
#[derive(Debug, Error)]
pub enum SessionCallError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Site(#[from] SiteError),
}

struct Slot {
    session: Option<Session>,
    last_used: Instant,
    /// Password that the site rejected. While the caller keeps presenting
    /// it, login is not attempted again; the owner must change it first.
    failed_password: Option<String>,
}

pub struct SessionManager {
    site: Arc<dyn SiteClient>,
    idle_ttl: Duration,
    slots: Mutex<HashMap<String, Arc<Mutex<Slot>>>>,
}

impl SessionManager {
    pub fn new(site: Arc<dyn SiteClient>, idle_ttl: Duration) -> Self {
        Self {
            site,
            idle_ttl,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Return the cached session for this credential, or log in. Serialized
    /// per credential via the slot mutex. A credential the site has rejected
    /// stays rejected without further login attempts until its password
    /// changes.
    pub async fn acquire(&self, credential: &Credential) -> Result<Session, AuthError> {
        let slot = self.slot_for(credential).await;
        let mut slot = slot.lock().await;

        if slot.failed_password.as_deref() == Some(credential.password.as_str()) {
            return Err(AuthError::InvalidCredentials {
                email: credential.email.clone(),
            });
        }

        if let Some(session) = slot.session.clone() {
            if slot.last_used.elapsed() < self.idle_ttl {
                slot.last_used = Instant::now();
                return Ok(session);
            }
            info!(email = credential.email.as_str(), "cached session past idle TTL");
        }

        match self.login_with_backoff(credential).await {
            Ok(session) => {
                slot.failed_password = None;
                slot.session = Some(session.clone());
                slot.last_used = Instant::now();
                Ok(session)
            }
            Err(e) => {
                if matches!(e, AuthError::InvalidCredentials { .. }) {
                    slot.failed_password = Some(credential.password.clone());
                    slot.session = None;
                }
                Err(e)
            }
        }
    }

    /// Run `op` with an acquired session, transparently re-authenticating
    /// once if the site reports session-expired, then propagating failure
    /// if the retry also fails.
    pub async fn with_session<T, F, Fut>(
        &self,
        credential: &Credential,
        op: F,
    ) -> Result<T, SessionCallError>
    where
        F: Fn(Session) -> Fut,
        Fut: Future<Output = Result<T, SiteError>>,
    {
        let session = self.acquire(credential).await?;
        match op(session).await {
            Err(SiteError::SessionExpired) => {
                warn!(
                    email = credential.email.as_str(),
                    "session expired mid-call, re-authenticating once"
                );
                self.invalidate(credential).await;
                let session = self.acquire(credential).await?;
                Ok(op(session).await?)
            }
            other => Ok(other?),
        }
    }

    /// Drop the cached session so the next acquire logs in fresh.
    pub async fn invalidate(&self, credential: &Credential) {
        let slot = self.slot_for(credential).await;
        slot.lock().await.session = None;
    }

    async fn slot_for(&self, credential: &Credential) -> Arc<Mutex<Slot>> {
        let mut slots = self.slots.lock().await;
        slots
            .entry(credential.cache_key().to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(Slot {
                    session: None,
                    last_used: Instant::now(),
                    failed_password: None,
                }))
            })
            .clone()
    }

    async fn login_with_backoff(&self, credential: &Credential) -> Result<Session, AuthError> {
        let mut last_err = AuthError::Unreachable("no attempt made".to_string());

        for attempt in 0..AUTH_MAX_ATTEMPTS {
            match self.site.login(credential).await {
                Ok(session) => return Ok(session),
                // Fatal for this credential until the owner updates it.
                Err(SiteError::InvalidCredentials) => {
                    return Err(AuthError::InvalidCredentials {
                        email: credential.email.clone(),
                    });
                }
                Err(SiteError::RateLimited) => {
                    warn!(attempt, "login rate limited, backing off");
                    last_err = AuthError::RateLimited;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "login failed, backing off");
                    last_err = AuthError::Unreachable(e.to_string());
                }
            }

            if attempt + 1 < AUTH_MAX_ATTEMPTS {
                tokio::time::sleep(retry_delay(attempt)).await;
            }
        }

        Err(last_err)
    }
}

fn retry_delay(attempt: u32) -> Duration {
    let base = AUTH_RETRY_BASE * 2u32.saturating_pow(attempt);
    let jitter = Duration::from_millis(rand::rng().random_range(0..500));
    (base + jitter).min(AUTH_RETRY_CAP)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    struct StubSite {
        logins: AtomicU32,
        fail_first_fetches: AtomicU32,
    }

    impl StubSite {
        fn new() -> Self {
            Self {
                logins: AtomicU32::new(0),
                fail_first_fetches: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl SiteClient for StubSite {
        async fn login(&self, _credential: &Credential) -> Result<Session, SiteError> {
            self.logins.fetch_add(1, Ordering::SeqCst);
            Ok(Session {
                id: Uuid::new_v4(),
                csrf_token: "tok".to_string(),
            })
        }

        async fn fetch_page(&self, _session: &Session, _url: &str) -> Result<String, SiteError> {
            if self.fail_first_fetches.load(Ordering::SeqCst) > 0 {
                self.fail_first_fetches.fetch_sub(1, Ordering::SeqCst);
                return Err(SiteError::SessionExpired);
            }
            Ok("<html>ok</html>".to_string())
        }

        async fn send_message(
            &self,
            _session: &Session,
            _listing_ref: &str,
            _body: &str,
        ) -> Result<(), SiteError> {
            Ok(())
        }
    }

    fn credential() -> Credential {
        Credential {
            email: "me@example.org".to_string(),
            password: "pw".to_string(),
            llm_api_key: None,
        }
    }

    struct RejectingSite {
        logins: AtomicU32,
    }

    #[async_trait]
    impl SiteClient for RejectingSite {
        async fn login(&self, _credential: &Credential) -> Result<Session, SiteError> {
            self.logins.fetch_add(1, Ordering::SeqCst);
            Err(SiteError::InvalidCredentials)
        }

        async fn fetch_page(&self, _session: &Session, _url: &str) -> Result<String, SiteError> {
            Err(SiteError::SessionExpired)
        }

        async fn send_message(
            &self,
            _session: &Session,
            _listing_ref: &str,
            _body: &str,
        ) -> Result<(), SiteError> {
            Err(SiteError::SessionExpired)
        }
    }

    #[tokio::test]
    async fn session_is_cached_across_acquires() {
        let site = Arc::new(StubSite::new());
        let mgr = SessionManager::new(site.clone(), Duration::from_secs(60));

        let a = mgr.acquire(&credential()).await.unwrap();
        let b = mgr.acquire(&credential()).await.unwrap();

        assert_eq!(a, b);
        assert_eq!(site.logins.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_acquires_login_once() {
        let site = Arc::new(StubSite::new());
        let mgr = Arc::new(SessionManager::new(site.clone(), Duration::from_secs(60)));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let mgr = mgr.clone();
                tokio::spawn(async move { mgr.acquire(&credential()).await })
            })
            .collect();
        for t in tasks {
            t.await.unwrap().unwrap();
        }

        assert_eq!(site.logins.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn with_session_reauthenticates_once_on_expiry() {
        let site = Arc::new(StubSite::new());
        site.fail_first_fetches.store(1, Ordering::SeqCst);
        let mgr = SessionManager::new(site.clone(), Duration::from_secs(60));

        let html = mgr
            .with_session(&credential(), |session| {
                let site = site.clone();
                async move { site.fetch_page(&session, "/page").await }
            })
            .await
            .unwrap();

        assert_eq!(html, "<html>ok</html>");
        assert_eq!(site.logins.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn expired_retry_failure_propagates() {
        let site = Arc::new(StubSite::new());
        site.fail_first_fetches.store(2, Ordering::SeqCst);
        let mgr = SessionManager::new(site.clone(), Duration::from_secs(60));

        let result = mgr
            .with_session(&credential(), |session| {
                let site = site.clone();
                async move { site.fetch_page(&session, "/page").await }
            })
            .await;

        assert!(matches!(
            result,
            Err(SessionCallError::Site(SiteError::SessionExpired))
        ));
    }

    #[tokio::test]
    async fn rejected_credential_is_not_retried() {
        let site = Arc::new(RejectingSite {
            logins: AtomicU32::new(0),
        });
        let mgr = SessionManager::new(site.clone(), Duration::from_secs(60));

        for _ in 0..3 {
            let err = mgr.acquire(&credential()).await.unwrap_err();
            assert!(matches!(err, AuthError::InvalidCredentials { .. }));
        }

        assert_eq!(site.logins.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn changed_password_clears_the_rejection() {
        let site = Arc::new(RejectingSite {
            logins: AtomicU32::new(0),
        });
        let mgr = SessionManager::new(site.clone(), Duration::from_secs(60));

        mgr.acquire(&credential()).await.unwrap_err();
        mgr.acquire(&credential()).await.unwrap_err();
        assert_eq!(site.logins.load(Ordering::SeqCst), 1);

        let mut updated = credential();
        updated.password = "rotated".to_string();
        mgr.acquire(&updated).await.unwrap_err();

        assert_eq!(site.logins.load(Ordering::SeqCst), 2);
    }
}
