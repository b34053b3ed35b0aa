//! Outreach dispatch.
//!
//! Policy decides whether a composed message actually leaves the engine.
//! Sends within one run are serialized with a per-search delay to emulate
//! human pacing; runs for other searches do not wait on this one.
//! `send` on an already-contacted listing is a no-op skip, so a retried
//! run can never double-send.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use wgscout_common::{
    Credential, DispatchError, DispatchPolicy, EngineError, Listing, OutreachMessage,
};
use wgscout_store::ListingStore;

use crate::cancel::CancelFlag;
use crate::session::{SessionCallError, SessionManager};
use crate::site::{SiteClient, SiteError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Policy is manual review; the site was never contacted.
    ManualPolicy,
    /// Our own history says this listing was already contacted.
    AlreadyContacted,
    /// The site's conversation thread already holds a sent message.
    AlreadyMessagedOnSite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Sent,
    Skipped(SkipReason),
}

#[derive(Debug, Default)]
pub struct DispatchSummary {
    pub sent: u32,
    pub skipped: u32,
    pub cancelled: bool,
}

pub struct OutreachDispatcher {
    sessions: Arc<SessionManager>,
    site: Arc<dyn SiteClient>,
    store: Arc<dyn ListingStore>,
}

impl OutreachDispatcher {
    pub fn new(
        sessions: Arc<SessionManager>,
        site: Arc<dyn SiteClient>,
        store: Arc<dyn ListingStore>,
    ) -> Self {
        Self {
            sessions,
            site,
            store,
        }
    }

    /// Dispatch one composed message under the given policy.
    pub async fn send(
        &self,
        credential: &Credential,
        listing: &Listing,
        message: &OutreachMessage,
        policy: DispatchPolicy,
    ) -> Result<DispatchOutcome, EngineError> {
        // Idempotence guard: contacted listings are never re-dispatched.
        if self.store.is_contacted(&listing.listing_id).await? {
            return Ok(DispatchOutcome::Skipped(SkipReason::AlreadyContacted));
        }

        if policy == DispatchPolicy::Manual {
            info!(
                listing_id = listing.listing_id.as_str(),
                "manual policy, queued for review"
            );
            return Ok(DispatchOutcome::Skipped(SkipReason::ManualPolicy));
        }

        let result = self
            .sessions
            .with_session(credential, |session| {
                let site = Arc::clone(&self.site);
                async move {
                    site.send_message(&session, &listing.listing_id, &message.body)
                        .await
                }
            })
            .await;

        match result {
            Ok(()) => {
                // Single-writer transition at the persistence boundary; a
                // false here means another writer beat us to it.
                if !self.store.mark_contacted(&listing.listing_id).await? {
                    warn!(
                        listing_id = listing.listing_id.as_str(),
                        "contacted flag was already set after send"
                    );
                }
                info!(listing_id = listing.listing_id.as_str(), "message sent");
                Ok(DispatchOutcome::Sent)
            }
            Err(SessionCallError::Site(SiteError::AlreadyMessaged)) => {
                // Reconcile our history with the site's.
                self.store.mark_contacted(&listing.listing_id).await?;
                Ok(DispatchOutcome::Skipped(SkipReason::AlreadyMessagedOnSite))
            }
            Err(SessionCallError::Site(SiteError::Rejected(cause))) => Err(EngineError::Dispatch(
                DispatchError::SendRejected(cause),
            )),
            Err(SessionCallError::Site(SiteError::RateLimited)) => Err(EngineError::Dispatch(
                DispatchError::Unreachable("rate limited".to_string()),
            )),
            Err(SessionCallError::Site(e)) => Err(EngineError::Dispatch(
                DispatchError::Unreachable(e.to_string()),
            )),
            Err(SessionCallError::Auth(e)) => Err(EngineError::Auth(e)),
        }
    }

    /// Dispatch a run's composed messages in order. Cancellation is
    /// checked between sends; a per-listing rejection is counted and the
    /// batch continues, while transport/auth failures abort it.
    pub async fn send_batch(
        &self,
        credential: &Credential,
        items: &[(Listing, OutreachMessage)],
        policy: DispatchPolicy,
        message_delay: Duration,
        cancel: &CancelFlag,
    ) -> Result<DispatchSummary, EngineError> {
        let mut summary = DispatchSummary::default();

        for (listing, message) in items {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }

            // Pace only actual site contact, after the first send.
            if policy == DispatchPolicy::AutoSend && summary.sent > 0 {
                tokio::time::sleep(message_delay).await;
            }

            match self.send(credential, listing, message, policy).await {
                Ok(DispatchOutcome::Sent) => summary.sent += 1,
                Ok(DispatchOutcome::Skipped(_)) => summary.skipped += 1,
                Err(EngineError::Dispatch(DispatchError::SendRejected(cause))) => {
                    warn!(
                        listing_id = listing.listing_id.as_str(),
                        cause = cause.as_str(),
                        "send rejected, skipping listing"
                    );
                    summary.skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use uuid::Uuid;

    use crate::site::Session;
    use wgscout_common::RawListing;
    use wgscout_store::MemoryStore;

    struct RecordingSite {
        sends: AtomicU32,
        sent_refs: Mutex<Vec<String>>,
        fail_with: Mutex<Option<SiteError>>,
    }

    impl RecordingSite {
        fn new() -> Self {
            Self {
                sends: AtomicU32::new(0),
                sent_refs: Mutex::new(vec![]),
                fail_with: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl SiteClient for RecordingSite {
        async fn login(&self, _c: &Credential) -> Result<Session, SiteError> {
            Ok(Session {
                id: Uuid::new_v4(),
                csrf_token: "t".into(),
            })
        }

        async fn fetch_page(&self, _s: &Session, _u: &str) -> Result<String, SiteError> {
            Ok(String::new())
        }

        async fn send_message(
            &self,
            _s: &Session,
            listing_ref: &str,
            _body: &str,
        ) -> Result<(), SiteError> {
            if let Some(err) = self.fail_with.lock().unwrap().take() {
                return Err(err);
            }
            self.sends.fetch_add(1, Ordering::SeqCst);
            self.sent_refs.lock().unwrap().push(listing_ref.to_string());
            Ok(())
        }
    }

    fn listing(listing_ref: &str) -> Listing {
        let raw = RawListing {
            listing_ref: listing_ref.into(),
            contact_name: "Anna".into(),
            address: "Mitte, Berlin".into(),
            wg_type: "2er WG".into(),
            district: None,
            price_eur: Some(500),
            size_sqm: Some(18),
            rental_start: None,
            rental_end: None,
            online_since: None,
            detail_text: None,
        };
        Listing::from_raw(&raw, Uuid::new_v4(), "https://example.org")
    }

    fn message() -> OutreachMessage {
        OutreachMessage {
            language: "english".into(),
            keyword: None,
            body: "Hi Anna".into(),
        }
    }

    fn credential() -> Credential {
        Credential {
            email: "me@example.org".into(),
            password: "pw".into(),
            llm_api_key: None,
        }
    }

    fn dispatcher(site: Arc<RecordingSite>, store: Arc<MemoryStore>) -> OutreachDispatcher {
        let sessions = Arc::new(SessionManager::new(
            site.clone(),
            Duration::from_secs(60),
        ));
        OutreachDispatcher::new(sessions, site, store)
    }

    #[tokio::test]
    async fn auto_send_marks_contacted() {
        let site = Arc::new(RecordingSite::new());
        let store = Arc::new(MemoryStore::new());
        let l = listing("/a.html");
        store.seed_listing(l.clone());
        let d = dispatcher(site.clone(), store.clone());

        let outcome = d
            .send(&credential(), &l, &message(), DispatchPolicy::AutoSend)
            .await
            .unwrap();

        assert_eq!(outcome, DispatchOutcome::Sent);
        assert_eq!(site.sends.load(Ordering::SeqCst), 1);
        assert!(store.listing("/a.html").unwrap().contacted);
    }

    #[tokio::test]
    async fn manual_policy_never_contacts_site() {
        let site = Arc::new(RecordingSite::new());
        let store = Arc::new(MemoryStore::new());
        let l = listing("/a.html");
        store.seed_listing(l.clone());
        let d = dispatcher(site.clone(), store.clone());

        let outcome = d
            .send(&credential(), &l, &message(), DispatchPolicy::Manual)
            .await
            .unwrap();

        assert_eq!(outcome, DispatchOutcome::Skipped(SkipReason::ManualPolicy));
        assert_eq!(site.sends.load(Ordering::SeqCst), 0);
        assert!(!store.listing("/a.html").unwrap().contacted);
    }

    #[tokio::test]
    async fn contacted_listing_is_skipped_every_time() {
        let site = Arc::new(RecordingSite::new());
        let store = Arc::new(MemoryStore::new());
        let mut l = listing("/a.html");
        l.contacted = true;
        store.seed_listing(l.clone());
        let d = dispatcher(site.clone(), store.clone());

        for _ in 0..3 {
            let outcome = d
                .send(&credential(), &l, &message(), DispatchPolicy::AutoSend)
                .await
                .unwrap();
            assert_eq!(
                outcome,
                DispatchOutcome::Skipped(SkipReason::AlreadyContacted)
            );
        }
        assert_eq!(site.sends.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn site_side_already_messaged_reconciles_history() {
        let site = Arc::new(RecordingSite::new());
        *site.fail_with.lock().unwrap() = Some(SiteError::AlreadyMessaged);
        let store = Arc::new(MemoryStore::new());
        let l = listing("/a.html");
        store.seed_listing(l.clone());
        let d = dispatcher(site.clone(), store.clone());

        let outcome = d
            .send(&credential(), &l, &message(), DispatchPolicy::AutoSend)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            DispatchOutcome::Skipped(SkipReason::AlreadyMessagedOnSite)
        );
        assert!(store.listing("/a.html").unwrap().contacted);
    }

    #[tokio::test]
    async fn batch_continues_past_a_rejected_listing() {
        let site = Arc::new(RecordingSite::new());
        *site.fail_with.lock().unwrap() = Some(SiteError::Rejected("form gone".into()));
        let store = Arc::new(MemoryStore::new());
        let a = listing("/a.html");
        let b = listing("/b.html");
        store.seed_listing(a.clone());
        store.seed_listing(b.clone());
        let d = dispatcher(site.clone(), store.clone());

        let summary = d
            .send_batch(
                &credential(),
                &[(a, message()), (b, message())],
                DispatchPolicy::AutoSend,
                Duration::from_millis(0),
                &CancelFlag::new(),
            )
            .await
            .unwrap();

        assert_eq!(summary.sent, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(site.sent_refs.lock().unwrap().as_slice(), &["/b.html".to_string()]);
    }

    #[tokio::test]
    async fn cancellation_stops_batch_without_rollback() {
        let site = Arc::new(RecordingSite::new());
        let store = Arc::new(MemoryStore::new());
        let a = listing("/a.html");
        store.seed_listing(a.clone());
        let d = dispatcher(site.clone(), store.clone());

        let cancel = CancelFlag::new();
        cancel.cancel();

        let summary = d
            .send_batch(
                &credential(),
                &[(a, message())],
                DispatchPolicy::AutoSend,
                Duration::from_millis(0),
                &cancel,
            )
            .await
            .unwrap();

        assert!(summary.cancelled);
        assert_eq!(summary.sent, 0);
        assert_eq!(site.sends.load(Ordering::SeqCst), 0);
    }
}
