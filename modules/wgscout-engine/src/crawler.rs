//! Result-page crawler.
//!
//! Translates a search's filter set into the site's query form and walks
//! the paginated results. The inter-request delay lives here, not in the
//! caller. Item-level parse failures are skipped and counted; a
//! page-level fetch failure aborts the remaining pages for this run only.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use wgscout_common::{
    CrawlError, Credential, EngineError, GenderPreference, RawListing, SearchConfig,
    SearchFilters, SmokingPreference,
};

use crate::cancel::CancelFlag;
use crate::parse;
use crate::session::{SessionCallError, SessionManager};
use crate::site::SiteClient;

/// Upper bound on pages per run. The site rarely serves more.
const DEFAULT_MAX_PAGES: u32 = 20;

#[derive(Debug, Clone)]
pub struct CrawlerConfig {
    /// Minimum delay between page requests.
    pub crawl_delay: Duration,
    pub max_pages: u32,
}

impl CrawlerConfig {
    pub fn new(crawl_delay: Duration) -> Self {
        Self {
            crawl_delay,
            max_pages: DEFAULT_MAX_PAGES,
        }
    }
}

/// Everything one crawl produced. `cancelled` means the page walk was cut
/// short cooperatively; what was already parsed is still usable.
#[derive(Debug, Default)]
pub struct CrawlOutcome {
    pub raw: Vec<RawListing>,
    pub pages_fetched: u32,
    pub parse_failures: u32,
    pub promoted_skipped: u32,
    pub cancelled: bool,
}

pub struct ListingCrawler {
    sessions: Arc<SessionManager>,
    site: Arc<dyn SiteClient>,
    config: CrawlerConfig,
}

impl ListingCrawler {
    pub fn new(
        sessions: Arc<SessionManager>,
        site: Arc<dyn SiteClient>,
        config: CrawlerConfig,
    ) -> Self {
        Self {
            sessions,
            site,
            config,
        }
    }

    /// Enumerate all result pages for this search. Restartable from
    /// scratch, not resumable mid-page. Authentication failures keep their
    /// type so the caller can attribute them to the auth stage.
    pub async fn fetch(
        &self,
        credential: &Credential,
        search: &SearchConfig,
        cancel: &CancelFlag,
    ) -> Result<CrawlOutcome, EngineError> {
        let mut outcome = CrawlOutcome::default();

        for page in 0..self.config.max_pages {
            if cancel.is_cancelled() {
                warn!(search = search.name.as_str(), page, "crawl cancelled");
                outcome.cancelled = true;
                break;
            }
            if page > 0 {
                tokio::time::sleep(self.config.crawl_delay).await;
            }

            let url = build_search_url(&search.filters, page);
            let html = self
                .sessions
                .with_session(credential, |session| {
                    let site = Arc::clone(&self.site);
                    let url = &url;
                    async move { site.fetch_page(&session, url).await }
                })
                .await
                .map_err(|e| match e {
                    SessionCallError::Auth(auth) => EngineError::Auth(auth),
                    SessionCallError::Site(site) => EngineError::Crawl(CrawlError::PageFetchFailed {
                        page,
                        cause: site.to_string(),
                    }),
                })?;

            let parsed = parse::parse_result_page(&html)?;
            let empty =
                parsed.listings.is_empty() && parsed.parse_failures == 0 && parsed.promoted_skipped == 0;

            outcome.pages_fetched += 1;
            outcome.parse_failures += parsed.parse_failures;
            outcome.promoted_skipped += parsed.promoted_skipped;
            outcome.raw.extend(parsed.listings);

            if empty {
                // Pagination exhausted.
                break;
            }
        }

        info!(
            search = search.name.as_str(),
            pages = outcome.pages_fetched,
            listings = outcome.raw.len(),
            parse_failures = outcome.parse_failures,
            "crawl finished"
        );

        Ok(outcome)
    }

    /// Fetch one listing's detail page and extract its free text.
    /// Failures here are recoverable; the caller composes without detail.
    pub async fn fetch_detail(
        &self,
        credential: &Credential,
        listing_ref: &str,
    ) -> Result<Option<String>, CrawlError> {
        tokio::time::sleep(self.config.crawl_delay).await;

        let html = self
            .sessions
            .with_session(credential, |session| {
                let site = Arc::clone(&self.site);
                async move { site.fetch_page(&session, listing_ref).await }
            })
            .await
            .map_err(|e| CrawlError::PageFetchFailed {
                page: 0,
                cause: e.to_string(),
            })?;

        parse::parse_detail_text(&html)
    }
}

/// Translate a filter set into the site's query string for one page.
/// Path shape and parameter names follow the site's own search form.
pub fn build_search_url(filters: &SearchFilters, page: u32) -> String {
    let mut url = format!(
        "/wg-zimmer-in-{}.{}.0.1.{}.html?offer_filter=1&city_id={}&sort_column=0&sort_order=0&noDeact=1",
        filters.location.replace(' ', "-"),
        filters.city_id,
        page,
        filters.city_id,
    );

    for category in &filters.property_types {
        url.push_str(&format!("&categories%5B%5D={category}"));
    }
    for rent_type in &filters.rent_types {
        url.push_str(&format!("&rent_types%5B%5D={rent_type}"));
    }
    for wg_type in &filters.wg_types {
        url.push_str(&format!("&wgArt%5B%5D={wg_type}"));
    }
    for district in &filters.districts {
        url.push_str(&format!("&ot%5B%5D={district}"));
    }
    if let Some(min_size) = filters.min_size {
        url.push_str(&format!("&sMin={min_size}"));
    }
    if let Some(max_price) = filters.max_price {
        url.push_str(&format!("&rMax={max_price}"));
    }
    match filters.gender {
        GenderPreference::Any => {}
        GenderPreference::Male => url.push_str("&wgSea=1"),
        GenderPreference::Female => url.push_str("&wgSea=2"),
    }
    match filters.smoking {
        SmokingPreference::Any => {}
        SmokingPreference::Smoking => url.push_str("&wgSmo=1"),
        SmokingPreference::NonSmoking => url.push_str("&wgSmo=2"),
    }
    if let Some(min_age) = filters.min_age {
        url.push_str(&format!("&wgMnA={min_age}"));
    }
    if let Some(max_age) = filters.max_age {
        url.push_str(&format!("&wgMxA={max_age}"));
    }
    if filters.images_only {
        url.push_str("&img_only=1");
    }
    if filters.exclude_contacted {
        url.push_str("&exc=2");
    }

    url
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use uuid::Uuid;

    use crate::site::{Session, SiteError};
    use chrono::Utc;
    use wgscout_common::{DispatchPolicy, SearchStats};

    fn filters() -> SearchFilters {
        SearchFilters {
            location: "Berlin".into(),
            city_id: 8,
            max_price: Some(800),
            min_size: Some(15),
            date_range_start: None,
            date_range_end: None,
            property_types: vec!["0".into()],
            rent_types: vec!["2".into()],
            wg_types: vec![],
            districts: vec!["2114".into()],
            gender: GenderPreference::Any,
            smoking: SmokingPreference::NonSmoking,
            min_age: None,
            max_age: None,
            images_only: true,
            exclude_contacted: true,
        }
    }

    fn search(filters: SearchFilters) -> SearchConfig {
        SearchConfig {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            name: "test".into(),
            active: true,
            filters,
            policy: DispatchPolicy::Manual,
            message_delay_secs: 0,
            stats: SearchStats::default(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn query_translation_covers_filters() {
        let url = build_search_url(&filters(), 0);
        assert!(url.starts_with("/wg-zimmer-in-Berlin.8.0.1.0.html?"));
        assert!(url.contains("sMin=15"));
        assert!(url.contains("rMax=800"));
        assert!(url.contains("ot%5B%5D=2114"));
        assert!(url.contains("rent_types%5B%5D=2"));
        assert!(url.contains("wgSmo=2"));
        assert!(url.contains("img_only=1"));
        assert!(url.contains("exc=2"));
        assert!(!url.contains("wgSea"));
    }

    #[test]
    fn page_number_advances_in_path() {
        let url = build_search_url(&filters(), 3);
        assert!(url.starts_with("/wg-zimmer-in-Berlin.8.0.1.3.html?"));
    }

    struct PagedSite {
        pages: Mutex<HashMap<String, String>>,
    }

    #[async_trait]
    impl SiteClient for PagedSite {
        async fn login(&self, _c: &Credential) -> Result<Session, SiteError> {
            Ok(Session {
                id: Uuid::new_v4(),
                csrf_token: "t".into(),
            })
        }

        async fn fetch_page(&self, _s: &Session, url: &str) -> Result<String, SiteError> {
            self.pages
                .lock()
                .unwrap()
                .get(url)
                .cloned()
                .ok_or_else(|| SiteError::Transport(format!("no fixture for {url}")))
        }

        async fn send_message(
            &self,
            _s: &Session,
            _r: &str,
            _b: &str,
        ) -> Result<(), SiteError> {
            Ok(())
        }
    }

    fn page_with_one_row(id: u32) -> String {
        format!(
            r#"<html><body><div id="main_column">
               <div id="liste-details-ad-{id}">
                 <a href="/ad-{id}.html">ad</a>
                 <span class="ml5">Anna</span>
                 <div class="col-xs-11"><span>2er WG | Berlin | Mitte</span></div>
                 <div class="col-xs-5 text-center">01.06.2025</div>
               </div>
             </div></body></html>"#
        )
    }

    const EMPTY_PAGE: &str = r#"<html><body><div id="main_column"></div></body></html>"#;

    fn credential() -> Credential {
        Credential {
            email: "me@example.org".into(),
            password: "pw".into(),
            llm_api_key: None,
        }
    }

    #[tokio::test]
    async fn walks_pages_until_empty() {
        let config = search(filters());
        let mut pages = HashMap::new();
        pages.insert(build_search_url(&config.filters, 0), page_with_one_row(1));
        pages.insert(build_search_url(&config.filters, 1), page_with_one_row(2));
        pages.insert(build_search_url(&config.filters, 2), EMPTY_PAGE.to_string());

        let site = Arc::new(PagedSite {
            pages: Mutex::new(pages),
        });
        let sessions = Arc::new(SessionManager::new(site.clone(), Duration::from_secs(60)));
        let crawler = ListingCrawler::new(
            sessions,
            site,
            CrawlerConfig {
                crawl_delay: Duration::from_millis(0),
                max_pages: 10,
            },
        );

        let outcome = crawler
            .fetch(&credential(), &config, &CancelFlag::new())
            .await
            .unwrap();

        assert_eq!(outcome.raw.len(), 2);
        assert_eq!(outcome.pages_fetched, 3);
        assert!(!outcome.cancelled);
    }

    #[tokio::test]
    async fn page_fetch_failure_aborts_run() {
        let config = search(filters());
        let mut pages = HashMap::new();
        // Page 0 exists, page 1 is missing -> transport error.
        pages.insert(build_search_url(&config.filters, 0), page_with_one_row(1));

        let site = Arc::new(PagedSite {
            pages: Mutex::new(pages),
        });
        let sessions = Arc::new(SessionManager::new(site.clone(), Duration::from_secs(60)));
        let crawler = ListingCrawler::new(
            sessions,
            site,
            CrawlerConfig {
                crawl_delay: Duration::from_millis(0),
                max_pages: 10,
            },
        );

        let err = crawler
            .fetch(&credential(), &config, &CancelFlag::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Crawl(CrawlError::PageFetchFailed { page: 1, .. })
        ));
    }

    struct LockedOutSite;

    #[async_trait]
    impl SiteClient for LockedOutSite {
        async fn login(&self, _c: &Credential) -> Result<Session, SiteError> {
            Err(SiteError::InvalidCredentials)
        }

        async fn fetch_page(&self, _s: &Session, _url: &str) -> Result<String, SiteError> {
            Ok(EMPTY_PAGE.to_string())
        }

        async fn send_message(
            &self,
            _s: &Session,
            _r: &str,
            _b: &str,
        ) -> Result<(), SiteError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn login_failure_keeps_its_auth_type() {
        let config = search(filters());
        let site = Arc::new(LockedOutSite);
        let sessions = Arc::new(SessionManager::new(site.clone(), Duration::from_secs(60)));
        let crawler = ListingCrawler::new(
            sessions,
            site,
            CrawlerConfig {
                crawl_delay: Duration::from_millis(0),
                max_pages: 10,
            },
        );

        let err = crawler
            .fetch(&credential(), &config, &CancelFlag::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Auth(wgscout_common::AuthError::InvalidCredentials { .. })
        ));
    }

    #[tokio::test]
    async fn cancellation_is_observed_between_pages() {
        let config = search(filters());
        let cancel = CancelFlag::new();
        cancel.cancel();

        let site = Arc::new(PagedSite {
            pages: Mutex::new(HashMap::new()),
        });
        let sessions = Arc::new(SessionManager::new(site.clone(), Duration::from_secs(60)));
        let crawler = ListingCrawler::new(
            sessions,
            site,
            CrawlerConfig {
                crawl_delay: Duration::from_millis(0),
                max_pages: 10,
            },
        );

        let outcome = crawler.fetch(&credential(), &config, &cancel).await.unwrap();
        assert!(outcome.cancelled);
        assert_eq!(outcome.pages_fetched, 0);
    }
}
