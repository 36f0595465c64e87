//! Deterministic browser double for crawl tests.
//!
//! A `ScriptedSite` maps exact URLs to canned fixtures (status, network
//! responses, links). The factory implements the crawler's session seam, so
//! engine and processor tests run the real loop against replayed traffic —
//! no live browser involved.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use url::Url;

use webpscan::config::CrawlerConfig;
use webpscan::crawler::{
    BrowserSession, CrawlError, NavigationOutcome, NetworkResponse, PageSession, SessionFactory,
    SettlePolicy,
};
use webpscan::validation::{HostCheck, ValidationError};

/// Canned behavior for one URL.
#[derive(Debug, Clone, Default)]
pub struct PageFixture {
    pub status: u16,
    /// Post-redirect URL; defaults to the requested one.
    pub final_url: Option<String>,
    pub responses: Vec<NetworkResponse>,
    pub links: Vec<String>,
    /// Navigation errors to serve before the fixture succeeds.
    pub fail_times: u32,
}

impl PageFixture {
    pub fn ok() -> Self {
        Self {
            status: 200,
            ..Default::default()
        }
    }

    pub fn with_links(mut self, links: &[&str]) -> Self {
        self.links = links.iter().map(|l| l.to_string()).collect();
        self
    }

    pub fn with_image(mut self, url: &str, mime: &str, bytes: i64) -> Self {
        self.responses.push(NetworkResponse {
            url: url.to_string(),
            mime_type: mime.to_string(),
            status: 200,
            body_size: bytes,
        });
        self
    }

    pub fn with_response(mut self, url: &str, mime: &str, status: u16, bytes: i64) -> Self {
        self.responses.push(NetworkResponse {
            url: url.to_string(),
            mime_type: mime.to_string(),
            status,
            body_size: bytes,
        });
        self
    }
}

/// The scripted site shared by factory, browser, and page handles.
#[derive(Default)]
pub struct ScriptedSite {
    pages: Mutex<HashMap<String, PageFixture>>,
    failures_left: Mutex<HashMap<String, u32>>,
    /// Every URL navigated to, in order.
    pub visits: Mutex<Vec<String>>,
    pub launches: AtomicUsize,
}

impl ScriptedSite {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_page(self: &Arc<Self>, url: &str, fixture: PageFixture) -> Arc<Self> {
        if fixture.fail_times > 0 {
            self.failures_left
                .lock()
                .insert(url.to_string(), fixture.fail_times);
        }
        self.pages.lock().insert(url.to_string(), fixture);
        Arc::clone(self)
    }

    pub fn visit_count(&self) -> usize {
        self.visits.lock().len()
    }
}

pub struct ScriptedFactory(pub Arc<ScriptedSite>);

#[async_trait]
impl SessionFactory for ScriptedFactory {
    async fn launch(&self) -> Result<Box<dyn BrowserSession>, CrawlError> {
        self.0.launches.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedBrowser(Arc::clone(&self.0))))
    }
}

struct ScriptedBrowser(Arc<ScriptedSite>);

#[async_trait]
impl BrowserSession for ScriptedBrowser {
    async fn new_page(&self) -> Result<Box<dyn PageSession>, CrawlError> {
        Ok(Box::new(ScriptedPage {
            site: Arc::clone(&self.0),
            current: None,
        }))
    }

    async fn close(&mut self) {}
}

struct ScriptedPage {
    site: Arc<ScriptedSite>,
    current: Option<PageFixture>,
}

#[async_trait]
impl PageSession for ScriptedPage {
    async fn navigate(&mut self, url: &str) -> Result<NavigationOutcome, CrawlError> {
        self.site.visits.lock().push(url.to_string());

        {
            let mut failures = self.site.failures_left.lock();
            if let Some(left) = failures.get_mut(url) {
                if *left > 0 {
                    *left -= 1;
                    return Err(CrawlError::NavigationError("scripted failure".into()));
                }
            }
        }

        let fixture = self
            .site
            .pages
            .lock()
            .get(url)
            .cloned()
            .ok_or_else(|| CrawlError::NavigationError(format!("no fixture for {url}")))?;

        let outcome = NavigationOutcome {
            final_url: fixture.final_url.clone().unwrap_or_else(|| url.to_string()),
            status: Some(fixture.status),
        };
        self.current = Some(fixture);
        Ok(outcome)
    }

    async fn settle(&mut self, _policy: &SettlePolicy) -> Result<(), CrawlError> {
        Ok(())
    }

    async fn drain_responses(&mut self) -> Vec<NetworkResponse> {
        self.current
            .as_ref()
            .map(|f| f.responses.clone())
            .unwrap_or_default()
    }

    async fn extract_links(&mut self) -> Result<Vec<String>, CrawlError> {
        Ok(self
            .current
            .as_ref()
            .map(|f| f.links.clone())
            .unwrap_or_default())
    }

    async fn close(&mut self) {}
}

/// Host check that admits everything; scripted hosts do not resolve.
pub struct AllowAllHosts;

#[async_trait]
impl HostCheck for AllowAllHosts {
    async fn check_url(&self, _url: &Url) -> Result<(), ValidationError> {
        Ok(())
    }
}

/// Host check replaying a fixed verdict sequence, then a default. Models a
/// DNS answer that changes between admissions (rebinding).
pub struct SequenceHostCheck {
    verdicts: Mutex<VecDeque<bool>>,
    default_allow: bool,
}

impl SequenceHostCheck {
    pub fn new(verdicts: &[bool], default_allow: bool) -> Self {
        Self {
            verdicts: Mutex::new(verdicts.iter().copied().collect()),
            default_allow,
        }
    }
}

#[async_trait]
impl HostCheck for SequenceHostCheck {
    async fn check_url(&self, _url: &Url) -> Result<(), ValidationError> {
        let allow = self
            .verdicts
            .lock()
            .pop_front()
            .unwrap_or(self.default_allow);
        if allow {
            Ok(())
        } else {
            Err(ValidationError::UrlBlockedHost)
        }
    }
}

/// Crawler settings tuned for fast deterministic tests.
pub fn test_crawler_config() -> CrawlerConfig {
    CrawlerConfig {
        max_pages_per_scan: 50,
        delay_between_pages_ms: 0,
        retry_base_delay_ms: 1,
        max_retries: 2,
        respect_robots_txt: false,
        checkpoint_interval_pages: 10,
        ..Default::default()
    }
}
