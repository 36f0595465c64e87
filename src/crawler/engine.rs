//! The crawl loop: breadth-first over same-origin pages through a
//! [`BrowserSession`], with connect-time SSRF re-checks, response policy
//! enforcement, retries, checkpoints, and observer emission.
//!
//! Page-level failures never abort the scan. The run fails only when the
//! seed itself cannot be reached, the browser cannot be launched, the
//! worker's cancellation token fires, or storage goes away.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::CrawlerConfig;
use crate::savings::{is_non_webp_raster, normalize_mime};
use crate::validation::HostCheck;

use super::checkpoint::{CheckpointSink, build_checkpoint};
use super::links::{in_allowlist, is_known_tracker, normalized, resolve_link, same_origin};
use super::observer::CrawlObserver;
use super::retry::{backoff_for_attempt, is_login_redirect, is_transient, status_is_auth};
use super::robots::RobotsPolicy;
use super::session::{BrowserSession, PageSession, SessionFactory};
use super::types::{
    CrawlError, CrawlOutcome, CrawlProgress, CrawlRequest, CrawledImage, ImageHit,
    NetworkResponse, SettlePolicy, SkippedPage,
};

/// Everything a page visit produced.
struct PageVisit {
    final_url: String,
    responses: Vec<NetworkResponse>,
    links: Vec<String>,
}

/// One crawl run over one browser instance.
pub struct CrawlEngine<'a> {
    config: &'a CrawlerConfig,
    host_check: &'a dyn HostCheck,
    robots: Option<RobotsPolicy>,
    cancel: CancellationToken,
}

impl<'a> CrawlEngine<'a> {
    #[must_use]
    pub fn new(
        config: &'a CrawlerConfig,
        host_check: &'a dyn HostCheck,
        robots: Option<RobotsPolicy>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            host_check,
            robots,
            cancel,
        }
    }

    /// Run the crawl. The browser is released on every exit path before the
    /// terminal observer callback fires.
    pub async fn run(
        &self,
        factory: &dyn SessionFactory,
        request: CrawlRequest,
        observer: &dyn CrawlObserver,
        checkpoints: &dyn CheckpointSink,
    ) -> Result<CrawlOutcome, CrawlError> {
        let scan_id = request.scan_id;
        let mut browser = match factory.launch().await {
            Ok(browser) => browser,
            Err(err) => {
                let err = match err {
                    launch @ CrawlError::BrowserLaunch(_) => launch,
                    other => CrawlError::BrowserLaunch(other.to_string()),
                };
                observer.crawl_failed(scan_id, &err);
                return Err(err);
            }
        };

        let result = self
            .crawl_with_browser(&mut *browser, &request, observer, checkpoints)
            .await;
        browser.close().await;

        match &result {
            Ok(outcome) => observer.crawl_completed(scan_id, outcome),
            Err(err) => observer.crawl_failed(scan_id, err),
        }
        result
    }

    async fn crawl_with_browser(
        &self,
        browser: &mut dyn BrowserSession,
        request: &CrawlRequest,
        observer: &dyn CrawlObserver,
        checkpoints: &dyn CheckpointSink,
    ) -> Result<CrawlOutcome, CrawlError> {
        let seed = Url::parse(&request.seed_url)
            .map_err(|e| CrawlError::NavigationError(format!("seed url: {e}")))?;
        let seed_key = normalized(&seed);
        let max_pages = self.config.max_pages_per_scan as i64;

        let mut outcome = CrawlOutcome::default();
        let mut visited_order: Vec<String> = Vec::new();
        let mut visited: HashSet<String> = HashSet::new();
        let mut pending: VecDeque<String> = VecDeque::new();
        let mut pending_set: HashSet<String> = HashSet::new();
        let mut image_index: HashMap<String, usize> = HashMap::new();
        let mut frontier_truncated = false;

        match &request.resume_from {
            Some(checkpoint) => {
                for url in &checkpoint.visited_urls {
                    if visited.insert(url.clone()) {
                        visited_order.push(url.clone());
                    }
                }
                for url in &checkpoint.pending_urls {
                    if !visited.contains(url) && pending_set.insert(url.clone()) {
                        pending.push_back(url.clone());
                    }
                }
                // The in-flight page was popped but never finished; it goes
                // back to the head of the line.
                if let Some(current) = &checkpoint.current_url {
                    if !visited.contains(current) && pending_set.insert(current.clone()) {
                        pending.push_front(current.clone());
                    }
                }
                // A torn checkpoint that lost the seed still restarts it.
                if !visited.contains(&seed_key) && pending_set.insert(seed_key.clone()) {
                    pending.push_back(seed_key.clone());
                }
                outcome.pages_scanned = checkpoint.pages_visited;
                outcome.pages_discovered = checkpoint.pages_discovered;
                outcome.non_webp_images_found = checkpoint.non_webp_images_found;

                for image in &request.resume_images {
                    image_index.insert(image.image_url.clone(), outcome.images.len());
                    outcome.images.push(image.clone());
                }
                info!(
                    scan_id = %request.scan_id,
                    visited = visited.len(),
                    pending = pending.len(),
                    "resuming crawl from checkpoint"
                );
            }
            None => {
                pending.push_back(seed_key.clone());
                pending_set.insert(seed_key.clone());
                outcome.pages_discovered = 1;
            }
        }

        while let Some(page_key) = pending.pop_front() {
            pending_set.remove(&page_key);
            if visited.contains(&page_key) {
                continue;
            }
            if self.cancel.is_cancelled() {
                return Err(CrawlError::Cancelled);
            }
            if outcome.pages_scanned >= max_pages {
                outcome.reached_page_limit = true;
                break;
            }

            let Ok(page_url) = Url::parse(&page_key) else {
                visited.insert(page_key.clone());
                visited_order.push(page_key);
                continue;
            };

            observer.page_started(request.scan_id, &page_key);
            let is_seed_start = page_key == seed_key && outcome.pages_scanned == 0;

            // Fresh DNS answers per navigation (rebinding defense).
            if self
                .cancellable(self.host_check.check_url(&page_url))
                .await?
                .is_err()
            {
                if is_seed_start && request.resume_from.is_none() {
                    return Err(CrawlError::BlockedHost);
                }
                warn!(url = %page_key, "page skipped: blocked host");
                outcome.skipped_pages.push(SkippedPage {
                    url: page_key.clone(),
                    reason: CrawlError::BlockedHost.code(),
                });
                visited.insert(page_key.clone());
                visited_order.push(page_key);
                continue;
            }

            if let Some(robots) = &self.robots {
                if !robots.allows(&page_url, &self.config.user_agent) {
                    debug!(url = %page_key, "page skipped: robots disallow");
                    outcome.skipped_pages.push(SkippedPage {
                        url: page_key.clone(),
                        reason: CrawlError::RobotsDisallowed.code(),
                    });
                    visited.insert(page_key.clone());
                    visited_order.push(page_key);
                    continue;
                }
            }

            let visit = match self.visit_with_retries(browser, &page_url).await {
                Ok(visit) => visit,
                Err(CrawlError::Cancelled) => return Err(CrawlError::Cancelled),
                Err(err) if is_seed_start => {
                    // The seed never loading is scan-fatal.
                    return Err(err);
                }
                Err(err) => {
                    debug!(url = %page_key, error = %err, "page skipped");
                    outcome.skipped_pages.push(SkippedPage {
                        url: page_key.clone(),
                        reason: err.code(),
                    });
                    visited.insert(page_key.clone());
                    visited_order.push(page_key);
                    continue;
                }
            };

            visited.insert(page_key.clone());
            visited_order.push(page_key.clone());
            outcome.pages_scanned += 1;

            self.record_responses(
                request.scan_id,
                &seed,
                &page_key,
                visit.responses,
                &mut outcome,
                &mut image_index,
                observer,
            );

            // Link discovery, bounded by the page budget.
            let base = Url::parse(&visit.final_url).unwrap_or(page_url);
            for raw in &visit.links {
                let Some(link) = resolve_link(&base, raw) else {
                    continue;
                };
                let crawlable = same_origin(&link, &seed)
                    || in_allowlist(&link, &self.config.allowed_external_domains);
                if !crawlable {
                    continue;
                }
                let key = normalized(&link);
                if visited.contains(&key) || pending_set.contains(&key) {
                    continue;
                }
                if outcome.pages_discovered >= max_pages {
                    frontier_truncated = true;
                    break;
                }
                pending.push_back(key.clone());
                pending_set.insert(key);
                outcome.pages_discovered += 1;
            }

            observer.page_completed(
                request.scan_id,
                &page_key,
                &CrawlProgress {
                    pages_scanned: outcome.pages_scanned,
                    pages_discovered: outcome.pages_discovered,
                    non_webp_images_found: outcome.non_webp_images_found,
                },
            );

            if outcome.pages_scanned % self.config.checkpoint_interval_pages as i64 == 0 {
                let checkpoint = build_checkpoint(
                    request.scan_id,
                    &visited_order,
                    &pending,
                    outcome.pages_scanned,
                    outcome.pages_discovered,
                    outcome.non_webp_images_found,
                    None,
                );
                checkpoints.save(&checkpoint, &outcome.images).await?;
            }

            if !pending.is_empty() {
                self.inter_page_delay().await?;
            }
        }

        if frontier_truncated {
            outcome.reached_page_limit = true;
        }

        info!(
            scan_id = %request.scan_id,
            pages = outcome.pages_scanned,
            images = outcome.images.len(),
            non_webp = outcome.non_webp_images_found,
            skipped = outcome.skipped_pages.len(),
            limited = outcome.reached_page_limit,
            "crawl finished"
        );
        Ok(outcome)
    }

    /// Apply response policy and fold image responses into the outcome.
    #[allow(clippy::too_many_arguments)]
    fn record_responses(
        &self,
        scan_id: uuid::Uuid,
        seed: &Url,
        page_key: &str,
        responses: Vec<NetworkResponse>,
        outcome: &mut CrawlOutcome,
        image_index: &mut HashMap<String, usize>,
        observer: &dyn CrawlObserver,
    ) {
        let mut page_bytes = 0i64;
        let mut page_responses = 0usize;
        let mut partial = false;

        for response in responses {
            let Ok(response_url) = Url::parse(&response.url) else {
                continue;
            };
            if is_known_tracker(&response_url) {
                continue;
            }
            let on_policy = same_origin(&response_url, seed)
                || in_allowlist(&response_url, &self.config.allowed_external_domains);
            if !on_policy {
                continue;
            }
            if response.body_size > self.config.per_request_size_cap_bytes {
                debug!(url = %response.url, size = response.body_size, "response over per-request cap");
                continue;
            }

            page_responses += 1;
            page_bytes += response.body_size;
            if page_responses > self.config.per_page_request_cap
                || page_bytes > self.config.per_page_size_cap_bytes
            {
                partial = true;
                break;
            }

            let mime = normalize_mime(&response.mime_type);
            if !mime.starts_with("image/") {
                continue;
            }

            match image_index.get(&response.url) {
                Some(&idx) => {
                    let image = &mut outcome.images[idx];
                    if !image.page_urls.iter().any(|p| p == page_key) {
                        image.page_urls.push(page_key.to_string());
                    }
                }
                None => {
                    let is_non_webp = is_non_webp_raster(&mime);
                    if is_non_webp {
                        outcome.non_webp_images_found += 1;
                    }
                    observer.image_found(
                        scan_id,
                        &ImageHit {
                            image_url: response.url.clone(),
                            mime_type: mime.clone(),
                            size: response.body_size,
                            width: None,
                            height: None,
                            page_url: page_key.to_string(),
                            is_non_webp,
                        },
                        outcome.non_webp_images_found,
                    );
                    image_index.insert(response.url.clone(), outcome.images.len());
                    outcome.images.push(CrawledImage {
                        image_url: response.url,
                        mime_type: mime,
                        file_size: response.body_size,
                        width: None,
                        height: None,
                        page_urls: vec![page_key.to_string()],
                    });
                }
            }
        }

        if partial {
            outcome.partial_pages += 1;
            warn!(url = %page_key, "page marked partial: resource budget exceeded");
        }
    }

    /// Navigate with retry-on-transient semantics; each attempt drives a
    /// fresh page.
    async fn visit_with_retries(
        &self,
        browser: &mut dyn BrowserSession,
        url: &Url,
    ) -> Result<PageVisit, CrawlError> {
        let mut attempt = 0u32;
        loop {
            match self.visit_once(browser, url).await {
                Ok(visit) => return Ok(visit),
                Err(err) if is_transient(&err) && attempt < self.config.max_retries => {
                    attempt += 1;
                    debug!(url = %url, attempt, error = %err, "retrying page");
                    let backoff = backoff_for_attempt(
                        Duration::from_millis(self.config.retry_base_delay_ms),
                        attempt,
                    );
                    self.sleep_cancellable(backoff).await?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn visit_once(
        &self,
        browser: &mut dyn BrowserSession,
        url: &Url,
    ) -> Result<PageVisit, CrawlError> {
        let mut page = self.cancellable(browser.new_page()).await??;
        let result = self.drive_page(&mut *page, url).await;
        page.close().await;
        result
    }

    async fn drive_page(
        &self,
        page: &mut dyn PageSession,
        url: &Url,
    ) -> Result<PageVisit, CrawlError> {
        let nav = self
            .cancellable(with_page_timeout(
                page.navigate(url.as_str()),
                self.config.page_timeout_secs,
            ))
            .await??;

        if let Some(status) = nav.status {
            if status_is_auth(status) {
                return Err(CrawlError::AuthRequired);
            }
            if status >= 400 {
                return Err(CrawlError::HttpStatus(status));
            }
        }
        if is_login_redirect(&nav.final_url) {
            return Err(CrawlError::AuthRequired);
        }

        let settle = SettlePolicy {
            network_idle_ms: self.config.network_idle_ms,
            max_wait_ms: self.config.max_settle_wait_ms,
            grace_ms: self.config.response_grace_ms,
            scroll: self.config.scroll_for_lazy_images,
        };
        self.cancellable(page.settle(&settle)).await??;

        let responses = page.drain_responses().await;
        let links = match self.cancellable(page.extract_links()).await? {
            Ok(links) => links,
            Err(err) => {
                debug!(url = %url, error = %err, "link extraction failed, continuing without links");
                Vec::new()
            }
        };

        Ok(PageVisit {
            final_url: nav.final_url,
            responses,
            links,
        })
    }

    async fn inter_page_delay(&self) -> Result<(), CrawlError> {
        let mut delay = Duration::from_millis(self.config.delay_between_pages_ms);
        if let Some(robots) = &self.robots {
            if let Some(crawl_delay) = robots.crawl_delay() {
                delay = delay.max(crawl_delay);
            }
        }
        if delay.is_zero() {
            return Ok(());
        }
        self.sleep_cancellable(delay).await
    }

    async fn sleep_cancellable(&self, d: Duration) -> Result<(), CrawlError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(CrawlError::Cancelled),
            _ = tokio::time::sleep(d) => Ok(()),
        }
    }

    /// Race a suspension point against cancellation.
    async fn cancellable<T>(&self, fut: impl Future<Output = T>) -> Result<T, CrawlError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(CrawlError::Cancelled),
            value = fut => Ok(value),
        }
    }
}

/// Bound a page operation, mapping elapse to `NavigationTimeout`.
async fn with_page_timeout<T>(
    operation: impl Future<Output = Result<T, CrawlError>>,
    timeout_secs: u64,
) -> Result<T, CrawlError> {
    match tokio::time::timeout(Duration::from_secs(timeout_secs), operation).await {
        Ok(result) => result,
        Err(_) => Err(CrawlError::NavigationTimeout),
    }
}
