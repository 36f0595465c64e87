//! chromiumoxide-backed browser sessions.
//!
//! One browser process per scan: found on the system when possible,
//! otherwise downloaded via the managed fetcher, launched with a flag set
//! tuned for unattended scanning and the configured desktop user agent so
//! origin servers negotiate content honestly. A handler task drains the CDP
//! connection for the life of the browser.
//!
//! Network capture subscribes to the request/response/loading-finished
//! event streams and joins them by request id; body sizes come from
//! `loadingFinished.encodedDataLength`, falling back to the response's own
//! running total when a request never finishes cleanly.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfigBuilder, HeadlessMode};
use chromiumoxide::cdp::browser_protocol::network::{
    EventLoadingFailed, EventLoadingFinished, EventRequestWillBeSent, EventResponseReceived,
    ResourceType,
};
use chromiumoxide::fetcher::{BrowserFetcher, BrowserFetcherOptions};
use chromiumoxide::Page;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::config::CrawlerConfig;

use super::session::{BrowserSession, PageSession, SessionFactory};
use super::types::{CrawlError, NavigationOutcome, NetworkResponse, SettlePolicy};

const EVENT_LISTENER_SETUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Find a Chrome/Chromium executable, preferring `CHROMIUM_PATH`.
pub async fn find_browser_executable() -> Result<PathBuf, CrawlError> {
    if let Ok(path) = std::env::var("CHROMIUM_PATH") {
        let path = PathBuf::from(path);
        if path.exists() {
            info!("using browser from CHROMIUM_PATH: {}", path.display());
            return Ok(path);
        }
        warn!(
            "CHROMIUM_PATH points to a non-existent file: {}",
            path.display()
        );
    }

    let paths = if cfg!(target_os = "macos") {
        vec![
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
            "/opt/homebrew/bin/chromium",
        ]
    } else {
        vec![
            "/usr/bin/google-chrome",
            "/usr/bin/google-chrome-stable",
            "/usr/bin/chromium",
            "/usr/bin/chromium-browser",
            "/snap/bin/chromium",
            "/usr/local/bin/chromium",
            "/opt/google/chrome/chrome",
        ]
    };

    for path_str in paths {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("found browser at {}", path.display());
            return Ok(path);
        }
    }

    if !cfg!(target_os = "windows") {
        for cmd in &["chromium", "chromium-browser", "google-chrome", "chrome"] {
            if let Ok(output) = Command::new("which").arg(cmd).output() {
                if output.status.success() {
                    let path_str = String::from_utf8_lossy(&output.stdout).trim().to_string();
                    if !path_str.is_empty() {
                        let path = PathBuf::from(path_str);
                        info!("found browser via which: {}", path.display());
                        return Ok(path);
                    }
                }
            }
        }
    }

    Err(CrawlError::BrowserLaunch(
        "no Chrome/Chromium executable found".into(),
    ))
}

/// Download a managed Chromium build into the cache directory.
pub async fn download_managed_browser() -> Result<PathBuf, CrawlError> {
    info!("downloading managed Chromium");
    let cache_dir = dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("webpscan")
        .join("chromium");
    std::fs::create_dir_all(&cache_dir)
        .map_err(|e| CrawlError::BrowserLaunch(format!("cache dir: {e}")))?;

    let fetcher = BrowserFetcher::new(
        BrowserFetcherOptions::builder()
            .with_path(&cache_dir)
            .build()
            .map_err(|e| CrawlError::BrowserLaunch(format!("fetcher options: {e}")))?,
    );
    let info = fetcher
        .fetch()
        .await
        .map_err(|e| CrawlError::BrowserLaunch(format!("fetch browser: {e}")))?;

    info!("downloaded Chromium to {}", info.folder_path.display());
    Ok(info.executable_path)
}

/// Launches one isolated browser per scan.
pub struct ChromiumFactory {
    config: CrawlerConfig,
}

impl ChromiumFactory {
    #[must_use]
    pub fn new(config: CrawlerConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SessionFactory for ChromiumFactory {
    async fn launch(&self) -> Result<Box<dyn BrowserSession>, CrawlError> {
        let chrome_path = match find_browser_executable().await {
            Ok(path) => path,
            Err(_) => download_managed_browser().await?,
        };

        // Unique profile per scan prevents lock contention between workers.
        let user_data_dir = std::env::temp_dir()
            .join(format!("webpscan_profile_{}", uuid::Uuid::new_v4().simple()));
        std::fs::create_dir_all(&user_data_dir)
            .map_err(|e| CrawlError::BrowserLaunch(format!("user data dir: {e}")))?;

        let policy = &self.config.browser;
        let mut builder = BrowserConfigBuilder::default()
            .request_timeout(Duration::from_secs(self.config.page_timeout_secs))
            .window_size(policy.window_width, policy.window_height)
            .user_data_dir(user_data_dir.clone())
            .chrome_executable(chrome_path);

        if policy.headless {
            builder = builder.headless_mode(HeadlessMode::default());
        } else {
            builder = builder.with_head();
        }

        builder = builder
            .arg(format!("--user-agent={}", self.config.user_agent))
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--disable-infobars")
            .arg("--disable-notifications")
            .arg("--disable-extensions")
            .arg("--disable-popup-blocking")
            .arg("--disable-background-networking")
            .arg("--disable-background-timer-throttling")
            .arg("--disable-backgrounding-occluded-windows")
            .arg("--disable-breakpad")
            .arg("--disable-hang-monitor")
            .arg("--disable-prompt-on-repost")
            .arg("--metrics-recording-only")
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--password-store=basic")
            .arg("--use-mock-keychain")
            .arg("--hide-scrollbars")
            .arg("--mute-audio");

        if !policy.sandbox {
            builder = builder.arg("--no-sandbox").arg("--disable-setuid-sandbox");
        }
        if let Some(limit_mb) = policy.memory_limit_mb {
            builder = builder.arg(format!("--js-flags=--max-old-space-size={limit_mb}"));
        }

        let browser_config = builder
            .build()
            .map_err(|e| CrawlError::BrowserLaunch(format!("browser config: {e}")))?;

        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| CrawlError::BrowserLaunch(e.to_string()))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    let msg = e.to_string();
                    // Chrome emits CDP events chromiumoxide cannot decode;
                    // those are not failures of the session.
                    let benign = msg
                        .contains("data did not match any variant of untagged enum Message")
                        || msg.contains("Failed to deserialize WS response");
                    if benign {
                        trace!("suppressed benign CDP serialization error: {msg}");
                    } else {
                        error!("browser handler error: {msg}");
                    }
                }
            }
            debug!("browser handler task finished");
        });

        Ok(Box::new(ChromiumBrowser {
            browser,
            handler_task: Some(handler_task),
            user_data_dir,
        }))
    }
}

/// One live browser process bound to one scan.
pub struct ChromiumBrowser {
    browser: Browser,
    handler_task: Option<JoinHandle<()>>,
    user_data_dir: PathBuf,
}

#[async_trait]
impl BrowserSession for ChromiumBrowser {
    async fn new_page(&self) -> Result<Box<dyn PageSession>, CrawlError> {
        let page = self
            .browser
            .new_page("about:blank")
            .await
            .map_err(|e| CrawlError::NavigationError(format!("new page: {e}")))?;

        let state = Arc::new(Mutex::new(NetworkState::default()));
        let collector = spawn_network_collector(&page, Arc::clone(&state)).await?;

        Ok(Box::new(ChromiumPage {
            page: Some(page),
            state,
            collector,
        }))
    }

    async fn close(&mut self) {
        if let Err(e) = self.browser.close().await {
            warn!("browser close failed: {e}");
        }
        let _ = self.browser.wait().await;

        if let Some(task) = self.handler_task.take() {
            task.abort();
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!("handler task failed during abort: {e}");
                }
            }
        }

        if let Err(e) = tokio::fs::remove_dir_all(&self.user_data_dir).await {
            debug!(
                "could not remove profile dir {}: {e}",
                self.user_data_dir.display()
            );
        }
    }
}

/// Joined network observations for one page.
#[derive(Default)]
struct NetworkState {
    /// request id → response metadata awaiting loadingFinished.
    in_flight: HashMap<String, PendingResponse>,
    completed: Vec<NetworkResponse>,
    outstanding: i64,
    last_activity: Option<Instant>,
    document_status: Option<u16>,
}

struct PendingResponse {
    url: String,
    mime_type: String,
    status: u16,
    running_length: i64,
}

impl NetworkState {
    fn touch(&mut self) {
        self.last_activity = Some(Instant::now());
    }

    fn finish(&mut self, request_id: &str, encoded_length: Option<i64>) {
        self.outstanding = (self.outstanding - 1).max(0);
        self.touch();
        if let Some(pending) = self.in_flight.remove(request_id) {
            let body_size = encoded_length.unwrap_or(pending.running_length).max(0);
            self.completed.push(NetworkResponse {
                url: pending.url,
                mime_type: pending.mime_type,
                status: pending.status,
                body_size,
            });
        }
    }
}

async fn spawn_network_collector(
    page: &Page,
    state: Arc<Mutex<NetworkState>>,
) -> Result<JoinHandle<()>, CrawlError> {
    let listeners = tokio::time::timeout(EVENT_LISTENER_SETUP_TIMEOUT, async {
        let requests = page.event_listener::<EventRequestWillBeSent>().await?;
        let responses = page.event_listener::<EventResponseReceived>().await?;
        let finished = page.event_listener::<EventLoadingFinished>().await?;
        let failed = page.event_listener::<EventLoadingFailed>().await?;
        Ok::<_, chromiumoxide::error::CdpError>((requests, responses, finished, failed))
    })
    .await
    .map_err(|_| CrawlError::NavigationError("event listener setup timed out".into()))?
    .map_err(|e| CrawlError::NavigationError(format!("event listeners: {e}")))?;

    let (mut requests, mut responses, mut finished, mut failed) = listeners;

    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(_event) = requests.next() => {
                    let mut s = state.lock();
                    s.outstanding += 1;
                    s.touch();
                }
                Some(event) = responses.next() => {
                    let mut s = state.lock();
                    s.touch();
                    let response = &event.response;
                    let status = response.status.clamp(0, u16::MAX as i64) as u16;
                    if event.r#type == ResourceType::Document && s.document_status.is_none() {
                        s.document_status = Some(status);
                    }
                    s.in_flight.insert(
                        event.request_id.inner().clone(),
                        PendingResponse {
                            url: response.url.clone(),
                            mime_type: response.mime_type.clone(),
                            status,
                            running_length: response.encoded_data_length as i64,
                        },
                    );
                }
                Some(event) = finished.next() => {
                    let mut s = state.lock();
                    s.finish(
                        event.request_id.inner(),
                        Some(event.encoded_data_length as i64),
                    );
                }
                Some(event) = failed.next() => {
                    let mut s = state.lock();
                    s.finish(event.request_id.inner(), None);
                }
                else => break,
            }
        }
    });

    Ok(task)
}

/// One page visit.
pub struct ChromiumPage {
    page: Option<Page>,
    state: Arc<Mutex<NetworkState>>,
    collector: JoinHandle<()>,
}

impl ChromiumPage {
    fn page(&self) -> Result<&Page, CrawlError> {
        self.page
            .as_ref()
            .ok_or_else(|| CrawlError::NavigationError("page already closed".into()))
    }
}

#[async_trait]
impl PageSession for ChromiumPage {
    async fn navigate(&mut self, url: &str) -> Result<NavigationOutcome, CrawlError> {
        let page = self.page()?;
        page.goto(url)
            .await
            .map_err(|e| CrawlError::NavigationError(e.to_string()))?;
        page.wait_for_navigation()
            .await
            .map_err(|e| CrawlError::NavigationError(e.to_string()))?;

        let final_url = page
            .url()
            .await
            .ok()
            .flatten()
            .map(|u| u.to_string())
            .unwrap_or_else(|| url.to_string());
        let status = self.state.lock().document_status;

        Ok(NavigationOutcome { final_url, status })
    }

    async fn settle(&mut self, policy: &SettlePolicy) -> Result<(), CrawlError> {
        let deadline = Instant::now() + Duration::from_millis(policy.max_wait_ms);
        let idle = Duration::from_millis(policy.network_idle_ms);

        wait_for_idle(&self.state, idle, deadline).await;

        if policy.scroll && Instant::now() < deadline {
            let page = self.page()?;
            for _ in 0..3 {
                let _ = page
                    .evaluate(
                        "window.scrollTo(0, document.body ? document.body.scrollHeight : 0)",
                    )
                    .await;
                tokio::time::sleep(Duration::from_millis(200)).await;
                if Instant::now() >= deadline {
                    break;
                }
            }
            wait_for_idle(&self.state, idle, deadline).await;
        }

        tokio::time::sleep(Duration::from_millis(policy.grace_ms)).await;
        Ok(())
    }

    async fn drain_responses(&mut self) -> Vec<NetworkResponse> {
        std::mem::take(&mut self.state.lock().completed)
    }

    async fn extract_links(&mut self) -> Result<Vec<String>, CrawlError> {
        let page = self.page()?;
        let value = page
            .evaluate("Array.from(document.querySelectorAll('a[href]')).map(a => a.href)")
            .await
            .map_err(|e| CrawlError::NavigationError(format!("link extraction: {e}")))?;
        value
            .into_value::<Vec<String>>()
            .map_err(|e| CrawlError::NavigationError(format!("link decode: {e}")))
    }

    async fn close(&mut self) {
        self.collector.abort();
        if let Some(page) = self.page.take() {
            if let Err(e) = page.close().await {
                debug!("page close failed: {e}");
            }
        }
    }
}

/// Block until the network has been quiet for `idle`, or until `deadline`.
async fn wait_for_idle(state: &Arc<Mutex<NetworkState>>, idle: Duration, deadline: Instant) {
    loop {
        if Instant::now() >= deadline {
            return;
        }
        {
            let s = state.lock();
            let quiet_since = s
                .last_activity
                .map(|t| t.elapsed())
                .unwrap_or(Duration::MAX);
            if s.outstanding == 0 && quiet_since >= idle {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
