//! The browser seam.
//!
//! The engine drives these traits only; the chromiumoxide implementation
//! lives in `chromium.rs` and tests substitute a deterministic double that
//! replays canned responses. One `BrowserSession` exists per scan (never
//! shared across workers), one `PageSession` per page visit.

use async_trait::async_trait;

use super::types::{CrawlError, NavigationOutcome, NetworkResponse, SettlePolicy};

/// A live browser bound to one scan.
#[async_trait]
pub trait BrowserSession: Send {
    /// Open a fresh page.
    async fn new_page(&self) -> Result<Box<dyn PageSession>, CrawlError>;

    /// Tear the browser down. Called on every exit path; must be prompt.
    async fn close(&mut self);
}

/// One page: navigate, settle, observe network traffic, read links.
#[async_trait]
pub trait PageSession: Send {
    /// Navigate and wait for the load event.
    async fn navigate(&mut self, url: &str) -> Result<NavigationOutcome, CrawlError>;

    /// Wait for network quiescence bounded by the policy's hard cap, with
    /// optional progressive scroll and a trailing grace window.
    async fn settle(&mut self, policy: &SettlePolicy) -> Result<(), CrawlError>;

    /// Network responses captured since the last `navigate`.
    async fn drain_responses(&mut self) -> Vec<NetworkResponse>;

    /// Anchor hrefs on the page, absolute.
    async fn extract_links(&mut self) -> Result<Vec<String>, CrawlError>;

    async fn close(&mut self);
}

/// Launches browsers; the processor owns one factory for all workers.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn launch(&self) -> Result<Box<dyn BrowserSession>, CrawlError>;
}
