//! Browser-driven crawl engine.
//!
//! `engine` holds the breadth-first loop, `chromium` the real browser
//! backend behind the `session` seam, and the rest are the policies the
//! loop composes: link filtering, robots, retries, checkpoints, and the
//! observer that surfaces progress.

pub mod checkpoint;
pub mod chromium;
pub mod engine;
pub mod links;
pub mod observer;
pub mod retry;
pub mod robots;
pub mod session;
pub mod types;

pub use checkpoint::{CheckpointSink, NoOpCheckpointSink, StoreCheckpointSink};
pub use chromium::ChromiumFactory;
pub use engine::CrawlEngine;
pub use observer::{CrawlObserver, NoOpObserver};
pub use robots::RobotsPolicy;
pub use session::{BrowserSession, PageSession, SessionFactory};
pub use types::{
    CrawlError, CrawlOutcome, CrawlProgress, CrawlRequest, CrawledImage, ImageHit,
    NavigationOutcome, NetworkResponse, SettlePolicy, SkippedPage,
};
