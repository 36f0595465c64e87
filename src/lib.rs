//! webpscan — site-wide image inventory and WebP savings estimation.
//!
//! The service accepts scan submissions, admits them through a fair-share
//! queue, drives a headless browser across each site to inventory served
//! images by wire MIME type, estimates WebP conversion savings, and pushes
//! live progress to subscribers.

pub mod cleanup;
pub mod config;
pub mod crawler;
pub mod models;
pub mod processor;
pub mod push;
pub mod queue;
pub mod savings;
pub mod server;
pub mod stats;
pub mod store;
pub mod validation;

pub use config::{AppConfig, AppConfigBuilder, CrawlerConfig, QueueConfig};
pub use crawler::{
    ChromiumFactory, CrawlEngine, CrawlError, CrawlObserver, CrawlOutcome, CrawlRequest,
    NoOpObserver, RobotsPolicy, SessionFactory,
};
pub use models::{
    AggregateStats, ConvertedImageBundle, CrawlCheckpoint, DiscoveredImage, ImageCategory,
    ScanJob, ScanStatus,
};
pub use processor::QueueProcessor;
pub use push::{ProgressBroadcaster, ScanServerMessage};
pub use queue::{FairShareQueue, QueueError, ScanSubmission};
pub use savings::{ESTIMATE_DISCLAIMER, SavingsSummary};
pub use stats::LiveStatsTracker;
pub use store::ScanStore;
pub use validation::{ValidationError, validate_submission};
