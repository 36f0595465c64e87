//! Service configuration: explicit structs, a builder, and a single
//! enumerated env-var override surface.

mod builder;
mod env;
mod types;

pub use builder::{AppConfigBuilder, ConfigError};
pub use env::apply_env_overrides;
pub use types::{
    AppConfig, BrowserPolicy, CrawlerConfig, DESKTOP_USER_AGENT, QueueConfig, RetentionConfig,
    SecurityConfig, ServerConfig,
};
