//! robots.txt policy for the crawler.
//!
//! Only the `User-agent: *` group and the group matching our advertised
//! agent are honored: `Disallow` lines are prefix matches on the path, and
//! `Crawl-delay` becomes a minimum inter-page delay. A missing or
//! unfetchable robots.txt allows everything.

use std::collections::HashMap;
use std::time::Duration;

use tracing::debug;
use url::Url;

/// Parsed robots.txt rules for one origin.
#[derive(Debug, Clone, Default)]
pub struct RobotsPolicy {
    /// Lowercased user-agent → disallowed path prefixes.
    rules: HashMap<String, Vec<String>>,
    /// Largest applicable crawl-delay, if any group declared one.
    crawl_delay: Option<Duration>,
    pub loaded: bool,
}

impl RobotsPolicy {
    /// Fetch and parse robots.txt for the seed's origin. Network errors and
    /// non-success statuses degrade to an allow-everything policy.
    pub async fn fetch(seed: &Url, user_agent: &str) -> Self {
        let Some(host) = seed.host_str() else {
            return Self::default();
        };
        let robots_url = match seed.port() {
            Some(port) => format!("{}://{}:{}/robots.txt", seed.scheme(), host, port),
            None => format!("{}://{}/robots.txt", seed.scheme(), host),
        };

        let client = match reqwest::Client::builder()
            .user_agent(user_agent.to_string())
            .timeout(Duration::from_secs(10))
            .build()
        {
            Ok(client) => client,
            Err(_) => return Self::default(),
        };

        match client.get(&robots_url).send().await {
            Ok(resp) if resp.status().is_success() => {
                let body = resp.text().await.unwrap_or_default();
                debug!(url = %robots_url, "robots.txt loaded");
                Self::from_content(&body, user_agent)
            }
            _ => Self::default(),
        }
    }

    /// Parse raw robots.txt content.
    #[must_use]
    pub fn from_content(content: &str, user_agent: &str) -> Self {
        let mut rules: HashMap<String, Vec<String>> = HashMap::new();
        let mut delays: HashMap<String, u64> = HashMap::new();
        let mut current_agents: Vec<String> = Vec::new();
        // Directives directly after a User-agent line belong to that group;
        // any other directive ends the group run.
        let mut in_agent_run = false;

        for line in content.lines() {
            let line = match line.find('#') {
                Some(idx) => line[..idx].trim(),
                None => line.trim(),
            };
            if line.is_empty() {
                current_agents.clear();
                in_agent_run = false;
                continue;
            }

            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let key = key.trim().to_lowercase();
            let value = value.trim();

            match key.as_str() {
                "user-agent" => {
                    if !in_agent_run {
                        current_agents.clear();
                    }
                    in_agent_run = true;
                    current_agents.push(value.to_lowercase());
                }
                "disallow" => {
                    in_agent_run = false;
                    for agent in &current_agents {
                        rules.entry(agent.clone()).or_default().push(value.to_string());
                    }
                }
                "crawl-delay" => {
                    in_agent_run = false;
                    if let Ok(secs) = value.parse::<u64>() {
                        for agent in &current_agents {
                            delays.insert(agent.clone(), secs);
                        }
                    }
                }
                _ => {
                    in_agent_run = false;
                }
            }
        }

        let ua_token = primary_token(user_agent);
        let crawl_delay = delays
            .get(&ua_token)
            .or_else(|| delays.get("*"))
            .map(|secs| Duration::from_secs(*secs));

        Self {
            rules,
            crawl_delay,
            loaded: true,
        }
    }

    /// Whether crawling `url` is permitted.
    #[must_use]
    pub fn allows(&self, url: &Url, user_agent: &str) -> bool {
        let path = url.path();
        let ua_token = primary_token(user_agent);

        for agent in [ua_token.as_str(), "*"] {
            if let Some(disallowed) = self.rules.get(agent) {
                for prefix in disallowed {
                    // An empty Disallow means allow-all for that group.
                    if !prefix.is_empty() && path.starts_with(prefix.as_str()) {
                        return false;
                    }
                }
            }
        }
        true
    }

    /// Declared crawl-delay, used as a floor on the inter-page delay.
    #[must_use]
    pub fn crawl_delay(&self) -> Option<Duration> {
        self.crawl_delay
    }
}

/// First product token of a UA string, lowercased ("Mozilla/5.0 (..)" →
/// "mozilla").
fn primary_token(user_agent: &str) -> String {
    user_agent
        .split(['/', ' '])
        .next()
        .unwrap_or("*")
        .to_lowercase()
}
