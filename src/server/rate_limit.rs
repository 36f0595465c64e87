//! Fixed-window per-IP ingress rate limiting.

use std::net::IpAddr;

use dashmap::DashMap;
use log::debug;

/// Requests are counted per IP per minute-of-epoch; the window resets on
/// rollover. Coarse by design — the queue's own caps do the fine-grained
/// fairness work.
pub struct RateLimiter {
    max_per_minute: u32,
    windows: DashMap<IpAddr, (i64, u32)>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(max_per_minute: u32) -> Self {
        Self {
            max_per_minute,
            windows: DashMap::new(),
        }
    }

    /// Record one request; `false` means over budget.
    pub fn allow(&self, ip: IpAddr) -> bool {
        self.allow_at(ip, chrono::Utc::now().timestamp())
    }

    fn allow_at(&self, ip: IpAddr, now_secs: i64) -> bool {
        let minute = now_secs / 60;
        let mut entry = self.windows.entry(ip).or_insert((minute, 0));
        let (window, count) = *entry;
        if window != minute {
            *entry = (minute, 1);
            return true;
        }
        if count >= self.max_per_minute {
            debug!("rate limit hit for {ip}");
            return false;
        }
        *entry = (window, count + 1);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_is_enforced_within_a_window() {
        let limiter = RateLimiter::new(3);
        let ip: IpAddr = "1.2.3.4".parse().unwrap();
        let t = 1_700_000_000;

        assert!(limiter.allow_at(ip, t));
        assert!(limiter.allow_at(ip, t + 1));
        assert!(limiter.allow_at(ip, t + 2));
        assert!(!limiter.allow_at(ip, t + 3));
    }

    #[test]
    fn window_rollover_resets_the_count() {
        let limiter = RateLimiter::new(1);
        let ip: IpAddr = "1.2.3.4".parse().unwrap();
        let t = 1_700_000_000;

        assert!(limiter.allow_at(ip, t));
        assert!(!limiter.allow_at(ip, t + 1));
        assert!(limiter.allow_at(ip, t + 60));
    }

    #[test]
    fn ips_are_tracked_independently() {
        let limiter = RateLimiter::new(1);
        let a: IpAddr = "1.2.3.4".parse().unwrap();
        let b: IpAddr = "5.6.7.8".parse().unwrap();
        let t = 1_700_000_000;

        assert!(limiter.allow_at(a, t));
        assert!(limiter.allow_at(b, t));
        assert!(!limiter.allow_at(a, t + 1));
    }
}
