//! Per-submitter cooldown table.
//!
//! A small service object with an explicit lifecycle: constructed at process
//! start, handed to the queue, torn down with it. Entries expire lazily on
//! read, so the table never needs its own sweeper.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use log::debug;

use super::Clock;

pub struct CooldownTable {
    until: DashMap<String, DateTime<Utc>>,
    cooldown: Duration,
    clock: Clock,
}

impl CooldownTable {
    #[must_use]
    pub fn new(cooldown_secs: u64, clock: Clock) -> Self {
        Self {
            until: DashMap::new(),
            cooldown: Duration::seconds(cooldown_secs as i64),
            clock,
        }
    }

    /// Start (or restart) the cooldown window for a submitter.
    pub fn record(&self, ip: &str) {
        debug!("cooldown started for {ip}");
        self.until.insert(ip.to_string(), self.clock.now() + self.cooldown);
    }

    /// Whether the submitter is still cooling down. Expired entries are
    /// removed on the way out.
    pub fn is_active(&self, ip: &str) -> bool {
        let now = self.clock.now();
        match self.until.get(ip) {
            Some(entry) if *entry > now => true,
            Some(_) => {
                drop(self.until.remove(ip));
                false
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn cooldown_expires_with_the_clock() {
        let now = Arc::new(parking_lot::Mutex::new(Utc::now()));
        let clock_time = Arc::clone(&now);
        let clock = Clock::new(move || *clock_time.lock());

        let table = CooldownTable::new(60, clock);
        assert!(!table.is_active("1.2.3.4"));

        table.record("1.2.3.4");
        assert!(table.is_active("1.2.3.4"));

        *now.lock() += Duration::seconds(61);
        assert!(!table.is_active("1.2.3.4"));
        // Entry was purged, not just masked.
        assert!(table.until.get("1.2.3.4").is_none());
    }
}
