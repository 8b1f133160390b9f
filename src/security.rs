//! Ambient hardening: per-IP rate limiting and allow/deny lists. Not part of
//! the SNTP core — the core's own peer authorization (local-subnet-only
//! unicast replies in client mode) lives in `sntp::SntpEngine` via
//! `InterfaceRegistry::local_match`.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::RwLock;
use std::time::{Duration, Instant};

pub struct RateLimiter {
    limits: RwLock<HashMap<IpAddr, RateLimitState>>,
    max_requests_per_second: u32,
    cleanup_interval: Duration,
    last_cleanup: RwLock<Instant>,
}

#[derive(Debug, Clone)]
struct RateLimitState {
    request_count: u32,
    window_start: Instant,
    last_request: Instant,
}

impl RateLimiter {
    pub fn new(max_requests_per_second: u32) -> Self {
        RateLimiter {
            limits: RwLock::new(HashMap::new()),
            max_requests_per_second,
            cleanup_interval: Duration::from_secs(60),
            last_cleanup: RwLock::new(Instant::now()),
        }
    }

    pub fn check_rate_limit(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        self.cleanup_old_entries(now);

        let mut limits = match self.limits.write() {
            Ok(guard) => guard,
            Err(_) => {
                tracing::warn!("rate limiter lock poisoned, failing open");
                return true;
            }
        };

        let state = limits.entry(ip).or_insert_with(|| RateLimitState {
            request_count: 0,
            window_start: now,
            last_request: now,
        });

        if now.duration_since(state.window_start) >= Duration::from_secs(1) {
            state.request_count = 1;
            state.window_start = now;
            state.last_request = now;
            return true;
        }

        state.request_count += 1;
        state.last_request = now;

        if state.request_count > self.max_requests_per_second {
            tracing::debug!(%ip, count = state.request_count, "rate limit exceeded");
            return false;
        }
        true
    }

    fn cleanup_old_entries(&self, now: Instant) {
        let mut last_cleanup = match self.last_cleanup.write() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        if now.duration_since(*last_cleanup) < self.cleanup_interval {
            return;
        }
        if let Ok(mut limits) = self.limits.write() {
            limits.retain(|_, state| now.duration_since(state.last_request) < Duration::from_secs(60));
        }
        *last_cleanup = now;
    }
}

pub struct IpFilter {
    whitelist: Vec<IpAddr>,
    blacklist: Vec<IpAddr>,
}

impl IpFilter {
    pub fn new(whitelist: Vec<String>, blacklist: Vec<String>) -> Self {
        IpFilter {
            whitelist: whitelist.iter().filter_map(|s| s.parse().ok()).collect(),
            blacklist: blacklist.iter().filter_map(|s| s.parse().ok()).collect(),
        }
    }

    pub fn is_allowed(&self, ip: IpAddr) -> bool {
        if self.blacklist.contains(&ip) {
            return false;
        }
        self.whitelist.is_empty() || self.whitelist.contains(&ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn rate_limiter_blocks_after_the_per_second_ceiling() {
        let limiter = RateLimiter::new(10);
        let ip = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));
        for _ in 0..10 {
            assert!(limiter.check_rate_limit(ip));
        }
        assert!(!limiter.check_rate_limit(ip));
    }

    #[test]
    fn blacklist_wins_over_everything() {
        let filter = IpFilter::new(vec![], vec!["192.168.1.100".to_string()]);
        assert!(!filter.is_allowed("192.168.1.100".parse().unwrap()));
        assert!(filter.is_allowed("192.168.1.101".parse().unwrap()));
    }

    #[test]
    fn nonempty_whitelist_excludes_everyone_else() {
        let filter = IpFilter::new(vec!["192.168.1.100".to_string()], vec![]);
        assert!(filter.is_allowed("192.168.1.100".parse().unwrap()));
        assert!(!filter.is_allowed("192.168.1.101".parse().unwrap()));
    }
}
