//! Sliding-window rate limiter for client auth and agent handshakes.
//!
//! Counts attempts per key over a rolling window. Time comes from the tokio
//! clock.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
pub struct RateLimiter {
    max_attempts: u32,
    window: Duration,
    /// key → attempt timestamps inside the window.
    entries: HashMap<String, Vec<Instant>>,
}

impl RateLimiter {
    pub fn new(max_attempts: u32, window: Duration) -> Self {
        Self {
            max_attempts,
            window,
            entries: HashMap::new(),
        }
    }

    /// Record an attempt for `key` if it is allowed. Returns `false` when
    /// rate-limited.
    pub fn check_and_record(&mut self, key: &str) -> bool {
        let now = Instant::now();
        let window = self.window;
        let attempts = self.entries.entry(key.to_string()).or_default();
        attempts.retain(|t| now.duration_since(*t) < window);

        if attempts.len() as u32 >= self.max_attempts {
            return false;
        }
        attempts.push(now);
        true
    }

    pub fn gc(&mut self) {
        let now = Instant::now();
        let window = self.window;
        self.entries.retain(|_, attempts| {
            attempts.retain(|t| now.duration_since(*t) < window);
            !attempts.is_empty()
        });
    }

    pub fn tracked_keys(&self) -> usize {
        self.entries.len()
    }
}

/// Limiters shared by the gateway's listeners.
#[derive(Debug)]
pub struct GatewayRateLimits {
    /// Client auth attempts per source IP.
    pub auth: RateLimiter,
    /// Agent handshakes per source IP.
    pub agent: RateLimiter,
}

impl Default for GatewayRateLimits {
    fn default() -> Self {
        Self::new(5, 30)
    }
}

impl GatewayRateLimits {
    /// Per-minute limits.
    pub fn new(auth_per_minute: u32, agent_per_minute: u32) -> Self {
        Self {
            auth: RateLimiter::new(auth_per_minute, Duration::from_secs(60)),
            agent: RateLimiter::new(agent_per_minute, Duration::from_secs(60)),
        }
    }

    pub fn check_auth(&mut self, ip: &IpAddr) -> bool {
        self.auth.check_and_record(&ip.to_string())
    }

    pub fn check_agent(&mut self, ip: &IpAddr) -> bool {
        self.agent.check_and_record(&ip.to_string())
    }

    pub fn gc(&mut self) {
        self.auth.gc();
        self.agent.gc();
    }
}
