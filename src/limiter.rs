//! Rate limiting: a per-connection token bucket and a per-IP auth lockout.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// Default per-connection message rate (messages per second).
pub const DEFAULT_RATE_LIMIT: f64 = 100.0;
/// Failed auth attempts tolerated per IP within the window.
pub const MAX_AUTH_ATTEMPTS: u32 = 5;
/// Window over which auth failures accumulate.
pub const AUTH_WINDOW: Duration = Duration::from_secs(300);
/// Block duration once the attempt limit is hit.
pub const AUTH_LOCKOUT: Duration = Duration::from_secs(300);

/// Token bucket with continuous refill: capacity = rate, refill = rate
/// tokens per second.
#[derive(Debug)]
pub struct RateLimiter {
    rate: f64,
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(rate: f64) -> Self {
        Self {
            rate,
            tokens: rate,
            last_refill: Instant::now(),
        }
    }

    /// Consume one token if available. Returns `false` (consuming nothing)
    /// when the bucket is empty.
    pub fn can_send(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * self.rate).min(self.rate);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }
}

#[derive(Debug, Default)]
struct AttemptRecord {
    failures: u32,
    window_start: Option<Instant>,
    locked_until: Option<Instant>,
}

/// Per-IP authentication throttle: 5 failures within 5 minutes locks the
/// address out for 5 minutes.
#[derive(Debug)]
pub struct AuthGuard {
    max_attempts: u32,
    window: Duration,
    lockout: Duration,
    records: HashMap<IpAddr, AttemptRecord>,
}

impl AuthGuard {
    pub fn new() -> Self {
        Self::with_limits(MAX_AUTH_ATTEMPTS, AUTH_WINDOW, AUTH_LOCKOUT)
    }

    pub fn with_limits(max_attempts: u32, window: Duration, lockout: Duration) -> Self {
        Self {
            max_attempts,
            window,
            lockout,
            records: HashMap::new(),
        }
    }

    /// Whether `ip` may attempt authentication right now.
    pub fn check(&mut self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let record = self.records.entry(ip).or_default();
        if let Some(until) = record.locked_until {
            if now < until {
                return false;
            }
            record.locked_until = None;
            record.failures = 0;
            record.window_start = None;
        }
        if let Some(start) = record.window_start {
            if now.duration_since(start) > self.window {
                record.failures = 0;
                record.window_start = None;
            }
        }
        record.failures < self.max_attempts
    }

    pub fn record_failure(&mut self, ip: IpAddr) {
        let now = Instant::now();
        let record = self.records.entry(ip).or_default();
        if record.window_start.is_none() {
            record.window_start = Some(now);
        }
        record.failures += 1;
        if record.failures >= self.max_attempts {
            record.locked_until = Some(now + self.lockout);
        }
    }

    pub fn record_success(&mut self, ip: IpAddr) {
        self.records.remove(&ip);
    }
}

impl Default for AuthGuard {
    fn default() -> Self {
        Self::new()
    }
}
