//! Token bucket rate limiting for DoS protection

use super::types::{
    ADMISSION_SWEEP_SECS, CONNECTIONS_PER_IP_PER_SEC, MAX_RATE_VIOLATIONS, MESSAGES_PER_SEC,
};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: f64,
    capacity: f64,
    rate_per_sec: f64,
    last_update: Instant,
}

impl TokenBucket {
    pub fn new(capacity: f64, rate_per_sec: f64) -> Self {
        Self {
            tokens: capacity,
            capacity,
            rate_per_sec,
            last_update: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate_per_sec).min(self.capacity);
        self.last_update = now;
    }

    pub fn try_consume(&mut self, tokens: f64) -> bool {
        self.refill();
        if self.tokens >= tokens {
            self.tokens -= tokens;
            true
        } else {
            false
        }
    }
}

/// Outcome of admitting one inbound envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageVerdict {
    /// Within budget; dispatch it.
    Allowed,
    /// Over budget; answer with an inline rate-limit error.
    Limited,
    /// The violation threshold was crossed; close the connection.
    Disconnect,
}

/// Per-connection message budget: 30 messages per second, with a violation
/// counter that escalates sustained abuse to a disconnect.
#[derive(Debug)]
pub struct MessageLimiter {
    bucket: TokenBucket,
    violations: u32,
}

impl MessageLimiter {
    pub fn new() -> Self {
        Self {
            bucket: TokenBucket::new(MESSAGES_PER_SEC, MESSAGES_PER_SEC),
            violations: 0,
        }
    }

    pub fn admit(&mut self) -> MessageVerdict {
        if self.bucket.try_consume(1.0) {
            return MessageVerdict::Allowed;
        }
        self.violations += 1;
        if self.violations >= MAX_RATE_VIOLATIONS {
            MessageVerdict::Disconnect
        } else {
            MessageVerdict::Limited
        }
    }

    pub fn violations(&self) -> u32 {
        self.violations
    }
}

impl Default for MessageLimiter {
    fn default() -> Self {
        Self::new()
    }
}

struct AdmissionEntry {
    bucket: TokenBucket,
    last_seen: Instant,
}

/// Per-IP connection admission: 3 new connections per second, entries idle
/// longer than five minutes are swept.
pub struct ConnectionAdmission {
    entries: Mutex<HashMap<IpAddr, AdmissionEntry>>,
}

impl ConnectionAdmission {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns false when the IP is over its connection budget.
    pub fn admit(&self, ip: IpAddr) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let entry = entries.entry(ip).or_insert_with(|| AdmissionEntry {
            bucket: TokenBucket::new(CONNECTIONS_PER_IP_PER_SEC, CONNECTIONS_PER_IP_PER_SEC),
            last_seen: Instant::now(),
        });
        entry.last_seen = Instant::now();
        entry.bucket.try_consume(1.0)
    }

    /// Drop entries not seen within the sweep window.
    pub fn sweep(&self) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.retain(|_, e| e.last_seen.elapsed().as_secs() < ADMISSION_SWEEP_SECS);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ConnectionAdmission {
    fn default() -> Self {
        Self::new()
    }
}
