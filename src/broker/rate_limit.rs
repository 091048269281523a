// =============================================================================
// Rate-Limit Tracker — follows Alpaca's per-minute request budget
// =============================================================================
//
// Alpaca returns three headers on every REST response:
//   X-RateLimit-Limit      requests allowed per window (200 by default)
//   X-RateLimit-Remaining  requests left in the current window
//   X-RateLimit-Reset      unix timestamp (seconds) when the window resets
//
// The tracker mirrors them in atomics so any task can check the budget
// lock-free before sending. Once the budget is spent, requests are refused
// locally until the reset time has passed.
// =============================================================================

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use tracing::{debug, warn};

/// Alpaca's documented default budget, used until the first response.
const DEFAULT_LIMIT: u32 = 200;
/// Log a warning once remaining requests drop to this level.
const REMAINING_WARN_THRESHOLD: u32 = 20;

pub struct RateLimitTracker {
    limit: AtomicU32,
    remaining: AtomicU32,
    reset_at: AtomicI64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSnapshot {
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: i64,
}

fn header_num<T: std::str::FromStr>(headers: &reqwest::header::HeaderMap, name: &str) -> Option<T> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<T>().ok())
}

impl RateLimitTracker {
    pub fn new() -> Self {
        Self {
            limit: AtomicU32::new(DEFAULT_LIMIT),
            remaining: AtomicU32::new(DEFAULT_LIMIT),
            reset_at: AtomicI64::new(0),
        }
    }

    /// Refresh the counters from a response's headers. Missing or malformed
    /// headers leave the previous value in place.
    pub fn update_from_headers(&self, headers: &reqwest::header::HeaderMap) {
        if let Some(limit) = header_num::<u32>(headers, "X-RateLimit-Limit") {
            self.limit.store(limit, Ordering::Relaxed);
        }
        if let Some(reset) = header_num::<i64>(headers, "X-RateLimit-Reset") {
            self.reset_at.store(reset, Ordering::Relaxed);
        }
        if let Some(remaining) = header_num::<u32>(headers, "X-RateLimit-Remaining") {
            let prev = self.remaining.swap(remaining, Ordering::Relaxed);
            if remaining <= REMAINING_WARN_THRESHOLD && prev > REMAINING_WARN_THRESHOLD {
                warn!(
                    remaining,
                    limit = self.limit.load(Ordering::Relaxed),
                    "rate-limit budget running low"
                );
            }
            debug!(remaining, "rate-limit remaining updated from header");
        }
    }

    /// Whether a request may be sent at `now_secs` (unix seconds).
    pub fn can_send_request(&self, now_secs: i64) -> bool {
        let remaining = self.remaining.load(Ordering::Relaxed);
        if remaining > 0 {
            return true;
        }
        let reset_at = self.reset_at.load(Ordering::Relaxed);
        if now_secs >= reset_at {
            // Window rolled over; the next response will refresh the count.
            self.remaining
                .store(self.limit.load(Ordering::Relaxed), Ordering::Relaxed);
            return true;
        }
        warn!(
            reset_in_secs = reset_at - now_secs,
            "request blocked: rate-limit budget exhausted"
        );
        false
    }

    /// Forget the current window, e.g. after switching to another account.
    pub fn reset(&self) {
        self.limit.store(DEFAULT_LIMIT, Ordering::Relaxed);
        self.remaining.store(DEFAULT_LIMIT, Ordering::Relaxed);
        self.reset_at.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RateLimitSnapshot {
        RateLimitSnapshot {
            limit: self.limit.load(Ordering::Relaxed),
            remaining: self.remaining.load(Ordering::Relaxed),
            reset_at: self.reset_at.load(Ordering::Relaxed),
        }
    }
}

impl Default for RateLimitTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RateLimitTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitTracker")
            .field("limit", &self.limit.load(Ordering::Relaxed))
            .field("remaining", &self.remaining.load(Ordering::Relaxed))
            .field("reset_at", &self.reset_at.load(Ordering::Relaxed))
            .finish()
    }
}
