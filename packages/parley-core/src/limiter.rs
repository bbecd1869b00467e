//! Per-room message rate limiter.
//!
//! Fixed window counter keyed by room id:
//!
//! ```text
//!   first message        ─► { count: 1, window_start: now }
//!   now - start > window ─► reset to { 1, now }         (not over)
//!   otherwise            ─► count += 1, over = count > max
//! ```
//!
//! Once a room goes over the limit it stays over until its window ends.
//! Idle entries are dropped by [`RateLimiter::purge_expired`].

use std::time::Duration;

use dashmap::DashMap;

/// Extra lifetime an idle entry gets past its window before purging
pub const PURGE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
struct WindowState {
    count: u32,
    window_start: i64,
    window_ms: i64,
}

/// Fixed-window counter per key
#[derive(Debug, Default)]
pub struct RateLimiter {
    windows: DashMap<String, WindowState>,
}

impl RateLimiter {
    /// Create an empty limiter
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one message for `key`; true when the key is over its limit
    ///
    /// `max_count == 0` disables limiting.
    pub fn is_over_limit(&self, key: &str, max_count: u32, window: Duration) -> bool {
        self.is_over_limit_at(key, max_count, window, crate::time::now_timestamp_millis())
    }

    /// [`Self::is_over_limit`] against an explicit clock
    pub fn is_over_limit_at(&self, key: &str, max_count: u32, window: Duration, now_ms: i64) -> bool {
        if max_count == 0 {
            return false;
        }
        let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);

        let mut entry = self.windows.entry(key.to_string()).or_insert(WindowState {
            count: 0,
            window_start: now_ms,
            window_ms,
        });

        if now_ms - entry.window_start > window_ms {
            entry.count = 0;
            entry.window_start = now_ms;
        }
        entry.window_ms = window_ms;
        entry.count = entry.count.saturating_add(1);

        let over = entry.count > max_count;
        if over && entry.count - 1 == max_count {
            tracing::info!(key, max_count, "Rate limit exceeded");
        }
        over
    }

    /// Drop entries idle for longer than their window plus [`PURGE_GRACE`]
    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(crate::time::now_timestamp_millis())
    }

    /// [`Self::purge_expired`] against an explicit clock
    pub fn purge_expired_at(&self, now_ms: i64) -> usize {
        let grace_ms = PURGE_GRACE.as_millis() as i64;
        let before = self.windows.len();
        self.windows
            .retain(|_, state| now_ms - state.window_start <= state.window_ms.saturating_add(grace_ms));
        let purged = before.saturating_sub(self.windows.len());

        if purged > 0 {
            tracing::debug!(count = purged, "Purged idle rate-limit windows");
        }
        purged
    }

    /// Keys currently tracked
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}
