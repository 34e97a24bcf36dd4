//! Fixed-window rate limiter for the token endpoints.
//!
//! Tracks request counts per subject in one-minute windows. Exceeding the
//! budget answers `429 rate-limited`. State is in-memory and per-instance;
//! the window resets on restart, which is acceptable for an abuse brake.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::warn;

/// Default requests allowed per subject per window.
const DEFAULT_LIMIT: u32 = 30;

/// Window length.
const WINDOW: Duration = Duration::from_secs(60);

struct WindowState {
    started: Instant,
    count: u32,
}

/// Per-subject fixed-window limiter.
pub struct RateLimiter {
    limit: u32,
    windows: Mutex<HashMap<String, WindowState>>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Record a request for `subject`. Returns `false` when over budget.
    pub fn check(&self, subject: &str) -> bool {
        let now = Instant::now();
        let mut windows = self.windows.lock().unwrap_or_else(|poisoned| {
            warn!("rate limiter mutex poisoned; recovering");
            poisoned.into_inner()
        });

        // Opportunistic cleanup keeps the map from growing unbounded.
        if windows.len() > 4096 {
            windows.retain(|_, w| now.duration_since(w.started) < WINDOW);
        }

        let window = windows.entry(subject.to_owned()).or_insert(WindowState {
            started: now,
            count: 0,
        });
        if now.duration_since(window.started) >= WINDOW {
            window.started = now;
            window.count = 0;
        }
        window.count = window.count.saturating_add(1);
        window.count <= self.limit
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_LIMIT)
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("limit", &self.limit)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_the_limit() {
        let limiter = RateLimiter::new(3);
        assert!(limiter.check("a"));
        assert!(limiter.check("a"));
        assert!(limiter.check("a"));
        assert!(!limiter.check("a"));
    }

    #[test]
    fn subjects_have_independent_windows() {
        let limiter = RateLimiter::new(1);
        assert!(limiter.check("a"));
        assert!(!limiter.check("a"));
        assert!(limiter.check("b"));
    }
}
