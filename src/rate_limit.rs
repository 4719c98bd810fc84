//! Fixed-window request counter keyed by destination.
//!
//! Each key gets a counter that resets once its window has elapsed. Because
//! the window is fixed rather than sliding, a burst straddling a boundary can
//! admit up to twice `max_requests` in a short span.
//!
//! Windows that have run out are swept at most once per window length, so
//! the map only holds keys seen within roughly the last two windows.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

#[derive(Clone, Copy, Debug)]
struct Window {
    count: u32,
    started_at: Instant,
}

/// Per-key fixed-window admission counter.
#[derive(Debug)]
pub struct RateLimiter {
    max_requests: u32,
    window: Duration,
    windows: HashMap<String, Window>,
    last_sweep: Option<Instant>,
}

impl RateLimiter {
    /// Admits at most `max_requests` per key in each `window`.
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            windows: HashMap::new(),
            last_sweep: None,
        }
    }

    /// Records one request for `key` and reports whether it is admitted.
    ///
    /// Rejected calls do not count against the window.
    pub fn is_allowed(&mut self, key: &str) -> bool {
        self.is_allowed_at(key, Instant::now())
    }

    fn is_allowed_at(&mut self, key: &str, now: Instant) -> bool {
        self.sweep_expired(now);

        let window = self.windows.entry(key.to_owned()).or_insert(Window {
            count: 0,
            started_at: now,
        });

        if now.saturating_duration_since(window.started_at) > self.window {
            window.count = 0;
            window.started_at = now;
        }

        if window.count >= self.max_requests {
            return false;
        }
        window.count += 1;
        true
    }

    /// Forgets every key's window.
    pub fn reset(&mut self) {
        self.windows.clear();
        self.last_sweep = None;
    }

    fn sweep_expired(&mut self, now: Instant) {
        let Some(last_sweep) = self.last_sweep else {
            self.last_sweep = Some(now);
            return;
        };
        if now.saturating_duration_since(last_sweep) <= self.window {
            return;
        }

        let window = self.window;
        self.windows
            .retain(|_, entry| now.saturating_duration_since(entry.started_at) <= window);
        self.last_sweep = Some(now);
    }
}
