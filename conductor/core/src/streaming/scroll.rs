//! Scroll Notifications
//!
//! Delayed, coalescing "scroll the transcript into view" notifications for the
//! UI. Any number of requests made before the delay elapses collapse into one
//! call of the injected callback.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

/// Callback invoked when the visible message list should scroll to the bottom
pub type ScrollCallback = Arc<dyn Fn() + Send + Sync>;

/// Schedules [`ScrollCallback`] invocations
pub struct ScrollScheduler {
    delay: Duration,
    callback: Option<ScrollCallback>,
    pending: Option<Instant>,
    fired: u64,
}

impl ScrollScheduler {
    /// Create a scheduler firing `delay` after the first pending request
    #[must_use]
    pub fn new(delay: Duration, callback: Option<ScrollCallback>) -> Self {
        Self {
            delay,
            callback,
            pending: None,
            fired: 0,
        }
    }

    /// Replace the callback
    pub fn set_callback(&mut self, callback: Option<ScrollCallback>) {
        self.callback = callback;
    }

    /// Request a notification; coalesced with one already pending
    pub fn request(&mut self, now: Instant) {
        if self.pending.is_none() {
            self.pending = Some(now + self.delay);
        }
    }

    /// Whether a notification is waiting to fire
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// When the pending notification is due
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.pending
    }

    /// Fire the notification if it is due
    ///
    /// Returns `true` if the callback ran (or would have, with no callback set).
    pub fn poll(&mut self, now: Instant) -> bool {
        match self.pending {
            Some(due) if due <= now => {
                self.pending = None;
                self.fired += 1;
                if let Some(callback) = &self.callback {
                    callback();
                }
                true
            }
            _ => false,
        }
    }

    /// Drop any pending notification
    pub fn cancel(&mut self) {
        self.pending = None;
    }

    /// Notifications delivered so far
    #[must_use]
    pub fn fired(&self) -> u64 {
        self.fired
    }
}

impl fmt::Debug for ScrollScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScrollScheduler")
            .field("delay", &self.delay)
            .field("has_callback", &self.callback.is_some())
            .field("pending", &self.pending)
            .field("fired", &self.fired)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_requests_coalesce_into_one_call() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut scroll = ScrollScheduler::new(
            Duration::from_millis(50),
            Some(Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        );

        let start = Instant::now();
        scroll.request(start);
        scroll.request(start + Duration::from_millis(10));
        scroll.request(start + Duration::from_millis(20));

        assert!(!scroll.poll(start + Duration::from_millis(49)));
        assert!(scroll.poll(start + Duration::from_millis(50)));
        assert!(!scroll.poll(start + Duration::from_millis(100)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(scroll.fired(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_drops_pending() {
        let mut scroll = ScrollScheduler::new(Duration::from_millis(50), None);
        let start = Instant::now();
        scroll.request(start);
        scroll.cancel();
        assert!(!scroll.poll(start + Duration::from_secs(1)));
        assert_eq!(scroll.fired(), 0);
    }
}
