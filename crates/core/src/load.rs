use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Advisory load signal: counts events within a sliding window and reports
/// high load when the count exceeds a threshold.
///
/// The snapshot scheduler consults this to defer optional work; no accuracy
/// guarantee is needed, so eviction happens lazily on access.
#[derive(Clone)]
pub struct LoadMonitor {
    window: Duration,
    threshold: usize,
    events: Arc<Mutex<VecDeque<Instant>>>,
}

impl LoadMonitor {
    pub fn new(window: Duration, threshold: usize) -> Self {
        Self {
            window,
            threshold,
            events: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    pub fn record(&self) {
        let now = Instant::now();
        let mut events = self.events.lock();
        Self::evict(&mut events, now, self.window);
        events.push_back(now);
    }

    pub fn is_under_high_load(&self) -> bool {
        let mut events = self.events.lock();
        Self::evict(&mut events, Instant::now(), self.window);
        events.len() > self.threshold
    }

    fn evict(events: &mut VecDeque<Instant>, now: Instant, window: Duration) {
        while let Some(front) = events.front() {
            if now.duration_since(*front) > window {
                events.pop_front();
            } else {
                break;
            }
        }
    }
}
