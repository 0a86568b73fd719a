// src/progress.rs

use std::sync::{Arc, Mutex};

/// Receives a percentage in `[0, 100]`. Values never decrease within one
/// download, but bursts and repeats are possible.
pub type ProgressFn = Arc<dyn Fn(f64) + Send + Sync>;

/// Byte counter shared by every chunk fetch of one session.
pub struct ProgressTracker {
    total: u64,
    state: Mutex<Counter>,
    callback: Option<ProgressFn>,
}

struct Counter {
    done: u64,
    last_percent: f64,
}

impl ProgressTracker {
    pub fn new(total: u64, callback: Option<ProgressFn>) -> Self {
        Self {
            total,
            state: Mutex::new(Counter { done: 0, last_percent: 0.0 }),
            callback,
        }
    }

    /// Credit `bytes` that are now on disk.
    pub fn add(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        // The callback runs under the lock so concurrent chunks report in order.
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.done = state.done.saturating_add(bytes).min(self.total);
        let percent = percent_of(state.done, self.total).max(state.last_percent);
        state.last_percent = percent;
        self.emit(percent);
    }

    /// Take back bytes that were discarded (a segment restarted from zero).
    /// The reported percentage holds until the counter catches up again.
    pub fn rewind(&self, bytes: u64) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.done = state.done.saturating_sub(bytes);
    }

    pub fn done(&self) -> u64 {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).done
    }

    /// Report 100% once the transfer is verified.
    pub fn finish(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.done = self.total;
        state.last_percent = 100.0;
        self.emit(100.0);
    }

    fn emit(&self, percent: f64) {
        if let Some(callback) = &self.callback {
            callback(percent);
        }
    }
}

fn percent_of(done: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (done as f64 * 100.0 / total as f64).clamp(0.0, 100.0)
}
