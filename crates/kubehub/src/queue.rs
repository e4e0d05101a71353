//! Coalescing work queue keyed by canonical object key.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use rustc_hash::{FxHashMap, FxHashSet};

const MAX_PROCESS_RETRY: u32 = 6;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(250);

/// FIFO queue that collapses repeated enqueues of the same key until a worker
/// picks it up, and rate-limits re-queued failures.
#[derive(Default)]
pub(crate) struct KeyQueue {
    order: VecDeque<String>,
    pending: FxHashSet<String>,
    retries: FxHashMap<String, Retry>,
}

struct Retry {
    attempts: u32,
    not_before: Instant,
}

impl KeyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a key. A key already waiting is not queued twice.
    pub fn add(&mut self, key: String) {
        if self.pending.insert(key.clone()) {
            self.order.push_back(key);
        }
    }

    /// Next key whose retry delay (if any) has elapsed. Delayed keys are
    /// rotated to the back; per-key order is unaffected since a key is
    /// queued at most once.
    pub fn pop_ready(&mut self) -> Option<String> {
        let now = Instant::now();
        for _ in 0..self.order.len() {
            let key = self.order.pop_front()?;
            match self.retries.get(&key) {
                Some(r) if r.not_before > now => self.order.push_back(key),
                _ => {
                    self.pending.remove(&key);
                    return Some(key);
                }
            }
        }
        None
    }

    /// Record a processing failure. Returns true when the key was re-queued,
    /// false when it exceeded the retry limit and was dropped.
    pub fn retry(&mut self, key: &str) -> bool {
        let attempts = self.retries.get(key).map(|r| r.attempts).unwrap_or(0) + 1;
        if attempts > MAX_PROCESS_RETRY {
            self.retries.remove(key);
            return false;
        }
        let delay = RETRY_BASE_DELAY * 2u32.saturating_pow(attempts);
        self.retries.insert(key.to_string(), Retry { attempts, not_before: Instant::now() + delay });
        self.add(key.to_string());
        true
    }

    /// Clear retry state after a success.
    pub fn forget(&mut self, key: &str) {
        self.retries.remove(key);
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
