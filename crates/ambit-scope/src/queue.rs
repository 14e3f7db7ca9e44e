// Keyed work queue with per-key rate-limited requeues.
//
// Semantics: a key added while already queued is coalesced; a key added
// while being processed is queued again once processing finishes. This is
// what lets the resolver run a single worker and still guarantee per-key
// event ordering without holding locks across suspension points.
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

// Exponential per-key failure backoff.
const BASE_DELAY: Duration = Duration::from_millis(5);
const MAX_DELAY: Duration = Duration::from_secs(1000);

#[derive(Debug, Default)]
struct QueueState {
    queue: VecDeque<String>,
    // Keys waiting in `queue` or needing a re-run after processing.
    dirty: HashSet<String>,
    // Keys currently handed out to the worker.
    processing: HashSet<String>,
    // Consecutive failures per key, reset by `forget`.
    failures: HashMap<String, u32>,
    shutting_down: bool,
}

#[derive(Debug, Default)]
struct QueueInner {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl QueueInner {
    fn add(&self, key: String) {
        {
            let mut state = self.state.lock().expect("queue lock poisoned");
            if state.shutting_down || state.dirty.contains(&key) {
                return;
            }
            state.dirty.insert(key.clone());
            if state.processing.contains(&key) {
                // Re-queued by `done` once the in-flight run finishes.
                return;
            }
            state.queue.push_back(key);
        }
        self.notify.notify_one();
    }
}

/// Deduplicating keyed queue for a single worker. Cheap to clone; clones
/// share the same queue.
#[derive(Debug, Clone, Default)]
pub struct KeyedQueue {
    inner: Arc<QueueInner>,
}

impl KeyedQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues a key unless it is already pending. No-op after shutdown.
    pub fn add(&self, key: impl Into<String>) {
        self.inner.add(key.into());
    }

    /// Waits for the next key. Returns None once the queue is shut down and
    /// drained; in-flight work is unaffected.
    pub async fn get(&self) -> Option<String> {
        loop {
            {
                let mut state = self.inner.state.lock().expect("queue lock poisoned");
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }
            // notify_one stores a permit when nobody is waiting yet, so an
            // add racing this gap cannot be lost.
            self.inner.notify.notified().await;
        }
    }

    /// Marks a key's processing run finished, re-queueing it if it was
    /// added again in the meantime.
    pub fn done(&self, key: &str) {
        let requeued = {
            let mut state = self.inner.state.lock().expect("queue lock poisoned");
            state.processing.remove(key);
            if state.dirty.contains(key) && !state.shutting_down {
                state.queue.push_back(key.to_string());
                true
            } else {
                false
            }
        };
        if requeued {
            self.inner.notify.notify_one();
        }
    }

    /// Clears a key's failure history.
    pub fn forget(&self, key: &str) {
        self.inner
            .state
            .lock()
            .expect("queue lock poisoned")
            .failures
            .remove(key);
    }

    /// Re-adds a key after its per-key backoff delay.
    pub fn requeue_rate_limited(&self, key: &str) {
        let delay = {
            let mut state = self.inner.state.lock().expect("queue lock poisoned");
            if state.shutting_down {
                return;
            }
            let failures = state.failures.entry(key.to_string()).or_insert(0);
            *failures += 1;
            backoff_delay(*failures)
        };
        let inner = Arc::clone(&self.inner);
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.add(key);
        });
    }

    /// Consecutive failure count for a key.
    pub fn failures(&self, key: &str) -> u32 {
        self.inner
            .state
            .lock()
            .expect("queue lock poisoned")
            .failures
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// Stops the queue: new adds are ignored, waiters are released once the
    /// backlog drains.
    pub fn shut_down(&self) {
        self.inner
            .state
            .lock()
            .expect("queue lock poisoned")
            .shutting_down = true;
        self.inner.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.inner
            .state
            .lock()
            .expect("queue lock poisoned")
            .queue
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn backoff_delay(failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(63);
    BASE_DELAY
        .saturating_mul(2u32.saturating_pow(exp))
        .min(MAX_DELAY)
}
