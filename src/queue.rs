//! Deduplicating, rate-limited work queue
//!
//! Watch streams push keys, workers pull them. The queue guarantees:
//! - a key that is already pending is never queued twice
//! - a key that is being processed is never handed to a second worker; adding
//!   it again marks it dirty and it is re-queued once the worker calls
//!   [`WorkQueue::done`]
//! - failed keys can be re-added after a per-key exponential delay
//!
//! There is no ordering across keys.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::trace;

use crate::retry::RetryConfig;

struct QueueState<K> {
    /// Keys ready to be handed out, in arrival order
    queue: VecDeque<K>,
    /// Keys that need processing (queued, or re-added while processing)
    dirty: HashSet<K>,
    /// Keys currently held by a worker
    processing: HashSet<K>,
    /// Consecutive failures per key
    failures: HashMap<K, u32>,
    shutting_down: bool,
}

/// Work queue keyed by `K`
pub struct WorkQueue<K> {
    state: Mutex<QueueState<K>>,
    notify: Notify,
    backoff: RetryConfig,
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    /// Create a queue whose rate-limited re-adds follow `backoff`
    pub fn new(backoff: RetryConfig) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                failures: HashMap::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
            backoff,
        })
    }

    /// Mark a key as needing processing
    pub fn add(&self, key: K) {
        {
            let mut state = self.state.lock();
            if state.shutting_down || !state.dirty.insert(key.clone()) {
                return;
            }
            if state.processing.contains(&key) {
                return;
            }
            state.queue.push_back(key);
        }
        self.notify.notify_one();
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    ///
    /// The returned key must be passed to [`Self::done`] when processing ends.
    pub async fn get(&self) -> Option<K> {
        loop {
            // Register as a waiter before checking, so an add or a shutdown
            // between the check and the await still wakes this worker.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Release a key taken with [`Self::get`], re-queueing it if it was
    /// added again in the meantime
    pub fn done(&self, key: &K) {
        let requeued = {
            let mut state = self.state.lock();
            state.processing.remove(key);
            if !state.shutting_down && state.dirty.contains(key) {
                state.queue.push_back(key.clone());
                true
            } else {
                false
            }
        };
        if requeued {
            self.notify.notify_one();
        }
    }

    /// Re-add a key after the backoff delay for its failure count
    ///
    /// Returns the chosen delay, or `None` if the queue is shutting down.
    pub fn add_rate_limited(self: &Arc<Self>, key: K) -> Option<Duration> {
        let delay = {
            let mut state = self.state.lock();
            if state.shutting_down {
                return None;
            }
            let failures = state.failures.entry(key.clone()).or_insert(0);
            *failures += 1;
            self.backoff.delay_for_attempt(*failures)
        };

        trace!(delay_ms = delay.as_millis() as u64, "scheduling rate-limited requeue");
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
        Some(delay)
    }

    /// Reset the failure count of a key
    pub fn forget(&self, key: &K) {
        self.state.lock().failures.remove(key);
    }

    /// Number of rate-limited re-adds since the key was last forgotten
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.state.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Number of keys waiting to be handed out
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Whether no key is waiting to be handed out
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop handing out keys and wake every waiting worker
    pub fn shutdown(&self) {
        self.state.lock().shutting_down = true;
        self.notify.notify_waiters();
    }
}
