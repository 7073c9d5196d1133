//! De-duplicating work queue with per-key retry backoff.
//!
//! A key is handed to at most one worker at a time. Adding a key that is
//! currently being processed marks it dirty; it is queued again once the
//! worker reports it done.

use crate::error::SyncError;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

struct State<K> {
    queue: VecDeque<K>,
    queued: HashSet<K>,
    processing: HashSet<K>,
    dirty: HashSet<K>,
    failures: HashMap<K, u32>,
    shut_down: bool,
}

struct Inner<K> {
    state: Mutex<State<K>>,
    notify: Notify,
    retry_base: Duration,
    retry_max: Duration,
}

pub struct WorkQueue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    pub fn new(retry_base: Duration, retry_max: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    queued: HashSet::new(),
                    processing: HashSet::new(),
                    dirty: HashSet::new(),
                    failures: HashMap::new(),
                    shut_down: false,
                }),
                notify: Notify::new(),
                retry_base,
                retry_max,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<K>> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add(&self, key: K) {
        let mut state = self.lock();
        if state.shut_down {
            return;
        }
        if state.processing.contains(&key) {
            state.dirty.insert(key);
            return;
        }
        if state.queued.insert(key.clone()) {
            state.queue.push_back(key);
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Waits for the next key. `None` once the queue is shut down.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.shut_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.queued.remove(&key);
                    state.processing.insert(key.clone());
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        self.inner.notify.notify_one();
                    }
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Reports the outcome for a key obtained from [`WorkQueue::get`].
    ///
    /// `Retry` requeues the key after an exponential backoff; success and
    /// `Skip` reset its failure count.
    pub fn done(&self, key: K, result: &Result<(), SyncError>) {
        let mut state = self.lock();
        state.processing.remove(&key);

        match result {
            Err(SyncError::Retry(_)) => {
                let failures = state.failures.entry(key.clone()).or_insert(0);
                *failures += 1;
                let delay = backoff(self.inner.retry_base, self.inner.retry_max, *failures);
                let queue = self.clone();
                let retry = key.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    queue.add(retry);
                });
            }
            Ok(()) | Err(SyncError::Skip(_)) => {
                state.failures.remove(&key);
            }
        }

        if state.dirty.remove(&key) && !state.shut_down && state.queued.insert(key.clone()) {
            state.queue.push_back(key);
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Consecutive retryable failures recorded for `key`.
    pub fn failures(&self, key: &K) -> u32 {
        self.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Number of keys waiting for a worker.
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wakes every waiting worker with `None` and drops pending keys.
    pub fn shutdown(&self) {
        let mut state = self.lock();
        state.shut_down = true;
        state.queue.clear();
        state.queued.clear();
        state.dirty.clear();
        drop(state);
        self.inner.notify.notify_waiters();
    }
}

/// `base * 2^(failures - 1)`, capped at `max`.
pub(crate) fn backoff(base: Duration, max: Duration, failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(31);
    base.checked_mul(1u32 << exponent)
        .map_or(max, |delay| delay.min(max))
}
