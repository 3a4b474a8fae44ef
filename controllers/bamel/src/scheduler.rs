//! Reconciliation scheduler.
//!
//! A keyed work queue with the usual controller semantics:
//!
//! - `add` coalesces: a key already waiting is not queued twice
//! - a key is handed to at most one worker at a time; re-adds that arrive
//!   while it is being processed are parked and released by `done`
//! - `add_after` delays a key, keeping only the earliest pending deadline
//! - `add_rate_limited` delays by a per-key exponential backoff that
//!   `forget` resets
//!
//! `run` drives a bounded pool of workers over the queue, bounding every
//! handler invocation by a deadline.

use crate::backoff::ExponentialBackoff;
use crate::error::ControllerError;
use crate::metrics::Metrics;
use futures::FutureExt;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Display;
use std::future::Future;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// What a handler wants done with its key afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    /// Reconcile again after the given delay
    Requeue(Duration),
    /// Nothing more to do until the next event
    Done,
}

#[derive(Debug)]
struct QueueState<K> {
    queue: VecDeque<K>,
    /// Keys waiting to be processed (queued, or parked behind a worker)
    dirty: HashSet<K>,
    processing: HashSet<K>,
    failures: HashMap<K, u32>,
    /// Earliest pending `add_after` deadline per key
    scheduled: HashMap<K, Instant>,
    shutting_down: bool,
}

impl<K> Default for QueueState<K> {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            dirty: HashSet::new(),
            processing: HashSet::new(),
            failures: HashMap::new(),
            scheduled: HashMap::new(),
            shutting_down: false,
        }
    }
}

#[derive(Debug)]
pub struct WorkQueue<K> {
    name: &'static str,
    state: Mutex<QueueState<K>>,
    notify: Notify,
    backoff: ExponentialBackoff,
    metrics: Option<Arc<Metrics>>,
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Display + Send + Sync + 'static,
{
    pub fn new(name: &'static str, backoff: ExponentialBackoff) -> Self {
        Self {
            name,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            backoff,
            metrics: None,
        }
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<K>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish_depth(&self, depth: usize) {
        if let Some(metrics) = &self.metrics {
            metrics
                .queue_depth
                .with_label_values(&[self.name])
                .set(i64::try_from(depth).unwrap_or(i64::MAX));
        }
    }

    /// Queue `key` for processing.
    pub fn add(&self, key: K) {
        let depth = {
            let mut state = self.lock();
            if state.shutting_down || state.dirty.contains(&key) {
                return;
            }
            state.dirty.insert(key.clone());
            if state.processing.contains(&key) {
                // Parked; `done` releases it.
                return;
            }
            state.queue.push_back(key);
            state.queue.len()
        };
        self.publish_depth(depth);
        self.notify.notify_one();
    }

    /// Queue `key` once `delay` has elapsed.
    pub fn add_after(self: &Arc<Self>, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let deadline = Instant::now() + delay;
        {
            let mut state = self.lock();
            if state.shutting_down {
                return;
            }
            if let Some(existing) = state.scheduled.get(&key) {
                if *existing <= deadline {
                    return;
                }
            }
            state.scheduled.insert(key.clone(), deadline);
        }

        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            {
                let mut state = queue.lock();
                if state.scheduled.get(&key) != Some(&deadline) {
                    // Superseded by an earlier deadline.
                    return;
                }
                state.scheduled.remove(&key);
            }
            queue.add(key);
        });
    }

    /// Queue `key` after its backoff delay, counting one more failure.
    pub fn add_rate_limited(self: &Arc<Self>, key: K) {
        let failures = {
            let mut state = self.lock();
            let count = state.failures.entry(key.clone()).or_insert(0);
            *count = count.saturating_add(1);
            *count
        };
        let delay = self.backoff.delay_for(failures);
        debug!(queue = self.name, key = %key, failures, delay = ?delay, "Requeue with backoff");
        self.add_after(key, delay);
    }

    /// Reset the failure count of `key`.
    pub fn forget(&self, key: &K) {
        self.lock().failures.remove(key);
    }

    /// Consecutive failures recorded for `key`.
    #[cfg(test)]
    pub fn failures(&self, key: &K) -> u32 {
        self.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Wait for the next key. Returns `None` once the queue shuts down.
    pub async fn next(&self) -> Option<K> {
        loop {
            let picked = {
                let mut state = self.lock();
                if state.shutting_down {
                    None
                } else if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    Some(Some((key, !state.queue.is_empty(), state.queue.len())))
                } else {
                    Some(None)
                }
            };
            match picked {
                None => {
                    // Pass the wake-up on to the next idle worker.
                    self.notify.notify_one();
                    return None;
                }
                Some(Some((key, more, depth))) => {
                    self.publish_depth(depth);
                    if more {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
                Some(None) => self.notify.notified().await,
            }
        }
    }

    /// Mark `key` as processed, releasing a parked re-add.
    pub fn done(&self, key: &K) {
        let released = {
            let mut state = self.lock();
            state.processing.remove(key);
            if state.dirty.contains(key) && !state.shutting_down {
                state.queue.push_back(key.clone());
                Some(state.queue.len())
            } else {
                None
            }
        };
        if let Some(depth) = released {
            self.publish_depth(depth);
            self.notify.notify_one();
        }
    }

    /// Stop handing out keys. Workers finish their current key and exit.
    pub fn shutdown(&self) {
        self.lock().shutting_down = true;
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    /// Keys waiting to be handed out.
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Nothing queued, processing, or scheduled.
    #[cfg(test)]
    pub fn is_idle(&self) -> bool {
        let state = self.lock();
        state.queue.is_empty() && state.processing.is_empty() && state.scheduled.is_empty()
    }

    /// Run `workers` concurrent workers until the queue shuts down.
    ///
    /// Each handler call is bounded by `timeout`; errors, timeouts and
    /// panics all count as failures and requeue with backoff.
    pub async fn run<H, Fut>(self: Arc<Self>, workers: usize, timeout: Duration, handler: H)
    where
        H: Fn(K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ReconcileAction, ControllerError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let mut set = JoinSet::new();

        for worker in 0..workers {
            let queue = Arc::clone(&self);
            let handler = Arc::clone(&handler);
            set.spawn(async move {
                while let Some(key) = queue.next().await {
                    let call = AssertUnwindSafe(handler(key.clone())).catch_unwind();
                    let outcome = match tokio::time::timeout(timeout, call).await {
                        Ok(Ok(result)) => result,
                        Ok(Err(_)) => Err(ControllerError::Watch(format!("handler panicked for {key}"))),
                        Err(_) => Err(ControllerError::Timeout(timeout)),
                    };
                    queue.finish(key, worker, outcome);
                }
                debug!(queue = queue.name, worker, "Worker stopped");
            });
        }

        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                error!(queue = self.name, error = %e, "Worker task failed");
            }
        }
    }

    fn finish(self: &Arc<Self>, key: K, worker: usize, outcome: Result<ReconcileAction, ControllerError>) {
        let result = match &outcome {
            Ok(_) => "success",
            Err(ControllerError::Conflict(_)) => "conflict",
            Err(ControllerError::Timeout(_)) => "timeout",
            Err(_) => "error",
        };
        if let Some(metrics) = &self.metrics {
            metrics.reconciliations.with_label_values(&[self.name, result]).inc();
        }

        match outcome {
            Ok(ReconcileAction::Done) => self.forget(&key),
            Ok(ReconcileAction::Requeue(delay)) => {
                self.forget(&key);
                self.add_after(key.clone(), delay);
            }
            Err(e) => {
                warn!(queue = self.name, worker, key = %key, error = %e, "Reconciliation failed");
                self.add_rate_limited(key.clone());
            }
        }
        self.done(&key);
    }
}
