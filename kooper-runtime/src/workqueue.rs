//! A work queue that deduplicates keys and never hands the same key to two workers
//!
//! Keys move through three sets:
//! - *queued*: waiting to be handed out by [`WorkQueue::get`];
//! - *processing*: handed out and not yet [`WorkQueue::done`];
//! - *dirty*: added since they were last handed out.
//!
//! Adding a key that is already queued is a no-op. Adding a key that is being processed
//! marks it dirty, and it is queued again once the current worker calls `done`, so a
//! key is never processed concurrently and no change is lost.
use std::{
    collections::VecDeque,
    hash::Hash,
    sync::{Arc, Weak},
    time::Duration,
};

use ahash::{AHashMap, AHashSet};
use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use educe::Educe;
use futures::{stream, StreamExt};
use parking_lot::Mutex;
use tokio::{
    sync::{mpsc, Notify},
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use crate::scheduler::{delaying, DelayRequest};

/// Delay before the first retry of a failing key.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);
/// Upper bound on the delay between retries of a failing key.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

/// Shared handle to a work queue
#[derive(Educe)]
#[educe(Clone)]
pub struct WorkQueue<K> {
    inner: Arc<Inner<K>>,
}

struct Inner<K> {
    state: Mutex<State<K>>,
    ready: Notify,
    delayed: mpsc::UnboundedSender<DelayRequest<K>>,
    limiter: Mutex<RateLimiter<K>>,
    shutdown: CancellationToken,
}

struct State<K> {
    queue: VecDeque<K>,
    dirty: AHashSet<K>,
    processing: AHashSet<K>,
    shutting_down: bool,
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    /// Create a queue retrying failing keys after 5ms, doubling up to 1000s
    ///
    /// Must be called from within a Tokio runtime, which drives the delayed adds.
    #[must_use]
    pub fn new() -> Self {
        Self::with_backoff(
            ExponentialBuilder::default()
                .with_min_delay(DEFAULT_BASE_DELAY)
                .with_max_delay(DEFAULT_MAX_DELAY)
                .with_factor(2.0)
                .with_max_times(usize::MAX),
        )
    }

    /// Create a queue using custom per-key retry delays
    ///
    /// Once `backoff` runs out of delays, failing keys are retried after [`DEFAULT_MAX_DELAY`].
    #[must_use]
    pub fn with_backoff(backoff: ExponentialBuilder) -> Self {
        let (delayed_tx, delayed_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                dirty: AHashSet::new(),
                processing: AHashSet::new(),
                shutting_down: false,
            }),
            ready: Notify::new(),
            delayed: delayed_tx,
            limiter: Mutex::new(RateLimiter::new(backoff)),
            shutdown: CancellationToken::new(),
        });
        tokio::spawn(forward_delayed(
            Arc::downgrade(&inner),
            delayed_rx,
            inner.shutdown.clone(),
        ));
        Self { inner }
    }

    /// Queue `key` unless it is already waiting
    ///
    /// Ignored once the queue is shut down.
    pub fn add(&self, key: K) {
        let mut state = self.inner.state.lock();
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }
        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            // queued again by `done`
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.inner.ready.notify_one();
    }

    /// Wait for the next key
    ///
    /// The key counts as processing until it is passed to [`WorkQueue::done`].
    /// Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.inner.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.inner.state.lock();
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

    /// Mark `key` as no longer being processed
    ///
    /// If it was added while processing, it is queued again.
    pub fn done(&self, key: &K) {
        let mut state = self.inner.state.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.clone());
            drop(state);
            self.inner.ready.notify_one();
        }
    }

    /// Queue `key` once `delay` has passed
    pub fn add_after(&self, key: K, delay: Duration) {
        if self.inner.state.lock().shutting_down {
            return;
        }
        if delay.is_zero() {
            return self.add(key);
        }
        let request = DelayRequest {
            item: key,
            ready_at: Instant::now() + delay,
        };
        if self.inner.delayed.send(request).is_err() {
            tracing::debug!("delayed add dropped, queue is shutting down");
        }
    }

    /// Queue `key` after its next backoff delay, counting a requeue
    pub fn add_rate_limited(&self, key: K) {
        let delay = self.inner.limiter.lock().when(&key);
        self.add_after(key, delay);
    }

    /// Number of rate limited requeues of `key` since it was last forgotten
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.inner.limiter.lock().requeues(key)
    }

    /// Reset the backoff and requeue count of `key`
    pub fn forget(&self, key: &K) {
        self.inner.limiter.lock().forget(key);
    }

    /// Stop handing out keys and wake all waiting workers
    pub fn shut_down(&self) {
        self.inner.state.lock().shutting_down = true;
        self.inner.shutdown.cancel();
        self.inner.ready.notify_waiters();
    }

    /// Whether [`WorkQueue::shut_down`] was called
    pub fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().shutting_down
    }

    /// Number of keys waiting to be handed out
    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Whether no keys are waiting to be handed out
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Feed keys whose delay expired back into the queue, until it is shut down or dropped.
async fn forward_delayed<K>(
    queue: Weak<Inner<K>>,
    requests: mpsc::UnboundedReceiver<DelayRequest<K>>,
    shutdown: CancellationToken,
) where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    let requests = stream::unfold(requests, |mut rx| async move { rx.recv().await.map(|req| (req, rx)) });
    let delayed = delaying(requests);
    tokio::pin!(delayed);
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            key = delayed.next() => match (key, queue.upgrade()) {
                (Some(key), Some(inner)) => WorkQueue { inner }.add(key),
                _ => break,
            },
        }
    }
}

/// Per-key exponential backoff
struct RateLimiter<K> {
    backoff: ExponentialBuilder,
    failures: AHashMap<K, Failures>,
}

struct Failures {
    delays: ExponentialBackoff,
    requeues: u32,
}

impl<K: Eq + Hash + Clone> RateLimiter<K> {
    fn new(backoff: ExponentialBuilder) -> Self {
        Self {
            backoff,
            failures: AHashMap::new(),
        }
    }

    fn when(&mut self, key: &K) -> Duration {
        let backoff = &self.backoff;
        let failures = self.failures.entry(key.clone()).or_insert_with(|| Failures {
            delays: backoff.clone().build(),
            requeues: 0,
        });
        failures.requeues = failures.requeues.saturating_add(1);
        failures.delays.next().unwrap_or(DEFAULT_MAX_DELAY)
    }

    fn requeues(&self, key: &K) -> u32 {
        self.failures.get(key).map_or(0, |f| f.requeues)
    }

    fn forget(&mut self, key: &K) {
        self.failures.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::WorkQueue;
    use futures::{poll, FutureExt};
    use std::time::Duration;
    use tokio::time::{advance, pause};

    #[tokio::test]
    async fn duplicate_adds_are_collapsed() {
        let queue = WorkQueue::new();
        queue.add("a");
        queue.add("b");
        queue.add("a");
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.get().await, Some("a"));
        assert_eq!(queue.get().await, Some("b"));
        assert!(queue.get().now_or_never().is_none());
    }

    #[tokio::test]
    async fn keys_added_while_processing_come_back_after_done() {
        let queue = WorkQueue::new();
        queue.add("a");
        let key = queue.get().await.unwrap();
        queue.add("a");
        queue.add("a");
        // not handed to a second worker while the first holds it
        assert!(queue.is_empty());
        queue.done(&key);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await, Some("a"));
        queue.done(&"a");
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn get_wakes_on_add() {
        let queue = WorkQueue::new();
        let mut next = Box::pin(queue.get());
        assert!(poll!(next.as_mut()).is_pending());
        queue.add(1_u32);
        assert_eq!(next.await, Some(1));
    }

    #[tokio::test]
    async fn shut_down_releases_waiting_workers() {
        let queue = WorkQueue::<u32>::new();
        let waiting = tokio::spawn({
            let queue = queue.clone();
            async move { queue.get().await }
        });
        tokio::task::yield_now().await;
        queue.shut_down();
        assert_eq!(waiting.await.unwrap(), None);
        queue.add(1);
        assert!(queue.is_empty());
        assert!(queue.is_shutting_down());
    }

    #[tokio::test]
    async fn add_after_waits_for_the_delay() {
        pause();
        let queue = WorkQueue::new();
        queue.add_after("a", Duration::from_secs(2));
        tokio::task::yield_now().await;
        assert!(queue.is_empty());
        advance(Duration::from_secs(3)).await;
        assert_eq!(queue.get().await, Some("a"));
    }

    #[tokio::test]
    async fn rate_limited_adds_back_off_exponentially() {
        pause();
        let queue = WorkQueue::new();
        for expected in 1..=4 {
            queue.add_rate_limited("a");
            assert_eq!(queue.num_requeues(&"a"), expected);
        }
        // requeues of other keys are tracked separately
        assert_eq!(queue.num_requeues(&"b"), 0);
        queue.forget(&"a");
        assert_eq!(queue.num_requeues(&"a"), 0);
        advance(Duration::from_millis(10)).await;
        assert_eq!(queue.get().await, Some("a"));
    }
}
