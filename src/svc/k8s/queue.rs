//! # Queue module
//!
//! This module provide the rate-limited typed work queue backing every
//! controller, items in flight are de-duplicated by key

use std::{
    collections::{HashMap, HashSet, VecDeque},
    hash::Hash,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::{sync::Notify, time::Instant};

// -----------------------------------------------------------------------------
// Constants

pub const MIN_RETRY_DELAY: Duration = Duration::from_millis(5);
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(1000);
pub const BUCKET_RATE: f64 = 10.0;
pub const BUCKET_BURST: f64 = 100.0;

// -----------------------------------------------------------------------------
// Queue structure

struct QueueState<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    shutdown: bool,
}

/// a typed work queue with the usual de-duplication contract, an item added
/// while queued is dropped, an item added while processing is re-queued once
/// its processing completes
pub struct Queue<K> {
    state: Mutex<QueueState<K>>,
    notify: Notify,
}

impl<K> Default for Queue<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> Queue<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                shutdown: false,
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<K>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// add the item unless it is already queued, items being processed are
    /// remembered and re-queued on [`Queue::done`]
    pub fn add(&self, item: K) {
        let mut state = self.lock();
        if state.shutdown || state.dirty.contains(&item) {
            return;
        }

        state.dirty.insert(item.to_owned());
        if state.processing.contains(&item) {
            return;
        }

        state.queue.push_back(item);
        drop(state);
        self.notify.notify_one();
    }

    /// add the item after the given delay, bypassing any rate limiter
    pub fn add_after(self: &Arc<Self>, item: K, delay: Duration)
    where
        K: Send + 'static,
    {
        if delay.is_zero() {
            self.add(item);
            return;
        }

        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(item);
        });
    }

    /// wait for the next item, `None` once the queue is shut down and
    /// drained
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();

            {
                let mut state = self.lock();
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.to_owned());
                    return Some(item);
                }

                if state.shutdown {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// mark the item's processing complete, re-queueing it if it was added
    /// in the meantime
    pub fn done(&self, item: &K) {
        let mut state = self.lock();
        state.processing.remove(item);

        if state.dirty.contains(item) && !state.shutdown {
            state.queue.push_back(item.to_owned());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// close the queue, workers drain in-flight items then observe `None`
    pub fn shut_down(&self) {
        self.lock().shutdown = true;
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().queue.is_empty()
    }
}

// -----------------------------------------------------------------------------
// Bucket structure

/// token bucket capping the overall re-enqueue rate, reservations may push
/// the token count negative which translates into a delay
struct Bucket {
    rate: f64,
    burst: f64,
    tokens: f64,
    refreshed: Instant,
}

impl Bucket {
    fn reserve(&mut self, now: Instant) -> Duration {
        let elapsed = now.saturating_duration_since(self.refreshed).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        self.refreshed = now;
        self.tokens -= 1.0;

        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.rate)
        }
    }
}

// -----------------------------------------------------------------------------
// RateLimiter structure

/// per-item exponential backoff combined with the bucket limiter, the
/// effective delay is the maximum of both
pub struct RateLimiter<K> {
    failures: Mutex<HashMap<K, u32>>,
    bucket: Mutex<Bucket>,
    base: Duration,
    max: Duration,
}

impl<K> Default for RateLimiter<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new(MIN_RETRY_DELAY, MAX_RETRY_DELAY, BUCKET_RATE, BUCKET_BURST)
    }
}

impl<K> RateLimiter<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new(base: Duration, max: Duration, rate: f64, burst: f64) -> Self {
        Self {
            failures: Mutex::new(HashMap::new()),
            bucket: Mutex::new(Bucket {
                rate,
                burst,
                tokens: burst,
                refreshed: Instant::now(),
            }),
            base,
            max,
        }
    }

    /// returns the delay to wait before re-enqueueing the item and records
    /// one more failure
    pub fn when(&self, item: &K) -> Duration {
        let exponent = {
            let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
            let count = failures.entry(item.to_owned()).or_insert(0);
            let exponent = *count;
            *count += 1;
            exponent
        };

        let backoff = self
            .base
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max);

        let bucket = self
            .bucket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reserve(Instant::now());

        backoff.max(bucket)
    }

    /// forget the item's failure history, called on successful reconcile
    pub fn forget(&self, item: &K) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(item);
    }

    pub fn retries(&self, item: &K) -> u32 {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(item)
            .copied()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_should_deduplicate_queued_items() {
        let queue = Queue::new();
        queue.add("a");
        queue.add("a");
        queue.add("b");

        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn items_added_while_processing_should_requeue_on_done() {
        let queue = Queue::new();
        queue.add("a");

        let item = queue.get().await.expect("item to be available");
        assert_eq!(item, "a");
        assert!(queue.is_empty());

        // arrives while "a" is being processed
        queue.add("a");
        assert!(queue.is_empty());

        queue.done(&item);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn shutdown_should_drain_then_close() {
        let queue = Queue::new();
        queue.add("a");
        queue.shut_down();

        assert_eq!(queue.get().await, Some("a"));
        assert_eq!(queue.get().await, None);
    }

    #[tokio::test]
    async fn get_should_wake_up_on_add() {
        let queue = Arc::new(Queue::new());
        let waiter = {
            let queue = queue.to_owned();
            tokio::spawn(async move { queue.get().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.add("a");

        assert_eq!(waiter.await.expect("waiter to finish"), Some("a"));
    }

    #[tokio::test]
    async fn add_after_should_bypass_the_limiter() {
        tokio::time::pause();
        let queue = Arc::new(Queue::new());
        queue.add_after("a", Duration::from_secs(5));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(queue.get().await, Some("a"));
    }

    #[test]
    fn backoff_should_double_up_to_the_cap() {
        let limiter: RateLimiter<&str> = RateLimiter::new(
            Duration::from_millis(5),
            Duration::from_secs(1000),
            1e9,
            1e9,
        );

        assert_eq!(limiter.when(&"a"), Duration::from_millis(5));
        assert_eq!(limiter.when(&"a"), Duration::from_millis(10));
        assert_eq!(limiter.when(&"a"), Duration::from_millis(20));
        assert_eq!(limiter.retries(&"a"), 3);

        // another item has its own history
        assert_eq!(limiter.when(&"b"), Duration::from_millis(5));

        for _ in 0..32 {
            limiter.when(&"a");
        }
        assert_eq!(limiter.when(&"a"), Duration::from_secs(1000));

        limiter.forget(&"a");
        assert_eq!(limiter.when(&"a"), Duration::from_millis(5));
    }

    #[test]
    fn bucket_should_meter_once_burst_is_spent() {
        let mut bucket = Bucket {
            rate: 10.0,
            burst: 2.0,
            tokens: 2.0,
            refreshed: Instant::now(),
        };
        let now = bucket.refreshed;

        assert_eq!(bucket.reserve(now), Duration::ZERO);
        assert_eq!(bucket.reserve(now), Duration::ZERO);
        // burst exhausted, the third reservation waits one tick
        assert_eq!(bucket.reserve(now), Duration::from_millis(100));
        assert_eq!(bucket.reserve(now), Duration::from_millis(200));

        // a second later the bucket has refilled
        assert_eq!(bucket.reserve(now + Duration::from_secs(1)), Duration::ZERO);
    }
}
