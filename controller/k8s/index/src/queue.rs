use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use parking_lot::Mutex;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{family::Family, gauge::Gauge},
    registry::Registry,
};
use std::{collections::VecDeque, sync::Arc, time::Duration};
use tokio::{sync::Notify, time};

/// Prefix marking a key as the tombstone of an object that no longer exists.
/// The reconciler branches into cleanup without re-reading the object.
pub const DELETED_PREFIX: &str = "DELETED:";

const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);
const DEFAULT_QPS: f64 = 10.0;
const DEFAULT_BURST: f64 = 100.0;

/// A rate-limited work queue of `<namespace>/<name>` keys.
///
/// Re-adding a key that is already pending collapses into the existing
/// entry; re-adding a key that is in flight marks it dirty so it is
/// processed once more after the current pass completes. Within a single
/// key, processing is therefore serialized.
#[derive(Clone)]
pub struct Queue {
    inner: Arc<Inner>,
}

struct Inner {
    name: &'static str,
    limiter: RateLimiter,
    notify: Notify,
    state: Mutex<State>,
    depth: Gauge,
}

#[derive(Default)]
struct State {
    ready: VecDeque<String>,
    pending: HashSet<String>,
    in_flight: HashSet<String>,
    dirty: HashSet<String>,
    shut_down: bool,
}

impl Queue {
    pub fn new(name: &'static str, limiter: RateLimiter, metrics: &QueueMetrics) -> Self {
        Self {
            inner: Arc::new(Inner {
                name,
                limiter,
                notify: Notify::new(),
                state: Mutex::new(State::default()),
                depth: metrics.depth_gauge(name),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    /// Enqueues a key for processing.
    pub fn add(&self, key: impl Into<String>) {
        let key = key.into();
        {
            let mut state = self.inner.state.lock();
            if state.shut_down || state.pending.contains(&key) {
                return;
            }
            if state.in_flight.contains(&key) {
                state.dirty.insert(key);
                return;
            }
            state.pending.insert(key.clone());
            state.ready.push_back(key);
            self.inner.depth.set(state.ready.len() as i64);
        }
        self.inner.notify.notify_one();
    }

    /// Re-enqueues a key after a failure. The delay is the larger of the
    /// key's exponential backoff and the global rate limit.
    pub fn add_rate_limited(&self, key: impl Into<String>) {
        let key = key.into();
        let delay = self.inner.limiter.next_delay(&key);
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Resets the key's backoff state after a successful pass.
    pub fn forget(&self, key: &str) {
        self.inner.limiter.forget(key);
    }

    /// Takes the next ready key, waiting for one if necessary. Returns
    /// `None` once the queue has been shut down and drained.
    pub async fn next(&self) -> Option<String> {
        loop {
            let notified = self.inner.notify.notified();
            {
                let mut state = self.inner.state.lock();
                if let Some(key) = state.ready.pop_front() {
                    state.pending.remove(&key);
                    state.in_flight.insert(key.clone());
                    self.inner.depth.set(state.ready.len() as i64);
                    if !state.ready.is_empty() {
                        // Wake another worker for the remaining items.
                        self.inner.notify.notify_one();
                    }
                    return Some(key);
                }
                if state.shut_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Marks a key as no longer in flight. A key that was re-added while it
    /// was being processed goes straight back onto the ready list.
    pub fn done(&self, key: &str) {
        let requeued = {
            let mut state = self.inner.state.lock();
            state.in_flight.remove(key);
            if state.shut_down || !state.dirty.remove(key) {
                false
            } else {
                state.pending.insert(key.to_string());
                state.ready.push_back(key.to_string());
                self.inner.depth.set(state.ready.len() as i64);
                true
            }
        };
        if requeued {
            self.inner.notify.notify_one();
        }
    }

    /// Stops accepting new keys. Workers drain what is already ready and
    /// then observe `None` from [`Queue::next`].
    pub fn shut_down(&self) {
        self.inner.state.lock().shut_down = true;
        self.inner.notify.notify_waiters();
        self.inner.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Combines per-key exponential backoff (base 5ms, cap 1000s) with a global
/// token bucket (10 qps, burst 100). The effective delay is the larger of
/// the two, so a hot failure loop backs off per key while an overall storm
/// is throttled across keys.
pub struct RateLimiter {
    base: Duration,
    max: Duration,
    retries: Mutex<HashMap<String, u32>>,
    bucket: Mutex<TokenBucket>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}

impl RateLimiter {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            retries: Mutex::new(HashMap::default()),
            bucket: Mutex::new(TokenBucket::new(DEFAULT_QPS, DEFAULT_BURST)),
        }
    }

    fn next_delay(&self, key: &str) -> Duration {
        let attempt = {
            let mut retries = self.retries.lock();
            let entry = retries.entry(key.to_string()).or_insert(0);
            *entry = entry.saturating_add(1);
            *entry
        };

        let exponent = attempt.saturating_sub(1).min(31);
        let backoff = self.base.saturating_mul(1u32 << exponent).min(self.max);
        let throttle = self.bucket.lock().reserve();
        backoff.max(throttle)
    }

    fn forget(&self, key: &str) {
        self.retries.lock().remove(key);
    }

    #[cfg(test)]
    fn retries(&self, key: &str) -> u32 {
        self.retries.lock().get(key).copied().unwrap_or(0)
    }
}

struct TokenBucket {
    qps: f64,
    capacity: f64,
    tokens: f64,
    last: time::Instant,
}

impl TokenBucket {
    fn new(qps: f64, capacity: f64) -> Self {
        Self {
            qps,
            capacity,
            tokens: capacity,
            last: time::Instant::now(),
        }
    }

    /// Takes a token, going into debt when none are available. The returned
    /// delay is how long the caller must wait for its reservation.
    fn reserve(&mut self) -> Duration {
        let now = time::Instant::now();
        let refilled = now.duration_since(self.last).as_secs_f64() * self.qps;
        self.tokens = (self.tokens + refilled).min(self.capacity);
        self.last = now;

        self.tokens -= 1.0;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.qps)
        }
    }
}

/// Registers `queue_depth{queue_name}`.
#[derive(Clone, Debug)]
pub struct QueueMetrics {
    depth: Family<QueueLabels, Gauge>,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct QueueLabels {
    queue_name: &'static str,
}

impl QueueMetrics {
    pub fn register(registry: &mut Registry) -> Self {
        let depth = Family::<QueueLabels, Gauge>::default();
        registry.register("queue_depth", "Current depth of work queues", depth.clone());
        Self { depth }
    }

    fn depth_gauge(&self, queue_name: &'static str) -> Gauge {
        self.depth.get_or_create(&QueueLabels { queue_name }).clone()
    }
}

#[cfg(test)]
impl QueueMetrics {
    pub fn for_tests() -> Self {
        Self {
            depth: Family::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> Queue {
        Queue::new("test", RateLimiter::default(), &QueueMetrics::for_tests())
    }

    #[tokio::test]
    async fn deduplicates_pending_keys() {
        let q = queue();
        q.add("ns/a");
        q.add("ns/a");
        q.add("ns/b");

        assert_eq!(q.next().await.unwrap(), "ns/a");
        assert_eq!(q.next().await.unwrap(), "ns/b");
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn readd_while_in_flight_requeues_once_done() {
        let q = queue();
        q.add("ns/a");
        let key = q.next().await.unwrap();

        // The key is in flight; a new event must not be lost, but must also
        // not run concurrently.
        q.add("ns/a");
        assert!(q.is_empty());

        q.done(&key);
        assert_eq!(q.len(), 1);
        assert_eq!(q.next().await.unwrap(), "ns/a");
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn rate_limited_readd_is_delayed() {
        let q = queue();
        q.add_rate_limited("ns/a");
        tokio::task::yield_now().await;
        // First retry backs off by the 5ms base; nothing is ready yet.
        assert!(q.is_empty());

        time::sleep(Duration::from_millis(10)).await;
        tokio::task::yield_now().await;
        assert_eq!(q.next().await.unwrap(), "ns/a");
    }

    #[tokio::test]
    async fn shutdown_drains_then_stops() {
        let q = queue();
        q.add("ns/a");
        q.shut_down();
        q.add("ns/b");

        assert_eq!(q.next().await.unwrap(), "ns/a");
        assert!(q.next().await.is_none());
    }

    #[tokio::test]
    async fn shutdown_wakes_waiting_workers() {
        let q = queue();
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.next().await })
        };
        tokio::task::yield_now().await;
        q.shut_down();
        assert!(waiter.await.unwrap().is_none());
    }

    #[test]
    fn backoff_grows_and_resets() {
        // A wide-open bucket isolates the per-key exponential component.
        let limiter = RateLimiter {
            base: Duration::from_millis(5),
            max: Duration::from_secs(1000),
            retries: Mutex::new(HashMap::default()),
            bucket: Mutex::new(TokenBucket::new(1_000_000.0, 1_000_000.0)),
        };

        assert_eq!(limiter.next_delay("k"), Duration::from_millis(5));
        assert_eq!(limiter.next_delay("k"), Duration::from_millis(10));
        assert_eq!(limiter.next_delay("k"), Duration::from_millis(20));
        assert_eq!(limiter.retries("k"), 3);

        limiter.forget("k");
        assert_eq!(limiter.retries("k"), 0);
        assert_eq!(limiter.next_delay("k"), Duration::from_millis(5));
    }

    #[test]
    fn backoff_caps_at_max() {
        let limiter = RateLimiter {
            base: Duration::from_millis(5),
            max: Duration::from_secs(1000),
            retries: Mutex::new(HashMap::default()),
            bucket: Mutex::new(TokenBucket::new(1_000_000.0, 1_000_000.0)),
        };
        let mut last = Duration::ZERO;
        for _ in 0..40 {
            last = limiter.next_delay("k");
        }
        assert_eq!(last, Duration::from_secs(1000));
    }

    #[tokio::test]
    async fn token_bucket_throttles_past_burst() {
        let mut bucket = TokenBucket::new(10.0, 2.0);
        assert_eq!(bucket.reserve(), Duration::ZERO);
        assert_eq!(bucket.reserve(), Duration::ZERO);
        let delay = bucket.reserve();
        assert!(delay > Duration::ZERO);
        let deeper = bucket.reserve();
        assert!(deeper > delay);
    }
}
