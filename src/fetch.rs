//! Fetch coordination
//!
//! At most one fetch per key is in flight. The first request for a key
//! registers an in-flight record and spawns the fetch on its own task; every
//! later request for the same key attaches to that record's `watch` channel
//! until the fetch settles. Settling removes the record, writes the result to
//! the store (which clears `is_validating` and notifies subscribers), then
//! wakes all waiters with the same outcome.

use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use tokio::{sync::watch, time::Instant};
use tracing::{debug, error, warn};

use crate::{BoxError, CacheError, CacheKey, CacheStore, Cacheable, RemoteError, SwrConfig};

/// Trait for fetching a key's value from the remote source.
///
/// Any `Fn(CacheKey) -> impl Future<Output = Result<V, E>>` implements it.
#[async_trait::async_trait]
pub trait Fetcher<V>: Send + Sync + 'static {
    async fn fetch(&self, key: &CacheKey) -> Result<V, BoxError>;
}

#[async_trait::async_trait]
impl<V, F, Fut, E> Fetcher<V> for F
where
    V: Cacheable,
    F: Fn(CacheKey) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<V, E>> + Send + 'static,
    E: Into<BoxError> + 'static,
{
    async fn fetch(&self, key: &CacheKey) -> Result<V, BoxError> {
        (self)(key.clone()).await.map_err(Into::into)
    }
}

/// Outcome shared by every requester of one fetch
pub type FetchResult<V> = Result<Arc<V>, CacheError>;

type Settled<V> = Option<FetchResult<V>>;

struct InFlightRecord<V> {
    rx: watch::Receiver<Settled<V>>,
    started_at: Instant,
}

struct CoordinatorState<V> {
    in_flight: HashMap<CacheKey, InFlightRecord<V>>,
    /// When the last fetch of each key settled
    settled_at: HashMap<CacheKey, Instant>,
}

/// Retry policy copied out of [`SwrConfig`]
#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    deduping_interval: Duration,
    error_retry_count: u32,
    error_retry_interval: Duration,
}

impl RetryPolicy {
    /// Un-jittered delay before retry number `attempt` (zero-based)
    fn base_backoff(&self, attempt: u32) -> Duration {
        self.error_retry_interval
            .saturating_mul(1u32 << attempt.min(8))
    }

    /// Delay before retry number `attempt`, scaled by a random factor in
    /// `[0.5, 1.5)` so failing clients do not retry in lockstep
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = rand::random::<f64>() + 0.5;
        self.base_backoff(attempt).mul_f64(factor)
    }
}

/// Whether a request honors the deduping interval
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestMode {
    Request,
    Revalidate,
}

struct CoordinatorInner<V: Cacheable> {
    store: Arc<CacheStore<V>>,
    policy: RetryPolicy,
    state: Mutex<CoordinatorState<V>>,
}

/// Deduplicates fetches per key and applies their results to the store
pub struct FetchCoordinator<V: Cacheable> {
    inner: Arc<CoordinatorInner<V>>,
}

impl<V: Cacheable> Clone for FetchCoordinator<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// A pending or already-known fetch outcome
pub struct FetchHandle<V> {
    key: CacheKey,
    state: HandleState<V>,
}

enum HandleState<V> {
    Ready(FetchResult<V>),
    Pending(watch::Receiver<Settled<V>>),
}

impl<V> FetchHandle<V> {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// `true` when the outcome came from the deduping window and no fetch
    /// was started or joined
    pub fn is_cached(&self) -> bool {
        matches!(self.state, HandleState::Ready(_))
    }

    /// Wait for the fetch to settle
    pub async fn settled(self) -> FetchResult<V> {
        let mut rx = match self.state {
            HandleState::Ready(result) => return result,
            HandleState::Pending(rx) => rx,
        };

        loop {
            if let Some(result) = rx.borrow_and_update().as_ref() {
                return result.clone();
            }
            if rx.changed().await.is_err() {
                return Err(CacheError::Aborted { key: self.key });
            }
        }
    }
}

impl<V: Cacheable> FetchCoordinator<V> {
    pub fn new(store: Arc<CacheStore<V>>, config: &SwrConfig) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                store,
                policy: RetryPolicy {
                    deduping_interval: config.deduping_interval,
                    error_retry_count: config.error_retry_count,
                    error_retry_interval: config.error_retry_interval,
                },
                state: Mutex::new(CoordinatorState {
                    in_flight: HashMap::new(),
                    settled_at: HashMap::new(),
                }),
            }),
        }
    }

    /// Request `key`: attach to its in-flight fetch, serve it from the cache
    /// inside the deduping interval, or start a new fetch.
    ///
    /// The in-flight record is registered before this returns; the fetch
    /// itself runs on a spawned task, so this must be called from within a
    /// Tokio runtime.
    pub fn request(&self, key: &CacheKey, fetcher: Arc<dyn Fetcher<V>>) -> FetchHandle<V> {
        self.start(key, fetcher, RequestMode::Request)
    }

    /// Like [`request`](Self::request) but ignores the deduping interval.
    /// Still attaches to an in-flight fetch.
    pub fn revalidate(&self, key: &CacheKey, fetcher: Arc<dyn Fetcher<V>>) -> FetchHandle<V> {
        self.start(key, fetcher, RequestMode::Revalidate)
    }

    /// Revalidate `key` with the fetcher of its first active reader.
    /// Returns `None` when nobody reads the key.
    pub fn revalidate_subscribed(&self, key: &CacheKey) -> Option<FetchHandle<V>> {
        match self.inner.store.revalidator(key) {
            Some(fetcher) => Some(self.revalidate(key, fetcher)),
            None => {
                debug!("No active reader for key {}, skipping revalidation", key);
                None
            }
        }
    }

    pub fn is_in_flight(&self, key: &CacheKey) -> bool {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .in_flight
            .contains_key(key)
    }

    /// How long the current fetch of `key` has been running
    pub fn in_flight_for(&self, key: &CacheKey) -> Option<Duration> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .in_flight
            .get(key)
            .map(|record| record.started_at.elapsed())
    }

    fn start(
        &self,
        key: &CacheKey,
        fetcher: Arc<dyn Fetcher<V>>,
        mode: RequestMode,
    ) -> FetchHandle<V> {
        let (tx, rx) = {
            let mut state = self
                .inner
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);

            if let Some(record) = state.in_flight.get(key) {
                debug!("Attaching to in-flight fetch for key: {}", key);
                return FetchHandle {
                    key: key.clone(),
                    state: HandleState::Pending(record.rx.clone()),
                };
            }

            if mode == RequestMode::Request
                && let Some(result) = self.inner.deduplicated(&state, key)
            {
                debug!("Fetch for key {} deduplicated by interval", key);
                return FetchHandle {
                    key: key.clone(),
                    state: HandleState::Ready(result),
                };
            }

            let (tx, rx) = watch::channel(None);
            state.in_flight.insert(
                key.clone(),
                InFlightRecord {
                    rx: rx.clone(),
                    started_at: Instant::now(),
                },
            );
            (tx, rx)
        };

        debug!("Starting fetch for key: {}", key);
        self.inner.store.mark_validating(key, true);

        let guard = InFlightGuard::new(key.clone(), Arc::clone(&self.inner), tx);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let result = inner.run(guard.key(), fetcher.as_ref()).await;
            guard.complete(result);
        });

        FetchHandle {
            key: key.clone(),
            state: HandleState::Pending(rx),
        }
    }
}

impl<V: Cacheable> CoordinatorInner<V> {
    /// The cached outcome, if the last fetch of `key` settled within the
    /// deduping interval
    fn deduplicated(&self, state: &CoordinatorState<V>, key: &CacheKey) -> Option<FetchResult<V>> {
        let settled_at = state.settled_at.get(key)?;
        if self.policy.deduping_interval.is_zero()
            || settled_at.elapsed() >= self.policy.deduping_interval
        {
            return None;
        }

        let entry = self.store.get(key);
        match (entry.error, entry.data) {
            (Some(source), _) => Some(Err(CacheError::Fetch {
                key: key.clone(),
                source,
            })),
            (None, Some(data)) => Some(Ok(data)),
            (None, None) => None,
        }
    }

    async fn run(&self, key: &CacheKey, fetcher: &dyn Fetcher<V>) -> FetchResult<V> {
        let mut attempt = 0u32;
        loop {
            match fetcher.fetch(key).await {
                Ok(value) => return Ok(Arc::new(value)),
                Err(e) if attempt < self.policy.error_retry_count => {
                    let delay = self.policy.backoff(attempt);
                    attempt += 1;
                    warn!(
                        "Fetch attempt {} for key {} failed: {}. Retrying in {:?}",
                        attempt, key, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(
                        "Fetch for key {} failed after {} attempt(s): {}",
                        key,
                        attempt + 1,
                        e
                    );
                    return Err(CacheError::Fetch {
                        key: key.clone(),
                        source: RemoteError::from(e),
                    });
                }
            }
        }
    }

    /// Write the outcome, then retire the in-flight record. Until the record
    /// is gone, new requests attach to this fetch instead of starting one
    /// the store write could overtake.
    fn settle(&self, key: &CacheKey, result: &FetchResult<V>) {
        match result {
            Ok(data) => {
                debug!("Fetch settled for key: {}", key);
                self.store.set(key, Some(Arc::clone(data)), None);
            }
            Err(CacheError::Fetch { source, .. }) => {
                self.store.set_error(key, source.clone());
            }
            Err(other) => {
                self.store.set_error(key, RemoteError::new(other.to_string()));
            }
        }

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.in_flight.remove(key);
        state.settled_at.insert(key.clone(), Instant::now());
    }
}

/// Ensures an in-flight record is settled even if the fetch task dies.
///
/// When dropped without `complete`, settles the key as aborted so waiters
/// and `is_validating` never hang.
struct InFlightGuard<V: Cacheable> {
    key: CacheKey,
    inner: Arc<CoordinatorInner<V>>,
    tx: Option<watch::Sender<Settled<V>>>,
}

impl<V: Cacheable> InFlightGuard<V> {
    fn new(key: CacheKey, inner: Arc<CoordinatorInner<V>>, tx: watch::Sender<Settled<V>>) -> Self {
        Self {
            key,
            inner,
            tx: Some(tx),
        }
    }

    fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Apply the result to the store, then wake every waiter
    fn complete(mut self, result: FetchResult<V>) {
        if let Some(tx) = self.tx.take() {
            self.inner.settle(&self.key, &result);
            let _ = tx.send(Some(result));
        }
    }
}

impl<V: Cacheable> Drop for InFlightGuard<V> {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            warn!("Fetch for key {} ended without a result", self.key);
            let result = Err(CacheError::Aborted {
                key: self.key.clone(),
            });
            self.inner.settle(&self.key, &result);
            let _ = tx.send(Some(result));
        }
    }
}
