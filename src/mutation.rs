//! Mutation coordination
//!
//! A mutation runs a caller-supplied writer against a key. The writer's
//! settlement is the mutation's outcome: cache population happens before the
//! optional revalidation is started, and the revalidation is only started,
//! never awaited, so `trigger` settles as soon as the writer does.

use std::{
    fmt,
    future::Future,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use tracing::{debug, warn};

use crate::{
    BoxError, CacheError, CacheKey, CacheStore, Cacheable, FetchCoordinator, RemoteError,
};

/// Trait for performing a remote write for a key.
///
/// Any `Fn(CacheKey, A) -> impl Future<Output = Result<V, E>>` implements it.
#[async_trait::async_trait]
pub trait Writer<A: Send + 'static, V>: Send + Sync + 'static {
    async fn write(&self, key: &CacheKey, arg: A) -> Result<V, BoxError>;
}

#[async_trait::async_trait]
impl<A, V, F, Fut, E> Writer<A, V> for F
where
    A: Send + 'static,
    V: Cacheable,
    F: Fn(CacheKey, A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<V, E>> + Send + 'static,
    E: Into<BoxError> + 'static,
{
    async fn write(&self, key: &CacheKey, arg: A) -> Result<V, BoxError> {
        (self)(key.clone(), arg).await.map_err(Into::into)
    }
}

/// Per-trigger mutation options
pub struct MutationOptions<V> {
    /// Revalidate the key after a successful write (default `true`)
    pub revalidate: bool,
    /// Write the writer's result into the cache (default `false`)
    pub populate_cache: bool,
    /// Value shown in the cache while the write is pending
    pub optimistic_data: Option<Arc<V>>,
    /// Undo `optimistic_data` if the write fails (default `true`)
    pub rollback_on_error: bool,
}

impl<V> Default for MutationOptions<V> {
    fn default() -> Self {
        Self {
            revalidate: true,
            populate_cache: false,
            optimistic_data: None,
            rollback_on_error: true,
        }
    }
}

impl<V> Clone for MutationOptions<V> {
    fn clone(&self) -> Self {
        Self {
            revalidate: self.revalidate,
            populate_cache: self.populate_cache,
            optimistic_data: self.optimistic_data.clone(),
            rollback_on_error: self.rollback_on_error,
        }
    }
}

impl<V> fmt::Debug for MutationOptions<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationOptions")
            .field("revalidate", &self.revalidate)
            .field("populate_cache", &self.populate_cache)
            .field("optimistic_data", &self.optimistic_data.is_some())
            .field("rollback_on_error", &self.rollback_on_error)
            .finish()
    }
}

/// Pre-optimistic state of an entry and the stamp of the optimistic write
struct Rollback<V> {
    data: Option<Arc<V>>,
    error: Option<RemoteError>,
    optimistic_at: u64,
}

/// Runs writes and coordinates them with the cache
pub struct MutationCoordinator<V: Cacheable> {
    store: Arc<CacheStore<V>>,
    fetches: FetchCoordinator<V>,
}

impl<V: Cacheable> Clone for MutationCoordinator<V> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            fetches: self.fetches.clone(),
        }
    }
}

impl<V: Cacheable> MutationCoordinator<V> {
    pub fn new(store: Arc<CacheStore<V>>, fetches: FetchCoordinator<V>) -> Self {
        Self { store, fetches }
    }

    /// Run `writer` for `key` and return its result.
    ///
    /// The writer call is the only suspension point. Failures are returned
    /// as [`CacheError::Mutation`] and never retried.
    pub async fn trigger<A: Send + 'static>(
        &self,
        key: &CacheKey,
        writer: &dyn Writer<A, V>,
        arg: A,
        options: &MutationOptions<V>,
    ) -> Result<Arc<V>, CacheError> {
        let rollback = options.optimistic_data.as_ref().map(|optimistic| {
            let before = self.store.get(key);
            let applied = self
                .store
                .put(key, Some(Arc::clone(optimistic)), before.error.clone());
            Rollback {
                data: before.data,
                error: before.error,
                optimistic_at: applied.updated_at,
            }
        });

        debug!("Triggering mutation for key: {}", key);
        match writer.write(key, arg).await {
            Ok(value) => {
                let value = Arc::new(value);
                if options.populate_cache {
                    self.store.put(key, Some(Arc::clone(&value)), None);
                }
                if options.revalidate {
                    // Started here, settled in the background
                    let _ = self.fetches.revalidate_subscribed(key);
                }
                Ok(value)
            }
            Err(e) => {
                let source = RemoteError::from(e);
                warn!("Mutation for key {} failed: {}", key, source);

                if let Some(rollback) = rollback
                    && options.rollback_on_error
                {
                    debug!("Rolling back optimistic data for key: {}", key);
                    self.store.restore(
                        key,
                        rollback.data,
                        rollback.error,
                        rollback.optimistic_at,
                    );
                }

                Err(CacheError::Mutation {
                    key: key.clone(),
                    source,
                })
            }
        }
    }
}

/// Outcome of the latest trigger on a [`Mutation`]
#[derive(Debug)]
pub struct MutationState<V> {
    pub data: Option<Arc<V>>,
    pub error: Option<CacheError>,
    pub is_mutating: bool,
}

impl<V> Default for MutationState<V> {
    fn default() -> Self {
        Self {
            data: None,
            error: None,
            is_mutating: false,
        }
    }
}

impl<V> Clone for MutationState<V> {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            error: self.error.clone(),
            is_mutating: self.is_mutating,
        }
    }
}

struct MutationInner<A: Send + 'static, V: Cacheable> {
    key: Option<CacheKey>,
    writer: Arc<dyn Writer<A, V>>,
    options: MutationOptions<V>,
    coordinator: MutationCoordinator<V>,
    state: Mutex<MutationState<V>>,
    /// Id of the latest trigger; older triggers do not touch `state`
    generation: AtomicU64,
}

/// A writer bound to one key, tracking its own outcome independently of
/// the cached value
pub struct Mutation<A: Send + 'static, V: Cacheable> {
    inner: Arc<MutationInner<A, V>>,
}

impl<A: Send + 'static, V: Cacheable> Clone for Mutation<A, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A: Send + 'static, V: Cacheable> Mutation<A, V> {
    pub fn new(
        key: Option<CacheKey>,
        writer: Arc<dyn Writer<A, V>>,
        options: MutationOptions<V>,
        coordinator: MutationCoordinator<V>,
    ) -> Self {
        Self {
            inner: Arc::new(MutationInner {
                key,
                writer,
                options,
                coordinator,
                state: Mutex::new(MutationState::default()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn key(&self) -> Option<&CacheKey> {
        self.inner.key.as_ref()
    }

    /// Trigger with the options the mutation was created with
    pub async fn trigger(&self, arg: A) -> Result<Arc<V>, CacheError> {
        let options = self.inner.options.clone();
        self.trigger_with(arg, options).await
    }

    pub async fn trigger_with(
        &self,
        arg: A,
        options: MutationOptions<V>,
    ) -> Result<Arc<V>, CacheError> {
        let key = self.inner.key.clone().ok_or(CacheError::MissingKey)?;

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.update_state(generation, |state| state.is_mutating = true);

        let result = self
            .inner
            .coordinator
            .trigger(&key, self.inner.writer.as_ref(), arg, &options)
            .await;

        self.update_state(generation, |state| {
            match &result {
                Ok(data) => {
                    state.data = Some(Arc::clone(data));
                    state.error = None;
                }
                Err(e) => state.error = Some(e.clone()),
            }
            state.is_mutating = false;
        });

        result
    }

    pub fn state(&self) -> MutationState<V> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Clear the tracked outcome; pending triggers no longer report into it
    pub fn reset(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        *self
            .inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = MutationState::default();
    }

    fn update_state(&self, generation: u64, apply: impl FnOnce(&mut MutationState<V>)) {
        let mut state = self
            .inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.inner.generation.load(Ordering::SeqCst) == generation {
            apply(&mut state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EntryView, Fetcher, ProviderKind, SwrConfig, normalize};
    use std::{
        sync::atomic::AtomicUsize,
        time::Duration,
    };
    use tokio::sync::Semaphore;

    struct Harness {
        store: Arc<CacheStore<String>>,
        fetches: FetchCoordinator<String>,
        mutations: MutationCoordinator<String>,
        fetch_calls: Arc<AtomicUsize>,
        fetch_gate: Arc<Semaphore>,
    }

    impl Harness {
        fn new(config: SwrConfig) -> Self {
            let store = Arc::new(CacheStore::new(ProviderKind::Memory.build()));
            let fetches = FetchCoordinator::new(Arc::clone(&store), &config);
            let mutations = MutationCoordinator::new(Arc::clone(&store), fetches.clone());
            Self {
                store,
                fetches,
                mutations,
                fetch_calls: Arc::new(AtomicUsize::new(0)),
                fetch_gate: Arc::new(Semaphore::new(0)),
            }
        }

        fn fetcher(&self) -> Arc<dyn Fetcher<String>> {
            let calls = Arc::clone(&self.fetch_calls);
            let gate = Arc::clone(&self.fetch_gate);
            Arc::new(move |_key: CacheKey| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                let gate = Arc::clone(&gate);
                async move {
                    gate.acquire().await.unwrap().forget();
                    Ok::<_, BoxError>(format!("fetched {n}"))
                }
            })
        }

        /// Subscribe a reader whose fetcher is used for revalidation
        fn reader(&self, key: &CacheKey) -> crate::Subscription {
            self.store
                .subscribe_reader(key, Arc::new(|_: &EntryView<String>| {}), self.fetcher())
        }

        fn calls(&self) -> usize {
            self.fetch_calls.load(Ordering::SeqCst)
        }

        fn data(&self, key: &CacheKey) -> Option<String> {
            self.store.get(key).data.as_deref().cloned()
        }
    }

    fn test_config(deduping_interval: Duration, error_retry_count: u32) -> SwrConfig {
        SwrConfig {
            deduping_interval,
            error_retry_count,
            ..SwrConfig::default()
        }
    }

    fn key(s: &str) -> CacheKey {
        normalize(s).unwrap().unwrap()
    }

    fn ok_writer(result: &'static str) -> Arc<dyn Writer<(), String>> {
        Arc::new(move |_key: CacheKey, _arg: ()| async move {
            Ok::<_, BoxError>(result.to_owned())
        })
    }

    fn failing_writer() -> Arc<dyn Writer<(), String>> {
        Arc::new(|_key: CacheKey, _arg: ()| async {
            Err::<String, BoxError>("write rejected".into())
        })
    }

    /// Let spawned fetch tasks run until they block
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_revalidation_when_disabled() {
        for (interval, retries) in [
            (Duration::ZERO, 0),
            (Duration::ZERO, 3),
            (Duration::from_secs(2), 0),
            (Duration::from_secs(2), 3),
        ] {
            let h = Harness::new(test_config(interval, retries));
            let k = key("/key");
            let _reader = h.reader(&k);

            let options = MutationOptions {
                revalidate: false,
                ..MutationOptions::default()
            };
            let result = h
                .mutations
                .trigger(&k, ok_writer("saved").as_ref(), (), &options)
                .await
                .unwrap();
            settle().await;

            assert_eq!(result.as_str(), "saved");
            assert_eq!(h.calls(), 0);
            assert!(!h.fetches.is_in_flight(&k));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_settles_before_revalidation() {
        let h = Harness::new(test_config(Duration::ZERO, 0));
        let k = key("/key");
        let _reader = h.reader(&k);

        let result = h
            .mutations
            .trigger(&k, ok_writer("saved").as_ref(), (), &MutationOptions::default())
            .await
            .unwrap();

        // revalidation registered but its fetch is still blocked
        assert_eq!(result.as_str(), "saved");
        assert!(h.fetches.is_in_flight(&k));
        assert!(h.store.get(&k).is_validating);

        h.fetch_gate.add_permits(1);
        settle().await;
        assert_eq!(h.calls(), 1);
        assert_eq!(h.data(&k).as_deref(), Some("fetched 1"));
        assert!(!h.store.get(&k).is_validating);
    }

    #[tokio::test(start_paused = true)]
    async fn test_revalidation_attaches_to_in_flight_fetch() {
        let h = Harness::new(test_config(Duration::ZERO, 0));
        let k = key("/key");
        let _reader = h.reader(&k);
        let pending = h.fetches.request(&k, h.fetcher());

        h.mutations
            .trigger(&k, ok_writer("saved").as_ref(), (), &MutationOptions::default())
            .await
            .unwrap();

        h.fetch_gate.add_permits(1);
        pending.settled().await.unwrap();
        assert_eq!(h.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_revalidation_without_reader_is_skipped() {
        let h = Harness::new(test_config(Duration::ZERO, 0));
        let k = key("/key");

        h.mutations
            .trigger(&k, ok_writer("saved").as_ref(), (), &MutationOptions::default())
            .await
            .unwrap();

        assert!(!h.fetches.is_in_flight(&k));
        assert_eq!(h.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_populate_cache_precedes_revalidation() {
        let h = Harness::new(test_config(Duration::ZERO, 0));
        let k = key("/key");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let _reader = h.store.subscribe_reader(
            &k,
            {
                let seen = Arc::clone(&seen);
                Arc::new(move |view: &EntryView<String>| {
                    seen.lock()
                        .unwrap()
                        .push((view.data.as_deref().cloned(), view.is_validating))
                })
            },
            h.fetcher(),
        );

        let options = MutationOptions {
            populate_cache: true,
            ..MutationOptions::default()
        };
        h.mutations
            .trigger(&k, ok_writer("saved").as_ref(), (), &options)
            .await
            .unwrap();
        h.fetch_gate.add_permits(1);
        settle().await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                (Some("saved".to_owned()), false),
                (Some("saved".to_owned()), true),
                (Some("fetched 1".to_owned()), false),
            ]
        );
    }

    #[tokio::test]
    async fn test_optimistic_data_visible_while_pending() {
        let h = Harness::new(test_config(Duration::ZERO, 0));
        let k = key("/key");
        h.store.set(&k, Some(Arc::new("before".to_owned())), None);
        let release = Arc::new(Semaphore::new(0));
        let writer: Arc<dyn Writer<(), String>> = {
            let release = Arc::clone(&release);
            Arc::new(move |_key: CacheKey, _arg: ()| {
                let release = Arc::clone(&release);
                async move {
                    release.acquire().await.unwrap().forget();
                    Ok::<_, BoxError>("server".to_owned())
                }
            })
        };
        let options = MutationOptions {
            revalidate: false,
            populate_cache: true,
            optimistic_data: Some(Arc::new("optimistic".to_owned())),
            ..MutationOptions::default()
        };

        let trigger = h.mutations.trigger(&k, writer.as_ref(), (), &options);
        let check = async {
            tokio::task::yield_now().await;
            assert_eq!(h.data(&k).as_deref(), Some("optimistic"));
            release.add_permits(1);
        };
        let (result, ()) = tokio::join!(trigger, check);

        assert_eq!(result.unwrap().as_str(), "server");
        assert_eq!(h.data(&k).as_deref(), Some("server"));
    }

    #[tokio::test]
    async fn test_failure_rolls_back_optimistic_data() {
        let h = Harness::new(test_config(Duration::ZERO, 0));
        let k = key("/key");
        h.store.set(&k, Some(Arc::new("before".to_owned())), None);

        let options = MutationOptions {
            optimistic_data: Some(Arc::new("optimistic".to_owned())),
            ..MutationOptions::default()
        };
        let err = h
            .mutations
            .trigger(&k, failing_writer().as_ref(), (), &options)
            .await
            .unwrap_err();

        assert!(matches!(err, CacheError::Mutation { .. }));
        assert_eq!(err.remote().unwrap().to_string(), "write rejected");
        assert_eq!(h.data(&k).as_deref(), Some("before"));
    }

    #[tokio::test]
    async fn test_failure_keeps_optimistic_data_without_rollback() {
        let h = Harness::new(test_config(Duration::ZERO, 0));
        let k = key("/key");

        let options = MutationOptions {
            optimistic_data: Some(Arc::new("optimistic".to_owned())),
            rollback_on_error: false,
            ..MutationOptions::default()
        };
        let result = h
            .mutations
            .trigger(&k, failing_writer().as_ref(), (), &options)
            .await;

        assert!(result.is_err());
        assert_eq!(h.data(&k).as_deref(), Some("optimistic"));
    }

    #[tokio::test]
    async fn test_rollback_skipped_when_superseded() {
        let h = Harness::new(test_config(Duration::ZERO, 0));
        let k = key("/key");
        let store = Arc::clone(&h.store);
        let writer: Arc<dyn Writer<(), String>> = Arc::new(move |key: CacheKey, _arg: ()| {
            // a newer write lands while this one is pending
            store.set(&key, Some(Arc::new("newer".to_owned())), None);
            async { Err::<String, BoxError>("write rejected".into()) }
        });

        let options = MutationOptions {
            optimistic_data: Some(Arc::new("optimistic".to_owned())),
            ..MutationOptions::default()
        };
        let _ = h.mutations.trigger(&k, writer.as_ref(), (), &options).await;

        assert_eq!(h.data(&k).as_deref(), Some("newer"));
    }

    #[tokio::test]
    async fn test_failed_mutation_never_revalidates() {
        let h = Harness::new(test_config(Duration::ZERO, 0));
        let k = key("/key");
        let _reader = h.reader(&k);

        let result = h
            .mutations
            .trigger(&k, failing_writer().as_ref(), (), &MutationOptions::default())
            .await;

        assert!(result.is_err());
        assert!(!h.fetches.is_in_flight(&k));
    }

    #[tokio::test]
    async fn test_mutation_tracks_its_own_outcome() {
        let h = Harness::new(test_config(Duration::ZERO, 0));
        let k = key("/key");
        h.store.set(&k, Some(Arc::new("cached".to_owned())), None);
        let mutation = Mutation::new(
            Some(k.clone()),
            ok_writer("saved"),
            MutationOptions {
                revalidate: false,
                ..MutationOptions::default()
            },
            h.mutations.clone(),
        );

        assert!(!mutation.state().is_mutating);
        mutation.trigger(()).await.unwrap();

        let state = mutation.state();
        assert_eq!(state.data.as_deref().map(String::as_str), Some("saved"));
        assert!(state.error.is_none());
        assert!(!state.is_mutating);
        // the cached value is untouched without populate_cache
        assert_eq!(h.data(&k).as_deref(), Some("cached"));

        mutation.reset();
        assert!(mutation.state().data.is_none());
    }

    #[tokio::test]
    async fn test_mutation_records_failure() {
        let h = Harness::new(test_config(Duration::ZERO, 0));
        let mutation = Mutation::new(
            Some(key("/key")),
            failing_writer(),
            MutationOptions::default(),
            h.mutations.clone(),
        );

        assert!(mutation.trigger(()).await.is_err());
        let state = mutation.state();
        assert!(matches!(state.error, Some(CacheError::Mutation { .. })));
        assert!(state.data.is_none());
    }

    #[tokio::test]
    async fn test_stale_trigger_does_not_overwrite_latest() {
        let h = Harness::new(test_config(Duration::ZERO, 0));
        let slow = Arc::new(Semaphore::new(0));
        let writer: Arc<dyn Writer<&'static str, String>> = {
            let slow = Arc::clone(&slow);
            Arc::new(move |_key: CacheKey, arg: &'static str| {
                let slow = Arc::clone(&slow);
                async move {
                    if arg == "first" {
                        slow.acquire().await.unwrap().forget();
                    }
                    Ok::<_, BoxError>(arg.to_owned())
                }
            })
        };
        let mutation = Mutation::new(
            Some(key("/key")),
            writer,
            MutationOptions {
                revalidate: false,
                ..MutationOptions::default()
            },
            h.mutations.clone(),
        );

        let first = mutation.trigger("first");
        let second = async {
            tokio::task::yield_now().await;
            let value = mutation.trigger("second").await;
            slow.add_permits(1);
            value
        };
        let (first, second) = tokio::join!(first, second);

        assert_eq!(first.unwrap().as_str(), "first");
        assert_eq!(second.unwrap().as_str(), "second");
        assert_eq!(
            mutation.state().data.as_deref().map(String::as_str),
            Some("second")
        );
    }

    #[tokio::test]
    async fn test_trigger_without_key_fails() {
        let h = Harness::new(test_config(Duration::ZERO, 0));
        let mutation = Mutation::new(
            None,
            ok_writer("saved"),
            MutationOptions::default(),
            h.mutations.clone(),
        );

        assert!(matches!(
            mutation.trigger(()).await,
            Err(CacheError::MissingKey)
        ));
    }
}
