//! Stale-while-revalidate cache for one value type
//!
//! `SwrCache` wires the store, fetch coordinator and mutation coordinator
//! together and accepts raw key descriptors. Every operation normalizes its
//! descriptor first; a descriptor meaning "no request" turns the operation
//! into a no-op that returns `None`.

use std::{
    any::{Any, TypeId},
    collections::HashMap,
    sync::{Arc, Mutex, OnceLock, PoisonError},
};

use serde::Serialize;
use tracing::debug;

use crate::{
    CacheError, CacheKey, CacheProvider, CacheStore, Cacheable, EntryView, FetchCoordinator,
    FetchHandle, Fetcher, Mutation, MutationCoordinator, MutationOptions, Subscription, SwrConfig,
    Writer, normalize,
};

/// Process-wide default caches, one per value type
static GLOBAL_CACHES: OnceLock<Mutex<HashMap<TypeId, Box<dyn Any + Send + Sync>>>> =
    OnceLock::new();

fn global_caches() -> &'static Mutex<HashMap<TypeId, Box<dyn Any + Send + Sync>>> {
    GLOBAL_CACHES.get_or_init(|| Mutex::new(HashMap::new()))
}

struct SwrCacheInner<V: Cacheable> {
    config: SwrConfig,
    store: Arc<CacheStore<V>>,
    fetches: FetchCoordinator<V>,
    mutations: MutationCoordinator<V>,
}

/// Stale-while-revalidate cache
pub struct SwrCache<V: Cacheable> {
    inner: Arc<SwrCacheInner<V>>,
}

impl<V: Cacheable> Clone for SwrCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: Cacheable> SwrCache<V> {
    /// Create a cache backed by the provider named in `config`
    pub fn new(config: SwrConfig) -> Result<Self, CacheError> {
        let provider = config.provider.build();
        Self::with_provider(config, provider)
    }

    /// Create a cache backed by a custom provider
    pub fn with_provider(
        config: SwrConfig,
        provider: Box<dyn CacheProvider<V>>,
    ) -> Result<Self, CacheError> {
        config.validate()?;
        Ok(Self::from_parts(config, provider))
    }

    /// The process-wide cache for `V`, created with the default
    /// configuration on first use
    pub fn global() -> Self {
        let mut caches = global_caches()
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(cache) = caches
            .get(&TypeId::of::<V>())
            .and_then(|cache| cache.downcast_ref::<Self>())
        {
            return cache.clone();
        }

        let config = SwrConfig::default();
        let provider = config.provider.build();
        let cache = Self::from_parts(config, provider);
        caches.insert(TypeId::of::<V>(), Box::new(cache.clone()));
        cache
    }

    /// Replace the process-wide cache for `V`
    pub fn install_global(cache: Self) {
        debug!("Installing global cache for {}", std::any::type_name::<V>());
        global_caches()
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(TypeId::of::<V>(), Box::new(cache));
    }

    /// Drop the process-wide cache for `V`; the next [`global`](Self::global)
    /// starts empty
    pub fn reset_global() {
        global_caches()
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&TypeId::of::<V>());
    }

    fn from_parts(config: SwrConfig, provider: Box<dyn CacheProvider<V>>) -> Self {
        let store = Arc::new(CacheStore::new(provider));
        let fetches = FetchCoordinator::new(Arc::clone(&store), &config);
        let mutations = MutationCoordinator::new(Arc::clone(&store), fetches.clone());
        Self {
            inner: Arc::new(SwrCacheInner {
                config,
                store,
                fetches,
                mutations,
            }),
        }
    }

    pub fn config(&self) -> &SwrConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &CacheStore<V> {
        &self.inner.store
    }

    pub fn fetches(&self) -> &FetchCoordinator<V> {
        &self.inner.fetches
    }

    /// Cached state of a key, without fetching
    pub fn state<D>(&self, descriptor: &D) -> Result<Option<EntryView<V>>, CacheError>
    where
        D: Serialize + ?Sized,
    {
        Ok(normalize(descriptor)?.map(|key| self.inner.store.get(&key).view()))
    }

    /// Return the cached state immediately and revalidate in the background
    /// when the key has no data, or has data and `revalidate_if_stale` is
    /// set.
    pub fn read<D, F>(
        &self,
        descriptor: &D,
        fetcher: F,
    ) -> Result<Option<EntryView<V>>, CacheError>
    where
        D: Serialize + ?Sized,
        F: Fetcher<V>,
    {
        let Some(key) = normalize(descriptor)? else {
            return Ok(None);
        };

        self.revalidate_on_read(&key, Arc::new(fetcher));
        Ok(Some(self.inner.store.get(&key).view()))
    }

    /// Fetch a key, sharing any in-flight fetch, and wait for the outcome
    pub async fn fetch<D, F>(
        &self,
        descriptor: &D,
        fetcher: F,
    ) -> Result<Option<Arc<V>>, CacheError>
    where
        D: Serialize + ?Sized,
        F: Fetcher<V>,
    {
        let Some(key) = normalize(descriptor)? else {
            return Ok(None);
        };
        let handle = self.inner.fetches.request(&key, Arc::new(fetcher));
        handle.settled().await.map(Some)
    }

    /// Subscribe to changes of a key
    pub fn subscribe<D, L>(
        &self,
        descriptor: &D,
        listener: L,
    ) -> Result<Option<Subscription>, CacheError>
    where
        D: Serialize + ?Sized,
        L: Fn(&EntryView<V>) + Send + Sync + 'static,
    {
        Ok(normalize(descriptor)?.map(|key| self.inner.store.subscribe(&key, listener)))
    }

    /// Subscribe as a reader of a key: `fetcher` becomes the key's
    /// revalidator and an initial read is started.
    pub fn watch<D, F, L>(
        &self,
        descriptor: &D,
        fetcher: F,
        listener: L,
    ) -> Result<Option<Subscription>, CacheError>
    where
        D: Serialize + ?Sized,
        F: Fetcher<V>,
        L: Fn(&EntryView<V>) + Send + Sync + 'static,
    {
        let Some(key) = normalize(descriptor)? else {
            return Ok(None);
        };

        let fetcher: Arc<dyn Fetcher<V>> = Arc::new(fetcher);
        let subscription = self
            .inner
            .store
            .subscribe_reader(&key, Arc::new(listener), Arc::clone(&fetcher));
        self.revalidate_on_read(&key, fetcher);
        Ok(Some(subscription))
    }

    /// Revalidate a key through its subscribed reader
    pub fn revalidate<D>(&self, descriptor: &D) -> Result<Option<FetchHandle<V>>, CacheError>
    where
        D: Serialize + ?Sized,
    {
        Ok(normalize(descriptor)?.and_then(|key| self.inner.fetches.revalidate_subscribed(&key)))
    }

    /// Write `data` into the cache locally, then optionally revalidate the
    /// key through its subscribed reader
    pub fn mutate<D>(
        &self,
        descriptor: &D,
        data: V,
        revalidate: bool,
    ) -> Result<Option<Arc<V>>, CacheError>
    where
        D: Serialize + ?Sized,
    {
        let Some(key) = normalize(descriptor)? else {
            return Ok(None);
        };

        let data = Arc::new(data);
        self.inner.store.put(&key, Some(Arc::clone(&data)), None);
        if revalidate {
            let _ = self.inner.fetches.revalidate_subscribed(&key);
        }
        Ok(Some(data))
    }

    /// Run `writer` against a key once
    pub async fn trigger<D, A, W>(
        &self,
        descriptor: &D,
        writer: W,
        arg: A,
        options: MutationOptions<V>,
    ) -> Result<Arc<V>, CacheError>
    where
        D: Serialize + ?Sized,
        A: Send + 'static,
        W: Writer<A, V>,
    {
        let key = normalize(descriptor)?.ok_or(CacheError::MissingKey)?;
        self.inner
            .mutations
            .trigger(&key, &writer, arg, &options)
            .await
    }

    /// Bind `writer` to a key as a reusable [`Mutation`]
    pub fn mutation<D, A, W>(
        &self,
        descriptor: &D,
        writer: W,
        options: MutationOptions<V>,
    ) -> Result<Mutation<A, V>, CacheError>
    where
        D: Serialize + ?Sized,
        A: Send + 'static,
        W: Writer<A, V>,
    {
        Ok(Mutation::new(
            normalize(descriptor)?,
            Arc::new(writer),
            options,
            self.inner.mutations.clone(),
        ))
    }

    fn revalidate_on_read(&self, key: &CacheKey, fetcher: Arc<dyn Fetcher<V>>) {
        let has_data = self.inner.store.get(key).data.is_some();
        if has_data && !self.inner.config.revalidate_if_stale {
            debug!("Serving cached data for key {} without revalidation", key);
            return;
        }
        let _ = self.inner.fetches.request(key, fetcher);
    }
}
