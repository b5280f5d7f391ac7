//! Per-key cache state and change notification
//!
//! Every write follows the same shape: take the write lock, read the entry,
//! replace it in the provider and queue its view in the outbox, release the
//! lock, then drain the outbox. The outbox is drained by one thread at a
//! time in queue order, so subscribers see writes in the order they were
//! applied even when writers race on different threads. A write made from
//! inside a listener is delivered once that listener returns.

use std::{
    collections::VecDeque,
    fmt,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use tracing::debug;

use crate::{
    CacheKey, CacheProvider, Fetcher, RemoteError,
    registry::{Listener, Subscription, SubscriptionRegistry},
};

/// Trait for types that can be cached
pub trait Cacheable: Send + Sync + 'static {}
impl<T> Cacheable for T where T: Send + Sync + 'static {}

/// Cached state of one key
pub struct CacheEntry<V> {
    pub key: CacheKey,
    /// Last successfully fetched or locally written value
    pub data: Option<Arc<V>>,
    /// Last fetch failure; cleared by the next successful fetch
    pub error: Option<RemoteError>,
    /// A fetch for this key is in flight
    pub is_validating: bool,
    /// Logical timestamp of the last data/error write, 0 if never written
    pub updated_at: u64,
}

impl<V> CacheEntry<V> {
    pub fn empty(key: CacheKey) -> Self {
        Self {
            key,
            data: None,
            error: None,
            is_validating: false,
            updated_at: 0,
        }
    }

    pub fn view(&self) -> EntryView<V> {
        EntryView {
            data: self.data.clone(),
            error: self.error.clone(),
            is_validating: self.is_validating,
        }
    }
}

impl<V> Clone for CacheEntry<V> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            data: self.data.clone(),
            error: self.error.clone(),
            is_validating: self.is_validating,
            updated_at: self.updated_at,
        }
    }
}

impl<V: fmt::Debug> fmt::Debug for CacheEntry<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("key", &self.key)
            .field("data", &self.data)
            .field("error", &self.error)
            .field("is_validating", &self.is_validating)
            .field("updated_at", &self.updated_at)
            .finish()
    }
}

/// What a subscriber observes of an entry
#[derive(Debug)]
pub struct EntryView<V> {
    pub data: Option<Arc<V>>,
    pub error: Option<RemoteError>,
    pub is_validating: bool,
}

impl<V> Clone for EntryView<V> {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            error: self.error.clone(),
            is_validating: self.is_validating,
        }
    }
}

/// Views waiting to be delivered, in write order
struct Outbox<V> {
    queue: VecDeque<(CacheKey, EntryView<V>)>,
    draining: bool,
}

/// Cache store: entries, their logical clock and their subscribers
pub struct CacheStore<V: Cacheable> {
    provider: Box<dyn CacheProvider<V>>,
    subscribers: SubscriptionRegistry<V>,
    write_lock: Mutex<()>,
    outbox: Mutex<Outbox<V>>,
    clock: AtomicU64,
}

impl<V: Cacheable> CacheStore<V> {
    pub fn new(provider: Box<dyn CacheProvider<V>>) -> Self {
        Self {
            provider,
            subscribers: SubscriptionRegistry::new(),
            write_lock: Mutex::new(()),
            outbox: Mutex::new(Outbox {
                queue: VecDeque::new(),
                draining: false,
            }),
            clock: AtomicU64::new(0),
        }
    }

    /// Current entry for `key`, created empty on first access
    pub fn get(&self, key: &CacheKey) -> CacheEntry<V> {
        if let Some(entry) = self.provider.get(key) {
            return entry;
        }

        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        // Another writer may have created it while we waited for the lock
        if let Some(entry) = self.provider.get(key) {
            return entry;
        }
        let entry = CacheEntry::empty(key.clone());
        self.provider.insert(entry.clone());
        entry
    }

    /// Replace data and error, clear `is_validating`, notify
    pub fn set(
        &self,
        key: &CacheKey,
        data: Option<Arc<V>>,
        error: Option<RemoteError>,
    ) -> CacheEntry<V> {
        self.update(key, |entry, now| {
            entry.data = data;
            entry.error = error;
            entry.updated_at = now;
            entry.is_validating = false;
        })
    }

    /// Record a fetch failure without touching cached data, clear
    /// `is_validating`, notify
    pub fn set_error(&self, key: &CacheKey, error: RemoteError) -> CacheEntry<V> {
        self.update(key, |entry, now| {
            entry.error = Some(error);
            entry.updated_at = now;
            entry.is_validating = false;
        })
    }

    /// Local write that leaves `is_validating` alone, so it stays accurate
    /// while a fetch is in flight
    pub fn put(
        &self,
        key: &CacheKey,
        data: Option<Arc<V>>,
        error: Option<RemoteError>,
    ) -> CacheEntry<V> {
        self.update(key, |entry, now| {
            entry.data = data;
            entry.error = error;
            entry.updated_at = now;
        })
    }

    pub fn mark_validating(&self, key: &CacheKey, validating: bool) -> CacheEntry<V> {
        self.update(key, |entry, _| entry.is_validating = validating)
    }

    /// Write `data`/`error` back only if nothing was written to the entry
    /// after `expected_updated_at`. Returns whether the write happened.
    pub fn restore(
        &self,
        key: &CacheKey,
        data: Option<Arc<V>>,
        error: Option<RemoteError>,
        expected_updated_at: u64,
    ) -> bool {
        let written = {
            let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
            let mut entry = self
                .provider
                .get(key)
                .unwrap_or_else(|| CacheEntry::empty(key.clone()));
            if entry.updated_at == expected_updated_at {
                entry.data = data;
                entry.error = error;
                entry.updated_at = self.tick();
                self.commit(entry);
                true
            } else {
                false
            }
        };

        if written {
            self.drain();
        } else {
            debug!("Skipping restore for key {}: entry was rewritten", key);
        }
        written
    }

    /// Register `listener` for changes to `key`
    pub fn subscribe<L>(&self, key: &CacheKey, listener: L) -> Subscription
    where
        L: Fn(&EntryView<V>) + Send + Sync + 'static,
    {
        self.subscribers.subscribe(key, Arc::new(listener), None)
    }

    pub(crate) fn subscribe_reader(
        &self,
        key: &CacheKey,
        listener: Listener<V>,
        fetcher: Arc<dyn Fetcher<V>>,
    ) -> Subscription {
        self.subscribers.subscribe(key, listener, Some(fetcher))
    }

    /// Fetcher of the first active reader of `key`
    pub fn revalidator(&self, key: &CacheKey) -> Option<Arc<dyn Fetcher<V>>> {
        self.subscribers.revalidator(key)
    }

    pub fn subscriber_count(&self, key: &CacheKey) -> usize {
        self.subscribers.count(key)
    }

    pub fn keys(&self) -> Vec<CacheKey> {
        self.provider.keys()
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn update(
        &self,
        key: &CacheKey,
        apply: impl FnOnce(&mut CacheEntry<V>, u64),
    ) -> CacheEntry<V> {
        let entry = {
            let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
            let mut entry = self
                .provider
                .get(key)
                .unwrap_or_else(|| CacheEntry::empty(key.clone()));
            apply(&mut entry, self.tick());
            self.commit(entry.clone());
            entry
        };

        self.drain();
        entry
    }

    /// Store `entry` and queue its view. Caller holds `write_lock`.
    fn commit(&self, entry: CacheEntry<V>) {
        let view = entry.view();
        let key = entry.key.clone();
        self.provider.insert(entry);
        self.outbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .queue
            .push_back((key, view));
    }

    /// Deliver queued views unless another caller is already delivering
    fn drain(&self) {
        {
            let mut outbox = self.outbox.lock().unwrap_or_else(PoisonError::into_inner);
            if outbox.draining {
                return;
            }
            outbox.draining = true;
        }

        let mut reset = DrainReset {
            outbox: &self.outbox,
            armed: true,
        };
        loop {
            let (key, view) = {
                let mut outbox = self.outbox.lock().unwrap_or_else(PoisonError::into_inner);
                match outbox.queue.pop_front() {
                    Some(next) => next,
                    None => {
                        outbox.draining = false;
                        break;
                    }
                }
            };
            self.subscribers.notify(&key, &view);
        }
        reset.armed = false;
    }
}

/// Releases the drain role if a listener panics mid-delivery
struct DrainReset<'a, V> {
    outbox: &'a Mutex<Outbox<V>>,
    armed: bool,
}

impl<V> Drop for DrainReset<'_, V> {
    fn drop(&mut self) {
        if self.armed {
            self.outbox
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .draining = false;
        }
    }
}
