//! Subscription registry
//!
//! Subscribers are kept per key in registration order. Each one carries an
//! `active` flag that is cleared on unsubscribe before it is removed, so a
//! subscriber dropped in the middle of a notification pass is skipped by
//! the rest of that pass.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, PoisonError, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use crate::{CacheKey, Cacheable, EntryView, Fetcher};

pub(crate) type Listener<V> = Arc<dyn Fn(&EntryView<V>) + Send + Sync + 'static>;

struct Subscriber<V> {
    id: u64,
    active: AtomicBool,
    listener: Listener<V>,
    /// Fetcher of a reader, used to revalidate the key on its behalf
    revalidator: Option<Arc<dyn Fetcher<V>>>,
}

struct RegistryInner<V> {
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<CacheKey, Vec<Arc<Subscriber<V>>>>>,
}

impl<V> RegistryInner<V> {
    fn remove(&self, key: &CacheKey, id: u64) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(list) = subscribers.get_mut(key) {
            list.retain(|s| {
                if s.id == id {
                    s.active.store(false, Ordering::SeqCst);
                    false
                } else {
                    true
                }
            });
            if list.is_empty() {
                subscribers.remove(key);
            }
        }
    }
}

pub(crate) struct SubscriptionRegistry<V> {
    inner: Arc<RegistryInner<V>>,
}

impl<V: Cacheable> SubscriptionRegistry<V> {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                next_id: AtomicU64::new(0),
                subscribers: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub(crate) fn subscribe(
        &self,
        key: &CacheKey,
        listener: Listener<V>,
        revalidator: Option<Arc<dyn Fetcher<V>>>,
    ) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.clone())
            .or_default()
            .push(Arc::new(Subscriber {
                id,
                active: AtomicBool::new(true),
                listener,
                revalidator,
            }));

        let registry = Arc::downgrade(&self.inner);
        let key = key.clone();
        Subscription {
            key: key.clone(),
            cancel: Some(Box::new(move || {
                if let Some(registry) = Weak::upgrade(&registry) {
                    registry.remove(&key, id);
                }
            })),
        }
    }

    /// Call every active subscriber of `key`, in registration order
    pub(crate) fn notify(&self, key: &CacheKey, view: &EntryView<V>) {
        // Listeners may subscribe or unsubscribe, so call them unlocked
        let snapshot = match self
            .inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
        {
            Some(list) => list.clone(),
            None => return,
        };

        for subscriber in snapshot {
            if subscriber.active.load(Ordering::SeqCst) {
                (subscriber.listener)(view);
            }
        }
    }

    pub(crate) fn revalidator(&self, key: &CacheKey) -> Option<Arc<dyn Fetcher<V>>> {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)?
            .iter()
            .filter(|s| s.active.load(Ordering::SeqCst))
            .find_map(|s| s.revalidator.clone())
    }

    pub(crate) fn count(&self, key: &CacheKey) -> usize {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map_or(0, Vec::len)
    }
}

/// Handle for one subscription; unsubscribes when dropped
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    key: CacheKey,
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn unsubscribe(mut self) {
        self.cancel_now();
    }

    fn cancel_now(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel_now();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("active", &self.cancel.is_some())
            .finish()
    }
}
