//! Backing storage for cache entries
//!
//! The store never evicts; a provider only has to remember what it is given.
//! `MemoryProvider` is the default. `MokaProvider` keeps entries in an
//! unbounded Moka cache for callers that already share one concurrent map
//! implementation across their process.

use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};

use moka::sync::Cache;

use crate::{CacheEntry, CacheKey, Cacheable};

/// A key → entry mapping backing a [`CacheStore`](crate::CacheStore)
pub trait CacheProvider<V>: Send + Sync + 'static {
    fn get(&self, key: &CacheKey) -> Option<CacheEntry<V>>;

    fn insert(&self, entry: CacheEntry<V>);

    fn keys(&self) -> Vec<CacheKey>;
}

/// Which built-in provider a cache is created with
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProviderKind {
    /// `HashMap` behind a lock
    #[default]
    Memory,
    /// Unbounded `moka::sync::Cache`
    Moka,
}

impl ProviderKind {
    /// Produce a fresh, empty provider of this kind
    pub fn build<V: Cacheable>(self) -> Box<dyn CacheProvider<V>> {
        match self {
            Self::Memory => Box::new(MemoryProvider::default()),
            Self::Moka => Box::new(MokaProvider::default()),
        }
    }
}

/// In-memory provider
pub struct MemoryProvider<V> {
    entries: RwLock<HashMap<CacheKey, CacheEntry<V>>>,
}

impl<V> Default for MemoryProvider<V> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl<V: Cacheable> CacheProvider<V> for MemoryProvider<V> {
    fn get(&self, key: &CacheKey) -> Option<CacheEntry<V>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn insert(&self, entry: CacheEntry<V>) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(entry.key.clone(), entry);
    }

    fn keys(&self) -> Vec<CacheKey> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}

/// Moka-backed provider without capacity or TTL
pub struct MokaProvider<V: Cacheable> {
    entries: Cache<CacheKey, CacheEntry<V>>,
}

impl<V: Cacheable> Default for MokaProvider<V> {
    fn default() -> Self {
        Self {
            entries: Cache::builder().build(),
        }
    }
}

impl<V: Cacheable> CacheProvider<V> for MokaProvider<V> {
    fn get(&self, key: &CacheKey) -> Option<CacheEntry<V>> {
        self.entries.get(key)
    }

    fn insert(&self, entry: CacheEntry<V>) {
        self.entries.insert(entry.key.clone(), entry);
    }

    fn keys(&self) -> Vec<CacheKey> {
        self.entries
            .iter()
            .map(|(key, _)| Arc::unwrap_or_clone(key))
            .collect()
    }
}
