//! swrcache - Stale-while-revalidate client cache
//!
//! This library provides the coordination core of a client-side data cache:
//! - Cached values served immediately, refreshed in the background
//! - One in-flight fetch per key, shared by every concurrent reader
//! - Configurable deduping interval and retry/backoff for failed fetches
//! - Stale-on-error: a failed refresh keeps the previously cached value
//! - Mutations whose completion never waits on the revalidation they trigger
//! - Optimistic updates with rollback on failure
//!
//! Fetchers and writers are injected async functions; the crate never talks
//! to a transport itself.

mod config;
mod error;
mod fetch;
mod key;
mod mutation;
mod provider;
mod registry;
mod store;
mod swr_cache;

pub use config::SwrConfig;
pub use error::{BoxError, CacheError, RemoteError};
pub use fetch::{FetchCoordinator, FetchHandle, FetchResult, Fetcher};
pub use key::{CacheKey, normalize};
pub use mutation::{Mutation, MutationCoordinator, MutationOptions, MutationState, Writer};
pub use provider::{CacheProvider, MemoryProvider, MokaProvider, ProviderKind};
pub use registry::Subscription;
pub use store::{CacheEntry, CacheStore, Cacheable, EntryView};
pub use swr_cache::SwrCache;

// Re-export async_trait for convenience
pub use async_trait::async_trait;
