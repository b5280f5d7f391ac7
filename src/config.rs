//! Cache configuration

use std::time::Duration;

use crate::{CacheError, ProviderKind};

/// Configuration for an [`SwrCache`](crate::SwrCache)
#[derive(Debug, Clone)]
pub struct SwrConfig {
    /// Window after a fetch settles during which new requests for the same
    /// key are answered from the cache. Zero disables it.
    pub deduping_interval: Duration,
    /// Additional attempts after a failed fetch before the failure is
    /// recorded. Zero surfaces the first failure.
    pub error_retry_count: u32,
    /// Base delay between retries, doubled per attempt
    pub error_retry_interval: Duration,
    /// Refetch keys that already hold data when they are read
    pub revalidate_if_stale: bool,
    /// Backing key → entry mapping created for each cache
    pub provider: ProviderKind,
}

impl Default for SwrConfig {
    fn default() -> Self {
        Self {
            deduping_interval: Duration::from_secs(2),
            error_retry_count: 5,
            error_retry_interval: Duration::from_secs(5),
            revalidate_if_stale: true,
            provider: ProviderKind::Memory,
        }
    }
}

impl SwrConfig {
    /// Reject option combinations the coordinators cannot honor
    pub fn validate(&self) -> Result<(), CacheError> {
        if self.error_retry_count > 0 && self.error_retry_interval.is_zero() {
            return Err(CacheError::InvalidConfig(
                "error_retry_interval must be non-zero when error_retry_count > 0".to_owned(),
            ));
        }
        Ok(())
    }
}
