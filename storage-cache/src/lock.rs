//! Cache-lock mode: one of the three interchangeable Lock Manager
//! implementations described in spec.md §4.2. Required for cache-only
//! collections, which have no backing `user_collections` row to take a
//! database row lock on.

use crate::client::{CacheClient, CacheKeys};
use crate::error::CacheError;

/// Ceiling TTL on a cache lock: a holder that crashes without releasing
/// still frees the lock after this long.
pub const DEFAULT_LOCK_TTL_SECS: u32 = 5 * 60;

pub struct CacheLock<'a> {
    client: &'a CacheClient,
    key: String,
}

impl<'a> CacheLock<'a> {
    /// Attempts to acquire the soft lock for `(user_id, collection)`.
    /// Fails (rather than blocking) when the lock is already held,
    /// matching spec.md §4.2's "any lock acquisition may fail with
    /// Conflict rather than block unbounded."
    pub async fn acquire(
        client: &'a CacheClient,
        user_id: &str,
        collection: &str,
        ttl_secs: u32,
    ) -> Result<CacheLock<'a>, CacheError> {
        let key = CacheKeys::lock(user_id, collection);
        if client.acquire_lock(&key, ttl_secs as u64 * 1000).await? {
            Ok(CacheLock { client, key })
        } else {
            Err(CacheError::cas_conflict())
        }
    }

    pub async fn release(self) -> Result<(), CacheError> {
        self.client.release_lock(&self.key).await
    }
}

#[cfg(test)]
mod tests {
    use super::DEFAULT_LOCK_TTL_SECS;

    #[test]
    fn default_ttl_matches_spec() {
        assert_eq!(DEFAULT_LOCK_TTL_SECS, 300);
    }
}
