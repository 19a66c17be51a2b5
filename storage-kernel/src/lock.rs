//! The Lock Manager (spec.md §4.2): dispatches to row-lock mode for any
//! collection the Durable Store owns, or cache-lock mode for
//! cache-only collections that have no backing row to lock. Snapshot
//! mode (the third interchangeable mode the spec names) is a property
//! of how a given [`Db`] implements its row lock, not a choice made
//! here.

use std::fmt;
use std::sync::Arc;

use storage_cache::{CacheClient, CacheKeys, CacheLock, Classifier, CollectionClass};
use storage_types::{error::DbErrorIntrospect, params, Db, UserIdentifier};

use crate::error::KernelError;

pub struct LockManager {
    classifier: Arc<Classifier>,
    cache: CacheClient,
    lock_ttl_secs: u32,
}

/// A held lock, released by dropping it (row-lock mode, finalized when
/// the caller commits/rolls back the transaction) or by explicit
/// [`HeldLock::release`] (cache-lock mode, which has no transaction to
/// piggyback on).
pub enum HeldLock<'a> {
    Row,
    Cache(CacheLock<'a>),
}

impl<'a> HeldLock<'a> {
    pub async fn release<E>(self) -> Result<(), KernelError<E>> {
        if let HeldLock::Cache(lock) = self {
            lock.release().await.map_err(KernelError::cache)?;
        }
        Ok(())
    }
}

impl LockManager {
    pub fn new(classifier: Arc<Classifier>, cache: CacheClient, lock_ttl_secs: u32) -> Self {
        LockManager {
            classifier,
            cache,
            lock_ttl_secs,
        }
    }

    fn is_cache_locked(&self, collection: &str) -> bool {
        matches!(
            self.classifier.classify(collection),
            CollectionClass::CacheOnly
        )
    }

    pub async fn acquire_read<'a, E>(
        &'a self,
        db: &mut dyn Db<Error = E>,
        user_id: &UserIdentifier,
        collection: &str,
    ) -> Result<HeldLock<'a>, KernelError<E>>
    where
        E: DbErrorIntrospect,
    {
        if self.is_cache_locked(collection) {
            self.acquire_cache_lock(user_id, collection).await
        } else {
            db.lock_for_read(params::LockCollection {
                user_id: user_id.clone(),
                collection: collection.to_owned(),
            })
            .await
            .map_err(KernelError::from_backend)?;
            Ok(HeldLock::Row)
        }
    }

    pub async fn acquire_write<'a, E>(
        &'a self,
        db: &mut dyn Db<Error = E>,
        user_id: &UserIdentifier,
        collection: &str,
    ) -> Result<HeldLock<'a>, KernelError<E>>
    where
        E: DbErrorIntrospect,
    {
        if self.is_cache_locked(collection) {
            self.acquire_cache_lock(user_id, collection).await
        } else {
            db.lock_for_write(params::LockCollection {
                user_id: user_id.clone(),
                collection: collection.to_owned(),
            })
            .await
            .map_err(KernelError::from_backend)?;
            Ok(HeldLock::Row)
        }
    }

    async fn acquire_cache_lock<'a, E>(
        &'a self,
        user_id: &UserIdentifier,
        collection: &str,
    ) -> Result<HeldLock<'a>, KernelError<E>> {
        let key = CacheKeys::user_key(user_id);
        let lock = CacheLock::acquire(&self.cache, &key, collection, self.lock_ttl_secs)
            .await
            .map_err(KernelError::cache)?;
        Ok(HeldLock::Cache(lock))
    }
}

impl fmt::Debug for LockManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockManager")
            .field("lock_ttl_secs", &self.lock_ttl_secs)
            .finish()
    }
}
