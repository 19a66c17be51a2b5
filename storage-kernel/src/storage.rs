//! `SyncStorage`: the composition facade tying the Durable Store, Cache
//! Coordinator, Lock Manager, and Batch Pipeline into the single write
//! and read data flows described in spec.md's system overview — lock,
//! quota-check, durable write, release, with the cache refresh/invalidate
//! already folded into each [`Db`] method by whichever [`Db`] implementation
//! is handed in (a bare backend pool connection, or one wrapped by
//! [`storage_cache::CacheCoordinator`]).
//!
//! This module implements no HTTP; it is the boundary the Protocol
//! Adapter calls into.

use std::sync::Arc;

use storage_batch::{BatchError, BatchWriteResult, BodyFormat};
use storage_cache::{CacheClient, Classifier};
use storage_settings::{Quota, ServerLimits};
use storage_types::{error::DbErrorIntrospect, params, results, Db, UserIdentifier};

use crate::error::KernelError;
use crate::lock::LockManager;
use crate::precondition::{self, Precondition};
use crate::quota::QuotaAccountant;

pub struct SyncStorage {
    lock_manager: LockManager,
    quota: QuotaAccountant,
    limits: ServerLimits,
}

/// Finishes whatever transaction `lock_for_read`/`lock_for_write` opened
/// on `db`, the way the teacher's `DbTransactionPool::transaction_internal`
/// does around a request handler: commit on success, rollback (keeping
/// the original error, not the rollback's) on failure. `Db::commit`/
/// `Db::rollback` are no-ops when no implicit transaction was opened
/// (cache-lock mode never calls `begin` on `db` at all), so this is safe
/// to call unconditionally regardless of which lock mode was used.
async fn finish<T, E>(
    db: &mut dyn Db<Error = E>,
    result: Result<T, KernelError<E>>,
) -> Result<T, KernelError<E>>
where
    E: DbErrorIntrospect,
{
    match result {
        Ok(value) => {
            db.commit().await.map_err(KernelError::from_backend)?;
            Ok(value)
        }
        Err(e) => {
            let _ = db.rollback().await;
            Err(e)
        }
    }
}

impl SyncStorage {
    pub fn new(
        classifier: Arc<Classifier>,
        cache: CacheClient,
        lock_ttl_secs: u32,
        quota: Quota,
        limits: ServerLimits,
    ) -> Self {
        SyncStorage {
            lock_manager: LockManager::new(classifier, cache, lock_ttl_secs),
            quota: QuotaAccountant::new(quota),
            limits,
        }
    }

    pub async fn put_bso<E>(
        &self,
        db: &mut dyn Db<Error = E>,
        bso: params::PutBso,
        precondition: Precondition,
    ) -> Result<results::PutBso, KernelError<E>>
    where
        E: DbErrorIntrospect,
    {
        let additional_bytes = bso.payload.as_ref().map_or(0, |p| p.len());
        let lock = self
            .lock_manager
            .acquire_write(db, &bso.user_id, &bso.collection)
            .await?;

        let result = match self.check_precondition(db, &bso.user_id, &bso.collection, Some(&bso.id), precondition).await {
            Ok(()) => match self
                .quota
                .check_before_write(db, &bso.user_id, additional_bytes)
                .await
            {
                Ok(()) => {
                    let user_id = bso.user_id.clone();
                    let outcome = db.put_bso(bso).await.map_err(KernelError::from_backend);
                    if outcome.is_ok() {
                        self.quota.invalidate(&user_id);
                    }
                    outcome
                }
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };
        let result = finish(db, result).await;

        lock.release().await?;
        result
    }

    /// Precondition-check stage of spec.md §9's middleware chain: looks
    /// up the named resource's current timestamp and evaluates it
    /// against `precondition`, short-circuiting the caller with a 304 or
    /// 412 [`KernelError`] before any quota check or mutation runs.
    async fn check_precondition<E>(
        &self,
        db: &mut dyn Db<Error = E>,
        user_id: &UserIdentifier,
        collection: &str,
        id: Option<&str>,
        precondition: Precondition,
    ) -> Result<(), KernelError<E>>
    where
        E: DbErrorIntrospect,
    {
        if matches!(precondition, Precondition::None) {
            return Ok(());
        }
        let resource_ts = precondition::resource_timestamp(db, user_id, Some(collection), id).await?;
        precondition.check(resource_ts)
    }

    /// Runs the Batch Pipeline (spec.md §4.4) under a write lock.
    ///
    /// Note: the pipeline takes its own row-lock internally
    /// (`Db::lock_for_write`) rather than going through
    /// [`LockManager`], so a cache-only collection batch-uploaded here
    /// still takes a row lock on the Durable Store rather than a cache
    /// lock. Single-item writes ([`Self::put_bso`]) do not have this
    /// limitation.
    pub async fn post_bsos<E>(
        &self,
        db: &mut dyn Db<Error = E>,
        user_id: UserIdentifier,
        collection: String,
        format: BodyFormat,
        body: &str,
    ) -> Result<BatchWriteResult, BatchError<E>>
    where
        E: DbErrorIntrospect + std::fmt::Display + std::fmt::Debug + 'static,
    {
        let user_id_for_invalidate = user_id.clone();
        let result = storage_batch::write_bsos(
            db,
            user_id,
            collection,
            format,
            body,
            &self.limits,
            &self.quota.quota(),
        )
        .await;
        if result.is_ok() {
            self.quota.invalidate(&user_id_for_invalidate);
        }
        result
    }

    pub async fn get_bso<E>(
        &self,
        db: &mut dyn Db<Error = E>,
        params: params::GetBso,
        precondition: Precondition,
    ) -> Result<Option<results::GetBso>, KernelError<E>>
    where
        E: DbErrorIntrospect,
    {
        let lock = self
            .lock_manager
            .acquire_read(db, &params.user_id, &params.collection)
            .await?;
        let result = match self
            .check_precondition(db, &params.user_id, &params.collection, Some(&params.id), precondition)
            .await
        {
            Ok(()) => db.get_bso(params).await.map_err(KernelError::from_backend),
            Err(e) => Err(e),
        };
        let result = finish(db, result).await;
        lock.release().await?;
        result
    }

    pub async fn get_bsos<E>(
        &self,
        db: &mut dyn Db<Error = E>,
        params: params::GetBsos,
        precondition: Precondition,
    ) -> Result<results::GetBsos, KernelError<E>>
    where
        E: DbErrorIntrospect,
    {
        let lock = self
            .lock_manager
            .acquire_read(db, &params.user_id, &params.collection)
            .await?;
        let result = match self
            .check_precondition(db, &params.user_id, &params.collection, None, precondition)
            .await
        {
            Ok(()) => db
                .get_bsos(params)
                .await
                .map_err(KernelError::from_backend),
            Err(e) => Err(e),
        };
        let result = finish(db, result).await;
        lock.release().await?;
        result
    }

    pub async fn delete_bso<E>(
        &self,
        db: &mut dyn Db<Error = E>,
        params: params::DeleteBso,
        precondition: Precondition,
    ) -> Result<results::DeleteBso, KernelError<E>>
    where
        E: DbErrorIntrospect,
    {
        let user_id = params.user_id.clone();
        let lock = self
            .lock_manager
            .acquire_write(db, &params.user_id, &params.collection)
            .await?;
        let result = match self
            .check_precondition(db, &params.user_id, &params.collection, Some(&params.id), precondition)
            .await
        {
            Ok(()) => {
                let outcome = db
                    .delete_bso(params)
                    .await
                    .map_err(KernelError::from_backend);
                if outcome.is_ok() {
                    self.quota.invalidate(&user_id);
                }
                outcome
            }
            Err(e) => Err(e),
        };
        let result = finish(db, result).await;
        lock.release().await?;
        result
    }

    pub async fn delete_bsos<E>(
        &self,
        db: &mut dyn Db<Error = E>,
        params: params::DeleteBsos,
        precondition: Precondition,
    ) -> Result<results::DeleteBsos, KernelError<E>>
    where
        E: DbErrorIntrospect,
    {
        let user_id = params.user_id.clone();
        let lock = self
            .lock_manager
            .acquire_write(db, &params.user_id, &params.collection)
            .await?;
        let result = match self
            .check_precondition(db, &params.user_id, &params.collection, None, precondition)
            .await
        {
            Ok(()) => {
                let outcome = db
                    .delete_bsos(params)
                    .await
                    .map_err(KernelError::from_backend);
                if outcome.is_ok() {
                    self.quota.invalidate(&user_id);
                }
                outcome
            }
            Err(e) => Err(e),
        };
        let result = finish(db, result).await;
        lock.release().await?;
        result
    }

    pub async fn delete_collection<E>(
        &self,
        db: &mut dyn Db<Error = E>,
        params: params::DeleteCollection,
        precondition: Precondition,
    ) -> Result<results::DeleteCollection, KernelError<E>>
    where
        E: DbErrorIntrospect,
    {
        let user_id = params.user_id.clone();
        let lock = self
            .lock_manager
            .acquire_write(db, &params.user_id, &params.collection)
            .await?;
        let result = match self
            .check_precondition(db, &params.user_id, &params.collection, None, precondition)
            .await
        {
            Ok(()) => {
                let outcome = db
                    .delete_collection(params)
                    .await
                    .map_err(KernelError::from_backend);
                if outcome.is_ok() {
                    self.quota.invalidate(&user_id);
                }
                outcome
            }
            Err(e) => Err(e),
        };
        let result = finish(db, result).await;
        lock.release().await?;
        result
    }

    /// Spec.md `/info/collections`. Spans every one of the user's
    /// collections, so (like [`Self::delete_storage`]) no single
    /// collection lock applies; readers get whatever snapshot the
    /// underlying `Db` gives them.
    pub async fn get_collection_timestamps<E>(
        &self,
        db: &mut dyn Db<Error = E>,
        user_id: UserIdentifier,
    ) -> Result<results::GetCollectionTimestamps, KernelError<E>>
    where
        E: DbErrorIntrospect,
    {
        db.get_collection_timestamps(user_id)
            .await
            .map_err(KernelError::from_backend)
    }

    /// Spec.md `/info/collection_counts`.
    pub async fn get_collection_counts<E>(
        &self,
        db: &mut dyn Db<Error = E>,
        user_id: UserIdentifier,
    ) -> Result<results::GetCollectionCounts, KernelError<E>>
    where
        E: DbErrorIntrospect,
    {
        db.get_collection_counts(user_id)
            .await
            .map_err(KernelError::from_backend)
    }

    /// Spec.md `/info/collection_usage`.
    pub async fn get_collection_usage<E>(
        &self,
        db: &mut dyn Db<Error = E>,
        user_id: UserIdentifier,
    ) -> Result<results::GetCollectionUsage, KernelError<E>>
    where
        E: DbErrorIntrospect,
    {
        db.get_collection_usage(user_id)
            .await
            .map_err(KernelError::from_backend)
    }

    pub async fn get_storage_timestamp<E>(
        &self,
        db: &mut dyn Db<Error = E>,
        user_id: UserIdentifier,
    ) -> Result<results::GetStorageTimestamp, KernelError<E>>
    where
        E: DbErrorIntrospect,
    {
        db.get_storage_timestamp(user_id)
            .await
            .map_err(KernelError::from_backend)
    }

    /// Spec.md `/info/quota`: `[used_kib, quota_kib_or_null]`, sourced
    /// through the Quota Accountant (§4.5) so the cached `size` is used
    /// when fresh rather than always hitting the Durable Store.
    pub async fn get_quota_usage<E>(
        &self,
        db: &mut dyn Db<Error = E>,
        user_id: UserIdentifier,
    ) -> Result<crate::quota::QuotaUsage, KernelError<E>>
    where
        E: DbErrorIntrospect,
    {
        self.quota.quota_usage(db, &user_id).await
    }

    /// Deletes all of a user's storage. Spans every collection, so no
    /// single collection lock applies; the Durable Store implementation
    /// is responsible for making this atomic.
    pub async fn delete_storage<E>(
        &self,
        db: &mut dyn Db<Error = E>,
        user_id: UserIdentifier,
        precondition: Precondition,
    ) -> Result<results::DeleteStorage, KernelError<E>>
    where
        E: DbErrorIntrospect,
    {
        if !matches!(precondition, Precondition::None) {
            let resource_ts = precondition::resource_timestamp(db, &user_id, None, None).await?;
            precondition.check(resource_ts)?;
        }
        let result = db
            .delete_storage(user_id.clone())
            .await
            .map_err(KernelError::from_backend);
        if result.is_ok() {
            self.quota.invalidate(&user_id);
        }
        result
    }
}
