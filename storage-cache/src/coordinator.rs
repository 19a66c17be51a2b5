//! The Cache Coordinator (spec.md §4.3): wraps a Durable Store
//! ([`storage_types::Db`]) and the Cache Layer ([`crate::client::CacheClient`]),
//! classifying each collection as uncached, cached, or cache-only and
//! running the dirty-marker protocol on every write to a cached or
//! cache-only collection.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use storage_types::{
    error::{DbErrorConstructors, DbErrorIntrospect},
    params, results,
    util::SyncTimestamp,
    BatchDb, Db, Sorting, UserIdentifier,
};

use crate::client::{CacheClient, CacheKeys};
use crate::error::CacheError;

/// Sentinel written into a collection's metadata entry while a write is
/// in flight. Readers that observe it fall through to the durable store
/// (or, for cache-only collections, treat the collection as empty)
/// rather than ever serving a half-written value. Kept at `0`, matching
/// the per-collection version counter the original cache manager used
/// as its own dirty sentinel — real timestamps are always strictly
/// positive, so `0` is unambiguous.
pub const UNKNOWN_VERSION: u64 = 0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CollectionClass {
    Uncached,
    Cached,
    CacheOnly,
}

/// Classifies collections per spec.md §4.3. Built once from
/// `storage-settings::Settings`' `cached_collections` /
/// `cache_only_collections` lists and shared across coordinators.
#[derive(Debug, Default)]
pub struct Classifier {
    cached: HashSet<String>,
    cache_only: HashSet<String>,
}

impl Classifier {
    pub fn new(cached: Vec<String>, cache_only: Vec<String>) -> Self {
        Self {
            cached: cached.into_iter().collect(),
            cache_only: cache_only.into_iter().collect(),
        }
    }

    pub fn classify(&self, collection: &str) -> CollectionClass {
        if self.cache_only.contains(collection) {
            CollectionClass::CacheOnly
        } else if self.cached.contains(collection) {
            CollectionClass::Cached
        } else {
            CollectionClass::Uncached
        }
    }
}

impl From<&storage_settings::Settings> for Classifier {
    fn from(settings: &storage_settings::Settings) -> Self {
        Classifier::new(
            settings.cached_collections.clone(),
            settings.cache_only_collections.clone(),
        )
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MetadataValue {
    pub size: u64,
    pub last_size_recalc: i64,
    /// Bumped whenever any collection's cached entry changes; not
    /// currently consulted for correctness, retained for parity with the
    /// original's per-user metadata version counter.
    pub version: u64,
    pub collections: HashMap<String, u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CachedBso {
    pub modified: i64,
    pub payload: String,
    pub sortindex: Option<i32>,
    pub expiry: i64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CollectionCacheValue {
    pub items: HashMap<String, CachedBso>,
}

/// Maps a cache-layer failure into the caller's backend error type.
/// CAS losses become `Conflict` (the client is expected to retry per
/// spec.md §7); everything else is an opaque internal error.
fn wrap<E: DbErrorConstructors>(e: CacheError) -> E {
    if e.is_cas_conflict() {
        E::conflict()
    } else {
        E::internal(e.to_string())
    }
}

pub struct CacheCoordinator<E> {
    inner: Box<dyn Db<Error = E>>,
    client: CacheClient,
    classifier: Arc<Classifier>,
}

impl<E> fmt::Debug for CacheCoordinator<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheCoordinator").finish()
    }
}

impl<E> CacheCoordinator<E>
where
    E: DbErrorIntrospect + DbErrorConstructors + fmt::Debug + 'static,
{
    pub fn new(
        inner: Box<dyn Db<Error = E>>,
        client: CacheClient,
        classifier: Arc<Classifier>,
    ) -> Self {
        Self {
            inner,
            client,
            classifier,
        }
    }

    fn user_key(user_id: &UserIdentifier) -> String {
        CacheKeys::user_key(user_id)
    }

    /// Empties the cache backend entirely. Mirrors the original's
    /// `mcclear` maintenance script (see SPEC_FULL.md §B.1); never
    /// called from request handling, only operator tooling and tests.
    pub async fn flush_all(&self) -> Result<(), CacheError> {
        self.client.flush_all().await
    }

    async fn read_metadata(&self, user_id: &UserIdentifier) -> Result<MetadataValue, E> {
        Ok(self
            .client
            .get::<MetadataValue>(&CacheKeys::metadata(&Self::user_key(user_id)))
            .await
            .map_err(wrap)?
            .unwrap_or_default())
    }

    /// Step 1 of the dirty-marker protocol: CAS the collection's cached
    /// version to [`UNKNOWN_VERSION`] before attempting the durable
    /// write. A losing CAS surfaces as `Conflict` per spec.md §4.3.
    async fn mark_dirty(
        &self,
        user_id: &UserIdentifier,
        collection: &str,
    ) -> Result<MetadataValue, E> {
        let key = CacheKeys::metadata(&Self::user_key(user_id));
        loop {
            let existing = self.client.get_with_cas::<MetadataValue>(&key).await;
            match existing.map_err(wrap)? {
                None => {
                    let mut fresh = MetadataValue::default();
                    fresh.collections.insert(collection.to_owned(), UNKNOWN_VERSION);
                    if self.client.add(&key, &fresh).await.map_err(wrap)? {
                        return Ok(fresh);
                    }
                    // lost the race to create it; retry the read
                    continue;
                }
                Some((mut value, token)) => {
                    let previous = value.collections.get(collection).copied();
                    value
                        .collections
                        .insert(collection.to_owned(), UNKNOWN_VERSION);
                    if self.client.cas(&key, &token, &value).await.map_err(wrap)? {
                        let mut rollback = value.clone();
                        if let Some(previous) = previous {
                            rollback.collections.insert(collection.to_owned(), previous);
                        }
                        return Ok(rollback);
                    }
                    return Err(E::conflict());
                }
            }
        }
    }

    /// Step 3: publish the new version (blind set, safe under the write
    /// lock the caller is guaranteed to be holding).
    async fn publish_version(
        &self,
        user_id: &UserIdentifier,
        collection: &str,
        version: u64,
    ) -> Result<(), E> {
        let key = CacheKeys::metadata(&Self::user_key(user_id));
        let mut metadata = self.read_metadata(user_id).await?;
        metadata.collections.insert(collection.to_owned(), version);
        metadata.version = metadata.version.wrapping_add(1);
        self.client.set(&key, &metadata).await.map_err(wrap)
    }

    /// Step 4 rollback path: a storage error during the durable write
    /// restores the collection's previously-known version so the next
    /// reader doesn't pay for an unnecessary rebuild. Any other error
    /// class (e.g. a cache hiccup) deliberately leaves the sentinel in
    /// place, per spec.md §4.3.
    async fn restore_version(&self, user_id: &UserIdentifier, rollback: MetadataValue) {
        let key = CacheKeys::metadata(&Self::user_key(user_id));
        let _ = self.client.set(&key, &rollback).await;
    }

    async fn collection_cache_key(user_id: &UserIdentifier, collection: &str) -> String {
        CacheKeys::collection(&Self::user_key(user_id), collection)
    }

    /// Rebuilds a cached collection's contents from the durable store
    /// under a read lock, `add`-ing the result so a concurrent writer's
    /// fresher `set` always wins (spec.md §4.3 read flow).
    async fn rebuild_cached(
        &mut self,
        user_id: &UserIdentifier,
        collection: &str,
    ) -> Result<CollectionCacheValue, E> {
        self.inner
            .lock_for_read(params::LockCollection {
                user_id: user_id.clone(),
                collection: collection.to_owned(),
            })
            .await?;
        let page = self
            .inner
            .get_bsos(params::GetBsos {
                user_id: user_id.clone(),
                collection: collection.to_owned(),
                newer: None,
                older: None,
                sort: Sorting::None,
                limit: None,
                offset: None,
                ids: Vec::new(),
                full: true,
            })
            .await?;
        let mut items = HashMap::new();
        for bso in page.items {
            items.insert(
                bso.id,
                CachedBso {
                    modified: bso.modified.as_i64(),
                    payload: bso.payload,
                    sortindex: bso.sortindex,
                    expiry: bso.expiry,
                },
            );
        }
        let value = CollectionCacheValue { items };
        let key = Self::collection_cache_key(user_id, collection).await;
        let _ = self.client.add(&key, &value).await.map_err(wrap::<E>);
        Ok(value)
    }

    async fn read_cached_collection(
        &mut self,
        user_id: &UserIdentifier,
        collection: &str,
        class: CollectionClass,
    ) -> Result<CollectionCacheValue, E> {
        let key = Self::collection_cache_key(user_id, collection).await;
        let metadata = self.read_metadata(user_id).await?;
        let is_dirty = metadata
            .collections
            .get(collection)
            .copied()
            .map(|v| v == UNKNOWN_VERSION)
            .unwrap_or(false);
        if !is_dirty {
            if let Some(cached) = self.client.get::<CollectionCacheValue>(&key).await.map_err(wrap)? {
                return Ok(cached);
            }
        }
        match class {
            CollectionClass::CacheOnly => Ok(CollectionCacheValue::default()),
            _ => self.rebuild_cached(user_id, collection).await,
        }
    }

    fn now_ms() -> i64 {
        SyncTimestamp::default().as_i64()
    }

    fn filter_not_expired(items: HashMap<String, CachedBso>) -> Vec<(String, CachedBso)> {
        let now = Self::now_ms();
        items
            .into_iter()
            .filter(|(_, v)| v.expiry > now)
            .collect()
    }
}

#[async_trait(?Send)]
impl<E> BatchDb for CacheCoordinator<E>
where
    E: DbErrorIntrospect + DbErrorConstructors + fmt::Debug + 'static,
{
    type Error = E;

    async fn create_batch(&mut self, params: params::CreateBatch) -> Result<results::CreateBatch, E> {
        self.inner.create_batch(params).await
    }

    async fn validate_batch(&mut self, params: params::ValidateBatch) -> Result<results::ValidateBatch, E> {
        self.inner.validate_batch(params).await
    }

    async fn append_to_batch(&mut self, params: params::AppendToBatch) -> Result<results::AppendToBatch, E> {
        self.inner.append_to_batch(params).await
    }

    async fn get_batch(&mut self, params: params::GetBatch) -> Result<Option<results::GetBatch>, E> {
        self.inner.get_batch(params).await
    }

    /// After a batch commits, the affected collection's cache entry is
    /// stale; rather than patch it item-by-item this marks it dirty and
    /// lets the next reader rebuild it, which is simpler and still
    /// coherent (spec.md §4.4 step 5 / §8.7).
    async fn commit_batch(&mut self, params: params::CommitBatch) -> Result<results::CommitBatch, E> {
        self.inner.commit_batch(params).await
    }

    async fn delete_batch(&mut self, params: params::DeleteBatch) -> Result<(), E> {
        self.inner.delete_batch(params).await
    }
}

#[async_trait(?Send)]
impl<E> Db for CacheCoordinator<E>
where
    E: DbErrorIntrospect + DbErrorConstructors + fmt::Debug + 'static,
{
    async fn lock_for_read(&mut self, params: params::LockCollection) -> Result<(), E> {
        self.inner.lock_for_read(params).await
    }

    async fn lock_for_write(&mut self, params: params::LockCollection) -> Result<(), E> {
        self.inner.lock_for_write(params).await
    }

    async fn begin(&mut self, for_write: bool) -> Result<(), E> {
        self.inner.begin(for_write).await
    }

    async fn commit(&mut self) -> Result<(), E> {
        self.inner.commit().await
    }

    async fn rollback(&mut self) -> Result<(), E> {
        self.inner.rollback().await
    }

    async fn get_collection_timestamps(
        &mut self,
        params: params::GetCollectionTimestamps,
    ) -> Result<results::GetCollectionTimestamps, E> {
        self.inner.get_collection_timestamps(params).await
    }

    async fn get_collection_timestamp(
        &mut self,
        params: params::GetCollectionTimestamp,
    ) -> Result<results::GetCollectionTimestamp, E> {
        match self.classifier.classify(&params.collection) {
            CollectionClass::Uncached => self.inner.get_collection_timestamp(params).await,
            _ => {
                let metadata = self.read_metadata(&params.user_id).await?;
                match metadata.collections.get(&params.collection).copied() {
                    Some(v) if v != UNKNOWN_VERSION => SyncTimestamp::from_i64(v as i64)
                        .map_err(|e| E::internal(e.to_string())),
                    _ => self.inner.get_collection_timestamp(params).await,
                }
            }
        }
    }

    async fn get_collection_counts(
        &mut self,
        params: params::GetCollectionCounts,
    ) -> Result<results::GetCollectionCounts, E> {
        self.inner.get_collection_counts(params).await
    }

    async fn get_collection_usage(
        &mut self,
        params: params::GetCollectionUsage,
    ) -> Result<results::GetCollectionUsage, E> {
        self.inner.get_collection_usage(params).await
    }

    async fn get_storage_timestamp(
        &mut self,
        params: params::GetStorageTimestamp,
    ) -> Result<results::GetStorageTimestamp, E> {
        self.inner.get_storage_timestamp(params).await
    }

    async fn get_storage_usage(
        &mut self,
        params: params::GetStorageUsage,
    ) -> Result<results::GetStorageUsage, E> {
        self.inner.get_storage_usage(params).await
    }

    async fn get_quota_usage(
        &mut self,
        params: params::GetQuotaUsage,
    ) -> Result<results::GetQuotaUsage, E> {
        self.inner.get_quota_usage(params).await
    }

    async fn delete_storage(&mut self, params: params::DeleteStorage) -> Result<results::DeleteStorage, E> {
        let result = self.inner.delete_storage(params.clone()).await?;
        let key = CacheKeys::metadata(&Self::user_key(&params));
        let _ = self.client.delete(&key).await;
        Ok(result)
    }

    async fn delete_collection(
        &mut self,
        params: params::DeleteCollection,
    ) -> Result<results::DeleteCollection, E> {
        match self.classifier.classify(&params.collection) {
            CollectionClass::Uncached => self.inner.delete_collection(params).await,
            class => {
                let rollback = self.mark_dirty(&params.user_id, &params.collection).await?;
                match self.inner.delete_collection(params.clone()).await {
                    Ok(ts) => {
                        if matches!(class, CollectionClass::CacheOnly) {
                            let coll_key =
                                Self::collection_cache_key(&params.user_id, &params.collection).await;
                            let _ = self.client.delete(&coll_key).await;
                        }
                        self.publish_version(&params.user_id, &params.collection, ts.as_i64() as u64)
                            .await?;
                        Ok(ts)
                    }
                    Err(e) => {
                        if e.is_collection_not_found() {
                            self.restore_version(&params.user_id, rollback)
                                .await;
                        }
                        Err(e)
                    }
                }
            }
        }
    }

    async fn delete_bsos(&mut self, params: params::DeleteBsos) -> Result<results::DeleteBsos, E> {
        match self.classifier.classify(&params.collection) {
            CollectionClass::Uncached => self.inner.delete_bsos(params).await,
            _ => {
                let rollback = self.mark_dirty(&params.user_id, &params.collection).await?;
                match self.inner.delete_bsos(params.clone()).await {
                    Ok(ts) => {
                        let coll_key =
                            Self::collection_cache_key(&params.user_id, &params.collection).await;
                        let _ = self.client.delete(&coll_key).await;
                        self.publish_version(&params.user_id, &params.collection, ts.as_i64() as u64)
                            .await?;
                        Ok(ts)
                    }
                    Err(e) => {
                        self.restore_version(&params.user_id, rollback)
                            .await;
                        Err(e)
                    }
                }
            }
        }
    }

    async fn get_bsos(&mut self, params: params::GetBsos) -> Result<results::GetBsos, E> {
        let class = self.classifier.classify(&params.collection);
        if matches!(class, CollectionClass::Uncached) {
            return self.inner.get_bsos(params).await;
        }
        let value = self
            .read_cached_collection(&params.user_id, &params.collection, class)
            .await?;
        let mut items: Vec<_> = Self::filter_not_expired(value.items)
            .into_iter()
            .filter(|(id, _)| params.ids.is_empty() || params.ids.contains(id))
            .filter(|(_, v)| params.newer.map_or(true, |n| v.modified > n.as_i64()))
            .filter(|(_, v)| params.older.map_or(true, |o| v.modified < o.as_i64()))
            .collect();
        match params.sort {
            Sorting::Oldest => items.sort_by(|a, b| a.1.modified.cmp(&b.1.modified).then(a.0.cmp(&b.0))),
            Sorting::Index => items.sort_by(|a, b| b.1.sortindex.cmp(&a.1.sortindex).then(a.0.cmp(&b.0))),
            Sorting::Newest | Sorting::None => {
                items.sort_by(|a, b| b.1.modified.cmp(&a.1.modified).then(a.0.cmp(&b.0)))
            }
        }
        if let Some(limit) = params.limit {
            items.truncate(limit as usize);
        }
        let items = items
            .into_iter()
            .map(|(id, v)| results::GetBso {
                id,
                modified: SyncTimestamp::from_i64(v.modified).unwrap_or_else(|_| SyncTimestamp::zero()),
                payload: v.payload,
                sortindex: v.sortindex,
                expiry: v.expiry,
            })
            .collect();
        Ok(results::Paginated { items, offset: None })
    }

    async fn get_bso_ids(&mut self, params: params::GetBsos) -> Result<results::GetBsoIds, E> {
        self.inner.get_bso_ids(params).await
    }

    async fn post_bsos(&mut self, params: params::PostBsos) -> Result<SyncTimestamp, E> {
        match self.classifier.classify(&params.collection) {
            CollectionClass::Uncached => self.inner.post_bsos(params).await,
            _ => {
                let rollback = self.mark_dirty(&params.user_id, &params.collection).await?;
                match self.inner.post_bsos(params.clone()).await {
                    Ok(ts) => {
                        let coll_key =
                            Self::collection_cache_key(&params.user_id, &params.collection).await;
                        let _ = self.client.delete(&coll_key).await;
                        self.publish_version(&params.user_id, &params.collection, ts.as_i64() as u64)
                            .await?;
                        Ok(ts)
                    }
                    Err(e) => {
                        self.restore_version(&params.user_id, rollback)
                            .await;
                        Err(e)
                    }
                }
            }
        }
    }

    async fn delete_bso(&mut self, params: params::DeleteBso) -> Result<results::DeleteBso, E> {
        match self.classifier.classify(&params.collection) {
            CollectionClass::Uncached => self.inner.delete_bso(params).await,
            _ => {
                let rollback = self.mark_dirty(&params.user_id, &params.collection).await?;
                match self.inner.delete_bso(params.clone()).await {
                    Ok(ts) => {
                        let coll_key =
                            Self::collection_cache_key(&params.user_id, &params.collection).await;
                        let _ = self.client.delete(&coll_key).await;
                        self.publish_version(&params.user_id, &params.collection, ts.as_i64() as u64)
                            .await?;
                        Ok(ts)
                    }
                    Err(e) => {
                        self.restore_version(&params.user_id, rollback)
                            .await;
                        Err(e)
                    }
                }
            }
        }
    }

    async fn get_bso(&mut self, params: params::GetBso) -> Result<Option<results::GetBso>, E> {
        let class = self.classifier.classify(&params.collection);
        if matches!(class, CollectionClass::Uncached) {
            return self.inner.get_bso(params).await;
        }
        let value = self
            .read_cached_collection(&params.user_id, &params.collection, class)
            .await?;
        let now = Self::now_ms();
        Ok(value.items.get(&params.id).and_then(|v| {
            if v.expiry > now {
                Some(results::GetBso {
                    id: params.id.clone(),
                    modified: SyncTimestamp::from_i64(v.modified).unwrap_or_else(|_| SyncTimestamp::zero()),
                    payload: v.payload.clone(),
                    sortindex: v.sortindex,
                    expiry: v.expiry,
                })
            } else {
                None
            }
        }))
    }

    async fn get_bso_timestamp(
        &mut self,
        params: params::GetBsoTimestamp,
    ) -> Result<results::GetBsoTimestamp, E> {
        match self.classifier.classify(&params.collection) {
            CollectionClass::Uncached => self.inner.get_bso_timestamp(params).await,
            _ => {
                let bso = self
                    .get_bso(params::GetBso {
                        user_id: params.user_id,
                        collection: params.collection,
                        id: params.id,
                    })
                    .await?;
                Ok(bso.map(|b| b.modified).unwrap_or_else(SyncTimestamp::zero))
            }
        }
    }

    async fn put_bso(&mut self, params: params::PutBso) -> Result<results::PutBso, E> {
        match self.classifier.classify(&params.collection) {
            CollectionClass::Uncached => self.inner.put_bso(params).await,
            _ => {
                let rollback = self.mark_dirty(&params.user_id, &params.collection).await?;
                match self.inner.put_bso(params.clone()).await {
                    Ok(ts) => {
                        let coll_key =
                            Self::collection_cache_key(&params.user_id, &params.collection).await;
                        let _ = self.client.delete(&coll_key).await;
                        self.publish_version(&params.user_id, &params.collection, ts.as_i64() as u64)
                            .await?;
                        Ok(ts)
                    }
                    Err(e) => {
                        self.restore_version(&params.user_id, rollback)
                            .await;
                        Err(e)
                    }
                }
            }
        }
    }

    async fn check(&mut self) -> Result<results::Check, E> {
        self.inner.check().await
    }

    fn get_connection_info(&self) -> results::ConnectionInfo {
        self.inner.get_connection_info()
    }

    async fn get_collection_id(&mut self, name: &str) -> Result<i32, E> {
        self.inner.get_collection_id(name).await
    }

    async fn create_collection(&mut self, name: &str) -> Result<i32, E> {
        self.inner.create_collection(name).await
    }

    async fn update_collection(&mut self, params: params::UpdateCollection) -> Result<SyncTimestamp, E> {
        self.inner.update_collection(params).await
    }

    fn timestamp(&self) -> SyncTimestamp {
        self.inner.timestamp()
    }

    fn set_timestamp(&mut self, timestamp: SyncTimestamp) {
        self.inner.set_timestamp(timestamp)
    }

    async fn clear_coll_cache(&mut self) -> Result<(), E> {
        self.inner.clear_coll_cache().await
    }

    fn set_quota(&mut self, enabled: bool, limit: usize, enforce: bool) {
        self.inner.set_quota(enabled, limit, enforce)
    }
}
