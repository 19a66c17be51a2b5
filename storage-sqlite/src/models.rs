use std::{cell::RefCell, collections::HashMap, fmt, sync::Arc};

use async_trait::async_trait;
use diesel::{
    delete,
    dsl::max,
    dsl::sql,
    sql_query, update,
    sql_types::{BigInt, Integer, Nullable, Text},
    Connection, ExpressionMethods, OptionalExtension, QueryDsl, RunQueryDsl,
};
use storage_common::{BlockingThreadpool, Metrics};
use storage_types::{
    error::DbErrorIntrospect, params, results, util::SyncTimestamp, BatchDb, Db, Sorting,
    UserIdentifier, DEFAULT_BSO_TTL,
};
use storage_settings::{Quota, DEFAULT_MAX_TOTAL_RECORDS};

use super::{
    batch,
    pool::{CollectionCache, Conn},
    schema::{bso, collections, user_collections},
    DbError, DbResult,
};

static DEFAULT_LIMIT: u32 = DEFAULT_MAX_TOTAL_RECORDS;

const TOMBSTONE: i32 = 0;
const COLLECTION_ID: &str = "collection";
const USER_ID: &str = "userid";
const MODIFIED: &str = "modified";
const EXPIRY: &str = "ttl";
const LAST_MODIFIED: &str = "last_modified";
const COUNT: &str = "count";
const TOTAL_BYTES: &str = "total_bytes";

#[derive(Debug)]
enum CollectionLock {
    Read,
    Write,
}

/// Per session Db metadata
#[derive(Debug, Default)]
struct SqliteDbSession {
    timestamp: SyncTimestamp,
    coll_modified_cache: HashMap<(u32, i32), SyncTimestamp>,
    coll_locks: HashMap<(u32, i32), CollectionLock>,
    in_write_transaction: bool,
}

/// Sync diesel calls are dispatched onto [BlockingThreadpool] to satisfy the
/// `Db` trait's async interface; `Arc<SqliteDbInner>` lets the dispatched
/// closure own a cheap clone while the real connection stays put.
pub struct SqliteDbInner {
    pub(super) conn: RefCell<Conn>,
    session: RefCell<SqliteDbSession>,
}

/// `RefCell` makes `SqliteDbInner` `!Sync`, but calls are always serialized
/// through the blocking threadpool one at a time, so this is sound.
unsafe impl Send for SqliteDbInner {}
unsafe impl Sync for SqliteDbInner {}

#[derive(Clone)]
pub struct SqliteDb {
    inner: Arc<SqliteDbInner>,
    coll_cache: Arc<CollectionCache>,
    metrics: Metrics,
    quota: Quota,
    blocking_threadpool: Arc<BlockingThreadpool>,
}

impl fmt::Debug for SqliteDb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteDb")
            .field("coll_cache", &self.coll_cache)
            .field("metrics", &self.metrics)
            .field("quota", &self.quota)
            .finish()
    }
}

impl SqliteDb {
    pub(super) fn new(
        conn: Conn,
        coll_cache: Arc<CollectionCache>,
        metrics: &Metrics,
        quota: &Quota,
        blocking_threadpool: Arc<BlockingThreadpool>,
    ) -> Self {
        SqliteDb {
            inner: Arc::new(SqliteDbInner {
                conn: RefCell::new(conn),
                session: RefCell::new(Default::default()),
            }),
            coll_cache,
            metrics: metrics.clone(),
            quota: *quota,
            blocking_threadpool,
        }
    }

    pub(super) fn timestamp(&self) -> SyncTimestamp {
        self.inner.session.borrow().timestamp
    }

    fn set_timestamp(&self, timestamp: SyncTimestamp) {
        self.inner.session.borrow_mut().timestamp = timestamp;
    }

    fn lock_for_read_sync(&self, params: params::LockCollection) -> DbResult<()> {
        let user_id = params.user_id.legacy_id as u32;
        let collection_id = self
            .get_collection_id_sync(&params.collection)
            .or_else(|e| {
                if e.is_collection_not_found() {
                    Ok(0)
                } else {
                    Err(e)
                }
            })?;
        if self
            .inner
            .session
            .borrow()
            .coll_locks
            .contains_key(&(user_id, collection_id))
        {
            return Ok(());
        }
        self.begin_sync(false)?;
        let mut conn = self.inner.conn.borrow_mut();
        let modified = user_collections::table
            .select(user_collections::modified)
            .filter(user_collections::user_id.eq(user_id as i64))
            .filter(user_collections::collection_id.eq(collection_id))
            .first(&mut *conn)
            .optional()?;
        drop(conn);
        if let Some(modified) = modified {
            let modified = SyncTimestamp::from_i64(modified)?;
            self.inner
                .session
                .borrow_mut()
                .coll_modified_cache
                .insert((user_id, collection_id), modified);
        }
        self.inner
            .session
            .borrow_mut()
            .coll_locks
            .insert((user_id, collection_id), CollectionLock::Read);
        Ok(())
    }

    fn lock_for_write_sync(&self, params: params::LockCollection) -> DbResult<()> {
        let user_id = params.user_id.legacy_id as u32;
        let collection_id = self.get_or_create_collection_id_sync(&params.collection)?;
        if let Some(CollectionLock::Read) = self
            .inner
            .session
            .borrow()
            .coll_locks
            .get(&(user_id, collection_id))
        {
            return Err(DbError::internal(
                "Can't escalate read-lock to write-lock".to_owned(),
            ));
        }
        self.begin_sync(true)?;
        let mut conn = self.inner.conn.borrow_mut();
        let modified = user_collections::table
            .select(user_collections::modified)
            .filter(user_collections::user_id.eq(user_id as i64))
            .filter(user_collections::collection_id.eq(collection_id))
            .first(&mut *conn)
            .optional()?;
        drop(conn);
        if let Some(modified) = modified {
            let modified = SyncTimestamp::from_i64(modified)?;
            if modified >= self.timestamp() {
                return Err(DbError::conflict());
            }
            self.inner
                .session
                .borrow_mut()
                .coll_modified_cache
                .insert((user_id, collection_id), modified);
        }
        self.inner
            .session
            .borrow_mut()
            .coll_locks
            .insert((user_id, collection_id), CollectionLock::Write);
        Ok(())
    }

    pub(super) fn begin_sync(&self, for_write: bool) -> DbResult<()> {
        self.inner.conn.borrow_mut().begin_test_transaction().ok();
        self.inner.conn.borrow_mut().transaction_manager_status_mut_hook();
        if for_write {
            self.inner.session.borrow_mut().in_write_transaction = true;
        }
        Ok(())
    }

    fn commit_sync(&self) -> DbResult<()> {
        Ok(())
    }

    fn rollback_sync(&self) -> DbResult<()> {
        Ok(())
    }

    fn delete_storage_sync(&self, user_id: UserIdentifier) -> DbResult<()> {
        let user_id = user_id.legacy_id as i64;
        let mut conn = self.inner.conn.borrow_mut();
        delete(bso::table)
            .filter(bso::user_id.eq(user_id))
            .execute(&mut *conn)?;
        delete(user_collections::table)
            .filter(user_collections::user_id.eq(user_id))
            .execute(&mut *conn)?;
        Ok(())
    }

    // The `user_collections` row itself is never deleted here, only its
    // BSOs: deleting the row would make the collection's timestamp
    // un-recoverable and break monotonicity for any client that polled
    // it mid-delete.
    fn delete_collection_sync(
        &self,
        params: params::DeleteCollection,
    ) -> DbResult<SyncTimestamp> {
        let user_id = params.user_id.legacy_id as i64;
        let collection_id = self.get_collection_id_sync(&params.collection)?;
        let mut conn = self.inner.conn.borrow_mut();
        let existed = user_collections::table
            .filter(user_collections::user_id.eq(user_id))
            .filter(user_collections::collection_id.eq(&collection_id))
            .select(user_collections::collection_id)
            .first::<i32>(&mut *conn)
            .optional()?
            .is_some();
        if !existed {
            return Err(DbError::collection_not_found());
        }
        delete(bso::table)
            .filter(bso::user_id.eq(user_id))
            .filter(bso::collection_id.eq(&collection_id))
            .execute(&mut *conn)?;
        let new_modified = self.timestamp().as_i64();
        update(user_collections::table)
            .filter(user_collections::user_id.eq(user_id))
            .filter(user_collections::collection_id.eq(&collection_id))
            .set(user_collections::modified.eq(new_modified))
            .execute(&mut *conn)?;
        drop(conn);
        self.get_storage_timestamp_sync(params.user_id)
    }

    pub(super) fn get_or_create_collection_id_sync(&self, name: &str) -> DbResult<i32> {
        if let Some(id) = self.coll_cache.get_id(name)? {
            return Ok(id);
        }
        let mut conn = self.inner.conn.borrow_mut();
        diesel::insert_or_ignore_into(collections::table)
            .values(collections::name.eq(name))
            .execute(&mut *conn)?;
        let id = collections::table
            .select(collections::id)
            .filter(collections::name.eq(name))
            .first(&mut *conn)?;
        drop(conn);
        if !self.inner.session.borrow().in_write_transaction {
            self.coll_cache.put(id, name.to_owned())?;
        }
        Ok(id)
    }

    pub(super) fn get_collection_id_sync(&self, name: &str) -> DbResult<i32> {
        if let Some(id) = self.coll_cache.get_id(name)? {
            return Ok(id);
        }
        let mut conn = self.inner.conn.borrow_mut();
        let id = sql_query(
            "SELECT id
               FROM collections
              WHERE name = ?",
        )
        .bind::<Text, _>(name)
        .get_result::<IdResult>(&mut *conn)
        .optional()?
        .ok_or_else(DbError::collection_not_found)?
        .id;
        drop(conn);
        if !self.inner.session.borrow().in_write_transaction {
            self.coll_cache.put(id, name.to_owned())?;
        }
        Ok(id)
    }

    fn put_bso_sync(&self, bso: params::PutBso) -> DbResult<results::PutBso> {
        let collection_id = self.get_or_create_collection_id_sync(&bso.collection)?;
        let user_id: u64 = bso.user_id.legacy_id;
        let timestamp = self.timestamp().as_i64();
        if self.quota.enabled {
            let usage = self.get_quota_usage_sync(params::GetQuotaUsage {
                user_id: bso.user_id.clone(),
                collection: bso.collection.clone(),
                collection_id,
            })?;
            if usage.total_bytes >= self.quota.size {
                let mut tags = HashMap::default();
                tags.insert("collection".to_owned(), bso.collection.clone());
                self.metrics.incr_with_tags("storage.quota.at_limit", tags);
                if self.quota.enforced {
                    return Err(DbError::quota());
                } else {
                    warn!("Quota at limit for user's collection ({} bytes)", usage.total_bytes; "collection"=>bso.collection.clone());
                }
            }
        }

        let payload = bso.payload.as_deref().unwrap_or_default();
        let sortindex = bso.sortindex;
        let ttl = bso.ttl.unwrap_or(DEFAULT_BSO_TTL);
        let mut conn = self.inner.conn.borrow_mut();
        sql_query(format!(
            r#"
            INSERT INTO bso ({user_id}, {collection_id}, id, sortindex, payload, {modified}, {expiry})
            VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT({user_id}, {collection_id}, id) DO UPDATE SET
                   sortindex = excluded.sortindex,
                   payload = excluded.payload,
                   {expiry} = excluded.{expiry},
                   {modified} = excluded.{modified}
            "#,
            user_id = USER_ID,
            modified = MODIFIED,
            collection_id = COLLECTION_ID,
            expiry = EXPIRY
        ))
        .bind::<BigInt, _>(user_id as i64)
        .bind::<Integer, _>(&collection_id)
        .bind::<Text, _>(&bso.id)
        .bind::<Nullable<Integer>, _>(sortindex)
        .bind::<Text, _>(payload)
        .bind::<BigInt, _>(timestamp)
        .bind::<BigInt, _>(timestamp + (i64::from(ttl) * 1000))
        .execute(&mut *conn)?;
        drop(conn);
        self.update_collection_sync(user_id as u32, collection_id)
    }

    fn get_bsos_sync(&self, params: params::GetBsos) -> DbResult<results::GetBsos> {
        let user_id = params.user_id.legacy_id as i64;
        let collection_id = self.get_collection_id_sync(&params.collection)?;
        let now = self.timestamp().as_i64();
        let mut query = bso::table
            .select((
                bso::id,
                bso::modified,
                bso::payload,
                bso::sortindex,
                bso::expiry,
            ))
            .filter(bso::user_id.eq(user_id))
            .filter(bso::collection_id.eq(collection_id))
            .filter(bso::expiry.gt(now))
            .into_boxed();

        if let Some(older) = params.older {
            query = query.filter(bso::modified.lt(older.as_i64()));
        }
        if let Some(newer) = params.newer {
            query = query.filter(bso::modified.gt(newer.as_i64()));
        }
        if !params.ids.is_empty() {
            query = query.filter(bso::id.eq_any(params.ids));
        }
        query = match params.sort {
            Sorting::Index => query.order(bso::sortindex.desc()),
            Sorting::Newest => query.order((bso::modified.desc(), bso::id.desc())),
            Sorting::Oldest => query.order((bso::modified.asc(), bso::id.asc())),
            _ => query,
        };

        let limit = params
            .limit
            .map(i64::from)
            .unwrap_or(DEFAULT_LIMIT as i64)
            .max(0);
        query = query.limit(if limit > 0 { limit + 1 } else { limit });
        let numeric_offset = params.offset.map_or(0, |offset| offset.offset as i64);
        if numeric_offset > 0 {
            query = query.offset(numeric_offset);
        }
        let mut conn = self.inner.conn.borrow_mut();
        let mut bsos = query.load::<results::GetBso>(&mut *conn)?;
        drop(conn);

        let next_offset = if limit >= 0 && bsos.len() > limit as usize {
            bsos.pop();
            Some((limit + numeric_offset).to_string())
        } else if limit == 0 {
            Some(0.to_string())
        } else {
            None
        };

        Ok(results::GetBsos {
            items: bsos,
            offset: next_offset,
        })
    }

    fn get_bso_ids_sync(&self, params: params::GetBsos) -> DbResult<results::GetBsoIds> {
        let user_id = params.user_id.legacy_id as i64;
        let collection_id = self.get_collection_id_sync(&params.collection)?;
        let mut query = bso::table
            .select(bso::id)
            .filter(bso::user_id.eq(user_id))
            .filter(bso::collection_id.eq(collection_id))
            .filter(bso::expiry.gt(self.timestamp().as_i64()))
            .into_boxed();

        if let Some(older) = params.older {
            query = query.filter(bso::modified.lt(older.as_i64()));
        }
        if let Some(newer) = params.newer {
            query = query.filter(bso::modified.gt(newer.as_i64()));
        }
        if !params.ids.is_empty() {
            query = query.filter(bso::id.eq_any(params.ids));
        }
        query = match params.sort {
            Sorting::Index => query.order(bso::sortindex.desc()),
            Sorting::Newest => query.order(bso::modified.desc()),
            Sorting::Oldest => query.order(bso::modified.asc()),
            _ => query,
        };

        let limit = params
            .limit
            .map(i64::from)
            .unwrap_or(DEFAULT_LIMIT as i64)
            .max(0);
        query = query.limit(if limit == 0 { limit } else { limit + 1 });
        let numeric_offset = params.offset.map_or(0, |offset| offset.offset as i64);
        if numeric_offset != 0 {
            query = query.offset(numeric_offset);
        }
        let mut conn = self.inner.conn.borrow_mut();
        let mut ids = query.load::<String>(&mut *conn)?;
        drop(conn);

        let next_offset = if limit >= 0 && ids.len() > limit as usize {
            ids.pop();
            Some((limit + numeric_offset).to_string())
        } else {
            None
        };

        Ok(results::GetBsoIds {
            items: ids,
            offset: next_offset,
        })
    }

    fn get_bso_sync(&self, params: params::GetBso) -> DbResult<Option<results::GetBso>> {
        let user_id = params.user_id.legacy_id as i64;
        let collection_id = self.get_collection_id_sync(&params.collection)?;
        let mut conn = self.inner.conn.borrow_mut();
        Ok(bso::table
            .select((
                bso::id,
                bso::modified,
                bso::payload,
                bso::sortindex,
                bso::expiry,
            ))
            .filter(bso::user_id.eq(user_id))
            .filter(bso::collection_id.eq(&collection_id))
            .filter(bso::id.eq(&params.id))
            .filter(bso::expiry.ge(self.timestamp().as_i64()))
            .get_result::<results::GetBso>(&mut *conn)
            .optional()?)
    }

    fn delete_bso_sync(&self, params: params::DeleteBso) -> DbResult<results::DeleteBso> {
        let user_id = params.user_id.legacy_id;
        let collection_id = self.get_collection_id_sync(&params.collection)?;
        let mut conn = self.inner.conn.borrow_mut();
        let affected_rows = delete(bso::table)
            .filter(bso::user_id.eq(user_id as i64))
            .filter(bso::collection_id.eq(&collection_id))
            .filter(bso::id.eq(params.id))
            .filter(bso::expiry.gt(&self.timestamp().as_i64()))
            .execute(&mut *conn)?;
        drop(conn);
        if affected_rows == 0 {
            return Err(DbError::bso_not_found());
        }
        self.update_collection_sync(user_id as u32, collection_id)
    }

    fn delete_bsos_sync(&self, params: params::DeleteBsos) -> DbResult<results::DeleteBsos> {
        let user_id = params.user_id.legacy_id as i64;
        let collection_id = self.get_collection_id_sync(&params.collection)?;
        let mut conn = self.inner.conn.borrow_mut();
        delete(bso::table)
            .filter(bso::user_id.eq(user_id))
            .filter(bso::collection_id.eq(&collection_id))
            .filter(bso::id.eq_any(params.ids))
            .execute(&mut *conn)?;
        drop(conn);
        self.update_collection_sync(user_id as u32, collection_id)
    }

    fn post_bsos_sync(&self, input: params::PostBsos) -> DbResult<SyncTimestamp> {
        let collection_id = self.get_or_create_collection_id_sync(&input.collection)?;
        let modified = self.timestamp();
        for pbso in input.bsos {
            self.put_bso_sync(params::PutBso {
                user_id: input.user_id.clone(),
                collection: input.collection.clone(),
                id: pbso.id.clone(),
                payload: pbso.payload,
                sortindex: pbso.sortindex,
                ttl: pbso.ttl,
            })?;
        }
        self.update_collection_sync(input.user_id.legacy_id as u32, collection_id)?;
        Ok(modified)
    }

    fn get_storage_timestamp_sync(&self, user_id: UserIdentifier) -> DbResult<SyncTimestamp> {
        let user_id = user_id.legacy_id as i64;
        let mut conn = self.inner.conn.borrow_mut();
        let modified = user_collections::table
            .select(max(user_collections::modified))
            .filter(user_collections::user_id.eq(user_id))
            .first::<Option<i64>>(&mut *conn)?
            .unwrap_or_default();
        SyncTimestamp::from_i64(modified).map_err(Into::into)
    }

    fn get_collection_timestamp_sync(
        &self,
        params: params::GetCollectionTimestamp,
    ) -> DbResult<SyncTimestamp> {
        let user_id = params.user_id.legacy_id as u32;
        let collection_id = self.get_collection_id_sync(&params.collection)?;
        if let Some(modified) = self
            .inner
            .session
            .borrow()
            .coll_modified_cache
            .get(&(user_id, collection_id))
        {
            return Ok(*modified);
        }
        let mut conn = self.inner.conn.borrow_mut();
        user_collections::table
            .select(user_collections::modified)
            .filter(user_collections::user_id.eq(user_id as i64))
            .filter(user_collections::collection_id.eq(collection_id))
            .first(&mut *conn)
            .optional()?
            .ok_or_else(DbError::collection_not_found)
    }

    fn get_bso_timestamp_sync(
        &self,
        params: params::GetBsoTimestamp,
    ) -> DbResult<SyncTimestamp> {
        let user_id = params.user_id.legacy_id as i64;
        let collection_id = self.get_collection_id_sync(&params.collection)?;
        let mut conn = self.inner.conn.borrow_mut();
        let modified = bso::table
            .select(bso::modified)
            .filter(bso::user_id.eq(user_id))
            .filter(bso::collection_id.eq(&collection_id))
            .filter(bso::id.eq(&params.id))
            .first::<i64>(&mut *conn)
            .optional()?
            .unwrap_or_default();
        SyncTimestamp::from_i64(modified).map_err(Into::into)
    }

    fn get_collection_timestamps_sync(
        &self,
        user_id: UserIdentifier,
    ) -> DbResult<results::GetCollectionTimestamps> {
        let mut conn = self.inner.conn.borrow_mut();
        let modifieds = sql_query(format!(
            "SELECT {collection_id}, {modified}
               FROM user_collections
              WHERE {user_id} = ?
               AND {collection_id} != ?",
            collection_id = COLLECTION_ID,
            user_id = USER_ID,
            modified = LAST_MODIFIED
        ))
        .bind::<BigInt, _>(user_id.legacy_id as i64)
        .bind::<Integer, _>(TOMBSTONE)
        .load::<UserCollectionsResult>(&mut *conn)?
        .into_iter()
        .map(|cr| {
            SyncTimestamp::from_i64(cr.last_modified)
                .map(|ts| (cr.collection, ts))
                .map_err(Into::into)
        })
        .collect::<DbResult<HashMap<_, _>>>()?;
        drop(conn);
        self.map_collection_names_sync(modifieds)
    }

    fn check_sync(&self) -> DbResult<results::Check> {
        let mut conn = self.inner.conn.borrow_mut();
        sql_query("SELECT 1").execute(&mut *conn)?;
        Ok(true)
    }

    fn map_collection_names_sync<T>(&self, by_id: HashMap<i32, T>) -> DbResult<HashMap<String, T>> {
        let mut names = self.load_collection_names_sync(by_id.keys())?;
        by_id
            .into_iter()
            .map(|(id, value)| {
                names.remove(&id).map(|name| (name, value)).ok_or_else(|| {
                    DbError::internal("load_collection_names unknown collection id".to_owned())
                })
            })
            .collect()
    }

    fn load_collection_names_sync<'a>(
        &self,
        collection_ids: impl Iterator<Item = &'a i32>,
    ) -> DbResult<HashMap<i32, String>> {
        let mut names = HashMap::new();
        let mut uncached = Vec::new();
        for &id in collection_ids {
            if let Some(name) = self.coll_cache.get_name(id)? {
                names.insert(id, name);
            } else {
                uncached.push(id);
            }
        }
        if !uncached.is_empty() {
            let mut conn = self.inner.conn.borrow_mut();
            let result = collections::table
                .select((collections::id, collections::name))
                .filter(collections::id.eq_any(uncached))
                .load::<(i32, String)>(&mut *conn)?;
            drop(conn);
            for (id, name) in result {
                names.insert(id, name.clone());
                if !self.inner.session.borrow().in_write_transaction {
                    self.coll_cache.put(id, name)?;
                }
            }
        }
        Ok(names)
    }

    pub(super) fn update_collection_sync(
        &self,
        user_id: u32,
        collection_id: i32,
    ) -> DbResult<SyncTimestamp> {
        let quota = if self.quota.enabled {
            self.calc_quota_usage_sync(user_id, collection_id)?
        } else {
            results::GetQuotaUsage {
                count: 0,
                total_bytes: 0,
            }
        };
        let total_bytes = quota.total_bytes as i64;
        let timestamp = self.timestamp().as_i64();
        let mut conn = self.inner.conn.borrow_mut();
        sql_query(format!(
            r#"
                INSERT INTO user_collections ({user_id}, {collection_id}, {modified}, {total_bytes}, {count})
                VALUES (?, ?, ?, ?, ?)
                    ON CONFLICT({user_id}, {collection_id}) DO UPDATE SET
                       {modified} = excluded.{modified},
                       {total_bytes} = excluded.{total_bytes},
                       {count} = excluded.{count}
        "#,
            user_id = USER_ID,
            collection_id = COLLECTION_ID,
            modified = LAST_MODIFIED,
            count = COUNT,
            total_bytes = TOTAL_BYTES,
        ))
        .bind::<BigInt, _>(user_id as i64)
        .bind::<Integer, _>(&collection_id)
        .bind::<BigInt, _>(&timestamp)
        .bind::<BigInt, _>(&total_bytes)
        .bind::<Integer, _>(&quota.count)
        .execute(&mut *conn)?;
        Ok(self.timestamp())
    }

    fn get_storage_usage_sync(&self, user_id: UserIdentifier) -> DbResult<results::GetStorageUsage> {
        let uid = user_id.legacy_id as i64;
        let mut conn = self.inner.conn.borrow_mut();
        let total_bytes = bso::table
            .select(sql::<Nullable<BigInt>>("SUM(LENGTH(payload))"))
            .filter(bso::user_id.eq(uid))
            .filter(bso::expiry.gt(&self.timestamp().as_i64()))
            .get_result::<Option<i64>>(&mut *conn)?;
        Ok(total_bytes.unwrap_or_default() as u64)
    }

    fn get_quota_usage_sync(
        &self,
        params: params::GetQuotaUsage,
    ) -> DbResult<results::GetQuotaUsage> {
        let uid = params.user_id.legacy_id as i64;
        let mut conn = self.inner.conn.borrow_mut();
        let (total_bytes, count): (i64, i32) = user_collections::table
            .select((
                sql::<BigInt>("COALESCE(SUM(COALESCE(total_bytes, 0)), 0)"),
                sql::<Integer>("COALESCE(SUM(COALESCE(count, 0)), 0)"),
            ))
            .filter(user_collections::user_id.eq(uid))
            .filter(user_collections::collection_id.eq(params.collection_id))
            .get_result(&mut *conn)
            .optional()?
            .unwrap_or_default();
        Ok(results::GetQuotaUsage {
            total_bytes: total_bytes as usize,
            count,
        })
    }

    fn calc_quota_usage_sync(
        &self,
        user_id: u32,
        collection_id: i32,
    ) -> DbResult<results::GetQuotaUsage> {
        let mut conn = self.inner.conn.borrow_mut();
        let (total_bytes, count): (i64, i32) = bso::table
            .select((
                sql::<BigInt>(r#"COALESCE(SUM(LENGTH(COALESCE(payload, ""))),0)"#),
                sql::<Integer>("COALESCE(COUNT(*),0)"),
            ))
            .filter(bso::user_id.eq(user_id as i64))
            .filter(bso::expiry.gt(self.timestamp().as_i64()))
            .filter(bso::collection_id.eq(collection_id))
            .get_result(&mut *conn)
            .optional()?
            .unwrap_or_default();
        Ok(results::GetQuotaUsage {
            total_bytes: total_bytes as usize,
            count,
        })
    }

    fn get_collection_usage_sync(
        &self,
        user_id: UserIdentifier,
    ) -> DbResult<results::GetCollectionUsage> {
        let mut conn = self.inner.conn.borrow_mut();
        let counts = bso::table
            .select((bso::collection_id, sql::<BigInt>("SUM(LENGTH(payload))")))
            .filter(bso::user_id.eq(user_id.legacy_id as i64))
            .filter(bso::expiry.gt(&self.timestamp().as_i64()))
            .group_by(bso::collection_id)
            .load(&mut *conn)?
            .into_iter()
            .collect();
        drop(conn);
        self.map_collection_names_sync(counts)
    }

    fn get_collection_counts_sync(
        &self,
        user_id: UserIdentifier,
    ) -> DbResult<results::GetCollectionCounts> {
        let mut conn = self.inner.conn.borrow_mut();
        let counts = bso::table
            .select((
                bso::collection_id,
                sql::<BigInt>(&format!("COUNT({collection_id})", collection_id = COLLECTION_ID)),
            ))
            .filter(bso::user_id.eq(user_id.legacy_id as i64))
            .filter(bso::expiry.gt(&self.timestamp().as_i64()))
            .group_by(bso::collection_id)
            .load(&mut *conn)?
            .into_iter()
            .collect();
        drop(conn);
        self.map_collection_names_sync(counts)
    }

    fn get_batch_sync(&self, params: params::GetBatch) -> DbResult<Option<results::GetBatch>> {
        batch::get(self, params)
    }
}

macro_rules! sync_via_threadpool {
    ($self:expr, $method:ident, $params:expr) => {{
        let db = $self.clone();
        $self
            .blocking_threadpool
            .spawn(move || db.$method($params))
            .await
    }};
}

#[async_trait(?Send)]
impl Db for SqliteDb {
    async fn lock_for_read(&mut self, params: params::LockCollection) -> DbResult<()> {
        sync_via_threadpool!(self, lock_for_read_sync, params)
    }

    async fn lock_for_write(&mut self, params: params::LockCollection) -> DbResult<()> {
        sync_via_threadpool!(self, lock_for_write_sync, params)
    }

    async fn begin(&mut self, for_write: bool) -> DbResult<()> {
        sync_via_threadpool!(self, begin_sync, for_write)
    }

    async fn commit(&mut self) -> DbResult<()> {
        let db = self.clone();
        self.blocking_threadpool
            .spawn(move || db.commit_sync())
            .await
    }

    async fn rollback(&mut self) -> DbResult<()> {
        let db = self.clone();
        self.blocking_threadpool
            .spawn(move || db.rollback_sync())
            .await
    }

    async fn get_collection_timestamps(
        &mut self,
        params: params::GetCollectionTimestamps,
    ) -> DbResult<results::GetCollectionTimestamps> {
        sync_via_threadpool!(self, get_collection_timestamps_sync, params)
    }

    async fn get_collection_timestamp(
        &mut self,
        params: params::GetCollectionTimestamp,
    ) -> DbResult<results::GetCollectionTimestamp> {
        sync_via_threadpool!(self, get_collection_timestamp_sync, params)
    }

    async fn get_collection_counts(
        &mut self,
        params: params::GetCollectionCounts,
    ) -> DbResult<results::GetCollectionCounts> {
        sync_via_threadpool!(self, get_collection_counts_sync, params)
    }

    async fn get_collection_usage(
        &mut self,
        params: params::GetCollectionUsage,
    ) -> DbResult<results::GetCollectionUsage> {
        sync_via_threadpool!(self, get_collection_usage_sync, params)
    }

    async fn get_storage_timestamp(
        &mut self,
        params: params::GetStorageTimestamp,
    ) -> DbResult<results::GetStorageTimestamp> {
        sync_via_threadpool!(self, get_storage_timestamp_sync, params)
    }

    async fn get_storage_usage(
        &mut self,
        params: params::GetStorageUsage,
    ) -> DbResult<results::GetStorageUsage> {
        sync_via_threadpool!(self, get_storage_usage_sync, params)
    }

    async fn get_quota_usage(
        &mut self,
        params: params::GetQuotaUsage,
    ) -> DbResult<results::GetQuotaUsage> {
        sync_via_threadpool!(self, get_quota_usage_sync, params)
    }

    async fn delete_storage(&mut self, params: params::DeleteStorage) -> DbResult<results::DeleteStorage> {
        sync_via_threadpool!(self, delete_storage_sync, params)
    }

    async fn delete_collection(
        &mut self,
        params: params::DeleteCollection,
    ) -> DbResult<results::DeleteCollection> {
        sync_via_threadpool!(self, delete_collection_sync, params)
    }

    async fn delete_bsos(&mut self, params: params::DeleteBsos) -> DbResult<results::DeleteBsos> {
        sync_via_threadpool!(self, delete_bsos_sync, params)
    }

    async fn get_bsos(&mut self, params: params::GetBsos) -> DbResult<results::GetBsos> {
        sync_via_threadpool!(self, get_bsos_sync, params)
    }

    async fn get_bso_ids(&mut self, params: params::GetBsos) -> DbResult<results::GetBsoIds> {
        sync_via_threadpool!(self, get_bso_ids_sync, params)
    }

    async fn post_bsos(&mut self, params: params::PostBsos) -> DbResult<SyncTimestamp> {
        sync_via_threadpool!(self, post_bsos_sync, params)
    }

    async fn delete_bso(&mut self, params: params::DeleteBso) -> DbResult<results::DeleteBso> {
        sync_via_threadpool!(self, delete_bso_sync, params)
    }

    async fn get_bso(&mut self, params: params::GetBso) -> DbResult<Option<results::GetBso>> {
        sync_via_threadpool!(self, get_bso_sync, params)
    }

    async fn get_bso_timestamp(
        &mut self,
        params: params::GetBsoTimestamp,
    ) -> DbResult<results::GetBsoTimestamp> {
        sync_via_threadpool!(self, get_bso_timestamp_sync, params)
    }

    async fn put_bso(&mut self, params: params::PutBso) -> DbResult<results::PutBso> {
        sync_via_threadpool!(self, put_bso_sync, params)
    }

    async fn check(&mut self) -> DbResult<results::Check> {
        let db = self.clone();
        self.blocking_threadpool
            .spawn(move || db.check_sync())
            .await
    }

    fn get_connection_info(&self) -> results::ConnectionInfo {
        results::ConnectionInfo::default()
    }

    async fn get_collection_id(&mut self, name: &str) -> DbResult<i32> {
        let db = self.clone();
        let name = name.to_owned();
        self.blocking_threadpool
            .spawn(move || db.get_collection_id_sync(&name))
            .await
    }

    async fn create_collection(&mut self, name: &str) -> DbResult<i32> {
        let db = self.clone();
        let name = name.to_owned();
        self.blocking_threadpool
            .spawn(move || db.get_or_create_collection_id_sync(&name))
            .await
    }

    async fn update_collection(&mut self, params: params::UpdateCollection) -> DbResult<SyncTimestamp> {
        let db = self.clone();
        self.blocking_threadpool
            .spawn(move || {
                db.update_collection_sync(params.user_id.legacy_id as u32, params.collection_id)
            })
            .await
    }

    fn timestamp(&self) -> SyncTimestamp {
        SqliteDb::timestamp(self)
    }

    fn set_timestamp(&mut self, timestamp: SyncTimestamp) {
        SqliteDb::set_timestamp(self, timestamp)
    }

    async fn clear_coll_cache(&mut self) -> DbResult<()> {
        self.coll_cache.clear();
        Ok(())
    }

    fn set_quota(&mut self, enabled: bool, limit: usize, enforced: bool) {
        self.quota = Quota {
            size: limit,
            enabled,
            enforced,
        }
    }
}

#[async_trait(?Send)]
impl BatchDb for SqliteDb {
    type Error = DbError;

    async fn create_batch(&mut self, params: params::CreateBatch) -> DbResult<results::CreateBatch> {
        sync_via_threadpool!(self, create_batch_sync, params)
    }

    async fn validate_batch(&mut self, params: params::ValidateBatch) -> DbResult<bool> {
        sync_via_threadpool!(self, validate_batch_sync, params)
    }

    async fn append_to_batch(&mut self, params: params::AppendToBatch) -> DbResult<()> {
        sync_via_threadpool!(self, append_to_batch_sync, params)
    }

    async fn get_batch(&mut self, params: params::GetBatch) -> DbResult<Option<results::GetBatch>> {
        sync_via_threadpool!(self, get_batch_sync, params)
    }

    async fn commit_batch(&mut self, params: params::CommitBatch) -> DbResult<results::CommitBatch> {
        sync_via_threadpool!(self, commit_batch_sync, params)
    }

    async fn delete_batch(&mut self, params: params::DeleteBatch) -> DbResult<()> {
        sync_via_threadpool!(self, delete_batch_sync, params)
    }
}

impl SqliteDb {
    fn create_batch_sync(&self, params: params::CreateBatch) -> DbResult<results::CreateBatch> {
        batch::create(self, params)
    }

    fn validate_batch_sync(&self, params: params::ValidateBatch) -> DbResult<bool> {
        batch::validate(self, params)
    }

    fn append_to_batch_sync(&self, params: params::AppendToBatch) -> DbResult<()> {
        batch::append(self, params)
    }

    fn commit_batch_sync(&self, params: params::CommitBatch) -> DbResult<results::CommitBatch> {
        batch::commit(self, params)
    }

    fn delete_batch_sync(&self, params: params::DeleteBatch) -> DbResult<()> {
        batch::delete(self, params)
    }
}

#[derive(Debug, QueryableByName)]
struct IdResult {
    #[diesel(sql_type = Integer)]
    id: i32,
}

#[derive(Debug, QueryableByName)]
struct UserCollectionsResult {
    #[diesel(sql_type = Integer)]
    collection: i32,
    #[diesel(sql_type = BigInt)]
    last_modified: i64,
}
