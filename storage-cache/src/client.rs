//! The Cache Layer: a thin, typed wrapper over a redis connection
//! providing the primitives the dirty-marker protocol needs (blind
//! get/set, `add`-only-if-absent, whole-value compare-and-swap, and
//! soft locks). Nothing here knows about collections or BSOs; that
//! belongs to [`super::coordinator`].

use redis::{aio::ConnectionManager, AsyncCommands};
use serde::{de::DeserializeOwned, Serialize};
use storage_types::UserIdentifier;

use crate::error::CacheError;

/// Opaque token identifying the exact value observed by a prior `get`,
/// required by [`CacheClient::cas`] to detect a concurrent writer. This
/// mirrors the "cas unique" token returned by a classic memcache `gets`.
#[derive(Clone, Debug)]
pub struct CasToken(String);

#[derive(Clone)]
pub struct CacheClient {
    conn: ConnectionManager,
}

/// Lua script performing a whole-value compare-and-swap: only the thread
/// that observed the exact previous value can win the write. Using a
/// script instead of WATCH/MULTI keeps this a single round trip and
/// race-free under concurrent callers on the same connection manager.
const CAS_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if current == ARGV[1] then
    redis.call('SET', KEYS[1], ARGV[2])
    return 1
else
    return 0
end
"#;

impl CacheClient {
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(key).await?;
        Ok(raw.map(|s| serde_json::from_str(&s)).transpose()?)
    }

    /// Like [`CacheClient::get`] but also returns the token needed to
    /// [`CacheClient::cas`] this value later.
    pub async fn get_with_cas<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<(T, CasToken)>, CacheError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(key).await?;
        match raw {
            None => Ok(None),
            Some(raw) => {
                let value = serde_json::from_str(&raw)?;
                Ok(Some((value, CasToken(raw))))
            }
        }
    }

    /// Blind set: overwrites unconditionally. Only safe to call while
    /// holding the collection's write lock.
    pub async fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let raw = serde_json::to_string(value)?;
        let _: () = conn.set(key, raw).await?;
        Ok(())
    }

    /// Sets only if the key is currently absent. Used to repopulate the
    /// cache after a fallthrough read without clobbering a concurrent
    /// writer who may have already refreshed it.
    pub async fn add<T: Serialize>(&self, key: &str, value: &T) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        let raw = serde_json::to_string(value)?;
        let set: bool = redis::cmd("SET")
            .arg(key)
            .arg(raw)
            .arg("NX")
            .query_async(&mut conn)
            .await?;
        Ok(set)
    }

    /// Compare-and-swap against a token from a prior [`get_with_cas`].
    /// Returns `Ok(false)` (not an error) on a losing race so the caller
    /// can decide whether to retry or surface `Conflict`.
    pub async fn cas<T: Serialize>(
        &self,
        key: &str,
        expected: &CasToken,
        new_value: &T,
    ) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        let raw = serde_json::to_string(new_value)?;
        let won: i32 = redis::Script::new(CAS_SCRIPT)
            .key(key)
            .arg(&expected.0)
            .arg(raw)
            .invoke_async(&mut conn)
            .await?;
        Ok(won == 1)
    }

    pub async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    /// Acquires a soft lock via `SET key 1 NX PX ttl_ms`. Used for
    /// cache-lock mode (§4.2) where cache-only collections have no
    /// backing row to take a database lock on.
    pub async fn acquire_lock(&self, key: &str, ttl_ms: u64) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        let acquired: bool = redis::cmd("SET")
            .arg(key)
            .arg(1)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;
        Ok(acquired)
    }

    pub async fn release_lock(&self, key: &str) -> Result<(), CacheError> {
        self.delete(key).await
    }

    /// Empties the entire cache backend. Equivalent to the original's
    /// `mcclear` maintenance script; never reachable from request
    /// handling, only from operator tooling and tests.
    pub async fn flush_all(&self) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("FLUSHDB").query_async(&mut conn).await?;
        Ok(())
    }
}

/// Builds the three cache key shapes described in spec.md §4.3: a
/// per-user metadata key, a per-(user, collection) item cache key, and
/// a per-(user, collection) lock key.
pub struct CacheKeys;

impl CacheKeys {
    /// The string a [`UserIdentifier`] is keyed by in the cache:
    /// `fxa_uid` when present, falling back to the legacy numeric id for
    /// backends that only have that.
    pub fn user_key(user_id: &UserIdentifier) -> String {
        if !user_id.fxa_uid.is_empty() {
            user_id.fxa_uid.clone()
        } else {
            user_id.legacy_id.to_string()
        }
    }

    pub fn metadata(user_id: &str) -> String {
        format!("md:{user_id}")
    }

    pub fn collection(user_id: &str, collection: &str) -> String {
        format!("c:{user_id}:{collection}")
    }

    pub fn lock(user_id: &str, collection: &str) -> String {
        format!("lock:{user_id}:{collection}")
    }
}
