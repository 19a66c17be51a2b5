//! The Quota Accountant (spec.md §4.5): a per-user total-bytes counter
//! layered over [`storage_types::Db::get_storage_usage`], caching the
//! last-known total so most requests don't pay a recomputation.

use std::collections::HashMap;
use std::sync::Mutex;

use storage_cache::CacheKeys;
use storage_settings::Quota;
use storage_types::{error::DbErrorIntrospect, Db, UserIdentifier};

use crate::error::KernelError;

/// Below this much headroom, cached usage is no longer trusted and is
/// recomputed from the Durable Store on the next check.
const RECOMPUTE_THRESHOLD_BYTES: i64 = 1024 * 1024;

pub struct QuotaAccountant {
    quota: Quota,
    cached: Mutex<HashMap<String, u64>>,
}

/// `/info/quota` response shape: used bytes against an optional ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaUsage {
    pub used_bytes: u64,
    pub limit_bytes: Option<u64>,
}

impl QuotaAccountant {
    pub fn new(quota: Quota) -> Self {
        QuotaAccountant {
            quota,
            cached: Mutex::new(HashMap::new()),
        }
    }

    pub fn quota(&self) -> Quota {
        self.quota
    }

    /// Pre-write admission check: fails with `OverQuota` before any
    /// durable write is attempted if the write would leave no headroom.
    /// A no-op when quota enforcement is disabled.
    pub async fn check_before_write<E>(
        &self,
        db: &mut dyn Db<Error = E>,
        user_id: &UserIdentifier,
        additional_bytes: usize,
    ) -> Result<(), KernelError<E>>
    where
        E: DbErrorIntrospect,
    {
        if !self.quota.enabled {
            return Ok(());
        }
        let used = self.usage(db, user_id).await?;
        let remaining = self.quota.size as i64 - used as i64 - additional_bytes as i64;
        if remaining <= 0 {
            warn!("quota at or over limit"; "used" => used, "limit" => self.quota.size, "enforced" => self.quota.enforced);
            if self.quota.enforced {
                return Err(KernelError::over_quota());
            }
        }
        Ok(())
    }

    /// Clears the cached total for `user_id`, forcing the next check to
    /// recompute from the Durable Store. Call after any delete.
    pub fn invalidate(&self, user_id: &UserIdentifier) {
        let key = CacheKeys::user_key(user_id);
        self.cached.lock().unwrap().remove(&key);
    }

    /// The remaining headroom to advertise to a client, in KiB, or
    /// `None` when there's comfortably more than 1 MiB of room left (in
    /// which case it isn't worth the precision or the recompute cost).
    pub fn advertised_remaining_kib(&self, user_id: &UserIdentifier) -> Option<f64> {
        let key = CacheKeys::user_key(user_id);
        let used = *self.cached.lock().unwrap().get(&key)?;
        let remaining = self.quota.size as i64 - used as i64;
        if remaining >= RECOMPUTE_THRESHOLD_BYTES {
            None
        } else {
            Some(remaining as f64 / 1024.0)
        }
    }

    /// Spec.md `/info/quota`: the user's current total bytes alongside
    /// the configured ceiling (`None` when quota enforcement is off),
    /// for the Protocol Adapter to render as `[used_kib, quota_kib]`.
    pub async fn quota_usage<E>(
        &self,
        db: &mut dyn Db<Error = E>,
        user_id: &UserIdentifier,
    ) -> Result<QuotaUsage, KernelError<E>>
    where
        E: DbErrorIntrospect,
    {
        let used_bytes = self.usage(db, user_id).await?;
        let limit_bytes = self.quota.enabled.then_some(self.quota.size as u64);
        Ok(QuotaUsage {
            used_bytes,
            limit_bytes,
        })
    }

    async fn usage<E>(
        &self,
        db: &mut dyn Db<Error = E>,
        user_id: &UserIdentifier,
    ) -> Result<u64, KernelError<E>>
    where
        E: DbErrorIntrospect,
    {
        let key = CacheKeys::user_key(user_id);
        let cached = self.cached.lock().unwrap().get(&key).copied();
        let needs_recompute = match cached {
            None => true,
            Some(used) => self.quota.size as i64 - used as i64 < RECOMPUTE_THRESHOLD_BYTES,
        };
        if !needs_recompute {
            return Ok(cached.expect("checked above"));
        }
        let fresh = db
            .get_storage_usage(user_id.clone())
            .await
            .map_err(KernelError::from_backend)?;
        self.cached.lock().unwrap().insert(key, fresh);
        Ok(fresh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quota() -> Quota {
        Quota {
            size: 10 * 1024 * 1024,
            enabled: true,
            enforced: true,
        }
    }

    #[test]
    fn advertises_nothing_with_plenty_of_headroom() {
        let accountant = QuotaAccountant::new(quota());
        let user_id = UserIdentifier {
            legacy_id: 1,
            fxa_uid: "user-a".to_owned(),
            fxa_kid: String::new(),
            hashed_fxa_uid: String::new(),
            hashed_device_id: String::new(),
        };
        accountant
            .cached
            .lock()
            .unwrap()
            .insert(CacheKeys::user_key(&user_id), 1024);
        assert_eq!(accountant.advertised_remaining_kib(&user_id), None);
    }

    #[test]
    fn advertises_remaining_once_within_a_mebibyte_of_the_ceiling() {
        let accountant = QuotaAccountant::new(quota());
        let user_id = UserIdentifier {
            legacy_id: 1,
            fxa_uid: "user-a".to_owned(),
            fxa_kid: String::new(),
            hashed_fxa_uid: String::new(),
            hashed_device_id: String::new(),
        };
        let used = quota().size as u64 - 1024;
        accountant
            .cached
            .lock()
            .unwrap()
            .insert(CacheKeys::user_key(&user_id), used);
        let remaining = accountant
            .advertised_remaining_kib(&user_id)
            .expect("should advertise when near the ceiling");
        assert!((remaining - 1.0).abs() < 0.01);
    }

    #[test]
    fn invalidate_clears_cached_usage() {
        let accountant = QuotaAccountant::new(quota());
        let user_id = UserIdentifier {
            legacy_id: 1,
            fxa_uid: "user-a".to_owned(),
            fxa_kid: String::new(),
            hashed_fxa_uid: String::new(),
            hashed_device_id: String::new(),
        };
        accountant
            .cached
            .lock()
            .unwrap()
            .insert(CacheKeys::user_key(&user_id), 999);
        accountant.invalidate(&user_id);
        assert!(accountant
            .cached
            .lock()
            .unwrap()
            .get(&CacheKeys::user_key(&user_id))
            .is_none());
    }
}
