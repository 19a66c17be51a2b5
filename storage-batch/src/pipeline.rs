//! The Batch Pipeline itself (spec.md §4.4): per-item validation,
//! per-batch size caps, a quota pre-check, and a single commit under the
//! collection write lock.

use std::collections::{HashMap, HashSet};
use std::fmt;

use storage_settings::{Quota, ServerLimits};
use storage_types::{
    bso, error::DbErrorIntrospect, params, params::PostCollectionBso, util::SyncTimestamp, Db,
    UserIdentifier,
};

use crate::error::BatchError;
use crate::parse::{parse_items, BodyFormat};

/// Always the pipeline's result shape, win or partial-loss, per spec.md
/// §4.4: `{success: [ids], failed: {id -> reason}, modified: ts}`.
#[derive(Debug, Clone, Default)]
pub struct BatchWriteResult {
    pub success: Vec<String>,
    pub failed: HashMap<String, String>,
    pub modified: SyncTimestamp,
}

/// Runs the full pipeline against `db`, which must already be the
/// connection the caller intends to hold the write lock on.
pub async fn write_bsos<E>(
    db: &mut dyn Db<Error = E>,
    user_id: UserIdentifier,
    collection: String,
    format: BodyFormat,
    body: &str,
    limits: &ServerLimits,
    quota: &Quota,
) -> Result<BatchWriteResult, BatchError<E>>
where
    E: DbErrorIntrospect + fmt::Display + fmt::Debug + 'static,
{
    let raw_items = parse_items::<E>(format, body)?;

    let mut failed = HashMap::new();
    let mut seen_ids = HashSet::new();
    let mut accepted = Vec::new();

    // Step 2: per-item validation, request-level duplicate rejection.
    for raw in raw_items {
        let id = raw.id.clone().unwrap_or_default();
        match bso::validate(&id, &raw) {
            Ok(valid) => {
                if !seen_ids.insert(valid.id.clone()) {
                    return Err(BatchError::DuplicateId(valid.id));
                }
                accepted.push(valid);
            }
            Err(e) => {
                failed.insert(id, e.to_string());
            }
        }
    }

    // Step 3: per-batch record/byte caps. Once either cap is exceeded,
    // every subsequent item (including the one that tipped it over) is
    // rejected for the client to retry, not silently dropped.
    let (within_limits, capped) = apply_limits(
        accepted,
        limits.max_post_records as usize,
        limits.max_post_bytes as usize,
    );
    failed.extend(capped);

    if within_limits.is_empty() {
        return Ok(BatchWriteResult {
            success: Vec::new(),
            failed,
            modified: db.timestamp(),
        });
    }

    // Step 4: quota pre-admission check against the sum of accepted payloads.
    if quota.enabled {
        let accepted_bytes: usize = within_limits
            .iter()
            .map(|i| i.payload.as_ref().map_or(0, |p| p.len()))
            .sum();
        let collection_id = db
            .get_collection_id(&collection)
            .await
            .map_err(BatchError::Backend)?;
        let usage = db
            .get_quota_usage(params::GetQuotaUsage {
                user_id: user_id.clone(),
                collection: collection.clone(),
                collection_id,
            })
            .await
            .map_err(BatchError::Backend)?;
        let remaining = quota.size as i64 - usage.total_bytes as i64 - accepted_bytes as i64;
        if quota.enforced && remaining <= 0 {
            return Err(BatchError::OverQuota);
        }
    }

    // Step 5/6: commit atomically under the write lock; a failed write
    // folds the attempted ids into `failed` rather than aborting.
    db.lock_for_write(params::LockCollection {
        user_id: user_id.clone(),
        collection: collection.clone(),
    })
    .await
    .map_err(BatchError::Backend)?;

    let attempted_ids: Vec<String> = within_limits.iter().map(|i| i.id.clone()).collect();
    let bsos: Vec<PostCollectionBso> = within_limits
        .into_iter()
        .map(|v| PostCollectionBso {
            id: v.id,
            sortindex: v.sortindex,
            payload: v.payload,
            ttl: v.ttl,
        })
        .collect();

    let post_result = db
        .post_bsos(params::PostBsos {
            user_id,
            collection,
            bsos,
            for_batch: false,
            failed: HashMap::new(),
        })
        .await;

    match post_result {
        Ok(modified) => {
            db.commit().await.map_err(BatchError::Backend)?;
            Ok(BatchWriteResult {
                success: attempted_ids,
                failed,
                modified,
            })
        }
        Err(e) => {
            let reason = e.to_string();
            for id in attempted_ids {
                failed.insert(id, reason.clone());
            }
            let modified = db.timestamp();
            db.rollback().await.map_err(BatchError::Backend)?;
            Ok(BatchWriteResult {
                success: Vec::new(),
                failed,
                modified,
            })
        }
    }
}

/// Splits `items` into those within `max_records`/`max_bytes` and a
/// `{id -> reason}` map for the rest, in original order. Pulled out of
/// [`write_bsos`] so it can be tested without a `Db` fake.
fn apply_limits(
    items: Vec<bso::ValidBso>,
    max_records: usize,
    max_bytes: usize,
) -> (Vec<bso::ValidBso>, HashMap<String, String>) {
    let mut failed = HashMap::new();
    let mut within_limits = Vec::new();
    let mut record_count = 0usize;
    let mut byte_count = 0usize;

    for item in items {
        let item_bytes = item.payload.as_ref().map_or(0, |p| p.len());
        record_count += 1;
        byte_count += item_bytes;
        if record_count > max_records {
            failed.insert(item.id, "retry bso".to_owned());
        } else if byte_count > max_bytes {
            failed.insert(item.id, "retry bytes".to_owned());
        } else {
            within_limits.push(item);
        }
    }

    (within_limits, failed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str, payload_len: usize) -> bso::ValidBso {
        bso::ValidBso {
            id: id.to_owned(),
            sortindex: None,
            payload: Some("x".repeat(payload_len)),
            ttl: None,
        }
    }

    #[test]
    fn surplus_records_retry_bso() {
        let items = vec![item("a", 1), item("b", 1), item("c", 1)];
        let (ok, failed) = apply_limits(items, 2, 1000);
        assert_eq!(ok.len(), 2);
        assert_eq!(failed.get("c"), Some(&"retry bso".to_owned()));
    }

    #[test]
    fn surplus_bytes_retry_bytes() {
        let items = vec![item("a", 500), item("b", 600)];
        let (ok, failed) = apply_limits(items, 100, 1000);
        assert_eq!(ok.len(), 1);
        assert_eq!(failed.get("b"), Some(&"retry bytes".to_owned()));
    }

    #[test]
    fn within_limits_all_pass() {
        let items = vec![item("a", 10), item("b", 10)];
        let (ok, failed) = apply_limits(items, 100, 1000);
        assert_eq!(ok.len(), 2);
        assert!(failed.is_empty());
    }
}
