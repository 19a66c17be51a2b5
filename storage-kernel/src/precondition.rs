//! The precondition-check stage of spec.md §9's middleware chain:
//! `X-If-Modified-Since` / `X-If-Unmodified-Since` evaluated against the
//! timestamp of whichever resource (storage, collection, or item) the
//! request names. Carries no HTTP types — the Protocol Adapter parses
//! the header into a [`SyncTimestamp`] and hands it in; this module only
//! knows how to compare it to what the Durable Store reports.

use storage_types::{error::DbErrorIntrospect, params, util::SyncTimestamp, Db, UserIdentifier};

use crate::error::KernelError;

/// A parsed precondition header, or the absence of one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Precondition {
    None,
    IfModifiedSince(SyncTimestamp),
    IfUnmodifiedSince(SyncTimestamp),
}

impl Default for Precondition {
    fn default() -> Self {
        Precondition::None
    }
}

impl Precondition {
    /// Evaluates `self` against a resource's current timestamp. A
    /// matching `IfModifiedSince` fails with [`KernelError::not_modified`]
    /// (304, no mutation performed); a matching `IfUnmodifiedSince` fails
    /// with [`KernelError::precondition_failed`] (412, no mutation
    /// performed). Both carry `resource_ts` so the caller can still
    /// render `X-Last-Modified` on the rejection.
    pub fn check<E>(&self, resource_ts: SyncTimestamp) -> Result<(), KernelError<E>> {
        match self {
            Precondition::IfModifiedSince(since) if resource_ts <= *since => {
                Err(KernelError::not_modified(resource_ts))
            }
            Precondition::IfUnmodifiedSince(since) if resource_ts > *since => {
                Err(KernelError::precondition_failed(resource_ts))
            }
            _ => Ok(()),
        }
    }
}

/// Looks up the timestamp of the resource a request names: the user's
/// whole storage, one collection, or one item within a collection. A
/// resource that doesn't exist yet reads as timestamp zero rather than
/// `CollectionNotFound`/`ItemNotFound`, so a precondition check ahead of
/// a first-ever write (spec.md S1's first PUT) behaves the same as any
/// other "nothing here yet" read. Mirrors the teacher's
/// `extract_resource` (`syncstorage-db-common::Db::extract_resource`).
pub async fn resource_timestamp<E>(
    db: &mut dyn Db<Error = E>,
    user_id: &UserIdentifier,
    collection: Option<&str>,
    id: Option<&str>,
) -> Result<SyncTimestamp, KernelError<E>>
where
    E: DbErrorIntrospect,
{
    let collection = match collection {
        None => return db.get_storage_timestamp(user_id.clone()).await.map_err(KernelError::from_backend),
        Some(c) => c,
    };
    match id {
        None => {
            match db
                .get_collection_timestamp(params::GetCollectionTimestamp {
                    user_id: user_id.clone(),
                    collection: collection.to_owned(),
                })
                .await
            {
                Ok(ts) => Ok(ts),
                Err(e) if e.is_collection_not_found() => Ok(SyncTimestamp::zero()),
                Err(e) => Err(KernelError::from_backend(e)),
            }
        }
        Some(id) => {
            match db
                .get_bso_timestamp(params::GetBsoTimestamp {
                    user_id: user_id.clone(),
                    collection: collection.to_owned(),
                    id: id.to_owned(),
                })
                .await
            {
                Ok(ts) => Ok(ts),
                Err(e) if e.is_collection_not_found() || e.is_bso_not_found() => {
                    Ok(SyncTimestamp::zero())
                }
                Err(e) => Err(KernelError::from_backend(e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(seconds: f64) -> SyncTimestamp {
        SyncTimestamp::from_seconds(seconds)
    }

    #[test]
    fn if_unmodified_since_passes_when_resource_is_older() {
        let precond = Precondition::IfUnmodifiedSince(ts(10.0));
        assert!(precond.check::<()>(ts(10.0)).is_ok());
        assert!(precond.check::<()>(ts(9.0)).is_ok());
    }

    #[test]
    fn if_unmodified_since_fails_when_resource_is_newer() {
        let precond = Precondition::IfUnmodifiedSince(ts(10.0));
        let err = precond.check::<()>(ts(10.01)).unwrap_err();
        assert_eq!(err.disposition(), crate::Disposition::PreconditionFailed);
        assert_eq!(err.last_modified, Some(ts(10.01)));
    }

    #[test]
    fn if_modified_since_reports_not_modified_when_unchanged() {
        let precond = Precondition::IfModifiedSince(ts(10.0));
        let err = precond.check::<()>(ts(10.0)).unwrap_err();
        assert_eq!(err.disposition(), crate::Disposition::NotModified);
    }

    #[test]
    fn if_modified_since_passes_when_resource_is_newer() {
        let precond = Precondition::IfModifiedSince(ts(10.0));
        assert!(precond.check::<()>(ts(10.01)).is_ok());
    }

    #[test]
    fn no_precondition_always_passes() {
        assert!(Precondition::None.check::<()>(ts(0.0)).is_ok());
    }
}
