use std::fmt;

use backtrace::Backtrace;
use http::StatusCode;
use storage_cache::CacheError;
use storage_common::{InternalError, ReportableError};
use storage_types::error::DbErrorIntrospect;
use storage_types::util::SyncTimestamp;
use thiserror::Error;

/// How a [`KernelError`] should be surfaced, independent of any HTTP
/// framework (spec.md §7). The Protocol Adapter maps each variant to a
/// status code and body shape exactly once; nothing upstream of it
/// needs to know these names.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    CollectionNotFound,
    ItemNotFound,
    Conflict,
    InvalidOffset,
    OverQuota,
    SizeLimitExceeded,
    InvalidObject,
    BackendError,
    PreconditionFailed,
    /// `X-If-Modified-Since` matched: 304, not an error condition in the
    /// HTTP sense, but still propagated as a `KernelError` since no
    /// further kernel work (and no mutation) should happen past it.
    NotModified,
}

impl Disposition {
    /// Whether the Protocol Adapter's single automatic retry (spec.md
    /// §7: "if the initial request took under 200ms") applies to this
    /// disposition at all. Only `Conflict` and an unclassified backend
    /// failure are retry-eligible; everything else is a stable rejection.
    pub fn retryable(&self) -> bool {
        matches!(self, Disposition::Conflict | Disposition::BackendError)
    }
}

/// The storage kernel's unified error type: every request-facing
/// operation in `storage-kernel` returns `Result<_, KernelError<E>>`,
/// where `E` is the caller's chosen Durable Store backend error. A
/// `KernelError` either reclassifies a backend error already raised by
/// `E` or `CacheError`, or names a failure the kernel itself detects
/// (bad offset, oversized request, malformed object, stale precondition).
#[derive(Debug)]
pub struct KernelError<E> {
    kind: KernelErrorKind<E>,
    pub status: StatusCode,
    pub backtrace: Backtrace,
    /// Set on [`KernelError::not_modified`] and
    /// [`KernelError::precondition_failed`] so the caller can still
    /// render `X-Last-Modified` on a 304/412 response (spec.md §8.2).
    pub last_modified: Option<SyncTimestamp>,
}

#[derive(Debug, Error)]
enum KernelErrorKind<E> {
    #[error("collection not found")]
    CollectionNotFound,
    #[error("item not found")]
    ItemNotFound,
    #[error("conflicting write")]
    Conflict,
    #[error("invalid offset token")]
    InvalidOffset,
    #[error("over quota")]
    OverQuota,
    #[error("request exceeds a configured size limit")]
    SizeLimitExceeded,
    #[error("invalid object: {0}")]
    InvalidObject(String),
    #[error("precondition failed")]
    PreconditionFailed,
    #[error("not modified")]
    NotModified,
    #[error("backend error: {0}")]
    Backend(E),
    #[error("cache error: {0}")]
    Cache(CacheError),
}

impl<E> KernelError<E> {
    pub fn over_quota() -> Self {
        KernelErrorKind::OverQuota.into()
    }

    pub fn invalid_offset() -> Self {
        KernelErrorKind::InvalidOffset.into()
    }

    pub fn size_limit_exceeded() -> Self {
        KernelErrorKind::SizeLimitExceeded.into()
    }

    pub fn invalid_object(reason: impl Into<String>) -> Self {
        KernelErrorKind::InvalidObject(reason.into()).into()
    }

    pub fn precondition_failed(resource_ts: SyncTimestamp) -> Self {
        let mut err: Self = KernelErrorKind::PreconditionFailed.into();
        err.last_modified = Some(resource_ts);
        err
    }

    pub fn not_modified(resource_ts: SyncTimestamp) -> Self {
        let mut err: Self = KernelErrorKind::NotModified.into();
        err.last_modified = Some(resource_ts);
        err
    }

    pub fn cache(e: CacheError) -> Self {
        KernelErrorKind::Cache(e).into()
    }

    pub fn disposition(&self) -> Disposition {
        match &self.kind {
            KernelErrorKind::CollectionNotFound => Disposition::CollectionNotFound,
            KernelErrorKind::ItemNotFound => Disposition::ItemNotFound,
            KernelErrorKind::Conflict => Disposition::Conflict,
            KernelErrorKind::InvalidOffset => Disposition::InvalidOffset,
            KernelErrorKind::OverQuota => Disposition::OverQuota,
            KernelErrorKind::SizeLimitExceeded => Disposition::SizeLimitExceeded,
            KernelErrorKind::InvalidObject(_) => Disposition::InvalidObject,
            KernelErrorKind::PreconditionFailed => Disposition::PreconditionFailed,
            KernelErrorKind::NotModified => Disposition::NotModified,
            KernelErrorKind::Backend(_) | KernelErrorKind::Cache(_) => Disposition::BackendError,
        }
    }
}

impl<E: DbErrorIntrospect> KernelError<E> {
    /// Reclassifies a Durable Store error into the kernel's own
    /// vocabulary, folding the well-known cases
    /// ([`DbErrorIntrospect`]) down to their kernel dispositions and
    /// leaving anything else as an opaque backend error.
    pub fn from_backend(e: E) -> Self {
        if e.is_collection_not_found() {
            KernelErrorKind::CollectionNotFound.into()
        } else if e.is_bso_not_found() || e.is_batch_not_found() {
            KernelErrorKind::ItemNotFound.into()
        } else if e.is_conflict() {
            KernelErrorKind::Conflict.into()
        } else if e.is_quota() {
            KernelErrorKind::OverQuota.into()
        } else {
            KernelErrorKind::Backend(e).into()
        }
    }
}

impl<E> From<KernelErrorKind<E>> for KernelError<E> {
    fn from(kind: KernelErrorKind<E>) -> Self {
        let status = match kind {
            KernelErrorKind::CollectionNotFound | KernelErrorKind::ItemNotFound => {
                StatusCode::NOT_FOUND
            }
            KernelErrorKind::Conflict | KernelErrorKind::Backend(_) | KernelErrorKind::Cache(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            KernelErrorKind::InvalidOffset
            | KernelErrorKind::SizeLimitExceeded
            | KernelErrorKind::InvalidObject(_) => StatusCode::BAD_REQUEST,
            KernelErrorKind::OverQuota => StatusCode::FORBIDDEN,
            KernelErrorKind::PreconditionFailed => StatusCode::PRECONDITION_FAILED,
            KernelErrorKind::NotModified => StatusCode::NOT_MODIFIED,
        };
        Self {
            kind,
            status,
            backtrace: Backtrace::new(),
            last_modified: None,
        }
    }
}

impl<E: fmt::Display> ReportableError for KernelError<E> {
    fn error_backtrace(&self) -> String {
        format!("{:#?}", self.backtrace)
    }

    fn is_sentry_event(&self) -> bool {
        !matches!(
            self.kind,
            KernelErrorKind::Conflict
                | KernelErrorKind::InvalidObject(_)
                | KernelErrorKind::NotModified
                | KernelErrorKind::PreconditionFailed
        )
    }

    fn metric_label(&self) -> Option<String> {
        match &self.kind {
            KernelErrorKind::Conflict => Some("storage.kernel.conflict".to_owned()),
            KernelErrorKind::OverQuota => Some("storage.kernel.quota".to_owned()),
            KernelErrorKind::Backend(_) => Some("storage.kernel.backend_error".to_owned()),
            KernelErrorKind::Cache(_) => Some("storage.kernel.cache_error".to_owned()),
            _ => None,
        }
    }
}

impl<E: fmt::Debug> InternalError for KernelError<E> {
    fn internal_error(message: String) -> Self {
        KernelErrorKind::InvalidObject(message).into()
    }
}

impl<E: fmt::Display> fmt::Display for KernelError<E> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.kind, formatter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_is_retryable_not_found_is_not() {
        assert!(Disposition::Conflict.retryable());
        assert!(!Disposition::CollectionNotFound.retryable());
    }

    #[test]
    fn over_quota_maps_to_403() {
        let err: KernelError<String> = KernelErrorKind::OverQuota.into();
        assert_eq!(err.status, StatusCode::FORBIDDEN);
        assert_eq!(err.disposition(), Disposition::OverQuota);
    }
}
