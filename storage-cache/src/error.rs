use std::fmt;

use backtrace::Backtrace;
use http::StatusCode;
use storage_common::{impl_fmt_display, InternalError, ReportableError};
use thiserror::Error;

/// Errors raised by the Cache Layer client and the dirty-marker protocol
/// it backs. These never leave `storage-cache` directly: callers generic
/// over a backend error type (`storage_types::error::DbErrorConstructors`)
/// fold a `CacheError` into their own error type, the same way
/// `storage-sql-common`/`storage-mysql` fold a `SqlError` into their
/// `DbError`.
#[derive(Debug)]
pub struct CacheError {
    kind: CacheErrorKind,
    pub status: StatusCode,
    pub backtrace: Backtrace,
}

#[derive(Debug, Error)]
enum CacheErrorKind {
    #[error("cache backend error: {}", _0)]
    Backend(redis::RedisError),

    #[error("cache CAS conflict")]
    CasConflict,

    #[error("cache serialization error: {}", _0)]
    Serde(serde_json::Error),

    #[error("{}", _0)]
    Internal(String),
}

impl CacheError {
    pub fn cas_conflict() -> Self {
        CacheErrorKind::CasConflict.into()
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        CacheErrorKind::Internal(msg.into()).into()
    }

    pub fn is_cas_conflict(&self) -> bool {
        matches!(self.kind, CacheErrorKind::CasConflict)
    }
}

impl From<CacheErrorKind> for CacheError {
    fn from(kind: CacheErrorKind) -> Self {
        let status = match kind {
            CacheErrorKind::CasConflict => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            kind,
            status,
            backtrace: Backtrace::new(),
        }
    }
}

impl From<redis::RedisError> for CacheError {
    fn from(e: redis::RedisError) -> Self {
        CacheErrorKind::Backend(e).into()
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheErrorKind::Serde(e).into()
    }
}

impl ReportableError for CacheError {
    fn error_backtrace(&self) -> String {
        format!("{:#?}", self.backtrace)
    }

    fn is_sentry_event(&self) -> bool {
        !matches!(self.kind, CacheErrorKind::CasConflict)
    }

    fn metric_label(&self) -> Option<String> {
        match self.kind {
            CacheErrorKind::CasConflict => Some("storage.cache.cas_conflict".to_owned()),
            CacheErrorKind::Backend(_) => Some("storage.cache.backend_error".to_owned()),
            _ => None,
        }
    }
}

impl InternalError for CacheError {
    fn internal_error(message: String) -> Self {
        CacheErrorKind::Internal(message).into()
    }
}

impl_fmt_display!(CacheError, CacheErrorKind);
