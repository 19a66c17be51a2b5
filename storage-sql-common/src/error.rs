use std::fmt;

use backtrace::Backtrace;
use http::StatusCode;
use storage_common::{from_error, impl_fmt_display, InternalError, ReportableError};
use storage_db_common::error::SqlError;
use storage_types::error::{CommonDbError, DbErrorConstructors, DbErrorIntrospect};
use thiserror::Error;

/// An error type that represents any Sqlite-related errors that may occur while processing a
/// storage request. These errors may be application-specific or lower-level errors that arise
/// from the database backend.
#[derive(Debug)]
pub struct DbError {
    kind: DbErrorKind,
    pub status: StatusCode,
    pub backtrace: Box<Backtrace>,
}

impl DbError {
    pub fn batch_not_found() -> Self {
        DbErrorKind::Common(CommonDbError::batch_not_found()).into()
    }

    pub fn bso_not_found() -> Self {
        DbErrorKind::Common(CommonDbError::bso_not_found()).into()
    }

    pub fn collection_not_found() -> Self {
        DbErrorKind::Common(CommonDbError::collection_not_found()).into()
    }

    pub fn conflict() -> Self {
        DbErrorKind::Common(CommonDbError::conflict()).into()
    }

    pub fn internal(msg: String) -> Self {
        DbErrorKind::Common(CommonDbError::internal(msg)).into()
    }

    pub fn quota() -> Self {
        DbErrorKind::Common(CommonDbError::quota()).into()
    }
}

#[derive(Debug, Error)]
enum DbErrorKind {
    #[error("{}", _0)]
    Common(CommonDbError),

    #[error("{}", _0)]
    Sqlite(SqlError),
}

impl From<DbErrorKind> for DbError {
    fn from(kind: DbErrorKind) -> Self {
        match &kind {
            DbErrorKind::Common(dbe) => Self {
                status: dbe.status,
                backtrace: Box::new(dbe.backtrace.clone()),
                kind,
            },
            _ => Self {
                kind,
                status: StatusCode::INTERNAL_SERVER_ERROR,
                backtrace: Box::new(Backtrace::new()),
            },
        }
    }
}

impl DbErrorIntrospect for DbError {
    fn is_batch_not_found(&self) -> bool {
        matches!(&self.kind, DbErrorKind::Common(e) if e.is_batch_not_found())
    }

    fn is_bso_not_found(&self) -> bool {
        matches!(&self.kind, DbErrorKind::Common(e) if e.is_bso_not_found())
    }

    fn is_collection_not_found(&self) -> bool {
        matches!(&self.kind, DbErrorKind::Common(e) if e.is_collection_not_found())
    }

    fn is_conflict(&self) -> bool {
        matches!(&self.kind, DbErrorKind::Common(e) if e.is_conflict())
    }

    fn is_quota(&self) -> bool {
        matches!(&self.kind, DbErrorKind::Common(e) if e.is_quota())
    }
}

impl ReportableError for DbError {
    fn error_backtrace(&self) -> String {
        format!("{:#?}", self.backtrace)
    }

    fn is_sentry_event(&self) -> bool {
        match &self.kind {
            DbErrorKind::Common(e) => e.is_sentry_event(),
            DbErrorKind::Sqlite(e) => e.is_sentry_event(),
        }
    }

    fn metric_label(&self) -> Option<String> {
        match &self.kind {
            DbErrorKind::Common(e) => e.metric_label(),
            DbErrorKind::Sqlite(e) => e.metric_label(),
        }
    }
}

impl InternalError for DbError {
    fn internal_error(message: String) -> Self {
        DbErrorKind::Common(CommonDbError::internal(message)).into()
    }
}

impl DbErrorConstructors for DbError {
    fn conflict() -> Self {
        DbError::conflict()
    }

    fn quota() -> Self {
        DbError::quota()
    }

    fn collection_not_found() -> Self {
        DbError::collection_not_found()
    }

    fn bso_not_found() -> Self {
        DbError::bso_not_found()
    }

    fn internal(msg: String) -> Self {
        DbError::internal(msg)
    }
}

impl_fmt_display!(DbError, DbErrorKind);

from_error!(CommonDbError, DbError, DbErrorKind::Common);
from_error!(
    diesel::result::Error,
    DbError,
    |error: diesel::result::Error| DbError::from(DbErrorKind::Sqlite(SqlError::from(error)))
);
from_error!(
    diesel::result::ConnectionError,
    DbError,
    |error: diesel::result::ConnectionError| DbError::from(DbErrorKind::Sqlite(SqlError::from(
        error
    )))
);
from_error!(
    diesel::r2d2::PoolError,
    DbError,
    |error: diesel::r2d2::PoolError| DbError::from(DbErrorKind::Sqlite(SqlError::from(error)))
);
from_error!(
    Box<dyn std::error::Error + Send + Sync>,
    DbError,
    |error: Box<dyn std::error::Error + Send + Sync>| DbError::from(DbErrorKind::Sqlite(
        SqlError::from(error)
    ))
);
