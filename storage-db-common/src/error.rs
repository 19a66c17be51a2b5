use std::fmt;

use backtrace::Backtrace;
use storage_common::ReportableError;
use thiserror::Error;

/// Wraps the lower-level errors that can come out of a diesel-backed durable
/// store (connection loss, constraint violations, pool exhaustion, schema
/// migration failures) so that the MySQL and SQLite backends share one
/// reporting/metric-label shape regardless of which diesel backend is
/// actually driving the connection.
#[derive(Debug)]
pub struct SqlError {
    kind: SqlErrorKind,
    pub backtrace: Backtrace,
}

#[derive(Debug, Error)]
enum SqlErrorKind {
    #[error("{}", _0)]
    Diesel(diesel::result::Error),

    #[error("{}", _0)]
    Connection(diesel::result::ConnectionError),

    #[error("{}", _0)]
    Pool(diesel::r2d2::PoolError),

    #[error("migration failed: {}", _0)]
    Migration(String),
}

impl SqlError {
    /// True when the underlying connection was invalidated (dropped socket,
    /// server restart) rather than a genuine constraint or lock-wait failure.
    /// The durable store retries exactly once on this class of error.
    pub fn is_connection_invalidated(&self) -> bool {
        matches!(self.kind, SqlErrorKind::Connection(_))
    }

    pub fn is_lock_wait_timeout(&self) -> bool {
        if let SqlErrorKind::Diesel(diesel::result::Error::DatabaseError(_, ref info)) = self.kind
        {
            return info.message().contains("Lock wait timeout exceeded");
        }
        false
    }
}

macro_rules! from_kind {
    ($error:ty, $variant:ident) => {
        impl From<$error> for SqlError {
            fn from(error: $error) -> Self {
                SqlError {
                    kind: SqlErrorKind::$variant(error),
                    backtrace: Backtrace::new(),
                }
            }
        }
    };
}

from_kind!(diesel::result::Error, Diesel);
from_kind!(diesel::result::ConnectionError, Connection);
from_kind!(diesel::r2d2::PoolError, Pool);

impl From<Box<dyn std::error::Error + Send + Sync>> for SqlError {
    fn from(error: Box<dyn std::error::Error + Send + Sync>) -> Self {
        SqlError {
            kind: SqlErrorKind::Migration(error.to_string()),
            backtrace: Backtrace::new(),
        }
    }
}

impl fmt::Display for SqlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.kind, f)
    }
}

impl ReportableError for SqlError {
    fn error_backtrace(&self) -> String {
        format!("{:#?}", self.backtrace)
    }

    fn is_sentry_event(&self) -> bool {
        // lock-wait timeouts are expected under contention and get folded
        // into the Conflict path upstream; don't spam sentry with them.
        !self.is_lock_wait_timeout()
    }

    fn metric_label(&self) -> Option<String> {
        if self.is_lock_wait_timeout() {
            Some("storage.sql.lock_wait_timeout".to_owned())
        } else if self.is_connection_invalidated() {
            Some("storage.sql.connection_invalidated".to_owned())
        } else {
            None
        }
    }
}
