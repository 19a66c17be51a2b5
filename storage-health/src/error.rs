use std::fmt;

use backtrace::Backtrace;
use http::StatusCode;
use storage_cache::CacheError;
use storage_common::{impl_fmt_display, InternalError, ReportableError};
use thiserror::Error;

/// Errors raised while pinging a backend or publishing its status.
/// These stay internal to the monitor loop: a ping failure becomes an
/// `unhealthy` status write, not a propagated error.
#[derive(Debug)]
pub struct HealthError {
    kind: HealthErrorKind,
    pub status: StatusCode,
    pub backtrace: Backtrace,
}

#[derive(Debug, Error)]
enum HealthErrorKind {
    #[error("ping timed out")]
    Timeout,

    #[error("ping failed: {}", _0)]
    PingFailed(String),

    #[error("cache error: {}", _0)]
    Cache(CacheError),
}

impl HealthError {
    pub fn timeout() -> Self {
        HealthErrorKind::Timeout.into()
    }

    pub fn ping_failed(msg: impl fmt::Display) -> Self {
        HealthErrorKind::PingFailed(msg.to_string()).into()
    }
}

impl From<HealthErrorKind> for HealthError {
    fn from(kind: HealthErrorKind) -> Self {
        Self {
            kind,
            status: StatusCode::SERVICE_UNAVAILABLE,
            backtrace: Backtrace::new(),
        }
    }
}

impl From<CacheError> for HealthError {
    fn from(e: CacheError) -> Self {
        HealthErrorKind::Cache(e).into()
    }
}

impl ReportableError for HealthError {
    fn error_backtrace(&self) -> String {
        format!("{:#?}", self.backtrace)
    }

    fn is_sentry_event(&self) -> bool {
        matches!(self.kind, HealthErrorKind::Cache(_))
    }

    fn metric_label(&self) -> Option<String> {
        match &self.kind {
            HealthErrorKind::Timeout => Some("storage.health.timeout".to_owned()),
            HealthErrorKind::PingFailed(_) => Some("storage.health.ping_failed".to_owned()),
            HealthErrorKind::Cache(_) => Some("storage.health.cache_error".to_owned()),
        }
    }
}

impl InternalError for HealthError {
    fn internal_error(message: String) -> Self {
        HealthErrorKind::PingFailed(message).into()
    }
}

impl_fmt_display!(HealthError, HealthErrorKind);
