use std::fmt;

use thiserror::Error;

/// Errors raised while parsing, validating, or committing a multi-BSO
/// write, before any per-item `{success, failed}` accounting applies.
/// These are request-level failures (spec.md §4.4 steps 1/2/4): a bad
/// content type, an unparseable body, a duplicate id, or exceeding the
/// quota ceiling. A failure partway through the durable write itself is
/// *not* one of these — it's folded into the response's `failed` map
/// instead, per step 6.
#[derive(Debug, Error)]
pub enum BatchError<E> {
    #[error("unsupported batch content type")]
    UnsupportedContentType,

    #[error("malformed batch body: {0}")]
    MalformedBody(String),

    #[error("duplicate id within batch: {0}")]
    DuplicateId(String),

    #[error("over quota")]
    OverQuota,

    #[error("batch backend error: {0}")]
    Backend(E),
}

impl<E: fmt::Debug> BatchError<E> {
    pub fn is_request_error(&self) -> bool {
        !matches!(self, BatchError::Backend(_))
    }
}
