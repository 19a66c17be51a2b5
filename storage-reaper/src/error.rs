use std::fmt;

use thiserror::Error;

/// Wraps a single backend's purge failure with the name it was
/// registered under, so the scheduler can log which backend misbehaved
/// without halting the sweep over the rest.
#[derive(Debug, Error)]
#[error("purge of backend {backend} failed: {source}")]
pub struct ReaperError {
    pub backend: String,
    pub source: String,
}

impl ReaperError {
    pub fn new(backend: impl Into<String>, source: impl fmt::Display) -> Self {
        ReaperError {
            backend: backend.into(),
            source: source.to_string(),
        }
    }
}
