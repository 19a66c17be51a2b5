use std::fmt;

use async_trait::async_trait;
use storage_types::{params, results, PurgeableStore};

use crate::error::ReaperError;

/// A single Durable Store instance the reaper knows how to sweep,
/// identified by a human-readable name for logging.
///
/// [`PurgeableStore`] is generic over its own `Error` type, which
/// differs per backend crate (storage-mysql, storage-sqlite, ...); this
/// trait erases that so the scheduler can hold a
/// `Vec<Box<dyn ReapableBackend>>` spanning every configured pool.
#[async_trait]
pub trait ReapableBackend: Sync + Send {
    fn name(&self) -> &str;

    async fn purge(
        &self,
        params: params::PurgeExpiredItems,
    ) -> Result<results::PurgeExpiredItems, ReaperError>;
}

/// Adapts any [`PurgeableStore`] whose error implements [`fmt::Display`]
/// into a [`ReapableBackend`].
pub struct NamedBackend<P> {
    name: String,
    pool: P,
}

impl<P> NamedBackend<P> {
    pub fn new(name: impl Into<String>, pool: P) -> Self {
        NamedBackend {
            name: name.into(),
            pool,
        }
    }
}

#[async_trait]
impl<P> ReapableBackend for NamedBackend<P>
where
    P: PurgeableStore + Sync + Send,
    P::Error: fmt::Display,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn purge(
        &self,
        params: params::PurgeExpiredItems,
    ) -> Result<results::PurgeExpiredItems, ReaperError> {
        self.pool
            .purge_expired_items(params)
            .await
            .map_err(|e| ReaperError::new(self.name.clone(), e))
    }
}
