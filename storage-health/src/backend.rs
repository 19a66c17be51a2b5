use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use storage_types::DbPool;

use crate::error::HealthError;

/// A single Durable Store host the monitor knows how to ping, erased
/// over the pool's own `Error` type the same way
/// [`storage_reaper::ReapableBackend`] erases [`storage_types::PurgeableStore`].
#[async_trait]
pub trait PingableBackend: Sync + Send {
    fn name(&self) -> &str;

    async fn ping(&self) -> Result<(), HealthError>;
}

pub struct NamedPool<P> {
    name: String,
    pool: P,
}

impl<P> NamedPool<P> {
    pub fn new(name: impl Into<String>, pool: P) -> Self {
        NamedPool {
            name: name.into(),
            pool,
        }
    }
}

#[async_trait]
impl<P> PingableBackend for NamedPool<P>
where
    P: DbPool + Sync + Send,
    P::Error: fmt::Display,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn ping(&self) -> Result<(), HealthError> {
        let mut db = self.pool.get().await.map_err(HealthError::ping_failed)?;
        let ok = db.check().await.map_err(HealthError::ping_failed)?;
        if ok {
            Ok(())
        } else {
            Err(HealthError::ping_failed("check() returned false"))
        }
    }
}

/// Supplies the monitor's current set of backends to ping, re-evaluated
/// once per loop iteration so added/removed hosts take effect without a
/// restart (spec.md §4.7).
#[async_trait]
pub trait BackendDirectory: Sync + Send {
    async fn backends(&self) -> Vec<Arc<dyn PingableBackend>>;
}

/// A directory over a fixed list, for deployments whose host set is
/// static for the life of the process.
pub struct StaticDirectory {
    backends: Vec<Arc<dyn PingableBackend>>,
}

impl StaticDirectory {
    pub fn new(backends: Vec<Arc<dyn PingableBackend>>) -> Self {
        StaticDirectory { backends }
    }
}

#[async_trait]
impl BackendDirectory for StaticDirectory {
    async fn backends(&self) -> Vec<Arc<dyn PingableBackend>> {
        self.backends.clone()
    }
}
