//! The Cache Coordinator and Cache Layer described in spec.md §4.3: a
//! `Db`/`BatchDb` decorator that keeps a redis-backed cache coherent
//! with the Durable Store behind it via a dirty-marker CAS protocol,
//! plus the cache-lock mode of the Lock Manager (spec.md §4.2) that
//! cache-only collections rely on.

pub mod client;
pub mod coordinator;
pub mod error;
pub mod lock;

pub use client::{CacheClient, CacheKeys, CasToken};
pub use coordinator::{CacheCoordinator, Classifier, CollectionClass, MetadataValue};
pub use error::CacheError;
pub use lock::{CacheLock, DEFAULT_LOCK_TTL_SECS};
