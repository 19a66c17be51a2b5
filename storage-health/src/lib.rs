//! The Backend Health Monitor (spec.md §4.7): a separate scheduled loop
//! that pings every configured Durable Store and publishes an
//! ok/unhealthy/down tri-state via the cache, leaving manual `down`
//! overrides alone.

#[macro_use]
extern crate slog_scope;

mod backend;
mod error;
mod monitor;
mod status;

pub use backend::{BackendDirectory, NamedPool, PingableBackend, StaticDirectory};
pub use error::HealthError;
pub use monitor::{run_forever, MonitorConfig};
pub use status::{HealthKeys, HealthStatus};
