//! The TTL Reaper (spec.md §4.6): a scheduled sweep that purges expired
//! rows from each configured Durable Store, independently of request
//! serving.

#[macro_use]
extern crate slog_scope;

mod backend;
mod error;
mod reaper;

pub use backend::{NamedBackend, ReapableBackend};
pub use error::ReaperError;
pub use reaper::{purge_once, run_forever, ReaperConfig};
