//! The Batch Pipeline (spec.md §4.4): parses a multi-BSO write body,
//! validates and caps it, checks quota, and commits it atomically under
//! the target collection's write lock.

pub mod error;
pub mod parse;
pub mod pipeline;

pub use error::BatchError;
pub use parse::BodyFormat;
pub use pipeline::{write_bsos, BatchWriteResult};
