//! The storage kernel: the Lock Manager, Quota Accountant, and the
//! `SyncStorage` facade that composes them with the Durable Store, Cache
//! Coordinator, and Batch Pipeline crates into the request-serving data
//! flows from spec.md's system overview. Implements no HTTP; that is the
//! Protocol Adapter's job, built on top of this crate's [`KernelError`]
//! and [`Disposition`].

#[macro_use]
extern crate slog_scope;

mod error;
mod lock;
mod precondition;
mod quota;
mod storage;

pub use error::{Disposition, KernelError};
pub use lock::{HeldLock, LockManager};
pub use precondition::Precondition;
pub use quota::{QuotaAccountant, QuotaUsage};
pub use storage::SyncStorage;
