//! Named caches and the submission outbox.
//!
//! This module provides the storage side of the worker:
//! - Named caches mapping GET requests to full responses, one of which is current
//! - A durable outbox of submissions that failed while offline
//! - SQLite and in-memory backends behind the same traits

mod memory;
mod storage;
mod traits;

pub use memory::MemoryStorage;
pub use storage::SqliteStorage;
pub use traits::{CacheStorage, OutboxStore, ResponseSource, Routed, Store};
#[cfg(test)]
pub use traits::PendingSubmission;
