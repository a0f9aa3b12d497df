//! Key-value state shared by the ingestion strategies: the backend adapter,
//! the per-table checksum and watermark stores, the distributed wait-group,
//! and the named lock that guards its updates.

mod checksum;
mod lock;
mod store;
mod waitgroup;
mod watermark;

pub use checksum::{migrate_blocked, ChecksumStore};
pub use lock::KvLock;
pub use store::{Kv, MemoryKv, RedisKv};
pub use waitgroup::{WaitGroup, STOPPED};
pub use watermark::WatermarkStore;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum KvError {
    #[error("redis command failed")]
    Redis(#[from] redis::RedisError),

    #[error("could not acquire lock `{key}` within {timeout_secs}s")]
    LockTimeout { key: String, timeout_secs: u64 },

    #[error("stored value at `{key}` is not an integer: {value:?}")]
    MalformedInteger { key: String, value: String },
}
