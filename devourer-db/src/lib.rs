//! Upstream-database side of the ingestion core: typed row model, table
//! descriptors, the two fetch strategies, per-record side lookups, and the
//! driver that streams `(table, record)` pairs toward the publisher.

pub mod additionals;
mod driver;
mod fetch;
mod record;
mod tables;
mod upstream;

pub use driver::{Driver, RunStats};
pub use fetch::{ChecksumFetcher, TimestampFetcher, CHECKSUM_PAGE_SIZE, TIMESTAMP_PAGE_SIZE};
pub use record::{Cell, Record};
pub use tables::{
    vetsuccess_tables, AdditionalKind, QueryTemplate, TableConfig, TableConfigError,
};
pub use upstream::{FetchError, PgUpstream, Upstream};
