use std::sync::Arc;
use std::time::Duration;

use devourer_kv::{ChecksumStore, Kv, WatermarkStore};
use tokio::sync::mpsc;

use crate::record::Record;
use crate::tables::TableConfig;
use crate::upstream::{FetchError, Upstream};

/// Timestamp pulls only see rows past the watermark, so pages can be huge.
pub const TIMESTAMP_PAGE_SIZE: i64 = 500_000;

/// Checksum pulls walk the whole table.
pub const CHECKSUM_PAGE_SIZE: i64 = 10_000;

/// Per-statement deadline for bulk pages.
const STATEMENT_DEADLINE: Duration = Duration::from_secs(900);

fn missing_column(table: &TableConfig, column: &str) -> FetchError {
    FetchError::MissingColumn {
        table: table.name.clone(),
        column: column.to_owned(),
    }
}

/// Pulls rows with `ts_col >= watermark` and advances the watermark as rows
/// are emitted. A row is only reflected in the cursor after it was handed to
/// the consumer, so an aborted stream never claims unseen rows.
pub struct TimestampFetcher {
    table: TableConfig,
    db: Arc<dyn Upstream>,
    kv: Arc<dyn Kv>,
}

impl TimestampFetcher {
    pub fn new(table: TableConfig, db: Arc<dyn Upstream>, kv: Arc<dyn Kv>) -> TimestampFetcher {
        TimestampFetcher { table, db, kv }
    }

    pub async fn run(self, tx: mpsc::Sender<Record>) -> Result<u64, FetchError> {
        let mut stor = WatermarkStore::open(&self.table.name, self.kv.as_ref());
        let outcome = Self::paginate(&self.table, self.db.as_ref(), &mut stor, &tx).await;
        let closed = stor.close().await;
        let emitted = outcome?;
        closed?;
        Ok(emitted)
    }

    async fn paginate(
        table: &TableConfig,
        db: &dyn Upstream,
        stor: &mut WatermarkStore<'_>,
        tx: &mpsc::Sender<Record>,
    ) -> Result<u64, FetchError> {
        let ts_col = table
            .timestamp_column
            .as_deref()
            .ok_or_else(|| missing_column(table, "timestamp_column"))?;

        let watermark = stor.latest().await?;
        let sql = table.sql(Some(watermark));

        let mut offset = 0;
        let mut emitted = 0u64;
        loop {
            let page = db
                .query_page(&sql, TIMESTAMP_PAGE_SIZE, offset, STATEMENT_DEADLINE)
                .await?;
            let page_len = page.len() as i64;

            for record in page {
                let row_time = record
                    .get(ts_col)
                    .ok_or_else(|| missing_column(table, ts_col))?
                    .as_datetime()
                    .ok_or_else(|| FetchError::NotATimestamp {
                        column: ts_col.to_owned(),
                    })?;
                tx.send(record).await.map_err(|_| FetchError::ChannelClosed)?;
                stor.advance(row_time).await?;
                emitted += 1;
            }

            if page_len < TIMESTAMP_PAGE_SIZE {
                break;
            }
            offset += TIMESTAMP_PAGE_SIZE;
        }
        Ok(emitted)
    }
}

/// Walks the full table in stable order and emits only rows whose digest
/// differs from the stored one, staging the new digest as it goes.
pub struct ChecksumFetcher {
    table: TableConfig,
    db: Arc<dyn Upstream>,
    kv: Arc<dyn Kv>,
}

impl ChecksumFetcher {
    pub fn new(table: TableConfig, db: Arc<dyn Upstream>, kv: Arc<dyn Kv>) -> ChecksumFetcher {
        ChecksumFetcher { table, db, kv }
    }

    pub async fn run(self, tx: mpsc::Sender<Record>) -> Result<u64, FetchError> {
        let mut stor = ChecksumStore::open(&self.table.name, self.kv.as_ref());
        let outcome = Self::paginate(&self.table, self.db.as_ref(), &mut stor, &tx).await;
        let closed = stor.close().await;
        let emitted = outcome?;
        closed?;
        Ok(emitted)
    }

    async fn paginate(
        table: &TableConfig,
        db: &dyn Upstream,
        stor: &mut ChecksumStore<'_>,
        tx: &mpsc::Sender<Record>,
    ) -> Result<u64, FetchError> {
        let cs_col = table
            .checksum_column
            .as_deref()
            .ok_or_else(|| missing_column(table, "checksum_column"))?;

        let sql = table.sql(None);
        let mut offset = 0;
        let mut emitted = 0u64;
        loop {
            let page = db
                .query_page(&sql, CHECKSUM_PAGE_SIZE, offset, STATEMENT_DEADLINE)
                .await?;
            let page_len = page.len() as i64;

            for record in page {
                let pk = record
                    .normalized_pk(cs_col)
                    .ok_or_else(|| missing_column(table, cs_col))?;
                let digest = record.digest();
                if stor.get(&pk).await?.as_deref() != Some(digest.as_str()) {
                    stor.put_and_maybe_flush(&pk, &digest).await?;
                    tx.send(record).await.map_err(|_| FetchError::ChannelClosed)?;
                    emitted += 1;
                }
            }

            if page_len < CHECKSUM_PAGE_SIZE {
                break;
            }
            offset += CHECKSUM_PAGE_SIZE;
        }
        Ok(emitted)
    }
}
