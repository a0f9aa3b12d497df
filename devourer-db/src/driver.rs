use std::sync::Arc;
use std::time::Instant;

use devourer_kv::Kv;
use log::info;
use tokio::sync::mpsc;

use crate::additionals;
use crate::fetch::{ChecksumFetcher, TimestampFetcher};
use crate::record::Record;
use crate::tables::{vetsuccess_tables, TableConfig};
use crate::upstream::{FetchError, Upstream};

const FETCH_BUFFER: usize = 1024;
const PROGRESS_EVERY: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunStats {
    pub tables: usize,
    pub records: u64,
}

/// Streams new and changed records for every configured table, one table at
/// a time in configuration order. The strategy per table follows its
/// descriptor; side data is attached before a record leaves the driver.
pub struct Driver {
    db: Arc<dyn Upstream>,
    kv: Arc<dyn Kv>,
    tables: Vec<TableConfig>,
}

impl Driver {
    pub fn new(db: Arc<dyn Upstream>, kv: Arc<dyn Kv>, tables: Vec<TableConfig>) -> Driver {
        Driver { db, kv, tables }
    }

    pub fn with_default_tables(db: Arc<dyn Upstream>, kv: Arc<dyn Kv>) -> Driver {
        Driver::new(db, kv, vetsuccess_tables())
    }

    pub async fn stream_updates(
        &self,
        tx: mpsc::Sender<(String, Record)>,
    ) -> Result<RunStats, FetchError> {
        let start = Instant::now();
        let mut total = 0u64;

        for table in &self.tables {
            let table_start = Instant::now();
            let (fetch_tx, mut fetch_rx) = mpsc::channel(FETCH_BUFFER);

            let fetch = {
                let table = table.clone();
                let db = self.db.clone();
                let kv = self.kv.clone();
                tokio::spawn(async move {
                    if table.timestamp_column.is_some() {
                        TimestampFetcher::new(table, db, kv).run(fetch_tx).await
                    } else {
                        ChecksumFetcher::new(table, db, kv).run(fetch_tx).await
                    }
                })
            };

            let mut new_records = 0u64;
            while let Some(mut record) = fetch_rx.recv().await {
                if let Some(kind) = table.additionals {
                    record.set_additionals(
                        additionals::fetch(kind, self.db.as_ref(), &record).await?,
                    );
                }
                new_records += 1;
                tx.send((table.name.clone(), record))
                    .await
                    .map_err(|_| FetchError::ChannelClosed)?;
                if new_records % PROGRESS_EVERY == 0 {
                    info!("import progress: {new_records} of {}", table.name);
                }
            }

            fetch.await.map_err(FetchError::Join)??;
            total += new_records;
            info!(
                "import {} for {:.3} sec, {new_records} new records",
                table.name,
                table_start.elapsed().as_secs_f64(),
            );
        }

        info!(
            "import VetSuccess for {:.3} sec, {total} new records",
            start.elapsed().as_secs_f64(),
        );
        Ok(RunStats {
            tables: self.tables.len(),
            records: total,
        })
    }
}

#[cfg(test)]
mod tests {
    use devourer_kv::MemoryKv;

    use super::*;
    use crate::fetch::tests::{ts, FakeUpstream};
    use crate::record::Cell;
    use crate::tables::{AdditionalKind, TableConfig};

    fn keyed_row(id: i64, name: &str) -> Record {
        Record::new(vec![
            ("id".into(), Cell::Int(id)),
            ("name".into(), Cell::Text(name.into())),
        ])
    }

    async fn run(driver: &Driver) -> (RunStats, Vec<(String, Record)>) {
        let (tx, mut rx) = mpsc::channel(64);
        let stats = driver.stream_updates(tx).await.unwrap();
        let mut emitted = Vec::new();
        while let Ok(pair) = rx.try_recv() {
            emitted.push(pair);
        }
        (stats, emitted)
    }

    #[tokio::test]
    async fn back_to_back_runs_are_idempotent_without_upstream_change() {
        let db = FakeUpstream::new(vec![keyed_row(1, "A"), keyed_row(2, "B")]);
        let kv = Arc::new(MemoryKv::new());
        let driver = Driver::new(
            db,
            kv,
            vec![TableConfig::checksummed("clients", "id")],
        );

        let (stats, emitted) = run(&driver).await;
        assert_eq!(stats.records, 2);
        assert_eq!(emitted.len(), 2);
        assert_eq!(emitted[0].0, "clients");

        let (stats, emitted) = run(&driver).await;
        assert_eq!(stats.records, 0);
        assert!(emitted.is_empty());
    }

    #[tokio::test]
    async fn strategy_follows_the_descriptor() {
        let db = FakeUpstream::new(vec![Record::new(vec![
            ("id".into(), Cell::Int(1)),
            ("u".into(), Cell::Timestamp(ts("2024-06-01T00:00:01"))),
        ])]);
        let kv = Arc::new(MemoryKv::new());
        let driver = Driver::new(db.clone(), kv, vec![TableConfig::timestamped("t", "u")]);

        let (stats, _) = run(&driver).await;
        assert_eq!(stats.records, 1);
        assert!(db.executed()[0].contains(">= '0001-01-01T00:00:00'::timestamp"));
    }

    #[tokio::test]
    async fn side_data_rides_along_under_additionals() {
        // The codes record carries no foreign keys, so the side fetcher
        // attaches an empty document without extra queries.
        let db = FakeUpstream::new(vec![Record::new(vec![
            ("vetsuccess_id".into(), Cell::Int(5)),
            ("pms_code_vetsuccess_id".into(), Cell::Null),
            ("revenue_category_id".into(), Cell::Null),
        ])]);
        let kv = Arc::new(MemoryKv::new());
        let driver = Driver::new(
            db,
            kv,
            vec![TableConfig::checksummed("codes", "vetsuccess_id")
                .additionals(AdditionalKind::Codes)],
        );

        let (_, emitted) = run(&driver).await;
        let (_, record) = &emitted[0];
        assert_eq!(record.to_json()["_additionals"], serde_json::json!({}));
    }

    #[tokio::test]
    async fn tables_are_processed_in_configuration_order() {
        let db = FakeUpstream::new(vec![keyed_row(1, "A")]);
        let kv = Arc::new(MemoryKv::new());
        let driver = Driver::new(
            db,
            kv,
            vec![
                TableConfig::checksummed("first", "id"),
                TableConfig::checksummed("second", "id"),
            ],
        );

        let (stats, emitted) = run(&driver).await;
        assert_eq!(stats.tables, 2);
        let names: Vec<&str> = emitted.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["first", "second"]);
    }
}
