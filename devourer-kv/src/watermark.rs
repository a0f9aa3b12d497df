use chrono::{DateTime, NaiveDate, NaiveDateTime};
use log::warn;

use crate::{Kv, KvError};

/// Opportunistic flush cadence, counted in `advance` calls.
const SAVE_THRESHOLD: u32 = 1000;

const KEY_PREFIX: &str = "devourer.datasource.versuccess.timestamp-";

/// "Never ingested" marker handed to the first run of a table.
pub fn sentinel() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(1, 1, 1)
        .expect("year one is a valid date")
        .and_hms_opt(0, 0, 0)
        .expect("midnight is a valid time")
}

/// Monotonic per-table timestamp cursor stored as integer Unix seconds.
///
/// The cursor only ever advances, is flushed every `SAVE_THRESHOLD`
/// advances and on `close`, and is left untouched by a run that never
/// advanced it.
pub struct WatermarkStore<'a> {
    table: String,
    kv: &'a dyn Kv,
    cursor: Option<i64>,
    debounce: u32,
    closed: bool,
}

impl<'a> WatermarkStore<'a> {
    pub fn open(table: &str, kv: &'a dyn Kv) -> WatermarkStore<'a> {
        WatermarkStore {
            table: table.to_owned(),
            kv,
            cursor: None,
            debounce: 0,
            closed: false,
        }
    }

    pub fn storage_key(&self) -> String {
        format!("{KEY_PREFIX}{}", self.table)
    }

    pub async fn latest(&self) -> Result<NaiveDateTime, KvError> {
        let key = self.storage_key();
        let stored = match self.kv.get(&key).await? {
            None => None,
            Some(raw) => Some(raw.parse::<i64>().map_err(|_| KvError::MalformedInteger {
                key,
                value: raw,
            })?),
        };
        let seconds = match (stored, self.cursor) {
            (Some(s), Some(c)) => s.max(c),
            (Some(s), None) => s,
            (None, Some(c)) => c,
            (None, None) => return Ok(sentinel()),
        };
        Ok(DateTime::from_timestamp(seconds, 0)
            .map(|dt| dt.naive_utc())
            .unwrap_or_else(sentinel))
    }

    /// Moves the cursor to `max(current, row_time)`, truncated to whole
    /// seconds.
    pub async fn advance(&mut self, row_time: NaiveDateTime) -> Result<(), KvError> {
        let seconds = row_time.and_utc().timestamp();
        self.cursor = Some(match self.cursor {
            Some(current) => current.max(seconds),
            None => seconds,
        });

        self.debounce += 1;
        if self.debounce > SAVE_THRESHOLD {
            self.save().await?;
            self.debounce = 0;
        }
        Ok(())
    }

    pub async fn close(&mut self) -> Result<(), KvError> {
        if self.cursor.is_some() {
            self.save().await?;
        }
        self.closed = true;
        Ok(())
    }

    async fn save(&self) -> Result<(), KvError> {
        if let Some(seconds) = self.cursor {
            self.kv
                .set(&self.storage_key(), &seconds.to_string())
                .await?;
        }
        Ok(())
    }
}

impl Drop for WatermarkStore<'_> {
    fn drop(&mut self) {
        if !self.closed && self.cursor.is_some() {
            warn!(
                "watermark store for `{}` dropped before close, cursor may lag",
                self.table
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryKv;

    fn ts(s: &str) -> NaiveDateTime {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn absent_key_yields_sentinel() {
        let kv = MemoryKv::new();
        let stor = WatermarkStore::open("test", &kv);
        assert_eq!(stor.latest().await.unwrap(), ts("0001-01-01T00:00:00"));
    }

    #[tokio::test]
    async fn close_persists_only_after_advance() {
        let kv = MemoryKv::new();
        {
            let mut stor = WatermarkStore::open("empty", &kv);
            stor.close().await.unwrap();
        }
        assert_eq!(
            kv.get("devourer.datasource.versuccess.timestamp-empty")
                .await
                .unwrap(),
            None
        );

        {
            let mut stor = WatermarkStore::open("rows", &kv);
            stor.advance(ts("2024-06-01T00:00:01")).await.unwrap();
            stor.close().await.unwrap();
        }
        assert_eq!(
            kv.get("devourer.datasource.versuccess.timestamp-rows")
                .await
                .unwrap()
                .as_deref(),
            Some("1717200001")
        );
    }

    #[tokio::test]
    async fn cursor_never_regresses() {
        let kv = MemoryKv::new();
        let mut stor = WatermarkStore::open("test", &kv);
        stor.advance(ts("2024-06-01T00:00:10")).await.unwrap();
        stor.advance(ts("2024-05-01T00:00:00")).await.unwrap();
        assert_eq!(stor.latest().await.unwrap(), ts("2024-06-01T00:00:10"));
        stor.close().await.unwrap();
    }

    #[tokio::test]
    async fn advance_floors_subsecond_times() {
        let kv = MemoryKv::new();
        let mut stor = WatermarkStore::open("test", &kv);
        stor.advance(ts("2024-06-01T00:00:01.999")).await.unwrap();
        stor.close().await.unwrap();
        assert_eq!(
            kv.get("devourer.datasource.versuccess.timestamp-test")
                .await
                .unwrap()
                .as_deref(),
            Some("1717200001")
        );
    }

    #[tokio::test]
    async fn stored_value_survives_reopen() {
        let kv = MemoryKv::new();
        {
            let mut stor = WatermarkStore::open("test", &kv);
            stor.advance(ts("2024-06-01T12:00:00")).await.unwrap();
            stor.close().await.unwrap();
        }
        let reopened = WatermarkStore::open("test", &kv);
        assert_eq!(
            reopened.latest().await.unwrap(),
            ts("2024-06-01T12:00:00")
        );
    }
}
