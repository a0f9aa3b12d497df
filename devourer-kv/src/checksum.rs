use std::collections::HashMap;

use log::{info, warn};

use crate::{Kv, KvError};

/// Staged writes are pushed to the backend once the buffer grows past this.
const FLUSH_THRESHOLD: usize = 1000;

// The misspelled segment is historical wire format shared with consumers of
// the KV namespace; do not correct it.
const KEY_PREFIX: &str = "devourer.datasource.versuccess.checksums-";

pub fn storage_key(table: &str) -> String {
    format!("{KEY_PREFIX}{table}")
}

/// Buffered `primary key -> content digest` map over one KV hash per table.
///
/// Reads lazily load the whole hash in a single round-trip. Writes stage in
/// memory and reach the backend on threshold overflow and on `close`; a
/// scope abandoned without `close` loses its staged writes, which downstream
/// tolerates because an unflushed digest re-detects as changed next run.
pub struct ChecksumStore<'a> {
    table: String,
    kv: &'a dyn Kv,
    loaded: Option<HashMap<String, String>>,
    staged: HashMap<String, String>,
    closed: bool,
}

impl<'a> ChecksumStore<'a> {
    pub fn open(table: &str, kv: &'a dyn Kv) -> ChecksumStore<'a> {
        ChecksumStore {
            table: table.to_owned(),
            kv,
            loaded: None,
            staged: HashMap::new(),
            closed: false,
        }
    }

    pub fn storage_key(&self) -> String {
        storage_key(&self.table)
    }

    pub async fn get(&mut self, pk: &str) -> Result<Option<String>, KvError> {
        if let Some(digest) = self.staged.get(pk) {
            return Ok(Some(digest.clone()));
        }
        if self.loaded.is_none() {
            self.loaded = Some(self.kv.hgetall(&self.storage_key()).await?);
        }
        Ok(self
            .loaded
            .as_ref()
            .and_then(|checksums| checksums.get(pk))
            .cloned())
    }

    pub fn put(&mut self, pk: &str, digest: &str) {
        self.staged.insert(pk.to_owned(), digest.to_owned());
    }

    pub async fn put_and_maybe_flush(&mut self, pk: &str, digest: &str) -> Result<(), KvError> {
        self.put(pk, digest);
        if self.staged.len() > FLUSH_THRESHOLD {
            self.flush().await?;
        }
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<(), KvError> {
        if self.staged.is_empty() {
            return Ok(());
        }
        let entries: Vec<(String, String)> = self.staged.drain().collect();
        self.kv.hset_multi(&self.storage_key(), &entries).await?;
        // Keep later reads coherent with what was just written.
        if let Some(loaded) = self.loaded.as_mut() {
            loaded.extend(entries);
        }
        Ok(())
    }

    pub async fn close(&mut self) -> Result<(), KvError> {
        self.flush().await?;
        self.closed = true;
        Ok(())
    }
}

impl Drop for ChecksumStore<'_> {
    fn drop(&mut self) {
        if !self.closed && !self.staged.is_empty() {
            warn!(
                "checksum store for `{}` dropped with {} unflushed digests, they will re-emit next run",
                self.table,
                self.staged.len()
            );
        }
    }
}

/// Merges the legacy blocked layout (`…checksums-<table>-<n>`, one hash per
/// 1000 pks) into the single hash per table, deleting the blocks. Returns
/// the number of migrated fields.
pub async fn migrate_blocked(kv: &dyn Kv, table: &str) -> Result<usize, KvError> {
    let target = storage_key(table);
    let mut migrated = 0;
    for block_key in kv.keys(&format!("{target}-*")).await? {
        let block = kv.hgetall(&block_key).await?;
        if !block.is_empty() {
            let entries: Vec<(String, String)> = block.into_iter().collect();
            migrated += entries.len();
            kv.hset_multi(&target, &entries).await?;
        }
        kv.del(&block_key).await?;
    }
    info!("merged {migrated} checksums into `{target}`");
    Ok(migrated)
}
