use std::time::Duration;

use crate::{Kv, KvError, KvLock};

/// Poisoned marker: the chain owning this group aborted.
pub const STOPPED: i64 = -1;

/// Wait-group keys are per-run; anything this old is an orphan from a
/// crashed worker and may be garbage-collected by the backend.
const KEY_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Distributed counter coordinating sequential object imports.
///
/// Positive: outstanding workers. Zero (or absent): complete. `STOPPED`:
/// aborted, sticky until the key expires. Writes go through the named lock
/// `waitgroup_lock_<key>`; reads are lock-free.
pub struct WaitGroup<'a> {
    key: String,
    lock_key: String,
    kv: &'a dyn Kv,
}

impl<'a> WaitGroup<'a> {
    pub fn new(key: &str, kv: &'a dyn Kv) -> WaitGroup<'a> {
        WaitGroup {
            key: key.to_owned(),
            lock_key: format!("waitgroup_lock_{key}"),
            kv,
        }
    }

    pub async fn count(&self) -> Result<i64, KvError> {
        match self.kv.get(&self.key).await? {
            None => Ok(0),
            Some(raw) => raw.parse().map_err(|_| KvError::MalformedInteger {
                key: self.key.clone(),
                value: raw,
            }),
        }
    }

    pub async fn add(&self, n: i64) -> Result<(), KvError> {
        self.locked_update(|count| count.max(0) + n).await
    }

    pub async fn done(&self) -> Result<(), KvError> {
        self.locked_update(|count| count - 1).await
    }

    /// Poisons the group. Terminal for every successor gated on this key.
    pub async fn stop(&self) -> Result<(), KvError> {
        self.locked_update(|_| STOPPED).await
    }

    async fn locked_update(&self, update: impl FnOnce(i64) -> i64) -> Result<(), KvError> {
        let lock = KvLock::acquire(self.kv, &self.lock_key).await?;
        let result = async {
            let count = self.count().await?;
            self.kv
                .set_ex(&self.key, &update(count).to_string(), KEY_TTL)
                .await
        }
        .await;
        let released = lock.release().await;
        result?;
        released
    }
}
