use std::time::Duration;

use log::warn;
use tokio::time::Instant;

use crate::{Kv, KvError};

const LOCK_TTL: Duration = Duration::from_secs(60);
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(60);
const RETRY_DELAY: Duration = Duration::from_millis(100);

/// Advisory named lock over the KV backend.
///
/// Blocks until the key is free, holds it for at most `LOCK_TTL`, and
/// releases on `release`. Releasing a lock that already expired is silently
/// ignored.
pub struct KvLock<'a> {
    kv: &'a dyn Kv,
    key: String,
    token: String,
    released: bool,
}

impl<'a> KvLock<'a> {
    pub async fn acquire(kv: &'a dyn Kv, key: &str) -> Result<KvLock<'a>, KvError> {
        let token = uuid::Uuid::new_v4().simple().to_string();
        let deadline = Instant::now() + ACQUIRE_TIMEOUT;
        loop {
            if kv.lock_acquire(key, &token, LOCK_TTL).await? {
                return Ok(KvLock {
                    kv,
                    key: key.to_owned(),
                    token,
                    released: false,
                });
            }
            if Instant::now() >= deadline {
                return Err(KvError::LockTimeout {
                    key: key.to_owned(),
                    timeout_secs: ACQUIRE_TIMEOUT.as_secs(),
                });
            }
            tokio::time::sleep(RETRY_DELAY).await;
        }
    }

    pub async fn release(mut self) -> Result<(), KvError> {
        self.released = true;
        self.kv.lock_release(&self.key, &self.token).await
    }
}

impl Drop for KvLock<'_> {
    fn drop(&mut self) {
        if !self.released {
            warn!(
                "lock `{}` dropped without release, waiting out its ttl",
                self.key
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::MemoryKv;

    #[tokio::test]
    async fn second_acquire_waits_for_release() {
        let kv = Arc::new(MemoryKv::new());
        let first = KvLock::acquire(kv.as_ref(), "lk").await.unwrap();

        let contender = tokio::spawn({
            let kv = kv.clone();
            async move {
                let lock = KvLock::acquire(kv.as_ref(), "lk").await.unwrap();
                lock.release().await.unwrap();
            }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished());

        first.release().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), contender)
            .await
            .expect("contender should acquire after release")
            .unwrap();
    }
}
