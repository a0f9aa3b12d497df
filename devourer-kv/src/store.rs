use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use tokio::time::Instant;

use crate::KvError;

/// The slice of a key-value service the ingestion core relies on. `RedisKv`
/// is the production backend; `MemoryKv` backs tests and local runs.
#[async_trait]
pub trait Kv: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), KvError>;

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError>;

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, KvError>;

    async fn hset_multi(&self, key: &str, entries: &[(String, String)]) -> Result<(), KvError>;

    async fn del(&self, key: &str) -> Result<(), KvError>;

    /// Glob-style key listing (`*` wildcard only).
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, KvError>;

    /// SET-if-absent with expiry. Returns false when another holder owns the
    /// key. `token` identifies the holder for `lock_release`.
    async fn lock_acquire(&self, key: &str, token: &str, ttl: Duration)
        -> Result<bool, KvError>;

    /// Deletes the lock key if `token` still owns it. Releasing a lock that
    /// expired or changed hands is a no-op.
    async fn lock_release(&self, key: &str, token: &str) -> Result<(), KvError>;
}

pub struct RedisKv {
    conn: redis::aio::ConnectionManager,
}

impl RedisKv {
    pub async fn connect(url: &str) -> Result<Self, KvError> {
        let client = redis::Client::open(url)?;
        let conn = redis::aio::ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl Kv for RedisKv {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), KvError> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(key, value).await?;
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError> {
        let mut conn = self.conn.clone();
        let _: () = conn.set_ex(key, value, ttl.as_secs()).await?;
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, KvError> {
        let mut conn = self.conn.clone();
        Ok(conn.hgetall(key).await?)
    }

    async fn hset_multi(&self, key: &str, entries: &[(String, String)]) -> Result<(), KvError> {
        let mut conn = self.conn.clone();
        let _: () = conn.hset_multiple(key, entries).await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), KvError> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, KvError> {
        let mut conn = self.conn.clone();
        Ok(conn.keys(pattern).await?)
    }

    async fn lock_acquire(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, KvError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn lock_release(&self, key: &str, token: &str) -> Result<(), KvError> {
        let mut conn = self.conn.clone();
        let holder: Option<String> = conn.get(key).await?;
        if holder.as_deref() == Some(token) {
            let _: () = conn.del(key).await?;
        }
        Ok(())
    }
}

#[derive(Clone)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
}

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

/// In-process backend with the same observable behavior as `RedisKv`.
#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn live_value(entries: &mut HashMap<String, Entry>, key: &str) -> Option<Value> {
        let expired = entries
            .get(key)
            .is_some_and(|e| e.expires_at.is_some_and(|at| at <= Instant::now()));
        if expired {
            entries.remove(key);
        }
        entries.get(key).map(|e| e.value.clone())
    }
}

#[async_trait]
impl Kv for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut entries = self.entries.lock().expect("kv mutex poisoned");
        Ok(match Self::live_value(&mut entries, key) {
            Some(Value::Str(s)) => Some(s),
            _ => None,
        })
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), KvError> {
        let mut entries = self.entries.lock().expect("kv mutex poisoned");
        entries.insert(
            key.to_owned(),
            Entry {
                value: Value::Str(value.to_owned()),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError> {
        let mut entries = self.entries.lock().expect("kv mutex poisoned");
        entries.insert(
            key.to_owned(),
            Entry {
                value: Value::Str(value.to_owned()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, KvError> {
        let mut entries = self.entries.lock().expect("kv mutex poisoned");
        Ok(match Self::live_value(&mut entries, key) {
            Some(Value::Hash(h)) => h,
            _ => HashMap::new(),
        })
    }

    async fn hset_multi(&self, key: &str, new: &[(String, String)]) -> Result<(), KvError> {
        let mut entries = self.entries.lock().expect("kv mutex poisoned");
        let mut hash = match Self::live_value(&mut entries, key) {
            Some(Value::Hash(h)) => h,
            _ => HashMap::new(),
        };
        hash.extend(new.iter().cloned());
        entries.insert(
            key.to_owned(),
            Entry {
                value: Value::Hash(hash),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), KvError> {
        let mut entries = self.entries.lock().expect("kv mutex poisoned");
        entries.remove(key);
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, KvError> {
        let mut entries = self.entries.lock().expect("kv mutex poisoned");
        let now = Instant::now();
        entries.retain(|_, e| !e.expires_at.is_some_and(|at| at <= now));
        let mut keys: Vec<String> = entries
            .keys()
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn lock_acquire(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, KvError> {
        let mut entries = self.entries.lock().expect("kv mutex poisoned");
        if Self::live_value(&mut entries, key).is_some() {
            return Ok(false);
        }
        entries.insert(
            key.to_owned(),
            Entry {
                value: Value::Str(token.to_owned()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn lock_release(&self, key: &str, token: &str) -> Result<(), KvError> {
        let mut entries = self.entries.lock().expect("kv mutex poisoned");
        let held = matches!(
            Self::live_value(&mut entries, key),
            Some(Value::Str(holder)) if holder == token
        );
        if held {
            entries.remove(key);
        }
        Ok(())
    }
}

fn glob_match(pattern: &str, key: &str) -> bool {
    let mut rest = key;
    let mut parts = pattern.split('*').peekable();
    let mut first = true;
    while let Some(part) = parts.next() {
        let last = parts.peek().is_none();
        if first && last {
            return pattern == key;
        }
        if first {
            let Some(stripped) = rest.strip_prefix(part) else {
                return false;
            };
            rest = stripped;
        } else if last {
            return part.is_empty() || rest.ends_with(part);
        } else if !part.is_empty() {
            let Some(at) = rest.find(part) else {
                return false;
            };
            rest = &rest[at + part.len()..];
        }
        first = false;
    }
    true
}
