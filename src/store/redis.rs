use std::fmt;
use std::time::SystemTime;

use anyhow::{Context, Result};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tracing::warn;

use super::{CacheEntry, PersistedEntry, StoredRecord};

const META_FIELD: &str = "meta";
const BODY_FIELD: &str = "body";
const KEY_PATTERN: &str = "*:*";

/// Redis-backed store: one hash per entry under `"<shard>:<digest>"`, with
/// the metadata JSON and the raw body as separate fields. Expiry is pushed
/// down via `EXPIRE` when known, but the evictor stays authoritative.
pub struct RedisStore {
    manager: ConnectionManager,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

fn entry_key(shard: u8, digest: &str) -> String {
    format!("{shard}:{digest}")
}

fn split_key(key: &str) -> Option<(u8, String)> {
    let (shard, digest) = key.split_once(':')?;
    let shard = shard.parse::<u8>().ok()?;
    Some((shard, digest.to_string()))
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .with_context(|| format!("invalid redis url '{url}'"))?;
        let manager = ConnectionManager::new(client)
            .await
            .with_context(|| format!("failed to connect to redis at '{url}'"))?;
        Ok(Self { manager })
    }

    pub async fn init(&self) -> Result<()> {
        let mut con = self.manager.clone();
        let pong: String = redis::cmd("PING")
            .query_async(&mut con)
            .await
            .context("redis ping failed")?;
        anyhow::ensure!(pong == "PONG", "unexpected redis ping reply '{pong}'");
        Ok(())
    }

    pub async fn clear(&self) -> Result<()> {
        let keys = self.scan_keys().await?;
        if keys.is_empty() {
            return Ok(());
        }
        let mut con = self.manager.clone();
        let _: () = con.del(keys).await.context("failed to clear redis cache")?;
        Ok(())
    }

    pub async fn get(&self, shard: u8, digest: &str) -> Result<Option<CacheEntry>> {
        let key = entry_key(shard, digest);
        let mut con = self.manager.clone();
        let (meta, body): (Option<Vec<u8>>, Option<Vec<u8>>) = redis::cmd("HMGET")
            .arg(&key)
            .arg(META_FIELD)
            .arg(BODY_FIELD)
            .query_async(&mut con)
            .await
            .with_context(|| format!("failed to read cache entry {key}"))?;

        let (Some(meta), Some(body)) = (meta, body) else {
            return Ok(None);
        };
        let persisted: PersistedEntry = serde_json::from_slice(&meta)
            .with_context(|| format!("corrupt cache metadata under {key}"))?;
        Ok(Some(CacheEntry {
            meta: persisted.into_meta(),
            body,
        }))
    }

    pub async fn set(&self, shard: u8, digest: &str, entry: CacheEntry) -> Result<()> {
        let key = entry_key(shard, digest);
        let persisted = PersistedEntry::from_meta(shard, &entry.meta);
        let meta = serde_json::to_vec(&persisted)?;

        let mut pipe = redis::pipe();
        pipe.hset(&key, META_FIELD, meta)
            .hset(&key, BODY_FIELD, entry.body);
        if let Some(expires_at) = entry.meta.expires_at {
            let ttl = expires_at
                .duration_since(SystemTime::now())
                .map(|remaining| remaining.as_secs().max(1))
                .unwrap_or(1);
            pipe.expire(&key, ttl as i64);
        }

        let mut con = self.manager.clone();
        let _: () = pipe
            .query_async(&mut con)
            .await
            .with_context(|| format!("failed to write cache entry {key}"))?;
        Ok(())
    }

    pub async fn del(&self, shard: u8, digest: &str) -> Result<()> {
        let key = entry_key(shard, digest);
        let mut con = self.manager.clone();
        let _: () = con
            .del(&key)
            .await
            .with_context(|| format!("failed to delete cache entry {key}"))?;
        Ok(())
    }

    pub async fn get_all(&self) -> Result<Vec<StoredRecord>> {
        let keys = self.scan_keys().await?;
        let mut records = Vec::with_capacity(keys.len());
        let mut con = self.manager.clone();
        for key in keys {
            let Some((shard, digest)) = split_key(&key) else {
                continue;
            };
            let meta: Option<Vec<u8>> = con
                .hget(&key, META_FIELD)
                .await
                .with_context(|| format!("failed to read cache metadata {key}"))?;
            let Some(meta) = meta else {
                continue;
            };
            match serde_json::from_slice::<PersistedEntry>(&meta) {
                Ok(persisted) => records.push(StoredRecord {
                    shard,
                    digest,
                    meta: persisted.into_meta(),
                }),
                Err(err) => {
                    warn!(key, error = %err, "skipping corrupt cache metadata");
                }
            }
        }
        Ok(records)
    }

    pub fn close(&self) {}

    async fn scan_keys(&self) -> Result<Vec<String>> {
        let mut con = self.manager.clone();
        let mut keys = Vec::new();
        let mut iter = con
            .scan_match::<_, String>(KEY_PATTERN)
            .await
            .context("failed to scan redis cache keys")?;
        while let Some(key) = iter.next_item().await {
            if split_key(&key).is_some() {
                keys.push(key);
            }
        }
        Ok(keys)
    }
}
