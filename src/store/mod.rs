use std::time::{Duration, SystemTime};

use anyhow::Result;
use http::HeaderMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::settings::{Settings, StoreType};

pub mod file;
pub mod redis;

pub use self::file::FileStore;
pub use self::redis::RedisStore;

/// Everything known about a cached response except its body bytes. The body
/// lives wherever the back-end keeps it (a file, a redis hash field).
#[derive(Debug, Clone)]
pub struct EntryMeta {
    /// Upstream response headers, verbatim, except `Content-Encoding: gzip`
    /// is stripped when the body was decompressed at capture.
    pub headers: HeaderMap,
    pub url: String,
    pub host: String,
    pub cached_at: SystemTime,
    /// `None` when the origin sent no `max-age`; such entries count as
    /// already expired and go on the evictor's next sweep.
    pub expires_at: Option<SystemTime>,
}

impl EntryMeta {
    pub fn is_expired(&self, now: SystemTime) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at < now,
            None => true,
        }
    }

    /// Whole seconds since this entry was captured.
    pub fn age(&self, now: SystemTime) -> u64 {
        now.duration_since(self.cached_at)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub meta: EntryMeta,
    /// Canonical decompressed bytes; gzip is handled at the boundaries.
    pub body: Vec<u8>,
}

/// One element of a `get_all` snapshot.
#[derive(Debug, Clone)]
pub struct StoredRecord {
    pub shard: u8,
    pub digest: String,
    pub meta: EntryMeta,
}

/// On-disk / on-wire form of the metadata sidecar.
#[derive(Debug, Serialize, Deserialize)]
pub struct PersistedEntry {
    pub shard: u8,
    pub headers: Vec<(String, String)>,
    pub url: String,
    pub host: String,
    pub cached_at: u64,
    pub expires_at: Option<u64>,
}

impl PersistedEntry {
    pub fn from_meta(shard: u8, meta: &EntryMeta) -> Self {
        Self {
            shard,
            headers: headermap_to_vec(&meta.headers),
            url: meta.url.clone(),
            host: meta.host.clone(),
            cached_at: epoch_secs(meta.cached_at),
            expires_at: meta.expires_at.map(epoch_secs),
        }
    }

    pub fn into_meta(self) -> EntryMeta {
        EntryMeta {
            headers: to_headermap(&self.headers),
            url: self.url,
            host: self.host,
            cached_at: from_epoch_secs(self.cached_at),
            expires_at: self.expires_at.map(from_epoch_secs),
        }
    }
}

pub fn to_headermap(items: &[(String, String)]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in items {
        if let (Ok(name), Ok(value)) = (
            http::header::HeaderName::try_from(name.as_str()),
            http::HeaderValue::from_str(value),
        ) {
            map.append(name, value);
        }
    }
    map
}

pub fn headermap_to_vec(map: &HeaderMap) -> Vec<(String, String)> {
    let mut items = Vec::new();
    for (name, value) in map.iter() {
        if let Ok(value_str) = value.to_str() {
            items.push((name.as_str().to_string(), value_str.to_string()));
        }
    }
    items
}

fn epoch_secs(time: SystemTime) -> u64 {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

fn from_epoch_secs(secs: u64) -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
}

/// Derives the expiry timestamp from a `Cache-Control` value. Only `max-age`
/// matters here; anything else (or an unparsable count) yields `None`.
pub fn expiry_from_cache_control(cache_control: &str, now: SystemTime) -> Option<SystemTime> {
    for part in cache_control.split(',') {
        if let Some(stripped) = part.trim().strip_prefix("max-age=")
            && let Ok(secs) = stripped.parse::<u64>()
        {
            return now.checked_add(Duration::from_secs(secs));
        }
    }
    None
}

/// The polymorphic store: one of two back-ends behind a single call surface.
/// Callers never discriminate between the variants.
#[derive(Debug)]
pub enum CacheStore {
    File(FileStore),
    Redis(RedisStore),
}

impl CacheStore {
    /// Builds the back-end selected by `StoreType` and prepares its durable
    /// state. Unknown store types never get here; settings parsing is fatal
    /// on them.
    pub async fn build(settings: &Settings) -> Result<Self> {
        let store = match settings.store_type {
            StoreType::File => CacheStore::File(FileStore::new(
                settings.cache_dir.clone(),
                settings.image_host.clone(),
            )),
            StoreType::Redis => CacheStore::Redis(RedisStore::connect(&settings.redis_url).await?),
        };
        store.init().await?;
        Ok(store)
    }

    pub async fn init(&self) -> Result<()> {
        match self {
            CacheStore::File(store) => store.init().await,
            CacheStore::Redis(store) => store.init().await,
        }
    }

    pub async fn clear(&self) -> Result<()> {
        match self {
            CacheStore::File(store) => store.clear().await,
            CacheStore::Redis(store) => store.clear().await,
        }
    }

    /// Non-blocking lookup; back-end failures degrade to a miss.
    pub async fn get(&self, shard: u8, digest: &str) -> Option<CacheEntry> {
        let result = match self {
            CacheStore::File(store) => store.get(shard, digest).await,
            CacheStore::Redis(store) => store.get(shard, digest).await,
        };
        match result {
            Ok(entry) => entry,
            Err(err) => {
                debug!(shard, digest, error = %err, "cache get failed; treating as miss");
                None
            }
        }
    }

    /// Overwrite semantics: at most one entry per key.
    pub async fn set(&self, shard: u8, digest: &str, entry: CacheEntry) -> Result<()> {
        match self {
            CacheStore::File(store) => store.set(shard, digest, entry).await,
            CacheStore::Redis(store) => store.set(shard, digest, entry).await,
        }
    }

    /// Removing an absent key is a no-op.
    pub async fn del(&self, shard: u8, digest: &str) -> Result<()> {
        match self {
            CacheStore::File(store) => store.del(shard, digest).await,
            CacheStore::Redis(store) => store.del(shard, digest).await,
        }
    }

    /// Snapshot of every entry's metadata. Not point-in-time consistent with
    /// concurrent mutators, but never deadlocks against them.
    pub async fn get_all(&self) -> Vec<StoredRecord> {
        let result = match self {
            CacheStore::File(store) => Ok(store.get_all()),
            CacheStore::Redis(store) => store.get_all().await,
        };
        match result {
            Ok(records) => records,
            Err(err) => {
                warn!(error = %err, "cache snapshot failed");
                Vec::new()
            }
        }
    }

    pub async fn close(&self) {
        match self {
            CacheStore::File(store) => store.close(),
            CacheStore::Redis(store) => store.close(),
        }
    }
}
