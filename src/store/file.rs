use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::fs as async_fs;
use tracing::{info, warn};

use super::{CacheEntry, EntryMeta, PersistedEntry, StoredRecord};

const BODY_DIR: &str = "log_body";
const IMAGE_DIR: &str = "log_image";
const TEMP_PREFIX: &str = "tmp_";
const META_EXTENSION: &str = "meta";

#[derive(Debug, Clone)]
struct IndexedEntry {
    meta: EntryMeta,
    body_path: PathBuf,
}

/// File-backed store: bodies live flat under `log_body/` (or `log_image/`
/// for the image host), one file per entry named by the digest, with a
/// `<digest>.meta` JSON sidecar. The in-memory index is rebuilt from those
/// sidecars on `init`.
#[derive(Debug)]
pub struct FileStore {
    body_dir: PathBuf,
    image_dir: PathBuf,
    image_host: String,
    index: Mutex<HashMap<(u8, String), IndexedEntry>>,
}

impl FileStore {
    pub fn new(cache_dir: PathBuf, image_host: String) -> Self {
        Self {
            body_dir: cache_dir.join(BODY_DIR),
            image_dir: cache_dir.join(IMAGE_DIR),
            image_host,
            index: Mutex::new(HashMap::new()),
        }
    }

    pub async fn init(&self) -> Result<()> {
        for dir in [&self.body_dir, &self.image_dir] {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create cache dir {}", dir.display()))?;
        }
        self.rebuild_index()?;
        Ok(())
    }

    pub async fn clear(&self) -> Result<()> {
        self.index.lock().clear();
        for dir in [&self.body_dir, &self.image_dir] {
            match fs::remove_dir_all(dir) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("failed to clear cache dir {}", dir.display()));
                }
            }
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to recreate cache dir {}", dir.display()))?;
        }
        Ok(())
    }

    pub async fn get(&self, shard: u8, digest: &str) -> Result<Option<CacheEntry>> {
        let indexed = {
            let index = self.index.lock();
            index.get(&(shard, digest.to_string())).cloned()
        };
        let Some(indexed) = indexed else {
            return Ok(None);
        };

        match async_fs::read(&indexed.body_path).await {
            Ok(body) => Ok(Some(CacheEntry {
                meta: indexed.meta,
                body,
            })),
            Err(err) => {
                warn!(
                    path = %indexed.body_path.display(),
                    error = %err,
                    "cache body unreadable; dropping entry"
                );
                self.index.lock().remove(&(shard, digest.to_string()));
                remove_entry_files(&indexed.body_path).await;
                Ok(None)
            }
        }
    }

    pub async fn set(&self, shard: u8, digest: &str, entry: CacheEntry) -> Result<()> {
        let dir = if entry.meta.host == self.image_host {
            &self.image_dir
        } else {
            &self.body_dir
        };
        // Unique temp names keep concurrent writes for the same key from
        // trampling each other before the rename.
        static WRITE_SEQ: AtomicU64 = AtomicU64::new(0);
        let seq = WRITE_SEQ.fetch_add(1, Ordering::Relaxed);
        let body_path = dir.join(digest);
        let temp_path = dir.join(format!("{TEMP_PREFIX}{digest}.{seq}"));

        async_fs::write(&temp_path, &entry.body)
            .await
            .with_context(|| format!("failed to write cache body {}", temp_path.display()))?;
        if let Err(err) = async_fs::rename(&temp_path, &body_path).await {
            let _ = async_fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!("failed to move cache body into place at {}", body_path.display())
            });
        }

        let persisted = PersistedEntry::from_meta(shard, &entry.meta);
        let data = serde_json::to_vec(&persisted)?;
        let meta_path = meta_path_for(&body_path);
        if let Err(err) = async_fs::write(&meta_path, &data).await {
            let _ = async_fs::remove_file(&body_path).await;
            return Err(err)
                .with_context(|| format!("failed to write cache metadata {}", meta_path.display()));
        }

        let previous = {
            let mut index = self.index.lock();
            index.insert(
                (shard, digest.to_string()),
                IndexedEntry {
                    meta: entry.meta,
                    body_path: body_path.clone(),
                },
            )
        };
        // An overwrite can move an entry between host directories; the stale
        // pair must not linger as an orphan.
        if let Some(previous) = previous
            && previous.body_path != body_path
        {
            remove_entry_files(&previous.body_path).await;
        }
        Ok(())
    }

    pub async fn del(&self, shard: u8, digest: &str) -> Result<()> {
        let removed = self.index.lock().remove(&(shard, digest.to_string()));
        if let Some(removed) = removed {
            remove_entry_files(&removed.body_path).await;
        }
        Ok(())
    }

    pub fn get_all(&self) -> Vec<StoredRecord> {
        let index = self.index.lock();
        index
            .iter()
            .map(|((shard, digest), indexed)| StoredRecord {
                shard: *shard,
                digest: digest.clone(),
                meta: indexed.meta.clone(),
            })
            .collect()
    }

    pub fn close(&self) {}

    /// Scans both directories, restoring entries from their metadata
    /// sidecars. Unparsable sidecars and orphan bodies are removed.
    fn rebuild_index(&self) -> Result<()> {
        let mut rebuilt: HashMap<(u8, String), IndexedEntry> = HashMap::new();
        let mut restored = 0usize;

        for dir in [&self.body_dir, &self.image_dir] {
            let mut meta_files = Vec::new();
            let mut body_files = Vec::new();
            for entry in fs::read_dir(dir)
                .with_context(|| format!("failed to scan cache dir {}", dir.display()))?
            {
                let entry = entry?;
                if !entry.file_type()?.is_file() {
                    continue;
                }
                let path = entry.path();
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if name.starts_with(TEMP_PREFIX) {
                    fs::remove_file(&path).ok();
                } else if path.extension().and_then(|ext| ext.to_str()) == Some(META_EXTENSION) {
                    meta_files.push(path);
                } else {
                    body_files.push(path);
                }
            }

            let mut live_digests = Vec::new();
            for meta_path in meta_files {
                match restore_from_meta(&meta_path) {
                    Some((shard, digest, meta)) => {
                        let body_path = dir.join(&digest);
                        live_digests.push(digest.clone());
                        rebuilt.insert((shard, digest), IndexedEntry { meta, body_path });
                        restored += 1;
                    }
                    None => {
                        if let Some(stem) = meta_path.file_stem().and_then(|s| s.to_str()) {
                            fs::remove_file(dir.join(stem)).ok();
                        }
                        fs::remove_file(&meta_path).ok();
                    }
                }
            }

            for body_path in body_files {
                let keep = body_path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .map(|name| live_digests.iter().any(|digest| digest == name))
                    .unwrap_or(false);
                if !keep {
                    warn!(path = %body_path.display(), "removing orphan cache body");
                    fs::remove_file(&body_path).ok();
                }
            }
        }

        *self.index.lock() = rebuilt;
        info!(restored, "file cache index rebuilt");
        Ok(())
    }
}

fn meta_path_for(body_path: &Path) -> PathBuf {
    let mut path = body_path.to_path_buf();
    path.set_extension(META_EXTENSION);
    path
}

fn restore_from_meta(meta_path: &Path) -> Option<(u8, String, EntryMeta)> {
    let digest = meta_path.file_stem().and_then(|s| s.to_str())?.to_string();
    let data = match fs::read(meta_path) {
        Ok(data) => data,
        Err(err) => {
            warn!(path = %meta_path.display(), error = %err, "failed to read cache metadata");
            return None;
        }
    };
    let persisted: PersistedEntry = match serde_json::from_slice(&data) {
        Ok(persisted) => persisted,
        Err(err) => {
            warn!(path = %meta_path.display(), error = %err, "failed to parse cache metadata");
            return None;
        }
    };
    let body_path = meta_path.with_extension("");
    if !body_path.exists() {
        return None;
    }
    let shard = persisted.shard;
    Some((shard, digest, persisted.into_meta()))
}

async fn remove_entry_files(body_path: &Path) {
    if let Err(err) = async_fs::remove_file(body_path).await
        && err.kind() != ErrorKind::NotFound
    {
        warn!(path = %body_path.display(), error = %err, "failed to remove cache body");
    }
    let meta_path = meta_path_for(body_path);
    if let Err(err) = async_fs::remove_file(&meta_path).await
        && err.kind() != ErrorKind::NotFound
    {
        warn!(path = %meta_path.display(), error = %err, "failed to remove cache metadata");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderMap;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    const IMAGE_HOST: &str = "image.example.com";

    fn build_store(dir: &TempDir) -> FileStore {
        FileStore::new(dir.path().to_path_buf(), IMAGE_HOST.to_string())
    }

    fn sample_entry(host: &str, body: &[u8]) -> CacheEntry {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", "text/plain".parse().unwrap());
        CacheEntry {
            meta: EntryMeta {
                headers,
                url: format!("{host}/item"),
                host: host.to_string(),
                cached_at: SystemTime::now(),
                expires_at: Some(SystemTime::now() + Duration::from_secs(60)),
            },
            body: body.to_vec(),
        }
    }

    #[tokio::test]
    async fn set_get_del_lifecycle() -> Result<()> {
        let dir = TempDir::new()?;
        let store = build_store(&dir);
        store.init().await?;

        store
            .set(7, "abc123", sample_entry("global.example.com", b"hello"))
            .await?;

        let hit = store.get(7, "abc123").await?.expect("entry present");
        assert_eq!(hit.body, b"hello");
        assert_eq!(hit.meta.host, "global.example.com");
        assert!(dir.path().join(BODY_DIR).join("abc123").exists());

        store.del(7, "abc123").await?;
        assert!(store.get(7, "abc123").await?.is_none());
        assert!(!dir.path().join(BODY_DIR).join("abc123").exists());
        assert!(!dir.path().join(BODY_DIR).join("abc123.meta").exists());
        Ok(())
    }

    #[tokio::test]
    async fn image_host_bodies_live_in_their_own_directory() -> Result<()> {
        let dir = TempDir::new()?;
        let store = build_store(&dir);
        store.init().await?;

        store.set(1, "imgdigest", sample_entry(IMAGE_HOST, b"png")).await?;
        assert!(dir.path().join(IMAGE_DIR).join("imgdigest").exists());
        assert!(!dir.path().join(BODY_DIR).join("imgdigest").exists());
        Ok(())
    }

    #[tokio::test]
    async fn set_overwrites_existing_entry() -> Result<()> {
        let dir = TempDir::new()?;
        let store = build_store(&dir);
        store.init().await?;

        store
            .set(3, "dup", sample_entry("global.example.com", b"first"))
            .await?;
        store
            .set(3, "dup", sample_entry("global.example.com", b"second"))
            .await?;

        let hit = store.get(3, "dup").await?.expect("entry present");
        assert_eq!(hit.body, b"second");
        assert_eq!(store.get_all().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn del_of_absent_key_is_a_noop() -> Result<()> {
        let dir = TempDir::new()?;
        let store = build_store(&dir);
        store.init().await?;
        store.del(9, "missing").await?;
        Ok(())
    }

    #[tokio::test]
    async fn clear_removes_everything() -> Result<()> {
        let dir = TempDir::new()?;
        let store = build_store(&dir);
        store.init().await?;

        store.set(1, "a", sample_entry("global.example.com", b"a")).await?;
        store.set(2, "b", sample_entry(IMAGE_HOST, b"b")).await?;
        store.clear().await?;

        assert!(store.get_all().is_empty());
        assert_eq!(fs::read_dir(dir.path().join(BODY_DIR))?.count(), 0);
        assert_eq!(fs::read_dir(dir.path().join(IMAGE_DIR))?.count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn rebuild_restores_persisted_entries() -> Result<()> {
        let dir = TempDir::new()?;
        {
            let store = build_store(&dir);
            store.init().await?;
            store
                .set(11, "persisted", sample_entry("global.example.com", b"kept"))
                .await?;
        }

        let store = build_store(&dir);
        store.init().await?;
        let hit = store.get(11, "persisted").await?.expect("restored");
        assert_eq!(hit.body, b"kept");
        assert_eq!(hit.meta.url, "global.example.com/item");
        Ok(())
    }

    #[tokio::test]
    async fn rebuild_drops_orphans_and_bad_metadata() -> Result<()> {
        let dir = TempDir::new()?;
        {
            let store = build_store(&dir);
            store.init().await?;
        }
        let body_dir = dir.path().join(BODY_DIR);
        fs::write(body_dir.join("orphanbody"), b"junk")?;
        fs::write(body_dir.join("badmeta"), b"body")?;
        fs::write(body_dir.join("badmeta.meta"), b"not json")?;
        fs::write(body_dir.join("tmp_leftover"), b"partial")?;

        let store = build_store(&dir);
        store.init().await?;
        assert!(store.get_all().is_empty());
        assert_eq!(fs::read_dir(&body_dir)?.count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn missing_body_degrades_to_miss() -> Result<()> {
        let dir = TempDir::new()?;
        let store = build_store(&dir);
        store.init().await?;
        store
            .set(5, "vanish", sample_entry("global.example.com", b"x"))
            .await?;

        fs::remove_file(dir.path().join(BODY_DIR).join("vanish"))?;
        assert!(store.get(5, "vanish").await?.is_none());
        assert!(store.get_all().is_empty(), "entry dropped from index");
        Ok(())
    }

    #[tokio::test]
    async fn get_all_reports_shard_and_digest() -> Result<()> {
        let dir = TempDir::new()?;
        let store = build_store(&dir);
        store.init().await?;
        store.set(8, "rec", sample_entry("global.example.com", b"x")).await?;

        let records = store.get_all();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].shard, 8);
        assert_eq!(records[0].digest, "rec");
        assert_eq!(records[0].meta.url, "global.example.com/item");
        Ok(())
    }
}
