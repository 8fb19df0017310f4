use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostClass {
    Global,
    Image,
}

/// Why a response was refused by the cacheability policy. Exactly one reason
/// is recorded per non-cacheable response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    CacheException,
    Status,
    Method,
    CacheControl,
    ContentType,
    FileSize,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Tallies {
    pub global_requests: u64,
    pub global_hits: u64,
    pub image_requests: u64,
    pub image_hits: u64,
    pub served_from_cache: u64,
    pub cached_files: u64,
    pub exception_rejects: u64,
    pub status_rejects: u64,
    pub method_rejects: u64,
    pub cache_control_rejects: u64,
    pub content_type_rejects: u64,
    pub file_size_rejects: u64,
    pub io_errors: u64,
    pub dropped_tasks: u64,
}

impl Tallies {
    pub fn total_rejects(&self) -> u64 {
        self.exception_rejects
            + self.status_rejects
            + self.method_rejects
            + self.cache_control_rejects
            + self.content_type_rejects
            + self.file_size_rejects
    }
}

/// All request/hit/rejection tallies behind one reader-writer lock. The
/// dashboard snapshots under the read lock; increments take the write lock.
#[derive(Debug, Default)]
pub struct Counters {
    inner: RwLock<Tallies>,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self, host: HostClass) {
        let mut tallies = self.inner.write();
        match host {
            HostClass::Global => tallies.global_requests += 1,
            HostClass::Image => tallies.image_requests += 1,
        }
    }

    pub fn record_hit(&self, host: HostClass) {
        let mut tallies = self.inner.write();
        match host {
            HostClass::Global => tallies.global_hits += 1,
            HostClass::Image => tallies.image_hits += 1,
        }
        tallies.served_from_cache += 1;
    }

    pub fn record_cached_file(&self) {
        self.inner.write().cached_files += 1;
    }

    pub fn record_rejection(&self, reason: RejectReason) {
        let mut tallies = self.inner.write();
        match reason {
            RejectReason::CacheException => tallies.exception_rejects += 1,
            RejectReason::Status => tallies.status_rejects += 1,
            RejectReason::Method => tallies.method_rejects += 1,
            RejectReason::CacheControl => tallies.cache_control_rejects += 1,
            RejectReason::ContentType => tallies.content_type_rejects += 1,
            RejectReason::FileSize => tallies.file_size_rejects += 1,
        }
    }

    pub fn record_io_error(&self) {
        self.inner.write().io_errors += 1;
    }

    pub fn record_dropped_task(&self) {
        self.inner.write().dropped_tasks += 1;
    }

    pub fn snapshot(&self) -> Tallies {
        *self.inner.read()
    }

    /// Returns the cached-file count accumulated since the previous call and
    /// resets it, together with the cumulative served-from-cache total.
    pub fn take_cached_files(&self) -> (u64, u64) {
        let mut tallies = self.inner.write();
        let cached = tallies.cached_files;
        tallies.cached_files = 0;
        (cached, tallies.served_from_cache)
    }
}

/// Per-second stats line: files cached in the last second plus the running
/// served-from-cache total.
pub fn spawn_stats_logger(counters: Arc<Counters>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let (cached, served) = counters.take_cached_files();
            info!(
                target: "cache_stats",
                cached_last_second = cached,
                served_total = served,
            );
        }
    })
}
