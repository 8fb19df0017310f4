use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::store::CacheStore;

/// Periodic eviction: every `period`, snapshot the store and delete every
/// entry whose expiry has passed. Entries that never carried a `max-age`
/// count as already expired and disappear on the first sweep.
pub fn spawn(store: Arc<CacheStore>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        // The first interval tick fires immediately; the sweep cadence
        // starts one full period after startup.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            sweep(&store).await;
        }
    })
}

pub async fn sweep(store: &CacheStore) -> u64 {
    let now = SystemTime::now();
    let mut removed = 0u64;

    for record in store.get_all().await {
        if !record.meta.is_expired(now) {
            continue;
        }
        match store.del(record.shard, &record.digest).await {
            Ok(()) => {
                info!(url = %record.meta.url, "expired cache entry removed");
                removed += 1;
            }
            Err(err) => {
                warn!(url = %record.meta.url, error = %err, "failed to remove expired cache entry");
            }
        }
    }

    info!(removed, "eviction sweep finished");
    removed
}
