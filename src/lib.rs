pub mod cli;
pub mod compress;
pub mod counters;
pub mod evictor;
pub mod key;
pub mod logging;
pub mod policy;
pub mod pool;
pub mod proxy;
pub mod settings;
pub mod store;

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::counters::Counters;
use crate::policy::CachePolicy;
use crate::pool::WorkerPool;
use crate::proxy::Engine;
use crate::settings::Settings;
use crate::store::CacheStore;

pub async fn run(settings: Settings) -> Result<()> {
    let engine = build_engine(settings).await?;
    evictor::spawn(engine.store.clone(), engine.settings.cleanup_period());
    counters::spawn_stats_logger(engine.counters.clone());
    let result = proxy::run(engine.clone()).await;
    engine.store.close().await;
    result
}

/// Construction order: config → store → pool → engine.
pub async fn build_engine(settings: Settings) -> Result<Engine> {
    let settings = Arc::new(settings);
    let store = Arc::new(CacheStore::build(&settings).await?);
    if settings.clear_on_start {
        store.clear().await?;
        info!("cache store cleared on startup");
    }
    let policy = Arc::new(CachePolicy::new(
        &settings.cache_exceptions,
        settings.max_file_size,
    ));
    let counters = Arc::new(Counters::new());
    let pool = Arc::new(WorkerPool::new(
        settings.worker_count,
        settings.queue_capacity,
        counters.clone(),
    ));
    Ok(Engine::new(settings, store, policy, counters, pool))
}
