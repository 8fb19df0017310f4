#![allow(dead_code)]

pub mod client;
pub mod upstream;

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use tempfile::TempDir;
use tokio::net::TcpListener;

use cachefront::proxy::{Engine, listener};
use cachefront::settings::Settings;

pub const GLOBAL_HOST: &str = "global.test";
pub const IMAGE_HOST: &str = "image.test";
pub const ADMIN_HOST: &str = "admin.test";

pub fn test_settings(
    cache_dir: &TempDir,
    global_upstream: Option<SocketAddr>,
    image_upstream: Option<SocketAddr>,
) -> Settings {
    serde_json::from_value(serde_json::json!({
        "Listen": "127.0.0.1:0",
        "GlobalHost": GLOBAL_HOST,
        "ImageHost": IMAGE_HOST,
        "AdminHost": ADMIN_HOST,
        "GlobalUpstream": global_upstream.map(|addr| addr.to_string()),
        "ImageUpstream": image_upstream.map(|addr| addr.to_string()),
        "StoreType": "file",
        "CacheDir": cache_dir.path().to_str().expect("utf-8 temp dir"),
        "WorkerCount": 4,
        "QueueCapacity": 64,
        "CleanupFrequency": 3600,
        "ClientTimeout": 5,
        "UpstreamTimeout": 5,
        "Log": "text"
    }))
    .expect("build test settings")
}

/// Binds the proxy on an ephemeral port and serves it in the background.
/// The engine handle is returned so tests can inspect counters and seed or
/// read the store directly.
pub async fn spawn_proxy(settings: Settings) -> Result<(SocketAddr, Engine)> {
    let engine = cachefront::build_engine(settings).await?;
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let serve_engine = engine.clone();
    tokio::spawn(async move {
        let _ = listener::serve(listener, serve_engine).await;
    });
    Ok((addr, engine))
}

/// Polls `op` until it reports success or a few seconds elapse. Cache writes
/// are pool-deferred, so tests observe them eventually rather than
/// immediately.
pub async fn eventually<F, Fut>(mut op: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..120 {
        if op().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}
