mod support;

use std::time::{Duration, SystemTime};

use anyhow::Result;
use http::HeaderMap;
use tempfile::TempDir;

use cachefront::store::{CacheEntry, EntryMeta};
use support::{ADMIN_HOST, GLOBAL_HOST, IMAGE_HOST, client, spawn_proxy, test_settings};

fn seeded_entry(url: &str, host: &str) -> CacheEntry {
    let mut headers = HeaderMap::new();
    headers.insert("content-type", "text/html".parse().unwrap());
    CacheEntry {
        meta: EntryMeta {
            headers,
            url: url.to_string(),
            host: host.to_string(),
            cached_at: SystemTime::now(),
            expires_at: Some(SystemTime::now() + Duration::from_secs(300)),
        },
        body: b"seeded".to_vec(),
    }
}

#[tokio::test]
async fn purge_removes_exactly_the_matching_entries() -> Result<()> {
    let dir = TempDir::new()?;
    let (addr, engine) = spawn_proxy(test_settings(&dir, None, None)).await?;

    for index in 0..3 {
        let url = format!("{GLOBAL_HOST}/products/{index}");
        engine
            .store
            .set(index, &format!("product{index}"), seeded_entry(&url, GLOBAL_HOST))
            .await?;
    }
    for index in 0..7 {
        let url = format!("{GLOBAL_HOST}/pages/{index}");
        engine
            .store
            .set(100 + index, &format!("page{index}"), seeded_entry(&url, GLOBAL_HOST))
            .await?;
    }
    assert_eq!(engine.store.get_all().await.len(), 10);

    let response = client::send(
        addr,
        &client::request(
            "DELETE",
            ADMIN_HOST,
            &format!("/purge?pattern=%5E{GLOBAL_HOST}/products/"),
            "",
        ),
    )
    .await?;
    assert_eq!(response.status, 200);
    assert_eq!(response.body_text(), "Purge Success! (3 items)\n");

    let survivors = engine.store.get_all().await;
    assert_eq!(survivors.len(), 7);
    assert!(
        survivors
            .iter()
            .all(|record| !record.meta.url.contains("/products/")),
        "no matching entry survives"
    );
    Ok(())
}

#[tokio::test]
async fn purge_with_invalid_pattern_answers_400() -> Result<()> {
    let dir = TempDir::new()?;
    let (addr, engine) = spawn_proxy(test_settings(&dir, None, None)).await?;
    engine
        .store
        .set(1, "survivor", seeded_entry("global.test/keep", GLOBAL_HOST))
        .await?;

    let response = client::send(
        addr,
        &client::request("DELETE", ADMIN_HOST, "/purge?pattern=%5B", ""),
    )
    .await?;
    assert_eq!(response.status, 400);
    assert_eq!(engine.store.get_all().await.len(), 1);
    Ok(())
}

#[tokio::test]
async fn purge_requires_the_delete_method() -> Result<()> {
    let dir = TempDir::new()?;
    let (addr, _engine) = spawn_proxy(test_settings(&dir, None, None)).await?;
    let response = client::get(addr, ADMIN_HOST, "/purge?pattern=x").await?;
    assert_eq!(response.status, 405);
    Ok(())
}

#[tokio::test]
async fn status_page_renders_counters_and_entries() -> Result<()> {
    let dir = TempDir::new()?;
    let (addr, engine) = spawn_proxy(test_settings(&dir, None, None)).await?;

    engine
        .store
        .set(1, "g1", seeded_entry("global.test/landing", GLOBAL_HOST))
        .await?;
    engine
        .store
        .set(2, "i1", seeded_entry("image.test/logo.png", IMAGE_HOST))
        .await?;

    let page = client::get(addr, ADMIN_HOST, "/statuspage").await?;
    assert_eq!(page.status, 200);
    assert_eq!(
        page.header("content-type"),
        Some("text/html; charset=utf-8")
    );
    let html = page.body_text();
    assert!(html.contains("Cache Status"));
    assert!(html.contains("Reasons Not Cached"));
    assert!(html.contains("global.test/landing"));
    assert!(html.contains("MaxFileSize"), "configuration listing present");
    assert!(
        !html.contains("image.test/logo.png"),
        "plain status page omits the image list"
    );

    let with_images = client::get(addr, ADMIN_HOST, "/statuspage-with-image").await?;
    assert!(with_images.body_text().contains("image.test/logo.png"));
    Ok(())
}

#[tokio::test]
async fn unknown_hosts_get_404() -> Result<()> {
    let dir = TempDir::new()?;
    let (addr, _engine) = spawn_proxy(test_settings(&dir, None, None)).await?;
    let response = client::get(addr, "stranger.test", "/anything").await?;
    assert_eq!(response.status, 404);
    Ok(())
}

#[tokio::test]
async fn unknown_admin_paths_get_404() -> Result<()> {
    let dir = TempDir::new()?;
    let (addr, _engine) = spawn_proxy(test_settings(&dir, None, None)).await?;
    let response = client::get(addr, ADMIN_HOST, "/nope").await?;
    assert_eq!(response.status, 404);
    Ok(())
}
