use std::fmt::Write as _;

use anyhow::Result;
use http::{Method, StatusCode};
use regex::Regex;
use tokio::io::AsyncWrite;
use tracing::{info, warn};

use super::Engine;
use super::codec::{self, RequestHead};
use super::pipeline::RequestTarget;

const STATUS_PAGE_PATH: &str = "/statuspage";
const STATUS_PAGE_WITH_IMAGE_PATH: &str = "/statuspage-with-image";
const PURGE_PATH: &str = "/purge";

/// Administrative endpoints on the custom host: the status dashboard and the
/// pattern-based purge. Every admin response closes the connection.
pub async fn handle<W>(
    engine: &Engine,
    head: &RequestHead,
    target: &RequestTarget,
    writer: &mut W,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let path = target.path.as_str();
    let response = if head.method == Method::GET && path == STATUS_PAGE_PATH {
        let page = render_status_page(engine, false).await;
        codec::response_with_type(StatusCode::OK, "text/html; charset=utf-8", page.as_bytes())
    } else if head.method == Method::GET && path == STATUS_PAGE_WITH_IMAGE_PATH {
        let page = render_status_page(engine, true).await;
        codec::response_with_type(StatusCode::OK, "text/html; charset=utf-8", page.as_bytes())
    } else if path == PURGE_PATH {
        if head.method == Method::DELETE {
            purge(engine, target.query.as_deref()).await
        } else {
            codec::simple_response(StatusCode::METHOD_NOT_ALLOWED, b"purge requires DELETE\r\n")
        }
    } else {
        codec::simple_response(StatusCode::NOT_FOUND, b"not found\r\n")
    };

    codec::write_all_timed(
        writer,
        &response,
        engine.settings.client_timeout(),
        "writing admin response",
    )
    .await
}

/// Deletes every entry whose URL matches the `pattern` query parameter.
async fn purge(engine: &Engine, query: Option<&str>) -> Vec<u8> {
    let pattern = query_param(query, "pattern").unwrap_or_default();
    let regex = match Regex::new(&pattern) {
        Ok(regex) => regex,
        Err(err) => {
            warn!(pattern, error = %err, "invalid purge pattern");
            return codec::simple_response(StatusCode::BAD_REQUEST, b"invalid purge pattern\r\n");
        }
    };

    let mut removed = 0usize;
    for record in engine.store.get_all().await {
        if !regex.is_match(&record.meta.url) {
            continue;
        }
        match engine.store.del(record.shard, &record.digest).await {
            Ok(()) => info!(url = %record.meta.url, "purged cache entry"),
            Err(err) => warn!(url = %record.meta.url, error = %err, "failed to purge cache entry"),
        }
        removed += 1;
    }

    let body = format!("Purge Success! ({removed} items)\n");
    codec::simple_response(StatusCode::OK, body.as_bytes())
}

async fn render_status_page(engine: &Engine, show_images: bool) -> String {
    let tallies = engine.counters.snapshot();
    let records = engine.store.get_all().await;

    let mut global_urls = Vec::new();
    let mut image_urls = Vec::new();
    for record in records {
        if record.meta.host == engine.settings.image_host {
            image_urls.push(record.meta.url);
        } else {
            global_urls.push(record.meta.url);
        }
    }
    global_urls.sort();
    image_urls.sort();

    let mut page = String::with_capacity(4096);
    page.push_str("<!DOCTYPE html>\n<html>\n<head><title>cachefront status</title></head>\n<body>\n");
    page.push_str("<h1>Cache Status</h1>\n");

    page.push_str("<h2>Hits</h2>\n<table border=\"1\">\n");
    page.push_str("<tr><th>Host</th><th>Hits</th><th>Requests</th><th>Percent</th></tr>\n");
    let rows = [
        ("Global", tallies.global_hits, tallies.global_requests),
        ("Image", tallies.image_hits, tallies.image_requests),
        (
            "Total",
            tallies.global_hits + tallies.image_hits,
            tallies.global_requests + tallies.image_requests,
        ),
    ];
    for (title, hits, requests) in rows {
        let _ = writeln!(
            page,
            "<tr><td>{title}</td><td>{hits}</td><td>{requests}</td><td>{:.2}</td></tr>",
            hit_percent(hits, requests)
        );
    }
    page.push_str("</table>\n");

    page.push_str("<h2>Configuration</h2>\n<table border=\"1\">\n");
    for (name, value) in config_listing(engine) {
        let _ = writeln!(
            page,
            "<tr><td>{}</td><td>{}</td></tr>",
            escape_html(&name),
            escape_html(&value)
        );
    }
    page.push_str("</table>\n");

    page.push_str("<h2>Reasons Not Cached</h2>\n<table border=\"1\">\n");
    let reasons = [
        ("File size", tallies.file_size_rejects),
        ("Cache exception", tallies.exception_rejects),
        ("Status", tallies.status_rejects),
        ("Method", tallies.method_rejects),
        ("Cache-Control", tallies.cache_control_rejects),
        ("Content-Type", tallies.content_type_rejects),
        ("Total", tallies.total_rejects()),
    ];
    for (title, count) in reasons {
        let _ = writeln!(page, "<tr><td>{title}</td><td>{count}</td></tr>");
    }
    page.push_str("</table>\n");

    let _ = writeln!(
        page,
        "<h2>Cached Entries</h2>\n<p>Global: {} entries, Image: {} entries</p>",
        global_urls.len(),
        image_urls.len()
    );
    page.push_str("<h3>Global</h3>\n<ul>\n");
    for url in &global_urls {
        let _ = writeln!(page, "<li>{}</li>", escape_html(url));
    }
    page.push_str("</ul>\n");

    if show_images {
        page.push_str("<h3>Image</h3>\n<table border=\"0\"><tr>\n");
        let third = image_urls.len() / 3;
        let columns = [
            &image_urls[..third],
            &image_urls[third..third * 2],
            &image_urls[third * 2..],
        ];
        for column in columns {
            page.push_str("<td valign=\"top\"><ul>\n");
            for url in column {
                let _ = writeln!(page, "<li>{}</li>", escape_html(url));
            }
            page.push_str("</ul></td>\n");
        }
        page.push_str("</tr></table>\n");
    }

    page.push_str("</body>\n</html>\n");
    page
}

fn hit_percent(hits: u64, requests: u64) -> f64 {
    if hits == 0 || requests == 0 {
        return 0.0;
    }
    let percent = hits as f64 / requests as f64 * 100.0;
    (percent * 100.0).round() / 100.0
}

/// Configuration options sorted by name, rendered from the live settings.
fn config_listing(engine: &Engine) -> Vec<(String, String)> {
    let value = serde_json::to_value(engine.settings.as_ref()).unwrap_or_default();
    let mut listing = Vec::new();
    if let serde_json::Value::Object(map) = value {
        for (name, value) in map {
            let rendered = match value {
                serde_json::Value::String(text) => text,
                other => other.to_string(),
            };
            listing.push((name, rendered));
        }
    }
    listing.sort_by(|a, b| a.0.cmp(&b.0));
    listing
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

fn query_param(query: Option<&str>, name: &str) -> Option<String> {
    for part in query?.split('&') {
        if let Some((key, value)) = part.split_once('=')
            && key == name
        {
            return Some(percent_decode(value));
        }
    }
    None
}

fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        match bytes[index] {
            b'+' => {
                decoded.push(b' ');
                index += 1;
            }
            b'%' => match hex_pair(bytes.get(index + 1), bytes.get(index + 2)) {
                Some(byte) => {
                    decoded.push(byte);
                    index += 3;
                }
                None => {
                    decoded.push(bytes[index]);
                    index += 1;
                }
            },
            byte => {
                decoded.push(byte);
                index += 1;
            }
        }
    }
    String::from_utf8_lossy(&decoded).into_owned()
}

fn hex_pair(high: Option<&u8>, low: Option<&u8>) -> Option<u8> {
    let high = (*high? as char).to_digit(16)?;
    let low = (*low? as char).to_digit(16)?;
    Some((high * 16 + low) as u8)
}
