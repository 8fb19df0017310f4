use std::time::SystemTime;

use anyhow::{Result, anyhow};
use http::{HeaderMap, Method, StatusCode, header};
use tokio::io::{AsyncWrite, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::counters::{HostClass, RejectReason};
use crate::key::CacheKey;
use crate::store::{self, CacheEntry, EntryMeta};
use crate::compress;

use super::codec::{self, BodyFraming, CaptureBuffer, HeadLimits};
use super::pipeline::ClientDisposition;
use super::Engine;

pub struct ForwardRequest<'a> {
    pub engine: &'a Engine,
    pub class: HostClass,
    pub method: &'a Method,
    pub req_headers: &'a HeaderMap,
    pub host: &'a str,
    pub path: &'a str,
    pub query: Option<&'a str>,
    pub key: &'a CacheKey,
    pub body: Vec<u8>,
    pub client_close: bool,
}

/// Proxies one exchange to the origin. The response head and raw body bytes
/// go to the client unchanged; a decoded copy of the body feeds the capture
/// path, which decides cacheability and enqueues the deferred store write.
/// Capture problems never affect what the client receives.
pub async fn forward_and_capture<W>(
    client: &mut W,
    req: ForwardRequest<'_>,
) -> Result<ClientDisposition>
where
    W: AsyncWrite + Unpin,
{
    let engine = req.engine;
    let addr = engine.upstream_addr(req.class);

    let upstream = match timeout(
        engine.settings.upstream_connect_timeout(),
        TcpStream::connect(&addr),
    )
    .await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => return bad_gateway(client, engine, &addr, err.into()).await,
        Err(_) => {
            return bad_gateway(client, engine, &addr, anyhow!("connect timed out")).await;
        }
    };

    let mut up_reader = BufReader::new(upstream);
    let io_timeout = engine.settings.upstream_timeout();

    let request_head =
        build_upstream_request_head(req.method, req.host, req.path, req.query, req.req_headers);
    if let Err(err) =
        codec::write_all_timed(up_reader.get_mut(), &request_head, io_timeout, "sending request")
            .await
    {
        return bad_gateway(client, engine, &addr, err).await;
    }
    if !req.body.is_empty()
        && let Err(err) =
            codec::write_all_timed(up_reader.get_mut(), &req.body, io_timeout, "sending request body")
                .await
    {
        return bad_gateway(client, engine, &addr, err).await;
    }

    let limits = HeadLimits {
        max_bytes: engine.settings.max_header_size,
        read_timeout: io_timeout,
    };
    let response = match codec::read_response_head(&mut up_reader, &limits).await {
        Ok(response) => response,
        Err(err) => return bad_gateway(client, engine, &addr, err).await,
    };

    let head_verdict =
        engine
            .policy
            .check_head(&req.key.uri, req.method, response.status, &response.headers);
    if let Err(reason) = head_verdict {
        engine.counters.record_rejection(reason);
        debug!(uri = %req.key.uri, reason = ?reason, "response not cacheable");
    }

    let framing = codec::response_framing(
        req.method == Method::HEAD,
        response.status,
        &response.headers,
    );
    let client_close = req.client_close || framing == BodyFraming::UntilClose;
    let connection = if client_close { "close" } else { "keep-alive" };

    let encoded =
        codec::encode_response_head(response.status, &response.reason, &response.headers, connection);
    codec::write_all_timed(
        client,
        &encoded,
        engine.settings.client_timeout(),
        "writing forwarded response head",
    )
    .await?;

    let mut capture = if head_verdict.is_ok() {
        CaptureBuffer::new(true, engine.settings.max_capture_size)
    } else {
        CaptureBuffer::disabled()
    };
    codec::relay_body(&mut up_reader, client, framing, &mut capture, io_timeout).await?;

    if capture.overflowed() {
        // The cap never sits below MaxFileSize, so an overflowing body could
        // not have passed the size predicate either.
        engine.counters.record_rejection(RejectReason::FileSize);
        warn!(uri = %req.key.uri, "origin body exceeded capture limit; not cached");
    } else if let Some(raw_body) = capture.into_body() {
        enqueue_capture(engine, req.class, req.key, req.host, req.path, req.query, response.headers, raw_body);
    }

    Ok(if client_close {
        ClientDisposition::Close
    } else {
        ClientDisposition::Continue
    })
}

/// Runs the tail of the cacheability decision (decompression, size) and
/// hands the store write to the worker pool.
#[allow(clippy::too_many_arguments)]
fn enqueue_capture(
    engine: &Engine,
    class: HostClass,
    key: &CacheKey,
    host: &str,
    path: &str,
    query: Option<&str>,
    headers: HeaderMap,
    raw_body: Vec<u8>,
) {
    let mut headers = headers;
    let mut body = raw_body;

    // Only the global host normalises gzip payloads; see the capture rules.
    if class == HostClass::Global
        && codec::header_contains(&headers, header::CONTENT_ENCODING, "gzip")
    {
        match compress::gunzip(&body) {
            Ok(decompressed) => {
                body = decompressed;
                headers.remove(header::CONTENT_ENCODING);
            }
            Err(err) => {
                engine.counters.record_io_error();
                warn!(uri = %key.uri, error = %err, "origin body failed to decompress; not cached");
                return;
            }
        }
    }

    if let Err(reason) = engine.policy.check_body_size(body.len() as u64) {
        engine.counters.record_rejection(reason);
        debug!(
            uri = %key.uri,
            size = body.len(),
            "decompressed body exceeds MaxFileSize; not cached"
        );
        return;
    }

    let now = SystemTime::now();
    let expires_at = {
        let cache_control = headers
            .get(header::CACHE_CONTROL)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("");
        store::expiry_from_cache_control(cache_control, now)
    };
    let url = match query {
        Some(query) => format!("{host}{path}?{query}"),
        None => format!("{host}{path}"),
    };

    let entry = CacheEntry {
        meta: EntryMeta {
            headers,
            url,
            host: host.to_string(),
            cached_at: now,
            expires_at,
        },
        body,
    };

    let store = engine.store.clone();
    let counters = engine.counters.clone();
    let shard = key.shard;
    let digest = key.digest.clone();
    engine.pool.add_task(async move {
        match store.set(shard, &digest, entry).await {
            Ok(()) => counters.record_cached_file(),
            Err(err) => {
                counters.record_io_error();
                warn!(digest = %digest, error = %err, "cache write failed");
            }
        }
    });
}

fn build_upstream_request_head(
    method: &Method,
    host: &str,
    path: &str,
    query: Option<&str>,
    req_headers: &HeaderMap,
) -> Vec<u8> {
    let target = match query {
        Some(query) => format!("{path}?{query}"),
        None => path.to_string(),
    };
    let mut head = format!("{method} {target} HTTP/1.1\r\n").into_bytes();
    head.extend_from_slice(b"Host: ");
    head.extend_from_slice(host.as_bytes());
    head.extend_from_slice(b"\r\n");
    for (name, value) in req_headers.iter() {
        if skip_request_header(name) {
            continue;
        }
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    // One origin connection per exchange.
    head.extend_from_slice(b"Connection: close\r\n\r\n");
    head
}

fn skip_request_header(name: &header::HeaderName) -> bool {
    name == header::HOST
        || name == header::CONNECTION
        || name == header::TRANSFER_ENCODING
        || name == header::UPGRADE
        || name == header::TE
        || name == header::TRAILER
        || name.as_str() == "keep-alive"
        || name.as_str() == "proxy-connection"
}

async fn bad_gateway<W>(
    client: &mut W,
    engine: &Engine,
    addr: &str,
    err: anyhow::Error,
) -> Result<ClientDisposition>
where
    W: AsyncWrite + Unpin,
{
    warn!(upstream = %addr, error = %err, "upstream exchange failed");
    let response = codec::simple_response(StatusCode::BAD_GATEWAY, b"bad gateway\r\n");
    codec::write_all_timed(
        client,
        &response,
        engine.settings.client_timeout(),
        "writing bad gateway response",
    )
    .await?;
    Ok(ClientDisposition::Close)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_request_head_rewrites_connection_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, "client-facing".parse().unwrap());
        headers.insert(header::CONNECTION, "keep-alive".parse().unwrap());
        headers.insert(header::ACCEPT_ENCODING, "gzip".parse().unwrap());
        headers.insert("x-custom", "1".parse().unwrap());

        let head = build_upstream_request_head(
            &Method::GET,
            "global.example.com",
            "/foo",
            Some("a=1"),
            &headers,
        );
        let text = String::from_utf8(head).unwrap();
        assert!(text.starts_with("GET /foo?a=1 HTTP/1.1\r\n"));
        assert!(text.contains("Host: global.example.com\r\n"));
        assert!(text.contains("accept-encoding: gzip\r\n"));
        assert!(text.contains("x-custom: 1\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(!text.contains("client-facing"));
        assert!(!text.contains("keep-alive"));
        assert!(text.ends_with("\r\n\r\n"));
    }
}
