use std::net::SocketAddr;
use std::time::{Instant, SystemTime};

use anyhow::{Context, Result, anyhow};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::counters::HostClass;
use crate::store::CacheEntry;
use crate::{compress, key, logging};

use super::codec::{self, HeadLimits, RequestHead};
use super::{Engine, HostRoute, admin, upstream};

pub enum ClientDisposition {
    Continue,
    Close,
}

/// The pieces of a request target the pipeline cares about. Absolute-form
/// targets carry their own host, which wins over the transport `Host`.
#[derive(Debug, Clone)]
pub struct RequestTarget {
    pub host_from_url: Option<String>,
    pub path: String,
    pub query: Option<String>,
}

pub async fn handle_connection(stream: TcpStream, peer: SocketAddr, engine: Engine) -> Result<()> {
    let limits = HeadLimits {
        max_bytes: engine.settings.max_header_size,
        read_timeout: engine.settings.client_timeout(),
    };
    let mut reader = BufReader::new(stream);
    loop {
        let head = match codec::read_request_head(&mut reader, &limits).await {
            Ok(Some(head)) => head,
            Ok(None) => return Ok(()),
            Err(err) => {
                debug!(peer = %peer, error = %err, "failed to read request head");
                respond(
                    reader.get_mut(),
                    &engine,
                    StatusCode::BAD_REQUEST,
                    b"bad request\r\n",
                )
                .await?;
                return Ok(());
            }
        };
        match handle_request(&mut reader, peer, &engine, head).await? {
            ClientDisposition::Continue => {}
            ClientDisposition::Close => {
                let _ = reader.get_mut().shutdown().await;
                return Ok(());
            }
        }
    }
}

async fn handle_request<S>(
    reader: &mut BufReader<S>,
    peer: SocketAddr,
    engine: &Engine,
    head: RequestHead,
) -> Result<ClientDisposition>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let target = parse_target(&head.target);
    let host = target.host_from_url.clone().or_else(|| {
        head.headers
            .get(header::HOST)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_string())
    });
    let Some(host) = host else {
        respond(
            reader.get_mut(),
            engine,
            StatusCode::BAD_REQUEST,
            b"missing Host header\r\n",
        )
        .await?;
        return Ok(ClientDisposition::Close);
    };

    let body_len = match codec::request_body_length(&head.headers) {
        Ok(len) => len,
        Err(err) => {
            debug!(peer = %peer, error = %err, "unsupported request body framing");
            respond(
                reader.get_mut(),
                engine,
                StatusCode::LENGTH_REQUIRED,
                b"request body requires Content-Length\r\n",
            )
            .await?;
            return Ok(ClientDisposition::Close);
        }
    };
    if body_len > engine.settings.max_request_body_size {
        respond(
            reader.get_mut(),
            engine,
            StatusCode::PAYLOAD_TOO_LARGE,
            b"request body exceeds configured limit\r\n",
        )
        .await?;
        return Ok(ClientDisposition::Close);
    }
    let body = read_request_body(reader, body_len, engine).await?;
    let client_close = wants_close(&head.headers);

    match engine.route(&host) {
        None => {
            debug!(peer = %peer, host, "request for unknown host");
            respond(
                reader.get_mut(),
                engine,
                StatusCode::NOT_FOUND,
                b"not found\r\n",
            )
            .await?;
            Ok(ClientDisposition::Close)
        }
        Some(HostRoute::Admin) => {
            admin::handle(engine, &head, &target, reader.get_mut()).await?;
            Ok(ClientDisposition::Close)
        }
        Some(HostRoute::Cache(class)) => {
            cache_request(reader, engine, class, head, target, host, body, client_close).await
        }
    }
}

/// Lookup → replay or forward + capture, with the elapsed-time log line.
#[allow(clippy::too_many_arguments)]
async fn cache_request<S>(
    reader: &mut BufReader<S>,
    engine: &Engine,
    class: HostClass,
    head: RequestHead,
    target: RequestTarget,
    host: String,
    body: Vec<u8>,
    client_close: bool,
) -> Result<ClientDisposition>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    engine.counters.record_request(class);
    let cache_key = key::derive(
        &head.method,
        &host,
        &target.path,
        target.query.as_deref(),
        engine.settings.query_mode(),
    );

    let start = Instant::now();
    let entry = engine.store.get(cache_key.shard, &cache_key.digest).await;
    let served_from_cache = entry.is_some();

    let disposition = match entry {
        Some(entry) => {
            replay(reader.get_mut(), engine, class, &head, entry, client_close).await?
        }
        None => {
            upstream::forward_and_capture(
                reader.get_mut(),
                upstream::ForwardRequest {
                    engine,
                    class,
                    method: &head.method,
                    req_headers: &head.headers,
                    host: &host,
                    path: &target.path,
                    query: target.query.as_deref(),
                    key: &cache_key,
                    body,
                    client_close,
                },
            )
            .await?
        }
    };

    if engine.settings.response_time_logging_enabled {
        logging::log_response_time(&host, &target.path, served_from_cache, start.elapsed());
    }
    Ok(disposition)
}

/// Serves a cached entry: mirrored `Cache-Control`/`ETag`/`Content-Type`,
/// `Age`, the `x-proxy: HIT` marker, and optional gzip re-compression for
/// non-image hosts.
async fn replay<W>(
    writer: &mut W,
    engine: &Engine,
    class: HostClass,
    head: &RequestHead,
    entry: CacheEntry,
    client_close: bool,
) -> Result<ClientDisposition>
where
    W: AsyncWrite + Unpin,
{
    let mut body = entry.body;
    let mut headers = HeaderMap::new();
    for name in [header::CACHE_CONTROL, header::ETAG, header::CONTENT_TYPE] {
        if let Some(value) = entry.meta.headers.get(&name) {
            headers.insert(name, value.clone());
        }
    }

    if engine.settings.gzip_enabled
        && class != HostClass::Image
        && codec::header_contains(&head.headers, header::ACCEPT_ENCODING, "gzip")
    {
        match compress::gzip(&body) {
            Ok(compressed) => {
                body = compressed;
                headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
            }
            Err(err) => {
                // Fall back to the raw body with no Content-Encoding.
                warn!(url = %entry.meta.url, error = %err, "gzip re-compression failed");
            }
        }
    }

    let age = entry.meta.age(SystemTime::now());
    headers.insert(
        header::AGE,
        HeaderValue::from_str(&age.to_string()).context("formatting Age header")?,
    );
    headers.insert(HeaderName::from_static("x-proxy"), HeaderValue::from_static("HIT"));
    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&body.len().to_string()).context("formatting Content-Length")?,
    );

    let connection = if client_close { "close" } else { "keep-alive" };
    let encoded = codec::encode_response_head(StatusCode::OK, "", &headers, connection);
    let io_timeout = engine.settings.client_timeout();
    codec::write_all_timed(writer, &encoded, io_timeout, "writing cached response head").await?;
    if head.method != Method::HEAD && !body.is_empty() {
        codec::write_all_timed(writer, &body, io_timeout, "writing cached response body").await?;
    }

    engine.counters.record_hit(class);
    Ok(if client_close {
        ClientDisposition::Close
    } else {
        ClientDisposition::Continue
    })
}

pub fn parse_target(target: &str) -> RequestTarget {
    let (host_from_url, path_and_query) = match target.strip_prefix("http://") {
        Some(rest) => match rest.find('/') {
            Some(idx) => (Some(rest[..idx].to_string()), &rest[idx..]),
            None => (Some(rest.to_string()), "/"),
        },
        None => (None, target),
    };
    let (path, query) = match path_and_query.split_once('?') {
        Some((path, query)) => (path.to_string(), Some(query.to_string())),
        None => (path_and_query.to_string(), None),
    };
    RequestTarget {
        host_from_url,
        path,
        query,
    }
}

fn wants_close(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(|value| value.to_ascii_lowercase().contains("close"))
}

async fn read_request_body<S>(
    reader: &mut BufReader<S>,
    length: u64,
    engine: &Engine,
) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    if length == 0 {
        return Ok(Vec::new());
    }
    let mut body = vec![0u8; usize::try_from(length).context("request body too large")?];
    timeout(engine.settings.client_timeout(), reader.read_exact(&mut body))
        .await
        .map_err(|_| anyhow!("timed out reading request body"))?
        .context("failed reading request body")?;
    Ok(body)
}

async fn respond<W>(
    writer: &mut W,
    engine: &Engine,
    status: StatusCode,
    body: &[u8],
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let response = codec::simple_response(status, body);
    codec::write_all_timed(
        writer,
        &response,
        engine.settings.client_timeout(),
        "writing error response",
    )
    .await
}
