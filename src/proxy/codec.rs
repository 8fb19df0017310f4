use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail, ensure};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::timeout;

const RELAY_BUF_SIZE: usize = 8 * 1024;
const MAX_CHUNK_LINE: usize = 16 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct HeadLimits {
    pub max_bytes: usize,
    pub read_timeout: Duration,
}

#[derive(Debug)]
pub struct RequestHead {
    pub method: Method,
    pub target: String,
    pub headers: HeaderMap,
}

#[derive(Debug)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub reason: String,
    pub headers: HeaderMap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    Empty,
    ContentLength(u64),
    Chunked,
    UntilClose,
}

/// Reads one HTTP/1.x request head. Returns `None` on a clean EOF before any
/// bytes arrive (the client closed an idle keep-alive connection).
pub async fn read_request_head<R>(
    reader: &mut BufReader<R>,
    limits: &HeadLimits,
) -> Result<Option<RequestHead>>
where
    R: AsyncRead + Unpin,
{
    let mut total = 0usize;
    let line = read_line_limited(reader, limits, &mut total, "reading request line").await?;
    if line.is_empty() {
        return Ok(None);
    }

    let text = std::str::from_utf8(&line).context("request line is not valid UTF-8")?;
    let text = text.trim_end_matches(['\r', '\n']);
    let mut parts = text.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| anyhow!("missing request method"))?;
    let method = Method::from_bytes(method.as_bytes())
        .with_context(|| format!("invalid request method '{method}'"))?;
    let target = parts
        .next()
        .ok_or_else(|| anyhow!("missing request target"))?
        .to_string();
    let version = parts
        .next()
        .ok_or_else(|| anyhow!("missing HTTP version"))?;
    ensure!(
        version.starts_with("HTTP/1."),
        "unsupported HTTP version '{version}'"
    );

    let headers = read_headers(reader, limits, &mut total).await?;
    Ok(Some(RequestHead {
        method,
        target,
        headers,
    }))
}

pub async fn read_response_head<R>(
    reader: &mut BufReader<R>,
    limits: &HeadLimits,
) -> Result<ResponseHead>
where
    R: AsyncRead + Unpin,
{
    let mut total = 0usize;
    let line = read_line_limited(reader, limits, &mut total, "reading response status line").await?;
    ensure!(!line.is_empty(), "upstream closed before sending a response");

    let text = std::str::from_utf8(&line).context("status line is not valid UTF-8")?;
    let text = text.trim_end_matches(['\r', '\n']);
    let mut parts = text.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    ensure!(
        version.starts_with("HTTP/1."),
        "unsupported upstream HTTP version '{version}'"
    );
    let code = parts
        .next()
        .ok_or_else(|| anyhow!("missing status code in '{text}'"))?;
    let status = code
        .parse::<u16>()
        .ok()
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(|| anyhow!("invalid status code '{code}'"))?;
    let reason = parts.next().unwrap_or_default().to_string();

    let headers = read_headers(reader, limits, &mut total).await?;
    Ok(ResponseHead {
        status,
        reason,
        headers,
    })
}

async fn read_headers<R>(
    reader: &mut BufReader<R>,
    limits: &HeadLimits,
    total: &mut usize,
) -> Result<HeaderMap>
where
    R: AsyncRead + Unpin,
{
    let mut headers = HeaderMap::new();
    loop {
        let line = read_line_limited(reader, limits, total, "reading header line").await?;
        ensure!(!line.is_empty(), "connection closed inside header block");
        if line == b"\r\n" || line == b"\n" {
            return Ok(headers);
        }
        let text = std::str::from_utf8(&line).context("header line is not valid UTF-8")?;
        let text = text.trim_end_matches(['\r', '\n']);
        let (name, value) = text
            .split_once(':')
            .ok_or_else(|| anyhow!("malformed header line '{text}'"))?;
        let name = HeaderName::try_from(name.trim())
            .with_context(|| format!("invalid header name in '{text}'"))?;
        let value = HeaderValue::from_str(value.trim())
            .with_context(|| format!("invalid header value in '{text}'"))?;
        headers.append(name, value);
    }
}

/// Reads one `\n`-terminated line, enforcing a shared byte limit and a read
/// timeout. Returns the raw bytes including the terminator; empty only at EOF
/// before any byte of the line arrived.
async fn read_line_limited<R>(
    reader: &mut BufReader<R>,
    limits: &HeadLimits,
    total: &mut usize,
    context: &str,
) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    use tokio::io::AsyncBufReadExt;

    let mut collected = Vec::new();
    loop {
        let available = timeout(limits.read_timeout, reader.fill_buf())
            .await
            .map_err(|_| anyhow!("timed out {context}"))?
            .with_context(|| format!("failed while {context}"))?;
        if available.is_empty() {
            if collected.is_empty() {
                return Ok(collected);
            }
            bail!("connection closed while {context}");
        }

        let newline = available.iter().position(|byte| *byte == b'\n');
        let consume = newline.map(|idx| idx + 1).unwrap_or(available.len());
        ensure!(
            *total + collected.len() + consume <= limits.max_bytes,
            "request head exceeded {} bytes while {context}",
            limits.max_bytes
        );

        collected.extend_from_slice(&available[..consume]);
        reader.consume(consume);

        if newline.is_some() {
            *total += collected.len();
            return Ok(collected);
        }
    }
}

/// Body length declared by a request. Chunked request bodies are not
/// accepted; the caller answers 411.
pub fn request_body_length(headers: &HeaderMap) -> Result<u64> {
    if headers.contains_key(header::TRANSFER_ENCODING) {
        bail!("chunked request bodies are not supported");
    }
    match headers.get(header::CONTENT_LENGTH) {
        Some(value) => value
            .to_str()
            .ok()
            .and_then(|text| text.trim().parse::<u64>().ok())
            .ok_or_else(|| anyhow!("invalid Content-Length header")),
        None => Ok(0),
    }
}

pub fn response_framing(
    request_was_head: bool,
    status: StatusCode,
    headers: &HeaderMap,
) -> BodyFraming {
    if request_was_head
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
    {
        return BodyFraming::Empty;
    }
    if header_contains(headers, header::TRANSFER_ENCODING, "chunked") {
        return BodyFraming::Chunked;
    }
    if let Some(value) = headers.get(header::CONTENT_LENGTH)
        && let Some(length) = value.to_str().ok().and_then(|text| text.trim().parse().ok())
    {
        return if length == 0 {
            BodyFraming::Empty
        } else {
            BodyFraming::ContentLength(length)
        };
    }
    BodyFraming::UntilClose
}

pub fn header_contains(headers: &HeaderMap, name: header::HeaderName, needle: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(|value| value.contains(needle))
}

/// Accumulates the decoded body bytes of a relayed response, up to a cap.
/// Overflow abandons the copy without disturbing the relay itself.
#[derive(Debug)]
pub struct CaptureBuffer {
    buf: Vec<u8>,
    cap: usize,
    enabled: bool,
    overflowed: bool,
}

impl CaptureBuffer {
    pub fn new(enabled: bool, cap: u64) -> Self {
        Self {
            buf: Vec::new(),
            cap: usize::try_from(cap).unwrap_or(usize::MAX),
            enabled,
            overflowed: false,
        }
    }

    pub fn disabled() -> Self {
        Self::new(false, 0)
    }

    fn push(&mut self, data: &[u8]) {
        if !self.enabled || self.overflowed {
            return;
        }
        if self.buf.len() + data.len() > self.cap {
            self.overflowed = true;
            self.buf = Vec::new();
            return;
        }
        self.buf.extend_from_slice(data);
    }

    pub fn overflowed(&self) -> bool {
        self.enabled && self.overflowed
    }

    pub fn into_body(self) -> Option<Vec<u8>> {
        if self.enabled && !self.overflowed {
            Some(self.buf)
        } else {
            None
        }
    }
}

/// Copies a response body from `reader` to `writer`, forwarding the raw wire
/// bytes untouched while feeding the decoded payload into `capture`.
pub async fn relay_body<R, W>(
    reader: &mut BufReader<R>,
    writer: &mut W,
    framing: BodyFraming,
    capture: &mut CaptureBuffer,
    io_timeout: Duration,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match framing {
        BodyFraming::Empty => Ok(()),
        BodyFraming::ContentLength(length) => {
            relay_exact(reader, writer, length, capture, io_timeout).await
        }
        BodyFraming::Chunked => relay_chunked(reader, writer, capture, io_timeout).await,
        BodyFraming::UntilClose => relay_until_close(reader, writer, capture, io_timeout).await,
    }
}

async fn relay_exact<R, W>(
    reader: &mut BufReader<R>,
    writer: &mut W,
    length: u64,
    capture: &mut CaptureBuffer,
    io_timeout: Duration,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; RELAY_BUF_SIZE];
    let mut remaining = length;
    while remaining > 0 {
        let want = buf.len().min(usize::try_from(remaining).unwrap_or(buf.len()));
        let read = timeout(io_timeout, reader.read(&mut buf[..want]))
            .await
            .map_err(|_| anyhow!("timed out reading response body"))?
            .context("failed reading response body")?;
        ensure!(read > 0, "upstream closed mid-body");
        write_all_timed(writer, &buf[..read], io_timeout, "relaying response body").await?;
        capture.push(&buf[..read]);
        remaining -= read as u64;
    }
    Ok(())
}

async fn relay_chunked<R, W>(
    reader: &mut BufReader<R>,
    writer: &mut W,
    capture: &mut CaptureBuffer,
    io_timeout: Duration,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let line = read_chunk_line(reader, io_timeout).await?;
        write_all_timed(writer, &line, io_timeout, "relaying chunk size line").await?;
        let size = parse_chunk_size(&line)?;
        if size == 0 {
            // Trailer section, terminated by an empty line.
            loop {
                let line = read_chunk_line(reader, io_timeout).await?;
                write_all_timed(writer, &line, io_timeout, "relaying chunk trailer").await?;
                if line == b"\r\n" || line == b"\n" {
                    return Ok(());
                }
            }
        }

        let mut buf = [0u8; RELAY_BUF_SIZE];
        let mut remaining = size;
        while remaining > 0 {
            let want = buf.len().min(usize::try_from(remaining).unwrap_or(buf.len()));
            let read = timeout(io_timeout, reader.read(&mut buf[..want]))
                .await
                .map_err(|_| anyhow!("timed out reading chunk data"))?
                .context("failed reading chunk data")?;
            ensure!(read > 0, "upstream closed mid-chunk");
            write_all_timed(writer, &buf[..read], io_timeout, "relaying chunk data").await?;
            capture.push(&buf[..read]);
            remaining -= read as u64;
        }

        let mut terminator = [0u8; 2];
        timeout(io_timeout, reader.read_exact(&mut terminator))
            .await
            .map_err(|_| anyhow!("timed out reading chunk terminator"))?
            .context("failed reading chunk terminator")?;
        ensure!(terminator == *b"\r\n", "malformed chunk terminator");
        write_all_timed(writer, &terminator, io_timeout, "relaying chunk terminator").await?;
    }
}

async fn relay_until_close<R, W>(
    reader: &mut BufReader<R>,
    writer: &mut W,
    capture: &mut CaptureBuffer,
    io_timeout: Duration,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; RELAY_BUF_SIZE];
    loop {
        let read = timeout(io_timeout, reader.read(&mut buf))
            .await
            .map_err(|_| anyhow!("timed out reading response body"))?
            .context("failed reading response body")?;
        if read == 0 {
            return Ok(());
        }
        write_all_timed(writer, &buf[..read], io_timeout, "relaying response body").await?;
        capture.push(&buf[..read]);
    }
}

async fn read_chunk_line<R>(reader: &mut BufReader<R>, io_timeout: Duration) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    use tokio::io::AsyncBufReadExt;

    let mut line = Vec::new();
    let mut limited = (&mut *reader).take(MAX_CHUNK_LINE as u64);
    let read = timeout(io_timeout, limited.read_until(b'\n', &mut line))
        .await
        .map_err(|_| anyhow!("timed out reading chunk line"))?
        .context("failed reading chunk line")?;
    ensure!(read > 0, "upstream closed inside chunked body");
    ensure!(line.ends_with(b"\n"), "truncated or oversized chunk line");
    Ok(line)
}

fn parse_chunk_size(line: &[u8]) -> Result<u64> {
    let text = std::str::from_utf8(line).context("chunk size line is not valid UTF-8")?;
    let text = text.trim_end_matches(['\r', '\n']);
    let size = text.split(';').next().unwrap_or_default().trim();
    u64::from_str_radix(size, 16).with_context(|| format!("invalid chunk size '{size}'"))
}

/// Serialises a response head, replacing any hop-by-hop connection headers
/// with our own `Connection` directive. Framing headers pass through
/// untouched because the body bytes are relayed verbatim.
pub fn encode_response_head(
    status: StatusCode,
    reason: &str,
    headers: &HeaderMap,
    connection: &str,
) -> Vec<u8> {
    let reason = if reason.is_empty() {
        status.canonical_reason().unwrap_or("Unknown")
    } else {
        reason
    };
    let mut head = format!("HTTP/1.1 {} {}\r\n", status.as_u16(), reason).into_bytes();
    for (name, value) in headers.iter() {
        if name == header::CONNECTION || name.as_str() == "keep-alive" {
            continue;
        }
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"Connection: ");
    head.extend_from_slice(connection.as_bytes());
    head.extend_from_slice(b"\r\n\r\n");
    head
}

pub fn simple_response(status: StatusCode, body: &[u8]) -> Vec<u8> {
    response_with_type(status, "text/plain; charset=utf-8", body)
}

pub fn response_with_type(status: StatusCode, content_type: &str, body: &[u8]) -> Vec<u8> {
    let header = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nContent-Type: {content_type}\r\nConnection: close\r\n\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("Unknown"),
        body.len()
    );
    let mut response = header.into_bytes();
    response.extend_from_slice(body);
    response
}

pub async fn write_all_timed<W>(
    writer: &mut W,
    bytes: &[u8],
    dur: Duration,
    context: &str,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    timeout(dur, writer.write_all(bytes))
        .await
        .map_err(|_| anyhow!("timed out {context}"))?
        .with_context(|| format!("failed while {context}"))
}
