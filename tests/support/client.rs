use std::net::SocketAddr;

use anyhow::{Context, Result, anyhow};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// A parsed proxy response, read until the server closes the connection.
#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(header, _)| header.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Builds a minimal request with `Connection: close` so responses are
/// close-delimited and easy to read to EOF.
pub fn request(method: &str, host: &str, path: &str, extra_headers: &str) -> String {
    format!("{method} {path} HTTP/1.1\r\nHost: {host}\r\n{extra_headers}Connection: close\r\n\r\n")
}

pub async fn get(addr: SocketAddr, host: &str, path: &str) -> Result<Response> {
    send(addr, &request("GET", host, path, "")).await
}

pub async fn get_with_headers(
    addr: SocketAddr,
    host: &str,
    path: &str,
    extra_headers: &str,
) -> Result<Response> {
    send(addr, &request("GET", host, path, extra_headers)).await
}

pub async fn send(addr: SocketAddr, raw: &str) -> Result<Response> {
    let mut stream = TcpStream::connect(addr).await.context("connect to proxy")?;
    stream.write_all(raw.as_bytes()).await?;
    let mut collected = Vec::new();
    stream.read_to_end(&mut collected).await?;
    parse_response(&collected)
}

fn parse_response(raw: &[u8]) -> Result<Response> {
    let split = raw
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .ok_or_else(|| anyhow!("response head incomplete"))?;
    let head = std::str::from_utf8(&raw[..split]).context("response head is not UTF-8")?;
    let mut body = raw[split + 4..].to_vec();

    let mut lines = head.split("\r\n");
    let status_line = lines.next().ok_or_else(|| anyhow!("missing status line"))?;
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| anyhow!("invalid status line '{status_line}'"))?;

    let mut headers = Vec::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    // Close-delimited responses may still declare a Content-Length.
    if let Some((_, value)) = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
        && let Ok(length) = value.parse::<usize>()
        && body.len() > length
    {
        body.truncate(length);
    }

    Ok(Response {
        status,
        headers,
        body,
    })
}
