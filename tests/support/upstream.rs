use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// A canned-response origin server. Every connection reads one request head
/// and answers with the configured bytes.
pub struct TestUpstream {
    addr: SocketAddr,
    handle: JoinHandle<()>,
    hits: Arc<AtomicUsize>,
}

impl TestUpstream {
    pub async fn http_response(response: impl Into<Vec<u8>>) -> Result<Self> {
        let response = Arc::new(response.into());
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_in_loop = hits.clone();
        let handle = tokio::spawn(async move {
            loop {
                let (mut stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => break,
                };
                hits_in_loop.fetch_add(1, Ordering::SeqCst);
                let response = response.clone();
                tokio::spawn(async move {
                    let _ = handle_connection(&mut stream, &response).await;
                });
            }
        });
        Ok(Self { addr, handle, hits })
    }

    /// A 200 response with the given extra header lines (each
    /// `\r\n`-terminated) and body, framed with Content-Length.
    pub async fn http_ok(extra_headers: &str, body: impl AsRef<[u8]>) -> Result<Self> {
        let body = body.as_ref();
        let mut response = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n{extra_headers}\r\n",
            body.len()
        )
        .into_bytes();
        response.extend_from_slice(body);
        Self::http_response(response).await
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

impl Drop for TestUpstream {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn handle_connection(stream: &mut TcpStream, response: &[u8]) -> Result<()> {
    read_until_double_crlf(stream).await?;
    stream.write_all(response).await?;
    stream.shutdown().await.ok();
    Ok(())
}

async fn read_until_double_crlf(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let mut collected = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        let read = stream.read(&mut buf).await?;
        if read == 0 {
            return Ok(collected);
        }
        collected.extend_from_slice(&buf[..read]);
        if collected.windows(4).any(|window| window == b"\r\n\r\n") {
            return Ok(collected);
        }
    }
}
