//! Model server: minimal HTTP/1.1 `GET /v1/models/download/{id}` with byte-range support,
//! so peers can fetch and resume local models.

use std::io::{self, SeekFrom};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::library::ModelLibrary;

pub const DOWNLOAD_PREFIX: &str = "/v1/models/download/";
const MAX_HEADER_BYTES: usize = 16 * 1024;
const HEADER_TIMEOUT: Duration = Duration::from_secs(5);
const CHUNK: usize = 64 * 1024;

/// Requested byte range resolved against a file length. Ends are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteRange {
    Full,
    Partial { start: u64, end: u64 },
    Unsatisfiable,
}

/// Parse `bytes=a-b`, `bytes=a-` or `bytes=-n` against `len`. Anything else serves the full file.
pub fn parse_range(header: Option<&str>, len: u64) -> ByteRange {
    let Some(ranges) = header.and_then(|h| h.trim().strip_prefix("bytes=")) else {
        return ByteRange::Full;
    };
    if ranges.contains(',') {
        return ByteRange::Full;
    }
    let Some((a, b)) = ranges.split_once('-') else {
        return ByteRange::Full;
    };
    let (a, b) = (a.trim(), b.trim());
    if a.is_empty() {
        // suffix: last n bytes
        return match b.parse::<u64>() {
            Ok(n) if n > 0 && len > 0 => ByteRange::Partial {
                start: len.saturating_sub(n),
                end: len - 1,
            },
            Ok(_) => ByteRange::Unsatisfiable,
            Err(_) => ByteRange::Full,
        };
    }
    let Ok(start) = a.parse::<u64>() else {
        return ByteRange::Full;
    };
    if start >= len {
        return ByteRange::Unsatisfiable;
    }
    let end = if b.is_empty() {
        len - 1
    } else {
        match b.parse::<u64>() {
            Ok(e) if e >= start => e.min(len - 1),
            _ => return ByteRange::Full,
        }
    };
    ByteRange::Partial { start, end }
}

struct Request {
    method: String,
    path: String,
    range: Option<String>,
}

fn parse_request(buf: &[u8]) -> Result<Option<Request>, httparse::Error> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut req = httparse::Request::new(&mut headers);
    if req.parse(buf)?.is_partial() {
        return Ok(None);
    }
    let range = req
        .headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("Range"))
        .and_then(|h| std::str::from_utf8(h.value).ok())
        .map(str::to_string);
    Ok(Some(Request {
        method: req.method.unwrap_or_default().to_string(),
        path: req.path.unwrap_or_default().to_string(),
        range,
    }))
}

async fn read_request(stream: &mut TcpStream) -> io::Result<Option<Request>> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);
        match parse_request(&buf) {
            Ok(Some(req)) => return Ok(Some(req)),
            Ok(None) if buf.len() < MAX_HEADER_BYTES => continue,
            Ok(None) => return Err(io::Error::new(io::ErrorKind::InvalidData, "request head too large")),
            Err(e) => return Err(io::Error::new(io::ErrorKind::InvalidData, e)),
        }
    }
}

async fn respond_status(stream: &mut TcpStream, status: &str, extra: &str) -> io::Result<()> {
    let head = format!("HTTP/1.1 {status}\r\nContent-Length: 0\r\n{extra}Connection: close\r\n\r\n");
    stream.write_all(head.as_bytes()).await?;
    stream.flush().await
}

async fn handle_client(mut stream: TcpStream, library: &ModelLibrary) -> io::Result<()> {
    let req = match tokio::time::timeout(HEADER_TIMEOUT, read_request(&mut stream)).await {
        Ok(Ok(Some(r))) => r,
        Ok(Ok(None)) => return Ok(()),
        Ok(Err(e)) => {
            respond_status(&mut stream, "400 Bad Request", "").await?;
            return Err(e);
        }
        Err(_) => return Err(io::Error::new(io::ErrorKind::TimedOut, "request head timeout")),
    };
    if req.method != "GET" {
        return respond_status(&mut stream, "405 Method Not Allowed", "Allow: GET\r\n").await;
    }
    let Some(model_id) = req.path.strip_prefix(DOWNLOAD_PREFIX) else {
        return respond_status(&mut stream, "404 Not Found", "").await;
    };
    let Some((_, path)) = library.find(model_id) else {
        debug!(model_id, "requested model not present");
        return respond_status(&mut stream, "404 Not Found", "").await;
    };

    let mut file = tokio::fs::File::open(&path).await?;
    let len = file.metadata().await?.len();
    let (status, start, count, content_range) = match parse_range(req.range.as_deref(), len) {
        ByteRange::Full => ("200 OK", 0, len, String::new()),
        ByteRange::Partial { start, end } => (
            "206 Partial Content",
            start,
            end - start + 1,
            format!("Content-Range: bytes {start}-{end}/{len}\r\n"),
        ),
        ByteRange::Unsatisfiable => {
            let extra = format!("Content-Range: bytes */{len}\r\n");
            return respond_status(&mut stream, "416 Range Not Satisfiable", &extra).await;
        }
    };
    debug!(model_id, start, count, "serving model");

    let head = format!(
        "HTTP/1.1 {status}\r\nContent-Type: application/octet-stream\r\nContent-Length: {count}\r\nAccept-Ranges: bytes\r\n{content_range}Connection: close\r\n\r\n"
    );
    stream.write_all(head.as_bytes()).await?;
    file.seek(SeekFrom::Start(start)).await?;
    let mut remaining = count;
    let mut buf = vec![0u8; CHUNK];
    while remaining > 0 {
        let want = remaining.min(CHUNK as u64) as usize;
        let n = file.read(&mut buf[..want]).await?;
        if n == 0 {
            break;
        }
        stream.write_all(&buf[..n]).await?;
        remaining -= n as u64;
    }
    stream.flush().await?;
    Ok(())
}

/// Serve models until cancelled.
pub async fn serve_loop(listener: TcpListener, library: Arc<ModelLibrary>, cancel: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            r = listener.accept() => r,
        };
        match accepted {
            Ok((stream, remote)) => {
                let library = library.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        r = handle_client(stream, &library) => {
                            if let Err(e) = r {
                                debug!(%remote, error = %e, "model request failed");
                            }
                        }
                    }
                });
            }
            Err(e) => {
                warn!(error = %e, "model server accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
    debug!("model server stopped");
}
