//! Local Unix socket transport for on-box clients
//!
//! The device serves the same HTTP/1.1 command API on a Unix socket. Access
//! is governed by the socket's file permissions, so no credentials are sent.

use async_trait::async_trait;
use bytes::Bytes;
use eapi_shared::defaults;
use eapi_shared::state_machine::{TransportEvent, TransportLifecycle, TransportState};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::traits::{Transport, TransportError};
use super::{response_too_large, Endpoint, TransportConfig, CONTENT_TYPE_JSON_RPC};

/// Header lines accepted before the response is considered malformed
const MAX_HEADER_LINES: usize = 64;

/// Longest status, header or chunk-size line, terminator included
const MAX_LINE_BYTES: usize = 8 * 1024;

pub struct SocketTransport {
    endpoint: Endpoint,
    config: TransportConfig,
    stream: Option<BufReader<UnixStream>>,
    lifecycle: TransportLifecycle,
}

impl SocketTransport {
    pub fn new(endpoint: Endpoint, config: TransportConfig) -> Self {
        Self {
            endpoint,
            config,
            stream: None,
            lifecycle: TransportLifecycle::new(),
        }
    }

    fn socket_path(&self) -> PathBuf {
        self.endpoint
            .socket_path()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(defaults::UNIX_SOCKET_PATH))
    }
}

#[async_trait]
impl Transport for SocketTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        if self.lifecycle.state() == TransportState::Closed {
            return Err(TransportError::NotConnected);
        }

        let path = self.socket_path();
        let stream = match timeout(self.config.connect_timeout(), UnixStream::connect(&path)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(TransportError::Connect(format!("{}: {}", path.display(), e)));
            }
            Err(_) => {
                return Err(TransportError::Connect(format!(
                    "{}: connect timed out after {:?}",
                    path.display(),
                    self.config.connect_timeout()
                )));
            }
        };

        debug!(socket = %path.display(), "Connected to local command API");
        self.stream = Some(BufReader::new(stream));
        self.lifecycle.process_event(TransportEvent::Connect);
        Ok(())
    }

    async fn send(&mut self, request: &[u8]) -> Result<Bytes, TransportError> {
        if !self.lifecycle.can_send() {
            return Err(TransportError::NotConnected);
        }
        let Some(stream) = self.stream.as_mut() else {
            return Err(TransportError::NotConnected);
        };

        let result = match timeout(
            self.config.timeout(),
            exchange(
                stream,
                self.endpoint.path(),
                request,
                self.config.max_response_bytes,
            ),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(self.config.timeout())),
        };

        match result {
            Ok(response) => {
                if !response.keep_alive {
                    debug!(endpoint = %self.endpoint, "Server closed the connection");
                    self.close().await;
                }
                response.into_body()
            }
            Err(e) => {
                warn!(endpoint = %self.endpoint, error = %e, "Socket exchange failed");
                self.stream = None;
                self.lifecycle.process_event(TransportEvent::Fault);
                Err(e)
            }
        }
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        self.lifecycle.process_event(TransportEvent::Close);
    }

    fn state(&self) -> TransportState {
        self.lifecycle.state()
    }

    fn name(&self) -> &'static str {
        "Socket"
    }
}

/// A fully read HTTP response
#[derive(Debug)]
struct RawResponse {
    status: u16,
    reason: String,
    body: Bytes,
    keep_alive: bool,
}

impl RawResponse {
    fn into_body(self) -> Result<Bytes, TransportError> {
        match self.status {
            200..=299 => Ok(self.body),
            401 | 403 => Err(TransportError::Unauthorized {
                status: self.status,
                reason: self.reason,
            }),
            status => Err(TransportError::Io(format!("HTTP {} {}", status, self.reason))),
        }
    }
}

/// Write one POST and read back a response of at most `limit` body bytes
async fn exchange<S>(
    stream: &mut BufReader<S>,
    path: &str,
    request: &[u8],
    limit: usize,
) -> Result<RawResponse, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let head = format!(
        "POST {} HTTP/1.1\r\nHost: localhost\r\nContent-Type: {}\r\nContent-Length: {}\r\n\r\n",
        path,
        CONTENT_TYPE_JSON_RPC,
        request.len()
    );
    stream.write_all(head.as_bytes()).await.map_err(io_error)?;
    stream.write_all(request).await.map_err(io_error)?;
    stream.flush().await.map_err(io_error)?;

    let status_line = read_line(stream).await?;
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default().to_string();
    let status = parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| TransportError::Io(format!("malformed status line: {}", status_line)))?;
    let reason = parts.next().unwrap_or_default().to_string();

    let mut content_length = None;
    let mut chunked = false;
    let mut keep_alive = version == "HTTP/1.1";

    let mut header_lines = 0;
    loop {
        let line = read_line(stream).await?;
        if line.is_empty() {
            break;
        }
        header_lines += 1;
        if header_lines > MAX_HEADER_LINES {
            return Err(TransportError::Io("too many response headers".into()));
        }

        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match name.trim().to_ascii_lowercase().as_str() {
            "content-length" => {
                let len = value
                    .parse::<usize>()
                    .map_err(|_| TransportError::Io(format!("bad Content-Length: {}", value)))?;
                content_length = Some(len);
            }
            "transfer-encoding" => chunked = value.eq_ignore_ascii_case("chunked"),
            "connection" => {
                if value.eq_ignore_ascii_case("close") {
                    keep_alive = false;
                } else if value.eq_ignore_ascii_case("keep-alive") {
                    keep_alive = true;
                }
            }
            _ => {}
        }
    }

    let body = if chunked {
        read_chunked(stream, limit).await?
    } else if let Some(len) = content_length {
        if len > limit {
            return Err(response_too_large(len, limit));
        }
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).await.map_err(io_error)?;
        body
    } else {
        // No framing: the body runs to end of stream
        keep_alive = false;
        let mut body = Vec::new();
        (&mut *stream)
            .take(limit as u64 + 1)
            .read_to_end(&mut body)
            .await
            .map_err(io_error)?;
        if body.len() > limit {
            return Err(response_too_large(body.len(), limit));
        }
        body
    };

    Ok(RawResponse {
        status,
        reason,
        body: Bytes::from(body),
        keep_alive,
    })
}

async fn read_chunked<S>(stream: &mut BufReader<S>, limit: usize) -> Result<Vec<u8>, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut body = Vec::new();
    loop {
        let line = read_line(stream).await?;
        let size_field = line.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(size_field, 16)
            .map_err(|_| TransportError::Io(format!("bad chunk size: {}", line)))?;

        if size == 0 {
            // Trailers end with an empty line
            for _ in 0..=MAX_HEADER_LINES {
                if read_line(stream).await?.is_empty() {
                    return Ok(body);
                }
            }
            return Err(TransportError::Io("too many response trailers".into()));
        }
        // The size is device-supplied, so the sum may overflow
        let start = body.len();
        let Some(total) = start.checked_add(size).filter(|&total| total <= limit) else {
            return Err(response_too_large(start.saturating_add(size), limit));
        };

        body.resize(total, 0);
        stream
            .read_exact(&mut body[start..])
            .await
            .map_err(io_error)?;
        let mut crlf = [0u8; 2];
        stream.read_exact(&mut crlf).await.map_err(io_error)?;
    }
}

/// Read one CRLF-terminated line without its terminator
async fn read_line<S>(stream: &mut BufReader<S>) -> Result<String, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut line = String::new();
    let n = (&mut *stream)
        .take(MAX_LINE_BYTES as u64)
        .read_line(&mut line)
        .await
        .map_err(io_error)?;
    if n == 0 {
        return Err(TransportError::Io("connection closed mid-response".into()));
    }
    if n == MAX_LINE_BYTES && !line.ends_with('\n') {
        return Err(TransportError::Io(format!(
            "response line exceeds {} bytes",
            MAX_LINE_BYTES
        )));
    }
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

fn io_error(err: std::io::Error) -> TransportError {
    TransportError::Io(err.to_string())
}
