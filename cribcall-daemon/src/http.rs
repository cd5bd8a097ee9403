//! Minimal HTTPS request/response server for the side-channel API
//!
//! One JSON request per connection over mutual-capable TLS: client
//! certificates are requested but optional, so not-yet-paired remotes can
//! reach the pairing endpoints while the subscribe endpoints demand the
//! peer-certificate fingerprint. Handlers receive that fingerprint from
//! the TLS layer — caller identity is never read from the request body.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cribcall_protocol::{tls, Identity, ProtocolError, Result};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

/// Per-request time budget (headers through response write).
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Header-section cap; bodies are capped separately.
const MAX_HEADER_BYTES: usize = 16 * 1024;

/// Body cap for API requests.
const MAX_BODY_BYTES: usize = 256 * 1024;

/// A parsed API request.
#[derive(Debug)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub body: Vec<u8>,
    /// Fingerprint of the TLS client certificate, when one was presented.
    pub peer_fingerprint: Option<String>,
}

impl HttpRequest {
    pub fn json_body(&self) -> Result<Value> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// A JSON response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Value,
}

impl HttpResponse {
    pub fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: 400,
            body: json!({ "error": message.into() }),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            status: 401,
            body: json!({ "error": message.into() }),
        }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self {
            status: 403,
            body: json!({ "error": message.into() }),
        }
    }

    pub fn not_found() -> Self {
        Self {
            status: 404,
            body: json!({ "error": "not found" }),
        }
    }

    fn status_text(&self) -> &'static str {
        match self.status {
            200 => "OK",
            400 => "Bad Request",
            401 => "Unauthorized",
            403 => "Forbidden",
            404 => "Not Found",
            _ => "Internal Server Error",
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        let body = self.body.to_string();
        let head = format!(
            "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            self.status,
            self.status_text(),
            body.len()
        );
        let mut bytes = head.into_bytes();
        bytes.extend_from_slice(body.as_bytes());
        bytes
    }
}

/// Route handler for the API server.
#[async_trait]
pub trait HttpHandler: Send + Sync {
    async fn handle(&self, request: HttpRequest) -> HttpResponse;
}

/// TLS-terminating single-shot HTTP server.
pub struct HttpServer {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    local_addr: SocketAddr,
}

impl HttpServer {
    pub async fn bind(identity: &Identity, addr: SocketAddr) -> Result<Self> {
        // Client certificates requested but not required: pairing
        // endpoints serve anonymous remotes.
        let tls_config = tls::server_tls_config(identity, false, None)?;
        let acceptor = TlsAcceptor::from(Arc::new(tls_config));
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "api server bound");
        Ok(Self {
            listener,
            acceptor,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept loop; runs until the task is dropped.
    pub async fn run(self, handler: Arc<dyn HttpHandler>) {
        loop {
            match self.listener.accept().await {
                Ok((stream, remote)) => {
                    let acceptor = self.acceptor.clone();
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        if let Err(e) =
                            timeout(REQUEST_TIMEOUT, serve_connection(stream, acceptor, handler))
                                .await
                                .unwrap_or_else(|_| {
                                    Err(ProtocolError::Timeout("api request".to_string()))
                                })
                        {
                            debug!(remote = %remote, "api request failed: {e}");
                        }
                    });
                }
                Err(e) => {
                    error!("api accept error: {e}");
                }
            }
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    acceptor: TlsAcceptor,
    handler: Arc<dyn HttpHandler>,
) -> Result<()> {
    let mut tls = acceptor.accept(stream).await.map_err(|e| {
        ProtocolError::Handshake(format!("api TLS handshake: {e}"))
    })?;

    let peer_fingerprint = {
        let (_, session) = tls.get_ref();
        session.peer_certificates().and_then(tls::peer_fingerprint)
    };

    let request = read_request(&mut tls, peer_fingerprint).await?;
    debug!(method = %request.method, path = %request.path, "api request");

    let response = handler.handle(request).await;
    tls.write_all(&response.to_bytes()).await?;
    tls.shutdown().await?;
    Ok(())
}

async fn read_request(
    stream: &mut TlsStream<TcpStream>,
    peer_fingerprint: Option<String>,
) -> Result<HttpRequest> {
    let mut buf: Vec<u8> = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    let header_end = loop {
        if let Some(pos) = find_header_end(&buf) {
            break pos;
        }
        if buf.len() > MAX_HEADER_BYTES {
            return Err(ProtocolError::ProtocolViolation(
                "request header section too large".to_string(),
            ));
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(ProtocolError::Closed(
                "connection closed mid-request".to_string(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let header_text = std::str::from_utf8(&buf[..header_end])
        .map_err(|_| ProtocolError::ProtocolViolation("non-UTF-8 request header".to_string()))?;
    let mut lines = header_text.split("\r\n");
    let request_line = lines
        .next()
        .ok_or_else(|| ProtocolError::ProtocolViolation("empty request".to_string()))?;
    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| ProtocolError::ProtocolViolation("missing method".to_string()))?
        .to_uppercase();
    let path = parts
        .next()
        .ok_or_else(|| ProtocolError::ProtocolViolation("missing path".to_string()))?
        .to_string();

    let mut content_length = 0usize;
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().map_err(|_| {
                    ProtocolError::ProtocolViolation("bad content-length".to_string())
                })?;
            }
        }
    }
    if content_length > MAX_BODY_BYTES {
        return Err(ProtocolError::ProtocolViolation(format!(
            "body too large: {content_length} bytes"
        )));
    }

    let mut body = buf[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(ProtocolError::Closed(
                "connection closed mid-body".to_string(),
            ));
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);

    Ok(HttpRequest {
        method,
        path,
        body,
        peer_fingerprint,
    })
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_bytes_are_well_formed() {
        let response = HttpResponse::ok(json!({ "status": "ok" }));
        let bytes = response.to_bytes();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Type: application/json"));
        assert!(text.ends_with(r#"{"status":"ok"}"#));
    }

    #[test]
    fn header_end_detection() {
        assert_eq!(find_header_end(b"GET / HTTP/1.1\r\n\r\nbody"), Some(14));
        assert_eq!(find_header_end(b"GET / HTTP/1.1\r\n"), None);
    }

    #[test]
    fn error_statuses() {
        assert_eq!(HttpResponse::bad_request("x").status, 400);
        assert_eq!(HttpResponse::unauthorized("x").status, 401);
        assert_eq!(HttpResponse::forbidden("x").status, 403);
        assert_eq!(HttpResponse::not_found().status, 404);
    }
}
