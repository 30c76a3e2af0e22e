//! HTTP(S) transport for remote devices

use async_trait::async_trait;
use bytes::Bytes;
use eapi_shared::state_machine::{TransportEvent, TransportLifecycle, TransportState};
use reqwest::{header, Certificate, Client, Identity, Response, StatusCode};
use serde::Serialize;
use std::path::Path;
use tracing::{debug, warn};

use super::traits::{Transport, TransportError};
use super::{
    response_too_large, AuthMode, ClientCertConfig, Credentials, Endpoint, Scheme,
    TransportConfig, CONTENT_TYPE_JSON_RPC,
};

#[derive(Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

/// POSTs request bodies to the endpoint's command API URL
///
/// reqwest opens the TCP/TLS channel lazily. With [`AuthMode::Basic`] an
/// unreachable host surfaces as [`TransportError::Connect`] from the first
/// `send`; with [`AuthMode::Session`] the login on `connect` reaches it first.
pub struct HttpTransport {
    endpoint: Endpoint,
    config: TransportConfig,
    credentials: Option<Credentials>,
    client: Option<Client>,
    session_cookie: Option<String>,
    lifecycle: TransportLifecycle,
}

impl HttpTransport {
    pub fn new(endpoint: Endpoint, config: TransportConfig, credentials: Option<Credentials>) -> Self {
        Self {
            endpoint,
            config,
            credentials,
            client: None,
            session_cookie: None,
            lifecycle: TransportLifecycle::new(),
        }
    }

    async fn build_client(&self) -> Result<Client, TransportError> {
        let https = self.endpoint.scheme() == Scheme::Https;
        let client_cert = match (&self.config.client_cert, https) {
            (Some(cert), true) => Some(load_client_cert(cert).await?),
            _ => None,
        };

        let mut builder = Client::builder()
            .timeout(self.config.timeout())
            .connect_timeout(self.config.connect_timeout())
            .pool_max_idle_per_host(1)
            .user_agent(format!("eapi-client/{}", env!("CARGO_PKG_VERSION")));

        match client_cert {
            Some((identity, root)) => {
                builder = builder.identity(identity);
                if let Some(root) = root {
                    builder = builder.add_root_certificate(root);
                }
            }
            None if https && !self.config.verify_certificates => {
                builder = builder.danger_accept_invalid_certs(true);
            }
            None => {}
        }

        builder
            .build()
            .map_err(|e| TransportError::Connect(format!("failed to create HTTP client: {}", e)))
    }

    /// POST the credentials to the login URL and return the session cookie
    async fn login(&self, client: &Client, creds: &Credentials) -> Result<String, TransportError> {
        let response = client
            .post(self.endpoint.login_url())
            .json(&LoginRequest {
                username: &creds.username,
                password: &creds.password,
            })
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        if let Some(err) = unauthorized(status) {
            return Err(err);
        }
        if status != StatusCode::OK {
            return Err(TransportError::Connect(format!("login failed: HTTP {}", status)));
        }

        let cookie = response
            .headers()
            .get_all(header::SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .filter_map(|value| value.split(';').next())
            .map(str::trim)
            .filter(|pair| !pair.is_empty())
            .collect::<Vec<_>>()
            .join("; ");
        if cookie.is_empty() {
            return Err(TransportError::Connect(
                "login response carried no session cookie".into(),
            ));
        }
        Ok(cookie)
    }

    async fn exchange(&self, client: &Client, request: &[u8]) -> Result<Bytes, TransportError> {
        let mut req = client
            .post(self.endpoint.url())
            .header(header::CONTENT_TYPE, CONTENT_TYPE_JSON_RPC)
            .body(request.to_vec());
        if let Some(cookie) = &self.session_cookie {
            req = req.header(header::COOKIE, cookie.as_str());
        } else if let Some(creds) = &self.credentials {
            req = req.basic_auth(&creds.username, Some(&creds.password));
        }

        let response = req.send().await.map_err(|e| self.classify(e))?;

        let status = response.status();
        if let Some(err) = unauthorized(status) {
            return Err(err);
        }
        if !status.is_success() {
            return Err(TransportError::Io(format!("HTTP {}", status)));
        }

        self.read_body(response).await
    }

    /// Buffer the body, failing as soon as it passes the size limit
    async fn read_body(&self, mut response: Response) -> Result<Bytes, TransportError> {
        let limit = self.config.max_response_bytes;
        if let Some(len) = response.content_length() {
            let len = usize::try_from(len).unwrap_or(usize::MAX);
            if len > limit {
                return Err(response_too_large(len, limit));
            }
        }

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(|e| self.classify(e))? {
            let total = body.len().saturating_add(chunk.len());
            if total > limit {
                return Err(response_too_large(total, limit));
            }
            body.extend_from_slice(&chunk);
        }
        Ok(Bytes::from(body))
    }

    fn classify(&self, err: reqwest::Error) -> TransportError {
        if err.is_timeout() {
            TransportError::Timeout(self.config.timeout())
        } else if err.is_connect() {
            TransportError::Connect(err.to_string())
        } else {
            TransportError::Io(err.to_string())
        }
    }
}

fn unauthorized(status: StatusCode) -> Option<TransportError> {
    (status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN).then(|| {
        TransportError::Unauthorized {
            status: status.as_u16(),
            reason: status.canonical_reason().unwrap_or("Unauthorized").into(),
        }
    })
}

async fn read_pem(path: &Path, what: &str) -> Result<Vec<u8>, TransportError> {
    tokio::fs::read(path).await.map_err(|e| {
        TransportError::Connect(format!("failed to read {} {}: {}", what, path.display(), e))
    })
}

/// Client identity (certificate chain plus key) and the optional extra trust root
async fn load_client_cert(
    cert: &ClientCertConfig,
) -> Result<(Identity, Option<Certificate>), TransportError> {
    let mut pem = read_pem(&cert.cert_file, "client certificate").await?;
    pem.push(b'\n');
    pem.extend(read_pem(&cert.key_file, "client key").await?);
    let identity = Identity::from_pem(&pem)
        .map_err(|e| TransportError::Connect(format!("invalid client certificate: {}", e)))?;

    let root = match &cert.ca_file {
        Some(ca_file) => {
            let pem = read_pem(ca_file, "CA certificate").await?;
            let root = Certificate::from_pem(&pem)
                .map_err(|e| TransportError::Connect(format!("invalid CA certificate: {}", e)))?;
            Some(root)
        }
        None => None,
    };
    Ok((identity, root))
}

#[async_trait]
impl Transport for HttpTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        if self.lifecycle.state() == TransportState::Closed {
            return Err(TransportError::NotConnected);
        }
        let client = self.build_client().await?;

        if self.config.auth == AuthMode::Session {
            if let Some(creds) = &self.credentials {
                let cookie = self.login(&client, creds).await?;
                debug!(endpoint = %self.endpoint, user = %creds.username, "Session established");
                self.session_cookie = Some(cookie);
            }
        }

        self.client = Some(client);
        self.lifecycle.process_event(TransportEvent::Connect);
        debug!(endpoint = %self.endpoint, "HTTP client ready");
        Ok(())
    }

    async fn send(&mut self, request: &[u8]) -> Result<Bytes, TransportError> {
        let client = match (&self.client, self.lifecycle.can_send()) {
            (Some(client), true) => client.clone(),
            _ => return Err(TransportError::NotConnected),
        };

        match self.exchange(&client, request).await {
            Ok(body) => Ok(body),
            Err(e) => {
                // A refused basic-auth login says nothing about the channel itself,
                // but a refused session cookie means the session is gone
                let unauthorized = matches!(e, TransportError::Unauthorized { .. });
                if !unauthorized || self.session_cookie.is_some() {
                    warn!(endpoint = %self.endpoint, error = %e, "HTTP exchange failed");
                    self.lifecycle.process_event(TransportEvent::Fault);
                    self.client = None;
                    self.session_cookie = None;
                }
                Err(e)
            }
        }
    }

    async fn close(&mut self) {
        self.client = None;
        self.session_cookie = None;
        self.lifecycle.process_event(TransportEvent::Close);
    }

    fn state(&self) -> TransportState {
        self.lifecycle.state()
    }

    fn name(&self) -> &'static str {
        match self.endpoint.scheme() {
            Scheme::Https => "HTTPS",
            _ => "HTTP",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    /// Read one request: headers, then as much body as Content-Length announces
    async fn read_request(stream: &mut TcpStream) -> String {
        let mut buf = vec![0u8; 8192];
        let mut request = Vec::new();
        loop {
            let n = stream.read(&mut buf).await.unwrap();
            request.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&request);
            if let Some(split) = text.find("\r\n\r\n") {
                let len = text
                    .lines()
                    .map(|l| l.to_ascii_lowercase())
                    .find_map(|l| {
                        l.strip_prefix("content-length:")
                            .map(|v| v.trim().parse::<usize>().unwrap())
                    })
                    .unwrap_or(0);
                if request.len() >= split + 4 + len {
                    break;
                }
            }
            if n == 0 {
                break;
            }
        }
        String::from_utf8_lossy(&request).into_owned()
    }

    /// Answer one connection per canned response and hand back the raw requests
    async fn serve(responses: Vec<String>) -> (u16, tokio::task::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let mut requests = Vec::new();
            for response in responses {
                let (mut stream, _) = listener.accept().await.unwrap();
                requests.push(read_request(&mut stream).await);
                stream.write_all(response.as_bytes()).await.unwrap();
                stream.shutdown().await.unwrap();
            }
            requests
        });
        (port, handle)
    }

    async fn serve_once(response: &str) -> (u16, tokio::task::JoinHandle<String>) {
        let (port, server) = serve(vec![response.to_string()]).await;
        (port, tokio::spawn(async move { server.await.unwrap().remove(0) }))
    }

    fn transport(port: u16, credentials: Option<Credentials>) -> HttpTransport {
        transport_with(port, credentials, TransportConfig::default())
    }

    fn transport_with(port: u16, credentials: Option<Credentials>, config: TransportConfig) -> HttpTransport {
        HttpTransport::new(Endpoint::http("127.0.0.1").with_port(port), config, credentials)
    }

    fn session_config() -> TransportConfig {
        TransportConfig {
            auth: AuthMode::Session,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_send_posts_json_rpc_with_basic_auth() {
        let (port, server) = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 2\r\nConnection: close\r\n\r\n{}",
        )
        .await;

        let mut transport = transport(port, Some(Credentials::new("admin", "admin")));
        transport.connect().await.unwrap();
        assert_eq!(transport.state(), TransportState::Connected);

        let body = transport.send(br#"{"id":"1"}"#).await.unwrap();
        assert_eq!(&body[..], b"{}");

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /command-api HTTP/1.1"));
        assert!(request.to_ascii_lowercase().contains("content-type: application/json-rpc"));
        // base64("admin:admin")
        assert!(request.contains("YWRtaW46YWRtaW4="));
        assert!(request.ends_with(r#"{"id":"1"}"#));
    }

    #[tokio::test]
    async fn test_unauthorized_keeps_transport_connected() {
        let (port, _server) = serve_once(
            "HTTP/1.1 401 Unauthorized\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;

        let mut transport = transport(port, None);
        transport.connect().await.unwrap();
        let result = transport.send(b"{}").await;
        assert!(matches!(result, Err(TransportError::Unauthorized { status: 401, .. })));
        assert_eq!(transport.state(), TransportState::Connected);
    }

    #[tokio::test]
    async fn test_refused_connection_closes_transport() {
        // Bind then drop to find a port nobody listens on
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let mut transport = transport(port, None);
        transport.connect().await.unwrap();
        let result = transport.send(b"{}").await;
        assert!(matches!(result, Err(TransportError::Connect(_))));
        assert_eq!(transport.state(), TransportState::Closed);

        // Closed is terminal
        assert!(matches!(transport.send(b"{}").await, Err(TransportError::NotConnected)));
    }

    #[tokio::test]
    async fn test_send_before_connect() {
        let mut transport = transport(80, None);
        assert!(matches!(transport.send(b"{}").await, Err(TransportError::NotConnected)));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let mut transport = transport(80, None);
        transport.connect().await.unwrap();
        transport.close().await;
        transport.close().await;
        assert_eq!(transport.state(), TransportState::Closed);
    }

    #[tokio::test]
    async fn test_chunked_body_over_limit_is_rejected() {
        let chunk = "a".repeat(600);
        let (port, _server) = serve_once(&format!(
            "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n258\r\n{chunk}\r\n258\r\n{chunk}\r\n0\r\n\r\n"
        ))
        .await;

        let config = TransportConfig {
            max_response_bytes: 1_000,
            ..Default::default()
        };
        let mut transport = transport_with(port, None, config);
        transport.connect().await.unwrap();

        let result = transport.send(b"{}").await;
        assert!(matches!(result, Err(TransportError::Io(msg)) if msg.contains("exceeds")));
        assert_eq!(transport.state(), TransportState::Closed);
    }

    #[tokio::test]
    async fn test_content_length_over_limit_is_rejected() {
        let (port, _server) = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Length: 11\r\nConnection: close\r\n\r\n{\"id\":\"1\"}\n",
        )
        .await;

        let config = TransportConfig {
            max_response_bytes: 10,
            ..Default::default()
        };
        let mut transport = transport_with(port, None, config);
        transport.connect().await.unwrap();
        assert!(matches!(transport.send(b"{}").await, Err(TransportError::Io(_))));
    }

    #[tokio::test]
    async fn test_session_login_sends_cookie() {
        let (port, server) = serve(vec![
            "HTTP/1.1 200 OK\r\nSet-Cookie: Session=abc123; Path=/; HttpOnly\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".into(),
            "HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\n{}".into(),
        ])
        .await;

        let mut transport = transport_with(port, Some(Credentials::new("admin", "admin")), session_config());
        transport.connect().await.unwrap();
        assert_eq!(transport.state(), TransportState::Connected);

        let body = transport.send(br#"{"id":"1"}"#).await.unwrap();
        assert_eq!(&body[..], b"{}");

        let requests = server.await.unwrap();
        assert!(requests[0].starts_with("POST /login HTTP/1.1"));
        assert!(requests[0].contains(r#""username":"admin""#));
        assert!(requests[0].contains(r#""password":"admin""#));

        let call = requests[1].to_ascii_lowercase();
        assert!(call.starts_with("post /command-api http/1.1"));
        assert!(call.contains("cookie: session=abc123"));
        assert!(!call.contains("authorization:"));
    }

    #[tokio::test]
    async fn test_expired_session_closes_transport() {
        let (port, _server) = serve(vec![
            "HTTP/1.1 200 OK\r\nSet-Cookie: Session=abc123\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".into(),
            "HTTP/1.1 401 Unauthorized\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".into(),
        ])
        .await;

        let mut transport = transport_with(port, Some(Credentials::new("admin", "admin")), session_config());
        transport.connect().await.unwrap();
        assert!(matches!(
            transport.send(b"{}").await,
            Err(TransportError::Unauthorized { status: 401, .. })
        ));
        assert_eq!(transport.state(), TransportState::Closed);
    }

    #[tokio::test]
    async fn test_session_login_rejected() {
        let (port, _server) = serve_once(
            "HTTP/1.1 401 Unauthorized\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;

        let mut transport = transport_with(port, Some(Credentials::new("admin", "wrong")), session_config());
        assert!(matches!(
            transport.connect().await,
            Err(TransportError::Unauthorized { status: 401, .. })
        ));
        assert_eq!(transport.state(), TransportState::Unconnected);
    }

    #[tokio::test]
    async fn test_session_login_without_cookie_fails() {
        let (port, _server) = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;

        let mut transport = transport_with(port, Some(Credentials::new("admin", "admin")), session_config());
        assert!(matches!(transport.connect().await, Err(TransportError::Connect(_))));
    }

    #[tokio::test]
    async fn test_session_login_reaches_host_on_connect() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let mut transport = transport_with(port, Some(Credentials::new("admin", "admin")), session_config());
        assert!(matches!(transport.connect().await, Err(TransportError::Connect(_))));
    }

    fn https_with_cert(cert: ClientCertConfig) -> HttpTransport {
        let config = TransportConfig {
            client_cert: Some(cert),
            ..Default::default()
        };
        HttpTransport::new(Endpoint::https("127.0.0.1"), config, None)
    }

    #[tokio::test]
    async fn test_missing_client_certificate_fails_connect() {
        let dir = tempfile::tempdir().unwrap();
        let mut transport = https_with_cert(ClientCertConfig {
            cert_file: dir.path().join("client.pem"),
            key_file: dir.path().join("client.key"),
            ca_file: None,
        });

        let result = transport.connect().await;
        assert!(matches!(result, Err(TransportError::Connect(msg)) if msg.contains("client certificate")));
        assert_eq!(transport.state(), TransportState::Unconnected);
    }

    #[tokio::test]
    async fn test_malformed_client_certificate_fails_connect() {
        let dir = tempfile::tempdir().unwrap();
        let write = |name: &str| -> PathBuf {
            let path = dir.path().join(name);
            std::fs::write(&path, "not a pem file").unwrap();
            path
        };
        let mut transport = https_with_cert(ClientCertConfig {
            cert_file: write("client.pem"),
            key_file: write("client.key"),
            ca_file: None,
        });

        assert!(matches!(transport.connect().await, Err(TransportError::Connect(_))));
    }
}
