//! Aggregate client configuration
//!
//! Defaults overridden by `EAPI_*` environment variables. Only the binary
//! reads the environment; library callers build a `ClientConfig` directly.

use serde::Deserialize;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use eapi_shared::defaults;

use crate::command::{CommandPipeline, ExecuteOptions, RetryPolicy};
use crate::connection::{ConnectionManager, PoolConfig};
use crate::error::{EapiError, Result};
use crate::transport::{
    AuthMode, ClientCertConfig, Credentials, DeviceTransportFactory, Endpoint, Scheme,
    TransportConfig,
};

/// Everything needed to reach one device and run commands on it
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub scheme: Scheme,
    pub host: String,
    /// Falls back to the scheme's default port
    pub port: Option<u16>,
    pub path: String,
    pub socket_path: Option<PathBuf>,
    pub credentials: Option<Credentials>,
    pub enable_secret: Option<String>,
    pub transport: TransportConfig,
    pub pool: PoolConfig,
    pub retry: RetryPolicy,
    pub options: ExecuteOptions,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            scheme: Scheme::Https,
            host: "localhost".into(),
            port: None,
            path: defaults::COMMAND_API_PATH.into(),
            socket_path: None,
            credentials: None,
            enable_secret: None,
            transport: TransportConfig::default(),
            pool: PoolConfig::default(),
            retry: RetryPolicy::default(),
            options: ExecuteOptions::default(),
        }
    }
}

impl ClientConfig {
    /// Defaults overridden by the process environment
    pub fn from_env() -> Result<Self> {
        Self::default().apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply `EAPI_*` overrides from `lookup`, then validate
    pub fn apply_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut wants_client_cert = false;
        if let Some(name) = lookup("EAPI_TRANSPORT") {
            wants_client_cert = self.apply_transport(&name)?;
        }
        if let Some(host) = lookup("EAPI_HOST") {
            self.host = host;
        }
        if let Some(port) = lookup("EAPI_PORT") {
            self.port = Some(parse_var("EAPI_PORT", &port)?);
        }
        if let Some(path) = lookup("EAPI_PATH") {
            self.path = path;
        }
        if let Some(socket) = lookup("EAPI_SOCKET_PATH") {
            self.socket_path = Some(PathBuf::from(socket));
        }
        if let Some(username) = lookup("EAPI_USERNAME") {
            let password = lookup("EAPI_PASSWORD").unwrap_or_default();
            self.credentials = Some(Credentials::new(username, password));
        }
        if let Some(secret) = lookup("EAPI_ENABLE_SECRET") {
            self.enable_secret = Some(secret);
        }
        if let Some(timeout) = lookup("EAPI_TIMEOUT_MS") {
            self.transport.timeout_ms = parse_var("EAPI_TIMEOUT_MS", &timeout)?;
        }
        if let Some(verify) = lookup("EAPI_VERIFY_CERTS") {
            self.transport.verify_certificates = parse_var("EAPI_VERIFY_CERTS", &verify)?;
        }
        match (lookup("EAPI_CERT_FILE"), lookup("EAPI_KEY_FILE")) {
            (Some(cert_file), Some(key_file)) => {
                self.transport.client_cert = Some(ClientCertConfig {
                    cert_file: PathBuf::from(cert_file),
                    key_file: PathBuf::from(key_file),
                    ca_file: lookup("EAPI_CA_FILE").map(PathBuf::from),
                });
            }
            (None, None) => {}
            _ => {
                return Err(EapiError::InvalidInput(
                    "EAPI_CERT_FILE and EAPI_KEY_FILE must be set together".into(),
                ));
            }
        }
        if wants_client_cert && self.transport.client_cert.is_none() {
            return Err(EapiError::InvalidInput(
                "https_certs requires EAPI_CERT_FILE and EAPI_KEY_FILE".into(),
            ));
        }
        if let Some(size) = lookup("EAPI_POOL_SIZE") {
            self.pool.max_connections_per_endpoint = parse_var("EAPI_POOL_SIZE", &size)?;
        }
        if let Some(attempts) = lookup("EAPI_MAX_ATTEMPTS") {
            self.retry.max_attempts = parse_var("EAPI_MAX_ATTEMPTS", &attempts)?;
        }
        if let Some(encoding) = lookup("EAPI_ENCODING") {
            self.options.encoding = encoding.parse().map_err(EapiError::InvalidInput)?;
        }
        if let Some(enable) = lookup("EAPI_SEND_ENABLE") {
            self.options.send_enable = parse_var("EAPI_SEND_ENABLE", &enable)?;
        }

        self.validate()?;
        Ok(self)
    }

    /// Select a transport by name; returns whether it needs a client certificate
    fn apply_transport(&mut self, name: &str) -> Result<bool> {
        let name = name.trim().to_ascii_lowercase();
        match name.as_str() {
            "http_local" | "https_local" => {
                let local = if name == "http_local" {
                    Endpoint::http_local()
                } else {
                    Endpoint::https_local()
                };
                self.scheme = local.scheme();
                self.host = local.host().to_string();
                self.port = Some(local.port());
            }
            "http_session" | "https_session" => {
                self.scheme = name
                    .trim_end_matches("_session")
                    .parse()
                    .map_err(EapiError::InvalidInput)?;
                self.transport.auth = AuthMode::Session;
            }
            "https_certs" => {
                self.scheme = Scheme::Https;
                return Ok(true);
            }
            other => {
                self.scheme = other.parse().map_err(|_| {
                    EapiError::InvalidInput(format!(
                        "transport must be one of [socket, http_local, https_local, http, \
                         http_session, https, https_certs, https_session], got '{}'",
                        other
                    ))
                })?;
            }
        }
        Ok(false)
    }

    pub fn validate(&self) -> Result<()> {
        if self.transport.timeout_ms == 0 {
            return Err(EapiError::InvalidInput(
                "transport timeout must be greater than 0".into(),
            ));
        }
        if self.transport.max_response_bytes == 0 {
            return Err(EapiError::InvalidInput(
                "max_response_bytes must be greater than 0".into(),
            ));
        }
        if self.scheme != Scheme::Socket && self.host.is_empty() {
            return Err(EapiError::InvalidInput("host must not be empty".into()));
        }
        self.pool.validate()?;
        self.retry.validate()?;
        self.options.validate()
    }

    pub fn endpoint(&self) -> Endpoint {
        let endpoint = match (self.scheme, &self.socket_path) {
            (Scheme::Socket, Some(socket)) => Endpoint::socket_at(socket.clone()),
            (Scheme::Socket, None) => Endpoint::socket(),
            (scheme, _) => Endpoint::new(scheme, self.host.clone()),
        };
        let endpoint = endpoint.with_path(self.path.clone());
        match self.port {
            Some(port) => endpoint.with_port(port),
            None => endpoint,
        }
    }

    /// Wire a pipeline with its own connection pool
    pub fn build_pipeline(&self) -> CommandPipeline {
        let factory = Arc::new(DeviceTransportFactory::new(
            self.transport.clone(),
            self.credentials.clone(),
        ));
        let manager = Arc::new(ConnectionManager::new(self.pool.clone(), factory));
        let pipeline = CommandPipeline::new(manager, self.retry.clone());
        match &self.enable_secret {
            Some(secret) => pipeline.with_enable_secret(secret.clone()),
            None => pipeline,
        }
    }
}

fn parse_var<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| EapiError::InvalidInput(format!("{} has invalid value '{}'", key, value)))
}
