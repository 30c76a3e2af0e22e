pub mod endpoint;
pub mod http;
pub mod socket;
pub mod traits;

pub use endpoint::{Credentials, Endpoint, Scheme};
pub use http::HttpTransport;
pub use socket::SocketTransport;
pub use traits::{Transport, TransportError, TransportFactory};

use eapi_shared::codec::MAX_MESSAGE_SIZE;
use eapi_shared::defaults;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Content type the command API expects
pub const CONTENT_TYPE_JSON_RPC: &str = "application/json-rpc";

/// How HTTP(S) requests authenticate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    /// Credentials on every request
    #[default]
    Basic,
    /// Log in once on connect and send the session cookie afterwards
    Session,
}

/// Client certificate material for mutual TLS, as PEM files
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientCertConfig {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    /// Extra trust root for the device certificate
    pub ca_file: Option<PathBuf>,
}

/// Transport configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Bound on one full request/response exchange
    pub timeout_ms: u64,
    /// Bound on establishing the channel
    pub connect_timeout_ms: u64,
    /// Devices ship self-signed certificates, so this is off unless asked for
    pub verify_certificates: bool,
    /// Largest response body read off the wire
    pub max_response_bytes: usize,
    pub auth: AuthMode,
    /// Present a client certificate on HTTPS; the device certificate is then always verified
    pub client_cert: Option<ClientCertConfig>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout_ms: defaults::TRANSPORT_TIMEOUT_MS,
            connect_timeout_ms: 10_000,
            verify_certificates: false,
            max_response_bytes: MAX_MESSAGE_SIZE,
            auth: AuthMode::Basic,
            client_cert: None,
        }
    }
}

impl TransportConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

pub(crate) fn response_too_large(len: usize, limit: usize) -> TransportError {
    TransportError::Io(format!(
        "response of {} bytes exceeds {} byte limit",
        len, limit
    ))
}

/// Builds the transport matching an endpoint's scheme
pub struct DeviceTransportFactory {
    config: TransportConfig,
    credentials: Option<Credentials>,
}

impl DeviceTransportFactory {
    pub fn new(config: TransportConfig, credentials: Option<Credentials>) -> Self {
        Self {
            config,
            credentials,
        }
    }
}

impl TransportFactory for DeviceTransportFactory {
    fn build(&self, endpoint: &Endpoint) -> Box<dyn Transport> {
        match endpoint.scheme() {
            Scheme::Http | Scheme::Https => Box::new(HttpTransport::new(
                endpoint.clone(),
                self.config.clone(),
                self.credentials.clone(),
            )),
            Scheme::Socket => Box::new(SocketTransport::new(endpoint.clone(), self.config.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_picks_transport_by_scheme() {
        let factory = DeviceTransportFactory::new(TransportConfig::default(), None);
        assert_eq!(factory.build(&Endpoint::https("sw1")).name(), "HTTPS");
        assert_eq!(factory.build(&Endpoint::http("sw1")).name(), "HTTP");
        assert_eq!(factory.build(&Endpoint::socket()).name(), "Socket");
    }

    #[test]
    fn test_default_config() {
        let config = TransportConfig::default();
        assert_eq!(config.timeout(), Duration::from_secs(60));
        assert!(!config.verify_certificates);
        assert_eq!(config.max_response_bytes, MAX_MESSAGE_SIZE);
        assert_eq!(config.auth, AuthMode::Basic);
        assert!(config.client_cert.is_none());
    }

    #[test]
    fn test_config_from_json() {
        let config: TransportConfig = serde_json::from_str(
            r#"{"auth": "session", "client_cert": {"cert_file": "/etc/eapi/client.pem", "key_file": "/etc/eapi/client.key"}}"#,
        )
        .unwrap();
        assert_eq!(config.auth, AuthMode::Session);
        let cert = config.client_cert.unwrap();
        assert_eq!(cert.key_file, PathBuf::from("/etc/eapi/client.key"));
        assert!(cert.ca_file.is_none());
        assert_eq!(config.timeout_ms, defaults::TRANSPORT_TIMEOUT_MS);
    }
}
