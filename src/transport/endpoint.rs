//! Endpoint identity and credentials

use eapi_shared::defaults;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// How an endpoint is reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Http,
    Https,
    /// HTTP over the device's local Unix socket
    Socket,
}

impl Scheme {
    /// Port used when none is given
    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => defaults::HTTP_PORT,
            Scheme::Https => defaults::HTTPS_PORT,
            Scheme::Socket => 0,
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheme::Http => write!(f, "http"),
            Scheme::Https => write!(f, "https"),
            Scheme::Socket => write!(f, "socket"),
        }
    }
}

impl std::str::FromStr for Scheme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(Scheme::Http),
            "https" => Ok(Scheme::Https),
            "socket" => Ok(Scheme::Socket),
            other => Err(format!(
                "transport must be one of [http, https, socket], got '{}'",
                other
            )),
        }
    }
}

/// A reachable device command API
///
/// Immutable once built; used as the pool key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    scheme: Scheme,
    host: String,
    port: u16,
    path: String,
    socket_path: Option<PathBuf>,
}

impl Endpoint {
    pub fn new(scheme: Scheme, host: impl Into<String>) -> Self {
        let socket_path = match scheme {
            Scheme::Socket => Some(PathBuf::from(defaults::UNIX_SOCKET_PATH)),
            Scheme::Http | Scheme::Https => None,
        };
        Self {
            scheme,
            host: host.into(),
            port: scheme.default_port(),
            path: defaults::COMMAND_API_PATH.into(),
            socket_path,
        }
    }

    pub fn http(host: impl Into<String>) -> Self {
        Self::new(Scheme::Http, host)
    }

    pub fn https(host: impl Into<String>) -> Self {
        Self::new(Scheme::Https, host)
    }

    /// The on-box HTTP server on its local port
    pub fn http_local() -> Self {
        Self::http("localhost").with_port(defaults::HTTP_LOCAL_PORT)
    }

    /// The on-box HTTPS server on its local port
    pub fn https_local() -> Self {
        Self::https("localhost").with_port(defaults::HTTPS_LOCAL_PORT)
    }

    /// The on-box socket at its standard location
    pub fn socket() -> Self {
        Self::new(Scheme::Socket, "localhost")
    }

    /// The on-box socket at a custom location
    pub fn socket_at(path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: Some(path.into()),
            ..Self::socket()
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        let path = path.into();
        self.path = if path.starts_with('/') {
            path
        } else {
            format!("/{}", path)
        };
        self
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn socket_path(&self) -> Option<&Path> {
        self.socket_path.as_deref()
    }

    /// URL the HTTP(S) transport posts to
    pub fn url(&self) -> String {
        format!("{}://{}:{}{}", self.scheme, self.host, self.port, self.path)
    }

    /// Session login URL: the command API path with its last segment replaced by `login`
    pub fn login_url(&self) -> String {
        let base = self
            .path
            .strip_suffix(defaults::COMMAND_API_PATH)
            .unwrap_or_default();
        format!(
            "{}://{}:{}{}{}",
            self.scheme,
            self.host,
            self.port,
            base,
            defaults::LOGIN_PATH
        )
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.scheme, &self.socket_path) {
            (Scheme::Socket, Some(socket)) => write!(f, "socket://{}{}", socket.display(), self.path),
            _ => write!(f, "{}", self.url()),
        }
    }
}

/// Basic-auth material for HTTP(S) endpoints
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<removed>")
            .finish()
    }
}
