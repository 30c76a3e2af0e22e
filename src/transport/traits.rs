//! Transport trait abstraction for pluggable device channels

use async_trait::async_trait;
use bytes::Bytes;
use eapi_shared::state_machine::TransportState;
use std::time::Duration;
use thiserror::Error;

use super::Endpoint;

/// Faults raised by a transport
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Io(String),

    /// The device answered but refused the credentials
    #[error("HTTP {status}: {reason}")]
    Unauthorized { status: u16, reason: String },

    #[error("transport is not connected")]
    NotConnected,
}

/// One channel to one endpoint
///
/// `send` is only valid while Connected. Any fault moves the transport to
/// Closed, after which it is never used again.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish the underlying channel
    async fn connect(&mut self) -> Result<(), TransportError>;

    /// Write one full request body and read one full response body
    async fn send(&mut self, request: &[u8]) -> Result<Bytes, TransportError>;

    /// Release underlying resources; idempotent
    async fn close(&mut self);

    fn state(&self) -> TransportState;

    /// Human-readable name for this transport
    fn name(&self) -> &'static str;
}

/// Factory for creating unconnected transports
pub trait TransportFactory: Send + Sync {
    fn build(&self, endpoint: &Endpoint) -> Box<dyn Transport>;
}
