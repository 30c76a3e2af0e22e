//! Error taxonomy for the command pipeline

use std::time::Duration;

use eapi_shared::codec::CodecError;
use thiserror::Error;

use crate::transport::{Endpoint, TransportError};

pub type Result<T> = std::result::Result<T, EapiError>;

/// Errors surfaced by [`crate::CommandPipeline::execute`]
///
/// A command the device rejects is not an error: it comes back inside
/// [`eapi_shared::BatchOutcome::Failed`].
#[derive(Error, Debug)]
pub enum EapiError {
    #[error("Unable to connect to {endpoint}: {reason}")]
    Connect { endpoint: String, reason: String },

    #[error("Request to {endpoint} timed out after {after:?}")]
    Timeout { endpoint: String, after: Duration },

    #[error("I/O error talking to {endpoint}: {reason}")]
    Io { endpoint: String, reason: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Correlation id mismatch: sent {expected}, received {actual}")]
    CorrelationMismatch { expected: String, actual: String },

    #[error("Call cancelled")]
    Cancelled,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The device refused the request envelope before running any command
    #[error("Error [{code}]: {message}")]
    Rpc { code: i64, message: String },

    #[error("Unauthorized ({status}): {reason}")]
    Unauthorized { status: u16, reason: String },

    #[error("Unable to enter privileged mode: Error [{code}]: {message}")]
    EnableRejected { code: i64, message: String },
}

impl EapiError {
    /// Transient transport faults are the only retryable errors
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EapiError::Connect { .. } | EapiError::Timeout { .. } | EapiError::Io { .. }
        )
    }

    /// Whether the connection that produced this error can no longer be trusted
    ///
    /// An unparseable or misattributed response may mean the channel is out
    /// of step with the device, so those break the connection too.
    pub fn breaks_connection(&self) -> bool {
        matches!(
            self,
            EapiError::Connect { .. }
                | EapiError::Timeout { .. }
                | EapiError::Io { .. }
                | EapiError::Cancelled
                | EapiError::Protocol(_)
                | EapiError::CorrelationMismatch { .. }
        )
    }

    /// Attach the endpoint to a transport failure
    pub fn transport(endpoint: &Endpoint, err: TransportError) -> Self {
        let endpoint = endpoint.to_string();
        match err {
            TransportError::Connect(reason) => EapiError::Connect { endpoint, reason },
            TransportError::Timeout(after) => EapiError::Timeout { endpoint, after },
            TransportError::Io(reason) => EapiError::Io { endpoint, reason },
            TransportError::NotConnected => EapiError::Io {
                endpoint,
                reason: "transport is not connected".into(),
            },
            TransportError::Unauthorized { status, reason } => {
                EapiError::Unauthorized { status, reason }
            }
        }
    }
}

impl From<CodecError> for EapiError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::EmptyBatch => EapiError::InvalidInput(err.to_string()),
            CodecError::CorrelationMismatch { expected, actual } => {
                EapiError::CorrelationMismatch { expected, actual }
            }
            other => EapiError::Protocol(other.to_string()),
        }
    }
}
