//! eAPI Client
//!
//! Async core for running CLI commands on a network device through its
//! JSON-RPC command API:
//! - Transport: one HTTP(S) or local-socket channel to an endpoint
//! - Connection manager: pooled transports keyed by endpoint
//! - Command pipeline: encode, dispatch, decode with bounded retry
//!
//! Wire types and the codec live in `eapi-shared`.

pub mod command;
pub mod config;
pub mod connection;
pub mod error;
pub mod transport;

pub use command::{
    CallEvent, CancelSignal, CommandPipeline, EventSink, ExecuteOptions, MixedEncoding,
    RetryPolicy, TracingSink,
};
pub use config::ClientConfig;
pub use connection::{ConnectionHandle, ConnectionManager, PoolConfig, PoolStats};
pub use error::{EapiError, Result};
pub use transport::{
    AuthMode, ClientCertConfig, Credentials, DeviceTransportFactory, Endpoint, Scheme,
    Transport, TransportConfig, TransportError, TransportFactory,
};

pub use eapi_shared::{
    BatchOutcome, Command, CommandOutput, CommandResult, Encoding, FailureDescriptor,
};
