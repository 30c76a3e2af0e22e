//! Command execution against a device
//!
//! This module handles:
//! - Validating commands and per-call options
//! - Building and dispatching one batched `runCmds` request
//! - Retrying transient transport faults with backoff
//! - Reporting call milestones to an event sink

mod cancel;
mod events;
mod options;
mod pipeline;
mod retry;

pub use cancel::CancelSignal;
pub use events::{CallEvent, EventSink, TracingSink};
pub use options::{ExecuteOptions, MixedEncoding};
pub use pipeline::CommandPipeline;
pub use retry::RetryPolicy;
