//! Structured call events and the sink that receives them

use eapi_shared::codec::Anomaly;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Events emitted once per call milestone, tagged with the call's correlation id
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    Started {
        correlation_id: String,
        endpoint: String,
        commands: usize,
    },
    /// One attempt failed; `retry_in` is set when another attempt follows
    AttemptFailed {
        correlation_id: String,
        attempt: u32,
        error: String,
        retry_in: Option<Duration>,
    },
    /// The response was usable but irregular
    Anomaly {
        correlation_id: String,
        anomaly: Anomaly,
    },
    /// A batch outcome was produced; `failed_at` is the device-reported failure index
    Completed {
        correlation_id: String,
        attempts: u32,
        failed_at: Option<usize>,
    },
    Failed {
        correlation_id: String,
        attempts: u32,
        error: String,
    },
    Cancelled {
        correlation_id: String,
        attempts: u32,
    },
}

impl CallEvent {
    pub fn correlation_id(&self) -> &str {
        match self {
            CallEvent::Started { correlation_id, .. }
            | CallEvent::AttemptFailed { correlation_id, .. }
            | CallEvent::Anomaly { correlation_id, .. }
            | CallEvent::Completed { correlation_id, .. }
            | CallEvent::Failed { correlation_id, .. }
            | CallEvent::Cancelled { correlation_id, .. } => correlation_id,
        }
    }
}

/// Receives call events; implementations must not block
pub trait EventSink: Send + Sync {
    fn record(&self, event: &CallEvent);
}

/// Forwards call events to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn record(&self, event: &CallEvent) {
        match event {
            CallEvent::Started {
                correlation_id,
                endpoint,
                commands,
            } => debug!(%correlation_id, %endpoint, commands, "Call started"),
            CallEvent::AttemptFailed {
                correlation_id,
                attempt,
                error,
                retry_in: Some(delay),
            } => warn!(%correlation_id, attempt, %error, retry_in = ?delay, "Attempt failed, retrying"),
            CallEvent::AttemptFailed {
                correlation_id,
                attempt,
                error,
                retry_in: None,
            } => warn!(%correlation_id, attempt, %error, "Attempt failed"),
            CallEvent::Anomaly {
                correlation_id,
                anomaly,
            } => warn!(%correlation_id, %anomaly, "Protocol anomaly"),
            CallEvent::Completed {
                correlation_id,
                attempts,
                failed_at: None,
            } => debug!(%correlation_id, attempts, "Call completed"),
            CallEvent::Completed {
                correlation_id,
                attempts,
                failed_at: Some(index),
            } => info!(%correlation_id, attempts, failed_at = index, "Batch stopped at failing command"),
            CallEvent::Failed {
                correlation_id,
                attempts,
                error,
            } => warn!(%correlation_id, attempts, %error, "Call failed"),
            CallEvent::Cancelled {
                correlation_id,
                attempts,
            } => info!(%correlation_id, attempts, "Call cancelled"),
        }
    }
}
