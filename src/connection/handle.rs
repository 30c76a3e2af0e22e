//! Exclusive lease on a pooled transport

use bytes::Bytes;
use eapi_shared::state_machine::{HandleEvent, HandleLifecycle, HandleState, Transition};
use tokio::sync::OwnedSemaphorePermit;

use crate::transport::{Endpoint, Transport, TransportError};

/// A live transport bound to one endpoint, held by exactly one call
///
/// Dropping a handle without releasing it discards the transport, so a
/// call abandoned mid-exchange never leaves a half-read channel in the pool.
pub struct ConnectionHandle {
    id: u64,
    endpoint: Endpoint,
    transport: Box<dyn Transport>,
    lifecycle: HandleLifecycle,
    reused: bool,
    permit: OwnedSemaphorePermit,
}

impl ConnectionHandle {
    pub(crate) fn new(
        id: u64,
        endpoint: Endpoint,
        transport: Box<dyn Transport>,
        permit: OwnedSemaphorePermit,
        reused: bool,
    ) -> Self {
        let mut lifecycle = HandleLifecycle::new();
        lifecycle.process_event(HandleEvent::Acquired);
        Self {
            id,
            endpoint,
            transport,
            lifecycle,
            reused,
            permit,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn state(&self) -> HandleState {
        self.lifecycle.state()
    }

    /// Whether this handle came from the idle pool
    pub fn is_reused(&self) -> bool {
        self.reused
    }

    /// Exchange one request over the leased transport
    pub async fn send(&mut self, request: &[u8]) -> Result<Bytes, TransportError> {
        if self.lifecycle.state() != HandleState::InUse {
            return Err(TransportError::NotConnected);
        }
        self.transport.send(request).await
    }

    pub(crate) fn fault(&mut self) -> Transition<HandleState, HandleEvent> {
        self.lifecycle.process_event(HandleEvent::Fault)
    }

    pub(crate) fn into_parts(
        mut self,
    ) -> (
        Transition<HandleState, HandleEvent>,
        Box<dyn Transport>,
        OwnedSemaphorePermit,
    ) {
        let transition = self.lifecycle.process_event(HandleEvent::Released);
        (transition, self.transport, self.permit)
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint.to_string())
            .field("state", &self.lifecycle.state())
            .field("transport", &self.transport.state())
            .finish()
    }
}
