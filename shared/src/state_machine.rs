//! Connection State Machines
//!
//! Lifecycles of a transport and of the pooled handle wrapping it. A broken
//! handle or a closed transport is terminal: it is never reused.

use std::fmt;

/// Result of a state transition attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition<S, E> {
    /// Transition was valid and state changed
    Success(S),
    /// Transition was invalid from current state
    Invalid { from: S, event: E },
}

impl<S, E> Transition<S, E> {
    pub fn is_success(&self) -> bool {
        matches!(self, Transition::Success(_))
    }
}

/// States of a pooled connection handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleState {
    /// Sitting in the pool, available for acquisition
    Idle,
    /// Exclusively held by one batch
    InUse,
    /// A transport fault was observed; the handle must be discarded
    Broken,
}

impl fmt::Display for HandleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandleState::Idle => write!(f, "idle"),
            HandleState::InUse => write!(f, "in-use"),
            HandleState::Broken => write!(f, "broken"),
        }
    }
}

/// Events that move a handle through its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleEvent {
    Acquired,
    Released,
    Fault,
}

/// Handle lifecycle: `Idle -> InUse -> Idle`, or `-> Broken` on fault
#[derive(Debug)]
pub struct HandleLifecycle {
    current_state: HandleState,
}

impl Default for HandleLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleLifecycle {
    /// Create a new lifecycle in Idle state
    pub fn new() -> Self {
        Self {
            current_state: HandleState::Idle,
        }
    }

    pub fn state(&self) -> HandleState {
        self.current_state
    }

    pub fn is_broken(&self) -> bool {
        self.current_state == HandleState::Broken
    }

    /// Process an event and return the transition result
    pub fn process_event(&mut self, event: HandleEvent) -> Transition<HandleState, HandleEvent> {
        use HandleEvent::*;
        use HandleState::*;

        let next = match (self.current_state, event) {
            (Idle, Acquired) => Some(InUse),
            (InUse, Released) => Some(Idle),
            (Idle | InUse, Fault) => Some(Broken),
            // Broken is terminal
            _ => None,
        };

        match next {
            Some(state) => {
                self.current_state = state;
                Transition::Success(state)
            }
            None => Transition::Invalid {
                from: self.current_state,
                event,
            },
        }
    }
}

/// States of a single transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportState {
    Unconnected,
    Connected,
    Closed,
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportState::Unconnected => write!(f, "unconnected"),
            TransportState::Connected => write!(f, "connected"),
            TransportState::Closed => write!(f, "closed"),
        }
    }
}

/// Events that move a transport through its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEvent {
    Connect,
    Fault,
    Close,
}

/// Transport lifecycle: `Unconnected -> Connected -> Closed`
#[derive(Debug)]
pub struct TransportLifecycle {
    current_state: TransportState,
}

impl Default for TransportLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportLifecycle {
    /// Create a new lifecycle in Unconnected state
    pub fn new() -> Self {
        Self {
            current_state: TransportState::Unconnected,
        }
    }

    pub fn state(&self) -> TransportState {
        self.current_state
    }

    /// Only a connected transport may carry a request
    pub fn can_send(&self) -> bool {
        self.current_state == TransportState::Connected
    }

    /// Process an event and return the transition result
    pub fn process_event(
        &mut self,
        event: TransportEvent,
    ) -> Transition<TransportState, TransportEvent> {
        use TransportEvent::*;
        use TransportState::*;

        let next = match (self.current_state, event) {
            (Unconnected, Connect) => Some(Connected),
            (Connected, Connect) => Some(Connected),
            (Unconnected | Connected, Fault) => Some(Closed),
            (_, Close) => Some(Closed),
            _ => None,
        };

        match next {
            Some(state) => {
                self.current_state = state;
                Transition::Success(state)
            }
            None => Transition::Invalid {
                from: self.current_state,
                event,
            },
        }
    }
}
