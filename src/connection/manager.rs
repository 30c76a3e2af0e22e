//! Connection manager with pooled, reusable transports per endpoint

use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use eapi_shared::state_machine::TransportState;

use super::ConnectionHandle;
use crate::error::{EapiError, Result};
use crate::transport::{Endpoint, Transport, TransportError, TransportFactory};

/// Configuration for the connection pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Handles that may be in use for one endpoint at once (min 1)
    pub max_connections_per_endpoint: usize,
    /// Idle handles older than this are closed on the next acquire
    pub idle_timeout_ms: Option<u64>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections_per_endpoint: 1,
            idle_timeout_ms: None,
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_connections_per_endpoint == 0 {
            return Err(EapiError::InvalidInput(
                "max_connections_per_endpoint must be at least 1".into(),
            ));
        }
        if self.idle_timeout_ms == Some(0) {
            return Err(EapiError::InvalidInput(
                "idle_timeout_ms must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_ms.map(Duration::from_millis)
    }
}

/// Pool counters since the manager was created
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub created: u64,
    pub reused: u64,
    pub broken: u64,
    pub evicted: u64,
    pub idle: usize,
    /// Endpoints with a leased, idle or awaited handle
    pub endpoints: usize,
}

struct IdleTransport {
    id: u64,
    transport: Box<dyn Transport>,
    since: Instant,
}

struct EndpointSlot {
    /// One permit per handle allowed in use
    permits: Arc<Semaphore>,
    idle: Vec<IdleTransport>,
}

impl EndpointSlot {
    /// Waiters and leased permits each hold a clone of `permits`
    fn is_unused(&self) -> bool {
        self.idle.is_empty() && Arc::strong_count(&self.permits) == 1
    }
}

/// Owns every transport, keyed by endpoint
///
/// The pool map lock only guards bookkeeping; it is never held across
/// connect, send or close.
pub struct ConnectionManager {
    config: PoolConfig,
    factory: Arc<dyn TransportFactory>,
    slots: Mutex<HashMap<Endpoint, EndpointSlot>>,
    next_id: AtomicU64,
    created: AtomicU64,
    reused: AtomicU64,
    broken: AtomicU64,
    evicted: AtomicU64,
}

impl ConnectionManager {
    pub fn new(config: PoolConfig, factory: Arc<dyn TransportFactory>) -> Self {
        let mut config = config;
        if config.max_connections_per_endpoint == 0 {
            warn!("Pool size 0 requested; using 1");
            config.max_connections_per_endpoint = 1;
        }

        Self {
            config,
            factory,
            slots: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            created: AtomicU64::new(0),
            reused: AtomicU64::new(0),
            broken: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    /// Lease a handle for `endpoint`, waiting while the endpoint is at capacity
    ///
    /// Reuses the most recently released idle transport if there is one;
    /// otherwise builds and connects a new one. A failed connect leaves
    /// nothing behind in the pool.
    pub async fn acquire(&self, endpoint: &Endpoint) -> Result<ConnectionHandle> {
        let permits = {
            let mut slots = self.slots.lock();
            slots
                .entry(endpoint.clone())
                .or_insert_with(|| EndpointSlot {
                    permits: Arc::new(Semaphore::new(self.config.max_connections_per_endpoint)),
                    idle: Vec::new(),
                })
                .permits
                .clone()
        };

        let permit = permits
            .acquire_owned()
            .await
            .map_err(|_| EapiError::Connect {
                endpoint: endpoint.to_string(),
                reason: "connection pool is shut down".into(),
            })?;

        let (reusable, stale) = {
            let now = Instant::now();
            let mut slots = self.slots.lock();
            match slots.get_mut(endpoint) {
                Some(slot) => {
                    let (live, stale): (Vec<_>, Vec<_>) = slot
                        .idle
                        .drain(..)
                        .partition(|idle| self.is_fresh(idle, now));
                    slot.idle = live;
                    (slot.idle.pop(), stale)
                }
                None => (None, Vec::new()),
            }
        };

        for mut idle in stale {
            debug!(endpoint = %endpoint, handle = idle.id, "Evicting stale idle connection");
            idle.transport.close().await;
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }

        if let Some(idle) = reusable {
            self.reused.fetch_add(1, Ordering::Relaxed);
            debug!(endpoint = %endpoint, handle = idle.id, "Reusing idle connection");
            return Ok(ConnectionHandle::new(
                idle.id,
                endpoint.clone(),
                idle.transport,
                permit,
                true,
            ));
        }

        let mut transport = self.factory.build(endpoint);
        if let Err(e) = transport.connect().await {
            transport.close().await;
            warn!(endpoint = %endpoint, error = %e, "Connect failed");
            drop(permit);
            self.prune(endpoint);
            return Err(match e {
                TransportError::Unauthorized { .. } => EapiError::transport(endpoint, e),
                TransportError::Connect(reason) => EapiError::Connect {
                    endpoint: endpoint.to_string(),
                    reason,
                },
                other => EapiError::Connect {
                    endpoint: endpoint.to_string(),
                    reason: other.to_string(),
                },
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.created.fetch_add(1, Ordering::Relaxed);
        info!(
            endpoint = %endpoint,
            handle = id,
            transport = transport.name(),
            "Opened connection"
        );

        Ok(ConnectionHandle::new(id, endpoint.clone(), transport, permit, false))
    }

    /// Return a handle; healthy ones go back to Idle, broken ones are closed
    pub async fn release(&self, handle: ConnectionHandle) {
        let id = handle.id();
        let endpoint = handle.endpoint().clone();
        let (transition, mut transport, permit) = handle.into_parts();

        if !transition.is_success() {
            debug!(endpoint = %endpoint, handle = id, "Discarding broken connection");
            transport.close().await;
        } else if transport.state() != TransportState::Connected {
            debug!(endpoint = %endpoint, handle = id, "Discarding closed connection");
            transport.close().await;
            self.evicted.fetch_add(1, Ordering::Relaxed);
        } else {
            let mut slots = self.slots.lock();
            if let Some(slot) = slots.get_mut(&endpoint) {
                slot.idle.push(IdleTransport {
                    id,
                    transport,
                    since: Instant::now(),
                });
            }
        }

        // Capacity frees only once the transport is back or gone
        drop(permit);
        self.prune(&endpoint);
    }

    /// Flag a handle whose transport can no longer be trusted
    pub fn mark_broken(&self, handle: &mut ConnectionHandle, reason: &str) {
        if handle.fault().is_success() {
            self.broken.fetch_add(1, Ordering::Relaxed);
            warn!(
                endpoint = %handle.endpoint(),
                handle = handle.id(),
                reason,
                "Connection marked broken"
            );
        }
    }

    pub fn stats(&self) -> PoolStats {
        let (idle, endpoints) = {
            let slots = self.slots.lock();
            (slots.values().map(|slot| slot.idle.len()).sum(), slots.len())
        };
        PoolStats {
            created: self.created.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            broken: self.broken.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            idle,
            endpoints,
        }
    }

    /// Close every idle connection; leased handles are unaffected
    pub async fn close_all(&self) {
        let idle: Vec<IdleTransport> = {
            let mut slots = self.slots.lock();
            let idle = slots
                .values_mut()
                .flat_map(|slot| slot.idle.drain(..))
                .collect();
            slots.retain(|_, slot| !slot.is_unused());
            idle
        };

        let count = idle.len();
        join_all(idle.into_iter().map(|mut idle| async move {
            idle.transport.close().await;
        }))
        .await;
        info!(closed = count, "Closed idle connections");
    }

    /// Forget an endpoint nobody holds, awaits or keeps idle
    fn prune(&self, endpoint: &Endpoint) {
        let mut slots = self.slots.lock();
        if slots.get(endpoint).is_some_and(EndpointSlot::is_unused) {
            slots.remove(endpoint);
        }
    }

    fn is_fresh(&self, idle: &IdleTransport, now: Instant) -> bool {
        let expired = self
            .config
            .idle_timeout()
            .map(|limit| now.duration_since(idle.since) >= limit)
            .unwrap_or(false);
        !expired && idle.transport.state() == TransportState::Connected
    }
}
