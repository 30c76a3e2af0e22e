//! Connection management for pooled device transports
//!
//! This module handles:
//! - One pool of transports per endpoint, sized by configuration
//! - Exclusive handles with an Idle/InUse/Broken lifecycle
//! - Discarding and recreating transports after faults

mod handle;
mod manager;

pub use handle::ConnectionHandle;
pub use manager::{ConnectionManager, PoolConfig, PoolStats};
