//! Concrete hop transports
//!
//! The chain walker treats hops as opaque [`HopFactory`](crate::node::HopFactory)
//! implementations. This module ships one of them, a loopback TCP relay,
//! used by the `hopchain` binary and by end-to-end tests. SSH or
//! process-based hops live with the callers that know how to open them.

pub mod relay;

pub use relay::{TcpRelayFactory, TcpRelaySession};

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for a relay hop
#[derive(Debug, Default)]
pub struct RelayStats {
    /// Total connections accepted
    pub connections_accepted: AtomicU64,
    /// Connections currently being relayed
    pub active_connections: AtomicU64,
    /// Connections that could not be relayed or ended with an error
    pub connections_failed: AtomicU64,
    /// Bytes moved in both directions by completed connections
    pub bytes_transferred: AtomicU64,
}

impl RelayStats {
    pub fn snapshot(&self) -> RelayStatsSnapshot {
        RelayStatsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            connections_failed: self.connections_failed.load(Ordering::Relaxed),
            bytes_transferred: self.bytes_transferred.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`RelayStats`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStatsSnapshot {
    pub connections_accepted: u64,
    pub active_connections: u64,
    pub connections_failed: u64,
    pub bytes_transferred: u64,
}
