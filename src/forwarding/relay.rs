//! Loopback TCP relay hop
//!
//! A relay listens on a local port and pipes every accepted connection to
//! `address:remote_port` over plain TCP. It is the simplest transport a hop
//! can have and lets a whole chain run on one machine:
//!
//! ```text
//! [Client] → [Relay listener] → [address:remote_port]
//!              ↑ 127.0.0.1:local_port
//! ```
//!
//! # Implementation Details
//!
//! - `start` binds a `TcpListener`; a requested port of 0 lets the OS pick
//!   one, and `local_port()` reports the bound port from then on
//! - Each accepted connection is relayed by its own task using
//!   `tokio::io::copy_bidirectional`; at most `max_connections` are relayed
//!   at once and further clients wait in the listen backlog
//! - `stop` cancels the listener and all connection tasks through a
//!   `CancellationToken` and waits for the listener task to finish
//! - Dropping a running relay does not stop it; only `stop` does

use super::RelayStats;
use crate::node::HopFactory;
use crate::session::{SessionState, TunnelSession};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Concurrent connections a relay serves unless told otherwise
pub const DEFAULT_MAX_CONNECTIONS: usize = 100;

/// Hop factory producing [`TcpRelaySession`]s
#[derive(Debug, Clone)]
pub struct TcpRelayFactory {
    bind_ip: IpAddr,
    max_connections: usize,
}

impl TcpRelayFactory {
    /// Relays listening on 127.0.0.1
    pub fn new() -> Self {
        Self::with_bind_ip(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    pub fn with_bind_ip(bind_ip: IpAddr) -> Self {
        Self {
            bind_ip,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections.max(1);
        self
    }
}

impl Default for TcpRelayFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HopFactory for TcpRelayFactory {
    async fn create(
        &self,
        local_port: u16,
        remote_port: u16,
        address: &str,
    ) -> Result<Box<dyn TunnelSession>> {
        if address.trim().is_empty() {
            bail!("Relay target address cannot be empty");
        }
        Ok(Box::new(
            TcpRelaySession::new(self.bind_ip, local_port, remote_port, address)
                .with_max_connections(self.max_connections),
        ))
    }
}

/// One relay hop
#[derive(Debug)]
pub struct TcpRelaySession {
    id: Uuid,
    bind_ip: IpAddr,
    local_port: u16,
    remote_port: u16,
    address: String,
    max_connections: usize,
    state: SessionState,
    cancel_token: CancellationToken,
    listener_task: Option<JoinHandle<()>>,
    stats: Arc<RelayStats>,
}

impl TcpRelaySession {
    pub fn new(bind_ip: IpAddr, local_port: u16, remote_port: u16, address: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            bind_ip,
            local_port,
            remote_port,
            address: address.to_string(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            state: SessionState::Created,
            cancel_token: CancellationToken::new(),
            listener_task: None,
            stats: Arc::new(RelayStats::default()),
        }
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections.max(1);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn stats(&self) -> Arc<RelayStats> {
        Arc::clone(&self.stats)
    }

    async fn accept_loop(
        listener: TcpListener,
        address: String,
        remote_port: u16,
        cancel_token: CancellationToken,
        stats: Arc<RelayStats>,
        connection_limit: Arc<Semaphore>,
    ) {
        loop {
            // Wait for a free slot before accepting
            let permit = tokio::select! {
                permit = Arc::clone(&connection_limit).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = cancel_token.cancelled() => {
                    debug!("Relay listener cancelled");
                    break;
                }
            };

            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            trace!("Accepted relay connection from {}", peer_addr);
                            stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
                            tokio::spawn(Self::relay_connection(
                                stream,
                                peer_addr,
                                address.clone(),
                                remote_port,
                                cancel_token.child_token(),
                                Arc::clone(&stats),
                                permit,
                            ));
                        }
                        Err(e) => {
                            error!("Failed to accept relay connection: {}", e);
                            stats.connections_failed.fetch_add(1, Ordering::Relaxed);

                            // Brief pause to avoid busy loop on persistent errors
                            sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
                _ = cancel_token.cancelled() => {
                    debug!("Relay listener cancelled");
                    break;
                }
            }
        }
    }

    async fn relay_connection(
        mut inbound: TcpStream,
        peer_addr: SocketAddr,
        address: String,
        remote_port: u16,
        cancel_token: CancellationToken,
        stats: Arc<RelayStats>,
        _permit: OwnedSemaphorePermit,
    ) {
        let mut outbound = match TcpStream::connect((address.as_str(), remote_port)).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(
                    "Relay from {} could not reach {}:{}: {}",
                    peer_addr, address, remote_port, e
                );
                stats.connections_failed.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        stats.active_connections.fetch_add(1, Ordering::Relaxed);
        tokio::select! {
            result = tokio::io::copy_bidirectional(&mut inbound, &mut outbound) => {
                match result {
                    Ok((sent, received)) => {
                        stats.bytes_transferred.fetch_add(sent + received, Ordering::Relaxed);
                        trace!(
                            "Relay {} → {}:{} closed ({} bytes out, {} bytes in)",
                            peer_addr, address, remote_port, sent, received
                        );
                    }
                    Err(e) => {
                        stats.connections_failed.fetch_add(1, Ordering::Relaxed);
                        debug!("Relay {} → {}:{} ended with error: {}", peer_addr, address, remote_port, e);
                    }
                }
            }
            _ = cancel_token.cancelled() => {
                trace!("Relay connection from {} cancelled", peer_addr);
            }
        }
        stats.active_connections.fetch_sub(1, Ordering::Relaxed);
    }
}

#[async_trait]
impl TunnelSession for TcpRelaySession {
    async fn start(&mut self) -> Result<()> {
        match self.state {
            SessionState::Running => return Ok(()),
            SessionState::Stopped => bail!("Relay {} was stopped and cannot be restarted", self.id),
            SessionState::Created => {}
        }

        let bind_addr = SocketAddr::new(self.bind_ip, self.local_port);
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("Failed to bind relay to {bind_addr}"))?;
        let local_addr = listener
            .local_addr()
            .with_context(|| "Failed to get relay local address")?;
        self.local_port = local_addr.port();

        info!(
            "Relay listening on {} → {}:{}",
            local_addr, self.address, self.remote_port
        );

        self.listener_task = Some(tokio::spawn(Self::accept_loop(
            listener,
            self.address.clone(),
            self.remote_port,
            self.cancel_token.clone(),
            Arc::clone(&self.stats),
            Arc::new(Semaphore::new(self.max_connections)),
        )));
        self.state = SessionState::Running;
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        if self.state == SessionState::Stopped {
            return Ok(());
        }
        self.state = SessionState::Stopped;
        self.cancel_token.cancel();

        if let Some(task) = self.listener_task.take() {
            if let Err(e) = task.await {
                warn!("Relay listener task for {} ended abnormally: {}", self.id, e);
            }
        }

        debug!(
            "Relay on port {} stopped after {} connection(s)",
            self.local_port,
            self.stats.connections_accepted.load(Ordering::Relaxed)
        );
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.state == SessionState::Running
    }

    fn local_port(&self) -> u16 {
        self.local_port
    }

    fn remote_port(&self) -> u16 {
        self.remote_port
    }
}
