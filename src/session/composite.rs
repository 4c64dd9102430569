// Copyright 2025 Lablup Inc. and Jeongkyu Shin
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Multi-hop session
//!
//! [`SessionChain`] owns the hops of a chain, ordered nearest-target first.
//! Hops arrive already started: chain construction has to start each one
//! before it knows the port the next hop must target. Because of that,
//! `start` on a chain only verifies the hops are still up, unlike a single
//! hop session where `start` does the actual binding.

use super::{SessionState, TunnelSession};
use anyhow::{bail, Result};
use async_trait::async_trait;
use std::fmt;
use tracing::{debug, info, warn};

/// Parameters a single hop was created with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HopInfo {
    /// Name of the node whose factory produced the hop
    pub node: String,
    pub local_port: u16,
    pub remote_port: u16,
    /// Address the hop forwards to
    pub address: String,
}

impl fmt::Display for HopInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} -> {}:{}",
            self.node, self.local_port, self.address, self.remote_port
        )
    }
}

/// Several hops exposed as one tunnel.
///
/// The outermost hop's local port is the access point; remote port and
/// target address are the values the chain was requested for. Hops are
/// private: only the chain stops them.
pub struct SessionChain {
    hops: Vec<HopInfo>,
    sessions: Vec<Box<dyn TunnelSession>>,
    remote_port: u16,
    target_address: String,
    state: SessionState,
}

impl SessionChain {
    /// Wrap already started hops, nearest-target first, each paired with
    /// the parameters it was created with
    pub fn new(
        hops: Vec<(HopInfo, Box<dyn TunnelSession>)>,
        remote_port: u16,
        target_address: impl Into<String>,
    ) -> Self {
        let (hops, sessions) = hops.into_iter().unzip();
        Self {
            hops,
            sessions,
            remote_port,
            target_address: target_address.into(),
            state: SessionState::Running,
        }
    }

    pub fn hops(&self) -> &[HopInfo] {
        &self.hops
    }

    pub fn target_address(&self) -> &str {
        &self.target_address
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Human-readable path from the local access point to the target
    pub fn path_description(&self) -> String {
        let mut parts = vec![format!("localhost:{}", self.local_port())];
        parts.extend(
            self.hops
                .iter()
                .rev()
                .map(|hop| format!("{}:{}", hop.address, hop.remote_port)),
        );
        parts.join(" -> ")
    }
}

impl fmt::Debug for SessionChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionChain")
            .field("hops", &self.hops)
            .field("remote_port", &self.remote_port)
            .field("target_address", &self.target_address)
            .field("state", &self.state)
            .finish()
    }
}

#[async_trait]
impl TunnelSession for SessionChain {
    async fn start(&mut self) -> Result<()> {
        if self.state == SessionState::Stopped {
            bail!("Session chain to {} has been stopped", self.target_address);
        }

        for (hop, session) in self.hops.iter().zip(&self.sessions) {
            if !session.is_running() {
                bail!("Hop {hop} is not running");
            }
        }

        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        if self.state == SessionState::Stopped {
            return Ok(());
        }
        self.state = SessionState::Stopped;

        // Outermost first: an outer hop still forwards into the inner one.
        let mut first_error = None;
        for (hop, session) in self.hops.iter().zip(self.sessions.iter_mut()).rev() {
            debug!("Stopping hop {}", hop);
            if let Err(e) = session.stop().await {
                warn!("Failed to stop hop {}: {}", hop, e);
                first_error.get_or_insert(e);
            }
        }

        info!(
            "Stopped session chain of {} hop(s) to {}:{}",
            self.sessions.len(),
            self.target_address,
            self.remote_port
        );

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn is_running(&self) -> bool {
        !self.sessions.is_empty() && self.sessions.iter().all(|s| s.is_running())
    }

    fn local_port(&self) -> u16 {
        self.sessions
            .last()
            .map_or(self.remote_port, |outermost| outermost.local_port())
    }

    fn remote_port(&self) -> u16 {
        self.remote_port
    }

    fn hop_count(&self) -> usize {
        self.sessions.len()
    }
}
