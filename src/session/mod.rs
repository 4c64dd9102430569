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

//! Tunnel session contract
//!
//! A [`TunnelSession`] is one running local→remote forward. Sessions move
//! through `Created → Running → Stopped`; a stopped session is never
//! restarted, a new one has to be created instead.
//!
//! Three shapes are returned by chain construction, all behind the same trait:
//! - a hop session produced by a [`HopFactory`](crate::node::HopFactory), returned as-is
//!   when the path needs exactly one hop
//! - [`NullSession`] when no hop is needed at all
//! - [`SessionChain`] when several hops have to be stacked

pub mod composite;
pub mod null;

pub use composite::{HopInfo, SessionChain};
pub use null::NullSession;

use anyhow::Result;
use async_trait::async_trait;
use std::fmt;

/// A single running port forward, or an aggregate that behaves like one.
///
/// # Contract
///
/// - `local_port` and `remote_port` never change once `start` has succeeded
/// - `start` acquires the forward's resources and may fail
/// - `stop` releases everything, is idempotent, and is safe to call on a
///   session whose `start` never completed
#[async_trait]
pub trait TunnelSession: Send + Sync {
    /// Bind the local side and wire the forward
    async fn start(&mut self) -> Result<()>;

    /// Release all resources held by the session
    async fn stop(&mut self) -> Result<()>;

    fn is_running(&self) -> bool;

    /// Port a client connects to
    fn local_port(&self) -> u16;

    /// Port the forward reaches on the far side
    fn remote_port(&self) -> u16;

    /// Number of hops this session stands for
    fn hop_count(&self) -> usize {
        1
    }
}

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Running,
    Stopped,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Created => write!(f, "created"),
            SessionState::Running => write!(f, "running"),
            SessionState::Stopped => write!(f, "stopped"),
        }
    }
}
