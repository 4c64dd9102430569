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

//! Error types for tunnel chain construction

use thiserror::Error;

/// Boxed error produced by a hop factory or a hop's transport
pub type HopError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur while building a tunnel chain
///
/// Structural errors (`NotTunnelable`, `CyclicChain`, `ChainTooDeep`) are
/// raised before any hop is created. The remaining variants can surface after
/// some hops have already been started.
#[derive(Debug, Error)]
pub enum ChainError {
    /// A node on the ancestor path has a parent that cannot be walked
    #[error(
        "unable to create tunnel chain: '{node}' sits behind '{parent}', which does not support tunneling"
    )]
    NotTunnelable { node: String, parent: String },

    /// The ancestor path loops back onto a node already visited
    #[error("network parent chain of '{target}' is cyclic: '{node}' was reached twice")]
    CyclicChain { target: String, node: String },

    /// The ancestor path is longer than the configured limit
    #[error("network parent chain of '{target}' exceeds the maximum depth of {limit}")]
    ChainTooDeep { target: String, limit: usize },

    /// The ephemeral port counter ran past the end of the port range
    #[error("ephemeral port range exhausted (next candidate would be {candidate})")]
    PortsExhausted { candidate: u32 },

    /// A hop factory failed to create its session
    #[error("failed to create hop {index} for '{node}'")]
    HopCreation {
        index: usize,
        node: String,
        #[source]
        source: HopError,
    },

    /// A freshly created hop failed to start
    #[error("failed to start hop {index} for '{node}'")]
    HopStart {
        index: usize,
        node: String,
        #[source]
        source: HopError,
    },
}

impl ChainError {
    /// Whether this error was raised before any hop was touched
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            ChainError::NotTunnelable { .. }
                | ChainError::CyclicChain { .. }
                | ChainError::ChainTooDeep { .. }
        )
    }
}
