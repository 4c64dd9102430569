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

//! Reach a target through a chain of port-forwarding hops and manage the
//! whole path as one tunnel session.

pub mod chain;
pub mod cli;
pub mod config;
pub mod error;
pub mod forwarding;
pub mod node;
pub mod port;
pub mod session;
pub mod utils;

pub use chain::{is_last, is_locally_tunnelable, requires_tunnel, session_chain, ChainBuilder};
pub use cli::Cli;
pub use config::ChainConfig;
pub use error::ChainError;
pub use node::{ChainNode, HopFactory, NetworkNode, NetworkParent};
pub use port::{EphemeralPorts, PortAllocator};
pub use session::{NullSession, SessionChain, TunnelSession};
