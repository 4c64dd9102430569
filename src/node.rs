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

//! Node capability consumed by the chain walker
//!
//! A node is a point on the path to a target: a host, a container, a jump
//! box. Each node may name its network parent (the system it is reached
//! through) and may be able to open a port forward towards itself.
//!
//! Nodes are owned by the caller. The walker only follows parent links and
//! asks for hop factories; it never mutates a node.

use crate::session::TunnelSession;
use anyhow::Result;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// Opens one hop of a tunnel chain.
///
/// `create` only builds the session; the walker calls
/// [`TunnelSession::start`] on it right after.
#[async_trait]
pub trait HopFactory: Send + Sync {
    async fn create(
        &self,
        local_port: u16,
        remote_port: u16,
        address: &str,
    ) -> Result<Box<dyn TunnelSession>>;
}

/// The system a node is reached through
#[derive(Clone)]
pub enum NetworkParent {
    /// A parent the walker can continue through
    Node(Arc<dyn NetworkNode>),
    /// A parent of some other kind that cannot carry a tunnel; the string
    /// describes it for error messages
    Foreign(String),
}

impl NetworkParent {
    /// Name of the parent for logs and errors
    pub fn describe(&self) -> String {
        match self {
            NetworkParent::Node(node) => node.name().to_string(),
            NetworkParent::Foreign(kind) => kind.clone(),
        }
    }
}

impl fmt::Debug for NetworkParent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkParent::Node(node) => f.debug_tuple("Node").field(&node.name()).finish(),
            NetworkParent::Foreign(kind) => f.debug_tuple("Foreign").field(kind).finish(),
        }
    }
}

/// A point on the path to a target.
///
/// The parent chain must end; the walker guards against cycles and
/// overlong chains, but a node that computes a fresh parent on every call
/// defeats the cycle check.
pub trait NetworkNode: Send + Sync {
    fn name(&self) -> &str;

    /// The system this node is reached through, `None` for a node reachable
    /// from the local machine
    fn network_parent(&self) -> Option<NetworkParent>;

    /// Factory for the hop that forwards into this node, if it provides one
    fn hop_factory(&self) -> Option<Arc<dyn HopFactory>> {
        None
    }
}

/// Plain implementation of [`NetworkNode`] built from parts
#[derive(Clone)]
pub struct ChainNode {
    name: String,
    parent: Option<NetworkParent>,
    hop: Option<Arc<dyn HopFactory>>,
}

impl ChainNode {
    /// A node with no parent and no hop factory
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent: None,
            hop: None,
        }
    }

    pub fn with_parent(mut self, parent: Arc<dyn NetworkNode>) -> Self {
        self.parent = Some(NetworkParent::Node(parent));
        self
    }

    /// Place the node behind a parent that cannot be tunneled through
    pub fn with_foreign_parent(mut self, kind: impl Into<String>) -> Self {
        self.parent = Some(NetworkParent::Foreign(kind.into()));
        self
    }

    pub fn with_hop_factory(mut self, factory: Arc<dyn HopFactory>) -> Self {
        self.hop = Some(factory);
        self
    }

    pub fn into_shared(self) -> Arc<dyn NetworkNode> {
        Arc::new(self)
    }
}

impl NetworkNode for ChainNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn network_parent(&self) -> Option<NetworkParent> {
        self.parent.clone()
    }

    fn hop_factory(&self) -> Option<Arc<dyn HopFactory>> {
        self.hop.clone()
    }
}

impl fmt::Debug for ChainNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainNode")
            .field("name", &self.name)
            .field("parent", &self.parent)
            .field("tunnels", &self.hop.is_some())
            .finish()
    }
}
