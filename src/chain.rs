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

//! Tunnel chain construction
//!
//! Starting at a target node, the walker follows network parents towards
//! the local machine. Every node that provides a [`HopFactory`] contributes
//! one hop; hops are created and started in walk order (nearest target
//! first), each one forwarding into the local port of the hop opened just
//! before it:
//!
//! ```text
//! client -> [C: desired local] -> [B: ephemeral] -> [A: ephemeral] -> target:remote
//!            outermost hop                            innermost hop
//! ```
//!
//! Only the outermost hop listens on the caller's port. Interior hops get a
//! port from the [`PortAllocator`] and the innermost hop is the only one
//! that forwards to the caller's address; every other hop forwards to the
//! local address of the previous hop.
//!
//! # Failure behavior
//!
//! Hops are started as soon as they are created. When a later hop fails,
//! the ones already started are left running unless
//! [`ChainConfig::teardown_on_failure`] is set, in which case they are
//! stopped outermost first before the error is returned.

use crate::config::{ChainConfig, DEFAULT_MAX_DEPTH};
use crate::error::ChainError;
use crate::node::{HopFactory, NetworkNode, NetworkParent};
use crate::port::{process_allocator, EphemeralPorts, PortAllocator};
use crate::session::{HopInfo, NullSession, SessionChain, TunnelSession};
use std::collections::HashSet;
use std::ops::Deref;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A node visited by the walk: the target itself is borrowed, ancestors
/// are shared handles obtained from their children
#[derive(Clone)]
pub enum NodeRef<'a> {
    Borrowed(&'a dyn NetworkNode),
    Shared(Arc<dyn NetworkNode>),
}

impl<'a> Deref for NodeRef<'a> {
    type Target = dyn NetworkNode + 'a;

    fn deref(&self) -> &Self::Target {
        match self {
            NodeRef::Borrowed(node) => *node,
            NodeRef::Shared(node) => node.as_ref(),
        }
    }
}

/// Why a walk stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalkEnd {
    /// Reached a node without a network parent
    Root,
    /// `node` sits behind a parent that cannot be walked
    Foreign { node: String, parent: String },
    /// The next parent, `node`, was already visited
    Cycle { node: String },
    /// Gave up after the depth limit with parents still ahead
    DepthExceeded,
}

/// Iterator over a node and its network parents, nearest first.
///
/// Each node is yielded once; the walk stops before revisiting a node and
/// after `max_depth` nodes. Once exhausted, [`Ancestors::end`] tells whether
/// the walk reached a root.
pub struct Ancestors<'a> {
    pending: Option<NodeRef<'a>>,
    seen: HashSet<usize>,
    max_depth: usize,
    end: Option<WalkEnd>,
}

impl<'a> Ancestors<'a> {
    pub fn new(node: &'a dyn NetworkNode, max_depth: usize) -> Self {
        Self {
            pending: Some(NodeRef::Borrowed(node)),
            seen: HashSet::new(),
            max_depth: max_depth.max(1),
            end: None,
        }
    }

    /// Walk the whole path; only a cycle or a foreign parent stops it early
    pub fn unbounded(node: &'a dyn NetworkNode) -> Self {
        Self::new(node, usize::MAX)
    }

    /// `None` while nodes remain
    pub fn end(&self) -> Option<&WalkEnd> {
        self.end.as_ref()
    }

    /// Drain the walk and report how it ended
    pub fn finish(mut self) -> WalkEnd {
        for _ in self.by_ref() {}
        self.end.unwrap_or(WalkEnd::Root)
    }

    fn has_seen(&self, node: &dyn NetworkNode) -> bool {
        self.seen.contains(&identity(node))
    }
}

impl<'a> Iterator for Ancestors<'a> {
    type Item = NodeRef<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.pending.take()?;
        self.seen.insert(identity(&*current));

        match current.network_parent() {
            None => self.end = Some(WalkEnd::Root),
            Some(NetworkParent::Node(parent)) if self.has_seen(parent.as_ref()) => {
                self.end = Some(WalkEnd::Cycle {
                    node: parent.name().to_string(),
                })
            }
            Some(NetworkParent::Foreign(kind)) => {
                self.end = Some(WalkEnd::Foreign {
                    node: current.name().to_string(),
                    parent: kind,
                })
            }
            Some(NetworkParent::Node(_)) if self.seen.len() >= self.max_depth => {
                self.end = Some(WalkEnd::DepthExceeded)
            }
            Some(NetworkParent::Node(parent)) => self.pending = Some(NodeRef::Shared(parent)),
        }

        Some(current)
    }
}

/// Whether any node from `node` up to the first non-walkable parent
/// provides a hop factory
pub fn requires_tunnel(node: &dyn NetworkNode) -> bool {
    Ancestors::unbounded(node).any(|n| n.hop_factory().is_some())
}

/// Whether the ancestor path of `node` can be bridged, i.e. it ends at a
/// root without crossing a foreign parent, within the default depth limit.
/// Hop factories play no part.
pub fn is_locally_tunnelable(node: &dyn NetworkNode) -> bool {
    is_locally_tunnelable_within(node, DEFAULT_MAX_DEPTH)
}

/// Whether no ancestor strictly beyond `node` provides a hop factory, which
/// makes a hop on `node` the outermost one
pub fn is_last(node: &dyn NetworkNode) -> bool {
    Ancestors::unbounded(node)
        .skip(1)
        .all(|n| n.hop_factory().is_none())
}

/// Build and start the hops needed to reach `address:remote_port` from
/// `node`, using default settings and the process-wide port allocator.
///
/// See [`ChainBuilder::build`].
pub async fn session_chain(
    node: &dyn NetworkNode,
    local_port: u16,
    remote_port: u16,
    address: &str,
) -> Result<Box<dyn TunnelSession>, ChainError> {
    ChainBuilder::new()
        .build(node, local_port, remote_port, address)
        .await
}

fn is_locally_tunnelable_within(node: &dyn NetworkNode, max_depth: usize) -> bool {
    Ancestors::new(node, max_depth).finish() == WalkEnd::Root
}

fn identity(node: &dyn NetworkNode) -> usize {
    node as *const _ as *const () as usize
}

type PlannedNode<'a> = (NodeRef<'a>, Option<Arc<dyn HopFactory>>);

/// Builds session chains with a given configuration and port allocator
#[derive(Debug, Clone)]
pub struct ChainBuilder {
    config: ChainConfig,
    allocator: Arc<dyn PortAllocator>,
}

impl Default for ChainBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChainBuilder {
    /// Default settings, process-wide allocator
    pub fn new() -> Self {
        Self {
            config: ChainConfig::default(),
            allocator: process_allocator(),
        }
    }

    /// Use `config`; a configured `port_base` gets its own allocator
    pub fn with_config(config: ChainConfig) -> Self {
        let config = config.validated();
        let allocator: Arc<dyn PortAllocator> = match config.port_base {
            Some(base) => Arc::new(EphemeralPorts::new(base)),
            None => process_allocator(),
        };
        Self { config, allocator }
    }

    pub fn with_allocator(mut self, allocator: Arc<dyn PortAllocator>) -> Self {
        self.allocator = allocator;
        self
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    pub fn requires_tunnel(&self, node: &dyn NetworkNode) -> bool {
        requires_tunnel(node)
    }

    pub fn is_locally_tunnelable(&self, node: &dyn NetworkNode) -> bool {
        is_locally_tunnelable_within(node, self.config.max_depth)
    }

    pub fn is_last(&self, node: &dyn NetworkNode) -> bool {
        is_last(node)
    }

    /// Build and start every hop needed to reach `address:remote_port` from
    /// `node`.
    ///
    /// Returns a [`NullSession`] when no hop is needed, the hop's own session
    /// when exactly one is, and a [`SessionChain`] otherwise. The outermost
    /// hop listens on `local_port`.
    ///
    /// Structural problems are reported before any hop is created. A hop
    /// failure is returned as soon as it happens; see the module docs for
    /// what happens to hops that were already started.
    pub async fn build(
        &self,
        node: &dyn NetworkNode,
        local_port: u16,
        remote_port: u16,
        address: &str,
    ) -> Result<Box<dyn TunnelSession>, ChainError> {
        let path = self.trace(node)?;
        let outermost = path.iter().rposition(|(_, factory)| factory.is_some());

        let mut hops: Vec<HopInfo> = Vec::new();
        let mut sessions: Vec<Box<dyn TunnelSession>> = Vec::new();

        for (position, (current, factory)) in path.iter().enumerate() {
            let Some(factory) = factory else {
                continue;
            };
            let index = sessions.len();

            let hop_local = if Some(position) == outermost {
                local_port
            } else {
                match self.allocator.next_port() {
                    Ok(port) => port,
                    Err(e) => return Err(self.abandon(sessions, e).await),
                }
            };
            let hop_remote = sessions
                .last()
                .map_or(remote_port, |previous| previous.local_port());
            let hop_address = if position == 0 {
                address
            } else {
                self.config.local_address.as_str()
            };

            debug!(
                "Creating hop {} for '{}': {} -> {}:{}",
                index,
                current.name(),
                hop_local,
                hop_address,
                hop_remote
            );

            let mut session = match factory.create(hop_local, hop_remote, hop_address).await {
                Ok(session) => session,
                Err(e) => {
                    let error = ChainError::HopCreation {
                        index,
                        node: current.name().to_string(),
                        source: e.into(),
                    };
                    return Err(self.abandon(sessions, error).await);
                }
            };

            if let Err(e) = session.start().await {
                if self.config.teardown_on_failure {
                    if let Err(stop_err) = session.stop().await {
                        warn!(
                            "Failed to clean up hop {} for '{}': {}",
                            index,
                            current.name(),
                            stop_err
                        );
                    }
                }
                let error = ChainError::HopStart {
                    index,
                    node: current.name().to_string(),
                    source: e.into(),
                };
                return Err(self.abandon(sessions, error).await);
            }

            hops.push(HopInfo {
                node: current.name().to_string(),
                local_port: session.local_port(),
                remote_port: hop_remote,
                address: hop_address.to_string(),
            });
            sessions.push(session);
        }

        Ok(Self::shape(hops, sessions, remote_port, address))
    }

    /// Collect the walk up front so structural errors surface before any
    /// hop exists
    fn trace<'a>(&self, node: &'a dyn NetworkNode) -> Result<Vec<PlannedNode<'a>>, ChainError> {
        let mut walk = Ancestors::new(node, self.config.max_depth);
        let path: Vec<PlannedNode<'a>> = walk
            .by_ref()
            .map(|current| {
                let factory = current.hop_factory();
                (current, factory)
            })
            .collect();

        match walk.finish() {
            WalkEnd::Root => Ok(path),
            WalkEnd::Foreign { node, parent } => Err(ChainError::NotTunnelable { node, parent }),
            WalkEnd::Cycle { node: repeated } => Err(ChainError::CyclicChain {
                target: node.name().to_string(),
                node: repeated,
            }),
            WalkEnd::DepthExceeded => Err(ChainError::ChainTooDeep {
                target: node.name().to_string(),
                limit: self.config.max_depth,
            }),
        }
    }

    fn shape(
        hops: Vec<HopInfo>,
        mut sessions: Vec<Box<dyn TunnelSession>>,
        remote_port: u16,
        address: &str,
    ) -> Box<dyn TunnelSession> {
        if sessions.len() > 1 {
            let chain = SessionChain::new(
                hops.into_iter().zip(sessions).collect(),
                remote_port,
                address,
            );
            info!("Tunnel chain established: {}", chain.path_description());
            return Box::new(chain);
        }

        match sessions.pop() {
            Some(single) => {
                info!(
                    "Tunnel established: localhost:{} -> {}:{}",
                    single.local_port(),
                    address,
                    remote_port
                );
                single
            }
            None => {
                debug!(
                    "No tunnel needed to reach {}:{}, connecting directly",
                    address, remote_port
                );
                Box::new(NullSession::new(remote_port))
            }
        }
    }

    async fn abandon(
        &self,
        mut started: Vec<Box<dyn TunnelSession>>,
        error: ChainError,
    ) -> ChainError {
        if started.is_empty() {
            return error;
        }

        if !self.config.teardown_on_failure {
            warn!(
                "Tunnel chain failed with {} hop(s) already started, leaving them running: {}",
                started.len(),
                error
            );
            return error;
        }

        for session in started.iter_mut().rev() {
            if let Err(e) = session.stop().await {
                warn!(
                    "Failed to stop hop on local port {} during teardown: {}",
                    session.local_port(),
                    e
                );
            }
        }
        debug!("Stopped {} hop(s) after chain failure", started.len());

        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::ChainNode;
    use anyhow::{bail, Result};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU16, Ordering};
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        Created {
            hop: &'static str,
            local: u16,
            remote: u16,
            address: String,
        },
        Started(&'static str),
        Stopped(&'static str),
    }

    type Journal = Arc<Mutex<Vec<Event>>>;

    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Fault {
        None,
        Create,
        Start,
    }

    struct RecordingHop {
        name: &'static str,
        journal: Journal,
        fault: Fault,
    }

    struct RecordingSession {
        name: &'static str,
        local: u16,
        remote: u16,
        running: bool,
        fail_start: bool,
        journal: Journal,
    }

    #[async_trait]
    impl HopFactory for RecordingHop {
        async fn create(
            &self,
            local_port: u16,
            remote_port: u16,
            address: &str,
        ) -> Result<Box<dyn TunnelSession>> {
            if self.fault == Fault::Create {
                bail!("{} is unreachable", self.name);
            }
            self.journal.lock().unwrap().push(Event::Created {
                hop: self.name,
                local: local_port,
                remote: remote_port,
                address: address.to_string(),
            });
            Ok(Box::new(RecordingSession {
                name: self.name,
                local: local_port,
                remote: remote_port,
                running: false,
                fail_start: self.fault == Fault::Start,
                journal: Arc::clone(&self.journal),
            }))
        }
    }

    #[async_trait]
    impl TunnelSession for RecordingSession {
        async fn start(&mut self) -> Result<()> {
            if self.fail_start {
                bail!("port {} already in use", self.local);
            }
            self.running = true;
            self.journal.lock().unwrap().push(Event::Started(self.name));
            Ok(())
        }

        async fn stop(&mut self) -> Result<()> {
            if self.running {
                self.running = false;
                self.journal.lock().unwrap().push(Event::Stopped(self.name));
            }
            Ok(())
        }

        fn is_running(&self) -> bool {
            self.running
        }

        fn local_port(&self) -> u16 {
            self.local
        }

        fn remote_port(&self) -> u16 {
            self.remote
        }
    }

    #[derive(Debug)]
    struct Sequence(AtomicU16);

    impl PortAllocator for Sequence {
        fn next_port(&self) -> Result<u16, ChainError> {
            Ok(self.0.fetch_add(1, Ordering::SeqCst))
        }
    }

    fn builder() -> ChainBuilder {
        ChainBuilder::new().with_allocator(Arc::new(Sequence(AtomicU16::new(41000))))
    }

    fn hop(name: &'static str, journal: &Journal, fault: Fault) -> Arc<dyn HopFactory> {
        Arc::new(RecordingHop {
            name,
            journal: Arc::clone(journal),
            fault,
        })
    }

    /// Target A behind B behind root C, each optionally tunneling
    fn three_nodes(journal: &Journal, faults: [Option<Fault>; 3]) -> ChainNode {
        let names = ["a", "b", "c"];
        let build = |i: usize| {
            let node = ChainNode::new(names[i]);
            match faults[i] {
                Some(fault) => node.with_hop_factory(hop(names[i], journal, fault)),
                None => node,
            }
        };
        let c = build(2).into_shared();
        let b = build(1).with_parent(c).into_shared();
        build(0).with_parent(b)
    }

    #[test]
    fn test_requires_tunnel() {
        let journal = Journal::default();
        let plain = three_nodes(&journal, [None, None, None]);
        assert!(!requires_tunnel(&plain));

        let root_only = three_nodes(&journal, [None, None, Some(Fault::None)]);
        assert!(requires_tunnel(&root_only));
    }

    #[test]
    fn test_requires_tunnel_ignores_bridgeability() {
        let journal = Journal::default();
        let node = ChainNode::new("db")
            .with_hop_factory(hop("db", &journal, Fault::None))
            .with_foreign_parent("vm console");
        assert!(requires_tunnel(&node));
        assert!(!is_locally_tunnelable(&node));
    }

    #[test]
    fn test_is_locally_tunnelable_without_any_hop() {
        let root = ChainNode::new("root").with_foreign_parent("serial line").into_shared();
        let middle = ChainNode::new("middle").with_parent(root).into_shared();
        let target = ChainNode::new("target").with_parent(middle);

        assert!(!requires_tunnel(&target));
        assert!(!is_locally_tunnelable(&target));

        let journal = Journal::default();
        assert!(is_locally_tunnelable(&three_nodes(&journal, [None, None, None])));
    }

    #[test]
    fn test_is_last() {
        let journal = Journal::default();
        let c = ChainNode::new("c").into_shared();
        let b = ChainNode::new("b")
            .with_hop_factory(hop("b", &journal, Fault::None))
            .with_parent(Arc::clone(&c))
            .into_shared();
        let a = ChainNode::new("a")
            .with_hop_factory(hop("a", &journal, Fault::None))
            .with_parent(Arc::clone(&b));

        assert!(!is_last(&a));
        assert!(is_last(b.as_ref()));
        assert!(is_last(c.as_ref()));
    }

    #[test]
    fn test_predicates_see_past_the_depth_limit() {
        let journal = Journal::default();
        let root = ChainNode::new("root")
            .with_hop_factory(hop("root", &journal, Fault::None))
            .into_shared();
        let mut current = Arc::clone(&root);
        for i in 0..40 {
            current = ChainNode::new(format!("n{i}"))
                .with_parent(current)
                .into_shared();
        }

        assert!(requires_tunnel(current.as_ref()));
        assert!(!is_last(current.as_ref()));
        assert!(is_last(root.as_ref()));
        assert!(!is_locally_tunnelable(current.as_ref()));

        let shallow = ChainBuilder::with_config(ChainConfig {
            max_depth: 4,
            ..ChainConfig::default()
        });
        assert!(shallow.requires_tunnel(current.as_ref()));
        assert!(!shallow.is_last(current.as_ref()));
    }

    #[test]
    fn test_walk_stops_at_repeated_node() {
        let a = Arc::new(LoopNode {
            name: "a",
            parent: Mutex::new(None),
        });
        let b: Arc<dyn NetworkNode> = Arc::new(LoopNode {
            name: "b",
            parent: Mutex::new(Some(a.clone() as Arc<dyn NetworkNode>)),
        });
        *a.parent.lock().unwrap() = Some(b);

        let mut walk = Ancestors::unbounded(a.as_ref());
        let names: Vec<String> = walk.by_ref().map(|n| n.name().to_string()).collect();
        assert_eq!(names, ["a", "b"]);
        assert_eq!(
            walk.end(),
            Some(&WalkEnd::Cycle {
                node: "a".to_string()
            })
        );
        assert!(is_last(a.as_ref()));

        *a.parent.lock().unwrap() = None;
    }

    #[tokio::test]
    async fn test_no_hop_returns_null_session() {
        let journal = Journal::default();
        let target = three_nodes(&journal, [None, None, None]);

        let mut session = builder().build(&target, 8080, 5432, "db").await.unwrap();
        assert_eq!(session.local_port(), 5432);
        assert_eq!(session.remote_port(), 5432);
        assert_eq!(session.hop_count(), 0);
        assert!(!session.is_running());
        session.stop().await.unwrap();
        assert!(journal.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_single_hop_on_target() {
        let journal = Journal::default();
        let target = three_nodes(&journal, [Some(Fault::None), None, None]);

        let session = builder().build(&target, 8080, 5432, "db").await.unwrap();
        assert_eq!(session.hop_count(), 1);
        assert_eq!(session.local_port(), 8080);
        assert_eq!(session.remote_port(), 5432);
        assert!(session.is_running());
        assert_eq!(
            *journal.lock().unwrap(),
            vec![
                Event::Created {
                    hop: "a",
                    local: 8080,
                    remote: 5432,
                    address: "db".to_string()
                },
                Event::Started("a"),
            ]
        );
    }

    #[tokio::test]
    async fn test_single_hop_on_ancestor_targets_localhost() {
        let journal = Journal::default();
        let target = three_nodes(&journal, [None, Some(Fault::None), None]);

        let session = builder().build(&target, 8080, 5432, "db").await.unwrap();
        assert_eq!(session.hop_count(), 1);
        assert_eq!(
            journal.lock().unwrap()[0],
            Event::Created {
                hop: "b",
                local: 8080,
                remote: 5432,
                address: "localhost".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_three_hop_wiring() {
        let journal = Journal::default();
        let ok = Some(Fault::None);
        let target = three_nodes(&journal, [ok, ok, ok]);

        let session = builder().build(&target, 8080, 5432, "db").await.unwrap();

        assert_eq!(
            *journal.lock().unwrap(),
            vec![
                Event::Created {
                    hop: "a",
                    local: 41000,
                    remote: 5432,
                    address: "db".to_string()
                },
                Event::Started("a"),
                Event::Created {
                    hop: "b",
                    local: 41001,
                    remote: 41000,
                    address: "localhost".to_string()
                },
                Event::Started("b"),
                Event::Created {
                    hop: "c",
                    local: 8080,
                    remote: 41001,
                    address: "localhost".to_string()
                },
                Event::Started("c"),
            ]
        );
        assert_eq!(session.hop_count(), 3);
        assert_eq!(session.local_port(), 8080);
        assert_eq!(session.remote_port(), 5432);
        assert!(session.is_running());
    }

    #[tokio::test]
    async fn test_configured_port_base_feeds_interior_hops() {
        let journal = Journal::default();
        let ok = Some(Fault::None);
        let target = three_nodes(&journal, [ok, None, ok]);

        let builder = ChainBuilder::with_config(ChainConfig {
            port_base: Some(47000),
            ..ChainConfig::default()
        });
        let session = builder.build(&target, 8080, 5432, "db").await.unwrap();
        assert_eq!(session.hop_count(), 2);

        let events = journal.lock().unwrap();
        assert!(matches!(
            events[0],
            Event::Created {
                hop: "a",
                local: 47000,
                ..
            }
        ));
        assert!(matches!(
            events[2],
            Event::Created {
                hop: "c",
                local: 8080,
                remote: 47000,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_plain_nodes_between_hops_are_skipped() {
        let journal = Journal::default();
        let ok = Some(Fault::None);
        let target = three_nodes(&journal, [ok, None, ok]);

        let session = builder().build(&target, 8080, 5432, "db").await.unwrap();
        assert_eq!(session.hop_count(), 2);
        assert_eq!(
            journal.lock().unwrap()[2],
            Event::Created {
                hop: "c",
                local: 8080,
                remote: 41000,
                address: "localhost".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_structural_error_creates_nothing() {
        let journal = Journal::default();
        let root = ChainNode::new("root")
            .with_hop_factory(hop("root", &journal, Fault::None))
            .with_foreign_parent("docker context")
            .into_shared();
        let target = ChainNode::new("target")
            .with_hop_factory(hop("target", &journal, Fault::None))
            .with_parent(root);

        let err = builder()
            .build(&target, 8080, 5432, "db")
            .await
            .err()
            .expect("build should fail");
        match err {
            ChainError::NotTunnelable { node, parent } => {
                assert_eq!(node, "root");
                assert_eq!(parent, "docker context");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(journal.lock().unwrap().is_empty());
    }

    struct LoopNode {
        name: &'static str,
        parent: Mutex<Option<Arc<dyn NetworkNode>>>,
    }

    impl NetworkNode for LoopNode {
        fn name(&self) -> &str {
            self.name
        }

        fn network_parent(&self) -> Option<NetworkParent> {
            self.parent.lock().unwrap().clone().map(NetworkParent::Node)
        }
    }

    #[tokio::test]
    async fn test_cycle_is_rejected() {
        let a = Arc::new(LoopNode {
            name: "a",
            parent: Mutex::new(None),
        });
        let b: Arc<dyn NetworkNode> = Arc::new(LoopNode {
            name: "b",
            parent: Mutex::new(Some(a.clone() as Arc<dyn NetworkNode>)),
        });
        *a.parent.lock().unwrap() = Some(b);

        assert!(!is_locally_tunnelable(a.as_ref()));
        assert!(!requires_tunnel(a.as_ref()));

        let err = builder()
            .build(a.as_ref(), 1, 2, "x")
            .await
            .err()
            .expect("build should fail");
        assert!(matches!(err, ChainError::CyclicChain { ref node, .. } if node == "a"));

        // Break the cycle so the nodes can be freed
        *a.parent.lock().unwrap() = None;
    }

    #[tokio::test]
    async fn test_depth_limit() {
        let mut current = ChainNode::new("n0").into_shared();
        for i in 1..10 {
            current = ChainNode::new(format!("n{i}"))
                .with_parent(current)
                .into_shared();
        }

        let config = ChainConfig {
            max_depth: 5,
            ..ChainConfig::default()
        };
        let limited = ChainBuilder::with_config(config);
        assert!(!limited.is_locally_tunnelable(current.as_ref()));
        assert!(builder().is_locally_tunnelable(current.as_ref()));

        let err = limited
            .build(current.as_ref(), 1, 2, "x")
            .await
            .err()
            .expect("build should fail");
        assert!(matches!(err, ChainError::ChainTooDeep { limit: 5, .. }));
    }

    #[tokio::test]
    async fn test_creation_failure_leaves_started_hops_running() {
        let journal = Journal::default();
        let ok = Some(Fault::None);
        let target = three_nodes(&journal, [ok, Some(Fault::Create), ok]);

        let err = builder()
            .build(&target, 8080, 5432, "db")
            .await
            .err()
            .expect("build should fail");
        match &err {
            ChainError::HopCreation { index, node, .. } => {
                assert_eq!(*index, 1);
                assert_eq!(node, "b");
            }
            other => panic!("unexpected error: {other}"),
        }

        let events = journal.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1], Event::Started("a"));
        assert!(!events.iter().any(|e| matches!(e, Event::Stopped(_))));
    }

    #[tokio::test]
    async fn test_teardown_on_failure_stops_outermost_first() {
        let journal = Journal::default();
        let c = ChainNode::new("c")
            .with_hop_factory(hop("c", &journal, Fault::Start))
            .into_shared();
        let b = ChainNode::new("b")
            .with_hop_factory(hop("b", &journal, Fault::None))
            .with_parent(c)
            .into_shared();
        let a = ChainNode::new("a")
            .with_hop_factory(hop("a", &journal, Fault::None))
            .with_parent(b);

        let config = ChainConfig {
            teardown_on_failure: true,
            ..ChainConfig::default()
        };
        let builder = ChainBuilder::with_config(config)
            .with_allocator(Arc::new(Sequence(AtomicU16::new(41000))));

        let err = builder
            .build(&a, 8080, 5432, "db")
            .await
            .err()
            .expect("build should fail");
        assert!(matches!(err, ChainError::HopStart { index: 2, .. }));

        let stops: Vec<_> = journal
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                Event::Stopped(name) => Some(*name),
                _ => None,
            })
            .collect();
        assert_eq!(stops, vec!["b", "a"]);
    }

    #[derive(Debug)]
    struct Exhausted;

    impl PortAllocator for Exhausted {
        fn next_port(&self) -> Result<u16, ChainError> {
            Err(ChainError::PortsExhausted { candidate: 65536 })
        }
    }

    #[tokio::test]
    async fn test_port_exhaustion_is_propagated() {
        let journal = Journal::default();
        let ok = Some(Fault::None);
        let target = three_nodes(&journal, [ok, None, ok]);

        let err = ChainBuilder::new()
            .with_allocator(Arc::new(Exhausted))
            .build(&target, 8080, 5432, "db")
            .await
            .err()
            .expect("build should fail");
        assert!(matches!(err, ChainError::PortsExhausted { .. }));
        assert!(journal.lock().unwrap().is_empty());
    }
}
