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

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;

use hopchain::{
    forwarding::TcpRelayFactory, utils::init_logging, ChainBuilder, ChainConfig, ChainNode, Cli,
    HopFactory, NetworkNode,
};

/// Build `hops` relay nodes, the first one standing for the target and the
/// last one being the root
fn relay_path(hops: usize) -> ChainNode {
    let factory: Arc<dyn HopFactory> = Arc::new(TcpRelayFactory::new());
    if hops == 0 {
        return ChainNode::new("target");
    }

    let mut parent: Option<Arc<dyn NetworkNode>> = None;
    for i in (1..hops).rev() {
        let mut node = ChainNode::new(format!("relay-{i}")).with_hop_factory(Arc::clone(&factory));
        if let Some(parent) = parent.take() {
            node = node.with_parent(parent);
        }
        parent = Some(node.into_shared());
    }

    let target = ChainNode::new("target").with_hop_factory(factory);
    match parent {
        Some(parent) => target.with_parent(parent),
        None => target,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let (host, port) = cli.parse_target()?;
    let config = ChainConfig::load(cli.config.as_deref()).await?;
    tracing::debug!("Chain configuration: {:?}", config);

    let builder = ChainBuilder::with_config(config);
    let target = relay_path(cli.hops);

    let mut session = builder
        .build(&target, cli.local_port, port, &host)
        .await
        .with_context(|| format!("Failed to open tunnel chain to {host}:{port}"))?;

    if session.hop_count() == 0 {
        println!("No hop needed, connect directly to {host}:{port}");
        return Ok(());
    }

    println!(
        "Forwarding localhost:{} -> {}:{} through {} hop(s). Press Ctrl-C to stop.",
        session.local_port(),
        host,
        port,
        session.hop_count()
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    session.stop().await?;
    println!("Tunnel closed");
    Ok(())
}
