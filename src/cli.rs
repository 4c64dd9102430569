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

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "hopchain",
    version,
    about = "Open a chain of loopback relay hops to a target and hold it until Ctrl-C",
    after_help = "EXAMPLES:\n  Single relay:           hopchain -t db.internal:5432 -L 15432\n  Three stacked relays:   hopchain -t 10.0.0.5:22 -L 2222 --hops 3\n  With a config file:     hopchain -t web:80 -F chain.yaml -vv"
)]
pub struct Cli {
    #[arg(
        short = 't',
        long,
        value_name = "HOST:PORT",
        help = "Target to reach, e.g. 'db.internal:5432' or '[::1]:22'"
    )]
    pub target: String,

    #[arg(
        short = 'L',
        long,
        default_value_t = 0,
        help = "Local port of the outermost hop (0 lets the OS choose)"
    )]
    pub local_port: u16,

    #[arg(
        long,
        default_value_t = 1,
        help = "Number of relay hops to stack in front of the target (0 connects directly)"
    )]
    pub hops: usize,

    #[arg(
        short = 'F',
        long,
        value_name = "FILE",
        env = "HOPCHAIN_CONFIG",
        help = "YAML chain configuration file"
    )]
    pub config: Option<PathBuf>,

    #[arg(
        short = 'v',
        long,
        action = ArgAction::Count,
        help = "Increase verbosity (-v, -vv, -vvv)"
    )]
    pub verbose: u8,
}

impl Cli {
    /// Split `--target` into host and port
    pub fn parse_target(&self) -> Result<(String, u16)> {
        parse_host_port(&self.target)
    }
}

/// Parse `host:port`, accepting bracketed IPv6 literals
pub fn parse_host_port(spec: &str) -> Result<(String, u16)> {
    let spec = spec.trim();
    let (host, port) = spec
        .rsplit_once(':')
        .with_context(|| format!("Target '{spec}' must be in HOST:PORT form"))?;

    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        bail!("Target '{spec}' has an empty host");
    }
    if host.contains(':') && !spec.starts_with('[') {
        bail!("IPv6 target '{spec}' must be written as [ADDRESS]:PORT");
    }

    let port = port
        .parse::<u16>()
        .with_context(|| format!("Invalid port in target '{spec}'"))?;
    if port == 0 {
        bail!("Target port cannot be 0");
    }

    Ok((host.to_string(), port))
}
