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

//! Chain construction settings.
//!
//! Settings are resolved with the following precedence (highest to lowest):
//! 1. Environment variables (`HOPCHAIN_*`)
//! 2. Configuration file (YAML)
//! 3. Default values
//!
//! # Environment Variables
//!
//! - `HOPCHAIN_PORT_BASE` - first port of a dedicated ephemeral allocator
//! - `HOPCHAIN_MAX_DEPTH` - maximum number of nodes walked per chain
//! - `HOPCHAIN_TEARDOWN_ON_FAILURE` - `true`/`false`, stop started hops when a later hop fails

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use tokio::fs;

/// Default maximum number of nodes walked from a target to its root
pub const DEFAULT_MAX_DEPTH: usize = 32;

/// Upper bound for `max_depth`, whatever the configuration says
pub const ABSOLUTE_MAX_DEPTH: usize = 256;

/// Address interior hops forward to by default
pub const DEFAULT_LOCAL_ADDRESS: &str = "localhost";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    /// First port of a dedicated allocator. `None` shares the process-wide
    /// counter, which starts at [`EPHEMERAL_PORT_BASE`].
    ///
    /// [`EPHEMERAL_PORT_BASE`]: crate::port::EPHEMERAL_PORT_BASE
    pub port_base: Option<u16>,
    pub max_depth: usize,
    /// Stop hops that were already started when a later hop fails.
    /// Off by default: started hops are left running.
    pub teardown_on_failure: bool,
    /// Address every hop except the innermost forwards to
    pub local_address: String,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            port_base: None,
            max_depth: DEFAULT_MAX_DEPTH,
            teardown_on_failure: false,
            local_address: DEFAULT_LOCAL_ADDRESS.to_string(),
        }
    }
}

impl ChainConfig {
    /// Parse a YAML document and clamp out-of-range values
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: ChainConfig = serde_yaml::from_str(yaml).context(
            "Failed to parse chain configuration. Please check the YAML syntax is valid.",
        )?;
        Ok(config.validated())
    }

    /// Load from `path` (defaults when the file does not exist), then apply
    /// environment overrides.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) if path.exists() => {
                let content = fs::read_to_string(path).await.with_context(|| {
                    format!("Failed to read chain configuration at {}", path.display())
                })?;
                Self::from_yaml_str(&content)
                    .with_context(|| format!("Invalid chain configuration at {}", path.display()))?
            }
            Some(path) => {
                tracing::debug!(
                    "Chain configuration not found at {:?}, using defaults",
                    path
                );
                Self::default()
            }
            None => Self::default(),
        };

        config.apply_env_overrides();
        Ok(config.validated())
    }

    /// Override fields from `HOPCHAIN_*` variables. Unparsable values are
    /// ignored with a warning.
    pub fn apply_env_overrides(&mut self) {
        if let Some(base) = parse_env::<u16>("HOPCHAIN_PORT_BASE") {
            self.port_base = Some(base);
        }
        if let Some(depth) = parse_env::<usize>("HOPCHAIN_MAX_DEPTH") {
            self.max_depth = depth;
        }
        if let Some(teardown) = parse_env::<bool>("HOPCHAIN_TEARDOWN_ON_FAILURE") {
            self.teardown_on_failure = teardown;
        }
    }

    /// Clamp `max_depth` into `1..=ABSOLUTE_MAX_DEPTH` and restore an empty
    /// local address to the default
    pub fn validated(mut self) -> Self {
        if self.max_depth == 0 {
            tracing::warn!(
                "max_depth cannot be 0, using default: {}",
                DEFAULT_MAX_DEPTH
            );
            self.max_depth = DEFAULT_MAX_DEPTH;
        } else if self.max_depth > ABSOLUTE_MAX_DEPTH {
            tracing::warn!(
                "max_depth={} exceeds absolute maximum {}, capping at {}",
                self.max_depth,
                ABSOLUTE_MAX_DEPTH,
                ABSOLUTE_MAX_DEPTH
            );
            self.max_depth = ABSOLUTE_MAX_DEPTH;
        }

        if self.local_address.trim().is_empty() {
            self.local_address = DEFAULT_LOCAL_ADDRESS.to_string();
        }

        self
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = env::var(name).ok()?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Ignoring invalid value for {}: {:?}", name, raw);
            None
        }
    }
}
