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

use super::TunnelSession;
use anyhow::Result;
use async_trait::async_trait;

/// Session returned when the target is reachable without any hop.
///
/// Holds no resources. Both ports report the target port so callers can
/// connect to `local_port()` without checking which shape they received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NullSession {
    port: u16,
}

impl NullSession {
    pub fn new(target_port: u16) -> Self {
        Self { port: target_port }
    }
}

#[async_trait]
impl TunnelSession for NullSession {
    async fn start(&mut self) -> Result<()> {
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        Ok(())
    }

    fn is_running(&self) -> bool {
        false
    }

    fn local_port(&self) -> u16 {
        self.port
    }

    fn remote_port(&self) -> u16 {
        self.port
    }

    fn hop_count(&self) -> usize {
        0
    }
}
