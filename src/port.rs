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

//! Ephemeral local ports for interior hops
//!
//! Ports handed out here are unique for the lifetime of the allocator, but
//! nothing checks that the operating system considers them free, and values
//! are never reused. The counter grows without wrapping; once it runs past
//! `u16::MAX` every further allocation fails with
//! [`ChainError::PortsExhausted`].

use crate::error::ChainError;
use once_cell::sync::Lazy;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// First port handed out by the process-wide allocator
pub const EPHEMERAL_PORT_BASE: u16 = 40000;

/// Source of local ports for interior hops
pub trait PortAllocator: Send + Sync + fmt::Debug {
    fn next_port(&self) -> Result<u16, ChainError>;
}

/// Monotonic port counter starting at a fixed base
#[derive(Debug)]
pub struct EphemeralPorts {
    base: u16,
    issued: AtomicU32,
}

impl EphemeralPorts {
    pub const fn new(base: u16) -> Self {
        Self {
            base,
            issued: AtomicU32::new(0),
        }
    }

    pub fn base(&self) -> u16 {
        self.base
    }

    /// Number of allocations made so far, including failed ones
    pub fn issued(&self) -> u32 {
        self.issued.load(Ordering::Relaxed)
    }
}

impl PortAllocator for EphemeralPorts {
    fn next_port(&self) -> Result<u16, ChainError> {
        let offset = self.issued.fetch_add(1, Ordering::Relaxed);
        let candidate = u32::from(self.base).saturating_add(offset);
        u16::try_from(candidate).map_err(|_| ChainError::PortsExhausted { candidate })
    }
}

static PROCESS_PORTS: Lazy<Arc<EphemeralPorts>> =
    Lazy::new(|| Arc::new(EphemeralPorts::new(EPHEMERAL_PORT_BASE)));

/// The allocator shared by every chain in the process
pub fn process_allocator() -> Arc<dyn PortAllocator> {
    Arc::clone(&*PROCESS_PORTS) as Arc<dyn PortAllocator>
}
