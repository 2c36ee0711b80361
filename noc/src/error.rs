// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fmt;

use crate::{PacketId, PortId, RouterId, VcId};

/// Errors raised while building or stepping a network.
///
/// Configuration errors come out of constructors. Protocol errors come out of
/// the per-cycle step functions and mean the pipeline itself is broken; the
/// run must stop. Contention (busy or full buffers, lost arbitration) is never
/// reported here, it is counted as a stall.
#[derive(Debug, Eq, PartialEq)]
pub enum Error {
    // configuration
    UnknownRouterType(String),
    UnknownRoutingFunction(String),
    UnknownArbiter(String),
    UnknownTrafficPattern(String),
    InvalidVcPartition {
        class: usize,
        begin: VcId,
        end: VcId,
        num_vcs: usize,
    },
    InvalidConfiguration(String),
    InvalidLatency(usize),
    PortMismatch {
        router: RouterId,
        expected: usize,
        found: usize,
    },
    ConfigFile(String),

    // protocol
    InvalidPort {
        router: RouterId,
        port: PortId,
    },
    InvalidVc {
        port: PortId,
        vc: VcId,
    },
    EmptyRouteSet {
        router: RouterId,
        pid: PacketId,
    },
    CreditUnderflow {
        vc: VcId,
    },
    CreditOverflow {
        vc: VcId,
        capacity: usize,
    },
    VcDoubleAllocation {
        vc: VcId,
        owner: PacketId,
        requester: PacketId,
    },
    BufferOverflow {
        port: PortId,
        vc: VcId,
    },
    BypassMismatch {
        router: RouterId,
        input: PortId,
        vc: VcId,
        expected: PacketId,
        found: PacketId,
    },
    UnallocatedVc {
        router: RouterId,
        input: PortId,
        vc: VcId,
    },
    ExpressConflict {
        router: RouterId,
        output: PortId,
    },
    ChannelOverrun,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::UnknownRouterType(name) => write!(f, "ERROR: Invalid router type: {}", name),
            Self::UnknownRoutingFunction(name) => {
                write!(f, "ERROR: Invalid routing function: {}", name)
            }
            Self::UnknownArbiter(name) => write!(f, "ERROR: Invalid arbiter type: {}", name),
            Self::UnknownTrafficPattern(name) => {
                write!(f, "ERROR: Invalid traffic pattern: {}", name)
            }
            Self::InvalidVcPartition {
                class,
                begin,
                end,
                num_vcs,
            } => write!(
                f,
                "ERROR: Invalid VC range [{},{}] for class {} ({} VCs)",
                begin, end, class, num_vcs
            ),
            Self::InvalidConfiguration(msg) => write!(f, "ERROR: Invalid configuration: {}", msg),
            Self::InvalidLatency(latency) => {
                write!(f, "ERROR: Channel latency must be at least 1, got {}", latency)
            }
            Self::PortMismatch {
                router,
                expected,
                found,
            } => write!(
                f,
                "ERROR: Router {} expects {} ports, wiring provides {}",
                router, expected, found
            ),
            Self::ConfigFile(msg) => write!(f, "ERROR: Could not read configuration: {}", msg),
            Self::InvalidPort { router, port } => {
                write!(f, "ERROR: Invalid port {} for router {}", port, router)
            }
            Self::InvalidVc { port, vc } => {
                write!(f, "ERROR: Invalid VC {} at port {}", vc, port)
            }
            Self::EmptyRouteSet { router, pid } => write!(
                f,
                "ERROR: Empty route set for packet {} at router {}",
                pid, router
            ),
            Self::CreditUnderflow { vc } => {
                write!(f, "ERROR: Credit returned for empty VC {}", vc)
            }
            Self::CreditOverflow { vc, capacity } => write!(
                f,
                "ERROR: Flit sent to full VC {} (capacity {})",
                vc, capacity
            ),
            Self::VcDoubleAllocation {
                vc,
                owner,
                requester,
            } => write!(
                f,
                "ERROR: VC {} owned by packet {} allocated to packet {}",
                vc, owner, requester
            ),
            Self::BufferOverflow { port, vc } => {
                write!(f, "ERROR: Input buffer overflow at port {} VC {}", port, vc)
            }
            Self::BypassMismatch {
                router,
                input,
                vc,
                expected,
                found,
            } => write!(
                f,
                "ERROR: Router {} input {} VC {} reserved for packet {}, packet {} arrived",
                router, input, vc, expected, found
            ),
            Self::UnallocatedVc { router, input, vc } => write!(
                f,
                "ERROR: Body flit at router {} input {} VC {} has no output",
                router, input, vc
            ),
            Self::ExpressConflict { router, output } => write!(
                f,
                "ERROR: Express flit at router {} found output {} already taken",
                router, output
            ),
            _ => write!(f, "{:?}", self),
        }
    }
}

// Needed so `anyhow::Result` in the binaries can carry our errors.
impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}
