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

pub mod arbiter;
pub mod channel;
pub mod config;
mod error;
pub mod flit;
pub mod network;
pub mod router;
pub mod routing;
pub mod trace;
pub mod traffic;

// Public types
// type to use for cycles
pub type Cycle = usize;
pub type PortId = usize;
pub type VcId = usize;
pub type RouterId = usize;
pub type NodeId = usize;
pub type PacketId = u64;
pub type FlitId = u64;
/// Larger wins arbitration.
pub type Priority = i64;

pub use crate::arbiter::{Arbiter, ArbiterKind, Grant};
pub use crate::channel::Channel;
pub use crate::config::{Config, NetworkConfiguration, RouterConfiguration, TrafficConfiguration};
pub use crate::error::Error;
pub use crate::flit::{Credit, Flit, Lookahead, OutputSet, Packet, RouteCandidate};
pub use crate::network::{Delivery, Network, Topology};
pub use crate::router::{
    Arrivals, CreditLedger, Departures, Downstream, FlowControl, KillPolicy, Proposal, Router,
    RouterKind, StallCounters, StallReason,
};
pub use crate::routing::{MeshShape, RouteRequest, RoutingFunction};
pub use crate::trace::{Event, Observer, SimulationCallbacks, TextTrace};
pub use crate::traffic::{TrafficGenerator, TrafficPattern};
