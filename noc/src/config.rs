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

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::router::{FlowControl, KillPolicy};
use crate::routing::{ClassPartition, MeshShape};
use crate::{Cycle, Error, VcId};

/// Flits per VC buffer when nothing else is configured.
const VC_BUF_SIZE: usize = 8;

/// Routers a flit may cross in one cycle when nothing else is configured.
const HPC_MAX: usize = 4;

/// Parameters shared by all routers of a network.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RouterConfiguration {
    /// Router variant: "iq"/"vct" (buffered), "bypass_vct" or "smart".
    pub router: String,
    pub num_vcs: usize,
    /// Flits per input VC; also the credit capacity upstream.
    pub vc_buf_size: usize,
    pub classes: usize,
    pub start_vc: Vec<VcId>,
    pub end_vc: Vec<VcId>,
    pub flow_control: FlowControl,
    pub sw_input_arbiter: String,
    pub sw_output_arbiter: String,
    pub disable_bypass: bool,
    /// Buffered switch winners send a fresh lookahead downstream.
    pub regain_bypass: bool,
    /// Packets between one source and destination arrive in the order they
    /// were sent. Lookaheads may not overtake packets buffered at the same
    /// input, and each flow keeps to one VC of its class.
    pub guarantee_order: bool,
    pub kill_policy: KillPolicy,
    /// Routers a flit may cross in one cycle (smart routers). One means no
    /// multi-hop traversal.
    pub hpc_max: usize,
    /// Lookaheads going straight beat turning ones (smart routers).
    pub prefer_straight: bool,
}

impl Default for RouterConfiguration {
    fn default() -> Self {
        Self {
            router: "bypass_vct".to_string(),
            num_vcs: 2,
            vc_buf_size: VC_BUF_SIZE,
            classes: 1,
            start_vc: Vec::new(),
            end_vc: Vec::new(),
            flow_control: FlowControl::default(),
            sw_input_arbiter: "round_robin".to_string(),
            sw_output_arbiter: "matrix".to_string(),
            disable_bypass: false,
            regain_bypass: true,
            guarantee_order: false,
            kill_policy: KillPolicy::default(),
            hpc_max: HPC_MAX,
            prefer_straight: false,
        }
    }
}

impl RouterConfiguration {
    pub fn class_partition(&self) -> Result<ClassPartition, Error> {
        ClassPartition::new(self.num_vcs, self.classes, &self.start_vc, &self.end_vc)
    }

    /// The longest packet that can ever leave a buffer: a head waiting for
    /// room for its whole packet never moves if the packet outgrows a VC.
    pub fn max_packet_size(&self) -> Option<usize> {
        if self.flow_control.head_needs_whole_packet() {
            Some(self.vc_buf_size)
        } else {
            None
        }
    }

    pub fn check_packet_size(&self, size: usize) -> Result<(), Error> {
        if size == 0 {
            return Err(Error::InvalidConfiguration(
                "packets have at least one flit".to_string(),
            ));
        }
        match self.max_packet_size() {
            Some(limit) if size > limit => Err(Error::InvalidConfiguration(format!(
                "packets of {} flits do not fit VCs of {} slots under {:?} flow control",
                size, limit, self.flow_control
            ))),
            _ => Ok(()),
        }
    }
}

/// Wiring and routing of the simulated network.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfiguration {
    pub topology: String,
    /// Routers per dimension.
    pub k: usize,
    /// Dimensions.
    pub n: usize,
    pub routing_function: String,
    /// Latency of every flit, credit and lookahead channel.
    pub channel_latency: Cycle,
    pub router: RouterConfiguration,
}

impl Default for NetworkConfiguration {
    fn default() -> Self {
        Self {
            topology: "mesh".to_string(),
            k: 4,
            n: 2,
            routing_function: "dim_order".to_string(),
            channel_latency: 1,
            router: RouterConfiguration::default(),
        }
    }
}

impl NetworkConfiguration {
    pub fn shape(&self) -> Result<MeshShape, Error> {
        if self.topology != "mesh" {
            return Err(Error::InvalidConfiguration(format!(
                "unsupported topology {}",
                self.topology
            )));
        }
        if self.k < 2 || self.n == 0 {
            return Err(Error::InvalidConfiguration(format!(
                "a mesh needs k >= 2 and n >= 1, got k = {}, n = {}",
                self.k, self.n
            )));
        }
        Ok(MeshShape::new(self.k, self.n))
    }
}

/// Synthetic traffic offered by the terminals.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct TrafficConfiguration {
    pub pattern: String,
    /// Flits per node per cycle.
    pub injection_rate: f64,
    pub packet_size: usize,
    pub seed: u64,
}

impl Default for TrafficConfiguration {
    fn default() -> Self {
        Self {
            pattern: "uniform".to_string(),
            injection_rate: 0.05,
            packet_size: 4,
            seed: 0x1234_5678,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub network: NetworkConfiguration,
    pub traffic: TrafficConfiguration,
}

impl Config {
    pub fn from_file(file_name: &str) -> Result<Self, Error> {
        let file = File::open(Path::new(file_name))
            .map_err(|e| Error::ConfigFile(format!("{}: {}", file_name, e)))?;
        let reader = BufReader::new(file);
        serde_yaml::from_reader(reader).map_err(|e| Error::ConfigFile(e.to_string()))
    }

    pub fn from_str(config: &str) -> Result<Self, Error> {
        serde_yaml::from_str(config).map_err(|e| Error::ConfigFile(e.to_string()))
    }
}
