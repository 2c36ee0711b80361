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

#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;

use noc::{
    Arrivals, Credit, Cycle, Departures, Downstream, Error, Event, Flit, Lookahead, Network,
    NetworkConfiguration, Observer, OutputSet, Packet, PacketId, PortId, RouteRequest, Router,
    RouterConfiguration, RouterKind, RoutingFunction, SimulationCallbacks, TextTrace,
    TrafficConfiguration, TrafficGenerator, VcId,
};

pub fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Offers traffic for `cycles` cycles, then lets the network drain.
pub fn run_traffic(
    config: &NetworkConfiguration,
    traffic: &TrafficConfiguration,
    cycles: Cycle,
    callbacks: &mut SimulationCallbacks,
) -> Network {
    let mut network = Network::new(config).unwrap();
    let mut generator = TrafficGenerator::new(traffic, config).unwrap();
    for _ in 0..cycles {
        generator.generate(&mut network).unwrap();
        network.step(callbacks).unwrap();
    }
    assert!(
        network.run_until_drained(20 * cycles, callbacks).unwrap(),
        "{} network did not drain",
        network.kind()
    );
    network
}

/// Sends every packet to the output port numbered like its destination.
#[derive(Debug)]
pub struct PortRouting {
    pub num_vcs: usize,
}

impl RoutingFunction for PortRouting {
    fn name(&self) -> &str {
        "port"
    }

    fn route(&self, request: &RouteRequest) -> Result<OutputSet, Error> {
        let mut outputs = OutputSet::new();
        outputs.add_range(request.dest, 0, self.num_vcs - 1, 0);
        Ok(outputs)
    }

    fn injection_vcs(&self, _cl: usize) -> (VcId, VcId) {
        (0, self.num_vcs - 1)
    }
}

/// The flits of packet `pid` headed for output `dest`, routed for the
/// router they are fed to.
pub fn packet(pid: PacketId, dest: PortId, size: usize, num_vcs: usize) -> Vec<Flit> {
    let mut flits = Packet::new(pid, 0, dest, size, 0).into_flits(pid * 100);
    let mut route = OutputSet::new();
    route.add_range(dest, 0, num_vcs - 1, 0);
    flits[0].la_route_set = route;
    flits
}

/// A single router whose outputs all lead to sinks that return a credit for
/// every flit one cycle after receiving it.
pub struct SingleRouter {
    pub router: Router,
    pub routing: PortRouting,
    pub trace: TextTrace,
    callbacks: SimulationCallbacks,
    returned: Vec<Option<Credit>>,
    /// Sinks return credits; cleared to model a downstream that never drains.
    pub return_credits: bool,
    pub cycle: Cycle,
}

impl SingleRouter {
    pub fn new(kind: RouterKind, ports: usize, config: &RouterConfiguration) -> Self {
        let downstream = (0..ports).map(Downstream::Terminal).collect();
        Self::with_downstream(kind, ports, downstream, config)
    }

    pub fn with_downstream(
        kind: RouterKind,
        inputs: usize,
        downstream: Vec<Downstream>,
        config: &RouterConfiguration,
    ) -> Self {
        let outputs = downstream.len();
        let router = Router::new(0, kind, inputs, downstream, config).unwrap();
        let trace = TextTrace::all();
        Self {
            router,
            routing: PortRouting {
                num_vcs: config.num_vcs,
            },
            callbacks: SimulationCallbacks::new(Box::new(trace.clone())),
            trace,
            returned: (0..outputs).map(|_| None).collect(),
            return_credits: true,
            cycle: 0,
        }
    }

    /// Runs one cycle with the given arrivals.
    pub fn step(
        &mut self,
        flits: Vec<(PortId, Flit)>,
        lookaheads: Vec<(PortId, Lookahead)>,
    ) -> Departures {
        let mut arrivals = Arrivals::new(self.router.num_inputs(), self.router.num_outputs());
        for (input, flit) in flits {
            arrivals.flits[input] = Some(flit);
        }
        for (input, lookahead) in lookaheads {
            arrivals.lookaheads[input] = Some(lookahead);
        }
        arrivals.credits = std::mem::replace(
            &mut self.returned,
            (0..self.router.num_outputs()).map(|_| None).collect(),
        );
        self.router
            .read_inputs(self.cycle, arrivals, &mut self.callbacks)
            .unwrap();
        self.router
            .internal_step(&self.routing, &mut self.callbacks)
            .unwrap();
        let departures = self.router.write_outputs(&mut self.callbacks);
        for (output, flit) in departures.flits.iter().enumerate() {
            if let (Some(flit), true) = (flit, self.return_credits) {
                self.returned[output] = Some(Credit::for_flit(flit, flit.vc));
            }
        }
        self.cycle += 1;
        departures
    }

    pub fn idle(&mut self) -> Departures {
        self.step(vec![], vec![])
    }

    /// Trace lines mentioning `needle`.
    pub fn trace_with(&self, needle: &str) -> Vec<String> {
        self.trace
            .lines()
            .into_iter()
            .filter(|line| line.contains(needle))
            .collect()
    }
}

/// An observer that keeps every event with its cycle.
#[derive(Clone, Default)]
pub struct EventLog {
    events: Rc<RefCell<Vec<(Cycle, Event)>>>,
}

impl EventLog {
    pub fn events(&self) -> Vec<(Cycle, Event)> {
        self.events.borrow().clone()
    }
}

impl Observer for EventLog {
    fn notify(&mut self, cycle: Cycle, _watch: bool, event: &Event) {
        self.events.borrow_mut().push((cycle, event.clone()));
    }
}
