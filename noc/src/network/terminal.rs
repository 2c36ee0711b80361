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

use log::debug;
use serde::Serialize;
use std::collections::VecDeque;

use crate::config::RouterConfiguration;
use crate::flit::{Credit, Flit, Lookahead};
use crate::router::CreditLedger;
use crate::routing::{RouteRequest, RoutingFunction};
use crate::trace::{Event, SimulationCallbacks};
use crate::{Cycle, Error, FlitId, NodeId, PacketId, PortId, VcId};

/// One flit handed to its destination terminal.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Delivery {
    pub flit: FlitId,
    pub pid: PacketId,
    pub src: NodeId,
    pub dest: NodeId,
    pub head: bool,
    pub tail: bool,
    pub ctime: Cycle,
    pub itime: Option<Cycle>,
    pub atime: Cycle,
    pub hops: usize,
}

impl Delivery {
    pub fn latency(&self) -> Cycle {
        self.atime - self.ctime
    }
}

/// What a terminal sends in one cycle.
#[derive(Debug, Default)]
pub struct TerminalOutput {
    pub flit: Option<Flit>,
    pub lookahead: Option<Lookahead>,
    pub credit: Option<Credit>,
}

/// A network endpoint: injects packets into its router and ejects the flits
/// addressed to it.
#[derive(Debug)]
pub struct Terminal {
    node: NodeId,
    /// Router input the terminal injects on.
    port: PortId,
    /// Send each flit's lookahead one cycle ahead of it.
    lookaheads: bool,
    /// Inject every packet of a flow on the flow's own VC.
    ordered: bool,
    queue: VecDeque<Flit>,
    /// Credit view of the router's injection input buffer.
    ledger: CreditLedger,
    /// VC of the packet being injected.
    current_vc: Option<VcId>,
    /// Flit whose lookahead went out last cycle.
    announced: Option<Flit>,
    delivered: Vec<Delivery>,
}

impl Terminal {
    pub fn new(node: NodeId, port: PortId, lookaheads: bool, config: &RouterConfiguration) -> Self {
        Self {
            node,
            port,
            lookaheads,
            ordered: config.guarantee_order,
            queue: VecDeque::new(),
            ledger: CreditLedger::new(config.num_vcs, config.vc_buf_size, config.flow_control),
            current_vc: None,
            announced: None,
            delivered: vec![],
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn enqueue(&mut self, flits: Vec<Flit>) {
        self.queue.extend(flits);
    }

    /// Flits not yet injected.
    pub fn backlog(&self) -> usize {
        self.queue.len() + self.announced.iter().count()
    }

    pub fn ledger(&self) -> &CreditLedger {
        &self.ledger
    }

    pub fn delivered(&self) -> &[Delivery] {
        &self.delivered
    }

    pub fn take_delivered(&mut self) -> Vec<Delivery> {
        std::mem::take(&mut self.delivered)
    }

    /// Runs one cycle: applies the returned credit, ejects the arriving flit
    /// and injects at most one flit.
    pub fn step(
        &mut self,
        cycle: Cycle,
        routing: &dyn RoutingFunction,
        arrival: Option<Flit>,
        credit: Option<Credit>,
        callbacks: &mut SimulationCallbacks,
    ) -> Result<TerminalOutput, Error> {
        let mut output = TerminalOutput::default();
        if let Some(credit) = credit {
            self.ledger.process_credit(&credit)?;
        }
        if let Some(flit) = arrival {
            output.credit = Some(self.eject(cycle, flit, callbacks));
        }

        output.flit = self.announced.take();
        if let Some(flit) = self.next_flit(cycle, routing)? {
            let (node, vc, id, pid) = (self.node, flit.vc, flit.id, flit.pid);
            callbacks.notify(cycle, flit.watch, || Event::FlitInjected { node, vc, flit: id, pid });
            if self.lookaheads {
                output.lookahead = Some(Lookahead::from_flit(&flit));
                self.announced = Some(flit);
            } else {
                output.flit = Some(flit);
            }
        }
        Ok(output)
    }

    /// Takes the next queued flit if the router's input buffer can accept it.
    fn next_flit(&mut self, cycle: Cycle, routing: &dyn RoutingFunction) -> Result<Option<Flit>, Error> {
        let front = match self.queue.front() {
            Some(front) => front,
            None => return Ok(None),
        };
        let vc = if front.head {
            let (vc_start, vc_end) = routing.injection_vcs(front.cl);
            let pinned = if self.ordered {
                Some((front.src, front.dest))
            } else {
                None
            };
            let vc = match self.ledger.avail_vc(vc_start, vc_end, pinned) {
                Some(vc) => vc,
                None => return Ok(None),
            };
            if self.ledger.try_reserve(vc, true, front.packet_size).is_none() {
                return Ok(None);
            }
            vc
        } else {
            match self.current_vc {
                Some(vc) if self.ledger.try_reserve(vc, false, 0).is_some() => vc,
                _ => return Ok(None),
            }
        };

        let mut flit = match self.queue.pop_front() {
            Some(flit) => flit,
            None => return Ok(None),
        };
        flit.vc = vc;
        flit.itime = Some(cycle);
        if flit.head {
            self.ledger.take_buffer(vc, flit.pid)?;
            self.current_vc = Some(vc);
            let route_set = routing.route(&RouteRequest {
                router: self.node,
                in_port: self.port,
                vc,
                dest: flit.dest,
                cl: flit.cl,
                pid: flit.pid,
            })?;
            if route_set.is_empty() {
                return Err(Error::EmptyRouteSet {
                    router: self.node,
                    pid: flit.pid,
                });
            }
            flit.la_route_set = route_set;
        }
        self.ledger.sending_flit(vc, flit.tail)?;
        if flit.tail {
            self.current_vc = None;
        }
        if flit.watch {
            debug!(
                "cycle {}: terminal {} injects flit {} of packet {} on VC {}",
                cycle, self.node, flit.id, flit.pid, vc
            );
        }
        Ok(Some(flit))
    }

    fn eject(&mut self, cycle: Cycle, flit: Flit, callbacks: &mut SimulationCallbacks) -> Credit {
        let node = self.node;
        callbacks.notify(cycle, flit.watch, || Event::FlitEjected {
            node,
            flit: flit.id,
            pid: flit.pid,
            hops: flit.hops,
        });
        if flit.watch {
            debug!(
                "cycle {}: terminal {} ejects flit {} of packet {} after {} hops",
                cycle, node, flit.id, flit.pid, flit.hops
            );
        }
        let credit = Credit::for_flit(&flit, flit.vc);
        self.delivered.push(Delivery {
            flit: flit.id,
            pid: flit.pid,
            src: flit.src,
            dest: flit.dest,
            head: flit.head,
            tail: flit.tail,
            ctime: flit.ctime,
            itime: flit.itime,
            atime: cycle,
            hops: flit.hops,
        });
        credit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flit::Packet;
    use crate::routing::{ClassPartition, DimensionOrderMesh, MeshShape};

    fn routing() -> DimensionOrderMesh {
        DimensionOrderMesh::new(
            MeshShape::new(2, 1),
            ClassPartition::new(2, 1, &[], &[]).unwrap(),
        )
    }

    #[test]
    fn lookahead_leads_flit_by_one_cycle() {
        let config = RouterConfiguration::default();
        let routing = routing();
        let mut terminal = Terminal::new(0, 2, true, &config);
        let mut callbacks = SimulationCallbacks::default();
        terminal.enqueue(Packet::new(1, 0, 1, 2, 0).into_flits(10));

        let first = terminal.step(0, &routing, None, None, &mut callbacks).unwrap();
        assert!(first.flit.is_none());
        let la = first.lookahead.unwrap();
        assert_eq!((la.id, la.head), (10, true));
        assert_eq!(la.la_route_set.first().map(|c| c.output), Some(0));

        let second = terminal.step(1, &routing, None, None, &mut callbacks).unwrap();
        assert_eq!(second.flit.map(|f| f.id), Some(10));
        assert_eq!(second.lookahead.map(|la| la.id), Some(11));

        let third = terminal.step(2, &routing, None, None, &mut callbacks).unwrap();
        assert_eq!(third.flit.map(|f| f.id), Some(11));
        assert!(third.lookahead.is_none());
        assert_eq!(terminal.backlog(), 0);
        assert_eq!(terminal.ledger().occupancy_for(0), 2);
    }

    #[test]
    fn injection_waits_for_credits() {
        let config = RouterConfiguration {
            vc_buf_size: 2,
            num_vcs: 1,
            ..Default::default()
        };
        let routing = DimensionOrderMesh::new(
            MeshShape::new(2, 1),
            ClassPartition::new(1, 1, &[], &[]).unwrap(),
        );
        let mut terminal = Terminal::new(0, 2, false, &config);
        let mut callbacks = SimulationCallbacks::default();
        terminal.enqueue(Packet::new(1, 0, 1, 2, 0).into_flits(0));
        terminal.enqueue(Packet::new(2, 0, 1, 2, 0).into_flits(2));

        let mut sent = vec![];
        for cycle in 0..4 {
            let output = terminal.step(cycle, &routing, None, None, &mut callbacks).unwrap();
            sent.extend(output.flit.map(|f| f.id));
        }
        // The second packet needs its VC back: two credits.
        assert_eq!(sent, vec![0, 1]);

        let mut credit = Credit::new(0);
        credit.add_vc(0);
        credit.add_vc(0);
        let output = terminal
            .step(4, &routing, None, Some(credit), &mut callbacks)
            .unwrap();
        assert_eq!(output.flit.map(|f| f.id), Some(2));
    }

    #[test]
    fn ordered_flows_keep_to_one_vc() {
        let config = RouterConfiguration {
            guarantee_order: true,
            ..Default::default()
        };
        let routing = routing();
        let mut terminal = Terminal::new(0, 2, false, &config);
        let mut callbacks = SimulationCallbacks::default();
        terminal.enqueue(Packet::new(1, 0, 1, 1, 0).into_flits(0));
        terminal.enqueue(Packet::new(2, 0, 1, 1, 0).into_flits(1));

        let mut vcs = vec![];
        for cycle in 0..3 {
            let output = terminal.step(cycle, &routing, None, None, &mut callbacks).unwrap();
            vcs.extend(output.flit.map(|f| f.vc));
        }
        // Flow 0 -> 1 owns VC 1; without pinning the second packet would take
        // the idle VC 0.
        assert_eq!(vcs, vec![1, 1]);
    }

    #[test]
    fn ejection_returns_a_credit_and_logs_delivery() {
        let config = RouterConfiguration::default();
        let routing = routing();
        let mut terminal = Terminal::new(1, 2, false, &config);
        let mut callbacks = SimulationCallbacks::default();
        let mut flit = Packet::new(5, 0, 1, 1, 3).into_flits(50).remove(0);
        flit.vc = 1;
        flit.hops = 2;
        let output = terminal
            .step(9, &routing, Some(flit), None, &mut callbacks)
            .unwrap();
        assert_eq!(output.credit.map(|c| c.vcs), Some(vec![1]));
        let delivery = &terminal.delivered()[0];
        assert_eq!((delivery.pid, delivery.hops, delivery.latency()), (5, 2, 6));
    }
}
