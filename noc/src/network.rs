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

//! A synchronous network of routers and terminals.
//!
//! Each cycle every endpoint reads what its channels deliver, then routers
//! run their internal step, then everything is written and the channels are
//! committed. Channels are double-buffered, so the evaluation order of the
//! endpoints never shows in the results.
//!
//! Networks of SMART routers run an express phase between the write and the
//! commit: flits holding express reservations are carried across the routers
//! that reserved them, then the lookaheads about to leave are offered to the
//! routers downstream as express requests, nearest router first.

mod terminal;
mod topology;

pub use terminal::{Delivery, Terminal, TerminalOutput};
pub use topology::{Endpoint, Link, Topology};

use log::{debug, info, warn};
use std::collections::{BTreeMap, BTreeSet};

use crate::channel::Channel;
use crate::config::{NetworkConfiguration, RouterConfiguration};
use crate::flit::{Credit, Flit, Lookahead, Packet};
use crate::router::{Arrivals, Departures, Downstream, ExpressRequest, Router, RouterKind, StallCounters};
use crate::routing::{self, RoutingFunction};
use crate::trace::SimulationCallbacks;
use crate::{Cycle, Error, FlitId, NodeId, PacketId, PortId, RouterId};

/// The three channels of one simplex link: flits and lookaheads travel
/// forward, credits travel back.
#[derive(Debug)]
struct LinkChannels {
    src: Endpoint,
    src_port: PortId,
    dst: Endpoint,
    dst_port: PortId,
    flits: Channel<Flit>,
    lookaheads: Channel<Lookahead>,
    credits: Channel<Credit>,
}

impl LinkChannels {
    fn is_idle(&self) -> bool {
        self.flits.is_idle() && self.lookaheads.is_idle() && self.credits.is_idle()
    }
}

#[derive(Debug)]
pub struct Network {
    kind: RouterKind,
    router_config: RouterConfiguration,
    /// Flits may cross several routers per cycle.
    express: bool,
    topology: Topology,
    routing: Box<dyn RoutingFunction>,
    routers: Vec<Router>,
    terminals: Vec<Terminal>,
    links: Vec<LinkChannels>,
    cycle: Cycle,
    next_pid: PacketId,
    next_flit: FlitId,
    /// Packets to flag as watched when they are created.
    watched: BTreeSet<PacketId>,
}

impl Network {
    pub fn new(config: &NetworkConfiguration) -> Result<Self, Error> {
        let shape = config.shape()?;
        let kind: RouterKind = config.router.router.parse()?;
        let routing = routing::by_name(
            &config.routing_function,
            shape,
            config.router.class_partition()?,
        )?;
        let topology = Topology::mesh(shape, config.channel_latency);

        let routers = (0..topology.num_routers())
            .map(|id| {
                Router::new(
                    id,
                    kind,
                    shape.radix(),
                    topology.downstream(id),
                    &config.router,
                )
            })
            .collect::<Result<Vec<_>, Error>>()?;
        let lookaheads = kind.uses_lookaheads() && !config.router.disable_bypass;
        let mut express = kind == RouterKind::Smart && lookaheads;
        if express && config.channel_latency != 1 {
            warn!(
                "express paths need single-cycle links, channel latency is {}; smart routers bypass one hop at a time",
                config.channel_latency
            );
            express = false;
        }
        let terminals = (0..shape.nodes())
            .map(|node| Terminal::new(node, shape.eject_port(), lookaheads, &config.router))
            .collect();
        let links = topology
            .links()
            .map(|(src, dst, link)| {
                Ok(LinkChannels {
                    src,
                    src_port: link.src_port,
                    dst,
                    dst_port: link.dst_port,
                    flits: Channel::new(link.latency)?,
                    lookaheads: Channel::new(link.latency)?,
                    credits: Channel::new(link.latency)?,
                })
            })
            .collect::<Result<Vec<_>, Error>>()?;
        info!(
            "{} network: {} routers, {} links, routing {}",
            kind,
            routers.len(),
            links.len(),
            routing.name()
        );

        Ok(Self {
            kind,
            router_config: config.router.clone(),
            express,
            topology,
            routing,
            routers,
            terminals,
            links,
            cycle: 0,
            next_pid: 0,
            next_flit: 0,
            watched: BTreeSet::new(),
        })
    }

    pub fn kind(&self) -> RouterKind {
        self.kind
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn cycle(&self) -> Cycle {
        self.cycle
    }

    pub fn nodes(&self) -> usize {
        self.terminals.len()
    }

    pub fn router(&self, id: RouterId) -> &Router {
        &self.routers[id]
    }

    pub fn routers(&self) -> &[Router] {
        &self.routers
    }

    pub fn terminal(&self, node: NodeId) -> &Terminal {
        &self.terminals[node]
    }

    /// Flags packet `pid` as watched once it is created, however it gets
    /// enqueued.
    pub fn watch_packet(&mut self, pid: PacketId) {
        self.watched.insert(pid);
    }

    /// Queues a packet of `size` flits at terminal `src`, created this cycle.
    ///
    /// Under whole-packet flow control a packet larger than a VC buffer could
    /// never leave its first buffer and is rejected.
    pub fn enqueue_packet(
        &mut self,
        src: NodeId,
        dest: NodeId,
        size: usize,
        watch: bool,
    ) -> Result<PacketId, Error> {
        if src >= self.nodes() || dest >= self.nodes() {
            return Err(Error::InvalidConfiguration(format!(
                "packet {} -> {} outside a network of {} nodes",
                src,
                dest,
                self.nodes()
            )));
        }
        self.router_config.check_packet_size(size)?;
        let pid = self.next_pid;
        self.next_pid += 1;
        let mut packet = Packet::new(pid, src, dest, size, self.cycle);
        packet.watch = watch || self.watched.contains(&pid);
        self.terminals[src].enqueue(packet.into_flits(self.next_flit));
        self.next_flit += size as FlitId;
        Ok(pid)
    }

    /// Advances the whole network by one cycle.
    pub fn step(&mut self, callbacks: &mut SimulationCallbacks) -> Result<(), Error> {
        let cycle = self.cycle;
        let mut arrivals = self
            .routers
            .iter()
            .map(|router| Arrivals::new(router.num_inputs(), router.num_outputs()))
            .collect::<Vec<_>>();
        let mut terminal_arrivals = (0..self.terminals.len())
            .map(|_| (None, None))
            .collect::<Vec<(Option<Flit>, Option<Credit>)>>();

        for link in self.links.iter_mut() {
            let flit = link.flits.receive();
            let lookahead = link.lookaheads.receive();
            let credit = link.credits.receive();
            match link.dst {
                Endpoint::Router(id) => {
                    arrivals[id].flits[link.dst_port] = flit;
                    arrivals[id].lookaheads[link.dst_port] = lookahead;
                }
                Endpoint::Terminal(node) => terminal_arrivals[node].0 = flit,
            }
            match link.src {
                Endpoint::Router(id) => arrivals[id].credits[link.src_port] = credit,
                Endpoint::Terminal(node) => terminal_arrivals[node].1 = credit,
            }
        }

        let mut departures = Vec::with_capacity(self.routers.len());
        for (router, arrivals) in self.routers.iter_mut().zip(arrivals) {
            router.read_inputs(cycle, arrivals, callbacks)?;
            router.internal_step(self.routing.as_ref(), callbacks)?;
            departures.push(router.write_outputs(callbacks));
        }
        let mut terminal_outputs = Vec::with_capacity(self.terminals.len());
        for (terminal, (flit, credit)) in self.terminals.iter_mut().zip(terminal_arrivals) {
            terminal_outputs.push(terminal.step(cycle, self.routing.as_ref(), flit, credit, callbacks)?);
        }
        if self.express {
            self.pass_express_flits(&mut departures, callbacks)?;
            self.request_express(&mut departures, callbacks)?;
        }

        for link in self.links.iter_mut() {
            let (flit, lookahead) = match link.src {
                Endpoint::Router(id) => (
                    departures[id].flits[link.src_port].take(),
                    departures[id].lookaheads[link.src_port].take(),
                ),
                Endpoint::Terminal(node) => (
                    terminal_outputs[node].flit.take(),
                    terminal_outputs[node].lookahead.take(),
                ),
            };
            let credit = match link.dst {
                Endpoint::Router(id) => departures[id].credits[link.dst_port].take(),
                Endpoint::Terminal(node) => terminal_outputs[node].credit.take(),
            };
            if let Some(flit) = flit {
                link.flits.send(flit)?;
            }
            if let Some(lookahead) = lookahead {
                link.lookaheads.send(lookahead)?;
            }
            if let Some(credit) = credit {
                link.credits.send(credit)?;
            }
            link.flits.commit()?;
            link.lookaheads.commit()?;
            link.credits.commit()?;
        }

        self.cycle += 1;
        Ok(())
    }

    /// The router and input at the far end of `output` of router `id`, if
    /// that is a router.
    fn next_router(&self, id: RouterId, output: PortId) -> Option<(RouterId, PortId)> {
        match self.routers[id].downstream(output) {
            Some(Downstream::Router { id, input }) => Some((id, input)),
            _ => None,
        }
    }

    /// Carries the flits leaving this cycle across the routers holding
    /// express reservations for them. A passed flit takes the place of
    /// whatever the passing router would have sent on that output; finding
    /// that place taken means the reservation was broken.
    fn pass_express_flits(
        &mut self,
        departures: &mut [Departures],
        callbacks: &mut SimulationCallbacks,
    ) -> Result<(), Error> {
        let mut pending = departures
            .iter()
            .enumerate()
            .flat_map(|(id, departure)| {
                departure
                    .flits
                    .iter()
                    .enumerate()
                    .filter(|(_, flit)| flit.is_some())
                    .map(move |(output, _)| (id, output))
            })
            .collect::<Vec<_>>();
        while let Some((id, output)) = pending.pop() {
            let (next, input) = match self.next_router(id, output) {
                Some(next) => next,
                None => continue,
            };
            let expected = departures[id].flits[output]
                .as_ref()
                .map_or(false, |flit| self.routers[next].expects_express(input, flit));
            if !expected {
                continue;
            }
            if let Some(flit) = departures[id].flits[output].take() {
                let (out, flit) = self.routers[next].pass_express(input, flit, callbacks)?;
                let slot = &mut departures[next].flits[out];
                if slot.is_some() {
                    return Err(Error::ExpressConflict {
                        router: next,
                        output: out,
                    });
                }
                *slot = Some(flit);
                pending.push((next, out));
            }
        }
        Ok(())
    }

    /// Offers the lookaheads about to leave to the routers downstream, one
    /// hop further per round. A granted lookahead no longer travels the link:
    /// the router that granted it forwards it instead, which opens the next
    /// round for it.
    fn request_express(
        &mut self,
        departures: &mut [Departures],
        callbacks: &mut SimulationCallbacks,
    ) -> Result<(), Error> {
        let mut frontier = departures
            .iter()
            .enumerate()
            .flat_map(|(id, departure)| {
                departure
                    .lookaheads
                    .iter()
                    .enumerate()
                    .filter(|(_, lookahead)| lookahead.is_some())
                    .map(move |(output, _)| (id, output))
            })
            .collect::<Vec<_>>();

        while !frontier.is_empty() {
            let mut rounds: BTreeMap<RouterId, Vec<((RouterId, PortId), ExpressRequest)>> = BTreeMap::new();
            for (id, output) in frontier.drain(..) {
                let (next, input) = match self.next_router(id, output) {
                    Some(next) => next,
                    None => continue,
                };
                if let Some(lookahead) = departures[id].lookaheads[output].as_ref() {
                    let incoming = departures[id].flits[output].as_ref().map(|flit| flit.vc);
                    rounds.entry(next).or_default().push((
                        (id, output),
                        ExpressRequest {
                            input,
                            distance: lookahead.distance + 1,
                            incoming,
                            lookahead: lookahead.clone(),
                        },
                    ));
                }
            }

            for (next, batch) in rounds {
                let (origins, requests): (Vec<_>, Vec<_>) = batch.into_iter().unzip();
                let inputs = requests.iter().map(|request| request.input).collect::<Vec<_>>();
                let grants = self.routers[next].express_requests(
                    requests,
                    &mut departures[next],
                    self.routing.as_ref(),
                    callbacks,
                )?;
                for grant in grants {
                    if let Some(index) = inputs.iter().position(|&input| input == grant.input) {
                        let (id, output) = origins[index];
                        departures[id].lookaheads[output] = None;
                    }
                    if let Some(output) = grant.forwarded {
                        frontier.push((next, output));
                    }
                }
            }
        }
        Ok(())
    }

    /// True when every packet has been delivered and nothing is in flight.
    pub fn is_drained(&self) -> bool {
        self.terminals.iter().all(|terminal| terminal.backlog() == 0)
            && self.routers.iter().all(|router| router.is_idle())
            && self.links.iter().all(|link| link.is_idle())
    }

    /// Steps until drained or `max_cycles` more cycles have run. Returns
    /// whether the network drained.
    pub fn run_until_drained(
        &mut self,
        max_cycles: Cycle,
        callbacks: &mut SimulationCallbacks,
    ) -> Result<bool, Error> {
        for _ in 0..max_cycles {
            if self.is_drained() {
                debug!("drained at cycle {}", self.cycle);
                return Ok(true);
            }
            self.step(callbacks)?;
        }
        Ok(self.is_drained())
    }

    /// All deliveries so far, grouped by destination terminal.
    pub fn delivered(&self) -> impl Iterator<Item = &Delivery> + '_ {
        self.terminals
            .iter()
            .flat_map(|terminal| terminal.delivered().iter())
    }

    pub fn take_delivered(&mut self) -> Vec<Delivery> {
        self.terminals
            .iter_mut()
            .flat_map(|terminal| terminal.take_delivered())
            .collect()
    }

    /// Stall counters summed over all routers.
    pub fn stalls(&self) -> StallCounters {
        let mut total = StallCounters::default();
        for router in &self.routers {
            total.merge(router.stalls());
        }
        total
    }
}
