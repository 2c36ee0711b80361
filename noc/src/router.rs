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

//! The router pipeline.
//!
//! Every router runs the same three calls per cycle: `read_inputs`,
//! `internal_step` and `write_outputs`. The buffered pipeline lives in
//! `pipeline`; the lookahead machinery used by the bypass and SMART variants
//! lives in `bypass`. SMART routers additionally take part in the network's
//! express phase, see `express`.

mod buffer;
mod buffer_state;
mod bypass;
mod express;
mod pipeline;
mod stall;
mod vc;

pub use buffer::InputBuffer;
pub use buffer_state::{flow_vc, CreditLedger, FlowControl};
pub use express::{ExpressGrant, ExpressRequest};
pub use stall::{Proposal, StallCounters, StallReason};
pub use vc::{VcState, VirtualChannel};

use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::str::FromStr;

use crate::arbiter::{Arbiter, ArbiterKind};
use crate::config::RouterConfiguration;
use crate::flit::{Credit, Flit, Lookahead};
use crate::routing::RoutingFunction;
use crate::trace::{Event, SimulationCallbacks};
use crate::{Cycle, Error, FlitId, NodeId, PortId, RouterId, VcId};
use bypass::BypassState;

/// The router variants. All share the buffered pipeline; the bypass variants
/// add lookahead conflict checking on top of it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RouterKind {
    /// Input-queued virtual cut-through router, no lookaheads.
    Buffered,
    /// Single-hop lookahead bypass.
    BypassVct,
    /// Lookahead bypass plus express paths: a flit crosses up to `hpc_max`
    /// routers in one cycle.
    Smart,
}

impl RouterKind {
    pub fn uses_lookaheads(self) -> bool {
        !matches!(self, Self::Buffered)
    }
}

impl FromStr for RouterKind {
    type Err = Error;

    fn from_str(name: &str) -> Result<Self, Error> {
        match name {
            "iq" | "vct" | "input_queued" => Ok(Self::Buffered),
            "bypass" | "bypass_vct" => Ok(Self::BypassVct),
            "smart" => Ok(Self::Smart),
            _ => Err(Error::UnknownRouterType(name.to_string())),
        }
    }
}

impl fmt::Display for RouterKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Buffered => write!(f, "vct"),
            Self::BypassVct => write!(f, "bypass_vct"),
            Self::Smart => write!(f, "smart"),
        }
    }
}

/// Who gives up the output when a winning lookahead and a buffered switch
/// winner claim it in the same cycle. A body lookahead always wins.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum KillPolicy {
    /// A head lookahead kills a head flit winner.
    LookaheadsKillFlits,
    /// A head flit winner makes a head lookahead lose.
    FlitsKillLookaheads,
}

impl Default for KillPolicy {
    fn default() -> Self {
        Self::LookaheadsKillFlits
    }
}

/// What sits at the far end of an output port.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Downstream {
    Router { id: RouterId, input: PortId },
    Terminal(NodeId),
    Unconnected,
}

/// Everything that arrived at a router in one cycle: flits and lookaheads
/// per input, credits per output.
#[derive(Debug, Default)]
pub struct Arrivals {
    pub flits: Vec<Option<Flit>>,
    pub credits: Vec<Option<Credit>>,
    pub lookaheads: Vec<Option<Lookahead>>,
}

impl Arrivals {
    pub fn new(inputs: usize, outputs: usize) -> Self {
        Self {
            flits: (0..inputs).map(|_| None).collect(),
            credits: (0..outputs).map(|_| None).collect(),
            lookaheads: (0..inputs).map(|_| None).collect(),
        }
    }
}

/// Everything a router emits in one cycle: flits and lookaheads per output,
/// credits per input.
#[derive(Debug, Default)]
pub struct Departures {
    pub flits: Vec<Option<Flit>>,
    pub credits: Vec<Option<Credit>>,
    pub lookaheads: Vec<Option<Lookahead>>,
}

/// Knobs of the pipeline that do not change while it runs.
#[derive(Clone, Debug)]
struct Options {
    regain_bypass: bool,
    guarantee_order: bool,
    kill_policy: KillPolicy,
    hpc_max: usize,
    prefer_straight: bool,
}

#[derive(Debug)]
pub struct Router {
    id: RouterId,
    kind: RouterKind,
    num_vcs: usize,
    cycle: Cycle,
    options: Options,
    downstream: Vec<Downstream>,

    bufs: Vec<InputBuffer>,
    next_buf: Vec<CreditLedger>,

    sw_input_arbiters: Vec<Box<dyn Arbiter>>,
    sw_output_arbiters: Vec<Box<dyn Arbiter>>,
    la_arbiters: Vec<Box<dyn Arbiter>>,

    /// Flits read this cycle that did not bypass.
    buffer_write_flits: Vec<(PortId, Flit)>,
    /// Input VCs that won input arbitration, per input.
    sa_output_flits: BTreeMap<PortId, VcId>,
    /// Switch allocation winners awaiting the lookahead check, per output.
    switch_winners: BTreeMap<PortId, (PortId, VcId)>,
    /// Lookaheads read this cycle, with the input they arrived on.
    la_requests: Vec<(PortId, Lookahead)>,
    /// Flits leaving next cycle, with their input and output.
    crossbar_flits: Vec<(Flit, PortId, PortId)>,
    /// Input VCs whose buffered flit already stalled in this internal step.
    charged: BTreeSet<(PortId, VcId)>,

    output_buffer: Vec<VecDeque<Flit>>,
    credit_buffer: Vec<Option<Credit>>,
    lookahead_buffer: Vec<Option<Lookahead>>,

    /// Present when lookaheads are honoured.
    bypass: Option<BypassState>,
    active: bool,
    stalls: StallCounters,
}

impl Router {
    /// Builds a router with `inputs` input ports and one output port per
    /// entry of `downstream`.
    pub fn new(
        id: RouterId,
        kind: RouterKind,
        inputs: usize,
        downstream: Vec<Downstream>,
        config: &RouterConfiguration,
    ) -> Result<Self, Error> {
        let outputs = downstream.len();
        if inputs == 0 || outputs == 0 {
            return Err(Error::PortMismatch {
                router: id,
                expected: inputs.max(1),
                found: outputs,
            });
        }
        if config.num_vcs == 0 || config.vc_buf_size == 0 {
            return Err(Error::InvalidConfiguration(
                "routers need at least one VC of at least one slot".to_string(),
            ));
        }
        // Validated here so a bad partition fails construction, not routing.
        config.class_partition()?;
        if kind == RouterKind::Smart && config.hpc_max == 0 {
            return Err(Error::InvalidConfiguration(
                "smart routers let a flit cross at least one router per cycle".to_string(),
            ));
        }
        let input_arbiter: ArbiterKind = config.sw_input_arbiter.parse()?;
        let output_arbiter: ArbiterKind = config.sw_output_arbiter.parse()?;
        let num_vcs = config.num_vcs;

        let bypass = if kind.uses_lookaheads() && !config.disable_bypass {
            Some(BypassState::new(inputs, outputs, num_vcs))
        } else {
            None
        };

        Ok(Self {
            id,
            kind,
            num_vcs,
            cycle: 0,
            options: Options {
                regain_bypass: config.regain_bypass,
                guarantee_order: config.guarantee_order,
                kill_policy: config.kill_policy,
                hpc_max: config.hpc_max,
                prefer_straight: config.prefer_straight,
            },
            downstream,
            bufs: (0..inputs)
                .map(|port| InputBuffer::new(port, num_vcs, config.vc_buf_size))
                .collect(),
            next_buf: (0..outputs)
                .map(|_| CreditLedger::new(num_vcs, config.vc_buf_size, config.flow_control))
                .collect(),
            sw_input_arbiters: (0..inputs).map(|_| input_arbiter.build(num_vcs)).collect(),
            sw_output_arbiters: (0..outputs).map(|_| output_arbiter.build(inputs)).collect(),
            la_arbiters: (0..outputs).map(|_| output_arbiter.build(inputs)).collect(),
            buffer_write_flits: vec![],
            sa_output_flits: BTreeMap::new(),
            switch_winners: BTreeMap::new(),
            la_requests: vec![],
            crossbar_flits: vec![],
            charged: BTreeSet::new(),
            output_buffer: (0..outputs).map(|_| VecDeque::new()).collect(),
            credit_buffer: (0..inputs).map(|_| None).collect(),
            lookahead_buffer: (0..outputs).map(|_| None).collect(),
            bypass,
            active: false,
            stalls: StallCounters::new(config.classes),
        })
    }

    pub fn id(&self) -> RouterId {
        self.id
    }

    pub fn kind(&self) -> RouterKind {
        self.kind
    }

    pub fn num_inputs(&self) -> usize {
        self.bufs.len()
    }

    pub fn num_outputs(&self) -> usize {
        self.downstream.len()
    }

    pub fn num_vcs(&self) -> usize {
        self.num_vcs
    }

    pub fn downstream(&self, output: PortId) -> Option<Downstream> {
        self.downstream.get(output).copied()
    }

    pub fn buffer(&self, input: PortId) -> &InputBuffer {
        &self.bufs[input]
    }

    /// The credit view of the downstream buffer behind `output`.
    pub fn ledger(&self, output: PortId) -> &CreditLedger {
        &self.next_buf[output]
    }

    pub fn stalls(&self) -> &StallCounters {
        &self.stalls
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// True when nothing is buffered, in flight through the pipeline or
    /// waiting to be written out.
    pub fn is_idle(&self) -> bool {
        !self.active
            && self.bufs.iter().all(|buf| buf.total_occupancy() == 0)
            && self.output_buffer.iter().all(|queue| queue.is_empty())
            && self.credit_buffer.iter().all(|credit| credit.is_none())
            && self.lookahead_buffer.iter().all(|la| la.is_none())
    }

    /// Consumes this cycle's arrivals. Flits are handled before lookaheads so
    /// a tail bypassing this cycle frees its VC for a head lookahead arriving
    /// alongside it.
    pub fn read_inputs(
        &mut self,
        cycle: Cycle,
        arrivals: Arrivals,
        callbacks: &mut SimulationCallbacks,
    ) -> Result<(), Error> {
        self.cycle = cycle;
        let Arrivals {
            flits,
            credits,
            lookaheads,
        } = arrivals;
        self.check_width(flits.len(), self.num_inputs())?;
        self.check_width(credits.len(), self.num_outputs())?;
        self.check_width(lookaheads.len(), self.num_inputs())?;

        let mut arrived = false;
        for (input, flit) in flits.into_iter().enumerate() {
            if let Some(flit) = flit {
                arrived = true;
                self.receive_flit(input, flit, callbacks)?;
            }
        }
        self.buffer_write(callbacks)?;

        for (output, credit) in credits.into_iter().enumerate() {
            if let Some(credit) = credit {
                arrived = true;
                self.next_buf[output].process_credit(&credit)?;
            }
        }

        for (input, lookahead) in lookaheads.into_iter().enumerate() {
            if let Some(lookahead) = lookahead {
                arrived = true;
                self.receive_lookahead(input, lookahead, callbacks);
            }
        }

        self.active = self.active || arrived;
        Ok(())
    }

    /// Runs the pipeline stages in reverse order so each stage sees the
    /// previous cycle's output of the stage before it.
    pub fn internal_step(
        &mut self,
        routing: &dyn RoutingFunction,
        callbacks: &mut SimulationCallbacks,
    ) -> Result<(), Error> {
        self.charged.clear();
        if !self.active {
            return Ok(());
        }

        #[cfg(feature = "trace-pipeline-state")]
        log::trace!(
            "router {} cycle {}: crossbar {:?} sa_output {:?} winners {:?} lookaheads {}",
            self.id,
            self.cycle,
            self.crossbar_flits
                .iter()
                .map(|(flit, _, output)| (flit.id, *output))
                .collect::<Vec<_>>(),
            self.sa_output_flits,
            self.switch_winners,
            self.la_requests.len()
        );

        if !self.crossbar_flits.is_empty() {
            self.switch_traversal();
        }
        if !self.sa_output_flits.is_empty() {
            self.switch_arbiter_output(callbacks)?;
        }
        if !self.la_requests.is_empty() {
            self.lookahead_conflict_check(routing, callbacks)?;
        }
        if !self.switch_winners.is_empty() {
            self.commit_switch_winners(routing, callbacks)?;
        }
        self.switch_arbiter_input(callbacks);

        self.active = !self.crossbar_flits.is_empty()
            || !self.sa_output_flits.is_empty()
            || !self.switch_winners.is_empty()
            || !self.la_requests.is_empty();
        Ok(())
    }

    /// Emits at most one flit and one lookahead per output and one credit
    /// per input. Lookaheads headed for a terminal are dropped.
    pub fn write_outputs(&mut self, callbacks: &mut SimulationCallbacks) -> Departures {
        let mut departures = Departures::default();
        for output in 0..self.num_outputs() {
            let flit = self.output_buffer[output].pop_front();
            if let Some(flit) = &flit {
                let (router, cycle) = (self.id, self.cycle);
                callbacks.notify(cycle, flit.watch, || Event::FlitSent {
                    router,
                    output,
                    vc: flit.vc,
                    flit: flit.id,
                });
                if flit.watch {
                    debug!(
                        "cycle {}: router {} sends flit {} on output {} VC {}",
                        cycle, router, flit.id, output, flit.vc
                    );
                }
            }
            departures.flits.push(flit);

            let lookahead = match self.downstream[output] {
                Downstream::Router { .. } => self.lookahead_buffer[output].take(),
                _ => {
                    self.lookahead_buffer[output] = None;
                    None
                }
            };
            departures.lookaheads.push(lookahead);
        }
        for input in 0..self.num_inputs() {
            let credit = self.credit_buffer[input].take();
            if let Some(credit) = &credit {
                let router = self.id;
                callbacks.notify(self.cycle, credit.watch, || Event::CreditSent {
                    router,
                    input,
                    vcs: credit.vcs.clone(),
                });
            }
            departures.credits.push(credit);
        }
        departures
    }

    fn check_width(&self, found: usize, expected: usize) -> Result<(), Error> {
        if found != expected {
            return Err(Error::PortMismatch {
                router: self.id,
                expected,
                found,
            });
        }
        Ok(())
    }

    fn check_output(&self, output: PortId) -> Result<(), Error> {
        match self.downstream.get(output) {
            Some(Downstream::Unconnected) | None => Err(Error::InvalidPort {
                router: self.id,
                port: output,
            }),
            Some(_) => Ok(()),
        }
    }

    /// Queues one credit slot for `vc` on the upstream side of `input`.
    fn send_credit(&mut self, input: PortId, vc: VcId, id: FlitId, head: bool, tail: bool, watch: bool) {
        merge_credit(&mut self.credit_buffer[input], vc, id, head, tail, watch);
    }

    /// The flow a new packet is pinned to, if ordering is guaranteed.
    fn pinned_flow(&self, src: NodeId, dest: NodeId) -> Option<(NodeId, NodeId)> {
        if self.options.guarantee_order {
            Some((src, dest))
        } else {
            None
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn stall(
        &mut self,
        callbacks: &mut SimulationCallbacks,
        input: PortId,
        vc: VcId,
        proposal: Proposal,
        cl: usize,
        watch: bool,
        reason: StallReason,
    ) {
        if proposal == Proposal::Flit {
            self.charged.insert((input, vc));
        }
        self.stalls.record(proposal, cl, reason);
        let router = self.id;
        callbacks.notify(self.cycle, watch, || Event::Stall {
            router,
            input,
            vc,
            proposal,
            reason,
        });
    }
}

/// Adds one slot of `vc` to the credit in `slot`, starting a new credit if
/// there is none yet.
fn merge_credit(slot: &mut Option<Credit>, vc: VcId, id: FlitId, head: bool, tail: bool, watch: bool) {
    match slot {
        Some(credit) => {
            credit.add_vc(vc);
            credit.watch |= watch;
        }
        None => {
            let mut credit = Credit::new(id);
            credit.add_vc(vc);
            credit.head = head;
            credit.tail = tail;
            credit.watch = watch;
            *slot = Some(credit);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flit::Packet;
    use crate::routing::{ClassPartition, DimensionOrderMesh, MeshShape};

    fn init() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    /// The middle router of a 3-ary 1-mesh: output 0 leads up to router 2,
    /// output 1 down to router 0, output 2 ejects. Flits from router 0
    /// arrive on input 1.
    fn line_router(kind: RouterKind, config: &RouterConfiguration) -> Router {
        Router::new(
            1,
            kind,
            3,
            vec![
                Downstream::Router { id: 2, input: 1 },
                Downstream::Router { id: 0, input: 0 },
                Downstream::Terminal(1),
            ],
            config,
        )
        .unwrap()
    }

    fn line_routing(config: &RouterConfiguration) -> DimensionOrderMesh {
        DimensionOrderMesh::new(
            MeshShape::new(3, 1),
            ClassPartition::new(config.num_vcs, config.classes, &[], &[]).unwrap(),
        )
    }

    fn head_flit(routing: &dyn RoutingFunction, pid: u64, dest: usize) -> Flit {
        let mut flit = Packet::new(pid, 0, dest, 1, 0).into_flits(pid * 10).remove(0);
        flit.la_route_set = routing
            .route(&crate::routing::RouteRequest {
                router: 1,
                in_port: 1,
                vc: 0,
                dest,
                cl: 0,
                pid,
            })
            .unwrap();
        flit
    }

    #[test]
    fn router_kinds_parse() {
        assert_eq!("vct".parse::<RouterKind>(), Ok(RouterKind::Buffered));
        assert_eq!("bypass_vct".parse::<RouterKind>(), Ok(RouterKind::BypassVct));
        assert_eq!("smart".parse::<RouterKind>(), Ok(RouterKind::Smart));
        assert_eq!(
            "torus".parse::<RouterKind>(),
            Err(Error::UnknownRouterType("torus".to_string()))
        );
    }

    #[test]
    fn bad_arbiter_is_a_configuration_error() {
        let config = RouterConfiguration {
            sw_output_arbiter: "lottery".to_string(),
            ..Default::default()
        };
        let result = Router::new(0, RouterKind::Buffered, 1, vec![Downstream::Terminal(0)], &config);
        assert!(matches!(result, Err(Error::UnknownArbiter(_))));
    }

    #[test]
    fn arrival_width_is_checked() {
        init();
        let config = RouterConfiguration::default();
        let mut router = line_router(RouterKind::Buffered, &config);
        let mut callbacks = SimulationCallbacks::default();
        let result = router.read_inputs(0, Arrivals::new(2, 3), &mut callbacks);
        assert_eq!(
            result,
            Err(Error::PortMismatch {
                router: 1,
                expected: 3,
                found: 2
            })
        );
    }

    #[test]
    fn buffered_flit_leaves_two_cycles_after_arrival() {
        init();
        let config = RouterConfiguration::default();
        let routing = line_routing(&config);
        let mut router = line_router(RouterKind::Buffered, &config);
        let mut callbacks = SimulationCallbacks::default();

        let mut arrivals = Arrivals::new(3, 3);
        arrivals.flits[1] = Some(head_flit(&routing, 1, 2));
        let mut sent_at = None;
        for cycle in 0..5 {
            let arrivals = if cycle == 0 {
                std::mem::take(&mut arrivals)
            } else {
                Arrivals::new(3, 3)
            };
            router.read_inputs(cycle, arrivals, &mut callbacks).unwrap();
            router.internal_step(&routing, &mut callbacks).unwrap();
            let departures = router.write_outputs(&mut callbacks);
            if let Some(flit) = &departures.flits[0] {
                assert_eq!(flit.hops, 1);
                sent_at = Some(cycle);
            }
            if cycle == 0 {
                assert!(departures.credits.iter().all(|c| c.is_none()));
            }
        }
        assert_eq!(sent_at, Some(2));
        assert_eq!(router.ledger(0).occupancy_for(0), 1);
        assert!(router.is_idle());
    }

    #[test]
    fn lookahead_moves_flit_through_in_its_arrival_cycle() {
        init();
        let config = RouterConfiguration::default();
        let routing = line_routing(&config);
        let mut router = line_router(RouterKind::BypassVct, &config);
        let mut callbacks = SimulationCallbacks::default();

        let flit = head_flit(&routing, 4, 2);
        let mut first = Arrivals::new(3, 3);
        first.lookaheads[1] = Some(Lookahead::from_flit(&flit));
        router.read_inputs(0, first, &mut callbacks).unwrap();
        router.internal_step(&routing, &mut callbacks).unwrap();
        let departures = router.write_outputs(&mut callbacks);
        // The lookahead is forwarded and the upstream credit returned at once.
        let forwarded = departures.lookaheads[0].as_ref().unwrap();
        assert_eq!(forwarded.distance, 0);
        assert_eq!(forwarded.vc, flit.vc);
        assert!(departures.credits[1].is_some());
        assert!(departures.flits.iter().all(|f| f.is_none()));

        let mut second = Arrivals::new(3, 3);
        second.flits[1] = Some(flit);
        router.read_inputs(1, second, &mut callbacks).unwrap();
        router.internal_step(&routing, &mut callbacks).unwrap();
        let departures = router.write_outputs(&mut callbacks);
        let sent = departures.flits[0].as_ref().unwrap();
        assert_eq!(sent.pid, 4);
        // Router 2 is the destination, so the next hop ejects.
        assert_eq!(sent.la_route_set.first().map(|c| c.output), Some(2));
        assert_eq!(router.buffer(1).total_occupancy(), 0);
        assert_eq!(router.stalls().total_stalls(Proposal::Lookahead), 0);
    }

    #[test]
    fn smart_routers_need_a_hop_budget() {
        let config = RouterConfiguration {
            hpc_max: 0,
            ..Default::default()
        };
        let result = Router::new(0, RouterKind::Smart, 1, vec![Downstream::Terminal(0)], &config);
        assert!(matches!(result, Err(Error::InvalidConfiguration(_))));
        assert!(Router::new(0, RouterKind::BypassVct, 1, vec![Downstream::Terminal(0)], &config).is_ok());
    }

    #[test]
    fn disabled_bypass_drops_lookaheads() {
        init();
        let config = RouterConfiguration {
            disable_bypass: true,
            ..Default::default()
        };
        let routing = line_routing(&config);
        let mut router = line_router(RouterKind::BypassVct, &config);
        let mut callbacks = SimulationCallbacks::default();

        let flit = head_flit(&routing, 4, 2);
        let mut first = Arrivals::new(3, 3);
        first.lookaheads[1] = Some(Lookahead::from_flit(&flit));
        router.read_inputs(0, first, &mut callbacks).unwrap();
        router.internal_step(&routing, &mut callbacks).unwrap();
        let departures = router.write_outputs(&mut callbacks);
        assert!(departures.lookaheads.iter().all(|la| la.is_none()));
        assert!(departures.credits.iter().all(|c| c.is_none()));
    }
}
