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

//! Lookahead conflict checking and bypass reservations.
//!
//! A lookahead arrives one cycle ahead of its flit. If it wins an output, the
//! downstream VC and the upstream credit are settled right away and the
//! reservation for its (input, VC) is armed; the flit then goes straight from
//! the input link into the crossbar when it arrives. A head lookahead that
//! loses marks its (input, VC) as stopped so later lookaheads of the same
//! packet are ignored and the whole packet takes the buffered path.
//!
//! Express reservations of SMART routers live in the same table; they are
//! granted and consumed by the network's express phase rather than by the
//! pipeline.

use log::debug;
use std::collections::VecDeque;

use super::pipeline::Selection;
use super::{Departures, KillPolicy, Proposal, Router, RouterKind, StallReason, VcState};
use crate::flit::{Flit, Lookahead, OutputSet};
use crate::routing::RoutingFunction;
use crate::trace::{Event, SimulationCallbacks};
use crate::{Error, PacketId, PortId, Priority, VcId};

/// A bypass granted to the packet on one input VC.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(super) struct Reservation {
    pub(super) pid: PacketId,
    pub(super) output: PortId,
    pub(super) dest_vc: VcId,
    /// Route of the packet at the next router, handed to the head flit.
    pub(super) next_route: OutputSet,
    /// Set while a flit of the packet is expected next cycle.
    pub(super) armed: bool,
    /// Flits of the packet pass this router in the cycle they leave the
    /// router upstream, without entering the input link stage.
    pub(super) express: bool,
}

/// Bypass bookkeeping. Input VCs are indexed `input * num_vcs + vc`.
#[derive(Debug)]
pub(super) struct BypassState {
    num_vcs: usize,
    pub(super) reservations: Vec<Option<Reservation>>,
    /// The input VC a bypassing packet holds each output for.
    pub(super) strict_priority: Vec<Option<usize>>,
    /// Packets whose head lookahead lost; they finish on the buffered path.
    pub(super) stopped: Vec<Option<PacketId>>,
    /// Outputs of the packets buffered on each input VC, oldest first.
    buffered_outputs: Vec<VecDeque<Option<PortId>>>,
}

impl BypassState {
    pub(super) fn new(inputs: usize, outputs: usize, num_vcs: usize) -> Self {
        Self {
            num_vcs,
            reservations: vec![None; inputs * num_vcs],
            strict_priority: vec![None; outputs],
            stopped: vec![None; inputs * num_vcs],
            buffered_outputs: vec![VecDeque::new(); inputs * num_vcs],
        }
    }

    /// True if a flit arriving on `input_vc` from the link bypasses.
    pub(super) fn is_armed_for(&self, input_vc: usize) -> bool {
        self.reservations[input_vc]
            .as_ref()
            .map_or(false, |reservation| reservation.armed && !reservation.express)
    }

    /// True if a flit bypasses through `input` next cycle.
    pub(super) fn is_armed(&self, input: PortId) -> bool {
        (0..self.num_vcs).any(|vc| self.is_armed_for(input * self.num_vcs + vc))
    }

    fn input_vcs(&self, input: PortId) -> std::ops::Range<usize> {
        input * self.num_vcs..(input + 1) * self.num_vcs
    }

    /// True if any packet holds a reservation on `input`.
    pub(super) fn input_reserved(&self, input: PortId) -> bool {
        self.reservations[self.input_vcs(input)]
            .iter()
            .any(|reservation| reservation.is_some())
    }

    /// True if an express packet passes through `input`.
    pub(super) fn holds_input(&self, input: PortId) -> bool {
        self.reservations[self.input_vcs(input)]
            .iter()
            .flatten()
            .any(|reservation| reservation.express)
    }

    /// True if an express packet holds `output`.
    pub(super) fn express_output(&self, output: PortId) -> bool {
        self.strict_priority[output].map_or(false, |input_vc| {
            self.reservations[input_vc]
                .as_ref()
                .map_or(false, |reservation| reservation.express)
        })
    }

    pub(super) fn packet_buffered(&mut self, input_vc: usize, output: Option<PortId>) {
        self.buffered_outputs[input_vc].push_back(output);
    }

    pub(super) fn tail_buffered(&mut self, input_vc: usize, pid: PacketId) {
        if self.stopped[input_vc] == Some(pid) {
            self.stopped[input_vc] = None;
        }
    }

    /// A flit of an express packet came over the link instead of passing:
    /// the path broke upstream, so the rest of the packet is buffered here.
    pub(super) fn leave_express(&mut self, input_vc: usize, pid: PacketId) {
        if let Some(reservation) = self.reservations[input_vc].as_mut() {
            if reservation.express && !reservation.armed && reservation.pid == pid {
                reservation.express = false;
                self.stopped[input_vc] = Some(pid);
            }
        }
    }

    /// Forgets everything the packet on `input_vc` held once its tail left
    /// through `output` on the buffered path.
    pub(super) fn tail_departed(&mut self, input_vc: usize, output: PortId) {
        self.buffered_outputs[input_vc].pop_front();
        self.reservations[input_vc] = None;
        if self.strict_priority[output] == Some(input_vc) {
            self.strict_priority[output] = None;
        }
    }

    /// True if a packet buffered on `input` is still headed for `output`.
    pub(super) fn buffered_towards(&self, input: PortId, output: PortId) -> bool {
        self.buffered_outputs[self.input_vcs(input)]
            .iter()
            .any(|queue| queue.contains(&Some(output)))
    }

    pub(super) fn reserve(&mut self, input_vc: usize, reservation: Reservation) {
        self.strict_priority[reservation.output] = Some(input_vc);
        self.reservations[input_vc] = Some(reservation);
    }

    pub(super) fn finish(&mut self, input_vc: usize, output: PortId) {
        self.reservations[input_vc] = None;
        if self.strict_priority[output] == Some(input_vc) {
            self.strict_priority[output] = None;
        }
    }
}

/// One lookahead taking part in this cycle's conflict check.
struct Contender {
    input: PortId,
    lookahead: Lookahead,
    /// Output and downstream VC requested, if any.
    target: Option<(PortId, VcId)>,
    reason: Option<StallReason>,
    won: bool,
}

impl Router {
    /// Queues a lookahead for the conflict check, or drops it if this router
    /// does not bypass.
    pub(super) fn receive_lookahead(
        &mut self,
        input: PortId,
        lookahead: Lookahead,
        callbacks: &mut SimulationCallbacks,
    ) {
        if self.bypass.is_some() && lookahead.vc < self.num_vcs {
            self.la_requests.push((input, lookahead));
        } else {
            self.drop_lookahead(input, &lookahead, callbacks);
        }
    }

    /// Sends a flit with an armed reservation straight into the crossbar.
    pub(super) fn bypass_flit(
        &mut self,
        input: PortId,
        mut flit: Flit,
        callbacks: &mut SimulationCallbacks,
    ) -> Result<(), Error> {
        let in_vc = flit.vc;
        let input_vc = input * self.num_vcs + in_vc;
        if let Some(bypass) = self.bypass.as_mut() {
            bypass.leave_express(input_vc, flit.pid);
        }
        let reservation = match self
            .bypass
            .as_mut()
            .and_then(|bypass| bypass.reservations[input_vc].as_mut())
        {
            Some(reservation) if reservation.armed => reservation,
            _ => {
                self.buffer_write_flits.push((input, flit));
                return Ok(());
            }
        };
        if reservation.pid != flit.pid {
            return Err(Error::BypassMismatch {
                router: self.id,
                input,
                vc: in_vc,
                expected: reservation.pid,
                found: flit.pid,
            });
        }
        reservation.armed = false;
        let (output, dest_vc) = (reservation.output, reservation.dest_vc);
        if flit.head {
            flit.la_route_set = reservation.next_route.clone();
        }
        flit.vc = dest_vc;

        if flit.tail {
            if let Some(bypass) = self.bypass.as_mut() {
                bypass.finish(input_vc, output);
            }
            self.bufs[input].release(in_vc);
        }

        let (router, cycle) = (self.id, self.cycle);
        callbacks.notify(cycle, flit.watch, || Event::FlitBypassed {
            router,
            input,
            output,
            flit: flit.id,
        });
        if flit.watch {
            debug!(
                "cycle {}: router {} bypasses flit {} input {} -> output {} VC {}",
                cycle, router, flit.id, input, output, dest_vc
            );
        }
        self.crossbar_flits.push((flit, input, output));
        Ok(())
    }

    /// Arbitrates this cycle's lookaheads for the outputs and settles the
    /// conflicts with the buffered switch winners.
    pub(super) fn lookahead_conflict_check(
        &mut self,
        routing: &dyn RoutingFunction,
        callbacks: &mut SimulationCallbacks,
    ) -> Result<(), Error> {
        let mut contenders = vec![];
        for (input, lookahead) in std::mem::take(&mut self.la_requests) {
            let selection = if lookahead.head {
                self.select_head_output(input, &lookahead, None)?
            } else {
                match self.body_target(input, &lookahead) {
                    Some((output, dest_vc)) => Selection::Request {
                        output,
                        dest_vc,
                        priority: Priority::MAX,
                    },
                    None => {
                        self.drop_lookahead(input, &lookahead, callbacks);
                        continue;
                    }
                }
            };
            let (target, reason) = match selection {
                Selection::Request {
                    output,
                    dest_vc,
                    priority,
                } => {
                    self.la_arbiters[output].add_request(input, lookahead.id, priority);
                    (Some((output, dest_vc)), None)
                }
                Selection::Stall(reason) => (None, Some(reason)),
            };
            contenders.push(Contender {
                input,
                lookahead,
                target,
                reason,
                won: false,
            });
        }

        for output in 0..self.num_outputs() {
            let grant = self.la_arbiters[output].arbitrate();
            let index = grant.and_then(|grant| {
                contenders.iter().position(|contender| {
                    contender.input == grant.requester
                        && contender.target.map(|(o, _)| o) == Some(output)
                })
            });
            let index = match index {
                Some(index) => index,
                None => {
                    self.la_arbiters[output].clear();
                    continue;
                }
            };

            if let Some(&(flit_input, flit_vc)) = self.switch_winners.get(&output) {
                let flit_head = self.bufs[flit_input]
                    .front(flit_vc)
                    .map_or(false, |flit| flit.head);
                let kill = !contenders[index].lookahead.head
                    || (flit_head && self.options.kill_policy == KillPolicy::LookaheadsKillFlits);
                if !kill {
                    contenders[index].reason = Some(StallReason::CrossbarConflict);
                    self.la_arbiters[output].clear();
                    continue;
                }
                self.switch_winners.remove(&output);
                if let Some(flit) = self.bufs[flit_input].front(flit_vc) {
                    let (cl, watch) = (flit.cl, flit.watch);
                    self.stall(
                        callbacks,
                        flit_input,
                        flit_vc,
                        Proposal::Flit,
                        cl,
                        watch,
                        StallReason::WinnerKilled,
                    );
                }
            }

            self.la_arbiters[output].update_state();
            self.la_arbiters[output].clear();
            contenders[index].won = true;
            if let Some((_, dest_vc)) = contenders[index].target {
                let input = contenders[index].input;
                self.grant_bypass(routing, input, &contenders[index].lookahead, output, dest_vc, callbacks)?;
            }
        }

        let vcs = self.num_vcs;
        for contender in contenders.into_iter().filter(|contender| !contender.won) {
            let Contender {
                input,
                lookahead,
                reason,
                ..
            } = contender;
            let reason = reason.unwrap_or(StallReason::CrossbarConflict);
            self.stall(
                callbacks,
                input,
                lookahead.vc,
                Proposal::Lookahead,
                lookahead.cl,
                lookahead.watch,
                reason,
            );
            if lookahead.head {
                if let Some(bypass) = self.bypass.as_mut() {
                    bypass.stopped[input * vcs + lookahead.vc] = Some(lookahead.pid);
                }
            }
        }
        Ok(())
    }

    /// Settles a winning lookahead: claims the downstream VC, returns the
    /// upstream credit early, arms the reservation and forwards the lookahead.
    fn grant_bypass(
        &mut self,
        routing: &dyn RoutingFunction,
        input: PortId,
        lookahead: &Lookahead,
        output: PortId,
        dest_vc: VcId,
        callbacks: &mut SimulationCallbacks,
    ) -> Result<(), Error> {
        let input_vc = input * self.num_vcs + lookahead.vc;
        let mut forwarded = lookahead.forward(dest_vc);
        if lookahead.head {
            let next_route = self.lookahead_route(
                routing,
                output,
                lookahead.dest,
                lookahead.cl,
                lookahead.pid,
                dest_vc,
            )?;
            self.next_buf[output].take_buffer(dest_vc, lookahead.pid)?;
            self.bufs[input].activate(lookahead.vc, lookahead.pid, output, dest_vc)?;
            forwarded.la_route_set = next_route.clone();
            if let Some(bypass) = self.bypass.as_mut() {
                bypass.reserve(
                    input_vc,
                    Reservation {
                        pid: lookahead.pid,
                        output,
                        dest_vc,
                        next_route,
                        armed: true,
                        express: false,
                    },
                );
            }
        } else if let Some(reservation) = self
            .bypass
            .as_mut()
            .and_then(|bypass| bypass.reservations[input_vc].as_mut())
        {
            reservation.armed = true;
        }
        self.next_buf[output].sending_flit(dest_vc, lookahead.tail)?;
        self.send_credit(
            input,
            lookahead.vc,
            lookahead.id,
            lookahead.head,
            lookahead.tail,
            lookahead.watch,
        );
        self.lookahead_buffer[output] = Some(forwarded);

        let (router, cycle) = (self.id, self.cycle);
        callbacks.notify(cycle, lookahead.watch, || Event::LookaheadWon {
            router,
            input,
            output,
            dest_vc,
            flit: lookahead.id,
        });
        if lookahead.watch {
            debug!(
                "cycle {}: router {} lookahead {} wins output {} VC {}",
                cycle, router, lookahead.id, output, dest_vc
            );
        }
        Ok(())
    }

    /// Decides whether a head lookahead may request an output. Bypass always
    /// needs room for the whole packet downstream.
    ///
    /// `express` carries this cycle's departures when the request is for an
    /// express path, checked after the pipeline ran: the crossbar and the
    /// outputs must then also be free in the cycle the flit passes.
    pub(super) fn select_head_output(
        &self,
        input: PortId,
        lookahead: &Lookahead,
        express: Option<(usize, &Departures)>,
    ) -> Result<Selection, Error> {
        let bypass = match self.bypass.as_ref() {
            Some(bypass) => bypass,
            None => return Ok(Selection::Stall(StallReason::InputBusy)),
        };
        let vc = lookahead.vc;
        let input_vc = input * self.num_vcs + vc;
        let buf = &self.bufs[input];
        if buf.state(vc) == VcState::Active
            || !buf.is_empty(vc)
            || bypass.reservations[input_vc].is_some()
            || bypass.holds_input(input)
            || bypass.stopped[input_vc].map_or(false, |pid| pid != lookahead.pid)
        {
            return Ok(Selection::Stall(StallReason::InputBusy));
        }
        if express.is_some()
            && (bypass.input_reserved(input) || self.crossbar_flits.iter().any(|&(_, from, _)| from == input))
        {
            return Ok(Selection::Stall(StallReason::InputBusy));
        }
        if lookahead.la_route_set.is_empty() {
            return Err(Error::EmptyRouteSet {
                router: self.id,
                pid: lookahead.pid,
            });
        }

        let pinned = self.pinned_flow(lookahead.src, lookahead.dest);
        let mut reason = StallReason::BufferBusy;
        for candidate in lookahead.la_route_set.iter() {
            let output = candidate.output;
            self.check_output(output)?;
            let taken = express.map_or(false, |(_, departures)| self.output_taken(output, departures));
            if taken
                || bypass.strict_priority[output].is_some()
                || (self.options.guarantee_order && bypass.buffered_towards(input, output))
            {
                reason = StallReason::OutputBlocked;
                continue;
            }
            let ledger = &self.next_buf[output];
            let dest_vc = match ledger.avail_vc(candidate.vc_start, candidate.vc_end, pinned) {
                Some(dest_vc) => dest_vc,
                None => continue,
            };
            let available = ledger.available_for(dest_vc);
            if available >= lookahead.packet_size.max(1) {
                let distance = express.map_or(0, |(distance, _)| distance);
                return Ok(Selection::Request {
                    output,
                    dest_vc,
                    priority: self.lookahead_priority(input, output, lookahead, distance),
                });
            }
            reason = if available == 0 {
                StallReason::BufferFull
            } else {
                StallReason::BufferReserved
            };
        }
        Ok(Selection::Stall(reason))
    }

    /// True if a flit already leaves on `output` in the cycle an express
    /// flit granted now would pass: one committed to the crossbar, or one
    /// announced by a lookahead in `departures`.
    pub(super) fn output_taken(&self, output: PortId, departures: &Departures) -> bool {
        self.crossbar_flits.iter().any(|&(_, _, to)| to == output)
            || departures
                .lookaheads
                .get(output)
                .map_or(false, |lookahead| lookahead.is_some())
    }

    /// SMART ranks head lookaheads by how close they are to where their flit
    /// enters the cycle's path, going straight breaking ties; the plain bypass
    /// router uses the packet priority.
    fn lookahead_priority(
        &self,
        input: PortId,
        output: PortId,
        lookahead: &Lookahead,
        distance: usize,
    ) -> Priority {
        match self.kind {
            RouterKind::Smart => {
                let nearness = self.options.hpc_max.saturating_sub(distance) as Priority;
                let straight = self.options.prefer_straight && output == input ^ 1;
                nearness * 2 + straight as Priority
            }
            _ => lookahead.pri,
        }
    }

    /// The output a body lookahead continues on, if its packet still holds
    /// the bypass and nothing of it is buffered here.
    fn body_target(&self, input: PortId, lookahead: &Lookahead) -> Option<(PortId, VcId)> {
        let bypass = self.bypass.as_ref()?;
        let input_vc = input * self.num_vcs + lookahead.vc;
        if bypass.stopped[input_vc] == Some(lookahead.pid) {
            return None;
        }
        let reservation = bypass.reservations[input_vc].as_ref()?;
        if reservation.pid != lookahead.pid
            || reservation.armed
            || reservation.express
            || bypass.strict_priority[reservation.output] != Some(input_vc)
            || !self.bufs[input].is_empty(lookahead.vc)
        {
            return None;
        }
        Some((reservation.output, reservation.dest_vc))
    }

    pub(super) fn drop_lookahead(
        &mut self,
        input: PortId,
        lookahead: &Lookahead,
        callbacks: &mut SimulationCallbacks,
    ) {
        let router = self.id;
        callbacks.notify(self.cycle, lookahead.watch, || Event::LookaheadDropped {
            router,
            input,
            flit: lookahead.id,
        });
    }
}
