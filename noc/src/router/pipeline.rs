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

//! The buffered pipeline: buffer write, input and output switch allocation,
//! commit of the switch winners and switch traversal.

use log::debug;

use super::{Downstream, Proposal, Router, StallReason, VcState};
use crate::flit::{Flit, Lookahead, OutputSet};
use crate::routing::{RouteRequest, RoutingFunction};
use crate::trace::{Event, SimulationCallbacks};
use crate::{Error, NodeId, PacketId, PortId, Priority, VcId};

/// What output switch allocation decided for one input VC.
pub(super) enum Selection {
    Request {
        output: PortId,
        dest_vc: VcId,
        priority: Priority,
    },
    Stall(StallReason),
}

impl Router {
    /// Writes the flits read this cycle that are not bypassing.
    pub(super) fn buffer_write(&mut self, callbacks: &mut SimulationCallbacks) -> Result<(), Error> {
        let vcs = self.num_vcs;
        for (input, flit) in std::mem::take(&mut self.buffer_write_flits) {
            let vc = flit.vc;
            if let Some(bypass) = self.bypass.as_mut() {
                if self.options.guarantee_order && flit.head {
                    bypass.packet_buffered(input * vcs + vc, flit.la_route_set.first().map(|c| c.output));
                }
                if flit.tail {
                    bypass.tail_buffered(input * vcs + vc, flit.pid);
                }
            }
            let (router, cycle) = (self.id, self.cycle);
            callbacks.notify(cycle, flit.watch, || Event::FlitBuffered {
                router,
                input,
                vc,
                flit: flit.id,
            });
            self.bufs[input].add_flit(vc, flit)?;
        }
        Ok(())
    }

    /// Picks one VC per input to compete for the switch next cycle.
    pub(super) fn switch_arbiter_input(&mut self, callbacks: &mut SimulationCallbacks) {
        let mut requests = vec![];
        for input in 0..self.num_inputs() {
            for vc in 0..self.num_vcs {
                if let Some(flit) = self.bufs[input].front(vc) {
                    let priority = if flit.head { flit.pri } else { Priority::MAX };
                    self.sw_input_arbiters[input].add_request(vc, flit.id, priority);
                    requests.push((input, vc, flit.cl, flit.watch));
                }
            }
        }

        for input in 0..self.num_inputs() {
            let arbiter = &mut self.sw_input_arbiters[input];
            if let Some(grant) = arbiter.arbitrate() {
                arbiter.update_state();
                let vc = grant.requester;
                if matches!(self.bufs[input].state(vc), VcState::Idle | VcState::SaInput) {
                    self.bufs[input].set_state(vc, VcState::SaOutput);
                }
                self.sa_output_flits.insert(input, vc);
            }
            self.sw_input_arbiters[input].clear();
        }

        for (input, vc, cl, watch) in requests {
            // A flit that already lost output allocation this cycle is not
            // charged again for losing at its input.
            if self.sa_output_flits.get(&input) != Some(&vc) && !self.charged.contains(&(input, vc)) {
                self.stall(callbacks, input, vc, Proposal::Flit, cl, watch, StallReason::SwitchInput);
            }
        }
    }

    /// Lets the input winners compete for outputs and downstream VCs.
    pub(super) fn switch_arbiter_output(
        &mut self,
        callbacks: &mut SimulationCallbacks,
    ) -> Result<(), Error> {
        let vcs = self.num_vcs;
        let mut proposals = vec![];
        for (input, vc) in std::mem::take(&mut self.sa_output_flits) {
            let (id, cl, watch) = match self.bufs[input].front(vc) {
                Some(flit) => (flit.id, flit.cl, flit.watch),
                None => continue,
            };
            match self.select_output(input, vc)? {
                Selection::Request {
                    output,
                    dest_vc,
                    priority,
                } => {
                    self.sw_output_arbiters[output].add_request(input, (input * vcs + vc) as u64, priority);
                    self.bufs[input].set_output(vc, output, dest_vc);
                    proposals.push((input, vc, cl, watch));
                    if watch {
                        debug!(
                            "cycle {}: router {} flit {} requests output {} VC {}",
                            self.cycle, self.id, id, output, dest_vc
                        );
                    }
                }
                Selection::Stall(reason) => {
                    self.stall(callbacks, input, vc, Proposal::Flit, cl, watch, reason);
                }
            }
        }

        for output in 0..self.num_outputs() {
            let arbiter = &mut self.sw_output_arbiters[output];
            if let Some(grant) = arbiter.arbitrate() {
                arbiter.update_state();
                let vc = grant.tag as usize % vcs;
                self.switch_winners.insert(output, (grant.requester, vc));
            }
            self.sw_output_arbiters[output].clear();
        }

        for (input, vc, cl, watch) in proposals {
            if !self.switch_winners.values().any(|&(winner, _)| winner == input) {
                self.stall(callbacks, input, vc, Proposal::Flit, cl, watch, StallReason::CrossbarConflict);
            }
        }
        Ok(())
    }

    /// Decides whether the flit at the front of `input`/`vc` may request an
    /// output this cycle. Heads need an output and a free downstream VC with
    /// room; body flits follow their head and need one slot.
    fn select_output(&self, input: PortId, vc: VcId) -> Result<Selection, Error> {
        let buf = &self.bufs[input];
        let flit = match buf.front(vc) {
            Some(flit) => flit,
            None => return Ok(Selection::Stall(StallReason::InputBusy)),
        };

        if !flit.head {
            let (output, dest_vc) = buf.output(vc).ok_or(Error::UnallocatedVc {
                router: self.id,
                input,
                vc,
            })?;
            return Ok(if self.next_buf[output].try_reserve(dest_vc, false, 0).is_some() {
                Selection::Request {
                    output,
                    dest_vc,
                    priority: Priority::MAX,
                }
            } else {
                Selection::Stall(StallReason::BufferFull)
            });
        }

        // The previous packet on this VC is still bypassing.
        if buf.state(vc) == VcState::Active {
            return Ok(Selection::Stall(StallReason::InputBusy));
        }
        if flit.la_route_set.is_empty() {
            return Err(Error::EmptyRouteSet {
                router: self.id,
                pid: flit.pid,
            });
        }
        let pinned = self.pinned_flow(flit.src, flit.dest);
        let mut reason = StallReason::BufferBusy;
        for candidate in flit.la_route_set.iter() {
            self.check_output(candidate.output)?;
            let ledger = &self.next_buf[candidate.output];
            let dest_vc = match ledger.avail_vc(candidate.vc_start, candidate.vc_end, pinned) {
                Some(dest_vc) => dest_vc,
                None => continue,
            };
            if ledger.try_reserve(dest_vc, true, flit.packet_size).is_some() {
                return Ok(Selection::Request {
                    output: candidate.output,
                    dest_vc,
                    priority: flit.pri,
                });
            }
            reason = if ledger.available_for(dest_vc) == 0 {
                StallReason::BufferFull
            } else {
                StallReason::BufferReserved
            };
        }
        Ok(Selection::Stall(reason))
    }

    /// Moves the switch winners that survived the lookahead check into the
    /// crossbar, claiming downstream VCs and returning upstream credits.
    pub(super) fn commit_switch_winners(
        &mut self,
        routing: &dyn RoutingFunction,
        callbacks: &mut SimulationCallbacks,
    ) -> Result<(), Error> {
        let vcs = self.num_vcs;
        for (output, (input, vc)) in std::mem::take(&mut self.switch_winners) {
            // A flit bypassing through this input next cycle owns its crossbar
            // port, and an express packet owns its input and output until its
            // tail has passed.
            let displaced = self.bypass.as_ref().map_or(false, |bypass| {
                bypass.is_armed(input) || bypass.holds_input(input) || bypass.express_output(output)
            });
            if displaced {
                if let Some(flit) = self.bufs[input].front(vc) {
                    let (cl, watch) = (flit.cl, flit.watch);
                    self.stall(callbacks, input, vc, Proposal::Flit, cl, watch, StallReason::WinnerKilled);
                }
                continue;
            }
            let (_, dest_vc) = self.bufs[input].output(vc).ok_or(Error::UnallocatedVc {
                router: self.id,
                input,
                vc,
            })?;
            let mut flit = match self.bufs[input].remove_flit(vc) {
                Some(flit) => flit,
                None => continue,
            };
            flit.vc = dest_vc;

            if flit.head {
                self.next_buf[output].take_buffer(dest_vc, flit.pid)?;
                self.bufs[input].activate(vc, flit.pid, output, dest_vc)?;
                flit.la_route_set =
                    self.lookahead_route(routing, output, flit.dest, flit.cl, flit.pid, dest_vc)?;
            }
            if self.options.regain_bypass && self.bypass.is_some() {
                self.lookahead_buffer[output] = Some(Lookahead::from_flit(&flit));
            }
            self.next_buf[output].sending_flit(dest_vc, flit.tail)?;
            self.send_credit(input, vc, flit.id, flit.head, flit.tail, flit.watch);

            if flit.tail {
                self.bufs[input].release(vc);
                if let Some(bypass) = self.bypass.as_mut() {
                    bypass.tail_departed(input * vcs + vc, output);
                }
            }

            let (router, cycle) = (self.id, self.cycle);
            callbacks.notify(cycle, flit.watch, || Event::SwitchGranted {
                router,
                input,
                vc,
                output,
                flit: flit.id,
            });
            if flit.watch {
                debug!(
                    "cycle {}: router {} grants flit {} input {} VC {} -> output {} VC {}",
                    cycle, router, flit.id, input, vc, output, dest_vc
                );
            }
            self.crossbar_flits.push((flit, input, output));
        }
        Ok(())
    }

    /// Moves the crossbar flits into their output buffers.
    pub(super) fn switch_traversal(&mut self) {
        for (mut flit, _, output) in std::mem::take(&mut self.crossbar_flits) {
            flit.hops += 1;
            self.output_buffer[output].push_back(flit);
        }
    }

    /// The route a packet leaving on `output` will take at the next router,
    /// or an empty set if `output` leads to a terminal.
    pub(super) fn lookahead_route(
        &self,
        routing: &dyn RoutingFunction,
        output: PortId,
        dest: NodeId,
        cl: usize,
        pid: PacketId,
        dest_vc: VcId,
    ) -> Result<OutputSet, Error> {
        match self.downstream[output] {
            Downstream::Router { id, input } => {
                let route_set = routing.route(&RouteRequest {
                    router: id,
                    in_port: input,
                    vc: dest_vc,
                    dest,
                    cl,
                    pid,
                })?;
                if route_set.is_empty() {
                    return Err(Error::EmptyRouteSet { router: id, pid });
                }
                Ok(route_set)
            }
            Downstream::Terminal(_) => Ok(OutputSet::new()),
            Downstream::Unconnected => Err(Error::InvalidPort {
                router: self.id,
                port: output,
            }),
        }
    }

    /// Handles one arriving flit: bypass it if its lookahead won, else queue
    /// it for the buffer write.
    pub(super) fn receive_flit(
        &mut self,
        input: PortId,
        flit: Flit,
        callbacks: &mut SimulationCallbacks,
    ) -> Result<(), Error> {
        if flit.vc >= self.num_vcs {
            return Err(Error::InvalidVc {
                port: input,
                vc: flit.vc,
            });
        }
        let (router, cycle) = (self.id, self.cycle);
        callbacks.notify(cycle, flit.watch, || Event::FlitReceived {
            router,
            input,
            vc: flit.vc,
            flit: flit.id,
            pid: flit.pid,
        });
        let armed = self
            .bypass
            .as_ref()
            .map_or(false, |bypass| bypass.is_armed_for(input * self.num_vcs + flit.vc));
        if armed {
            self.bypass_flit(input, flit, callbacks)
        } else {
            self.buffer_write_flits.push((input, flit));
            Ok(())
        }
    }
}
