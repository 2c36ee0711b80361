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

//! Express paths of SMART routers.
//!
//! Once every router has run its pipeline, each lookahead leaving a router
//! is offered to the router at the other end of its link. A granted request
//! reserves that router's crossbar for the next cycle, when the flit leaves
//! the router upstream: the flit then passes straight through in that same
//! cycle. The lookahead is forwarded at once, so the router after may extend
//! the path in turn. A path crosses at most `hpc_max` routers, counting the
//! one the flit leaves from.
//!
//! A packet whose body flit cannot follow its head finishes on the buffered
//! path from the router where the path broke.

use log::debug;

use super::bypass::Reservation;
use super::pipeline::Selection;
use super::{merge_credit, Departures, Downstream, Proposal, Router, RouterKind, StallReason};
use crate::flit::{Flit, Lookahead};
use crate::routing::RoutingFunction;
use crate::trace::{Event, SimulationCallbacks};
use crate::{Error, PortId, VcId};

/// A lookahead offered to the router at the far end of its link.
#[derive(Clone, Debug, PartialEq)]
pub struct ExpressRequest {
    /// Input the link ends on.
    pub input: PortId,
    /// Position of this router on the path; the router the flit leaves from
    /// is at zero.
    pub distance: usize,
    /// VC of the flit the link delivers to `input` next cycle, if any.
    pub incoming: Option<VcId>,
    pub lookahead: Lookahead,
}

/// A request that was granted.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ExpressGrant {
    pub input: PortId,
    /// Output the lookahead was forwarded on, when it leads to a router.
    pub forwarded: Option<PortId>,
}

impl Router {
    /// Grants this cycle's express requests. Heads compete for outputs, the
    /// nearest ones first; body and tail flits follow the path of their head
    /// or fall back to buffering.
    pub fn express_requests(
        &mut self,
        requests: Vec<ExpressRequest>,
        departures: &mut Departures,
        routing: &dyn RoutingFunction,
        callbacks: &mut SimulationCallbacks,
    ) -> Result<Vec<ExpressGrant>, Error> {
        let mut grants = vec![];
        if self.kind != RouterKind::Smart || self.bypass.is_none() {
            return Ok(grants);
        }

        let mut heads = vec![];
        for request in requests {
            if request.lookahead.vc >= self.num_vcs {
                continue;
            }
            if !request.lookahead.head {
                grants.extend(self.express_body(&request, departures, callbacks)?);
                continue;
            }
            if request.distance >= self.options.hpc_max {
                self.express_stall(callbacks, &request, StallReason::HopLimit);
                continue;
            }
            if request.incoming == Some(request.lookahead.vc) {
                self.express_stall(callbacks, &request, StallReason::InputBusy);
                continue;
            }
            let selection = self.select_head_output(
                request.input,
                &request.lookahead,
                Some((request.distance, &*departures)),
            )?;
            match selection {
                Selection::Request {
                    output,
                    dest_vc,
                    priority,
                } => {
                    self.la_arbiters[output].add_request(request.input, request.lookahead.id, priority);
                    heads.push((request, output, dest_vc));
                }
                Selection::Stall(reason) => self.express_stall(callbacks, &request, reason),
            }
        }

        let mut winners = vec![];
        for output in 0..self.num_outputs() {
            if let Some(grant) = self.la_arbiters[output].arbitrate() {
                self.la_arbiters[output].update_state();
                winners.push((output, grant.requester));
            }
            self.la_arbiters[output].clear();
        }
        for (request, output, dest_vc) in heads {
            if winners.contains(&(output, request.input)) {
                grants.push(self.grant_express(routing, &request, output, dest_vc, departures, callbacks)?);
            } else {
                self.express_stall(callbacks, &request, StallReason::CrossbarConflict);
            }
        }
        Ok(grants)
    }

    /// True if `flit`, leaving the router upstream of `input` this cycle,
    /// passes through here on an express path.
    pub fn expects_express(&self, input: PortId, flit: &Flit) -> bool {
        if flit.vc >= self.num_vcs {
            return false;
        }
        let input_vc = input * self.num_vcs + flit.vc;
        self.bypass
            .as_ref()
            .and_then(|bypass| bypass.reservations.get(input_vc))
            .and_then(|reservation| reservation.as_ref())
            .map_or(false, |reservation| reservation.express && reservation.armed)
    }

    /// Moves an expected flit across the crossbar. Returns the output it
    /// leaves on, with the flit retagged for the next router.
    pub fn pass_express(
        &mut self,
        input: PortId,
        mut flit: Flit,
        callbacks: &mut SimulationCallbacks,
    ) -> Result<(PortId, Flit), Error> {
        let in_vc = flit.vc;
        let input_vc = input * self.num_vcs + in_vc;
        let router = self.id;
        let reservation = match self
            .bypass
            .as_mut()
            .and_then(|bypass| bypass.reservations.get_mut(input_vc))
            .and_then(|reservation| reservation.as_mut())
        {
            Some(reservation) if reservation.express && reservation.armed => reservation,
            _ => {
                return Err(Error::UnallocatedVc {
                    router,
                    input,
                    vc: in_vc,
                })
            }
        };
        if reservation.pid != flit.pid {
            return Err(Error::BypassMismatch {
                router,
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
        if flit.tail {
            if let Some(bypass) = self.bypass.as_mut() {
                bypass.finish(input_vc, output);
            }
            self.bufs[input].release(in_vc);
        }
        flit.vc = dest_vc;
        flit.hops += 1;

        let cycle = self.cycle;
        callbacks.notify(cycle, flit.watch, || Event::FlitReceived {
            router,
            input,
            vc: in_vc,
            flit: flit.id,
            pid: flit.pid,
        });
        callbacks.notify(cycle, flit.watch, || Event::FlitBypassed {
            router,
            input,
            output,
            flit: flit.id,
        });
        callbacks.notify(cycle, flit.watch, || Event::FlitSent {
            router,
            output,
            vc: dest_vc,
            flit: flit.id,
        });
        if flit.watch {
            debug!(
                "cycle {}: router {} passes flit {} input {} -> output {} VC {}",
                cycle, router, flit.id, input, output, dest_vc
            );
        }
        Ok((output, flit))
    }

    /// Claims the output and downstream VC for a head and opens its path.
    fn grant_express(
        &mut self,
        routing: &dyn RoutingFunction,
        request: &ExpressRequest,
        output: PortId,
        dest_vc: VcId,
        departures: &mut Departures,
        callbacks: &mut SimulationCallbacks,
    ) -> Result<ExpressGrant, Error> {
        let lookahead = &request.lookahead;
        let input_vc = request.input * self.num_vcs + lookahead.vc;
        let next_route = self.lookahead_route(
            routing,
            output,
            lookahead.dest,
            lookahead.cl,
            lookahead.pid,
            dest_vc,
        )?;
        self.next_buf[output].take_buffer(dest_vc, lookahead.pid)?;
        self.bufs[request.input].activate(lookahead.vc, lookahead.pid, output, dest_vc)?;
        let mut forwarded = lookahead.forward(dest_vc);
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
                    express: true,
                },
            );
        }
        self.extend_path(request, output, dest_vc, forwarded, departures, callbacks)
    }

    /// Lets a body or tail flit follow its head, if its packet holds an
    /// express path here. Otherwise the packet leaves the path: this flit
    /// and the rest of the packet are buffered.
    fn express_body(
        &mut self,
        request: &ExpressRequest,
        departures: &mut Departures,
        callbacks: &mut SimulationCallbacks,
    ) -> Result<Option<ExpressGrant>, Error> {
        let lookahead = &request.lookahead;
        let (input, vc) = (request.input, lookahead.vc);
        let input_vc = input * self.num_vcs + vc;
        let (output, dest_vc, armed) = match self
            .bypass
            .as_ref()
            .and_then(|bypass| bypass.reservations[input_vc].as_ref())
        {
            Some(reservation) if reservation.express && reservation.pid == lookahead.pid => {
                (reservation.output, reservation.dest_vc, reservation.armed)
            }
            _ => return Ok(None),
        };

        let blocked = if request.distance >= self.options.hpc_max {
            Some(StallReason::HopLimit)
        } else if armed
            || request.incoming == Some(vc)
            || !self.bufs[input].is_empty(vc)
            || self.bypass.as_ref().map_or(false, |bypass| bypass.is_armed(input))
            || self.crossbar_flits.iter().any(|&(_, from, _)| from == input)
        {
            Some(StallReason::InputBusy)
        } else if self.output_taken(output, departures) {
            Some(StallReason::CrossbarConflict)
        } else {
            None
        };
        if let Some(reason) = blocked {
            if let Some(bypass) = self.bypass.as_mut() {
                if let Some(reservation) = bypass.reservations[input_vc].as_mut() {
                    reservation.express = false;
                }
                bypass.stopped[input_vc] = Some(lookahead.pid);
            }
            self.express_stall(callbacks, request, reason);
            return Ok(None);
        }

        if let Some(reservation) = self
            .bypass
            .as_mut()
            .and_then(|bypass| bypass.reservations[input_vc].as_mut())
        {
            reservation.armed = true;
        }
        let forwarded = lookahead.forward(dest_vc);
        self.extend_path(request, output, dest_vc, forwarded, departures, callbacks)
            .map(Some)
    }

    /// Books the downstream slot, returns the upstream credit at once and
    /// forwards the lookahead so the next router may extend the path.
    fn extend_path(
        &mut self,
        request: &ExpressRequest,
        output: PortId,
        dest_vc: VcId,
        mut forwarded: Lookahead,
        departures: &mut Departures,
        callbacks: &mut SimulationCallbacks,
    ) -> Result<ExpressGrant, Error> {
        let lookahead = &request.lookahead;
        let input = request.input;
        self.next_buf[output].sending_flit(dest_vc, lookahead.tail)?;
        merge_credit(
            &mut departures.credits[input],
            lookahead.vc,
            lookahead.id,
            lookahead.head,
            lookahead.tail,
            lookahead.watch,
        );

        let (router, cycle) = (self.id, self.cycle);
        callbacks.notify(cycle, lookahead.watch, || Event::CreditSent {
            router,
            input,
            vcs: vec![lookahead.vc],
        });
        callbacks.notify(cycle, lookahead.watch, || Event::ExpressGranted {
            router,
            input,
            output,
            dest_vc,
            flit: lookahead.id,
        });
        if lookahead.watch {
            debug!(
                "cycle {}: router {} opens express path for flit {} output {} VC {} at distance {}",
                cycle, router, lookahead.id, output, dest_vc, request.distance
            );
        }

        let forwards = matches!(self.downstream[output], Downstream::Router { .. });
        if forwards {
            forwarded.distance = request.distance;
            departures.lookaheads[output] = Some(forwarded);
        }
        Ok(ExpressGrant {
            input,
            forwarded: if forwards { Some(output) } else { None },
        })
    }

    fn express_stall(
        &mut self,
        callbacks: &mut SimulationCallbacks,
        request: &ExpressRequest,
        reason: StallReason,
    ) {
        let lookahead = &request.lookahead;
        self.stall(
            callbacks,
            request.input,
            lookahead.vc,
            Proposal::Express,
            lookahead.cl,
            lookahead.watch,
            reason,
        );
    }
}
