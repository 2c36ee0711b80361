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

//! Observation hooks.
//!
//! The router reports what it does at fixed points of its pipeline. Nothing
//! reported here feeds back into allocation: with or without an observer the
//! simulation produces the same results.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::router::{Proposal, StallReason};
use crate::{Cycle, FlitId, NodeId, PacketId, PortId, RouterId, VcId};

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Event {
    FlitReceived {
        router: RouterId,
        input: PortId,
        vc: VcId,
        flit: FlitId,
        pid: PacketId,
    },
    FlitBuffered {
        router: RouterId,
        input: PortId,
        vc: VcId,
        flit: FlitId,
    },
    FlitBypassed {
        router: RouterId,
        input: PortId,
        output: PortId,
        flit: FlitId,
    },
    SwitchGranted {
        router: RouterId,
        input: PortId,
        vc: VcId,
        output: PortId,
        flit: FlitId,
    },
    LookaheadWon {
        router: RouterId,
        input: PortId,
        output: PortId,
        dest_vc: VcId,
        flit: FlitId,
    },
    /// A smart router reserved its crossbar for a flit that will cross it
    /// later in the same cycle.
    ExpressGranted {
        router: RouterId,
        input: PortId,
        output: PortId,
        dest_vc: VcId,
        flit: FlitId,
    },
    LookaheadDropped {
        router: RouterId,
        input: PortId,
        flit: FlitId,
    },
    Stall {
        router: RouterId,
        input: PortId,
        vc: VcId,
        proposal: Proposal,
        reason: StallReason,
    },
    FlitSent {
        router: RouterId,
        output: PortId,
        vc: VcId,
        flit: FlitId,
    },
    CreditSent {
        router: RouterId,
        input: PortId,
        vcs: Vec<VcId>,
    },
    FlitInjected {
        node: NodeId,
        vc: VcId,
        flit: FlitId,
        pid: PacketId,
    },
    FlitEjected {
        node: NodeId,
        flit: FlitId,
        pid: PacketId,
        hops: usize,
    },
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::FlitReceived {
                router,
                input,
                vc,
                flit,
                pid,
            } => write!(
                f,
                "router{} | received flit {} (packet {}) at input {} vc {}",
                router, flit, pid, input, vc
            ),
            Self::FlitBuffered {
                router,
                input,
                vc,
                flit,
            } => write!(
                f,
                "router{} | buffered flit {} at input {} vc {}",
                router, flit, input, vc
            ),
            Self::FlitBypassed {
                router,
                input,
                output,
                flit,
            } => write!(
                f,
                "router{} | flit {} bypasses from input {} to output {}",
                router, flit, input, output
            ),
            Self::SwitchGranted {
                router,
                input,
                vc,
                output,
                flit,
            } => write!(
                f,
                "router{} | switch granted to flit {} from input {} vc {} to output {}",
                router, flit, input, vc, output
            ),
            Self::LookaheadWon {
                router,
                input,
                output,
                dest_vc,
                flit,
            } => write!(
                f,
                "router{} | lookahead {} from input {} reserves output {} vc {}",
                router, flit, input, output, dest_vc
            ),
            Self::ExpressGranted {
                router,
                input,
                output,
                dest_vc,
                flit,
            } => write!(
                f,
                "router{} | express path for flit {} from input {} to output {} vc {}",
                router, flit, input, output, dest_vc
            ),
            Self::LookaheadDropped {
                router,
                input,
                flit,
            } => write!(
                f,
                "router{} | lookahead {} at input {} dropped",
                router, flit, input
            ),
            Self::Stall {
                router,
                input,
                proposal,
                reason,
                ..
            } => write!(
                f,
                "router{} | {:?} at input {} stalled: {}",
                router, proposal, input, reason
            ),
            Self::FlitSent {
                router,
                output,
                vc,
                flit,
            } => write!(
                f,
                "router{} | sent flit {} on output {} vc {}",
                router, flit, output, vc
            ),
            Self::CreditSent { router, input, vcs } => write!(
                f,
                "router{} | credit for vcs {:?} sent on input {}",
                router, vcs, input
            ),
            Self::FlitInjected {
                node,
                vc,
                flit,
                pid,
            } => write!(
                f,
                "node{} | injected flit {} (packet {}) on vc {}",
                node, flit, pid, vc
            ),
            Self::FlitEjected {
                node,
                flit,
                pid,
                hops,
            } => write!(
                f,
                "node{} | ejected flit {} (packet {}) after {} hops",
                node, flit, pid, hops
            ),
        }
    }
}

pub trait Observer {
    /// Called for every event; `watch` is set when the flit, credit or
    /// lookahead involved is flagged as watched.
    fn notify(&mut self, cycle: Cycle, watch: bool, event: &Event);
}

/// Callbacks handed to every pipeline step.
#[derive(Default)]
pub struct SimulationCallbacks {
    observer: Option<Box<dyn Observer>>,
}

impl SimulationCallbacks {
    pub fn new(observer: Box<dyn Observer>) -> Self {
        Self {
            observer: Some(observer),
        }
    }

    /// Builds the event only when someone listens.
    pub fn notify<F: FnOnce() -> Event>(&mut self, cycle: Cycle, watch: bool, event: F) {
        if let Some(observer) = self.observer.as_mut() {
            observer.notify(cycle, watch, &event());
        }
    }
}

/// An observer that renders events as `cycle | source | message` lines.
///
/// Clones share the same lines, so a copy can be kept to read the trace
/// after the original was handed to the simulation.
#[derive(Clone, Default)]
pub struct TextTrace {
    watched_only: bool,
    lines: Rc<RefCell<Vec<String>>>,
}

impl TextTrace {
    /// Traces only events of watched flits, credits and lookaheads.
    pub fn watched() -> Self {
        Self {
            watched_only: true,
            ..Default::default()
        }
    }

    /// Traces every event.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.borrow().clone()
    }
}

impl Observer for TextTrace {
    fn notify(&mut self, cycle: Cycle, watch: bool, event: &Event) {
        if self.watched_only && !watch {
            return;
        }
        self.lines
            .borrow_mut()
            .push(format!("{} | {}", cycle, event));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watched_trace_filters_events() {
        let trace = TextTrace::watched();
        let mut callbacks = SimulationCallbacks::new(Box::new(trace.clone()));
        callbacks.notify(3, false, || Event::FlitSent {
            router: 0,
            output: 1,
            vc: 0,
            flit: 9,
        });
        callbacks.notify(4, true, || Event::FlitSent {
            router: 0,
            output: 2,
            vc: 1,
            flit: 10,
        });
        assert_eq!(
            trace.lines(),
            vec!["4 | router0 | sent flit 10 on output 2 vc 1".to_string()]
        );
    }

    #[test]
    fn no_observer_no_event() {
        let mut callbacks = SimulationCallbacks::default();
        callbacks.notify(0, true, || panic!("event built without an observer"));
    }
}
