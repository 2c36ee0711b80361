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

//! Flits, credits and lookaheads: the three messages a router exchanges with
//! its neighbors.
//!
//! A `Flit` is never cloned. It is owned by exactly one channel, queue or
//! pipeline stage at a time and moves from one to the next. The only copies
//! are `Lookahead`s, which carry the routing-relevant fields of a flit one
//! cycle ahead of it.

use std::fmt;

use crate::{Cycle, FlitId, NodeId, PacketId, PortId, Priority, VcId};

/// One candidate of a route: an output port, the VC range usable on it and a
/// priority.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RouteCandidate {
    pub output: PortId,
    pub vc_start: VcId,
    pub vc_end: VcId,
    pub priority: Priority,
}

/// The candidate outputs returned by a routing function.
///
/// Candidates keep their insertion order, so iterating a set is deterministic.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct OutputSet {
    candidates: Vec<RouteCandidate>,
}

impl OutputSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_range(&mut self, output: PortId, vc_start: VcId, vc_end: VcId, priority: Priority) {
        let candidate = RouteCandidate {
            output,
            vc_start,
            vc_end,
            priority,
        };
        if !self.candidates.contains(&candidate) {
            self.candidates.push(candidate);
        }
    }

    pub fn clear(&mut self) {
        self.candidates.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RouteCandidate> {
        self.candidates.iter()
    }

    pub fn first(&self) -> Option<&RouteCandidate> {
        self.candidates.first()
    }
}

/// A packet before it is split into flits.
#[derive(Clone, Debug, PartialEq)]
pub struct Packet {
    pub id: PacketId,
    pub src: NodeId,
    pub dest: NodeId,
    pub cl: usize,
    pub size: usize,
    pub pri: Priority,
    pub ctime: Cycle,
    pub watch: bool,
}

impl Packet {
    pub fn new(id: PacketId, src: NodeId, dest: NodeId, size: usize, ctime: Cycle) -> Self {
        Self {
            id,
            src,
            dest,
            cl: 0,
            size,
            pri: 0,
            ctime,
            watch: false,
        }
    }

    /// Splits the packet into `size` flits numbered from `first_id`.
    pub fn into_flits(self, first_id: FlitId) -> Vec<Flit> {
        assert!(self.size > 0, "A packet carries at least one flit.");
        (0..self.size)
            .map(|i| {
                let mut flit = Flit::new(first_id + i as FlitId, self.id, self.src, self.dest);
                flit.cl = self.cl;
                flit.head = i == 0;
                flit.tail = i + 1 == self.size;
                flit.packet_size = self.size;
                flit.pri = self.pri;
                flit.ctime = self.ctime;
                flit.watch = self.watch;
                flit
            })
            .collect()
    }
}

/// The flow-control unit.
#[derive(Debug, PartialEq)]
pub struct Flit {
    pub id: FlitId,
    pub pid: PacketId,
    /// Traffic class.
    pub cl: usize,
    pub src: NodeId,
    pub dest: NodeId,
    /// VC on the link the flit is currently travelling or stored on.
    pub vc: VcId,
    pub head: bool,
    pub tail: bool,
    pub packet_size: usize,
    pub pri: Priority,
    pub hops: usize,
    pub ctime: Cycle,
    pub itime: Option<Cycle>,
    /// Route at the router this flit is heading to. Only meaningful on heads.
    pub la_route_set: OutputSet,
    pub watch: bool,
}

impl Flit {
    pub fn new(id: FlitId, pid: PacketId, src: NodeId, dest: NodeId) -> Self {
        Self {
            id,
            pid,
            cl: 0,
            src,
            dest,
            vc: 0,
            head: true,
            tail: true,
            packet_size: 1,
            pri: 0,
            hops: 0,
            ctime: 0,
            itime: None,
            la_route_set: OutputSet::new(),
            watch: false,
        }
    }
}

impl fmt::Display for Flit {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "flit {} (packet {}, {}{}vc {}, {} -> {})",
            self.id,
            self.pid,
            if self.head { "head, " } else { "" },
            if self.tail { "tail, " } else { "" },
            self.vc,
            self.src,
            self.dest
        )
    }
}

/// Returns buffer slots to the upstream credit ledger.
///
/// `vcs` holds one entry per freed slot.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Credit {
    pub id: FlitId,
    pub vcs: Vec<VcId>,
    pub head: bool,
    pub tail: bool,
    pub packet_size: Option<usize>,
    pub watch: bool,
}

impl Credit {
    pub fn new(id: FlitId) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    pub fn for_flit(flit: &Flit, vc: VcId) -> Self {
        Self {
            id: flit.id,
            vcs: vec![vc],
            head: flit.head,
            tail: flit.tail,
            packet_size: Some(flit.packet_size),
            watch: flit.watch,
        }
    }

    pub fn add_vc(&mut self, vc: VcId) {
        self.vcs.push(vc);
    }
}

/// A control message sent one cycle ahead of its flit, used to reserve the
/// downstream resources the flit will need.
#[derive(Clone, Debug, PartialEq)]
pub struct Lookahead {
    pub id: FlitId,
    pub pid: PacketId,
    pub cl: usize,
    pub src: NodeId,
    pub dest: NodeId,
    pub vc: VcId,
    pub head: bool,
    pub tail: bool,
    pub pri: Priority,
    pub packet_size: usize,
    pub la_route_set: OutputSet,
    pub watch: bool,
    /// Position of the sending router on its flit's single-cycle path: zero
    /// when the flit enters that router from a link, `d` when it is passed
    /// on by the `d`-th express reservation of the cycle.
    pub distance: usize,
}

impl Lookahead {
    pub fn from_flit(flit: &Flit) -> Self {
        Self {
            id: flit.id,
            pid: flit.pid,
            cl: flit.cl,
            src: flit.src,
            dest: flit.dest,
            vc: flit.vc,
            head: flit.head,
            tail: flit.tail,
            pri: flit.pri,
            packet_size: flit.packet_size,
            la_route_set: flit.la_route_set.clone(),
            watch: flit.watch,
            distance: 0,
        }
    }

    /// The copy sent one hop further after this lookahead won a bypass.
    pub fn forward(&self, dest_vc: VcId) -> Self {
        Self {
            vc: dest_vc,
            distance: 0,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_into_flits() {
        let mut packet = Packet::new(7, 1, 3, 3, 10);
        packet.watch = true;
        let flits = packet.into_flits(100);
        assert_eq!(flits.len(), 3);
        assert!(flits[0].head && !flits[0].tail);
        assert!(!flits[1].head && !flits[1].tail);
        assert!(!flits[2].head && flits[2].tail);
        assert_eq!(
            flits.iter().map(|f| f.id).collect::<Vec<_>>(),
            vec![100, 101, 102]
        );
        assert!(flits.iter().all(|f| f.pid == 7 && f.packet_size == 3 && f.watch));
    }

    #[test]
    fn single_flit_packet_is_head_and_tail() {
        let flits = Packet::new(1, 0, 1, 1, 0).into_flits(0);
        assert_eq!(flits.len(), 1);
        assert!(flits[0].head && flits[0].tail);
    }

    #[test]
    fn forwarded_lookahead_starts_a_new_path() {
        let mut flit = Flit::new(5, 2, 0, 3);
        flit.vc = 1;
        flit.la_route_set.add_range(2, 0, 3, 0);
        let mut la = Lookahead::from_flit(&flit);
        assert_eq!(la.distance, 0);
        la.distance = 2;
        let next = la.forward(3);
        assert_eq!(next.vc, 3);
        assert_eq!(next.distance, 0);
        assert_eq!(next.la_route_set, flit.la_route_set);
    }

    #[test]
    fn output_set_ignores_duplicates() {
        let mut set = OutputSet::new();
        set.add_range(1, 0, 1, 0);
        set.add_range(1, 0, 1, 0);
        set.add_range(0, 0, 1, 0);
        assert_eq!(set.len(), 2);
        assert_eq!(set.first().map(|c| c.output), Some(1));
    }
}
