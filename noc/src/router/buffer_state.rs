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

use crate::flit::Credit;
use crate::{Error, NodeId, PacketId, VcId};

/// How much downstream room a flit needs before it may be forwarded.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum FlowControl {
    /// A head flit needs one free slot. The VC stays owned by the packet
    /// until the credit of its tail comes back.
    Wormhole,
    /// A head flit needs room for the whole packet. The VC can be claimed by
    /// the next packet as soon as the tail has been sent.
    VirtualCutThrough,
    /// A head flit needs room for the whole packet and the VC stays owned
    /// until the credit of the tail comes back.
    CutThrough,
}

impl Default for FlowControl {
    fn default() -> Self {
        Self::VirtualCutThrough
    }
}

impl FlowControl {
    pub fn head_needs_whole_packet(self) -> bool {
        matches!(self, Self::VirtualCutThrough | Self::CutThrough)
    }

    pub fn waits_for_tail_credit(self) -> bool {
        matches!(self, Self::Wormhole | Self::CutThrough)
    }
}

/// The one VC of `[vc_start, vc_end]` all packets from `src` to `dest` use
/// when ordering is guaranteed. Two packets of a flow on one VC can never
/// overtake each other.
pub fn flow_vc(vc_start: VcId, vc_end: VcId, src: NodeId, dest: NodeId) -> VcId {
    let width = vc_end.saturating_sub(vc_start) + 1;
    vc_start + (src + dest) % width
}

#[derive(Clone, Debug, Default)]
struct VcCredit {
    occupancy: usize,
    in_use_by: Option<PacketId>,
    tail_sent: bool,
}

/// The sender's view of the buffers of the router (or terminal) at the other
/// end of one output port.
///
/// Slots are reserved with `sending_flit` when a flit is granted and come
/// back one at a time with `process_credit`. Occupancy stays within
/// `[0, vc_buf_size]`; leaving that range means a slot was reserved or
/// returned twice, and is reported as an error.
#[derive(Clone, Debug)]
pub struct CreditLedger {
    flow_control: FlowControl,
    vc_buf_size: usize,
    occupancy: usize,
    vcs: Vec<VcCredit>,
}

impl CreditLedger {
    pub fn new(num_vcs: usize, vc_buf_size: usize, flow_control: FlowControl) -> Self {
        Self {
            flow_control,
            vc_buf_size,
            occupancy: 0,
            vcs: vec![VcCredit::default(); num_vcs],
        }
    }

    pub fn flow_control(&self) -> FlowControl {
        self.flow_control
    }

    pub fn num_vcs(&self) -> usize {
        self.vcs.len()
    }

    /// Room left on `vc` if a flit may be granted it under the flow-control
    /// discipline, `None` otherwise. Nothing is reserved.
    pub fn try_reserve(&self, vc: VcId, head: bool, packet_size: usize) -> Option<usize> {
        let available = self.available_for(vc);
        let needed = if head {
            if !self.is_available_for(vc) {
                return None;
            }
            if self.flow_control.head_needs_whole_packet() {
                packet_size.max(1)
            } else {
                1
            }
        } else {
            1
        };
        if available >= needed {
            Some(available)
        } else {
            None
        }
    }

    /// Marks `vc` as owned by packet `pid`.
    pub fn take_buffer(&mut self, vc: VcId, pid: PacketId) -> Result<(), Error> {
        let entry = &mut self.vcs[vc];
        if let Some(owner) = entry.in_use_by {
            return Err(Error::VcDoubleAllocation {
                vc,
                owner,
                requester: pid,
            });
        }
        entry.in_use_by = Some(pid);
        entry.tail_sent = false;
        Ok(())
    }

    /// Reserves one slot of `vc` for a flit about to be sent.
    pub fn sending_flit(&mut self, vc: VcId, tail: bool) -> Result<(), Error> {
        let capacity = self.vc_buf_size;
        let release_at_tail = !self.flow_control.waits_for_tail_credit();
        let entry = &mut self.vcs[vc];
        if entry.occupancy >= capacity {
            return Err(Error::CreditOverflow { vc, capacity });
        }
        entry.occupancy += 1;
        if tail {
            entry.tail_sent = true;
            if release_at_tail {
                entry.in_use_by = None;
            }
        }
        self.occupancy += 1;
        Ok(())
    }

    /// Returns one slot per VC listed in the credit.
    pub fn process_credit(&mut self, credit: &Credit) -> Result<(), Error> {
        let wait_for_tail = self.flow_control.waits_for_tail_credit();
        for &vc in &credit.vcs {
            let entry = self.vcs.get_mut(vc).ok_or(Error::CreditUnderflow { vc })?;
            if entry.occupancy == 0 {
                return Err(Error::CreditUnderflow { vc });
            }
            entry.occupancy -= 1;
            if wait_for_tail && entry.occupancy == 0 && entry.tail_sent {
                entry.in_use_by = None;
            }
            self.occupancy -= 1;
        }
        Ok(())
    }

    /// The unowned VC in `[vc_start, vc_end]` with the fewest occupied slots.
    /// Ties go to the lowest VC.
    pub fn avail_vc_min_occupancy(&self, vc_start: VcId, vc_end: VcId) -> Option<VcId> {
        (vc_start..=vc_end.min(self.vcs.len().saturating_sub(1)))
            .filter(|&vc| self.is_available_for(vc))
            .min_by_key(|&vc| self.vcs[vc].occupancy)
    }

    /// The VC a new packet may claim in `[vc_start, vc_end]`. A packet of a
    /// pinned flow `(src, dest)` waits for its flow's VC.
    pub fn avail_vc(
        &self,
        vc_start: VcId,
        vc_end: VcId,
        pinned: Option<(NodeId, NodeId)>,
    ) -> Option<VcId> {
        match pinned {
            Some((src, dest)) => {
                let vc = flow_vc(vc_start, vc_end, src, dest);
                if vc < self.vcs.len() && self.is_available_for(vc) {
                    Some(vc)
                } else {
                    None
                }
            }
            None => self.avail_vc_min_occupancy(vc_start, vc_end),
        }
    }

    pub fn is_available_for(&self, vc: VcId) -> bool {
        self.vcs[vc].in_use_by.is_none()
    }

    pub fn in_use_by(&self, vc: VcId) -> Option<PacketId> {
        self.vcs[vc].in_use_by
    }

    pub fn available_for(&self, vc: VcId) -> usize {
        self.vc_buf_size - self.vcs[vc].occupancy
    }

    pub fn limit_for(&self, _vc: VcId) -> usize {
        self.vc_buf_size
    }

    pub fn occupancy_for(&self, vc: VcId) -> usize {
        self.vcs[vc].occupancy
    }

    /// Slots reserved on all VCs.
    pub fn used_credits(&self) -> usize {
        self.occupancy
    }

    pub fn is_full(&self) -> bool {
        self.occupancy == self.vc_buf_size * self.vcs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credit(vc: VcId) -> Credit {
        let mut c = Credit::new(0);
        c.add_vc(vc);
        c
    }

    #[test]
    fn whole_packet_must_fit_for_cut_through_heads() {
        let mut ledger = CreditLedger::new(2, 4, FlowControl::VirtualCutThrough);
        assert_eq!(ledger.try_reserve(0, true, 4), Some(4));
        ledger.sending_flit(0, false).unwrap();
        assert_eq!(ledger.try_reserve(0, true, 4), None);
        assert_eq!(ledger.try_reserve(0, true, 3), Some(3));
        // body flits only need one slot
        assert_eq!(ledger.try_reserve(0, false, 4), Some(3));
    }

    #[test]
    fn wormhole_heads_need_a_single_slot() {
        let mut ledger = CreditLedger::new(1, 4, FlowControl::Wormhole);
        for _ in 0..3 {
            ledger.sending_flit(0, false).unwrap();
        }
        assert_eq!(ledger.try_reserve(0, true, 8), Some(1));
    }

    #[test]
    fn owned_vc_rejects_heads() {
        let mut ledger = CreditLedger::new(1, 4, FlowControl::VirtualCutThrough);
        ledger.take_buffer(0, 3).unwrap();
        assert_eq!(ledger.try_reserve(0, true, 1), None);
        assert_eq!(
            ledger.take_buffer(0, 4),
            Err(Error::VcDoubleAllocation {
                vc: 0,
                owner: 3,
                requester: 4
            })
        );
    }

    #[test]
    fn virtual_cut_through_releases_at_tail_sent() {
        let mut ledger = CreditLedger::new(1, 4, FlowControl::VirtualCutThrough);
        ledger.take_buffer(0, 1).unwrap();
        ledger.sending_flit(0, false).unwrap();
        assert!(!ledger.is_available_for(0));
        ledger.sending_flit(0, true).unwrap();
        assert!(ledger.is_available_for(0));
        assert_eq!(ledger.occupancy_for(0), 2);
    }

    #[test]
    fn wormhole_releases_at_last_credit() {
        let mut ledger = CreditLedger::new(1, 4, FlowControl::Wormhole);
        ledger.take_buffer(0, 1).unwrap();
        ledger.sending_flit(0, false).unwrap();
        ledger.sending_flit(0, true).unwrap();
        assert!(!ledger.is_available_for(0));
        ledger.process_credit(&credit(0)).unwrap();
        assert!(!ledger.is_available_for(0));
        ledger.process_credit(&credit(0)).unwrap();
        assert!(ledger.is_available_for(0));
        assert_eq!(ledger.used_credits(), 0);
    }

    #[test]
    fn credits_are_conserved() {
        let mut ledger = CreditLedger::new(2, 2, FlowControl::CutThrough);
        ledger.sending_flit(1, false).unwrap();
        ledger.sending_flit(1, true).unwrap();
        assert_eq!(
            ledger.sending_flit(1, false),
            Err(Error::CreditOverflow { vc: 1, capacity: 2 })
        );
        ledger.process_credit(&credit(1)).unwrap();
        ledger.process_credit(&credit(1)).unwrap();
        assert_eq!(
            ledger.process_credit(&credit(1)),
            Err(Error::CreditUnderflow { vc: 1 })
        );
        assert_eq!(ledger.available_for(1), ledger.limit_for(1));
    }

    #[test]
    fn min_occupancy_picks_lowest_free_vc() {
        let mut ledger = CreditLedger::new(4, 4, FlowControl::VirtualCutThrough);
        ledger.sending_flit(0, false).unwrap();
        ledger.take_buffer(1, 9).unwrap();
        assert_eq!(ledger.avail_vc_min_occupancy(0, 3), Some(2));
        assert_eq!(ledger.avail_vc_min_occupancy(0, 1), Some(0));
        ledger.take_buffer(0, 8).unwrap();
        assert_eq!(ledger.avail_vc_min_occupancy(0, 1), None);
    }

    #[test]
    fn pinned_flows_wait_for_their_own_vc() {
        let mut ledger = CreditLedger::new(4, 4, FlowControl::VirtualCutThrough);
        assert_eq!(flow_vc(0, 3, 1, 2), 3);
        assert_eq!(flow_vc(2, 3, 1, 2), 3);
        assert_eq!(flow_vc(2, 3, 2, 2), 2);
        assert_eq!(ledger.avail_vc(0, 3, Some((1, 2))), Some(3));
        ledger.take_buffer(3, 5).unwrap();
        assert_eq!(ledger.avail_vc(0, 3, Some((1, 2))), None);
        assert_eq!(ledger.avail_vc(0, 3, None), Some(0));
    }
}
