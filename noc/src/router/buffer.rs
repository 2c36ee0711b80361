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

use crate::flit::Flit;
use crate::router::vc::{VcState, VirtualChannel};
use crate::{Error, PacketId, PortId, VcId};

/// The VCs of one input port.
///
/// Flits of a VC leave in the order they were added; the buffer never
/// reorders within a VC. Each VC holds at most `vc_buf_size` flits, which is
/// the capacity the upstream credit ledger was configured with.
#[derive(Debug)]
pub struct InputBuffer {
    port: PortId,
    vc_buf_size: usize,
    vcs: Vec<VirtualChannel>,
}

impl InputBuffer {
    pub fn new(port: PortId, num_vcs: usize, vc_buf_size: usize) -> Self {
        Self {
            port,
            vc_buf_size,
            vcs: (0..num_vcs).map(|_| VirtualChannel::default()).collect(),
        }
    }

    pub fn num_vcs(&self) -> usize {
        self.vcs.len()
    }

    /// Enqueues `flit` on `vc`. A head flit arriving at an idle VC starts
    /// waiting for switch allocation.
    pub fn add_flit(&mut self, vc: VcId, flit: Flit) -> Result<(), Error> {
        let port = self.port;
        let limit = self.vc_buf_size;
        let channel = self.vc_mut(vc)?;
        if channel.len() >= limit {
            return Err(Error::BufferOverflow { port, vc });
        }
        channel.push(flit);
        Ok(())
    }

    pub fn front(&self, vc: VcId) -> Option<&Flit> {
        self.vcs.get(vc).and_then(|channel| channel.front())
    }

    pub fn remove_flit(&mut self, vc: VcId) -> Option<Flit> {
        self.vcs.get_mut(vc).and_then(|channel| channel.pop())
    }

    pub fn is_empty(&self, vc: VcId) -> bool {
        self.vcs.get(vc).map_or(true, |channel| channel.is_empty())
    }

    pub fn occupancy(&self, vc: VcId) -> usize {
        self.vcs.get(vc).map_or(0, |channel| channel.len())
    }

    /// Flits stored across all VCs of this port.
    pub fn total_occupancy(&self) -> usize {
        self.vcs.iter().map(|channel| channel.len()).sum()
    }

    pub fn state(&self, vc: VcId) -> VcState {
        self.vcs[vc].state()
    }

    pub fn set_state(&mut self, vc: VcId, state: VcState) {
        self.vcs[vc].set_state(state);
    }

    pub fn output(&self, vc: VcId) -> Option<(PortId, VcId)> {
        self.vcs[vc].output()
    }

    /// Records the (tentative or final) output port and destination VC.
    pub fn set_output(&mut self, vc: VcId, output: PortId, dest_vc: VcId) {
        self.vcs[vc].set_output(Some((output, dest_vc)));
    }

    pub fn active_pid(&self, vc: VcId) -> Option<PacketId> {
        self.vcs[vc].active_pid()
    }

    /// Hands `vc` to packet `pid` for the rest of the packet.
    ///
    /// A VC already active for another packet is a protocol error: two
    /// packets never interleave on one VC.
    pub fn activate(
        &mut self,
        vc: VcId,
        pid: PacketId,
        output: PortId,
        dest_vc: VcId,
    ) -> Result<(), Error> {
        let channel = self.vc_mut(vc)?;
        if let (VcState::Active, Some(owner)) = (channel.state(), channel.active_pid()) {
            if owner != pid {
                return Err(Error::VcDoubleAllocation {
                    vc,
                    owner,
                    requester: pid,
                });
            }
        }
        channel.set_state(VcState::Active);
        channel.set_output(Some((output, dest_vc)));
        channel.set_active_pid(Some(pid));
        Ok(())
    }

    /// Returns `vc` to idle once its packet's tail is gone.
    pub fn release(&mut self, vc: VcId) {
        let channel = &mut self.vcs[vc];
        channel.set_state(VcState::Idle);
        channel.set_output(None);
        channel.set_active_pid(None);
    }

    fn vc_mut(&mut self, vc: VcId) -> Result<&mut VirtualChannel, Error> {
        let port = self.port;
        self.vcs
            .get_mut(vc)
            .ok_or(Error::InvalidVc { port, vc })
    }
}
