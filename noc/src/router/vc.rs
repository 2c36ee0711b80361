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

use std::collections::VecDeque;

use crate::flit::Flit;
use crate::{PacketId, PortId, VcId};

/// Allocation state of an input VC.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VcState {
    /// No packet is being allocated or forwarded.
    Idle,
    /// A head flit waits for local (per-input) switch allocation.
    SaInput,
    /// A head flit waits for global (per-output) switch allocation.
    SaOutput,
    /// A packet owns the VC. Its output port and destination VC are fixed
    /// until the tail leaves.
    Active,
}

/// One virtual channel of an input port: a FIFO of flits and the allocation
/// record of the packet at its head. The route set and priority travel on
/// the head flit itself.
#[derive(Debug)]
pub struct VirtualChannel {
    queue: VecDeque<Flit>,
    state: VcState,
    output: Option<(PortId, VcId)>,
    active_pid: Option<PacketId>,
}

impl Default for VirtualChannel {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            state: VcState::Idle,
            output: None,
            active_pid: None,
        }
    }
}

impl VirtualChannel {
    pub fn push(&mut self, flit: Flit) {
        if self.state == VcState::Idle && flit.head {
            self.state = VcState::SaInput;
        }
        self.queue.push_back(flit);
    }

    pub fn front(&self) -> Option<&Flit> {
        self.queue.front()
    }

    pub fn pop(&mut self) -> Option<Flit> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn state(&self) -> VcState {
        self.state
    }

    pub fn set_state(&mut self, state: VcState) {
        self.state = state;
    }

    pub fn output(&self) -> Option<(PortId, VcId)> {
        self.output
    }

    pub fn set_output(&mut self, output: Option<(PortId, VcId)>) {
        self.output = output;
    }

    pub fn active_pid(&self) -> Option<PacketId> {
        self.active_pid
    }

    pub(crate) fn set_active_pid(&mut self, pid: Option<PacketId>) {
        self.active_pid = pid;
    }
}
