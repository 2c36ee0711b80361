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

use std::fmt;

const REASONS: usize = 9;

/// Why a proposal (a buffered flit, a lookahead or an express request) did
/// not win this cycle.
///
/// Every losing proposal is attributed exactly one reason.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum StallReason {
    /// Lost output arbitration to another input.
    CrossbarConflict,
    /// Every candidate destination VC is owned by another packet.
    BufferBusy,
    /// A destination VC is free but part of its room is still held by
    /// flits of an earlier packet, not enough for this one.
    BufferReserved,
    /// The destination VC has no free slot at all.
    BufferFull,
    /// The output is locked by a bypassing packet or, with ordering
    /// guarantees, by packets buffered at this input.
    OutputBlocked,
    /// The input VC still holds or forwards another packet.
    InputBusy,
    /// Lost local arbitration to another VC of the same input.
    SwitchInput,
    /// Won output arbitration but was displaced by a bypassing packet.
    WinnerKilled,
    /// The flit already crosses the most routers one cycle allows.
    HopLimit,
}

impl StallReason {
    pub const ALL: [StallReason; REASONS] = [
        StallReason::CrossbarConflict,
        StallReason::BufferBusy,
        StallReason::BufferReserved,
        StallReason::BufferFull,
        StallReason::OutputBlocked,
        StallReason::InputBusy,
        StallReason::SwitchInput,
        StallReason::WinnerKilled,
        StallReason::HopLimit,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for StallReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::CrossbarConflict => "crossbar_conflict",
            Self::BufferBusy => "buffer_busy",
            Self::BufferReserved => "buffer_reserved",
            Self::BufferFull => "buffer_full",
            Self::OutputBlocked => "output_blocked",
            Self::InputBusy => "input_busy",
            Self::SwitchInput => "switch_input",
            Self::WinnerKilled => "winner_killed",
            Self::HopLimit => "hop_limit",
        };
        write!(f, "{}", name)
    }
}

/// Who suffered a stall.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Proposal {
    /// A buffered flit in switch allocation.
    Flit,
    /// A lookahead that arrived over a link.
    Lookahead,
    /// A lookahead asking to carry its flit through this router in the same
    /// cycle it leaves the router upstream (smart routers).
    Express,
}

impl Proposal {
    pub const ALL: [Proposal; 3] = [Proposal::Flit, Proposal::Lookahead, Proposal::Express];
}

/// Stall counts per traffic class and reason, kept apart per proposal kind.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct StallCounters {
    flits: Vec<[u64; REASONS]>,
    lookaheads: Vec<[u64; REASONS]>,
    express: Vec<[u64; REASONS]>,
}

impl StallCounters {
    pub fn new(classes: usize) -> Self {
        Self {
            flits: vec![[0; REASONS]; classes],
            lookaheads: vec![[0; REASONS]; classes],
            express: vec![[0; REASONS]; classes],
        }
    }

    fn table(&self, proposal: Proposal) -> &Vec<[u64; REASONS]> {
        match proposal {
            Proposal::Flit => &self.flits,
            Proposal::Lookahead => &self.lookaheads,
            Proposal::Express => &self.express,
        }
    }

    pub fn record(&mut self, proposal: Proposal, cl: usize, reason: StallReason) {
        let table = match proposal {
            Proposal::Flit => &mut self.flits,
            Proposal::Lookahead => &mut self.lookaheads,
            Proposal::Express => &mut self.express,
        };
        if table.len() <= cl {
            table.resize(cl + 1, [0; REASONS]);
        }
        table[cl][reason.index()] += 1;
    }

    pub fn get(&self, proposal: Proposal, cl: usize, reason: StallReason) -> u64 {
        self.table(proposal)
            .get(cl)
            .map_or(0, |row| row[reason.index()])
    }

    /// Sum over all classes.
    pub fn total(&self, proposal: Proposal, reason: StallReason) -> u64 {
        self.table(proposal)
            .iter()
            .map(|row| row[reason.index()])
            .sum()
    }

    /// Sum over all classes and reasons.
    pub fn total_stalls(&self, proposal: Proposal) -> u64 {
        StallReason::ALL
            .iter()
            .map(|&reason| self.total(proposal, reason))
            .sum()
    }

    /// Adds `other` into `self`.
    pub fn merge(&mut self, other: &StallCounters) {
        add_table(&mut self.flits, &other.flits);
        add_table(&mut self.lookaheads, &other.lookaheads);
        add_table(&mut self.express, &other.express);
    }
}

fn add_table(into: &mut Vec<[u64; REASONS]>, from: &[[u64; REASONS]]) {
    if into.len() < from.len() {
        into.resize(from.len(), [0; REASONS]);
    }
    for (row, other) in into.iter_mut().zip(from) {
        for (count, add) in row.iter_mut().zip(other.iter()) {
            *count += add;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_per_class_and_reason() {
        let mut stalls = StallCounters::new(1);
        stalls.record(Proposal::Flit, 0, StallReason::BufferFull);
        stalls.record(Proposal::Flit, 2, StallReason::BufferFull);
        stalls.record(Proposal::Lookahead, 0, StallReason::InputBusy);
        stalls.record(Proposal::Express, 1, StallReason::HopLimit);
        assert_eq!(stalls.get(Proposal::Flit, 0, StallReason::BufferFull), 1);
        assert_eq!(stalls.total(Proposal::Flit, StallReason::BufferFull), 2);
        assert_eq!(stalls.total_stalls(Proposal::Flit), 2);
        assert_eq!(stalls.total_stalls(Proposal::Lookahead), 1);
        assert_eq!(stalls.get(Proposal::Express, 1, StallReason::HopLimit), 1);
        assert_eq!(stalls.get(Proposal::Lookahead, 1, StallReason::HopLimit), 0);
        assert_eq!(stalls.get(Proposal::Flit, 5, StallReason::BufferFull), 0);

        let mut sum = StallCounters::new(1);
        sum.merge(&stalls);
        sum.merge(&stalls);
        assert_eq!(sum.total(Proposal::Flit, StallReason::BufferFull), 4);
        assert_eq!(sum.total_stalls(Proposal::Express), 2);
    }
}
