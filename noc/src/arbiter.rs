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

//! Request/grant arbiters used at every allocation point of the router.
//!
//! An arbitration round is: any number of `add_request` calls (one bid per
//! requester, the highest priority bid is kept), one `arbitrate`, optionally
//! `update_state` when the grant is actually used, then `clear`. Requests
//! are indexed by requester, so the outcome only depends on the sequence of
//! request sets and never on iteration order of a hash container.

use std::fmt;
use std::str::FromStr;

use crate::{Error, Priority};

/// The winner of a round.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Grant {
    pub requester: usize,
    pub tag: u64,
    pub priority: Priority,
}

pub trait Arbiter: fmt::Debug {
    /// Registers a bid. A second bid from the same requester in the same
    /// round only replaces the first if its priority is higher.
    fn add_request(&mut self, requester: usize, tag: u64, priority: Priority);

    /// Picks the winner of this round: the highest priority, ties broken by
    /// the arbiter's fairness policy.
    fn arbitrate(&mut self) -> Option<Grant>;

    /// Commits the last winner to the fairness state.
    fn update_state(&mut self);

    fn clear(&mut self);

    fn is_empty(&self) -> bool;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ArbiterKind {
    RoundRobin,
    Matrix,
}

impl ArbiterKind {
    pub fn build(self, size: usize) -> Box<dyn Arbiter> {
        match self {
            Self::RoundRobin => Box::new(RoundRobinArbiter::new(size)),
            Self::Matrix => Box::new(MatrixArbiter::new(size)),
        }
    }
}

impl FromStr for ArbiterKind {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input {
            "round_robin" | "rr" => Ok(Self::RoundRobin),
            "matrix" => Ok(Self::Matrix),
            _ => Err(Error::UnknownArbiter(input.to_string())),
        }
    }
}

#[derive(Clone, Debug)]
struct Requests {
    bids: Vec<Option<(u64, Priority)>>,
    count: usize,
}

impl Requests {
    fn new(size: usize) -> Self {
        Self {
            bids: vec![None; size],
            count: 0,
        }
    }

    fn add(&mut self, requester: usize, tag: u64, priority: Priority) {
        assert!(
            requester < self.bids.len(),
            "Requester {} out of range for an arbiter of size {}.",
            requester,
            self.bids.len()
        );
        match self.bids[requester] {
            Some((_, current)) if current >= priority => {}
            Some(_) => self.bids[requester] = Some((tag, priority)),
            None => {
                self.bids[requester] = Some((tag, priority));
                self.count += 1;
            }
        }
    }

    fn max_priority(&self) -> Option<Priority> {
        self.bids.iter().flatten().map(|&(_, pri)| pri).max()
    }

    fn grant(&self, requester: usize) -> Option<Grant> {
        self.bids[requester].map(|(tag, priority)| Grant {
            requester,
            tag,
            priority,
        })
    }

    fn clear(&mut self) {
        self.bids.iter_mut().for_each(|bid| *bid = None);
        self.count = 0;
    }
}

/// Round-robin among the requesters of the highest priority, starting at the
/// one after the last committed winner.
#[derive(Clone, Debug)]
pub struct RoundRobinArbiter {
    requests: Requests,
    pointer: usize,
    last_winner: Option<usize>,
}

impl RoundRobinArbiter {
    pub fn new(size: usize) -> Self {
        Self {
            requests: Requests::new(size),
            pointer: 0,
            last_winner: None,
        }
    }
}

impl Arbiter for RoundRobinArbiter {
    fn add_request(&mut self, requester: usize, tag: u64, priority: Priority) {
        self.requests.add(requester, tag, priority);
    }

    fn arbitrate(&mut self) -> Option<Grant> {
        let size = self.requests.bids.len();
        let max = self.requests.max_priority()?;
        let winner = (0..size)
            .map(|offset| (self.pointer + offset) % size)
            .find(|&i| matches!(self.requests.bids[i], Some((_, pri)) if pri == max))?;
        self.last_winner = Some(winner);
        self.requests.grant(winner)
    }

    fn update_state(&mut self) {
        if let Some(winner) = self.last_winner {
            self.pointer = (winner + 1) % self.requests.bids.len();
        }
    }

    fn clear(&mut self) {
        self.requests.clear();
        self.last_winner = None;
    }

    fn is_empty(&self) -> bool {
        self.requests.count == 0
    }
}

/// Least-recently-granted arbitration among the requesters of the highest
/// priority.
///
/// `matrix[i][j]` is set when `i` currently beats `j`. Committing a winner
/// moves it below everybody else.
#[derive(Clone, Debug)]
pub struct MatrixArbiter {
    requests: Requests,
    matrix: Vec<Vec<bool>>,
    last_winner: Option<usize>,
}

impl MatrixArbiter {
    pub fn new(size: usize) -> Self {
        Self {
            requests: Requests::new(size),
            matrix: (0..size)
                .map(|i| (0..size).map(|j| i < j).collect())
                .collect(),
            last_winner: None,
        }
    }
}

impl Arbiter for MatrixArbiter {
    fn add_request(&mut self, requester: usize, tag: u64, priority: Priority) {
        self.requests.add(requester, tag, priority);
    }

    fn arbitrate(&mut self) -> Option<Grant> {
        let max = self.requests.max_priority()?;
        let candidates: Vec<usize> = self
            .requests
            .bids
            .iter()
            .enumerate()
            .filter(|(_, bid)| matches!(bid, Some((_, pri)) if *pri == max))
            .map(|(i, _)| i)
            .collect();
        let winner = candidates
            .iter()
            .copied()
            .find(|&i| candidates.iter().all(|&j| i == j || self.matrix[i][j]))
            .or_else(|| candidates.first().copied())?;
        self.last_winner = Some(winner);
        self.requests.grant(winner)
    }

    fn update_state(&mut self) {
        if let Some(winner) = self.last_winner {
            for other in 0..self.matrix.len() {
                if other != winner {
                    self.matrix[winner][other] = false;
                    self.matrix[other][winner] = true;
                }
            }
        }
    }

    fn clear(&mut self) {
        self.requests.clear();
        self.last_winner = None;
    }

    fn is_empty(&self) -> bool {
        self.requests.count == 0
    }
}
