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

use log::trace;

use crate::{Cycle, Error};

/// A point-to-point link with a fixed latency in cycles.
///
/// The channel is double-buffered: what is sent during cycle `t` is staged
/// and only becomes visible to `receive` at cycle `t + latency`, so the order
/// in which routers are evaluated within a cycle never matters.
///
/// Each cycle the owner calls `receive` (read phase), then at most one
/// `send` (write phase), then `commit` to close the cycle.
#[derive(Debug)]
pub struct Channel<T> {
    /// Circular buffer holding the items in flight.
    slots: Vec<Option<T>>,

    /// The slot read this cycle and refilled at commit.
    cursor: usize,

    /// The item sent this cycle, if any.
    staged: Option<T>,
}

impl<T> Channel<T> {
    pub fn new(latency: Cycle) -> Result<Self, Error> {
        if latency == 0 {
            return Err(Error::InvalidLatency(latency));
        }
        Ok(Self {
            slots: (0..latency).map(|_| None).collect(),
            cursor: 0,
            staged: None,
        })
    }

    pub fn latency(&self) -> Cycle {
        self.slots.len()
    }

    /// The item arriving this cycle.
    pub fn receive(&mut self) -> Option<T> {
        self.slots[self.cursor].take()
    }

    /// Stages `item` for delivery `latency` cycles from now.
    pub fn send(&mut self, item: T) -> Result<(), Error> {
        if self.staged.is_some() {
            return Err(Error::ChannelOverrun);
        }
        self.staged = Some(item);
        Ok(())
    }

    /// Ends the cycle. An arrival nobody received is an overrun.
    pub fn commit(&mut self) -> Result<(), Error> {
        if self.slots[self.cursor].is_some() {
            return Err(Error::ChannelOverrun);
        }
        trace!(
            "commit cursor: {}, staged: {}",
            self.cursor,
            self.staged.is_some()
        );
        self.slots[self.cursor] = self.staged.take();
        self.cursor = (self.cursor + 1) % self.slots.len();
        Ok(())
    }

    /// Items in flight, staged ones included.
    pub fn in_flight(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count() + self.staged.iter().count()
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cycle<T>(channel: &mut Channel<T>, item: Option<T>) -> Option<T> {
        let received = channel.receive();
        if let Some(item) = item {
            channel.send(item).unwrap();
        }
        channel.commit().unwrap();
        received
    }

    #[test]
    fn delivers_after_latency() {
        for latency in 1..4 {
            let mut channel = Channel::new(latency).unwrap();
            let mut received = Vec::new();
            for t in 0..8 {
                let item = if t < 3 { Some(t) } else { None };
                if let Some(value) = cycle(&mut channel, item) {
                    received.push((t, value));
                }
            }
            let expected: Vec<_> = (0..3).map(|v| (v + latency, v)).collect();
            assert_eq!(received, expected);
            assert!(channel.is_idle());
        }
    }

    #[test]
    fn same_cycle_send_is_not_visible() {
        let mut channel = Channel::new(1).unwrap();
        channel.send(1).unwrap();
        assert_eq!(channel.receive(), None);
        channel.commit().unwrap();
        assert_eq!(channel.receive(), Some(1));
    }

    #[test]
    fn zero_latency_is_rejected() {
        assert_eq!(
            Channel::<u8>::new(0).unwrap_err(),
            Error::InvalidLatency(0)
        );
    }

    #[test]
    fn overruns_are_reported() {
        let mut channel = Channel::new(1).unwrap();
        channel.send(1).unwrap();
        assert_eq!(channel.send(2), Err(Error::ChannelOverrun));
        channel.commit().unwrap();
        // arrival never received
        assert_eq!(channel.commit(), Err(Error::ChannelOverrun));
    }
}
