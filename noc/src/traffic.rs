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

//! Synthetic traffic: destination patterns and Bernoulli injection.

use rand::{Rng, SeedableRng};
use rand_core::RngCore;
use rand_xoshiro::Xoshiro256StarStar;
use std::str::FromStr;

use crate::config::{NetworkConfiguration, TrafficConfiguration};
use crate::network::Network;
use crate::routing::MeshShape;
use crate::{Error, NodeId};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TrafficPattern {
    /// Any node, the source included.
    Uniform,
    /// Swaps the high and low halves of the node id bits.
    Transpose,
    /// Inverts every node id bit.
    BitComplement,
    /// One step up in every dimension, wrapping around.
    Neighbor,
    /// Just under half-way around every dimension.
    Tornado,
}

impl FromStr for TrafficPattern {
    type Err = Error;

    fn from_str(name: &str) -> Result<Self, Error> {
        match name {
            "uniform" => Ok(Self::Uniform),
            "transpose" => Ok(Self::Transpose),
            "bitcomp" | "bit_complement" => Ok(Self::BitComplement),
            "neighbor" => Ok(Self::Neighbor),
            "tornado" => Ok(Self::Tornado),
            _ => Err(Error::UnknownTrafficPattern(name.to_string())),
        }
    }
}

impl TrafficPattern {
    /// Bit permutations need a power-of-two node count; transpose needs an
    /// even power.
    pub fn validate(self, shape: MeshShape) -> Result<(), Error> {
        let nodes = shape.nodes();
        let bits = nodes.trailing_zeros();
        match self {
            Self::Transpose | Self::BitComplement if !nodes.is_power_of_two() => {
                Err(Error::InvalidConfiguration(format!(
                    "{:?} traffic needs a power-of-two node count, not {}",
                    self, nodes
                )))
            }
            Self::Transpose if bits % 2 != 0 => Err(Error::InvalidConfiguration(format!(
                "transpose traffic needs an even power-of-two node count, not {}",
                nodes
            ))),
            _ => Ok(()),
        }
    }

    pub fn dest<R: Rng + ?Sized>(self, src: NodeId, shape: MeshShape, rng: &mut R) -> NodeId {
        let nodes = shape.nodes();
        match self {
            Self::Uniform => rng.gen_range(0..nodes),
            Self::Transpose => {
                let shift = nodes.trailing_zeros() / 2;
                let mask_lo = (1 << shift) - 1;
                let mask_hi = mask_lo << shift;
                ((src >> shift) & mask_lo) | ((src << shift) & mask_hi)
            }
            Self::BitComplement => !src & (nodes - 1),
            Self::Neighbor => digit_permutation(src, shape, 1),
            Self::Tornado => digit_permutation(src, shape, (shape.k + 1) / 2 - 1),
        }
    }
}

/// Adds `offset` to every coordinate of `src`, modulo `k`.
fn digit_permutation(src: NodeId, shape: MeshShape, offset: usize) -> NodeId {
    let mut place = 1;
    let mut dest = 0;
    for _ in 0..shape.n {
        dest += place * ((src / place % shape.k + offset) % shape.k);
        place *= shape.k;
    }
    dest
}

/// Each cycle, each source starts a packet with probability `rate`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BernoulliInjection {
    rate: f64,
}

impl BernoulliInjection {
    pub fn new(rate: f64) -> Result<Self, Error> {
        if !(0.0..=1.0).contains(&rate) {
            return Err(Error::InvalidConfiguration(format!(
                "injection probability {} outside [0, 1]",
                rate
            )));
        }
        Ok(Self { rate })
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn fire<R: Rng + ?Sized>(&self, rng: &mut R) -> bool {
        rng.gen_bool(self.rate)
    }
}

/// Drives a network with synthetic traffic. Seeded, so runs replay exactly.
pub struct TrafficGenerator {
    pattern: TrafficPattern,
    injection: BernoulliInjection,
    packet_size: usize,
    rng: Box<dyn RngCore>,
}

impl TrafficGenerator {
    /// `config.injection_rate` is in flits per node per cycle. The packet
    /// size must fit the flow control of `network`.
    pub fn new(config: &TrafficConfiguration, network: &NetworkConfiguration) -> Result<Self, Error> {
        let pattern: TrafficPattern = config.pattern.parse()?;
        pattern.validate(network.shape()?)?;
        network.router.check_packet_size(config.packet_size)?;
        let injection = BernoulliInjection::new(config.injection_rate / config.packet_size as f64)?;
        Ok(Self {
            pattern,
            injection,
            packet_size: config.packet_size,
            rng: Box::new(Xoshiro256StarStar::seed_from_u64(config.seed)),
        })
    }

    pub fn pattern(&self) -> TrafficPattern {
        self.pattern
    }

    /// Offers each terminal of `network` a packet for this cycle. Returns the
    /// number of packets queued.
    pub fn generate(&mut self, network: &mut Network) -> Result<usize, Error> {
        let shape = network.topology().shape();
        let mut generated = 0;
        for src in 0..network.nodes() {
            if self.injection.fire(&mut self.rng) {
                let dest = self.pattern.dest(src, shape, &mut self.rng);
                network.enqueue_packet(src, dest, self.packet_size, false)?;
                generated += 1;
            }
        }
        Ok(generated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patterns_parse() {
        assert_eq!("tornado".parse::<TrafficPattern>(), Ok(TrafficPattern::Tornado));
        assert_eq!(
            "bitcomp".parse::<TrafficPattern>(),
            Ok(TrafficPattern::BitComplement)
        );
        assert_eq!(
            "hotspot".parse::<TrafficPattern>(),
            Err(Error::UnknownTrafficPattern("hotspot".to_string()))
        );
    }

    #[test]
    fn permutations() {
        let shape = MeshShape::new(4, 2);
        let mut rng = Xoshiro256StarStar::seed_from_u64(1);
        // Node 1 is (1, 0).
        assert_eq!(TrafficPattern::Transpose.dest(1, shape, &mut rng), 4);
        assert_eq!(TrafficPattern::BitComplement.dest(1, shape, &mut rng), 14);
        assert_eq!(TrafficPattern::Neighbor.dest(1, shape, &mut rng), 6);
        assert_eq!(TrafficPattern::Neighbor.dest(15, shape, &mut rng), 0);
        assert_eq!(TrafficPattern::Tornado.dest(0, shape, &mut rng), 5);
        for src in 0..16 {
            assert!(TrafficPattern::Uniform.dest(src, shape, &mut rng) < 16);
        }
    }

    #[test]
    fn bit_patterns_need_powers_of_two() {
        assert!(TrafficPattern::BitComplement.validate(MeshShape::new(3, 2)).is_err());
        assert!(TrafficPattern::Transpose.validate(MeshShape::new(2, 3)).is_err());
        assert!(TrafficPattern::Transpose.validate(MeshShape::new(4, 2)).is_ok());
        assert!(TrafficPattern::Tornado.validate(MeshShape::new(3, 2)).is_ok());
    }

    #[test]
    fn injection_rate_is_bounded() {
        assert!(BernoulliInjection::new(1.5).is_err());
        let always = BernoulliInjection::new(1.0).unwrap();
        let never = BernoulliInjection::new(0.0).unwrap();
        let mut rng = Xoshiro256StarStar::seed_from_u64(7);
        assert!((0..100).all(|_| always.fire(&mut rng)));
        assert!((0..100).all(|_| !never.fire(&mut rng)));
    }

    #[test]
    fn packets_must_fit_a_vc_under_cut_through() {
        let mut config = crate::config::NetworkConfiguration::default();
        config.router.vc_buf_size = 4;
        let traffic = TrafficConfiguration {
            packet_size: 5,
            ..Default::default()
        };
        assert!(matches!(
            TrafficGenerator::new(&traffic, &config),
            Err(Error::InvalidConfiguration(_))
        ));
        config.router.flow_control = crate::router::FlowControl::Wormhole;
        assert!(TrafficGenerator::new(&traffic, &config).is_ok());
        let empty = TrafficConfiguration {
            packet_size: 0,
            ..Default::default()
        };
        assert!(TrafficGenerator::new(&empty, &config).is_err());
    }

    #[test]
    fn same_seed_same_traffic() {
        let config = crate::config::NetworkConfiguration::default();
        let traffic = TrafficConfiguration {
            injection_rate: 0.5,
            ..Default::default()
        };
        let mut runs = vec![];
        for _ in 0..2 {
            let mut network = Network::new(&config).unwrap();
            let mut generator = TrafficGenerator::new(&traffic, &config).unwrap();
            let counts = (0..20)
                .map(|_| generator.generate(&mut network).unwrap())
                .collect::<Vec<_>>();
            runs.push(counts);
        }
        assert_eq!(runs[0], runs[1]);
    }
}
