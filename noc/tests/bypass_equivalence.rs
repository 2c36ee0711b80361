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

mod common;

use std::collections::BTreeMap;

use common::{init, run_traffic};
use noc::{
    Delivery, NetworkConfiguration, NodeId, PacketId, RouterConfiguration, SimulationCallbacks,
    TrafficConfiguration,
};

fn config(router: &str, disable_bypass: bool) -> NetworkConfiguration {
    NetworkConfiguration {
        k: 4,
        n: 2,
        router: RouterConfiguration {
            router: router.to_string(),
            num_vcs: 1,
            disable_bypass,
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Default VCs, with every flow pinned to one VC.
fn ordered_config(router: &str, disable_bypass: bool) -> NetworkConfiguration {
    let mut config = config(router, disable_bypass);
    config.router.num_vcs = RouterConfiguration::default().num_vcs;
    config.router.guarantee_order = true;
    config
}

fn traffic() -> TrafficConfiguration {
    TrafficConfiguration {
        pattern: "uniform".to_string(),
        injection_rate: 0.2,
        packet_size: 2,
        seed: 42,
    }
}

/// Tail arrivals per (source, destination), in delivery order.
fn order(deliveries: &[Delivery]) -> BTreeMap<(NodeId, NodeId), Vec<PacketId>> {
    let mut order = BTreeMap::new();
    let mut sorted = deliveries.iter().filter(|d| d.tail).collect::<Vec<_>>();
    sorted.sort_by_key(|d| (d.atime, d.flit));
    for delivery in sorted {
        order
            .entry((delivery.src, delivery.dest))
            .or_insert_with(Vec::new)
            .push(delivery.pid);
    }
    order
}

#[test]
fn bypass_delivers_what_buffering_delivers() {
    init();
    let mut runs = vec![];
    for disable_bypass in &[false, true] {
        let mut callbacks = SimulationCallbacks::default();
        let mut network = run_traffic(&config("bypass_vct", *disable_bypass), &traffic(), 300, &mut callbacks);
        runs.push(network.take_delivered());
    }

    let (bypassed, buffered) = (&runs[0], &runs[1]);
    assert!(!buffered.is_empty());
    assert_eq!(bypassed.len(), buffered.len());
    assert_eq!(order(bypassed), order(buffered));

    let average = |deliveries: &[Delivery]| {
        deliveries.iter().map(|d| d.latency()).sum::<usize>() as f64 / deliveries.len() as f64
    };
    assert!(average(bypassed) < average(buffered));
}

#[test]
fn ordered_flows_survive_bypass_with_several_vcs() {
    init();
    for router in &["bypass_vct", "smart"] {
        let mut orders = vec![];
        for disable_bypass in &[false, true] {
            let mut callbacks = SimulationCallbacks::default();
            let config = ordered_config(router, *disable_bypass);
            assert!(config.router.num_vcs > 1);
            let mut network = run_traffic(&config, &traffic(), 300, &mut callbacks);
            orders.push(order(&network.take_delivered()));
        }
        assert!(!orders[1].is_empty());
        for pids in orders[0].values() {
            assert!(pids.windows(2).all(|pair| pair[0] < pair[1]), "{}: {:?}", router, pids);
        }
        assert_eq!(orders[0], orders[1], "{}", router);
    }
}

#[test]
fn unordered_flows_still_deliver_every_packet() {
    init();
    for router in &["bypass_vct", "smart"] {
        let mut runs = vec![];
        for disable_bypass in &[false, true] {
            let mut config = config(router, *disable_bypass);
            config.router.num_vcs = RouterConfiguration::default().num_vcs;
            let mut callbacks = SimulationCallbacks::default();
            let mut network = run_traffic(&config, &traffic(), 300, &mut callbacks);
            let mut packets = order(&network.take_delivered());
            for pids in packets.values_mut() {
                pids.sort_unstable();
            }
            runs.push(packets);
        }
        assert!(!runs[1].is_empty());
        assert_eq!(runs[0], runs[1], "{}", router);
    }
}

#[test]
fn same_seed_same_deliveries() {
    init();
    for router in &["vct", "bypass_vct", "smart"] {
        let runs = (0..2)
            .map(|_| {
                let mut callbacks = SimulationCallbacks::default();
                run_traffic(&config(router, false), &traffic(), 200, &mut callbacks).take_delivered()
            })
            .collect::<Vec<_>>();
        assert_eq!(runs[0], runs[1], "{}", router);
    }
}

#[test]
fn every_flit_arrives_once() {
    init();
    let mut callbacks = SimulationCallbacks::default();
    let mut network = run_traffic(&config("smart", false), &traffic(), 200, &mut callbacks);
    let deliveries = network.take_delivered();
    let mut flits = deliveries.iter().map(|d| d.flit).collect::<Vec<_>>();
    flits.sort_unstable();
    flits.dedup();
    assert_eq!(flits.len(), deliveries.len());
    assert!(deliveries.iter().all(|d| d.atime > d.ctime));
    assert_eq!(deliveries.iter().filter(|d| d.head).count() * 2, deliveries.len());
}
