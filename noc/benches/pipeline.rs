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

use bencher::Bencher;
use bencher::{benchmark_group, benchmark_main};

use noc::{Network, NetworkConfiguration, RouterConfiguration, SimulationCallbacks};
use noc::{TrafficConfiguration, TrafficGenerator};

// cycles simulated per iteration
const CYCLES: usize = 1000;

fn mesh(bench: &mut Bencher, router: &str, rate: f64) {
    let config = NetworkConfiguration {
        k: 8,
        n: 2,
        router: RouterConfiguration {
            router: router.to_string(),
            ..Default::default()
        },
        ..Default::default()
    };
    let traffic = TrafficConfiguration {
        injection_rate: rate,
        ..Default::default()
    };

    bench.iter(|| {
        let mut network = Network::new(&config).unwrap();
        let mut generator = TrafficGenerator::new(&traffic, &config).unwrap();
        let mut callbacks = SimulationCallbacks::default();
        for _ in 0..CYCLES {
            generator.generate(&mut network).unwrap();
            network.step(&mut callbacks).unwrap();
        }
        network.delivered().count()
    });
}

fn buffered_low_load(bench: &mut Bencher) {
    mesh(bench, "vct", 0.05);
}

fn bypass_low_load(bench: &mut Bencher) {
    mesh(bench, "bypass_vct", 0.05);
}

fn smart_low_load(bench: &mut Bencher) {
    mesh(bench, "smart", 0.05);
}

fn bypass_high_load(bench: &mut Bencher) {
    mesh(bench, "bypass_vct", 0.3);
}

benchmark_group!(
    benches,
    buffered_low_load,
    bypass_low_load,
    smart_low_load,
    bypass_high_load
);
benchmark_main!(benches);
