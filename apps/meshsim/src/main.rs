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

//! Runs a synthetic-traffic experiment on a mesh of NoC routers and prints
//! latency and stall statistics.

use anyhow::Context;
use env_logger::Target;
use log::info;
use serde::Serialize;
use std::collections::BTreeMap;
use structopt::StructOpt;

use noc::{Config, Cycle, Delivery, Network, Proposal, SimulationCallbacks, StallCounters};
use noc::{StallReason, TextTrace, TrafficGenerator};

#[derive(StructOpt)]
#[structopt(name = "meshsim", about = "Cycle-accurate mesh NoC simulator")]
struct Arguments {
    /// YAML configuration; defaults are used for anything left out
    #[structopt(long)]
    config: Option<String>,
    /// cycles of traffic generation
    #[structopt(short, long, default_value = "10000")]
    cycles: Cycle,
    /// extra cycles allowed for draining the network
    #[structopt(long, default_value = "100000")]
    drain: Cycle,
    /// router variant: vct, bypass_vct or smart
    #[structopt(short, long)]
    router: Option<String>,
    /// flits per node per cycle
    #[structopt(long)]
    rate: Option<f64>,
    #[structopt(long)]
    pattern: Option<String>,
    #[structopt(long)]
    seed: Option<u64>,
    /// ignore lookaheads (bypass routers behave like buffered ones)
    #[structopt(long)]
    disable_bypass: bool,
    /// print every event of the packet with this id
    #[structopt(long)]
    watch: Vec<u64>,
    /// print the summary as JSON
    #[structopt(long)]
    json: bool,
}

#[derive(Debug, Default, PartialEq, Serialize)]
struct Summary {
    router: String,
    cycles: Cycle,
    drained: bool,
    packets: usize,
    flits: usize,
    /// Creation of a packet to arrival of its tail.
    avg_packet_latency: f64,
    max_packet_latency: Cycle,
    avg_hops: f64,
    /// Delivered flits per node per cycle.
    throughput: f64,
    flit_stalls: BTreeMap<String, u64>,
    lookahead_stalls: BTreeMap<String, u64>,
    express_stalls: BTreeMap<String, u64>,
}

impl Summary {
    fn new(
        router: String,
        cycles: Cycle,
        nodes: usize,
        deliveries: &[Delivery],
        stalls: &StallCounters,
    ) -> Self {
        let tails = deliveries.iter().filter(|d| d.tail).collect::<Vec<_>>();
        let packets = tails.len();
        let mean = |total: usize, count: usize| {
            if count == 0 {
                0.0
            } else {
                total as f64 / count as f64
            }
        };
        let by_reason = |proposal| {
            StallReason::ALL
                .iter()
                .map(|&reason| (reason.to_string(), stalls.total(proposal, reason)))
                .filter(|(_, count)| *count > 0)
                .collect()
        };
        Self {
            router,
            cycles,
            drained: false,
            packets,
            flits: deliveries.len(),
            avg_packet_latency: mean(tails.iter().map(|d| d.latency()).sum(), packets),
            max_packet_latency: tails.iter().map(|d| d.latency()).max().unwrap_or(0),
            avg_hops: mean(tails.iter().map(|d| d.hops).sum(), packets),
            throughput: mean(deliveries.len(), nodes * cycles.max(1)),
            flit_stalls: by_reason(Proposal::Flit),
            lookahead_stalls: by_reason(Proposal::Lookahead),
            express_stalls: by_reason(Proposal::Express),
        }
    }

    fn print(&self) {
        println!("router:              {}", self.router);
        println!("cycles:              {}", self.cycles);
        println!("drained:             {}", self.drained);
        println!("packets delivered:   {}", self.packets);
        println!("flits delivered:     {}", self.flits);
        println!("avg packet latency:  {:.2}", self.avg_packet_latency);
        println!("max packet latency:  {}", self.max_packet_latency);
        println!("avg hops:            {:.2}", self.avg_hops);
        println!("throughput:          {:.4}", self.throughput);
        let stalls = [
            ("flit", &self.flit_stalls),
            ("lookahead", &self.lookahead_stalls),
            ("express", &self.express_stalls),
        ];
        for (name, stalls) in stalls.iter() {
            for (reason, count) in stalls.iter() {
                println!("{} stalls {:<18} {}", name, format!("{}:", reason), count);
            }
        }
    }
}

fn load_config(args: &Arguments) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(file_name) => Config::from_file(file_name)
            .with_context(|| format!("failed to load {}", file_name))?,
        None => Config::default(),
    };
    if let Some(router) = &args.router {
        config.network.router.router = router.clone();
    }
    if let Some(rate) = args.rate {
        config.traffic.injection_rate = rate;
    }
    if let Some(pattern) = &args.pattern {
        config.traffic.pattern = pattern.clone();
    }
    if let Some(seed) = args.seed {
        config.traffic.seed = seed;
    }
    config.network.router.disable_bypass |= args.disable_bypass;
    Ok(config)
}

fn simulate(config: &Config, cycles: Cycle, drain: Cycle, watch: &[u64]) -> anyhow::Result<Summary> {
    let mut network = Network::new(&config.network)?;
    for &pid in watch {
        network.watch_packet(pid);
    }
    let mut generator = TrafficGenerator::new(&config.traffic, &config.network)?;
    let trace = TextTrace::watched();
    let mut callbacks = SimulationCallbacks::new(Box::new(trace.clone()));

    for _ in 0..cycles {
        generator.generate(&mut network)?;
        network.step(&mut callbacks)?;
    }
    let drained = network.run_until_drained(drain, &mut callbacks)?;
    info!(
        "{} cycles of traffic, {} drained after cycle {}",
        cycles,
        if drained { "network" } else { "network not" },
        network.cycle()
    );
    for line in trace.lines() {
        info!("{}", line);
    }

    let deliveries = network.take_delivered();
    let mut summary = Summary::new(
        network.kind().to_string(),
        cycles,
        network.nodes(),
        &deliveries,
        &network.stalls(),
    );
    summary.drained = drained;
    Ok(summary)
}

fn main() -> anyhow::Result<()> {
    let args = Arguments::from_args();

    let _logger = env_logger::builder()
        .filter(Some("meshsim"), log::LevelFilter::Info)
        .target(Target::Stderr)
        .init();

    let config = load_config(&args)?;
    let summary = simulate(&config, args.cycles, args.drain, &args.watch)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        summary.print();
    }
    Ok(())
}
