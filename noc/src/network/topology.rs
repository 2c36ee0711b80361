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

use itertools::Itertools;
use petgraph::prelude::*;

use crate::router::Downstream;
use crate::routing::MeshShape;
use crate::{Cycle, NodeId, PortId, RouterId};

/// A vertex of the topology graph.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Endpoint {
    Router(RouterId),
    Terminal(NodeId),
}

/// A simplex link from `src_port` of the source to `dst_port` of the
/// destination.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Link {
    pub src_port: PortId,
    pub dst_port: PortId,
    pub latency: Cycle,
}

/// The wiring of a network. It is built once and only read afterwards.
#[derive(Debug)]
pub struct Topology {
    shape: MeshShape,
    graph: Graph<Endpoint, Link>,
    routers: Vec<NodeIndex>,
}

/// Linear index of a node from its coordinates, dimension 0 varying fastest.
fn linearize_index(elem: &[usize], dims: &[usize]) -> usize {
    let mut index: usize = 0;
    for (d, c) in elem.iter().enumerate() {
        index += c * dims[0..d].iter().product::<usize>();
    }
    index
}

impl Topology {
    /// A k-ary n-dimensional mesh with one terminal per router.
    ///
    /// Output port `2d` of a router leads to the next router up dimension
    /// `d` and arrives there on input `2d + 1`; port `2d + 1` leads down and
    /// arrives on input `2d`. Port `2n` connects the terminal both ways.
    /// Ports on the border of the mesh stay unconnected.
    pub fn mesh(shape: MeshShape, latency: Cycle) -> Self {
        let dims = vec![shape.k; shape.n];
        let mut graph = Graph::new();
        let routers = (0..shape.nodes())
            .map(|id| graph.add_node(Endpoint::Router(id)))
            .collect::<Vec<_>>();

        for e in dims.iter().map(|&d| 0..d).multi_cartesian_product() {
            for (d, &m) in dims.iter().enumerate() {
                if e[d] + 1 < m {
                    let mut n = e.clone();
                    n[d] = e[d] + 1;
                    let src = routers[linearize_index(&e, &dims)];
                    let dst = routers[linearize_index(&n, &dims)];
                    graph.add_edge(
                        src,
                        dst,
                        Link {
                            src_port: 2 * d,
                            dst_port: 2 * d + 1,
                            latency,
                        },
                    );
                    graph.add_edge(
                        dst,
                        src,
                        Link {
                            src_port: 2 * d + 1,
                            dst_port: 2 * d,
                            latency,
                        },
                    );
                }
            }
        }

        let eject = shape.eject_port();
        for (node, &router) in routers.iter().enumerate() {
            let terminal = graph.add_node(Endpoint::Terminal(node));
            let link = Link {
                src_port: eject,
                dst_port: eject,
                latency,
            };
            graph.add_edge(terminal, router, link);
            graph.add_edge(router, terminal, link);
        }
        log::debug!(
            "mesh {}-ary {}-cube: {} endpoints, {} links",
            shape.k,
            shape.n,
            graph.node_count(),
            graph.edge_count()
        );

        Self {
            shape,
            graph,
            routers,
        }
    }

    pub fn shape(&self) -> MeshShape {
        self.shape
    }

    pub fn num_routers(&self) -> usize {
        self.routers.len()
    }

    /// Every simplex link as `(source, destination, link)`.
    pub fn links(&self) -> impl Iterator<Item = (Endpoint, Endpoint, Link)> + '_ {
        self.graph.edge_references().map(move |edge| {
            (
                self.graph[edge.source()],
                self.graph[edge.target()],
                *edge.weight(),
            )
        })
    }

    /// What each output port of `router` leads to.
    pub fn downstream(&self, router: RouterId) -> Vec<Downstream> {
        let mut downstream = vec![Downstream::Unconnected; self.shape.radix()];
        for edge in self.graph.edges(self.routers[router]) {
            let port = edge.weight().src_port;
            downstream[port] = match self.graph[edge.target()] {
                Endpoint::Router(id) => Downstream::Router {
                    id,
                    input: edge.weight().dst_port,
                },
                Endpoint::Terminal(node) => Downstream::Terminal(node),
            };
        }
        downstream
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mesh_wiring() {
        let topology = Topology::mesh(MeshShape::new(3, 2), 1);
        assert_eq!(topology.num_routers(), 9);
        // 12 bidirectional router links plus 9 terminal pairs.
        assert_eq!(topology.links().count(), 2 * 12 + 2 * 9);

        // Router 4 is the center: every port is connected.
        let center = topology.downstream(4);
        assert_eq!(center[0], Downstream::Router { id: 5, input: 1 });
        assert_eq!(center[1], Downstream::Router { id: 3, input: 0 });
        assert_eq!(center[2], Downstream::Router { id: 7, input: 3 });
        assert_eq!(center[3], Downstream::Router { id: 1, input: 2 });
        assert_eq!(center[4], Downstream::Terminal(4));

        // Router 0 is a corner.
        let corner = topology.downstream(0);
        assert_eq!(corner[1], Downstream::Unconnected);
        assert_eq!(corner[3], Downstream::Unconnected);
    }

    #[test]
    fn ports_follow_routing() {
        let shape = MeshShape::new(4, 2);
        let topology = Topology::mesh(shape, 2);
        for router in 0..shape.nodes() {
            for dest in 0..shape.nodes() {
                let port = shape.next_port(router, dest, false);
                match topology.downstream(router)[port] {
                    Downstream::Router { id, .. } => assert_ne!(id, router),
                    Downstream::Terminal(node) => assert_eq!(node, dest),
                    Downstream::Unconnected => panic!("{} -> {} uses a border port", router, dest),
                }
            }
        }
        assert!(topology.links().all(|(_, _, link)| link.latency == 2));
    }
}
