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

//! The routing interface consumed by the router pipeline, and the mesh
//! routing functions used by the bundled network.
//!
//! Routing is computed one hop ahead: when a head flit (or its lookahead) is
//! granted an output, the router asks the routing function for the route the
//! packet will take at the *next* router and stores the result in the flit.
//! A routing function is a pure function of its request.

use crate::flit::OutputSet;
use crate::{Error, NodeId, PacketId, PortId, RouterId, VcId};

/// Which VCs each traffic class may use.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClassPartition {
    begin: Vec<VcId>,
    end: Vec<VcId>,
}

impl ClassPartition {
    /// Builds the partition for `classes` classes over `num_vcs` VCs.
    ///
    /// Empty `start_vc`/`end_vc` give every class all VCs. Shorter lists are
    /// padded with their last entry.
    pub fn new(
        num_vcs: usize,
        classes: usize,
        start_vc: &[VcId],
        end_vc: &[VcId],
    ) -> Result<Self, Error> {
        if num_vcs == 0 || classes == 0 {
            return Err(Error::InvalidConfiguration(
                "at least one VC and one class are required".to_string(),
            ));
        }
        let pad = |values: &[VcId], default: VcId| -> Vec<VcId> {
            let mut padded = values.to_vec();
            let last = padded.last().copied().unwrap_or(default);
            padded.resize(classes, last);
            padded.truncate(classes);
            padded
        };
        let begin = pad(start_vc, 0);
        let end = pad(end_vc, num_vcs - 1);
        for class in 0..classes {
            if begin[class] > end[class] || end[class] >= num_vcs {
                return Err(Error::InvalidVcPartition {
                    class,
                    begin: begin[class],
                    end: end[class],
                    num_vcs,
                });
            }
        }
        Ok(Self { begin, end })
    }

    pub fn classes(&self) -> usize {
        self.begin.len()
    }

    /// The VC range `[begin, end]` of class `cl`.
    pub fn range(&self, cl: usize) -> (VcId, VcId) {
        (self.begin[cl], self.end[cl])
    }
}

/// What a routing function gets to see of a packet.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RouteRequest {
    /// The router the route is computed for.
    pub router: RouterId,
    /// The input port the packet enters `router` on.
    pub in_port: PortId,
    /// The VC the packet occupies on that input.
    pub vc: VcId,
    pub dest: NodeId,
    pub cl: usize,
    pub pid: PacketId,
}

pub trait RoutingFunction: std::fmt::Debug {
    fn name(&self) -> &str;

    /// Candidate outputs of `request.router` for the packet. The set is never
    /// empty; an empty route is reported as an error.
    fn route(&self, request: &RouteRequest) -> Result<OutputSet, Error>;

    /// VCs a terminal may inject class `cl` on.
    fn injection_vcs(&self, cl: usize) -> (VcId, VcId);
}

/// Shape of a k-ary n-mesh. Node (and router) ids are linearized with
/// dimension 0 varying fastest.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MeshShape {
    pub k: usize,
    pub n: usize,
}

impl MeshShape {
    pub fn new(k: usize, n: usize) -> Self {
        Self { k, n }
    }

    pub fn nodes(&self) -> usize {
        self.k.pow(self.n as u32)
    }

    /// Port connected to the local terminal.
    pub fn eject_port(&self) -> PortId {
        2 * self.n
    }

    /// Ports per router: two per dimension plus the terminal.
    pub fn radix(&self) -> usize {
        2 * self.n + 1
    }

    /// Next output towards `dest` resolving dimensions in ascending order (or
    /// descending if `descending`). Port `2d` goes up dimension `d`, `2d + 1`
    /// goes down.
    pub fn next_port(&self, cur: NodeId, dest: NodeId, descending: bool) -> PortId {
        if cur == dest {
            return self.eject_port();
        }
        let k = self.k;
        let nodes = self.nodes();
        let (mut cur, mut dest) = (cur, dest);
        let mut dim_left;
        if descending {
            dim_left = self.n - 1;
            while dim_left > 0 {
                if cur * k / nodes != dest * k / nodes {
                    break;
                }
                cur = (cur * k) % nodes;
                dest = (dest * k) % nodes;
                dim_left -= 1;
            }
            cur = (cur * k) / nodes;
            dest = (dest * k) / nodes;
        } else {
            dim_left = 0;
            while dim_left < self.n - 1 {
                if cur % k != dest % k {
                    break;
                }
                cur /= k;
                dest /= k;
                dim_left += 1;
            }
            cur %= k;
            dest %= k;
        }
        if cur < dest {
            2 * dim_left
        } else {
            2 * dim_left + 1
        }
    }
}

/// Dimension-order routing on a mesh. Every class keeps its whole VC range.
#[derive(Clone, Debug)]
pub struct DimensionOrderMesh {
    shape: MeshShape,
    classes: ClassPartition,
}

impl DimensionOrderMesh {
    pub fn new(shape: MeshShape, classes: ClassPartition) -> Self {
        Self { shape, classes }
    }
}

impl RoutingFunction for DimensionOrderMesh {
    fn name(&self) -> &str {
        "dim_order"
    }

    fn route(&self, request: &RouteRequest) -> Result<OutputSet, Error> {
        let (begin, end) = self.classes.range(request.cl);
        let mut outputs = OutputSet::new();
        outputs.add_range(
            self.shape.next_port(request.router, request.dest, false),
            begin,
            end,
            0,
        );
        Ok(outputs)
    }

    fn injection_vcs(&self, cl: usize) -> (VcId, VcId) {
        self.classes.range(cl)
    }
}

/// XY or YX routing on a 2D mesh, picked per packet at injection.
///
/// Each class's VCs are split in halves: the lower half carries XY packets
/// and the upper half YX packets, which keeps the two orders deadlock-free
/// and lets every router recover the order from the VC alone.
#[derive(Clone, Debug)]
pub struct XyYxMesh {
    shape: MeshShape,
    classes: ClassPartition,
}

impl XyYxMesh {
    pub fn new(shape: MeshShape, classes: ClassPartition) -> Result<Self, Error> {
        for cl in 0..classes.classes() {
            let (begin, end) = classes.range(cl);
            if (end - begin + 1) / 2 == 0 {
                return Err(Error::InvalidVcPartition {
                    class: cl,
                    begin,
                    end,
                    num_vcs: end + 1,
                });
            }
        }
        Ok(Self { shape, classes })
    }
}

impl RoutingFunction for XyYxMesh {
    fn name(&self) -> &str {
        "xy_yx"
    }

    fn route(&self, request: &RouteRequest) -> Result<OutputSet, Error> {
        let (mut begin, mut end) = self.classes.range(request.cl);
        let mut outputs = OutputSet::new();
        if request.router == request.dest {
            outputs.add_range(self.shape.eject_port(), begin, end, 0);
            return Ok(outputs);
        }
        let half = (end - begin + 1) / 2;
        let x_then_y = if request.in_port < self.shape.eject_port() {
            request.vc < begin + half
        } else {
            request.pid % 2 == 0
        };
        let port = if x_then_y {
            end -= half;
            self.shape.next_port(request.router, request.dest, false)
        } else {
            begin += half;
            self.shape.next_port(request.router, request.dest, true)
        };
        outputs.add_range(port, begin, end, 0);
        Ok(outputs)
    }

    fn injection_vcs(&self, cl: usize) -> (VcId, VcId) {
        self.classes.range(cl)
    }
}

/// Looks a routing function up by name.
pub fn by_name(
    name: &str,
    shape: MeshShape,
    classes: ClassPartition,
) -> Result<Box<dyn RoutingFunction>, Error> {
    match name {
        "dim_order" | "dor" | "dim_order_mesh" => {
            Ok(Box::new(DimensionOrderMesh::new(shape, classes)))
        }
        "xy_yx" | "xy_yx_mesh" => Ok(Box::new(XyYxMesh::new(shape, classes)?)),
        _ => Err(Error::UnknownRoutingFunction(name.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(router: RouterId, dest: NodeId) -> RouteRequest {
        RouteRequest {
            router,
            in_port: 4,
            vc: 0,
            dest,
            cl: 0,
            pid: 0,
        }
    }

    #[test]
    fn dimension_order_resolves_x_first() {
        let shape = MeshShape::new(4, 2);
        // node 5 is (1, 1), node 14 is (2, 3)
        assert_eq!(shape.next_port(5, 14, false), 0);
        assert_eq!(shape.next_port(6, 14, false), 2);
        assert_eq!(shape.next_port(14, 6, false), 3);
        assert_eq!(shape.next_port(7, 5, false), 1);
        assert_eq!(shape.next_port(14, 14, false), 4);
    }

    #[test]
    fn descending_resolves_y_first() {
        let shape = MeshShape::new(4, 2);
        assert_eq!(shape.next_port(5, 14, true), 2);
        assert_eq!(shape.next_port(13, 14, true), 0);
    }

    #[test]
    fn class_partition_defaults_and_validation() {
        let classes = ClassPartition::new(4, 2, &[], &[]).unwrap();
        assert_eq!(classes.range(1), (0, 3));
        let classes = ClassPartition::new(4, 2, &[0, 2], &[1, 3]).unwrap();
        assert_eq!(classes.range(0), (0, 1));
        assert_eq!(classes.range(1), (2, 3));
        // the end list is padded with its last entry, leaving class 1 empty
        assert!(ClassPartition::new(4, 2, &[0, 2], &[1]).is_err());
        assert!(ClassPartition::new(4, 1, &[2], &[5]).is_err());
    }

    #[test]
    fn dim_order_route_keeps_class_range() {
        let shape = MeshShape::new(3, 2);
        let classes = ClassPartition::new(4, 1, &[], &[]).unwrap();
        let rf = by_name("dim_order", shape, classes).unwrap();
        let route = rf.route(&request(0, 8)).unwrap();
        let candidate = route.first().unwrap();
        assert_eq!((candidate.output, candidate.vc_start, candidate.vc_end), (0, 0, 3));
    }

    #[test]
    fn xy_yx_splits_vcs() {
        let shape = MeshShape::new(3, 2);
        let classes = ClassPartition::new(4, 1, &[], &[]).unwrap();
        let rf = XyYxMesh::new(shape, classes).unwrap();
        let xy = rf.route(&RouteRequest { pid: 2, ..request(0, 8) }).unwrap();
        assert_eq!(xy.first().map(|c| (c.output, c.vc_start, c.vc_end)), Some((0, 0, 1)));
        let yx = rf.route(&RouteRequest { pid: 3, ..request(0, 8) }).unwrap();
        assert_eq!(yx.first().map(|c| (c.output, c.vc_start, c.vc_end)), Some((2, 2, 3)));
        // downstream the VC half decides
        let next = RouteRequest {
            in_port: 1,
            vc: 3,
            ..request(3, 8)
        };
        assert_eq!(rf.route(&next).unwrap().first().map(|c| c.output), Some(2));
    }

    #[test]
    fn xy_yx_needs_two_vcs() {
        let classes = ClassPartition::new(1, 1, &[], &[]).unwrap();
        assert!(XyYxMesh::new(MeshShape::new(2, 2), classes).is_err());
    }

    #[test]
    fn unknown_routing_function() {
        let classes = ClassPartition::new(1, 1, &[], &[]).unwrap();
        assert_eq!(
            by_name("valiant", MeshShape::new(2, 2), classes).unwrap_err(),
            Error::UnknownRoutingFunction("valiant".to_string())
        );
    }
}
