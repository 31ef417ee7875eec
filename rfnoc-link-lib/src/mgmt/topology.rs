//! The device topology graph.
//!
//! Nodes live in an indexed arena; edges reference nodes by index only,
//! so cyclic topologies carry no ownership entanglement. Route finding
//! works on indices with a Dijkstra search over edge weights.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use crate::chdr::mgmt::MgmtNodeType;
use crate::error::{Result, RfnocError};

/// Physical address of a node: its device and instance number within
/// that device. Known statically from the topology; stream endpoint
/// addresses map 1:1 to EPIDs after discovery.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SepAddr {
    pub device_id: u16,
    pub instance: u16,
}

impl std::fmt::Display for SepAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.device_id, self.instance)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TopoNodeType {
    Host,
    XportAdapter,
    Xbar,
    StreamEp,
    /// A processing block behind a stream endpoint. Not discovered by
    /// the management protocol; placed by upper layers.
    Block,
}

impl From<MgmtNodeType> for TopoNodeType {
    fn from(t: MgmtNodeType) -> Self {
        match t {
            MgmtNodeType::Xbar => TopoNodeType::Xbar,
            MgmtNodeType::StreamEp => TopoNodeType::StreamEp,
            MgmtNodeType::XportAdapter => TopoNodeType::XportAdapter,
        }
    }
}

pub type NodeIndex = usize;

#[derive(Clone, Debug)]
pub struct TopoNode {
    pub node_type: TopoNodeType,
    pub addr: SepAddr,
    /// Routable ports on this node (crossbars); 1 for everything else.
    pub num_ports: u16,
}

/// What kind of hop an edge represents; drives the route weight.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EdgeKind {
    OnChip,
    Internal,
    Ethernet,
    Transport,
    Host,
    EndOfRoute,
}

impl EdgeKind {
    pub fn weight(self) -> u32 {
        match self {
            EdgeKind::OnChip | EdgeKind::Internal => 1,
            EdgeKind::Ethernet | EdgeKind::Transport => 10,
            EdgeKind::Host => 1,
            EdgeKind::EndOfRoute => 0,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct TopoEdge {
    pub src: NodeIndex,
    pub src_port: u16,
    pub dst: NodeIndex,
    pub dst_port: u16,
    pub kind: EdgeKind,
    pub weight: u32,
}

/// One step of a computed route: the node and the port it forwards on.
/// The final step's port is meaningless and set to zero.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PathStep {
    pub node: NodeIndex,
    pub out_port: u16,
}

#[derive(Debug, Default)]
pub struct TopoGraph {
    nodes: Vec<TopoNode>,
    edges: Vec<TopoEdge>,
    adj: Vec<Vec<usize>>,
}

impl TopoGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }

    pub fn node(&self, idx: NodeIndex) -> &TopoNode {
        &self.nodes[idx]
    }

    pub fn find_node(&self, node_type: TopoNodeType, addr: SepAddr) -> Option<NodeIndex> {
        self.nodes
            .iter()
            .position(|n| n.node_type == node_type && n.addr == addr)
    }

    /// Insert a node. The (type, address) pair must be unique.
    pub fn add_node(&mut self, node: TopoNode) -> Result<NodeIndex> {
        if self.find_node(node.node_type, node.addr).is_some() {
            return Err(RfnocError::Topology(format!(
                "duplicate node address {} for {:?}",
                node.addr, node.node_type
            )));
        }
        self.nodes.push(node);
        self.adj.push(Vec::new());
        Ok(self.nodes.len() - 1)
    }

    /// Insert a directed edge. Re-adding an identical edge is a no-op.
    pub fn add_edge(&mut self, edge: TopoEdge) {
        let exists = self.adj[edge.src].iter().any(|&e| {
            let known = &self.edges[e];
            known.dst == edge.dst && known.src_port == edge.src_port
        });
        if exists {
            return;
        }
        self.adj[edge.src].push(self.edges.len());
        self.edges.push(edge);
    }

    pub fn edges_from(&self, node: NodeIndex) -> impl Iterator<Item = &TopoEdge> {
        self.adj[node].iter().map(|&e| &self.edges[e])
    }

    /// Dijkstra shortest path by edge weight. Returns the step list
    /// from `from` to `to` inclusive, or `None` when unreachable.
    pub fn shortest_path(&self, from: NodeIndex, to: NodeIndex) -> Option<Vec<PathStep>> {
        let n = self.nodes.len();
        let mut dist = vec![u64::MAX; n];
        let mut prev: Vec<Option<usize>> = vec![None; n]; // edge index taken into the node
        let mut heap = BinaryHeap::new();

        dist[from] = 0;
        heap.push(Reverse((0u64, from)));

        while let Some(Reverse((d, node))) = heap.pop() {
            if d > dist[node] {
                continue;
            }
            if node == to {
                break;
            }
            for &edge_idx in &self.adj[node] {
                let edge = &self.edges[edge_idx];
                let nd = d + u64::from(edge.weight);
                if nd < dist[edge.dst] {
                    dist[edge.dst] = nd;
                    prev[edge.dst] = Some(edge_idx);
                    heap.push(Reverse((nd, edge.dst)));
                }
            }
        }

        if dist[to] == u64::MAX {
            return None;
        }

        // Walk the edge chain backwards.
        let mut steps = vec![PathStep {
            node: to,
            out_port: 0,
        }];
        let mut cursor = to;
        while cursor != from {
            let edge = &self.edges[prev[cursor].expect("path edge")];
            steps.push(PathStep {
                node: edge.src,
                out_port: edge.src_port,
            });
            cursor = edge.src;
        }
        steps.reverse();
        Some(steps)
    }
}
