//! The management portal: topology discovery, endpoint initialization,
//! and crossbar route programming, all over source-routed management
//! transactions.

use std::collections::VecDeque;
use std::time::Duration;

use ahash::AHashMap;

use super::topology::{
    EdgeKind, NodeIndex, PathStep, SepAddr, TopoEdge, TopoGraph, TopoNode, TopoNodeType,
};
use super::Epid;
use crate::chdr::mgmt::{
    MgmtHop, MgmtNodeType, MgmtOp, MgmtOpCode, MgmtPayload, NodeInfo, SepCaps, XbarInfo,
    MGMT_PROTO_VER,
};
use crate::ctrl::ChdrCtrlXport;
use crate::error::{Result, RfnocError};
use crate::link::{wait_slice, Timeout};
use crate::stream::StreamBuffParams;

/// Stream endpoint management registers, addressed by CFG_RD/CFG_WR ops.
pub const REG_EPID_SELF: u16 = 0x0000;
pub const REG_RESET_AND_FLUSH: u16 = 0x0004;
pub const REG_OSTRM_CTRL_STATUS: u16 = 0x0008;
pub const REG_OSTRM_DST_EPID: u16 = 0x000C;
pub const REG_OSTRM_FC_FREQ_BYTES_LO: u16 = 0x0010;
pub const REG_OSTRM_FC_FREQ_BYTES_HI: u16 = 0x0014;
pub const REG_OSTRM_FC_FREQ_PKTS: u16 = 0x0018;
pub const REG_ISTRM_CTRL_STATUS: u16 = 0x001C;

/// `REG_RESET_AND_FLUSH` bits.
pub const RESET_CTRL: u32 = 0x1;
pub const RESET_DATA: u32 = 0x2;

/// `REG_OSTRM_CTRL_STATUS` write commands and read status bits.
pub const OSTRM_CMD_START: u32 = 0x1;
pub const OSTRM_CMD_STOP: u32 = 0x2;
pub const OSTRM_STATUS_CONFIGURED: u32 = 0x1;

/// Everything the portal knows about a discovered stream endpoint.
#[derive(Clone, Copy, Debug)]
pub struct SepInfo {
    pub addr: SepAddr,
    pub has_ctrl: bool,
    pub has_data: bool,
    pub num_input_ports: u16,
    pub num_output_ports: u16,
    pub reports_status: bool,
}

/// A portal to perform low-level management operations from one host
/// stream endpoint.
///
/// One instance exists per logical link (every link stream manager owns
/// one). It discovers everything reachable from its transport, hands
/// out endpoint initialization, and programs crossbar routes, caching
/// programmed entries to keep reprogramming idempotent.
pub struct MgmtPortal {
    my_addr: SepAddr,
    my_epid: Epid,
    max_hops: usize,
    retries: usize,
    response_timeout: Duration,
    topo: TopoGraph,
    host_node: NodeIndex,
    seps: AHashMap<SepAddr, SepInfo>,
    sep_nodes: AHashMap<SepAddr, NodeIndex>,
    addr_epid: AHashMap<SepAddr, Epid>,
    epid_addr: AHashMap<Epid, SepAddr>,
    routes: AHashMap<(NodeIndex, Epid), u16>,
}

impl MgmtPortal {
    pub fn new(my_addr: SepAddr, my_epid: Epid, response_timeout: Duration) -> Self {
        let mut topo = TopoGraph::new();
        let host_node = topo
            .add_node(TopoNode {
                node_type: TopoNodeType::Host,
                addr: my_addr,
                num_ports: 1,
            })
            .expect("empty graph accepts the host node");
        MgmtPortal {
            my_addr,
            my_epid,
            max_hops: 32,
            retries: 3,
            response_timeout,
            topo,
            host_node,
            seps: AHashMap::new(),
            sep_nodes: AHashMap::new(),
            addr_epid: AHashMap::new(),
            epid_addr: AHashMap::new(),
            routes: AHashMap::new(),
        }
    }

    pub fn my_epid(&self) -> Epid {
        self.my_epid
    }

    pub fn my_addr(&self) -> SepAddr {
        self.my_addr
    }

    pub fn topology(&self) -> &TopoGraph {
        &self.topo
    }

    /// Addresses of every stream endpoint reachable from this portal's
    /// transport.
    pub fn reachable_endpoints(&self) -> impl Iterator<Item = &SepInfo> {
        self.seps.values()
    }

    pub fn is_endpoint_registered(&self, epid: Epid) -> bool {
        self.epid_addr.contains_key(&epid)
    }

    pub fn endpoint_addr(&self, epid: Epid) -> Option<SepAddr> {
        self.epid_addr.get(&epid).copied()
    }

    pub fn endpoint_info(&self, epid: Epid) -> Result<SepInfo> {
        let addr = self.epid_addr.get(&epid).ok_or_else(|| {
            RfnocError::Topology(format!("EPID {epid} is not registered with this portal"))
        })?;
        self.seps
            .get(addr)
            .copied()
            .ok_or_else(|| RfnocError::Topology(format!("no discovered endpoint at {addr}")))
    }

    /// Breadth-first discovery of every node reachable from the host.
    ///
    /// Returns the number of stream endpoints in the catalog afterwards.
    pub fn discover(&mut self, xport: &mut ChdrCtrlXport) -> Result<usize> {
        struct Probe {
            steps: Vec<PathStep>,
            prev: NodeIndex,
            prev_port: u16,
            kind: EdgeKind,
        }

        let mut frontier = VecDeque::new();
        frontier.push_back(Probe {
            steps: Vec::new(),
            prev: self.host_node,
            prev_port: 0,
            kind: EdgeKind::Transport,
        });
        let mut first = true;

        while let Some(probe) = frontier.pop_front() {
            if probe.steps.len() >= self.max_hops {
                tracing::warn!("discovery stopped at the {}-hop bound", self.max_hops);
                continue;
            }

            let terminal = vec![
                MgmtOp::advertise(xport.epid()),
                MgmtOp::info_req(),
                MgmtOp::return_to_src(),
            ];
            let hops = self.hops_for_path(&probe.steps, terminal)?;
            let Some(resp) = self.try_transact(xport, hops)? else {
                if first {
                    return Err(RfnocError::Topology(
                        "management destination unreachable: nothing answered the first hop"
                            .to_string(),
                    ));
                }
                // A crossbar port with nothing behind it.
                tracing::trace!("no response behind port {}", probe.prev_port);
                continue;
            };
            first = false;

            let info = find_info_resp(&resp).ok_or_else(|| {
                RfnocError::Protocol("discovery response carried no INFO_RESP".to_string())
            })?;

            let node_type = TopoNodeType::from(info.node_type);
            let addr = SepAddr {
                device_id: info.device_id,
                instance: info.node_inst,
            };
            let arrival_port = match info.node_type {
                MgmtNodeType::Xbar => u16::from(XbarInfo::from_bits(info.ext_info).arrival_port),
                _ => 0,
            };

            let (node_idx, newly_added) = match self.topo.find_node(node_type, addr) {
                Some(idx) => (idx, false),
                None => {
                    let num_ports = match info.node_type {
                        MgmtNodeType::Xbar => {
                            u16::from(XbarInfo::from_bits(info.ext_info).num_ports)
                        }
                        _ => 1,
                    };
                    let idx = self.topo.add_node(TopoNode {
                        node_type,
                        addr,
                        num_ports,
                    })?;
                    (idx, true)
                }
            };

            // Physical connections run both ways.
            self.topo.add_edge(TopoEdge {
                src: probe.prev,
                src_port: probe.prev_port,
                dst: node_idx,
                dst_port: arrival_port,
                kind: probe.kind,
                weight: probe.kind.weight(),
            });
            self.topo.add_edge(TopoEdge {
                src: node_idx,
                src_port: arrival_port,
                dst: probe.prev,
                dst_port: probe.prev_port,
                kind: probe.kind,
                weight: probe.kind.weight(),
            });

            if !newly_added {
                continue;
            }
            tracing::debug!(%addr, ?node_type, "discovered node");

            match info.node_type {
                MgmtNodeType::Xbar => {
                    let ports = XbarInfo::from_bits(info.ext_info).num_ports;
                    for port in 0..u16::from(ports) {
                        if port == arrival_port {
                            continue;
                        }
                        let mut steps = probe.steps.clone();
                        steps.push(PathStep {
                            node: node_idx,
                            out_port: port,
                        });
                        frontier.push_back(Probe {
                            steps,
                            prev: node_idx,
                            prev_port: port,
                            kind: EdgeKind::OnChip,
                        });
                    }
                }
                MgmtNodeType::XportAdapter => {
                    let mut steps = probe.steps.clone();
                    steps.push(PathStep {
                        node: node_idx,
                        out_port: 0,
                    });
                    frontier.push_back(Probe {
                        steps,
                        prev: node_idx,
                        prev_port: 0,
                        kind: EdgeKind::OnChip,
                    });
                }
                MgmtNodeType::StreamEp => {
                    let caps = SepCaps::from_bits(info.ext_info);
                    self.seps.insert(
                        addr,
                        SepInfo {
                            addr,
                            has_ctrl: caps.has_ctrl,
                            has_data: caps.has_data,
                            num_input_ports: u16::from(caps.num_input_ports),
                            num_output_ports: u16::from(caps.num_output_ports),
                            reports_status: caps.reports_status,
                        },
                    );
                    self.sep_nodes.insert(addr, node_idx);
                }
            }
        }

        tracing::info!(
            endpoints = self.seps.len(),
            nodes = self.topo.num_nodes(),
            "topology discovery complete"
        );
        Ok(self.seps.len())
    }

    /// Assign an EPID to a discovered endpoint and reset it.
    pub fn initialize_endpoint(
        &mut self,
        xport: &mut ChdrCtrlXport,
        addr: SepAddr,
        epid: Epid,
    ) -> Result<()> {
        let steps = self.steps_to_sep(addr)?;
        let terminal = vec![
            MgmtOp::advertise(xport.epid()),
            MgmtOp::cfg_wr(REG_EPID_SELF, u32::from(epid)),
            MgmtOp::cfg_wr(REG_RESET_AND_FLUSH, RESET_CTRL | RESET_DATA),
            MgmtOp::return_to_src(),
        ];
        let hops = self.hops_for_path(&steps, terminal)?;
        self.transact(xport, hops)?;
        self.register_endpoint(addr, epid)
    }

    /// Record an externally initialized EPID binding.
    pub fn register_endpoint(&mut self, addr: SepAddr, epid: Epid) -> Result<()> {
        if !self.seps.contains_key(&addr) {
            return Err(RfnocError::Topology(format!(
                "cannot register EPID {epid}: no discovered endpoint at {addr}"
            )));
        }
        self.addr_epid.insert(addr, epid);
        self.epid_addr.insert(epid, addr);
        Ok(())
    }

    /// Program crossbar routes so packets for `dst_epid` flow from this
    /// portal's transport to the endpoint, and return traffic for the
    /// transport's EPID flows back.
    pub fn setup_local_route(&mut self, xport: &mut ChdrCtrlXport, dst_epid: Epid) -> Result<()> {
        let addr = self.endpoint_addr(dst_epid).ok_or_else(|| {
            RfnocError::Topology(format!("EPID {dst_epid} is not registered with this portal"))
        })?;
        let sep_node = *self
            .sep_nodes
            .get(&addr)
            .ok_or_else(|| RfnocError::Topology(format!("no topology node for {addr}")))?;
        let path = self
            .topo
            .shortest_path(self.host_node, sep_node)
            .ok_or_else(|| {
                RfnocError::Topology(format!("no route from the host to endpoint {addr}"))
            })?;

        let ret_epid = xport.epid();
        for step in &path[..path.len() - 1] {
            if self.topo.node(step.node).node_type != TopoNodeType::Xbar {
                continue;
            }
            // Forward direction: dst_epid out the port toward the SEP.
            self.program_route(xport, step.node, dst_epid, step.out_port)?;
            // Return direction: the transport's EPID back out the port
            // we arrived on.
            let upstream = self.upstream_port(step.node, &path)?;
            self.program_route(xport, step.node, ret_epid, upstream)?;
        }
        Ok(())
    }

    /// Can a stream between two remote endpoints be routed by this
    /// portal's view of the topology?
    pub fn can_remote_route(&self, dst_addr: SepAddr, src_addr: SepAddr) -> bool {
        let (Some(&src), Some(&dst)) = (self.sep_nodes.get(&src_addr), self.sep_nodes.get(&dst_addr))
        else {
            return false;
        };
        self.topo.shortest_path(src, dst).is_some()
    }

    /// Program routes for a device-to-device stream, in both directions.
    pub fn setup_remote_route(
        &mut self,
        xport: &mut ChdrCtrlXport,
        dst_epid: Epid,
        src_epid: Epid,
    ) -> Result<()> {
        let dst_addr = self.endpoint_addr(dst_epid).ok_or_else(|| {
            RfnocError::Topology(format!("destination EPID {dst_epid} is not registered"))
        })?;
        let src_addr = self
            .endpoint_addr(src_epid)
            .ok_or_else(|| RfnocError::Topology(format!("source EPID {src_epid} is not registered")))?;
        let src_node = self.sep_nodes[&src_addr];
        let dst_node = self.sep_nodes[&dst_addr];

        let forward = self.topo.shortest_path(src_node, dst_node).ok_or_else(|| {
            RfnocError::Topology(format!("no route between {src_addr} and {dst_addr}"))
        })?;
        self.program_path(xport, &forward, dst_epid)?;

        let back = self.topo.shortest_path(dst_node, src_node).ok_or_else(|| {
            RfnocError::Topology(format!("no return route between {dst_addr} and {src_addr}"))
        })?;
        self.program_path(xport, &back, src_epid)
    }

    fn program_path(
        &mut self,
        xport: &mut ChdrCtrlXport,
        path: &[PathStep],
        epid: Epid,
    ) -> Result<()> {
        for step in path {
            if self.topo.node(step.node).node_type == TopoNodeType::Xbar {
                self.program_route(xport, step.node, epid, step.out_port)?;
            }
        }
        Ok(())
    }

    /// Write one crossbar routing-table entry, unless the cache shows it
    /// is already programmed.
    fn program_route(
        &mut self,
        xport: &mut ChdrCtrlXport,
        xbar: NodeIndex,
        epid: Epid,
        out_port: u16,
    ) -> Result<()> {
        if self.routes.get(&(xbar, epid)) == Some(&out_port) {
            return Ok(());
        }
        let steps = self.steps_to_node(xbar)?;
        let terminal = vec![
            MgmtOp::advertise(xport.epid()),
            MgmtOp::cfg_wr(epid, u32::from(out_port)),
            MgmtOp::return_to_src(),
        ];
        let hops = self.hops_for_path(&steps, terminal)?;
        self.transact(xport, hops)?;
        self.routes.insert((xbar, epid), out_port);
        tracing::debug!(
            xbar = %self.topo.node(xbar).addr,
            epid,
            out_port,
            "crossbar route programmed"
        );
        Ok(())
    }

    /// Configure the remote endpoint to accept a host-to-device stream.
    pub fn config_local_tx_stream(
        &mut self,
        xport: &mut ChdrCtrlXport,
        dst_epid: Epid,
        reset: bool,
    ) -> Result<()> {
        let addr = self.endpoint_addr(dst_epid).ok_or_else(|| {
            RfnocError::Topology(format!("EPID {dst_epid} is not registered with this portal"))
        })?;
        let steps = self.steps_to_sep(addr)?;
        let mut terminal = vec![MgmtOp::advertise(xport.epid())];
        if reset {
            terminal.push(MgmtOp::cfg_wr(REG_RESET_AND_FLUSH, RESET_DATA));
        }
        terminal.push(MgmtOp::cfg_wr(REG_ISTRM_CTRL_STATUS, OSTRM_CMD_START));
        terminal.push(MgmtOp::return_to_src());
        let hops = self.hops_for_path(&steps, terminal)?;
        self.transact(xport, hops)?;
        Ok(())
    }

    /// Start configuring a device-to-host stream: write the requested
    /// flow-control report frequency and the stream destination (this
    /// transport's EPID), then start the endpoint's output stream. The
    /// endpoint follows up with a `STRC INIT` on the data path.
    pub fn config_local_rx_stream_start(
        &mut self,
        xport: &mut ChdrCtrlXport,
        src_epid: Epid,
        fc_freq: StreamBuffParams,
        reset: bool,
    ) -> Result<()> {
        let addr = self.endpoint_addr(src_epid).ok_or_else(|| {
            RfnocError::Topology(format!("EPID {src_epid} is not registered with this portal"))
        })?;
        let steps = self.steps_to_sep(addr)?;
        let mut terminal = vec![MgmtOp::advertise(xport.epid())];
        if reset {
            terminal.push(MgmtOp::cfg_wr(REG_RESET_AND_FLUSH, RESET_DATA));
        }
        terminal.push(MgmtOp::cfg_wr(REG_OSTRM_DST_EPID, u32::from(xport.epid())));
        terminal.push(MgmtOp::cfg_wr(
            REG_OSTRM_FC_FREQ_BYTES_LO,
            fc_freq.bytes as u32,
        ));
        terminal.push(MgmtOp::cfg_wr(
            REG_OSTRM_FC_FREQ_BYTES_HI,
            (fc_freq.bytes >> 32) as u32,
        ));
        terminal.push(MgmtOp::cfg_wr(REG_OSTRM_FC_FREQ_PKTS, fc_freq.packets));
        terminal.push(MgmtOp::cfg_wr(REG_OSTRM_CTRL_STATUS, OSTRM_CMD_START));
        terminal.push(MgmtOp::return_to_src());
        let hops = self.hops_for_path(&steps, terminal)?;
        self.transact(xport, hops)?;
        Ok(())
    }

    /// Poll the endpoint until its output stream reports configured.
    pub fn config_local_rx_stream_commit(
        &mut self,
        xport: &mut ChdrCtrlXport,
        src_epid: Epid,
        timeout: Duration,
    ) -> Result<()> {
        let addr = self.endpoint_addr(src_epid).ok_or_else(|| {
            RfnocError::Topology(format!("EPID {src_epid} is not registered with this portal"))
        })?;
        let steps = self.steps_to_sep(addr)?;
        let deadline = Timeout::Bounded(timeout).deadline();
        loop {
            let terminal = vec![
                MgmtOp::advertise(xport.epid()),
                MgmtOp::cfg_rd(REG_OSTRM_CTRL_STATUS),
                MgmtOp::return_to_src(),
            ];
            let hops = self.hops_for_path(&steps, terminal)?;
            let resp = self.transact(xport, hops)?;
            let status = find_cfg_rd_resp(&resp, REG_OSTRM_CTRL_STATUS).ok_or_else(|| {
                RfnocError::Protocol("stream status read returned no data".to_string())
            })?;
            if status & OSTRM_STATUS_CONFIGURED != 0 {
                return Ok(());
            }
            if wait_slice(deadline).is_none() {
                return Err(RfnocError::Timeout(format!(
                    "output stream on EPID {src_epid} never reported configured"
                )));
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Configure a device-to-device stream: routes in both directions,
    /// then the source endpoint's output stream registers.
    pub fn config_remote_stream(
        &mut self,
        xport: &mut ChdrCtrlXport,
        dst_epid: Epid,
        src_epid: Epid,
        fc_freq: StreamBuffParams,
        reset: bool,
        timeout: Duration,
    ) -> Result<()> {
        self.setup_remote_route(xport, dst_epid, src_epid)?;

        let src_addr = self
            .endpoint_addr(src_epid)
            .ok_or_else(|| RfnocError::Topology(format!("source EPID {src_epid} is not registered")))?;
        let steps = self.steps_to_sep(src_addr)?;
        let mut terminal = vec![MgmtOp::advertise(xport.epid())];
        if reset {
            terminal.push(MgmtOp::cfg_wr(REG_RESET_AND_FLUSH, RESET_DATA));
        }
        terminal.push(MgmtOp::cfg_wr(REG_OSTRM_DST_EPID, u32::from(dst_epid)));
        terminal.push(MgmtOp::cfg_wr(
            REG_OSTRM_FC_FREQ_BYTES_LO,
            fc_freq.bytes as u32,
        ));
        terminal.push(MgmtOp::cfg_wr(
            REG_OSTRM_FC_FREQ_BYTES_HI,
            (fc_freq.bytes >> 32) as u32,
        ));
        terminal.push(MgmtOp::cfg_wr(REG_OSTRM_FC_FREQ_PKTS, fc_freq.packets));
        terminal.push(MgmtOp::cfg_wr(REG_OSTRM_CTRL_STATUS, OSTRM_CMD_START));
        terminal.push(MgmtOp::return_to_src());
        let hops = self.hops_for_path(&steps, terminal)?;
        self.transact(xport, hops)?;

        self.config_local_rx_stream_commit(xport, src_epid, timeout)
    }

    // ---- internals -----------------------------------------------------

    /// Intermediate steps (device nodes before the target) on the path
    /// from the host to a SEP.
    fn steps_to_sep(&self, addr: SepAddr) -> Result<Vec<PathStep>> {
        let node = *self
            .sep_nodes
            .get(&addr)
            .ok_or_else(|| RfnocError::Topology(format!("no discovered endpoint at {addr}")))?;
        self.steps_to_node(node)
    }

    fn steps_to_node(&self, node: NodeIndex) -> Result<Vec<PathStep>> {
        let path = self
            .topo
            .shortest_path(self.host_node, node)
            .ok_or_else(|| RfnocError::Topology("no route in the topology graph".to_string()))?;
        // Drop the host (not a wire hop) and the target (gets the
        // terminal ops).
        Ok(path[1..path.len() - 1].to_vec())
    }

    /// The port of `xbar` that faces the host on `path`.
    fn upstream_port(&self, xbar: NodeIndex, path: &[PathStep]) -> Result<u16> {
        let pos = path
            .iter()
            .position(|s| s.node == xbar)
            .ok_or_else(|| RfnocError::Topology("crossbar not on path".to_string()))?;
        let prev = path[pos - 1];
        self.topo
            .edges_from(prev.node)
            .find(|e| e.dst == xbar && e.src_port == prev.out_port)
            .map(|e| e.dst_port)
            .ok_or_else(|| RfnocError::Topology("missing edge into crossbar".to_string()))
    }

    fn hops_for_path(&self, steps: &[PathStep], terminal_ops: Vec<MgmtOp>) -> Result<Vec<MgmtHop>> {
        let mut hops = Vec::with_capacity(steps.len() + 1);
        for step in steps {
            match self.topo.node(step.node).node_type {
                TopoNodeType::XportAdapter => hops.push(MgmtHop::new(vec![MgmtOp::nop()])),
                TopoNodeType::Xbar => {
                    hops.push(MgmtHop::new(vec![MgmtOp::sel_dest(step.out_port)]))
                }
                other => {
                    return Err(RfnocError::Topology(format!(
                        "route passes through a non-forwarding node ({other:?})"
                    )))
                }
            }
        }
        hops.push(MgmtHop::new(terminal_ops));
        Ok(hops)
    }

    /// One management exchange with retries; `Ok(None)` when nothing
    /// answered (used by discovery probes).
    fn try_transact(
        &self,
        xport: &mut ChdrCtrlXport,
        hops: Vec<MgmtHop>,
    ) -> Result<Option<MgmtPayload>> {
        let mut payload = MgmtPayload::new(xport.codec().width());
        payload.hops = hops;

        for attempt in 0..self.retries {
            xport.send_mgmt(&payload, Timeout::Bounded(self.response_timeout))?;
            match xport.recv_mgmt(Timeout::Bounded(self.response_timeout))? {
                Some(resp) => {
                    if resp.proto_ver != MGMT_PROTO_VER {
                        return Err(RfnocError::Protocol(format!(
                            "management protocol version mismatch: ours {MGMT_PROTO_VER:#06x}, theirs {:#06x}",
                            resp.proto_ver
                        )));
                    }
                    if resp.chdr_width != xport.codec().width() {
                        return Err(RfnocError::Protocol(format!(
                            "management CHDR width mismatch: ours {}, theirs {}",
                            xport.codec().width().bits(),
                            resp.chdr_width.bits()
                        )));
                    }
                    return Ok(Some(resp));
                }
                None => {
                    tracing::trace!(attempt, "management transaction unanswered");
                }
            }
        }
        Ok(None)
    }

    fn transact(&self, xport: &mut ChdrCtrlXport, hops: Vec<MgmtHop>) -> Result<MgmtPayload> {
        self.try_transact(xport, hops)?.ok_or_else(|| {
            RfnocError::Topology(format!(
                "management destination unreachable after {} retries",
                self.retries
            ))
        })
    }
}

fn find_info_resp(payload: &MgmtPayload) -> Option<NodeInfo> {
    payload
        .hops
        .iter()
        .flat_map(|h| h.ops.iter())
        .find(|op| op.op_code == MgmtOpCode::InfoResp)
        .and_then(|op| op.node_info().ok())
}

fn find_cfg_rd_resp(payload: &MgmtPayload, addr: u16) -> Option<u32> {
    payload
        .hops
        .iter()
        .flat_map(|h| h.ops.iter())
        .filter(|op| op.op_code == MgmtOpCode::CfgRdResp)
        .map(|op| op.cfg())
        .find(|(a, _)| *a == addr)
        .map(|(_, data)| data)
}
