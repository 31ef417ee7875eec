#![allow(dead_code)]

//! An in-process CHDR device for integration tests.
//!
//! The emulator owns one side of a loopback link pair and models a
//! small device: a transport adapter (optional), crossbars with
//! programmable routing tables, and stream endpoints with a management
//! register window, a control register file, and flow-controlled
//! ingress/egress streams. It speaks the same wire format as the
//! library, through the same codec.

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{unbounded, Receiver, Sender};

use rfnoc_link_lib::chdr::ctrl::{CtrlOpCode, CtrlPayload, CtrlStatus};
use rfnoc_link_lib::chdr::mgmt::{
    MgmtHop, MgmtOp, MgmtOpCode, MgmtPayload, MgmtNodeType, NodeInfo, SepCaps, XbarInfo,
};
use rfnoc_link_lib::chdr::stream::{StrcOp, StrcPayload, StrsPayload, StrsStatus};
use rfnoc_link_lib::chdr::{ChdrCodec, ChdrHeader, PacketType};
use rfnoc_link_lib::link::{LoopbackLink, RecvLink, SendLink, Timeout};
use rfnoc_link_lib::mgmt::{
    OSTRM_CMD_START, OSTRM_STATUS_CONFIGURED, REG_EPID_SELF, REG_ISTRM_CTRL_STATUS,
    REG_OSTRM_CTRL_STATUS, REG_OSTRM_DST_EPID, REG_OSTRM_FC_FREQ_BYTES_HI,
    REG_OSTRM_FC_FREQ_BYTES_LO, REG_OSTRM_FC_FREQ_PKTS, REG_RESET_AND_FLUSH,
};
use rfnoc_link_lib::stream::StreamBuffParams;
use rfnoc_link_lib::FrameBuff;

/// Host-side manager wired to an emulated device over a loopback pair.
pub fn setup(
    model: DeviceModel,
    cfg: rfnoc_link_lib::CoreConfig,
) -> (rfnoc_link_lib::LinkStreamManager, EmulatedDevice) {
    use rfnoc_link_lib::io_service::InlineIoService;
    use rfnoc_link_lib::{AdapterId, ChdrWidth, Endianness, EpidAllocator, LinkStreamManager};

    let codec = ChdrCodec::new(ChdrWidth::W64, Endianness::Big);
    let (host_link, dev_link) =
        LoopbackLink::pair(cfg.link.num_recv_frames, cfg.link.recv_frame_size);
    let device = EmulatedDevice::start(model, dev_link, codec);

    let host_link = Arc::new(host_link);
    let io = InlineIoService::new(
        Arc::clone(&host_link) as Arc<dyn RecvLink>,
        host_link as Arc<dyn SendLink>,
    );
    let epid_alloc = Arc::new(EpidAllocator::new());
    let mgr = LinkStreamManager::new(io, codec, epid_alloc, 1, AdapterId(0), cfg)
        .expect("link stream manager");
    (mgr, device)
}

/// Where a crossbar port leads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeRef {
    Adapter,
    Xbar(usize),
    Sep(usize),
}

#[derive(Clone, Debug)]
pub struct XbarModel {
    pub instance: u16,
    pub num_ports: u8,
    /// Port map; `None` ports have nothing behind them.
    pub connections: Vec<Option<NodeRef>>,
}

#[derive(Clone, Debug)]
pub struct SepModel {
    pub instance: u16,
    pub has_ctrl: bool,
    pub has_data: bool,
    pub ingress_capacity: StreamBuffParams,
}

#[derive(Clone, Debug)]
pub struct DeviceModel {
    pub device_id: u16,
    /// Whether a transport adapter fronts the device.
    pub with_adapter: bool,
    /// What the link (after the adapter, if any) connects to.
    pub entry: NodeRef,
    pub xbars: Vec<XbarModel>,
    pub seps: Vec<SepModel>,
}

impl DeviceModel {
    /// adapter -> 4-port crossbar (port 0 upstream, port 1 -> SEP).
    pub fn single_sep(ingress_capacity: StreamBuffParams) -> Self {
        DeviceModel {
            device_id: 2,
            with_adapter: true,
            entry: NodeRef::Xbar(0),
            xbars: vec![XbarModel {
                instance: 0,
                num_ports: 4,
                connections: vec![Some(NodeRef::Adapter), Some(NodeRef::Sep(0)), None, None],
            }],
            seps: vec![SepModel {
                instance: 0,
                has_ctrl: true,
                has_data: true,
                ingress_capacity,
            }],
        }
    }

    /// Two SEPs behind one crossbar, for device-to-device streams.
    pub fn dual_sep(ingress_capacity: StreamBuffParams) -> Self {
        DeviceModel {
            device_id: 2,
            with_adapter: true,
            entry: NodeRef::Xbar(0),
            xbars: vec![XbarModel {
                instance: 0,
                num_ports: 4,
                connections: vec![
                    Some(NodeRef::Adapter),
                    Some(NodeRef::Sep(0)),
                    Some(NodeRef::Sep(1)),
                    None,
                ],
            }],
            seps: vec![
                SepModel {
                    instance: 0,
                    has_ctrl: true,
                    has_data: true,
                    ingress_capacity,
                },
                SepModel {
                    instance: 1,
                    has_ctrl: true,
                    has_data: true,
                    ingress_capacity,
                },
            ],
        }
    }

    /// HOST - XBAR A (4 ports) - XBAR B (2 ports) - SEP, no adapter.
    pub fn two_xbar_chain() -> Self {
        DeviceModel {
            device_id: 2,
            with_adapter: false,
            entry: NodeRef::Xbar(0),
            xbars: vec![
                XbarModel {
                    instance: 0,
                    num_ports: 4,
                    connections: vec![None, Some(NodeRef::Xbar(1)), None, None],
                },
                XbarModel {
                    instance: 1,
                    num_ports: 2,
                    connections: vec![None, Some(NodeRef::Sep(0))],
                },
            ],
            seps: vec![SepModel {
                instance: 0,
                has_ctrl: true,
                has_data: true,
                ingress_capacity: StreamBuffParams {
                    bytes: 65536,
                    packets: 128,
                },
            }],
        }
    }
}

/// Commands a test can inject into the running device.
pub enum DeviceCmd {
    /// Emit one data packet from a SEP's output stream.
    SendData {
        sep: usize,
        payload: Vec<u8>,
        eob: bool,
        timestamp: Option<u64>,
    },
    /// Pretend a packet got lost: burn a sequence number.
    SkipSeq { sep: usize },
    /// Emit a synthetic OK status with explicit consumed counts.
    SendStrs {
        sep: usize,
        consumed: StreamBuffParams,
    },
    /// Gate the periodic ingress status reports (protocol replies such
    /// as INIT and RESYNC acks still go out).
    SuppressStrs { sep: usize, on: bool },
    /// Drop all control traffic (for timeout tests).
    MuteCtrl { on: bool },
    Stop,
}

/// Counters and tables a test can inspect.
#[derive(Default)]
pub struct EmuState {
    /// Routing table per crossbar: EPID -> output port.
    pub xbar_routes: Vec<std::collections::HashMap<u16, u16>>,
    /// Total CFG_WR hits on crossbar routing tables.
    pub route_writes: u32,
    /// SEQERR statuses received per SEP (for its output stream).
    pub seqerrs_received: Vec<u32>,
    /// RESYNC commands sent per SEP.
    pub resyncs_sent: Vec<u32>,
    /// Periodic OK reports received for output streams, post-setup.
    pub ostrm_reports: Vec<u32>,
    /// Ingress bytes/packets consumed per SEP.
    pub istrm_consumed: Vec<(u64, u64)>,
    /// EPIDs currently assigned per SEP.
    pub sep_epids: Vec<u16>,
}

struct SepState {
    epid: u16,
    mgmt_regs: std::collections::HashMap<u16, u32>,
    ctrl_regs: std::collections::HashMap<u32, u32>,
    // Ingress (toward this SEP).
    istrm_peer: u16,
    istrm_fc_freq: StreamBuffParams,
    istrm_consumed: (u64, u64),
    istrm_since_report: (u64, u64),
    istrm_expected_seq: Option<u16>,
    suppress_strs: bool,
    // Egress (from this SEP).
    ostrm_configured: bool,
    ostrm_seq: u16,
    ostrm_sent: (u64, u64),
    ostrm_peer_capacity: StreamBuffParams,
}

impl SepState {
    fn new() -> Self {
        SepState {
            epid: 0,
            mgmt_regs: Default::default(),
            ctrl_regs: Default::default(),
            istrm_peer: 0,
            istrm_fc_freq: StreamBuffParams::default(),
            istrm_consumed: (0, 0),
            istrm_since_report: (0, 0),
            istrm_expected_seq: None,
            suppress_strs: false,
            ostrm_configured: false,
            ostrm_seq: 0,
            ostrm_sent: (0, 0),
            ostrm_peer_capacity: StreamBuffParams::default(),
        }
    }
}

pub struct EmulatedDevice {
    pub cmd: Sender<DeviceCmd>,
    pub state: Arc<Mutex<EmuState>>,
    handle: Option<JoinHandle<()>>,
}

impl EmulatedDevice {
    pub fn start(model: DeviceModel, link: LoopbackLink, codec: ChdrCodec) -> Self {
        let (cmd_tx, cmd_rx) = unbounded();
        let state = Arc::new(Mutex::new(EmuState {
            xbar_routes: vec![Default::default(); model.xbars.len()],
            seqerrs_received: vec![0; model.seps.len()],
            resyncs_sent: vec![0; model.seps.len()],
            ostrm_reports: vec![0; model.seps.len()],
            istrm_consumed: vec![(0, 0); model.seps.len()],
            sep_epids: vec![0; model.seps.len()],
            ..Default::default()
        }));
        let thread_state = Arc::clone(&state);
        let handle = std::thread::Builder::new()
            .name("chdr-device-emu".to_string())
            .spawn(move || {
                Emu {
                    model,
                    codec,
                    link,
                    seps: Vec::new(),
                    mute_ctrl: false,
                    shared: thread_state,
                    cmd_rx,
                }
                .run();
            })
            .expect("spawn emulator");
        EmulatedDevice {
            cmd: cmd_tx,
            state,
            handle: Some(handle),
        }
    }

    /// Block until `check` passes on the inspection state.
    pub fn wait_until<F: Fn(&EmuState) -> bool>(&self, check: F, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if check(&self.state.lock().expect("emu state")) {
                return true;
            }
            if std::time::Instant::now() > deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

impl Drop for EmulatedDevice {
    fn drop(&mut self) {
        let _ = self.cmd.send(DeviceCmd::Stop);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

struct Emu {
    model: DeviceModel,
    codec: ChdrCodec,
    link: LoopbackLink,
    seps: Vec<SepState>,
    mute_ctrl: bool,
    shared: Arc<Mutex<EmuState>>,
    cmd_rx: Receiver<DeviceCmd>,
}

impl Emu {
    fn run(mut self) {
        self.seps = self.model.seps.iter().map(|_| SepState::new()).collect();
        loop {
            match self.cmd_rx.try_recv() {
                Ok(DeviceCmd::Stop) => return,
                Ok(cmd) => self.handle_cmd(cmd),
                Err(_) => {}
            }
            let Some(buff) = self
                .link
                .get_recv_buff(Timeout::Bounded(Duration::from_millis(2)))
            else {
                continue;
            };
            self.dispatch(&buff);
            self.link.release_recv_buff(buff);
        }
    }

    fn handle_cmd(&mut self, cmd: DeviceCmd) {
        match cmd {
            DeviceCmd::SendData {
                sep,
                payload,
                eob,
                timestamp,
            } => self.send_data(sep, &payload, eob, timestamp),
            DeviceCmd::SkipSeq { sep } => {
                self.seps[sep].ostrm_seq = self.seps[sep].ostrm_seq.wrapping_add(1);
                self.seps[sep].ostrm_sent.1 += 1;
            }
            DeviceCmd::SendStrs { sep, consumed } => {
                let peer = self.seps[sep].istrm_peer;
                let capacity = self.model.seps[sep].ingress_capacity;
                self.send_strs(sep, peer, StrsStatus::Okay, 0, consumed, capacity);
            }
            DeviceCmd::SuppressStrs { sep, on } => self.seps[sep].suppress_strs = on,
            DeviceCmd::MuteCtrl { on } => self.mute_ctrl = on,
            DeviceCmd::Stop => unreachable!("handled by the loop"),
        }
    }

    fn dispatch(&mut self, buff: &FrameBuff) {
        let frame = buff.data();
        let parsed = match self.codec.parse(frame) {
            Ok(p) => p,
            Err(e) => {
                eprintln!("emulator: malformed frame: {e}");
                return;
            }
        };
        let payload = &frame[parsed.payload.clone()];
        match parsed.header.pkt_type {
            PacketType::Management => self.handle_mgmt(payload),
            PacketType::Ctrl => self.handle_ctrl(parsed.header, payload),
            PacketType::StreamCmd => self.handle_strc(parsed.header, payload),
            PacketType::StreamStatus => self.handle_strs(parsed.header, payload),
            PacketType::DataNoTs | PacketType::DataWithTs => self.handle_data(parsed.header),
        }
    }

    // ---- management ----------------------------------------------------

    fn handle_mgmt(&mut self, payload: &[u8]) {
        let txn = match MgmtPayload::deserialize(payload, self.codec.endianness()) {
            Ok(t) => t,
            Err(e) => {
                eprintln!("emulator: bad management payload: {e}");
                return;
            }
        };

        let mut current = if self.model.with_adapter {
            NodeRef::Adapter
        } else {
            self.model.entry
        };
        let mut arrival_port: u16 = 0;
        let mut return_epid: u16 = 0;
        let mut resp_ops: Vec<MgmtOp> = Vec::new();

        for hop in &txn.hops {
            let mut selected: Option<u16> = None;
            for op in &hop.ops {
                match op.op_code {
                    MgmtOpCode::Nop => {}
                    MgmtOpCode::Advertise => return_epid = op.advertised_epid(),
                    MgmtOpCode::SelDest => selected = Some(op.dest_port()),
                    MgmtOpCode::InfoReq => {
                        resp_ops.push(MgmtOp::info_resp(&self.node_info(current, arrival_port)))
                    }
                    MgmtOpCode::CfgWrReq => {
                        let (addr, data) = op.cfg();
                        self.cfg_write(current, addr, data);
                    }
                    MgmtOpCode::CfgRdReq => {
                        let (addr, _) = op.cfg();
                        let data = self.cfg_read(current, addr);
                        resp_ops.push(MgmtOp::cfg_rd_resp(addr, data));
                    }
                    MgmtOpCode::Return => {
                        if resp_ops.is_empty() {
                            resp_ops.push(MgmtOp::nop());
                        }
                        let mut resp = MgmtPayload::new(self.codec.width());
                        resp.add_hop(MgmtHop::new(std::mem::take(&mut resp_ops)));
                        self.send_mgmt(return_epid, &resp);
                        return;
                    }
                    MgmtOpCode::InfoResp | MgmtOpCode::CfgRdResp => {}
                }
            }

            // Hop consumed; forward to the next node.
            let next = match current {
                NodeRef::Adapter => Some(self.model.entry),
                NodeRef::Xbar(x) => {
                    let Some(port) = selected else {
                        eprintln!("emulator: crossbar hop without SEL_DEST; dropping");
                        return;
                    };
                    match self.model.xbars[x].connections.get(usize::from(port)) {
                        Some(Some(n)) => Some(*n),
                        _ => None, // nothing behind this port
                    }
                }
                NodeRef::Sep(_) => None,
            };
            let Some(next) = next else { return };
            arrival_port = self.arrival_port_of(next, current);
            current = next;
        }
    }

    fn node_info(&self, node: NodeRef, arrival_port: u16) -> NodeInfo {
        match node {
            NodeRef::Adapter => NodeInfo {
                device_id: self.model.device_id,
                node_type: MgmtNodeType::XportAdapter,
                node_inst: 0,
                ext_info: 0,
            },
            NodeRef::Xbar(x) => NodeInfo {
                device_id: self.model.device_id,
                node_type: MgmtNodeType::Xbar,
                node_inst: self.model.xbars[x].instance,
                ext_info: XbarInfo {
                    num_ports: self.model.xbars[x].num_ports,
                    arrival_port: arrival_port as u8,
                }
                .to_bits(),
            },
            NodeRef::Sep(s) => NodeInfo {
                device_id: self.model.device_id,
                node_type: MgmtNodeType::StreamEp,
                node_inst: self.model.seps[s].instance,
                ext_info: SepCaps {
                    has_ctrl: self.model.seps[s].has_ctrl,
                    has_data: self.model.seps[s].has_data,
                    num_input_ports: 1,
                    num_output_ports: 1,
                    reports_status: true,
                }
                .to_bits(),
            },
        }
    }

    /// The port of `node` that connects back toward `from`.
    fn arrival_port_of(&self, node: NodeRef, from: NodeRef) -> u16 {
        if let NodeRef::Xbar(x) = node {
            for (port, conn) in self.model.xbars[x].connections.iter().enumerate() {
                if *conn == Some(from) {
                    return port as u16;
                }
            }
        }
        0
    }

    fn cfg_write(&mut self, node: NodeRef, addr: u16, data: u32) {
        match node {
            NodeRef::Xbar(x) => {
                let mut shared = self.shared.lock().expect("emu state");
                shared.xbar_routes[x].insert(addr, data as u16);
                shared.route_writes += 1;
            }
            NodeRef::Sep(s) => self.sep_reg_write(s, addr, data),
            NodeRef::Adapter => {}
        }
    }

    fn cfg_read(&self, node: NodeRef, addr: u16) -> u32 {
        match node {
            NodeRef::Xbar(x) => {
                let shared = self.shared.lock().expect("emu state");
                u32::from(*shared.xbar_routes[x].get(&addr).unwrap_or(&0))
            }
            NodeRef::Sep(s) => match addr {
                REG_EPID_SELF => u32::from(self.seps[s].epid),
                REG_OSTRM_CTRL_STATUS => {
                    if self.seps[s].ostrm_configured {
                        OSTRM_STATUS_CONFIGURED
                    } else {
                        0
                    }
                }
                other => *self.seps[s].mgmt_regs.get(&other).unwrap_or(&0),
            },
            NodeRef::Adapter => 0,
        }
    }

    fn sep_reg_write(&mut self, s: usize, addr: u16, data: u32) {
        match addr {
            REG_EPID_SELF => {
                self.seps[s].epid = data as u16;
                self.shared.lock().expect("emu state").sep_epids[s] = data as u16;
            }
            REG_RESET_AND_FLUSH => {
                let sep = &mut self.seps[s];
                sep.istrm_consumed = (0, 0);
                sep.istrm_since_report = (0, 0);
                sep.istrm_expected_seq = None;
                sep.ostrm_seq = 0;
                sep.ostrm_sent = (0, 0);
                sep.ostrm_configured = false;
            }
            REG_OSTRM_CTRL_STATUS => {
                self.seps[s].mgmt_regs.insert(addr, data);
                if data & OSTRM_CMD_START != 0 {
                    self.start_output_stream(s);
                }
            }
            REG_ISTRM_CTRL_STATUS => {
                self.seps[s].mgmt_regs.insert(addr, data);
            }
            other => {
                self.seps[s].mgmt_regs.insert(other, data);
            }
        }
    }

    /// Output stream start: emit `STRC INIT` carrying the granted
    /// report frequency toward the configured destination. If the
    /// destination is another SEP on this device, the handshake
    /// completes internally.
    fn start_output_stream(&mut self, s: usize) {
        let dst_epid = *self.seps[s]
            .mgmt_regs
            .get(&REG_OSTRM_DST_EPID)
            .unwrap_or(&0) as u16;
        let lo = *self.seps[s]
            .mgmt_regs
            .get(&REG_OSTRM_FC_FREQ_BYTES_LO)
            .unwrap_or(&0);
        let hi = *self.seps[s]
            .mgmt_regs
            .get(&REG_OSTRM_FC_FREQ_BYTES_HI)
            .unwrap_or(&0);
        let pkts = *self.seps[s]
            .mgmt_regs
            .get(&REG_OSTRM_FC_FREQ_PKTS)
            .unwrap_or(&0);
        let freq = StreamBuffParams {
            bytes: u64::from(lo) | (u64::from(hi) << 32),
            packets: pkts,
        };

        if let Some(dst) = self.sep_by_epid(dst_epid) {
            // Internal destination: run the INIT handshake in place.
            let capacity = self.model.seps[dst].ingress_capacity;
            let src_epid = self.seps[s].epid;
            let dst_freq = if freq.bytes == 0 && freq.packets == 0 {
                // Endpoints negotiate their own pacing.
                StreamBuffParams {
                    bytes: capacity.bytes / 8,
                    packets: capacity.packets / 8,
                }
            } else {
                freq
            };
            self.seps[dst].istrm_peer = src_epid;
            self.seps[dst].istrm_fc_freq = dst_freq;
            self.seps[s].ostrm_peer_capacity = capacity;
            self.seps[s].ostrm_configured = true;
            return;
        }

        let mut strc = StrcPayload::new(self.seps[s].epid, StrcOp::Init);
        strc.num_bytes = freq.bytes;
        strc.num_pkts = u64::from(freq.packets);
        self.send_strc(dst_epid, &strc, s);
    }

    // ---- control -------------------------------------------------------

    fn handle_ctrl(&mut self, hdr: ChdrHeader, payload: &[u8]) {
        if self.mute_ctrl {
            return;
        }
        let req = match CtrlPayload::deserialize(payload, self.codec.endianness()) {
            Ok(p) => p,
            Err(e) => {
                eprintln!("emulator: bad control payload: {e}");
                return;
            }
        };
        let Some(s) = self.sep_by_epid(hdr.dst_epid) else {
            eprintln!("emulator: control packet for unknown EPID {}", hdr.dst_epid);
            return;
        };

        let ack = match req.op_code {
            CtrlOpCode::Sleep => req.to_ack(CtrlStatus::Okay, req.data.clone()),
            CtrlOpCode::Write => {
                for (i, word) in req.data.iter().enumerate() {
                    self.seps[s]
                        .ctrl_regs
                        .insert(req.address + (i as u32) * 4, *word);
                }
                req.to_ack(CtrlStatus::Okay, req.data.clone())
            }
            CtrlOpCode::Read => {
                let data: Vec<u32> = (0..req.data.len())
                    .map(|i| {
                        *self.seps[s]
                            .ctrl_regs
                            .get(&(req.address + (i as u32) * 4))
                            .unwrap_or(&0)
                    })
                    .collect();
                req.to_ack(CtrlStatus::Okay, data)
            }
            CtrlOpCode::ReadWrite => {
                let old = *self.seps[s].ctrl_regs.get(&req.address).unwrap_or(&0);
                match req.data.as_slice() {
                    [data, mask, ..] => {
                        let merged = (old & !mask) | (data & mask);
                        self.seps[s].ctrl_regs.insert(req.address, merged);
                        req.to_ack(CtrlStatus::Okay, vec![old])
                    }
                    _ => req.to_ack(CtrlStatus::CmdError, vec![]),
                }
            }
        };
        self.send_ctrl(req.src_epid, &ack);
    }

    // ---- streaming -----------------------------------------------------

    fn handle_strc(&mut self, hdr: ChdrHeader, payload: &[u8]) {
        let strc = match StrcPayload::deserialize(payload, self.codec.endianness()) {
            Ok(p) => p,
            Err(e) => {
                eprintln!("emulator: bad stream command: {e}");
                return;
            }
        };
        let Some(s) = self.sep_by_epid(hdr.dst_epid) else {
            return;
        };
        let capacity = self.model.seps[s].ingress_capacity;

        match strc.op {
            StrcOp::Init => {
                self.seps[s].istrm_peer = strc.src_epid;
                self.seps[s].istrm_fc_freq = StreamBuffParams {
                    bytes: strc.num_bytes,
                    packets: strc.num_pkts as u32,
                };
                let consumed = self.seps[s].istrm_consumed;
                self.send_strs(
                    s,
                    strc.src_epid,
                    StrsStatus::Okay,
                    0,
                    StreamBuffParams {
                        bytes: consumed.0,
                        packets: consumed.1 as u32,
                    },
                    capacity,
                );
            }
            StrcOp::Resync => {
                self.seps[s].istrm_consumed = (strc.num_bytes, strc.num_pkts);
                self.seps[s].istrm_expected_seq = None;
                let peer = self.seps[s].istrm_peer;
                self.send_strs(
                    s,
                    peer,
                    StrsStatus::Okay,
                    0,
                    StreamBuffParams {
                        bytes: strc.num_bytes,
                        packets: strc.num_pkts as u32,
                    },
                    capacity,
                );
            }
            StrcOp::Ping => {
                let peer = self.seps[s].istrm_peer;
                let consumed = self.seps[s].istrm_consumed;
                self.send_strs(
                    s,
                    peer,
                    StrsStatus::Okay,
                    0,
                    StreamBuffParams {
                        bytes: consumed.0,
                        packets: consumed.1 as u32,
                    },
                    capacity,
                );
            }
            StrcOp::FcAck => {}
        }
    }

    fn handle_strs(&mut self, hdr: ChdrHeader, payload: &[u8]) {
        let strs = match StrsPayload::deserialize(payload, self.codec.endianness()) {
            Ok(p) => p,
            Err(e) => {
                eprintln!("emulator: bad stream status: {e}");
                return;
            }
        };
        let Some(s) = self.sep_by_epid(hdr.dst_epid) else {
            return;
        };

        match strs.status {
            StrsStatus::Okay => {
                if !self.seps[s].ostrm_configured {
                    // The capacity advertisement completing RX setup.
                    self.seps[s].ostrm_peer_capacity = StreamBuffParams {
                        bytes: strs.capacity_bytes,
                        packets: strs.capacity_pkts,
                    };
                    self.seps[s].ostrm_configured = true;
                } else {
                    self.shared.lock().expect("emu state").ostrm_reports[s] += 1;
                }
            }
            StrsStatus::SeqError => {
                self.shared.lock().expect("emu state").seqerrs_received[s] += 1;
                // Resynchronize the receiver to our sent counters.
                let mut strc = StrcPayload::new(self.seps[s].epid, StrcOp::Resync);
                strc.num_bytes = self.seps[s].ostrm_sent.0;
                strc.num_pkts = self.seps[s].ostrm_sent.1;
                let dst = strs.src_epid;
                self.send_strc(dst, &strc, s);
                self.shared.lock().expect("emu state").resyncs_sent[s] += 1;
            }
            other => {
                eprintln!("emulator: unhandled stream status {other:?}");
            }
        }
    }

    fn handle_data(&mut self, hdr: ChdrHeader) {
        let Some(s) = self.sep_by_epid(hdr.dst_epid) else {
            return;
        };
        let wire_bytes = u64::from(hdr.length);

        // Sequence tracking with single-report-per-gap semantics.
        let expected = self.seps[s].istrm_expected_seq;
        self.seps[s].istrm_expected_seq = Some(hdr.seq_num.wrapping_add(1));
        if let Some(expected) = expected {
            if expected != hdr.seq_num {
                let peer = self.seps[s].istrm_peer;
                let info = (u64::from(expected) << 16) | u64::from(hdr.seq_num);
                let consumed = self.seps[s].istrm_consumed;
                let capacity = self.model.seps[s].ingress_capacity;
                self.send_strs(
                    s,
                    peer,
                    StrsStatus::SeqError,
                    info,
                    StreamBuffParams {
                        bytes: consumed.0,
                        packets: consumed.1 as u32,
                    },
                    capacity,
                );
            }
        }

        let sep = &mut self.seps[s];
        sep.istrm_consumed.0 += wire_bytes;
        sep.istrm_consumed.1 += 1;
        sep.istrm_since_report.0 += wire_bytes;
        sep.istrm_since_report.1 += 1;
        self.shared.lock().expect("emu state").istrm_consumed[s] = sep.istrm_consumed;

        let freq = sep.istrm_fc_freq;
        let due = (freq.bytes > 0 && sep.istrm_since_report.0 >= freq.bytes)
            || (freq.packets > 0 && sep.istrm_since_report.1 >= u64::from(freq.packets));
        if due && !sep.suppress_strs {
            sep.istrm_since_report = (0, 0);
            let peer = sep.istrm_peer;
            let consumed = sep.istrm_consumed;
            let capacity = self.model.seps[s].ingress_capacity;
            self.send_strs(
                s,
                peer,
                StrsStatus::Okay,
                0,
                StreamBuffParams {
                    bytes: consumed.0,
                    packets: consumed.1 as u32,
                },
                capacity,
            );
        }
    }

    fn send_data(&mut self, s: usize, payload: &[u8], eob: bool, timestamp: Option<u64>) {
        let dst_epid = *self.seps[s]
            .mgmt_regs
            .get(&REG_OSTRM_DST_EPID)
            .unwrap_or(&0) as u16;
        let seq = self.seps[s].ostrm_seq;
        self.seps[s].ostrm_seq = seq.wrapping_add(1);

        let Some(mut buff) = self.link.get_send_buff(Timeout::Bounded(Duration::from_secs(1)))
        else {
            eprintln!("emulator: no send frame for data");
            return;
        };
        let pkt_type = if timestamp.is_some() {
            PacketType::DataWithTs
        } else {
            PacketType::DataNoTs
        };
        let offset = self.codec.payload_offset(pkt_type, 0);
        buff.data_mut()[offset..offset + payload.len()].copy_from_slice(payload);
        let mut hdr = ChdrHeader::new(pkt_type);
        hdr.dst_epid = dst_epid;
        hdr.seq_num = seq;
        hdr.eob = eob;
        let total = self
            .codec
            .finish_data(buff.data_mut(), &mut hdr, payload.len(), timestamp)
            .expect("emulator data packet");
        buff.set_packet_size(total);

        self.seps[s].ostrm_sent.0 += total as u64;
        self.seps[s].ostrm_sent.1 += 1;
        if let Err(e) = self.link.release_send_buff(buff) {
            eprintln!("emulator: data send failed: {e}");
        }
    }

    // ---- wire helpers --------------------------------------------------

    fn sep_by_epid(&self, epid: u16) -> Option<usize> {
        if epid == 0 {
            return None;
        }
        self.seps.iter().position(|s| s.epid == epid)
    }

    fn send_mgmt(&self, dst_epid: u16, payload: &MgmtPayload) {
        self.send_packet(PacketType::Management, dst_epid, 0, |codec, out| {
            payload.serialize(out, codec.endianness())
        });
    }

    fn send_ctrl(&self, dst_epid: u16, payload: &CtrlPayload) {
        self.send_packet(PacketType::Ctrl, dst_epid, 0, |codec, out| {
            payload.serialize(out, codec.endianness())
        });
    }

    fn send_strc(&mut self, dst_epid: u16, strc: &StrcPayload, _src_sep: usize) {
        // An internal destination short-circuits the wire.
        if let Some(dst) = self.sep_by_epid(dst_epid) {
            let hdr = {
                let mut h = ChdrHeader::new(PacketType::StreamCmd);
                h.dst_epid = dst_epid;
                h
            };
            let mut out = [0u8; 16];
            strc.serialize(&mut out, self.codec.endianness())
                .expect("strc serialize");
            let _ = dst;
            self.handle_strc(hdr, &out);
            return;
        }
        self.send_packet(PacketType::StreamCmd, dst_epid, 0, |codec, out| {
            strc.serialize(out, codec.endianness())
        });
    }

    fn send_strs(
        &self,
        sep: usize,
        dst_epid: u16,
        status: StrsStatus,
        status_info: u64,
        consumed: StreamBuffParams,
        capacity: StreamBuffParams,
    ) {
        let strs = StrsPayload {
            src_epid: self.seps[sep].epid,
            status,
            status_info,
            buff_info: 0,
            xfer_count_pkts: u64::from(consumed.packets),
            xfer_count_bytes: consumed.bytes,
            capacity_pkts: capacity.packets,
            capacity_bytes: capacity.bytes,
        };
        self.send_packet(PacketType::StreamStatus, dst_epid, 0, |codec, out| {
            strs.serialize(out, codec.endianness())
        });
    }

    fn send_packet<F>(&self, pkt_type: PacketType, dst_epid: u16, seq: u16, write: F)
    where
        F: FnOnce(&ChdrCodec, &mut [u8]) -> rfnoc_link_lib::Result<usize>,
    {
        let Some(mut buff) = self.link.get_send_buff(Timeout::Bounded(Duration::from_secs(1)))
        else {
            eprintln!("emulator: no send frame for {pkt_type:?}");
            return;
        };
        let offset = self.codec.payload_offset(pkt_type, 0);
        let pyld_len = {
            let region = &mut buff.data_mut()[offset..];
            match write(&self.codec, region) {
                Ok(n) => n,
                Err(e) => {
                    eprintln!("emulator: payload serialize failed: {e}");
                    return;
                }
            }
        };
        let total = self
            .codec
            .finish_packet(buff.data_mut(), pkt_type, dst_epid, seq, pyld_len)
            .expect("emulator packet");
        buff.set_packet_size(total);
        if let Err(e) = self.link.release_send_buff(buff) {
            eprintln!("emulator: send failed: {e}");
        }
    }
}
