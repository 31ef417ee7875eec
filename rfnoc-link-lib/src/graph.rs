//! The link stream manager: composition root for one logical link.
//!
//! Owns the I/O service for a link pair, a management portal, and the
//! per-link view of the EPID space. All data endpoints, control
//! endpoints, and streams reachable over this link are created here.

use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;

use crate::chdr::stream::{StrcOp, StrcPayload, StrsPayload, StrsStatus};
use crate::chdr::{ChdrCodec, PacketType};
use crate::config::CoreConfig;
use crate::ctrl::{ChdrCtrlXport, CtrlEndpoint};
use crate::error::{Result, RfnocError};
use crate::io_service::{IoService, RecvClientParams, RecvIoIf, SendClientParams, SendIoIf};
use crate::link::{AdapterId, Timeout};
use crate::mgmt::{Epid, EpidAllocator, MgmtPortal, SepAddr, SepInfo};
use crate::stream::{ChdrRxStream, ChdrTxStream, StreamBuffParams};

/// Manages all endpoints and streams accessible via one logical link
/// between the host and a device.
///
/// Each host-side transport adapter gets its own instance (and its own
/// host device ID); the EPID allocator is shared across the session.
pub struct LinkStreamManager {
    codec: ChdrCodec,
    io: Arc<dyn IoService>,
    epid_alloc: Arc<EpidAllocator>,
    portal: MgmtPortal,
    ctrl_xport: ChdrCtrlXport,
    host_device_id: u16,
    adapter_id: AdapterId,
    cfg: CoreConfig,
    next_host_inst: u16,
    connections: AHashMap<SepAddr, (Epid, Epid)>,
}

impl LinkStreamManager {
    /// Stand up the manager and run topology discovery.
    pub fn new(
        io: Arc<dyn IoService>,
        codec: ChdrCodec,
        epid_alloc: Arc<EpidAllocator>,
        host_device_id: u16,
        adapter_id: AdapterId,
        cfg: CoreConfig,
    ) -> Result<Self> {
        let my_addr = SepAddr {
            device_id: host_device_id,
            instance: 0,
        };
        let my_epid = epid_alloc.allocate(my_addr)?;
        let mut ctrl_xport = ChdrCtrlXport::new(
            io.as_ref(),
            codec,
            my_epid,
            cfg.link.num_send_frames,
            cfg.link.num_recv_frames,
        )?;
        let mut portal = MgmtPortal::new(
            my_addr,
            my_epid,
            Duration::from_millis(cfg.ctrl.timeout_ms),
        );
        let found = portal.discover(&mut ctrl_xport)?;
        tracing::info!(
            endpoints = found,
            adapter = ?adapter_id,
            "link stream manager up"
        );

        Ok(LinkStreamManager {
            codec,
            io,
            epid_alloc,
            portal,
            ctrl_xport,
            host_device_id,
            adapter_id,
            cfg,
            next_host_inst: 0,
            connections: AHashMap::new(),
        })
    }

    pub fn adapter_id(&self) -> AdapterId {
        self.adapter_id
    }

    pub fn host_device_id(&self) -> u16 {
        self.host_device_id
    }

    pub fn my_epid(&self) -> Epid {
        self.portal.my_epid()
    }

    pub fn portal(&self) -> &MgmtPortal {
        &self.portal
    }

    /// All stream endpoints reachable over this link.
    pub fn reachable_endpoints(&self) -> Vec<SepInfo> {
        self.portal.reachable_endpoints().copied().collect()
    }

    /// Connect the host to a device endpoint: assign it an EPID and
    /// program routes in both directions. Cached; reconnecting returns
    /// the established pair.
    pub fn connect_host_to_device(&mut self, dst_addr: SepAddr) -> Result<(Epid, Epid)> {
        if let Some(&pair) = self.connections.get(&dst_addr) {
            return Ok(pair);
        }
        let remote = self.ensure_remote_epid(dst_addr)?;
        self.portal.setup_local_route(&mut self.ctrl_xport, remote)?;
        let pair = (self.portal.my_epid(), remote);
        self.connections.insert(dst_addr, pair);
        Ok(pair)
    }

    /// Can this manager route a stream between two remote endpoints?
    pub fn can_connect_device_to_device(&self, dst_addr: SepAddr, src_addr: SepAddr) -> bool {
        self.portal.can_remote_route(dst_addr, src_addr)
    }

    /// Connect two remote endpoints to each other. Returns
    /// `(source, destination)` EPIDs.
    pub fn connect_device_to_device(
        &mut self,
        dst_addr: SepAddr,
        src_addr: SepAddr,
    ) -> Result<(Epid, Epid)> {
        if !self.can_connect_device_to_device(dst_addr, src_addr) {
            return Err(RfnocError::Topology(format!(
                "no route between {src_addr} and {dst_addr} via this link"
            )));
        }
        let src_epid = self.ensure_remote_epid(src_addr)?;
        let dst_epid = self.ensure_remote_epid(dst_addr)?;
        self.portal
            .setup_remote_route(&mut self.ctrl_xport, dst_epid, src_epid)?;
        Ok((src_epid, dst_epid))
    }

    /// A register-access endpoint for a connected device endpoint.
    ///
    /// Each control endpoint runs on its own host EPID so its responses
    /// demultiplex cleanly from every other client of the link.
    pub fn create_ctrl_endpoint(&mut self, dst_epid: Epid, dst_port: u16) -> Result<CtrlEndpoint> {
        if !self.portal.is_endpoint_registered(dst_epid) {
            return Err(RfnocError::Topology(format!(
                "EPID {dst_epid} is not registered with this link"
            )));
        }
        let local = self.alloc_host_epid()?;
        let mut xport = ChdrCtrlXport::new(
            self.io.as_ref(),
            self.codec,
            local,
            self.cfg.link.num_send_frames,
            self.cfg.link.num_recv_frames,
        )?;
        self.portal.setup_local_route(&mut xport, dst_epid)?;
        Ok(CtrlEndpoint::new(xport, dst_epid, dst_port, &self.cfg.ctrl))
    }

    /// Create a host-to-device data stream. Runs the two-step
    /// flow-control INIT handshake and returns the ready transport.
    pub fn create_host_to_device_data_stream(&mut self, dst_addr: SepAddr) -> Result<ChdrTxStream> {
        let remote = self.ensure_remote_epid(dst_addr)?;
        let local = self.alloc_host_epid()?;
        let setup_timeout = Timeout::Bounded(Duration::from_millis(self.cfg.stream.setup_timeout_ms));

        // Management side: routes for this stream's EPID, then the
        // remote ingress stream setup.
        let mut mgmt_xport = ChdrCtrlXport::new(self.io.as_ref(), self.codec, local, 1, 1)?;
        self.portal.setup_local_route(&mut mgmt_xport, remote)?;
        self.portal
            .config_local_tx_stream(&mut mgmt_xport, remote, true)?;
        drop(mgmt_xport);

        // Data side: a send client for the stream and a receive client
        // for its status reports.
        let mut send_io = self.io.make_send_client(SendClientParams {
            num_send_frames: self.cfg.link.num_send_frames,
        })?;
        let codec = self.codec;
        let mut strs_rx = self.io.make_recv_client(RecvClientParams {
            num_recv_frames: 2,
            filter: Box::new(move |frame: &[u8]| {
                codec
                    .read_header(frame)
                    .map(|h| h.pkt_type == PacketType::StreamStatus && h.dst_epid == local)
                    .unwrap_or(false)
            }),
        })?;

        // First INIT discovers the destination's buffer capacity.
        let mut seq = 0u16;
        send_strc(
            &self.codec,
            send_io.as_mut(),
            local,
            remote,
            StrcOp::Init,
            StreamBuffParams::default(),
            &mut seq,
        )?;
        let strs = recv_strs(&self.codec, strs_rx.as_mut(), setup_timeout)?;
        let capacity = StreamBuffParams {
            bytes: strs.capacity_bytes,
            packets: strs.capacity_pkts,
        };
        tracing::debug!(
            bytes = capacity.bytes,
            packets = capacity.packets,
            "destination ingress capacity"
        );

        // Second INIT requests our status-report frequency.
        let fc_freq = self.fc_freq_for(capacity);
        send_strc(
            &self.codec,
            send_io.as_mut(),
            local,
            remote,
            StrcOp::Init,
            fc_freq,
            &mut seq,
        )?;
        recv_strs(&self.codec, strs_rx.as_mut(), setup_timeout)?;

        Ok(ChdrTxStream::new(
            self.codec,
            send_io,
            strs_rx,
            local,
            remote,
            capacity,
        ))
    }

    /// Create a device-to-host data stream. The remote endpoint is
    /// started via management, answers with a `STRC INIT`, and receives
    /// our capacity advertisement before the portal commits the setup.
    pub fn create_device_to_host_data_stream(&mut self, src_addr: SepAddr) -> Result<ChdrRxStream> {
        let remote = self.ensure_remote_epid(src_addr)?;
        let local = self.alloc_host_epid()?;
        let setup_timeout = Duration::from_millis(self.cfg.stream.setup_timeout_ms);

        let mut mgmt_xport = ChdrCtrlXport::new(self.io.as_ref(), self.codec, local, 1, 1)?;
        self.portal.setup_local_route(&mut mgmt_xport, remote)?;

        // Our capacity is the receive buffering this stream owns.
        let mut rx_io = {
            let codec = self.codec;
            self.io.make_recv_client(RecvClientParams {
                num_recv_frames: self.cfg.link.num_recv_frames,
                filter: Box::new(move |frame: &[u8]| {
                    codec
                        .read_header(frame)
                        .map(|h| {
                            matches!(
                                h.pkt_type,
                                PacketType::DataNoTs
                                    | PacketType::DataWithTs
                                    | PacketType::StreamCmd
                            ) && h.dst_epid == local
                        })
                        .unwrap_or(false)
                }),
            })?
        };
        let mut send_io = self.io.make_send_client(SendClientParams {
            num_send_frames: 2,
        })?;
        let capacity = StreamBuffParams {
            bytes: (self.cfg.link.num_recv_frames * rx_io.recv_frame_size()) as u64,
            packets: self.cfg.link.num_recv_frames as u32,
        };
        let fc_freq = self.fc_freq_for(capacity);

        self.portal
            .config_local_rx_stream_start(&mut mgmt_xport, remote, fc_freq, true)?;

        // The endpoint opens with a STRC INIT carrying the granted
        // report frequency; we answer with our capacity.
        let granted = recv_strc_init(
            &self.codec,
            rx_io.as_mut(),
            remote,
            Timeout::Bounded(setup_timeout),
        )?;
        send_capacity_strs(
            &self.codec,
            send_io.as_mut(),
            local,
            remote,
            capacity,
        )?;

        self.portal
            .config_local_rx_stream_commit(&mut mgmt_xport, remote, setup_timeout)?;
        drop(mgmt_xport);

        tracing::debug!(
            bytes = granted.bytes,
            packets = granted.packets,
            "RX stream flow-control frequency granted"
        );

        Ok(ChdrRxStream::new(
            self.codec,
            rx_io,
            send_io,
            local,
            remote,
            capacity,
            granted,
        ))
    }

    /// Configure a flow-controlled stream between two remote endpoints.
    /// The endpoints negotiate their own credit window once routes and
    /// output-stream registers are in place.
    pub fn create_device_to_device_data_stream(
        &mut self,
        dst_addr: SepAddr,
        src_addr: SepAddr,
    ) -> Result<(Epid, Epid)> {
        let (src_epid, dst_epid) = self.connect_device_to_device(dst_addr, src_addr)?;
        let setup_timeout = Duration::from_millis(self.cfg.stream.setup_timeout_ms);
        // Zero frequency delegates report pacing to the endpoints'
        // own INIT handshake.
        self.portal.config_remote_stream(
            &mut self.ctrl_xport,
            dst_epid,
            src_epid,
            StreamBuffParams::default(),
            true,
            setup_timeout,
        )?;
        Ok((src_epid, dst_epid))
    }

    fn ensure_remote_epid(&mut self, addr: SepAddr) -> Result<Epid> {
        if let Some(epid) = self.epid_alloc.lookup_epid(addr) {
            if self.portal.is_endpoint_registered(epid) {
                return Ok(epid);
            }
        }
        let epid = self.epid_alloc.allocate(addr)?;
        self.portal
            .initialize_endpoint(&mut self.ctrl_xport, addr, epid)?;
        Ok(epid)
    }

    fn alloc_host_epid(&mut self) -> Result<Epid> {
        self.next_host_inst += 1;
        self.epid_alloc.allocate(SepAddr {
            device_id: self.host_device_id,
            instance: self.next_host_inst,
        })
    }

    fn fc_freq_for(&self, capacity: StreamBuffParams) -> StreamBuffParams {
        let freq_ratio = self.cfg.stream.fc_freq_ratio;
        let headroom_ratio = self.cfg.stream.fc_headroom_ratio;
        let bytes = (capacity.bytes as f64 * freq_ratio).ceil() as u64;
        let packets = (f64::from(capacity.packets) * freq_ratio).ceil() as u32;
        let headroom_bytes = (capacity.bytes as f64 * headroom_ratio).ceil() as u64;
        let headroom_packets = (f64::from(capacity.packets) * headroom_ratio).ceil() as u32;
        StreamBuffParams {
            bytes: bytes.saturating_sub(headroom_bytes),
            packets: packets.saturating_sub(headroom_packets),
        }
    }
}

fn send_strc(
    codec: &ChdrCodec,
    send_io: &mut dyn SendIoIf,
    local: Epid,
    remote: Epid,
    op: StrcOp,
    params: StreamBuffParams,
    seq: &mut u16,
) -> Result<()> {
    let mut strc = StrcPayload::new(local, op);
    strc.num_bytes = params.bytes;
    strc.num_pkts = u64::from(params.packets);

    let mut buff = send_io
        .get_send_buff(Timeout::Bounded(Duration::from_millis(100)))
        .ok_or_else(|| RfnocError::Resource("no send frame for stream command".to_string()))?;
    let offset = codec.payload_offset(PacketType::StreamCmd, 0);
    let pyld_len = strc.serialize(&mut buff.data_mut()[offset..], codec.endianness())?;
    let total = codec.finish_packet(
        buff.data_mut(),
        PacketType::StreamCmd,
        remote,
        *seq,
        pyld_len,
    )?;
    buff.set_packet_size(total);
    *seq = seq.wrapping_add(1);
    send_io.release_send_buff(buff)
}

fn recv_strs(
    codec: &ChdrCodec,
    strs_rx: &mut dyn RecvIoIf,
    timeout: Timeout,
) -> Result<StrsPayload> {
    let buff = strs_rx.get_recv_buff(timeout).ok_or_else(|| {
        RfnocError::Timeout("stream setup: no status answer from the endpoint".to_string())
    })?;
    let parsed = codec.parse(buff.data());
    let res = match parsed {
        Ok(p) => StrsPayload::deserialize(&buff.data()[p.payload], codec.endianness()),
        Err(e) => Err(e),
    };
    strs_rx.release_recv_buff(buff);
    res
}

/// Wait for the endpoint's `STRC INIT` during RX stream setup; returns
/// the granted flow-control frequency.
fn recv_strc_init(
    codec: &ChdrCodec,
    rx_io: &mut dyn RecvIoIf,
    remote: Epid,
    timeout: Timeout,
) -> Result<StreamBuffParams> {
    let buff = rx_io.get_recv_buff(timeout).ok_or_else(|| {
        RfnocError::Timeout("stream setup: endpoint never sent its INIT".to_string())
    })?;
    let parsed = codec.parse(buff.data());
    let res = (|| {
        let p = parsed?;
        if p.header.pkt_type != PacketType::StreamCmd {
            return Err(RfnocError::Protocol(format!(
                "expected a stream command during setup, got {:?}",
                p.header.pkt_type
            )));
        }
        let strc = StrcPayload::deserialize(&buff.data()[p.payload.clone()], codec.endianness())?;
        if strc.op != StrcOp::Init || strc.src_epid != remote {
            return Err(RfnocError::Protocol(
                "unexpected stream command during setup".to_string(),
            ));
        }
        Ok(StreamBuffParams {
            bytes: strc.num_bytes,
            packets: strc.num_pkts as u32,
        })
    })();
    rx_io.release_recv_buff(buff);
    res
}

fn send_capacity_strs(
    codec: &ChdrCodec,
    send_io: &mut dyn SendIoIf,
    local: Epid,
    remote: Epid,
    capacity: StreamBuffParams,
) -> Result<()> {
    let strs = StrsPayload {
        src_epid: local,
        status: StrsStatus::Okay,
        status_info: 0,
        buff_info: 0,
        xfer_count_pkts: 0,
        xfer_count_bytes: 0,
        capacity_pkts: capacity.packets,
        capacity_bytes: capacity.bytes,
    };
    let mut buff = send_io
        .get_send_buff(Timeout::Bounded(Duration::from_millis(100)))
        .ok_or_else(|| RfnocError::Resource("no send frame for stream status".to_string()))?;
    let offset = codec.payload_offset(PacketType::StreamStatus, 0);
    let pyld_len = strs.serialize(&mut buff.data_mut()[offset..], codec.endianness())?;
    let total = codec.finish_packet(
        buff.data_mut(),
        PacketType::StreamStatus,
        remote,
        0,
        pyld_len,
    )?;
    buff.set_packet_size(total);
    send_io.release_send_buff(buff)
}
