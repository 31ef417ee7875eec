use crate::chdr::ctrl::CtrlPayload;
use crate::chdr::mgmt::MgmtPayload;
use crate::chdr::{ChdrCodec, PacketType};
use crate::error::{Result, RfnocError};
use crate::io_service::{IoService, RecvClientParams, RecvIoIf, SendClientParams, SendIoIf};
use crate::link::Timeout;

/// A CHDR transport for one endpoint's control traffic.
///
/// Owns one send client and two receive clients on the I/O service: one
/// filtered on control packets addressed to this EPID, one on
/// management packets returning to it (or to the unassigned EPID, which
/// discovery responses may still carry).
pub struct ChdrCtrlXport {
    codec: ChdrCodec,
    epid: u16,
    send: Box<dyn SendIoIf>,
    ctrl_rx: Box<dyn RecvIoIf>,
    mgmt_rx: Box<dyn RecvIoIf>,
    seq_ctrl: u16,
    seq_mgmt: u16,
}

impl ChdrCtrlXport {
    pub fn new(
        io: &dyn IoService,
        codec: ChdrCodec,
        epid: u16,
        num_send_frames: usize,
        num_recv_frames: usize,
    ) -> Result<Self> {
        let ctrl_filter = {
            let codec = codec;
            Box::new(move |frame: &[u8]| {
                codec
                    .read_header(frame)
                    .map(|h| h.pkt_type == PacketType::Ctrl && h.dst_epid == epid)
                    .unwrap_or(false)
            })
        };
        let mgmt_filter = {
            let codec = codec;
            Box::new(move |frame: &[u8]| {
                codec
                    .read_header(frame)
                    .map(|h| {
                        h.pkt_type == PacketType::Management
                            && (h.dst_epid == epid || h.dst_epid == 0)
                    })
                    .unwrap_or(false)
            })
        };

        Ok(ChdrCtrlXport {
            codec,
            epid,
            send: io.make_send_client(SendClientParams { num_send_frames })?,
            ctrl_rx: io.make_recv_client(RecvClientParams {
                num_recv_frames,
                filter: ctrl_filter,
            })?,
            mgmt_rx: io.make_recv_client(RecvClientParams {
                num_recv_frames,
                filter: mgmt_filter,
            })?,
            seq_ctrl: 0,
            seq_mgmt: 0,
        })
    }

    pub fn epid(&self) -> u16 {
        self.epid
    }

    pub fn codec(&self) -> ChdrCodec {
        self.codec
    }

    /// Send a management transaction toward the device. Management
    /// packets travel with the unassigned destination EPID; routing is
    /// carried by the hops themselves.
    pub fn send_mgmt(&mut self, payload: &MgmtPayload, timeout: Timeout) -> Result<()> {
        let mut buff = self.send.get_send_buff(timeout).ok_or_else(|| {
            RfnocError::Timeout("no send frame for management packet".to_string())
        })?;
        let offset = self.codec.payload_offset(PacketType::Management, 0);
        let pyld_len = payload.serialize(&mut buff.data_mut()[offset..], self.codec.endianness())?;
        let frame = buff.data_mut();
        let total = self
            .codec
            .finish_packet(frame, PacketType::Management, 0, self.seq_mgmt, pyld_len)?;
        buff.set_packet_size(total);
        self.seq_mgmt = self.seq_mgmt.wrapping_add(1);
        self.send.release_send_buff(buff)
    }

    /// Receive the next management packet. `Ok(None)` on timeout.
    pub fn recv_mgmt(&mut self, timeout: Timeout) -> Result<Option<MgmtPayload>> {
        let Some(buff) = self.mgmt_rx.get_recv_buff(timeout) else {
            return Ok(None);
        };
        let res = self.parse_mgmt(buff.data());
        self.mgmt_rx.release_recv_buff(buff);
        res.map(Some)
    }

    fn parse_mgmt(&self, frame: &[u8]) -> Result<MgmtPayload> {
        let parsed = self.codec.parse(frame)?;
        MgmtPayload::deserialize_strict(&frame[parsed.payload], self.codec.endianness())
    }

    /// Send a control request or response.
    pub fn send_ctrl(
        &mut self,
        dst_epid: u16,
        payload: &CtrlPayload,
        timeout: Timeout,
    ) -> Result<()> {
        let mut buff = self
            .send
            .get_send_buff(timeout)
            .ok_or_else(|| RfnocError::Timeout("no send frame for control packet".to_string()))?;
        let offset = self.codec.payload_offset(PacketType::Ctrl, 0);
        let pyld_len = payload.serialize(&mut buff.data_mut()[offset..], self.codec.endianness())?;
        let frame = buff.data_mut();
        let total =
            self.codec
                .finish_packet(frame, PacketType::Ctrl, dst_epid, self.seq_ctrl, pyld_len)?;
        buff.set_packet_size(total);
        self.seq_ctrl = self.seq_ctrl.wrapping_add(1);
        self.send.release_send_buff(buff)
    }

    /// Receive the next control packet addressed to this endpoint.
    /// `Ok(None)` on timeout.
    pub fn recv_ctrl(&mut self, timeout: Timeout) -> Result<Option<CtrlPayload>> {
        let Some(buff) = self.ctrl_rx.get_recv_buff(timeout) else {
            return Ok(None);
        };
        let parsed = self.codec.parse(buff.data());
        let res = match parsed {
            Ok(p) => CtrlPayload::deserialize(&buff.data()[p.payload], self.codec.endianness()),
            Err(e) => Err(e),
        };
        self.ctrl_rx.release_recv_buff(buff);
        res.map(Some)
    }
}
