use std::collections::VecDeque;
use std::ops::Range;

use super::fc::{RxFcState, SeqCheck, StreamBuffParams};
use super::StreamEvent;
use crate::buffer::FrameBuff;
use crate::chdr::stream::{StrcOp, StrcPayload, StrsPayload, StrsStatus};
use crate::chdr::{ChdrCodec, PacketType};
use crate::error::{Result, RfnocError};
use crate::io_service::{RecvIoIf, SendIoIf};
use crate::link::{wait_slice, Timeout};

/// One received data packet, holding its frame until released.
#[derive(Debug)]
pub struct RxPacket {
    pub(crate) buff: FrameBuff,
    payload: Range<usize>,
    pub timestamp: Option<u64>,
    pub eob: bool,
    pub eov: bool,
    pub seq_num: u16,
}

impl RxPacket {
    pub fn payload(&self) -> &[u8] {
        &self.buff.data()[self.payload.clone()]
    }
}

/// Device-to-host flow-controlled data transport.
///
/// The host owns the receive buffering, so capacity is local; consumed
/// data is reported upstream every `fc_freq` bytes or packets, and
/// sequence gaps raise a SEQERR status so the sender can resynchronize.
pub struct ChdrRxStream {
    codec: ChdrCodec,
    rx: Box<dyn RecvIoIf>,
    send: Box<dyn SendIoIf>,
    local_epid: u16,
    remote_epid: u16,
    fc: RxFcState,
    events: VecDeque<StreamEvent>,
    strs_seq: u16,
}

impl ChdrRxStream {
    pub(crate) fn new(
        codec: ChdrCodec,
        rx: Box<dyn RecvIoIf>,
        send: Box<dyn SendIoIf>,
        local_epid: u16,
        remote_epid: u16,
        capacity: StreamBuffParams,
        fc_freq: StreamBuffParams,
    ) -> Self {
        ChdrRxStream {
            codec,
            rx,
            send,
            local_epid,
            remote_epid,
            fc: RxFcState::new(capacity, fc_freq),
            events: VecDeque::new(),
            strs_seq: 0,
        }
    }

    pub fn local_epid(&self) -> u16 {
        self.local_epid
    }

    pub fn remote_epid(&self) -> u16 {
        self.remote_epid
    }

    pub fn capacity(&self) -> StreamBuffParams {
        self.fc.capacity()
    }

    pub fn fc_freq(&self) -> StreamBuffParams {
        self.fc.fc_freq()
    }

    /// Receive the next data packet. `Ok(None)` on timeout; protocol
    /// violations surface as errors. Stream commands (resync, ping) are
    /// handled internally and never delivered.
    pub fn recv(&mut self, timeout: Timeout) -> Result<Option<RxPacket>> {
        let deadline = timeout.deadline();
        loop {
            let slice = match timeout {
                Timeout::Poll => Timeout::Poll,
                _ => match wait_slice(deadline) {
                    Some(d) => Timeout::Bounded(d),
                    None => return Ok(None),
                },
            };
            let Some(buff) = self.rx.get_recv_buff(slice) else {
                if timeout == Timeout::Poll {
                    return Ok(None);
                }
                continue;
            };

            let parsed = match self.codec.parse(buff.data()) {
                Ok(p) => p,
                Err(e) => {
                    self.rx.release_recv_buff(buff);
                    return Err(e);
                }
            };

            match parsed.header.pkt_type {
                PacketType::DataNoTs | PacketType::DataWithTs => {
                    if let SeqCheck::Gap { expected } = self.fc.check_seq(parsed.header.seq_num) {
                        let received = parsed.header.seq_num;
                        tracing::warn!(expected, received, "sequence gap on RX stream");
                        let info = (u64::from(expected) << 16) | u64::from(received);
                        self.events.push_back(StreamEvent::SeqError { info });
                        self.send_strs(StrsStatus::SeqError, info)?;
                    }
                    return Ok(Some(RxPacket {
                        timestamp: parsed.timestamp,
                        eob: parsed.header.eob,
                        eov: parsed.header.eov,
                        seq_num: parsed.header.seq_num,
                        payload: parsed.payload,
                        buff,
                    }));
                }
                PacketType::StreamCmd => {
                    let strc = StrcPayload::deserialize(
                        &buff.data()[parsed.payload.clone()],
                        self.codec.endianness(),
                    );
                    self.rx.release_recv_buff(buff);
                    self.handle_strc(strc?)?;
                }
                other => {
                    self.rx.release_recv_buff(buff);
                    return Err(RfnocError::Protocol(format!(
                        "unexpected {other:?} packet on a data stream"
                    )));
                }
            }
        }
    }

    /// Return a packet's frame and run the flow-control bookkeeping; a
    /// status report goes upstream when the report frequency is hit.
    pub fn release(&mut self, pkt: RxPacket) -> Result<()> {
        let bytes = pkt.payload.len();
        self.rx.release_recv_buff(pkt.buff);
        if self.fc.packet_consumed(bytes) {
            self.send_strs(StrsStatus::Okay, 0)?;
            self.fc.mark_reported();
        }
        Ok(())
    }

    /// Pop locally detected flow events (sequence gaps).
    pub fn recv_async_msg(&mut self) -> Option<StreamEvent> {
        self.events.pop_front()
    }

    fn handle_strc(&mut self, strc: StrcPayload) -> Result<()> {
        if strc.src_epid != self.remote_epid {
            tracing::warn!(src = strc.src_epid, "stream command from unexpected endpoint");
            return Ok(());
        }
        match strc.op {
            StrcOp::Resync => {
                tracing::debug!(
                    bytes = strc.num_bytes,
                    pkts = strc.num_pkts,
                    "resynchronizing RX stream counters"
                );
                self.fc.resync(strc.num_bytes, strc.num_pkts);
                self.send_strs(StrsStatus::Okay, 0)?;
            }
            StrcOp::Ping => {
                self.send_strs(StrsStatus::Okay, 0)?;
            }
            StrcOp::Init => {
                // A renegotiation: adopt the new report frequency and
                // re-advertise our capacity.
                self.fc.set_fc_freq(StreamBuffParams {
                    bytes: strc.num_bytes,
                    packets: strc.num_pkts as u32,
                });
                self.send_strs(StrsStatus::Okay, 0)?;
            }
            StrcOp::FcAck => {
                tracing::trace!("flow-control resync acknowledged by sender");
            }
        }
        Ok(())
    }

    fn send_strs(&mut self, status: StrsStatus, status_info: u64) -> Result<()> {
        let (bytes, pkts) = self.fc.counts();
        let strs = StrsPayload {
            src_epid: self.local_epid,
            status,
            status_info,
            buff_info: 0,
            xfer_count_pkts: pkts,
            xfer_count_bytes: bytes,
            capacity_pkts: self.fc.capacity().packets,
            capacity_bytes: self.fc.capacity().bytes,
        };

        let mut buff = self
            .send
            .get_send_buff(Timeout::Bounded(std::time::Duration::from_millis(100)))
            .ok_or_else(|| {
                RfnocError::Resource("no send frame for a stream status".to_string())
            })?;
        let offset = self.codec.payload_offset(PacketType::StreamStatus, 0);
        let pyld_len = strs.serialize(&mut buff.data_mut()[offset..], self.codec.endianness())?;
        let total = self.codec.finish_packet(
            buff.data_mut(),
            PacketType::StreamStatus,
            self.remote_epid,
            self.strs_seq,
            pyld_len,
        )?;
        buff.set_packet_size(total);
        self.strs_seq = self.strs_seq.wrapping_add(1);
        self.send.release_send_buff(buff)
    }
}
