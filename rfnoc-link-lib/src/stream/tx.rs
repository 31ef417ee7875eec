use std::collections::VecDeque;

use super::fc::{StreamBuffParams, TxFcState};
use super::StreamEvent;
use crate::buffer::FrameBuff;
use crate::chdr::stream::{StrcOp, StrcPayload, StrsPayload, StrsStatus};
use crate::chdr::{ChdrCodec, ChdrHeader, PacketType};
use crate::error::{Result, RfnocError};
use crate::io_service::{RecvIoIf, SendIoIf};
use crate::link::{wait_slice, Timeout};

/// Per-packet send metadata.
#[derive(Clone, Copy, Debug, Default)]
pub struct SendMeta {
    /// Tick count for `DATA_WITH_TS` packets. Must not run backwards
    /// within a burst.
    pub timestamp: Option<u64>,
    /// Marks the last packet of the burst.
    pub eob: bool,
    pub eov: bool,
}

/// Result of a two-phase commit attempt.
pub enum CommitOutcome {
    /// The packet went out; payload bytes accepted.
    Sent(usize),
    /// The flow-control window stayed full for the whole timeout. The
    /// filled buffer comes back so the caller can retry.
    Blocked(FrameBuff),
}

/// Host-to-device flow-controlled data transport.
///
/// Created by the link stream manager after the two-step `STRC INIT`
/// handshake has established the destination's buffer capacity.
pub struct ChdrTxStream {
    codec: ChdrCodec,
    send: Box<dyn SendIoIf>,
    strs_rx: Box<dyn RecvIoIf>,
    local_epid: u16,
    remote_epid: u16,
    seq: u16,
    fc: TxFcState,
    events: VecDeque<StreamEvent>,
    /// Buffer stashed after a blocked `send` so its frame is not lost.
    spare: Option<FrameBuff>,
    last_ts: Option<u64>,
    resync_pending: bool,
}

impl ChdrTxStream {
    pub(crate) fn new(
        codec: ChdrCodec,
        send: Box<dyn SendIoIf>,
        strs_rx: Box<dyn RecvIoIf>,
        local_epid: u16,
        remote_epid: u16,
        capacity: StreamBuffParams,
    ) -> Self {
        ChdrTxStream {
            codec,
            send,
            strs_rx,
            local_epid,
            remote_epid,
            seq: 0,
            fc: TxFcState::new(capacity),
            events: VecDeque::new(),
            spare: None,
            last_ts: None,
            resync_pending: false,
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

    /// Bytes and packets currently in flight.
    pub fn in_flight(&self) -> (u64, u64) {
        self.fc.in_flight()
    }

    /// Offset at which callers place payload bytes in a send buffer.
    pub fn payload_offset(&self, timed: bool) -> usize {
        let pkt_type = if timed {
            PacketType::DataWithTs
        } else {
            PacketType::DataNoTs
        };
        self.codec.payload_offset(pkt_type, 0)
    }

    /// Largest payload of a timed packet in one frame.
    pub fn max_payload_size(&self) -> usize {
        self.send.send_frame_size() - self.codec.payload_offset(PacketType::DataWithTs, 0)
    }

    /// Acquire a frame for zero-copy filling. Write payload bytes at
    /// [`ChdrTxStream::payload_offset`], then [`ChdrTxStream::commit`].
    pub fn get_send_buff(&mut self, timeout: Timeout) -> Option<FrameBuff> {
        match self.spare.take() {
            Some(buff) => Some(buff),
            None => self.send.get_send_buff(timeout),
        }
    }

    /// Finalize and transmit a filled buffer, honoring the credit
    /// window. Blocks up to `timeout` for window space; a bounded wait
    /// that expires hands the buffer back as [`CommitOutcome::Blocked`].
    pub fn commit(
        &mut self,
        buff: FrameBuff,
        payload_len: usize,
        meta: &SendMeta,
        timeout: Timeout,
    ) -> Result<CommitOutcome> {
        if let (Some(ts), Some(last)) = (meta.timestamp, self.last_ts) {
            if ts < last {
                // Keep the frame; the caller will want to retry.
                self.spare = Some(buff);
                return Err(RfnocError::Sequence(format!(
                    "timestamp {ts} runs backwards within the burst (last was {last})"
                )));
            }
        }

        let pkt_type = if meta.timestamp.is_some() {
            PacketType::DataWithTs
        } else {
            PacketType::DataNoTs
        };
        let wire_len = self.codec.payload_offset(pkt_type, 0)
            + payload_len.next_multiple_of(self.codec.word_bytes());

        // Wait out the credit window.
        let deadline = timeout.deadline();
        while !self.fc.dest_has_space(wire_len) {
            if timeout == Timeout::Poll {
                self.drain_strs(Timeout::Poll)?;
                if !self.fc.dest_has_space(wire_len) {
                    return Ok(CommitOutcome::Blocked(buff));
                }
                break;
            }
            let Some(slice) = wait_slice(deadline) else {
                return Ok(CommitOutcome::Blocked(buff));
            };
            self.drain_strs(Timeout::Bounded(slice))?;
        }

        let mut buff = buff;
        let mut header = ChdrHeader::new(pkt_type);
        header.dst_epid = self.remote_epid;
        header.seq_num = self.seq;
        header.eob = meta.eob;
        header.eov = meta.eov;
        let total =
            self.codec
                .finish_data(buff.data_mut(), &mut header, payload_len, meta.timestamp)?;
        buff.set_packet_size(total);
        self.send.release_send_buff(buff)?;

        self.fc.data_sent(total);
        self.seq = self.seq.wrapping_add(1);
        self.last_ts = if meta.eob { None } else { meta.timestamp };
        Ok(CommitOutcome::Sent(payload_len))
    }

    /// Copying convenience over acquire-fill-commit. Returns the number
    /// of payload bytes accepted; zero when no buffer or window space
    /// materialized within the timeout.
    pub fn send(&mut self, payload: &[u8], meta: &SendMeta, timeout: Timeout) -> Result<usize> {
        if payload.len() > self.max_payload_size() {
            return Err(RfnocError::Config(format!(
                "payload of {} bytes exceeds the {}-byte frame budget",
                payload.len(),
                self.max_payload_size()
            )));
        }
        let Some(mut buff) = self.get_send_buff(timeout) else {
            return Ok(0);
        };
        let offset = self.payload_offset(meta.timestamp.is_some());
        buff.data_mut()[offset..offset + payload.len()].copy_from_slice(payload);

        match self.commit(buff, payload.len(), meta, timeout)? {
            CommitOutcome::Sent(n) => Ok(n),
            CommitOutcome::Blocked(buff) => {
                self.spare = Some(buff);
                Ok(0)
            }
        }
    }

    /// Poll for asynchronous flow events (SEQERR and friends).
    pub fn recv_async_msg(&mut self, timeout: Timeout) -> Option<StreamEvent> {
        if let Some(ev) = self.events.pop_front() {
            return Some(ev);
        }
        let deadline = timeout.deadline();
        loop {
            let slice = match timeout {
                Timeout::Poll => Timeout::Poll,
                _ => Timeout::Bounded(wait_slice(deadline)?),
            };
            if let Err(e) = self.drain_strs(slice) {
                tracing::warn!("status drain failed: {e}");
                return None;
            }
            if let Some(ev) = self.events.pop_front() {
                return Some(ev);
            }
            if timeout == Timeout::Poll {
                return None;
            }
        }
    }

    /// Pull in status reports; returns whether any arrived.
    fn drain_strs(&mut self, timeout: Timeout) -> Result<bool> {
        let mut got = false;
        // First recv honors the timeout; the rest is opportunistic.
        let mut wait = timeout;
        while let Some(buff) = self.strs_rx.get_recv_buff(wait) {
            wait = Timeout::Poll;
            let parsed = self.codec.parse(buff.data()).and_then(|p| {
                StrsPayload::deserialize(&buff.data()[p.payload], self.codec.endianness())
            });
            self.strs_rx.release_recv_buff(buff);
            match parsed {
                Ok(strs) => {
                    got = true;
                    self.handle_strs(strs)?;
                }
                Err(e) => tracing::warn!("malformed stream status dropped: {e}"),
            }
        }
        Ok(got)
    }

    fn handle_strs(&mut self, strs: StrsPayload) -> Result<()> {
        if strs.src_epid != self.remote_epid {
            tracing::warn!(
                src = strs.src_epid,
                "stream status from an unexpected endpoint"
            );
            return Ok(());
        }
        self.fc
            .update_consumed(strs.xfer_count_bytes, strs.xfer_count_pkts);

        match strs.status {
            StrsStatus::Okay => {
                if self.resync_pending {
                    self.resync_pending = false;
                    self.send_strc(StrcOp::FcAck)?;
                }
            }
            StrsStatus::SeqError => {
                tracing::warn!(info = strs.status_info, "device reported a sequence error");
                self.events.push_back(StreamEvent::SeqError {
                    info: strs.status_info,
                });
                self.send_resync()?;
            }
            StrsStatus::DataError => self.events.push_back(StreamEvent::DataError {
                info: strs.status_info,
            }),
            StrsStatus::RouteError => self.events.push_back(StreamEvent::LateCommand {
                info: strs.status_info,
            }),
            StrsStatus::CmdError => self.events.push_back(StreamEvent::CmdError {
                info: strs.status_info,
            }),
        }
        Ok(())
    }

    /// Reset the device's view of our counters after a reported gap.
    fn send_resync(&mut self) -> Result<()> {
        self.send_strc(StrcOp::Resync)?;
        self.resync_pending = true;
        Ok(())
    }

    fn send_strc(&mut self, op: StrcOp) -> Result<()> {
        let (bytes, pkts) = self.fc.sent_counts();
        let mut strc = StrcPayload::new(self.local_epid, op);
        strc.num_bytes = bytes;
        strc.num_pkts = pkts;

        let mut buff = self
            .send
            .get_send_buff(Timeout::Bounded(std::time::Duration::from_millis(100)))
            .ok_or_else(|| {
                RfnocError::Resource("no send frame for a stream command".to_string())
            })?;
        let offset = self.codec.payload_offset(PacketType::StreamCmd, 0);
        let pyld_len = strc.serialize(&mut buff.data_mut()[offset..], self.codec.endianness())?;
        let total = self.codec.finish_packet(
            buff.data_mut(),
            PacketType::StreamCmd,
            self.remote_epid,
            self.seq,
            pyld_len,
        )?;
        buff.set_packet_size(total);
        self.seq = self.seq.wrapping_add(1);
        self.send.release_send_buff(buff)
    }
}
