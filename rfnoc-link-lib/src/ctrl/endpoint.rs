use std::collections::VecDeque;
use std::time::Duration;

use super::ChdrCtrlXport;
use crate::chdr::ctrl::{CtrlOpCode, CtrlPayload, CtrlStatus, CTRL_MAX_DATA_WORDS};
use crate::config::CtrlConfig;
use crate::error::{Result, RfnocError};
use crate::link::{wait_slice, Timeout};

/// Grace period for draining outstanding acks on teardown.
const DRAIN_GRACE: Duration = Duration::from_millis(100);

/// How many consecutive mismatched response sequence numbers we
/// tolerate before declaring the endpoint out of sync.
const SEQ_ERR_LIMIT: u32 = 3;

/// Register peek/poke endpoint over CHDR control packets.
///
/// Writes are fire-and-forget up to `max_outstanding_acks`; beyond that
/// the caller blocks until acks free slots. Reads always block for the
/// matching response. A response timeout moves the endpoint into a
/// degraded state; subsequent operations still run, and the caller
/// decides whether to retry or tear down.
pub struct CtrlEndpoint {
    xport: ChdrCtrlXport,
    remote_epid: u16,
    dst_port: u16,
    src_port: u16,
    seq: u8,
    pending_acks: VecDeque<u8>,
    max_outstanding: usize,
    timeout: Duration,
    command_time: Option<u64>,
    degraded: bool,
    seq_err_streak: u32,
}

impl CtrlEndpoint {
    pub fn new(xport: ChdrCtrlXport, remote_epid: u16, dst_port: u16, cfg: &CtrlConfig) -> Self {
        CtrlEndpoint {
            xport,
            remote_epid,
            dst_port,
            src_port: 0,
            seq: 0,
            pending_acks: VecDeque::new(),
            max_outstanding: cfg.max_outstanding_acks,
            timeout: Duration::from_millis(cfg.timeout_ms),
            command_time: None,
            degraded: false,
            seq_err_streak: 0,
        }
    }

    /// Timestamp applied to subsequent operations; `None` reverts to
    /// untimed commands.
    pub fn set_command_time(&mut self, ticks: Option<u64>) {
        self.command_time = ticks;
    }

    /// True once a response deadline has been missed.
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn poke32(&mut self, addr: u32, data: u32) -> Result<()> {
        self.post_write(CtrlOpCode::Write, addr, vec![data])
    }

    pub fn poke64(&mut self, addr: u32, data: u64) -> Result<()> {
        self.post_write(
            CtrlOpCode::Write,
            addr,
            vec![data as u32, (data >> 32) as u32],
        )
    }

    /// Write `data` to consecutive 32-bit registers starting at `addr`.
    pub fn block_poke32(&mut self, addr: u32, data: &[u32]) -> Result<()> {
        for (i, chunk) in data.chunks(CTRL_MAX_DATA_WORDS).enumerate() {
            let offset = (i * CTRL_MAX_DATA_WORDS * 4) as u32;
            self.post_write(CtrlOpCode::Write, addr + offset, chunk.to_vec())?;
        }
        Ok(())
    }

    /// Read-modify-write under a mask: only bits set in `mask` change.
    pub fn poke32_masked(&mut self, addr: u32, data: u32, mask: u32) -> Result<()> {
        self.post_write(CtrlOpCode::ReadWrite, addr, vec![data, mask])
    }

    pub fn peek32(&mut self, addr: u32) -> Result<u32> {
        let resp = self.transact(CtrlOpCode::Read, addr, vec![0])?;
        resp.data
            .first()
            .copied()
            .ok_or_else(|| RfnocError::Protocol("read response carried no data".to_string()))
    }

    pub fn peek64(&mut self, addr: u32) -> Result<u64> {
        let resp = self.transact(CtrlOpCode::Read, addr, vec![0, 0])?;
        match resp.data.as_slice() {
            [lo, hi, ..] => Ok(u64::from(*lo) | (u64::from(*hi) << 32)),
            _ => Err(RfnocError::Protocol(
                "64-bit read response carried fewer than two words".to_string(),
            )),
        }
    }

    /// Read `len` consecutive 32-bit registers starting at `addr`.
    pub fn block_peek32(&mut self, addr: u32, len: usize) -> Result<Vec<u32>> {
        let mut out = Vec::with_capacity(len);
        let mut remaining = len;
        let mut cursor = addr;
        while remaining > 0 {
            let n = remaining.min(CTRL_MAX_DATA_WORDS);
            let resp = self.transact(CtrlOpCode::Read, cursor, vec![0; n])?;
            if resp.data.len() < n {
                return Err(RfnocError::Protocol(
                    "block read response was short".to_string(),
                ));
            }
            out.extend_from_slice(&resp.data[..n]);
            remaining -= n;
            cursor += (n * 4) as u32;
        }
        Ok(out)
    }

    /// Insert a delay of `ticks` into the device command sequence.
    pub fn sleep(&mut self, ticks: u64, ack: bool) -> Result<()> {
        let data = vec![ticks as u32, (ticks >> 32) as u32];
        if ack {
            self.transact(CtrlOpCode::Sleep, 0, data).map(|_| ())
        } else {
            self.post_write(CtrlOpCode::Sleep, 0, data)
        }
    }

    fn next_payload(&mut self, op_code: CtrlOpCode, addr: u32, data: Vec<u32>) -> CtrlPayload {
        let mut pyld = CtrlPayload::request(op_code, addr, data);
        pyld.dst_port = self.dst_port;
        pyld.src_port = self.src_port;
        pyld.src_epid = self.xport.epid();
        pyld.seq = self.seq;
        pyld.timestamp = self.command_time;
        self.seq = (self.seq + 1) & 0x3F;
        pyld
    }

    /// Fire-and-forget write path: sends, records the expected ack, and
    /// opportunistically drains whatever acks have already arrived.
    fn post_write(&mut self, op_code: CtrlOpCode, addr: u32, data: Vec<u32>) -> Result<()> {
        self.reclaim_slots()?;
        let pyld = self.next_payload(op_code, addr, data);
        let seq = pyld.seq;
        self.xport
            .send_ctrl(self.remote_epid, &pyld, Timeout::Bounded(self.timeout))?;
        self.pending_acks.push_back(seq);
        self.drain_acks(Timeout::Poll)?;
        Ok(())
    }

    /// Request/response path: blocks until the matching ack arrives.
    fn transact(&mut self, op_code: CtrlOpCode, addr: u32, data: Vec<u32>) -> Result<CtrlPayload> {
        self.reclaim_slots()?;
        let pyld = self.next_payload(op_code, addr, data);
        let seq = pyld.seq;
        self.xport
            .send_ctrl(self.remote_epid, &pyld, Timeout::Bounded(self.timeout))?;
        self.pending_acks.push_back(seq);
        self.wait_for(seq)
    }

    /// Block until the in-flight count is under the bound.
    fn reclaim_slots(&mut self) -> Result<()> {
        let deadline = Timeout::Bounded(self.timeout).deadline();
        while self.pending_acks.len() >= self.max_outstanding {
            let Some(slice) = wait_slice(deadline) else {
                self.degraded = true;
                return Err(RfnocError::Timeout(format!(
                    "{} control acks outstanding and none arriving",
                    self.pending_acks.len()
                )));
            };
            self.drain_acks(Timeout::Bounded(slice))?;
        }
        Ok(())
    }

    /// Pull responses off the wire; returns the one matching `target`
    /// if it shows up.
    fn consume_responses(
        &mut self,
        timeout: Timeout,
        target: Option<u8>,
    ) -> Result<Option<CtrlPayload>> {
        while let Some(resp) = self.xport.recv_ctrl(timeout)? {
            if !resp.is_ack {
                tracing::warn!(seq = resp.seq, "unsolicited control request discarded");
                continue;
            }
            let Some(pos) = self.pending_acks.iter().position(|&s| s == resp.seq) else {
                self.seq_err_streak += 1;
                tracing::warn!(
                    seq = resp.seq,
                    streak = self.seq_err_streak,
                    "control ack matches no outstanding request"
                );
                if self.seq_err_streak >= SEQ_ERR_LIMIT {
                    return Err(RfnocError::Sequence(
                        "persistent control sequence mismatch".to_string(),
                    ));
                }
                continue;
            };
            self.pending_acks.remove(pos);
            self.seq_err_streak = 0;
            check_status(&resp)?;
            if Some(resp.seq) == target {
                return Ok(Some(resp));
            }
        }
        Ok(None)
    }

    fn drain_acks(&mut self, timeout: Timeout) -> Result<()> {
        self.consume_responses(timeout, None).map(|_| ())
    }

    fn wait_for(&mut self, seq: u8) -> Result<CtrlPayload> {
        let deadline = Timeout::Bounded(self.timeout).deadline();
        loop {
            let Some(slice) = wait_slice(deadline) else {
                self.degraded = true;
                return Err(RfnocError::Timeout(format!(
                    "control response for seq {seq} absent within {:?}",
                    self.timeout
                )));
            };
            if let Some(resp) = self.consume_responses(Timeout::Bounded(slice), Some(seq))? {
                return Ok(resp);
            }
        }
    }
}

fn check_status(resp: &CtrlPayload) -> Result<()> {
    match resp.status {
        CtrlStatus::Okay => Ok(()),
        CtrlStatus::Warning => {
            tracing::warn!(
                addr = resp.address,
                "device flagged a warning on a control transaction"
            );
            Ok(())
        }
        CtrlStatus::CmdError => Err(RfnocError::Protocol(format!(
            "device rejected control command at {:#x}",
            resp.address
        ))),
        CtrlStatus::TsError => Err(RfnocError::Protocol(format!(
            "control command at {:#x} arrived after its timestamp",
            resp.address
        ))),
    }
}

impl Drop for CtrlEndpoint {
    fn drop(&mut self) {
        let deadline = Timeout::Bounded(DRAIN_GRACE).deadline();
        while !self.pending_acks.is_empty() {
            let Some(slice) = wait_slice(deadline) else { break };
            if self.drain_acks(Timeout::Bounded(slice)).is_err() {
                break;
            }
        }
        if !self.pending_acks.is_empty() {
            tracing::warn!(
                outstanding = self.pending_acks.len(),
                "control endpoint torn down with unacknowledged transactions"
            );
        }
    }
}
