//! Control payload: register peek/poke transactions.

use bytes::{Buf, BufMut};

use super::Endianness;
use crate::error::{Result, RfnocError};

/// Control operation, 4 bits on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CtrlOpCode {
    /// Stall the device command sequence for `data[0]` ticks.
    Sleep,
    Write,
    Read,
    /// Read, then write `data[0]` under mask `data[1]`.
    ReadWrite,
}

impl CtrlOpCode {
    fn to_bits(self) -> u8 {
        match self {
            CtrlOpCode::Sleep => 0,
            CtrlOpCode::Write => 1,
            CtrlOpCode::Read => 2,
            CtrlOpCode::ReadWrite => 3,
        }
    }

    fn from_bits(bits: u8) -> Result<Self> {
        match bits {
            0 => Ok(CtrlOpCode::Sleep),
            1 => Ok(CtrlOpCode::Write),
            2 => Ok(CtrlOpCode::Read),
            3 => Ok(CtrlOpCode::ReadWrite),
            other => Err(RfnocError::Protocol(format!(
                "invalid control opcode: {other}"
            ))),
        }
    }
}

/// Status of a completed control transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CtrlStatus {
    Okay,
    /// The device rejected the command as malformed.
    CmdError,
    /// The command's timestamp was already in the past.
    TsError,
    Warning,
}

impl CtrlStatus {
    fn to_bits(self) -> u8 {
        match self {
            CtrlStatus::Okay => 0,
            CtrlStatus::CmdError => 1,
            CtrlStatus::TsError => 2,
            CtrlStatus::Warning => 3,
        }
    }

    fn from_bits(bits: u8) -> Self {
        match bits & 0x3 {
            0 => CtrlStatus::Okay,
            1 => CtrlStatus::CmdError,
            2 => CtrlStatus::TsError,
            _ => CtrlStatus::Warning,
        }
    }
}

/// Maximum number of 32-bit data words in one transaction (4-bit count).
pub const CTRL_MAX_DATA_WORDS: usize = 15;

/// A control request or response.
///
/// Requests and responses share the layout; a response echoes the
/// request with `is_ack` set, `status` filled in, and (for reads) the
/// data words replaced by the register contents.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CtrlPayload {
    /// Control crossbar port of the destination block.
    pub dst_port: u16,
    /// Port the transaction originated from.
    pub src_port: u16,
    /// 6-bit transaction sequence number; matches responses to requests.
    pub seq: u8,
    pub is_ack: bool,
    /// Endpoint that issued the request.
    pub src_epid: u16,
    /// Execute at this tick count, when present.
    pub timestamp: Option<u64>,
    /// Register address, 20 bits.
    pub address: u32,
    /// Byte enables for the addressed word.
    pub byte_enable: u8,
    pub op_code: CtrlOpCode,
    pub status: CtrlStatus,
    pub data: Vec<u32>,
}

impl CtrlPayload {
    pub fn request(op_code: CtrlOpCode, address: u32, data: Vec<u32>) -> Self {
        CtrlPayload {
            dst_port: 0,
            src_port: 0,
            seq: 0,
            is_ack: false,
            src_epid: 0,
            timestamp: None,
            address,
            byte_enable: 0xF,
            op_code,
            status: CtrlStatus::Okay,
            data,
        }
    }

    /// Serialized length in bytes, padded to a whole number of 64-bit
    /// words.
    pub fn wire_len(&self) -> usize {
        let words = 2 + if self.timestamp.is_some() { 2 } else { 0 } + 1 + self.data.len();
        words.next_multiple_of(2) * 4
    }

    pub fn serialize(&self, out: &mut [u8], e: Endianness) -> Result<usize> {
        if self.data.len() > CTRL_MAX_DATA_WORDS {
            return Err(RfnocError::Config(format!(
                "control transaction carries {} data words, max is {CTRL_MAX_DATA_WORDS}",
                self.data.len()
            )));
        }
        let len = self.wire_len();
        if out.len() < len {
            return Err(RfnocError::Resource(
                "frame too small for control payload".to_string(),
            ));
        }

        let mut words: Vec<u32> = Vec::with_capacity(len / 4);
        words.push(
            u32::from(self.dst_port & 0x3FF)
                | (u32::from(self.src_port & 0x3FF) << 10)
                | ((self.data.len() as u32) << 20)
                | (u32::from(self.seq & 0x3F) << 24)
                | (u32::from(self.timestamp.is_some()) << 30)
                | (u32::from(self.is_ack) << 31),
        );
        words.push(u32::from(self.src_epid));
        if let Some(ts) = self.timestamp {
            words.push(ts as u32);
            words.push((ts >> 32) as u32);
        }
        words.push(
            (self.address & 0xF_FFFF)
                | (u32::from(self.byte_enable & 0xF) << 20)
                | (u32::from(self.op_code.to_bits()) << 24)
                | (u32::from(self.status.to_bits()) << 30),
        );
        words.extend_from_slice(&self.data);
        if words.len() % 2 != 0 {
            words.push(0);
        }

        let mut buf = &mut out[..len];
        for w in words {
            match e {
                Endianness::Big => buf.put_u32(w),
                Endianness::Little => buf.put_u32_le(w),
            }
        }
        Ok(len)
    }

    pub fn deserialize(payload: &[u8], e: Endianness) -> Result<Self> {
        let mut words: Vec<u32> = Vec::with_capacity(payload.len() / 4);
        let mut buf = payload;
        while buf.remaining() >= 4 {
            words.push(match e {
                Endianness::Big => buf.get_u32(),
                Endianness::Little => buf.get_u32_le(),
            });
        }

        let mut it = words.into_iter();
        let w0 = it.next().ok_or_else(|| super::truncated("control"))?;
        let w1 = it.next().ok_or_else(|| super::truncated("control"))?;

        let num_data = ((w0 >> 20) & 0xF) as usize;
        let has_time = (w0 >> 30) & 0x1 == 1;
        let timestamp = if has_time {
            let lo = it.next().ok_or_else(|| super::truncated("control"))?;
            let hi = it.next().ok_or_else(|| super::truncated("control"))?;
            Some(u64::from(lo) | (u64::from(hi) << 32))
        } else {
            None
        };

        let op_word = it.next().ok_or_else(|| super::truncated("control"))?;
        let mut data = Vec::with_capacity(num_data);
        for _ in 0..num_data {
            data.push(it.next().ok_or_else(|| super::truncated("control"))?);
        }

        Ok(CtrlPayload {
            dst_port: (w0 & 0x3FF) as u16,
            src_port: ((w0 >> 10) & 0x3FF) as u16,
            seq: ((w0 >> 24) & 0x3F) as u8,
            is_ack: (w0 >> 31) & 0x1 == 1,
            src_epid: w1 as u16,
            timestamp,
            address: op_word & 0xF_FFFF,
            byte_enable: ((op_word >> 20) & 0xF) as u8,
            op_code: CtrlOpCode::from_bits(((op_word >> 24) & 0xF) as u8)?,
            status: CtrlStatus::from_bits(((op_word >> 30) & 0x3) as u8),
            data,
        })
    }

    /// Build the matching ack for this request.
    pub fn to_ack(&self, status: CtrlStatus, data: Vec<u32>) -> Self {
        let mut ack = self.clone();
        ack.is_ack = true;
        ack.status = status;
        ack.data = data;
        ack
    }
}
