//! Flow-control payloads: stream status (STRS) and stream command (STRC).

use super::{ensure_len, put_u64, read_u64, Endianness};
use crate::error::{Result, RfnocError};

/// Receiver state advertised in a stream status packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StrsStatus {
    Okay,
    CmdError,
    SeqError,
    DataError,
    RouteError,
}

impl StrsStatus {
    fn to_bits(self) -> u8 {
        match self {
            StrsStatus::Okay => 0,
            StrsStatus::CmdError => 1,
            StrsStatus::SeqError => 2,
            StrsStatus::DataError => 3,
            StrsStatus::RouteError => 4,
        }
    }

    fn from_bits(bits: u8) -> Result<Self> {
        match bits {
            0 => Ok(StrsStatus::Okay),
            1 => Ok(StrsStatus::CmdError),
            2 => Ok(StrsStatus::SeqError),
            3 => Ok(StrsStatus::DataError),
            4 => Ok(StrsStatus::RouteError),
            other => Err(RfnocError::Protocol(format!(
                "invalid stream status code: {other}"
            ))),
        }
    }
}

/// Stream status payload: the receiver's monotonic transfer counts and
/// its buffer capacity. Four 64-bit words on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StrsPayload {
    /// Endpoint that produced this status.
    pub src_epid: u16,
    pub status: StrsStatus,
    /// Free-form detail for the status code (e.g. the expected sequence
    /// number after a SEQERR).
    pub status_info: u64,
    /// Opaque buffer state from the receiver.
    pub buff_info: u16,
    /// Total packets consumed since stream start (or last resync).
    pub xfer_count_pkts: u64,
    /// Total bytes consumed since stream start (or last resync).
    pub xfer_count_bytes: u64,
    /// Ingress buffer capacity in packets.
    pub capacity_pkts: u32,
    /// Ingress buffer capacity in bytes.
    pub capacity_bytes: u64,
}

pub const STRS_PAYLOAD_LEN: usize = 32;

impl StrsPayload {
    pub fn serialize(&self, out: &mut [u8], e: Endianness) -> Result<usize> {
        if out.len() < STRS_PAYLOAD_LEN {
            return Err(RfnocError::Resource(
                "frame too small for stream status payload".to_string(),
            ));
        }
        // capacity_bytes has 40 bits, capacity_pkts 24, xfer_count_pkts 40.
        let w0 = u64::from(self.src_epid)
            | (u64::from(self.status.to_bits()) << 16)
            | ((self.capacity_bytes & 0xFF_FFFF_FFFF) << 24);
        let w1 = u64::from(self.capacity_pkts & 0xFF_FFFF) | ((self.xfer_count_pkts & 0xFF_FFFF_FFFF) << 24);
        let w2 = self.xfer_count_bytes;
        let w3 = u64::from(self.buff_info) | ((self.status_info & 0xFFFF_FFFF_FFFF) << 16);

        let mut buf = &mut out[..STRS_PAYLOAD_LEN];
        for w in [w0, w1, w2, w3] {
            put_u64(&mut buf, w, e);
        }
        Ok(STRS_PAYLOAD_LEN)
    }

    pub fn deserialize(payload: &[u8], e: Endianness) -> Result<Self> {
        ensure_len(payload, STRS_PAYLOAD_LEN, "stream status")?;
        let mut buf = payload;
        let w0 = read_u64(&mut buf, e);
        let w1 = read_u64(&mut buf, e);
        let w2 = read_u64(&mut buf, e);
        let w3 = read_u64(&mut buf, e);

        Ok(StrsPayload {
            src_epid: w0 as u16,
            status: StrsStatus::from_bits(((w0 >> 16) & 0xF) as u8)?,
            capacity_bytes: (w0 >> 24) & 0xFF_FFFF_FFFF,
            capacity_pkts: (w1 & 0xFF_FFFF) as u32,
            xfer_count_pkts: (w1 >> 24) & 0xFF_FFFF_FFFF,
            xfer_count_bytes: w2,
            buff_info: w3 as u16,
            status_info: (w3 >> 16) & 0xFFFF_FFFF_FFFF,
        })
    }
}

/// Stream command opcode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StrcOp {
    /// Start or renegotiate flow control.
    Init,
    /// Keepalive; the receiver answers with a status report.
    Ping,
    /// Reset the receiver's transfer counts to the sender's.
    Resync,
    /// Acknowledge a resync.
    FcAck,
}

impl StrcOp {
    fn to_bits(self) -> u8 {
        match self {
            StrcOp::Init => 0,
            StrcOp::Ping => 1,
            StrcOp::Resync => 2,
            StrcOp::FcAck => 3,
        }
    }

    fn from_bits(bits: u8) -> Result<Self> {
        match bits {
            0 => Ok(StrcOp::Init),
            1 => Ok(StrcOp::Ping),
            2 => Ok(StrcOp::Resync),
            3 => Ok(StrcOp::FcAck),
            other => Err(RfnocError::Protocol(format!(
                "invalid stream command opcode: {other}"
            ))),
        }
    }
}

/// Stream command payload. Two 64-bit words on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StrcPayload {
    /// Endpoint that issued the command.
    pub src_epid: u16,
    pub op: StrcOp,
    /// Opcode-specific data, 4 bits.
    pub op_data: u8,
    /// INIT: requested report frequency in packets. RESYNC: packets sent.
    pub num_pkts: u64,
    /// INIT: requested report frequency in bytes. RESYNC: bytes sent.
    pub num_bytes: u64,
}

pub const STRC_PAYLOAD_LEN: usize = 16;

impl StrcPayload {
    pub fn new(src_epid: u16, op: StrcOp) -> Self {
        StrcPayload {
            src_epid,
            op,
            op_data: 0,
            num_pkts: 0,
            num_bytes: 0,
        }
    }

    pub fn serialize(&self, out: &mut [u8], e: Endianness) -> Result<usize> {
        if out.len() < STRC_PAYLOAD_LEN {
            return Err(RfnocError::Resource(
                "frame too small for stream command payload".to_string(),
            ));
        }
        let w0 = u64::from(self.src_epid)
            | (u64::from(self.op.to_bits()) << 16)
            | (u64::from(self.op_data & 0xF) << 20)
            | ((self.num_pkts & 0xFF_FFFF_FFFF) << 24);
        let mut buf = &mut out[..STRC_PAYLOAD_LEN];
        put_u64(&mut buf, w0, e);
        put_u64(&mut buf, self.num_bytes, e);
        Ok(STRC_PAYLOAD_LEN)
    }

    pub fn deserialize(payload: &[u8], e: Endianness) -> Result<Self> {
        ensure_len(payload, STRC_PAYLOAD_LEN, "stream command")?;
        let mut buf = payload;
        let w0 = read_u64(&mut buf, e);
        let w1 = read_u64(&mut buf, e);

        Ok(StrcPayload {
            src_epid: w0 as u16,
            op: StrcOp::from_bits(((w0 >> 16) & 0xF) as u8)?,
            op_data: ((w0 >> 20) & 0xF) as u8,
            num_pkts: (w0 >> 24) & 0xFF_FFFF_FFFF,
            num_bytes: w1,
        })
    }
}
