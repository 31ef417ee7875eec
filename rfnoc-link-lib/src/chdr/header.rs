use crate::error::{Result, RfnocError};

/// CHDR packet type. Three bits on the wire; the codes 0x3 and 0x5 are
/// reserved and rejected on receive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PacketType {
    /// Source-routed management transaction.
    Management,
    /// Flow-control status report from a receiver.
    StreamStatus,
    /// Flow-control command (init/ping/resync) from a sender.
    StreamCmd,
    /// Register peek/poke transaction.
    Ctrl,
    /// Data payload without a timestamp.
    DataNoTs,
    /// Data payload preceded by a 64-bit timestamp.
    DataWithTs,
}

impl PacketType {
    pub fn to_bits(self) -> u8 {
        match self {
            PacketType::Management => 0x0,
            PacketType::StreamStatus => 0x1,
            PacketType::StreamCmd => 0x2,
            PacketType::Ctrl => 0x4,
            PacketType::DataNoTs => 0x6,
            PacketType::DataWithTs => 0x7,
        }
    }

    pub fn from_bits(bits: u8) -> Result<Self> {
        match bits {
            0x0 => Ok(PacketType::Management),
            0x1 => Ok(PacketType::StreamStatus),
            0x2 => Ok(PacketType::StreamCmd),
            0x4 => Ok(PacketType::Ctrl),
            0x6 => Ok(PacketType::DataNoTs),
            0x7 => Ok(PacketType::DataWithTs),
            other => Err(RfnocError::Protocol(format!(
                "reserved CHDR packet type: {other:#x}"
            ))),
        }
    }

    pub fn is_data(self) -> bool {
        matches!(self, PacketType::DataNoTs | PacketType::DataWithTs)
    }
}

/// The 64-bit CHDR header, in native field representation.
///
/// Wire layout, MSB first:
/// `VC[63:58] EOB[57] EOV[56] PktType[55:53] NumMData[52:48]
///  SeqNum[47:32] Length[31:16] DstEPID[15:0]`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChdrHeader {
    /// Virtual channel, 6 bits. Usually zero.
    pub vc: u8,
    /// End-of-burst marker on data packets.
    pub eob: bool,
    /// End-of-vector marker.
    pub eov: bool,
    pub pkt_type: PacketType,
    /// Number of metadata words (each one CHDR word), 5 bits.
    pub num_mdata: u8,
    /// Per-flow sequence number; wraps at 16 bits.
    pub seq_num: u16,
    /// Total packet length in bytes: header word, optional timestamp
    /// slot, metadata, and payload.
    pub length: u16,
    /// Destination endpoint.
    pub dst_epid: u16,
}

impl ChdrHeader {
    pub fn new(pkt_type: PacketType) -> Self {
        ChdrHeader {
            vc: 0,
            eob: false,
            eov: false,
            pkt_type,
            num_mdata: 0,
            seq_num: 0,
            length: 0,
            dst_epid: 0,
        }
    }

    pub fn pack(&self) -> u64 {
        (u64::from(self.vc & 0x3f) << 58)
            | (u64::from(self.eob) << 57)
            | (u64::from(self.eov) << 56)
            | (u64::from(self.pkt_type.to_bits()) << 53)
            | (u64::from(self.num_mdata & 0x1f) << 48)
            | (u64::from(self.seq_num) << 32)
            | (u64::from(self.length) << 16)
            | u64::from(self.dst_epid)
    }

    pub fn unpack(word: u64) -> Result<Self> {
        let pkt_type = PacketType::from_bits(((word >> 53) & 0x7) as u8)?;
        Ok(ChdrHeader {
            vc: ((word >> 58) & 0x3f) as u8,
            eob: (word >> 57) & 0x1 == 1,
            eov: (word >> 56) & 0x1 == 1,
            pkt_type,
            num_mdata: ((word >> 48) & 0x1f) as u8,
            seq_num: (word >> 32) as u16,
            length: (word >> 16) as u16,
            dst_epid: word as u16,
        })
    }
}
