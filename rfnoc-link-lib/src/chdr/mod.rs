//! CHDR packet codec.
//!
//! Parses and emits the width-parameterized CHDR wire format: the 64-bit
//! header, the optional timestamp word, and the typed payloads
//! (management, control, stream status, stream command). One
//! [`ChdrCodec`] instance covers one (width, endianness) pair and is
//! freely shareable; it holds no state.

mod header;
mod packet;

pub mod ctrl;
pub mod mgmt;
pub mod stream;

pub use header::{ChdrHeader, PacketType};
pub use packet::{ChdrCodec, ParsedPacket};

use bytes::{Buf, BufMut};

use crate::error::{Result, RfnocError};

/// CHDR bus width. Fixed per device; all packet sizes are multiples of
/// the corresponding word size.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChdrWidth {
    W64,
    W128,
    W256,
    W512,
}

impl ChdrWidth {
    pub fn bits(self) -> usize {
        match self {
            ChdrWidth::W64 => 64,
            ChdrWidth::W128 => 128,
            ChdrWidth::W256 => 256,
            ChdrWidth::W512 => 512,
        }
    }

    /// Size of one CHDR word in bytes.
    pub fn bytes(self) -> usize {
        self.bits() / 8
    }

    pub fn from_bits(bits: usize) -> Result<Self> {
        match bits {
            64 => Ok(ChdrWidth::W64),
            128 => Ok(ChdrWidth::W128),
            256 => Ok(ChdrWidth::W256),
            512 => Ok(ChdrWidth::W512),
            _ => Err(RfnocError::Config(format!(
                "invalid CHDR width: {bits} bits"
            ))),
        }
    }

    /// 3-bit width identifier used in the management protocol header.
    pub(crate) fn id(self) -> u8 {
        match self {
            ChdrWidth::W64 => 0,
            ChdrWidth::W128 => 1,
            ChdrWidth::W256 => 2,
            ChdrWidth::W512 => 3,
        }
    }

    pub(crate) fn from_id(id: u8) -> Result<Self> {
        match id {
            0 => Ok(ChdrWidth::W64),
            1 => Ok(ChdrWidth::W128),
            2 => Ok(ChdrWidth::W256),
            3 => Ok(ChdrWidth::W512),
            _ => Err(RfnocError::Protocol(format!(
                "invalid CHDR width identifier: {id}"
            ))),
        }
    }
}

/// Byte order of a link. Ethernet transports are big-endian, DMA
/// transports use host (little) order. Words are swapped at the link
/// boundary in units of 64 bits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Endianness {
    Big,
    Little,
}

pub(crate) fn read_u64(buf: &mut &[u8], e: Endianness) -> u64 {
    match e {
        Endianness::Big => buf.get_u64(),
        Endianness::Little => buf.get_u64_le(),
    }
}

pub(crate) fn put_u64(buf: &mut &mut [u8], val: u64, e: Endianness) {
    match e {
        Endianness::Big => buf.put_u64(val),
        Endianness::Little => buf.put_u64_le(val),
    }
}

pub(crate) fn truncated(what: &str) -> RfnocError {
    RfnocError::Protocol(format!("{what} payload truncated"))
}

/// Require `len` readable bytes in a payload region.
pub(crate) fn ensure_len(buf: &[u8], len: usize, what: &str) -> Result<()> {
    if buf.len() < len {
        return Err(truncated(what));
    }
    Ok(())
}
