use std::ops::Range;

use super::{put_u64, read_u64, ChdrHeader, ChdrWidth, Endianness, PacketType};
use crate::error::{Result, RfnocError};

/// Stateless codec for one (width, endianness) pair.
///
/// All offsets are computed from the header alone, so packets whose
/// payload need not be inspected can be bridged without parsing.
#[derive(Clone, Copy, Debug)]
pub struct ChdrCodec {
    width: ChdrWidth,
    endianness: Endianness,
}

/// A validated view into a received frame.
#[derive(Clone, Debug)]
pub struct ParsedPacket {
    pub header: ChdrHeader,
    /// Timestamp, present iff the packet type is [`PacketType::DataWithTs`].
    pub timestamp: Option<u64>,
    /// Byte range of the metadata region within the frame.
    pub mdata: Range<usize>,
    /// Byte range of the payload within the frame.
    pub payload: Range<usize>,
}

impl ChdrCodec {
    pub fn new(width: ChdrWidth, endianness: Endianness) -> Self {
        ChdrCodec { width, endianness }
    }

    pub fn width(&self) -> ChdrWidth {
        self.width
    }

    pub fn endianness(&self) -> Endianness {
        self.endianness
    }

    /// Size of one CHDR word in bytes.
    pub fn word_bytes(&self) -> usize {
        self.width.bytes()
    }

    /// Offset of the metadata region. The timestamp, when present,
    /// occupies one full CHDR word after the header word.
    pub fn mdata_offset(&self, pkt_type: PacketType) -> usize {
        let ts_words = usize::from(pkt_type == PacketType::DataWithTs);
        self.word_bytes() * (1 + ts_words)
    }

    /// Offset of the payload, given only header fields.
    pub fn payload_offset(&self, pkt_type: PacketType, num_mdata: u8) -> usize {
        self.mdata_offset(pkt_type) + self.word_bytes() * usize::from(num_mdata)
    }

    /// Read and validate the header word of a frame.
    pub fn read_header(&self, frame: &[u8]) -> Result<ChdrHeader> {
        if frame.len() < self.word_bytes() {
            return Err(RfnocError::Protocol(format!(
                "frame of {} bytes is shorter than one CHDR word",
                frame.len()
            )));
        }
        let mut buf = frame;
        ChdrHeader::unpack(read_u64(&mut buf, self.endianness))
    }

    /// Write the header word. The frame must hold at least one CHDR word;
    /// the reserved upper bits of wide header words are zeroed.
    pub fn write_header(&self, frame: &mut [u8], header: &ChdrHeader) {
        let word_bytes = self.word_bytes();
        frame[8..word_bytes].fill(0);
        let mut buf = &mut frame[..8];
        put_u64(&mut buf, header.pack(), self.endianness);
    }

    pub fn read_timestamp(&self, frame: &[u8]) -> Result<u64> {
        let off = self.word_bytes();
        if frame.len() < off + 8 {
            return Err(RfnocError::Protocol(
                "frame too short for timestamp word".to_string(),
            ));
        }
        let mut buf = &frame[off..off + 8];
        Ok(read_u64(&mut buf, self.endianness))
    }

    pub fn write_timestamp(&self, frame: &mut [u8], timestamp: u64) {
        let off = self.word_bytes();
        frame[off + 8..off + self.word_bytes()].fill(0);
        let mut buf = &mut frame[off..off + 8];
        put_u64(&mut buf, timestamp, self.endianness);
    }

    /// Parse and validate a received frame.
    ///
    /// Checks that the declared length is word-aligned, fits the frame,
    /// and leaves room for the timestamp and metadata the header claims.
    pub fn parse(&self, frame: &[u8]) -> Result<ParsedPacket> {
        let header = self.read_header(frame)?;
        let length = usize::from(header.length);

        if length > frame.len() || length % self.word_bytes() != 0 {
            return Err(RfnocError::Protocol(format!(
                "bad CHDR length {} for a {}-byte frame of width {}",
                length,
                frame.len(),
                self.width.bits()
            )));
        }

        let payload_off = self.payload_offset(header.pkt_type, header.num_mdata);
        if length < payload_off {
            return Err(RfnocError::Protocol(format!(
                "CHDR length {} leaves no room for the declared prelude of {} bytes",
                length, payload_off
            )));
        }

        let timestamp = if header.pkt_type == PacketType::DataWithTs {
            Some(self.read_timestamp(frame)?)
        } else {
            None
        };

        Ok(ParsedPacket {
            header,
            timestamp,
            mdata: self.mdata_offset(header.pkt_type)..payload_off,
            payload: payload_off..length,
        })
    }

    /// Finalize a data packet whose payload bytes the caller has already
    /// written at [`ChdrCodec::payload_offset`]. Pads the payload up to
    /// word alignment, then writes the header (and timestamp, if given).
    /// Returns the total packet length.
    pub fn finish_data(
        &self,
        frame: &mut [u8],
        header: &mut ChdrHeader,
        payload_len: usize,
        timestamp: Option<u64>,
    ) -> Result<usize> {
        header.pkt_type = if timestamp.is_some() {
            PacketType::DataWithTs
        } else {
            PacketType::DataNoTs
        };
        let payload_off = self.payload_offset(header.pkt_type, header.num_mdata);
        let padded = payload_len.next_multiple_of(self.word_bytes());
        let length = payload_off + padded;
        if length > frame.len() {
            return Err(RfnocError::Resource(format!(
                "packet of {} bytes exceeds the {}-byte frame",
                length,
                frame.len()
            )));
        }
        if length > usize::from(u16::MAX) {
            return Err(RfnocError::Config(format!(
                "packet of {length} bytes exceeds the CHDR length field"
            )));
        }
        frame[payload_off + payload_len..length].fill(0);

        header.length = length as u16;
        if let Some(ts) = timestamp {
            self.write_timestamp(frame, ts);
        }
        self.write_header(frame, header);
        Ok(length)
    }

    /// Emit a non-data packet from an already-serialized payload region.
    /// `payload_len` is the number of payload bytes the caller wrote at
    /// [`ChdrCodec::payload_offset`]`(pkt_type, 0)`.
    pub fn finish_packet(
        &self,
        frame: &mut [u8],
        pkt_type: PacketType,
        dst_epid: u16,
        seq_num: u16,
        payload_len: usize,
    ) -> Result<usize> {
        let payload_off = self.payload_offset(pkt_type, 0);
        let length = payload_off + payload_len.next_multiple_of(self.word_bytes());
        if length > frame.len() {
            return Err(RfnocError::Resource(format!(
                "packet of {} bytes exceeds the {}-byte frame",
                length,
                frame.len()
            )));
        }
        frame[payload_off + payload_len..length].fill(0);

        let mut header = ChdrHeader::new(pkt_type);
        header.dst_epid = dst_epid;
        header.seq_num = seq_num;
        header.length = length as u16;
        self.write_header(frame, &header);
        Ok(length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> ChdrCodec {
        ChdrCodec::new(ChdrWidth::W64, Endianness::Big)
    }

    #[test]
    fn test_payload_offsets() {
        let c = codec();
        assert_eq!(c.payload_offset(PacketType::DataNoTs, 0), 8);
        assert_eq!(c.payload_offset(PacketType::DataWithTs, 0), 16);
        assert_eq!(c.payload_offset(PacketType::DataWithTs, 2), 32);

        let wide = ChdrCodec::new(ChdrWidth::W256, Endianness::Little);
        assert_eq!(wide.payload_offset(PacketType::DataNoTs, 0), 32);
        // The timestamp slot is padded up to one full CHDR word.
        assert_eq!(wide.payload_offset(PacketType::DataWithTs, 0), 64);
    }

    #[test]
    fn test_data_packet_roundtrip() {
        let c = codec();
        let mut frame = vec![0u8; 256];
        let payload = [0xABu8; 48];
        let off = c.payload_offset(PacketType::DataWithTs, 0);
        frame[off..off + payload.len()].copy_from_slice(&payload);

        let mut hdr = ChdrHeader::new(PacketType::DataWithTs);
        hdr.dst_epid = 7;
        hdr.seq_num = 99;
        hdr.eob = true;
        let len = c
            .finish_data(&mut frame, &mut hdr, payload.len(), Some(0x1122334455667788))
            .expect("finish");
        assert_eq!(len, 16 + 48);

        let parsed = c.parse(&frame[..len]).expect("parse");
        assert_eq!(parsed.header.dst_epid, 7);
        assert_eq!(parsed.header.seq_num, 99);
        assert!(parsed.header.eob);
        assert_eq!(parsed.timestamp, Some(0x1122334455667788));
        assert_eq!(&frame[parsed.payload.clone()], &payload[..]);
    }

    #[test]
    fn test_header_endianness_on_wire() {
        let c = codec();
        let mut frame = vec![0u8; 64];
        let mut hdr = ChdrHeader::new(PacketType::DataNoTs);
        hdr.dst_epid = 0x0102;
        hdr.length = 8;
        c.write_header(&mut frame, &hdr);
        // Big-endian: DstEPID lands in the last two bytes of the word.
        assert_eq!(frame[6], 0x01);
        assert_eq!(frame[7], 0x02);

        let le = ChdrCodec::new(ChdrWidth::W64, Endianness::Little);
        le.write_header(&mut frame, &hdr);
        assert_eq!(frame[0], 0x02);
        assert_eq!(frame[1], 0x01);
    }

    #[test]
    fn test_length_inconsistent_with_frame_rejected() {
        let c = codec();
        let mut frame = vec![0u8; 24];
        let mut hdr = ChdrHeader::new(PacketType::DataNoTs);
        hdr.length = 32; // larger than the frame
        c.write_header(&mut frame, &hdr);
        assert!(c.parse(&frame).is_err());

        // Unaligned length is equally invalid.
        hdr.length = 13;
        c.write_header(&mut frame, &hdr);
        assert!(c.parse(&frame).is_err());
    }

    #[test]
    fn test_length_shorter_than_prelude_rejected() {
        let c = codec();
        let mut frame = vec![0u8; 32];
        let mut hdr = ChdrHeader::new(PacketType::DataWithTs);
        hdr.length = 8; // no room for the timestamp word
        c.write_header(&mut frame, &hdr);
        assert!(c.parse(&frame).is_err());
    }

    #[test]
    fn test_frame_of_exact_length_accepted() {
        let c = codec();
        let mut frame = vec![0u8; 1480];
        let mut hdr = ChdrHeader::new(PacketType::DataNoTs);
        let len = c
            .finish_data(&mut frame, &mut hdr, 1472, None)
            .expect("finish");
        assert_eq!(len, 1480);
        let parsed = c.parse(&frame[..len]).expect("parse");
        assert_eq!(parsed.payload.len(), 1472);
    }
}
