//! Management payload: source-routed transactions made of per-hop
//! operation lists.
//!
//! Wire layout: one protocol header word
//! (`proto_ver[15:0] | chdr_w_id[18:16] | num_hops[63:48]`), then each
//! hop's op words in order. An op word is
//! `ops_pending[7:0] | op_code[15:8] | op_payload[63:16]`, where
//! `ops_pending` counts the ops remaining in the hop after this one; a
//! hop ends at the word with `ops_pending == 0`.

use super::{put_u64, read_u64, ChdrWidth, Endianness};
use crate::error::{Result, RfnocError};

/// Management protocol version spoken by this implementation.
pub const MGMT_PROTO_VER: u16 = 0x0100;

/// Management operation code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MgmtOpCode {
    Nop,
    /// Announce the sender to the node processing the hop.
    Advertise,
    /// Select the crossbar output port for the rest of the transaction.
    SelDest,
    /// Reverse direction: send the collected transaction back.
    Return,
    InfoReq,
    InfoResp,
    CfgWrReq,
    CfgRdReq,
    CfgRdResp,
}

impl MgmtOpCode {
    fn to_bits(self) -> u8 {
        match self {
            MgmtOpCode::Nop => 0,
            MgmtOpCode::Advertise => 1,
            MgmtOpCode::SelDest => 2,
            MgmtOpCode::Return => 3,
            MgmtOpCode::InfoReq => 4,
            MgmtOpCode::InfoResp => 5,
            MgmtOpCode::CfgWrReq => 6,
            MgmtOpCode::CfgRdReq => 7,
            MgmtOpCode::CfgRdResp => 8,
        }
    }

    fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(MgmtOpCode::Nop),
            1 => Some(MgmtOpCode::Advertise),
            2 => Some(MgmtOpCode::SelDest),
            3 => Some(MgmtOpCode::Return),
            4 => Some(MgmtOpCode::InfoReq),
            5 => Some(MgmtOpCode::InfoResp),
            6 => Some(MgmtOpCode::CfgWrReq),
            7 => Some(MgmtOpCode::CfgRdReq),
            8 => Some(MgmtOpCode::CfgRdResp),
            _ => None,
        }
    }
}

/// Node class reported by an INFO_RESP.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MgmtNodeType {
    Xbar,
    StreamEp,
    XportAdapter,
}

impl MgmtNodeType {
    fn to_bits(self) -> u8 {
        match self {
            MgmtNodeType::Xbar => 1,
            MgmtNodeType::StreamEp => 2,
            MgmtNodeType::XportAdapter => 3,
        }
    }

    fn from_bits(bits: u8) -> Result<Self> {
        match bits {
            1 => Ok(MgmtNodeType::Xbar),
            2 => Ok(MgmtNodeType::StreamEp),
            3 => Ok(MgmtNodeType::XportAdapter),
            other => Err(RfnocError::Protocol(format!(
                "invalid management node type: {other}"
            ))),
        }
    }
}

/// Contents of an INFO_RESP op.
///
/// `ext_info` is node-specific: a crossbar reports `num_ports[7:0]`, a
/// stream endpoint reports its capability bits (see [`SepCaps`]).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeInfo {
    pub device_id: u16,
    pub node_type: MgmtNodeType,
    pub node_inst: u16,
    pub ext_info: u32,
}

/// Stream endpoint capability bits carried in `NodeInfo::ext_info`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct SepCaps {
    pub has_ctrl: bool,
    pub has_data: bool,
    pub num_input_ports: u8,
    pub num_output_ports: u8,
    pub reports_status: bool,
}

impl SepCaps {
    pub fn to_bits(self) -> u32 {
        u32::from(self.has_ctrl)
            | (u32::from(self.has_data) << 1)
            | (u32::from(self.num_input_ports & 0x1F) << 2)
            | (u32::from(self.num_output_ports & 0x1F) << 7)
            | (u32::from(self.reports_status) << 12)
    }

    pub fn from_bits(bits: u32) -> Self {
        SepCaps {
            has_ctrl: bits & 0x1 == 1,
            has_data: (bits >> 1) & 0x1 == 1,
            num_input_ports: ((bits >> 2) & 0x1F) as u8,
            num_output_ports: ((bits >> 7) & 0x1F) as u8,
            reports_status: (bits >> 12) & 0x1 == 1,
        }
    }
}

/// Crossbar details carried in `NodeInfo::ext_info`: the port count and
/// the port this transaction arrived on (which faces the probing host).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct XbarInfo {
    pub num_ports: u8,
    pub arrival_port: u8,
}

impl XbarInfo {
    pub fn to_bits(self) -> u32 {
        u32::from(self.num_ports) | (u32::from(self.arrival_port) << 8)
    }

    pub fn from_bits(bits: u32) -> Self {
        XbarInfo {
            num_ports: bits as u8,
            arrival_port: (bits >> 8) as u8,
        }
    }
}

/// One management operation: an opcode plus 48 bits of payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MgmtOp {
    pub op_code: MgmtOpCode,
    pub op_payload: u64,
}

impl MgmtOp {
    pub fn nop() -> Self {
        MgmtOp {
            op_code: MgmtOpCode::Nop,
            op_payload: 0,
        }
    }

    /// Announce the originating endpoint; responders address their
    /// RETURN traffic to this EPID.
    pub fn advertise(src_epid: u16) -> Self {
        MgmtOp {
            op_code: MgmtOpCode::Advertise,
            op_payload: u64::from(src_epid),
        }
    }

    /// EPID announced by an ADVERTISE op.
    pub fn advertised_epid(&self) -> u16 {
        self.op_payload as u16
    }

    pub fn sel_dest(port: u16) -> Self {
        MgmtOp {
            op_code: MgmtOpCode::SelDest,
            op_payload: u64::from(port & 0x3FF),
        }
    }

    pub fn return_to_src() -> Self {
        MgmtOp {
            op_code: MgmtOpCode::Return,
            op_payload: 0,
        }
    }

    pub fn info_req() -> Self {
        MgmtOp {
            op_code: MgmtOpCode::InfoReq,
            op_payload: 0,
        }
    }

    pub fn info_resp(info: &NodeInfo) -> Self {
        let payload = u64::from(info.device_id)
            | (u64::from(info.node_type.to_bits()) << 16)
            | (u64::from(info.node_inst & 0x3FF) << 20)
            | (u64::from(info.ext_info & 0x3_FFFF) << 30);
        MgmtOp {
            op_code: MgmtOpCode::InfoResp,
            op_payload: payload,
        }
    }

    pub fn cfg_wr(addr: u16, data: u32) -> Self {
        MgmtOp {
            op_code: MgmtOpCode::CfgWrReq,
            op_payload: u64::from(addr) | (u64::from(data) << 16),
        }
    }

    pub fn cfg_rd(addr: u16) -> Self {
        MgmtOp {
            op_code: MgmtOpCode::CfgRdReq,
            op_payload: u64::from(addr),
        }
    }

    pub fn cfg_rd_resp(addr: u16, data: u32) -> Self {
        MgmtOp {
            op_code: MgmtOpCode::CfgRdResp,
            op_payload: u64::from(addr) | (u64::from(data) << 16),
        }
    }

    /// Port selected by a SEL_DEST op.
    pub fn dest_port(&self) -> u16 {
        (self.op_payload & 0x3FF) as u16
    }

    /// Decode an INFO_RESP payload.
    pub fn node_info(&self) -> Result<NodeInfo> {
        Ok(NodeInfo {
            device_id: self.op_payload as u16,
            node_type: MgmtNodeType::from_bits(((self.op_payload >> 16) & 0xF) as u8)?,
            node_inst: ((self.op_payload >> 20) & 0x3FF) as u16,
            ext_info: ((self.op_payload >> 30) & 0x3_FFFF) as u32,
        })
    }

    /// Decode a CFG_WR_REQ / CFG_RD_REQ / CFG_RD_RESP payload into
    /// `(address, data)`. For read requests, data is zero.
    pub fn cfg(&self) -> (u16, u32) {
        (self.op_payload as u16, (self.op_payload >> 16) as u32)
    }
}

/// One hop: the ops executed by a single node on the route.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct MgmtHop {
    pub ops: Vec<MgmtOp>,
}

impl MgmtHop {
    pub fn new(ops: Vec<MgmtOp>) -> Self {
        MgmtHop { ops }
    }
}

/// A full management transaction payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MgmtPayload {
    pub proto_ver: u16,
    pub chdr_width: ChdrWidth,
    pub hops: Vec<MgmtHop>,
}

impl MgmtPayload {
    pub fn new(chdr_width: ChdrWidth) -> Self {
        MgmtPayload {
            proto_ver: MGMT_PROTO_VER,
            chdr_width,
            hops: Vec::new(),
        }
    }

    pub fn add_hop(&mut self, hop: MgmtHop) -> &mut Self {
        self.hops.push(hop);
        self
    }

    /// Serialized length in bytes.
    pub fn wire_len(&self) -> usize {
        8 * (1 + self.hops.iter().map(|h| h.ops.len()).sum::<usize>())
    }

    pub fn serialize(&self, out: &mut [u8], e: Endianness) -> Result<usize> {
        let len = self.wire_len();
        if out.len() < len {
            return Err(RfnocError::Resource(
                "frame too small for management payload".to_string(),
            ));
        }
        if self.hops.len() > 0xFFFF {
            return Err(RfnocError::Config(
                "management transaction exceeds the hop count field".to_string(),
            ));
        }

        let mut buf = &mut out[..len];
        let header = u64::from(self.proto_ver)
            | (u64::from(self.chdr_width.id()) << 16)
            | ((self.hops.len() as u64) << 48);
        put_u64(&mut buf, header, e);

        for hop in &self.hops {
            if hop.ops.is_empty() {
                return Err(RfnocError::Config(
                    "management hop carries no ops".to_string(),
                ));
            }
            if hop.ops.len() > 0xFF {
                return Err(RfnocError::Config(
                    "management hop exceeds the ops_pending field".to_string(),
                ));
            }
            for (i, op) in hop.ops.iter().enumerate() {
                let pending = (hop.ops.len() - 1 - i) as u64;
                let word = pending
                    | (u64::from(op.op_code.to_bits()) << 8)
                    | ((op.op_payload & 0xFFFF_FFFF_FFFF) << 16);
                put_u64(&mut buf, word, e);
            }
        }
        Ok(len)
    }

    /// Parse a management payload.
    ///
    /// Unknown op codes are preserved as NOPs so that transactions merely
    /// passing through the host are not rejected; callers that terminate
    /// a transaction use [`MgmtPayload::deserialize_strict`].
    pub fn deserialize(payload: &[u8], e: Endianness) -> Result<Self> {
        Self::parse(payload, e, false)
    }

    /// Parse a management payload, rejecting unknown op codes with a
    /// protocol error.
    pub fn deserialize_strict(payload: &[u8], e: Endianness) -> Result<Self> {
        Self::parse(payload, e, true)
    }

    fn parse(payload: &[u8], e: Endianness, strict: bool) -> Result<Self> {
        if payload.len() < 8 {
            return Err(super::truncated("management"));
        }
        let mut buf = payload;
        let header = read_u64(&mut buf, e);
        let proto_ver = header as u16;
        let chdr_width = ChdrWidth::from_id(((header >> 16) & 0x7) as u8)?;
        let num_hops = (header >> 48) as usize;

        let mut hops = Vec::with_capacity(num_hops);
        for _ in 0..num_hops {
            let mut ops = Vec::new();
            loop {
                if buf.len() < 8 {
                    return Err(super::truncated("management"));
                }
                let word = read_u64(&mut buf, e);
                let pending = word as u8;
                let code_bits = (word >> 8) as u8;
                let op_payload = (word >> 16) & 0xFFFF_FFFF_FFFF;
                let op_code = match MgmtOpCode::from_bits(code_bits) {
                    Some(code) => code,
                    None if strict => {
                        return Err(RfnocError::Protocol(format!(
                            "unknown management opcode {code_bits} targeted at this endpoint"
                        )))
                    }
                    None => MgmtOpCode::Nop,
                };
                ops.push(MgmtOp {
                    op_code,
                    op_payload,
                });
                if pending == 0 {
                    break;
                }
            }
            hops.push(MgmtHop { ops });
        }

        Ok(MgmtPayload {
            proto_ver,
            chdr_width,
            hops,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mgmt_roundtrip() {
        let mut pyld = MgmtPayload::new(ChdrWidth::W64);
        pyld.add_hop(MgmtHop::new(vec![MgmtOp::nop()]));
        pyld.add_hop(MgmtHop::new(vec![MgmtOp::sel_dest(3), MgmtOp::nop()]));
        pyld.add_hop(MgmtHop::new(vec![
            MgmtOp::info_req(),
            MgmtOp::return_to_src(),
        ]));

        let mut out = [0u8; 128];
        let n = pyld.serialize(&mut out, Endianness::Big).expect("serialize");
        assert_eq!(n, pyld.wire_len());
        let back = MgmtPayload::deserialize(&out[..n], Endianness::Big).expect("deserialize");
        assert_eq!(pyld, back);
    }

    #[test]
    fn test_info_resp_roundtrip() {
        let info = NodeInfo {
            device_id: 2,
            node_type: MgmtNodeType::StreamEp,
            node_inst: 1,
            ext_info: SepCaps {
                has_ctrl: true,
                has_data: true,
                num_input_ports: 1,
                num_output_ports: 1,
                reports_status: true,
            }
            .to_bits(),
        };
        let op = MgmtOp::info_resp(&info);
        assert_eq!(op.node_info().expect("info"), info);

        let caps = SepCaps::from_bits(info.ext_info);
        assert!(caps.has_ctrl && caps.has_data && caps.reports_status);
        assert_eq!(caps.num_input_ports, 1);
    }

    #[test]
    fn test_cfg_ops_roundtrip() {
        let op = MgmtOp::cfg_wr(0x0004, 0xDEAD_BEEF);
        assert_eq!(op.cfg(), (0x0004, 0xDEAD_BEEF));
        let op = MgmtOp::cfg_rd_resp(0x0010, 42);
        assert_eq!(op.cfg(), (0x0010, 42));
    }

    #[test]
    fn test_unknown_op_lenient_vs_strict() {
        let mut pyld = MgmtPayload::new(ChdrWidth::W64);
        pyld.add_hop(MgmtHop::new(vec![MgmtOp::nop(), MgmtOp::nop()]));
        let mut out = [0u8; 64];
        let n = pyld.serialize(&mut out, Endianness::Big).expect("serialize");

        // Patch the first hop op's code to an unassigned value (0x7F).
        let mut word = u64::from_be_bytes(out[8..16].try_into().expect("word"));
        word = (word & !0xFF00) | (0x7F << 8);
        out[8..16].copy_from_slice(&word.to_be_bytes());

        let lenient = MgmtPayload::deserialize(&out[..n], Endianness::Big).expect("lenient");
        assert_eq!(lenient.hops[0].ops[0].op_code, MgmtOpCode::Nop);

        assert!(MgmtPayload::deserialize_strict(&out[..n], Endianness::Big).is_err());
    }

    #[test]
    fn test_empty_hop_rejected() {
        let mut pyld = MgmtPayload::new(ChdrWidth::W64);
        pyld.add_hop(MgmtHop::default());
        let mut out = [0u8; 64];
        assert!(pyld.serialize(&mut out, Endianness::Big).is_err());
    }
}
