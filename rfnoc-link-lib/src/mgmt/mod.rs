//! Management plane: endpoint identity, topology discovery, and route
//! programming.

mod epid;
mod portal;
mod topology;

pub use epid::EpidAllocator;
pub use portal::{
    MgmtPortal, SepInfo, OSTRM_CMD_START, OSTRM_CMD_STOP, OSTRM_STATUS_CONFIGURED,
    REG_EPID_SELF, REG_ISTRM_CTRL_STATUS, REG_OSTRM_CTRL_STATUS, REG_OSTRM_DST_EPID,
    REG_OSTRM_FC_FREQ_BYTES_HI, REG_OSTRM_FC_FREQ_BYTES_LO, REG_OSTRM_FC_FREQ_PKTS,
    REG_RESET_AND_FLUSH, RESET_CTRL, RESET_DATA,
};
pub use topology::{EdgeKind, NodeIndex, PathStep, SepAddr, TopoEdge, TopoGraph, TopoNode, TopoNodeType};

/// A 16-bit stream endpoint identifier. Zero is reserved for
/// *unassigned*, `0xFFFF` for broadcast-style use; neither is ever
/// allocated.
pub type Epid = u16;

/// The EPID meaning "not yet assigned".
pub const EPID_UNASSIGNED: Epid = 0;
