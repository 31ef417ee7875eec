#![forbid(unsafe_code)]

//! Host-side RFNoC CHDR transport core.
//!
//! This crate carries sample streams, register transactions, and
//! management traffic between a host and FPGA stream endpoints over
//! packet transports. The layers, bottom up: frame-buffer pools
//! ([`buffer`]), raw links ([`link`]), the CHDR packet codec ([`chdr`]),
//! per-link I/O services ([`io_service`]), control endpoints ([`ctrl`]),
//! the management portal and topology discovery ([`mgmt`]),
//! flow-controlled data transports ([`stream`]), and the link stream
//! manager that composes them ([`graph`]).

pub mod buffer;
pub mod chdr;
pub mod config;
pub mod ctrl;
pub mod error;
pub mod graph;
pub mod io_service;
pub mod link;
pub mod logging;
pub mod mgmt;
pub mod stream;

pub use buffer::{FrameBuff, FramePool};
pub use chdr::{ChdrCodec, ChdrHeader, ChdrWidth, Endianness, PacketType};
pub use config::{load_from_path, CoreConfig, LinkConfig, StreamConfig};
pub use ctrl::CtrlEndpoint;
pub use error::{Result, RfnocError};
pub use graph::LinkStreamManager;
pub use link::{AdapterId, Link, RecvLink, SendLink, Timeout};
pub use mgmt::{Epid, EpidAllocator, MgmtPortal, SepAddr};
pub use stream::{ChdrRxStream, ChdrTxStream, StreamBuffParams, StreamEvent};
