//! Per-link I/O services.
//!
//! An I/O service owns a link pair and multiplexes it between clients:
//! received frames are routed by per-client predicates, transmissions
//! are serialized per client. Two implementations share the interface:
//! [`InlineIoService`] runs in the caller's thread and suits a single
//! user thread per link; [`OffloadIoService`] dedicates a worker thread
//! that clients reach through lock-free rings and condvar-backed wait
//! requests.

mod inline;
mod offload;
mod wait;

pub use inline::InlineIoService;
pub use offload::OffloadIoService;

use crate::buffer::FrameBuff;
use crate::error::Result;
use crate::link::Timeout;

/// Decides whether a received frame belongs to a client. Runs on the
/// I/O thread for every inbound frame, so it should only inspect the
/// header words it needs.
pub type RecvFilter = Box<dyn FnMut(&[u8]) -> bool + Send>;

pub struct RecvClientParams {
    /// Frames the service may queue for this client before dropping.
    pub num_recv_frames: usize,
    pub filter: RecvFilter,
}

pub struct SendClientParams {
    /// Frames this client may hold in flight.
    pub num_send_frames: usize,
}

/// Receive half of a client attachment.
pub trait RecvIoIf: Send {
    /// Next frame routed to this client. `None` on timeout, and
    /// immediately once the service has marked the client disconnected.
    fn get_recv_buff(&mut self, timeout: Timeout) -> Option<FrameBuff>;

    fn release_recv_buff(&mut self, buff: FrameBuff);

    fn recv_frame_size(&self) -> usize;
}

/// Send half of a client attachment.
pub trait SendIoIf: Send {
    /// An empty frame to fill. `None` on timeout.
    fn get_send_buff(&mut self, timeout: Timeout) -> Option<FrameBuff>;

    /// Queue the frame for transmission. Frames from one client go out
    /// in release order.
    fn release_send_buff(&mut self, buff: FrameBuff) -> Result<()>;

    fn send_frame_size(&self) -> usize;
}

/// Factory for client attachments on one link pair.
pub trait IoService: Send + Sync {
    fn make_recv_client(&self, params: RecvClientParams) -> Result<Box<dyn RecvIoIf>>;
    fn make_send_client(&self, params: SendClientParams) -> Result<Box<dyn SendIoIf>>;
}
