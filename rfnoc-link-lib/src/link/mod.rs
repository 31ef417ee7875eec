//! Raw framed-byte links.
//!
//! A link moves whole frames over one physical transport. The three
//! variants ([`UdpLink`], [`DmaLink`], and the test-only
//! [`LoopbackLink`]) share the capability set of [`SendLink`] and
//! [`RecvLink`]; callers never see past those traits.

mod dma;
mod loopback;
mod udp;

pub use dma::{dma_port_pair, DmaLink, DmaLinkParams, DmaPort, MacAddr};
pub use loopback::LoopbackLink;
pub use udp::UdpLink;

use std::time::{Duration, Instant};

use crate::buffer::FrameBuff;
use crate::error::Result;

/// Identifies the host-side transport adapter a link runs on. Used for
/// transport-level deduplication and affinity routing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AdapterId(pub u16);

/// How long a blocking call may wait.
///
/// Mirrors the millisecond convention of the wire-level API: zero means
/// try once, negative means wait indefinitely.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Timeout {
    /// Try once and return immediately.
    Poll,
    /// Wait up to the given duration.
    Bounded(Duration),
    /// Wait until the operation completes.
    Infinite,
}

impl Timeout {
    pub fn from_millis(ms: i64) -> Self {
        match ms {
            0 => Timeout::Poll,
            t if t < 0 => Timeout::Infinite,
            t => Timeout::Bounded(Duration::from_millis(t as u64)),
        }
    }

    /// Absolute deadline; `None` for `Poll` and `Infinite`.
    pub(crate) fn deadline(self) -> Option<Instant> {
        match self {
            Timeout::Bounded(d) => Some(Instant::now() + d),
            _ => None,
        }
    }
}

/// Duration to park for in a wait loop bounded by `deadline`.
///
/// Returns `None` once the deadline has passed. A `None` deadline means
/// wait indefinitely; the returned slice keeps such waits re-checking
/// their condition periodically.
pub(crate) fn wait_slice(deadline: Option<Instant>) -> Option<Duration> {
    const INFINITE_SLICE: Duration = Duration::from_millis(100);
    match deadline {
        None => Some(INFINITE_SLICE),
        Some(d) => match d.checked_duration_since(Instant::now()) {
            Some(left) => Some(left.min(INFINITE_SLICE)),
            None => None,
        },
    }
}

/// Send half of a link.
pub trait SendLink: Send + Sync {
    /// Number of frames the send side can hold in flight.
    fn num_send_frames(&self) -> usize;

    /// Usable bytes in one send frame.
    fn send_frame_size(&self) -> usize;

    fn adapter_id(&self) -> AdapterId;

    /// Acquire an empty frame to fill. `None` on timeout is normal and
    /// not an error.
    fn get_send_buff(&self, timeout: Timeout) -> Option<FrameBuff>;

    /// Transmit the frame's active region and recycle the buffer.
    ///
    /// Transient kernel-side refusals are retried a bounded number of
    /// times; persistent failure surfaces as a `Transport` error.
    fn release_send_buff(&self, buff: FrameBuff) -> Result<()>;
}

/// Receive half of a link.
pub trait RecvLink: Send + Sync {
    /// Number of frames the receive side can hold before the consumer
    /// must release some.
    fn num_recv_frames(&self) -> usize;

    /// Usable bytes in one receive frame.
    fn recv_frame_size(&self) -> usize;

    fn adapter_id(&self) -> AdapterId;

    /// Receive one frame. `None` on timeout is normal and not an error.
    fn get_recv_buff(&self, timeout: Timeout) -> Option<FrameBuff>;

    /// Return a received frame to the link.
    fn release_recv_buff(&self, buff: FrameBuff);
}

/// A bidirectional link.
pub trait Link: SendLink + RecvLink {}

impl<T: SendLink + RecvLink> Link for T {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_from_millis() {
        assert_eq!(Timeout::from_millis(0), Timeout::Poll);
        assert_eq!(Timeout::from_millis(-1), Timeout::Infinite);
        assert_eq!(
            Timeout::from_millis(250),
            Timeout::Bounded(Duration::from_millis(250))
        );
    }

    #[test]
    fn test_wait_slice_expiry() {
        let past = Some(Instant::now() - Duration::from_millis(1));
        assert!(wait_slice(past).is_none());

        let future = Some(Instant::now() + Duration::from_secs(10));
        assert!(wait_slice(future).is_some());

        // Infinite waits still get a finite re-check slice.
        assert!(wait_slice(None).is_some());
    }
}
