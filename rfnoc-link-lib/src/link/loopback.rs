use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, Sender};

use super::{AdapterId, RecvLink, SendLink, Timeout};
use crate::buffer::{FrameBuff, FramePool};
use crate::error::{Result, RfnocError};

/// An in-process link pair for tests and simulations.
///
/// Frames released on one side's send path appear on the other side's
/// receive path, in order. Both sides draw from one shared pool so the
/// ownership invariant (`owned == pool_size - free`) holds across the
/// pair.
pub struct LoopbackLink {
    pool: Arc<FramePool>,
    tx: Sender<FrameBuff>,
    rx: Receiver<FrameBuff>,
    adapter_id: AdapterId,
    num_frames: usize,
    frame_size: usize,
}

impl LoopbackLink {
    /// Build a cross-connected pair. Each direction buffers up to
    /// `num_frames` in-flight frames.
    pub fn pair(num_frames: usize, frame_size: usize) -> (LoopbackLink, LoopbackLink) {
        let pool = Arc::new(FramePool::new(num_frames * 2, frame_size));
        let (a_tx, b_rx) = bounded(num_frames);
        let (b_tx, a_rx) = bounded(num_frames);
        (
            LoopbackLink {
                pool: Arc::clone(&pool),
                tx: a_tx,
                rx: a_rx,
                adapter_id: AdapterId(0),
                num_frames,
                frame_size,
            },
            LoopbackLink {
                pool,
                tx: b_tx,
                rx: b_rx,
                adapter_id: AdapterId(1),
                num_frames,
                frame_size,
            },
        )
    }
}

impl SendLink for LoopbackLink {
    fn num_send_frames(&self) -> usize {
        self.num_frames
    }

    fn send_frame_size(&self) -> usize {
        self.frame_size
    }

    fn adapter_id(&self) -> AdapterId {
        self.adapter_id
    }

    fn get_send_buff(&self, timeout: Timeout) -> Option<FrameBuff> {
        self.pool.acquire(timeout)
    }

    fn release_send_buff(&self, buff: FrameBuff) -> Result<()> {
        self.tx
            .send_timeout(buff, Duration::from_millis(100))
            .map_err(|_| RfnocError::Transport("loopback link tx ring stayed full".to_string()))
    }
}

impl RecvLink for LoopbackLink {
    fn num_recv_frames(&self) -> usize {
        self.num_frames
    }

    fn recv_frame_size(&self) -> usize {
        self.frame_size
    }

    fn adapter_id(&self) -> AdapterId {
        self.adapter_id
    }

    fn get_recv_buff(&self, timeout: Timeout) -> Option<FrameBuff> {
        match timeout {
            Timeout::Poll => self.rx.try_recv().ok(),
            Timeout::Bounded(d) => self.rx.recv_timeout(d).ok(),
            Timeout::Infinite => self.rx.recv().ok(),
        }
    }

    fn release_recv_buff(&self, buff: FrameBuff) {
        self.pool.release(buff);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_roundtrip_in_order() {
        let (a, b) = LoopbackLink::pair(4, 512);

        for i in 0..3u8 {
            let mut buff = a.get_send_buff(Timeout::Poll).expect("buff");
            buff.data_mut()[0] = i;
            buff.set_packet_size(1);
            a.release_send_buff(buff).expect("send");
        }

        for i in 0..3u8 {
            let got = b.get_recv_buff(Timeout::Poll).expect("frame");
            assert_eq!(got.data()[0], i);
            b.release_recv_buff(got);
        }
        assert!(b.get_recv_buff(Timeout::Poll).is_none());
    }

    #[test]
    fn test_loopback_timeout() {
        let (a, _b) = LoopbackLink::pair(2, 256);
        assert!(a
            .get_recv_buff(Timeout::Bounded(Duration::from_millis(10)))
            .is_none());
    }
}
