//! Frame buffers and the fixed-capacity pools that own them.
//!
//! A [`FrameBuff`] has exactly one owner at any instant; ownership moves
//! pool → consumer → link → pool and is enforced by Rust moves. Pools
//! never allocate after construction, so the hot path stays free of
//! per-packet allocation.

use std::sync::{Condvar, Mutex};

use crossbeam::queue::ArrayQueue;

use crate::link::{wait_slice, Timeout};

/// A fixed-size packet buffer borrowed from a [`FramePool`].
///
/// `header_offset` reserves space in front of the packet for
/// transport-level framing (e.g. Ethernet/IP/UDP headers on the DMA fast
/// path); `packet_size` is the length of the active packet region.
#[derive(Debug)]
pub struct FrameBuff {
    mem: Box<[u8]>,
    packet_size: usize,
    header_offset: usize,
}

impl FrameBuff {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        FrameBuff {
            mem: vec![0u8; capacity].into_boxed_slice(),
            packet_size: 0,
            header_offset: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.mem.len()
    }

    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    pub fn set_packet_size(&mut self, size: usize) {
        assert!(
            self.header_offset + size <= self.mem.len(),
            "packet of {} bytes at offset {} exceeds the {}-byte frame",
            size,
            self.header_offset,
            self.mem.len()
        );
        self.packet_size = size;
    }

    pub fn header_offset(&self) -> usize {
        self.header_offset
    }

    pub fn set_header_offset(&mut self, offset: usize) {
        assert!(offset <= self.mem.len());
        self.header_offset = offset;
    }

    /// The active packet region.
    pub fn data(&self) -> &[u8] {
        &self.mem[self.header_offset..self.header_offset + self.packet_size]
    }

    /// The whole writable region starting at the header offset.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.mem[self.header_offset..]
    }

    /// The raw frame including any reserved framing prefix.
    pub fn frame(&self) -> &[u8] {
        &self.mem
    }

    pub fn frame_mut(&mut self) -> &mut [u8] {
        &mut self.mem
    }

    /// Clear packet metadata before the buffer re-enters a pool.
    fn reset(&mut self) {
        self.packet_size = 0;
        self.header_offset = 0;
    }
}

/// A fixed-capacity pool of equally sized frames.
///
/// `try_acquire` is lock-free for the hot path; `acquire` parks on a
/// condition variable until a frame is released or the timeout expires.
#[derive(Debug)]
pub struct FramePool {
    frames: ArrayQueue<FrameBuff>,
    frame_size: usize,
    lock: Mutex<()>,
    available: Condvar,
}

impl FramePool {
    pub fn new(num_frames: usize, frame_size: usize) -> Self {
        let frames = ArrayQueue::new(num_frames);
        for _ in 0..num_frames {
            let res = frames.push(FrameBuff::with_capacity(frame_size));
            debug_assert!(res.is_ok());
        }
        FramePool {
            frames,
            frame_size,
            lock: Mutex::new(()),
            available: Condvar::new(),
        }
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn num_frames(&self) -> usize {
        self.frames.capacity()
    }

    /// Frames currently free in the pool.
    pub fn available(&self) -> usize {
        self.frames.len()
    }

    /// Non-blocking acquisition; `None` when the pool is empty.
    pub fn try_acquire(&self) -> Option<FrameBuff> {
        self.frames.pop()
    }

    /// Acquire a frame, waiting for a release when the pool is empty.
    pub fn acquire(&self, timeout: Timeout) -> Option<FrameBuff> {
        if let Some(buff) = self.frames.pop() {
            return Some(buff);
        }
        if timeout == Timeout::Poll {
            return None;
        }

        let deadline = timeout.deadline();
        let mut guard = self.lock.lock().expect("frame pool lock poisoned");
        loop {
            if let Some(buff) = self.frames.pop() {
                return Some(buff);
            }
            let Some(wait) = wait_slice(deadline) else {
                return None;
            };
            let (g, _res) = self
                .available
                .wait_timeout(guard, wait)
                .expect("frame pool lock poisoned");
            guard = g;
        }
    }

    /// Return a frame to the pool, cleared of prior packet metadata.
    pub fn release(&self, mut buff: FrameBuff) {
        buff.reset();
        if self.frames.push(buff).is_err() {
            // More frames returned than the pool was built with; the
            // extra one is dropped rather than grown into the pool.
            tracing::warn!("frame pool overflow on release");
        }
        let _guard = self.lock.lock().expect("frame pool lock poisoned");
        self.available.notify_one();
    }
}
