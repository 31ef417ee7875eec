use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use super::{IoService, RecvClientParams, RecvFilter, RecvIoIf, SendClientParams, SendIoIf};
use crate::buffer::FrameBuff;
use crate::error::Result;
use crate::link::{wait_slice, RecvLink, SendLink, Timeout};

/// Single-threaded I/O service driven by its clients.
///
/// There is no background state: whichever client calls
/// `get_recv_buff` pulls frames off the link and routes them, queueing
/// frames that belong to other clients. Appropriate when exactly one
/// user thread services a link pair; with several threads the mutex
/// serializes them correctly but unfairly.
pub struct InlineIoService {
    recv_link: Arc<dyn RecvLink>,
    send_link: Arc<dyn SendLink>,
    mux: Arc<Mutex<RecvMux>>,
}

struct RecvMux {
    clients: Vec<Option<MuxSlot>>,
}

struct MuxSlot {
    filter: RecvFilter,
    queue: VecDeque<FrameBuff>,
    max_queue: usize,
}

impl InlineIoService {
    pub fn new(recv_link: Arc<dyn RecvLink>, send_link: Arc<dyn SendLink>) -> Arc<Self> {
        Arc::new(InlineIoService {
            recv_link,
            send_link,
            mux: Arc::new(Mutex::new(RecvMux {
                clients: Vec::new(),
            })),
        })
    }
}

impl IoService for InlineIoService {
    fn make_recv_client(&self, params: RecvClientParams) -> Result<Box<dyn RecvIoIf>> {
        let mut mux = self.mux.lock().expect("inline mux poisoned");
        let slot = MuxSlot {
            filter: params.filter,
            queue: VecDeque::with_capacity(params.num_recv_frames),
            max_queue: params.num_recv_frames,
        };
        let idx = match mux.clients.iter().position(Option::is_none) {
            Some(i) => {
                mux.clients[i] = Some(slot);
                i
            }
            None => {
                mux.clients.push(Some(slot));
                mux.clients.len() - 1
            }
        };
        Ok(Box::new(InlineRecvIo {
            mux: Arc::clone(&self.mux),
            link: Arc::clone(&self.recv_link),
            idx,
        }))
    }

    fn make_send_client(&self, _params: SendClientParams) -> Result<Box<dyn SendIoIf>> {
        Ok(Box::new(InlineSendIo {
            link: Arc::clone(&self.send_link),
        }))
    }
}

struct InlineRecvIo {
    mux: Arc<Mutex<RecvMux>>,
    link: Arc<dyn RecvLink>,
    idx: usize,
}

impl RecvIoIf for InlineRecvIo {
    fn get_recv_buff(&mut self, timeout: Timeout) -> Option<FrameBuff> {
        let deadline = timeout.deadline();
        loop {
            {
                let mut mux = self.mux.lock().expect("inline mux poisoned");
                if let Some(slot) = mux.clients[self.idx].as_mut() {
                    if let Some(buff) = slot.queue.pop_front() {
                        return Some(buff);
                    }
                }
            }

            let link_timeout = match timeout {
                Timeout::Poll => Timeout::Poll,
                _ => Timeout::Bounded(wait_slice(deadline)?),
            };
            let Some(frame) = self.link.get_recv_buff(link_timeout) else {
                if timeout == Timeout::Poll {
                    return None;
                }
                continue;
            };

            // Route the frame: first matching client in registration
            // order takes it.
            let mut mux = self.mux.lock().expect("inline mux poisoned");
            let target = mux.clients.iter_mut().enumerate().find_map(|(i, slot)| {
                let slot = slot.as_mut()?;
                (slot.filter)(frame.data()).then_some(i)
            });
            match target {
                Some(i) if i == self.idx => return Some(frame),
                Some(i) => {
                    let slot = mux.clients[i].as_mut().expect("matched slot");
                    if slot.queue.len() >= slot.max_queue {
                        tracing::warn!(client = i, "inline client queue full; frame dropped");
                        drop(mux);
                        self.link.release_recv_buff(frame);
                    } else {
                        slot.queue.push_back(frame);
                    }
                }
                None => {
                    tracing::trace!("frame matched no client; returning to link");
                    drop(mux);
                    self.link.release_recv_buff(frame);
                }
            }
        }
    }

    fn release_recv_buff(&mut self, buff: FrameBuff) {
        self.link.release_recv_buff(buff);
    }

    fn recv_frame_size(&self) -> usize {
        self.link.recv_frame_size()
    }
}

impl Drop for InlineRecvIo {
    fn drop(&mut self) {
        let mut mux = self.mux.lock().expect("inline mux poisoned");
        if let Some(slot) = mux.clients[self.idx].take() {
            for buff in slot.queue {
                self.link.release_recv_buff(buff);
            }
        }
    }
}

struct InlineSendIo {
    link: Arc<dyn SendLink>,
}

impl SendIoIf for InlineSendIo {
    fn get_send_buff(&mut self, timeout: Timeout) -> Option<FrameBuff> {
        self.link.get_send_buff(timeout)
    }

    fn release_send_buff(&mut self, buff: FrameBuff) -> Result<()> {
        self.link.release_send_buff(buff)
    }

    fn send_frame_size(&self) -> usize {
        self.link.send_frame_size()
    }
}
