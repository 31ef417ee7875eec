use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::queue::ArrayQueue;

use super::wait::{ServiceQueue, WaitReason, WaitReq};
use super::{IoService, RecvClientParams, RecvFilter, RecvIoIf, SendClientParams, SendIoIf};
use crate::buffer::FrameBuff;
use crate::config::OffloadConfig;
use crate::error::{Result, RfnocError};
use crate::link::{wait_slice, RecvLink, SendLink, Timeout};

/// How long the worker parks when a loop iteration moved nothing.
const IDLE_PARK: Duration = Duration::from_micros(50);

/// Timeout for client attach/detach requests.
const ADMIN_TIMEOUT: Timeout = Timeout::Bounded(Duration::from_secs(1));

/// A client attachment, validated against the worker's slot table by a
/// generation counter so a recycled slot never honors a stale handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct ClientId {
    index: usize,
    gen: u32,
}

struct RecvRings {
    rx: ArrayQueue<FrameBuff>,
    release: ArrayQueue<FrameBuff>,
    disconnected: AtomicBool,
}

struct SendRings {
    tx: ArrayQueue<FrameBuff>,
    buffs: ArrayQueue<FrameBuff>,
    disconnected: AtomicBool,
}

enum Request {
    FlowOpen {
        params: RecvClientParams,
        rings: Arc<RecvRings>,
        resp: Arc<Mutex<Option<ClientId>>>,
    },
    FlowClose {
        id: ClientId,
    },
    Connect {
        num_send_frames: usize,
        rings: Arc<SendRings>,
        resp: Arc<Mutex<Option<ClientId>>>,
    },
    Disconnect {
        id: ClientId,
    },
    WaitRx {
        id: ClientId,
    },
    WaitTxBuff {
        id: ClientId,
    },
    Term,
}

/// Offload I/O service: a dedicated worker thread owns the link pair.
///
/// The worker loop services requests, bursts RX frames into per-client
/// rings by running their filters, drains per-client send rings in
/// round-robin, and recycles released buffers, in that order. Clients
/// never touch the links directly.
pub struct OffloadIoService {
    squeue: Arc<ServiceQueue<Request>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    recv_frame_size: usize,
    send_frame_size: usize,
}

impl OffloadIoService {
    pub fn new(
        recv_link: Arc<dyn RecvLink>,
        send_link: Arc<dyn SendLink>,
        cfg: &OffloadConfig,
    ) -> Result<Arc<Self>> {
        if !cfg.service_queue_depth.is_power_of_two() {
            return Err(RfnocError::Config(
                "service_queue_depth must be a power of two".to_string(),
            ));
        }
        let squeue = Arc::new(ServiceQueue::new(cfg.service_queue_depth));
        let recv_frame_size = recv_link.recv_frame_size();
        let send_frame_size = send_link.send_frame_size();

        let worker = {
            let squeue = Arc::clone(&squeue);
            let cfg = cfg.clone();
            std::thread::Builder::new()
                .name("chdr-io-worker".to_string())
                .spawn(move || {
                    if let Some(core) = cfg.cpu_core {
                        let pinned = core_affinity::get_core_ids()
                            .and_then(|ids| ids.into_iter().find(|c| c.id == core))
                            .map(core_affinity::set_for_current)
                            .unwrap_or(false);
                        if !pinned {
                            tracing::warn!(core, "could not pin I/O worker to requested core");
                        }
                    }
                    Worker {
                        recv_link,
                        send_link,
                        squeue,
                        recv_clients: Vec::new(),
                        send_clients: Vec::new(),
                        next_gen: 1,
                        cfg,
                    }
                    .run();
                })
                .map_err(|e| RfnocError::Transport(format!("failed to spawn I/O worker: {e}")))?
        };

        Ok(Arc::new(OffloadIoService {
            squeue,
            worker: Mutex::new(Some(worker)),
            recv_frame_size,
            send_frame_size,
        }))
    }
}

impl IoService for OffloadIoService {
    fn make_recv_client(&self, params: RecvClientParams) -> Result<Box<dyn RecvIoIf>> {
        let rings = Arc::new(RecvRings {
            rx: ArrayQueue::new(params.num_recv_frames.max(1)),
            release: ArrayQueue::new(2 * params.num_recv_frames.max(1)),
            disconnected: AtomicBool::new(false),
        });
        let resp = Arc::new(Mutex::new(None));
        let req = WaitReq::new(
            WaitReason::FlowOpen,
            Some(Request::FlowOpen {
                params,
                rings: Arc::clone(&rings),
                resp: Arc::clone(&resp),
            }),
        );
        if !self.squeue.submit(&req, ADMIN_TIMEOUT) {
            return Err(RfnocError::Timeout(
                "I/O worker did not accept the receive flow".to_string(),
            ));
        }
        let id = resp
            .lock()
            .expect("connect resp poisoned")
            .take()
            .ok_or_else(|| RfnocError::Transport("I/O worker rejected the flow".to_string()))?;
        Ok(Box::new(OffloadRecvIo {
            id,
            rings,
            squeue: Arc::clone(&self.squeue),
            recv_frame_size: self.recv_frame_size,
        }))
    }

    fn make_send_client(&self, params: SendClientParams) -> Result<Box<dyn SendIoIf>> {
        let rings = Arc::new(SendRings {
            tx: ArrayQueue::new(params.num_send_frames.max(1)),
            buffs: ArrayQueue::new(params.num_send_frames.max(1)),
            disconnected: AtomicBool::new(false),
        });
        let resp = Arc::new(Mutex::new(None));
        let req = WaitReq::new(
            WaitReason::Connect,
            Some(Request::Connect {
                num_send_frames: params.num_send_frames.max(1),
                rings: Arc::clone(&rings),
                resp: Arc::clone(&resp),
            }),
        );
        if !self.squeue.submit(&req, ADMIN_TIMEOUT) {
            return Err(RfnocError::Timeout(
                "I/O worker did not accept the send client".to_string(),
            ));
        }
        let id = resp
            .lock()
            .expect("connect resp poisoned")
            .take()
            .ok_or_else(|| RfnocError::Transport("I/O worker rejected the client".to_string()))?;
        Ok(Box::new(OffloadSendIo {
            id,
            rings,
            squeue: Arc::clone(&self.squeue),
            send_frame_size: self.send_frame_size,
        }))
    }
}

impl Drop for OffloadIoService {
    fn drop(&mut self) {
        let req = WaitReq::new(WaitReason::Term, Some(Request::Term));
        self.squeue.submit(&req, ADMIN_TIMEOUT);
        if let Some(handle) = self.worker.lock().expect("worker handle poisoned").take() {
            if handle.join().is_err() {
                tracing::error!("I/O worker panicked");
            }
        }
    }
}

struct OffloadRecvIo {
    id: ClientId,
    rings: Arc<RecvRings>,
    squeue: Arc<ServiceQueue<Request>>,
    recv_frame_size: usize,
}

impl RecvIoIf for OffloadRecvIo {
    fn get_recv_buff(&mut self, timeout: Timeout) -> Option<FrameBuff> {
        let deadline = timeout.deadline();
        loop {
            if let Some(buff) = self.rings.rx.pop() {
                return Some(buff);
            }
            if self.rings.disconnected.load(Ordering::Acquire) {
                return None;
            }
            if timeout == Timeout::Poll {
                return None;
            }
            let Some(slice) = wait_slice(deadline) else {
                // Deadline passed; one final opportunistic check.
                return self.rings.rx.pop();
            };
            let req = WaitReq::new(WaitReason::Rx, Some(Request::WaitRx { id: self.id }));
            self.squeue.submit(&req, Timeout::Bounded(slice));
        }
    }

    fn release_recv_buff(&mut self, buff: FrameBuff) {
        if self.rings.release.push(buff).is_err() {
            tracing::error!("receive release ring full; frame leaked from the pool");
        }
    }

    fn recv_frame_size(&self) -> usize {
        self.recv_frame_size
    }
}

impl Drop for OffloadRecvIo {
    fn drop(&mut self) {
        let req = WaitReq::new(
            WaitReason::FlowClose,
            Some(Request::FlowClose { id: self.id }),
        );
        self.squeue.submit(&req, ADMIN_TIMEOUT);
    }
}

struct OffloadSendIo {
    id: ClientId,
    rings: Arc<SendRings>,
    squeue: Arc<ServiceQueue<Request>>,
    send_frame_size: usize,
}

impl SendIoIf for OffloadSendIo {
    fn get_send_buff(&mut self, timeout: Timeout) -> Option<FrameBuff> {
        let deadline = timeout.deadline();
        loop {
            if let Some(buff) = self.rings.buffs.pop() {
                return Some(buff);
            }
            if self.rings.disconnected.load(Ordering::Acquire) {
                return None;
            }
            if timeout == Timeout::Poll {
                return None;
            }
            let Some(slice) = wait_slice(deadline) else {
                return self.rings.buffs.pop();
            };
            let req = WaitReq::new(
                WaitReason::TxBuff,
                Some(Request::WaitTxBuff { id: self.id }),
            );
            self.squeue.submit(&req, Timeout::Bounded(slice));
        }
    }

    fn release_send_buff(&mut self, buff: FrameBuff) -> Result<()> {
        if self.rings.disconnected.load(Ordering::Acquire) {
            return Err(RfnocError::Transport(
                "send client disconnected by the I/O service".to_string(),
            ));
        }
        let was_idle = self.rings.tx.is_empty();
        self.rings.tx.push(buff).map_err(|_| {
            RfnocError::Resource("send ring full; frame count exceeds client credit".to_string())
        })?;
        if was_idle {
            // Nudge the worker out of its idle park.
            let req = WaitReq::new(WaitReason::Simple, None);
            self.squeue.submit(&req, Timeout::Poll);
        }
        Ok(())
    }

    fn send_frame_size(&self) -> usize {
        self.send_frame_size
    }
}

impl Drop for OffloadSendIo {
    fn drop(&mut self) {
        let req = WaitReq::new(
            WaitReason::Disconnect,
            Some(Request::Disconnect { id: self.id }),
        );
        self.squeue.submit(&req, ADMIN_TIMEOUT);
    }
}

struct RecvSlot {
    gen: u32,
    rings: Arc<RecvRings>,
    filter: RecvFilter,
    pending_wait: Option<Arc<WaitReq<Request>>>,
}

struct SendSlot {
    gen: u32,
    rings: Arc<SendRings>,
    /// Frames this client may have in circulation at once.
    credit: usize,
    /// Frames currently granted: in the free ring, in the client's
    /// hands, or queued for transmission.
    outstanding: usize,
    pending_wait: Option<Arc<WaitReq<Request>>>,
}

struct Worker {
    recv_link: Arc<dyn RecvLink>,
    send_link: Arc<dyn SendLink>,
    squeue: Arc<ServiceQueue<Request>>,
    recv_clients: Vec<Option<RecvSlot>>,
    send_clients: Vec<Option<SendSlot>>,
    next_gen: u32,
    cfg: OffloadConfig,
}

impl Worker {
    fn run(mut self) {
        tracing::debug!("I/O worker up");
        loop {
            let mut progressed = false;

            if self.service_requests() {
                // Term consumed: drain and leave.
                break;
            }
            progressed |= self.burst_rx();
            progressed |= self.drain_tx();
            progressed |= self.drain_releases();

            if !progressed {
                std::thread::sleep(IDLE_PARK);
            }
        }
        self.shutdown();
        tracing::debug!("I/O worker down");
    }

    /// Returns true when a Term request was seen.
    fn service_requests(&mut self) -> bool {
        while let Some(req) = self.squeue.pop() {
            let payload = req.take_payload();
            match payload {
                Some(Request::FlowOpen {
                    params,
                    rings,
                    resp,
                }) => {
                    let id = self.install_recv(params.filter, rings);
                    *resp.lock().expect("resp poisoned") = Some(id);
                    self.squeue.complete(&req, 0);
                }
                Some(Request::FlowClose { id }) => {
                    self.remove_recv(id);
                    self.squeue.complete(&req, 0);
                }
                Some(Request::Connect {
                    num_send_frames,
                    rings,
                    resp,
                }) => {
                    let id = self.install_send(num_send_frames, rings);
                    *resp.lock().expect("resp poisoned") = Some(id);
                    self.squeue.complete(&req, 0);
                }
                Some(Request::Disconnect { id }) => {
                    self.remove_send(id);
                    self.squeue.complete(&req, 0);
                }
                Some(Request::WaitRx { id }) => {
                    let verdict = match self.recv_slot(id) {
                        Some(slot) if !slot.rings.rx.is_empty() => Some(0),
                        Some(slot) => {
                            slot.pending_wait = Some(Arc::clone(&req));
                            None
                        }
                        None => Some(-1),
                    };
                    if let Some(rv) = verdict {
                        self.squeue.complete(&req, rv);
                    }
                }
                Some(Request::WaitTxBuff { id }) => {
                    let verdict = match self.send_slot(id) {
                        Some(slot) if !slot.rings.buffs.is_empty() => Some(0),
                        Some(slot) => {
                            slot.pending_wait = Some(Arc::clone(&req));
                            None
                        }
                        None => Some(-1),
                    };
                    if let Some(rv) = verdict {
                        self.squeue.complete(&req, rv);
                    }
                }
                Some(Request::Term) => {
                    self.squeue.complete(&req, 0);
                    return true;
                }
                None => {
                    // Payload already taken: stale duplicate; wake and move on.
                    self.squeue.complete(&req, 0);
                }
            }
        }
        false
    }

    fn alloc_gen(&mut self) -> u32 {
        let gen = self.next_gen;
        self.next_gen = self.next_gen.wrapping_add(1).max(1);
        gen
    }

    fn install_recv(&mut self, filter: RecvFilter, rings: Arc<RecvRings>) -> ClientId {
        let gen = self.alloc_gen();
        let slot = RecvSlot {
            gen,
            rings,
            filter,
            pending_wait: None,
        };
        let index = match self.recv_clients.iter().position(Option::is_none) {
            Some(i) => {
                self.recv_clients[i] = Some(slot);
                i
            }
            None => {
                self.recv_clients.push(Some(slot));
                self.recv_clients.len() - 1
            }
        };
        ClientId { index, gen }
    }

    fn install_send(&mut self, num_send_frames: usize, rings: Arc<SendRings>) -> ClientId {
        let gen = self.alloc_gen();
        // Preload the client's free-buffer ring up to its credit.
        let mut outstanding = 0;
        for _ in 0..num_send_frames {
            match self.send_link.get_send_buff(Timeout::Poll) {
                Some(buff) => {
                    if rings.buffs.push(buff).is_err() {
                        break;
                    }
                    outstanding += 1;
                }
                None => break,
            }
        }
        if outstanding < num_send_frames {
            tracing::debug!(
                granted = outstanding,
                requested = num_send_frames,
                "send credit clipped by link pool"
            );
        }
        let slot = SendSlot {
            gen,
            rings,
            credit: num_send_frames,
            outstanding,
            pending_wait: None,
        };
        let index = match self.send_clients.iter().position(Option::is_none) {
            Some(i) => {
                self.send_clients[i] = Some(slot);
                i
            }
            None => {
                self.send_clients.push(Some(slot));
                self.send_clients.len() - 1
            }
        };
        ClientId { index, gen }
    }

    fn recv_slot(&mut self, id: ClientId) -> Option<&mut RecvSlot> {
        self.recv_clients
            .get_mut(id.index)?
            .as_mut()
            .filter(|s| s.gen == id.gen)
    }

    fn send_slot(&mut self, id: ClientId) -> Option<&mut SendSlot> {
        self.send_clients
            .get_mut(id.index)?
            .as_mut()
            .filter(|s| s.gen == id.gen)
    }

    fn remove_recv(&mut self, id: ClientId) {
        if let Some(slot) = self.recv_clients.get_mut(id.index) {
            if slot.as_ref().is_some_and(|s| s.gen == id.gen) {
                let slot = slot.take().expect("checked above");
                slot.rings.disconnected.store(true, Ordering::Release);
                while let Some(buff) = slot.rings.rx.pop() {
                    self.recv_link.release_recv_buff(buff);
                }
                while let Some(buff) = slot.rings.release.pop() {
                    self.recv_link.release_recv_buff(buff);
                }
                if let Some(w) = slot.pending_wait {
                    self.squeue.complete(&w, -1);
                }
            }
        }
    }

    fn remove_send(&mut self, id: ClientId) {
        if let Some(slot) = self.send_clients.get_mut(id.index) {
            if slot.as_ref().is_some_and(|s| s.gen == id.gen) {
                let slot = slot.take().expect("checked above");
                slot.rings.disconnected.store(true, Ordering::Release);
                // Flush anything still queued, preserving order.
                while let Some(buff) = slot.rings.tx.pop() {
                    if let Err(e) = self.send_link.release_send_buff(buff) {
                        tracing::warn!("flush on disconnect failed: {e}");
                        break;
                    }
                }
                if let Some(w) = slot.pending_wait {
                    self.squeue.complete(&w, -1);
                }
            }
        }
    }

    /// Pull up to one burst from the link and classify each frame.
    fn burst_rx(&mut self) -> bool {
        let mut progressed = false;
        for _ in 0..self.cfg.rx_burst_size {
            let Some(frame) = self.recv_link.get_recv_buff(Timeout::Poll) else {
                break;
            };
            progressed = true;

            let target = self
                .recv_clients
                .iter_mut()
                .enumerate()
                .find_map(|(i, slot)| {
                    let slot = slot.as_mut()?;
                    (slot.filter)(frame.data()).then_some(i)
                });

            match target {
                Some(i) => {
                    let slot = self.recv_clients[i].as_mut().expect("matched slot");
                    match slot.rings.rx.push(frame) {
                        Ok(()) => {
                            if let Some(w) = slot.pending_wait.take() {
                                self.squeue.complete(&w, 0);
                            }
                        }
                        Err(frame) => {
                            tracing::warn!(client = i, "client rx ring full; frame dropped");
                            self.recv_link.release_recv_buff(frame);
                        }
                    }
                }
                None => {
                    tracing::trace!("frame matched no client; returning to link");
                    self.recv_link.release_recv_buff(frame);
                }
            }
        }
        progressed
    }

    /// Drain each client's send ring round-robin, then refill its
    /// free-buffer ring up to the credit.
    fn drain_tx(&mut self) -> bool {
        let mut progressed = false;
        let mut fatal = false;
        for i in 0..self.send_clients.len() {
            let Some(slot) = self.send_clients[i].as_mut() else {
                continue;
            };
            for _ in 0..self.cfg.tx_drain_size {
                let Some(buff) = slot.rings.tx.pop() else { break };
                progressed = true;
                // The sent frame recycles into the link pool, freeing a
                // grant slot for this client.
                slot.outstanding = slot.outstanding.saturating_sub(1);
                if let Err(e) = self.send_link.release_send_buff(buff) {
                    tracing::error!("link send failed: {e}");
                    fatal = true;
                    break;
                }
            }
            // Replenish up to the credit.
            while slot.outstanding < slot.credit {
                let Some(buff) = self.send_link.get_send_buff(Timeout::Poll) else {
                    break;
                };
                if slot.rings.buffs.push(buff).is_err() {
                    // Ring capacity equals the credit, so this only
                    // trips if the accounting above is broken.
                    tracing::error!("free-buffer ring rejected a frame");
                    break;
                }
                slot.outstanding += 1;
                if let Some(w) = slot.pending_wait.take() {
                    self.squeue.complete(&w, 0);
                }
            }
            if fatal {
                break;
            }
        }
        if fatal {
            self.disconnect_all();
        }
        progressed
    }

    fn drain_releases(&mut self) -> bool {
        let mut progressed = false;
        for slot in self.recv_clients.iter().flatten() {
            while let Some(buff) = slot.rings.release.pop() {
                self.recv_link.release_recv_buff(buff);
                progressed = true;
            }
        }
        progressed
    }

    /// A fatal link error: mark every client disconnected so their next
    /// operation fails fast.
    fn disconnect_all(&mut self) {
        tracing::error!("fatal link error; disconnecting all I/O clients");
        for slot in self.recv_clients.iter_mut().flatten() {
            slot.rings.disconnected.store(true, Ordering::Release);
            if let Some(w) = slot.pending_wait.take() {
                self.squeue.complete(&w, -1);
            }
        }
        for slot in self.send_clients.iter_mut().flatten() {
            slot.rings.disconnected.store(true, Ordering::Release);
            if let Some(w) = slot.pending_wait.take() {
                self.squeue.complete(&w, -1);
            }
        }
    }

    fn shutdown(&mut self) {
        // Flush queued TX, recycle RX, wake every waiter.
        let ids: Vec<ClientId> = self
            .send_clients
            .iter()
            .enumerate()
            .filter_map(|(index, s)| s.as_ref().map(|s| ClientId { index, gen: s.gen }))
            .collect();
        for id in ids {
            self.remove_send(id);
        }
        let ids: Vec<ClientId> = self
            .recv_clients
            .iter()
            .enumerate()
            .filter_map(|(index, s)| s.as_ref().map(|s| ClientId { index, gen: s.gen }))
            .collect();
        for id in ids {
            self.remove_recv(id);
        }
        // Complete any straggler requests so submitters do not block.
        while let Some(req) = self.squeue.pop() {
            let _ = req.take_payload();
            self.squeue.complete(&req, -1);
        }
    }
}
