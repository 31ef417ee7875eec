//! Wait requests and the service queue that funnels them to a worker.
//!
//! A client submits a [`WaitReq`] and parks on its condition variable;
//! the worker pops requests off the lock-free ring, actions them, and
//! completes them to wake the submitter. Cancellation is timed waits
//! only: a request whose submitter has timed out may still be completed
//! later, which is harmless because completion is sticky.

use std::sync::{Arc, Condvar, Mutex};

use crossbeam::queue::ArrayQueue;

use crate::link::{wait_slice, Timeout};

/// Why a client is waiting (and what the worker should do about it).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WaitReason {
    /// Wake immediately; used to nudge the worker.
    Simple,
    /// Wake when a frame lands in the client's receive ring.
    Rx,
    /// Wake when a send buffer becomes available.
    TxBuff,
    /// Attach a receive flow.
    FlowOpen,
    /// Detach a receive flow.
    FlowClose,
    /// Attach a send client.
    Connect,
    /// Detach a send client.
    Disconnect,
    /// Stop the worker.
    Term,
}

struct WaitState {
    complete: bool,
    retval: i32,
}

/// One request to the I/O worker, with a payload of type `T`.
pub(crate) struct WaitReq<T> {
    pub(crate) reason: WaitReason,
    /// Request data, consumed by the worker; response data may be
    /// written back before completion.
    pub(crate) payload: Mutex<Option<T>>,
    state: Mutex<WaitState>,
    cond: Condvar,
}

impl<T> WaitReq<T> {
    pub(crate) fn new(reason: WaitReason, payload: Option<T>) -> Arc<Self> {
        Arc::new(WaitReq {
            reason,
            payload: Mutex::new(payload),
            state: Mutex::new(WaitState {
                complete: false,
                retval: 0,
            }),
            cond: Condvar::new(),
        })
    }

    pub(crate) fn take_payload(&self) -> Option<T> {
        self.payload.lock().expect("wait req poisoned").take()
    }

    pub(crate) fn retval(&self) -> i32 {
        self.state.lock().expect("wait req poisoned").retval
    }

    fn wait(&self, timeout: Timeout) -> bool {
        let deadline = timeout.deadline();
        let mut state = self.state.lock().expect("wait req poisoned");
        loop {
            if state.complete {
                return true;
            }
            if timeout == Timeout::Poll {
                return false;
            }
            let Some(slice) = wait_slice(deadline) else {
                return state.complete;
            };
            let (guard, _res) = self
                .cond
                .wait_timeout(state, slice)
                .expect("wait req poisoned");
            state = guard;
        }
    }
}

/// MPSC queue from requesters to a single servicing worker.
pub(crate) struct ServiceQueue<T> {
    ring: ArrayQueue<Arc<WaitReq<T>>>,
}

impl<T> ServiceQueue<T> {
    /// `depth` must be a power of two.
    pub(crate) fn new(depth: usize) -> Self {
        debug_assert!(depth.is_power_of_two());
        ServiceQueue {
            ring: ArrayQueue::new(depth),
        }
    }

    /// Enqueue a request and block until the worker completes it or the
    /// timeout expires. Returns true if the request completed.
    pub(crate) fn submit(&self, req: &Arc<WaitReq<T>>, timeout: Timeout) -> bool {
        if self.ring.push(Arc::clone(req)).is_err() {
            tracing::warn!("service queue full; request dropped");
            return false;
        }
        req.wait(timeout)
    }

    /// Worker side: pop the next request.
    pub(crate) fn pop(&self) -> Option<Arc<WaitReq<T>>> {
        self.ring.pop()
    }

    /// Worker side: mark a request complete and wake its submitter.
    pub(crate) fn complete(&self, req: &Arc<WaitReq<T>>, retval: i32) {
        let mut state = req.state.lock().expect("wait req poisoned");
        state.complete = true;
        state.retval = retval;
        req.cond.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_submit_complete_handshake() {
        let q: Arc<ServiceQueue<u32>> = Arc::new(ServiceQueue::new(8));
        let req = WaitReq::new(WaitReason::Simple, Some(7u32));

        let worker = {
            let q = Arc::clone(&q);
            std::thread::spawn(move || loop {
                if let Some(r) = q.pop() {
                    assert_eq!(r.reason, WaitReason::Simple);
                    assert_eq!(r.take_payload(), Some(7));
                    q.complete(&r, 42);
                    break;
                }
                std::thread::yield_now();
            })
        };

        assert!(q.submit(&req, Timeout::Bounded(Duration::from_secs(2))));
        assert_eq!(req.retval(), 42);
        worker.join().expect("join");
    }

    #[test]
    fn test_submit_times_out_without_worker() {
        let q: ServiceQueue<()> = ServiceQueue::new(8);
        let req = WaitReq::new(WaitReason::Rx, None);
        assert!(!q.submit(&req, Timeout::Bounded(Duration::from_millis(20))));
    }

    #[test]
    fn test_late_completion_is_sticky() {
        let q: ServiceQueue<()> = ServiceQueue::new(8);
        let req = WaitReq::new(WaitReason::Rx, None);
        assert!(!q.submit(&req, Timeout::Poll));

        // The worker completes after the submitter already gave up.
        let popped = q.pop().expect("request queued");
        q.complete(&popped, 0);
        assert!(popped.wait(Timeout::Poll));
    }
}
