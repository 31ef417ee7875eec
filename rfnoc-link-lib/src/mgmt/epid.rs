use std::sync::Mutex;

use ahash::AHashMap;

use super::{Epid, SepAddr};
use crate::error::{Result, RfnocError};

/// Session-global endpoint ID allocator.
///
/// Hands out sequential IDs from a configurable base and never recycles
/// within a session: releasing a binding frees the address for a new
/// assignment, but the old ID stays burned. The reserved IDs 0 and
/// 0xFFFF are never issued.
pub struct EpidAllocator {
    inner: Mutex<AllocState>,
}

struct AllocState {
    next: Epid,
    by_addr: AHashMap<SepAddr, Epid>,
    by_epid: AHashMap<Epid, SepAddr>,
}

impl EpidAllocator {
    pub fn new() -> Self {
        Self::with_base(1)
    }

    pub fn with_base(base: Epid) -> Self {
        assert!(base != 0, "EPID 0 is reserved");
        EpidAllocator {
            inner: Mutex::new(AllocState {
                next: base,
                by_addr: AHashMap::new(),
                by_epid: AHashMap::new(),
            }),
        }
    }

    /// Allocate (or look up) the EPID bound to a physical endpoint
    /// address. Repeated calls for the same address return the same ID.
    pub fn allocate(&self, addr: SepAddr) -> Result<Epid> {
        let mut state = self.inner.lock().expect("epid allocator poisoned");
        if let Some(&epid) = state.by_addr.get(&addr) {
            return Ok(epid);
        }
        if state.next == 0xFFFF {
            return Err(RfnocError::Resource(
                "endpoint ID space exhausted for this session".to_string(),
            ));
        }
        let epid = state.next;
        state.next += 1;
        state.by_addr.insert(addr, epid);
        state.by_epid.insert(epid, addr);
        tracing::debug!(%addr, epid, "EPID allocated");
        Ok(epid)
    }

    pub fn lookup_epid(&self, addr: SepAddr) -> Option<Epid> {
        self.inner
            .lock()
            .expect("epid allocator poisoned")
            .by_addr
            .get(&addr)
            .copied()
    }

    pub fn lookup_addr(&self, epid: Epid) -> Option<SepAddr> {
        self.inner
            .lock()
            .expect("epid allocator poisoned")
            .by_epid
            .get(&epid)
            .copied()
    }

    /// Forget the binding for an address. The ID itself is not recycled.
    pub fn release(&self, addr: SepAddr) {
        let mut state = self.inner.lock().expect("epid allocator poisoned");
        if let Some(epid) = state.by_addr.remove(&addr) {
            state.by_epid.remove(&epid);
        }
    }
}

impl Default for EpidAllocator {
    fn default() -> Self {
        Self::new()
    }
}
