//! Control queues that carry work requests built by the caller.
//!
//! Unlike Ethernet transmit queues, these never refuse work: a request that doesn't
//! fit is kept on a software list and written once the SGE has made room. Requests
//! always reach the ring in the order they were submitted.

use alloc::{collections::VecDeque, vec::Vec};
use cxgbe_descriptors::{egress::WrHeader, len16_to_ndesc, SGE_MAX_WR_LEN};
use spin::Mutex;

use crate::{
    doorbell::Doorbell,
    egress::{EgressQueue, EqParams, EqState, EqStats},
    error::{Result, SgeError},
};

#[derive(Clone, Copy, Debug)]
pub struct WrqParams {
    pub cntxt_id: u16,
    pub iqid: u16,
    pub size: usize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WrqStats {
    /// Work requests written straight to the ring.
    pub direct: u64,
    /// Work requests that had to wait on the pending list.
    pub delayed: u64,
    /// Work requests discarded by a teardown.
    pub dropped: u64,
}

struct WrqCore {
    eq: EgressQueue,
    pending: VecDeque<Vec<u8>>,
    stats: WrqStats,
}

pub struct WrQueue {
    cntxt_id: u16,
    core: Mutex<WrqCore>,
}

impl WrQueue {
    pub fn new(params: WrqParams, doorbell: Doorbell) -> Result<WrQueue> {
        let eq = EgressQueue::new(EqParams { cntxt_id: params.cntxt_id, iqid: params.iqid, size: params.size }, doorbell)?;
        Ok(WrQueue {
            cntxt_id: params.cntxt_id,
            core: Mutex::new(WrqCore { eq, pending: VecDeque::new(), stats: WrqStats::default() }),
        })
    }

    pub fn cntxt_id(&self) -> u16 {
        self.cntxt_id
    }

    pub fn state(&self) -> EqState {
        self.core.lock().eq.state()
    }

    pub fn stats(&self) -> WrqStats {
        self.core.lock().stats
    }

    pub fn eq_stats(&self) -> EqStats {
        self.core.lock().eq.stats()
    }

    /// The number of work requests waiting for room in the ring.
    pub fn pending(&self) -> usize {
        self.core.lock().pending.len()
    }

    /// Writes the work request `wr` to the ring, or queues it behind the ones
    /// already waiting. `wr` must be a whole number of 16-byte units and its
    /// header must say so.
    pub fn submit_wr(&self, wr: &[u8]) -> Result<()> {
        if wr.len() % 16 != 0 || wr.len() < 16 || wr.len() > SGE_MAX_WR_LEN {
            return Err(SgeError::InvalidWorkRequest);
        }
        match WrHeader::from_bytes(wr) {
            Some(hdr) if hdr.len16() * 16 == wr.len() => {}
            _ => return Err(SgeError::InvalidWorkRequest),
        }

        let mut core = self.core.lock();
        if core.eq.state() == EqState::Doomed {
            return Err(SgeError::QueueDisabled);
        }
        let ndesc = len16_to_ndesc(wr.len() / 16);
        if core.pending.is_empty() {
            if core.eq.available() < ndesc {
                core.eq.reclaim(usize::MAX);
            }
            if core.eq.available() >= ndesc {
                let mut wr = wr.to_vec();
                core.eq.write_wr(&mut wr, Vec::new(), 0);
                core.eq.ring_db();
                core.stats.direct += 1;
                return Ok(());
            }
        }
        core.pending.push_back(wr.to_vec());
        core.stats.delayed += 1;
        core.eq.stall();
        Ok(())
    }

    /// Handles an egress update and writes whatever pending requests now fit.
    pub(crate) fn egress_update(&self) -> usize {
        let mut core = self.core.lock();
        core.eq.egress_update();
        core.drain()
    }

    /// Like [`WrQueue::egress_update()`] minus the update, and giving up if the queue is busy.
    pub(crate) fn try_drain(&self) -> Option<usize> {
        self.core.try_lock().map(|mut core| core.drain())
    }

    pub(crate) fn teardown(&self) {
        let mut core = self.core.lock();
        let dropped = core.pending.len();
        core.pending.clear();
        core.stats.dropped += dropped as u64;
        core.eq.teardown();
        if dropped > 0 {
            warn!("WrQueue {}: dropped {} pending work requests", self.cntxt_id, dropped);
        }
    }
}

impl WrqCore {
    /// Returns the number of requests written.
    fn drain(&mut self) -> usize {
        if self.eq.state() == EqState::Doomed {
            return 0;
        }
        self.eq.reclaim(usize::MAX);
        let mut written = 0;
        while let Some(ndesc) = self.pending.front().map(|wr| len16_to_ndesc(wr.len() / 16)) {
            if ndesc > self.eq.available() {
                break;
            }
            if let Some(mut wr) = self.pending.pop_front() {
                self.eq.write_wr(&mut wr, Vec::new(), 0);
                written += 1;
            }
        }
        self.eq.ring_db();
        if self.pending.is_empty() {
            self.eq.resume();
        }
        written
    }
}

#[cfg(test)]
impl WrQueue {
    pub(crate) fn hw_consume(&self) -> Vec<Vec<u8>> {
        self.core.lock().eq.hw_consume()
    }
}
