//! Egress queues: rings of 64-byte descriptors that the SGE reads work requests from.
//!
//! The driver writes work requests at the producer index and tells the SGE about
//! them through the doorbell. The SGE reports how far it got by writing its consumer
//! index into the status page that follows the last descriptor, and, when a work
//! request asks for it, by posting a `CPL_SGE_EGR_UPDATE` to the queue's ingress queue.
//! Descriptors (and the packets they reference) are only reclaimed once the status
//! page says the SGE is done with them.

use alloc::{boxed::Box, vec::Vec};
use core::sync::atomic::{fence, Ordering};
use cxgbe_buffers::TxPacket;
use cxgbe_descriptors::{
    egress::{SgeQstat, TxDesc, WrHeader},
    len16_to_ndesc, EQ_ESIZE, SGE_MAX_WR_LEN, SPG_LEN,
};
use zerocopy::LayoutVerified;

use crate::{
    doorbell::Doorbell,
    error::{Result, SgeError},
    ring::{DescRing, RingIndex},
};

/// The status page takes this many descriptors at the end of the ring.
const SPG_DESCS: usize = SPG_LEN / EQ_ESIZE;

/// Ask for a status page update at least this often, in descriptors.
const EQUEQ_INTERVAL: usize = 32;

/// DMA mappings available per descriptor of the ring.
const MAPS_PER_DESC: usize = 4;

/// The state of an egress queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EqState {
    /// Accepting work requests.
    Running,
    /// Refused a work request for lack of room; waiting for the SGE to catch up.
    Stalled,
    /// Torn down. Never leaves this state.
    Doomed,
}

/// What the creator of an egress queue decides.
#[derive(Clone, Copy, Debug)]
pub struct EqParams {
    pub cntxt_id: u16,
    /// The ingress queue that receives this queue's egress updates.
    pub iqid: u16,
    /// The number of descriptors, not counting the status page.
    pub size: usize,
}

/// Per-queue counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EqStats {
    pub wrs: u64,
    pub descs: u64,
    pub reclaimed: u64,
    pub stalls: u64,
    pub resumes: u64,
    pub egr_updates: u64,
    pub doorbells: u64,
}

/// Software state of one work request in the ring.
pub struct TxSlot {
    /// The number of descriptors the work request takes.
    pub ndesc: usize,
    /// The number of DMA mappings its packets use.
    pub maps: usize,
    /// Packets whose buffers the SGE reads through the work request's SGLs.
    /// Empty when the payload was copied into the work request.
    pub packets: Vec<TxPacket>,
}

pub struct EgressQueue {
    cntxt_id: u16,
    iqid: u16,
    /// `size` descriptors followed by the status page.
    ring: DescRing<TxDesc>,
    sdesc: Box<[Option<TxSlot>]>,
    pidx: RingIndex,
    /// The first descriptor not yet reclaimed.
    cidx: RingIndex,
    /// The producer index the SGE was last told about.
    dbidx: RingIndex,
    /// Where the last status page update was requested.
    equeqidx: RingIndex,
    /// An egress update to the ingress queue was requested and hasn't arrived yet.
    equiq_pending: bool,
    state: EqState,
    doorbell: Doorbell,
    maps_avail: usize,
    stats: EqStats,
}

impl EgressQueue {
    pub fn new(params: EqParams, doorbell: Doorbell) -> Result<EgressQueue> {
        if params.size < 16 || params.size > 16384 {
            return Err(SgeError::InvalidQueueSize);
        }
        debug!("EgressQueue {}: {} descriptors, updates to iq {}", params.cntxt_id, params.size, params.iqid);
        Ok(EgressQueue {
            cntxt_id: params.cntxt_id,
            iqid: params.iqid,
            ring: DescRing::new(params.size + SPG_DESCS),
            sdesc: (0..params.size).map(|_| None).collect(),
            pidx: RingIndex::new(params.size),
            cidx: RingIndex::new(params.size),
            dbidx: RingIndex::new(params.size),
            equeqidx: RingIndex::new(params.size),
            equiq_pending: false,
            state: EqState::Running,
            doorbell,
            maps_avail: params.size * MAPS_PER_DESC,
            stats: EqStats::default(),
        })
    }

    pub fn cntxt_id(&self) -> u16 {
        self.cntxt_id
    }

    pub fn iqid(&self) -> u16 {
        self.iqid
    }

    pub fn size(&self) -> usize {
        self.pidx.size()
    }

    pub fn state(&self) -> EqState {
        self.state
    }

    pub fn stats(&self) -> EqStats {
        self.stats
    }

    pub fn pidx(&self) -> RingIndex {
        self.pidx
    }

    pub fn maps_avail(&self) -> usize {
        self.maps_avail
    }

    /// Descriptors that can be written right now. One is always kept free
    /// so that a full ring can be told apart from an empty one.
    pub fn available(&self) -> usize {
        self.size() - 1 - self.cidx.distance_to(self.pidx)
    }

    /// The consumer index the SGE last wrote to the status page.
    fn hw_cidx(&self) -> Option<RingIndex> {
        fence(Ordering::Acquire);
        let spg = LayoutVerified::<&[u8], SgeQstat>::new_from_prefix(self.ring.desc_bytes(self.size()))
            .map(|(lv, _rest)| lv.into_ref())?;
        let cidx = spg.cidx.get() as usize;
        if cidx >= self.size() {
            error!("EgressQueue {}: status page has cidx {} beyond the ring ({})", self.cntxt_id, cidx, self.size());
            return None;
        }
        Some(RingIndex::at(cidx, self.size()))
    }

    /// Descriptors the SGE is done with that haven't been reclaimed yet.
    pub fn reclaimable(&self) -> usize {
        self.hw_cidx().map_or(0, |hw| self.cidx.distance_to(hw))
    }

    /// Frees the packets of up to `max` completed descriptors. A work request is only
    /// reclaimed when the SGE is done with all of its descriptors.
    /// Returns the number of descriptors reclaimed.
    pub fn reclaim(&mut self, max: usize) -> usize {
        let mut can_reclaim = self.reclaimable();
        let mut reclaimed = 0;
        while can_reclaim > 0 && reclaimed < max {
            let i = self.cidx.pos();
            let ndesc = match self.sdesc[i].as_ref() {
                Some(slot) if slot.ndesc <= can_reclaim => slot.ndesc,
                Some(_) => break,
                None => {
                    error!("EgressQueue {}: nothing written at completed descriptor {}", self.cntxt_id, i);
                    break;
                }
            };
            if let Some(slot) = self.sdesc[i].take() {
                self.maps_avail += slot.maps;
            }
            self.cidx.advance(ndesc);
            can_reclaim -= ndesc;
            reclaimed += ndesc;
        }
        self.stats.reclaimed += reclaimed as u64;
        reclaimed
    }

    /// Whether a stalled queue has enough room to take traffic again.
    pub fn can_resume(&self) -> bool {
        self.available() + self.reclaimable() >= self.size() / 4
    }

    /// Copies the work request `wr` into the ring at the producer index.
    ///
    /// The caller must have checked that [`EgressQueue::available()`] covers it.
    /// The work request's header is amended to ask for status page and egress
    /// updates when the queue is filling up.
    pub fn write_wr(&mut self, wr: &mut [u8], packets: Vec<TxPacket>, maps: usize) {
        assert!(wr.len() % 16 == 0 && wr.len() >= 16 && wr.len() <= SGE_MAX_WR_LEN);
        let ndesc = len16_to_ndesc(wr.len() / 16);
        assert!(ndesc <= self.available(), "work request of {} descriptors overruns the ring", ndesc);

        let start = self.pidx;
        let next = start.plus(ndesc);
        let avail_after = self.available() - ndesc;
        if let Some(hdr) = WrHeader::from_bytes_mut(wr) {
            if avail_after < self.size() / 4 && !self.equiq_pending {
                hdr.request_egress_update(true, true);
                self.equiq_pending = true;
                self.equeqidx = next;
            } else if self.equeqidx.distance_to(next) >= EQUEQ_INTERVAL {
                hdr.request_egress_update(false, true);
                self.equeqidx = next;
            }
        }

        self.ring.copy_in(start, wr);
        self.sdesc[start.pos()] = Some(TxSlot { ndesc, maps, packets });
        self.maps_avail -= maps;
        self.pidx = next;
        self.stats.wrs += 1;
        self.stats.descs += ndesc as u64;
    }

    /// Descriptors written but not yet announced to the SGE.
    pub fn pending_db(&self) -> usize {
        self.dbidx.distance_to(self.pidx)
    }

    /// Tells the SGE about every descriptor written since the last doorbell.
    pub fn ring_db(&mut self) {
        let n = self.pending_db();
        if n == 0 {
            return;
        }
        self.doorbell.ring(n as u16, Some(self.ring.get(self.dbidx)));
        self.dbidx = self.pidx;
        self.stats.doorbells += 1;
    }

    /// Rings the doorbell once at least `batch` descriptors are pending.
    pub fn maybe_ring_db(&mut self, batch: usize) {
        if self.pending_db() >= batch {
            self.ring_db();
        }
    }

    /// Marks the queue stalled. Returns `false` if it wasn't running.
    pub fn stall(&mut self) -> bool {
        if self.state != EqState::Running {
            return false;
        }
        self.state = EqState::Stalled;
        self.stats.stalls += 1;
        debug!("EgressQueue {}: stalled with {} descriptors available", self.cntxt_id, self.available());
        true
    }

    /// Moves a stalled queue back to running. Returns `false` if it isn't stalled.
    pub fn resume(&mut self) -> bool {
        if self.state != EqState::Stalled {
            return false;
        }
        self.state = EqState::Running;
        self.stats.resumes += 1;
        debug!("EgressQueue {}: resumed", self.cntxt_id);
        true
    }

    /// Reclaims what the SGE finished and resumes the queue if there is enough room.
    /// Returns `true` if the queue went from stalled to running.
    pub fn try_resume(&mut self) -> bool {
        self.reclaim(usize::MAX);
        self.state == EqState::Stalled && self.can_resume() && self.resume()
    }

    /// Handles an egress update from the SGE.
    pub fn egress_update(&mut self) {
        self.equiq_pending = false;
        self.stats.egr_updates += 1;
    }

    /// Stops the queue for good and frees every packet still in the ring.
    pub fn teardown(&mut self) {
        self.state = EqState::Doomed;
        let mut dropped = 0;
        for slot in self.sdesc.iter_mut() {
            if let Some(slot) = slot.take() {
                dropped += slot.packets.len();
            }
        }
        self.maps_avail = self.size() * MAPS_PER_DESC;
        debug!("EgressQueue {}: torn down, dropped {} packets", self.cntxt_id, dropped);
    }
}

#[cfg(test)]
impl EgressQueue {
    /// The SGE consumes every work request it has been told about and writes the
    /// status page. Returns the work requests in ring order.
    pub(crate) fn hw_consume(&mut self) -> Vec<Vec<u8>> {
        let size = self.size();
        let mut hw = self.hw_cidx().unwrap_or_else(|| RingIndex::new(size));
        let mut wrs = Vec::new();
        while hw != self.dbidx {
            let mut hdr = [0u8; 8];
            self.ring.copy_out(hw, &mut hdr);
            let len16 = WrHeader::from_bytes(&hdr).map(|h| h.len16()).unwrap_or(0);
            assert!(len16 > 0, "no work request at descriptor {}", hw.pos());
            let mut wr = alloc::vec![0u8; len16 * 16];
            self.ring.copy_out(hw, &mut wr);
            hw.advance(len16_to_ndesc(len16));
            wrs.push(wr);
        }
        self.hw_set_cidx(hw.pos());
        wrs
    }

    pub(crate) fn hw_set_cidx(&mut self, cidx: usize) {
        let size = self.size();
        let spg = LayoutVerified::<&mut [u8], SgeQstat>::new_from_prefix(self.ring.desc_bytes_mut(size))
            .map(|(lv, _rest)| lv.into_mut())
            .expect("status page");
        spg.cidx.set(cidx as u16);
    }
}
