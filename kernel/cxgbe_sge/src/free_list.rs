//! Free lists: rings of empty receive buffers that the SGE fills with frame payload.
//!
//! Each slot of a free list holds at most one cluster. Without buffer packing, a
//! cluster holds (part of) one frame and is handed over to that frame. With packing,
//! the SGE places several frames back to back in one cluster, so the cluster becomes
//! shared between the frames and the slot through an `Arc`. The slot gets the cluster
//! back for reuse once every frame referencing it has been dropped.
//!
//! The SGE is told about buffers in whole descriptors of eight, and it tracks its own
//! consumer index in descriptors as well. The producer therefore never fills the slot
//! just before the descriptor holding the consumer index: equal descriptor indices mean
//! "empty" to the hardware. Buffers of a partly filled descriptor are posted but not
//! announced until the descriptor is complete.

use alloc::{boxed::Box, sync::Arc, vec::Vec};
use core::cmp::{max, min};
use cxgbe_buffers::{Cluster, ClusterZone, ReceivedFrame, RxSegment};
use cxgbe_descriptors::{
    egress::{fl_buf_addr, TxDesc},
    FL_BUFS_PER_DESC,
};
use zerocopy::byteorder::U64;

use crate::{
    buf_info::{ClusterLayout, RxBufTable},
    config::SgeConfig,
    doorbell::Doorbell,
    error::{Result, SgeError},
    ring::{DescRing, RingIndex},
};

/// The doorbell is rung every time this many new buffers (four descriptors) have been posted.
const FL_DB_BATCH: usize = 4 * FL_BUFS_PER_DESC;

/// The buffer a free-list slot holds.
pub enum SlotBuffer {
    /// A cluster that only the slot references.
    Owned(Cluster),
    /// A packed cluster that received frames may also reference.
    Shared(Arc<Cluster>),
}

impl SlotBuffer {
    pub fn cluster(&self) -> &Cluster {
        match self {
            SlotBuffer::Owned(cluster) => cluster,
            SlotBuffer::Shared(cluster) => cluster,
        }
    }
}

/// One free-list entry.
pub struct FlSlot {
    buffer: Option<SlotBuffer>,
    layout: ClusterLayout,
    /// How many frames took a reference to the buffer since it was last posted.
    nframes: u32,
}

/// Free-list counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlStats {
    /// Clusters newly taken from a zone.
    pub allocated: u64,
    /// Clusters taken from the safe zone because the primary zone had none.
    pub safe_allocated: u64,
    /// Clusters posted again without any frame having referenced them.
    pub fast_recycled: u64,
    /// Packed clusters posted again after all frames referencing them were dropped.
    pub recycled: u64,
    /// Refills cut short because no zone had a cluster.
    pub alloc_failed: u64,
    /// Payload segments copied into a heap buffer.
    pub copied: u64,
    /// Payload segments handed to the stack without copying.
    pub zero_copy: u64,
    /// Frames that couldn't be completed because the list ran dry.
    pub incomplete: u64,
}

/// The result of pulling a frame's payload off a free list.
#[derive(Debug)]
pub enum Payload {
    Frame(ReceivedFrame),
    /// The list ran out of buffers in the middle of the frame. What was collected so
    /// far is kept, and the next call with the same length picks up where this one left off.
    Incomplete,
}

struct Resume {
    frame: ReceivedFrame,
    remaining: usize,
    total: usize,
}

/// What the creator of a free list decides.
#[derive(Clone, Copy, Debug)]
pub struct FlParams {
    pub cntxt_id: u16,
    /// The number of buffers in the list, a multiple of 8.
    pub size: usize,
    /// The largest payload the SGE may place into the list, pktshift included.
    pub max_payload: usize,
    /// Whether the list should pack frames, if the configuration allows it.
    pub packing: bool,
}

/// A receive free list.
pub struct FreeList {
    cntxt_id: u16,
    slots: Box<[FlSlot]>,
    descs: DescRing<TxDesc>,
    /// The next slot to post a buffer into.
    pidx: RingIndex,
    /// The slot the next payload will be taken from.
    cidx: RingIndex,
    /// The producer index the hardware was last told about, always at a descriptor boundary.
    dbidx: RingIndex,
    /// Where in the buffer at `cidx` the next payload starts.
    rx_offset: usize,
    resume: Option<Resume>,
    packing: bool,
    pack_boundary: usize,
    rx_copy_threshold: usize,
    primary: ClusterLayout,
    safe: Option<ClusterLayout>,
    zones: Vec<Arc<ClusterZone>>,
    low_water: usize,
    starving: bool,
    doomed: bool,
    /// Slots consumed since the last refill.
    consumed: usize,
    doorbell: Doorbell,
    stats: FlStats,
}

impl FreeList {
    /// Creates an empty free list. Buffers are only posted by [`FreeList::refill()`].
    ///
    /// `zones` are the cluster zones in the order of the configuration's `zone_sizes`.
    pub fn new(
        params: FlParams,
        config: &SgeConfig,
        table: &RxBufTable,
        zones: Vec<Arc<ClusterZone>>,
        doorbell: Doorbell,
    ) -> Result<FreeList> {
        if params.size < 2 * FL_BUFS_PER_DESC || params.size % FL_BUFS_PER_DESC != 0 {
            return Err(SgeError::InvalidQueueSize);
        }
        let mut packing = params.packing && config.buffer_packing;
        let primary = match table.find_refill_source(params.max_payload, packing) {
            Some(layout) => layout,
            None if packing => {
                warn!("FreeList {}: no zone supports packing, falling back to one frame per buffer", params.cntxt_id);
                packing = false;
                table.find_refill_source(params.max_payload, false).ok_or(SgeError::NoRefillSource)?
            }
            None => return Err(SgeError::NoRefillSource),
        };
        let safe = table.find_safe_refill_source(packing);
        if zones.len() <= primary.zidx || safe.map_or(false, |s| zones.len() <= s.zidx) {
            return Err(SgeError::InvalidConfig("a cluster zone is missing"));
        }

        let slots = (0..params.size)
            .map(|_| FlSlot { buffer: None, layout: primary, nframes: 0 })
            .collect();
        debug!("FreeList {}: {} slots, zone {} hwsize {}, packing: {}",
            params.cntxt_id, params.size, zones[primary.zidx].size(), primary.hwsize, packing);

        Ok(FreeList {
            cntxt_id: params.cntxt_id,
            slots,
            descs: DescRing::new(params.size / FL_BUFS_PER_DESC),
            pidx: RingIndex::new(params.size),
            cidx: RingIndex::new(params.size),
            dbidx: RingIndex::new(params.size),
            rx_offset: 0,
            resume: None,
            packing,
            pack_boundary: config.pack_boundary,
            rx_copy_threshold: config.rx_copy_threshold,
            primary,
            safe,
            zones,
            low_water: min(config.fl_starve_threshold, (params.size - 1) / 2),
            starving: false,
            doomed: false,
            consumed: 0,
            doorbell,
            stats: FlStats::default(),
        })
    }

    pub fn cntxt_id(&self) -> u16 {
        self.cntxt_id
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn is_packing(&self) -> bool {
        self.packing
    }

    pub fn layout(&self) -> ClusterLayout {
        self.primary
    }

    pub fn stats(&self) -> FlStats {
        self.stats
    }

    pub fn pidx(&self) -> RingIndex {
        self.pidx
    }

    pub fn cidx(&self) -> RingIndex {
        self.cidx
    }

    /// The number of posted buffers not yet consumed.
    pub fn occupancy(&self) -> usize {
        self.cidx.distance_to(self.pidx)
    }

    pub fn low_water(&self) -> usize {
        self.low_water
    }

    pub fn running_low(&self) -> bool {
        self.occupancy() < self.low_water
    }

    /// A starving list is only taken off the starving list once it has this much slack.
    pub fn not_running_low(&self) -> bool {
        self.occupancy() >= 2 * self.low_water
    }

    pub fn is_starving(&self) -> bool {
        self.starving
    }

    pub fn set_starving(&mut self, starving: bool) {
        self.starving = starving;
    }

    pub fn is_doomed(&self) -> bool {
        self.doomed
    }

    /// Slots consumed since the last refill.
    pub fn consumed_since_refill(&self) -> usize {
        self.consumed
    }

    /// The amount a periodic retry refills a starving list by.
    pub fn starving_refill_amount(&self) -> usize {
        max(64, 2 * self.low_water)
    }

    /// Posts up to `n` newly allocated buffers, recycling consumed ones along the way.
    ///
    /// Returns `true` if the list is running low afterwards and isn't already
    /// registered as starving, i.e., the caller should register it.
    pub fn refill(&mut self, mut n: usize) -> bool {
        if self.doomed {
            return false;
        }
        self.consumed = 0;
        let capacity = self.capacity();
        while n > 0 && self.hw_occupancy() < capacity - 1 {
            let i = self.pidx.pos();
            let slot = &mut self.slots[i];

            let recycled = match slot.buffer.take() {
                Some(buffer) if slot.nframes == 0 => {
                    self.stats.fast_recycled += 1;
                    slot.buffer = Some(buffer);
                    true
                }
                Some(SlotBuffer::Shared(cluster)) => match Arc::try_unwrap(cluster) {
                    Ok(cluster) => {
                        self.stats.recycled += 1;
                        slot.buffer = Some(SlotBuffer::Owned(cluster));
                        true
                    }
                    // frames still use it; the last one to go returns it to the zone
                    Err(_) => false,
                },
                Some(owned) => {
                    slot.buffer = Some(owned);
                    true
                }
                None => false,
            };

            if !recycled {
                let primary = &self.zones[self.primary.zidx];
                let allocation = match primary.alloc() {
                    Some(cluster) => Some((cluster, self.primary)),
                    None => self.safe.and_then(|safe| {
                        self.zones[safe.zidx].alloc().map(|cluster| {
                            self.stats.safe_allocated += 1;
                            (cluster, safe)
                        })
                    }),
                };
                match allocation {
                    Some((cluster, layout)) => {
                        slot.buffer = Some(SlotBuffer::Owned(cluster));
                        slot.layout = layout;
                        self.stats.allocated += 1;
                        n -= 1;
                    }
                    None => {
                        self.stats.alloc_failed += 1;
                        break;
                    }
                }
            }
            slot.nframes = 0;

            if let Some(buffer) = slot.buffer.as_ref() {
                let desc = RingIndex::at(i / FL_BUFS_PER_DESC, self.descs.len());
                self.descs.get_mut(desc).flit[i % FL_BUFS_PER_DESC] =
                    U64::new(fl_buf_addr(buffer.cluster().bus_addr(), slot.layout.hwidx));
            }
            self.pidx.advance(1);
            if self.dbidx.distance_to(self.pidx) >= FL_DB_BATCH {
                self.ring_doorbell();
            }
        }
        self.ring_doorbell();

        let register = self.running_low() && !self.starving;
        if register {
            warn!("FreeList {}: running low with {} buffers posted", self.cntxt_id, self.occupancy());
        }
        register
    }

    /// Tells the SGE about every completely filled descriptor it doesn't know about yet.
    fn ring_doorbell(&mut self) {
        let ndesc = self.dbidx.distance_to(self.pidx) / FL_BUFS_PER_DESC;
        if ndesc == 0 {
            return;
        }
        self.doorbell.ring(ndesc as u16, None);
        self.dbidx.advance(ndesc * FL_BUFS_PER_DESC);
    }

    /// Posted buffers counted from the start of the descriptor holding `cidx`,
    /// which is where the hardware's consumer index sits.
    fn hw_occupancy(&self) -> usize {
        let cidx = self.cidx.pos();
        RingIndex::at(cidx - cidx % FL_BUFS_PER_DESC, self.capacity()).distance_to(self.pidx)
    }

    /// Collects the `total_len` bytes of payload the SGE placed in the list for one frame.
    ///
    /// `new_buf` is the NEWBUF bit of the response: the frame doesn't continue in
    /// the partially used buffer of the previous frame.
    pub fn get_payload(&mut self, total_len: usize, new_buf: bool) -> Payload {
        let (mut frame, mut remaining) = match self.resume.take() {
            Some(resume) => {
                if resume.total != total_len {
                    error!("FreeList {}: resuming a {}-byte frame with length {}",
                        self.cntxt_id, resume.total, total_len);
                }
                (resume.frame, resume.remaining)
            }
            None => {
                if self.rx_offset > 0 && new_buf {
                    self.rx_offset = 0;
                    self.advance_cidx();
                }
                (ReceivedFrame::new(), total_len)
            }
        };

        while remaining > 0 {
            match self.get_segment(total_len - remaining, remaining) {
                Some(seg) => {
                    remaining -= seg.len();
                    frame.push(seg);
                }
                None => {
                    self.stats.incomplete += 1;
                    debug!("FreeList {}: ran dry with {} of {} bytes left", self.cntxt_id, remaining, total_len);
                    self.resume = Some(Resume { frame, remaining, total: total_len });
                    return Payload::Incomplete;
                }
            }
        }
        Payload::Frame(frame)
    }

    /// Takes the next piece of a frame from the buffer at `cidx`, which starts
    /// `fr_offset` bytes into the frame.
    fn get_segment(&mut self, fr_offset: usize, remaining: usize) -> Option<RxSegment> {
        // the SGE only fills buffers it was told about
        if self.cidx == self.dbidx {
            return None;
        }
        let offset = self.rx_offset;
        let slot = &mut self.slots[self.cidx.pos()];
        let hwsize = slot.layout.hwsize;
        let mut blen = hwsize - offset;
        let len = min(remaining, blen);
        if self.packing {
            let end = fr_offset + len;
            let pad = round_up(end, self.pack_boundary) - end;
            if offset + len + pad < hwsize {
                blen = len + pad;
            }
        }

        let buffer = slot.buffer.as_ref()?;
        let seg = if len < self.rx_copy_threshold {
            self.stats.copied += 1;
            RxSegment::Copied(buffer.cluster()[offset..offset + len].to_vec())
        } else if self.packing {
            self.stats.zero_copy += 1;
            let cluster = match slot.buffer.take()? {
                SlotBuffer::Owned(cluster) => Arc::new(cluster),
                SlotBuffer::Shared(cluster) => cluster,
            };
            slot.buffer = Some(SlotBuffer::Shared(Arc::clone(&cluster)));
            slot.nframes += 1;
            RxSegment::Shared { cluster, offset, len }
        } else {
            self.stats.zero_copy += 1;
            match slot.buffer.take()? {
                SlotBuffer::Owned(cluster) => RxSegment::Owned { cluster, offset, len },
                SlotBuffer::Shared(cluster) => RxSegment::Shared { cluster, offset, len },
            }
        };

        if self.packing {
            self.rx_offset += blen;
            if self.rx_offset < hwsize {
                return Some(seg);
            }
        }
        self.rx_offset = 0;
        self.advance_cidx();
        Some(seg)
    }

    fn advance_cidx(&mut self) {
        self.cidx.advance(1);
        self.consumed += 1;
    }

    /// Releases every buffer the list holds. Clusters still referenced by frames
    /// go back to their zones when those frames are dropped.
    pub fn teardown(&mut self) {
        self.doomed = true;
        self.resume = None;
        let mut released = 0;
        for slot in self.slots.iter_mut() {
            if slot.buffer.take().is_some() {
                released += 1;
            }
            slot.nframes = 0;
        }
        debug!("FreeList {}: torn down, dropped {} buffers", self.cntxt_id, released);
    }
}

#[cfg(test)]
impl FreeList {
    /// Whether the hardware, about to write into `slot`, was told about a buffer there.
    /// It fills slots in order, so the first one it doesn't know about is `dbidx`.
    pub(crate) fn hw_slot_posted(&self, slot: usize) -> bool {
        slot != self.dbidx.pos()
    }

    pub(crate) fn hw_slot_size(&self, slot: usize) -> usize {
        self.slots[slot].layout.hwsize
    }

    pub(crate) fn hw_write(&self, slot: usize, offset: usize, data: &[u8]) {
        let cluster = self.slots[slot].buffer.as_ref().map(SlotBuffer::cluster)
            .expect("hardware wrote to an empty slot");
        assert!(offset + data.len() <= self.slots[slot].layout.hwsize);
        unsafe { cluster.device_write(offset, data) };
    }

    /// The buffer address the hardware sees for `slot`.
    pub(crate) fn hw_buf_addr(&self, slot: usize) -> u64 {
        let desc = RingIndex::at(slot / FL_BUFS_PER_DESC, self.descs.len());
        self.descs.get(desc).flit[slot % FL_BUFS_PER_DESC].get()
    }

    /// Bus addresses of the clusters the slots hold.
    pub(crate) fn slot_clusters(&self) -> Vec<u64> {
        self.slots.iter()
            .filter_map(|s| s.buffer.as_ref().map(|b| b.cluster().bus_addr()))
            .collect()
    }
}

fn round_up(x: usize, align: usize) -> usize {
    (x + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doorbell::DoorbellKind;
    use crate::hw_model::{FakeRegisters, FlDma};
    use alloc::vec;
    use cxgbe_descriptors::registers::DoorbellValue;
    use proptest::prelude::*;

    struct Setup {
        regs: Arc<FakeRegisters>,
        zones: Vec<Arc<ClusterZone>>,
        fl: FreeList,
    }

    fn setup(size: usize, max_payload: usize, packing: bool) -> Setup {
        let config = SgeConfig::default();
        let table = RxBufTable::new(&config);
        let zones = ClusterZone::standard_zones();
        let regs = FakeRegisters::new();
        let db = Doorbell::new(DoorbellKind::Kernel, 40, 0, regs.clone(), None).unwrap();
        let params = FlParams { cntxt_id: 40, size, max_payload, packing };
        let fl = FreeList::new(params, &config, &table, zones.clone(), db).unwrap();
        Setup { regs, zones, fl }
    }

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    fn frame(payload: Payload) -> ReceivedFrame {
        match payload {
            Payload::Frame(f) => f,
            Payload::Incomplete => panic!("frame is incomplete"),
        }
    }

    #[test]
    fn rejects_bad_sizes() {
        let config = SgeConfig::default();
        let table = RxBufTable::new(&config);
        let regs = FakeRegisters::new();
        let db = Doorbell::new(DoorbellKind::Kernel, 1, 0, regs, None).unwrap();
        let params = FlParams { cntxt_id: 1, size: 20, max_payload: 1520, packing: false };
        assert_eq!(FreeList::new(params, &config, &table, ClusterZone::standard_zones(), db).err(),
            Some(SgeError::InvalidQueueSize));
    }

    #[test]
    fn refill_leaves_one_slot_empty() {
        let mut s = setup(64, 1520, false);
        assert!(!s.fl.refill(64));
        assert_eq!(s.fl.occupancy(), 63);
        assert_eq!(s.fl.stats().allocated, 63);
        // four descriptors, then the three complete ones of the remaining 31 buffers
        let dbs = s.regs.kdoorbells();
        assert_eq!(dbs, vec![DoorbellValue { qid: 40, pidx: 4 }, DoorbellValue { qid: 40, pidx: 3 }]);

        // the hardware consumes ten buffers
        let mut dma = FlDma::new();
        for i in 0..10 {
            let new_buf = dma.write_frame(&s.fl, &pattern(1000, i));
            let f = frame(s.fl.get_payload(1000, new_buf));
            assert_eq!(f.to_vec(), pattern(1000, i));
        }
        assert_eq!(s.fl.occupancy(), 53);

        // slots 8 and 9 share a descriptor with the consumer index; the producer
        // stops one slot short of that descriptor
        s.regs.clear();
        s.fl.refill(10);
        assert_eq!(s.fl.pidx().pos(), 7);
        assert_eq!(s.fl.occupancy(), 61);
        assert_eq!(s.regs.kdoorbells(), vec![DoorbellValue { qid: 40, pidx: 1 }]);
    }

    #[test]
    fn doorbell_counts_whole_descriptors() {
        let mut s = setup(64, 1520, false);
        s.fl.refill(9);
        assert_eq!(s.fl.occupancy(), 9);
        assert_eq!(s.regs.kdoorbells(), vec![DoorbellValue { qid: 40, pidx: 1 }]);

        // the ninth buffer is announced along with the rest of its descriptor
        s.regs.clear();
        s.fl.refill(6);
        assert!(s.regs.kdoorbells().is_empty());
        s.fl.refill(1);
        assert_eq!(s.regs.kdoorbells(), vec![DoorbellValue { qid: 40, pidx: 1 }]);
        assert_eq!(s.fl.occupancy(), 16);
    }

    #[test]
    fn refill_of_a_large_list() {
        let mut s = setup(1024, 1520, false);
        assert_eq!(s.fl.low_water(), 64);
        assert!(!s.fl.refill(64));
        assert_eq!(s.fl.occupancy(), 64);
        assert_eq!(s.fl.stats().allocated, 64);
        assert_eq!(s.regs.kdoorbells(), vec![DoorbellValue { qid: 40, pidx: 4 }; 2]);

        let mut dma = FlDma::new();
        for i in 0..10 {
            let new_buf = dma.write_frame(&s.fl, &pattern(1000, i));
            frame(s.fl.get_payload(1000, new_buf));
        }
        assert_eq!(s.fl.occupancy(), 54);
        assert!(s.fl.running_low());

        s.regs.clear();
        assert!(!s.fl.refill(10));
        assert_eq!(s.fl.occupancy(), 64);
        let rings = s.regs.kdoorbells();
        assert!(rings.len() <= (10 + 3) / 4 + 1);
        assert_eq!(rings, vec![DoorbellValue { qid: 40, pidx: 1 }]);
    }

    #[test]
    fn multi_buffer_frame() {
        let mut s = setup(16, 1520, false);
        s.fl.refill(16);
        let data = pattern(5000, 7);
        let mut dma = FlDma::new();
        let new_buf = dma.write_frame(&s.fl, &data);
        let f = frame(s.fl.get_payload(5000, new_buf));
        assert_eq!(f.nsegs(), 3);
        assert_eq!(f.segments().iter().map(|s| s.len()).collect::<Vec<_>>(), vec![2048, 2048, 904]);
        assert_eq!(f.to_vec(), data);
        assert_eq!(s.fl.cidx().pos(), 3);
    }

    #[test]
    fn small_payloads_are_copied_and_recycled() {
        let mut s = setup(16, 1520, false);
        s.fl.refill(16);
        let allocated = s.fl.stats().allocated;
        let mut dma = FlDma::new();
        for i in 0..8 {
            let new_buf = dma.write_frame(&s.fl, &pattern(60, i));
            let f = frame(s.fl.get_payload(60, new_buf));
            assert!(matches!(f.segments()[0], RxSegment::Copied(_)));
        }
        // slot 15 was never filled; slots 0 to 6 get their clusters back
        s.fl.refill(16);
        let stats = s.fl.stats();
        assert_eq!(stats.copied, 8);
        assert_eq!(stats.fast_recycled, 7);
        assert_eq!(stats.allocated, allocated + 1);
        assert_eq!(s.fl.occupancy(), 15);
    }

    #[test]
    fn packed_frames_share_clusters() {
        let mut s = setup(16, 1520, true);
        assert!(s.fl.is_packing());
        assert_eq!(s.fl.layout().hwsize, 4032);
        s.fl.refill(16);

        let mut dma = FlDma::new();
        let mut frames = Vec::new();
        for i in 0..7 {
            let new_buf = dma.write_frame(&s.fl, &pattern(1000, i));
            let f = frame(s.fl.get_payload(1000, new_buf));
            assert_eq!(f.to_vec(), pattern(1000, i));
            frames.push(f);
        }
        // three 1000-byte frames padded to 1024 fit in one 4032-byte buffer
        assert_eq!(s.fl.cidx().pos(), 2);
        match &frames[1].segments()[0] {
            RxSegment::Shared { cluster, offset, .. } => {
                assert_eq!(*offset, 1024);
                assert_eq!(Arc::strong_count(cluster), 4);
            }
            other => panic!("expected a shared segment, got {:?}", other),
        }

        // the first buffer can't be recycled while frames hold it
        let allocated = s.fl.stats().allocated;
        s.fl.refill(2);
        assert_eq!(s.fl.stats().allocated, allocated + 2);
        assert_eq!(s.fl.stats().recycled, 0);

        let before = s.zones[1].released();
        frames.drain(..3).for_each(drop);
        assert_eq!(s.zones[1].released(), before + 1);
    }

    #[test]
    fn packed_cluster_recycled_after_frames_drop() {
        let mut s = setup(32, 1520, true);
        s.fl.refill(32);
        let mut dma = FlDma::new();
        // three frames per buffer fill slots 0 to 7; the last frame starts slot 8
        for i in 0..25 {
            let new_buf = dma.write_frame(&s.fl, &pattern(1000, i));
            drop(frame(s.fl.get_payload(1000, new_buf)));
        }
        assert_eq!(s.fl.cidx().pos(), 8);
        let allocated = s.fl.stats().allocated;
        s.fl.refill(2);
        assert_eq!(s.fl.stats().recycled, 7);
        assert_eq!(s.fl.stats().allocated, allocated + 1);
        assert_eq!(s.fl.occupancy(), 31);
    }

    #[test]
    fn refcounts_are_conserved() {
        let mut s = setup(32, 1520, true);
        s.fl.refill(32);
        let mut dma = FlDma::new();
        let mut frames = Vec::new();
        let sizes = [1000, 300, 3000, 4500, 100, 1500, 1500, 1500, 9000, 64];
        for (i, &len) in sizes.iter().enumerate() {
            let new_buf = dma.write_frame(&s.fl, &pattern(len, i as u8));
            let f = frame(s.fl.get_payload(len, new_buf));
            assert_eq!(f.len(), len);
            frames.push(f);
            if i % 3 == 2 {
                frames.remove(0);
                s.fl.refill(4);
            }
        }

        let mut live: Vec<u64> = s.fl.slot_clusters();
        for f in &frames {
            for seg in f.segments() {
                match seg {
                    RxSegment::Owned { cluster, .. } => live.push(cluster.bus_addr()),
                    RxSegment::Shared { cluster, .. } => live.push(cluster.bus_addr()),
                    RxSegment::Copied(_) => {}
                }
            }
        }
        live.sort_unstable();
        live.dedup();
        let outstanding: usize = s.zones.iter().map(|z| z.outstanding()).sum();
        assert_eq!(outstanding, live.len());

        drop(frames);
        s.fl.teardown();
        assert_eq!(s.zones.iter().map(|z| z.outstanding()).sum::<usize>(), 0);
    }

    #[test]
    fn incomplete_frame_resumes() {
        let mut s = setup(16, 1520, false);
        s.fl.refill(2);
        // two buffers don't make a descriptor, so the hardware has nowhere to write
        assert!(s.regs.kdoorbells().is_empty());
        let data = pattern(5000, 3);
        let mut dma = FlDma::new();
        let new_buf = dma.write_frame(&s.fl, &data);
        assert!(dma.is_stuck());
        assert!(matches!(s.fl.get_payload(5000, new_buf), Payload::Incomplete));
        assert_eq!(s.fl.stats().incomplete, 1);
        assert_eq!(s.fl.cidx().pos(), 0);

        s.fl.refill(6);
        dma.resume(&s.fl);
        let f = frame(s.fl.get_payload(5000, new_buf));
        assert_eq!(f.nsegs(), 3);
        assert_eq!(f.to_vec(), data);
    }

    #[test]
    fn safe_zone_fallback_and_starvation() {
        let mut s = setup(64, 1520, false);
        s.zones[0].set_limit(Some(0));
        assert!(s.fl.refill(8));
        assert_eq!(s.fl.stats().safe_allocated, 8);
        // the safe zone posts 4K buffers with their own hardware index
        assert_eq!(s.fl.hw_buf_addr(0) & 0xF, 1);

        s.zones[1].set_limit(Some(8));
        assert!(s.fl.refill(64));
        assert_eq!(s.fl.stats().alloc_failed, 1);
        s.fl.set_starving(true);
        assert!(!s.fl.refill(64));

        s.zones[0].set_limit(None);
        s.fl.refill(s.fl.starving_refill_amount());
        assert!(s.fl.not_running_low());
    }

    #[test]
    fn teardown_returns_clusters() {
        let mut s = setup(16, 1520, false);
        s.fl.refill(16);
        assert_eq!(s.zones[0].outstanding(), 15);
        s.fl.teardown();
        assert_eq!(s.zones[0].outstanding(), 0);
        assert!(!s.fl.refill(16));
        assert_eq!(s.fl.occupancy(), 15);
    }

    proptest! {
        #[test]
        fn random_traffic_keeps_indices_consistent(
            size in prop::sample::select(vec![16usize, 32, 64]),
            packing in any::<bool>(),
            ops in prop::collection::vec((0u8..4, 1usize..6000), 1..200),
        ) {
            let mut s = setup(size, 1520, packing);
            let mut dma = FlDma::new();
            // a frame the hardware is writing, with its NEWBUF bit
            let mut receiving: Option<(Vec<u8>, bool)> = None;
            let mut frames = Vec::new();
            for (i, &(op, arg)) in ops.iter().enumerate() {
                match op {
                    0 => {
                        s.fl.refill(arg % 80);
                        dma.resume(&s.fl);
                    }
                    1 => {
                        if !frames.is_empty() {
                            frames.remove(0);
                        }
                    }
                    _ if receiving.is_none() => {
                        let data = pattern(arg, i as u8);
                        let new_buf = dma.write_frame(&s.fl, &data);
                        receiving = Some((data, new_buf));
                    }
                    _ => {}
                }
                if let Some((data, new_buf)) = receiving.take() {
                    match s.fl.get_payload(data.len(), new_buf) {
                        Payload::Frame(f) => {
                            prop_assert!(!dma.is_stuck());
                            prop_assert_eq!(f.to_vec(), data);
                            frames.push(f);
                        }
                        Payload::Incomplete => {
                            prop_assert!(dma.is_stuck());
                            receiving = Some((data, new_buf));
                        }
                    }
                }

                let fl = &s.fl;
                prop_assert!(fl.occupancy() < fl.capacity());
                prop_assert_eq!(fl.occupancy() == 0, fl.pidx() == fl.cidx());
                // announced buffers are a prefix of the posted ones, in whole descriptors
                prop_assert_eq!(fl.dbidx.pos() % FL_BUFS_PER_DESC, 0);
                prop_assert!(fl.cidx().distance_to(fl.dbidx) <= fl.occupancy());
                let announced: usize = s.regs.kdoorbells().iter().map(|d| d.pidx as usize).sum();
                prop_assert_eq!(announced * FL_BUFS_PER_DESC % fl.capacity(), fl.dbidx.pos());
                // the hardware only sees an empty list when it has nothing to fill
                let same_desc = fl.cidx().pos() / FL_BUFS_PER_DESC == fl.dbidx.pos() / FL_BUFS_PER_DESC;
                prop_assert_eq!(same_desc, fl.cidx() == fl.dbidx);
            }

            drop(frames);
            s.fl.teardown();
            prop_assert_eq!(s.zones.iter().map(|z| z.outstanding()).sum::<usize>(), 0);
        }
    }
}
