//! A software stand-in for the SGE, used by the unit tests.
//!
//! It records register writes, fills free-list buffers the way the DMA engine does,
//! writes ingress queue entries with the right generation bit, and consumes
//! work requests from egress queues.

use alloc::{sync::Arc, vec::Vec};
use core::cmp::min;
use core::sync::atomic::{AtomicUsize, Ordering};
use cxgbe_buffers::ReceivedFrame;
use cxgbe_descriptors::{
    egress::TxDesc,
    ingress::{CplRxPkt, IqDesc, RspCtrl, RspType, CPL_RX_PKT},
    registers::{DoorbellValue, GtsValue},
    FLITS_PER_DESC,
};
use spin::Mutex;
use zerocopy::{AsBytes, FromBytes};

use crate::{
    config::DEFAULT_PACK_BOUNDARY,
    doorbell::{SgeRegisters, UserDoorbell},
    free_list::FreeList,
    ingress::IngressQueue,
    stack::PacketStack,
};

/// Records every write to the physical function's registers.
pub(crate) struct FakeRegisters {
    kdoorbell: Mutex<Vec<u32>>,
    gts: Mutex<Vec<u32>>,
}

impl FakeRegisters {
    pub fn new() -> Arc<FakeRegisters> {
        Arc::new(FakeRegisters { kdoorbell: Mutex::new(Vec::new()), gts: Mutex::new(Vec::new()) })
    }

    pub fn kdoorbells(&self) -> Vec<DoorbellValue> {
        self.kdoorbell.lock().iter().map(|&v| DoorbellValue::decode(v)).collect()
    }

    pub fn gts(&self) -> Vec<GtsValue> {
        self.gts.lock().iter().map(|&v| GtsValue::decode(v)).collect()
    }

    pub fn clear(&self) {
        self.kdoorbell.lock().clear();
        self.gts.lock().clear();
    }
}

impl SgeRegisters for FakeRegisters {
    fn write_kdoorbell(&self, val: u32) {
        self.kdoorbell.lock().push(val);
    }

    fn write_gts(&self, val: u32) {
        self.gts.lock().push(val);
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum UdbWrite {
    Db(DoorbellValue),
    Wr([u64; FLITS_PER_DESC]),
}

/// Records every write to one user doorbell segment.
pub(crate) struct FakeUserDoorbell {
    log: Arc<Mutex<Vec<UdbWrite>>>,
}

impl FakeUserDoorbell {
    pub fn new() -> (FakeUserDoorbell, Arc<Mutex<Vec<UdbWrite>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        (FakeUserDoorbell { log: log.clone() }, log)
    }
}

impl UserDoorbell for FakeUserDoorbell {
    fn write_db(&mut self, val: u32) {
        self.log.lock().push(UdbWrite::Db(DoorbellValue::decode(val)));
    }

    fn write_wr(&mut self, desc: &TxDesc) {
        let mut flits = [0u64; FLITS_PER_DESC];
        for (f, d) in flits.iter_mut().zip(desc.flit.iter()) {
            *f = d.get();
        }
        self.log.lock().push(UdbWrite::Wr(flits));
    }
}

/// Places frames into free-list buffers the way the SGE does.
///
/// Without packing, every buffer holds a piece of one frame. With packing, the next
/// frame follows the previous one in the same buffer, padded to the pack boundary,
/// unless it doesn't fit in what is left; then it starts a new buffer.
pub(crate) struct FlDma {
    slot: usize,
    offset: usize,
    /// A frame that ran into an unposted slot, and how much of it was written.
    pending: Option<(Vec<u8>, usize)>,
}

impl FlDma {
    pub fn new() -> FlDma {
        FlDma { slot: 0, offset: 0, pending: None }
    }

    /// Writes one frame and returns the NEWBUF bit the SGE reports with it.
    pub fn write_frame(&mut self, fl: &FreeList, data: &[u8]) -> bool {
        assert!(self.pending.is_none(), "the previous frame is still being written");
        let mut new_buf = self.offset == 0;
        if self.offset > 0 && data.len() > fl.hw_slot_size(self.slot) - self.offset {
            self.next_slot(fl);
            new_buf = true;
        }
        self.place(fl, data, 0);
        new_buf
    }

    /// Finishes a frame that was held up by the free list running dry.
    pub fn resume(&mut self, fl: &FreeList) {
        if let Some((data, done)) = self.pending.take() {
            self.place(fl, &data, done);
        }
    }

    pub fn is_stuck(&self) -> bool {
        self.pending.is_some()
    }

    fn next_slot(&mut self, fl: &FreeList) {
        self.offset = 0;
        self.slot = (self.slot + 1) % fl.capacity();
    }

    fn place(&mut self, fl: &FreeList, data: &[u8], mut done: usize) {
        while done < data.len() {
            if !fl.hw_slot_posted(self.slot) {
                self.pending = Some((data.to_vec(), done));
                return;
            }
            let hwsize = fl.hw_slot_size(self.slot);
            let len = min(data.len() - done, hwsize - self.offset);
            fl.hw_write(self.slot, self.offset, &data[done..done + len]);
            done += len;

            let mut used = hwsize - self.offset;
            if fl.is_packing() {
                let pad = round_up(done, DEFAULT_PACK_BOUNDARY) - done;
                if self.offset + len + pad < hwsize {
                    used = len + pad;
                }
            }
            self.offset += used;
            if self.offset >= hwsize {
                self.next_slot(fl);
            }
        }
    }
}

fn round_up(x: usize, align: usize) -> usize {
    (x + align - 1) & !(align - 1)
}

/// Writes entries into an ingress queue.
pub(crate) struct IqProducer {
    pidx: usize,
    gen: u8,
}

impl IqProducer {
    pub fn new() -> IqProducer {
        IqProducer { pidx: 0, gen: 1 }
    }

    pub fn post(&mut self, iq: &IngressQueue, mut desc: IqDesc, rsp_type: RspType, pldbuflen_qid: u32) {
        desc.rsp = RspCtrl::new(rsp_type, self.gen, pldbuflen_qid);
        iq.hw_write_desc(self.pidx, desc);
        self.pidx += 1;
        if self.pidx == iq.size() {
            self.pidx = 0;
            self.gen ^= 1;
        }
    }

    /// Posts a CPL message without payload.
    pub fn post_cpl<T: AsBytes>(&mut self, iq: &IngressQueue, opcode: u8, msg: &T) {
        let mut desc = IqDesc::zeroed();
        desc.rss.opcode = opcode;
        desc.set_cpl(msg);
        self.post(iq, desc, RspType::Cpl, 0);
    }

    /// Posts a `CPL_RX_PKT` whose payload `wire` (pktshift padding included)
    /// goes into the queue's free list.
    pub fn post_rx(&mut self, iq: &IngressQueue, dma: &mut FlDma, cpl: &CplRxPkt, wire: &[u8]) {
        let new_buf = iq.with_free_list(|fl| dma.write_frame(fl, wire));
        let mut desc = IqDesc::zeroed();
        desc.rss.opcode = CPL_RX_PKT;
        desc.set_cpl(cpl);
        self.post(iq, desc, RspType::FlBuf, RspCtrl::pldbuflen(new_buf, wire.len() as u32));
    }

    /// Forwards an interrupt for the queue with absolute id `abs_id`.
    pub fn post_intr(&mut self, iq: &IngressQueue, abs_id: u16) {
        self.post(iq, IqDesc::zeroed(), RspType::Intr, abs_id as u32);
    }
}

/// A `CPL_RX_PKT` for an Ethernet frame of `len` bytes.
pub(crate) fn rx_pkt_cpl(len: usize) -> CplRxPkt {
    let mut cpl = CplRxPkt::new_zeroed();
    cpl.opcode = CPL_RX_PKT;
    cpl.len.set(len as u16);
    cpl
}

/// `len` bytes of recognizable payload.
pub(crate) fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

/// A packet stack that keeps everything it is given.
#[derive(Default)]
pub(crate) struct RecordingStack {
    pub delivered: Mutex<Vec<ReceivedFrame>>,
    /// Frames taken by large receive offload.
    pub lro: Mutex<Vec<ReceivedFrame>>,
    pub lro_flushes: AtomicUsize,
    pub resumed: Mutex<Vec<u16>>,
}

impl RecordingStack {
    pub fn new() -> Arc<RecordingStack> {
        Arc::new(RecordingStack::default())
    }

    pub fn delivered(&self) -> usize {
        self.delivered.lock().len()
    }
}

impl PacketStack for RecordingStack {
    fn deliver(&self, frame: ReceivedFrame) {
        self.delivered.lock().push(frame);
    }

    fn lro_enqueue(&self, _iq: u16, frame: ReceivedFrame) -> Option<ReceivedFrame> {
        self.lro.lock().push(frame);
        None
    }

    fn lro_flush(&self, _iq: u16) {
        self.lro_flushes.fetch_add(1, Ordering::Relaxed);
    }

    fn tx_resumed(&self, eq: u16) {
        self.resumed.lock().push(eq);
    }
}
