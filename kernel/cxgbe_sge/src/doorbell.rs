//! Telling the SGE about new descriptors and returning ingress credits.
//!
//! There are two places a doorbell can be rung:
//! * the physical function's kernel doorbell register (`SGE_PF_KDOORBELL`),
//!   shared by all queues of the function, and
//! * a queue's own user doorbell segment in BAR2, which may be mapped write-combined.
//!   When it is, a single-descriptor work request can be pushed through the segment
//!   itself instead of being fetched by DMA.
//!
//! Which one a queue uses is decided when the queue is created and never changes.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::ops::DerefMut;
use core::sync::atomic::{fence, Ordering};
use cxgbe_descriptors::{
    egress::TxDesc,
    registers::{DoorbellValue, GtsValue, SgePfRegisters, UserDoorbellSegment},
    FLITS_PER_DESC,
};
use spin::Mutex;
use zerocopy::AsBytes;

use crate::error::{Result, SgeError};

/// Access to the physical function's SGE registers.
pub trait SgeRegisters: Send + Sync {
    /// Writes `SGE_PF_KDOORBELL`.
    fn write_kdoorbell(&self, val: u32);
    /// Writes `SGE_PF_GTS`.
    fn write_gts(&self, val: u32);
}

/// [`SgeRegisters`] backed by the memory-mapped register block.
pub struct MmioSgeRegisters<R> {
    regs: Mutex<R>,
}

impl<R: DerefMut<Target = SgePfRegisters>> MmioSgeRegisters<R> {
    pub fn new(regs: R) -> MmioSgeRegisters<R> {
        MmioSgeRegisters { regs: Mutex::new(regs) }
    }
}

impl<R: DerefMut<Target = SgePfRegisters> + Send> SgeRegisters for MmioSgeRegisters<R> {
    fn write_kdoorbell(&self, val: u32) {
        self.regs.lock().kdoorbell.write(val);
    }

    fn write_gts(&self, val: u32) {
        self.regs.lock().gts.write(val);
    }
}

/// Access to one queue's user doorbell segment.
pub trait UserDoorbell: Send {
    /// Writes the segment's doorbell register.
    fn write_db(&mut self, val: u32);
    /// Copies a whole descriptor into the segment's work-request window.
    fn write_wr(&mut self, desc: &TxDesc);
}

/// [`UserDoorbell`] backed by a mapped BAR2 segment.
pub struct MmioUserDoorbell<R> {
    seg: R,
}

impl<R: DerefMut<Target = UserDoorbellSegment>> MmioUserDoorbell<R> {
    pub fn new(seg: R) -> MmioUserDoorbell<R> {
        MmioUserDoorbell { seg }
    }
}

impl<R: DerefMut<Target = UserDoorbellSegment> + Send> UserDoorbell for MmioUserDoorbell<R> {
    fn write_db(&mut self, val: u32) {
        self.seg.db.write(val);
    }

    fn write_wr(&mut self, desc: &TxDesc) {
        for i in 0..FLITS_PER_DESC {
            // the window takes the descriptor's bytes unchanged
            let mut raw = [0u8; 8];
            raw.copy_from_slice(desc.flit[i].as_bytes());
            self.seg.wr[i].write(u64::from_ne_bytes(raw));
        }
    }
}

/// How a queue rings its doorbell.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DoorbellKind {
    /// The shared kernel doorbell register.
    Kernel,
    /// The queue's user doorbell register.
    User,
    /// The queue's user doorbell register, mapped write-combined.
    UserWc,
    /// Single descriptors are written through the write-combined work-request window;
    /// anything longer goes through the user doorbell register.
    WcWr,
}

/// A queue's doorbell.
pub struct Doorbell {
    kind: DoorbellKind,
    cntxt_id: u32,
    udb_qid: u32,
    regs: Arc<dyn SgeRegisters>,
    udb: Option<Box<dyn UserDoorbell>>,
    rings: u64,
}

impl Doorbell {
    /// `cntxt_id` identifies the queue to the kernel doorbell, `udb_qid` to its user
    /// doorbell segment. The user doorbell kinds need `udb`.
    pub fn new(
        kind: DoorbellKind,
        cntxt_id: u32,
        udb_qid: u32,
        regs: Arc<dyn SgeRegisters>,
        udb: Option<Box<dyn UserDoorbell>>,
    ) -> Result<Doorbell> {
        if kind != DoorbellKind::Kernel && udb.is_none() {
            return Err(SgeError::MissingUserDoorbell);
        }
        Ok(Doorbell { kind, cntxt_id, udb_qid, regs, udb, rings: 0 })
    }

    pub fn kind(&self) -> DoorbellKind {
        self.kind
    }

    /// The number of times the doorbell has been rung.
    pub fn rings(&self) -> u64 {
        self.rings
    }

    /// Tells the SGE that `n` more descriptors are ready. `first` is the first of them;
    /// it is only looked at by [`DoorbellKind::WcWr`].
    pub fn ring(&mut self, n: u16, first: Option<&TxDesc>) {
        if n == 0 {
            return;
        }
        self.rings += 1;
        // descriptors must be visible before the SGE is told about them
        fence(Ordering::SeqCst);

        let udb_val = DoorbellValue { qid: self.udb_qid, pidx: n }.encode();
        match (self.kind, self.udb.as_mut()) {
            (DoorbellKind::WcWr, Some(udb)) => match first {
                Some(desc) if n == 1 => {
                    udb.write_wr(desc);
                    fence(Ordering::SeqCst);
                }
                _ => udb.write_db(udb_val),
            },
            (DoorbellKind::UserWc, Some(udb)) => {
                udb.write_db(udb_val);
                fence(Ordering::SeqCst);
            }
            (DoorbellKind::User, Some(udb)) => udb.write_db(udb_val),
            _ => self.regs.write_kdoorbell(DoorbellValue { qid: self.cntxt_id, pidx: n }.encode()),
        }
        trace!("Doorbell({:?}): queue {} pidx += {}", self.kind, self.cntxt_id, n);
    }

    /// Returns `cidxinc` credits to ingress queue `iqid` and sets its interrupt parameters.
    pub fn gts(regs: &dyn SgeRegisters, iqid: u16, cidxinc: u16, seintarm: u8) {
        regs.write_gts(GtsValue { cidxinc, seintarm, iqid }.encode());
    }
}
