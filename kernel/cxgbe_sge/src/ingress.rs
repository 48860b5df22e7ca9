//! Ingress queues: rings of 64-byte responses written by the SGE.
//!
//! The SGE writes each entry with the queue's current generation bit, and flips the
//! bit every time it wraps around the ring, so the driver can tell fresh entries from
//! stale ones without reading any register. Consumed entries are handed back with a
//! `SGE_PF_GTS` write, which also re-arms the queue's interrupt.
//!
//! A queue is serviced by one thread at a time. Whoever moves it from `Idle` to
//! `Busy` owns it until it goes back to `Idle`; anyone else just returns.

use alloc::{sync::Arc, vec::Vec};
use core::cmp::{max, min};
use core::sync::atomic::{fence, AtomicU64, AtomicU8, Ordering};
use cxgbe_descriptors::{
    ingress::{IqDesc, RspType},
    registers::{intr_params, M_CIDXINC, SGE_NCOUNTERS, SGE_NTIMERS, X_TIMERREG_UPDATE_CIDX},
};
use spin::Mutex;

use crate::{
    config::SgeConfig,
    doorbell::Doorbell,
    error::{Result, SgeError},
    free_list::{FreeList, Payload},
    ring::{DescRing, RingIndex},
    Sge,
};

/// Free-list slots consumed before the service loop refills in-line.
const FL_INLINE_REFILL: usize = 32;
/// How many buffers the service loop posts when it stops.
const FL_EXIT_REFILL: usize = 64;

/// The ownership state of an ingress queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum IqState {
    Idle = 0,
    Busy = 1,
    Disabled = 2,
}

impl IqState {
    fn from_u8(v: u8) -> IqState {
        match v {
            0 => IqState::Idle,
            1 => IqState::Busy,
            _ => IqState::Disabled,
        }
    }
}

/// Whether a service call consumed everything the SGE had written.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceStatus {
    Done,
    /// The queue still has work; it stays `Busy` until it is serviced again.
    InProgress,
}

/// What the creator of an ingress queue decides.
#[derive(Clone, Copy, Debug)]
pub struct IqParams {
    pub cntxt_id: u16,
    /// The id the SGE uses for the queue in forwarded interrupts.
    pub abs_id: u16,
    /// The number of entries, a multiple of 16.
    pub size: usize,
    /// Index into the configuration's holdoff timers.
    pub timer_idx: u8,
    /// Index into the configuration's packet-count thresholds, if one is used.
    pub pktc_idx: Option<u8>,
    pub port: u8,
    /// Whether received TCP frames are offered to large receive offload.
    pub lro: bool,
    /// Whether this queue receives interrupts forwarded from other queues.
    pub forwards_interrupts: bool,
}

/// What the firmware needs to know when it allocates a free list for the queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlFirmwareParams {
    pub cntxt_id: u16,
    pub size: usize,
    pub hwidx: u8,
    pub packing: bool,
}

/// What the firmware needs to know when it allocates the queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IqFirmwareParams {
    pub size: usize,
    pub intr_params: u8,
    pub pktc_idx: Option<u8>,
    pub cong_drop: i8,
    pub fl: Option<FlFirmwareParams>,
}

/// Per-queue counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IqStats {
    pub descs: u64,
    pub rx_frames: u64,
    /// Frames discarded because they didn't match their CPL.
    pub rx_errors: u64,
    /// Entries with an unknown response type or opcode.
    pub protocol_errors: u64,
    /// Interrupts forwarded to other queues.
    pub forwarded: u64,
    pub lro_queued: u64,
}

#[derive(Default)]
pub(crate) struct IqCounters {
    pub descs: AtomicU64,
    pub rx_frames: AtomicU64,
    pub rx_errors: AtomicU64,
    pub protocol_errors: AtomicU64,
    pub forwarded: AtomicU64,
    pub lro_queued: AtomicU64,
}

impl IqCounters {
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

struct IqCore {
    ring: DescRing<IqDesc>,
    cidx: RingIndex,
    /// The generation bit of entries the SGE has not yet wrapped over.
    gen: u8,
    fl: Option<FreeList>,
}

/// An ingress queue and its optional free list.
pub struct IngressQueue {
    cntxt_id: u16,
    abs_id: u16,
    size: usize,
    port: u8,
    lro: bool,
    forwards_interrupts: bool,
    intr_params: u8,
    pktc_idx: Option<u8>,
    cong_drop: i8,
    state: AtomicU8,
    core: Mutex<IqCore>,
    pub(crate) counters: IqCounters,
}

impl IngressQueue {
    pub fn new(params: IqParams, config: &SgeConfig, fl: Option<FreeList>) -> Result<IngressQueue> {
        if params.size < 16 || params.size % 16 != 0 || params.size > 65520 {
            return Err(SgeError::InvalidQueueSize);
        }
        if params.timer_idx as usize >= SGE_NTIMERS {
            return Err(SgeError::InvalidConfig("holdoff timer index out of range"));
        }
        if params.pktc_idx.map_or(false, |i| i as usize >= SGE_NCOUNTERS) {
            return Err(SgeError::InvalidConfig("packet-count threshold index out of range"));
        }
        debug!("IngressQueue {}: {} entries, abs id {}, free list: {:?}",
            params.cntxt_id, params.size, params.abs_id, fl.as_ref().map(|fl| fl.cntxt_id()));
        Ok(IngressQueue {
            cntxt_id: params.cntxt_id,
            abs_id: params.abs_id,
            size: params.size,
            port: params.port,
            lro: params.lro,
            forwards_interrupts: params.forwards_interrupts,
            intr_params: intr_params(params.timer_idx, params.pktc_idx.is_some()),
            pktc_idx: params.pktc_idx,
            cong_drop: config.congestion_policy.firmware_value(),
            state: AtomicU8::new(IqState::Idle as u8),
            core: Mutex::new(IqCore {
                ring: DescRing::new(params.size),
                cidx: RingIndex::new(params.size),
                gen: 1,
                fl,
            }),
            counters: IqCounters::default(),
        })
    }

    pub fn cntxt_id(&self) -> u16 {
        self.cntxt_id
    }

    pub fn abs_id(&self) -> u16 {
        self.abs_id
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn port(&self) -> u8 {
        self.port
    }

    pub fn lro(&self) -> bool {
        self.lro
    }

    pub fn state(&self) -> IqState {
        IqState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn stats(&self) -> IqStats {
        let c = &self.counters;
        IqStats {
            descs: c.descs.load(Ordering::Relaxed),
            rx_frames: c.rx_frames.load(Ordering::Relaxed),
            rx_errors: c.rx_errors.load(Ordering::Relaxed),
            protocol_errors: c.protocol_errors.load(Ordering::Relaxed),
            forwarded: c.forwarded.load(Ordering::Relaxed),
            lro_queued: c.lro_queued.load(Ordering::Relaxed),
        }
    }

    pub fn firmware_params(&self) -> IqFirmwareParams {
        let core = self.core.lock();
        IqFirmwareParams {
            size: self.size,
            intr_params: self.intr_params,
            pktc_idx: self.pktc_idx,
            cong_drop: self.cong_drop,
            fl: core.fl.as_ref().map(|fl| FlFirmwareParams {
                cntxt_id: fl.cntxt_id(),
                size: fl.capacity(),
                hwidx: fl.layout().hwidx,
                packing: fl.is_packing(),
            }),
        }
    }

    pub fn has_free_list(&self) -> bool {
        self.core.lock().fl.is_some()
    }

    /// Claims the queue for servicing. Fails if someone else has it or it is disabled.
    pub fn try_begin(&self) -> bool {
        self.state
            .compare_exchange(IqState::Idle as u8, IqState::Busy as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Gives up a queue claimed with [`IngressQueue::try_begin()`].
    pub fn finish(&self) {
        if self.state
            .compare_exchange(IqState::Busy as u8, IqState::Idle as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            error!("IngressQueue {}: finish() on a queue that wasn't busy ({:?})", self.cntxt_id, self.state());
        }
    }

    /// Moves an idle queue to `Disabled`, where it stays.
    pub fn disable(&self) -> Result<()> {
        match self.state.compare_exchange(
            IqState::Idle as u8, IqState::Disabled as u8, Ordering::AcqRel, Ordering::Acquire,
        ) {
            Ok(_) => Ok(()),
            Err(v) if v == IqState::Busy as u8 => Err(SgeError::QueueBusy),
            Err(_) => Err(SgeError::QueueDisabled),
        }
    }

    /// Posts `n` buffers to the queue's free list.
    /// Returns `true` if the list should be registered as starving.
    pub(crate) fn refill(&self, n: usize) -> bool {
        self.core.lock().fl.as_mut().map_or(false, |fl| fl.refill(n))
    }

    /// Refill attempt for a starving list that gives up if the queue is busy.
    /// Returns `Some(true)` once the list has enough buffers to leave the starving list.
    pub(crate) fn try_refill_starving(&self) -> Option<bool> {
        let mut core = self.core.try_lock()?;
        let fl = match core.fl.as_mut() {
            Some(fl) if !fl.is_doomed() => fl,
            _ => return Some(true),
        };
        fl.refill(fl.starving_refill_amount());
        if fl.not_running_low() {
            fl.set_starving(false);
            Some(true)
        } else {
            Some(false)
        }
    }

    pub(crate) fn set_starving(&self, starving: bool) {
        if let Some(fl) = self.core.lock().fl.as_mut() {
            fl.set_starving(starving);
        }
    }

    /// Frees the free list's buffers for good.
    pub(crate) fn teardown(&self) {
        if let Some(fl) = self.core.lock().fl.as_mut() {
            fl.teardown();
        }
    }

    /// Consumes entries until none are left or the limit is reached.
    ///
    /// With a `budget`, at most `budget` entries are consumed and the call returns
    /// `InProgress` when it runs out. Without one, credits are returned every
    /// `size / 16` entries and the loop keeps going.
    /// Queues named by forwarded interrupts are claimed and pushed onto `worklist`.
    /// The second value tells whether any entry was consumed.
    pub(crate) fn service(
        self: &Arc<Self>,
        sge: &Sge,
        budget: Option<usize>,
        worklist: &mut Vec<Arc<IngressQueue>>,
    ) -> (ServiceStatus, bool) {
        let limit = min(budget.unwrap_or(max(self.size / 16, 1)), M_CIDXINC as usize);
        let mut core = self.core.lock();
        let mut ndescs = 0;
        let mut progress = false;
        let mut starved = false;

        loop {
            let desc = *core.ring.get(core.cidx);
            if desc.rsp.generation() != core.gen {
                break;
            }
            // the rest of the entry is only valid once the generation bit matches
            fence(Ordering::Acquire);

            match desc.rsp.rsp_type() {
                Ok(RspType::FlBuf) => match core.fl.as_mut() {
                    Some(fl) => {
                        if fl.consumed_since_refill() > FL_INLINE_REFILL && fl.refill(FL_INLINE_REFILL) {
                            fl.set_starving(true);
                            sge.add_starving(self);
                        }
                        match fl.get_payload(desc.rsp.len() as usize, desc.rsp.is_new_buf()) {
                            Payload::Frame(frame) => sge.dispatch(self, &desc, Some(frame)),
                            Payload::Incomplete => {
                                starved = true;
                                break;
                            }
                        }
                    }
                    None => {
                        error!("IngressQueue {}: free-list response on a queue without a free list", self.cntxt_id);
                        IqCounters::inc(&self.counters.protocol_errors);
                    }
                },
                Ok(RspType::Cpl) => sge.dispatch(self, &desc, None),
                Ok(RspType::Intr) => {
                    if self.forwards_interrupts {
                        self.forward(sge, desc.rsp.qid(), worklist);
                    } else {
                        error!("IngressQueue {}: forwarded interrupt on a queue that doesn't forward", self.cntxt_id);
                        IqCounters::inc(&self.counters.protocol_errors);
                    }
                }
                Err(t) => {
                    error!("IngressQueue {}: unknown response type {} at {}", self.cntxt_id, t, core.cidx.pos());
                    IqCounters::inc(&self.counters.protocol_errors);
                }
            }

            if core.cidx.advance(1) {
                core.gen ^= 1;
            }
            ndescs += 1;
            progress = true;
            IqCounters::inc(&self.counters.descs);

            if ndescs >= limit {
                Doorbell::gts(sge.regs(), self.cntxt_id, ndescs as u16, intr_params(X_TIMERREG_UPDATE_CIDX, false));
                ndescs = 0;
                if self.lro {
                    sge.stack().lro_flush(self.cntxt_id);
                }
                if budget.is_some() {
                    if let Some(fl) = core.fl.as_mut() {
                        if fl.refill(FL_INLINE_REFILL) {
                            fl.set_starving(true);
                            sge.add_starving(self);
                        }
                    }
                    return (ServiceStatus::InProgress, progress);
                }
            }
        }

        if self.lro {
            sge.stack().lro_flush(self.cntxt_id);
        }
        Doorbell::gts(sge.regs(), self.cntxt_id, ndescs as u16, self.intr_params);
        if let Some(fl) = core.fl.as_mut() {
            if fl.refill(FL_EXIT_REFILL) {
                fl.set_starving(true);
                sge.add_starving(self);
            }
        }
        trace!("IngressQueue {}: serviced, cidx {}", self.cntxt_id, core.cidx.pos());
        let status = if starved { ServiceStatus::InProgress } else { ServiceStatus::Done };
        (status, progress)
    }

    fn forward(&self, sge: &Sge, abs_id: u32, worklist: &mut Vec<Arc<IngressQueue>>) {
        let target = match sge.iq_by_abs(abs_id as u16) {
            Some(q) => q,
            None => {
                warn!("IngressQueue {}: forwarded interrupt for unknown queue {}", self.cntxt_id, abs_id);
                return;
            }
        };
        if target.forwards_interrupts {
            error!("IngressQueue {}: interrupt forwarded to forwarding queue {}", self.cntxt_id, abs_id);
            IqCounters::inc(&self.counters.protocol_errors);
            return;
        }
        IqCounters::inc(&self.counters.forwarded);
        if target.try_begin() {
            worklist.push(target);
        }
    }
}

#[cfg(test)]
impl IngressQueue {
    /// The SGE writes entry `pidx`.
    pub(crate) fn hw_write_desc(&self, pidx: usize, desc: IqDesc) {
        let mut core = self.core.lock();
        let idx = RingIndex::at(pidx, self.size);
        *core.ring.get_mut(idx) = desc;
    }

    pub(crate) fn with_free_list<R>(&self, f: impl FnOnce(&FreeList) -> R) -> R {
        let core = self.core.lock();
        f(core.fl.as_ref().expect("queue has no free list"))
    }

    pub(crate) fn cidx(&self) -> usize {
        self.core.lock().cidx.pos()
    }
}
