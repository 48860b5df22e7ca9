//! The queue engine of the Chelsio T4/T5 Scatter Gather Engine (SGE).
//!
//! The SGE moves packets between host memory and the adapter through three kinds of rings:
//! * free lists, which the driver stocks with empty receive buffers ([`free_list`]),
//! * ingress queues, where the SGE posts CPL messages and interrupts ([`ingress`]),
//! * egress queues, where the driver writes work requests ([`egress`], [`tx`], [`wrq`]).
//!
//! [`Sge`] owns every queue of one physical function. It routes interrupts to ingress
//! queues, dispatches the CPL messages found there to handlers, and keeps the lists
//! of queues that need attention later: ingress queues that ran out of budget or
//! buffers, free lists that are starving, and egress queues that are stalled.
//! [`Sge::tick()`] should be called periodically to retry the latter two.
//!
//! Locks are always taken in this order: an ingress queue, then an egress queue,
//! then the `Sge`'s own lists. Nothing ever waits on a lock out of order;
//! [`Sge::tick()`] only ever tries.

#![cfg_attr(not(test), no_std)]

extern crate alloc;
#[macro_use] extern crate log;
extern crate spin;
extern crate zerocopy;
extern crate cxgbe_buffers;
extern crate cxgbe_descriptors;

pub mod buf_info;
pub mod config;
pub mod doorbell;
pub mod egress;
pub mod error;
pub mod free_list;
pub mod handlers;
pub mod ingress;
pub mod ring;
pub mod stack;
pub mod tx;
mod txpkts;
pub mod wrq;
#[cfg(test)]
mod hw_model;

use alloc::{
    boxed::Box,
    collections::{BTreeMap, VecDeque},
    sync::Arc,
    vec::Vec,
};
use core::cmp::max;
use cxgbe_buffers::{ClusterZone, ReceivedFrame, TxPacket};
use cxgbe_descriptors::ingress::{IqDesc, CPL_RX_PKT, CPL_SGE_EGR_UPDATE, NUM_CPL_CMDS};
use spin::{Mutex, RwLock};

use crate::{
    buf_info::RxBufTable,
    config::SgeConfig,
    doorbell::{Doorbell, DoorbellKind, SgeRegisters, UserDoorbell},
    egress::EqState,
    error::{Result, SgeError, TxError},
    free_list::{FlParams, FreeList},
    handlers::CplHandler,
    ingress::{IngressQueue, IqCounters, IqParams, ServiceStatus},
    stack::PacketStack,
    tx::{EthTxQueue, ResumeOutcome, TxParams},
    wrq::{WrQueue, WrqParams},
};

/// How a new queue rings its doorbell.
pub struct DoorbellSetup {
    pub kind: DoorbellKind,
    /// The queue's id within its user doorbell segment.
    pub udb_qid: u32,
    pub udb: Option<Box<dyn UserDoorbell>>,
}

impl DoorbellSetup {
    /// The shared kernel doorbell register.
    pub fn kernel() -> DoorbellSetup {
        DoorbellSetup { kind: DoorbellKind::Kernel, udb_qid: 0, udb: None }
    }
}

/// The free list to attach to a new ingress queue.
pub struct FlSetup {
    pub params: FlParams,
    pub doorbell: DoorbellSetup,
}

/// An egress queue of either kind.
#[derive(Clone)]
pub enum EgressRef {
    Eth(Arc<EthTxQueue>),
    Wrq(Arc<WrQueue>),
}

impl EgressRef {
    pub fn cntxt_id(&self) -> u16 {
        match self {
            EgressRef::Eth(txq) => txq.cntxt_id(),
            EgressRef::Wrq(wrq) => wrq.cntxt_id(),
        }
    }
}

/// All queues of one physical function.
pub struct Sge {
    config: SgeConfig,
    buf_table: RxBufTable,
    zones: Vec<Arc<ClusterZone>>,
    regs: Arc<dyn SgeRegisters>,
    stack: Arc<dyn PacketStack>,
    iqs: RwLock<BTreeMap<u16, Arc<IngressQueue>>>,
    iqs_by_abs: RwLock<BTreeMap<u16, Arc<IngressQueue>>>,
    eqs: RwLock<BTreeMap<u16, EgressRef>>,
    handlers: RwLock<[Option<CplHandler>; NUM_CPL_CMDS]>,
    /// Busy ingress queues with work left.
    deferred: Mutex<VecDeque<Arc<IngressQueue>>>,
    /// Ingress queues whose free list is running low.
    starving: Mutex<Vec<Arc<IngressQueue>>>,
    stalled: Mutex<Vec<EgressRef>>,
}

impl Sge {
    /// `zones` are the receive cluster zones, one per entry of `config.zone_sizes`.
    pub fn new(
        config: SgeConfig,
        zones: Vec<Arc<ClusterZone>>,
        regs: Arc<dyn SgeRegisters>,
        stack: Arc<dyn PacketStack>,
    ) -> Result<Sge> {
        config.validate().map_err(SgeError::InvalidConfig)?;
        if zones.len() != config.zone_sizes.len()
            || zones.iter().zip(config.zone_sizes.iter()).any(|(z, &size)| z.size() != size)
        {
            return Err(SgeError::InvalidConfig("cluster zones don't match zone_sizes"));
        }
        let buf_table = RxBufTable::new(&config);
        let mut table: [Option<CplHandler>; NUM_CPL_CMDS] = [None; NUM_CPL_CMDS];
        table[CPL_RX_PKT as usize] = Some(handlers::eth_rx as CplHandler);
        table[CPL_SGE_EGR_UPDATE as usize] = Some(handlers::egr_update as CplHandler);
        info!("Sge: pf {}, {} cluster zones, packing: {}", config.pf, zones.len(), config.buffer_packing);

        Ok(Sge {
            config,
            buf_table,
            zones,
            regs,
            stack,
            iqs: RwLock::new(BTreeMap::new()),
            iqs_by_abs: RwLock::new(BTreeMap::new()),
            eqs: RwLock::new(BTreeMap::new()),
            handlers: RwLock::new(table),
            deferred: Mutex::new(VecDeque::new()),
            starving: Mutex::new(Vec::new()),
            stalled: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &SgeConfig {
        &self.config
    }

    /// Registers the handler for CPL messages with `opcode`.
    pub fn register_handler(&self, opcode: u8, handler: CplHandler) -> Result<()> {
        let mut handlers = self.handlers.write();
        let slot = &mut handlers[opcode as usize];
        if slot.is_some() {
            return Err(SgeError::HandlerExists);
        }
        *slot = Some(handler);
        Ok(())
    }

    fn doorbell(&self, cntxt_id: u16, setup: DoorbellSetup) -> Result<Doorbell> {
        Doorbell::new(setup.kind, cntxt_id as u32, setup.udb_qid, self.regs.clone(), setup.udb)
    }

    /// Creates an ingress queue, and its free list if `fl` is given.
    /// The free list is stocked before the queue is returned.
    pub fn create_iq(&self, params: IqParams, fl: Option<FlSetup>) -> Result<Arc<IngressQueue>> {
        if self.iqs.read().contains_key(&params.cntxt_id) || self.iqs_by_abs.read().contains_key(&params.abs_id) {
            return Err(SgeError::QueueExists);
        }
        let fl = match fl {
            Some(setup) => {
                let db = self.doorbell(setup.params.cntxt_id, setup.doorbell)?;
                Some(FreeList::new(setup.params, &self.config, &self.buf_table, self.zones.clone(), db)?)
            }
            None => None,
        };
        let capacity = fl.as_ref().map_or(0, |fl| fl.capacity());
        let iq = Arc::new(IngressQueue::new(params, &self.config, fl)?);
        if capacity > 0 && iq.refill(capacity) {
            iq.set_starving(true);
            self.add_starving(&iq);
        }

        self.iqs.write().insert(params.cntxt_id, iq.clone());
        self.iqs_by_abs.write().insert(params.abs_id, iq.clone());
        Ok(iq)
    }

    fn collapse_zone(&self) -> Result<Arc<ClusterZone>> {
        self.zones.iter()
            .find(|z| z.size() == self.config.safest_rx_cluster)
            .cloned()
            .ok_or(SgeError::InvalidConfig("no zone of safest_rx_cluster size"))
    }

    pub fn create_eth_txq(&self, params: TxParams, db: DoorbellSetup) -> Result<Arc<EthTxQueue>> {
        if self.eqs.read().contains_key(&params.cntxt_id) {
            return Err(SgeError::QueueExists);
        }
        let db = self.doorbell(params.cntxt_id, db)?;
        let txq = Arc::new(EthTxQueue::new(params, &self.config, db, self.collapse_zone()?)?);
        self.eqs.write().insert(params.cntxt_id, EgressRef::Eth(txq.clone()));
        Ok(txq)
    }

    pub fn create_wrq(&self, params: WrqParams, db: DoorbellSetup) -> Result<Arc<WrQueue>> {
        if self.eqs.read().contains_key(&params.cntxt_id) {
            return Err(SgeError::QueueExists);
        }
        let db = self.doorbell(params.cntxt_id, db)?;
        let wrq = Arc::new(WrQueue::new(params, db)?);
        self.eqs.write().insert(params.cntxt_id, EgressRef::Wrq(wrq.clone()));
        Ok(wrq)
    }

    /// Disables an ingress queue and releases its free list.
    /// Fails with [`SgeError::QueueBusy`] while the queue is being serviced.
    pub fn destroy_iq(&self, cntxt_id: u16) -> Result<()> {
        let iq = self.iq(cntxt_id).ok_or(SgeError::NoSuchQueue)?;
        iq.disable()?;
        self.iqs.write().remove(&cntxt_id);
        self.iqs_by_abs.write().remove(&iq.abs_id());
        self.starving.lock().retain(|q| !Arc::ptr_eq(q, &iq));
        iq.teardown();
        debug!("Sge: destroyed ingress queue {}", cntxt_id);
        Ok(())
    }

    /// Tears down an egress queue, dropping everything it still holds.
    pub fn destroy_eq(&self, cntxt_id: u16) -> Result<()> {
        let eq = self.eqs.write().remove(&cntxt_id).ok_or(SgeError::NoSuchQueue)?;
        match &eq {
            EgressRef::Eth(txq) => txq.teardown(),
            EgressRef::Wrq(wrq) => wrq.teardown(),
        }
        self.stalled.lock().retain(|q| q.cntxt_id() != cntxt_id);
        debug!("Sge: destroyed egress queue {}", cntxt_id);
        Ok(())
    }

    pub fn iq(&self, cntxt_id: u16) -> Option<Arc<IngressQueue>> {
        self.iqs.read().get(&cntxt_id).cloned()
    }

    pub fn eth_txq(&self, cntxt_id: u16) -> Option<Arc<EthTxQueue>> {
        match self.eqs.read().get(&cntxt_id) {
            Some(EgressRef::Eth(txq)) => Some(txq.clone()),
            _ => None,
        }
    }

    pub fn wrq(&self, cntxt_id: u16) -> Option<Arc<WrQueue>> {
        match self.eqs.read().get(&cntxt_id) {
            Some(EgressRef::Wrq(wrq)) => Some(wrq.clone()),
            _ => None,
        }
    }

    /// The interrupt handler of ingress queue `cntxt_id`.
    /// Returns `false` if the queue was already being serviced elsewhere.
    pub fn intr(&self, cntxt_id: u16) -> Result<bool> {
        let iq = self.iq(cntxt_id).ok_or(SgeError::NoSuchQueue)?;
        Ok(self.service_iq(&iq, None).is_some())
    }

    /// Claims `iq` and consumes what the SGE has written to it, then services the
    /// queues it received forwarded interrupts for.
    ///
    /// Returns `None` if the queue couldn't be claimed. A queue that comes back
    /// `InProgress` has been put on the deferred list.
    pub fn service_iq(&self, iq: &Arc<IngressQueue>, budget: Option<usize>) -> Option<ServiceStatus> {
        if !iq.try_begin() {
            return None;
        }
        let mut worklist = Vec::new();
        let (status, _) = iq.service(self, budget, &mut worklist);
        self.settle(iq, status);
        self.run_worklist(worklist);
        Some(status)
    }

    fn settle(&self, iq: &Arc<IngressQueue>, status: ServiceStatus) {
        match status {
            ServiceStatus::Done => iq.finish(),
            ServiceStatus::InProgress => self.deferred.lock().push_back(iq.clone()),
        }
    }

    /// Services queues claimed on behalf of forwarded interrupts. A queue that runs
    /// out of budget goes to the back of the list; one that can't make progress
    /// is deferred.
    fn run_worklist(&self, worklist: Vec<Arc<IngressQueue>>) {
        let mut pending: VecDeque<_> = worklist.into_iter().collect();
        let mut nested = Vec::new();
        while let Some(q) = pending.pop_front() {
            let budget = max(q.size() / 8, 1);
            let (status, progress) = q.service(self, Some(budget), &mut nested);
            match status {
                ServiceStatus::InProgress if progress => pending.push_back(q),
                _ => self.settle(&q, status),
            }
            // forwarded queues don't forward; anything here was claimed by mistake
            for stray in nested.drain(..) {
                stray.finish();
            }
        }
    }

    /// Services every queue that was deferred before this call.
    /// Returns the number of queues serviced.
    pub fn run_deferred(&self) -> usize {
        let n = self.deferred.lock().len();
        let mut serviced = 0;
        for _ in 0..n {
            let iq = match self.deferred.lock().pop_front() {
                Some(iq) => iq,
                None => break,
            };
            let mut worklist = Vec::new();
            let (status, _) = iq.service(self, None, &mut worklist);
            self.settle(&iq, status);
            self.run_worklist(worklist);
            serviced += 1;
        }
        serviced
    }

    /// Queues `pkt` on `txq`. A queue that refuses it for lack of room is retried
    /// by [`Sge::tick()`] and by its egress updates; the stack is told through
    /// [`PacketStack::tx_resumed()`] when it has room again.
    ///
    /// Small packets may be held back to be coalesced with the next ones. They go
    /// out with the next packet that doesn't fit, on [`EthTxQueue::flush()`], or
    /// at the next [`Sge::tick()`].
    pub fn transmit(&self, txq: &Arc<EthTxQueue>, pkt: TxPacket) -> core::result::Result<(), TxError> {
        let result = txq.submit(pkt);
        if let Err(TxError::WouldBlock(_)) = result {
            self.add_stalled(EgressRef::Eth(txq.clone()));
        }
        result
    }

    /// Sends the work request `wr` on `wrq`, queueing it if the ring is full.
    pub fn submit_wr(&self, wrq: &Arc<WrQueue>, wr: &[u8]) -> Result<()> {
        wrq.submit_wr(wr)?;
        if wrq.state() == EqState::Stalled {
            self.add_stalled(EgressRef::Wrq(wrq.clone()));
        }
        Ok(())
    }

    /// Periodic maintenance: refills starving free lists, sends packets held back for
    /// coalescing and retries stalled egress queues.
    /// Queues that are busy right now are left for the next tick.
    pub fn tick(&self) {
        let starving: Vec<_> = self.starving.lock().clone();
        for iq in starving {
            if iq.try_refill_starving() == Some(true) {
                self.starving.lock().retain(|q| !Arc::ptr_eq(q, &iq));
                debug!("Sge: free list of ingress queue {} recovered", iq.cntxt_id());
            }
        }

        let txqs: Vec<_> = self.eqs.read().values()
            .filter_map(|eq| match eq {
                EgressRef::Eth(txq) => Some(txq.clone()),
                EgressRef::Wrq(_) => None,
            })
            .collect();
        for txq in txqs {
            txq.try_flush();
        }

        let stalled: Vec<_> = self.stalled.lock().clone();
        let mut resumed = Vec::new();
        for eq in stalled {
            let done = match &eq {
                EgressRef::Eth(txq) => match txq.try_resume() {
                    Some(ResumeOutcome::Resumed) => {
                        resumed.push(txq.cntxt_id());
                        true
                    }
                    Some(ResumeOutcome::NotStalled) => true,
                    Some(ResumeOutcome::StillStalled) | None => false,
                },
                EgressRef::Wrq(wrq) => wrq.try_drain().is_some() && wrq.state() != EqState::Stalled,
            };
            if done {
                let id = eq.cntxt_id();
                self.stalled.lock().retain(|q| q.cntxt_id() != id);
            }
        }
        for id in resumed {
            self.stack.tx_resumed(id);
        }
    }

    /// The number of ingress queues waiting in the deferred list.
    pub fn deferred_count(&self) -> usize {
        self.deferred.lock().len()
    }

    /// The number of free lists registered as starving.
    pub fn starving_count(&self) -> usize {
        self.starving.lock().len()
    }

    /// The number of egress queues registered as stalled.
    pub fn stalled_count(&self) -> usize {
        self.stalled.lock().len()
    }

    pub(crate) fn regs(&self) -> &dyn SgeRegisters {
        &*self.regs
    }

    pub(crate) fn stack(&self) -> &dyn PacketStack {
        &*self.stack
    }

    pub(crate) fn iq_by_abs(&self, abs_id: u16) -> Option<Arc<IngressQueue>> {
        self.iqs_by_abs.read().get(&abs_id).cloned()
    }

    pub(crate) fn add_starving(&self, iq: &Arc<IngressQueue>) {
        let mut starving = self.starving.lock();
        if !starving.iter().any(|q| Arc::ptr_eq(q, iq)) {
            starving.push(iq.clone());
        }
    }

    fn add_stalled(&self, eq: EgressRef) {
        let mut stalled = self.stalled.lock();
        if !stalled.iter().any(|q| q.cntxt_id() == eq.cntxt_id()) {
            stalled.push(eq);
        }
    }

    /// Hands one CPL message to the handler registered for its opcode.
    pub(crate) fn dispatch(&self, iq: &IngressQueue, desc: &IqDesc, frame: Option<ReceivedFrame>) {
        let opcode = desc.rss.opcode;
        let handler = self.handlers.read()[opcode as usize];
        match handler {
            Some(handler) => handler(self, iq, desc, frame),
            None => {
                error!("IngressQueue {}: no handler for CPL opcode {:#X}", iq.cntxt_id(), opcode);
                IqCounters::inc(&iq.counters.protocol_errors);
            }
        }
    }

    /// Credits egress queue `cntxt_id` after a `CPL_SGE_EGR_UPDATE`.
    pub(crate) fn egress_update(&self, cntxt_id: u16) {
        let eq = match self.eqs.read().get(&cntxt_id) {
            Some(eq) => eq.clone(),
            None => {
                warn!("Sge: egress update for unknown queue {}", cntxt_id);
                return;
            }
        };
        let running = match &eq {
            EgressRef::Eth(txq) => match txq.egress_update() {
                ResumeOutcome::Resumed => {
                    self.stack.tx_resumed(cntxt_id);
                    true
                }
                ResumeOutcome::NotStalled => true,
                ResumeOutcome::StillStalled => false,
            },
            EgressRef::Wrq(wrq) => {
                wrq.egress_update();
                wrq.state() != EqState::Stalled
            }
        };
        if running {
            self.stalled.lock().retain(|q| q.cntxt_id() != cntxt_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw_model::{pattern, rx_pkt_cpl, FakeRegisters, FlDma, IqProducer, RecordingStack};
    use crate::tx::tests::{ipv4_tcp, packet};
    use alloc::vec;
    use cxgbe_buffers::{RxCsumFlags, TxCsumFlags, TxOffload};
    use cxgbe_descriptors::{
        egress::FwEthTxPktWr,
        ingress::{CplSgeEgrUpdate, F_RXF_IP, F_RXF_IP6, F_RXF_TCP, F_RXF_UDP},
        registers::{intr_params, GtsValue, X_TIMERREG_UPDATE_CIDX},
    };
    use zerocopy::AsBytes;

    struct Harness {
        regs: Arc<FakeRegisters>,
        stack: Arc<RecordingStack>,
        zones: Vec<Arc<ClusterZone>>,
        sge: Sge,
    }

    fn harness() -> Harness {
        let regs = FakeRegisters::new();
        let stack = RecordingStack::new();
        let zones = ClusterZone::standard_zones();
        let sge = Sge::new(SgeConfig::default(), zones.clone(), regs.clone(), stack.clone()).unwrap();
        Harness { regs, stack, zones, sge }
    }

    fn iq_params(cntxt_id: u16, size: usize) -> IqParams {
        IqParams {
            cntxt_id, abs_id: cntxt_id + 100, size, timer_idx: 2, pktc_idx: None,
            port: 1, lro: false, forwards_interrupts: false,
        }
    }

    fn fl_setup(cntxt_id: u16, size: usize) -> FlSetup {
        FlSetup {
            params: FlParams { cntxt_id, size, max_payload: 1520, packing: false },
            doorbell: DoorbellSetup::kernel(),
        }
    }

    fn txq(h: &Harness, cntxt_id: u16, iqid: u16) -> Arc<EthTxQueue> {
        h.sge.create_eth_txq(TxParams { cntxt_id, iqid, size: 16, intf: 0 }, DoorbellSetup::kernel()).unwrap()
    }

    fn tso() -> TxOffload {
        TxOffload { csum: TxCsumFlags::IP | TxCsumFlags::TCP, tso_mss: Some(1000), vlan: None }
    }

    /// Fills a 16-descriptor transmit queue until it stalls.
    fn fill(h: &Harness, txq: &Arc<EthTxQueue>) {
        for _ in 0..15 {
            h.sge.transmit(txq, packet(&ipv4_tcp(2000), 4096, tso())).unwrap();
        }
        assert!(matches!(h.sge.transmit(txq, packet(&ipv4_tcp(2000), 4096, tso())), Err(TxError::WouldBlock(_))));
    }

    /// A frame as the SGE places it: pktshift bytes of padding first.
    fn wire(frame: &[u8]) -> Vec<u8> {
        let mut w = vec![0u8; SgeConfig::default().pktshift];
        w.extend_from_slice(frame);
        w
    }

    #[test]
    fn rejects_mismatched_zones() {
        let zones = ClusterZone::standard_zones()[..2].to_vec();
        assert!(matches!(Sge::new(SgeConfig::default(), zones, FakeRegisters::new(), RecordingStack::new()),
            Err(SgeError::InvalidConfig(_))));
    }

    #[test]
    fn duplicate_queues_and_handlers() {
        let h = harness();
        h.sge.create_iq(iq_params(1, 64), None).unwrap();
        assert_eq!(h.sge.create_iq(iq_params(1, 64), None).err(), Some(SgeError::QueueExists));
        txq(&h, 9, 1);
        assert!(matches!(h.sge.create_wrq(WrqParams { cntxt_id: 9, iqid: 1, size: 16 }, DoorbellSetup::kernel()),
            Err(SgeError::QueueExists)));
        assert_eq!(h.sge.register_handler(CPL_RX_PKT, handlers::eth_rx), Err(SgeError::HandlerExists));
        assert!(h.sge.wrq(9).is_none());
        assert!(h.sge.eth_txq(9).is_some());
    }

    #[test]
    fn returns_credits_and_follows_generation() {
        let h = harness();
        let iq = h.sge.create_iq(iq_params(1, 64), None).unwrap();
        let txq = txq(&h, 9, 1);
        let mut producer = IqProducer::new();
        for _ in 0..10 {
            producer.post_cpl(&iq, CPL_SGE_EGR_UPDATE, &CplSgeEgrUpdate::new(9, 0, 0));
        }
        assert_eq!(h.sge.intr(1), Ok(true));
        let cidx_upd = intr_params(X_TIMERREG_UPDATE_CIDX, false);
        assert_eq!(h.regs.gts(), vec![
            GtsValue { cidxinc: 4, seintarm: cidx_upd, iqid: 1 },
            GtsValue { cidxinc: 4, seintarm: cidx_upd, iqid: 1 },
            GtsValue { cidxinc: 2, seintarm: intr_params(2, false), iqid: 1 },
        ]);
        assert_eq!(txq.eq_stats().egr_updates, 10);

        // wraps around the ring, flipping the generation bit
        for _ in 0..60 {
            producer.post_cpl(&iq, CPL_SGE_EGR_UPDATE, &CplSgeEgrUpdate::new(9, 0, 0));
        }
        h.sge.intr(1).unwrap();
        assert_eq!(txq.eq_stats().egr_updates, 70);
        assert_eq!(iq.cidx(), 6);
        assert_eq!(iq.stats().descs, 70);

        // nothing new: only the interrupt is re-armed
        h.regs.clear();
        h.sge.intr(1).unwrap();
        assert_eq!(h.regs.gts(), vec![GtsValue { cidxinc: 0, seintarm: intr_params(2, false), iqid: 1 }]);
        assert_eq!(iq.state(), ingress::IqState::Idle);
    }

    #[test]
    fn budgeted_service_is_deferred() {
        let h = harness();
        let iq = h.sge.create_iq(iq_params(1, 64), None).unwrap();
        txq(&h, 9, 1);
        let mut producer = IqProducer::new();
        for _ in 0..10 {
            producer.post_cpl(&iq, CPL_SGE_EGR_UPDATE, &CplSgeEgrUpdate::new(9, 0, 0));
        }
        assert_eq!(h.sge.service_iq(&iq, Some(4)), Some(ServiceStatus::InProgress));
        assert_eq!(iq.cidx(), 4);
        assert_eq!(h.sge.deferred_count(), 1);
        assert_eq!(h.sge.intr(1), Ok(false));
        assert_eq!(h.sge.run_deferred(), 1);
        assert_eq!(iq.cidx(), 10);
        assert_eq!(iq.state(), ingress::IqState::Idle);
    }

    #[test]
    fn unknown_opcode_is_skipped() {
        let h = harness();
        let iq = h.sge.create_iq(iq_params(1, 64), None).unwrap();
        let mut producer = IqProducer::new();
        producer.post_cpl(&iq, 0x77, &CplSgeEgrUpdate::new(9, 0, 0));
        producer.post_cpl(&iq, CPL_SGE_EGR_UPDATE, &CplSgeEgrUpdate::new(300, 0, 0));
        h.sge.intr(1).unwrap();
        assert_eq!(iq.stats().protocol_errors, 1);
        assert_eq!(iq.cidx(), 2);
    }

    #[test]
    fn receives_frames_with_metadata() {
        let h = harness();
        let iq = h.sge.create_iq(iq_params(1, 64), Some(fl_setup(50, 64))).unwrap();
        assert_eq!(iq.with_free_list(|fl| fl.occupancy()), 63);
        let mut producer = IqProducer::new();
        let mut dma = FlDma::new();

        let v4 = pattern(1000, 1);
        let mut cpl = rx_pkt_cpl(v4.len());
        cpl.set_flags(false, true, true, 1);
        cpl.vlan.set(7);
        cpl.l2info.set(F_RXF_IP | F_RXF_TCP);
        producer.post_rx(&iq, &mut dma, &cpl, &wire(&v4));

        let v6 = pattern(300, 2);
        let mut cpl = rx_pkt_cpl(v6.len());
        cpl.set_flags(false, false, true, 1);
        cpl.l2info.set(F_RXF_IP6 | F_RXF_UDP);
        producer.post_rx(&iq, &mut dma, &cpl, &wire(&v6));

        let bad = pattern(60, 3);
        let mut cpl = rx_pkt_cpl(bad.len());
        cpl.set_flags(false, false, true, 1);
        cpl.l2info.set(F_RXF_IP | F_RXF_TCP);
        cpl.err_vec.set(1);
        producer.post_rx(&iq, &mut dma, &cpl, &wire(&bad));

        h.sge.intr(1).unwrap();
        let delivered = h.stack.delivered.lock();
        assert_eq!(delivered.len(), 3);
        assert_eq!(delivered[0].to_vec(), v4);
        assert_eq!(delivered[0].meta.csum, RxCsumFlags::IP_CHECKED | RxCsumFlags::IP_VALID | RxCsumFlags::L4_VALID);
        assert_eq!(delivered[0].meta.vlan, Some(7));
        assert_eq!((delivered[0].meta.iq, delivered[0].meta.port), (1, 1));
        assert_eq!(delivered[1].to_vec(), v6);
        assert_eq!(delivered[1].meta.csum, RxCsumFlags::L4_VALID);
        assert_eq!(delivered[1].meta.vlan, None);
        assert_eq!(delivered[2].meta.csum, RxCsumFlags::empty());
        assert_eq!(iq.stats().rx_frames, 3);
    }

    #[test]
    fn length_mismatch_drops_the_frame() {
        let h = harness();
        let iq = h.sge.create_iq(iq_params(1, 64), Some(fl_setup(50, 64))).unwrap();
        let mut producer = IqProducer::new();
        let mut dma = FlDma::new();
        let frame = pattern(500, 4);
        producer.post_rx(&iq, &mut dma, &rx_pkt_cpl(400), &wire(&frame));
        producer.post_rx(&iq, &mut dma, &rx_pkt_cpl(500), &wire(&frame));
        h.sge.intr(1).unwrap();
        assert_eq!(iq.stats().rx_errors, 1);
        assert_eq!(h.stack.delivered(), 1);
        assert_eq!(iq.cidx(), 2);
    }

    #[test]
    fn tcp_frames_go_to_lro() {
        let h = harness();
        let params = IqParams { lro: true, ..iq_params(1, 64) };
        let iq = h.sge.create_iq(params, Some(fl_setup(50, 64))).unwrap();
        let mut producer = IqProducer::new();
        let mut dma = FlDma::new();
        for (i, l2info) in [F_RXF_IP | F_RXF_TCP, F_RXF_IP | F_RXF_UDP, F_RXF_IP6 | F_RXF_TCP].iter().enumerate() {
            let frame = pattern(800, i as u8);
            let mut cpl = rx_pkt_cpl(frame.len());
            cpl.l2info.set(*l2info);
            producer.post_rx(&iq, &mut dma, &cpl, &wire(&frame));
        }
        h.sge.intr(1).unwrap();
        assert_eq!(h.stack.lro.lock().len(), 2);
        assert_eq!(h.stack.delivered(), 1);
        assert_eq!(iq.stats().lro_queued, 2);
        assert!(h.stack.lro_flushes.load(core::sync::atomic::Ordering::Relaxed) >= 1);
    }

    #[test]
    fn forwarded_interrupts_service_the_target() {
        let h = harness();
        let fwd = h.sge.create_iq(IqParams { forwards_interrupts: true, ..iq_params(1, 64) }, None).unwrap();
        let target = h.sge.create_iq(iq_params(2, 64), None).unwrap();
        let txq = txq(&h, 9, 2);

        let mut fwd_producer = IqProducer::new();
        let mut producer = IqProducer::new();
        for _ in 0..20 {
            producer.post_cpl(&target, CPL_SGE_EGR_UPDATE, &CplSgeEgrUpdate::new(9, 0, 0));
        }
        fwd_producer.post_intr(&fwd, target.abs_id());
        h.sge.intr(1).unwrap();
        // serviced in two rounds of 64 / 8 entries and a last one
        assert_eq!(target.cidx(), 20);
        assert_eq!(txq.eq_stats().egr_updates, 20);
        assert_eq!(target.state(), ingress::IqState::Idle);
        assert_eq!(fwd.stats().forwarded, 1);

        // a queue someone else is servicing is left alone
        producer.post_cpl(&target, CPL_SGE_EGR_UPDATE, &CplSgeEgrUpdate::new(9, 0, 0));
        assert!(target.try_begin());
        fwd_producer.post_intr(&fwd, target.abs_id());
        h.sge.intr(1).unwrap();
        assert_eq!(target.cidx(), 20);
        target.finish();
    }

    #[test]
    fn starving_free_list_recovers_in_one_tick() {
        let h = harness();
        h.zones[0].set_limit(Some(2));
        h.zones[1].set_limit(Some(0));
        let iq = h.sge.create_iq(iq_params(1, 64), Some(fl_setup(50, 64))).unwrap();
        assert_eq!(h.sge.starving_count(), 1);

        let mut producer = IqProducer::new();
        let mut dma = FlDma::new();
        let frame = pattern(5000, 5);
        producer.post_rx(&iq, &mut dma, &rx_pkt_cpl(frame.len()), &wire(&frame));
        assert!(dma.is_stuck());

        // the frame can't be completed; the queue keeps it and waits
        h.sge.intr(1).unwrap();
        assert_eq!(h.sge.deferred_count(), 1);
        assert_eq!(iq.state(), ingress::IqState::Busy);
        assert_eq!(iq.cidx(), 0);

        h.zones[0].set_limit(None);
        h.zones[1].set_limit(None);
        h.sge.tick();
        assert_eq!(h.sge.starving_count(), 0);
        assert!(iq.with_free_list(|fl| fl.not_running_low()));

        iq.with_free_list(|fl| dma.resume(fl));
        assert_eq!(h.sge.run_deferred(), 1);
        assert_eq!(h.stack.delivered.lock()[0].to_vec(), frame);
        assert_eq!(iq.state(), ingress::IqState::Idle);
        assert_eq!(h.sge.deferred_count(), 0);
    }

    #[test]
    fn egress_update_resumes_a_stalled_queue() {
        let h = harness();
        let iq = h.sge.create_iq(iq_params(1, 64), None).unwrap();
        let txq = txq(&h, 9, 1);
        fill(&h, &txq);
        assert_eq!(h.sge.stalled_count(), 1);
        assert_eq!(txq.hw_consume().len(), 15);

        IqProducer::new().post_cpl(&iq, CPL_SGE_EGR_UPDATE, &CplSgeEgrUpdate::new(9, 15, 15));
        h.sge.intr(1).unwrap();
        assert_eq!(txq.state(), EqState::Running);
        assert_eq!(h.sge.stalled_count(), 0);
        assert_eq!(*h.stack.resumed.lock(), vec![9]);
    }

    #[test]
    fn tick_sends_held_packets() {
        let h = harness();
        h.sge.create_iq(iq_params(1, 64), None).unwrap();
        let txq = txq(&h, 9, 1);
        h.sge.transmit(&txq, packet(&pattern(1000, 0), 2000, TxOffload::default())).unwrap();
        // held back for coalescing, the SGE hasn't been told about anything
        assert!(txq.hw_consume().is_empty());
        assert!(h.regs.kdoorbells().is_empty());

        h.sge.tick();
        let wrs = txq.hw_consume();
        assert_eq!(wrs.len(), 1);
        assert_eq!(h.regs.kdoorbells().len(), 1);
    }

    #[test]
    fn tick_resumes_a_stalled_queue() {
        let h = harness();
        h.sge.create_iq(iq_params(1, 64), None).unwrap();
        let txq = txq(&h, 9, 1);
        fill(&h, &txq);
        h.sge.tick();
        assert_eq!(h.sge.stalled_count(), 1);

        txq.hw_consume();
        h.sge.tick();
        assert_eq!(h.sge.stalled_count(), 0);
        assert_eq!(*h.stack.resumed.lock(), vec![9]);
        h.sge.transmit(&txq, packet(&ipv4_tcp(2000), 4096, tso())).unwrap();
    }

    #[test]
    fn work_requests_drain_on_egress_update() {
        let h = harness();
        let iq = h.sge.create_iq(iq_params(1, 64), None).unwrap();
        let wrq = h.sge.create_wrq(WrqParams { cntxt_id: 12, iqid: 1, size: 16 }, DoorbellSetup::kernel()).unwrap();
        let mut wr = vec![0u8; 192];
        wr[..16].copy_from_slice(FwEthTxPktWr::new(0, 12).as_bytes());
        for _ in 0..7 {
            h.sge.submit_wr(&wrq, &wr).unwrap();
        }
        assert_eq!(wrq.pending(), 2);
        assert_eq!(h.sge.stalled_count(), 1);

        wrq.hw_consume();
        IqProducer::new().post_cpl(&iq, CPL_SGE_EGR_UPDATE, &CplSgeEgrUpdate::new(12, 0, 0));
        h.sge.intr(1).unwrap();
        assert_eq!(wrq.pending(), 0);
        assert_eq!(wrq.state(), EqState::Running);
        assert_eq!(h.sge.stalled_count(), 0);
    }

    #[test]
    fn destroying_queues() {
        let h = harness();
        h.zones[0].set_limit(Some(2));
        h.zones[1].set_limit(Some(0));
        let iq = h.sge.create_iq(iq_params(1, 64), Some(fl_setup(50, 64))).unwrap();
        assert_eq!(h.sge.starving_count(), 1);

        assert!(iq.try_begin());
        assert_eq!(h.sge.destroy_iq(1), Err(SgeError::QueueBusy));
        iq.finish();
        h.sge.destroy_iq(1).unwrap();
        assert_eq!(h.sge.starving_count(), 0);
        assert_eq!(h.zones[0].outstanding(), 0);
        assert_eq!(h.sge.intr(1), Err(SgeError::NoSuchQueue));
        assert_eq!(h.sge.destroy_iq(1), Err(SgeError::NoSuchQueue));

        let txq = txq(&h, 9, 1);
        fill(&h, &txq);
        h.sge.destroy_eq(9).unwrap();
        assert_eq!(h.sge.stalled_count(), 0);
        assert_eq!(txq.state(), EqState::Doomed);
        assert!(h.sge.eth_txq(9).is_none());
    }
}
