//! Handlers for the CPL messages the queue engine understands itself.
//!
//! Handlers run inside the service loop of the ingress queue the message arrived on,
//! with that queue's lock held.

use cxgbe_buffers::{ReceivedFrame, RxCsumFlags};
use cxgbe_descriptors::ingress::{CplRxPkt, CplSgeEgrUpdate, IqDesc, F_RXF_IP, F_RXF_IP6, F_RXF_TCP};

use crate::{
    ingress::{IngressQueue, IqCounters},
    Sge,
};

/// Handles one CPL message. The frame is present when the message came with
/// free-list payload.
pub type CplHandler = fn(&Sge, &IngressQueue, &IqDesc, Option<ReceivedFrame>);

/// `CPL_RX_PKT`: an Ethernet frame.
pub(crate) fn eth_rx(sge: &Sge, iq: &IngressQueue, desc: &IqDesc, frame: Option<ReceivedFrame>) {
    let (mut frame, cpl) = match (frame, desc.cpl_as::<CplRxPkt>()) {
        (Some(frame), Some(cpl)) => (frame, cpl),
        _ => {
            error!("IngressQueue {}: CPL_RX_PKT without payload", iq.cntxt_id());
            IqCounters::inc(&iq.counters.protocol_errors);
            return;
        }
    };

    let pktshift = sge.config().pktshift;
    let len = cpl.len.get() as usize;
    if frame.len() != len + pktshift {
        warn!("IngressQueue {}: {}-byte payload for a {}-byte frame", iq.cntxt_id(), frame.len(), len);
        IqCounters::inc(&iq.counters.rx_errors);
        return;
    }
    frame.trim_front(pktshift);

    frame.meta.iq = iq.cntxt_id();
    frame.meta.port = iq.port();
    let l2info = cpl.l2info.get();
    if cpl.csum_calc() && cpl.err_vec.get() == 0 {
        if l2info & F_RXF_IP != 0 {
            frame.meta.csum = RxCsumFlags::IP_CHECKED | RxCsumFlags::IP_VALID | RxCsumFlags::L4_VALID;
        } else if l2info & F_RXF_IP6 != 0 {
            frame.meta.csum = RxCsumFlags::L4_VALID;
        }
    }
    if cpl.vlan_ex() {
        frame.meta.vlan = Some(cpl.vlan.get());
    }
    IqCounters::inc(&iq.counters.rx_frames);

    let stack = sge.stack();
    if iq.lro() && l2info & F_RXF_TCP != 0 {
        match stack.lro_enqueue(iq.cntxt_id(), frame) {
            None => IqCounters::inc(&iq.counters.lro_queued),
            Some(frame) => stack.deliver(frame),
        }
    } else {
        stack.deliver(frame);
    }
}

/// `CPL_SGE_EGR_UPDATE`: the SGE reports progress on an egress queue.
pub(crate) fn egr_update(sge: &Sge, iq: &IngressQueue, desc: &IqDesc, _frame: Option<ReceivedFrame>) {
    match desc.cpl_as::<CplSgeEgrUpdate>() {
        Some(cpl) => sge.egress_update(cpl.qid() as u16),
        None => IqCounters::inc(&iq.counters.protocol_errors),
    }
}
