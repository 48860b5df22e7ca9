//! Ethernet transmit queues.
//!
//! Every packet becomes either a `FW_ETH_TX_PKT_WR` of its own, or one entry of a
//! `FW_ETH_TX_PKTS_WR` that carries several packets (see [`crate::txpkts`]).
//! Short packets are copied into the work request as immediate data; everything
//! else is referenced through a scatter-gather list, and the packet stays alive in
//! the ring's software state until the SGE has read it.

use alloc::{sync::Arc, vec, vec::Vec};
use cxgbe_buffers::{ClusterZone, TxOffload, TxPacket};
use cxgbe_descriptors::{
    egress::{CplTxPktCore, CplTxPktLsoCore, CsumType, FwEthTxPktWr, TxPktCtrl1, TxPktsType, ETHER_HDR_LEN},
    len16, len16_to_ndesc,
    sgl::{Sgl, TX_SGL_SEGS, TX_SGL_SEGS_TSO},
    FLIT_SIZE,
};
use spin::Mutex;
use zerocopy::AsBytes;

use crate::{
    config::SgeConfig,
    doorbell::Doorbell,
    egress::{EgressQueue, EqParams, EqState, EqStats},
    error::{Result, TxDropReason, TxError},
    txpkts::{TxPkts, TxPktsWr},
};

const ETHERTYPE_IP: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86DD;
const ETHERTYPE_VLAN: u16 = 0x8100;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

/// Enough for a tagged Ethernet header, an IPv4 header with options and a TCP header with options.
const MAX_HDR_LEN: usize = 18 + 60 + 60;

/// Completed descriptors reclaimed on every submit.
const TX_RECLAIM_BATCH: usize = 32;

/// Header lengths and protocols of an outbound frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PktHeaders {
    pub l2hlen: usize,
    pub l3hlen: usize,
    /// Zero unless the L4 protocol is TCP or UDP.
    pub l4hlen: usize,
    pub ipv6: bool,
    pub l4proto: u8,
    /// The L4 length, as the IP header states it.
    pub l4len: usize,
}

fn be16(b: &[u8], at: usize) -> Option<u16> {
    Some(u16::from_be_bytes([*b.get(at)?, *b.get(at + 1)?]))
}

/// Finds the L2, L3 and L4 headers at the start of `pkt`.
/// Returns `None` for anything but (optionally tagged) IPv4 and IPv6.
pub fn parse_headers(pkt: &TxPacket) -> Option<PktHeaders> {
    let mut buf = [0u8; MAX_HDR_LEN];
    let n = pkt.copy_prefix(&mut buf);
    let hdr = &buf[..n];

    let mut l2hlen = ETHER_HDR_LEN;
    let mut ethertype = be16(hdr, 12)?;
    if ethertype == ETHERTYPE_VLAN {
        l2hlen += 4;
        ethertype = be16(hdr, 16)?;
    }

    let (l3hlen, ipv6, l4proto, l4len) = match ethertype {
        ETHERTYPE_IP => {
            let vhl = *hdr.get(l2hlen)?;
            let l3hlen = (vhl & 0xF) as usize * 4;
            if vhl >> 4 != 4 || l3hlen < 20 {
                return None;
            }
            let total = be16(hdr, l2hlen + 2)? as usize;
            (l3hlen, false, *hdr.get(l2hlen + 9)?, total.checked_sub(l3hlen)?)
        }
        ETHERTYPE_IPV6 => (40, true, *hdr.get(l2hlen + 6)?, be16(hdr, l2hlen + 4)? as usize),
        _ => return None,
    };

    let l4 = l2hlen + l3hlen;
    let l4hlen = match l4proto {
        IPPROTO_TCP => {
            let doff = (*hdr.get(l4 + 12)? >> 4) as usize * 4;
            if doff < 20 {
                return None;
            }
            doff
        }
        IPPROTO_UDP => 8,
        _ => 0,
    };
    if hdr.len() < l4 + l4hlen {
        return None;
    }
    Some(PktHeaders { l2hlen, l3hlen, l4hlen, ipv6, l4proto, l4len })
}

fn csum_add(mut sum: u64, bytes: &[u8]) -> u64 {
    let mut words = bytes.chunks_exact(2);
    for w in &mut words {
        sum += u16::from_be_bytes([w[0], w[1]]) as u64;
    }
    if let [last] = words.remainder() {
        sum += (*last as u64) << 8;
    }
    sum
}

fn csum_fold(mut sum: u64) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    sum as u16
}

/// Computes the TCP checksum of `frame` and writes it into the TCP header.
fn fill_tcp_checksum(pkt: &mut TxPacket, h: &PktHeaders) -> core::result::Result<(), TxDropReason> {
    let mut frame = vec![0u8; pkt.len()];
    pkt.copy_prefix(&mut frame);
    let l4 = h.l2hlen + h.l3hlen;
    let csum_at = l4 + 16;
    let seg = frame.get(l4..l4 + h.l4len).ok_or(TxDropReason::Malformed)?;
    if seg.len() < 20 {
        return Err(TxDropReason::Malformed);
    }

    let ip = &frame[h.l2hlen..l4];
    let mut sum = if h.ipv6 {
        let sum = csum_add(0, &ip[8..40]);
        sum + (h.l4len >> 16) as u64 + (h.l4len & 0xFFFF) as u64 + IPPROTO_TCP as u64
    } else {
        csum_add(0, &ip[12..20]) + IPPROTO_TCP as u64 + h.l4len as u64
    };
    sum = csum_add(sum, &frame[l4..csum_at]);
    sum = csum_add(sum, &frame[csum_at + 2..l4 + h.l4len]);
    let csum = !csum_fold(sum);
    pkt.write_at(csum_at, &csum.to_be_bytes()).map_err(|_| TxDropReason::Malformed)
}

/// Builds the checksum and VLAN part of `cpl_tx_pkt_core`.
///
/// `sw_l4` means the L4 checksum was already filled in by software.
pub fn csum_to_ctrl(offload: &TxOffload, hdrs: Option<&PktHeaders>, sw_l4: bool) -> TxPktCtrl1 {
    let mut ctrl1 = TxPktCtrl1::new();
    if let Some(h) = hdrs {
        let l3 = offload.needs_l3_csum() && !h.ipv6;
        let l4 = offload.needs_l4_csum() && !sw_l4 && (h.l4proto == IPPROTO_TCP || h.l4proto == IPPROTO_UDP);
        if l3 {
            ctrl1 = ctrl1.ip_csum();
        }
        if l4 {
            ctrl1 = ctrl1.l4_csum();
        }
        if l3 || l4 {
            let csum_type = match (h.ipv6, h.l4proto) {
                (false, IPPROTO_TCP) if l4 => CsumType::TcpIp,
                (false, IPPROTO_UDP) if l4 => CsumType::UdpIp,
                (true, IPPROTO_TCP) if l4 => CsumType::TcpIp6,
                (true, IPPROTO_UDP) if l4 => CsumType::UdpIp6,
                _ => CsumType::Ip,
            };
            ctrl1 = ctrl1.csum_type(csum_type, h.l2hlen, h.l3hlen);
        }
    }
    if let Some(tag) = offload.vlan {
        ctrl1 = ctrl1.vlan(tag);
    }
    ctrl1
}

/// A packet that passed validation, with everything its work request needs.
pub(crate) struct PreparedPkt {
    pub pkt: TxPacket,
    pub ctrl1: TxPktCtrl1,
    pub sgl: Sgl,
    pub lso: Option<CplTxPktLsoCore>,
    /// The payload is copied into the work request.
    pub imm: bool,
}

impl PreparedPkt {
    pub fn len(&self) -> usize {
        self.pkt.len()
    }

    /// DMA mappings the packet holds while it is in the ring.
    pub fn maps(&self) -> usize {
        if self.imm { 0 } else { self.sgl.nsegs() }
    }

    /// The length of this packet's own `FW_ETH_TX_PKT_WR`, in 16-byte units.
    pub fn pkt_wr_len16(&self) -> usize {
        let hdrs = 16 + 16 + if self.lso.is_some() { 16 } else { 0 };
        if self.imm {
            len16(hdrs + self.len())
        } else {
            len16(hdrs + self.sgl.nflits() * FLIT_SIZE)
        }
    }

    pub fn pkt_wr_ndesc(&self) -> usize {
        len16_to_ndesc(self.pkt_wr_len16())
    }

    pub fn cpl(&self, intf: u8, pf: u8) -> CplTxPktCore {
        CplTxPktCore::new(intf, pf, self.len() as u16, self.ctrl1)
    }

    /// Encodes the packet as a `FW_ETH_TX_PKT_WR`.
    pub fn build_pkt_wr(&self, intf: u8, pf: u8) -> core::result::Result<Vec<u8>, TxDropReason> {
        let len16 = self.pkt_wr_len16();
        let mut wr = vec![0u8; len16 * 16];
        let cpl = self.cpl(intf, pf);
        if self.imm {
            let len = self.len();
            wr[..16].copy_from_slice(FwEthTxPktWr::new(16 + len, len16).as_bytes());
            wr[16..32].copy_from_slice(cpl.as_bytes());
            self.pkt.copy_prefix(&mut wr[32..32 + len]);
        } else {
            let mut pos = 16;
            let immdlen = if self.lso.is_some() { 32 } else { 16 };
            wr[..16].copy_from_slice(FwEthTxPktWr::new(immdlen, len16).as_bytes());
            if let Some(lso) = self.lso.as_ref() {
                wr[pos..pos + 16].copy_from_slice(lso.as_bytes());
                pos += 16;
            }
            wr[pos..pos + 16].copy_from_slice(cpl.as_bytes());
            pos += 16;
            self.sgl.encode(&mut wr[pos..]).map_err(|e| {
                error!("build_pkt_wr(): {}", <&'static str>::from(e));
                TxDropReason::Malformed
            })?;
        }
        Ok(wr)
    }
}

/// What the creator of a transmit queue decides.
#[derive(Clone, Copy, Debug)]
pub struct TxParams {
    pub cntxt_id: u16,
    /// The ingress queue that receives this queue's egress updates.
    pub iqid: u16,
    pub size: usize,
    /// The transmit channel of the port.
    pub intf: u8,
}

/// Transmit counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TxqStats {
    /// Packets written to the ring.
    pub pkts: u64,
    /// Packets sent as immediate data.
    pub imm: u64,
    pub tso: u64,
    /// Packets with a hardware checksum request.
    pub csum: u64,
    /// Packets that got a software TCP checksum.
    pub sw_csum: u64,
    pub vlan_insertion: u64,
    /// Packets whose buffers were compacted to fit in one SGL.
    pub collapsed: u64,
    pub dropped: u64,
    pub pkt_wrs: u64,
    pub txpkts0_wrs: u64,
    pub txpkts1_wrs: u64,
    /// Packets sent in multi-packet work requests.
    pub txpkts_pkts: u64,
}

struct TxCore {
    eq: EgressQueue,
    txpkts: TxPkts,
    stats: TxqStats,
    intf: u8,
    pf: u8,
    imm_len: usize,
    short_tcp_csum: Option<u16>,
    db_batch: usize,
    collapse_zone: Arc<ClusterZone>,
}

/// How a resumption attempt went.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ResumeOutcome {
    Resumed,
    StillStalled,
    /// Running already, or torn down.
    NotStalled,
}

/// An Ethernet transmit queue.
pub struct EthTxQueue {
    cntxt_id: u16,
    core: Mutex<TxCore>,
}

impl EthTxQueue {
    /// `collapse_zone` supplies the clusters that packets with too many segments
    /// are compacted into.
    pub fn new(
        params: TxParams,
        config: &SgeConfig,
        doorbell: Doorbell,
        collapse_zone: Arc<ClusterZone>,
    ) -> Result<EthTxQueue> {
        let eq = EgressQueue::new(EqParams { cntxt_id: params.cntxt_id, iqid: params.iqid, size: params.size }, doorbell)?;
        Ok(EthTxQueue {
            cntxt_id: params.cntxt_id,
            core: Mutex::new(TxCore {
                eq,
                txpkts: TxPkts::new(),
                stats: TxqStats::default(),
                intf: params.intf,
                pf: config.pf,
                imm_len: config.tx_imm_len,
                short_tcp_csum: config.short_tcp_csum_threshold,
                db_batch: config.db_batch,
                collapse_zone,
            }),
        })
    }

    pub fn cntxt_id(&self) -> u16 {
        self.cntxt_id
    }

    pub fn stats(&self) -> TxqStats {
        self.core.lock().stats
    }

    pub fn eq_stats(&self) -> EqStats {
        self.core.lock().eq.stats()
    }

    pub fn state(&self) -> EqState {
        self.core.lock().eq.state()
    }

    pub fn available(&self) -> usize {
        self.core.lock().eq.available()
    }

    /// Queues `pkt` for transmission.
    ///
    /// The packet may be held back to be combined with the packets that follow it;
    /// [`EthTxQueue::flush()`] sends everything held back.
    /// On [`TxError::WouldBlock`] nothing was written and the queue is stalled.
    pub fn submit(&self, pkt: TxPacket) -> core::result::Result<(), TxError> {
        self.core.lock().submit(pkt)
    }

    /// Writes out any packets held back for coalescing and rings the doorbell.
    pub fn flush(&self) {
        let mut core = self.core.lock();
        core.flush_txpkts();
        core.eq.ring_db();
    }

    /// Like [`EthTxQueue::flush()`], but gives up if the queue is busy.
    pub(crate) fn try_flush(&self) -> Option<()> {
        let mut core = self.core.try_lock()?;
        core.flush_txpkts();
        core.eq.ring_db();
        Some(())
    }

    /// Handles an egress update: reclaims, and resumes the queue if it was stalled.
    pub(crate) fn egress_update(&self) -> ResumeOutcome {
        let mut core = self.core.lock();
        core.eq.egress_update();
        core.resume()
    }

    /// Like [`EthTxQueue::egress_update()`] minus the update, and giving up if the queue is busy.
    pub(crate) fn try_resume(&self) -> Option<ResumeOutcome> {
        self.core.try_lock().map(|mut core| core.resume())
    }

    pub(crate) fn teardown(&self) {
        let mut core = self.core.lock();
        let held = core.txpkts.npkt();
        core.txpkts.clear();
        core.stats.dropped += held as u64;
        core.eq.teardown();
    }
}

impl TxCore {
    fn resume(&mut self) -> ResumeOutcome {
        if self.eq.state() != EqState::Stalled {
            self.eq.reclaim(usize::MAX);
            return ResumeOutcome::NotStalled;
        }
        if self.eq.try_resume() {
            ResumeOutcome::Resumed
        } else {
            ResumeOutcome::StillStalled
        }
    }

    fn submit(&mut self, pkt: TxPacket) -> core::result::Result<(), TxError> {
        match self.eq.state() {
            EqState::Doomed => {
                self.stats.dropped += 1;
                return Err(TxError::Dropped(TxDropReason::QueueDoomed));
            }
            EqState::Stalled => {
                if !self.eq.try_resume() {
                    return Err(TxError::WouldBlock(pkt));
                }
            }
            EqState::Running => {
                self.eq.reclaim(TX_RECLAIM_BATCH);
            }
        }

        let p = match self.prepare(pkt) {
            Ok(p) => p,
            Err(reason) => {
                self.stats.dropped += 1;
                debug!("EthTxQueue {}: dropped a packet: {:?}", self.eq.cntxt_id(), reason);
                return Err(TxError::Dropped(reason));
            }
        };
        let result = if p.lso.is_none() {
            self.coalesce(p)
        } else {
            self.flush_txpkts();
            self.write_pkt_wr(p)
        };
        self.eq.maybe_ring_db(self.db_batch);
        result
    }

    fn prepare(&mut self, mut pkt: TxPacket) -> core::result::Result<PreparedPkt, TxDropReason> {
        let len = pkt.len();
        if len == 0 || len > u16::MAX as usize {
            return Err(TxDropReason::BadLength);
        }
        let offload = pkt.offload;
        let hdrs = if offload.needs_l3_csum() || offload.needs_l4_csum() {
            Some(parse_headers(&pkt).ok_or(TxDropReason::Malformed)?)
        } else {
            None
        };

        let lso = match (offload.tso_mss, hdrs) {
            (Some(mss), Some(h)) if h.l4proto == IPPROTO_TCP => {
                Some(CplTxPktLsoCore::new(h.l2hlen, h.l3hlen, h.l4hlen, h.ipv6, mss, len as u32))
            }
            (Some(_), _) => return Err(TxDropReason::Malformed),
            (None, _) => None,
        };

        let imm = lso.is_none() && len <= self.imm_len;
        if !imm {
            let max_segs = if lso.is_some() { TX_SGL_SEGS_TSO } else { TX_SGL_SEGS };
            if pkt.nsegs() > max_segs {
                if let Err(e) = pkt.collapse(max_segs, &self.collapse_zone) {
                    warn!("EthTxQueue {}: {} segments: {}", self.eq.cntxt_id(), pkt.nsegs(), e);
                    return Err(TxDropReason::TooManySegments);
                }
                self.stats.collapsed += 1;
            }
        }

        let sw_l4 = match (hdrs, self.short_tcp_csum) {
            (Some(h), Some(threshold)) => lso.is_none()
                && h.l4proto == IPPROTO_TCP
                && offload.needs_l4_csum()
                && len < threshold as usize,
            _ => false,
        };
        if let (true, Some(h)) = (sw_l4, hdrs.as_ref()) {
            fill_tcp_checksum(&mut pkt, h)?;
            self.stats.sw_csum += 1;
        }

        let ctrl1 = csum_to_ctrl(&offload, hdrs.as_ref(), sw_l4);
        let mut sgl = Sgl::with_capacity(pkt.nsegs());
        for buf in pkt.buffers().iter().filter(|b| b.length() > 0) {
            sgl.push(buf.bus_addr(), buf.length() as u32);
        }
        Ok(PreparedPkt { pkt, ctrl1, sgl, lso, imm })
    }

    /// Makes sure `ndesc` descriptors and `maps` DMA mappings are available,
    /// reclaiming if needed.
    fn make_room(&mut self, ndesc: usize, maps: usize) -> bool {
        if self.eq.available() < ndesc || self.eq.maps_avail() < maps {
            self.eq.reclaim(usize::MAX);
        }
        self.eq.available() >= ndesc && self.eq.maps_avail() >= maps
    }

    fn would_block(&mut self, p: PreparedPkt) -> TxError {
        // the SGE has to see everything before it if the queue is to drain
        self.eq.ring_db();
        self.eq.stall();
        TxError::WouldBlock(p.pkt)
    }

    fn coalesce(&mut self, p: PreparedPkt) -> core::result::Result<(), TxError> {
        let p = if self.txpkts.is_empty() {
            p
        } else {
            match self.txpkts.try_add(p, self.eq.available(), self.eq.maps_avail()) {
                Ok(()) => return Ok(()),
                Err(p) => {
                    self.flush_txpkts();
                    p
                }
            }
        };
        // the accumulator only opens if the packet could be sent on its own
        if !self.make_room(p.pkt_wr_ndesc(), p.maps()) {
            return Err(self.would_block(p));
        }
        self.txpkts.open(p);
        Ok(())
    }

    fn write_pkt_wr(&mut self, p: PreparedPkt) -> core::result::Result<(), TxError> {
        if !self.make_room(p.pkt_wr_ndesc(), p.maps()) {
            return Err(self.would_block(p));
        }
        let mut wr = match p.build_pkt_wr(self.intf, self.pf) {
            Ok(wr) => wr,
            Err(reason) => {
                self.stats.dropped += 1;
                return Err(TxError::Dropped(reason));
            }
        };
        self.count(&p);
        self.stats.pkt_wrs += 1;
        let maps = p.maps();
        let packets = if p.imm { Vec::new() } else { vec![p.pkt] };
        self.eq.write_wr(&mut wr, packets, maps);
        Ok(())
    }

    fn count(&mut self, p: &PreparedPkt) {
        self.stats.pkts += 1;
        if p.imm {
            self.stats.imm += 1;
        }
        if p.lso.is_some() {
            self.stats.tso += 1;
        }
        if !p.ctrl1.ip_csum_disabled() || !p.ctrl1.l4_csum_disabled() {
            self.stats.csum += 1;
        }
        if p.ctrl1.vlan_tag().is_some() {
            self.stats.vlan_insertion += 1;
        }
    }

    fn flush_txpkts(&mut self) {
        let npkt = self.txpkts.npkt();
        if npkt == 0 {
            return;
        }
        if npkt == 1 {
            if let Some(p) = self.txpkts.take_single() {
                // room was reserved when the accumulator opened
                if let Err(e) = self.write_pkt_wr(p) {
                    error!("EthTxQueue {}: lost a held-back packet: {:?}", self.eq.cntxt_id(), e);
                }
            }
            return;
        }
        match self.txpkts.build(self.intf, self.pf, self.eq.iqid()) {
            Ok(TxPktsWr { mut wr, wr_type, pkts, maps }) => {
                for p in &pkts {
                    self.count(p);
                }
                match wr_type {
                    TxPktsType::Type0 => self.stats.txpkts0_wrs += 1,
                    TxPktsType::Type1 => self.stats.txpkts1_wrs += 1,
                }
                self.stats.txpkts_pkts += pkts.len() as u64;
                let packets = pkts.into_iter().map(|p| p.pkt).collect();
                self.eq.write_wr(&mut wr, packets, maps);
            }
            Err(reason) => {
                error!("EthTxQueue {}: dropped {} held-back packets: {:?}", self.eq.cntxt_id(), npkt, reason);
                self.stats.dropped += npkt as u64;
            }
        }
    }
}

#[cfg(test)]
impl EthTxQueue {
    pub(crate) fn hw_consume(&self) -> Vec<Vec<u8>> {
        self.core.lock().eq.hw_consume()
    }
}
