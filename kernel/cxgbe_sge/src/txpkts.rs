//! Combining several packets into one `FW_ETH_TX_PKTS_WR`.
//!
//! Type 1 requests carry packets of one DMA segment each as bare CPL + SGL pairs.
//! Type 0 requests wrap every packet in `ulp_txpkt` + `ulptx_idata`, which allows
//! any number of segments. The type is settled by the second packet.

use alloc::vec::Vec;
use cxgbe_descriptors::{
    egress::{FwEthTxPktsWr, TxPktsType, UlpTxPkt, UlptxIdata},
    len16, len16_to_ndesc,
    sgl::sgl_nflits,
    FLIT_SIZE, SGE_MAX_WR_LEN16,
};
use zerocopy::AsBytes;

use crate::{error::TxDropReason, tx::PreparedPkt};

/// The most packets one request may carry.
const TXPKTS_MAX_PKTS: usize = 254;

const CPL_LEN: usize = 16;
const ULP_HDRS_LEN: usize = 16;

/// Length in 16-byte units of one packet of a type 0 request.
pub fn txpkts0_len16(nsegs: usize) -> usize {
    len16(ULP_HDRS_LEN + CPL_LEN + sgl_nflits(nsegs) * FLIT_SIZE)
}

/// Length in 16-byte units of one packet of a type 1 request.
pub fn txpkts1_len16() -> usize {
    len16(CPL_LEN + sgl_nflits(1) * FLIT_SIZE)
}

fn pkt_len16(wr_type: TxPktsType, p: &PreparedPkt) -> usize {
    match wr_type {
        TxPktsType::Type0 => txpkts0_len16(p.sgl.nsegs()),
        TxPktsType::Type1 => txpkts1_len16(),
    }
}

/// A finished multi-packet work request.
pub(crate) struct TxPktsWr {
    pub wr: Vec<u8>,
    pub wr_type: TxPktsType,
    pub pkts: Vec<PreparedPkt>,
    /// DMA mappings held by the packets.
    pub maps: usize,
}

/// Packets held back to be sent together.
pub(crate) struct TxPkts {
    pkts: Vec<PreparedPkt>,
    /// Unknown until there are two packets.
    wr_type: Option<TxPktsType>,
    len16: usize,
    plen: usize,
    maps: usize,
}

impl TxPkts {
    pub fn new() -> TxPkts {
        TxPkts { pkts: Vec::new(), wr_type: None, len16: 0, plen: 0, maps: 0 }
    }

    pub fn npkt(&self) -> usize {
        self.pkts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pkts.is_empty()
    }

    /// Starts a new accumulation with `p`. Anything held before is discarded.
    pub fn open(&mut self, p: PreparedPkt) {
        self.clear();
        self.plen = p.len();
        self.maps = p.sgl.nsegs();
        self.pkts.push(p);
    }

    pub fn clear(&mut self) {
        self.pkts.clear();
        self.wr_type = None;
        self.len16 = 0;
        self.plen = 0;
        self.maps = 0;
    }

    /// Adds `p` if the request can take it and it still fits in `available`
    /// descriptors and `maps_avail` DMA mappings. Hands `p` back otherwise.
    pub fn try_add(&mut self, p: PreparedPkt, available: usize, maps_avail: usize)
        -> Result<(), PreparedPkt>
    {
        if p.lso.is_some() || self.pkts.is_empty() || self.pkts.len() >= TXPKTS_MAX_PKTS {
            return Err(p);
        }
        let wr_type = match self.wr_type {
            Some(TxPktsType::Type1) if p.sgl.nsegs() != 1 => return Err(p),
            Some(t) => t,
            None if p.sgl.nsegs() == 1 && self.pkts[0].sgl.nsegs() == 1 => TxPktsType::Type1,
            None => TxPktsType::Type0,
        };

        let len16 = match self.wr_type {
            Some(_) => self.len16,
            // the header, then the first packet
            None => 1 + pkt_len16(wr_type, &self.pkts[0]),
        } + pkt_len16(wr_type, &p);
        let plen = self.plen + p.len();
        let maps = self.maps + p.sgl.nsegs();
        if len16 > SGE_MAX_WR_LEN16
            || len16_to_ndesc(len16) > available
            || maps > maps_avail
            || plen > u16::MAX as usize
        {
            return Err(p);
        }

        self.wr_type = Some(wr_type);
        self.len16 = len16;
        self.plen = plen;
        self.maps = maps;
        self.pkts.push(p);
        Ok(())
    }

    /// Removes the only packet held, which goes out in a work request of its own.
    pub fn take_single(&mut self) -> Option<PreparedPkt> {
        if self.pkts.len() != 1 {
            return None;
        }
        let p = self.pkts.pop();
        self.clear();
        p
    }

    /// Encodes everything held into one request and empties the accumulator.
    /// `iqid` receives the completions of type 0 packets.
    pub fn build(&mut self, intf: u8, pf: u8, iqid: u16) -> Result<TxPktsWr, TxDropReason> {
        let wr_type = self.wr_type.ok_or(TxDropReason::Malformed)?;
        let mut wr = alloc::vec![0u8; self.len16 * 16];
        let hdr = FwEthTxPktsWr::new(self.len16, self.plen as u16, self.pkts.len() as u8, wr_type);
        wr[..16].copy_from_slice(hdr.as_bytes());

        let mut pos = 16;
        for p in &self.pkts {
            let plen16 = pkt_len16(wr_type, p);
            let end = pos + plen16 * 16;
            if wr_type == TxPktsType::Type0 {
                wr[pos..pos + 8].copy_from_slice(UlpTxPkt::new(plen16, iqid).as_bytes());
                wr[pos + 8..pos + 16].copy_from_slice(UlptxIdata::new(CPL_LEN).as_bytes());
                pos += ULP_HDRS_LEN;
            }
            wr[pos..pos + CPL_LEN].copy_from_slice(p.cpl(intf, pf).as_bytes());
            pos += CPL_LEN;
            p.sgl.encode(&mut wr[pos..end]).map_err(|e| {
                error!("TxPkts::build(): {}", <&'static str>::from(e));
                TxDropReason::Malformed
            })?;
            pos = end;
        }

        let maps = self.maps;
        let mut pkts = core::mem::take(&mut self.pkts);
        // the payload of every packet is read through its SGL
        for p in pkts.iter_mut() {
            p.imm = false;
        }
        self.clear();
        Ok(TxPktsWr { wr, wr_type, pkts, maps })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;
    use cxgbe_buffers::{TransmitBuffer, TxPacket};
    use cxgbe_descriptors::{egress::TxPktCtrl1, sgl::Sgl};

    fn prepared(seg_lens: &[usize]) -> PreparedPkt {
        let bufs: Vec<_> = seg_lens.iter().enumerate()
            .map(|(i, &len)| TransmitBuffer::new(vec![0xAB; len], 0x4000 * (i as u64 + 1)))
            .collect();
        let mut sgl = Sgl::new();
        for b in &bufs {
            sgl.push(b.bus_addr(), b.length() as u32);
        }
        PreparedPkt { pkt: TxPacket::new(bufs), ctrl1: TxPktCtrl1::new(), sgl, lso: None, imm: false }
    }

    #[test]
    fn lengths() {
        assert_eq!(txpkts1_len16(), 2);
        assert_eq!(txpkts0_len16(1), 3);
        assert_eq!(txpkts0_len16(2), 4);
        assert_eq!(txpkts0_len16(3), 4);
    }

    #[test]
    fn type1_fills_a_work_request() {
        let mut txp = TxPkts::new();
        txp.open(prepared(&[100]));
        let mut added = 1;
        while txp.try_add(prepared(&[100]), 1000, 1000).is_ok() {
            added += 1;
        }
        // 16 bytes of header and 32 per packet in 512 bytes
        assert_eq!(added, 15);
        let built = txp.build(0, 0, 1).unwrap();
        assert_eq!(built.wr.len(), 16 + 15 * 32);
        assert_eq!(built.wr_type, TxPktsType::Type1);
        assert_eq!(built.pkts.len(), 15);
        assert_eq!(built.maps, 15);
        assert!(txp.is_empty());
    }

    #[test]
    fn respects_ring_space() {
        let mut txp = TxPkts::new();
        txp.open(prepared(&[100, 100, 100]));
        // two packets of type 0 need 1 + 4 + 4 units, three descriptors
        assert!(txp.try_add(prepared(&[100, 100]), 1, 100).is_err());
        assert!(txp.try_add(prepared(&[100, 100]), 3, 4).is_err());
        assert!(txp.try_add(prepared(&[100, 100]), 3, 5).is_ok());
        assert_eq!(txp.npkt(), 2);
    }

    #[test]
    fn type0_carries_completion_queue() {
        let mut txp = TxPkts::new();
        txp.open(prepared(&[60]));
        txp.try_add(prepared(&[60, 60]), 10, 10).ok().unwrap();
        let built = txp.build(2, 0, 77).unwrap();
        assert_eq!(built.wr_type, TxPktsType::Type0);
        let ulp = zerocopy::LayoutVerified::<&[u8], UlpTxPkt>::new_from_prefix(&built.wr[16..]).unwrap().0;
        assert_eq!(ulp.len.get(), 3);
        assert_eq!((ulp.cmd_dest.get() >> 4) & 0x7FF, 77);
        let sgl = Sgl::decode(&built.wr[16 + 48 + 32..]).unwrap();
        assert_eq!(sgl.nsegs(), 2);
    }

    #[test]
    fn single_packet_is_taken_alone() {
        let mut txp = TxPkts::new();
        assert!(txp.take_single().is_none());
        txp.open(prepared(&[100]));
        assert_eq!(txp.take_single().map(|p| p.len()), Some(100));
        assert!(txp.is_empty());
    }
}
