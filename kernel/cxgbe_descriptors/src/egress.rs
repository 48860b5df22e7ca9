//! Egress descriptors, the egress status page, and the work requests and CPL messages
//! that the driver writes into egress queues.
//!
//! A work request always starts with an 8-byte header whose second word carries
//! the request's length in 16-byte units and the two "please report progress" bits
//! (`EQUIQ` and `EQUEQ`). [`WrHeader`] gives access to that common prefix
//! regardless of the concrete work request type.

use bit_field::BitField;
use byteorder::BigEndian;
use core::fmt;
use zerocopy::{
    byteorder::{U16, U32, U64},
    AsBytes, FromBytes, LayoutVerified,
};

use crate::{Flit, EQ_ESIZE, FLITS_PER_DESC, SPG_LEN};

/// Firmware work request: transmit one Ethernet packet.
pub const FW_ETH_TX_PKT_WR:     u8 = 0x08;
/// Firmware work request: transmit several Ethernet packets.
pub const FW_ETH_TX_PKTS_WR:    u8 = 0x09;

/// CPL opcode of the transmit-packet prefix that precedes every outbound frame.
pub const CPL_TX_PKT_XT:        u8 = 0xEE;
/// CPL opcode of the segmentation-offload prefix.
pub const CPL_TX_PKT_LSO:       u8 = 0xED;

/// ULP_TX command: one packet of a type 0 multi-packet work request.
pub const ULP_TX_PKT:           u8 = 4;
/// ULP_TX sub-command: immediate data follows.
pub const ULP_TX_SC_IMM:        u8 = 0x81;
const S_ULPTX_CMD:              usize = 24;
const S_ULP_TXPKT_FID:          usize = 4;
const S_ULP_TX_SC_MORE:         usize = 23;

const S_FW_WR_OP:               usize = 24;
const S_FW_WR_EQUIQ:            usize = 31;
const S_FW_WR_EQUEQ:            usize = 30;

/// One 64-byte egress descriptor.
#[derive(FromBytes, AsBytes, Clone, Copy)]
#[repr(C)]
pub struct TxDesc {
    pub flit: [Flit; FLITS_PER_DESC],
}

const_assert_eq!(core::mem::size_of::<TxDesc>(), EQ_ESIZE);

/// The status page that the SGE maintains right after the last descriptor of an
/// egress queue or free list (`sge_qstat`).
#[derive(FromBytes, AsBytes, Clone, Copy)]
#[repr(C)]
pub struct SgeQstat {
    pub qid:    U32<BigEndian>,
    /// The hardware consumer index, in descriptors.
    pub cidx:   U16<BigEndian>,
    pub pidx:   U16<BigEndian>,
    _rsvd:      [u8; SPG_LEN - 8],
}

const_assert_eq!(core::mem::size_of::<SgeQstat>(), SPG_LEN);

impl SgeQstat {
    pub fn zeroed() -> SgeQstat {
        SgeQstat::new_zeroed()
    }
}

impl fmt::Debug for SgeQstat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{qid: {}, cidx: {}, pidx: {}}}", self.qid.get(), self.cidx.get(), self.pidx.get())
    }
}

/// Builds the 64-bit big-endian value that posts one free-list buffer:
/// the bus address with the hardware buffer-size index in its low bits.
pub fn fl_buf_addr(bus_addr: u64, hwidx: u8) -> u64 {
    debug_assert!(bus_addr & 0xF == 0, "free-list buffers must be 16-byte aligned");
    bus_addr | (hwidx as u64 & 0xF)
}

/// The 8-byte prefix shared by all firmware work requests.
#[derive(FromBytes, AsBytes, Clone, Copy)]
#[repr(C)]
pub struct WrHeader {
    pub op:             U32<BigEndian>,
    pub equiq_to_len16: U32<BigEndian>,
}

const_assert_eq!(core::mem::size_of::<WrHeader>(), 8);

impl WrHeader {
    /// Views the beginning of `bytes` as a work-request header.
    pub fn from_bytes_mut(bytes: &mut [u8]) -> Option<&mut WrHeader> {
        LayoutVerified::<&mut [u8], WrHeader>::new_from_prefix(bytes)
            .map(|(lv, _rest)| lv.into_mut())
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<&WrHeader> {
        LayoutVerified::<&[u8], WrHeader>::new_from_prefix(bytes)
            .map(|(lv, _rest)| lv.into_ref())
    }

    pub fn opcode(&self) -> u8 {
        self.op.get().get_bits(S_FW_WR_OP..32) as u8
    }

    /// The work request's length in 16-byte units.
    pub fn len16(&self) -> usize {
        self.equiq_to_len16.get().get_bits(0..8) as usize
    }

    /// Asks the SGE to write the status page (`equeq`) and/or to send an egress
    /// update to the queue's associated ingress queue (`equiq`) once it has
    /// consumed this work request.
    pub fn request_egress_update(&mut self, equiq: bool, equeq: bool) {
        let mut val = self.equiq_to_len16.get();
        if equiq {
            val.set_bit(S_FW_WR_EQUIQ, true);
        }
        if equeq {
            val.set_bit(S_FW_WR_EQUEQ, true);
        }
        self.equiq_to_len16.set(val);
    }

    pub fn equiq(&self) -> bool {
        self.equiq_to_len16.get().get_bit(S_FW_WR_EQUIQ)
    }

    pub fn equeq(&self) -> bool {
        self.equiq_to_len16.get().get_bit(S_FW_WR_EQUEQ)
    }
}

fn op_word(opcode: u8, low: u32) -> u32 {
    let mut val = low;
    val.set_bits(S_FW_WR_OP..32, opcode as u32);
    val
}

fn len16_word(len16: usize) -> u32 {
    let mut val = 0u32;
    val.set_bits(0..8, len16 as u32);
    val
}

/// `fw_eth_tx_pkt_wr`: the header of a single-packet transmit work request.
#[derive(FromBytes, AsBytes, Clone, Copy)]
#[repr(C)]
pub struct FwEthTxPktWr {
    pub op_immdlen:     U32<BigEndian>,
    pub equiq_to_len16: U32<BigEndian>,
    pub r3:             U64<BigEndian>,
}

const_assert_eq!(core::mem::size_of::<FwEthTxPktWr>(), 16);

impl FwEthTxPktWr {
    /// `immdlen` is the number of bytes of immediate data (CPLs plus any inline payload)
    /// that follow this header.
    pub fn new(immdlen: usize, len16: usize) -> FwEthTxPktWr {
        let mut imm = 0u32;
        imm.set_bits(0..8, immdlen as u32);
        FwEthTxPktWr {
            op_immdlen: U32::new(op_word(FW_ETH_TX_PKT_WR, imm)),
            equiq_to_len16: U32::new(len16_word(len16)),
            r3: U64::new(0),
        }
    }

    pub fn immdlen(&self) -> usize {
        self.op_immdlen.get().get_bits(0..8) as usize
    }
}

/// The two formats of a multi-packet work request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum TxPktsType {
    /// Every packet is wrapped in `ulp_txpkt` + `ulptx_idata`.
    Type0 = 0,
    /// Packets follow one another as bare `cpl_tx_pkt_core` + SGL.
    Type1 = 1,
}

/// `fw_eth_tx_pkts_wr`: the header of a multi-packet transmit work request.
#[derive(FromBytes, AsBytes, Clone, Copy)]
#[repr(C)]
pub struct FwEthTxPktsWr {
    pub op_pkd:         U32<BigEndian>,
    pub equiq_to_len16: U32<BigEndian>,
    pub r3:             U32<BigEndian>,
    /// Total payload length of all packets.
    pub plen:           U16<BigEndian>,
    pub npkt:           u8,
    pub type_:          u8,
}

const_assert_eq!(core::mem::size_of::<FwEthTxPktsWr>(), 16);

impl FwEthTxPktsWr {
    pub fn new(len16: usize, plen: u16, npkt: u8, wr_type: TxPktsType) -> FwEthTxPktsWr {
        FwEthTxPktsWr {
            op_pkd: U32::new(op_word(FW_ETH_TX_PKTS_WR, 0)),
            equiq_to_len16: U32::new(len16_word(len16)),
            r3: U32::new(0),
            plen: U16::new(plen),
            npkt,
            type_: wr_type as u8,
        }
    }
}

/// Checksum types understood by the transmit checksum engine (`TX_CSUM_*`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum CsumType {
    Tcp     = 0,
    Udp     = 1,
    TcpIp   = 8,
    UdpIp   = 9,
    TcpIp6  = 10,
    UdpIp6  = 11,
    Ip      = 12,
}

const S_TXPKT_VLAN:         usize = 0;
const S_TXPKT_IPHDR_LEN:    usize = 20;
const S_TXPKT_VLAN_VLD:     usize = 32;
const S_TXPKT_ETHHDR_LEN:   usize = 34;
const S_TXPKT_CSUM_TYPE:    usize = 40;
const S_TXPKT_IPCSUM_DIS:   usize = 62;
const S_TXPKT_L4CSUM_DIS:   usize = 63;

/// The length of an untagged Ethernet header, which the `ETHHDR_LEN` fields are relative to.
pub const ETHER_HDR_LEN:    usize = 14;

/// Builder for the `ctrl1` word of [`CplTxPktCore`].
///
/// A fresh value has both checksum engines disabled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TxPktCtrl1(pub u64);

impl TxPktCtrl1 {
    pub fn new() -> TxPktCtrl1 {
        let mut val = 0u64;
        val.set_bit(S_TXPKT_IPCSUM_DIS, true);
        val.set_bit(S_TXPKT_L4CSUM_DIS, true);
        TxPktCtrl1(val)
    }

    /// Enables the IPv4 header checksum.
    pub fn ip_csum(mut self) -> TxPktCtrl1 {
        self.0.set_bit(S_TXPKT_IPCSUM_DIS, false);
        self
    }

    /// Enables the L4 checksum.
    pub fn l4_csum(mut self) -> TxPktCtrl1 {
        self.0.set_bit(S_TXPKT_L4CSUM_DIS, false);
        self
    }

    /// Describes the headers the checksum engine has to skip over.
    pub fn csum_type(mut self, csum_type: CsumType, l2hlen: usize, l3hlen: usize) -> TxPktCtrl1 {
        self.0.set_bits(S_TXPKT_CSUM_TYPE..S_TXPKT_CSUM_TYPE + 4, csum_type as u64);
        self.0.set_bits(S_TXPKT_ETHHDR_LEN..S_TXPKT_ETHHDR_LEN + 6, (l2hlen - ETHER_HDR_LEN) as u64);
        self.0.set_bits(S_TXPKT_IPHDR_LEN..S_TXPKT_IPHDR_LEN + 10, l3hlen as u64);
        self
    }

    /// Asks the hardware to insert an 802.1Q tag.
    pub fn vlan(mut self, tag: u16) -> TxPktCtrl1 {
        self.0.set_bit(S_TXPKT_VLAN_VLD, true);
        self.0.set_bits(S_TXPKT_VLAN..S_TXPKT_VLAN + 16, tag as u64);
        self
    }

    pub fn ip_csum_disabled(&self) -> bool {
        self.0.get_bit(S_TXPKT_IPCSUM_DIS)
    }

    pub fn l4_csum_disabled(&self) -> bool {
        self.0.get_bit(S_TXPKT_L4CSUM_DIS)
    }

    pub fn vlan_tag(&self) -> Option<u16> {
        if self.0.get_bit(S_TXPKT_VLAN_VLD) {
            Some(self.0.get_bits(S_TXPKT_VLAN..S_TXPKT_VLAN + 16) as u16)
        } else {
            None
        }
    }

    pub fn csum_type_bits(&self) -> u8 {
        self.0.get_bits(S_TXPKT_CSUM_TYPE..S_TXPKT_CSUM_TYPE + 4) as u8
    }
}

impl Default for TxPktCtrl1 {
    fn default() -> Self {
        TxPktCtrl1::new()
    }
}

/// `cpl_tx_pkt_core`: the CPL that precedes every outbound Ethernet frame.
#[derive(FromBytes, AsBytes, Clone, Copy)]
#[repr(C)]
pub struct CplTxPktCore {
    pub ctrl0:  U32<BigEndian>,
    pub pack:   U16<BigEndian>,
    /// Length of the frame in bytes.
    pub len:    U16<BigEndian>,
    pub ctrl1:  U64<BigEndian>,
}

const_assert_eq!(core::mem::size_of::<CplTxPktCore>(), 16);

impl CplTxPktCore {
    /// `intf` is the transmit channel of the port, `pf` the physical function.
    pub fn new(intf: u8, pf: u8, len: u16, ctrl1: TxPktCtrl1) -> CplTxPktCore {
        let mut ctrl0 = 0u32;
        ctrl0.set_bits(24..32, CPL_TX_PKT_XT as u32);
        ctrl0.set_bits(16..20, intf as u32);
        ctrl0.set_bits(8..11, pf as u32);
        CplTxPktCore {
            ctrl0: U32::new(ctrl0),
            pack: U16::new(0),
            len: U16::new(len),
            ctrl1: U64::new(ctrl1.0),
        }
    }

    pub fn ctrl1(&self) -> TxPktCtrl1 {
        TxPktCtrl1(self.ctrl1.get())
    }
}

/// `cpl_tx_pkt_lso_core`: the segmentation-offload prefix that precedes the
/// `cpl_tx_pkt_core` of a TSO frame.
#[derive(FromBytes, AsBytes, Clone, Copy)]
#[repr(C)]
pub struct CplTxPktLsoCore {
    pub lso_ctrl:       U32<BigEndian>,
    pub ipid_ofst:      U16<BigEndian>,
    pub mss:            U16<BigEndian>,
    pub seqno_offset:   U32<BigEndian>,
    pub len:            U32<BigEndian>,
}

const_assert_eq!(core::mem::size_of::<CplTxPktLsoCore>(), 16);

impl CplTxPktLsoCore {
    /// Header lengths are in bytes and must be multiples of 4.
    pub fn new(l2hlen: usize, l3hlen: usize, l4hlen: usize, ipv6: bool, mss: u16, len: u32) -> CplTxPktLsoCore {
        let mut ctrl = 0u32;
        ctrl.set_bits(24..32, CPL_TX_PKT_LSO as u32);
        ctrl.set_bit(23, true); // first slice
        ctrl.set_bit(22, true); // last slice
        ctrl.set_bit(20, ipv6);
        ctrl.set_bits(16..20, ((l2hlen - ETHER_HDR_LEN) / 4) as u32);
        ctrl.set_bits(4..16, (l3hlen / 4) as u32);
        ctrl.set_bits(0..4, (l4hlen / 4) as u32);
        CplTxPktLsoCore {
            lso_ctrl: U32::new(ctrl),
            ipid_ofst: U16::new(0),
            mss: U16::new(mss),
            seqno_offset: U32::new(0),
            len: U32::new(len),
        }
    }

    /// Returns the (L2, L3, L4) header lengths in bytes.
    pub fn header_lens(&self) -> (usize, usize, usize) {
        let ctrl = self.lso_ctrl.get();
        (
            ctrl.get_bits(16..20) as usize * 4 + ETHER_HDR_LEN,
            ctrl.get_bits(4..16) as usize * 4,
            ctrl.get_bits(0..4) as usize * 4,
        )
    }

    pub fn is_ipv6(&self) -> bool {
        self.lso_ctrl.get().get_bit(20)
    }
}

/// `ulp_txpkt`: wraps one packet of a type 0 multi-packet work request.
#[derive(FromBytes, AsBytes, Clone, Copy)]
#[repr(C)]
pub struct UlpTxPkt {
    pub cmd_dest:   U32<BigEndian>,
    /// Length of the wrapped packet (this header included) in 16-byte units.
    pub len:        U32<BigEndian>,
}

const_assert_eq!(core::mem::size_of::<UlpTxPkt>(), 8);

impl UlpTxPkt {
    /// `fid` is the ingress queue that receives the packet's completion messages.
    pub fn new(len16: usize, fid: u16) -> UlpTxPkt {
        let mut cmd = 0u32;
        cmd.set_bits(S_ULPTX_CMD..32, ULP_TX_PKT as u32);
        cmd.set_bits(S_ULP_TXPKT_FID..S_ULP_TXPKT_FID + 11, fid as u32);
        UlpTxPkt { cmd_dest: U32::new(cmd), len: U32::new(len16 as u32) }
    }
}

/// `ulptx_idata`: announces the immediate `cpl_tx_pkt_core` inside a `ulp_txpkt`.
#[derive(FromBytes, AsBytes, Clone, Copy)]
#[repr(C)]
pub struct UlptxIdata {
    pub cmd_more:   U32<BigEndian>,
    pub len:        U32<BigEndian>,
}

const_assert_eq!(core::mem::size_of::<UlptxIdata>(), 8);

impl UlptxIdata {
    pub fn new(len: usize) -> UlptxIdata {
        let mut cmd = 0u32;
        cmd.set_bits(S_ULPTX_CMD..32, ULP_TX_SC_IMM as u32);
        cmd.set_bit(S_ULP_TX_SC_MORE, true);
        UlptxIdata { cmd_more: U32::new(cmd), len: U32::new(len as u32) }
    }
}
