//! Ingress queue entries and the CPL messages delivered through them.
//!
//! Every ingress queue entry is `IQ_ESIZE` bytes: an RSS header, the CPL message body,
//! and a response control trailer ([`RspCtrl`]) that the SGE writes last.
//! The generation bit in the trailer flips every time the SGE wraps around the ring,
//! which is how the driver tells freshly written entries from stale ones.

use bit_field::BitField;
use byteorder::BigEndian;
use core::fmt;
use zerocopy::{
    byteorder::{U16, U32},
    AsBytes, FromBytes, LayoutVerified,
};

use crate::IQ_ESIZE;

/// CPL opcode: an Ethernet frame was received into free-list buffers.
pub const CPL_RX_PKT:           u8 = 0x3B;
/// CPL opcode: the SGE reports the consumer index of an egress queue.
pub const CPL_SGE_EGR_UPDATE:   u8 = 0xA5;
/// CPL opcode: firmware message (4-flit form).
pub const CPL_FW4_MSG:          u8 = 0xC0;
/// CPL opcode: firmware message (6-flit form).
pub const CPL_FW6_MSG:          u8 = 0xE0;
/// The number of distinct CPL opcodes; handler tables have this many entries.
pub const NUM_CPL_CMDS:         usize = 256;

/// The size of the CPL area between the RSS header and the response trailer.
pub const IQ_CPL_LEN:           usize = IQ_ESIZE - 8 - 16;

/// The header that starts every ingress queue entry.
#[derive(FromBytes, AsBytes, Clone, Copy)]
#[repr(C)]
pub struct RssHeader {
    /// The CPL opcode of the message that follows.
    pub opcode:     u8,
    /// Channel, filter and hash type bits.
    pub channel:    u8,
    pub qid:        U16<BigEndian>,
    pub hash_val:   U32<BigEndian>,
}

const_assert_eq!(core::mem::size_of::<RssHeader>(), 8);

/// The kind of response carried by an ingress queue entry (`G_RSPD_TYPE`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RspType {
    /// A CPL that comes with payload in free-list buffers.
    FlBuf = 0,
    /// A CPL without free-list payload.
    Cpl = 1,
    /// An interrupt forwarded from another ingress queue.
    Intr = 2,
}

const S_RSPD_TYPE:      usize = 4;
const S_RSPD_GEN:       usize = 7;
const S_RSPD_NEWBUF:    usize = 31;

/// The response control trailer that ends every ingress queue entry (`rsp_ctrl`).
#[derive(FromBytes, AsBytes, Clone, Copy)]
#[repr(C)]
pub struct RspCtrl {
    pub hdrbuflen_pidx:     U32<BigEndian>,
    /// For `FlBuf` responses: the new-buffer flag and the payload length.
    /// For `Intr` responses: the absolute id of the queue that has work.
    pub pldbuflen_qid:      U32<BigEndian>,
    /// The most significant byte of the last flit: response type and generation bit.
    pub type_gen:           u8,
    _rsvd:                  [u8; 7],
}

const_assert_eq!(core::mem::size_of::<RspCtrl>(), 16);

impl RspCtrl {
    /// Creates the trailer of an entry of kind `rsp_type` written in generation `gen`.
    pub fn new(rsp_type: RspType, gen: u8, pldbuflen_qid: u32) -> RspCtrl {
        let mut type_gen = 0u8;
        type_gen.set_bits(S_RSPD_TYPE..S_RSPD_TYPE + 2, rsp_type as u8);
        type_gen.set_bit(S_RSPD_GEN, gen & 1 == 1);
        RspCtrl {
            hdrbuflen_pidx: U32::new(0),
            pldbuflen_qid: U32::new(pldbuflen_qid),
            type_gen,
            _rsvd: [0; 7],
        }
    }

    /// Encodes the `pldbuflen_qid` word of a free-list response.
    pub fn pldbuflen(new_buf: bool, len: u32) -> u32 {
        let mut val = 0u32;
        val.set_bits(0..S_RSPD_NEWBUF, len);
        val.set_bit(S_RSPD_NEWBUF, new_buf);
        val
    }

    /// The generation bit (0 or 1) this entry was written with.
    pub fn generation(&self) -> u8 {
        self.type_gen.get_bit(S_RSPD_GEN) as u8
    }

    /// The response type, or the raw value if the SGE wrote one we don't know.
    pub fn rsp_type(&self) -> Result<RspType, u8> {
        match self.type_gen.get_bits(S_RSPD_TYPE..S_RSPD_TYPE + 2) {
            0 => Ok(RspType::FlBuf),
            1 => Ok(RspType::Cpl),
            2 => Ok(RspType::Intr),
            other => Err(other),
        }
    }

    /// Whether the SGE started this payload in a fresh free-list buffer.
    pub fn is_new_buf(&self) -> bool {
        self.pldbuflen_qid.get().get_bit(S_RSPD_NEWBUF)
    }

    /// The payload length of a free-list response.
    pub fn len(&self) -> u32 {
        self.pldbuflen_qid.get().get_bits(0..S_RSPD_NEWBUF)
    }

    /// The absolute queue id carried by a forwarded-interrupt response.
    pub fn qid(&self) -> u32 {
        self.pldbuflen_qid.get().get_bits(0..S_RSPD_NEWBUF)
    }
}

impl fmt::Debug for RspCtrl {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{type: {:?}, gen: {}, newbuf: {}, len/qid: {:#X}}}",
            self.rsp_type(), self.generation(), self.is_new_buf(), self.len())
    }
}

/// One ingress queue entry (`iq_desc`).
#[derive(FromBytes, AsBytes, Clone, Copy)]
#[repr(C)]
pub struct IqDesc {
    pub rss:    RssHeader,
    pub cpl:    [u8; IQ_CPL_LEN],
    pub rsp:    RspCtrl,
}

const_assert_eq!(core::mem::size_of::<IqDesc>(), IQ_ESIZE);

impl IqDesc {
    /// Returns an all-zero entry, which the driver treats as "written in generation 0".
    pub fn zeroed() -> IqDesc {
        IqDesc::new_zeroed()
    }

    /// Views the start of the CPL area as the CPL message `T`.
    pub fn cpl_as<T: FromBytes>(&self) -> Option<&T> {
        LayoutVerified::<&[u8], T>::new_from_prefix(&self.cpl[..])
            .map(|(lv, _rest)| lv.into_ref())
    }

    /// Writes the CPL message `msg` at the start of the CPL area.
    pub fn set_cpl<T: AsBytes>(&mut self, msg: &T) {
        let bytes = msg.as_bytes();
        self.cpl[..bytes.len()].copy_from_slice(bytes);
    }
}

impl fmt::Debug for IqDesc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{opcode: {:#X}, rsp: {:?}}}", self.rss.opcode, self.rsp)
    }
}

/// `cpl_rx_pkt`: an Ethernet frame landed in free-list buffers.
#[derive(FromBytes, AsBytes, Clone, Copy)]
#[repr(C)]
pub struct CplRxPkt {
    pub opcode:     u8,
    /// `ip_frag:1 vlan_ex:1 ipmi_pkt:1 csum_calc:1 iff:4`, most significant bit first.
    pub flags:      u8,
    pub csum:       U16<BigEndian>,
    pub vlan:       U16<BigEndian>,
    pub len:        U16<BigEndian>,
    pub l2info:     U32<BigEndian>,
    pub hdr_len:    U16<BigEndian>,
    pub err_vec:    U16<BigEndian>,
}

const_assert_eq!(core::mem::size_of::<CplRxPkt>(), 16);

/// `l2info`: the frame is IPv4.
pub const F_RXF_IP:     u32 = 1 << 24;
/// `l2info`: the frame is IPv6.
pub const F_RXF_IP6:    u32 = 1 << 25;
/// `l2info`: the frame is TCP.
pub const F_RXF_TCP:    u32 = 1 << 23;
/// `l2info`: the frame is UDP.
pub const F_RXF_UDP:    u32 = 1 << 22;

impl CplRxPkt {
    pub fn ip_frag(&self) -> bool {
        self.flags.get_bit(7)
    }

    /// Whether the SGE stripped a VLAN tag into the `vlan` field.
    pub fn vlan_ex(&self) -> bool {
        self.flags.get_bit(6)
    }

    /// Whether the SGE computed the L3/L4 checksums of this frame.
    pub fn csum_calc(&self) -> bool {
        self.flags.get_bit(4)
    }

    /// The ingress interface (port) the frame arrived on.
    pub fn iff(&self) -> u8 {
        self.flags.get_bits(0..4)
    }

    pub fn set_flags(&mut self, ip_frag: bool, vlan_ex: bool, csum_calc: bool, iff: u8) {
        let mut flags = 0u8;
        flags.set_bit(7, ip_frag);
        flags.set_bit(6, vlan_ex);
        flags.set_bit(4, csum_calc);
        flags.set_bits(0..4, iff & 0xF);
        self.flags = flags;
    }
}

/// `cpl_sge_egr_update`: the consumer index of an egress queue moved.
#[derive(FromBytes, AsBytes, Clone, Copy)]
#[repr(C)]
pub struct CplSgeEgrUpdate {
    pub opcode_qid: U32<BigEndian>,
    pub cidx:       U16<BigEndian>,
    pub pidx:       U16<BigEndian>,
}

const_assert_eq!(core::mem::size_of::<CplSgeEgrUpdate>(), 8);

impl CplSgeEgrUpdate {
    pub fn new(qid: u32, cidx: u16, pidx: u16) -> CplSgeEgrUpdate {
        let mut opcode_qid = 0u32;
        opcode_qid.set_bits(24..32, CPL_SGE_EGR_UPDATE as u32);
        opcode_qid.set_bits(0..17, qid);
        CplSgeEgrUpdate {
            opcode_qid: U32::new(opcode_qid),
            cidx: U16::new(cidx),
            pidx: U16::new(pidx),
        }
    }

    /// The absolute id of the egress queue this update is for.
    pub fn qid(&self) -> u32 {
        self.opcode_qid.get().get_bits(0..17)
    }
}
