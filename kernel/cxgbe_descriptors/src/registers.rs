//! The SGE registers the queue engine touches on its data path, and the encodings of
//! the values written to them.
//!
//! There are two places to ring a doorbell:
//! * the per-PF kernel doorbell register `SGE_PF_KDOORBELL`, shared by all queues of the function,
//! * a per-queue user doorbell segment in BAR2, which also has room for a
//!   write-combined copy of a 64-byte work request.
//!
//! Ingress queues return credits and re-arm their interrupt through `SGE_PF_GTS`.

use bit_field::BitField;
use volatile::Volatile;

/// The value of the `SEINTARM` field that only updates the consumer index,
/// without arming the interrupt timer.
pub const X_TIMERREG_UPDATE_CIDX: u8 = 7;

/// The number of interrupt holdoff timers the SGE provides.
pub const SGE_NTIMERS: usize = 6;
/// The number of interrupt packet-count thresholds the SGE provides.
pub const SGE_NCOUNTERS: usize = 4;

/// The largest `CIDXINC` a single GTS write can carry.
pub const M_CIDXINC: u16 = 0xFFF;
/// The largest `PIDX` increment a single doorbell write can carry.
pub const M_PIDX: u16 = 0x3FFF;

const S_QID:        usize = 15;
const S_SEINTARM:   usize = 12;
const S_INGRESSQID: usize = 16;

/// The per-PF SGE registers used on the data path.
#[repr(C)]
pub struct SgePfRegisters {
    /// Kernel doorbell: queue id and producer index increment.
    pub kdoorbell:      Volatile<u32>,      // 0x0
    /// Ingress queue consumer index update and interrupt re-arm.
    pub gts:            Volatile<u32>,      // 0x4
}

const _: () = assert!(core::mem::size_of::<SgePfRegisters>() == 8);

/// The per-queue user doorbell segment in BAR2 (`UDBS_SEG_SIZE` bytes).
#[repr(C)]
pub struct UserDoorbellSegment {
    _padding0:          [u8; 8],            // 0x0 - 0x7
    /// User doorbell: queue id within the page and producer index increment.
    pub db:             Volatile<u32>,      // 0x8
    _padding1:          [u8; 52],           // 0xC - 0x3F
    /// Write-combined work request copy area.
    pub wr:             [Volatile<u64>; 8], // 0x40 - 0x7F
}

const _: () = assert!(core::mem::size_of::<UserDoorbellSegment>() == 128);

/// A doorbell write: `n` new descriptors were made available on queue `qid`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DoorbellValue {
    pub qid:    u32,
    pub pidx:   u16,
}

impl DoorbellValue {
    pub fn encode(&self) -> u32 {
        debug_assert!(self.pidx <= M_PIDX);
        let mut val = 0u32;
        val.set_bits(S_QID..32, self.qid);
        val.set_bits(0..14, self.pidx as u32);
        val
    }

    pub fn decode(val: u32) -> DoorbellValue {
        DoorbellValue {
            qid: val.get_bits(S_QID..32),
            pidx: val.get_bits(0..14) as u16,
        }
    }
}

/// A GTS write: return `cidxinc` credits to ingress queue `iqid` and
/// set its interrupt parameters to `seintarm`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GtsValue {
    pub cidxinc:    u16,
    pub seintarm:   u8,
    pub iqid:       u16,
}

impl GtsValue {
    pub fn encode(&self) -> u32 {
        debug_assert!(self.cidxinc <= M_CIDXINC);
        let mut val = 0u32;
        val.set_bits(0..12, self.cidxinc as u32);
        val.set_bits(S_SEINTARM..S_INGRESSQID, self.seintarm as u32);
        val.set_bits(S_INGRESSQID..32, self.iqid as u32);
        val
    }

    pub fn decode(val: u32) -> GtsValue {
        GtsValue {
            cidxinc: val.get_bits(0..12) as u16,
            seintarm: val.get_bits(S_SEINTARM..S_INGRESSQID) as u8,
            iqid: val.get_bits(S_INGRESSQID..32) as u16,
        }
    }
}

/// Encodes an ingress queue's interrupt parameters:
/// the holdoff timer index and whether the packet-count threshold is enabled.
pub fn intr_params(timer_idx: u8, cnt_en: bool) -> u8 {
    let mut val = 0u8;
    val.set_bits(1..4, timer_idx);
    val.set_bit(0, cnt_en);
    val
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doorbell_encoding() {
        let db = DoorbellValue { qid: 1030, pidx: 5 };
        assert_eq!(db.encode(), (1030 << 15) | 5);
        assert_eq!(DoorbellValue::decode(db.encode()), db);
    }

    #[test]
    fn gts_encoding() {
        let gts = GtsValue { cidxinc: 64, seintarm: intr_params(2, true), iqid: 17 };
        assert_eq!(gts.encode(), (17 << 16) | (0b101 << 12) | 64);
        assert_eq!(GtsValue::decode(gts.encode()), gts);
        assert_eq!(intr_params(X_TIMERREG_UPDATE_CIDX, false), 0xE);
    }

    #[test]
    fn register_writes() {
        let mut regs = SgePfRegisters { kdoorbell: Volatile::new(0), gts: Volatile::new(0) };
        regs.kdoorbell.write(DoorbellValue { qid: 3, pidx: 2 }.encode());
        assert_eq!(DoorbellValue::decode(regs.kdoorbell.read()).qid, 3);
    }
}
