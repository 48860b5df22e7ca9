//! This crate defines the layout of memory objects that make up the software interface
//! between the Chelsio T4/T5 Scatter Gather Engine (SGE) and the driver,
//! as well as functions to access the different fields of these objects.
//!
//! Everything the SGE reads or writes through DMA is big-endian and built out of
//! 8-byte "flits". The records here are therefore made of `zerocopy` byteorder types,
//! which have an alignment of 1 and can be laid directly over descriptor memory.
//!
//! * [`ingress`]: ingress queue entries, the response control trailer, and the CPL
//!   messages that the SGE posts to ingress queues.
//! * [`egress`]: egress descriptors, the egress status page, work-request headers
//!   and the CPL messages that prefix outbound Ethernet payloads.
//! * [`sgl`]: the ULPTX direct scatter-gather list that references payload memory.
//! * [`registers`]: doorbell and GTS register encodings and the MMIO register blocks.

#![cfg_attr(not(test), no_std)]

extern crate alloc;
#[macro_use] extern crate static_assertions;
extern crate bit_field;
extern crate byteorder;
extern crate volatile;
extern crate zerocopy;

pub mod egress;
pub mod ingress;
pub mod registers;
pub mod sgl;

use byteorder::BigEndian;
use zerocopy::byteorder::U64;

/// One flit: the 8-byte unit in which the SGE measures descriptors and work requests.
pub type Flit = U64<BigEndian>;

/// The size of a flit in bytes.
pub const FLIT_SIZE: usize = 8;

/// The size of one egress queue descriptor in bytes (one `tx_desc`).
pub const EQ_ESIZE: usize = 64;

/// The number of flits in one egress descriptor.
pub const FLITS_PER_DESC: usize = EQ_ESIZE / FLIT_SIZE;

/// The size of one ingress queue entry in bytes.
pub const IQ_ESIZE: usize = 64;

/// The size of the status page that trails every egress queue and free list ring.
pub const SPG_LEN: usize = 64;

/// The largest work request the SGE accepts, in bytes.
pub const SGE_MAX_WR_LEN: usize = 512;

/// The largest work request the SGE accepts, in 16-byte units.
pub const SGE_MAX_WR_LEN16: usize = SGE_MAX_WR_LEN / 16;

/// The number of free-list buffer addresses that fit in one 64-byte descriptor.
pub const FL_BUFS_PER_DESC: usize = EQ_ESIZE / FLIT_SIZE;

/// Rounds `bytes` up to a number of 16-byte units, as used by every `len16` field.
pub const fn len16(bytes: usize) -> usize {
    (bytes + 15) / 16
}

/// Returns the number of egress descriptors consumed by a work request of `len16` units.
pub const fn len16_to_ndesc(len16: usize) -> usize {
    (len16 + (EQ_ESIZE / 16) - 1) / (EQ_ESIZE / 16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn len16_rounding() {
        assert_eq!(len16(0), 0);
        assert_eq!(len16(1), 1);
        assert_eq!(len16(16), 1);
        assert_eq!(len16(17), 2);
        assert_eq!(len16_to_ndesc(4), 1);
        assert_eq!(len16_to_ndesc(5), 2);
        assert_eq!(len16_to_ndesc(SGE_MAX_WR_LEN16), 8);
    }
}
