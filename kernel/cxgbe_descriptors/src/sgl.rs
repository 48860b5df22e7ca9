//! The ULPTX direct scatter-gather list (`ulptx_sgl`).
//!
//! The first segment is stored inline with the command word:
//! `cmd_nsge | len0` in flit 0 and `addr0` in flit 1.
//! The remaining segments are stored in pairs of three flits each,
//! `len[0] | len[1]`, `addr[0]`, `addr[1]`. An unpaired last segment takes only
//! two flits and has a zero `len[1]`. The list is then padded with a zero flit
//! so that whatever follows it starts at a 16-byte boundary.

use alloc::vec::Vec;
use bit_field::BitField;
use byteorder::BigEndian;
use zerocopy::{
    byteorder::{U32, U64},
    AsBytes,
};

use crate::FLIT_SIZE;

/// ULP_TX sub-command: a direct scatter-gather list follows.
pub const ULP_TX_SC_DSGL: u8 = 0x82;

/// The most segments a non-TSO transmit SGL may have.
pub const TX_SGL_SEGS: usize = 39;
/// The most segments a TSO transmit SGL may have (the LSO CPL takes up room).
pub const TX_SGL_SEGS_TSO: usize = 38;

const S_ULPTX_CMD: usize = 24;

/// Errors that can occur while encoding or decoding a scatter-gather list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SglError {
    /// The list has no segments.
    Empty,
    /// A segment had a length of zero, which the hardware treats as padding.
    ZeroLengthSegment,
    /// The output buffer is too small for the encoded list.
    BufferTooSmall,
    /// The command word is not `ULP_TX_SC_DSGL`.
    BadCommand,
    /// The encoded list ends before all of its segments.
    Truncated,
}

impl From<SglError> for &'static str {
    fn from(e: SglError) -> &'static str {
        match e {
            SglError::Empty => "SGL has no segments",
            SglError::ZeroLengthSegment => "SGL segment has zero length",
            SglError::BufferTooSmall => "buffer too small for SGL",
            SglError::BadCommand => "not a ULP_TX_SC_DSGL command",
            SglError::Truncated => "SGL is truncated",
        }
    }
}

/// One DMA segment of a packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SglSegment {
    pub addr:   u64,
    pub len:    u32,
}

/// Returns the number of flits taken by an SGL of `nsegs` segments, excluding padding.
pub const fn sgl_nflits(nsegs: usize) -> usize {
    if nsegs == 0 {
        return 0;
    }
    let n = nsegs - 1;
    2 + (3 * n) / 2 + (n & 1)
}

/// Returns the number of bytes an SGL of `nsegs` segments occupies once padded.
pub const fn sgl_padded_len(nsegs: usize) -> usize {
    let nflits = sgl_nflits(nsegs);
    (nflits + (nflits & 1)) * FLIT_SIZE
}

/// An ordered list of DMA segments describing one packet.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Sgl {
    segs: Vec<SglSegment>,
}

impl Sgl {
    pub fn new() -> Sgl {
        Sgl { segs: Vec::new() }
    }

    pub fn with_capacity(n: usize) -> Sgl {
        Sgl { segs: Vec::with_capacity(n) }
    }

    pub fn push(&mut self, addr: u64, len: u32) {
        self.segs.push(SglSegment { addr, len });
    }

    pub fn segments(&self) -> &[SglSegment] {
        &self.segs
    }

    pub fn nsegs(&self) -> usize {
        self.segs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segs.is_empty()
    }

    /// The number of flits this list occupies, excluding padding.
    pub fn nflits(&self) -> usize {
        sgl_nflits(self.segs.len())
    }

    /// The number of bytes this list occupies once padded to 16 bytes.
    pub fn encoded_len(&self) -> usize {
        sgl_padded_len(self.segs.len())
    }

    /// Total number of payload bytes the list references.
    pub fn total_len(&self) -> usize {
        self.segs.iter().map(|s| s.len as usize).sum()
    }

    /// Writes the padded hardware encoding of this list to the start of `out`
    /// and returns the number of bytes written.
    pub fn encode(&self, out: &mut [u8]) -> Result<usize, SglError> {
        let (first, rest) = self.segs.split_first().ok_or(SglError::Empty)?;
        if self.segs.iter().any(|s| s.len == 0) {
            return Err(SglError::ZeroLengthSegment);
        }
        let total = self.encoded_len();
        if out.len() < total {
            return Err(SglError::BufferTooSmall);
        }

        let mut cmd_nsge = 0u32;
        cmd_nsge.set_bits(S_ULPTX_CMD..32, ULP_TX_SC_DSGL as u32);
        cmd_nsge.set_bits(0..16, self.segs.len() as u32);

        let mut pos = 0;
        let put32 = |out: &mut [u8], pos: &mut usize, v: u32| {
            out[*pos..*pos + 4].copy_from_slice(U32::<BigEndian>::new(v).as_bytes());
            *pos += 4;
        };
        put32(out, &mut pos, cmd_nsge);
        put32(out, &mut pos, first.len);
        out[pos..pos + 8].copy_from_slice(U64::<BigEndian>::new(first.addr).as_bytes());
        pos += 8;

        for pair in rest.chunks(2) {
            put32(out, &mut pos, pair[0].len);
            put32(out, &mut pos, pair.get(1).map_or(0, |s| s.len));
            for seg in pair {
                out[pos..pos + 8].copy_from_slice(U64::<BigEndian>::new(seg.addr).as_bytes());
                pos += 8;
            }
        }

        debug_assert_eq!(pos, self.nflits() * FLIT_SIZE);
        for b in &mut out[pos..total] {
            *b = 0;
        }
        Ok(total)
    }

    /// Parses a list previously written by [`Sgl::encode()`] (or by any other
    /// producer of `ulptx_sgl`) from the start of `bytes`.
    pub fn decode(bytes: &[u8]) -> Result<Sgl, SglError> {
        let get32 = |pos: usize| -> Result<u32, SglError> {
            let b = bytes.get(pos..pos + 4).ok_or(SglError::Truncated)?;
            Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        };
        let get64 = |pos: usize| -> Result<u64, SglError> {
            let hi = get32(pos)? as u64;
            let lo = get32(pos + 4)? as u64;
            Ok(hi << 32 | lo)
        };

        let cmd_nsge = get32(0)?;
        if cmd_nsge.get_bits(S_ULPTX_CMD..32) != ULP_TX_SC_DSGL as u32 {
            return Err(SglError::BadCommand);
        }
        let nsge = cmd_nsge.get_bits(0..16) as usize;
        if nsge == 0 {
            return Err(SglError::Empty);
        }
        let mut sgl = Sgl::with_capacity(nsge);
        sgl.push(get64(8)?, get32(4)?);

        let mut pos = 16;
        let mut remaining = nsge - 1;
        while remaining > 0 {
            let len0 = get32(pos)?;
            let len1 = get32(pos + 4)?;
            sgl.push(get64(pos + 8)?, len0);
            pos += 16;
            remaining -= 1;
            if remaining > 0 {
                sgl.push(get64(pos)?, len1);
                pos += 8;
                remaining -= 1;
            }
        }
        Ok(sgl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn flit_counts() {
        assert_eq!(sgl_nflits(1), 2);
        assert_eq!(sgl_nflits(2), 4);
        assert_eq!(sgl_nflits(3), 5);
        assert_eq!(sgl_nflits(4), 7);
        assert_eq!(sgl_padded_len(3), 48);
        assert_eq!(sgl_padded_len(TX_SGL_SEGS), 480);
    }

    #[test]
    fn odd_pair_layout() {
        let mut sgl = Sgl::new();
        sgl.push(0x1000, 100);
        sgl.push(0x2000, 200);
        let mut out = [0xFFu8; 40];
        assert_eq!(sgl.encode(&mut out), Ok(32));
        assert_eq!(&out[..8], &[0x82, 0, 0, 2, 0, 0, 0, 100]);
        // len[1] of an unpaired segment is zero
        assert_eq!(&out[16..24], &[0, 0, 0, 200, 0, 0, 0, 0]);
        assert_eq!(&out[24..32], &[0, 0, 0, 0, 0, 0, 0x20, 0]);
        assert_eq!(out[32], 0xFF);
    }

    #[test]
    fn padding_is_zeroed() {
        let mut sgl = Sgl::new();
        for i in 0..3 {
            sgl.push(0x1000 * (i + 1), 64);
        }
        let mut out = [0xFFu8; 48];
        assert_eq!(sgl.encode(&mut out), Ok(48));
        assert_eq!(&out[40..48], &[0; 8]);
    }

    #[test]
    fn encode_errors() {
        let mut out = [0u8; 64];
        assert_eq!(Sgl::new().encode(&mut out), Err(SglError::Empty));
        let mut sgl = Sgl::new();
        sgl.push(0x1000, 0);
        assert_eq!(sgl.encode(&mut out), Err(SglError::ZeroLengthSegment));
        let mut sgl = Sgl::new();
        sgl.push(0x1000, 10);
        sgl.push(0x1000, 10);
        assert_eq!(sgl.encode(&mut out[..16]), Err(SglError::BufferTooSmall));
        assert_eq!(Sgl::decode(&[0u8; 16]), Err(SglError::BadCommand));
        assert_eq!(Sgl::decode(&out[..8]), Err(SglError::BadCommand));
    }

    #[test]
    fn truncated_decode() {
        let mut sgl = Sgl::new();
        for i in 0..5u64 {
            sgl.push(i << 12, 1500);
        }
        let mut out = [0u8; 128];
        let n = sgl.encode(&mut out).unwrap();
        assert_eq!(Sgl::decode(&out[..n - 16]), Err(SglError::Truncated));
    }

    proptest! {
        #[test]
        fn encode_decode(segs in prop::collection::vec((any::<u64>(), 1u32..=u32::MAX), 1..=TX_SGL_SEGS)) {
            let mut sgl = Sgl::new();
            for (addr, len) in &segs {
                sgl.push(*addr, *len);
            }
            let mut out = [0u8; 512];
            let n = sgl.encode(&mut out).unwrap();
            prop_assert_eq!(n % 16, 0);
            prop_assert_eq!(n, sgl.encoded_len());
            prop_assert_eq!(Sgl::decode(&out[..n]).unwrap(), sgl);
        }
    }
}
