//! Ring indices and descriptor rings.

use alloc::boxed::Box;
use core::mem::size_of;
use zerocopy::{AsBytes, FromBytes};

/// A position in a ring of `size` entries.
///
/// All arithmetic is modulo the ring size. Mixing indices of different rings is a bug
/// and panics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RingIndex {
    pos: usize,
    size: usize,
}

impl RingIndex {
    pub fn new(size: usize) -> RingIndex {
        assert!(size >= 2, "a ring needs at least two entries");
        RingIndex { pos: 0, size }
    }

    pub fn at(pos: usize, size: usize) -> RingIndex {
        assert!(pos < size);
        RingIndex { pos, size }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Moves the index forward by `n` entries. Returns `true` if it wrapped around.
    pub fn advance(&mut self, n: usize) -> bool {
        assert!(n < self.size, "advance({}) on a ring of {}", n, self.size);
        let next = self.pos + n;
        if next >= self.size {
            self.pos = next - self.size;
            true
        } else {
            self.pos = next;
            false
        }
    }

    /// Returns the index `n` entries ahead of this one.
    pub fn plus(mut self, n: usize) -> RingIndex {
        self.advance(n);
        self
    }

    /// The number of entries from this index forward to `head`.
    pub fn distance_to(&self, head: RingIndex) -> usize {
        assert_eq!(self.size, head.size, "indices of different rings");
        if head.pos >= self.pos {
            head.pos - self.pos
        } else {
            head.pos + self.size - self.pos
        }
    }

    /// The number of entries from this index to the end of the ring.
    pub fn to_wrap(&self) -> usize {
        self.size - self.pos
    }
}

/// A ring of hardware descriptors of type `D`.
pub struct DescRing<D> {
    descs: Box<[D]>,
}

impl<D: FromBytes + AsBytes> DescRing<D> {
    /// Creates a zeroed ring of `size` descriptors.
    pub fn new(size: usize) -> DescRing<D> {
        DescRing {
            descs: (0..size).map(|_| D::new_zeroed()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.descs.len()
    }

    /// The raw bytes of descriptor `i`, which need not be part of the ring proper.
    pub fn desc_bytes(&self, i: usize) -> &[u8] {
        self.descs[i].as_bytes()
    }

    pub fn desc_bytes_mut(&mut self, i: usize) -> &mut [u8] {
        self.descs[i].as_bytes_mut()
    }

    pub fn get(&self, idx: RingIndex) -> &D {
        &self.descs[idx.pos()]
    }

    pub fn get_mut(&mut self, idx: RingIndex) -> &mut D {
        &mut self.descs[idx.pos()]
    }

    /// Copies `bytes` into the ring starting at descriptor `start`,
    /// continuing at the first descriptor if the end of the ring is reached.
    ///
    /// The ring ends at `start.size()`, so descriptors past that
    /// (e.g., a trailing status page) are never touched.
    pub fn copy_in(&mut self, start: RingIndex, bytes: &[u8]) {
        assert!(start.size() <= self.descs.len());
        let ring = self.descs[..start.size()].as_bytes_mut();
        assert!(bytes.len() <= ring.len());
        let offset = start.pos() * size_of::<D>();
        let first = core::cmp::min(bytes.len(), ring.len() - offset);
        ring[offset..offset + first].copy_from_slice(&bytes[..first]);
        let rest = bytes.len() - first;
        ring[..rest].copy_from_slice(&bytes[first..]);
    }

    /// Copies `out.len()` bytes out of the ring starting at descriptor `start`,
    /// wrapping around the same way [`DescRing::copy_in()`] does.
    pub fn copy_out(&self, start: RingIndex, out: &mut [u8]) {
        assert!(start.size() <= self.descs.len());
        let ring = self.descs[..start.size()].as_bytes();
        assert!(out.len() <= ring.len());
        let offset = start.pos() * size_of::<D>();
        let first = core::cmp::min(out.len(), ring.len() - offset);
        out[..first].copy_from_slice(&ring[offset..offset + first]);
        let rest = out.len() - first;
        out[first..].copy_from_slice(&ring[..rest]);
    }
}
