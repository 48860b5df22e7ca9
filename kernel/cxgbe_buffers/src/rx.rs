//! Frames received from the SGE.

use alloc::{sync::Arc, vec::Vec};
use core::fmt;

use crate::zone::Cluster;

/// A contiguous piece of a received frame.
pub enum RxSegment {
    /// A small segment that was copied out of its cluster into a heap buffer.
    Copied(Vec<u8>),
    /// A segment that owns a whole cluster. Nothing else uses the cluster.
    Owned { cluster: Cluster, offset: usize, len: usize },
    /// A segment in a packed cluster that other frames (or the free list) may also reference.
    Shared { cluster: Arc<Cluster>, offset: usize, len: usize },
}

impl RxSegment {
    pub fn len(&self) -> usize {
        match self {
            RxSegment::Copied(v) => v.len(),
            RxSegment::Owned { len, .. } | RxSegment::Shared { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        match self {
            RxSegment::Copied(v) => v.as_slice(),
            RxSegment::Owned { cluster, offset, len } => &cluster[*offset..*offset + *len],
            RxSegment::Shared { cluster, offset, len } => &cluster[*offset..*offset + *len],
        }
    }

    /// Drops the first `n` bytes of this segment.
    fn advance(&mut self, n: usize) {
        match self {
            RxSegment::Copied(v) => { v.drain(..n); }
            RxSegment::Owned { offset, len, .. } | RxSegment::Shared { offset, len, .. } => {
                *offset += n;
                *len -= n;
            }
        }
    }
}

impl fmt::Debug for RxSegment {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RxSegment::Copied(v) => write!(f, "Copied({})", v.len()),
            RxSegment::Owned { offset, len, .. } => write!(f, "Owned({}+{})", offset, len),
            RxSegment::Shared { cluster, offset, len } =>
                write!(f, "Shared({}+{}, refs: {})", offset, len, Arc::strong_count(cluster)),
        }
    }
}

bitflags! {
    /// The checksum verification the hardware did on a received frame.
    pub struct RxCsumFlags: u8 {
        /// The IPv4 header checksum was checked.
        const IP_CHECKED    = 1 << 0;
        /// The IPv4 header checksum is correct.
        const IP_VALID      = 1 << 1;
        /// The TCP or UDP checksum was checked and is correct.
        const L4_VALID      = 1 << 2;
    }
}

/// Metadata the hardware reported alongside a received frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RxMeta {
    pub csum:       RxCsumFlags,
    /// The 802.1Q tag the hardware stripped from the frame.
    pub vlan:       Option<u16>,
    /// The context id of the ingress queue the frame arrived on.
    pub iq:         u16,
    /// The port the frame arrived on.
    pub port:       u8,
}

impl Default for RxMeta {
    fn default() -> Self {
        RxMeta { csum: RxCsumFlags::empty(), vlan: None, iq: 0, port: 0 }
    }
}

/// A network (e.g., Ethernet) frame that has been received by the NIC.
#[derive(Debug, Default)]
pub struct ReceivedFrame {
    segs: Vec<RxSegment>,
    pub meta: RxMeta,
}

impl ReceivedFrame {
    pub fn new() -> ReceivedFrame {
        ReceivedFrame::default()
    }

    pub fn push(&mut self, seg: RxSegment) {
        self.segs.push(seg);
    }

    pub fn segments(&self) -> &[RxSegment] {
        &self.segs
    }

    pub fn nsegs(&self) -> usize {
        self.segs.len()
    }

    /// The length of the frame in bytes.
    pub fn len(&self) -> usize {
        self.segs.iter().map(RxSegment::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes `n` bytes from the front of the frame, e.g., the padding the
    /// hardware inserts ahead of the Ethernet header.
    pub fn trim_front(&mut self, mut n: usize) {
        while n > 0 && !self.segs.is_empty() {
            let first = self.segs[0].len();
            if first <= n {
                self.segs.remove(0);
                n -= first;
            } else {
                self.segs[0].advance(n);
                n = 0;
            }
        }
    }

    /// Copies the frame into one contiguous vector.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut v = Vec::with_capacity(self.len());
        for seg in &self.segs {
            v.extend_from_slice(seg.as_slice());
        }
        v
    }
}
