//! Packets handed to the SGE for transmission.

use alloc::{boxed::Box, sync::Arc, vec::Vec};
use core::ops::{Deref, DerefMut};

use crate::zone::{Cluster, ClusterZone};

enum TxStorage {
    Heap(Box<[u8]>),
    Cluster(Cluster),
}

/// A buffer that stores (part of) a packet to be transmitted through the NIC
/// and is guaranteed to be contiguous in bus address space.
/// Auto-dereferences into a byte slice that represents its valid bytes.
pub struct TransmitBuffer {
    storage: TxStorage,
    bus_addr: u64,
    length: usize,
}

impl TransmitBuffer {
    /// Wraps `data`, which the packet stack has already mapped at `bus_addr`.
    pub fn new(data: Vec<u8>, bus_addr: u64) -> TransmitBuffer {
        let length = data.len();
        TransmitBuffer {
            storage: TxStorage::Heap(data.into_boxed_slice()),
            bus_addr,
            length,
        }
    }

    /// Uses the first `length` bytes of `cluster` as a transmit buffer.
    pub fn from_cluster(cluster: Cluster, length: usize) -> Result<TransmitBuffer, &'static str> {
        if length > cluster.len() {
            return Err("TransmitBuffer::from_cluster(): length exceeds cluster size");
        }
        Ok(TransmitBuffer {
            bus_addr: cluster.bus_addr(),
            storage: TxStorage::Cluster(cluster),
            length,
        })
    }

    pub fn bus_addr(&self) -> u64 {
        self.bus_addr
    }

    pub fn length(&self) -> usize {
        self.length
    }

    /// Sets the buffer's length.
    ///
    /// Returns an error if the length is greater than the current length.
    pub fn set_length(&mut self, length: usize) -> Result<(), &'static str> {
        if length > self.length {
            Err("TransmitBuffer::set_length(): length too long")
        } else {
            self.length = length;
            Ok(())
        }
    }
}

impl Deref for TransmitBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match &self.storage {
            TxStorage::Heap(b) => &b[..self.length],
            TxStorage::Cluster(c) => &c[..self.length],
        }
    }
}

impl DerefMut for TransmitBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        let length = self.length;
        match &mut self.storage {
            TxStorage::Heap(b) => &mut b[..length],
            TxStorage::Cluster(c) => &mut c.as_mut_slice()[..length],
        }
    }
}

bitflags! {
    /// The checksums the packet stack asks the hardware to compute.
    pub struct TxCsumFlags: u8 {
        const IP        = 1 << 0;
        const TCP       = 1 << 1;
        const UDP       = 1 << 2;
        const TCP_IPV6  = 1 << 3;
        const UDP_IPV6  = 1 << 4;
    }
}

/// The offloads requested for one outbound packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TxOffload {
    pub csum:       TxCsumFlags,
    /// The segment size, if the hardware should segment this TCP packet.
    pub tso_mss:    Option<u16>,
    /// The 802.1Q tag the hardware should insert.
    pub vlan:       Option<u16>,
}

impl Default for TxOffload {
    fn default() -> Self {
        TxOffload { csum: TxCsumFlags::empty(), tso_mss: None, vlan: None }
    }
}

impl TxOffload {
    pub fn is_tso(&self) -> bool {
        self.tso_mss.is_some()
    }

    pub fn needs_l3_csum(&self) -> bool {
        self.csum.contains(TxCsumFlags::IP) || self.is_tso()
    }

    pub fn needs_l4_csum(&self) -> bool {
        self.csum.intersects(TxCsumFlags::TCP | TxCsumFlags::UDP | TxCsumFlags::TCP_IPV6 | TxCsumFlags::UDP_IPV6)
            || self.is_tso()
    }
}

/// An outbound packet: a chain of buffers plus its offload requests.
pub struct TxPacket {
    bufs: Vec<TransmitBuffer>,
    pub offload: TxOffload,
}

impl TxPacket {
    pub fn new(bufs: Vec<TransmitBuffer>) -> TxPacket {
        TxPacket { bufs, offload: TxOffload::default() }
    }

    pub fn with_offload(bufs: Vec<TransmitBuffer>, offload: TxOffload) -> TxPacket {
        TxPacket { bufs, offload }
    }

    pub fn buffers(&self) -> &[TransmitBuffer] {
        &self.bufs
    }

    /// The total length of the packet in bytes.
    pub fn len(&self) -> usize {
        self.bufs.iter().map(|b| b.length()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The number of DMA segments needed to describe the packet.
    pub fn nsegs(&self) -> usize {
        self.bufs.iter().filter(|b| b.length() > 0).count()
    }

    /// Copies as much of the start of the packet as fits into `out`.
    /// Returns the number of bytes copied.
    pub fn copy_prefix(&self, out: &mut [u8]) -> usize {
        let mut copied = 0;
        for buf in &self.bufs {
            if copied == out.len() {
                break;
            }
            let n = core::cmp::min(buf.length(), out.len() - copied);
            out[copied..copied + n].copy_from_slice(&buf[..n]);
            copied += n;
        }
        copied
    }

    /// Overwrites the packet's bytes starting at `offset` with `data`.
    pub fn write_at(&mut self, mut offset: usize, data: &[u8]) -> Result<(), &'static str> {
        if offset + data.len() > self.len() {
            return Err("TxPacket::write_at(): write past end of packet");
        }
        let mut written = 0;
        for buf in self.bufs.iter_mut() {
            if written == data.len() {
                break;
            }
            if offset >= buf.length() {
                offset -= buf.length();
                continue;
            }
            let n = core::cmp::min(buf.length() - offset, data.len() - written);
            buf[offset..offset + n].copy_from_slice(&data[written..written + n]);
            written += n;
            offset = 0;
        }
        Ok(())
    }

    /// Compacts the packet's data into as few clusters from `zone` as possible,
    /// so that it needs at most `max_segs` DMA segments.
    ///
    /// The packet is left untouched on failure.
    pub fn collapse(&mut self, max_segs: usize, zone: &Arc<ClusterZone>) -> Result<(), &'static str> {
        if self.nsegs() <= max_segs {
            return Ok(());
        }
        let len = self.len();
        let chunk = zone.size();
        let needed = (len + chunk - 1) / chunk;
        if needed > max_segs {
            return Err("TxPacket::collapse(): packet needs too many clusters");
        }

        let mut clusters = Vec::with_capacity(needed);
        for _ in 0..needed {
            clusters.push(zone.alloc().ok_or("TxPacket::collapse(): out of clusters")?);
        }

        let mut bufs = Vec::with_capacity(needed);
        let mut offset = 0;
        for mut cluster in clusters {
            let n = core::cmp::min(chunk, len - offset);
            self.copy_range(offset, &mut cluster.as_mut_slice()[..n]);
            bufs.push(TransmitBuffer::from_cluster(cluster, n)?);
            offset += n;
        }
        debug!("TxPacket::collapse(): {} segments -> {}", self.nsegs(), bufs.len());
        self.bufs = bufs;
        Ok(())
    }

    fn copy_range(&self, mut offset: usize, out: &mut [u8]) {
        let mut copied = 0;
        for buf in &self.bufs {
            if copied == out.len() {
                break;
            }
            if offset >= buf.length() {
                offset -= buf.length();
                continue;
            }
            let n = core::cmp::min(buf.length() - offset, out.len() - copied);
            out[copied..copied + n].copy_from_slice(&buf[offset..offset + n]);
            copied += n;
            offset = 0;
        }
    }
}
