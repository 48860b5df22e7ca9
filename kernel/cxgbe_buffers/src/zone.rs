//! Size-class allocators for receive clusters.

use alloc::{boxed::Box, sync::Arc, vec::Vec};
use core::{
    cell::UnsafeCell,
    fmt,
    ops::Deref,
    sync::atomic::{AtomicUsize, Ordering},
};
use spin::Mutex;

/// The sizes of the software cluster zones, smallest first.
pub const CLUSTER_ZONE_SIZES: [usize; 4] = [2048, 4096, 9216, 16384];

/// Every cluster is mapped at a bus address aligned to this many bytes.
const BUS_ADDR_ALIGN: u64 = 4096;

struct ZoneInner {
    /// Clusters that were returned and can be handed out again without a new mapping.
    cache: Vec<(Box<[u8]>, u64)>,
    /// The most clusters that may be outstanding at once, if limited.
    limit: Option<usize>,
    next_bus_addr: u64,
}

/// A zone of equally sized receive clusters.
///
/// A zone can be given a limit on the number of clusters outstanding at once,
/// which is how memory pressure shows up to the free lists that allocate from it.
pub struct ClusterZone {
    size: usize,
    inner: Mutex<ZoneInner>,
    allocated: AtomicUsize,
    released: AtomicUsize,
}

impl ClusterZone {
    /// Creates a zone of `size`-byte clusters whose bus addresses start at `bus_base`.
    pub fn new(size: usize, bus_base: u64) -> Arc<ClusterZone> {
        Arc::new(ClusterZone {
            size,
            inner: Mutex::new(ZoneInner {
                cache: Vec::new(),
                limit: None,
                next_bus_addr: bus_base,
            }),
            allocated: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
        })
    }

    /// Creates one zone per entry of [`CLUSTER_ZONE_SIZES`].
    pub fn standard_zones() -> Vec<Arc<ClusterZone>> {
        CLUSTER_ZONE_SIZES.iter().enumerate()
            .map(|(i, size)| ClusterZone::new(*size, ((i as u64) + 1) << 36))
            .collect()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Allocates one cluster, or returns `None` if the zone is at its limit.
    pub fn alloc(self: &Arc<Self>) -> Option<Cluster> {
        let (buf, bus_addr) = {
            let mut inner = self.inner.lock();
            if let Some(limit) = inner.limit {
                if self.outstanding() >= limit {
                    trace!("ClusterZone({}): at limit of {} clusters", self.size, limit);
                    return None;
                }
            }
            self.allocated.fetch_add(1, Ordering::AcqRel);
            match inner.cache.pop() {
                Some(cached) => cached,
                None => {
                    let bus_addr = inner.next_bus_addr;
                    let stride = (self.size as u64 + BUS_ADDR_ALIGN - 1) & !(BUS_ADDR_ALIGN - 1);
                    inner.next_bus_addr += stride;
                    (alloc::vec![0u8; self.size].into_boxed_slice(), bus_addr)
                }
            }
        };
        Some(Cluster {
            buf: UnsafeCell::new(buf),
            bus_addr,
            zone: Arc::clone(self),
        })
    }

    /// Limits the number of clusters that may be outstanding at once.
    /// `None` removes the limit.
    pub fn set_limit(&self, limit: Option<usize>) {
        self.inner.lock().limit = limit;
    }

    /// The total number of clusters handed out by this zone.
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Acquire)
    }

    /// The total number of clusters returned to this zone.
    pub fn released(&self) -> usize {
        self.released.load(Ordering::Acquire)
    }

    /// The number of clusters currently alive.
    pub fn outstanding(&self) -> usize {
        self.allocated() - self.released()
    }

    fn release(&self, buf: Box<[u8]>, bus_addr: u64) {
        self.inner.lock().cache.push((buf, bus_addr));
        self.released.fetch_add(1, Ordering::AcqRel);
    }
}

impl fmt::Debug for ClusterZone {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ClusterZone {{ size: {}, allocated: {}, released: {} }}",
            self.size, self.allocated(), self.released())
    }
}

/// A receive buffer that is contiguous in bus address space.
///
/// Auto-dereferences into a byte slice covering the whole cluster.
/// When dropped, its memory is returned to the zone it came from.
pub struct Cluster {
    buf: UnsafeCell<Box<[u8]>>,
    bus_addr: u64,
    zone: Arc<ClusterZone>,
}

// The only mutable access to the memory is `device_write()`, whose callers guarantee
// that the region written was never handed out to a reader.
unsafe impl Send for Cluster {}
unsafe impl Sync for Cluster {}

impl Cluster {
    pub fn bus_addr(&self) -> u64 {
        self.bus_addr
    }

    pub fn zone(&self) -> &Arc<ClusterZone> {
        &self.zone
    }

    /// Copies `data` into the cluster at `offset`, the way the device's DMA engine
    /// fills a posted buffer.
    ///
    /// # Safety
    /// No reference to the bytes in `offset .. offset + data.len()` may exist.
    /// Hardware only writes to parts of a buffer that the driver has not yet
    /// handed out as frame payload, so this holds for a correctly behaving device.
    pub unsafe fn device_write(&self, offset: usize, data: &[u8]) {
        let buf = &mut *self.buf.get();
        buf[offset..offset + data.len()].copy_from_slice(data);
    }

    /// Returns a mutable view of the cluster's memory when nothing else can observe it.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.buf.get_mut()
    }
}

impl Deref for Cluster {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: see `device_write()`
        unsafe { &*self.buf.get() }
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        let buf = core::mem::take(self.buf.get_mut());
        self.zone.release(buf, self.bus_addr);
    }
}

impl fmt::Debug for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Cluster {{ size: {}, bus_addr: {:#X} }}", self.zone.size, self.bus_addr)
    }
}
