//! Matching software cluster zones to hardware buffer sizes.
//!
//! Every free-list buffer address carries an index into the SGE's buffer size table,
//! which tells the hardware how many bytes it may write into the buffer. A cluster
//! can be posted either at its full size, or, when buffer packing is in use, at a
//! smaller hardware size that leaves room for the cluster's trailing metadata.

use alloc::vec::Vec;

use crate::config::{SgeConfig, PAGE_SIZE};

/// Room reserved at the end of a packed cluster for its shared-ownership metadata.
pub const CL_METADATA_SIZE: usize = 64;

/// The hardware buffer sizes usable with one software zone.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RxBufInfo {
    /// The zone's cluster size.
    pub size1: usize,
    /// The hardware index whose size equals `size1`.
    pub hwidx1: Option<u8>,
    /// The largest hardware size that still leaves `CL_METADATA_SIZE` bytes of the cluster unused.
    pub size2: usize,
    pub hwidx2: Option<u8>,
}

/// Which zone a free list allocates from and how its clusters are posted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClusterLayout {
    /// Index of the cluster zone.
    pub zidx: usize,
    /// Index into the hardware buffer size table.
    pub hwidx: u8,
    /// The number of bytes the hardware may write into the cluster.
    pub hwsize: usize,
    /// Whether several frames may share one cluster.
    pub packing: bool,
}

/// The [`RxBufInfo`] of every zone, built once from the configuration.
#[derive(Clone, Debug)]
pub struct RxBufTable {
    info: Vec<RxBufInfo>,
    safe_zidx: Option<usize>,
    largest_rx_cluster: usize,
}

fn hwsz_ok(hwsize: usize, pad_boundary: usize) -> bool {
    hwsize >= 64 && hwsize % pad_boundary == 0
}

impl RxBufTable {
    pub fn new(config: &SgeConfig) -> RxBufTable {
        let mut info = Vec::with_capacity(config.zone_sizes.len());
        for &size1 in &config.zone_sizes {
            let mut rxb = RxBufInfo { size1, hwidx1: None, size2: 0, hwidx2: None };
            for (j, &hwsize) in config.buffer_sizes.iter().enumerate() {
                if !hwsz_ok(hwsize, config.pad_boundary) {
                    continue;
                }
                if rxb.hwidx1.is_none() && hwsize == size1 {
                    rxb.hwidx1 = Some(j as u8);
                }
                if size1 < hwsize + CL_METADATA_SIZE {
                    continue;
                }
                let waste = size1 - hwsize - CL_METADATA_SIZE;
                if waste == 0 {
                    rxb.hwidx2 = Some(j as u8);
                    rxb.size2 = hwsize;
                    break;
                }
                let better = match rxb.hwidx2 {
                    Some(_) => waste < size1 - rxb.size2 - CL_METADATA_SIZE,
                    None => waste <= 2 * CL_METADATA_SIZE,
                };
                if better {
                    rxb.hwidx2 = Some(j as u8);
                    rxb.size2 = hwsize;
                }
            }
            debug!("RxBufTable: zone {}: hwidx1 {:?}, size2 {} (hwidx2 {:?})",
                size1, rxb.hwidx1, rxb.size2, rxb.hwidx2);
            info.push(rxb);
        }

        let safe_zidx = info.iter()
            .position(|rxb| rxb.size1 == config.safest_rx_cluster && rxb.hwidx1.is_some());
        if safe_zidx.is_none() {
            warn!("RxBufTable: no usable zone of the safe cluster size {}", config.safest_rx_cluster);
        }

        RxBufTable { info, safe_zidx, largest_rx_cluster: config.largest_rx_cluster }
    }

    pub fn get(&self, zidx: usize) -> Option<&RxBufInfo> {
        self.info.get(zidx)
    }

    /// Picks the zone and hardware size that best fit payloads of up to `maxp` bytes.
    ///
    /// With packing, clusters smaller than a page aren't considered (unless nothing
    /// larger is allowed) and the first zone whose packing size holds `maxp` wins.
    /// Without packing, the smallest zone that holds `maxp` wins.
    /// In both cases the largest usable zone is the fallback.
    pub fn find_refill_source(&self, maxp: usize, packing: bool) -> Option<ClusterLayout> {
        let mut best = None;
        for (zidx, rxb) in self.info.iter().enumerate() {
            if rxb.size1 > self.largest_rx_cluster {
                break;
            }
            if packing {
                if rxb.size1 < PAGE_SIZE && rxb.size1 < self.largest_rx_cluster {
                    continue;
                }
                let hwidx = match rxb.hwidx2 {
                    Some(hwidx) => hwidx,
                    None => continue,
                };
                best = Some(ClusterLayout { zidx, hwidx, hwsize: rxb.size2, packing: true });
                if rxb.size2 >= maxp {
                    break;
                }
            } else {
                let hwidx = match rxb.hwidx1 {
                    Some(hwidx) => hwidx,
                    None => continue,
                };
                best = Some(ClusterLayout { zidx, hwidx, hwsize: rxb.size1, packing: false });
                if rxb.size1 >= maxp {
                    break;
                }
            }
        }
        best
    }

    /// The layout to fall back on when the primary zone can't supply a cluster:
    /// the page-sized zone, packed if the free list packs and the zone allows it.
    pub fn find_safe_refill_source(&self, packing: bool) -> Option<ClusterLayout> {
        let zidx = self.safe_zidx?;
        let rxb = &self.info[zidx];
        match (packing, rxb.hwidx2) {
            (true, Some(hwidx)) => Some(ClusterLayout { zidx, hwidx, hwsize: rxb.size2, packing: true }),
            _ => rxb.hwidx1.map(|hwidx| ClusterLayout { zidx, hwidx, hwsize: rxb.size1, packing: false }),
        }
    }
}
