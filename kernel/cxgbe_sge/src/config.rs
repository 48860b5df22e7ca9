//! Configuration of the queue engine.
//!
//! All tunables are collected in one [`SgeConfig`] that is handed to [`crate::Sge::new()`]
//! and never changes afterwards. The defaults mirror what the firmware programs
//! into a T4/T5 SGE at attach time.

use alloc::vec::Vec;
use cxgbe_buffers::CLUSTER_ZONE_SIZES;

/// The page size of the host.
pub const PAGE_SIZE: usize = 4096;

/// The free-list buffer pad boundary, in bytes.
pub const DEFAULT_PAD_BOUNDARY: usize = 32;
/// The free-list buffer pack boundary, in bytes.
pub const DEFAULT_PACK_BOUNDARY: usize = 64;
/// Padding the SGE inserts in front of every received frame, in bytes.
pub const DEFAULT_PKTSHIFT: usize = 2;
/// Payload segments shorter than this are copied rather than shared.
pub const DEFAULT_RX_COPY_THRESHOLD: usize = 256;
/// Frames up to this long are sent as immediate data (two descriptors).
pub const DEFAULT_TX_IMM_LEN: usize = 96;
/// TCP frames shorter than this get a software checksum (T4 erratum).
pub const DEFAULT_SHORT_TCP_CSUM_THRESHOLD: u16 = 60;
/// Descriptors accumulated on an egress queue before the doorbell is rung.
pub const DEFAULT_DB_BATCH: usize = 16;
/// A free list with fewer buffers than this is starving.
pub const DEFAULT_FL_STARVE_THRESHOLD: usize = 64;

/// The hardware buffer size table (`SGE_FL_BUFFER_SIZE0..15`) the driver asks the
/// firmware to program. The order matters: a free-list buffer address carries the
/// index into this table in its low bits.
pub const DEFAULT_HW_BUF_SIZES: [usize; 9] = [
    2048,
    4096,
    4096 - 64,
    4096 - 2 * 256 - 64,
    9216,
    16384,
    2048 - 256 - 64,
    9216 - 64,
    16384 - 64,
];

/// Interrupt holdoff timers in microseconds (`SGE_TIMER_VALUE_0..5`).
pub const DEFAULT_COALESCE_TIMERS: [u16; 6] = [1, 5, 10, 50, 100, 200];
/// Interrupt packet-count thresholds (`SGE_INGRESS_RX_THRESHOLD`).
pub const DEFAULT_INTR_THRESHOLDS: [u8; 4] = [1, 8, 16, 32];

/// What the congestion manager does when an ingress channel backs up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CongestionPolicy {
    /// No congestion feedback.
    None,
    /// Send backpressure (pause frames) to the link partner.
    Backpressure,
    /// Drop frames at the channel.
    Drop,
}

impl CongestionPolicy {
    /// The value the firmware's `cong_drop` parameter expects.
    pub fn firmware_value(&self) -> i8 {
        match self {
            CongestionPolicy::None => -1,
            CongestionPolicy::Backpressure => 0,
            CongestionPolicy::Drop => 1,
        }
    }
}

/// The immutable configuration of one SGE.
#[derive(Clone, Debug)]
pub struct SgeConfig {
    /// Physical function that owns the queues.
    pub pf: u8,
    /// The boundary the SGE pads free-list payload to.
    pub pad_boundary: usize,
    /// The boundary the SGE aligns packed frames to within one buffer.
    pub pack_boundary: usize,
    /// Whether free lists may pack several frames into one buffer.
    pub buffer_packing: bool,
    /// The hardware buffer size table.
    pub buffer_sizes: Vec<usize>,
    /// The sizes of the software cluster zones, smallest first.
    pub zone_sizes: Vec<usize>,
    /// The largest cluster a free list may use.
    pub largest_rx_cluster: usize,
    /// The cluster size of the fallback zone used under memory pressure.
    pub safest_rx_cluster: usize,
    pub coalesce_timers: [u16; 6],
    pub interrupt_thresholds: [u8; 4],
    pub congestion_policy: CongestionPolicy,
    pub pktshift: usize,
    pub rx_copy_threshold: usize,
    pub tx_imm_len: usize,
    /// TCP frames shorter than this are checksummed in software. `None` disables the workaround.
    pub short_tcp_csum_threshold: Option<u16>,
    pub db_batch: usize,
    pub fl_starve_threshold: usize,
}

impl Default for SgeConfig {
    fn default() -> Self {
        SgeConfig {
            pf: 0,
            pad_boundary: DEFAULT_PAD_BOUNDARY,
            pack_boundary: DEFAULT_PACK_BOUNDARY,
            buffer_packing: true,
            buffer_sizes: DEFAULT_HW_BUF_SIZES.to_vec(),
            zone_sizes: CLUSTER_ZONE_SIZES.to_vec(),
            largest_rx_cluster: 16384,
            safest_rx_cluster: PAGE_SIZE,
            coalesce_timers: DEFAULT_COALESCE_TIMERS,
            interrupt_thresholds: DEFAULT_INTR_THRESHOLDS,
            congestion_policy: CongestionPolicy::Backpressure,
            pktshift: DEFAULT_PKTSHIFT,
            rx_copy_threshold: DEFAULT_RX_COPY_THRESHOLD,
            tx_imm_len: DEFAULT_TX_IMM_LEN,
            short_tcp_csum_threshold: Some(DEFAULT_SHORT_TCP_CSUM_THRESHOLD),
            db_batch: DEFAULT_DB_BATCH,
            fl_starve_threshold: DEFAULT_FL_STARVE_THRESHOLD,
        }
    }
}

impl SgeConfig {
    /// Checks that the configuration is one the hardware can actually run with.
    pub fn validate(&self) -> Result<(), &'static str> {
        if !self.pad_boundary.is_power_of_two() || self.pad_boundary < 16 || self.pad_boundary > 4096 {
            return Err("pad_boundary must be a power of two between 16 and 4096");
        }
        if !self.pack_boundary.is_power_of_two() || self.pack_boundary < self.pad_boundary {
            return Err("pack_boundary must be a power of two no smaller than pad_boundary");
        }
        if self.buffer_sizes.is_empty() || self.buffer_sizes.len() > 16 {
            return Err("the hardware buffer size table must have between 1 and 16 entries");
        }
        if self.zone_sizes.is_empty() || self.zone_sizes.windows(2).any(|w| w[0] >= w[1]) {
            return Err("zone_sizes must be non-empty and strictly increasing");
        }
        if !self.zone_sizes.contains(&self.safest_rx_cluster) {
            return Err("safest_rx_cluster must be one of the zone sizes");
        }
        if self.pktshift > 7 {
            return Err("pktshift must fit in three bits");
        }
        if self.interrupt_thresholds.iter().any(|&t| t == 0) {
            return Err("interrupt thresholds must be non-zero");
        }
        // the immediate length field is 8 bits and covers the CPL too
        if self.tx_imm_len + 16 > 0xFF {
            return Err("tx_imm_len does not fit in a work request's immediate length");
        }
        if self.db_batch == 0 {
            return Err("db_batch must be non-zero");
        }
        Ok(())
    }

    /// The index of the holdoff timer closest to (and not longer than) `us` microseconds.
    pub fn closest_timer_idx(&self, us: u16) -> u8 {
        let mut idx = 0;
        for (i, &t) in self.coalesce_timers.iter().enumerate() {
            if t <= us {
                idx = i;
            }
        }
        idx as u8
    }

    /// The index of the packet-count threshold closest to `cnt`.
    pub fn closest_pktc_idx(&self, cnt: u8) -> u8 {
        let mut best = 0;
        let mut best_diff = u8::MAX;
        for (i, &t) in self.interrupt_thresholds.iter().enumerate() {
            let diff = if t > cnt { t - cnt } else { cnt - t };
            if diff < best_diff {
                best = i;
                best_diff = diff;
            }
        }
        best as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        assert_eq!(SgeConfig::default().validate(), Ok(()));
    }

    #[test]
    fn rejects_bad_boundaries() {
        let cfg = SgeConfig { pad_boundary: 24, ..SgeConfig::default() };
        assert!(cfg.validate().is_err());
        let cfg = SgeConfig { pack_boundary: 16, ..SgeConfig::default() };
        assert!(cfg.validate().is_err());
        let cfg = SgeConfig { safest_rx_cluster: 8192, ..SgeConfig::default() };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn closest_indices() {
        let cfg = SgeConfig::default();
        assert_eq!(cfg.closest_timer_idx(0), 0);
        assert_eq!(cfg.closest_timer_idx(60), 3);
        assert_eq!(cfg.closest_timer_idx(1000), 5);
        assert_eq!(cfg.closest_pktc_idx(10), 1);
        assert_eq!(cfg.closest_pktc_idx(30), 3);
    }
}
