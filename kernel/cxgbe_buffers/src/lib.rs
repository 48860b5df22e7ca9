//! Defines the buffers that move packet data between the packet stack and the SGE.
//!
//! * [`ClusterZone`]s hand out receive [`Cluster`]s of one size class.
//!   A cluster returns itself to its zone when it is dropped.
//! * A [`ReceivedFrame`] is an ordered list of [`RxSegment`]s reassembled from one
//!   or more free-list buffers. A segment either owns its cluster, shares a packed
//!   cluster with other frames through an `Arc`, or is a small heap copy.
//! * A [`TxPacket`] is a chain of DMA-mapped [`TransmitBuffer`]s plus the offloads
//!   the stack requested for it.

#![cfg_attr(not(test), no_std)]

extern crate alloc;
#[macro_use] extern crate log;
#[macro_use] extern crate bitflags;
extern crate spin;

mod rx;
mod tx;
mod zone;

pub use rx::{ReceivedFrame, RxCsumFlags, RxMeta, RxSegment};
pub use tx::{TransmitBuffer, TxCsumFlags, TxOffload, TxPacket};
pub use zone::{Cluster, ClusterZone, CLUSTER_ZONE_SIZES};
