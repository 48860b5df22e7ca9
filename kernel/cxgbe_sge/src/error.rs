//! Errors returned by the queue engine.

use core::fmt;
use cxgbe_buffers::TxPacket;

/// Possible reasons for failure when creating, looking up, or tearing down queues.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SgeError {
    /// The configuration failed validation
    InvalidConfig(&'static str),
    /// A queue with this context id already exists
    QueueExists,
    /// No queue has this context id
    NoSuchQueue,
    /// The queue size is not usable (too small, too large, or not a multiple of the hardware granularity)
    InvalidQueueSize,
    /// The queue is being serviced and can't change state right now
    QueueBusy,
    /// The queue has already been torn down
    QueueDisabled,
    /// No cluster zone can hold the maximum payload of a free list
    NoRefillSource,
    /// The doorbell kind needs a user doorbell page, but none was given
    MissingUserDoorbell,
    /// A handler is already registered for this CPL opcode
    HandlerExists,
    /// A work request is malformed or too long
    InvalidWorkRequest,
}

impl From<SgeError> for &'static str {
    fn from(error: SgeError) -> Self {
        match error {
            SgeError::InvalidConfig(reason) => reason,
            SgeError::QueueExists => "A queue with this context id already exists",
            SgeError::NoSuchQueue => "No queue has this context id",
            SgeError::InvalidQueueSize => "Invalid queue size",
            SgeError::QueueBusy => "The queue is busy",
            SgeError::QueueDisabled => "The queue has been torn down",
            SgeError::NoRefillSource => "No cluster zone fits the free list's maximum payload",
            SgeError::MissingUserDoorbell => "The doorbell kind requires a user doorbell page",
            SgeError::HandlerExists => "A handler is already registered for this CPL opcode",
            SgeError::InvalidWorkRequest => "Malformed or oversized work request",
        }
    }
}

impl fmt::Display for SgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s: &'static str = (*self).into();
        f.write_str(s)
    }
}

pub type Result<T> = core::result::Result<T, SgeError>;

/// Why a packet was dropped instead of being transmitted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxDropReason {
    /// The packet needs more DMA segments than a work request can describe, even after collapsing
    TooManySegments,
    /// The packet is empty or longer than the hardware's 16-bit length field
    BadLength,
    /// The offloads requested need header information the packet doesn't have
    Malformed,
    /// The queue has been torn down
    QueueDoomed,
}

/// The result of a failed transmit.
pub enum TxError {
    /// The queue is out of descriptors. Nothing was written; the caller gets the
    /// packet back and should retry after the queue resumes.
    WouldBlock(TxPacket),
    /// The packet was discarded.
    Dropped(TxDropReason),
}

impl fmt::Debug for TxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxError::WouldBlock(pkt) => write!(f, "WouldBlock({} bytes)", pkt.len()),
            TxError::Dropped(reason) => write!(f, "Dropped({:?})", reason),
        }
    }
}

impl From<TxError> for &'static str {
    fn from(error: TxError) -> Self {
        match error {
            TxError::WouldBlock(_) => "Egress queue is full",
            TxError::Dropped(TxDropReason::TooManySegments) => "Packet has too many segments",
            TxError::Dropped(TxDropReason::BadLength) => "Packet length is invalid",
            TxError::Dropped(TxDropReason::Malformed) => "Packet headers are malformed",
            TxError::Dropped(TxDropReason::QueueDoomed) => "Egress queue has been torn down",
        }
    }
}
