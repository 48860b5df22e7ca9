//! The interface between the queue engine and the packet stack above it.

use cxgbe_buffers::ReceivedFrame;

/// The packet stack that consumes received frames and produces packets to send.
///
/// All methods are called from the ingress service loop or from [`crate::Sge::tick()`],
/// possibly with a queue lock held, so they must not call back into the same queue.
pub trait PacketStack: Send + Sync {
    /// Hands a received frame to the stack.
    fn deliver(&self, frame: ReceivedFrame);

    /// Offers a TCP frame to large receive offload on behalf of ingress queue `iq`.
    /// Returns the frame if it wasn't accepted, in which case it is delivered normally.
    fn lro_enqueue(&self, _iq: u16, frame: ReceivedFrame) -> Option<ReceivedFrame> {
        Some(frame)
    }

    /// Pushes everything large receive offload is holding for ingress queue `iq` up the stack.
    fn lro_flush(&self, _iq: u16) {}

    /// Egress queue `eq` has room again after having refused a packet.
    fn tx_resumed(&self, _eq: u16) {}
}
