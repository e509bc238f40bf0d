//! The transport abstraction under the SST.
//!
//! The table assumes an RDMA-like transport providing (a) one-sided remote
//! write of a row image to every peer and (b) reliable point-to-point
//! messaging, with no ordering between writes to different rows. Successive
//! pushes of the same row may be coalesced: only the latest image matters,
//! since every field is monotone.

use bytes::Bytes;

use crate::TransportError;

pub trait Transport: Send + Sync {
    /// Broadcasts this node's serialized row image to every peer. The write
    /// is one-sided: peers observe the new image without acknowledging it,
    /// and a later push may overwrite an unread one.
    fn push_row(&self, image: Bytes) -> Result<(), TransportError>;

    /// Takes the next unread row image pushed by some peer, if any.
    fn try_recv_row(&self) -> Option<Bytes>;

    /// Reliable point-to-point send of an envelope to one peer.
    fn send_to(&self, to: squall_types::NodeId, bytes: Bytes) -> Result<(), TransportError>;

    /// Takes the next point-to-point envelope addressed to this node.
    fn try_recv(&self) -> Option<Bytes>;

    /// Synchronizes all members. Used only at view-install boundaries.
    fn barrier(&self) -> Result<(), TransportError>;
}
