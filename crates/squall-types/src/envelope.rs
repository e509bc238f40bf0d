//! Point-to-point wire envelopes.
//!
//! Everything that travels over the transport's reliable point-to-point
//! channel (block-plane frames, GMS control traffic, state-transfer blobs,
//! peer-to-peer requests and replies) is wrapped in an [`Envelope`] so the
//! receiving node can route it to the right subsystem.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::NodeId;

/// Discriminates point-to-point traffic classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WireKind {
    /// A block of a block-plane (bulk) multicast message.
    RdmcBlock,
    /// Group-management control traffic (join requests, join responses).
    Gms,
    /// Serialized replicated-object state for a joining member.
    StateTransfer,
    /// A peer-to-peer request from a non-member of the target subgroup.
    P2pRequest,
    /// The reply to a peer-to-peer request.
    P2pReply,
    /// The reply to a multicast RPC, routed back to the caller.
    RpcReply,
}

/// A routed point-to-point message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub from: NodeId,
    pub kind: WireKind,
    pub payload: Bytes,
}

impl Envelope {
    pub fn new(from: NodeId, kind: WireKind, payload: Bytes) -> Self {
        Self {
            from,
            kind,
            payload,
        }
    }
}
