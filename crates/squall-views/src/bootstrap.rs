//! Joiner bootstrap wire messages and the state-transfer interface.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use squall_types::{ChangeProposal, JoinerEntry, MemberAddr, NodeId, SubgroupId, Version};

use crate::View;

/// Serialized replicated-object state for one subgroup, handed to a joiner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateBlob {
    pub subgroup: SubgroupId,
    /// The version the state reflects; the joiner's engine resumes version
    /// assignment after it.
    pub version: Version,
    pub bytes: Bytes,
}

/// Group-management control traffic carried in `WireKind::Gms` envelopes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GmsMessage {
    /// Joiner → contact leader: request membership.
    JoinRequest { node: NodeId, addr: MemberAddr },

    /// Leader → joiner at install time: the view being installed, the GMS
    /// counter baseline the joiner seeds its row with, proposals still
    /// pending past the install, state the leader could capture itself, and
    /// how many more blobs other shard leaders will send separately.
    JoinResponse {
        view: View,
        num_changes: u32,
        num_committed: u32,
        num_installed: u32,
        pending: Vec<(ChangeProposal, JoinerEntry)>,
        blobs: Vec<StateBlob>,
        expected_extra_blobs: u32,
    },

    /// Leader → joiner: the group cannot accept the join.
    JoinRejected { reason: String },
}

/// Capture and restore of replicated-object state across a join.
///
/// The view manager calls `capture` on shard leaders when a view containing
/// a joiner is installed, ships the blob over the transport, and calls
/// `restore` on the joiner before its engine starts.
pub trait StateTransfer: Send + Sync {
    fn capture(&self, subgroup: SubgroupId) -> (Version, Bytes);

    fn restore(&self, subgroup: SubgroupId, version: Version, bytes: &[u8]);
}
