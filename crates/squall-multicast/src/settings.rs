//! Per-subgroup engine configuration.

use squall_config::MulticastParams;
use squall_types::{DeliveryMode, NodeId, ShardNum, SubgroupId};

/// A collection of settings for a single subgroup this node is a member of,
/// specifically the one shard within that subgroup containing this node.
/// Combines the shard's membership and delivery mode with the SST offsets
/// that locate the subgroup's counter ranges inside each row.
#[derive(Debug, Clone)]
pub struct SubgroupSettings {
    pub subgroup_id: SubgroupId,
    /// This node's shard number within the subgroup.
    pub shard_num: ShardNum,
    /// The members of this node's shard, in shard order.
    pub members: Vec<NodeId>,
    /// SST row rank of each shard member, parallel to `members`.
    pub member_ranks: Vec<usize>,
    /// Sender flag per shard member.
    pub senders: Vec<bool>,
    /// This node's rank within the shard.
    pub my_shard_rank: usize,
    /// This node's rank among the shard's senders, `None` if not a sender.
    pub my_sender_rank: Option<usize>,
    pub mode: DeliveryMode,
    pub params: MulticastParams,
    /// Start of this subgroup's range in the flattened per-sender counter
    /// arrays (`num_received`, `num_received_sst`, `global_min`).
    pub num_received_offset: usize,
    /// Start of this subgroup's byte range in the SMC slot ring.
    pub slot_offset: usize,
    /// Start of this subgroup's range in the SMC slot-index array.
    pub index_offset: usize,
}

impl SubgroupSettings {
    /// Size of the payload-length prefix stored ahead of each slot message.
    pub const SLOT_LEN_PREFIX: usize = 4;

    pub fn num_members(&self) -> usize {
        self.members.len()
    }

    pub fn num_senders(&self) -> usize {
        self.senders.iter().filter(|s| **s).count()
    }

    /// Shard rank of the sender at `sender_rank`.
    ///
    /// # Panics
    ///
    /// Panics if `sender_rank` is out of range; the round-robin formula never
    /// produces one, so an out-of-range rank means corrupted accounting.
    pub fn shard_rank_of_sender(&self, sender_rank: usize) -> usize {
        self.senders
            .iter()
            .enumerate()
            .filter(|(_, s)| **s)
            .map(|(rank, _)| rank)
            .nth(sender_rank)
            .expect("sender rank out of range")
    }

    /// Sender rank of the shard member at `shard_rank`, or `None` if that
    /// member is not a sender.
    pub fn sender_rank_of(&self, shard_rank: usize) -> Option<usize> {
        if !self.senders.get(shard_rank).copied().unwrap_or(false) {
            return None;
        }
        Some(self.senders[..shard_rank].iter().filter(|s| **s).count())
    }

    /// SST row rank of the sender at `sender_rank`.
    pub fn row_rank_of_sender(&self, sender_rank: usize) -> usize {
        self.member_ranks[self.shard_rank_of_sender(sender_rank)]
    }

    /// Index into the flattened per-sender counter arrays for this
    /// subgroup's sender at `sender_rank`.
    pub fn nr_index(&self, sender_rank: usize) -> usize {
        self.num_received_offset + sender_rank
    }

    /// Bytes occupied by one SMC slot: a 4-byte payload-length prefix
    /// followed by the on-wire message (header plus payload).
    pub fn slot_stride(&self) -> usize {
        Self::SLOT_LEN_PREFIX + self.params.sst_max_msg_size() as usize
    }

    /// Byte range of one SMC slot in the sender's row.
    pub fn slot_range(&self, slot: usize) -> std::ops::Range<usize> {
        let stride = self.slot_stride();
        let start = self.slot_offset + slot * stride;
        start..start + stride
    }

    /// Index into the row's `index` array for one SMC slot.
    pub fn slot_index_pos(&self, slot: usize) -> usize {
        self.index_offset + slot
    }

    pub fn window(&self) -> usize {
        self.params.window_size as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(senders: Vec<bool>) -> SubgroupSettings {
        let n = senders.len();
        SubgroupSettings {
            subgroup_id: SubgroupId::new(0),
            shard_num: ShardNum::new(0),
            members: (0..n as u32).map(NodeId::new).collect(),
            member_ranks: (0..n).collect(),
            senders,
            my_shard_rank: 0,
            my_sender_rank: Some(0),
            mode: DeliveryMode::Ordered,
            params: MulticastParams::default(),
            num_received_offset: 0,
            slot_offset: 0,
            index_offset: 0,
        }
    }

    #[test]
    fn sender_rank_mapping_skips_non_senders() {
        let s = settings(vec![false, true, false, true]);
        assert_eq!(s.num_senders(), 2);
        assert_eq!(s.shard_rank_of_sender(0), 1);
        assert_eq!(s.shard_rank_of_sender(1), 3);
        assert_eq!(s.sender_rank_of(1), Some(0));
        assert_eq!(s.sender_rank_of(3), Some(1));
        assert_eq!(s.sender_rank_of(0), None);
    }

    #[test]
    fn slot_ranges_are_disjoint() {
        let s = settings(vec![true, true]);
        let a = s.slot_range(0);
        let b = s.slot_range(1);
        assert_eq!(a.end, b.start);
    }
}
