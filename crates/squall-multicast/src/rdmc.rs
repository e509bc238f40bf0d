//! The block (bulk) plane.
//!
//! A message larger than the slot-plane cutoff is split into fixed-size
//! blocks and disseminated along a forwarding tree rooted at the sender.
//! Four tree shapes are supported; all of them pipeline at block
//! granularity, so a relay forwards each block as it arrives rather than
//! waiting for the whole message.
//!
//! Tree positions are computed in *rotated rank* space: member `m` of an
//! `n`-member shard with root `r` has rotated rank `(m - r) mod n`, which
//! puts the sender at position 0 of every shape.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use squall_config::SendAlgorithm;
use squall_types::{MessageId, SubgroupId};

/// One block of a block-plane message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockFrame {
    pub subgroup: SubgroupId,
    /// Shard rank of the original sender (the tree root).
    pub sender_shard_rank: u32,
    /// The message's per-sender index.
    pub index: MessageId,
    pub block_num: u32,
    pub num_blocks: u32,
    /// Total on-wire size of the message (header plus payload).
    pub total_size: u64,
    pub bytes: Bytes,
}

impl BlockFrame {
    /// Splits a full on-wire message into frames of at most `block_size`
    /// bytes.
    pub fn split(
        subgroup: SubgroupId,
        sender_shard_rank: usize,
        index: MessageId,
        message: &[u8],
        block_size: usize,
    ) -> Vec<BlockFrame> {
        assert!(block_size > 0, "block_size must be positive");
        let num_blocks = message.len().div_ceil(block_size).max(1) as u32;
        (0..num_blocks)
            .map(|block_num| {
                let start = block_num as usize * block_size;
                let end = (start + block_size).min(message.len());
                BlockFrame {
                    subgroup,
                    sender_shard_rank: sender_shard_rank as u32,
                    index,
                    block_num,
                    num_blocks,
                    total_size: message.len() as u64,
                    bytes: Bytes::copy_from_slice(&message[start..end]),
                }
            })
            .collect()
    }
}

/// Shard ranks this node forwards received blocks to, for a transfer rooted
/// at `root_shard_rank`.
///
/// The root's children start the dissemination; interior nodes relay. The
/// union of all paths covers every shard member exactly once.
pub fn relay_children(
    algorithm: SendAlgorithm,
    shard_size: usize,
    root_shard_rank: usize,
    my_shard_rank: usize,
) -> Vec<usize> {
    debug_assert!(root_shard_rank < shard_size && my_shard_rank < shard_size);
    let n = shard_size;
    if n <= 1 {
        return Vec::new();
    }
    let rotated = (my_shard_rank + n - root_shard_rank) % n;
    let unrotate = |r: usize| (r + root_shard_rank) % n;

    let children: Vec<usize> = match algorithm {
        SendAlgorithm::Sequential => {
            if rotated == 0 {
                (1..n).collect()
            } else {
                Vec::new()
            }
        }
        SendAlgorithm::Chain => {
            if rotated + 1 < n {
                vec![rotated + 1]
            } else {
                Vec::new()
            }
        }
        SendAlgorithm::Tree => [2 * rotated + 1, 2 * rotated + 2]
            .into_iter()
            .filter(|c| *c < n)
            .collect(),
        SendAlgorithm::Binomial => {
            // Child m + 2^r exists for every 2^r > m while it stays in range.
            let mut out = Vec::new();
            let mut step = 1usize;
            while step < n {
                if step > rotated && rotated + step < n {
                    out.push(rotated + step);
                }
                step <<= 1;
            }
            out
        }
    };
    children.into_iter().map(unrotate).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashSet, VecDeque};

    /// Every algorithm must reach every member exactly once from any root.
    fn assert_full_coverage(algorithm: SendAlgorithm, n: usize, root: usize) {
        let mut reached = HashSet::from([root]);
        let mut frontier = VecDeque::from([root]);
        while let Some(node) = frontier.pop_front() {
            for child in relay_children(algorithm, n, root, node) {
                assert!(
                    reached.insert(child),
                    "{algorithm} n={n} root={root}: member {child} reached twice"
                );
                frontier.push_back(child);
            }
        }
        assert_eq!(reached.len(), n, "{algorithm} n={n} root={root}: not all reached");
    }

    #[test]
    fn all_algorithms_cover_all_members() {
        for algorithm in [
            SendAlgorithm::Binomial,
            SendAlgorithm::Chain,
            SendAlgorithm::Sequential,
            SendAlgorithm::Tree,
        ] {
            for n in 1..=9 {
                for root in 0..n {
                    assert_full_coverage(algorithm, n, root);
                }
            }
        }
    }

    #[test]
    fn sequential_root_sends_to_everyone() {
        assert_eq!(
            relay_children(SendAlgorithm::Sequential, 4, 0, 0),
            vec![1, 2, 3]
        );
        assert!(relay_children(SendAlgorithm::Sequential, 4, 0, 2).is_empty());
    }

    #[test]
    fn chain_relays_in_shard_order_from_root() {
        // Root 2 in a 4-shard: 2 -> 3 -> 0 -> 1.
        assert_eq!(relay_children(SendAlgorithm::Chain, 4, 2, 2), vec![3]);
        assert_eq!(relay_children(SendAlgorithm::Chain, 4, 2, 3), vec![0]);
        assert_eq!(relay_children(SendAlgorithm::Chain, 4, 2, 0), vec![1]);
        assert!(relay_children(SendAlgorithm::Chain, 4, 2, 1).is_empty());
    }

    #[test]
    fn split_reassembles_to_original_size() {
        let message = vec![7u8; 1000];
        let frames = BlockFrame::split(SubgroupId::new(0), 0, MessageId::new(0), &message, 256);
        assert_eq!(frames.len(), 4);
        assert_eq!(frames.iter().map(|f| f.bytes.len()).sum::<usize>(), 1000);
        assert!(frames.iter().all(|f| f.total_size == 1000));
    }

    #[test]
    fn empty_message_still_produces_one_frame() {
        let frames = BlockFrame::split(SubgroupId::new(0), 1, MessageId::new(2), &[], 256);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].num_blocks, 1);
        assert!(frames[0].bytes.is_empty());
    }
}
