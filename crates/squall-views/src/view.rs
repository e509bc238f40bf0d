//! Views and subviews.

use serde::{Deserialize, Serialize};
use squall_types::{DeliveryMode, MemberAddr, NodeId, ViewId};

/// The replica set of one shard of a subgroup, as seen by every member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubView {
    /// Shard members, in shard order.
    pub members: Vec<NodeId>,
    /// Sender flag per member; a member with a false flag receives but never
    /// produces messages.
    pub senders: Vec<bool>,
    pub mode: DeliveryMode,
    /// Name of the multicast parameter profile this shard uses.
    pub profile: String,
}

impl SubView {
    pub fn num_senders(&self) -> usize {
        self.senders.iter().filter(|s| **s).count()
    }

    pub fn rank_of(&self, node: NodeId) -> Option<usize> {
        self.members.iter().position(|m| *m == node)
    }

    /// Rank of `node` among the shard's senders, `None` if absent or not a
    /// sender.
    pub fn sender_rank_of(&self, node: NodeId) -> Option<usize> {
        let rank = self.rank_of(node)?;
        if !self.senders[rank] {
            return None;
        }
        Some(self.senders[..rank].iter().filter(|s| **s).count())
    }
}

/// An installed view: immutable membership plus the subgroup/shard layout
/// the membership function assigned for it.
///
/// `my_rank` is local to each node and recomputed after deserialization via
/// [`View::localize`]; everything else is identical on every member.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct View {
    pub vid: ViewId,
    /// Members in rank order.
    pub members: Vec<NodeId>,
    /// Transport addresses, parallel to `members`.
    pub member_addrs: Vec<MemberAddr>,
    /// Members that joined relative to the prior view.
    pub joined: Vec<NodeId>,
    /// Members that departed relative to the prior view.
    pub departed: Vec<NodeId>,
    /// Members known to have already failed when this view was installed.
    pub failed: Vec<bool>,
    /// Shard layout per subgroup, assigned by the membership function.
    pub subgroup_layout: Vec<Vec<SubView>>,
    /// First rank the membership function did not assign to any shard.
    pub next_unassigned_rank: usize,
    /// This node's rank, set by [`View::localize`].
    #[serde(skip)]
    pub my_rank: Option<usize>,
}

impl View {
    /// A first view: every listed member present, nothing joined or
    /// departed, no layout yet.
    pub fn first(members: Vec<NodeId>, member_addrs: Vec<MemberAddr>) -> Self {
        assert_eq!(members.len(), member_addrs.len());
        let n = members.len();
        Self {
            vid: ViewId::INITIAL,
            members,
            member_addrs,
            joined: Vec::new(),
            departed: Vec::new(),
            failed: vec![false; n],
            subgroup_layout: Vec::new(),
            next_unassigned_rank: 0,
            my_rank: None,
        }
    }

    /// The successor view after applying departures and joins.
    pub fn successor(
        &self,
        departed: Vec<NodeId>,
        joined: Vec<(NodeId, MemberAddr)>,
    ) -> Self {
        let mut members = Vec::new();
        let mut member_addrs = Vec::new();
        for (rank, member) in self.members.iter().enumerate() {
            if !departed.contains(member) {
                members.push(*member);
                member_addrs.push(self.member_addrs[rank]);
            }
        }
        let joined_ids: Vec<NodeId> = joined.iter().map(|(id, _)| *id).collect();
        for (id, addr) in joined {
            members.push(id);
            member_addrs.push(addr);
        }
        let n = members.len();
        Self {
            vid: self.vid.next(),
            members,
            member_addrs,
            joined: joined_ids,
            departed,
            failed: vec![false; n],
            subgroup_layout: Vec::new(),
            next_unassigned_rank: 0,
            my_rank: None,
        }
    }

    /// Sets `my_rank` for the receiving node. Returns false if the node is
    /// not a member.
    pub fn localize(&mut self, me: NodeId) -> bool {
        self.my_rank = self.rank_of(me);
        self.my_rank.is_some()
    }

    pub fn num_members(&self) -> usize {
        self.members.len()
    }

    pub fn rank_of(&self, node: NodeId) -> Option<usize> {
        self.members.iter().position(|m| *m == node)
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.rank_of(node).is_some()
    }

    /// The lowest-ranked member not marked failed.
    pub fn leader_rank(&self) -> Option<usize> {
        self.failed.iter().position(|f| !f)
    }

    /// Builds a [`SubView`] for a shard. An empty `senders` vector means
    /// every member sends; the default profile name selects the
    /// `[multicast]` table.
    pub fn make_subview(
        &self,
        members: Vec<NodeId>,
        mode: DeliveryMode,
        senders: Vec<bool>,
        profile: impl Into<String>,
    ) -> SubView {
        let senders = if senders.is_empty() {
            vec![true; members.len()]
        } else {
            assert_eq!(senders.len(), members.len());
            senders
        };
        debug_assert!(
            members.iter().all(|m| self.contains(*m)),
            "subview members must be view members"
        );
        SubView {
            members,
            senders,
            mode,
            profile: profile.into(),
        }
    }

    /// A strict majority of this view's membership.
    pub fn majority(&self) -> usize {
        self.num_members() / 2 + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use squall_types::MemberPorts;
    use std::net::Ipv4Addr;

    fn addr(last: u8) -> MemberAddr {
        MemberAddr {
            ip: Ipv4Addr::new(127, 0, 0, last),
            ports: MemberPorts::default(),
        }
    }

    fn three_node_view() -> View {
        View::first(
            vec![NodeId::new(1), NodeId::new(2), NodeId::new(3)],
            vec![addr(1), addr(2), addr(3)],
        )
    }

    #[test]
    fn successor_removes_then_appends() {
        let v0 = three_node_view();
        let v1 = v0.successor(
            vec![NodeId::new(2)],
            vec![(NodeId::new(4), addr(4))],
        );
        assert_eq!(v1.vid, ViewId::new(1));
        assert_eq!(
            v1.members,
            vec![NodeId::new(1), NodeId::new(3), NodeId::new(4)]
        );
        assert_eq!(v1.departed, vec![NodeId::new(2)]);
        assert_eq!(v1.joined, vec![NodeId::new(4)]);
        // Surviving members keep their relative order; joiners rank last.
        assert_eq!(v1.rank_of(NodeId::new(4)), Some(2));
    }

    #[test]
    fn localize_resolves_rank() {
        let mut v = three_node_view();
        assert!(v.localize(NodeId::new(2)));
        assert_eq!(v.my_rank, Some(1));
        assert!(!v.localize(NodeId::new(9)));
    }

    #[test]
    fn leader_skips_failed_ranks() {
        let mut v = three_node_view();
        assert_eq!(v.leader_rank(), Some(0));
        v.failed[0] = true;
        assert_eq!(v.leader_rank(), Some(1));
    }

    #[test]
    fn make_subview_defaults_to_all_senders() {
        let v = three_node_view();
        let sv = v.make_subview(v.members.clone(), DeliveryMode::Ordered, Vec::new(), "");
        assert_eq!(sv.num_senders(), 3);
        assert_eq!(sv.sender_rank_of(NodeId::new(3)), Some(2));
    }

    #[test]
    fn sender_ranks_skip_non_senders() {
        let v = three_node_view();
        let sv = v.make_subview(
            v.members.clone(),
            DeliveryMode::Ordered,
            vec![false, true, true],
            "",
        );
        assert_eq!(sv.num_senders(), 2);
        assert_eq!(sv.sender_rank_of(NodeId::new(1)), None);
        assert_eq!(sv.sender_rank_of(NodeId::new(2)), Some(0));
        assert_eq!(sv.sender_rank_of(NodeId::new(3)), Some(1));
    }
}
