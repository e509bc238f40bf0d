//! # squall-types: Core types for `Squall`
//!
//! This crate contains shared types used across the `Squall` workspace:
//! - Entity IDs ([`NodeId`], [`ViewId`], [`SubgroupId`], [`ShardNum`], [`MessageId`])
//! - Persistence versions ([`Version`])
//! - Temporal types ([`Timestamp`])
//! - The packed multicast wire header ([`MessageHeader`])
//! - View-change proposals ([`ChangeProposal`], [`JoinerEntry`])
//! - Point-to-point wire envelopes ([`Envelope`], [`WireKind`])

use std::fmt::Display;
use std::net::Ipv4Addr;
use std::ops::{Add, AddAssign, Sub};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

mod envelope;
mod header;

pub use envelope::{Envelope, WireKind};
pub use header::MessageHeader;

// ============================================================================
// Entity IDs - All Copy (cheap values)
// ============================================================================

/// Unique identifier for a node (process) in a group.
///
/// Node IDs are 32-bit values, but in practice never exceed 16 bits; change
/// proposals pack them into a `u16` alongside the proposing leader's ID.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct NodeId(u32);

impl NodeId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the ID as a `u16` for packing into a [`ChangeProposal`].
    ///
    /// # Panics
    ///
    /// Panics if the ID exceeds 16 bits; `max_node_id` in the configuration
    /// bounds assigned IDs well below this.
    pub fn as_u16(self) -> u16 {
        u16::try_from(self.0).expect("node id exceeds 16 bits")
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for NodeId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<u16> for NodeId {
    fn from(value: u16) -> Self {
        Self(u32::from(value))
    }
}

impl From<NodeId> for u32 {
    fn from(id: NodeId) -> Self {
        id.0
    }
}

/// Identifier of an installed view. Strictly increases across installs.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ViewId(i32);

impl ViewId {
    pub const INITIAL: ViewId = ViewId(0);

    pub const fn new(vid: i32) -> Self {
        Self(vid)
    }

    /// The successor view ID.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    pub fn as_i32(self) -> i32 {
        self.0
    }
}

impl Display for ViewId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a subgroup within a group, assigned stably by the
/// membership function at group formation.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct SubgroupId(u32);

impl SubgroupId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the ID as a `usize` for indexing per-subgroup arrays.
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl Display for SubgroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for SubgroupId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

/// Shard number within a subgroup.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ShardNum(u32);

impl ShardNum {
    pub const fn new(n: u32) -> Self {
        Self(n)
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl Display for ShardNum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index of an in-order message, either per sender or in the global
/// round-robin order of a subgroup, depending on context.
///
/// Sequence counters start at `MessageId::NONE` (-1), meaning "nothing yet";
/// the first message has index 0.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct MessageId(i64);

impl MessageId {
    /// Sentinel for "no message received/delivered yet".
    pub const NONE: MessageId = MessageId(-1);

    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    pub fn as_i64(self) -> i64 {
        self.0
    }

    /// Returns the index as a `usize`.
    ///
    /// # Panics
    ///
    /// Panics if the index is negative (the `NONE` sentinel).
    pub fn as_usize(self) -> usize {
        usize::try_from(self.0).expect("message id is the NONE sentinel")
    }

    /// Maps a global round-robin sequence number to (sender rank, per-sender
    /// index) for a shard with `num_senders` senders.
    pub fn to_sender_coords(self, num_senders: usize) -> (usize, MessageId) {
        let k = num_senders as i64;
        (
            (self.0 % k) as usize,
            MessageId(self.0 / k),
        )
    }

    /// Inverse of [`Self::to_sender_coords`]: the global sequence number of
    /// the `index`-th message from the sender at `sender_rank`.
    pub fn from_sender_coords(sender_rank: usize, index: MessageId, num_senders: usize) -> Self {
        MessageId(index.0 * num_senders as i64 + sender_rank as i64)
    }
}

impl Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Add<i64> for MessageId {
    type Output = MessageId;

    fn add(self, rhs: i64) -> MessageId {
        MessageId(self.0 + rhs)
    }
}

impl AddAssign<i64> for MessageId {
    fn add_assign(&mut self, rhs: i64) {
        self.0 += rhs;
    }
}

impl Sub for MessageId {
    type Output = i64;

    fn sub(self, rhs: MessageId) -> i64 {
        self.0 - rhs.0
    }
}

// ============================================================================
// Versions
// ============================================================================

/// Opaque monotone counter assigned to each delivered message by the
/// persistence collaborator, used for durability waits and restart recovery.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Version(i64);

impl Version {
    /// Sentinel for "no version assigned/persisted yet".
    pub const NONE: Version = Version(-1);

    pub const fn new(v: i64) -> Self {
        Self(v)
    }

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    pub fn as_i64(self) -> i64 {
        self.0
    }

    pub fn is_none(self) -> bool {
        self.0 < 0
    }
}

impl Default for Version {
    fn default() -> Self {
        Version::NONE
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Timestamps
// ============================================================================

/// Wall-clock time in nanoseconds since the Unix epoch.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const fn new(ns: u64) -> Self {
        Self(ns)
    }

    /// The current wall-clock time.
    pub fn now() -> Self {
        let ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_nanos() as u64);
        Self(ns)
    }

    pub fn as_nanos(self) -> u64 {
        self.0
    }

    /// Nanoseconds elapsed from `earlier` to `self`, saturating at zero.
    pub fn nanos_since(self, earlier: Timestamp) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ns", self.0)
    }
}

// ============================================================================
// Delivery Mode
// ============================================================================

/// How messages in a shard are delivered to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum DeliveryMode {
    /// Deliver only once globally stable, in the unique round-robin order.
    #[default]
    Ordered,
    /// Deliver on local receipt. Ordering across receivers may differ, but
    /// membership atomicity still holds through the view-change trim.
    Unordered,
}

// ============================================================================
// Change Proposals
// ============================================================================

/// A proposal to add or remove a node from the view.
///
/// Carries the ID of the leader who proposed the change and a flag marking
/// the last proposal of a view (set by a successor leader to bound the failed
/// leader's proposals). Node IDs fit in 16 bits, so leader and subject pack
/// into 32 bits together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ChangeProposal {
    pub leader_id: u16,
    pub change_id: u16,
    pub end_of_view: bool,
}

impl ChangeProposal {
    pub fn new(leader_id: NodeId, change_id: NodeId) -> Self {
        Self {
            leader_id: leader_id.as_u16(),
            change_id: change_id.as_u16(),
            end_of_view: false,
        }
    }

    /// The node this proposal adds or removes.
    pub fn subject(self) -> NodeId {
        NodeId::from(self.change_id)
    }

    pub fn proposer(self) -> NodeId {
        NodeId::from(self.leader_id)
    }
}

// ============================================================================
// Member Addresses
// ============================================================================

/// The listening ports a member exposes, one per service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MemberPorts {
    pub gms: u16,
    pub state_transfer: u16,
    pub sst: u16,
    pub rdmc: u16,
    pub external: u16,
}

/// A member's transport address: IPv4 plus its service ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberAddr {
    pub ip: Ipv4Addr,
    pub ports: MemberPorts,
}

impl Default for MemberAddr {
    fn default() -> Self {
        Self {
            ip: Ipv4Addr::UNSPECIFIED,
            ports: MemberPorts::default(),
        }
    }
}

impl Display for MemberAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.ip, self.ports.gms)
    }
}

/// A pending joiner recorded in the SST alongside its change proposal.
///
/// The row schema is fixed-size, so the address is stored as a packed IPv4
/// word plus fixed-width port fields rather than a string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct JoinerEntry {
    pub id: u16,
    pub ip: u32,
    pub ports: MemberPorts,
}

impl JoinerEntry {
    pub fn new(id: NodeId, addr: MemberAddr) -> Self {
        Self {
            id: id.as_u16(),
            ip: u32::from(addr.ip),
            ports: addr.ports,
        }
    }

    pub fn node_id(self) -> NodeId {
        NodeId::from(self.id)
    }

    pub fn addr(self) -> MemberAddr {
        MemberAddr {
            ip: Ipv4Addr::from(self.ip),
            ports: self.ports,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_packs_into_u16() {
        let id = NodeId::new(513);
        assert_eq!(id.as_u16(), 513);
        assert_eq!(NodeId::from(id.as_u16()), id);
    }

    #[test]
    #[should_panic(expected = "node id exceeds 16 bits")]
    fn oversized_node_id_panics_on_packing() {
        NodeId::new(1 << 17).as_u16();
    }

    #[test]
    fn view_id_successor() {
        assert_eq!(ViewId::INITIAL.next(), ViewId::new(1));
        assert!(ViewId::new(2) > ViewId::new(1));
    }

    #[test]
    fn round_robin_coords() {
        // 4 senders: global 0,1,2,3 are index 0 of senders 0..3; global 4 is
        // index 1 of sender 0.
        for seq in 0..16i64 {
            let (sender, index) = MessageId::new(seq).to_sender_coords(4);
            assert_eq!(sender, (seq % 4) as usize);
            assert_eq!(index.as_i64(), seq / 4);
            assert_eq!(
                MessageId::from_sender_coords(sender, index, 4),
                MessageId::new(seq)
            );
        }
    }

    #[test]
    fn message_id_sentinel() {
        assert!(MessageId::NONE < MessageId::new(0));
        assert_eq!(MessageId::NONE.next(), MessageId::new(0));
    }

    #[test]
    fn version_sentinel_ordering() {
        assert!(Version::NONE.is_none());
        assert!(!Version::new(0).is_none());
        assert!(Version::NONE < Version::new(0));
    }

    #[test]
    fn change_proposal_round_trip() {
        let p = ChangeProposal::new(NodeId::new(3), NodeId::new(17));
        assert_eq!(p.proposer(), NodeId::new(3));
        assert_eq!(p.subject(), NodeId::new(17));
        assert!(!p.end_of_view);
    }

    #[test]
    fn joiner_entry_address_round_trip() {
        let addr = MemberAddr {
            ip: Ipv4Addr::new(10, 1, 2, 3),
            ports: MemberPorts {
                gms: 23580,
                state_transfer: 28366,
                sst: 37683,
                rdmc: 31675,
                external: 32645,
            },
        };
        let entry = JoinerEntry::new(NodeId::new(7), addr);
        assert_eq!(entry.node_id(), NodeId::new(7));
        assert_eq!(entry.addr(), addr);
    }

    #[test]
    fn timestamp_elapsed_saturates() {
        let a = Timestamp::new(100);
        let b = Timestamp::new(250);
        assert_eq!(b.nanos_since(a), 150);
        assert_eq!(a.nanos_since(b), 0);
    }
}
