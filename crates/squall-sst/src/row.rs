//! The SST row schema.

use serde::{Deserialize, Serialize};
use squall_types::{ChangeProposal, JoinerEntry, NodeId, Timestamp, ViewId};

use crate::SstLayout;

/// One member's row of the shared state table.
///
/// Every field is monotone for the lifetime of a view: counters only
/// increase, flags only transition false→true. Predicates rely on this to
/// latch without re-checking for regressions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SstRow {
    // ========================================================================
    // Multicast: message tracking
    // ========================================================================
    /// Highest global round-robin sequence number received in-order by this
    /// node, per subgroup. -1 until the first full round arrives.
    pub seq_num: Vec<i64>,
    /// Highest global sequence number delivered at this node, per subgroup.
    /// Never exceeds `seq_num` in ordered mode.
    pub delivered_num: Vec<i64>,
    /// Highest per-sender index received in-order, flattened per
    /// (subgroup, sender). -1 until the sender's first message.
    pub num_received: Vec<i64>,

    // ========================================================================
    // Persistence hooks
    // ========================================================================
    /// Highest version persisted locally, per subgroup.
    pub persisted_num: Vec<i64>,
    /// Highest version with a local signature in its log, per subgroup.
    pub signed_num: Vec<i64>,
    /// Highest version whose peer signatures this node has verified, per
    /// subgroup.
    pub verified_num: Vec<i64>,

    // ========================================================================
    // SMC slot plane
    // ========================================================================
    /// Raw slot ring holding this node's outgoing small messages. Peers read
    /// these bytes directly out of the pushed row.
    pub slots: Vec<u8>,
    /// Published message index per slot; a receiver sees a slot as fresh when
    /// its index exceeds what it has already consumed.
    pub index: Vec<i32>,
    /// Count of slot-plane messages consumed in-order from each sender,
    /// flattened like `num_received`.
    pub num_received_sst: Vec<i64>,

    // ========================================================================
    // Group management
    // ========================================================================
    /// View ID this SST belongs to. Constant for the table's lifetime.
    pub vid: i32,
    /// Suspicion bit per member rank.
    pub suspected: Vec<bool>,
    /// Window of proposed-but-not-installed changes. Pending proposals occupy
    /// slots `[0, num_changes - num_installed)`.
    pub changes: Vec<ChangeProposal>,
    /// Joiner identity/address for change slots that are joins; the default
    /// entry for departures.
    pub joiners: Vec<JoinerEntry>,
    /// Cumulative count of proposed view changes.
    pub num_changes: u32,
    /// Cumulative count of proposals that reached the commit point.
    pub num_committed: u32,
    /// Cumulative count of proposals this member has seen and copied.
    pub num_acked: u32,
    /// Cumulative count of proposals installed into views.
    pub num_installed: u32,
    /// Set when this member has halted its data planes for the view change.
    pub wedged: bool,
    /// Per-sender delivery cap for the current view change, flattened like
    /// `num_received`. Valid once the shard leader sets `global_min_ready`.
    pub global_min: Vec<i64>,
    /// Whether the shard leader has published `global_min`, per subgroup.
    pub global_min_ready: Vec<bool>,
    /// Graceful-exit flag; peers turn it into a departure proposal.
    pub rip: bool,
    /// Liveness counter bumped by the timeout thread; peers whose counter
    /// stalls past the heartbeat interval become suspected.
    pub heartbeat: u64,

    // ========================================================================
    // Observability and application-visible fields
    // ========================================================================
    /// Timestamp (ns) of the oldest undelivered message tracked locally, per
    /// subgroup. Drives null-message timing and operator dashboards.
    pub local_stability_frontier: Vec<u64>,
    /// Application load figure, disseminated on a rate-limited push.
    pub load_info: u64,
    /// Application cache-contents bitmap, disseminated on a rate-limited push.
    pub cache_models_info: u64,
}

impl SstRow {
    /// A fresh row with every counter at its sentinel and all flags clear.
    pub fn new(layout: &SstLayout, now: Timestamp) -> Self {
        Self {
            seq_num: vec![-1; layout.num_subgroups],
            delivered_num: vec![-1; layout.num_subgroups],
            num_received: vec![-1; layout.num_received_len],
            persisted_num: vec![-1; layout.num_subgroups],
            signed_num: vec![-1; layout.num_subgroups],
            verified_num: vec![-1; layout.num_subgroups],
            slots: vec![0; layout.slots_len],
            index: vec![-1; layout.index_len],
            num_received_sst: vec![-1; layout.num_received_len],
            vid: 0,
            suspected: vec![false; layout.num_members],
            changes: vec![ChangeProposal::default(); layout.changes_len],
            joiners: vec![JoinerEntry::default(); layout.changes_len],
            num_changes: 0,
            num_committed: 0,
            num_acked: 0,
            num_installed: 0,
            wedged: false,
            global_min: vec![-1; layout.num_received_len],
            global_min_ready: vec![false; layout.num_subgroups],
            rip: false,
            heartbeat: 0,
            local_stability_frontier: vec![now.as_nanos(); layout.num_subgroups],
            load_info: 0,
            cache_models_info: 0,
        }
    }

    /// Seeds a successor view's local row from the previous view's row.
    ///
    /// Copies the proposal counters, shifts the still-pending tail of the
    /// change window to the front, and credits `num_changes_installed` to
    /// `num_installed`. Every other field starts fresh for the new view.
    pub fn from_previous(
        layout: &SstLayout,
        old: &SstRow,
        num_changes_installed: u32,
        now: Timestamp,
    ) -> Self {
        let mut row = Self::new(layout, now);
        row.num_changes = old.num_changes;
        row.num_committed = old.num_committed;
        row.num_acked = old.num_acked;
        row.num_installed = old.num_installed + num_changes_installed;

        // Pending window in the old row spans [0, num_changes - num_installed);
        // the first `num_changes_installed` entries were just consumed.
        let old_pending = (old.num_changes - old.num_installed) as usize;
        let consumed = num_changes_installed as usize;
        debug_assert!(consumed <= old_pending, "installed more changes than pending");
        let surviving = old_pending - consumed;
        for i in 0..surviving.min(row.changes.len()) {
            row.changes[i] = old.changes[consumed + i];
            row.joiners[i] = old.joiners[consumed + i];
        }
        row
    }

    /// Copies the proposal window from another member's row (the leader's),
    /// in preparation for acking its proposals.
    pub fn copy_change_proposals(&mut self, leader: &SstRow) {
        let pending = (leader.num_changes - leader.num_installed) as usize;
        for i in 0..pending.min(self.changes.len()) {
            self.changes[i] = leader.changes[i];
            self.joiners[i] = leader.joiners[i];
        }
        self.num_changes = leader.num_changes;
    }

    /// The pending (not yet installed) proposals, oldest first.
    pub fn pending_changes(&self) -> &[ChangeProposal] {
        let pending = (self.num_changes - self.num_installed) as usize;
        &self.changes[..pending.min(self.changes.len())]
    }

    /// Renders the row's scalar state for diagnostics.
    pub fn summary(&self) -> String {
        format!(
            "vid={} changes={}/{}/{}/{} wedged={} rip={} seq={:?} delivered={:?}",
            self.vid,
            self.num_changes,
            self.num_committed,
            self.num_acked,
            self.num_installed,
            self.wedged,
            self.rip,
            self.seq_num,
            self.delivered_num,
        )
    }
}

/// A serialized row push.
///
/// `include_slots: false` marks a push that deliberately omitted the SMC slot
/// ring and its index array (GMS traffic avoids re-shipping payload bytes);
/// the receiver keeps its current copy of both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowImage {
    /// View the sending SST belongs to; images from other views are stale
    /// and dropped on arrival.
    pub vid: ViewId,
    pub origin: NodeId,
    pub include_slots: bool,
    pub row: SstRow,
}
