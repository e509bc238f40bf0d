//! Row schema sizing.
//!
//! All vector fields in an [`crate::SstRow`] have lengths frozen at view
//! install time. The layout is computed once per view from the subgroup
//! settings and shared by every member, so peers agree on the schema.

use serde::{Deserialize, Serialize};

/// The agreed dimensions of every row in one view's SST.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SstLayout {
    /// Number of members in the view (= number of rows).
    pub num_members: usize,
    /// Total number of subgroups in the group.
    pub num_subgroups: usize,
    /// Total length of the flattened per-(subgroup, sender) counter arrays
    /// (`num_received`, `num_received_sst`, `global_min`). Each subgroup owns
    /// a contiguous range starting at its `num_received_offset`.
    pub num_received_len: usize,
    /// Total length of the SMC slot byte region across all subgroups this
    /// node sends in.
    pub slots_len: usize,
    /// Total length of the SMC slot-index array.
    pub index_len: usize,
    /// Capacity of the pending change-proposal window.
    pub changes_len: usize,
}

impl SstLayout {
    /// Headroom beyond the member count in the proposal window, allowing
    /// join bursts at startup when the group is still small.
    pub const EXTRA_CHANGES: usize = 100;

    pub fn new(
        num_members: usize,
        num_subgroups: usize,
        num_received_len: usize,
        slots_len: usize,
        index_len: usize,
    ) -> Self {
        Self {
            num_members,
            num_subgroups,
            num_received_len,
            slots_len,
            index_len,
            changes_len: num_members + Self::EXTRA_CHANGES,
        }
    }

    /// A layout for a group with no subgroups (GMS traffic only). Used by
    /// tests and by the bootstrap path before the first membership layout.
    pub fn gms_only(num_members: usize) -> Self {
        Self::new(num_members, 0, 0, 0, 0)
    }
}
