//! Membership functions and SST layout planning.

use std::collections::BTreeMap;
use std::sync::Arc;

use squall_config::SquallConfig;
use squall_multicast::SubgroupSettings;
use squall_sst::SstLayout;
use squall_types::{NodeId, ShardNum, SubgroupId};

use crate::{LayoutError, SubView, View};

/// Shard layout per subgroup: `layout[subgroup][shard]`.
pub type SubgroupLayout = Vec<Vec<SubView>>;

/// The membership function: given the prior view (if any) and the successor
/// view's membership, assign every subgroup its shards, or report that the
/// membership cannot support the layout.
pub type MembershipFn =
    Arc<dyn Fn(Option<&View>, &mut View) -> Result<SubgroupLayout, LayoutError> + Send + Sync>;

/// Plans the SST schema for a view and extracts this node's per-subgroup
/// engine settings.
///
/// Every member runs this on the identical view and therefore computes the
/// identical layout; the per-sender counter ranges are sized by the widest
/// shard of each subgroup so the schema does not depend on which shard a
/// row's owner belongs to.
pub fn build_settings(
    view: &View,
    me: NodeId,
    config: &SquallConfig,
) -> (SstLayout, BTreeMap<SubgroupId, SubgroupSettings>) {
    let mut num_received_len = 0usize;
    let mut slots_len = 0usize;
    let mut index_len = 0usize;
    let mut settings = BTreeMap::new();

    for (g, shards) in view.subgroup_layout.iter().enumerate() {
        let subgroup_id = SubgroupId::new(g as u32);
        let num_received_offset = num_received_len;
        let slot_offset = slots_len;
        let index_offset = index_len;

        let mut max_senders = 0usize;
        let mut max_window = 0usize;
        let mut max_stride = 0usize;
        let mut mine: Option<(usize, &SubView)> = None;
        for (shard_num, subview) in shards.iter().enumerate() {
            let params = config.multicast_profile(&subview.profile);
            max_senders = max_senders.max(subview.num_senders());
            max_window = max_window.max(params.window_size as usize);
            max_stride = max_stride.max(
                SubgroupSettings::SLOT_LEN_PREFIX + params.sst_max_msg_size() as usize,
            );
            if subview.rank_of(me).is_some() {
                mine = Some((shard_num, subview));
            }
        }
        num_received_len += max_senders;
        slots_len += max_window * max_stride;
        index_len += max_window;

        if let Some((shard_num, subview)) = mine {
            let params = config.multicast_profile(&subview.profile);
            let my_shard_rank = subview.rank_of(me).expect("checked above");
            settings.insert(
                subgroup_id,
                SubgroupSettings {
                    subgroup_id,
                    shard_num: ShardNum::new(shard_num as u32),
                    member_ranks: subview
                        .members
                        .iter()
                        .map(|m| view.rank_of(*m).expect("shard member not in view"))
                        .collect(),
                    members: subview.members.clone(),
                    senders: subview.senders.clone(),
                    my_shard_rank,
                    my_sender_rank: subview.sender_rank_of(me),
                    mode: subview.mode,
                    params,
                    num_received_offset,
                    slot_offset,
                    index_offset,
                },
            );
        }
    }

    let layout = SstLayout::new(
        view.num_members(),
        view.subgroup_layout.len(),
        num_received_len,
        slots_len,
        index_len,
    );
    (layout, settings)
}
