//! The install sequence: ragged-edge delivery, successor-view computation,
//! state transfer to joiners, and SST/engine turnover.

use std::sync::Arc;

use bytes::Bytes;
use squall_sst::{Sst, SstRow};
use squall_types::{MemberAddr, NodeId, SubgroupId, Timestamp, Version};

use crate::{
    bootstrap::{GmsMessage, StateBlob},
    build_settings, LayoutError, View, ViewError, ViewResult,
};

use super::{ActiveState, ViewManager};

impl ViewManager {
    /// Guard for the ragged-trim predicate: a view change is committed, the
    /// epoch is fully wedged, and every shard this node belongs to has its
    /// caps published.
    pub(crate) fn install_ready(&self) -> bool {
        self.with_active(|active| {
            if active.installing {
                return false;
            }
            let local = active.sst.read_local_row();
            if local.num_committed <= local.num_installed {
                return false;
            }
            // Install only once this member has caught up to the group
            // leader's (frozen) commit point, so all survivors consume the
            // same window.
            let group_leader = Self::leader_rank_of(&local);
            if group_leader != active.sst.my_rank()
                && active.sst.read_row(group_leader).num_committed != local.num_committed
            {
                return false;
            }
            if let Some(failed_at) = active.last_failed_install_committed {
                // A previously abandoned attempt retries only once the
                // commit point moves past it.
                if local.num_committed <= failed_at {
                    return false;
                }
            }
            if !Self::all_wedged(active, &local) {
                return false;
            }
            active.engine.settings().iter().all(|(subgroup, s)| {
                let Some(leader) = Self::shard_leader(&local, &s.member_ranks) else {
                    return false;
                };
                let row = if leader == active.sst.my_rank() {
                    local.clone()
                } else {
                    active.sst.read_row(leader)
                };
                row.global_min_ready[subgroup.as_usize()]
            })
        })
        .unwrap_or(false)
    }

    /// Delivers every shard's agreed prefix, then installs the successor
    /// view.
    pub(crate) fn trim_and_install(self: &Arc<Self>) {
        let installed = self.with_active(|active| {
            active.installing = true;

            // Ragged-edge delivery: adopt each shard leader's caps and
            // deliver up to them, stability notwithstanding.
            let local = active.sst.read_local_row();
            let settings = active.engine.settings().clone();
            for (subgroup, s) in &settings {
                let leader = Self::shard_leader(&local, &s.member_ranks)
                    .expect("shard has no live member");
                let leader_row = active.sst.read_row(leader);
                let caps: Vec<i64> = (0..s.num_senders())
                    .map(|sr| leader_row.global_min[s.nr_index(sr)])
                    .collect();
                if leader != active.sst.my_rank() {
                    active.sst.edit_local_row(|row| {
                        for sr in 0..s.num_senders() {
                            row.global_min[s.nr_index(sr)] = caps[sr];
                        }
                        row.global_min_ready[subgroup.as_usize()] = true;
                    });
                }
                active.engine.deliver_messages_upto(*subgroup, &caps);
            }
            let _ = active.sst.push_row_except_slots();

            match self.install_next_view(active) {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!(error = %e, "view install failed");
                    None
                }
            }
        });

        if let Some(Some(view)) = installed {
            for upcall in &self.view_upcalls {
                (**upcall)(&view);
            }
        }
    }

    /// Computes and installs the successor view. Returns the new view, or
    /// `None` when the attempt was abandoned (inadequate provisioning,
    /// partitioning refusal, or this node departing).
    fn install_next_view(
        self: &Arc<Self>,
        active: &mut ActiveState,
    ) -> ViewResult<Option<Arc<View>>> {
        let local = active.sst.read_local_row();
        let consumed = local.num_committed - local.num_installed;
        debug_assert!(consumed > 0);

        // The committed slice of the change window defines the membership
        // delta; every member reads an identical window here.
        let mut departures: Vec<NodeId> = Vec::new();
        let mut joins: Vec<(NodeId, MemberAddr)> = Vec::new();
        for slot in 0..consumed as usize {
            let subject = local.changes[slot].subject();
            if active.view.contains(subject) {
                if !departures.contains(&subject) {
                    departures.push(subject);
                }
            } else {
                let entry = local.joiners[slot];
                debug_assert_eq!(entry.node_id(), subject, "join proposal without joiner entry");
                joins.push((subject, entry.addr()));
            }
        }

        let survivors = active.view.num_members() - departures.len();
        if survivors < active.view.majority() && !self.config.group.disable_partitioning_safety {
            tracing::error!(
                survivors,
                majority = active.view.majority(),
                "refusing to install a minority view"
            );
            self.partitioned
                .store(true, std::sync::atomic::Ordering::Release);
            active.installing = false;
            active.last_failed_install_committed = Some(local.num_committed);
            return Err(ViewError::Partitioned);
        }

        let mut next = active.view.successor(departures, joins);
        let leaving = !next.localize(self.me);
        match (*self.membership)(Some(active.view.as_ref()), &mut next) {
            Ok(layout) => next.subgroup_layout = layout,
            Err(LayoutError::Inadequate) => {
                tracing::warn!(
                    vid = %next.vid,
                    "membership function cannot provision the next view; staying in the current one"
                );
                active.installing = false;
                active.last_failed_install_committed = Some(local.num_committed);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }

        // Ship membership and state to joiners before the turnover so they
        // can come up in lockstep with the install.
        self.notify_joiners(active, &next, &local, consumed)?;

        if leaving {
            tracing::info!("departed from the group in the next view; shutting down");
            active.engine.shut_down();
            active.sst.shut_down();
            self.shutdown
                .store(true, std::sync::atomic::Ordering::Release);
            return Ok(None);
        }

        // Versions continue across views; seed the new engine with where
        // each subgroup's numbering left off.
        let initial_versions: Vec<(SubgroupId, Version)> = active
            .engine
            .settings()
            .keys()
            .map(|g| (*g, active.engine.delivered_version(*g)))
            .collect();

        let next = Arc::new(next);
        let my_new_rank = next.my_rank.expect("survivor must have a rank");
        let (layout, settings) = build_settings(&next, self.me, &self.config);
        let new_sst = Arc::new(Sst::new(
            next.vid,
            next.members.clone(),
            my_new_rank,
            layout,
            Arc::clone(&self.transport),
        ));
        new_sst.edit_local_row(|row| {
            let mut seeded =
                SstRow::from_previous(new_sst.layout(), &local, consumed, Timestamp::now());
            seeded.vid = next.vid.as_i32();
            *row = seeded;
        });

        let callbacks = self.build_engine_callbacks();
        let new_engine = squall_multicast::MulticastEngine::new(
            Arc::clone(&new_sst),
            settings,
            next.subgroup_layout.len(),
            callbacks,
            self.persistence.clone(),
            self.config.info.clone(),
            next.failed.clone(),
            initial_versions.into_iter().collect(),
        );
        self.register_gms_predicates(&new_sst);
        new_sst.push_row()?;
        new_sst.barrier()?;

        // Retire the old epoch.
        active.engine.shut_down();
        active.sst.shut_down();
        *active = ActiveState::new(Arc::clone(&next), new_sst, new_engine);

        tracing::info!(
            vid = %next.vid,
            members = ?next.members,
            my_rank = my_new_rank,
            "view installed"
        );
        Ok(Some(next))
    }

    /// Sends each joiner its `JoinResponse` (group leader only) and, for
    /// each new-view shard containing a joiner, has the shard's designated
    /// survivor transfer the replicated state.
    fn notify_joiners(
        &self,
        active: &ActiveState,
        next: &View,
        local: &SstRow,
        consumed: u32,
    ) -> ViewResult<()> {
        if next.joined.is_empty() {
            return Ok(());
        }
        let my_new_rank = next.rank_of(self.me);
        let i_am_group_leader =
            Self::leader_rank_of(local) == active.sst.my_rank();

        for joiner in &next.joined {
            // Count the shards whose state the joiner must receive, and send
            // the ones this node is responsible for. The designated captor
            // of a shard is its lowest-new-rank surviving member.
            let mut expected = 0u32;
            for (g, shards) in next.subgroup_layout.iter().enumerate() {
                for shard in shards {
                    if shard.rank_of(*joiner).is_none() {
                        continue;
                    }
                    let captor = shard
                        .members
                        .iter()
                        .filter(|m| !next.joined.contains(m))
                        .min_by_key(|m| next.rank_of(**m));
                    let Some(captor) = captor else { continue };
                    expected += 1;
                    if next.rank_of(*captor) == my_new_rank {
                        let subgroup = SubgroupId::new(g as u32);
                        let (version, bytes) = match &self.state_transfer {
                            Some(st) => st.capture(subgroup),
                            None => (
                                active.engine.delivered_version(subgroup),
                                Bytes::new(),
                            ),
                        };
                        self.send_blob(
                            *joiner,
                            &StateBlob {
                                subgroup,
                                version,
                                bytes,
                            },
                        )?;
                        tracing::debug!(
                            joiner = %joiner,
                            subgroup = %subgroup,
                            version = %version,
                            "state transferred to joiner"
                        );
                    }
                }
            }

            if i_am_group_leader {
                let pending_tail = (consumed as usize)
                    ..(local.num_changes - local.num_installed) as usize;
                let response = GmsMessage::JoinResponse {
                    view: next.clone(),
                    num_changes: local.num_changes,
                    num_committed: local.num_committed,
                    num_installed: local.num_installed + consumed,
                    pending: pending_tail
                        .map(|slot| (local.changes[slot], local.joiners[slot]))
                        .collect(),
                    blobs: Vec::new(),
                    expected_extra_blobs: expected,
                };
                self.send_gms(*joiner, &response)?;
            }
        }
        Ok(())
    }

    // ========================================================================
    // Shared helpers
    // ========================================================================

    pub(super) fn all_wedged(active: &ActiveState, local: &SstRow) -> bool {
        (0..active.sst.num_rows()).all(|rank| {
            local.suspected[rank]
                || if rank == active.sst.my_rank() {
                    local.wedged
                } else {
                    active.sst.read_row(rank).wedged
                }
        })
    }

    /// Lowest-ranked live member of a shard, by view rank.
    pub(super) fn shard_leader(local: &SstRow, member_ranks: &[usize]) -> Option<usize> {
        member_ranks
            .iter()
            .copied()
            .filter(|r| !local.suspected[*r])
            .min()
    }

    pub(super) fn build_engine_callbacks(&self) -> squall_multicast::EngineCallbacks {
        match &self.stability {
            Some(stability) => {
                let stability = Arc::clone(stability);
                squall_multicast::EngineCallbacks {
                    stability: Some(Box::new(move |g, sender, index, payload, version| {
                        (*stability)(g, sender, index, payload, version)
                    })),
                }
            }
            None => squall_multicast::EngineCallbacks::default(),
        }
    }
}
