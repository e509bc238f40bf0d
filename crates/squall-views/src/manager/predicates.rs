//! The GMS predicates.
//!
//! Six recurrent predicates drive the view-change machine, in the order the
//! protocol advances: failure detection, suspicion handling and proposals,
//! follower acknowledgement, leader commit, epoch termination (wedging), and
//! trim publication. The install sequence itself lives in `install.rs` and
//! fires from the ragged-trim predicate.

use std::sync::{Arc, Weak};
use std::time::Instant;

use squall_sst::{PredicateKind, Sst, SstRow};
use squall_types::ChangeProposal;

use super::{ActiveState, ViewManager, VmState};

/// A peer whose heartbeat counter has not moved for this many heartbeat
/// intervals is suspected.
const HEARTBEAT_GRACE_INTERVALS: u32 = 3;

impl ViewManager {
    pub(crate) fn register_gms_predicates(self: &Arc<Self>, sst: &Sst) {
        let register = |name: &'static str,
                        pred: fn(&ViewManager) -> bool,
                        handler: fn(&Arc<ViewManager>)| {
            let weak_p: Weak<ViewManager> = Arc::downgrade(self);
            let weak_h: Weak<ViewManager> = Arc::downgrade(self);
            sst.register_predicate(
                name,
                PredicateKind::Recurrent,
                move |_| weak_p.upgrade().is_some_and(|vm| pred(vm.as_ref())),
                move |_| {
                    if let Some(vm) = weak_h.upgrade() {
                        handler(&vm);
                    }
                },
            );
        };

        register("failure_detector", Self::heartbeats_stale, |vm| {
            vm.suspect_stale_peers()
        });
        register("suspicion", Self::suspicions_pending, |vm| {
            vm.handle_suspicions()
        });
        register("ack_proposals", Self::acks_pending, |vm| vm.ack_proposals());
        register("commit", Self::commit_ready, |vm| vm.advance_commit());
        register("terminate_epoch", Self::epoch_termination_due, |vm| {
            vm.terminate_epoch()
        });
        register("publish_trim", Self::trim_publication_due, |vm| {
            vm.publish_trim()
        });
        register("ragged_trim", Self::install_ready, |vm| {
            vm.trim_and_install()
        });
    }

    pub(crate) fn with_active<R>(&self, f: impl FnOnce(&mut ActiveState) -> R) -> Option<R> {
        let mut inner = self.inner.lock().unwrap();
        match &mut *inner {
            VmState::Active(active) => Some(f(active)),
            VmState::Joining(_) => None,
        }
    }

    /// The leader is the lowest-ranked member not suspected in the local
    /// row.
    pub(crate) fn leader_rank_of(local: &SstRow) -> usize {
        local
            .suspected
            .iter()
            .position(|s| !*s)
            .expect("every member suspected, including us")
    }

    // ========================================================================
    // Failure detection
    // ========================================================================

    fn heartbeats_stale(&self) -> bool {
        self.with_active(|active| {
            let grace = u128::from(self.config.group.heartbeat_ms)
                * u128::from(HEARTBEAT_GRACE_INTERVALS);
            let local = active.sst.read_local_row();
            let my_rank = active.sst.my_rank();
            let mut any_stale = false;
            for rank in 0..active.sst.num_rows() {
                if rank == my_rank || local.suspected[rank] {
                    continue;
                }
                let beat = active.sst.read_row(rank).heartbeat;
                let (last_beat, last_advance) = active.heartbeat_seen[rank];
                if beat > last_beat {
                    active.heartbeat_seen[rank] = (beat, Instant::now());
                } else if last_advance.elapsed().as_millis() > grace {
                    any_stale = true;
                }
            }
            any_stale
        })
        .unwrap_or(false)
    }

    fn suspect_stale_peers(self: &Arc<Self>) {
        let stale: Vec<usize> = self
            .with_active(|active| {
                let grace = u128::from(self.config.group.heartbeat_ms)
                    * u128::from(HEARTBEAT_GRACE_INTERVALS);
                let local = active.sst.read_local_row();
                let my_rank = active.sst.my_rank();
                (0..active.sst.num_rows())
                    .filter(|rank| {
                        *rank != my_rank
                            && !local.suspected[*rank]
                            && active.heartbeat_seen[*rank].1.elapsed().as_millis() > grace
                    })
                    .collect()
            })
            .unwrap_or_default();
        if stale.is_empty() {
            return;
        }
        self.with_active(|active| {
            for rank in &stale {
                tracing::warn!(rank, "heartbeat lost, suspecting member");
            }
            active.sst.edit_local_row(|row| {
                for rank in &stale {
                    row.suspected[*rank] = true;
                }
            });
            if let Err(e) = active.sst.push_row_except_slots() {
                tracing::warn!(error = %e, "failed to push suspicions");
            }
        });
    }

    // ========================================================================
    // Suspicion handling and proposals
    // ========================================================================

    fn suspicions_pending(&self) -> bool {
        self.with_active(|active| {
            let n = active.sst.num_rows();
            let local = active.sst.read_local_row();
            for origin in 0..n {
                let row = if origin == active.sst.my_rank() {
                    local.clone()
                } else {
                    active.sst.read_row(origin)
                };
                if row.rip && !active.handled_rips[origin] {
                    return true;
                }
                for rank in 0..n {
                    if row.suspected[rank] && !active.handled_suspicions[rank] {
                        return true;
                    }
                }
            }
            // A leader also revisits this handler while join requests wait.
            !active.pending_join_requests.is_empty()
        })
        .unwrap_or(false)
    }

    /// Merges suspicions from every row, wedges on new ones, and (as leader)
    /// appends the departure and join proposals the observed events call
    /// for.
    pub(crate) fn handle_suspicions(self: &Arc<Self>) {
        let ejected = self
            .with_active(|active| {
                let n = active.sst.num_rows();
                let my_rank = active.sst.my_rank();

                // Union of suspicions across all rows, and rip flags.
                let mut suspected = vec![false; n];
                let mut ripped = vec![false; n];
                for origin in 0..n {
                    let row = active.sst.read_row(origin);
                    ripped[origin] = row.rip;
                    for (rank, bit) in row.suspected.iter().enumerate() {
                        suspected[rank] |= *bit;
                    }
                }
                if suspected[my_rank] {
                    return true;
                }

                // A graceful exit is a departure proposal without a
                // suspicion; the leader may propose its own.
                let new_suspicions: Vec<usize> = (0..n)
                    .filter(|r| suspected[*r] && !active.handled_suspicions[*r])
                    .collect();
                let new_rips: Vec<usize> = (0..n)
                    .filter(|r| ripped[*r] && !active.handled_rips[*r])
                    .collect();

                if !new_suspicions.is_empty() {
                    // Partitioning safety: refuse to continue if the
                    // survivors no longer form a majority of this view.
                    let live = suspected.iter().filter(|s| !**s).count();
                    if live < active.view.majority()
                        && !self.config.group.disable_partitioning_safety
                    {
                        tracing::error!(
                            live,
                            majority = active.view.majority(),
                            "suspicions would partition the group; refusing to proceed"
                        );
                        self.partitioned
                            .store(true, std::sync::atomic::Ordering::Release);
                        return false;
                    }

                    // Any member that learns of a failure wedges the epoch.
                    active.engine.wedge();
                }

                active.sst.edit_local_row(|row| {
                    for r in &new_suspicions {
                        row.suspected[*r] = true;
                    }
                });
                for r in &new_suspicions {
                    active.handled_suspicions[*r] = true;
                }
                for r in &new_rips {
                    active.handled_rips[*r] = true;
                }

                let leader_rank = suspected
                    .iter()
                    .position(|s| !*s)
                    .expect("some member is live");
                if leader_rank == my_rank {
                    let taking_over = !active.i_was_leader && my_rank != 0;
                    active.i_was_leader = true;
                    if taking_over {
                        Self::mark_end_of_view(active);
                    }
                    for r in new_suspicions.iter().chain(new_rips.iter()) {
                        Self::propose_departure(active, *r);
                    }
                    let joins: Vec<_> = active.pending_join_requests.drain(..).collect();
                    for (node, addr) in joins {
                        Self::propose_join(active, node, addr);
                    }
                } else {
                    active.i_was_leader = false;
                }

                if let Err(e) = active.sst.push_row_except_slots() {
                    tracing::warn!(error = %e, "failed to push proposal state");
                }
                false
            })
            .unwrap_or(false);

        if ejected {
            tracing::error!("this node is suspected by the group; ceasing participation");
            self.ejected
                .store(true, std::sync::atomic::Ordering::Release);
            if let Some(engine) = self.with_active(|a| Arc::clone(&a.engine)) {
                engine.wedge();
            }
        }
    }

    /// A successor leader bounds the failed leader's pipeline by marking the
    /// last foreign proposal as the end of the view.
    fn mark_end_of_view(active: &mut ActiveState) {
        let me = active.sst.my_id();
        active.sst.edit_local_row(|row| {
            let pending = (row.num_changes - row.num_installed) as usize;
            let last_foreign = (0..pending)
                .rev()
                .find(|slot| row.changes[*slot].proposer() != me);
            if let Some(slot) = last_foreign {
                row.changes[slot].end_of_view = true;
                tracing::debug!(slot, "marked end of predecessor leader's view");
            }
        });
    }

    fn propose_departure(active: &mut ActiveState, rank: usize) {
        let subject = active.view.members[rank];
        let me = active.sst.my_id();
        active.sst.edit_local_row(|row| {
            let pending = (row.num_changes - row.num_installed) as usize;
            let already = row.changes[..pending]
                .iter()
                .any(|c| c.subject() == subject);
            if already || pending >= row.changes.len() {
                return;
            }
            row.changes[pending] = ChangeProposal::new(me, subject);
            row.joiners[pending] = Default::default();
            row.num_changes += 1;
            row.num_acked = row.num_changes;
            tracing::info!(subject = %subject, slot = pending, "proposed departure");
        });
    }

    fn propose_join(
        active: &mut ActiveState,
        node: squall_types::NodeId,
        addr: squall_types::MemberAddr,
    ) {
        let me = active.sst.my_id();
        active.sst.edit_local_row(|row| {
            let pending = (row.num_changes - row.num_installed) as usize;
            if pending >= row.changes.len() {
                tracing::warn!(node = %node, "change window full, deferring join");
                return;
            }
            row.changes[pending] = ChangeProposal::new(me, node);
            row.joiners[pending] = squall_types::JoinerEntry::new(node, addr);
            row.num_changes += 1;
            row.num_acked = row.num_changes;
            tracing::info!(node = %node, slot = pending, "proposed join");
        });
    }

    // ========================================================================
    // Acknowledgement (followers)
    // ========================================================================

    fn acks_pending(&self) -> bool {
        self.with_active(|active| {
            let local = active.sst.read_local_row();
            let leader = Self::leader_rank_of(&local);
            if leader == active.sst.my_rank() {
                return false;
            }
            active.sst.read_row(leader).num_changes > local.num_acked
        })
        .unwrap_or(false)
    }

    fn ack_proposals(self: &Arc<Self>) {
        self.with_active(|active| {
            let local = active.sst.read_local_row();
            let leader = Self::leader_rank_of(&local);
            let leader_row = active.sst.read_row(leader);
            active.sst.edit_local_row(|row| {
                row.copy_change_proposals(&leader_row);
                row.num_acked = row.num_changes;
            });
            tracing::debug!(
                leader,
                acked = leader_row.num_changes,
                "acknowledged leader proposals"
            );
            if let Err(e) = active.sst.push_row_except_slots() {
                tracing::warn!(error = %e, "failed to push acks");
            }
        });
    }

    // ========================================================================
    // Commit (leader)
    // ========================================================================

    fn commit_ready(&self) -> bool {
        self.with_active(|active| {
            // Once the trim is published the commit point is frozen so every
            // member consumes the identical change window at install.
            if active.trim_published {
                return false;
            }
            let local = active.sst.read_local_row();
            if Self::leader_rank_of(&local) != active.sst.my_rank() {
                return false;
            }
            Self::min_acked_over_live(active, &local) > local.num_committed
        })
        .unwrap_or(false)
    }

    fn min_acked_over_live(active: &ActiveState, local: &SstRow) -> u32 {
        (0..active.sst.num_rows())
            .filter(|rank| !local.suspected[*rank])
            .map(|rank| {
                if rank == active.sst.my_rank() {
                    local.num_acked
                } else {
                    active.sst.read_row(rank).num_acked
                }
            })
            .min()
            .unwrap_or(0)
    }

    fn advance_commit(self: &Arc<Self>) {
        self.with_active(|active| {
            let local = active.sst.read_local_row();
            let committable = Self::min_acked_over_live(active, &local);
            if committable <= local.num_committed {
                return;
            }
            active
                .sst
                .edit_local_row(|row| row.num_committed = committable);
            tracing::debug!(num_committed = committable, "proposals committed");
            if let Err(e) = active.sst.push_row_except_slots() {
                tracing::warn!(error = %e, "failed to push commit");
            }
        });
    }

    // ========================================================================
    // Epoch termination (wedging)
    // ========================================================================

    fn epoch_termination_due(&self) -> bool {
        self.with_active(|active| {
            let local = active.sst.read_local_row();
            let leader = Self::leader_rank_of(&local);
            let leader_committed = if leader == active.sst.my_rank() {
                local.num_committed
            } else {
                active.sst.read_row(leader).num_committed
            };
            leader_committed > local.num_committed
                || (local.num_committed > local.num_installed && !active.engine.is_wedged())
        })
        .unwrap_or(false)
    }

    fn terminate_epoch(self: &Arc<Self>) {
        self.with_active(|active| {
            let local = active.sst.read_local_row();
            let leader = Self::leader_rank_of(&local);
            let leader_committed = if leader == active.sst.my_rank() {
                local.num_committed
            } else {
                active.sst.read_row(leader).num_committed
            };
            if leader_committed > local.num_committed {
                active
                    .sst
                    .edit_local_row(|row| row.num_committed = leader_committed);
            }
            let local = active.sst.read_local_row();
            if local.num_committed > local.num_installed {
                // Committed changes end this view: halt the data plane so
                // the ragged trim can run on a frozen epoch.
                active.engine.wedge();
            }
            if let Err(e) = active.sst.push_row_except_slots() {
                tracing::warn!(error = %e, "failed to push epoch termination");
            }
        });
    }

    // ========================================================================
    // Trim publication (shard leaders)
    // ========================================================================

    fn trim_publication_due(&self) -> bool {
        self.with_active(|active| {
            if active.trim_published {
                return false;
            }
            let local = active.sst.read_local_row();
            local.num_committed > local.num_installed && Self::all_wedged(active, &local)
        })
        .unwrap_or(false)
    }

    /// For each shard this node leads, publishes the per-sender delivery
    /// caps: the minimum `num_received` across the shard's live rows, i.e.
    /// the intersection of what every survivor holds.
    fn publish_trim(self: &Arc<Self>) {
        self.with_active(|active| {
            let local = active.sst.read_local_row();
            let my_rank = active.sst.my_rank();
            let settings = active.engine.settings().clone();
            active.sst.edit_local_row(|row| {
                for (subgroup, s) in &settings {
                    let live_ranks: Vec<usize> = s
                        .member_ranks
                        .iter()
                        .copied()
                        .filter(|r| !local.suspected[*r])
                        .collect();
                    let shard_leader = live_ranks.iter().copied().min();
                    if shard_leader != Some(my_rank) {
                        continue;
                    }
                    for sender_rank in 0..s.num_senders() {
                        let nr = s.nr_index(sender_rank);
                        let cap = live_ranks
                            .iter()
                            .map(|r| {
                                if *r == my_rank {
                                    row.num_received[nr]
                                } else {
                                    active.sst.read_row(*r).num_received[nr]
                                }
                            })
                            .min()
                            .unwrap_or(-1);
                        row.global_min[nr] = cap;
                    }
                    row.global_min_ready[subgroup.as_usize()] = true;
                    tracing::debug!(subgroup = %subgroup, "published ragged trim");
                }
            });
            active.trim_published = true;
            if let Err(e) = active.sst.push_row_except_slots() {
                tracing::warn!(error = %e, "failed to push trim");
            }
        });
    }
}
