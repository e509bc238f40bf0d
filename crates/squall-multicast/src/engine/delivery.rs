//! Delivery: the stability-driven trigger, the ragged-trim executor, and
//! the persistence-frontier predicates.

use squall_types::{MessageId, SubgroupId, Version};

use super::state::StableMessage;
use super::MulticastEngine;

impl MulticastEngine {
    /// The global stable count: the minimum `seq_num` across the shard's
    /// live rows.
    fn stability_min(&self, subgroup: SubgroupId) -> i64 {
        let s = &self.settings[&subgroup];
        let g = subgroup.as_usize();
        s.member_ranks
            .iter()
            .filter(|rank| !self.already_failed[**rank])
            .map(|rank| self.sst.read_row(*rank).seq_num[g])
            .min()
            .unwrap_or(-1)
    }

    /// Guard for the delivery predicate: has the global stable count passed
    /// what this node has delivered?
    pub(super) fn delivery_ready(&self, subgroup: SubgroupId) -> bool {
        self.stability_min(subgroup)
            > self.sst.read_local_row().delivered_num[subgroup.as_usize()]
    }

    /// Delivers every newly stable message, in the global round-robin order.
    pub(super) fn delivery_trigger(&self, subgroup: SubgroupId) {
        let stable = self.stability_min(subgroup);
        let delivered = self.sst.read_local_row().delivered_num[subgroup.as_usize()];
        if stable <= delivered {
            return;
        }
        self.deliver_range(subgroup, delivered, stable, None);
    }

    /// Delivers messages caught behind a ragged edge: everything up to the
    /// per-sender caps agreed for the view change, stability notwithstanding,
    /// then discards the trimmed tail. Called by the view manager once every
    /// survivor has published ready.
    pub fn deliver_messages_upto(&self, subgroup: SubgroupId, max_indices_for_senders: &[i64]) {
        let s = &self.settings[&subgroup];
        let k = s.num_senders();
        assert_eq!(max_indices_for_senders.len(), k, "one cap per sender");
        let delivered = self.sst.read_local_row().delivered_num[subgroup.as_usize()];
        let max_seq = (0..k)
            .map(|sr| max_indices_for_senders[sr] * k as i64 + sr as i64)
            .max()
            .unwrap_or(-1);
        tracing::debug!(
            subgroup = %subgroup,
            caps = ?max_indices_for_senders,
            delivered,
            max_seq,
            "delivering ragged edge"
        );
        self.deliver_range(subgroup, delivered, max_seq, Some(max_indices_for_senders));

        // Whatever remains was trimmed: it is not part of this view's
        // delivered prefix anywhere.
        let mut state = self.state.lock().unwrap();
        let sub = state.subgroups.get_mut(&subgroup).expect("subgroup state");
        let trimmed = sub.locally_stable.len();
        if trimmed > 0 {
            tracing::debug!(subgroup = %subgroup, trimmed, "discarding trimmed messages");
        }
        let leftovers: Vec<StableMessage> = std::mem::take(&mut sub.locally_stable)
            .into_values()
            .collect();
        for msg in leftovers {
            sub.release_timestamp(msg.timestamp_ns);
            sub.return_buffer(msg.buffer);
        }
        for set in &mut sub.out_of_order {
            set.clear();
        }
        sub.current_receives.clear();
    }

    /// Shared delivery loop: walks global sequence numbers in
    /// `(from, upto]`, delivering messages inside the per-sender caps (all
    /// of them when `caps` is `None`). Callbacks run with no engine lock
    /// held.
    fn deliver_range(&self, subgroup: SubgroupId, from: i64, upto: i64, caps: Option<&[i64]>) {
        let s = &self.settings[&subgroup];
        let g = subgroup.as_usize();
        let k = s.num_senders();

        struct Delivery {
            msg: StableMessage,
            version: Option<Version>,
        }

        let mut deliveries = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            let sub = state.subgroups.get_mut(&subgroup).expect("subgroup state");
            for seq in (from + 1)..=upto {
                let (sender_rank, index) = MessageId::new(seq).to_sender_coords(k);
                if let Some(caps) = caps {
                    if index.as_i64() > caps[sender_rank] {
                        continue;
                    }
                }
                let Some(msg) = sub.locally_stable.remove(&seq) else {
                    // Stability (or an agreed cap) implies receipt; a hole
                    // here means the accounting lied and the delivered
                    // prefix can no longer be trusted.
                    panic!(
                        "subgroup {subgroup}: message at stable seq {seq} \
                         (sender {sender_rank}, index {index}) was never received"
                    );
                };
                sub.release_timestamp(msg.timestamp_ns);
                let version = if msg.is_null() || msg.early_version.is_some() {
                    None
                } else {
                    let v = sub.next_version;
                    sub.next_version = v.next();
                    Some(v)
                };
                deliveries.push(Delivery { msg, version });
            }
        }

        // Invoke callbacks lock-free so handlers may call back into send().
        for d in &deliveries {
            let Some(version) = d.version else { continue };
            let ts = squall_types::Timestamp::new(d.msg.timestamp_ns);
            if let Some(pm) = &self.persistence {
                pm.post_next_version(subgroup, version, ts);
            }
            if let Some(stability) = &self.callbacks.stability {
                let sender = self.sst.members()[s.row_rank_of_sender(d.msg.sender_rank)];
                stability(subgroup, sender, d.msg.index, d.msg.buffer.payload(), version);
            }
            self.frontiers[g].note_delivered(version);
            if let Some(pm) = &self.persistence {
                pm.post_version(subgroup, version, d.msg.buffer.payload());
            }
        }

        // Buffer bookkeeping and the row update.
        let (latest_version, oldest_pending) = {
            let mut state = self.state.lock().unwrap();
            let sub = state.subgroups.get_mut(&subgroup).expect("subgroup state");
            for d in deliveries {
                let retained_version = d.version.or(d.msg.early_version);
                match (retained_version, self.persistence.is_some()) {
                    (Some(v), true) => {
                        // Retained until the collaborator confirms
                        // durability.
                        sub.non_persistent.insert(v.as_i64(), d.msg.buffer);
                    }
                    _ => sub.return_buffer(d.msg.buffer),
                }
            }
            (
                Version::new(sub.next_version.as_i64() - 1),
                sub.oldest_pending_timestamp(),
            )
        };

        self.sst.edit_local_row(|row| {
            row.delivered_num[g] = row.delivered_num[g].max(upto);
            if self.persistence.is_none() {
                // Volatile groups treat delivery as the durability point so
                // the frontier API stays meaningful.
                row.persisted_num[g] = row.persisted_num[g].max(latest_version.as_i64());
                row.signed_num[g] = row.signed_num[g].max(latest_version.as_i64());
                row.verified_num[g] = row.verified_num[g].max(latest_version.as_i64());
            }
            let frontier_ts = oldest_pending.unwrap_or_else(|| squall_types::Timestamp::now().as_nanos());
            if frontier_ts > row.local_stability_frontier[g] {
                row.local_stability_frontier[g] = frontier_ts;
            }
        });
        if let Err(e) = self.sst.push_row_except_slots() {
            tracing::warn!(error = %e, "failed to push delivery advance");
        }
    }

    // ========================================================================
    // Persistence frontier predicates
    // ========================================================================

    fn shard_min(&self, subgroup: SubgroupId, field: impl Fn(&squall_sst::SstRow) -> i64) -> i64 {
        let s = &self.settings[&subgroup];
        s.member_ranks
            .iter()
            .filter(|rank| !self.already_failed[**rank])
            .map(|rank| field(&self.sst.read_row(*rank)))
            .min()
            .unwrap_or(-1)
    }

    pub(super) fn min_persisted_advanced(&self, subgroup: SubgroupId) -> bool {
        let g = subgroup.as_usize();
        self.shard_min(subgroup, |row| row.persisted_num[g])
            > self.frontiers[g].min_persisted().as_i64()
    }

    pub(super) fn update_min_persisted(&self, subgroup: SubgroupId) {
        let g = subgroup.as_usize();
        let min = self.shard_min(subgroup, |row| row.persisted_num[g]);
        self.frontiers[g].raise_persisted(Version::new(min));

        // Durable messages no longer need their buffers.
        let mut state = self.state.lock().unwrap();
        let sub = state.subgroups.get_mut(&subgroup).expect("subgroup state");
        let durable: Vec<i64> = sub
            .non_persistent
            .range(..=min)
            .map(|(v, _)| *v)
            .collect();
        for v in durable {
            if let Some(buffer) = sub.non_persistent.remove(&v) {
                sub.return_buffer(buffer);
            }
        }
    }

    pub(super) fn min_verified_advanced(&self, subgroup: SubgroupId) -> bool {
        let g = subgroup.as_usize();
        self.shard_min(subgroup, |row| row.verified_num[g])
            > self.frontiers[g].min_verified().as_i64()
    }

    pub(super) fn update_min_verified(&self, subgroup: SubgroupId) {
        let g = subgroup.as_usize();
        let min = self.shard_min(subgroup, |row| row.verified_num[g]);
        self.frontiers[g].raise_verified(Version::new(min));
    }
}
