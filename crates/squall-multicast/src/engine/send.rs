//! Send paths: slot-plane writes, block-plane queuing, the sender sweep,
//! and the timeout sweep (heartbeat + null injection).

use bytes::Bytes;
use squall_sst::Transport;
use squall_types::{Envelope, MessageHeader, SubgroupId, Timestamp, WireKind};

use crate::{BlockFrame, MulticastError, MulticastResult, relay_children};

use super::state::PendingSend;
use super::MulticastEngine;

impl MulticastEngine {
    /// Reserves a slot, fills it via `msg_generator`, and commits the send.
    ///
    /// Returns `Ok(false)` when the in-flight window is full (backpressure;
    /// the caller retries) and `Ok(true)` once the message is accepted.
    /// Messages small enough for the slot plane are published immediately;
    /// larger ones are queued for the sender thread's block-plane transfer.
    pub fn send(
        &self,
        subgroup: SubgroupId,
        payload_size: usize,
        msg_generator: impl FnOnce(&mut [u8]),
        cooked: bool,
    ) -> MulticastResult<bool> {
        self.send_internal(subgroup, payload_size, msg_generator, cooked, false)
    }

    fn send_internal(
        &self,
        subgroup: SubgroupId,
        payload_size: usize,
        msg_generator: impl FnOnce(&mut [u8]),
        cooked: bool,
        is_null: bool,
    ) -> MulticastResult<bool> {
        if self.is_shut_down() {
            return Err(MulticastError::ShuttingDown);
        }
        if self.is_wedged() {
            return Err(MulticastError::Wedged);
        }
        let s = self.subgroup(subgroup)?;
        let my_sender_rank = s
            .my_sender_rank
            .ok_or(MulticastError::NotASender(subgroup))?;
        if payload_size as u64 > s.params.max_payload_size {
            return Err(MulticastError::PayloadTooLarge {
                payload: payload_size as u64,
                max: s.params.max_payload_size,
            });
        }

        let k = s.num_senders();
        let window = s.window() as i64;
        let delivered = self.sst.read_local_row().delivered_num[subgroup.as_usize()];
        let now = Timestamp::now();

        let mut state = self.state.lock().unwrap();
        let sub = state.subgroups.get_mut(&subgroup).expect("subgroup state");

        // Backpressure: bound in-flight messages per sender by the window.
        let own_delivered = own_delivered_count(delivered, k, my_sender_rank);
        if sub.future_message_index.as_i64() - own_delivered >= window {
            return Ok(false);
        }

        let index = sub.future_message_index;
        if is_null {
            sub.nulls_sent += 1;
        }
        let header = MessageHeader::new(index, now, sub.nulls_sent, cooked);

        let smc_eligible =
            payload_size as u64 + MessageHeader::SIZE as u64 <= s.params.sst_max_msg_size();
        if smc_eligible {
            // Slot plane: write header+payload straight into the local row's
            // slot ring and publish by raising the slot's index field.
            debug_assert!(!sub.smc_send_in_progress, "send is serialized by the engine lock");
            sub.smc_send_in_progress = true;
            let slot = index.as_usize() % s.window();
            let range = s.slot_range(slot);
            let index_pos = s.slot_index_pos(slot);
            self.sst.edit_local_row(|row| {
                let slot_bytes = &mut row.slots[range];
                slot_bytes[0..4].copy_from_slice(&(payload_size as u32).to_le_bytes());
                let msg = &mut slot_bytes[4..];
                header.encode_into(msg);
                msg_generator(
                    &mut msg[MessageHeader::SIZE..MessageHeader::SIZE + payload_size],
                );
                row.index[index_pos] = index.as_i64() as i32;
            });
            sub.smc_send_in_progress = false;
            sub.future_message_index = index.next();
            sub.last_send_activity_ns = now.as_nanos();
            drop(state);
            // The full push carries the slot bytes to every peer, including
            // this node's own receiver predicate.
            self.sst.push_row()?;
        } else {
            // Block plane: fill a pooled buffer and let the sender thread
            // drive the transfer.
            let mut buffer = sub.take_buffer(s.params.max_msg_size() as usize);
            msg_generator(buffer.begin_message(&header, payload_size));
            sub.pending_sends.push_back(PendingSend { index, buffer });
            sub.future_message_index = index.next();
            sub.last_send_activity_ns = now.as_nanos();
        }

        tracing::trace!(
            subgroup = %subgroup,
            index = %index,
            payload_size,
            smc = smc_eligible,
            null = is_null,
            "send accepted"
        );
        Ok(true)
    }

    // ========================================================================
    // Sender thread
    // ========================================================================

    /// One sender-thread iteration: ships at most one pending block-plane
    /// message per subgroup. Returns the number of messages shipped.
    pub fn sender_sweep(&self) -> usize {
        if self.is_wedged() {
            return 0;
        }
        let mut shipped = 0;
        let subgroups: Vec<SubgroupId> = self.settings.keys().copied().collect();
        for subgroup in subgroups {
            let next = {
                let mut state = self.state.lock().unwrap();
                state
                    .subgroups
                    .get_mut(&subgroup)
                    .and_then(|sub| sub.pending_sends.pop_front())
            };
            let Some(send) = next else { continue };
            if let Err(e) = self.ship_blocks(subgroup, &send) {
                tracing::warn!(subgroup = %subgroup, error = %e, "block transfer failed");
            }
            // The sender observes its own message through the same receive
            // accounting as everyone else.
            let s = &self.settings[&subgroup];
            let my_sender_rank = s.my_sender_rank.expect("pending send from non-sender");
            self.note_received(subgroup, my_sender_rank, send.index, send.buffer);
            shipped += 1;
        }
        shipped
    }

    fn ship_blocks(&self, subgroup: SubgroupId, send: &PendingSend) -> MulticastResult<()> {
        let s = &self.settings[&subgroup];
        let frames = BlockFrame::split(
            subgroup,
            s.my_shard_rank,
            send.index,
            send.buffer.bytes(),
            s.params.block_size as usize,
        );
        let children = relay_children(
            s.params.rdmc_send_algorithm,
            s.num_members(),
            s.my_shard_rank,
            s.my_shard_rank,
        );
        // Block-granularity pipelining: each block goes out as soon as it is
        // cut, interleaved across children.
        for frame in &frames {
            for &child in &children {
                self.send_frame(s.member_ranks[child], frame)?;
            }
        }
        tracing::trace!(
            subgroup = %subgroup,
            index = %send.index,
            blocks = frames.len(),
            children = children.len(),
            "block transfer shipped"
        );
        Ok(())
    }

    pub(super) fn send_frame(&self, view_rank: usize, frame: &BlockFrame) -> MulticastResult<()> {
        let to = self.sst.members()[view_rank];
        let env = Envelope::new(
            self.sst.my_id(),
            WireKind::RdmcBlock,
            Bytes::from(postcard::to_allocvec(frame)?),
        );
        let bytes = Bytes::from(postcard::to_allocvec(&env)?);
        self.sst.transport().send_to(to, bytes)?;
        Ok(())
    }

    // ========================================================================
    // Timeout thread
    // ========================================================================

    /// One timeout-thread iteration: bumps the heartbeat counter and injects
    /// a null message for any subgroup where this sender has gone silent
    /// while the round-robin order waits on it.
    pub fn timeout_sweep(&self, now: Timestamp) {
        self.sst.edit_local_row(|row| row.heartbeat += 1);
        if let Err(e) = self.sst.push_row_except_slots() {
            tracing::warn!(error = %e, "failed to push heartbeat");
            return;
        }
        if self.is_wedged() {
            return;
        }

        let subgroups: Vec<SubgroupId> = self.settings.keys().copied().collect();
        for subgroup in subgroups {
            if self.null_due(subgroup, now) {
                match self.send_internal(subgroup, 0, |_| {}, false, true) {
                    Ok(true) => {
                        tracing::debug!(subgroup = %subgroup, "injected null message");
                    }
                    Ok(false) => {}
                    Err(MulticastError::Wedged) => return,
                    Err(e) => {
                        tracing::warn!(subgroup = %subgroup, error = %e, "null injection failed");
                    }
                }
            }
        }
    }

    /// A null is due when another sender's in-order traffic has passed this
    /// sender's last message and this sender has been idle past its timeout.
    fn null_due(&self, subgroup: SubgroupId, now: Timestamp) -> bool {
        let s = &self.settings[&subgroup];
        let Some(my_sender_rank) = s.my_sender_rank else {
            return false;
        };
        if s.num_senders() < 2 {
            return false;
        }

        let (last_sent, idle_ns) = {
            let state = self.state.lock().unwrap();
            let sub = &state.subgroups[&subgroup];
            (
                sub.future_message_index.as_i64() - 1,
                now.as_nanos().saturating_sub(sub.last_send_activity_ns),
            )
        };
        if idle_ns < u64::from(s.params.sender_timeout_ms) * 1_000_000 {
            return false;
        }

        let row = self.sst.read_local_row();
        let others_ahead = (0..s.num_senders())
            .filter(|sr| *sr != my_sender_rank)
            .map(|sr| row.num_received[s.nr_index(sr)])
            .max()
            .unwrap_or(-1);
        others_ahead > last_sent
    }
}

/// Number of messages from the sender at `sender_rank` contained in the
/// globally delivered prefix ending at `delivered` (inclusive).
pub(super) fn own_delivered_count(delivered: i64, num_senders: usize, sender_rank: usize) -> i64 {
    let k = num_senders as i64;
    let r = sender_rank as i64;
    if delivered < r {
        0
    } else {
        (delivered - r) / k + 1
    }
}

#[cfg(test)]
mod tests {
    use super::own_delivered_count;

    #[test]
    fn own_delivered_count_follows_round_robin() {
        // 3 senders; delivered prefix 0..=4 contains seqs 0,3 from sender 0,
        // 1,4 from sender 1, 2 from sender 2.
        assert_eq!(own_delivered_count(4, 3, 0), 2);
        assert_eq!(own_delivered_count(4, 3, 1), 2);
        assert_eq!(own_delivered_count(4, 3, 2), 1);
        assert_eq!(own_delivered_count(-1, 3, 0), 0);
        assert_eq!(own_delivered_count(0, 3, 1), 0);
    }
}
