//! Receive paths: block reassembly and relay, slot-plane polling, and the
//! in-order receive accounting both planes feed into.

use squall_types::{
    DeliveryMode, Envelope, MessageHeader, MessageId, SubgroupId, WireKind,
};

use crate::{relay_children, BlockFrame, MessageBuffer, MulticastResult, SubgroupSettings};

use super::state::{IncomingTransfer, StableMessage};
use super::MulticastEngine;

impl MulticastEngine {
    // ========================================================================
    // Block plane
    // ========================================================================

    /// Routes a point-to-point envelope into the engine. Only
    /// [`WireKind::RdmcBlock`] envelopes belong here; everything else is the
    /// caller's to dispatch.
    pub fn handle_envelope(&self, envelope: &Envelope) -> MulticastResult<()> {
        debug_assert_eq!(envelope.kind, WireKind::RdmcBlock);
        let frame: BlockFrame = postcard::from_bytes(&envelope.payload)?;
        self.handle_block_frame(frame)
    }

    /// Accepts one block: relays it down the dissemination tree, then folds
    /// it into the reassembly for its message.
    pub fn handle_block_frame(&self, frame: BlockFrame) -> MulticastResult<()> {
        let Some(s) = self.settings.get(&frame.subgroup) else {
            tracing::warn!(subgroup = %frame.subgroup, "block frame for foreign subgroup");
            return Ok(());
        };
        let root = frame.sender_shard_rank as usize;

        // Forward first: pipelining means a relay passes each block along
        // before the full message has arrived.
        for child in relay_children(
            s.params.rdmc_send_algorithm,
            s.num_members(),
            root,
            s.my_shard_rank,
        ) {
            self.send_frame(s.member_ranks[child], &frame)?;
        }

        let completed = {
            let mut state = self.state.lock().unwrap();
            let sub = state
                .subgroups
                .get_mut(&frame.subgroup)
                .expect("subgroup state");
            let key = (root, frame.index.as_i64());
            let transfer = sub
                .current_receives
                .entry(key)
                .or_insert_with(|| IncomingTransfer::new(frame.num_blocks, frame.total_size));
            let block = frame.block_num as usize;
            if transfer.have_block[block] {
                tracing::trace!(index = %frame.index, block, "duplicate block dropped");
                None
            } else {
                transfer.have_block[block] = true;
                transfer.received += 1;
                let start = block * s.params.block_size as usize;
                transfer.data[start..start + frame.bytes.len()].copy_from_slice(&frame.bytes);
                if transfer.is_complete() {
                    sub.current_receives.remove(&key)
                } else {
                    None
                }
            }
        };

        if let Some(transfer) = completed {
            let sender_rank = s
                .sender_rank_of(root)
                .expect("block-plane message from a non-sender");
            let buffer = MessageBuffer::from_wire(&transfer.data[..transfer.total_size as usize]);
            self.note_received(frame.subgroup, sender_rank, frame.index, buffer);
        }
        Ok(())
    }

    // ========================================================================
    // Slot plane
    // ========================================================================

    /// Cheap guard for the slot-plane receiver predicate: is any freshly
    /// published slot waiting in some sender's row?
    pub(super) fn smc_slots_available(&self) -> bool {
        self.settings.values().any(|s| self.has_fresh_slot(s))
    }

    fn has_fresh_slot(&self, s: &SubgroupSettings) -> bool {
        let local = self.sst.read_local_row();
        (0..s.num_senders()).any(|sender_rank| {
            let consumed = local.num_received_sst[s.nr_index(sender_rank)];
            let candidate = consumed + 1;
            let slot = (candidate as usize) % s.window();
            let sender_row = self.sst.read_row(s.row_rank_of_sender(sender_rank));
            sender_row.index[s.slot_index_pos(slot)] == candidate as i32
        })
    }

    /// Consumes every freshly published slot across all subgroups and
    /// senders, feeding each message into the receive accounting.
    pub fn smc_poll(&self) -> usize {
        let mut consumed_total = 0;
        let subgroups: Vec<SubgroupId> = self.settings.keys().copied().collect();
        for subgroup in subgroups {
            let s = self.settings[&subgroup].clone();
            for sender_rank in 0..s.num_senders() {
                loop {
                    let consumed =
                        self.sst.read_local_row().num_received_sst[s.nr_index(sender_rank)];
                    let candidate = consumed + 1;
                    let slot = (candidate as usize) % s.window();
                    let sender_row = self.sst.read_row(s.row_rank_of_sender(sender_rank));
                    if sender_row.index[s.slot_index_pos(slot)] != candidate as i32 {
                        break;
                    }

                    let slot_bytes = &sender_row.slots[s.slot_range(slot)];
                    let payload_len = u32::from_le_bytes(
                        slot_bytes[..SubgroupSettings::SLOT_LEN_PREFIX]
                            .try_into()
                            .unwrap(),
                    ) as usize;
                    let msg_end =
                        SubgroupSettings::SLOT_LEN_PREFIX + MessageHeader::SIZE + payload_len;
                    let buffer = MessageBuffer::from_wire(
                        &slot_bytes[SubgroupSettings::SLOT_LEN_PREFIX..msg_end],
                    );

                    self.sst.edit_local_row(|row| {
                        row.num_received_sst[s.nr_index(sender_rank)] = candidate;
                    });
                    self.note_received(subgroup, sender_rank, MessageId::new(candidate), buffer);
                    consumed_total += 1;
                }
            }
        }
        consumed_total
    }

    // ========================================================================
    // Receive accounting
    // ========================================================================

    /// Folds one complete message (from either plane, own sends included)
    /// into the in-order accounting: stashes it by global sequence number,
    /// advances `num_received` over the contiguous prefix, recomputes the
    /// row's `seq_num`, and pushes the row.
    ///
    /// Unordered-mode payloads are delivered to the application here, at
    /// receipt.
    pub(super) fn note_received(
        &self,
        subgroup: SubgroupId,
        sender_rank: usize,
        index: MessageId,
        buffer: MessageBuffer,
    ) {
        let s = &self.settings[&subgroup];
        let g = subgroup.as_usize();
        let k = s.num_senders();
        let header = buffer
            .header()
            .unwrap_or_else(|| panic!("received message without a decodable header"));
        let seq = MessageId::from_sender_coords(sender_rank, index, k).as_i64();

        // `Some(delivery)` for a fresh message, where `delivery` carries the
        // (payload, version) of an unordered-mode immediate delivery; `None`
        // for a duplicate.
        let fresh: Option<Option<(bytes::Bytes, squall_types::Version)>> = {
            let mut state = self.state.lock().unwrap();
            let sub = state.subgroups.get_mut(&subgroup).expect("subgroup state");

            self.sst.edit_local_row(|row| {
                let nr_idx = s.nr_index(sender_rank);
                let mut nr = row.num_received[nr_idx];
                if index.as_i64() <= nr || sub.out_of_order[sender_rank].contains(&index.as_i64())
                {
                    tracing::trace!(
                        subgroup = %subgroup,
                        sender_rank,
                        index = %index,
                        "duplicate message dropped"
                    );
                    return None;
                }

                let is_null = buffer.payload().is_empty();
                let mut message = StableMessage {
                    sender_rank,
                    index,
                    timestamp_ns: header.timestamp_ns,
                    buffer,
                    early_version: None,
                };
                let mut early_delivery = None;
                if s.mode == DeliveryMode::Unordered && !is_null {
                    let version = sub.next_version;
                    sub.next_version = version.next();
                    message.early_version = Some(version);
                    early_delivery = Some((
                        bytes::Bytes::copy_from_slice(message.buffer.payload()),
                        version,
                    ));
                }
                *sub.pending_timestamps.entry(header.timestamp_ns).or_insert(0) += 1;

                if index.as_i64() == nr + 1 {
                    nr += 1;
                    // Absorb any out-of-order arrivals the gap was hiding.
                    while sub.out_of_order[sender_rank].remove(&(nr + 1)) {
                        nr += 1;
                    }
                } else {
                    sub.out_of_order[sender_rank].insert(index.as_i64());
                }
                row.num_received[nr_idx] = nr;

                // seq_num is the largest global sequence such that every
                // sender's share of the prefix has arrived.
                let first_missing = (0..k)
                    .map(|sr| (row.num_received[s.nr_index(sr)] + 1) * k as i64 + sr as i64)
                    .min()
                    .expect("subgroup has senders");
                if first_missing - 1 > row.seq_num[g] {
                    row.seq_num[g] = first_missing - 1;
                }

                if let Some(oldest) = sub.oldest_pending_timestamp() {
                    if oldest > row.local_stability_frontier[g] {
                        row.local_stability_frontier[g] = oldest;
                    }
                }

                sub.locally_stable.insert(seq, message);
                Some(early_delivery)
            })
        };

        let Some(early_delivery) = fresh else {
            return;
        };
        if let Some((payload, version)) = early_delivery {
            self.frontiers[g].note_delivered(version);
            if let Some(pm) = &self.persistence {
                pm.post_next_version(subgroup, version, header.timestamp());
            }
            if let Some(stability) = &self.callbacks.stability {
                let sender = self.sst.members()[s.row_rank_of_sender(sender_rank)];
                stability(subgroup, sender, index, &payload, version);
            }
            if let Some(pm) = &self.persistence {
                pm.post_version(subgroup, version, &payload);
            }
        }

        if let Err(e) = self.sst.push_row_except_slots() {
            tracing::warn!(error = %e, "failed to push receive accounting");
        }
    }
}
