//! Mutable engine state, guarded by one mutex.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use squall_types::{MessageId, SubgroupId, Version};

use crate::{MessageBuffer, SubgroupSettings};

/// A message accepted by `send` and waiting for the sender thread.
pub(crate) struct PendingSend {
    pub index: MessageId,
    pub buffer: MessageBuffer,
}

/// A received (or self-sent) message that is not yet globally stable.
pub(crate) struct StableMessage {
    pub sender_rank: usize,
    pub index: MessageId,
    pub timestamp_ns: u64,
    pub buffer: MessageBuffer,
    /// Unordered-mode messages are delivered at receipt and record their
    /// version here; the delivery trigger then only advances counters and
    /// routes the buffer to persistence.
    pub early_version: Option<Version>,
}

impl StableMessage {
    pub fn is_null(&self) -> bool {
        self.buffer.payload().is_empty()
    }
}

/// An in-progress block-plane reassembly.
pub(crate) struct IncomingTransfer {
    pub num_blocks: u32,
    pub received: u32,
    pub total_size: u64,
    pub data: Vec<u8>,
    pub have_block: Vec<bool>,
}

impl IncomingTransfer {
    pub fn new(num_blocks: u32, total_size: u64) -> Self {
        Self {
            num_blocks,
            received: 0,
            total_size,
            data: vec![0; total_size as usize],
            have_block: vec![false; num_blocks as usize],
        }
    }

    pub fn is_complete(&self) -> bool {
        self.received == self.num_blocks
    }
}

/// Per-subgroup engine bookkeeping.
pub(crate) struct SubgroupState {
    /// Buffers not currently loaned out.
    pub free_buffers: Vec<MessageBuffer>,
    /// Index the next `send` will use.
    pub future_message_index: MessageId,
    /// Accepted block-plane messages waiting for the sender thread.
    pub pending_sends: VecDeque<PendingSend>,
    /// Guards two application threads racing on the same slot region.
    pub smc_send_in_progress: bool,
    /// Cumulative null messages injected by this sender.
    pub nulls_sent: u32,
    /// Wall-clock ns of this sender's most recent send, for null timing.
    pub last_send_activity_ns: u64,
    /// Per sender rank: indices received beyond the contiguous prefix.
    pub out_of_order: Vec<BTreeSet<i64>>,
    /// Received messages keyed by global sequence number, awaiting
    /// stability.
    pub locally_stable: BTreeMap<i64, StableMessage>,
    /// Timestamps of undelivered messages (refcounted; clocks may collide).
    pub pending_timestamps: BTreeMap<u64, usize>,
    /// Delivered messages whose buffers are retained until the persistence
    /// collaborator confirms durability, keyed by version.
    pub non_persistent: BTreeMap<i64, MessageBuffer>,
    /// In-progress block reassemblies keyed by (sender shard rank, index).
    pub current_receives: HashMap<(usize, i64), IncomingTransfer>,
    /// Next version to assign at delivery.
    pub next_version: Version,
}

impl SubgroupState {
    fn new(settings: &SubgroupSettings, initial_version: Option<Version>) -> Self {
        let window = settings.window();
        let needs_block_plane =
            settings.params.max_payload_size > settings.params.max_smc_payload_size;
        let free_buffers = if needs_block_plane && settings.my_sender_rank.is_some() {
            (0..window)
                .map(|_| MessageBuffer::allocate(settings.params.max_msg_size() as usize))
                .collect()
        } else {
            Vec::new()
        };
        Self {
            free_buffers,
            future_message_index: MessageId::new(0),
            pending_sends: VecDeque::new(),
            smc_send_in_progress: false,
            nulls_sent: 0,
            last_send_activity_ns: 0,
            out_of_order: vec![BTreeSet::new(); settings.num_senders()],
            locally_stable: BTreeMap::new(),
            pending_timestamps: BTreeMap::new(),
            non_persistent: BTreeMap::new(),
            current_receives: HashMap::new(),
            next_version: initial_version.map_or(Version::new(0), |v| v.next()),
        }
    }

    /// Takes a buffer from the free list, growing it if the pool ran dry
    /// (receive-side buffers are not window-bounded).
    pub fn take_buffer(&mut self, capacity: usize) -> MessageBuffer {
        match self.free_buffers.pop() {
            Some(buf) if buf.capacity() >= capacity => buf,
            _ => MessageBuffer::allocate(capacity),
        }
    }

    pub fn return_buffer(&mut self, mut buffer: MessageBuffer) {
        buffer.reset();
        self.free_buffers.push(buffer);
    }

    /// Removes one reference to a pending timestamp.
    pub fn release_timestamp(&mut self, ts: u64) {
        if let Some(count) = self.pending_timestamps.get_mut(&ts) {
            *count -= 1;
            if *count == 0 {
                self.pending_timestamps.remove(&ts);
            }
        }
    }

    /// The oldest timestamp still awaiting delivery, if any.
    pub fn oldest_pending_timestamp(&self) -> Option<u64> {
        self.pending_timestamps.keys().next().copied()
    }
}

/// All mutable engine state.
pub(crate) struct EngineState {
    pub subgroups: BTreeMap<SubgroupId, SubgroupState>,
}

impl EngineState {
    pub fn new(
        settings: &BTreeMap<SubgroupId, SubgroupSettings>,
        initial_versions: &BTreeMap<SubgroupId, Version>,
    ) -> Self {
        let subgroups = settings
            .iter()
            .map(|(id, s)| {
                (
                    *id,
                    SubgroupState::new(s, initial_versions.get(id).copied()),
                )
            })
            .collect();
        Self { subgroups }
    }
}
