//! Integration tests for the multicast engine.
//!
//! These run small in-process clusters over the memory transport, driving
//! each node's predicate thread by hand so every interleaving is
//! deterministic.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use squall_config::{InfoConfig, MulticastParams};
use squall_sst::{MemoryHub, Sst, SstLayout, Transport};
use squall_types::{
    DeliveryMode, Envelope, MessageId, NodeId, ShardNum, SubgroupId, Timestamp, Version, WireKind,
};

use crate::{
    EngineCallbacks, MulticastEngine, MulticastError, PersistenceManager, SubgroupSettings,
};

// ============================================================================
// Harness
// ============================================================================

type DeliveryLog = Arc<Mutex<Vec<(NodeId, MessageId, Vec<u8>, Version)>>>;

struct TestNode {
    sst: Arc<Sst>,
    engine: Arc<MulticastEngine>,
    delivered: DeliveryLog,
}

impl TestNode {
    /// Drains point-to-point traffic into the engine, then runs one
    /// predicate sweep.
    fn tick(&self) {
        while let Some(bytes) = self.sst.transport().try_recv() {
            let env: Envelope = postcard::from_bytes(&bytes).unwrap();
            if env.kind == WireKind::RdmcBlock {
                self.engine.handle_envelope(&env).unwrap();
            }
        }
        self.sst.tick();
    }
}

fn settings_for(
    my_shard_rank: usize,
    members: Vec<NodeId>,
    senders: Vec<bool>,
    mode: DeliveryMode,
    params: MulticastParams,
) -> SubgroupSettings {
    let my_sender_rank = if senders[my_shard_rank] {
        Some(senders[..my_shard_rank].iter().filter(|s| **s).count())
    } else {
        None
    };
    SubgroupSettings {
        subgroup_id: SubgroupId::new(0),
        shard_num: ShardNum::new(0),
        member_ranks: (0..members.len()).collect(),
        members,
        senders,
        my_shard_rank,
        my_sender_rank,
        mode,
        params,
        num_received_offset: 0,
        slot_offset: 0,
        index_offset: 0,
    }
}

fn layout_for(settings: &SubgroupSettings) -> SstLayout {
    SstLayout::new(
        settings.num_members(),
        1,
        settings.num_senders(),
        settings.window() * settings.slot_stride(),
        settings.window(),
    )
}

/// Builds an n-node cluster with one subgroup covering every node.
fn cluster(
    n: usize,
    senders: Vec<bool>,
    mode: DeliveryMode,
    params: MulticastParams,
    persistence: Option<Arc<dyn PersistenceManager>>,
) -> Vec<TestNode> {
    let hub = MemoryHub::new();
    let members: Vec<NodeId> = (0..n as u32).map(NodeId::new).collect();
    (0..n)
        .map(|rank| {
            let s = settings_for(
                rank,
                members.clone(),
                senders.clone(),
                mode,
                params.clone(),
            );
            let layout = layout_for(&s);
            let transport = hub.register(members[rank]);
            let sst = Arc::new(Sst::new(
                squall_types::ViewId::INITIAL,
                members.clone(),
                rank,
                layout,
                Arc::new(transport),
            ));
            let delivered: DeliveryLog = Arc::new(Mutex::new(Vec::new()));
            let log = Arc::clone(&delivered);
            let callbacks = EngineCallbacks::with_stability(
                move |_subgroup, sender, index, payload, version| {
                    log.lock()
                        .unwrap()
                        .push((sender, index, payload.to_vec(), version));
                },
            );
            let engine = MulticastEngine::new(
                Arc::clone(&sst),
                BTreeMap::from([(SubgroupId::new(0), s)]),
                1,
                callbacks,
                persistence.clone(),
                InfoConfig::default(),
                Vec::new(),
                BTreeMap::new(),
            );
            TestNode {
                sst,
                engine,
                delivered,
            }
        })
        .collect()
}

fn tick_all(nodes: &[TestNode], rounds: usize) {
    for _ in 0..rounds {
        for node in nodes {
            node.engine.sender_sweep();
            node.tick();
        }
    }
}

fn small_params() -> MulticastParams {
    MulticastParams {
        max_payload_size: 512,
        max_smc_payload_size: 128,
        block_size: 64,
        window_size: 8,
        ..MulticastParams::default()
    }
}

const G0: SubgroupId = SubgroupId::new(0);

// ============================================================================
// Slot plane
// ============================================================================

#[test]
fn single_node_delivers_its_own_messages() {
    let nodes = cluster(1, vec![true], DeliveryMode::Ordered, small_params(), None);
    for i in 0..3u8 {
        assert!(nodes[0]
            .engine
            .send(G0, 1, |buf| buf[0] = i, false)
            .unwrap());
        tick_all(&nodes, 2);
    }
    let log = nodes[0].delivered.lock().unwrap();
    assert_eq!(log.len(), 3);
    for (i, (sender, index, payload, version)) in log.iter().enumerate() {
        assert_eq!(*sender, NodeId::new(0));
        assert_eq!(*index, MessageId::new(i as i64));
        assert_eq!(payload, &vec![i as u8]);
        assert_eq!(*version, Version::new(i as i64));
    }
}

#[test]
fn two_senders_interleave_round_robin() {
    let nodes = cluster(
        2,
        vec![true, true],
        DeliveryMode::Ordered,
        small_params(),
        None,
    );
    for i in 0..4u8 {
        assert!(nodes[0]
            .engine
            .send(G0, 2, |buf| buf.copy_from_slice(&[0, i]), false)
            .unwrap());
        assert!(nodes[1]
            .engine
            .send(G0, 2, |buf| buf.copy_from_slice(&[1, i]), false)
            .unwrap());
        tick_all(&nodes, 3);
    }

    for node in &nodes {
        let log = node.delivered.lock().unwrap();
        assert_eq!(log.len(), 8);
        for (seq, (sender, index, payload, _)) in log.iter().enumerate() {
            // Round-robin law: global seq i comes from sender rank i mod 2.
            assert_eq!(sender.as_u32(), (seq % 2) as u32);
            assert_eq!(index.as_i64(), (seq / 2) as i64);
            assert_eq!(payload, &vec![(seq % 2) as u8, (seq / 2) as u8]);
        }
    }
    // Identical delivery at both members.
    assert_eq!(
        *nodes[0].delivered.lock().unwrap(),
        *nodes[1].delivered.lock().unwrap()
    );
}

#[test]
fn delivery_stops_at_the_silent_sender_round_robin_slot() {
    let nodes = cluster(
        2,
        vec![true, true],
        DeliveryMode::Ordered,
        small_params(),
        None,
    );
    // Node 0 sends twice while node 1 stays silent. Global seq 0 (sender 0,
    // index 0) is stable once everyone holds it, but seq 1 belongs to the
    // silent sender and blocks everything after it.
    assert!(nodes[0].engine.send(G0, 1, |buf| buf[0] = 9, false).unwrap());
    assert!(nodes[0].engine.send(G0, 1, |buf| buf[0] = 8, false).unwrap());
    tick_all(&nodes, 4);
    assert_eq!(nodes[0].delivered.lock().unwrap().len(), 1);
    assert_eq!(nodes[1].delivered.lock().unwrap().len(), 1);

    // Node 1 sends; seqs 1 and 2 become deliverable.
    assert!(nodes[1].engine.send(G0, 1, |buf| buf[0] = 7, false).unwrap());
    tick_all(&nodes, 4);
    assert_eq!(nodes[0].delivered.lock().unwrap().len(), 3);
    assert_eq!(nodes[1].delivered.lock().unwrap().len(), 3);
}

// ============================================================================
// Block plane
// ============================================================================

#[test]
fn large_messages_travel_by_blocks() {
    let params = small_params();
    let payload_len = 300; // > max_smc_payload_size, < max_payload_size
    let nodes = cluster(3, vec![true, false, false], DeliveryMode::Ordered, params, None);

    let body: Vec<u8> = (0..payload_len).map(|i| (i % 251) as u8).collect();
    let expected = body.clone();
    assert!(nodes[0]
        .engine
        .send(G0, payload_len, move |buf| buf.copy_from_slice(&body), false)
        .unwrap());
    tick_all(&nodes, 4);

    for node in &nodes {
        let log = node.delivered.lock().unwrap();
        assert_eq!(log.len(), 1);
        let (sender, index, payload, _) = &log[0];
        assert_eq!(*sender, NodeId::new(0));
        assert_eq!(*index, MessageId::new(0));
        assert_eq!(payload, &expected);
    }
}

#[test]
fn out_of_order_blocks_reassemble() {
    use crate::BlockFrame;

    let nodes = cluster(
        2,
        vec![true, true],
        DeliveryMode::Ordered,
        small_params(),
        None,
    );
    // Hand-deliver the frames of a 2-block message in reverse order to node 1.
    let mut msg = vec![0u8; 32 + 100];
    let header = squall_types::MessageHeader::new(MessageId::new(0), Timestamp::new(5), 0, false);
    header.encode_into(&mut msg);
    for (i, byte) in msg.iter_mut().skip(32).enumerate() {
        *byte = i as u8;
    }
    let mut frames = BlockFrame::split(G0, 0, MessageId::new(0), &msg, 64);
    assert_eq!(frames.len(), 3);
    frames.reverse();
    for frame in frames {
        nodes[1].engine.handle_block_frame(frame).unwrap();
    }

    let row = nodes[1].sst.read_local_row();
    assert_eq!(row.num_received[0], 0, "message 0 received in-order");
}

#[test]
fn gapped_sender_indices_hold_back_num_received() {
    use crate::BlockFrame;

    let nodes = cluster(
        2,
        vec![true, true],
        DeliveryMode::Ordered,
        small_params(),
        None,
    );
    let make_msg = |index: i64| {
        let mut msg = vec![0u8; 32 + 200];
        let header =
            squall_types::MessageHeader::new(MessageId::new(index), Timestamp::new(5), 0, false);
        header.encode_into(&mut msg);
        msg
    };

    // Index 1 arrives before index 0: the contiguous prefix stays empty.
    for frame in BlockFrame::split(G0, 0, MessageId::new(1), &make_msg(1), 64) {
        nodes[1].engine.handle_block_frame(frame).unwrap();
    }
    assert_eq!(nodes[1].sst.read_local_row().num_received[0], -1);

    // Index 0 fills the gap; both become contiguous.
    for frame in BlockFrame::split(G0, 0, MessageId::new(0), &make_msg(0), 64) {
        nodes[1].engine.handle_block_frame(frame).unwrap();
    }
    assert_eq!(nodes[1].sst.read_local_row().num_received[0], 1);
}

// ============================================================================
// Unordered mode
// ============================================================================

#[test]
fn unordered_mode_delivers_at_receipt() {
    let nodes = cluster(
        2,
        vec![true, true],
        DeliveryMode::Unordered,
        small_params(),
        None,
    );
    // Only node 0 sends: in unordered mode its messages deliver without
    // waiting on node 1's round-robin share.
    for i in 0..3u8 {
        assert!(nodes[0].engine.send(G0, 1, |buf| buf[0] = i, false).unwrap());
    }
    tick_all(&nodes, 3);

    for node in &nodes {
        let log = node.delivered.lock().unwrap();
        assert_eq!(log.len(), 3);
        // Per-sender prefix is exact and in order.
        for (i, (sender, index, payload, _)) in log.iter().enumerate() {
            assert_eq!(*sender, NodeId::new(0));
            assert_eq!(index.as_i64(), i as i64);
            assert_eq!(payload, &vec![i as u8]);
        }
    }
}

// ============================================================================
// Backpressure
// ============================================================================

#[test]
fn window_full_returns_no_slot() {
    let params = MulticastParams {
        window_size: 2,
        ..small_params()
    };
    let nodes = cluster(2, vec![true, true], DeliveryMode::Ordered, params, None);

    // Node 1 never sends. The window fills after window_size sends.
    assert!(nodes[0].engine.send(G0, 1, |buf| buf[0] = 0, false).unwrap());
    assert!(nodes[0].engine.send(G0, 1, |buf| buf[0] = 1, false).unwrap());
    assert!(!nodes[0].engine.send(G0, 1, |buf| buf[0] = 2, false).unwrap());

    // Global seq 0 stabilizes and delivers, freeing exactly one window slot;
    // everything further waits on the silent sender.
    tick_all(&nodes, 3);
    assert!(nodes[0].engine.send(G0, 1, |buf| buf[0] = 2, false).unwrap());
    assert!(!nodes[0].engine.send(G0, 1, |buf| buf[0] = 3, false).unwrap());
}

#[test]
fn oversized_payload_is_rejected() {
    let nodes = cluster(1, vec![true], DeliveryMode::Ordered, small_params(), None);
    let err = nodes[0]
        .engine
        .send(G0, 4096, |_| {}, false)
        .unwrap_err();
    assert!(matches!(err, MulticastError::PayloadTooLarge { .. }));
}

// ============================================================================
// Null messages
// ============================================================================

#[test]
fn silent_sender_injects_nulls_after_timeout() {
    let params = MulticastParams {
        sender_timeout_ms: 1,
        ..small_params()
    };
    let nodes = cluster(2, vec![true, true], DeliveryMode::Ordered, params, None);

    // Sender 0 produces; sender 1 stays silent. Only sender 0's first
    // message (global seq 0) can stabilize; seq 1 waits on sender 1.
    for i in 0..5u8 {
        assert!(nodes[0].engine.send(G0, 1, |buf| buf[0] = i, false).unwrap());
    }
    tick_all(&nodes, 3);
    assert_eq!(nodes[0].delivered.lock().unwrap().len(), 1);

    // Force node 1's timeout sweep far past its sender timeout.
    let late = Timestamp::new(Timestamp::now().as_nanos() + 10_000_000_000);
    for _ in 0..5 {
        nodes[1].engine.timeout_sweep(late);
        tick_all(&nodes, 3);
    }

    // The nulls unblocked sender 0's messages; nulls themselves are not
    // delivered to the application.
    for node in &nodes {
        let log = node.delivered.lock().unwrap();
        assert_eq!(log.len(), 5);
        assert!(log.iter().all(|(sender, ..)| *sender == NodeId::new(0)));
    }
    // The null carrier advanced sender 1's index with num_nulls accounted.
    let row = nodes[0].sst.read_row(1);
    assert!(row.num_received[1] >= 0, "nulls advanced sender 1's share");

    // The null message's on-wire header carries a positive num_nulls count.
    let s = settings_for(
        1,
        vec![NodeId::new(0), NodeId::new(1)],
        vec![true, true],
        DeliveryMode::Ordered,
        MulticastParams {
            sender_timeout_ms: 1,
            ..small_params()
        },
    );
    let slot = &row.slots[s.slot_range(0)];
    let header = squall_types::MessageHeader::decode(
        &slot[crate::SubgroupSettings::SLOT_LEN_PREFIX..],
    )
    .unwrap();
    assert!(header.num_nulls >= 1);
    assert_eq!(header.index, 0);
}

// ============================================================================
// Wedge and ragged delivery
// ============================================================================

#[test]
fn wedged_engine_refuses_sends() {
    let nodes = cluster(1, vec![true], DeliveryMode::Ordered, small_params(), None);
    nodes[0].engine.wedge();
    let err = nodes[0].engine.send(G0, 1, |_| {}, false).unwrap_err();
    assert!(matches!(err, MulticastError::Wedged));
    assert!(nodes[0].sst.read_local_row().wedged);
}

#[test]
fn deliver_messages_upto_applies_per_sender_caps() {
    let nodes = cluster(
        2,
        vec![true, true],
        DeliveryMode::Ordered,
        small_params(),
        None,
    );
    // Sender 0 sends 3 messages, sender 1 sends 1; without the trim only
    // seqs 0..=2 (indices 0,0,1) could ever stabilize.
    for i in 0..3u8 {
        assert!(nodes[0].engine.send(G0, 1, |buf| buf[0] = i, false).unwrap());
    }
    assert!(nodes[1].engine.send(G0, 1, |buf| buf[0] = 9, false).unwrap());
    tick_all(&nodes, 4);

    let already = nodes[0].delivered.lock().unwrap().len();
    assert_eq!(already, 3, "stable prefix delivers normally");

    // View change: caps say deliver sender 0 through index 2, sender 1
    // through index 0.
    nodes[0].engine.wedge();
    nodes[0].engine.deliver_messages_upto(G0, &[2, 0]);
    let log = nodes[0].delivered.lock().unwrap();
    assert_eq!(log.len(), 4);
    assert_eq!(log[3].0, NodeId::new(0));
    assert_eq!(log[3].1, MessageId::new(2));
}

// ============================================================================
// Persistence frontier
// ============================================================================

/// Records posted versions; durability is acknowledged by the test.
struct ManualPersistence {
    posted: Mutex<Vec<(SubgroupId, Version, Vec<u8>)>>,
}

impl ManualPersistence {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            posted: Mutex::new(Vec::new()),
        })
    }
}

impl PersistenceManager for ManualPersistence {
    fn post_next_version(&self, _subgroup: SubgroupId, _version: Version, _ts: Timestamp) {}

    fn post_version(&self, subgroup: SubgroupId, version: Version, payload: &[u8]) {
        self.posted
            .lock()
            .unwrap()
            .push((subgroup, version, payload.to_vec()));
    }
}

#[test]
fn persistence_frontier_follows_shard_minimum() {
    let pm = ManualPersistence::new();
    let nodes = cluster(
        2,
        vec![true, true],
        DeliveryMode::Ordered,
        small_params(),
        Some(pm.clone() as Arc<dyn PersistenceManager>),
    );
    assert!(nodes[0].engine.send(G0, 1, |buf| buf[0] = 1, false).unwrap());
    assert!(nodes[1].engine.send(G0, 1, |buf| buf[0] = 2, false).unwrap());
    tick_all(&nodes, 4);

    // Both nodes delivered versions 0 and 1 and posted them for persistence.
    assert_eq!(pm.posted.lock().unwrap().len(), 4);
    assert_eq!(nodes[0].engine.delivered_version(G0), Version::new(1));
    assert_eq!(
        nodes[0].engine.get_global_persistence_frontier(G0),
        Version::NONE,
        "nothing persisted yet"
    );

    // Node 0 persists both, node 1 only version 0: the global frontier is
    // the min across the shard.
    nodes[0].engine.persistence_complete(G0, Version::new(1));
    nodes[1].engine.persistence_complete(G0, Version::new(0));
    tick_all(&nodes, 3);
    assert_eq!(
        nodes[0].engine.get_global_persistence_frontier(G0),
        Version::new(0)
    );

    nodes[1].engine.persistence_complete(G0, Version::new(1));
    tick_all(&nodes, 3);
    assert_eq!(
        nodes[0].engine.get_global_persistence_frontier(G0),
        Version::new(1)
    );
    assert!(nodes[0]
        .engine
        .wait_for_global_persistence_frontier(G0, Version::new(1)));
}

#[test]
fn wait_for_future_version_returns_false() {
    let nodes = cluster(1, vec![true], DeliveryMode::Ordered, small_params(), None);
    assert!(!nodes[0]
        .engine
        .wait_for_global_persistence_frontier(G0, Version::new(10)));
}

// ============================================================================
// Info fields
// ============================================================================

#[test]
fn load_info_round_trips_between_members() {
    let nodes = cluster(
        2,
        vec![true, true],
        DeliveryMode::Ordered,
        small_params(),
        None,
    );
    nodes[0].engine.set_load_info_entry(42);
    nodes[0].sst.push_row_except_slots().unwrap();
    tick_all(&nodes, 2);
    assert_eq!(nodes[1].engine.get_load_info(NodeId::new(0)), Some(42));
}

// ============================================================================
// Property: arrival order never changes the delivered prefix
// ============================================================================

mod properties {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Whatever per-round send interleaving the senders choose, every
        /// member delivers the identical round-robin prefix.
        #[test]
        fn delivered_prefixes_identical(rounds in 1usize..6, order in proptest::bool::ANY) {
            let nodes = cluster(
                3,
                vec![true, true, true],
                DeliveryMode::Ordered,
                small_params(),
                None,
            );
            for round in 0..rounds {
                let ranks: Vec<usize> = if order { vec![0, 1, 2] } else { vec![2, 0, 1] };
                for rank in ranks {
                    let tag = (round * 3 + rank) as u8;
                    prop_assert!(nodes[rank]
                        .engine
                        .send(G0, 1, move |buf| buf[0] = tag, false)
                        .unwrap());
                }
                tick_all(&nodes, 4);
            }

            let reference = nodes[0].delivered.lock().unwrap().clone();
            prop_assert_eq!(reference.len(), rounds * 3);
            for node in &nodes[1..] {
                prop_assert_eq!(&*node.delivered.lock().unwrap(), &reference);
            }
            for (seq, (sender, index, _, version)) in reference.iter().enumerate() {
                prop_assert_eq!(sender.as_u32() as usize, seq % 3);
                prop_assert_eq!(index.as_i64(), (seq / 3) as i64);
                prop_assert_eq!(version.as_i64(), seq as i64);
            }
        }
    }
}
