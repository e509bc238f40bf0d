//! Integration tests for the view manager.
//!
//! Each test runs a small in-process cluster over the memory transport and
//! drives every node's predicate thread by hand, so view changes unfold
//! deterministically.

use std::sync::{Arc, Mutex};

use squall_config::SquallConfig;
use squall_sst::{MemoryHub, MemoryTransport, Transport};
use squall_types::{
    DeliveryMode, Envelope, MemberAddr, MemberPorts, MessageId, NodeId, SubgroupId, Version,
    ViewId, WireKind,
};

use crate::{LayoutError, MembershipFn, StateTransfer, ViewManager};

const G0: SubgroupId = SubgroupId::new(0);

// ============================================================================
// Harness
// ============================================================================

type DeliveryLog = Arc<Mutex<Vec<(NodeId, MessageId, Vec<u8>, Version)>>>;

struct Node {
    vm: Arc<ViewManager>,
    transport: MemoryTransport,
    delivered: DeliveryLog,
}

impl Node {
    fn tick(&self) {
        while let Some(bytes) = self.transport.try_recv() {
            let Ok(env) = postcard::from_bytes::<Envelope>(&bytes) else {
                continue;
            };
            match env.kind {
                WireKind::RdmcBlock => {
                    if let Ok(engine) = self.vm.engine() {
                        let _ = engine.handle_envelope(&env);
                    }
                }
                WireKind::Gms | WireKind::StateTransfer => {
                    let _ = self.vm.handle_envelope(&env);
                }
                _ => {}
            }
        }
        if let Some(sst) = self.vm.sst() {
            sst.tick();
        }
        if let Ok(engine) = self.vm.engine() {
            engine.sender_sweep();
        }
    }

    fn vid(&self) -> Option<ViewId> {
        self.vm.current_view().map(|v| v.vid)
    }
}

fn tick_all(nodes: &[&Node], rounds: usize) {
    for _ in 0..rounds {
        for node in nodes {
            node.tick();
        }
    }
}

fn test_config(local_id: u32) -> SquallConfig {
    let mut config = SquallConfig::default();
    config.group.local_id = local_id;
    // Keep the wall-clock failure detector far out of the way; failures in
    // these tests are reported explicitly.
    config.group.heartbeat_ms = 3_600_000;
    config.multicast.max_payload_size = 512;
    config.multicast.max_smc_payload_size = 128;
    config.multicast.block_size = 64;
    config.multicast.window_size = 16;
    config
}

fn addr_of(id: u32) -> MemberAddr {
    MemberAddr {
        ip: std::net::Ipv4Addr::new(127, 0, 0, 1),
        ports: MemberPorts {
            gms: 23580 + id as u16,
            ..MemberPorts::default()
        },
    }
}

/// One subgroup, one shard spanning every member, everyone a sender.
fn all_senders_membership(min_nodes: usize, mode: DeliveryMode) -> MembershipFn {
    Arc::new(move |_prev, view| {
        if view.num_members() < min_nodes {
            return Err(LayoutError::Inadequate);
        }
        let sv = view.make_subview(view.members.clone(), mode, Vec::new(), "");
        view.next_unassigned_rank = view.num_members();
        Ok(vec![vec![sv]])
    })
}

fn founding_cluster(
    hub: &Arc<MemoryHub>,
    n: u32,
    membership: MembershipFn,
    state_transfer: Option<Arc<dyn StateTransfer>>,
) -> Vec<Node> {
    let initial: Vec<(NodeId, MemberAddr)> =
        (0..n).map(|i| (NodeId::new(i), addr_of(i))).collect();
    let transports: Vec<MemoryTransport> =
        (0..n).map(|i| hub.register(NodeId::new(i))).collect();
    transports
        .into_iter()
        .enumerate()
        .map(|(i, transport)| {
            let delivered: DeliveryLog = Arc::new(Mutex::new(Vec::new()));
            let log = Arc::clone(&delivered);
            let vm = ViewManager::start(
                test_config(i as u32),
                Arc::clone(&membership),
                initial.clone(),
                Arc::new(transport.clone()),
                Some(Arc::new(move |_g, sender, index, payload: &[u8], version| {
                    log.lock()
                        .unwrap()
                        .push((sender, index, payload.to_vec(), version));
                })),
                None,
                state_transfer.clone(),
                Vec::new(),
            )
            .expect("founding member must start");
            Node {
                vm,
                transport,
                delivered,
            }
        })
        .collect()
}

// ============================================================================
// Founding
// ============================================================================

#[test]
fn founders_agree_on_the_first_view() {
    let hub = MemoryHub::new();
    let nodes = founding_cluster(&hub, 3, all_senders_membership(1, DeliveryMode::Ordered), None);
    for node in &nodes {
        let view = node.vm.current_view().unwrap();
        assert_eq!(view.vid, ViewId::INITIAL);
        assert_eq!(view.num_members(), 3);
        assert_eq!(view.subgroup_layout.len(), 1);
    }
}

#[test]
fn engine_wired_through_the_view_manager_delivers() {
    let hub = MemoryHub::new();
    let nodes = founding_cluster(&hub, 3, all_senders_membership(1, DeliveryMode::Ordered), None);
    let refs: Vec<&Node> = nodes.iter().collect();

    for node in &nodes {
        assert!(node
            .vm
            .engine()
            .unwrap()
            .send(G0, 1, |buf| buf[0] = 7, false)
            .unwrap());
    }
    tick_all(&refs, 5);

    for node in &nodes {
        let log = node.delivered.lock().unwrap();
        assert_eq!(log.len(), 3);
        // Round-robin across the three senders.
        for (seq, (sender, ..)) in log.iter().enumerate() {
            assert_eq!(sender.as_u32() as usize, seq % 3);
        }
    }
}

// ============================================================================
// Join during quiescence
// ============================================================================

/// Replicated byte state: applies every delivered payload and remembers the
/// version it reflects, so captured blobs always match the group's version
/// counter.
struct BlobStore {
    state: Mutex<(Version, Vec<u8>)>,
}

impl BlobStore {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new((Version::NONE, Vec::new())),
        })
    }

    fn apply(&self, payload: &[u8], version: Version) {
        let mut state = self.state.lock().unwrap();
        state.0 = version;
        state.1.extend_from_slice(payload);
    }

    fn snapshot(&self) -> (Version, Vec<u8>) {
        self.state.lock().unwrap().clone()
    }
}

impl StateTransfer for BlobStore {
    fn capture(&self, _subgroup: SubgroupId) -> (Version, bytes::Bytes) {
        let state = self.state.lock().unwrap();
        (state.0, bytes::Bytes::from(state.1.clone()))
    }

    fn restore(&self, _subgroup: SubgroupId, version: Version, bytes: &[u8]) {
        *self.state.lock().unwrap() = (version, bytes.to_vec());
    }
}

/// A node whose stability callback applies payloads to a [`BlobStore`].
fn stateful_member(
    hub: &Arc<MemoryHub>,
    id: u32,
    initial: &[(NodeId, MemberAddr)],
    membership: MembershipFn,
) -> (Node, Arc<BlobStore>) {
    let store = BlobStore::new();
    let transport = hub.register(NodeId::new(id));
    let delivered: DeliveryLog = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&delivered);
    let apply_store = Arc::clone(&store);
    let vm = ViewManager::start(
        test_config(id),
        membership,
        initial.to_vec(),
        Arc::new(transport.clone()),
        Some(Arc::new(move |_g, sender, index, payload: &[u8], version| {
            apply_store.apply(payload, version);
            log.lock()
                .unwrap()
                .push((sender, index, payload.to_vec(), version));
        })),
        None,
        Some(store.clone() as Arc<dyn StateTransfer>),
        Vec::new(),
    )
    .expect("founding member must start");
    (
        Node {
            vm,
            transport,
            delivered,
        },
        store,
    )
}

#[test]
fn joiner_is_installed_into_the_next_view() {
    let hub = MemoryHub::new();
    let membership = all_senders_membership(1, DeliveryMode::Ordered);
    let initial: Vec<(NodeId, MemberAddr)> =
        (0..3).map(|i| (NodeId::new(i), addr_of(i))).collect();
    let mut nodes = Vec::new();
    let mut stores = Vec::new();
    for id in 0..3 {
        let (node, store) = stateful_member(&hub, id, &initial, Arc::clone(&membership));
        nodes.push(node);
        stores.push(store);
    }
    let refs: Vec<&Node> = nodes.iter().collect();

    // Build up some replicated state: versions 0..=2 delivered everywhere.
    for (i, node) in nodes.iter().enumerate() {
        assert!(node
            .vm
            .engine()
            .unwrap()
            .send(G0, 1, move |buf| buf[0] = b'a' + i as u8, false)
            .unwrap());
    }
    tick_all(&refs, 5);
    assert_eq!(stores[0].snapshot().0, Version::new(2));
    let installed_before = nodes[0].vm.sst().unwrap().read_local_row().num_installed;

    // Node 3 joins through the leader (node 0).
    let joiner_store = BlobStore::new();
    let joiner_transport = hub.register(NodeId::new(3));
    let joiner_log: DeliveryLog = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&joiner_log);
    let apply_store = Arc::clone(&joiner_store);
    let joiner_vm = ViewManager::join(
        test_config(3),
        Arc::clone(&membership),
        Arc::new(joiner_transport.clone()),
        NodeId::new(0),
        Some(Arc::new(move |_g, sender, index, payload: &[u8], version| {
            apply_store.apply(payload, version);
            log.lock()
                .unwrap()
                .push((sender, index, payload.to_vec(), version));
        })),
        None,
        Some(joiner_store.clone() as Arc<dyn StateTransfer>),
        Vec::new(),
    )
    .unwrap();
    let joiner = Node {
        vm: joiner_vm,
        transport: joiner_transport,
        delivered: joiner_log,
    };

    let everyone: Vec<&Node> = nodes.iter().chain(std::iter::once(&joiner)).collect();
    tick_all(&everyone, 12);

    assert!(joiner.vm.is_joined(), "joiner must reach the installed view");
    for node in &everyone {
        let view = node.vm.current_view().unwrap();
        assert_eq!(view.vid, ViewId::new(1));
        assert_eq!(
            view.members,
            vec![NodeId::new(0), NodeId::new(1), NodeId::new(2), NodeId::new(3)]
        );
    }
    // Exactly one change was installed.
    let installed_after = nodes[0].vm.sst().unwrap().read_local_row().num_installed;
    assert_eq!(installed_after, installed_before + 1);

    // The joiner restored the shard leader's state byte-for-byte and resumes
    // version assignment after it.
    let (version, bytes) = joiner_store.snapshot();
    assert_eq!(version, Version::new(2));
    assert_eq!(bytes, stores[0].snapshot().1);
    assert_eq!(
        joiner.vm.engine().unwrap().delivered_version(G0),
        Version::new(2)
    );

    // The grown group still multicasts, with versions continuing at 3.
    for node in &everyone {
        assert!(node
            .vm
            .engine()
            .unwrap()
            .send(G0, 1, |buf| buf[0] = b'z', false)
            .unwrap());
    }
    tick_all(&everyone, 6);
    let log = joiner.delivered.lock().unwrap();
    assert_eq!(log.len(), 4);
    assert_eq!(log[0].3, Version::new(3));
}

// ============================================================================
// Failure and ragged trim
// ============================================================================

#[test]
fn survivors_install_a_trimmed_view_after_a_crash() {
    let hub = MemoryHub::new();
    let nodes = founding_cluster(&hub, 4, all_senders_membership(1, DeliveryMode::Ordered), None);
    let refs: Vec<&Node> = nodes.iter().collect();

    // Everyone sends a burst; give it a few rounds to spread but not drain.
    for round in 0..3u8 {
        for node in &nodes {
            assert!(node
                .vm
                .engine()
                .unwrap()
                .send(G0, 1, move |buf| buf[0] = round, false)
                .unwrap());
        }
        tick_all(&refs, 2);
    }

    // Node 2 crashes; the survivors notice.
    hub.kill(NodeId::new(2));
    let survivors = [&nodes[0], &nodes[1], &nodes[3]];
    for node in &survivors {
        node.vm.report_failure(NodeId::new(2)).unwrap();
    }
    tick_all(&survivors, 15);

    for node in &survivors {
        let view = node.vm.current_view().unwrap();
        assert_eq!(view.vid, ViewId::new(1), "survivors must install the next view");
        assert_eq!(
            view.members,
            vec![NodeId::new(0), NodeId::new(1), NodeId::new(3)]
        );
        assert_eq!(view.departed, vec![NodeId::new(2)]);
    }

    // Ragged-trim consistency: all survivors delivered the identical
    // sequence before entering the new view.
    let reference = survivors[0].delivered.lock().unwrap().clone();
    for node in &survivors[1..] {
        assert_eq!(*node.delivered.lock().unwrap(), reference);
    }

    // Sending resumes in the new three-member view.
    let before = reference.len();
    for node in &survivors {
        assert!(node
            .vm
            .engine()
            .unwrap()
            .send(G0, 1, |buf| buf[0] = 99, false)
            .unwrap());
    }
    tick_all(&survivors, 6);
    assert_eq!(
        survivors[0].delivered.lock().unwrap().len(),
        before + 3,
        "the new view's round-robin covers the three survivors"
    );
}

#[test]
fn delivered_counts_match_the_published_caps() {
    let hub = MemoryHub::new();
    let nodes = founding_cluster(&hub, 4, all_senders_membership(1, DeliveryMode::Ordered), None);
    let refs: Vec<&Node> = nodes.iter().collect();

    for _ in 0..2u8 {
        for node in &nodes {
            assert!(node
                .vm
                .engine()
                .unwrap()
                .send(G0, 1, |buf| buf[0] = 5, false)
                .unwrap());
        }
    }
    tick_all(&refs, 3);

    hub.kill(NodeId::new(2));
    let survivors = [&nodes[0], &nodes[1], &nodes[3]];
    survivors[0].vm.report_failure(NodeId::new(2)).unwrap();
    tick_all(&survivors, 15);

    // Per-sender delivered counts equal the leader's published caps.
    let reference = survivors[0].delivered.lock().unwrap().clone();
    for sender_rank in 0..4u32 {
        let count = reference
            .iter()
            .filter(|(sender, ..)| sender.as_u32() == sender_rank)
            .count();
        assert_eq!(count, 2, "sender {sender_rank} delivered through the cap");
    }
}

// ============================================================================
// Graceful leave
// ============================================================================

#[test]
fn leave_runs_one_final_view_change() {
    let hub = MemoryHub::new();
    let nodes = founding_cluster(&hub, 3, all_senders_membership(1, DeliveryMode::Ordered), None);
    let refs: Vec<&Node> = nodes.iter().collect();
    tick_all(&refs, 3);

    nodes[2].vm.leave().unwrap();
    tick_all(&refs, 15);

    for node in &nodes[..2] {
        let view = node.vm.current_view().unwrap();
        assert_eq!(view.vid, ViewId::new(1));
        assert_eq!(view.members, vec![NodeId::new(0), NodeId::new(1)]);
        assert_eq!(view.departed, vec![NodeId::new(2)]);
    }
    assert!(nodes[2].vm.is_shut_down(), "the leaver retires after the install");
}

// ============================================================================
// Provisioning and partitioning safety
// ============================================================================

#[test]
fn inadequate_layout_abandons_the_install() {
    let hub = MemoryHub::new();
    // The membership function refuses layouts under 4 members.
    let nodes = founding_cluster(&hub, 4, all_senders_membership(4, DeliveryMode::Ordered), None);
    let refs: Vec<&Node> = nodes.iter().collect();
    tick_all(&refs, 3);

    hub.kill(NodeId::new(3));
    let survivors = [&nodes[0], &nodes[1], &nodes[2]];
    survivors[0].vm.report_failure(NodeId::new(3)).unwrap();
    tick_all(&survivors, 15);

    // Members remain in the previous view.
    for node in &survivors {
        assert_eq!(node.vid(), Some(ViewId::INITIAL));
        assert!(!node.vm.is_partitioned());
    }
}

#[test]
fn minority_views_are_refused() {
    let hub = MemoryHub::new();
    let nodes = founding_cluster(&hub, 4, all_senders_membership(1, DeliveryMode::Ordered), None);
    let refs: Vec<&Node> = nodes.iter().collect();
    tick_all(&refs, 3);

    // Three of four members die: one survivor is below the majority of 3.
    for dead in [1u32, 2, 3] {
        hub.kill(NodeId::new(dead));
    }
    for dead in [1u32, 2, 3] {
        nodes[0].vm.report_failure(NodeId::new(dead)).unwrap();
    }
    tick_all(&[&nodes[0]], 15);

    assert!(nodes[0].vm.is_partitioned());
    assert_eq!(nodes[0].vid(), Some(ViewId::INITIAL));
}

#[test]
fn joiner_contacting_a_follower_is_rejected() {
    let hub = MemoryHub::new();
    let nodes = founding_cluster(&hub, 3, all_senders_membership(1, DeliveryMode::Ordered), None);
    let refs: Vec<&Node> = nodes.iter().collect();
    tick_all(&refs, 3);

    let joiner_transport = hub.register(NodeId::new(7));
    let joiner_vm = ViewManager::join(
        test_config(7),
        all_senders_membership(1, DeliveryMode::Ordered),
        Arc::new(joiner_transport.clone()),
        NodeId::new(1), // a follower, not the leader
        None,
        None,
        None,
        Vec::new(),
    )
    .unwrap();
    let joiner = Node {
        vm: joiner_vm,
        transport: joiner_transport,
        delivered: Arc::new(Mutex::new(Vec::new())),
    };
    let everyone: Vec<&Node> = nodes.iter().chain(std::iter::once(&joiner)).collect();
    tick_all(&everyone, 8);

    assert!(!joiner.vm.is_joined());
    assert!(joiner.vm.join_rejection().is_some());
}

// ============================================================================
// Invariants across a view change
// ============================================================================

#[test]
fn gms_counters_respect_their_ordering_invariant() {
    let hub = MemoryHub::new();
    let nodes = founding_cluster(&hub, 3, all_senders_membership(1, DeliveryMode::Ordered), None);
    let refs: Vec<&Node> = nodes.iter().collect();

    nodes[2].vm.leave().unwrap();
    for _ in 0..15 {
        tick_all(&refs, 1);
        for node in &nodes {
            let Some(sst) = node.vm.sst() else { continue };
            let row = sst.read_local_row();
            assert!(row.num_installed <= row.num_committed);
            assert!(row.num_committed <= row.num_changes);
        }
    }
}

mod properties {
    use super::*;
    use crate::View;
    use proptest::prelude::*;

    proptest! {
        /// Successor views keep survivors in rank order, append joiners at
        /// the tail, and bump the view ID by exactly one.
        #[test]
        fn successor_preserves_survivor_order(
            n in 2u32..8,
            depart_mask in proptest::collection::vec(proptest::bool::ANY, 8),
            num_joins in 0u32..3,
        ) {
            let members: Vec<NodeId> = (0..n).map(NodeId::new).collect();
            let addrs = vec![MemberAddr::default(); n as usize];
            let view = View::first(members.clone(), addrs);

            // Depart a strict subset so the view stays inhabited.
            let mut departed: Vec<NodeId> = members
                .iter()
                .zip(&depart_mask)
                .filter(|(_, gone)| **gone)
                .map(|(m, _)| *m)
                .collect();
            if departed.len() == members.len() {
                departed.pop();
            }
            let joins: Vec<(NodeId, MemberAddr)> = (0..num_joins)
                .map(|i| (NodeId::new(100 + i), MemberAddr::default()))
                .collect();

            let next = view.successor(departed.clone(), joins.clone());
            prop_assert_eq!(next.vid, view.vid.next());
            // Survivors keep their relative order.
            let survivors: Vec<NodeId> = members
                .iter()
                .copied()
                .filter(|m| !departed.contains(m))
                .collect();
            prop_assert_eq!(&next.members[..survivors.len()], &survivors[..]);
            // Joiners rank after every survivor, in request order.
            let tail: Vec<NodeId> = joins.iter().map(|(id, _)| *id).collect();
            prop_assert_eq!(&next.members[survivors.len()..], &tail[..]);
        }
    }
}

fn _assert_traits() {
    fn is_send_sync<T: Send + Sync>() {}
    is_send_sync::<ViewManager>();
    is_send_sync::<Arc<dyn Transport>>();
}
