//! The group façade.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use squall_config::SquallConfig;
use squall_multicast::{MulticastEngine, PersistenceManager};
use squall_sst::Transport;
use squall_types::{Envelope, MemberAddr, NodeId, SubgroupId, Timestamp, WireKind};
use squall_views::{MembershipFn, StabilityCallback, StateTransfer, ViewManager, ViewUpcall};

use crate::p2p::{P2pEndpoint, P2pHandler};
use crate::replicated::{PeerCaller, Replicated, ReplicatedObject, TypeTag};
use crate::{GroupError, GroupResult};

/// Everything the application hooks into the group.
#[derive(Default)]
pub struct GroupCallbacks {
    /// Ordered-delivery callback. Runs on the predicate thread and must not
    /// block; hand real work to a worker.
    pub stability: Option<StabilityCallback>,
    /// Persistence collaborator for durable subgroups.
    pub persistence: Option<Arc<dyn PersistenceManager>>,
    /// Capture/restore of replicated state for joiners.
    pub state_transfer: Option<Arc<dyn StateTransfer>>,
    /// Handler for p2p requests from non-members.
    pub p2p_handler: Option<P2pHandler>,
    /// Invoked after every view install.
    pub view_upcalls: Vec<ViewUpcall>,
}

/// A node's membership in a squall group.
///
/// Drives three loops: the predicate thread (delivery, view changes,
/// persistence frontiers), the sender thread (block-plane transfers), and
/// the timeout thread (heartbeats and null injection). Deterministic tests
/// skip the threads and call [`Group::tick`] directly.
pub struct Group {
    config: SquallConfig,
    vm: Arc<ViewManager>,
    transport: Arc<dyn Transport>,
    p2p: P2pEndpoint,
    registry: Mutex<BTreeMap<(TypeTag, u32), SubgroupId>>,
    threads: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl Group {
    /// Starts a founding member with a known initial membership.
    pub fn new(
        config: SquallConfig,
        membership: MembershipFn,
        initial_members: Vec<(NodeId, MemberAddr)>,
        transport: Arc<dyn Transport>,
        callbacks: GroupCallbacks,
    ) -> GroupResult<Self> {
        config.validate()?;
        let vm = ViewManager::start(
            config.clone(),
            membership,
            initial_members,
            Arc::clone(&transport),
            callbacks.stability,
            callbacks.persistence,
            callbacks.state_transfer,
            callbacks.view_upcalls,
        )?;
        Ok(Self::assemble(config, vm, transport, callbacks.p2p_handler))
    }

    /// Joins a running group through its contact leader. The group becomes
    /// usable once [`Group::is_joined`] turns true (drive [`Group::tick`] or
    /// start the threads).
    pub fn join(
        config: SquallConfig,
        membership: MembershipFn,
        transport: Arc<dyn Transport>,
        contact: NodeId,
        callbacks: GroupCallbacks,
    ) -> GroupResult<Self> {
        config.validate()?;
        let vm = ViewManager::join(
            config.clone(),
            membership,
            Arc::clone(&transport),
            contact,
            callbacks.stability,
            callbacks.persistence,
            callbacks.state_transfer,
            callbacks.view_upcalls,
        )?;
        Ok(Self::assemble(config, vm, transport, callbacks.p2p_handler))
    }

    fn assemble(
        config: SquallConfig,
        vm: Arc<ViewManager>,
        transport: Arc<dyn Transport>,
        p2p_handler: Option<P2pHandler>,
    ) -> Self {
        let p2p = P2pEndpoint::new(
            vm.my_id(),
            config.p2p.clone(),
            Arc::clone(&transport),
            p2p_handler,
        );
        Self {
            config,
            vm,
            transport,
            p2p,
            registry: Mutex::new(BTreeMap::new()),
            threads: Mutex::new(Vec::new()),
        }
    }

    // ========================================================================
    // Registry
    // ========================================================================

    /// Binds subgroup `subgroup_index` of type `T` to a subgroup ID assigned
    /// by the membership function.
    pub fn register_subgroup<T: ReplicatedObject>(
        &self,
        subgroup_index: u32,
        subgroup: SubgroupId,
    ) {
        self.registry
            .lock()
            .unwrap()
            .insert((T::type_tag(), subgroup_index), subgroup);
    }

    fn lookup<T: ReplicatedObject>(&self, subgroup_index: u32) -> GroupResult<SubgroupId> {
        self.registry
            .lock()
            .unwrap()
            .get(&(T::type_tag(), subgroup_index))
            .copied()
            .ok_or(GroupError::UnknownSubgroup)
    }

    /// Typed handle to a subgroup this node replicates.
    pub fn get_subgroup<T: ReplicatedObject>(
        &self,
        subgroup_index: u32,
    ) -> GroupResult<Replicated<'_, T>> {
        let subgroup = self.lookup::<T>(subgroup_index)?;
        if !self.engine()?.settings().contains_key(&subgroup) {
            return Err(GroupError::NotASubgroupMember);
        }
        Ok(Replicated {
            group: self,
            subgroup,
            _marker: std::marker::PhantomData,
        })
    }

    /// Members of every shard of the subgroup, by shard number.
    pub fn get_subgroup_members<T: ReplicatedObject>(
        &self,
        subgroup_index: u32,
    ) -> GroupResult<Vec<Vec<NodeId>>> {
        let subgroup = self.lookup::<T>(subgroup_index)?;
        let view = self
            .current_view()
            .ok_or(GroupError::View(squall_views::ViewError::NotJoined))?;
        let shards = view
            .subgroup_layout
            .get(subgroup.as_usize())
            .ok_or(GroupError::UnknownSubgroup)?;
        Ok(shards.iter().map(|shard| shard.members.clone()).collect())
    }

    /// Number of shards the membership function assigned to the subgroup.
    pub fn get_number_of_shards<T: ReplicatedObject>(
        &self,
        subgroup_index: u32,
    ) -> GroupResult<usize> {
        Ok(self.get_subgroup_members::<T>(subgroup_index)?.len())
    }

    /// Request/reply access to a subgroup this node does not replicate.
    pub fn get_nonmember_subgroup<T: ReplicatedObject>(
        &self,
        subgroup_index: u32,
    ) -> GroupResult<PeerCaller<'_, T>> {
        let subgroup = self.lookup::<T>(subgroup_index)?;
        Ok(PeerCaller {
            group: self,
            subgroup,
            _marker: std::marker::PhantomData,
        })
    }

    // ========================================================================
    // Core operations
    // ========================================================================

    /// The current view's multicast engine. The engine is replaced at every
    /// view install, so callers should not cache it across view changes.
    pub fn engine(&self) -> GroupResult<Arc<MulticastEngine>> {
        self.check_health()?;
        Ok(self.vm.engine()?)
    }

    pub(crate) fn p2p(&self) -> &P2pEndpoint {
        &self.p2p
    }

    fn check_health(&self) -> GroupResult<()> {
        if self.vm.is_ejected() {
            return Err(GroupError::Ejected);
        }
        if self.vm.is_partitioned() {
            return Err(GroupError::Partitioned);
        }
        if self.vm.is_shut_down() {
            return Err(GroupError::ShuttingDown);
        }
        Ok(())
    }

    pub(crate) fn send(
        &self,
        subgroup: SubgroupId,
        payload_size: usize,
        fill: impl FnOnce(&mut [u8]),
        cooked: bool,
    ) -> GroupResult<bool> {
        Ok(self.engine()?.send(subgroup, payload_size, fill, cooked)?)
    }

    pub fn get_my_id(&self) -> NodeId {
        self.vm.my_id()
    }

    /// This node's rank in the current view, or `None` before joining.
    pub fn get_my_rank(&self) -> Option<usize> {
        self.vm.current_view().and_then(|v| v.my_rank)
    }

    pub fn get_members(&self) -> Vec<NodeId> {
        self.vm
            .current_view()
            .map(|v| v.members.clone())
            .unwrap_or_default()
    }

    pub fn current_view(&self) -> Option<Arc<squall_views::View>> {
        self.vm.current_view()
    }

    pub fn is_joined(&self) -> bool {
        self.vm.is_joined()
    }

    pub fn join_rejection(&self) -> Option<String> {
        self.vm.join_rejection()
    }

    /// Marks a peer failed, as if the failure detector had fired.
    pub fn report_failure(&self, node: NodeId) -> GroupResult<()> {
        self.vm.report_failure(node)?;
        Ok(())
    }

    /// Leaves the group. A graceful leave announces itself and participates
    /// in one final view change; otherwise the node just stops, and peers
    /// discover the failure through suspicion.
    pub fn leave(&self, graceful: bool) -> GroupResult<()> {
        if graceful {
            self.vm.leave()?;
        } else {
            self.shut_down();
        }
        Ok(())
    }

    pub fn barrier_sync(&self) -> GroupResult<()> {
        self.vm.barrier_sync()?;
        Ok(())
    }

    pub fn config(&self) -> &SquallConfig {
        &self.config
    }

    // ========================================================================
    // Application-visible info fields
    // ========================================================================

    /// Publishes this node's load figure to the group (rate-limited push).
    pub fn set_load_info(&self, load: u64) -> GroupResult<()> {
        self.engine()?.set_load_info_entry(load);
        Ok(())
    }

    pub fn get_load_info(&self, node: NodeId) -> GroupResult<Option<u64>> {
        Ok(self.engine()?.get_load_info(node))
    }

    /// Publishes this node's cached-models bitmap to the group.
    pub fn set_cache_models_info(&self, cache_models: u64) -> GroupResult<()> {
        self.engine()?.set_cache_models_info_entry(cache_models);
        Ok(())
    }

    pub fn get_cache_models_info(&self, node: NodeId) -> GroupResult<Option<u64>> {
        Ok(self.engine()?.get_cache_models_info(node))
    }

    // ========================================================================
    // Progress
    // ========================================================================

    /// One deterministic step: route incoming point-to-point traffic, run a
    /// predicate sweep, and drive the sender state machines. Test harnesses
    /// call this directly; production nodes run [`Group::start_threads`].
    pub fn tick(&self) {
        while let Some(bytes) = self.transport.try_recv() {
            let Ok(env) = postcard::from_bytes::<Envelope>(&bytes) else {
                tracing::warn!("discarding undecodable envelope");
                continue;
            };
            self.route(&env);
        }
        if let Some(sst) = self.vm.sst() {
            sst.tick();
        }
        if let Ok(engine) = self.vm.engine() {
            engine.sender_sweep();
        }
    }

    fn route(&self, env: &Envelope) {
        let result: GroupResult<()> = match env.kind {
            WireKind::RdmcBlock => self
                .vm
                .engine()
                .map_err(GroupError::from)
                .and_then(|e| e.handle_envelope(env).map_err(GroupError::from)),
            WireKind::Gms | WireKind::StateTransfer => {
                self.vm.handle_envelope(env).map_err(GroupError::from)
            }
            WireKind::P2pRequest | WireKind::P2pReply | WireKind::RpcReply => {
                self.p2p.handle_envelope(env)
            }
        };
        if let Err(e) = result {
            tracing::warn!(from = %env.from, kind = ?env.kind, error = %e, "envelope dropped");
        }
    }

    /// Spawns the predicate, sender, and timeout threads. They re-resolve
    /// the current engine each sweep, so they survive view turnover.
    pub fn start_threads(self: &Arc<Self>) {
        let mut threads = self.threads.lock().unwrap();
        assert!(threads.is_empty(), "threads already started");

        let predicate = {
            let group = Arc::clone(self);
            std::thread::Builder::new()
                .name("squall-predicate".into())
                .spawn(move || {
                    while !group.vm.is_shut_down() {
                        group.tick();
                        std::thread::sleep(Duration::from_micros(50));
                    }
                })
                .expect("failed to spawn predicate thread")
        };
        let timeout = {
            let group = Arc::clone(self);
            std::thread::Builder::new()
                .name("squall-timeout".into())
                .spawn(move || {
                    while !group.vm.is_shut_down() {
                        if let Ok(engine) = group.vm.engine() {
                            engine.timeout_sweep(Timestamp::now());
                        }
                        std::thread::sleep(Duration::from_millis(1));
                    }
                })
                .expect("failed to spawn timeout thread")
        };
        threads.push(predicate);
        threads.push(timeout);
    }

    /// Stops all loops and joins the spawned threads.
    pub fn shut_down(&self) {
        self.vm.shut_down();
        let mut threads = self.threads.lock().unwrap();
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for Group {
    fn drop(&mut self) {
        self.vm.shut_down();
        if let Ok(mut threads) = self.threads.lock() {
            for handle in threads.drain(..) {
                let _ = handle.join();
            }
        }
    }
}
