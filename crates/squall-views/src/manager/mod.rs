//! The view manager.
//!
//! Drives membership through a sequence of installed views. All protocol
//! steps run as SST predicates on the predicate thread; the states of the
//! view-change machine (steady, proposed, committed, wedged, ragged,
//! installing) are tracked through the monotone GMS counters rather than an
//! explicit state enum, so a member can always re-derive where it stands
//! from the table alone.

mod install;
mod join;
mod predicates;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use bytes::Bytes;
use squall_config::SquallConfig;
use squall_multicast::{MulticastEngine, PersistenceManager};
use squall_sst::{Sst, Transport};
use squall_types::{
    ChangeProposal, Envelope, JoinerEntry, MemberAddr, MessageId, NodeId, SubgroupId, Version,
    WireKind,
};

use crate::{
    bootstrap::{GmsMessage, StateBlob, StateTransfer},
    build_settings, MembershipFn, View, ViewError, ViewResult,
};

/// Application callback invoked after each view install.
pub type ViewUpcall = Arc<dyn Fn(&View) + Send + Sync>;

/// The stability callback, shared so each view's engine can be rebuilt
/// around it: `(subgroup, sender, per-sender index, payload, version)`.
pub type StabilityCallback =
    Arc<dyn Fn(SubgroupId, NodeId, MessageId, &[u8], Version) + Send + Sync>;

/// GMS counter baseline a joiner seeds its first row from.
pub(crate) struct JoinBaseline {
    pub num_changes: u32,
    pub num_committed: u32,
    pub num_installed: u32,
    pub pending: Vec<(ChangeProposal, JoinerEntry)>,
}

/// State while negotiating membership with the contact leader.
pub(crate) struct JoiningState {
    pub contact: NodeId,
    pub prospective: Option<(View, JoinBaseline, u32)>,
    pub blobs: Vec<StateBlob>,
    pub rejected: Option<String>,
}

/// State while an installed view is live.
pub(crate) struct ActiveState {
    pub view: Arc<View>,
    pub sst: Arc<Sst>,
    pub engine: Arc<MulticastEngine>,
    /// Suspicions already acted on, latched per rank.
    pub handled_suspicions: Vec<bool>,
    /// Graceful-exit flags already turned into proposals.
    pub handled_rips: Vec<bool>,
    /// Whether this node held leadership at the last sweep; a false→true
    /// transition triggers the end-of-view marking.
    pub i_was_leader: bool,
    /// Join requests accepted but not yet proposed (leader only).
    pub pending_join_requests: VecDeque<(NodeId, MemberAddr)>,
    /// Last observed heartbeat value and when it last advanced, per rank.
    pub heartbeat_seen: Vec<(u64, Instant)>,
    /// Whether this node has published its shard trims for the in-progress
    /// view change.
    pub trim_published: bool,
    /// Commit level of the last abandoned install attempt; a new attempt
    /// waits for the commit counter to pass it.
    pub last_failed_install_committed: Option<u32>,
    /// Set once the install sequence has started, cleared per view.
    pub installing: bool,
}

impl ActiveState {
    fn new(view: Arc<View>, sst: Arc<Sst>, engine: Arc<MulticastEngine>) -> Self {
        let n = view.num_members();
        Self {
            view,
            sst,
            engine,
            handled_suspicions: vec![false; n],
            handled_rips: vec![false; n],
            i_was_leader: false,
            pending_join_requests: VecDeque::new(),
            heartbeat_seen: vec![(0, Instant::now()); n],
            trim_published: false,
            last_failed_install_committed: None,
            installing: false,
        }
    }
}

pub(crate) enum VmState {
    Joining(JoiningState),
    Active(ActiveState),
}

/// Failure suspicion, view-change choreography, and joiner bootstrap.
pub struct ViewManager {
    pub(crate) config: SquallConfig,
    pub(crate) membership: MembershipFn,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) me: NodeId,
    pub(crate) stability: Option<StabilityCallback>,
    pub(crate) persistence: Option<Arc<dyn PersistenceManager>>,
    pub(crate) state_transfer: Option<Arc<dyn StateTransfer>>,
    pub(crate) view_upcalls: Vec<ViewUpcall>,
    pub(crate) inner: Mutex<VmState>,
    /// Set when this node observes itself suspected: the group has moved on
    /// without it and no further progress is possible here.
    pub(crate) ejected: AtomicBool,
    /// Set when a change would shrink the view below a majority of its
    /// predecessor and partitioning safety is enabled.
    pub(crate) partitioned: AtomicBool,
    pub(crate) shutdown: AtomicBool,
}

impl ViewManager {
    /// Starts a founding member: the initial membership is known up front
    /// and every founder constructs the identical first view.
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        config: SquallConfig,
        membership: MembershipFn,
        initial_members: Vec<(NodeId, MemberAddr)>,
        transport: Arc<dyn Transport>,
        stability: Option<StabilityCallback>,
        persistence: Option<Arc<dyn PersistenceManager>>,
        state_transfer: Option<Arc<dyn StateTransfer>>,
        view_upcalls: Vec<ViewUpcall>,
    ) -> ViewResult<Arc<Self>> {
        let me = NodeId::new(config.group.local_id);
        let (members, addrs): (Vec<NodeId>, Vec<MemberAddr>) =
            initial_members.into_iter().unzip();
        let mut view = View::first(members, addrs);
        if !view.localize(me) {
            return Err(ViewError::JoinRejected(format!(
                "node {me} is not in the initial membership"
            )));
        }
        view.subgroup_layout = (*membership)(None, &mut view)?;

        let manager = Arc::new(Self {
            config,
            membership,
            transport,
            me,
            stability,
            persistence,
            state_transfer,
            view_upcalls,
            // Placeholder; replaced by activate() below.
            inner: Mutex::new(VmState::Joining(JoiningState {
                contact: me,
                prospective: None,
                blobs: Vec::new(),
                rejected: None,
            })),
            ejected: AtomicBool::new(false),
            partitioned: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        });
        manager.activate(view, None, Vec::new())?;
        Ok(manager)
    }

    /// Materializes an installed view: builds its SST and engine, seeds the
    /// local row, and registers all predicates. `baseline` carries a
    /// joiner's GMS counters; founding members start from zero.
    pub(crate) fn activate(
        self: &Arc<Self>,
        view: View,
        baseline: Option<JoinBaseline>,
        initial_versions: Vec<(SubgroupId, Version)>,
    ) -> ViewResult<()> {
        let view = Arc::new(view);
        let my_rank = view.my_rank.expect("activate requires membership");
        let (layout, settings) = build_settings(&view, self.me, &self.config);
        let sst = Arc::new(Sst::new(
            view.vid,
            view.members.clone(),
            my_rank,
            layout,
            Arc::clone(&self.transport),
        ));
        if let Some(baseline) = &baseline {
            sst.edit_local_row(|row| {
                row.num_changes = baseline.num_changes;
                row.num_committed = baseline.num_committed;
                row.num_acked = baseline.num_changes;
                row.num_installed = baseline.num_installed;
                for (slot, (change, joiner)) in baseline.pending.iter().enumerate() {
                    row.changes[slot] = *change;
                    row.joiners[slot] = *joiner;
                }
            });
        }

        let callbacks = self.build_engine_callbacks();
        let engine = MulticastEngine::new(
            Arc::clone(&sst),
            settings,
            view.subgroup_layout.len(),
            callbacks,
            self.persistence.clone(),
            self.config.info.clone(),
            view.failed.clone(),
            initial_versions.into_iter().collect(),
        );

        self.register_gms_predicates(&sst);
        sst.push_row()?;
        sst.barrier()?;

        let mut inner = self.inner.lock().unwrap();
        *inner = VmState::Active(ActiveState::new(Arc::clone(&view), sst, engine));
        drop(inner);

        tracing::info!(
            vid = %view.vid,
            members = ?view.members,
            my_rank,
            "view installed"
        );
        for upcall in &self.view_upcalls {
            (**upcall)(&view);
        }
        Ok(())
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn my_id(&self) -> NodeId {
        self.me
    }

    pub fn is_joined(&self) -> bool {
        matches!(&*self.inner.lock().unwrap(), VmState::Active(_))
    }

    pub fn current_view(&self) -> Option<Arc<View>> {
        match &*self.inner.lock().unwrap() {
            VmState::Active(active) => Some(Arc::clone(&active.view)),
            VmState::Joining(_) => None,
        }
    }

    pub fn engine(&self) -> ViewResult<Arc<MulticastEngine>> {
        match &*self.inner.lock().unwrap() {
            VmState::Active(active) => Ok(Arc::clone(&active.engine)),
            VmState::Joining(_) => Err(ViewError::NotJoined),
        }
    }

    pub fn sst(&self) -> Option<Arc<Sst>> {
        match &*self.inner.lock().unwrap() {
            VmState::Active(active) => Some(Arc::clone(&active.sst)),
            VmState::Joining(_) => None,
        }
    }

    pub fn is_ejected(&self) -> bool {
        self.ejected.load(Ordering::Acquire)
    }

    pub fn is_partitioned(&self) -> bool {
        self.partitioned.load(Ordering::Acquire)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Why joining failed, if the contact rejected us.
    pub fn join_rejection(&self) -> Option<String> {
        match &*self.inner.lock().unwrap() {
            VmState::Joining(j) => j.rejected.clone(),
            VmState::Active(_) => None,
        }
    }

    // ========================================================================
    // Application-driven membership events
    // ========================================================================

    /// Marks a peer suspected in the local row, as if the failure detector
    /// had fired for it.
    pub fn report_failure(&self, node: NodeId) -> ViewResult<()> {
        let sst = self.sst().ok_or(ViewError::NotJoined)?;
        let Some(rank) = sst.rank_of(node) else {
            return Ok(());
        };
        tracing::warn!(node = %node, rank, "failure reported");
        sst.edit_local_row(|row| row.suspected[rank] = true);
        sst.push_row_except_slots()?;
        Ok(())
    }

    /// Graceful exit: raises `rip` so peers run one final view change that
    /// removes this node without suspecting it.
    pub fn leave(&self) -> ViewResult<()> {
        let sst = self.sst().ok_or(ViewError::NotJoined)?;
        tracing::info!("leaving the group");
        sst.edit_local_row(|row| row.rip = true);
        sst.push_row_except_slots()?;
        Ok(())
    }

    pub fn barrier_sync(&self) -> ViewResult<()> {
        let sst = self.sst().ok_or(ViewError::NotJoined)?;
        sst.barrier()?;
        Ok(())
    }

    pub fn shut_down(&self) {
        self.shutdown.store(true, Ordering::Release);
        if let VmState::Active(active) = &*self.inner.lock().unwrap() {
            active.engine.shut_down();
            active.sst.shut_down();
        }
    }

    // ========================================================================
    // Wire helpers
    // ========================================================================

    pub(crate) fn send_gms(&self, to: NodeId, msg: &GmsMessage) -> ViewResult<()> {
        let env = Envelope::new(
            self.me,
            WireKind::Gms,
            Bytes::from(postcard::to_allocvec(msg)?),
        );
        self.transport
            .send_to(to, Bytes::from(postcard::to_allocvec(&env)?))?;
        Ok(())
    }

    pub(crate) fn send_blob(&self, to: NodeId, blob: &StateBlob) -> ViewResult<()> {
        let env = Envelope::new(
            self.me,
            WireKind::StateTransfer,
            Bytes::from(postcard::to_allocvec(blob)?),
        );
        self.transport
            .send_to(to, Bytes::from(postcard::to_allocvec(&env)?))?;
        Ok(())
    }
}
