//! The multicast engine.
//!
//! One engine instance exists per installed view. It shares the view's SST
//! with the group-management service: senders advance `seq_num` /
//! `num_received` / slot fields in their own row, and delivery is triggered
//! by predicates observing the monotone minimum across the shard.
//!
//! All mutable engine state lives behind a single non-reentrant mutex; the
//! handlers it registers run on the SST's predicate thread, and the sender
//! and timeout threads enter through [`MulticastEngine::sender_sweep`] and
//! [`MulticastEngine::timeout_sweep`]. Delivery callbacks are invoked with
//! no engine lock held, so a callback may call back into `send`.

mod delivery;
mod receive;
mod send;
mod state;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use squall_config::InfoConfig;
use squall_sst::{PredicateKind, Sst};
use squall_types::{MessageId, NodeId, SubgroupId, Timestamp, Version};

use crate::{
    MulticastError, MulticastResult, PersistenceManager, SubgroupFrontier, SubgroupSettings,
};
use state::EngineState;

/// Callback invoked on every ordered delivery:
/// `(subgroup, sender, per-sender index, payload, version)`.
pub type StabilityFn = Box<dyn Fn(SubgroupId, NodeId, MessageId, &[u8], Version) + Send + Sync>;

/// Message-delivery hooks supplied by the application layer.
#[derive(Default)]
pub struct EngineCallbacks {
    pub stability: Option<StabilityFn>,
}

impl EngineCallbacks {
    pub fn with_stability(
        f: impl Fn(SubgroupId, NodeId, MessageId, &[u8], Version) + Send + Sync + 'static,
    ) -> Self {
        Self {
            stability: Some(Box::new(f)),
        }
    }
}

pub struct MulticastEngine {
    sst: Arc<Sst>,
    settings: BTreeMap<SubgroupId, SubgroupSettings>,
    callbacks: EngineCallbacks,
    persistence: Option<Arc<dyn PersistenceManager>>,
    /// One frontier per subgroup in the whole group, indexed by subgroup id.
    frontiers: Vec<SubgroupFrontier>,
    /// Members of this view that were already failed when it was installed.
    /// Their rows never advance, so stability minima skip them.
    already_failed: Vec<bool>,
    state: Mutex<EngineState>,
    wedged: AtomicBool,
    thread_shutdown: Arc<AtomicBool>,
    info: InfoConfig,
    load_info_dirty: AtomicBool,
    cache_info_dirty: AtomicBool,
    last_load_push_ns: AtomicU64,
    last_cache_push_ns: AtomicU64,
}

impl MulticastEngine {
    /// Builds the engine for a freshly installed view and registers its
    /// predicates on the view's SST.
    ///
    /// `initial_versions` preseeds per-subgroup version counters for members
    /// that received their state by transfer (joiners) or recovered from a
    /// log; the next assigned version follows the preseed.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sst: Arc<Sst>,
        settings: BTreeMap<SubgroupId, SubgroupSettings>,
        total_num_subgroups: usize,
        callbacks: EngineCallbacks,
        persistence: Option<Arc<dyn PersistenceManager>>,
        info: InfoConfig,
        already_failed: Vec<bool>,
        initial_versions: BTreeMap<SubgroupId, Version>,
    ) -> Arc<Self> {
        let state = EngineState::new(&settings, &initial_versions);
        let frontiers: Vec<SubgroupFrontier> = (0..total_num_subgroups)
            .map(|_| SubgroupFrontier::new())
            .collect();
        for (subgroup, version) in &initial_versions {
            frontiers[subgroup.as_usize()].note_delivered(*version);
        }
        let already_failed = if already_failed.is_empty() {
            vec![false; sst.num_rows()]
        } else {
            already_failed
        };
        assert_eq!(already_failed.len(), sst.num_rows());

        let engine = Arc::new(Self {
            sst,
            settings,
            callbacks,
            persistence,
            frontiers,
            already_failed,
            state: Mutex::new(state),
            wedged: AtomicBool::new(false),
            thread_shutdown: Arc::new(AtomicBool::new(false)),
            info,
            load_info_dirty: AtomicBool::new(false),
            cache_info_dirty: AtomicBool::new(false),
            last_load_push_ns: AtomicU64::new(0),
            last_cache_push_ns: AtomicU64::new(0),
        });
        engine.register_predicates();
        engine
    }

    pub fn sst(&self) -> &Arc<Sst> {
        &self.sst
    }

    pub fn settings(&self) -> &BTreeMap<SubgroupId, SubgroupSettings> {
        &self.settings
    }

    pub fn is_wedged(&self) -> bool {
        self.wedged.load(Ordering::Acquire)
    }

    fn subgroup(&self, subgroup: SubgroupId) -> MulticastResult<&SubgroupSettings> {
        self.settings
            .get(&subgroup)
            .ok_or(MulticastError::NotAMember(subgroup))
    }

    // ========================================================================
    // Predicate registration
    // ========================================================================

    fn register_predicates(self: &Arc<Self>) {
        let subgroups: Vec<SubgroupId> = self.settings.keys().copied().collect();

        // Slot-plane receiver: one predicate polls every subgroup's sender
        // rows for freshly published slots.
        let weak = Arc::downgrade(self);
        self.sst.register_predicate(
            "smc_receiver",
            PredicateKind::Recurrent,
            {
                let weak = weak.clone();
                move |_| weak.upgrade().is_some_and(|e| e.smc_slots_available())
            },
            {
                let weak = weak.clone();
                move |_| {
                    if let Some(engine) = weak.upgrade() {
                        engine.smc_poll();
                    }
                }
            },
        );

        for subgroup in subgroups {
            let weak = Arc::downgrade(self);
            self.sst.register_predicate(
                "delivery",
                PredicateKind::Recurrent,
                {
                    let weak = weak.clone();
                    move |_| {
                        weak.upgrade()
                            .is_some_and(|e| e.delivery_ready(subgroup))
                    }
                },
                {
                    let weak = weak.clone();
                    move |_| {
                        if let Some(engine) = weak.upgrade() {
                            engine.delivery_trigger(subgroup);
                        }
                    }
                },
            );

            let weak = Arc::downgrade(self);
            self.sst.register_predicate(
                "min_persisted",
                PredicateKind::Recurrent,
                {
                    let weak = weak.clone();
                    move |_| {
                        weak.upgrade()
                            .is_some_and(|e| e.min_persisted_advanced(subgroup))
                    }
                },
                {
                    let weak = weak.clone();
                    move |_| {
                        if let Some(engine) = weak.upgrade() {
                            engine.update_min_persisted(subgroup);
                        }
                    }
                },
            );

            let weak = Arc::downgrade(self);
            self.sst.register_predicate(
                "min_verified",
                PredicateKind::Recurrent,
                {
                    let weak = weak.clone();
                    move |_| {
                        weak.upgrade()
                            .is_some_and(|e| e.min_verified_advanced(subgroup))
                    }
                },
                {
                    let weak = weak.clone();
                    move |_| {
                        if let Some(engine) = weak.upgrade() {
                            engine.update_min_verified(subgroup);
                        }
                    }
                },
            );
        }

        // Rate-limited pushes for the application-visible info fields.
        let weak = Arc::downgrade(self);
        self.sst.register_predicate(
            "info_push",
            PredicateKind::Recurrent,
            {
                let weak = weak.clone();
                move |_| weak.upgrade().is_some_and(|e| e.info_push_due())
            },
            move |_| {
                if let Some(engine) = weak.upgrade() {
                    engine.push_info_fields();
                }
            },
        );
    }

    // ========================================================================
    // Frontier queries
    // ========================================================================

    pub fn delivered_version(&self, subgroup: SubgroupId) -> Version {
        self.frontiers[subgroup.as_usize()].delivered()
    }

    /// The latest version persisted by every member of the local shard; a
    /// version at or below this survives a full shard restart.
    pub fn get_global_persistence_frontier(&self, subgroup: SubgroupId) -> Version {
        self.frontiers[subgroup.as_usize()].min_persisted()
    }

    pub fn get_global_verified_frontier(&self, subgroup: SubgroupId) -> Version {
        self.frontiers[subgroup.as_usize()].min_verified()
    }

    /// Blocks until the shard-wide persistence frontier reaches `version`.
    /// Returns false if `version` has not been delivered yet (the wait could
    /// never finish) or if the engine shuts down while waiting.
    pub fn wait_for_global_persistence_frontier(
        &self,
        subgroup: SubgroupId,
        version: Version,
    ) -> bool {
        self.frontiers[subgroup.as_usize()].wait_for_persisted(version, &self.thread_shutdown)
    }

    /// The oldest undelivered timestamp across the local shard, in
    /// wall-clock nanoseconds.
    pub fn compute_global_stability_frontier(&self, subgroup: SubgroupId) -> u64 {
        let Ok(s) = self.subgroup(subgroup) else {
            return 0;
        };
        let g = subgroup.as_usize();
        s.member_ranks
            .iter()
            .filter(|rank| !self.already_failed[**rank])
            .map(|rank| self.sst.read_row(*rank).local_stability_frontier[g])
            .min()
            .unwrap_or(0)
    }

    // ========================================================================
    // Persistence collaborator completions
    // ========================================================================

    /// Called by the persistence collaborator when `version` is locally
    /// durable.
    pub fn persistence_complete(&self, subgroup: SubgroupId, version: Version) {
        let g = subgroup.as_usize();
        self.sst.edit_local_row(|row| {
            row.persisted_num[g] = row.persisted_num[g].max(version.as_i64());
        });
        if let Err(e) = self.sst.push_row_except_slots() {
            tracing::warn!(error = %e, "failed to push persisted_num advance");
        }
    }

    /// Called when `version`'s log entry carries a local signature.
    pub fn signature_complete(&self, subgroup: SubgroupId, version: Version) {
        let g = subgroup.as_usize();
        self.sst.edit_local_row(|row| {
            row.signed_num[g] = row.signed_num[g].max(version.as_i64());
        });
        if let Err(e) = self.sst.push_row_except_slots() {
            tracing::warn!(error = %e, "failed to push signed_num advance");
        }
    }

    /// Called when every peer signature for `version` has been verified.
    pub fn verification_complete(&self, subgroup: SubgroupId, version: Version) {
        let g = subgroup.as_usize();
        self.sst.edit_local_row(|row| {
            row.verified_num[g] = row.verified_num[g].max(version.as_i64());
        });
        if let Err(e) = self.sst.push_row_except_slots() {
            tracing::warn!(error = %e, "failed to push verified_num advance");
        }
    }

    // ========================================================================
    // Application-visible info fields
    // ========================================================================

    pub fn set_load_info_entry(&self, load: u64) {
        self.sst.edit_local_row(|row| row.load_info = load);
        self.load_info_dirty.store(true, Ordering::Release);
    }

    pub fn get_load_info(&self, node: NodeId) -> Option<u64> {
        let rank = self.sst.rank_of(node)?;
        Some(self.sst.read_row(rank).load_info)
    }

    pub fn set_cache_models_info_entry(&self, cache_models: u64) {
        self.sst
            .edit_local_row(|row| row.cache_models_info = cache_models);
        self.cache_info_dirty.store(true, Ordering::Release);
    }

    pub fn get_cache_models_info(&self, node: NodeId) -> Option<u64> {
        let rank = self.sst.rank_of(node)?;
        Some(self.sst.read_row(rank).cache_models_info)
    }

    fn info_push_due(&self) -> bool {
        let now = Timestamp::now().as_nanos();
        let load_due = self.load_info_dirty.load(Ordering::Acquire)
            && now.saturating_sub(self.last_load_push_ns.load(Ordering::Acquire))
                >= self.info.load_info_rate_us * 1_000;
        let cache_due = self.cache_info_dirty.load(Ordering::Acquire)
            && now.saturating_sub(self.last_cache_push_ns.load(Ordering::Acquire))
                >= self.info.cache_info_rate_us * 1_000;
        load_due || cache_due
    }

    fn push_info_fields(&self) {
        let now = Timestamp::now().as_nanos();
        if self.load_info_dirty.swap(false, Ordering::AcqRel) {
            self.last_load_push_ns.store(now, Ordering::Release);
        }
        if self.cache_info_dirty.swap(false, Ordering::AcqRel) {
            self.last_cache_push_ns.store(now, Ordering::Release);
        }
        if let Err(e) = self.sst.push_row_except_slots() {
            tracing::warn!(error = %e, "failed to push info fields");
        }
    }

    // ========================================================================
    // Wedging and shutdown
    // ========================================================================

    /// Halts all sending in this engine in preparation for a view change (or
    /// shutdown). Receives continue to drain so the ragged trim can deliver
    /// the agreed prefix.
    pub fn wedge(&self) {
        if self.wedged.swap(true, Ordering::AcqRel) {
            return;
        }
        let dropped: usize = {
            let mut state = self.state.lock().unwrap();
            state
                .subgroups
                .values_mut()
                .map(|sub| {
                    let n = sub.pending_sends.len();
                    sub.pending_sends.clear();
                    n
                })
                .sum()
        };
        if dropped > 0 {
            tracing::warn!(dropped, "wedge dropped unsent messages");
        }
        self.sst.edit_local_row(|row| row.wedged = true);
        if let Err(e) = self.sst.push_row_except_slots() {
            tracing::warn!(error = %e, "failed to push wedged flag");
        }
        tracing::debug!("engine wedged");
    }

    /// Stops the sender and timeout loops at their next sweep and cancels
    /// outstanding frontier waiters.
    pub fn shut_down(&self) {
        self.thread_shutdown.store(true, Ordering::Release);
        for frontier in &self.frontiers {
            // Wake waiters so they observe the shutdown flag.
            frontier.raise_persisted(frontier.min_persisted());
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.thread_shutdown.load(Ordering::Acquire)
    }

    // ========================================================================
    // Threads
    // ========================================================================

    /// Starts the sender thread, which drives block-plane transfers.
    pub fn spawn_sender_thread(self: &Arc<Self>) -> std::thread::JoinHandle<()> {
        let engine = Arc::clone(self);
        std::thread::Builder::new()
            .name("mcast-sender".into())
            .spawn(move || {
                while !engine.is_shut_down() {
                    if engine.sender_sweep() == 0 {
                        std::thread::sleep(Duration::from_micros(100));
                    }
                }
            })
            .expect("failed to spawn sender thread")
    }

    /// Starts the timeout thread, which bumps the heartbeat, walks the
    /// stability frontier, and injects null messages for silent senders.
    pub fn spawn_timeout_thread(self: &Arc<Self>) -> std::thread::JoinHandle<()> {
        let engine = Arc::clone(self);
        std::thread::Builder::new()
            .name("mcast-timeout".into())
            .spawn(move || {
                while !engine.is_shut_down() {
                    engine.timeout_sweep(Timestamp::now());
                    std::thread::sleep(Duration::from_millis(1));
                }
            })
            .expect("failed to spawn timeout thread")
    }
}
