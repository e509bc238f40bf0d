//! The replicated table.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use squall_types::{NodeId, Timestamp, ViewId};

use crate::{
    PredicateHandle, PredicateKind, Predicates, RowImage, SstError, SstLayout, SstResult, SstRow,
    Transport,
};

/// One view's shared state table.
///
/// Holds one row per member. The single-writer discipline is enforced by the
/// API: only [`Sst::edit_local_row`] mutates, and only the local row; remote
/// rows change exclusively through [`Sst::apply_row_image`] when a peer's
/// push arrives.
pub struct Sst {
    vid: ViewId,
    members: Vec<NodeId>,
    my_rank: usize,
    layout: SstLayout,
    rows: Vec<Mutex<SstRow>>,
    transport: Arc<dyn Transport>,
    predicates: Predicates,
    shutdown: AtomicBool,
}

impl Sst {
    pub fn new(
        vid: ViewId,
        members: Vec<NodeId>,
        my_rank: usize,
        layout: SstLayout,
        transport: Arc<dyn Transport>,
    ) -> Self {
        assert!(my_rank < members.len(), "my_rank out of range");
        assert_eq!(layout.num_members, members.len());
        let now = Timestamp::now();
        let rows = (0..members.len())
            .map(|_| {
                let mut row = SstRow::new(&layout, now);
                row.vid = vid.as_i32();
                Mutex::new(row)
            })
            .collect();
        Self {
            vid,
            members,
            my_rank,
            layout,
            rows,
            transport,
            predicates: Predicates::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn vid(&self) -> ViewId {
        self.vid
    }

    pub fn members(&self) -> &[NodeId] {
        &self.members
    }

    pub fn num_rows(&self) -> usize {
        self.members.len()
    }

    pub fn my_rank(&self) -> usize {
        self.my_rank
    }

    pub fn my_id(&self) -> NodeId {
        self.members[self.my_rank]
    }

    pub fn layout(&self) -> &SstLayout {
        &self.layout
    }

    pub fn rank_of(&self, node: NodeId) -> Option<usize> {
        self.members.iter().position(|m| *m == node)
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    // ========================================================================
    // Row access
    // ========================================================================

    /// Mutates the local row under its lock. The caller still owns pushing.
    pub fn edit_local_row<R>(&self, f: impl FnOnce(&mut SstRow) -> R) -> R {
        let mut row = self.rows[self.my_rank].lock().unwrap();
        f(&mut row)
    }

    /// Snapshot of one member's row. Predicates read each field from one
    /// snapshot at most once per evaluation, tolerating later fields being
    /// newer than earlier ones across snapshots.
    pub fn read_row(&self, rank: usize) -> SstRow {
        self.rows[rank].lock().unwrap().clone()
    }

    pub fn read_local_row(&self) -> SstRow {
        self.read_row(self.my_rank)
    }

    // ========================================================================
    // Push / apply
    // ========================================================================

    /// Broadcasts the full local row to every peer.
    pub fn push_row(&self) -> SstResult<()> {
        self.push_image(true)
    }

    /// Broadcasts the local row minus the SMC slot ring and index array.
    /// GMS traffic uses this to avoid re-shipping payload bytes; receivers
    /// keep their current slot contents.
    pub fn push_row_except_slots(&self) -> SstResult<()> {
        self.push_image(false)
    }

    fn push_image(&self, include_slots: bool) -> SstResult<()> {
        let mut row = self.read_local_row();
        if !include_slots {
            row.slots.clear();
            row.index.clear();
        }
        let image = RowImage {
            vid: self.vid,
            origin: self.my_id(),
            include_slots,
            row,
        };
        let bytes = Bytes::from(postcard::to_allocvec(&image)?);
        self.transport.push_row(bytes)?;
        Ok(())
    }

    /// Installs a received row image into the origin's row.
    ///
    /// Images from other views are stale and dropped; images from unknown
    /// origins are reported. A counter regression inside a current-view image
    /// is a broken safety contract and aborts the process.
    pub fn apply_row_image(&self, bytes: &[u8]) -> SstResult<()> {
        let image: RowImage = postcard::from_bytes(bytes)?;
        if image.vid != self.vid {
            tracing::trace!(
                image_vid = %image.vid,
                sst_vid = %self.vid,
                origin = %image.origin,
                "dropping stale row image"
            );
            return Ok(());
        }
        let Some(rank) = self.rank_of(image.origin) else {
            return Err(SstError::UnknownOrigin(image.origin));
        };
        if rank == self.my_rank {
            // Our own image echoed back; the local row is authoritative.
            return Ok(());
        }

        let mut incoming = image.row;
        let mut row = self.rows[rank].lock().unwrap();
        assert_row_monotone(&row, &incoming, image.origin);
        if !image.include_slots {
            incoming.slots = std::mem::take(&mut row.slots);
            incoming.index = std::mem::take(&mut row.index);
        }
        *row = incoming;
        Ok(())
    }

    /// Applies every row image waiting at the transport.
    pub fn drain_row_images(&self) {
        while let Some(bytes) = self.transport.try_recv_row() {
            if let Err(e) = self.apply_row_image(&bytes) {
                tracing::warn!(error = %e, "discarding undecodable row image");
            }
        }
    }

    // ========================================================================
    // Predicates
    // ========================================================================

    pub fn register_predicate(
        &self,
        name: &'static str,
        kind: PredicateKind,
        pred: impl FnMut(&Sst) -> bool + Send + 'static,
        handler: impl FnMut(&Sst) + Send + 'static,
    ) -> PredicateHandle {
        self.predicates.register(name, kind, pred, handler)
    }

    pub fn remove_predicate(&self, handle: PredicateHandle) {
        self.predicates.remove(handle)
    }

    pub fn predicates(&self) -> &Predicates {
        &self.predicates
    }

    /// One predicate-thread iteration: absorb incoming row images, then sweep
    /// the registry. Returns the number of handlers fired.
    pub fn tick(&self) -> usize {
        self.drain_row_images();
        self.predicates.sweep(self)
    }

    /// Starts the predicate thread: ticks until shutdown.
    pub fn spawn_predicate_thread(self: &Arc<Self>) -> std::thread::JoinHandle<()> {
        let sst = Arc::clone(self);
        std::thread::Builder::new()
            .name(format!("sst-pred-v{}", self.vid))
            .spawn(move || {
                while !sst.is_shut_down() {
                    if sst.tick() == 0 {
                        std::thread::sleep(Duration::from_micros(50));
                    }
                }
            })
            .expect("failed to spawn predicate thread")
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Synchronizes all members; used only at view-install boundaries.
    pub fn barrier(&self) -> SstResult<()> {
        self.transport.barrier()?;
        Ok(())
    }

    /// Stops the predicate thread at its next iteration and drops all
    /// registered predicates.
    pub fn shut_down(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.predicates.clear();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

/// Monotonicity is the SST's safety contract: within one view, counters only
/// grow and flags only set. A regression means a peer (or the transport)
/// violated the single-writer discipline, and no predicate result can be
/// trusted afterwards.
fn assert_row_monotone(old: &SstRow, new: &SstRow, origin: NodeId) {
    let ok = new.num_changes >= old.num_changes
        && new.num_committed >= old.num_committed
        && new.num_acked >= old.num_acked
        && new.num_installed >= old.num_installed
        && new.heartbeat >= old.heartbeat
        && (!old.wedged || new.wedged)
        && (!old.rip || new.rip)
        && monotone_i64(&old.seq_num, &new.seq_num)
        && monotone_i64(&old.delivered_num, &new.delivered_num)
        && monotone_i64(&old.num_received, &new.num_received)
        && monotone_i64(&old.persisted_num, &new.persisted_num)
        && monotone_i64(&old.signed_num, &new.signed_num)
        && monotone_i64(&old.verified_num, &new.verified_num);
    assert!(
        ok,
        "row regression from {origin}: old [{}] new [{}]",
        old.summary(),
        new.summary()
    );
}

fn monotone_i64(old: &[i64], new: &[i64]) -> bool {
    old.len() == new.len() && old.iter().zip(new).all(|(o, n)| n >= o)
}
