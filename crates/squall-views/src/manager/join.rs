//! Joiner bootstrap: the joining side of the handshake and the leader's
//! handling of join requests.

use std::sync::Arc;

use squall_multicast::PersistenceManager;
use squall_sst::Transport;
use squall_types::{Envelope, NodeId, SubgroupId, Version, WireKind};

use crate::{
    bootstrap::{GmsMessage, StateBlob, StateTransfer},
    MembershipFn, ViewResult,
};
use squall_config::SquallConfig;

use super::{
    JoinBaseline, JoiningState, StabilityCallback, ViewManager, ViewUpcall, VmState,
};

impl ViewManager {
    /// Starts a joining node: sends a join request to the contact leader and
    /// returns a manager that becomes active once the leader installs a view
    /// containing it and all state blobs have arrived.
    #[allow(clippy::too_many_arguments)]
    pub fn join(
        config: SquallConfig,
        membership: MembershipFn,
        transport: Arc<dyn Transport>,
        contact: NodeId,
        stability: Option<StabilityCallback>,
        persistence: Option<Arc<dyn PersistenceManager>>,
        state_transfer: Option<Arc<dyn StateTransfer>>,
        view_upcalls: Vec<ViewUpcall>,
    ) -> ViewResult<Arc<Self>> {
        let me = NodeId::new(config.group.local_id);
        let addr = config.local_addr()?;
        let manager = Arc::new(Self {
            config,
            membership,
            transport,
            me,
            stability,
            persistence,
            state_transfer,
            view_upcalls,
            inner: std::sync::Mutex::new(VmState::Joining(JoiningState {
                contact,
                prospective: None,
                blobs: Vec::new(),
                rejected: None,
            })),
            ejected: std::sync::atomic::AtomicBool::new(false),
            partitioned: std::sync::atomic::AtomicBool::new(false),
            shutdown: std::sync::atomic::AtomicBool::new(false),
        });
        manager.send_gms(contact, &GmsMessage::JoinRequest { node: me, addr })?;
        tracing::info!(contact = %contact, "join requested");
        Ok(manager)
    }

    // ========================================================================
    // Envelope dispatch
    // ========================================================================

    /// Routes GMS and state-transfer envelopes into the manager.
    pub fn handle_envelope(self: &Arc<Self>, envelope: &Envelope) -> ViewResult<()> {
        match envelope.kind {
            WireKind::Gms => {
                let msg: GmsMessage = postcard::from_bytes(&envelope.payload)?;
                self.handle_gms(envelope.from, msg)
            }
            WireKind::StateTransfer => {
                let blob: StateBlob = postcard::from_bytes(&envelope.payload)?;
                self.handle_state_blob(blob)
            }
            other => {
                tracing::warn!(kind = ?other, "envelope kind not for the view manager");
                Ok(())
            }
        }
    }

    fn handle_gms(self: &Arc<Self>, from: NodeId, msg: GmsMessage) -> ViewResult<()> {
        match msg {
            GmsMessage::JoinRequest { node, addr } => self.handle_join_request(node, addr),
            GmsMessage::JoinResponse {
                view,
                num_changes,
                num_committed,
                num_installed,
                pending,
                blobs,
                expected_extra_blobs,
            } => {
                let mut inner = self.inner.lock().unwrap();
                let VmState::Joining(joining) = &mut *inner else {
                    tracing::debug!(from = %from, "join response after activation, ignoring");
                    return Ok(());
                };
                let mut view = view;
                if !view.localize(self.me) {
                    joining.rejected =
                        Some("installed view does not include this node".to_string());
                    return Ok(());
                }
                joining.blobs.extend(blobs);
                joining.prospective = Some((
                    view,
                    JoinBaseline {
                        num_changes,
                        num_committed,
                        num_installed,
                        pending,
                    },
                    expected_extra_blobs,
                ));
                drop(inner);
                self.try_activate_joiner()
            }
            GmsMessage::JoinRejected { reason } => {
                tracing::error!(reason = %reason, "join rejected");
                if let VmState::Joining(joining) = &mut *self.inner.lock().unwrap() {
                    joining.rejected = Some(reason);
                }
                Ok(())
            }
        }
    }

    fn handle_state_blob(self: &Arc<Self>, blob: StateBlob) -> ViewResult<()> {
        {
            let mut inner = self.inner.lock().unwrap();
            match &mut *inner {
                VmState::Joining(joining) => joining.blobs.push(blob),
                VmState::Active(_) => {
                    tracing::debug!(subgroup = %blob.subgroup, "state blob after activation");
                    return Ok(());
                }
            }
        }
        self.try_activate_joiner()
    }

    /// Activates the joiner once the prospective view and every expected
    /// state blob have arrived.
    fn try_activate_joiner(self: &Arc<Self>) -> ViewResult<()> {
        let ready = {
            let mut inner = self.inner.lock().unwrap();
            let VmState::Joining(joining) = &mut *inner else {
                return Ok(());
            };
            let Some((_, _, expected)) = &joining.prospective else {
                return Ok(());
            };
            if (joining.blobs.len() as u32) < *expected {
                return Ok(());
            }
            let (view, baseline, _) = joining.prospective.take().expect("checked above");
            let blobs = std::mem::take(&mut joining.blobs);
            (view, baseline, blobs)
        };
        let (view, baseline, blobs) = ready;

        let mut initial_versions: Vec<(SubgroupId, Version)> = Vec::new();
        for blob in &blobs {
            if let Some(st) = &self.state_transfer {
                st.restore(blob.subgroup, blob.version, &blob.bytes);
            }
            initial_versions.push((blob.subgroup, blob.version));
        }
        tracing::info!(
            vid = %view.vid,
            blobs = blobs.len(),
            "join complete, activating"
        );
        self.activate(view, Some(baseline), initial_versions)
    }

    // ========================================================================
    // Leader side
    // ========================================================================

    fn handle_join_request(
        self: &Arc<Self>,
        node: NodeId,
        addr: squall_types::MemberAddr,
    ) -> ViewResult<()> {
        if self.is_partitioned() || self.is_ejected() {
            self.send_gms(
                node,
                &GmsMessage::JoinRejected {
                    reason: "group is not accepting members".to_string(),
                },
            )?;
            return Ok(());
        }
        let queued = self
            .with_active(|active| {
                let local = active.sst.read_local_row();
                if Self::leader_rank_of(&local) != active.sst.my_rank() {
                    return false;
                }
                if active.view.contains(node) {
                    tracing::warn!(node = %node, "join request from an existing member");
                    return false;
                }
                tracing::info!(node = %node, "join request accepted");
                active.pending_join_requests.push_back((node, addr));
                true
            })
            .unwrap_or(false);
        if !queued {
            self.send_gms(
                node,
                &GmsMessage::JoinRejected {
                    reason: "contact is not the group leader".to_string(),
                },
            )?;
        }
        Ok(())
    }
}
