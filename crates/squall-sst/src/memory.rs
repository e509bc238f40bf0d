//! In-process transport.
//!
//! A [`MemoryHub`] connects the [`MemoryTransport`] endpoints of every node
//! in a test cluster. Row pushes follow one-sided-write semantics: the hub
//! keeps only the *latest* image per (destination, origin) pair, so an
//! unread image is silently overwritten exactly as a remote row write would
//! be. Point-to-point traffic is a bounded FIFO per destination.
//!
//! Nodes can be killed to model crashes: a dead node's sends and its inbound
//! traffic are dropped.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use crossbeam_queue::ArrayQueue;
use squall_types::NodeId;

use crate::{Transport, TransportError};

/// Capacity of each node's point-to-point inbox.
const P2P_INBOX_CAPACITY: usize = 65_536;

/// Row images are keyed per (origin, view): a newer push from the same
/// origin in the same view overwrites an unread one, exactly like a remote
/// write to the same row region, but each view's table is its own region, so
/// a push for a successor view never clobbers the origin's final image in
/// the previous one.
type RowKey = (NodeId, i32);

struct Endpoint {
    row_images: HashMap<RowKey, Bytes>,
    row_arrival: VecDeque<RowKey>,
    p2p: Arc<ArrayQueue<Bytes>>,
    alive: bool,
}

impl Endpoint {
    fn new() -> Self {
        Self {
            row_images: HashMap::new(),
            row_arrival: VecDeque::new(),
            p2p: Arc::new(ArrayQueue::new(P2P_INBOX_CAPACITY)),
            alive: true,
        }
    }
}

/// Reads the (view, origin) prefix of a serialized row image without
/// deserializing the whole row.
fn peek_row_key(bytes: &[u8]) -> Option<RowKey> {
    postcard::take_from_bytes::<(squall_types::ViewId, NodeId)>(bytes)
        .ok()
        .map(|((vid, origin), _)| (origin, vid.as_i32()))
}

/// Shared state of an in-process cluster's transport.
pub struct MemoryHub {
    inner: Mutex<HashMap<NodeId, Endpoint>>,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(HashMap::new()),
        })
    }

    /// Registers a node and returns its endpoint handle. Re-registering an
    /// existing node resets its queues (restart).
    pub fn register(self: &Arc<Self>, node: NodeId) -> MemoryTransport {
        let mut inner = self.inner.lock().unwrap();
        inner.insert(node, Endpoint::new());
        MemoryTransport {
            hub: Arc::clone(self),
            node,
        }
    }

    /// Marks a node crashed: inbound traffic to it and sends from it are
    /// dropped from now on.
    pub fn kill(&self, node: NodeId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(ep) = inner.get_mut(&node) {
            ep.alive = false;
            ep.row_images.clear();
            ep.row_arrival.clear();
        }
        tracing::debug!(node = %node, "transport endpoint killed");
    }

    pub fn is_alive(&self, node: NodeId) -> bool {
        self.inner
            .lock()
            .unwrap()
            .get(&node)
            .is_some_and(|ep| ep.alive)
    }

    fn broadcast_row(&self, from: NodeId, image: Bytes) -> Result<(), TransportError> {
        let Some(key) = peek_row_key(&image) else {
            return Err(TransportError::Closed);
        };
        let mut inner = self.inner.lock().unwrap();
        if !inner.get(&from).is_some_and(|ep| ep.alive) {
            return Err(TransportError::Closed);
        }
        for (node, ep) in inner.iter_mut() {
            if *node == from || !ep.alive {
                continue;
            }
            if ep.row_images.insert(key, image.clone()).is_none() {
                ep.row_arrival.push_back(key);
            }
        }
        Ok(())
    }

    fn take_row(&self, at: NodeId) -> Option<Bytes> {
        let mut inner = self.inner.lock().unwrap();
        let ep = inner.get_mut(&at)?;
        let key = ep.row_arrival.pop_front()?;
        ep.row_images.remove(&key)
    }

    fn send(&self, from: NodeId, to: NodeId, bytes: Bytes) -> Result<(), TransportError> {
        let inner = self.inner.lock().unwrap();
        if !inner.get(&from).is_some_and(|ep| ep.alive) {
            return Err(TransportError::Closed);
        }
        let Some(ep) = inner.get(&to) else {
            return Err(TransportError::PeerUnknown(to));
        };
        if !ep.alive {
            // Crashed peers silently swallow traffic, like a dead NIC. The
            // failure surfaces through heartbeat suspicion instead.
            return Ok(());
        }
        ep.p2p.push(bytes).map_err(|_| TransportError::Backlog(to))
    }

    fn take_p2p(&self, at: NodeId) -> Option<Bytes> {
        let queue = {
            let inner = self.inner.lock().unwrap();
            Arc::clone(&inner.get(&at)?.p2p)
        };
        queue.pop()
    }
}

/// One node's handle onto a [`MemoryHub`].
#[derive(Clone)]
pub struct MemoryTransport {
    hub: Arc<MemoryHub>,
    node: NodeId,
}

impl MemoryTransport {
    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn hub(&self) -> &Arc<MemoryHub> {
        &self.hub
    }
}

impl Transport for MemoryTransport {
    fn push_row(&self, image: Bytes) -> Result<(), TransportError> {
        self.hub.broadcast_row(self.node, image)
    }

    fn try_recv_row(&self) -> Option<Bytes> {
        self.hub.take_row(self.node)
    }

    fn send_to(&self, to: NodeId, bytes: Bytes) -> Result<(), TransportError> {
        self.hub.send(self.node, to, bytes)
    }

    fn try_recv(&self) -> Option<Bytes> {
        self.hub.take_p2p(self.node)
    }

    fn barrier(&self) -> Result<(), TransportError> {
        // The in-process harness drives all nodes from one thread and drains
        // queues between steps, so the barrier is already satisfied by
        // construction.
        Ok(())
    }
}
