//! # squall: replicated services on a totally-ordered atomic multicast
//!
//! Processes join a named group, which is partitioned into subgroups (each
//! replicating one typed object) and further into shards. Within a shard,
//! every member observes the same sequence of delivered messages, every
//! message is eventually delivered at every non-failed member, and
//! membership evolves through a sequence of views that all survivors agree
//! on.
//!
//! [`Group`] is the public surface: construct one as a founding member with
//! [`Group::new`] or join a running group with [`Group::join`], register the
//! subgroups your types replicate, and send through the typed
//! [`Replicated`] handles. Non-members of a subgroup reach it through
//! [`PeerCaller`] request/reply.
//!
//! The heavy machinery lives in the lower crates: `squall-sst` (the shared
//! state table and predicate engine), `squall-multicast` (the data planes),
//! and `squall-views` (membership and view changes).

mod error;
mod group;
mod p2p;
mod replicated;

pub use error::{GroupError, GroupResult};
pub use group::{Group, GroupCallbacks};
pub use p2p::{P2pEndpoint, P2pFrame, P2pHandler};
pub use replicated::{PeerCaller, RawObject, Replicated, ReplicatedObject, TypeTag};

pub use squall_config::{ConfigLoader, MulticastParams, SendAlgorithm, SquallConfig};
pub use squall_multicast::{MulticastEngine, PersistenceManager};
pub use squall_sst::{MemoryHub, MemoryTransport, Transport};
pub use squall_types::{
    DeliveryMode, MemberAddr, MemberPorts, MessageHeader, MessageId, NodeId, SubgroupId,
    Timestamp, Version, ViewId,
};
pub use squall_views::{
    LayoutError, MembershipFn, StabilityCallback, StateTransfer, SubView, SubgroupLayout, View,
    ViewManager, ViewUpcall,
};
