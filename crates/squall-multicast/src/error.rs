//! Engine error types and the persistence collaborator interface.

use squall_types::{SubgroupId, Timestamp, Version};
use thiserror::Error;

pub type MulticastResult<T> = Result<T, MulticastError>;

#[derive(Debug, Error)]
pub enum MulticastError {
    #[error("this node is not a member of subgroup {0}")]
    NotAMember(SubgroupId),

    #[error("this node is not a sender in subgroup {0}")]
    NotASender(SubgroupId),

    #[error("payload of {payload} bytes exceeds the configured maximum of {max}")]
    PayloadTooLarge { payload: u64, max: u64 },

    #[error("the engine is wedged for a view change")]
    Wedged,

    #[error("the engine is shutting down")]
    ShuttingDown,

    #[error("SST failure: {0}")]
    Sst(#[from] squall_sst::SstError),

    #[error("transport failure: {0}")]
    Transport(#[from] squall_sst::TransportError),

    #[error("block frame codec failure: {0}")]
    Codec(#[from] postcard::Error),
}

/// The persistence collaborator.
///
/// The engine emits `(subgroup, version, bytes)` tuples at delivery time and
/// reads durability progress back through the engine's `*_complete` methods,
/// which advance the monotone `persisted_num` / `signed_num` / `verified_num`
/// row counters.
pub trait PersistenceManager: Send + Sync {
    /// Announces the version about to be delivered, before the stability
    /// callback runs, so collaborators know the current version in flight.
    fn post_next_version(&self, subgroup: SubgroupId, version: Version, timestamp: Timestamp);

    /// Hands over a delivered message for asynchronous persistence. The
    /// collaborator later acknowledges through
    /// [`crate::MulticastEngine::persistence_complete`] (and the signature
    /// and verification counterparts).
    fn post_version(&self, subgroup: SubgroupId, version: Version, payload: &[u8]);
}
