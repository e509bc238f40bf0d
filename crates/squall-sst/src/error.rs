//! SST error types.

use squall_types::NodeId;
use thiserror::Error;

pub type SstResult<T> = Result<T, SstError>;

#[derive(Debug, Error)]
pub enum SstError {
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),

    #[error("row codec failure: {0}")]
    Codec(#[from] postcard::Error),

    #[error("row image from {0}, which is not a member of this view")]
    UnknownOrigin(NodeId),
}

/// Failures at the transport layer. Recoverable ones become suspicion state;
/// only setup failures propagate to the application.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("peer {0} is not reachable")]
    PeerUnknown(NodeId),

    #[error("transport is shut down")]
    Closed,

    #[error("point-to-point queue to {0} is full")]
    Backlog(NodeId),
}
