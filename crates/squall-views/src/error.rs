//! View-management error types.

use squall_types::NodeId;
use thiserror::Error;

pub type ViewResult<T> = Result<T, ViewError>;

/// Why the membership function could not produce a layout.
///
/// `Inadequate` is ordinary control flow, not a fault: the view-install
/// attempt is abandoned, members remain in the previous view, and the leader
/// may retry after the next membership change.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LayoutError {
    #[error("the current membership cannot satisfy the subgroup layout")]
    Inadequate,

    #[error("membership function failed: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum ViewError {
    #[error("this node ({0}) has been suspected by the group and must shut down")]
    Ejected(NodeId),

    #[error("installing the proposed view would partition the group")]
    Partitioned,

    #[error("join request rejected by the group: {0}")]
    JoinRejected(String),

    #[error("this node has not finished joining the group")]
    NotJoined,

    #[error("layout failure: {0}")]
    Layout(#[from] LayoutError),

    #[error("SST failure: {0}")]
    Sst(#[from] squall_sst::SstError),

    #[error("transport failure: {0}")]
    Transport(#[from] squall_sst::TransportError),

    #[error("wire codec failure: {0}")]
    Codec(#[from] postcard::Error),

    #[error("multicast engine failure: {0}")]
    Multicast(#[from] squall_multicast::MulticastError),

    #[error("configuration failure: {0}")]
    Config(#[from] squall_config::ConfigError),
}
