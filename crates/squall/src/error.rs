//! Group-level error types.

use thiserror::Error;

pub type GroupResult<T> = Result<T, GroupError>;

#[derive(Debug, Error)]
pub enum GroupError {
    #[error("no subgroup registered for this type and index")]
    UnknownSubgroup,

    #[error("this node is not a member of the requested subgroup")]
    NotASubgroupMember,

    #[error("the group has ejected this node")]
    Ejected,

    #[error("the group refused to proceed without a majority")]
    Partitioned,

    #[error("the group is shutting down")]
    ShuttingDown,

    #[error("p2p payload of {payload} bytes exceeds the configured maximum of {max}")]
    P2pPayloadTooLarge { payload: u64, max: u64 },

    #[error(transparent)]
    View(#[from] squall_views::ViewError),

    #[error(transparent)]
    Multicast(#[from] squall_multicast::MulticastError),

    #[error("configuration error: {0}")]
    Config(#[from] squall_config::ConfigError),

    #[error("transport failure: {0}")]
    Transport(#[from] squall_sst::TransportError),

    #[error("wire codec failure: {0}")]
    Codec(#[from] postcard::Error),
}
