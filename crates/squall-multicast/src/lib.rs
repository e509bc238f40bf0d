//! # squall-multicast: the multicast engine
//!
//! Implements the low-level mechanics of tracking multicasts in a squall
//! group: two data planes (a block-pipelined bulk plane and a small-message
//! slot plane living inside the SST row), receive accounting, and delivery
//! in the unique global round-robin order, driven entirely by SST counter
//! monotonicity. This crate does not know how to handle failures; the view
//! manager wedges and trims it across view changes.
//!
//! # Key Types
//!
//! - [`MulticastEngine`]: the engine; one instance per installed view
//! - [`SubgroupSettings`]: per-subgroup plane configuration and SST offsets
//! - [`EngineCallbacks`]: delivery and versioning hooks
//! - [`PersistenceManager`]: the persistence collaborator interface
//! - [`BlockFrame`]: the block-plane wire frame

mod buffer;
mod engine;
mod error;
mod frontier;
mod rdmc;
mod settings;

pub use buffer::MessageBuffer;
pub use engine::{EngineCallbacks, MulticastEngine, StabilityFn};
pub use error::{MulticastError, MulticastResult, PersistenceManager};
pub use frontier::SubgroupFrontier;
pub use rdmc::{relay_children, BlockFrame};
pub use settings::SubgroupSettings;

#[cfg(test)]
mod tests;
