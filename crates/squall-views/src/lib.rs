//! # squall-views: group membership
//!
//! Tracks group membership as a sequence of immutable [`View`]s and drives
//! the view-change protocol over the SST: failure suspicion, leader-driven
//! change proposals, acknowledgement and commit counters, wedging, the
//! ragged trim, and installation of the successor view. Joiners bootstrap
//! through the leader and receive replicated-object state from shard
//! leaders before their first view.
//!
//! # Key Types
//!
//! - [`View`] / [`SubView`]: installed membership and subgroup layout
//! - [`ViewManager`]: the view-change state machine, driven by SST predicates
//! - [`MembershipFn`] / [`LayoutError`]: the result-typed membership function
//! - [`StateTransfer`]: capture/restore of replicated state for joiners

mod bootstrap;
mod error;
mod layout;
mod manager;
mod view;

pub use bootstrap::{GmsMessage, StateBlob, StateTransfer};
pub use error::{LayoutError, ViewError, ViewResult};
pub use layout::{build_settings, MembershipFn, SubgroupLayout};
pub use manager::{StabilityCallback, ViewManager, ViewUpcall};
pub use view::{SubView, View};

#[cfg(test)]
mod tests;
