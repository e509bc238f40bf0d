//! # squall-sst: the Shared State Table
//!
//! The SST is a table with one row per view member and the same fixed schema
//! on every peer. Each node writes only its own row and publishes it to every
//! peer with one-sided row pushes; all coordination in the group (message
//! stability, delivery, view changes, persistence frontiers) runs as monotone
//! predicates over the replicated table.
//!
//! # Key Types
//!
//! - [`SstRow`]: the fixed-schema row, sized by an [`SstLayout`]
//! - [`Sst`]: the table: local-row writes, push/apply, snapshot reads
//! - [`Predicates`]: the predicate registry swept by the predicate thread
//! - [`Transport`]: the row-push + point-to-point transport abstraction
//! - [`MemoryHub`]/[`MemoryTransport`]: in-process transport with explicit
//!   delivery control, used by deterministic tests

mod error;
mod layout;
mod memory;
mod predicates;
mod row;
mod table;
mod transport;

pub use error::{SstError, SstResult, TransportError};
pub use layout::SstLayout;
pub use memory::{MemoryHub, MemoryTransport};
pub use predicates::{PredicateHandle, PredicateKind, Predicates};
pub use row::{RowImage, SstRow};
pub use table::Sst;
pub use transport::Transport;
