//! gridmesh-state: local state for gridmesh reconcilers.
//!
//! Two layers:
//!
//! - [`LocalState`] is the in-memory value reconcilers mutate: per network,
//!   the subnet of every node and the host-id ledger of every deployment.
//!   The engine never loads or saves it on its own.
//! - [`StateStore`] persists `LocalState` (and opaque resource snapshots)
//!   in redb. Callers load before a reconciliation and save after it.
//!
//! All values are JSON-serialized into redb's `&[u8]` value columns.

pub mod error;
pub mod ledger;
pub mod store;
pub mod tables;

pub use error::{StateError, StateResult};
pub use ledger::{LocalState, NetworkState};
pub use store::StateStore;
