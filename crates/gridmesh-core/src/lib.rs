//! gridmesh-core: shared types for the gridmesh crates.
//!
//! - **`types`**: `Deployment` / `Workload` envelopes as exchanged with nodes
//! - **`workloads`**: typed workload payloads and their result payloads
//! - **`config`**: `gridmesh.toml` parsing
//! - **`error`**: core and external-client error types

pub mod config;
pub mod error;
pub mod types;
pub mod workloads;

pub use config::GridConfig;
pub use error::{ClientError, CoreError, CoreResult};
pub use types::*;
pub use workloads::*;
