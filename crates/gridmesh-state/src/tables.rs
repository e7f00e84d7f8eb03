//! redb table definitions for the gridmesh state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized).

use redb::TableDefinition;

/// String-keyed table holding JSON documents.
pub type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Network ledgers keyed by network name.
pub const NETWORKS: JsonTable = TableDefinition::new("networks");

/// Reconciler snapshots keyed by `{kind}/{name}`.
pub const RESOURCES: JsonTable = TableDefinition::new("resources");
