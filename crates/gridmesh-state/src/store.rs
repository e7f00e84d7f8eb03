//! StateStore: redb-backed persistence for gridmesh local state.
//!
//! Stores network ledgers and reconciler snapshots. All values are
//! JSON-serialized into redb's `&[u8]` value columns. The store supports both
//! on-disk and in-memory backends (the latter for testing and dry runs).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::ledger::{LocalState, NetworkState};
use crate::tables::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store.
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(NETWORKS).map_err(map_err!(Table))?;
        txn.open_table(RESOURCES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic helpers ────────────────────────────────────────────

    fn put<T: Serialize>(
        &self,
        table_def: JsonTable,
        key: &str,
        value: &T,
    ) -> StateResult<()> {
        let value = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(table_def).map_err(map_err!(Table))?;
            table
                .insert(key, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(
        &self,
        table_def: JsonTable,
        key: &str,
    ) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table_def).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn delete(&self, table_def: JsonTable, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(table_def).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    fn keys(&self, table_def: JsonTable) -> StateResult<Vec<String>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table_def).map_err(map_err!(Table))?;
        let mut keys = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, _) = entry.map_err(map_err!(Read))?;
            keys.push(key.value().to_string());
        }
        Ok(keys)
    }

    // ── Networks ───────────────────────────────────────────────────

    /// Insert or replace the ledger of one network.
    pub fn put_network(&self, name: &str, network: &NetworkState) -> StateResult<()> {
        self.put(NETWORKS, name, network)?;
        debug!(network = %name, "network ledger stored");
        Ok(())
    }

    pub fn get_network(&self, name: &str) -> StateResult<Option<NetworkState>> {
        self.get(NETWORKS, name)
    }

    /// Delete a network ledger. Returns true if it existed.
    pub fn delete_network(&self, name: &str) -> StateResult<bool> {
        let existed = self.delete(NETWORKS, name)?;
        debug!(network = %name, existed, "network ledger deleted");
        Ok(existed)
    }

    pub fn list_network_names(&self) -> StateResult<Vec<String>> {
        self.keys(NETWORKS)
    }

    /// Load every network ledger into a `LocalState`.
    pub fn load_local_state(&self) -> StateResult<LocalState> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(NETWORKS).map_err(map_err!(Table))?;
        let mut state = LocalState::default();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            let network: NetworkState =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            state.networks.insert(key.value().to_string(), network);
        }
        Ok(state)
    }

    /// Persist a `LocalState`, replacing whatever was stored.
    ///
    /// Empty ledgers are dropped rather than written.
    pub fn save_local_state(&self, state: &LocalState) -> StateResult<()> {
        let existing = self.keys(NETWORKS)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(NETWORKS).map_err(map_err!(Table))?;
            for key in &existing {
                if state.network(key).is_none_or(NetworkState::is_empty) {
                    table.remove(key.as_str()).map_err(map_err!(Write))?;
                }
            }
            for (name, network) in &state.networks {
                if network.is_empty() {
                    continue;
                }
                let value = serde_json::to_vec(network).map_err(map_err!(Serialize))?;
                table
                    .insert(name.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(networks = state.networks.len(), "local state saved");
        Ok(())
    }

    // ── Resources ──────────────────────────────────────────────────

    /// Store the persisted fields of a reconciler under `{kind}/{name}`.
    pub fn put_resource<T: Serialize>(&self, kind: &str, name: &str, value: &T) -> StateResult<()> {
        let key = resource_key(kind, name);
        self.put(RESOURCES, &key, value)?;
        debug!(%key, "resource stored");
        Ok(())
    }

    pub fn get_resource<T: DeserializeOwned>(&self, kind: &str, name: &str) -> StateResult<Option<T>> {
        self.get(RESOURCES, &resource_key(kind, name))
    }

    pub fn delete_resource(&self, kind: &str, name: &str) -> StateResult<bool> {
        self.delete(RESOURCES, &resource_key(kind, name))
    }

    /// Names of every stored resource of `kind`.
    pub fn list_resources(&self, kind: &str) -> StateResult<Vec<String>> {
        let prefix = format!("{kind}/");
        Ok(self
            .keys(RESOURCES)?
            .into_iter()
            .filter_map(|k| k.strip_prefix(&prefix).map(str::to_string))
            .collect())
    }
}

fn resource_key(kind: &str, name: &str) -> String {
    format!("{kind}/{name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger() -> NetworkState {
        let mut net = NetworkState::default();
        net.set_node_subnet(11, "10.20.2.0/24".parse().unwrap());
        net.set_deployment_host_ids(11, 500, vec![2, 3]);
        net
    }

    #[test]
    fn network_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_network("net", &ledger()).unwrap();
        let back = store.get_network("net").unwrap().unwrap();
        assert_eq!(back, ledger());
    }

    #[test]
    fn network_get_nonexistent_returns_none() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.get_network("missing").unwrap().is_none());
    }

    #[test]
    fn network_delete() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_network("net", &ledger()).unwrap();
        assert!(store.delete_network("net").unwrap());
        assert!(!store.delete_network("net").unwrap());
        assert!(store.list_network_names().unwrap().is_empty());
    }

    #[test]
    fn local_state_load_save() {
        let store = StateStore::open_in_memory().unwrap();
        let mut state = LocalState::default();
        *state.network_mut("a") = ledger();
        *state.network_mut("b") = ledger();
        store.save_local_state(&state).unwrap();

        let loaded = store.load_local_state().unwrap();
        assert_eq!(loaded, state);

        // Removing a network and saving drops it from the store.
        state.remove_network("b");
        state.network_mut("empty");
        store.save_local_state(&state).unwrap();
        assert_eq!(store.list_network_names().unwrap(), vec!["a".to_string()]);
    }

    #[test]
    fn resources_by_kind() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_resource("network", "n1", &vec![1u32, 2]).unwrap();
        store.put_resource("network", "n2", &vec![3u32]).unwrap();
        store.put_resource("k8s", "c1", &"cluster").unwrap();

        let mut names = store.list_resources("network").unwrap();
        names.sort();
        assert_eq!(names, vec!["n1".to_string(), "n2".to_string()]);

        let back: Vec<u32> = store.get_resource("network", "n1").unwrap().unwrap();
        assert_eq!(back, vec![1, 2]);
        assert!(store.delete_resource("k8s", "c1").unwrap());
        assert!(store.get_resource::<String>("k8s", "c1").unwrap().is_none());
    }

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("state.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store.put_network("net", &ledger()).unwrap();
        }

        let store = StateStore::open(&db_path).unwrap();
        let state = store.load_local_state().unwrap();
        assert_eq!(state.network("net"), Some(&ledger()));
    }
}
