use std::path::Path;

use anyhow::Context;
use gridmesh_state::{LocalState, StateStore};
use serde_json::json;

/// Resource kinds `plan` saves, in display order.
pub const RESOURCE_KINDS: &[&str] = &["network", "deployment", "k8s", "gateway-fqdn", "gateway-name"];

pub fn show(path: &Path, network: Option<&str>) -> anyhow::Result<()> {
    if !path.exists() {
        anyhow::bail!("no state at {}", path.display());
    }
    let store = StateStore::open(path).with_context(|| format!("opening {}", path.display()))?;
    let report = collect(&store, network)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn collect(store: &StateStore, network: Option<&str>) -> anyhow::Result<serde_json::Value> {
    let mut state = store.load_local_state()?;
    if let Some(name) = network {
        state = LocalState {
            networks: state
                .networks
                .into_iter()
                .filter(|(n, _)| n == name)
                .collect(),
        };
    }

    let mut resources = serde_json::Map::new();
    for kind in RESOURCE_KINDS {
        let names = store.list_resources(kind)?;
        if !names.is_empty() {
            resources.insert(kind.to_string(), json!(names));
        }
    }
    Ok(json!({
        "networks": state.networks,
        "resources": resources,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridmesh_state::NetworkState;

    #[test]
    fn lists_ledger_and_resources() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(&dir.path().join("state.redb")).unwrap();

        let mut state = LocalState::default();
        state
            .network_mut("net")
            .set_node_subnet(3, "10.20.2.0/24".parse().unwrap());
        state.network_mut("net").set_deployment_host_ids(3, 11, vec![2, 3]);
        state.network_mut("other").set_node_subnet(4, "10.30.2.0/24".parse().unwrap());
        store.save_local_state(&state).unwrap();
        store.put_resource("deployment", "web", &json!({"name": "web"})).unwrap();

        let all = collect(&store, None).unwrap();
        assert_eq!(all["networks"].as_object().unwrap().len(), 2);
        assert_eq!(all["resources"]["deployment"], json!(["web"]));
        assert!(all["resources"].get("k8s").is_none());

        let one = collect(&store, Some("net")).unwrap();
        let nets = one["networks"].as_object().unwrap();
        assert_eq!(nets.len(), 1);
        let ledger: NetworkState = serde_json::from_value(nets["net"].clone()).unwrap();
        assert_eq!(ledger.used_host_ids(3), [2, 3]);
    }

    #[test]
    fn missing_state_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(show(&dir.path().join("absent.redb"), None).is_err());
    }
}
