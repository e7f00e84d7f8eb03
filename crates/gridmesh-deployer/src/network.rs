//! Network resource: the overlay deployed as one network workload per node.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use gridmesh_core::{ContractId, Deployment, NetworkData, NodeId, WorkloadType};
use gridmesh_net::keys::public_key_of;
use gridmesh_net::{Network, TopologyBuilder};
use gridmesh_state::LocalState;
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::contract::ContractConvergence;
use crate::error::DeployResult;
use crate::reconciler::{Reconciler, apply_convergence};

/// Persisted fields of a network resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkRecord {
    pub network: Network,
    #[serde(default)]
    pub node_deployment_ids: BTreeMap<NodeId, ContractId>,
}

pub struct NetworkReconciler {
    record: NetworkRecord,
    builder: Arc<TopologyBuilder>,
    deployer: Arc<dyn ContractConvergence>,
}

impl NetworkReconciler {
    pub fn new(
        network: Network,
        builder: Arc<TopologyBuilder>,
        deployer: Arc<dyn ContractConvergence>,
    ) -> Self {
        Self::from_record(
            NetworkRecord {
                network,
                node_deployment_ids: BTreeMap::new(),
            },
            builder,
            deployer,
        )
    }

    pub fn from_record(
        record: NetworkRecord,
        builder: Arc<TopologyBuilder>,
        deployer: Arc<dyn ContractConvergence>,
    ) -> Self {
        Self {
            record,
            builder,
            deployer,
        }
    }

    pub fn record(&self) -> &NetworkRecord {
        &self.record
    }

    pub fn network(&self) -> &Network {
        &self.record.network
    }

    /// Mutable declared inputs (nodes, external access flag, description).
    pub fn network_mut(&mut self) -> &mut Network {
        &mut self.record.network
    }

    pub fn contracts(&self) -> &BTreeMap<NodeId, ContractId> {
        &self.record.node_deployment_ids
    }

    /// External client config, empty without external access.
    pub fn access_config(&self) -> &str {
        &self.record.network.access_wg_config
    }

    /// Mirror the subnets of nodes holding a contract into the ledger.
    fn record_subnets(&self, state: &mut LocalState) {
        let network = &self.record.network;
        let contracts = &self.record.node_deployment_ids;
        let ledger = state.network_mut(&network.name);

        let stale: Vec<NodeId> = ledger
            .subnets
            .keys()
            .copied()
            .filter(|node| !contracts.contains_key(node))
            .collect();
        for node in stale {
            ledger.delete_node_subnet(node);
        }
        for node in contracts.keys() {
            if let Some(&subnet) = network.subnets.get(node) {
                ledger.set_node_subnet(*node, subnet);
            }
        }
        if ledger.is_empty() {
            state.remove_network(&network.name);
        }
    }

    /// Read one node's network workload back.
    fn observed(&self, node: NodeId, deployment: &Deployment) -> Option<NetworkData> {
        let name = &self.record.network.name;
        let workload = deployment
            .workloads
            .iter()
            .find(|w| w.workload_type == WorkloadType::Network && w.name == *name)?;
        if !workload.is_ok() {
            warn!(node, network = %name, state = ?workload.result.state, "network workload is not ok");
            return None;
        }
        match workload.data_as() {
            Ok(data) => Some(data),
            Err(e) => {
                warn!(node, network = %name, error = %e, "skipping unreadable network workload");
                None
            }
        }
    }
}

#[async_trait]
impl Reconciler for NetworkReconciler {
    fn kind(&self) -> &'static str {
        "network"
    }

    fn name(&self) -> &str {
        &self.record.network.name
    }

    async fn generate(
        &mut self,
        _state: &mut LocalState,
    ) -> DeployResult<BTreeMap<NodeId, Deployment>> {
        let topology = self.builder.build(&mut self.record.network).await?;
        Ok(topology.deployments)
    }

    async fn deploy(&mut self, state: &mut LocalState) -> DeployResult<()> {
        let desired = self.generate(state).await?;
        let outcome = self
            .deployer
            .deploy(&desired, &self.record.node_deployment_ids)
            .await;
        let result = apply_convergence(outcome, &mut self.record.node_deployment_ids);
        self.record_subnets(state);
        if result.is_ok() {
            info!(
                network = %self.record.network.name,
                nodes = self.record.node_deployment_ids.len(),
                "network deployed"
            );
        }
        result
    }

    async fn sync(&mut self, state: &mut LocalState) -> DeployResult<()> {
        self.deployer
            .delete_invalid_contracts(&mut self.record.node_deployment_ids)
            .await?;
        let deployments = self
            .deployer
            .get_deployment_objects(&self.record.node_deployment_ids)
            .await?;

        let recorded = &self.record.network;
        let mut subnets = BTreeMap::new();
        let mut keys = BTreeMap::new();
        let mut ports = BTreeMap::new();
        let mut held = Vec::new();
        let mut access: Option<(NodeId, NetworkData)> = None;
        for (&node, deployment) in &deployments {
            let Some(data) = self.observed(node, deployment) else {
                // Live contract, unreadable workload: keep the assignment
                // until the node reports it again.
                if let Some(&subnet) = recorded.subnets.get(&node) {
                    subnets.insert(node, subnet);
                }
                if let Some(key) = recorded.keys.get(&node) {
                    keys.insert(node, key.clone());
                }
                if let Some(&port) = recorded.ports.get(&node) {
                    ports.insert(node, port);
                }
                held.push(node);
                continue;
            };
            subnets.insert(node, data.subnet);
            keys.insert(node, data.wireguard_private_key.clone());
            ports.insert(node, data.wireguard_listen_port);
            // Only the access node peers with endpoint-less hidden nodes
            // and external clients.
            if data.peers.iter().any(|p| p.endpoint.is_empty()) {
                access = Some((node, data));
            }
        }

        let external_key = recorded.external.as_ref().and_then(|external| {
            match public_key_of(&external.private_key) {
                Ok(key) => Some(key),
                Err(e) => {
                    warn!(network = %recorded.name, error = %e, "unreadable external access key");
                    None
                }
            }
        });
        let external_subnet: Option<Ipv4Net> = match (&access, &external_key) {
            (Some((_, data)), Some(key)) => data
                .peers
                .iter()
                .find(|p| p.wireguard_public_key == *key)
                .map(|p| p.subnet),
            _ => None,
        };
        let access_held = access.is_none()
            && recorded
                .access_node
                .is_some_and(|node| held.contains(&node));

        let network = &mut self.record.network;
        network.subnets = subnets;
        network.keys = keys;
        network.ports = ports;
        match access {
            Some((node, _)) => network.access_node = Some(node),
            None => {
                if network
                    .access_node
                    .is_some_and(|node| !network.subnets.contains_key(&node))
                {
                    network.access_node = None;
                }
            }
        }
        if let Some(subnet) = external_subnet {
            if let Some(external) = network.external.as_mut() {
                external.subnet = subnet;
            }
        } else if !access_held {
            network.external = None;
            network.access_wg_config.clear();
        }

        self.record_subnets(state);
        Ok(())
    }

    async fn cancel(&mut self, state: &mut LocalState) -> DeployResult<()> {
        let outcome = self
            .deployer
            .deploy(&BTreeMap::new(), &self.record.node_deployment_ids)
            .await;
        let result = apply_convergence(outcome, &mut self.record.node_deployment_ids);
        self.record_subnets(state);
        result?;
        self.record.network.clear_assignments();
        info!(network = %self.record.network.name, "network canceled");
        Ok(())
    }

    fn snapshot(&self) -> DeployResult<serde_json::Value> {
        serde_json::to_value(&self.record).map_err(|e| {
            gridmesh_core::CoreError::Encode {
                workload: self.record.network.name.clone(),
                message: e.to_string(),
            }
            .into()
        })
    }
}
