//! In-memory grid: chain, nodes and public node discovery in one process.
//!
//! Backs tests and `gridmesh plan` dry runs. Nodes provision workloads
//! instantly and report plausible results; faults are injected per node.

use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, Ipv4Addr};

use async_trait::async_trait;
use gridmesh_core::{
    ClientError, ContractId, Deployment, GatewayNameData, GatewayNameResult, NetworkData, NodeId,
    PublicIpData, PublicIpResult, QsfsResult, ResultState, TwinId, Workload, WorkloadResult,
    WorkloadType, ZMachineData, ZMachineResult, ZdbResult,
};
use gridmesh_net::client::ZOS_INTERFACE;
use gridmesh_net::{NodeRpc, PublicConfig, PublicNodeFinder};
use ipnet::{Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::contract::{ChainClient, Contract, ContractKind, ContractState, NodeDeployments};

const DEFAULT_GATEWAY_DOMAIN: &str = "gw.gridmesh.local";

/// One simulated node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryNode {
    pub public_config: Option<PublicConfig>,
    pub interfaces: BTreeMap<String, Vec<IpAddr>>,
    /// WireGuard ports bound outside of gridmesh.
    pub wg_ports: Vec<u16>,
    /// Fail every call as an unreachable node would.
    pub down: bool,
    /// Refuse new and updated deployments.
    pub reject_deployments: bool,
    #[serde(skip)]
    deployments: BTreeMap<ContractId, Deployment>,
}

impl MemoryNode {
    /// Node with a public IPv4 config.
    pub fn public(ipv4: Ipv4Net) -> Self {
        Self {
            public_config: Some(PublicConfig {
                ipv4: Some(ipv4),
                domain: DEFAULT_GATEWAY_DOMAIN.to_string(),
                ..Default::default()
            }),
            ..Self::hidden()
        }
    }

    /// Node reachable over IPv6 only.
    pub fn public_v6(ipv6: Ipv6Net) -> Self {
        Self {
            public_config: Some(PublicConfig {
                ipv6: Some(ipv6),
                ..Default::default()
            }),
            ..Self::hidden()
        }
    }

    /// Node behind NAT: only a private address on its zos interface.
    pub fn hidden() -> Self {
        Self {
            interfaces: BTreeMap::from([(
                ZOS_INTERFACE.to_string(),
                vec![IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10))],
            )]),
            ..Default::default()
        }
    }
}

#[derive(Default)]
struct GridInner {
    nodes: BTreeMap<NodeId, MemoryNode>,
    contracts: BTreeMap<ContractId, Contract>,
    last_contract: ContractId,
    last_public_ip: u32,
    clock: i64,
    public_nodes: Vec<NodeId>,
    /// Deploy/update calls per node.
    touches: BTreeMap<NodeId, usize>,
}

impl GridInner {
    fn node(&self, id: NodeId) -> Result<&MemoryNode, ClientError> {
        let node = self
            .nodes
            .get(&id)
            .ok_or_else(|| ClientError::NotFound(format!("node {id}")))?;
        if node.down {
            return Err(ClientError::Unreachable(format!("node {id}")));
        }
        Ok(node)
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut MemoryNode, ClientError> {
        self.node(id)?;
        self.nodes
            .get_mut(&id)
            .ok_or_else(|| ClientError::NotFound(format!("node {id}")))
    }

    /// Check that `deployment` is covered by a live contract of `node`.
    fn check_contract(&self, node: NodeId, deployment: &Deployment) -> Result<(), ClientError> {
        let id = deployment.contract_id;
        let contract = self
            .contracts
            .get(&id)
            .filter(|c| c.state == ContractState::Created)
            .ok_or_else(|| ClientError::Rejected(format!("contract {id} is not active")))?;
        match &contract.kind {
            ContractKind::Node {
                node: owner,
                deployment_hash,
                ..
            } if *owner == node => {
                if *deployment_hash != deployment.challenge_hash() {
                    return Err(ClientError::Rejected(format!(
                        "deployment does not match the hash of contract {id}"
                    )));
                }
                Ok(())
            }
            _ => Err(ClientError::Rejected(format!(
                "contract {id} is not a node contract of node {node}"
            ))),
        }
    }

    fn provision(&mut self, node: NodeId, deployment: &mut Deployment, previous: Option<&Deployment>) {
        let domain = self
            .nodes
            .get(&node)
            .and_then(|n| n.public_config.as_ref())
            .map(|c| c.domain.clone())
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| DEFAULT_GATEWAY_DOMAIN.to_string());

        let contract = deployment.contract_id;
        for workload in &mut deployment.workloads {
            let kept = previous
                .and_then(|p| p.workload(&workload.name))
                .filter(|old| old.version == workload.version && old.is_ok());
            workload.result = match kept {
                Some(old) => old.result.clone(),
                None => {
                    self.clock += 1;
                    let created = self.clock;
                    match self.result_data(node, contract, workload, &domain) {
                        Ok(data) => WorkloadResult {
                            created,
                            state: ResultState::Ok,
                            error: String::new(),
                            data,
                        },
                        Err(message) => WorkloadResult {
                            created,
                            state: ResultState::Error,
                            error: message,
                            data: serde_json::Value::Null,
                        },
                    }
                }
            };
        }
    }

    fn result_data(
        &mut self,
        node: NodeId,
        contract: ContractId,
        workload: &Workload,
        domain: &str,
    ) -> Result<serde_json::Value, String> {
        let value = match workload.workload_type {
            WorkloadType::Network => {
                workload.data_as::<NetworkData>().map_err(|e| e.to_string())?;
                serde_json::Value::Null
            }
            WorkloadType::ZMount | WorkloadType::GatewayFqdn => serde_json::Value::Null,
            WorkloadType::ZMachine => {
                let data: ZMachineData = workload.data_as().map_err(|e| e.to_string())?;
                let ip = data
                    .network
                    .interfaces
                    .first()
                    .map(|iface| iface.ip.to_string())
                    .unwrap_or_default();
                let ygg_ip = if data.network.planetary {
                    format!("302:9e63:7d43:b742:{node:x}::{:x}", self.clock)
                } else {
                    String::new()
                };
                to_value(ZMachineResult {
                    id: format!("{node}-{contract}-{}", workload.name),
                    console_url: if ip.is_empty() { String::new() } else { format!("{ip}:20001") },
                    ip,
                    ygg_ip,
                })?
            }
            WorkloadType::PublicIp => {
                let data: PublicIpData = workload.data_as().map_err(|e| e.to_string())?;
                self.last_public_ip += 1;
                let n = self.last_public_ip;
                to_value(PublicIpResult {
                    ip: if data.v4 {
                        format!("185.206.122.{}/24", 2 + n % 250)
                    } else {
                        String::new()
                    },
                    ip6: if data.v6 {
                        format!("2a10:b600:1::{n:x}/64")
                    } else {
                        String::new()
                    },
                    gateway: "185.206.122.1".to_string(),
                })?
            }
            WorkloadType::Zdb => to_value(ZdbResult {
                namespace: format!("{contract}-{}", workload.name),
                ips: vec![format!("2a10:b600:2::{node:x}")],
                port: 9900,
            })?,
            WorkloadType::Qsfs => to_value(QsfsResult {
                path: format!("/qsfs/{}", workload.name),
                metrics_endpoint: format!("http://[2a10:b600:2::{node:x}]:9100/metrics"),
            })?,
            WorkloadType::GatewayName => {
                let data: GatewayNameData = workload.data_as().map_err(|e| e.to_string())?;
                to_value(GatewayNameResult {
                    fqdn: format!("{}.{domain}", data.name),
                })?
            }
        };
        Ok(value)
    }
}

fn to_value<T: Serialize>(value: T) -> Result<serde_json::Value, String> {
    serde_json::to_value(value).map_err(|e| e.to_string())
}

/// Chain, nodes and public node finder sharing one lock.
pub struct MemoryGrid {
    twin_id: TwinId,
    inner: Mutex<GridInner>,
}

impl MemoryGrid {
    pub fn new(twin_id: TwinId) -> Self {
        Self {
            twin_id,
            inner: Mutex::new(GridInner::default()),
        }
    }

    pub fn with_node(mut self, id: NodeId, node: MemoryNode) -> Self {
        self.inner.get_mut().nodes.insert(id, node);
        self
    }

    /// Candidates returned by the public node finder. Defaults to every
    /// node with a public IPv4 config.
    pub fn with_public_nodes(mut self, nodes: Vec<NodeId>) -> Self {
        self.inner.get_mut().public_nodes = nodes;
        self
    }

    pub async fn set_down(&self, node: NodeId, down: bool) {
        if let Some(n) = self.inner.lock().await.nodes.get_mut(&node) {
            n.down = down;
        }
    }

    pub async fn set_reject_deployments(&self, node: NodeId, reject: bool) {
        if let Some(n) = self.inner.lock().await.nodes.get_mut(&node) {
            n.reject_deployments = reject;
        }
    }

    /// Number of deploy/update calls node `node` received.
    pub async fn touches(&self, node: NodeId) -> usize {
        self.inner.lock().await.touches.get(&node).copied().unwrap_or(0)
    }

    pub async fn contract(&self, id: ContractId) -> Option<Contract> {
        self.inner.lock().await.contracts.get(&id).cloned()
    }

    /// Live contracts, in creation order.
    pub async fn live_contracts(&self) -> Vec<Contract> {
        self.inner
            .lock()
            .await
            .contracts
            .values()
            .filter(|c| c.is_live())
            .cloned()
            .collect()
    }

    pub async fn deployments_on(&self, node: NodeId) -> Vec<Deployment> {
        self.inner
            .lock()
            .await
            .nodes
            .get(&node)
            .map(|n| n.deployments.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Overwrite the result state of every workload deployed on `node`.
    pub async fn set_workload_states(&self, node: NodeId, state: ResultState) {
        if let Some(n) = self.inner.lock().await.nodes.get_mut(&node) {
            for deployment in n.deployments.values_mut() {
                for workload in &mut deployment.workloads {
                    workload.result.state = state;
                }
            }
        }
    }

    /// Move a contract to `state` without deleting what it covers.
    pub async fn set_contract_state(&self, id: ContractId, state: ContractState) {
        if let Some(contract) = self.inner.lock().await.contracts.get_mut(&id) {
            contract.state = state;
        }
    }

    /// Delete a contract behind gridmesh's back (e.g. out of funds).
    pub async fn expire_contract(&self, id: ContractId) {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        if let Some(contract) = inner.contracts.get_mut(&id) {
            contract.state = ContractState::Deleted;
            if let ContractKind::Node { node, .. } = contract.kind {
                if let Some(n) = inner.nodes.get_mut(&node) {
                    n.deployments.remove(&id);
                }
            }
        }
    }
}

#[async_trait]
impl ChainClient for MemoryGrid {
    async fn create_node_contract(
        &self,
        node: NodeId,
        deployment_hash: &str,
        public_ips: u32,
        _solution_provider: Option<u64>,
    ) -> Result<ContractId, ClientError> {
        let mut inner = self.inner.lock().await;
        if !inner.nodes.contains_key(&node) {
            return Err(ClientError::Rejected(format!("node {node} does not exist")));
        }
        inner.last_contract += 1;
        let id = inner.last_contract;
        inner.contracts.insert(
            id,
            Contract {
                id,
                twin_id: self.twin_id,
                state: ContractState::Created,
                kind: ContractKind::Node {
                    node,
                    deployment_hash: deployment_hash.to_string(),
                    public_ips,
                },
            },
        );
        debug!(node, contract = id, "node contract created");
        Ok(id)
    }

    async fn update_node_contract(
        &self,
        id: ContractId,
        deployment_hash: &str,
    ) -> Result<(), ClientError> {
        let mut inner = self.inner.lock().await;
        let contract = inner
            .contracts
            .get_mut(&id)
            .filter(|c| c.state == ContractState::Created)
            .ok_or_else(|| ClientError::NotFound(format!("contract {id}")))?;
        match &mut contract.kind {
            ContractKind::Node {
                deployment_hash: hash,
                ..
            } => {
                *hash = deployment_hash.to_string();
                Ok(())
            }
            ContractKind::Name { .. } => Err(ClientError::Rejected(format!(
                "contract {id} is a name contract"
            ))),
        }
    }

    async fn cancel_contract(&self, id: ContractId) -> Result<(), ClientError> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let contract = inner
            .contracts
            .get_mut(&id)
            .filter(|c| c.state != ContractState::Deleted)
            .ok_or_else(|| ClientError::NotFound(format!("contract {id}")))?;
        contract.state = ContractState::Deleted;
        if let ContractKind::Node { node, .. } = contract.kind {
            if let Some(n) = inner.nodes.get_mut(&node) {
                n.deployments.remove(&id);
            }
        }
        Ok(())
    }

    async fn get_contract(&self, id: ContractId) -> Result<Contract, ClientError> {
        self.inner
            .lock()
            .await
            .contracts
            .get(&id)
            .cloned()
            .ok_or_else(|| ClientError::NotFound(format!("contract {id}")))
    }

    async fn create_name_contract(&self, name: &str) -> Result<ContractId, ClientError> {
        let mut inner = self.inner.lock().await;
        let taken = inner.contracts.values().any(|c| {
            c.is_live() && matches!(&c.kind, ContractKind::Name { name: n } if n == name)
        });
        if taken {
            return Err(ClientError::Rejected(format!("name {name} is already registered")));
        }
        inner.last_contract += 1;
        let id = inner.last_contract;
        inner.contracts.insert(
            id,
            Contract {
                id,
                twin_id: self.twin_id,
                state: ContractState::Created,
                kind: ContractKind::Name {
                    name: name.to_string(),
                },
            },
        );
        Ok(id)
    }
}

#[async_trait]
impl NodeDeployments for MemoryGrid {
    async fn deployment_deploy(
        &self,
        node: NodeId,
        mut deployment: Deployment,
    ) -> Result<(), ClientError> {
        let mut inner = self.inner.lock().await;
        *inner.touches.entry(node).or_default() += 1;
        let target = inner.node(node)?;
        if target.reject_deployments {
            return Err(ClientError::Rejected(format!("node {node} refuses deployments")));
        }
        let id = deployment.contract_id;
        if target.deployments.contains_key(&id) {
            return Err(ClientError::Rejected(format!("contract {id} already deployed")));
        }
        inner.check_contract(node, &deployment)?;
        inner.provision(node, &mut deployment, None);
        inner.node_mut(node)?.deployments.insert(id, deployment);
        Ok(())
    }

    async fn deployment_update(
        &self,
        node: NodeId,
        mut deployment: Deployment,
    ) -> Result<(), ClientError> {
        let mut inner = self.inner.lock().await;
        *inner.touches.entry(node).or_default() += 1;
        let target = inner.node(node)?;
        if target.reject_deployments {
            return Err(ClientError::Rejected(format!("node {node} refuses deployments")));
        }
        let id = deployment.contract_id;
        let previous = target
            .deployments
            .get(&id)
            .cloned()
            .ok_or_else(|| ClientError::NotFound(format!("deployment of contract {id}")))?;
        if deployment.version <= previous.version {
            return Err(ClientError::Rejected(format!(
                "version {} is not newer than {}",
                deployment.version, previous.version
            )));
        }
        inner.check_contract(node, &deployment)?;
        inner.provision(node, &mut deployment, Some(&previous));
        inner.node_mut(node)?.deployments.insert(id, deployment);
        Ok(())
    }

    async fn deployment_get(
        &self,
        node: NodeId,
        contract: ContractId,
    ) -> Result<Deployment, ClientError> {
        let inner = self.inner.lock().await;
        inner
            .node(node)?
            .deployments
            .get(&contract)
            .cloned()
            .ok_or_else(|| ClientError::NotFound(format!("deployment of contract {contract}")))
    }
}

#[async_trait]
impl NodeRpc for MemoryGrid {
    async fn network_list_interfaces(
        &self,
        node: NodeId,
    ) -> Result<HashMap<String, Vec<IpAddr>>, ClientError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .node(node)?
            .interfaces
            .iter()
            .map(|(name, ips)| (name.clone(), ips.clone()))
            .collect())
    }

    async fn network_get_public_config(&self, node: NodeId) -> Result<PublicConfig, ClientError> {
        let inner = self.inner.lock().await;
        inner
            .node(node)?
            .public_config
            .clone()
            .ok_or_else(|| ClientError::NotFound(format!("public config of node {node}")))
    }

    async fn network_list_wg_ports(&self, node: NodeId) -> Result<Vec<u16>, ClientError> {
        let inner = self.inner.lock().await;
        let target = inner.node(node)?;
        let mut ports = target.wg_ports.clone();
        for deployment in target.deployments.values() {
            for workload in &deployment.workloads {
                if workload.workload_type == WorkloadType::Network {
                    if let Ok(data) = workload.data_as::<NetworkData>() {
                        ports.push(data.wireguard_listen_port);
                    }
                }
            }
        }
        Ok(ports)
    }
}

#[async_trait]
impl PublicNodeFinder for MemoryGrid {
    async fn public_nodes(&self, preferred: &[NodeId]) -> Result<Vec<NodeId>, ClientError> {
        let inner = self.inner.lock().await;
        let mut candidates: Vec<NodeId> = if inner.public_nodes.is_empty() {
            inner
                .nodes
                .iter()
                .filter(|(_, n)| n.public_config.as_ref().is_some_and(|c| c.ipv4.is_some()))
                .map(|(id, _)| *id)
                .collect()
        } else {
            inner.public_nodes.clone()
        };
        candidates.sort_by_key(|id| !preferred.contains(id));
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use gridmesh_core::ZMountData;

    use super::*;

    fn grid() -> MemoryGrid {
        MemoryGrid::new(7)
            .with_node(1, MemoryNode::public("185.1.1.1/24".parse().unwrap()))
            .with_node(2, MemoryNode::hidden())
    }

    fn disk_deployment() -> Deployment {
        let disk = Workload::new("data", WorkloadType::ZMount, &ZMountData { size: 1 << 30 }).unwrap();
        Deployment::new(7, vec![disk])
    }

    #[tokio::test]
    async fn deploy_requires_matching_contract() {
        let grid = grid();
        let mut deployment = disk_deployment();
        let id = grid
            .create_node_contract(1, "wrong-hash", 0, None)
            .await
            .unwrap();
        deployment.contract_id = id;
        assert!(matches!(
            grid.deployment_deploy(1, deployment.clone()).await,
            Err(ClientError::Rejected(_))
        ));

        grid.update_node_contract(id, &deployment.challenge_hash())
            .await
            .unwrap();
        grid.deployment_deploy(1, deployment).await.unwrap();
        let stored = grid.deployment_get(1, id).await.unwrap();
        assert_eq!(stored.workloads[0].result.state, ResultState::Ok);
        assert_eq!(grid.touches(1).await, 2);
    }

    #[tokio::test]
    async fn cancel_removes_deployment() {
        let grid = grid();
        let mut deployment = disk_deployment();
        let id = grid
            .create_node_contract(1, &deployment.challenge_hash(), 0, None)
            .await
            .unwrap();
        deployment.contract_id = id;
        grid.deployment_deploy(1, deployment).await.unwrap();

        grid.cancel_contract(id).await.unwrap();
        assert!(grid.deployments_on(1).await.is_empty());
        assert!(matches!(
            grid.cancel_contract(id).await,
            Err(ClientError::NotFound(_))
        ));
        assert_eq!(grid.get_contract(id).await.unwrap().state, ContractState::Deleted);
    }

    #[tokio::test]
    async fn name_contracts_are_unique() {
        let grid = grid();
        let id = grid.create_name_contract("site").await.unwrap();
        assert!(grid.create_name_contract("site").await.is_err());
        grid.cancel_contract(id).await.unwrap();
        assert!(grid.create_name_contract("site").await.is_ok());
    }

    #[tokio::test]
    async fn down_node_is_unreachable() {
        let grid = grid();
        grid.set_down(1, true).await;
        assert!(matches!(
            grid.network_get_public_config(1).await,
            Err(ClientError::Unreachable(_))
        ));
        assert!(matches!(
            grid.network_get_public_config(2).await,
            Err(ClientError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn finder_prefers_requested_nodes() {
        let grid = grid()
            .with_node(3, MemoryNode::public("185.1.1.3/24".parse().unwrap()))
            .with_public_nodes(vec![1, 3]);
        assert_eq!(grid.public_nodes(&[3]).await.unwrap(), vec![3, 1]);
    }
}
