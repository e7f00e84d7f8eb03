//! Contract layer.
//!
//! `ContractConvergence` is what the reconcilers talk to. `GridDeployer` is
//! its implementation over two lower collaborators: the chain
//! (`ChainClient`, contract CRUD) and the nodes (`NodeDeployments`,
//! deployment CRUD). The concrete chain client is chosen once by the
//! binary and handed in at construction.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gridmesh_core::{
    ClientError, ContractId, Deployment, GridConfig, NodeId, ResultState, TwinId,
};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{DeployError, DeployResult};

// ── Chain & node collaborators ────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContractState {
    Created,
    /// Out of funds; restored once the twin pays, deleted otherwise.
    GracePeriod,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContractKind {
    Node {
        node: NodeId,
        deployment_hash: String,
        public_ips: u32,
    },
    Name {
        name: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contract {
    pub id: ContractId,
    pub twin_id: TwinId,
    pub state: ContractState,
    pub kind: ContractKind,
}

impl Contract {
    pub fn is_live(&self) -> bool {
        matches!(self.state, ContractState::Created | ContractState::GracePeriod)
    }
}

/// Contract CRUD on the chain.
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn create_node_contract(
        &self,
        node: NodeId,
        deployment_hash: &str,
        public_ips: u32,
        solution_provider: Option<u64>,
    ) -> Result<ContractId, ClientError>;

    async fn update_node_contract(
        &self,
        id: ContractId,
        deployment_hash: &str,
    ) -> Result<(), ClientError>;

    /// `ClientError::NotFound` when the contract does not exist (anymore).
    async fn cancel_contract(&self, id: ContractId) -> Result<(), ClientError>;

    /// `ClientError::NotFound` when the contract does not exist.
    async fn get_contract(&self, id: ContractId) -> Result<Contract, ClientError>;

    async fn create_name_contract(&self, name: &str) -> Result<ContractId, ClientError>;
}

/// Deployment CRUD on a node.
#[async_trait]
pub trait NodeDeployments: Send + Sync {
    async fn deployment_deploy(&self, node: NodeId, deployment: Deployment)
    -> Result<(), ClientError>;

    async fn deployment_update(&self, node: NodeId, deployment: Deployment)
    -> Result<(), ClientError>;

    /// The deployment bound to `contract`, with workload results.
    async fn deployment_get(
        &self,
        node: NodeId,
        contract: ContractId,
    ) -> Result<Deployment, ClientError>;
}

// ── Convergence ───────────────────────────────────────────────────

/// Contract convergence as seen by the reconcilers.
#[async_trait]
pub trait ContractConvergence: Send + Sync {
    /// Converge nodes onto `desired`: create contracts for new nodes, update
    /// changed ones, cancel those absent from `desired` (or with an empty
    /// workload set). Fails with `PartialConvergence` carrying the contract
    /// map when only some nodes converged.
    async fn deploy(
        &self,
        desired: &BTreeMap<NodeId, Deployment>,
        previous: &BTreeMap<NodeId, ContractId>,
    ) -> DeployResult<BTreeMap<NodeId, ContractId>>;

    async fn get_deployment_objects(
        &self,
        contracts: &BTreeMap<NodeId, ContractId>,
    ) -> DeployResult<BTreeMap<NodeId, Deployment>>;

    /// False when the contract is missing or deleted.
    async fn is_valid_contract(&self, id: ContractId) -> DeployResult<bool>;

    /// Drop every invalid contract from `contracts`.
    async fn delete_invalid_contracts(
        &self,
        contracts: &mut BTreeMap<NodeId, ContractId>,
    ) -> DeployResult<()>;

    async fn create_name_contract(&self, name: &str) -> DeployResult<ContractId>;

    /// `Some(id)` when `id` is a live name contract for `name`, grace
    /// period included. A live contract registered under another name is
    /// canceled.
    async fn invalidate_name_contract(
        &self,
        id: ContractId,
        name: &str,
    ) -> DeployResult<Option<ContractId>>;

    /// Cancel `id`, tolerating a contract that is already gone.
    async fn ensure_contract_canceled(&self, id: ContractId) -> DeployResult<()>;
}

/// Knobs of the grid deployer.
#[derive(Debug, Clone)]
pub struct DeployerSettings {
    pub solution_provider: Option<u64>,
    pub poll_interval: Duration,
    pub wait_timeout: Duration,
}

impl DeployerSettings {
    pub fn from_config(config: &GridConfig) -> Self {
        Self {
            solution_provider: config.grid.solution_provider,
            poll_interval: config.poll_interval(),
            wait_timeout: config.wait_timeout(),
        }
    }
}

/// `ContractConvergence` over a chain client and node deployments.
pub struct GridDeployer {
    chain: Arc<dyn ChainClient>,
    nodes: Arc<dyn NodeDeployments>,
    settings: DeployerSettings,
}

impl GridDeployer {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        nodes: Arc<dyn NodeDeployments>,
        settings: DeployerSettings,
    ) -> Self {
        Self {
            chain,
            nodes,
            settings,
        }
    }

    /// Create the contract, then the deployment. The contract is canceled
    /// again when the node refuses the deployment.
    async fn create(&self, node: NodeId, desired: &Deployment) -> DeployResult<Deployment> {
        let mut deployment = desired.clone();
        deployment.version = 0;
        for workload in &mut deployment.workloads {
            workload.version = 0;
        }
        let hash = deployment.challenge_hash();
        let id = self
            .chain
            .create_node_contract(
                node,
                &hash,
                deployment.count_public_ipv4(),
                self.settings.solution_provider,
            )
            .await
            .map_err(DeployError::Chain)?;
        deployment.contract_id = id;

        if let Err(source) = self.nodes.deployment_deploy(node, deployment.clone()).await {
            warn!(node, contract = id, error = %source, "node refused deployment, canceling contract");
            if let Err(e) = self.chain.cancel_contract(id).await {
                warn!(node, contract = id, error = %e, "failed to cancel orphaned contract");
            }
            return Err(DeployError::Node { node, source });
        }
        info!(node, contract = id, workloads = deployment.workloads.len(), "deployment created");
        Ok(deployment)
    }

    /// Push `desired` onto an existing contract. `None` when nothing changed.
    async fn update(
        &self,
        node: NodeId,
        id: ContractId,
        desired: &Deployment,
    ) -> DeployResult<Option<Deployment>> {
        let current = self
            .nodes
            .deployment_get(node, id)
            .await
            .map_err(|source| DeployError::Node { node, source })?;
        if unchanged(&current, desired) {
            debug!(node, contract = id, "deployment unchanged");
            return Ok(None);
        }

        let mut next = desired.clone();
        next.contract_id = id;
        next.version = current.version + 1;
        for workload in &mut next.workloads {
            workload.version = match current.workload(&workload.name) {
                Some(old) if old.content_hash() == workload.content_hash() => old.version,
                _ => next.version,
            };
        }

        self.chain
            .update_node_contract(id, &next.challenge_hash())
            .await
            .map_err(DeployError::Chain)?;
        self.nodes
            .deployment_update(node, next.clone())
            .await
            .map_err(|source| DeployError::Node { node, source })?;
        info!(node, contract = id, version = next.version, "deployment updated");
        Ok(Some(next))
    }

    /// Poll until every workload at the deployment's version is ok.
    async fn wait(&self, node: NodeId, deployment: &Deployment) -> DeployResult<()> {
        let id = deployment.contract_id;
        let deadline = Instant::now() + self.settings.wait_timeout;
        loop {
            let current = self
                .nodes
                .deployment_get(node, id)
                .await
                .map_err(|source| DeployError::Node { node, source })?;

            let mut pending = 0;
            for workload in current
                .workloads
                .iter()
                .filter(|w| w.version == deployment.version)
            {
                match workload.result.state {
                    ResultState::Ok | ResultState::Paused => {}
                    ResultState::Init => pending += 1,
                    ResultState::Error | ResultState::Deleted => {
                        return Err(DeployError::WorkloadFailed {
                            node,
                            workload: workload.name.clone(),
                            message: workload.result.error.clone(),
                        });
                    }
                }
            }
            if pending == 0 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(DeployError::WaitTimeout { node, contract: id });
            }
            debug!(node, contract = id, pending, "waiting for workloads");
            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }
}

/// Same workload names and content; versions and results are ignored.
fn unchanged(current: &Deployment, desired: &Deployment) -> bool {
    current.metadata == desired.metadata
        && current.description == desired.description
        && current.workload_names() == desired.workload_names()
        && desired.workloads.iter().all(|w| {
            current
                .workload(&w.name)
                .is_some_and(|old| old.content_hash() == w.content_hash())
        })
}

#[async_trait]
impl ContractConvergence for GridDeployer {
    async fn deploy(
        &self,
        desired: &BTreeMap<NodeId, Deployment>,
        previous: &BTreeMap<NodeId, ContractId>,
    ) -> DeployResult<BTreeMap<NodeId, ContractId>> {
        let mut contracts = previous.clone();
        let mut failures = BTreeMap::new();

        // Cancel nodes that are no longer wanted.
        for (&node, &id) in previous {
            if desired.get(&node).is_some_and(|d| !d.workloads.is_empty()) {
                continue;
            }
            match self.ensure_contract_canceled(id).await {
                Ok(()) => {
                    contracts.remove(&node);
                    info!(node, contract = id, "contract canceled");
                }
                Err(e) => {
                    warn!(node, contract = id, error = %e, "cancel failed");
                    failures.insert(node, e.to_string());
                }
            }
        }

        for (&node, deployment) in desired {
            if deployment.workloads.is_empty() {
                continue;
            }
            let outcome = match previous.get(&node) {
                None => match self.create(node, deployment).await {
                    Ok(created) => {
                        contracts.insert(node, created.contract_id);
                        Ok(Some(created))
                    }
                    Err(e) => Err(e),
                },
                Some(&id) => self.update(node, id, deployment).await,
            };
            let result = match outcome {
                Ok(Some(deployed)) => self.wait(node, &deployed).await,
                Ok(None) => Ok(()),
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                warn!(node, error = %e, "node failed to converge");
                failures.insert(node, e.to_string());
            }
        }

        if failures.is_empty() {
            Ok(contracts)
        } else {
            Err(DeployError::PartialConvergence {
                contracts,
                failures,
            })
        }
    }

    async fn get_deployment_objects(
        &self,
        contracts: &BTreeMap<NodeId, ContractId>,
    ) -> DeployResult<BTreeMap<NodeId, Deployment>> {
        let mut deployments = BTreeMap::new();
        for (&node, &id) in contracts {
            let deployment = self
                .nodes
                .deployment_get(node, id)
                .await
                .map_err(|source| DeployError::Node { node, source })?;
            deployments.insert(node, deployment);
        }
        Ok(deployments)
    }

    async fn is_valid_contract(&self, id: ContractId) -> DeployResult<bool> {
        if id == 0 {
            return Ok(false);
        }
        match self.chain.get_contract(id).await {
            Ok(contract) => Ok(contract.is_live()),
            Err(ClientError::NotFound(_)) => Ok(false),
            Err(e) => Err(DeployError::Chain(e)),
        }
    }

    async fn delete_invalid_contracts(
        &self,
        contracts: &mut BTreeMap<NodeId, ContractId>,
    ) -> DeployResult<()> {
        let mut invalid = Vec::new();
        for (&node, &id) in contracts.iter() {
            if !self.is_valid_contract(id).await? {
                invalid.push(node);
            }
        }
        for node in invalid {
            if let Some(id) = contracts.remove(&node) {
                warn!(node, contract = id, "contract no longer valid, dropping it");
            }
        }
        Ok(())
    }

    async fn create_name_contract(&self, name: &str) -> DeployResult<ContractId> {
        let id = self
            .chain
            .create_name_contract(name)
            .await
            .map_err(DeployError::Chain)?;
        info!(%name, contract = id, "name contract created");
        Ok(id)
    }

    async fn invalidate_name_contract(
        &self,
        id: ContractId,
        name: &str,
    ) -> DeployResult<Option<ContractId>> {
        if id == 0 {
            return Ok(None);
        }
        let contract = match self.chain.get_contract(id).await {
            Ok(contract) => contract,
            Err(ClientError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(DeployError::Chain(e)),
        };
        if !contract.is_live() {
            return Ok(None);
        }
        match &contract.kind {
            ContractKind::Name { name: registered } if registered == name => Ok(Some(id)),
            ContractKind::Name { name: registered } => {
                info!(contract = id, %registered, wanted = %name, "name changed, canceling old name contract");
                self.ensure_contract_canceled(id).await?;
                Ok(None)
            }
            ContractKind::Node { .. } => Err(DeployError::ContractInvalid {
                id,
                reason: "not a name contract".into(),
            }),
        }
    }

    async fn ensure_contract_canceled(&self, id: ContractId) -> DeployResult<()> {
        if id == 0 {
            return Ok(());
        }
        match self.chain.cancel_contract(id).await {
            Ok(()) | Err(ClientError::NotFound(_)) => Ok(()),
            Err(e) => Err(DeployError::Chain(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use gridmesh_core::{Workload, WorkloadType, ZMountData};

    use super::*;
    use crate::memory::{MemoryGrid, MemoryNode};

    fn setup() -> (Arc<MemoryGrid>, GridDeployer) {
        let grid = Arc::new(
            MemoryGrid::new(7).with_node(1, MemoryNode::public("185.1.1.1/24".parse().unwrap())),
        );
        let deployer = GridDeployer::new(
            grid.clone(),
            grid.clone(),
            DeployerSettings {
                solution_provider: None,
                poll_interval: Duration::from_millis(10),
                wait_timeout: Duration::from_secs(1),
            },
        );
        (grid, deployer)
    }

    fn disks(sizes: &[(&str, u64)]) -> BTreeMap<NodeId, Deployment> {
        let workloads = sizes
            .iter()
            .map(|(name, size)| {
                Workload::new(*name, WorkloadType::ZMount, &ZMountData { size: *size }).unwrap()
            })
            .collect();
        BTreeMap::from([(1, Deployment::new(7, workloads))])
    }

    #[tokio::test]
    async fn update_bumps_only_changed_workloads() {
        let (grid, deployer) = setup();
        let contracts = deployer
            .deploy(&disks(&[("a", 1), ("b", 1)]), &BTreeMap::new())
            .await
            .unwrap();
        let id = contracts[&1];

        let again = deployer
            .deploy(&disks(&[("a", 1), ("b", 1)]), &contracts)
            .await
            .unwrap();
        assert_eq!(again, contracts);
        assert_eq!(grid.touches(1).await, 1);

        deployer
            .deploy(&disks(&[("a", 1), ("b", 2)]), &contracts)
            .await
            .unwrap();
        let stored = grid.deployment_get(1, id).await.unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(stored.workload("a").unwrap().version, 0);
        assert_eq!(stored.workload("b").unwrap().version, 1);
    }

    #[tokio::test]
    async fn refused_deployment_cancels_its_contract() {
        let (grid, deployer) = setup();
        grid.set_reject_deployments(1, true).await;
        match deployer.deploy(&disks(&[("a", 1)]), &BTreeMap::new()).await {
            Err(DeployError::PartialConvergence {
                contracts,
                failures,
            }) => {
                assert!(contracts.is_empty());
                assert!(failures.contains_key(&1));
            }
            other => panic!("expected partial convergence, got {other:?}"),
        }
        assert!(grid.live_contracts().await.is_empty());
    }

    #[tokio::test]
    async fn renamed_name_contract_is_replaced() {
        let (grid, deployer) = setup();
        let id = deployer.create_name_contract("site").await.unwrap();
        assert_eq!(deployer.invalidate_name_contract(id, "site").await.unwrap(), Some(id));
        assert_eq!(deployer.invalidate_name_contract(id, "shop").await.unwrap(), None);
        assert_eq!(grid.contract(id).await.unwrap().state, ContractState::Deleted);
        deployer.ensure_contract_canceled(id).await.unwrap();
    }

    #[tokio::test]
    async fn expired_contracts_are_dropped() {
        let (grid, deployer) = setup();
        let mut contracts = deployer
            .deploy(&disks(&[("a", 1)]), &BTreeMap::new())
            .await
            .unwrap();
        assert!(deployer.is_valid_contract(contracts[&1]).await.unwrap());
        assert!(!deployer.is_valid_contract(0).await.unwrap());

        grid.expire_contract(contracts[&1]).await;
        deployer.delete_invalid_contracts(&mut contracts).await.unwrap();
        assert!(contracts.is_empty());
    }
}
