//! Reverse-proxy gateways.
//!
//! Both kinds are a single proxy workload on one gateway node. The name
//! gateway also holds a name contract reserving its subdomain; the FQDN it
//! ends up serving is computed by the node.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use gridmesh_core::{
    ContractId, CoreError, Deployment, GatewayFqdnData, GatewayNameData, GatewayNameResult,
    NodeId, TwinId, Workload, WorkloadType,
};
use gridmesh_state::LocalState;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::contract::ContractConvergence;
use crate::error::{DeployError, DeployResult};
use crate::reconciler::{Reconciler, apply_convergence, single_contract};
use crate::workloads::result_or_default;

fn validate_backends(name: &str, backends: &[String]) -> DeployResult<()> {
    if backends.is_empty() {
        return Err(DeployError::Validation(format!(
            "gateway {name} needs at least one backend"
        )));
    }
    Ok(())
}

fn encode_error(name: &str, e: serde_json::Error) -> DeployError {
    CoreError::Encode {
        workload: name.to_string(),
        message: e.to_string(),
    }
    .into()
}

/// The ok proxy workload of type `kind` in the deployment held by `contract`.
async fn observed_proxy(
    deployer: &dyn ContractConvergence,
    node: NodeId,
    contract: ContractId,
    name: &str,
    kind: WorkloadType,
) -> DeployResult<Option<Workload>> {
    let deployments = deployer
        .get_deployment_objects(&single_contract(node, contract))
        .await?;
    let workload = deployments
        .get(&node)
        .and_then(|d| d.workload(name))
        .filter(|w| w.workload_type == kind);
    match workload {
        Some(w) if w.is_ok() => Ok(Some(w.clone())),
        Some(w) => {
            warn!(node, gateway = %name, state = ?w.result.state, "gateway workload is not ok");
            Ok(None)
        }
        None => Ok(None),
    }
}

// ── FQDN gateway ──────────────────────────────────────────────────

/// Proxy for a domain the user controls and points at the gateway node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayFqdn {
    pub name: String,
    pub node: NodeId,
    pub fqdn: String,
    #[serde(default)]
    pub tls_passthrough: bool,
    pub backends: Vec<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub contract_id: ContractId,
}

pub struct GatewayFqdnReconciler {
    gateway: GatewayFqdn,
    twin_id: TwinId,
    deployer: Arc<dyn ContractConvergence>,
}

impl GatewayFqdnReconciler {
    pub fn new(gateway: GatewayFqdn, twin_id: TwinId, deployer: Arc<dyn ContractConvergence>) -> Self {
        Self {
            gateway,
            twin_id,
            deployer,
        }
    }

    pub fn gateway(&self) -> &GatewayFqdn {
        &self.gateway
    }
}

#[async_trait]
impl Reconciler for GatewayFqdnReconciler {
    fn kind(&self) -> &'static str {
        "gateway-fqdn"
    }

    fn name(&self) -> &str {
        &self.gateway.name
    }

    async fn generate(
        &mut self,
        _state: &mut LocalState,
    ) -> DeployResult<BTreeMap<NodeId, Deployment>> {
        let gw = &self.gateway;
        validate_backends(&gw.name, &gw.backends)?;
        if gw.fqdn.is_empty() {
            return Err(DeployError::Validation(format!("gateway {} needs an fqdn", gw.name)));
        }
        let data = GatewayFqdnData {
            fqdn: gw.fqdn.clone(),
            tls_passthrough: gw.tls_passthrough,
            backends: gw.backends.clone(),
        };
        let workload = Workload::new(&gw.name, WorkloadType::GatewayFqdn, &data)?
            .with_description(&gw.description);
        Ok(BTreeMap::from([(
            gw.node,
            Deployment::new(self.twin_id, vec![workload]),
        )]))
    }

    async fn deploy(&mut self, state: &mut LocalState) -> DeployResult<()> {
        let desired = self.generate(state).await?;
        let mut contracts = single_contract(self.gateway.node, self.gateway.contract_id);
        let outcome = self.deployer.deploy(&desired, &contracts).await;
        let result = apply_convergence(outcome, &mut contracts);
        self.gateway.contract_id = contracts.get(&self.gateway.node).copied().unwrap_or(0);
        result
    }

    async fn sync(&mut self, _state: &mut LocalState) -> DeployResult<()> {
        let gw = &mut self.gateway;
        if !self.deployer.is_valid_contract(gw.contract_id).await? {
            if gw.contract_id != 0 {
                warn!(gateway = %gw.name, contract = gw.contract_id, "contract no longer valid, treating gateway as deleted");
            }
            gw.contract_id = 0;
            gw.backends.clear();
            return Ok(());
        }
        let observed = observed_proxy(
            self.deployer.as_ref(),
            gw.node,
            gw.contract_id,
            &gw.name,
            WorkloadType::GatewayFqdn,
        )
        .await?;
        if let Some(workload) = observed {
            let data: GatewayFqdnData = workload.data_as()?;
            gw.fqdn = data.fqdn;
            gw.tls_passthrough = data.tls_passthrough;
            gw.backends = data.backends;
            gw.description = workload.description;
        }
        Ok(())
    }

    async fn cancel(&mut self, _state: &mut LocalState) -> DeployResult<()> {
        let mut contracts = single_contract(self.gateway.node, self.gateway.contract_id);
        let outcome = self.deployer.deploy(&BTreeMap::new(), &contracts).await;
        apply_convergence(outcome, &mut contracts)?;
        self.gateway.contract_id = 0;
        info!(gateway = %self.gateway.name, "fqdn gateway canceled");
        Ok(())
    }

    fn snapshot(&self) -> DeployResult<serde_json::Value> {
        serde_json::to_value(&self.gateway).map_err(|e| encode_error(&self.gateway.name, e))
    }
}

// ── Name gateway ──────────────────────────────────────────────────

/// Proxy for `<name>.<gateway domain>`, reserved through a name contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayName {
    pub name: String,
    pub node: NodeId,
    #[serde(default)]
    pub tls_passthrough: bool,
    pub backends: Vec<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub name_contract_id: ContractId,
    #[serde(default)]
    pub contract_id: ContractId,

    /// Computed by the gateway node.
    #[serde(default)]
    pub fqdn: String,
}

pub struct GatewayNameReconciler {
    gateway: GatewayName,
    twin_id: TwinId,
    deployer: Arc<dyn ContractConvergence>,
}

impl GatewayNameReconciler {
    pub fn new(gateway: GatewayName, twin_id: TwinId, deployer: Arc<dyn ContractConvergence>) -> Self {
        Self {
            gateway,
            twin_id,
            deployer,
        }
    }

    pub fn gateway(&self) -> &GatewayName {
        &self.gateway
    }

    pub fn gateway_mut(&mut self) -> &mut GatewayName {
        &mut self.gateway
    }

    /// Reuse the name contract if it still reserves our name, otherwise
    /// register a fresh one.
    async fn ensure_name_contract(&mut self) -> DeployResult<()> {
        let gw = &mut self.gateway;
        match self
            .deployer
            .invalidate_name_contract(gw.name_contract_id, &gw.name)
            .await?
        {
            Some(id) => gw.name_contract_id = id,
            None => gw.name_contract_id = self.deployer.create_name_contract(&gw.name).await?,
        }
        Ok(())
    }
}

#[async_trait]
impl Reconciler for GatewayNameReconciler {
    fn kind(&self) -> &'static str {
        "gateway-name"
    }

    fn name(&self) -> &str {
        &self.gateway.name
    }

    async fn generate(
        &mut self,
        _state: &mut LocalState,
    ) -> DeployResult<BTreeMap<NodeId, Deployment>> {
        let gw = &self.gateway;
        validate_backends(&gw.name, &gw.backends)?;
        let data = GatewayNameData {
            name: gw.name.clone(),
            tls_passthrough: gw.tls_passthrough,
            backends: gw.backends.clone(),
        };
        let workload = Workload::new(&gw.name, WorkloadType::GatewayName, &data)?
            .with_description(&gw.description);
        Ok(BTreeMap::from([(
            gw.node,
            Deployment::new(self.twin_id, vec![workload]),
        )]))
    }

    async fn deploy(&mut self, state: &mut LocalState) -> DeployResult<()> {
        let desired = self.generate(state).await?;
        self.ensure_name_contract().await?;

        let mut contracts = single_contract(self.gateway.node, self.gateway.contract_id);
        let outcome = self.deployer.deploy(&desired, &contracts).await;
        let result = apply_convergence(outcome, &mut contracts);
        self.gateway.contract_id = contracts.get(&self.gateway.node).copied().unwrap_or(0);
        if result.is_ok() {
            info!(
                gateway = %self.gateway.name,
                node = self.gateway.node,
                name_contract = self.gateway.name_contract_id,
                contract = self.gateway.contract_id,
                "name gateway deployed"
            );
        }
        result
    }

    async fn sync(&mut self, _state: &mut LocalState) -> DeployResult<()> {
        let gw = &mut self.gateway;
        if !self.deployer.is_valid_contract(gw.name_contract_id).await? {
            if gw.name_contract_id != 0 {
                warn!(gateway = %gw.name, contract = gw.name_contract_id, "name contract no longer valid");
            }
            gw.name_contract_id = 0;
        }
        if !self.deployer.is_valid_contract(gw.contract_id).await? {
            if gw.contract_id != 0 {
                warn!(gateway = %gw.name, contract = gw.contract_id, "contract no longer valid, treating gateway as deleted");
            }
            gw.contract_id = 0;
            gw.fqdn.clear();
            gw.backends.clear();
            return Ok(());
        }

        let observed = observed_proxy(
            self.deployer.as_ref(),
            gw.node,
            gw.contract_id,
            &gw.name,
            WorkloadType::GatewayName,
        )
        .await?;
        if let Some(workload) = observed {
            let data: GatewayNameData = workload.data_as()?;
            let result: GatewayNameResult = result_or_default(&workload)?;
            gw.tls_passthrough = data.tls_passthrough;
            gw.backends = data.backends;
            gw.description = workload.description;
            gw.fqdn = result.fqdn;
        }
        Ok(())
    }

    async fn cancel(&mut self, _state: &mut LocalState) -> DeployResult<()> {
        let mut contracts = single_contract(self.gateway.node, self.gateway.contract_id);
        let outcome = self.deployer.deploy(&BTreeMap::new(), &contracts).await;
        apply_convergence(outcome, &mut contracts)?;
        self.gateway.contract_id = 0;

        self.deployer
            .ensure_contract_canceled(self.gateway.name_contract_id)
            .await?;
        self.gateway.name_contract_id = 0;
        self.gateway.fqdn.clear();
        info!(gateway = %self.gateway.name, "name gateway canceled");
        Ok(())
    }

    fn snapshot(&self) -> DeployResult<serde_json::Value> {
        serde_json::to_value(&self.gateway).map_err(|e| encode_error(&self.gateway.name, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::{ContractState, DeployerSettings, GridDeployer};
    use crate::memory::{MemoryGrid, MemoryNode};
    use std::time::Duration;

    fn settings() -> DeployerSettings {
        DeployerSettings {
            solution_provider: None,
            poll_interval: Duration::from_millis(10),
            wait_timeout: Duration::from_secs(1),
        }
    }

    fn fqdn_gateway() -> GatewayFqdn {
        GatewayFqdn {
            name: "site".into(),
            node: 7,
            fqdn: "site.example.com".into(),
            tls_passthrough: false,
            backends: vec!["http://10.1.2.2:8080".into()],
            description: String::new(),
            contract_id: 0,
        }
    }

    #[tokio::test]
    async fn fqdn_gateway_round_trip() {
        let grid = Arc::new(
            MemoryGrid::new(42).with_node(7, MemoryNode::public("185.206.122.7/24".parse().unwrap())),
        );
        let deployer = Arc::new(GridDeployer::new(grid.clone(), grid.clone(), settings()));
        let mut state = LocalState::default();
        let mut rec = GatewayFqdnReconciler::new(fqdn_gateway(), 42, deployer);

        rec.deploy(&mut state).await.unwrap();
        rec.sync(&mut state).await.unwrap();
        assert_ne!(rec.gateway().contract_id, 0);
        let mut expected = fqdn_gateway();
        expected.contract_id = rec.gateway().contract_id;
        assert_eq!(rec.gateway(), &expected);

        rec.cancel(&mut state).await.unwrap();
        assert_eq!(rec.gateway().contract_id, 0);
        assert!(grid.live_contracts().await.is_empty());
    }

    #[tokio::test]
    async fn name_contract_in_grace_period_is_kept() {
        let grid = Arc::new(
            MemoryGrid::new(42).with_node(7, MemoryNode::public("185.206.122.7/24".parse().unwrap())),
        );
        let deployer = Arc::new(GridDeployer::new(grid.clone(), grid.clone(), settings()));
        let mut state = LocalState::default();
        let gateway = GatewayName {
            name: "site".into(),
            node: 7,
            tls_passthrough: false,
            backends: vec!["http://10.1.2.2:8080".into()],
            description: String::new(),
            name_contract_id: 0,
            contract_id: 0,
            fqdn: String::new(),
        };
        let mut rec = GatewayNameReconciler::new(gateway, 42, deployer);
        rec.deploy(&mut state).await.unwrap();
        let name_contract = rec.gateway().name_contract_id;

        grid.set_contract_state(name_contract, ContractState::GracePeriod)
            .await;
        rec.deploy(&mut state).await.unwrap();
        rec.sync(&mut state).await.unwrap();
        assert_eq!(rec.gateway().name_contract_id, name_contract);
        assert_eq!(rec.gateway().fqdn, "site.gw.gridmesh.local");
    }

    #[tokio::test]
    async fn gateway_without_backends_is_rejected() {
        let grid = Arc::new(MemoryGrid::new(42));
        let deployer = Arc::new(GridDeployer::new(grid.clone(), grid.clone(), settings()));
        let mut gateway = fqdn_gateway();
        gateway.backends.clear();
        let mut rec = GatewayFqdnReconciler::new(gateway, 42, deployer);
        let err = rec.deploy(&mut LocalState::default()).await.unwrap_err();
        assert!(matches!(err, DeployError::Validation(_)));
    }
}
