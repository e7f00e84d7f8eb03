//! Generic deployment resource: disks, zdbs, qsfs and machines on one node.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use gridmesh_core::{ContractId, CoreResult, Deployment, NodeId, TwinId, Workload, WorkloadType};
use gridmesh_net::allocator::host_id;
use gridmesh_net::{HostAllocator, NetResult};
use gridmesh_state::LocalState;
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::contract::ContractConvergence;
use crate::error::{DeployError, DeployResult};
use crate::matcher::match_by_name;
use crate::reconciler::{Reconciler, apply_convergence, single_contract};
use crate::workloads::{Disk, Qsfs, Vm, Zdb};

/// Declared and observed fields of a deployment resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentSpec {
    pub name: String,
    pub node: NodeId,
    /// Network the machines join; may be empty when there are none.
    #[serde(default)]
    pub network_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub disks: Vec<Disk>,
    #[serde(default)]
    pub zdbs: Vec<Zdb>,
    #[serde(default)]
    pub vms: Vec<Vm>,
    #[serde(default)]
    pub qsfs: Vec<Qsfs>,
    #[serde(default)]
    pub contract_id: ContractId,
}

impl DeploymentSpec {
    pub fn new(name: impl Into<String>, node: NodeId, network_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            node,
            network_name: network_name.into(),
            description: String::new(),
            disks: Vec::new(),
            zdbs: Vec::new(),
            vms: Vec::new(),
            qsfs: Vec::new(),
            contract_id: 0,
        }
    }

    /// Workload names must be unique across the deployment and every mount
    /// must point at a disk or qsfs of the same deployment.
    pub fn validate(&self) -> DeployResult<()> {
        let mut names = BTreeSet::new();
        let mut claim = |name: String| {
            if names.insert(name.clone()) {
                Ok(())
            } else {
                Err(DeployError::Validation(format!(
                    "duplicate workload name {name:?} in deployment {}",
                    self.name
                )))
            }
        };
        for disk in &self.disks {
            claim(disk.name.clone())?;
        }
        for zdb in &self.zdbs {
            claim(zdb.name.clone())?;
        }
        for qsfs in &self.qsfs {
            claim(qsfs.name.clone())?;
        }
        for vm in &self.vms {
            claim(vm.name.clone())?;
            if vm.publicip || vm.publicip6 {
                claim(vm.public_ip_name())?;
            }
        }

        if !self.vms.is_empty() && self.network_name.is_empty() {
            return Err(DeployError::Validation(format!(
                "deployment {} has machines but no network",
                self.name
            )));
        }

        let mountable: BTreeSet<&str> = self
            .disks
            .iter()
            .map(|d| d.name.as_str())
            .chain(self.qsfs.iter().map(|q| q.name.as_str()))
            .collect();
        for vm in &self.vms {
            if let Some(mount) = vm.mounts.iter().find(|m| !mountable.contains(m.disk_name.as_str())) {
                return Err(DeployError::Validation(format!(
                    "machine {} mounts unknown disk {:?}",
                    vm.name, mount.disk_name
                )));
            }
        }
        Ok(())
    }

    fn is_empty(&self) -> bool {
        self.disks.is_empty() && self.zdbs.is_empty() && self.vms.is_empty() && self.qsfs.is_empty()
    }

    fn clear_workloads(&mut self) {
        self.disks.clear();
        self.zdbs.clear();
        self.vms.clear();
        self.qsfs.clear();
    }
}

pub struct DeploymentReconciler {
    spec: DeploymentSpec,
    twin_id: TwinId,
    deployer: Arc<dyn ContractConvergence>,
}

impl DeploymentReconciler {
    pub fn new(spec: DeploymentSpec, twin_id: TwinId, deployer: Arc<dyn ContractConvergence>) -> Self {
        Self {
            spec,
            twin_id,
            deployer,
        }
    }

    pub fn spec(&self) -> &DeploymentSpec {
        &self.spec
    }

    pub fn spec_mut(&mut self) -> &mut DeploymentSpec {
        &mut self.spec
    }

    pub fn contract_id(&self) -> ContractId {
        self.spec.contract_id
    }

    /// Give every machine a private address inside its node subnet.
    fn assign_ips(&mut self, state: &LocalState) -> DeployResult<()> {
        if self.spec.vms.is_empty() {
            return Ok(());
        }
        let node = self.spec.node;
        let ledger = state.network(&self.spec.network_name);
        let subnet = ledger
            .and_then(|l| l.node_subnet(node))
            .ok_or_else(|| DeployError::NodeNotInNetwork {
                node,
                network: self.spec.network_name.clone(),
            })?;
        let used = ledger
            .map(|l| l.used_host_ids_excluding(node, self.spec.contract_id))
            .unwrap_or_default();

        let ips: Vec<&mut Option<Ipv4Addr>> = self.spec.vms.iter_mut().map(|vm| &mut vm.ip).collect();
        assign_private_ips(subnet, &used, ips)?;
        Ok(())
    }

    /// Drop the ledger entries of `contract` on this node.
    fn release(&self, state: &mut LocalState, contract: ContractId) {
        if contract == 0 {
            return;
        }
        if let Some(ledger) = state.networks.get_mut(&self.spec.network_name) {
            ledger.delete_deployment_host_ids(self.spec.node, contract);
        }
    }

    fn record_host_ids(&self, state: &mut LocalState) {
        if self.spec.network_name.is_empty() || self.spec.contract_id == 0 {
            return;
        }
        let ids: Vec<u8> = self.spec.vms.iter().filter_map(|vm| vm.ip).map(host_id).collect();
        if ids.is_empty() {
            self.release(state, self.spec.contract_id);
            return;
        }
        state
            .network_mut(&self.spec.network_name)
            .set_deployment_host_ids(self.spec.node, self.spec.contract_id, ids);
    }
}

/// Give every slot a private address inside `subnet`, avoiding `used`.
///
/// Addresses already inside the subnet are kept. Addresses outside it, held
/// by another deployment, or claimed twice in `ips` are reassigned.
pub(crate) fn assign_private_ips(
    subnet: Ipv4Net,
    used: &[u8],
    mut ips: Vec<&mut Option<Ipv4Addr>>,
) -> NetResult<()> {
    let mut allocator = HostAllocator::new(subnet, used.iter().copied());
    let mut claimed = BTreeSet::new();
    for slot in ips.iter_mut() {
        if let Some(ip) = **slot {
            let id = host_id(ip);
            if !subnet.contains(&ip) || used.contains(&id) || !claimed.insert(id) {
                **slot = None;
                continue;
            }
            allocator.reserve(ip);
        }
    }
    for slot in ips.iter_mut() {
        let ip = allocator.assign(**slot)?;
        if **slot != Some(ip) {
            debug!(%ip, %subnet, "assigned private ip");
        }
        **slot = Some(ip);
    }
    Ok(())
}

/// Push a rebuilt workload, logging and skipping one that does not parse.
fn keep_parsed<T>(out: &mut Vec<T>, node: NodeId, workload: &Workload, parsed: CoreResult<T>) {
    match parsed {
        Ok(value) => out.push(value),
        Err(e) => warn!(node, workload = %workload.name, error = %e, "skipping unreadable workload"),
    }
}

#[async_trait]
impl Reconciler for DeploymentReconciler {
    fn kind(&self) -> &'static str {
        "deployment"
    }

    fn name(&self) -> &str {
        &self.spec.name
    }

    async fn generate(
        &mut self,
        state: &mut LocalState,
    ) -> DeployResult<BTreeMap<NodeId, Deployment>> {
        self.spec.validate()?;
        if self.spec.is_empty() {
            debug!(deployment = %self.spec.name, "no workloads declared");
        }
        self.assign_ips(state)?;

        let mut workloads = Vec::new();
        for disk in &self.spec.disks {
            workloads.push(disk.to_workload()?);
        }
        for zdb in &self.spec.zdbs {
            workloads.push(zdb.to_workload()?);
        }
        for qsfs in &self.spec.qsfs {
            workloads.push(qsfs.to_workload()?);
        }
        for vm in &self.spec.vms {
            workloads.extend(vm.to_workloads(&self.spec.network_name)?);
        }

        let mut deployment = Deployment::new(self.twin_id, workloads);
        deployment.description = self.spec.description.clone();
        Ok(BTreeMap::from([(self.spec.node, deployment)]))
    }

    async fn deploy(&mut self, state: &mut LocalState) -> DeployResult<()> {
        let desired = self.generate(state).await?;
        let previous_id = self.spec.contract_id;
        let mut contracts = single_contract(self.spec.node, previous_id);
        let outcome = self.deployer.deploy(&desired, &contracts).await;
        let result = apply_convergence(outcome, &mut contracts);

        self.spec.contract_id = contracts.get(&self.spec.node).copied().unwrap_or(0);
        if self.spec.contract_id != previous_id {
            self.release(state, previous_id);
        }
        if result.is_ok() {
            info!(
                deployment = %self.spec.name,
                node = self.spec.node,
                contract = self.spec.contract_id,
                "deployment converged"
            );
        }
        result
    }

    async fn sync(&mut self, state: &mut LocalState) -> DeployResult<()> {
        let node = self.spec.node;
        let contract = self.spec.contract_id;
        if !self.deployer.is_valid_contract(contract).await? {
            if contract != 0 {
                warn!(
                    deployment = %self.spec.name,
                    node,
                    contract,
                    "contract no longer valid, treating deployment as deleted"
                );
            }
            self.release(state, contract);
            self.spec.contract_id = 0;
            self.spec.clear_workloads();
            return Ok(());
        }

        let deployments = self
            .deployer
            .get_deployment_objects(&single_contract(node, contract))
            .await?;
        let Some(deployment) = deployments.get(&node) else {
            return Err(DeployError::ContractNotFound(contract));
        };

        let mut disks = Vec::new();
        let mut zdbs = Vec::new();
        let mut qsfs = Vec::new();
        let mut vms = Vec::new();
        for workload in deployment.workloads.iter().filter(|w| w.is_ok()) {
            match workload.workload_type {
                WorkloadType::ZMount => keep_parsed(&mut disks, node, workload, Disk::from_workload(workload)),
                WorkloadType::Zdb => keep_parsed(&mut zdbs, node, workload, Zdb::from_workload(workload)),
                WorkloadType::Qsfs => keep_parsed(&mut qsfs, node, workload, Qsfs::from_workload(workload)),
                WorkloadType::ZMachine => {
                    keep_parsed(&mut vms, node, workload, Vm::from_workloads(workload, deployment))
                }
                _ => {}
            }
        }

        self.spec.description = deployment.description.clone();
        self.spec.disks = match_by_name(&self.spec.disks, disks);
        self.spec.zdbs = match_by_name(&self.spec.zdbs, zdbs);
        self.spec.qsfs = match_by_name(&self.spec.qsfs, qsfs);
        self.spec.vms = match_by_name(&self.spec.vms, vms);
        self.record_host_ids(state);
        Ok(())
    }

    async fn cancel(&mut self, state: &mut LocalState) -> DeployResult<()> {
        let contract = self.spec.contract_id;
        let mut contracts = single_contract(self.spec.node, contract);
        let outcome = self.deployer.deploy(&BTreeMap::new(), &contracts).await;
        apply_convergence(outcome, &mut contracts)?;

        self.release(state, contract);
        self.spec.contract_id = 0;
        info!(deployment = %self.spec.name, node = self.spec.node, "deployment canceled");
        Ok(())
    }

    fn snapshot(&self) -> DeployResult<serde_json::Value> {
        Ok(serde_json::to_value(&self.spec).map_err(|e| gridmesh_core::CoreError::Encode {
            workload: self.spec.name.clone(),
            message: e.to_string(),
        })?)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tracing_test::traced_test;

    use super::*;
    use crate::contract::{DeployerSettings, GridDeployer};
    use crate::memory::{MemoryGrid, MemoryNode};
    use crate::workloads::Mount;

    fn vm(name: &str) -> Vm {
        Vm {
            name: name.into(),
            flist: "https://hub.grid.tf/tf-official-apps/base:latest.flist".into(),
            flist_checksum: String::new(),
            cpu: 1,
            memory_mb: 1024,
            rootfs_size_mb: 0,
            entrypoint: "/sbin/zinit init".into(),
            env_vars: BTreeMap::new(),
            mounts: Vec::new(),
            publicip: false,
            publicip6: false,
            planetary: false,
            corex: false,
            description: String::new(),
            ip: None,
            computed_ip: String::new(),
            computed_ip6: String::new(),
            ygg_ip: String::new(),
            console_url: String::new(),
        }
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut spec = DeploymentSpec::new("d", 1, "net");
        spec.disks.push(Disk {
            name: "web".into(),
            size_gb: 1,
            description: String::new(),
        });
        spec.vms.push(vm("web"));
        assert!(matches!(spec.validate(), Err(DeployError::Validation(_))));
    }

    #[test]
    fn public_ip_name_counts_as_a_name() {
        let mut spec = DeploymentSpec::new("d", 1, "net");
        let mut machine = vm("web");
        machine.publicip = true;
        spec.vms.push(machine);
        spec.disks.push(Disk {
            name: "webip".into(),
            size_gb: 1,
            description: String::new(),
        });
        assert!(spec.validate().is_err());
    }

    #[test]
    fn unknown_mount_is_rejected() {
        let mut spec = DeploymentSpec::new("d", 1, "net");
        let mut machine = vm("web");
        machine.mounts.push(Mount {
            disk_name: "missing".into(),
            mount_point: "/data".into(),
        });
        spec.vms.push(machine);
        assert!(spec.validate().is_err());
    }

    #[test]
    fn private_ips_skip_used_and_duplicate_addresses() {
        let subnet: Ipv4Net = "10.1.3.0/24".parse().unwrap();
        let mut a = Some(Ipv4Addr::new(10, 1, 3, 7));
        let mut b = Some(Ipv4Addr::new(10, 1, 3, 7));
        let mut c = Some(Ipv4Addr::new(10, 1, 9, 2));
        let mut d = Some(Ipv4Addr::new(10, 1, 3, 2));
        assign_private_ips(subnet, &[2, 3], vec![&mut a, &mut b, &mut c, &mut d]).unwrap();

        assert_eq!(a, Some(Ipv4Addr::new(10, 1, 3, 7)));
        assert_eq!(b, Some(Ipv4Addr::new(10, 1, 3, 4)));
        assert_eq!(c, Some(Ipv4Addr::new(10, 1, 3, 5)));
        assert_eq!(d, Some(Ipv4Addr::new(10, 1, 3, 6)));
    }

    #[test]
    fn private_ips_are_stable_across_runs() {
        let subnet: Ipv4Net = "10.1.3.0/24".parse().unwrap();
        let mut a = None;
        let mut b = None;
        assign_private_ips(subnet, &[], vec![&mut a, &mut b]).unwrap();
        let first = (a, b);
        assign_private_ips(subnet, &[], vec![&mut a, &mut b]).unwrap();
        assert_eq!((a, b), first);
        assert_eq!(a, Some(Ipv4Addr::new(10, 1, 3, 2)));
    }

    #[test]
    fn machines_need_a_network() {
        let mut spec = DeploymentSpec::new("d", 1, "");
        spec.vms.push(vm("web"));
        assert!(spec.validate().is_err());
        spec.vms.clear();
        assert!(spec.validate().is_ok());
        assert!(spec.is_empty());
    }

    #[tokio::test]
    #[traced_test]
    async fn expired_contract_is_logged_and_dropped() {
        let grid = Arc::new(
            MemoryGrid::new(7).with_node(1, MemoryNode::public("185.206.122.9/24".parse().unwrap())),
        );
        let deployer = Arc::new(GridDeployer::new(
            grid.clone(),
            grid.clone(),
            DeployerSettings {
                solution_provider: None,
                poll_interval: Duration::from_millis(10),
                wait_timeout: Duration::from_secs(1),
            },
        ));
        let mut spec = DeploymentSpec::new("storage", 1, "");
        spec.disks.push(Disk {
            name: "data".into(),
            size_gb: 2,
            description: "scratch".into(),
        });
        let mut rec = DeploymentReconciler::new(spec, 7, deployer);
        let mut state = LocalState::default();

        rec.deploy(&mut state).await.unwrap();
        rec.sync(&mut state).await.unwrap();
        assert_eq!(rec.spec().disks[0].description, "scratch");

        grid.expire_contract(rec.contract_id()).await;
        rec.sync(&mut state).await.unwrap();

        assert_eq!(rec.contract_id(), 0);
        assert!(rec.spec().disks.is_empty());
        assert!(logs_contain("treating deployment as deleted"));
    }
}
