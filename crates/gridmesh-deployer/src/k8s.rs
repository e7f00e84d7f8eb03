//! k3s cluster resource: one master and any number of workers spread over
//! the nodes of a network.
//!
//! Every cluster node is a disk plus a machine (and optionally a public ip)
//! in the deployment of the grid node it runs on.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use gridmesh_core::{
    ContractId, CoreResult, Deployment, NodeId, TwinId, Workload, WorkloadType, ZMountData,
};
use gridmesh_net::allocator::host_id;
use gridmesh_state::LocalState;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::contract::ContractConvergence;
use crate::deployment::assign_private_ips;
use crate::error::{DeployError, DeployResult};
use crate::matcher::{Matchable, match_by_name};
use crate::reconciler::{Reconciler, apply_convergence};
use crate::workloads::{Disk, GIB, Mount, Vm};

pub const K3S_FLIST: &str = "https://hub.grid.tf/tf-official-apps/threefoldtech-k3s-latest.flist";
pub const K3S_DATA_DIR: &str = "/mnt/data";
pub const K3S_API_PORT: u16 = 6443;
const K3S_ENTRYPOINT: &str = "/sbin/zinit init";
const K3S_FLANNEL_IFACE: &str = "eth0";

fn default_flist() -> String {
    K3S_FLIST.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct K8sNode {
    pub name: String,
    pub node: NodeId,
    pub disk_size_gb: u64,
    #[serde(default = "default_flist")]
    pub flist: String,
    #[serde(default)]
    pub flist_checksum: String,
    pub cpu: u8,
    pub memory_mb: u64,
    #[serde(default)]
    pub publicip: bool,
    #[serde(default)]
    pub publicip6: bool,
    #[serde(default)]
    pub planetary: bool,
    #[serde(default)]
    pub ip: Option<Ipv4Addr>,

    #[serde(default)]
    pub computed_ip: String,
    #[serde(default)]
    pub computed_ip6: String,
    #[serde(default)]
    pub ygg_ip: String,
    #[serde(default)]
    pub console_url: String,
}

impl K8sNode {
    pub fn disk_name(&self) -> String {
        format!("{}disk", self.name)
    }

    fn machine(&self, env_vars: BTreeMap<String, String>) -> Vm {
        Vm {
            name: self.name.clone(),
            flist: self.flist.clone(),
            flist_checksum: self.flist_checksum.clone(),
            cpu: self.cpu,
            memory_mb: self.memory_mb,
            rootfs_size_mb: 0,
            entrypoint: K3S_ENTRYPOINT.to_string(),
            env_vars,
            mounts: vec![Mount {
                disk_name: self.disk_name(),
                mount_point: K3S_DATA_DIR.to_string(),
            }],
            publicip: self.publicip,
            publicip6: self.publicip6,
            planetary: self.planetary,
            corex: false,
            description: String::new(),
            ip: self.ip,
            computed_ip: String::new(),
            computed_ip6: String::new(),
            ygg_ip: String::new(),
            console_url: String::new(),
        }
    }

    /// Disk, optional public ip, machine.
    fn to_workloads(
        &self,
        network: &str,
        env_vars: BTreeMap<String, String>,
    ) -> CoreResult<Vec<Workload>> {
        let disk = Disk {
            name: self.disk_name(),
            size_gb: self.disk_size_gb,
            description: String::new(),
        };
        let mut workloads = vec![disk.to_workload()?];
        workloads.extend(self.machine(env_vars).to_workloads(network)?);
        Ok(workloads)
    }

    fn from_workloads(node: NodeId, machine: &Workload, deployment: &Deployment) -> CoreResult<Self> {
        let vm = Vm::from_workloads(machine, deployment)?;
        let disk_name = format!("{}disk", vm.name);
        let disk_size_gb = match deployment.workload(&disk_name) {
            Some(disk) => disk.data_as::<ZMountData>()?.size / GIB,
            None => 0,
        };
        Ok(Self {
            name: vm.name,
            node,
            disk_size_gb,
            flist: vm.flist,
            flist_checksum: String::new(),
            cpu: vm.cpu,
            memory_mb: vm.memory_mb,
            publicip: vm.publicip,
            publicip6: vm.publicip6,
            planetary: vm.planetary,
            ip: vm.ip,
            computed_ip: vm.computed_ip,
            computed_ip6: vm.computed_ip6,
            ygg_ip: vm.ygg_ip,
            console_url: vm.console_url,
        })
    }
}

impl Matchable for K8sNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn carry_over(&mut self, previous: &Self) {
        if self.flist_checksum.is_empty() {
            self.flist_checksum = previous.flist_checksum.clone();
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct K8sCluster {
    pub name: String,
    pub network_name: String,
    /// Cluster join token shared by every node.
    pub token: String,
    #[serde(default)]
    pub ssh_key: String,
    pub master: K8sNode,
    #[serde(default)]
    pub workers: Vec<K8sNode>,
    #[serde(default)]
    pub node_deployment_ids: BTreeMap<NodeId, ContractId>,
}

impl K8sCluster {
    pub fn validate(&self) -> DeployResult<()> {
        if self.token.is_empty() {
            return Err(DeployError::Validation(format!(
                "k8s cluster {} needs a token",
                self.name
            )));
        }
        if self.network_name.is_empty() {
            return Err(DeployError::Validation(format!(
                "k8s cluster {} needs a network",
                self.name
            )));
        }
        let mut names = BTreeSet::new();
        for node in std::iter::once(&self.master).chain(&self.workers) {
            let mut claimed = vec![node.name.clone(), node.disk_name()];
            if node.publicip || node.publicip6 {
                claimed.push(format!("{}ip", node.name));
            }
            for name in claimed {
                if !names.insert(name.clone()) {
                    return Err(DeployError::Validation(format!(
                        "duplicate k8s node name {name:?} in cluster {}",
                        self.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Grid nodes hosting at least one cluster node.
    pub fn nodes(&self) -> BTreeSet<NodeId> {
        std::iter::once(&self.master)
            .chain(&self.workers)
            .map(|n| n.node)
            .collect()
    }

    fn env_vars(&self, node: &K8sNode, master_url: &str) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("SSH_KEY".to_string(), self.ssh_key.clone()),
            ("K3S_TOKEN".to_string(), self.token.clone()),
            ("K3S_DATA_DIR".to_string(), K3S_DATA_DIR.to_string()),
            ("K3S_FLANNEL_IFACE".to_string(), K3S_FLANNEL_IFACE.to_string()),
            ("K3S_NODE_NAME".to_string(), node.name.clone()),
            ("K3S_URL".to_string(), master_url.to_string()),
        ])
    }
}

pub struct K8sReconciler {
    cluster: K8sCluster,
    twin_id: TwinId,
    deployer: Arc<dyn ContractConvergence>,
}

impl K8sReconciler {
    pub fn new(cluster: K8sCluster, twin_id: TwinId, deployer: Arc<dyn ContractConvergence>) -> Self {
        Self {
            cluster,
            twin_id,
            deployer,
        }
    }

    pub fn cluster(&self) -> &K8sCluster {
        &self.cluster
    }

    pub fn cluster_mut(&mut self) -> &mut K8sCluster {
        &mut self.cluster
    }

    fn contract_of(&self, node: NodeId) -> ContractId {
        self.cluster
            .node_deployment_ids
            .get(&node)
            .copied()
            .unwrap_or(0)
    }

    fn assign_ips(&mut self, state: &LocalState) -> DeployResult<()> {
        let network = self.cluster.network_name.clone();
        for node in self.cluster.nodes() {
            let ledger = state.network(&network);
            let subnet = ledger
                .and_then(|l| l.node_subnet(node))
                .ok_or_else(|| DeployError::NodeNotInNetwork {
                    node,
                    network: network.clone(),
                })?;
            let used = ledger
                .map(|l| l.used_host_ids_excluding(node, self.contract_of(node)))
                .unwrap_or_default();

            let cluster = &mut self.cluster;
            let ips: Vec<&mut Option<Ipv4Addr>> = std::iter::once(&mut cluster.master)
                .chain(cluster.workers.iter_mut())
                .filter(|n| n.node == node)
                .map(|n| &mut n.ip)
                .collect();
            assign_private_ips(subnet, &used, ips)?;
        }
        Ok(())
    }

    /// Drop ledger entries of contracts this cluster no longer holds.
    fn release_stale(&self, state: &mut LocalState, previous: &BTreeMap<NodeId, ContractId>) {
        let Some(ledger) = state.networks.get_mut(&self.cluster.network_name) else {
            return;
        };
        for (&node, &contract) in previous {
            if self.cluster.node_deployment_ids.get(&node) != Some(&contract) {
                ledger.delete_deployment_host_ids(node, contract);
            }
        }
    }

    fn record_host_ids(&self, state: &mut LocalState) {
        for (&node, &contract) in &self.cluster.node_deployment_ids {
            let ids: Vec<u8> = std::iter::once(&self.cluster.master)
                .chain(&self.cluster.workers)
                .filter(|n| n.node == node)
                .filter_map(|n| n.ip)
                .map(host_id)
                .collect();
            if ids.is_empty() {
                if let Some(ledger) = state.networks.get_mut(&self.cluster.network_name) {
                    ledger.delete_deployment_host_ids(node, contract);
                }
            } else {
                state
                    .network_mut(&self.cluster.network_name)
                    .set_deployment_host_ids(node, contract, ids);
            }
        }
    }
}

#[async_trait]
impl Reconciler for K8sReconciler {
    fn kind(&self) -> &'static str {
        "k8s"
    }

    fn name(&self) -> &str {
        &self.cluster.name
    }

    async fn generate(
        &mut self,
        state: &mut LocalState,
    ) -> DeployResult<BTreeMap<NodeId, Deployment>> {
        self.cluster.validate()?;
        self.assign_ips(state)?;

        let cluster = &self.cluster;
        let master_ip = cluster.master.ip.ok_or_else(|| {
            DeployError::Validation(format!("k8s master {} has no private ip", cluster.master.name))
        })?;
        let worker_url = format!("https://{master_ip}:{K3S_API_PORT}");

        let mut workloads: BTreeMap<NodeId, Vec<Workload>> = BTreeMap::new();
        workloads.entry(cluster.master.node).or_default().extend(
            cluster
                .master
                .to_workloads(&cluster.network_name, cluster.env_vars(&cluster.master, ""))?,
        );
        for worker in &cluster.workers {
            workloads.entry(worker.node).or_default().extend(
                worker.to_workloads(&cluster.network_name, cluster.env_vars(worker, &worker_url))?,
            );
        }

        Ok(workloads
            .into_iter()
            .map(|(node, workloads)| (node, Deployment::new(self.twin_id, workloads)))
            .collect())
    }

    async fn deploy(&mut self, state: &mut LocalState) -> DeployResult<()> {
        let desired = self.generate(state).await?;
        let previous = self.cluster.node_deployment_ids.clone();
        let outcome = self.deployer.deploy(&desired, &previous).await;
        let result = apply_convergence(outcome, &mut self.cluster.node_deployment_ids);
        self.release_stale(state, &previous);
        if result.is_ok() {
            info!(
                cluster = %self.cluster.name,
                nodes = self.cluster.node_deployment_ids.len(),
                "k8s cluster deployed"
            );
        }
        result
    }

    async fn sync(&mut self, state: &mut LocalState) -> DeployResult<()> {
        let previous = self.cluster.node_deployment_ids.clone();
        self.deployer
            .delete_invalid_contracts(&mut self.cluster.node_deployment_ids)
            .await?;
        self.release_stale(state, &previous);

        let deployments = self
            .deployer
            .get_deployment_objects(&self.cluster.node_deployment_ids)
            .await?;

        let master_name = self.cluster.master.name.clone();
        let mut master = None;
        let mut workers = Vec::new();
        for (&node, deployment) in &deployments {
            let machines = deployment
                .workloads
                .iter()
                .filter(|w| w.workload_type == WorkloadType::ZMachine && w.is_ok());
            for machine in machines {
                match K8sNode::from_workloads(node, machine, deployment) {
                    Ok(observed) if observed.name == master_name => master = Some(observed),
                    Ok(observed) => workers.push(observed),
                    Err(e) => {
                        warn!(node, workload = %machine.name, error = %e, "skipping unreadable k8s node")
                    }
                }
            }
        }

        match master {
            Some(mut observed) => {
                observed.carry_over(&self.cluster.master);
                self.cluster.master = observed;
            }
            None => warn!(cluster = %self.cluster.name, "k8s master not found on the grid"),
        }
        self.cluster.workers = match_by_name(&self.cluster.workers, workers);
        self.record_host_ids(state);
        Ok(())
    }

    async fn cancel(&mut self, state: &mut LocalState) -> DeployResult<()> {
        let previous = self.cluster.node_deployment_ids.clone();
        let outcome = self.deployer.deploy(&BTreeMap::new(), &previous).await;
        let result = apply_convergence(outcome, &mut self.cluster.node_deployment_ids);
        self.release_stale(state, &previous);
        result?;
        info!(cluster = %self.cluster.name, "k8s cluster canceled");
        Ok(())
    }

    fn snapshot(&self) -> DeployResult<serde_json::Value> {
        Ok(serde_json::to_value(&self.cluster).map_err(|e| gridmesh_core::CoreError::Encode {
            workload: self.cluster.name.clone(),
            message: e.to_string(),
        })?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn k8s_node(name: &str, node: NodeId) -> K8sNode {
        K8sNode {
            name: name.into(),
            node,
            disk_size_gb: 5,
            flist: K3S_FLIST.into(),
            flist_checksum: String::new(),
            cpu: 2,
            memory_mb: 2048,
            publicip: false,
            publicip6: false,
            planetary: false,
            ip: None,
            computed_ip: String::new(),
            computed_ip6: String::new(),
            ygg_ip: String::new(),
            console_url: String::new(),
        }
    }

    fn cluster() -> K8sCluster {
        K8sCluster {
            name: "k3s".into(),
            network_name: "net".into(),
            token: "secret".into(),
            ssh_key: "ssh-ed25519 AAAA".into(),
            master: k8s_node("master", 1),
            workers: vec![k8s_node("w1", 2), k8s_node("w2", 2)],
            node_deployment_ids: BTreeMap::new(),
        }
    }

    #[test]
    fn worker_env_points_at_master() {
        let cluster = cluster();
        let env = cluster.env_vars(&cluster.workers[0], "https://10.1.2.2:6443");
        assert_eq!(env["K3S_URL"], "https://10.1.2.2:6443");
        assert_eq!(env["K3S_NODE_NAME"], "w1");
        assert_eq!(env["K3S_DATA_DIR"], K3S_DATA_DIR);
        assert_eq!(env["K3S_FLANNEL_IFACE"], "eth0");
    }

    #[test]
    fn node_renders_disk_then_machine() {
        let mut node = k8s_node("w1", 2);
        node.ip = Some(Ipv4Addr::new(10, 1, 3, 2));
        node.publicip = true;
        let workloads = node.to_workloads("net", BTreeMap::new()).unwrap();
        let names: Vec<&str> = workloads.iter().map(|w| w.name.as_str()).collect();
        assert_eq!(names, ["w1disk", "w1ip", "w1"]);
    }

    #[test]
    fn duplicate_node_names_are_rejected() {
        let mut cluster = cluster();
        cluster.workers.push(k8s_node("w1", 3));
        assert!(matches!(cluster.validate(), Err(DeployError::Validation(_))));
    }

    #[test]
    fn missing_token_is_rejected() {
        let mut cluster = cluster();
        cluster.token.clear();
        assert!(cluster.validate().is_err());
    }

    #[test]
    fn nodes_are_deduplicated() {
        assert_eq!(cluster().nodes(), BTreeSet::from([1, 2]));
    }
}
