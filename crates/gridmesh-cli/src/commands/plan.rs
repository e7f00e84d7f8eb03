use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use gridmesh_core::{GridConfig, NodeId, TwinId};
use gridmesh_deployer::{
    DeployResult, DeployerSettings, DeploymentReconciler, DeploymentSpec, GatewayFqdn,
    GatewayFqdnReconciler, GatewayName, GatewayNameReconciler, GridDeployer, K8sCluster,
    K8sReconciler, MemoryGrid, MemoryNode, NetworkReconciler, Reconciler,
};
use gridmesh_net::{Network, TopologyBuilder, TopologySettings};
use gridmesh_state::{LocalState, StateStore};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

/// Nodes of the simulated grid plus the resources to plan on it.
#[derive(Debug, Deserialize)]
pub struct Scenario {
    /// Overrides `grid.twin_id` of the config.
    #[serde(default)]
    pub twin_id: Option<TwinId>,
    /// Access node candidates; every public IPv4 node when empty.
    #[serde(default)]
    pub public_nodes: Vec<NodeId>,
    /// Node id → simulated node.
    #[serde(default)]
    pub nodes: BTreeMap<String, MemoryNode>,
    pub network: Network,
    #[serde(default)]
    pub deployments: Vec<DeploymentSpec>,
    #[serde(default)]
    pub k8s: Vec<K8sCluster>,
    #[serde(default)]
    pub fqdn_gateways: Vec<GatewayFqdn>,
    #[serde(default)]
    pub name_gateways: Vec<GatewayName>,
}

impl Scenario {
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    fn grid(&self, twin_id: TwinId) -> anyhow::Result<MemoryGrid> {
        let mut grid = MemoryGrid::new(twin_id).with_public_nodes(self.public_nodes.clone());
        for (id, node) in &self.nodes {
            let id: NodeId = id
                .parse()
                .with_context(|| format!("node id {id:?} is not a number"))?;
            grid = grid.with_node(id, node.clone());
        }
        Ok(grid)
    }
}

/// Outcome of a plan run.
pub struct PlanReport {
    pub network: Box<NetworkReconciler>,
    pub resources: Vec<Box<dyn Reconciler>>,
    pub grid: Arc<MemoryGrid>,
}

impl PlanReport {
    pub fn access_config(&self) -> &str {
        self.network.access_config()
    }

    async fn to_json(&self) -> anyhow::Result<serde_json::Value> {
        let mut resources = serde_json::Map::new();
        resources.insert(
            format!("network/{}", self.network.name()),
            self.network.snapshot()?,
        );
        for rec in &self.resources {
            resources.insert(format!("{}/{}", rec.kind(), rec.name()), rec.snapshot()?);
        }

        let mut nodes = serde_json::Map::new();
        for node in self.network.network().members() {
            nodes.insert(
                node.to_string(),
                serde_json::to_value(self.grid.deployments_on(node).await)?,
            );
        }
        Ok(json!({
            "resources": resources,
            "nodes": nodes,
            "wg_config": self.access_config(),
        }))
    }
}

/// Build the grid and reconcilers, then deploy and sync the network
/// followed by every other resource.
pub async fn run(
    scenario: Scenario,
    config: &GridConfig,
    state: &mut LocalState,
) -> anyhow::Result<(PlanReport, DeployResult<()>)> {
    let twin_id = scenario.twin_id.unwrap_or(config.grid.twin_id);
    let grid = Arc::new(scenario.grid(twin_id)?);
    let deployer = Arc::new(GridDeployer::new(
        grid.clone(),
        grid.clone(),
        DeployerSettings::from_config(config),
    ));
    let mut topology = TopologySettings::from_config(config);
    topology.twin_id = twin_id;
    let builder = Arc::new(TopologyBuilder::new(grid.clone(), grid.clone(), topology));

    let mut network = Box::new(NetworkReconciler::new(
        scenario.network,
        builder,
        deployer.clone(),
    ));
    let mut resources: Vec<Box<dyn Reconciler>> = Vec::new();
    for spec in scenario.deployments {
        resources.push(Box::new(DeploymentReconciler::new(spec, twin_id, deployer.clone())));
    }
    for cluster in scenario.k8s {
        resources.push(Box::new(K8sReconciler::new(cluster, twin_id, deployer.clone())));
    }
    for gateway in scenario.fqdn_gateways {
        resources.push(Box::new(GatewayFqdnReconciler::new(gateway, twin_id, deployer.clone())));
    }
    for gateway in scenario.name_gateways {
        resources.push(Box::new(GatewayNameReconciler::new(gateway, twin_id, deployer.clone())));
    }

    let outcome = apply(network.as_mut(), &mut resources, state).await;
    Ok((
        PlanReport {
            network,
            resources,
            grid,
        },
        outcome,
    ))
}

async fn apply(
    network: &mut NetworkReconciler,
    resources: &mut [Box<dyn Reconciler>],
    state: &mut LocalState,
) -> DeployResult<()> {
    network.deploy(state).await?;
    network.sync(state).await?;
    for rec in resources.iter_mut() {
        info!(kind = rec.kind(), name = %rec.name(), "deploying");
        rec.deploy(state).await?;
        rec.sync(state).await?;
    }
    Ok(())
}

fn save(store: &StateStore, state: &LocalState, report: &PlanReport) -> anyhow::Result<()> {
    store.save_local_state(state)?;
    store.put_resource("network", report.network.name(), &report.network.snapshot()?)?;
    for rec in &report.resources {
        store.put_resource(rec.kind(), rec.name(), &rec.snapshot()?)?;
    }
    Ok(())
}

pub async fn plan(
    scenario: &Path,
    config: Option<&Path>,
    state_path: Option<&Path>,
    format: &str,
) -> anyhow::Result<()> {
    let config = match config {
        Some(path) => GridConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => GridConfig::default(),
    };
    config.validate()?;
    let content = std::fs::read_to_string(scenario)
        .with_context(|| format!("reading scenario {}", scenario.display()))?;
    let scenario = Scenario::from_toml_str(&content)
        .with_context(|| format!("parsing scenario {}", scenario.display()))?;

    let mut state = LocalState::default();
    let (report, outcome) = run(scenario, &config, &mut state).await?;

    if let Some(path) = state_path {
        let store = StateStore::open(path)?;
        save(&store, &state, &report)?;
        info!(path = %path.display(), "local state saved");
    }

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&report.to_json().await?)?),
        _ => print_text(&report, &state),
    }

    if let Err(e) = outcome {
        warn!(error = %e, "plan did not fully converge");
        return Err(e.into());
    }
    Ok(())
}

fn print_text(report: &PlanReport, state: &LocalState) {
    let network = report.network.network();
    println!("network {} ({})", network.name, network.ip_range);
    if let Some(access) = network.access_node {
        println!("  access node: {access}");
    }
    for (node, subnet) in &network.subnets {
        let contract = report.network.contracts().get(node).copied().unwrap_or(0);
        let port = network.ports.get(node).copied().unwrap_or(0);
        println!("  node {node}: subnet {subnet}, port {port}, contract {contract}");
    }
    for rec in &report.resources {
        println!("{} {}", rec.kind(), rec.name());
    }
    if let Some(ledger) = state.network(&network.name) {
        for node in ledger.host_ids.keys() {
            println!("  node {node} host ids in use: {:?}", ledger.used_host_ids(*node));
        }
    }
    if !report.access_config().is_empty() {
        println!();
        println!("{}", report.access_config());
    }
}
