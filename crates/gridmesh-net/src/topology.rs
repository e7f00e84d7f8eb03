//! Topology builder: turns a `Network` record into one network deployment
//! per node.
//!
//! A build runs in two phases:
//! 1. Remote lookups (endpoint discovery, access node probing, port
//!    selection), fanned out per node and joined.
//! 2. Pure assignment over a copy of the record (subnets, keys, ports,
//!    peers), swapped in only when everything succeeded.
//!
//! A cancelled or failed build leaves the record untouched.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;
use gridmesh_core::{
    ClientError, Deployment, GridConfig, NetworkData, NodeId, Peer, TwinId, Workload, WorkloadType,
};
use ipnet::Ipv4Net;
use rand::seq::SliceRandom;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::allocator::{
    FIRST_HOST_ID, LAST_HOST_ID, WG_TRANSPORT_SUPERNET, next_free_subnet, subnet_octet,
    subnet_routes, wg_transport_ip,
};
use crate::client::{NodeRpc, PublicNodeFinder};
use crate::endpoint::{Endpoint, discover_endpoint};
use crate::error::{NetError, NetResult};
use crate::keys::{WgKeyPair, public_key_of};
use crate::network::{ExternalAccess, Network};
use crate::wgconfig::ClientConfig;

/// Knobs of the topology builder.
#[derive(Debug, Clone)]
pub struct TopologySettings {
    /// Twin owning the rendered deployments.
    pub twin_id: TwinId,
    /// Listen ports are picked at random from this range.
    pub wg_port_range: RangeInclusive<u16>,
    /// Liveness probe timeout for access node candidates.
    pub probe_timeout: Duration,
}

impl TopologySettings {
    pub fn from_config(config: &GridConfig) -> Self {
        Self {
            twin_id: config.grid.twin_id,
            wg_port_range: config.wg_port_range(),
            probe_timeout: config.probe_timeout(),
        }
    }
}

/// Result of a build.
#[derive(Debug, Clone)]
pub struct Topology {
    /// One deployment per member node, each holding a single network workload.
    pub deployments: BTreeMap<NodeId, Deployment>,
    /// `wg-quick` config for the external client, when requested.
    pub access_config: Option<String>,
    /// Nodes with a public endpoint, the access node included.
    pub accessible: BTreeMap<NodeId, Endpoint>,
    pub hidden: BTreeSet<NodeId>,
    pub access_node: Option<NodeId>,
}

pub struct TopologyBuilder {
    rpc: Arc<dyn NodeRpc>,
    finder: Arc<dyn PublicNodeFinder>,
    settings: TopologySettings,
    cancel: CancellationToken,
}

impl TopologyBuilder {
    pub fn new(
        rpc: Arc<dyn NodeRpc>,
        finder: Arc<dyn PublicNodeFinder>,
        settings: TopologySettings,
    ) -> Self {
        Self {
            rpc,
            finder,
            settings,
            cancel: CancellationToken::new(),
        }
    }

    /// Abort outstanding node calls when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn settings(&self) -> &TopologySettings {
        &self.settings
    }

    /// Build the mesh for `network`, updating its recorded assignments.
    pub async fn build(&self, network: &mut Network) -> NetResult<Topology> {
        network.validate()?;
        let requested = network.requested();

        // ── Remote lookups ─────────────────────────────────────────
        let mut accessible = BTreeMap::new();
        let mut hidden = BTreeSet::new();
        for (node, endpoint) in self.classify(&requested).await? {
            match endpoint {
                Some(endpoint) => {
                    accessible.insert(node, endpoint);
                }
                None => {
                    hidden.insert(node);
                }
            }
        }

        let needs_access = network.add_wg_access || (!hidden.is_empty() && requested.len() > 1);
        let access_node = if needs_access {
            Some(self.select_access_node(network, &mut accessible).await?)
        } else {
            None
        };

        let members: BTreeSet<NodeId> = accessible.keys().chain(hidden.iter()).copied().collect();
        let new_ports = self.collect_ports(network, &members).await?;

        // ── Assignment ─────────────────────────────────────────────
        let mut next = network.clone();
        next.access_node = access_node;
        assign_subnets(&mut next, &members)?;
        assign_keys(&mut next, &members);
        next.ports.retain(|node, _| members.contains(node));
        next.ports.extend(new_ports);

        let mesh = Mesh::new(&next, &accessible, &hidden)?;
        let mut deployments = BTreeMap::new();
        for &node in &members {
            deployments.insert(node, mesh.render(node, self.settings.twin_id)?);
        }
        let access_config = mesh.client_config()?;
        next.access_wg_config = access_config.clone().unwrap_or_default();

        *network = next;
        info!(
            network = %network.name,
            nodes = members.len(),
            hidden = hidden.len(),
            access_node = ?access_node,
            "network topology built"
        );

        Ok(Topology {
            deployments,
            access_config,
            accessible,
            hidden,
            access_node,
        })
    }

    /// Endpoint of every requested node; `None` marks a hidden node.
    async fn classify(
        &self,
        nodes: &BTreeSet<NodeId>,
    ) -> NetResult<Vec<(NodeId, Option<Endpoint>)>> {
        let rpc = self.rpc.as_ref();
        let probes = nodes.iter().map(|&node| async move {
            match discover_endpoint(rpc, node).await {
                Ok(endpoint) => Ok((node, Some(endpoint))),
                Err(NetError::NoAccessibleInterface(_)) => {
                    debug!(node, "node is hidden");
                    Ok((node, None))
                }
                Err(e) => Err(e),
            }
        });
        self.cancellable(try_join_all(probes)).await
    }

    /// Pick the node relaying traffic for hidden nodes and external clients.
    ///
    /// The chosen node is added to `accessible`.
    async fn select_access_node(
        &self,
        network: &Network,
        accessible: &mut BTreeMap<NodeId, Endpoint>,
    ) -> NetResult<NodeId> {
        if let Some(previous) = network.access_node {
            if accessible.contains_key(&previous) {
                return Ok(previous);
            }
            if !network.nodes.contains(&previous) {
                match self.probe(previous).await {
                    Ok(endpoint) => {
                        accessible.insert(previous, endpoint);
                        return Ok(previous);
                    }
                    Err(NetError::Cancelled) => return Err(NetError::Cancelled),
                    Err(e) => {
                        warn!(node = previous, error = %e, "previous access node is no longer accessible");
                    }
                }
            }
        }

        if let Some((&node, _)) = accessible.iter().find(|(_, endpoint)| endpoint.is_ipv4()) {
            debug!(node, "requested node chosen as access node");
            return Ok(node);
        }

        let candidates = self
            .cancellable(async {
                self.finder
                    .public_nodes(&network.nodes)
                    .await
                    .map_err(NetError::Discovery)
            })
            .await?;
        for candidate in candidates {
            match self.probe(candidate).await {
                Ok(endpoint) => {
                    info!(node = candidate, %endpoint, "public node chosen as access node");
                    accessible.insert(candidate, endpoint);
                    return Ok(candidate);
                }
                Err(NetError::Cancelled) => return Err(NetError::Cancelled),
                Err(e) => {
                    warn!(node = candidate, error = %e, "access node candidate failed liveness probe");
                }
            }
        }
        Err(NetError::PublicNodeRequired)
    }

    /// Liveness probe: endpoint discovery bounded by the probe timeout.
    async fn probe(&self, node: NodeId) -> NetResult<Endpoint> {
        let timeout = self.settings.probe_timeout;
        self.cancellable(async move {
            tokio::time::timeout(timeout, discover_endpoint(self.rpc.as_ref(), node))
                .await
                .map_err(|_| NetError::Rpc {
                    node,
                    source: ClientError::Unreachable(format!("no answer within {timeout:?}")),
                })?
        })
        .await
    }

    /// A free listen port for every member without a recorded one.
    async fn collect_ports(
        &self,
        network: &Network,
        members: &BTreeSet<NodeId>,
    ) -> NetResult<BTreeMap<NodeId, u16>> {
        let rpc = self.rpc.as_ref();
        let range = &self.settings.wg_port_range;
        let lookups = members
            .iter()
            .copied()
            .filter(|node| !network.ports.contains_key(node))
            .map(|node| async move {
                let used = rpc
                    .network_list_wg_ports(node)
                    .await
                    .map_err(|source| NetError::Rpc { node, source })?;
                let port = pick_free_port(range.clone(), &used).ok_or(NetError::NoFreePort(node))?;
                debug!(node, port, "wireguard port selected");
                Ok::<_, NetError>((node, port))
            });
        Ok(self
            .cancellable(try_join_all(lookups))
            .await?
            .into_iter()
            .collect())
    }

    async fn cancellable<T>(&self, fut: impl Future<Output = NetResult<T>>) -> NetResult<T> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(NetError::Cancelled),
            res = fut => res,
        }
    }
}

fn pick_free_port(range: RangeInclusive<u16>, used: &[u16]) -> Option<u16> {
    let free: Vec<u16> = range.filter(|port| !used.contains(port)).collect();
    free.choose(&mut rand::thread_rng()).copied()
}

/// Give every member (and the external client) a /24, keeping recorded
/// subnets that are still valid.
fn assign_subnets(network: &mut Network, members: &BTreeSet<NodeId>) -> NetResult<()> {
    let range = network.ip_range;
    let reusable = |subnet: Ipv4Net, used: &[u8]| {
        let octet = subnet_octet(subnet);
        subnet.prefix_len() == 24
            && range.contains(&subnet)
            && (FIRST_HOST_ID..=LAST_HOST_ID).contains(&octet)
            && !used.contains(&octet)
    };

    let mut used = Vec::new();
    let mut subnets = BTreeMap::new();
    for &node in members {
        if let Some(&subnet) = network.subnets.get(&node) {
            if reusable(subnet, &used) {
                used.push(subnet_octet(subnet));
                subnets.insert(node, subnet);
            }
        }
    }

    let mut external = None;
    if network.add_wg_access {
        let recorded = network.external.as_ref();
        let subnet = match recorded.map(|ext| ext.subnet).filter(|s| reusable(*s, &used)) {
            Some(subnet) => subnet,
            None => next_free_subnet(range, &used)?,
        };
        used.push(subnet_octet(subnet));
        let private_key = recorded
            .map(|ext| ext.private_key.clone())
            .filter(|key| WgKeyPair::from_private_base64(key).is_ok())
            .unwrap_or_else(|| WgKeyPair::generate().private_base64());
        external = Some(ExternalAccess {
            subnet,
            private_key,
        });
    }

    for &node in members {
        if !subnets.contains_key(&node) {
            let subnet = next_free_subnet(range, &used)?;
            used.push(subnet_octet(subnet));
            debug!(node, %subnet, "subnet assigned");
            subnets.insert(node, subnet);
        }
    }

    network.subnets = subnets;
    network.external = external;
    Ok(())
}

/// Keep valid recorded keys, generate the rest.
fn assign_keys(network: &mut Network, members: &BTreeSet<NodeId>) {
    network.keys.retain(|node, key| {
        members.contains(node) && WgKeyPair::from_private_base64(key).is_ok()
    });
    for &node in members {
        network
            .keys
            .entry(node)
            .or_insert_with(|| WgKeyPair::generate().private_base64());
    }
}

/// Fully assigned network plus classification, ready for peer rendering.
struct Mesh<'a> {
    network: &'a Network,
    accessible: &'a BTreeMap<NodeId, Endpoint>,
    hidden: &'a BTreeSet<NodeId>,
    public_keys: BTreeMap<NodeId, String>,
    external_public_key: Option<String>,
}

impl<'a> Mesh<'a> {
    fn new(
        network: &'a Network,
        accessible: &'a BTreeMap<NodeId, Endpoint>,
        hidden: &'a BTreeSet<NodeId>,
    ) -> NetResult<Self> {
        let public_keys: BTreeMap<NodeId, String> = network
            .keys
            .iter()
            .map(|(node, key)| public_key_of(key).map(|public| (*node, public)))
            .collect::<NetResult<_>>()?;
        let external_public_key = network
            .external
            .as_ref()
            .map(|ext| public_key_of(&ext.private_key))
            .transpose()?;
        Ok(Self {
            network,
            accessible,
            hidden,
            public_keys,
            external_public_key,
        })
    }

    fn missing(&self, what: &str, node: NodeId) -> NetError {
        NetError::InvalidNetwork(format!("{}: node {node} has no {what}", self.network.name))
    }

    fn subnet(&self, node: NodeId) -> NetResult<Ipv4Net> {
        self.network
            .subnets
            .get(&node)
            .copied()
            .ok_or_else(|| self.missing("subnet", node))
    }

    fn port(&self, node: NodeId) -> NetResult<u16> {
        self.network
            .ports
            .get(&node)
            .copied()
            .ok_or_else(|| self.missing("listen port", node))
    }

    fn public_key(&self, node: NodeId) -> NetResult<String> {
        self.public_keys
            .get(&node)
            .cloned()
            .ok_or_else(|| self.missing("key", node))
    }

    /// `ip:port` of an accessible node, empty for a hidden one.
    fn endpoint(&self, node: NodeId) -> NetResult<String> {
        match self.accessible.get(&node) {
            Some(endpoint) => Ok(endpoint.with_port(self.port(node)?)),
            None => Ok(String::new()),
        }
    }

    fn peer(&self, node: NodeId, allowed_ips: Vec<Ipv4Net>) -> NetResult<Peer> {
        Ok(Peer {
            subnet: self.subnet(node)?,
            wireguard_public_key: self.public_key(node)?,
            allowed_ips,
            endpoint: self.endpoint(node)?,
        })
    }

    fn peers(&self, node: NodeId) -> NetResult<Vec<Peer>> {
        let access = self.network.access_node;

        // Hidden nodes route the whole mesh through the access node.
        if self.hidden.contains(&node) {
            return match access {
                Some(access) => Ok(vec![self.peer(
                    access,
                    vec![self.network.ip_range, WG_TRANSPORT_SUPERNET],
                )?]),
                None => Ok(Vec::new()),
            };
        }

        let mut peers = Vec::new();
        for &other in self.accessible.keys() {
            if other == node {
                continue;
            }
            let mut allowed_ips = subnet_routes(self.subnet(other)?).to_vec();
            if Some(other) == access {
                for &hidden in self.hidden {
                    allowed_ips.extend(subnet_routes(self.subnet(hidden)?));
                }
                if let Some(ext) = &self.network.external {
                    allowed_ips.extend(subnet_routes(ext.subnet));
                }
            }
            peers.push(self.peer(other, allowed_ips)?);
        }

        if Some(node) == access {
            for &hidden in self.hidden {
                peers.push(self.peer(hidden, subnet_routes(self.subnet(hidden)?).to_vec())?);
            }
            if let (Some(ext), Some(public_key)) = (&self.network.external, &self.external_public_key)
            {
                peers.push(Peer {
                    subnet: ext.subnet,
                    wireguard_public_key: public_key.clone(),
                    allowed_ips: subnet_routes(ext.subnet).to_vec(),
                    endpoint: String::new(),
                });
            }
        }
        Ok(peers)
    }

    fn render(&self, node: NodeId, twin_id: TwinId) -> NetResult<Deployment> {
        let data = NetworkData {
            ip_range: self.network.ip_range,
            subnet: self.subnet(node)?,
            wireguard_private_key: self
                .network
                .keys
                .get(&node)
                .cloned()
                .ok_or_else(|| self.missing("key", node))?,
            wireguard_listen_port: self.port(node)?,
            peers: self.peers(node)?,
        };
        let workload = Workload::new(&self.network.name, WorkloadType::Network, &data)?
            .with_description(&self.network.description);
        Ok(Deployment::new(twin_id, vec![workload]))
    }

    fn client_config(&self) -> NetResult<Option<String>> {
        let (Some(ext), Some(access)) = (&self.network.external, self.network.access_node) else {
            return Ok(None);
        };
        let config = ClientConfig {
            address: wg_transport_ip(ext.subnet),
            private_key: ext.private_key.clone(),
            peer_public_key: self.public_key(access)?,
            allowed_ips: vec![self.network.ip_range, WG_TRANSPORT_SUPERNET],
            endpoint: self.endpoint(access)?,
        };
        Ok(Some(config.render()))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::net::IpAddr;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::client::{PublicConfig, ZOS_INTERFACE};

    #[derive(Default, Clone)]
    struct FakeNode {
        ipv4: Option<&'static str>,
        ipv6: Option<&'static str>,
        down: bool,
        used_ports: Vec<u16>,
    }

    #[derive(Default)]
    struct FakeGrid {
        nodes: HashMap<NodeId, FakeNode>,
        public_nodes: Vec<NodeId>,
        config_calls: Mutex<Vec<NodeId>>,
    }

    impl FakeGrid {
        fn with(mut self, node: NodeId, fake: FakeNode) -> Self {
            self.nodes.insert(node, fake);
            self
        }

        fn node(&self, node: NodeId) -> Result<&FakeNode, ClientError> {
            let fake = self
                .nodes
                .get(&node)
                .ok_or_else(|| ClientError::NotFound(format!("node {node}")))?;
            if fake.down {
                return Err(ClientError::Unreachable(format!("node {node}")));
            }
            Ok(fake)
        }
    }

    fn public(ip: &'static str) -> FakeNode {
        FakeNode {
            ipv4: Some(ip),
            ..Default::default()
        }
    }

    fn hidden() -> FakeNode {
        FakeNode::default()
    }

    #[async_trait]
    impl NodeRpc for FakeGrid {
        async fn network_list_interfaces(
            &self,
            node: NodeId,
        ) -> Result<HashMap<String, Vec<IpAddr>>, ClientError> {
            self.node(node)?;
            Ok(HashMap::from([(
                ZOS_INTERFACE.to_string(),
                vec!["10.10.0.5".parse().unwrap()],
            )]))
        }

        async fn network_get_public_config(&self, node: NodeId) -> Result<PublicConfig, ClientError> {
            self.config_calls.lock().unwrap().push(node);
            let fake = self.node(node)?;
            if fake.ipv4.is_none() && fake.ipv6.is_none() {
                return Err(ClientError::NotFound("public config".into()));
            }
            Ok(PublicConfig {
                ipv4: fake.ipv4.map(|ip| format!("{ip}/24").parse().unwrap()),
                ipv6: fake.ipv6.map(|ip| format!("{ip}/64").parse().unwrap()),
                ..Default::default()
            })
        }

        async fn network_list_wg_ports(&self, node: NodeId) -> Result<Vec<u16>, ClientError> {
            Ok(self.node(node)?.used_ports.clone())
        }
    }

    #[async_trait]
    impl PublicNodeFinder for FakeGrid {
        async fn public_nodes(&self, _preferred: &[NodeId]) -> Result<Vec<NodeId>, ClientError> {
            Ok(self.public_nodes.clone())
        }
    }

    fn settings() -> TopologySettings {
        TopologySettings {
            twin_id: 42,
            wg_port_range: 2000..=7999,
            probe_timeout: Duration::from_secs(1),
        }
    }

    fn builder(grid: FakeGrid) -> (TopologyBuilder, Arc<FakeGrid>) {
        let grid = Arc::new(grid);
        let builder = TopologyBuilder::new(grid.clone(), grid.clone(), settings());
        (builder, grid)
    }

    fn network(nodes: Vec<NodeId>) -> Network {
        Network::new("mesh", "10.20.0.0/16".parse().unwrap(), nodes)
    }

    fn data(topology: &Topology, node: NodeId) -> NetworkData {
        topology.deployments[&node].workloads[0].data_as().unwrap()
    }

    #[tokio::test]
    async fn accessible_nodes_peer_with_each_other() {
        let (builder, _) = builder(
            FakeGrid::default()
                .with(10, public("185.1.1.10"))
                .with(11, public("185.1.1.11")),
        );
        let mut net = network(vec![10, 11]);
        let topology = builder.build(&mut net).await.unwrap();

        assert_eq!(topology.deployments.len(), 2);
        assert_eq!(topology.access_node, None);
        assert!(topology.access_config.is_none());

        let d10 = data(&topology, 10);
        let d11 = data(&topology, 11);
        assert_eq!(d10.peers.len(), 1);
        assert_eq!(d11.peers.len(), 1);
        assert_eq!(d10.peers[0].subnet, d11.subnet);
        assert_eq!(d11.peers[0].subnet, d10.subnet);
        assert_eq!(
            d10.peers[0].allowed_ips,
            vec![d11.subnet, wg_transport_ip(d11.subnet)]
        );
        assert_eq!(
            d10.peers[0].endpoint,
            format!("185.1.1.11:{}", d11.wireguard_listen_port)
        );
        assert_eq!(
            d11.peers[0].wireguard_public_key,
            public_key_of(&d10.wireguard_private_key).unwrap()
        );
        assert_ne!(d10.subnet, d11.subnet);
        assert!(net.ip_range.contains(&d10.subnet));
    }

    #[tokio::test]
    async fn hidden_node_routes_through_access_node() {
        let (builder, _) = builder(
            FakeGrid::default()
                .with(10, public("185.1.1.10"))
                .with(20, hidden()),
        );
        let mut net = network(vec![10, 20]);
        let topology = builder.build(&mut net).await.unwrap();

        assert_eq!(topology.access_node, Some(10));
        assert_eq!(net.access_node, Some(10));
        assert!(topology.hidden.contains(&20));

        let d10 = data(&topology, 10);
        let d20 = data(&topology, 20);

        assert_eq!(d20.peers.len(), 1);
        assert_eq!(d20.peers[0].subnet, d10.subnet);
        assert_eq!(
            d20.peers[0].allowed_ips,
            vec![net.ip_range, WG_TRANSPORT_SUPERNET]
        );
        assert!(d20.peers[0].endpoint.starts_with("185.1.1.10:"));

        assert_eq!(d10.peers.len(), 1);
        assert_eq!(d10.peers[0].subnet, d20.subnet);
        assert!(d10.peers[0].allowed_ips.contains(&d20.subnet));
        assert!(d10.peers[0].endpoint.is_empty());
    }

    #[tokio::test]
    async fn access_node_aggregates_hidden_routes_for_other_peers() {
        let (builder, _) = builder(
            FakeGrid::default()
                .with(10, public("185.1.1.10"))
                .with(11, public("185.1.1.11"))
                .with(20, hidden()),
        );
        let mut net = network(vec![10, 11, 20]);
        let topology = builder.build(&mut net).await.unwrap();
        assert_eq!(topology.access_node, Some(10));

        let d11 = data(&topology, 11);
        let d20 = data(&topology, 20);
        let via_access = d11.peers.iter().find(|p| p.subnet == net.subnets[&10]).unwrap();
        assert!(via_access.allowed_ips.contains(&d20.subnet));
        assert!(via_access.allowed_ips.contains(&wg_transport_ip(d20.subnet)));
        // Node 11 has no direct peer for the hidden node.
        assert!(d11.peers.iter().all(|p| p.subnet != d20.subnet));
    }

    #[tokio::test]
    async fn single_hidden_node_needs_no_access_node() {
        let (builder, grid) = builder(FakeGrid::default().with(20, hidden()));
        let mut net = network(vec![20]);
        let topology = builder.build(&mut net).await.unwrap();

        assert_eq!(topology.access_node, None);
        assert_eq!(topology.deployments.len(), 1);
        assert!(data(&topology, 20).peers.is_empty());
        assert_eq!(grid.config_calls.lock().unwrap().as_slice(), &[20]);
    }

    #[tokio::test]
    async fn failing_candidate_is_replaced() {
        let mut grid = FakeGrid::default()
            .with(20, hidden())
            .with(30, FakeNode {
                ipv4: Some("185.1.1.30"),
                down: true,
                ..Default::default()
            })
            .with(31, public("185.1.1.31"));
        grid.public_nodes = vec![30, 31];
        let (builder, _) = builder(grid);

        let mut net = network(vec![20]).with_wg_access(true);
        let topology = builder.build(&mut net).await.unwrap();

        assert_eq!(topology.access_node, Some(31));
        assert!(topology.deployments.contains_key(&31));
        assert!(!topology.deployments.contains_key(&30));

        let config = topology.access_config.clone().unwrap();
        let ext = net.external.clone().unwrap();
        assert!(config.contains(&format!("Address = {}", wg_transport_ip(ext.subnet))));
        assert!(config.contains(&format!("Endpoint = 185.1.1.31:{}", net.ports[&31])));
        assert!(config.contains("AllowedIPs = 10.20.0.0/16, 100.64.0.0/16"));
        assert_eq!(net.access_wg_config, config);

        // The access node peers with the external client.
        let d31 = data(&topology, 31);
        assert!(d31.peers.iter().any(|p| p.subnet == ext.subnet));
    }

    #[tokio::test]
    async fn previous_access_node_is_kept_while_accessible() {
        let mut grid = FakeGrid::default()
            .with(10, public("185.1.1.10"))
            .with(11, public("185.1.1.11"))
            .with(20, hidden())
            .with(31, public("185.1.1.31"))
            .with(32, public("185.1.1.32"));
        grid.public_nodes = vec![31, 32];
        let (builder, _) = builder(grid);

        // Requested: wins over the first IPv4 node.
        let mut net = network(vec![10, 11, 20]);
        net.access_node = Some(11);
        let topology = builder.build(&mut net).await.unwrap();
        assert_eq!(topology.access_node, Some(11));
        assert_eq!(net.access_node, Some(11));

        // Not requested: probed, then wins over the finder's first pick.
        let mut net = network(vec![20]).with_wg_access(true);
        net.access_node = Some(32);
        let topology = builder.build(&mut net).await.unwrap();
        assert_eq!(topology.access_node, Some(32));
        assert!(topology.deployments.contains_key(&32));
        assert!(!topology.deployments.contains_key(&31));
    }

    #[tokio::test]
    async fn failing_previous_access_node_is_replaced() {
        let mut grid = FakeGrid::default()
            .with(20, hidden())
            .with(31, public("185.1.1.31"))
            .with(32, FakeNode {
                ipv4: Some("185.1.1.32"),
                down: true,
                ..Default::default()
            });
        grid.public_nodes = vec![31];
        let (builder, _) = builder(grid);

        let mut net = network(vec![20]).with_wg_access(true);
        net.access_node = Some(32);
        let topology = builder.build(&mut net).await.unwrap();

        assert_eq!(topology.access_node, Some(31));
        assert_eq!(net.access_node, Some(31));
        assert!(!topology.deployments.contains_key(&32));
        assert!(!net.subnets.contains_key(&32));
    }

    #[tokio::test]
    async fn no_public_node_is_fatal() {
        let (builder, _) = builder(
            FakeGrid::default()
                .with(20, hidden())
                .with(21, hidden()),
        );
        let mut net = network(vec![20, 21]);
        let before = net.clone();
        assert!(matches!(
            builder.build(&mut net).await,
            Err(NetError::PublicNodeRequired)
        ));
        assert_eq!(net, before);
    }

    #[tokio::test]
    async fn ipv6_only_requested_node_is_not_preferred_as_access() {
        let mut grid = FakeGrid::default()
            .with(12, FakeNode {
                ipv6: Some("2a02:1802:5e::12"),
                ..Default::default()
            })
            .with(20, hidden())
            .with(31, public("185.1.1.31"));
        grid.public_nodes = vec![31];
        let (builder, _) = builder(grid);

        let mut net = network(vec![12, 20]);
        let topology = builder.build(&mut net).await.unwrap();
        assert_eq!(topology.access_node, Some(31));
        let d12 = data(&topology, 12);
        assert!(d12.peers.iter().any(|p| p.endpoint.starts_with("185.1.1.31:")));
    }

    #[tokio::test]
    async fn rebuild_keeps_assignments() {
        let (builder, _) = builder(
            FakeGrid::default()
                .with(10, public("185.1.1.10"))
                .with(20, hidden()),
        );
        let mut net = network(vec![10, 20]).with_wg_access(true);
        let first = builder.build(&mut net).await.unwrap();
        let recorded = net.clone();
        let second = builder.build(&mut net).await.unwrap();

        assert_eq!(net, recorded);
        assert_eq!(first.access_config, second.access_config);
        assert_eq!(first.deployments, second.deployments);
    }

    #[tokio::test]
    async fn removed_nodes_lose_their_assignments() {
        let (builder, _) = builder(
            FakeGrid::default()
                .with(10, public("185.1.1.10"))
                .with(11, public("185.1.1.11")),
        );
        let mut net = network(vec![10, 11]);
        builder.build(&mut net).await.unwrap();
        let subnet10 = net.subnets[&10];

        net.nodes = vec![10];
        let topology = builder.build(&mut net).await.unwrap();
        assert_eq!(topology.deployments.len(), 1);
        assert_eq!(net.subnets.keys().copied().collect::<Vec<_>>(), vec![10]);
        assert_eq!(net.subnets[&10], subnet10);
        assert!(!net.keys.contains_key(&11));
        assert!(!net.ports.contains_key(&11));
    }

    #[tokio::test]
    async fn out_of_range_subnet_is_reassigned() {
        let (builder, _) = builder(FakeGrid::default().with(10, public("185.1.1.10")));
        let mut net = network(vec![10]);
        net.subnets.insert(10, "10.99.5.0/24".parse().unwrap());
        builder.build(&mut net).await.unwrap();
        assert_eq!(net.subnets[&10], "10.20.2.0/24".parse::<Ipv4Net>().unwrap());
    }

    #[tokio::test]
    async fn ports_avoid_those_in_use() {
        let grid = Arc::new(FakeGrid::default().with(10, FakeNode {
            ipv4: Some("185.1.1.10"),
            used_ports: vec![3000, 3002],
            ..Default::default()
        }));
        let builder = TopologyBuilder::new(
            grid.clone(),
            grid,
            TopologySettings {
                wg_port_range: 3000..=3002,
                ..settings()
            },
        );
        let mut net = network(vec![10]);
        builder.build(&mut net).await.unwrap();
        assert_eq!(net.ports[&10], 3001);
    }

    #[tokio::test]
    async fn unreachable_requested_node_aborts_build() {
        let (builder, _) = builder(
            FakeGrid::default()
                .with(10, public("185.1.1.10"))
                .with(11, FakeNode {
                    down: true,
                    ..Default::default()
                }),
        );
        let mut net = network(vec![10, 11]);
        let before = net.clone();
        assert!(matches!(
            builder.build(&mut net).await,
            Err(NetError::Rpc { node: 11, .. })
        ));
        assert_eq!(net, before);
    }

    #[tokio::test]
    async fn cancelled_build_leaves_network_untouched() {
        let (builder, _) = builder(FakeGrid::default().with(10, public("185.1.1.10")));
        builder.cancellation_token().cancel();
        let mut net = network(vec![10]);
        let before = net.clone();
        assert!(matches!(
            builder.build(&mut net).await,
            Err(NetError::Cancelled)
        ));
        assert_eq!(net, before);
    }

    #[test]
    fn free_port_none_when_range_is_full() {
        assert_eq!(pick_free_port(5..=6, &[5, 6]), None);
        assert_eq!(pick_free_port(5..=6, &[5]), Some(6));
    }
}
