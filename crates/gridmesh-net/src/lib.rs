//! gridmesh-net: WireGuard overlay construction.
//!
//! Turns a set of requested nodes into a fully peered overlay network,
//! relaying through an access node when some nodes are not publicly
//! reachable or when an external client needs a way in.
//!
//! # Components
//!
//! - **`allocator`**: host-id and subnet allocation over "used" octet sets
//! - **`keys`**: WireGuard (x25519) key pairs
//! - **`endpoint`**: public endpoint discovery and classification
//! - **`client`**: traits for the node RPC and public-node discovery collaborators
//! - **`network`**: the persisted network record
//! - **`topology`**: the topology builder (peers, subnets, ports, deployments)
//! - **`wgconfig`**: external client `wg-quick` config rendering

pub mod allocator;
pub mod client;
pub mod endpoint;
pub mod error;
pub mod keys;
pub mod network;
pub mod topology;
pub mod wgconfig;

pub use allocator::{
    HostAllocator, WG_TRANSPORT_SUPERNET, assign_within_subnet, next_free_host_id,
    next_free_subnet, wg_transport_ip,
};
pub use client::{NodeRpc, PublicConfig, PublicNodeFinder};
pub use endpoint::{Endpoint, discover_endpoint};
pub use error::{NetError, NetResult};
pub use keys::WgKeyPair;
pub use network::{ExternalAccess, Network};
pub use topology::{Topology, TopologyBuilder, TopologySettings};
pub use wgconfig::ClientConfig;
