//! gridmesh-deployer: reconcilers that converge grid nodes onto declared
//! resources.
//!
//! # Components
//!
//! - **`contract`**: contract convergence over the chain and node collaborators
//! - **`matcher`**: name-stable ordering of observed workloads
//! - **`workloads`**: typed disks, zdbs, qsfs and machines
//! - **`reconciler`**: the generate / deploy / sync / cancel lifecycle
//! - **`network`**, **`deployment`**, **`k8s`**, **`gateway`**: one reconciler per resource kind
//! - **`memory`**: an in-process grid for tests and dry runs

pub mod contract;
pub mod deployment;
pub mod error;
pub mod gateway;
pub mod k8s;
pub mod matcher;
pub mod memory;
pub mod network;
pub mod reconciler;
pub mod workloads;

pub use contract::{
    ChainClient, Contract, ContractConvergence, ContractKind, ContractState, DeployerSettings,
    GridDeployer, NodeDeployments,
};
pub use deployment::{DeploymentReconciler, DeploymentSpec};
pub use error::{DeployError, DeployResult};
pub use gateway::{GatewayFqdn, GatewayFqdnReconciler, GatewayName, GatewayNameReconciler};
pub use k8s::{K8sCluster, K8sNode, K8sReconciler};
pub use matcher::{Matchable, match_by_name};
pub use memory::{MemoryGrid, MemoryNode};
pub use network::{NetworkReconciler, NetworkRecord};
pub use reconciler::Reconciler;
pub use workloads::{Disk, Mount, Qsfs, QsfsMetadata, Vm, Zdb};
