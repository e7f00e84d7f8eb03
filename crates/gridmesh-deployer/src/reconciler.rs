//! The lifecycle every managed resource goes through.

use std::collections::BTreeMap;

use async_trait::async_trait;
use gridmesh_core::{ContractId, Deployment, NodeId};
use gridmesh_state::LocalState;

use crate::error::{DeployError, DeployResult};

/// Generate → deploy → sync → cancel for one resource.
///
/// Every call takes the caller's `LocalState`; the reconciler only mutates
/// it, loading and saving stay with the caller. Calls for the same network
/// or node must be serialized by the caller.
#[async_trait]
pub trait Reconciler: Send {
    /// Resource kind, e.g. `network` or `k8s`.
    fn kind(&self) -> &'static str;

    fn name(&self) -> &str;

    /// Desired deployment per node. Assigns whatever the resource is missing
    /// (subnets, keys, private IPs).
    async fn generate(
        &mut self,
        state: &mut LocalState,
    ) -> DeployResult<BTreeMap<NodeId, Deployment>>;

    /// Generate and converge the grid onto the result. Contracts of nodes
    /// that converged are kept even when others fail.
    async fn deploy(&mut self, state: &mut LocalState) -> DeployResult<()>;

    /// Fold the deployed state back into the resource and the ledger.
    async fn sync(&mut self, state: &mut LocalState) -> DeployResult<()>;

    /// Tear everything down and release ledger entries.
    async fn cancel(&mut self, state: &mut LocalState) -> DeployResult<()>;

    /// JSON snapshot of the persisted fields.
    fn snapshot(&self) -> DeployResult<serde_json::Value>;
}

/// Store the outcome of a convergence in `contracts`, keeping the partial
/// contract map when only some nodes converged.
pub(crate) fn apply_convergence(
    outcome: DeployResult<BTreeMap<NodeId, ContractId>>,
    contracts: &mut BTreeMap<NodeId, ContractId>,
) -> DeployResult<()> {
    match outcome {
        Ok(converged) => {
            *contracts = converged;
            Ok(())
        }
        Err(DeployError::PartialConvergence {
            contracts: partial,
            failures,
        }) => {
            contracts.clone_from(&partial);
            Err(DeployError::PartialConvergence {
                contracts: partial,
                failures,
            })
        }
        Err(e) => Err(e),
    }
}

/// Single-node contract map, empty when `contract` is zero.
pub(crate) fn single_contract(node: NodeId, contract: ContractId) -> BTreeMap<NodeId, ContractId> {
    if contract == 0 {
        BTreeMap::new()
    } else {
        BTreeMap::from([(node, contract)])
    }
}
