//! Slot-ownership metadata capabilities.

use std::sync::{Arc, Mutex, PoisonError};

use hashbrown::HashMap;
use tracing::info;

use shoal_common::error::{ShoalError, ShoalResult};
use shoal_common::ids::{CLUSTER_SLOTS, NodeId, SlotId};

use crate::slot::SlotBitmap;

/// One known cluster member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterNode {
    /// Gossip-assigned node identifier.
    pub id: NodeId,
    /// Announced client endpoint, `host:port`.
    pub addr: String,
}

/// Local view of the cluster slot→owner map.
///
/// The migration sender consumes this as an injected capability; it never
/// mutates ownership except through [`ClusterState::set_slots`] during the
/// cut-over handshake.
pub trait ClusterState: Send + Sync {
    /// Returns the node currently owning one slot, when known.
    fn node_by_slot(&self, slot: SlotId) -> Option<ClusterNode>;

    /// Resolves a node by identifier.
    fn lookup_node(&self, id: &str) -> Option<ClusterNode>;

    /// Records `node` as the owner of every slot in `slots`.
    ///
    /// # Errors
    ///
    /// Returns `ShoalError::Cluster` when the metadata mutation is rejected,
    /// e.g. because the node is no longer part of the cluster.
    fn set_slots(&self, node: &ClusterNode, slots: &SlotBitmap) -> ShoalResult<()>;
}

/// In-memory slot→owner table, the reference [`ClusterState`] implementation.
#[derive(Debug)]
pub struct StaticClusterState {
    inner: Mutex<StateInner>,
}

#[derive(Debug)]
struct StateInner {
    nodes: HashMap<NodeId, ClusterNode>,
    owners: Vec<Option<NodeId>>,
}

impl StaticClusterState {
    /// Creates a cluster view with the given members and no slot assignments.
    #[must_use]
    pub fn new(nodes: Vec<ClusterNode>) -> Arc<Self> {
        let nodes = nodes
            .into_iter()
            .map(|node| (node.id.clone(), node))
            .collect();
        Arc::new(Self {
            inner: Mutex::new(StateInner {
                nodes,
                owners: vec![None; CLUSTER_SLOTS],
            }),
        })
    }

    /// Assigns every slot in `slots` to `node_id` without membership checks.
    ///
    /// Bootstrap-only helper for wiring up an initial ownership table.
    pub fn assign_slots(&self, node_id: &str, slots: &SlotBitmap) {
        let mut inner = self.lock_inner();
        for slot in slots.iter_set() {
            inner.owners[usize::from(slot)] = Some(node_id.to_owned());
        }
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, StateInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ClusterState for StaticClusterState {
    fn node_by_slot(&self, slot: SlotId) -> Option<ClusterNode> {
        let inner = self.lock_inner();
        let owner = inner.owners.get(usize::from(slot))?.as_ref()?;
        inner.nodes.get(owner).cloned()
    }

    fn lookup_node(&self, id: &str) -> Option<ClusterNode> {
        self.lock_inner().nodes.get(id).cloned()
    }

    fn set_slots(&self, node: &ClusterNode, slots: &SlotBitmap) -> ShoalResult<()> {
        let mut inner = self.lock_inner();
        if !inner.nodes.contains_key(&node.id) {
            return Err(ShoalError::Cluster(format!(
                "unknown node {} in set_slots",
                node.id
            )));
        }
        for slot in slots.iter_set() {
            inner.owners[usize::from(slot)] = Some(node.id.clone());
        }
        info!(node = %node.id, slots = slots.count(), "slot ownership updated");
        Ok(())
    }
}
