use crate::models::{Allocation, AllocationId, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

/// Exclusive-claim table of (node, port) allocations.
///
/// Not synchronised on its own: callers hold the store lock across a claim and
/// the server insert that uses it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AllocationTable {
    entries: BTreeMap<AllocationId, Allocation>,
}

impl AllocationTable {
    pub fn add(&mut self, node_id: NodeId, ip: &str, port: u16) -> AllocationId {
        let id = self.entries.keys().next_back().map_or(1, |last| last + 1);
        self.entries.insert(
            id,
            Allocation {
                id,
                node_id,
                ip: ip.to_string(),
                port,
                assigned: false,
            },
        );
        id
    }

    pub fn get(&self, id: AllocationId) -> Option<&Allocation> {
        self.entries.get(&id)
    }

    pub fn for_node(&self, node_id: NodeId) -> impl Iterator<Item = &Allocation> {
        self.entries.values().filter(move |a| a.node_id == node_id)
    }

    /// Marks the first free allocation of `node_id` as assigned and returns it.
    pub fn claim(&mut self, node_id: NodeId) -> Option<Allocation> {
        let allocation = self
            .entries
            .values_mut()
            .find(|a| a.node_id == node_id && !a.assigned)?;
        allocation.assigned = true;
        Some(allocation.clone())
    }

    /// Returns `false` when the id is unknown.
    pub fn release(&mut self, id: AllocationId) -> bool {
        match self.entries.get_mut(&id) {
            Some(allocation) => {
                if !allocation.assigned {
                    warn!(allocation_id = id, "releasing an allocation that was not assigned");
                }
                allocation.assigned = false;
                true
            }
            None => false,
        }
    }

    pub fn assigned_count(&self) -> usize {
        self.entries.values().filter(|a| a.assigned).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_takes_free_allocations_only() {
        let mut table = AllocationTable::default();
        let a = table.add(1, "10.0.0.1", 25565);
        let b = table.add(1, "10.0.0.1", 25566);
        table.add(2, "10.0.0.2", 25565);

        assert_eq!(table.claim(1).unwrap().id, a);
        assert_eq!(table.claim(1).unwrap().id, b);
        assert!(table.claim(1).is_none());
        assert_eq!(table.assigned_count(), 2);
    }

    #[test]
    fn test_release_makes_allocation_claimable_again() {
        let mut table = AllocationTable::default();
        let a = table.add(1, "10.0.0.1", 25565);

        table.claim(1).unwrap();
        assert!(table.release(a));
        assert_eq!(table.claim(1).unwrap().id, a);
        assert!(!table.release(99));
    }
}
