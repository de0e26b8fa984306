use dtn_wire::{Bundle, BundleId};
use std::collections::HashMap;

use crate::error::AgentError;

/// Persistence for bundles the agent holds.
///
/// Implementations are used from the agent worker only.
pub trait BundleStorage: Send {
    /// Stores `bundle`. Duplicates and bundles beyond capacity are refused.
    fn add(&mut self, bundle: Bundle) -> Result<(), AgentError>;

    fn remove(&mut self, id: &BundleId) -> Option<Bundle>;

    fn get(&self, id: &BundleId) -> Option<Bundle>;

    fn contains(&self, id: &BundleId) -> bool {
        self.get(id).is_some()
    }

    fn bundles(&self) -> Vec<Bundle>;

    fn capacity(&self) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Free slots.
    fn available(&self) -> usize {
        self.capacity().saturating_sub(self.len())
    }
}

/// In-memory storage with a fixed bundle count.
#[derive(Debug)]
pub struct MemoryStorage {
    capacity: usize,
    bundles: HashMap<BundleId, Bundle>,
}

impl MemoryStorage {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            bundles: HashMap::new(),
        }
    }
}

impl BundleStorage for MemoryStorage {
    fn add(&mut self, bundle: Bundle) -> Result<(), AgentError> {
        let id = bundle.id();
        if self.bundles.contains_key(&id) {
            return Err(AgentError::Storage(format!("bundle {id} already stored")));
        }
        if self.bundles.len() >= self.capacity {
            return Err(AgentError::Storage(format!(
                "storage full ({} bundles)",
                self.capacity
            )));
        }
        self.bundles.insert(id, bundle);
        Ok(())
    }

    fn remove(&mut self, id: &BundleId) -> Option<Bundle> {
        self.bundles.remove(id)
    }

    fn get(&self, id: &BundleId) -> Option<Bundle> {
        self.bundles.get(id).cloned()
    }

    fn contains(&self, id: &BundleId) -> bool {
        self.bundles.contains_key(id)
    }

    fn bundles(&self) -> Vec<Bundle> {
        self.bundles.values().cloned().collect()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn len(&self) -> usize {
        self.bundles.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dtn_wire::{BundleInfo, EidRegistry};

    fn bundle(eids: &EidRegistry, seq: u64) -> Bundle {
        let info = BundleInfo::new(
            eids,
            eids.host("a").unwrap(),
            eids.host("b").unwrap(),
            10,
            seq,
            60,
        );
        Bundle::new(info, vec![0u8; 4])
    }

    #[test]
    fn duplicates_and_overflow_refused() {
        let eids = EidRegistry::new();
        let mut storage = MemoryStorage::new(2);
        storage.add(bundle(&eids, 1)).unwrap();
        assert!(storage.add(bundle(&eids, 1)).is_err());
        storage.add(bundle(&eids, 2)).unwrap();
        assert_eq!(storage.available(), 0);
        assert!(storage.add(bundle(&eids, 3)).is_err());

        let removed = storage.remove(&bundle(&eids, 1).id()).unwrap();
        assert_eq!(removed.info().creation_seq, 1);
        assert_eq!(storage.available(), 1);
        assert!(!storage.contains(&removed.id()));
        assert_eq!(storage.bundles().len(), 1);
    }
}
