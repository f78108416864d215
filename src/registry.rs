use crate::{Error, PartitionId, PartitionTopology, Result, ServiceId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

struct ServiceEntry<S> {
    handle: Arc<S>,
    partition: PartitionId,
}

/// Live services of one network, keyed by ID
///
/// Not synchronized on its own; [`NetworkContext`](crate::NetworkContext) owns it behind its lock.
/// Removed IDs are retired and cannot be added again.
pub struct ServiceRegistry<S> {
    services: HashMap<ServiceId, ServiceEntry<S>>,
    retired: HashSet<ServiceId>,
}

impl<S> Default for ServiceRegistry<S> {
    fn default() -> Self {
        Self {
            services: HashMap::new(),
            retired: HashSet::new(),
        }
    }
}

impl<S> ServiceRegistry<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails if `id` is live or was removed earlier
    pub fn ensure_available(&self, id: &ServiceId) -> Result<()> {
        if self.services.contains_key(id) {
            return Err(Error::DuplicateServiceId(id.clone()));
        }
        if self.retired.contains(id) {
            return Err(Error::RetiredServiceId(id.clone()));
        }
        Ok(())
    }

    pub fn insert(&mut self, id: ServiceId, partition: PartitionId, handle: Arc<S>) -> Result<()> {
        self.ensure_available(&id)?;
        self.services.insert(id, ServiceEntry { handle, partition });
        Ok(())
    }

    pub fn get(&self, id: &ServiceId) -> Result<Arc<S>> {
        self.services
            .get(id)
            .map(|entry| Arc::clone(&entry.handle))
            .ok_or_else(|| Error::ServiceNotFound(id.clone()))
    }

    /// Remove `id` and retire it
    pub fn remove(&mut self, id: &ServiceId) -> Result<Arc<S>> {
        let entry = self
            .services
            .remove(id)
            .ok_or_else(|| Error::ServiceNotFound(id.clone()))?;
        self.retired.insert(id.clone());
        Ok(entry.handle)
    }

    pub fn contains(&self, id: &ServiceId) -> bool {
        self.services.contains_key(id)
    }

    pub fn ids(&self) -> Vec<ServiceId> {
        self.services.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn partition_of(&self, id: &ServiceId) -> Option<&PartitionId> {
        self.services.get(id).map(|entry| &entry.partition)
    }

    /// First service the topology names that is not registered
    pub fn find_unknown(&self, topology: &PartitionTopology) -> Option<ServiceId> {
        topology
            .services()
            .values()
            .flatten()
            .find(|id| !self.services.contains_key(*id))
            .cloned()
    }

    /// Record the partitions of an applied topology.
    ///
    /// Services the topology does not mention fall back to the default partition.
    pub fn apply_topology(&mut self, topology: &PartitionTopology) {
        for (id, entry) in &mut self.services {
            entry.partition = topology
                .partition_of(id)
                .cloned()
                .unwrap_or_else(PartitionId::default_partition);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RepartitionerBuilder;

    fn registry_with(ids: &[&str]) -> ServiceRegistry<u32> {
        let mut registry = ServiceRegistry::new();
        for (n, id) in ids.iter().enumerate() {
            registry
                .insert((*id).into(), PartitionId::default_partition(), Arc::new(n as u32))
                .unwrap();
        }
        registry
    }

    #[test]
    fn test_duplicate_insert_leaves_registry_unchanged() {
        let mut registry = registry_with(&["a"]);
        let err = registry
            .insert("a".into(), PartitionId::from("other"), Arc::new(99))
            .unwrap_err();

        assert!(matches!(err, Error::DuplicateServiceId(_)));
        assert_eq!(registry.len(), 1);
        assert_eq!(*registry.get(&"a".into()).unwrap(), 0);
        assert!(registry.partition_of(&"a".into()).unwrap().is_default());
    }

    #[test]
    fn test_removed_ids_are_retired() {
        let mut registry = registry_with(&["a"]);
        registry.remove(&"a".into()).unwrap();

        assert!(registry.is_empty());
        assert!(matches!(
            registry.get(&"a".into()),
            Err(Error::ServiceNotFound(_))
        ));
        assert!(matches!(
            registry.insert("a".into(), PartitionId::default_partition(), Arc::new(1)),
            Err(Error::RetiredServiceId(_))
        ));
    }

    #[test]
    fn test_remove_missing_fails() {
        let mut registry = registry_with(&[]);
        assert!(matches!(
            registry.remove(&"ghost".into()),
            Err(Error::ServiceNotFound(_))
        ));
    }

    #[test]
    fn test_apply_topology_defaults_unmentioned_services() {
        let mut registry = registry_with(&["api", "datastore", "cache"]);
        let topology = RepartitionerBuilder::new(false)
            .with_partition("front", ["api"])
            .with_partition("back", ["datastore"])
            .build()
            .unwrap();
        registry.apply_topology(&topology);

        assert_eq!(registry.partition_of(&"api".into()).unwrap().as_str(), "front");
        assert_eq!(
            registry.partition_of(&"datastore".into()).unwrap().as_str(),
            "back"
        );
        assert!(registry.partition_of(&"cache".into()).unwrap().is_default());

        // A later topology that omits "datastore" moves it back to the default partition
        let topology = RepartitionerBuilder::new(false)
            .with_partition("front", ["api"])
            .build()
            .unwrap();
        registry.apply_topology(&topology);
        assert!(registry.partition_of(&"datastore".into()).unwrap().is_default());
    }

    #[test]
    fn test_find_unknown_service_in_topology() {
        let registry = registry_with(&["api"]);
        let topology = RepartitionerBuilder::new(false)
            .with_partition("front", ["api", "ghost"])
            .build()
            .unwrap();
        assert_eq!(registry.find_unknown(&topology), Some(ServiceId::from("ghost")));
    }
}
