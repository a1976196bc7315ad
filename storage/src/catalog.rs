//! Registry of storage containers known to the engine.

use std::collections::HashMap;
use std::sync::Arc;

use log::info;
use parking_lot::RwLock;

use crate::file::StorageAdapter;
use crate::ids::ContainerId;
use crate::{Result, StorageError};

/// Maps container ids to the adapter that owns their on-disk pages.
#[derive(Default)]
pub struct Catalog {
    containers: RwLock<HashMap<ContainerId, Arc<dyn StorageAdapter>>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, adapter: Arc<dyn StorageAdapter>) -> Result<()> {
        let id = adapter.container_id();
        let mut containers = self.containers.write();
        if containers.contains_key(&id) {
            return Err(StorageError::DuplicateContainer(id));
        }
        containers.insert(id, adapter);
        info!("registered container {}", id);
        Ok(())
    }

    /// Picks the next free container id and registers the adapter `build`
    /// creates for it, atomically with respect to other registrations.
    pub fn add_new<F>(&self, build: F) -> Result<ContainerId>
    where
        F: FnOnce(ContainerId) -> Result<Arc<dyn StorageAdapter>>,
    {
        let mut containers = self.containers.write();
        let id = containers
            .keys()
            .max()
            .map_or(ContainerId(1), |max| ContainerId(max.0 + 1));

        let adapter = build(id)?;
        if adapter.container_id() != id {
            return Err(StorageError::Usage(format!(
                "adapter built for container {} reports id {}",
                id,
                adapter.container_id()
            )));
        }
        containers.insert(id, adapter);
        info!("registered container {}", id);
        Ok(id)
    }

    pub fn get(&self, id: ContainerId) -> Result<Arc<dyn StorageAdapter>> {
        self.containers
            .read()
            .get(&id)
            .cloned()
            .ok_or(StorageError::UnknownContainer(id))
    }

    pub fn remove(&self, id: ContainerId) -> Option<Arc<dyn StorageAdapter>> {
        self.containers.write().remove(&id)
    }

    pub fn container_ids(&self) -> Vec<ContainerId> {
        let mut ids: Vec<_> = self.containers.read().keys().copied().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::HeapFile;
    use tempfile::tempdir;

    #[test]
    fn test_add_get_remove() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::new();
        let file = HeapFile::create_new(&dir.path().join("a.heap"), ContainerId(3), true).unwrap();

        catalog.add(Arc::new(file)).unwrap();
        assert_eq!(catalog.get(ContainerId(3)).unwrap().container_id(), ContainerId(3));
        assert!(matches!(
            catalog.get(ContainerId(4)),
            Err(StorageError::UnknownContainer(ContainerId(4)))
        ));

        assert!(catalog.remove(ContainerId(3)).is_some());
        assert!(catalog.container_ids().is_empty());
    }

    #[test]
    fn test_duplicate_rejected() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::new();
        let path = dir.path().join("a.heap");
        catalog
            .add(Arc::new(HeapFile::create_new(&path, ContainerId(1), true).unwrap()))
            .unwrap();

        let again = HeapFile::open(&path).unwrap();
        assert!(matches!(
            catalog.add(Arc::new(again)),
            Err(StorageError::DuplicateContainer(ContainerId(1)))
        ));
    }

    #[test]
    fn test_add_new_picks_next_id() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::new();

        let create = |name: &str| {
            let path = dir.path().join(name);
            move |id| -> Result<Arc<dyn StorageAdapter>> {
                Ok(Arc::new(HeapFile::create_new(&path, id, false)?))
            }
        };

        assert_eq!(catalog.add_new(create("a.heap")).unwrap(), ContainerId(1));
        assert_eq!(catalog.add_new(create("b.heap")).unwrap(), ContainerId(2));

        let mismatched = catalog.add_new(|_| -> Result<Arc<dyn StorageAdapter>> {
            Ok(Arc::new(
                HeapFile::create_new(&dir.path().join("c.heap"), ContainerId(9), false)?,
            ))
        });
        assert!(matches!(mismatched, Err(StorageError::Usage(_))));
        assert_eq!(catalog.container_ids(), vec![ContainerId(1), ContainerId(2)]);
    }
}
