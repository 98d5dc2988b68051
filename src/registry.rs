//! The registry of tablespaces hosted on this node.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockWriteGuard};

use crate::model::TableSpaceName;
use crate::tablespace::TableSpaceManager;

type Managers = HashMap<TableSpaceName, Arc<dyn TableSpaceManager>>;

/// Concurrent map from tablespace name to its live manager.
///
/// The inner readers-writer lock doubles as the node's general lock:
/// statement dispatch and snapshots take it shared, while the activator's
/// boot and eviction steps, node startup, and teardown hold it exclusively
/// through [`TableSpaceRegistry::exclusive`]. A manager present in the map
/// has always completed `start` successfully.
#[derive(Default)]
pub struct TableSpaceRegistry {
    managers: RwLock<Managers>,
}

impl TableSpaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the manager of `name`, if hosted here. Takes the shared lock
    /// only for the duration of the map lookup.
    pub fn lookup(&self, name: &TableSpaceName) -> Option<Arc<dyn TableSpaceManager>> {
        self.managers.read().get(name).cloned()
    }

    /// Copy of the live managers; iteration needs no further locking.
    pub fn snapshot(&self) -> Vec<Arc<dyn TableSpaceManager>> {
        self.managers.read().values().cloned().collect()
    }

    /// Like [`TableSpaceRegistry::snapshot`] but keyed by name.
    pub fn entries(&self) -> Vec<(TableSpaceName, Arc<dyn TableSpaceManager>)> {
        self.managers
            .read()
            .iter()
            .map(|(name, manager)| (name.clone(), manager.clone()))
            .collect()
    }

    /// Acquire the exclusive lock for structural mutation.
    pub fn exclusive(&self) -> ExclusiveRegistry<'_> {
        ExclusiveRegistry {
            managers: self.managers.write(),
        }
    }
}

/// Write-locked view of the registry.
pub struct ExclusiveRegistry<'a> {
    managers: RwLockWriteGuard<'a, Managers>,
}

impl ExclusiveRegistry<'_> {
    pub fn contains(&self, name: &TableSpaceName) -> bool {
        self.managers.contains_key(name)
    }

    pub fn get(&self, name: &TableSpaceName) -> Option<Arc<dyn TableSpaceManager>> {
        self.managers.get(name).cloned()
    }

    /// Insert a manager whose `start` has completed successfully.
    pub fn insert(&mut self, name: TableSpaceName, manager: Arc<dyn TableSpaceManager>) {
        self.managers.insert(name, manager);
    }

    pub fn remove(&mut self, name: &TableSpaceName) -> Option<Arc<dyn TableSpaceManager>> {
        self.managers.remove(name)
    }

    /// Remove and return every manager; used during shutdown.
    pub fn drain(&mut self) -> Vec<(TableSpaceName, Arc<dyn TableSpaceManager>)> {
        self.managers.drain().collect()
    }
}
