//! Cluster metadata catalog: which tablespaces exist and where their
//! replicas live.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use thiserror::Error;

use crate::model::{NodeId, TableSpaceDescriptor, TableSpaceName, DEFAULT_TABLE_SPACE};

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("metadata store unavailable: {0}")]
    Unavailable(String),
    #[error("tablespace {0} already registered")]
    AlreadyRegistered(TableSpaceName),
    #[error("unknown tablespace {0}")]
    UnknownTableSpace(TableSpaceName),
    #[error("metadata store is closed")]
    Closed,
}

pub type MetadataResult<T> = Result<T, MetadataError>;

/// Cluster-wide catalog of tablespaces and their replica assignments.
///
/// Implementations are the extension point for local versus clustered
/// deployments. All operations may fail with
/// [`MetadataError::Unavailable`], in which case the caller retries on the
/// next reconciliation pass.
pub trait MetadataStore: Send + Sync {
    fn start(&self) -> MetadataResult<()>;

    fn close(&self) -> MetadataResult<()>;

    /// Register the default tablespace with `node_id` as sole leader and
    /// replica, unless a tablespace with that name already exists.
    /// Idempotent.
    fn ensure_default_table_space(&self, node_id: &NodeId) -> MetadataResult<()>;

    fn list_table_spaces(&self) -> MetadataResult<Vec<TableSpaceName>>;

    /// Fails with [`MetadataError::UnknownTableSpace`] if absent.
    fn describe(&self, name: &TableSpaceName) -> MetadataResult<TableSpaceDescriptor>;

    /// Atomically register a new tablespace. Fails with
    /// [`MetadataError::AlreadyRegistered`] on a duplicate name.
    fn register(&self, descriptor: TableSpaceDescriptor) -> MetadataResult<()>;
}

/// In-memory metadata store for single-node deployments and tests.
#[derive(Default)]
pub struct MemoryMetadataStore {
    table_spaces: Mutex<HashMap<TableSpaceName, TableSpaceDescriptor>>,
    started: AtomicBool,
    closed: AtomicBool,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> MetadataResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MetadataError::Closed);
        }
        if !self.started.load(Ordering::SeqCst) {
            return Err(MetadataError::Unavailable(
                "metadata store not started".to_owned(),
            ));
        }
        Ok(())
    }
}

impl MetadataStore for MemoryMetadataStore {
    fn start(&self) -> MetadataResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MetadataError::Closed);
        }
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) -> MetadataResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn ensure_default_table_space(&self, node_id: &NodeId) -> MetadataResult<()> {
        self.ensure_open()?;
        let mut table_spaces = self.table_spaces.lock();
        table_spaces
            .entry(TableSpaceName::from(DEFAULT_TABLE_SPACE))
            .or_insert_with(|| {
                TableSpaceDescriptor::single_node(DEFAULT_TABLE_SPACE, node_id.clone())
            });
        Ok(())
    }

    fn list_table_spaces(&self) -> MetadataResult<Vec<TableSpaceName>> {
        self.ensure_open()?;
        Ok(self.table_spaces.lock().keys().cloned().collect())
    }

    fn describe(&self, name: &TableSpaceName) -> MetadataResult<TableSpaceDescriptor> {
        self.ensure_open()?;
        self.table_spaces
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| MetadataError::UnknownTableSpace(name.clone()))
    }

    fn register(&self, descriptor: TableSpaceDescriptor) -> MetadataResult<()> {
        self.ensure_open()?;
        let mut table_spaces = self.table_spaces.lock();
        if table_spaces.contains_key(&descriptor.name) {
            return Err(MetadataError::AlreadyRegistered(descriptor.name));
        }
        table_spaces.insert(descriptor.name.clone(), descriptor);
        Ok(())
    }
}
