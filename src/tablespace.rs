//! Contracts between the node manager and the per-tablespace executors it
//! hosts.

use std::sync::Arc;

use crate::error::NodeResult;
use crate::metadata::MetadataStore;
use crate::model::{NodeId, Statement, StatementResult, Table, TableSpaceDescriptor};
use crate::node::NodeHandle;
use crate::storage::PageStore;
use crate::wal::CommitLog;

/// The executor of one tablespace hosted on this node.
///
/// The node owns the full lifecycle: a manager becomes reachable through the
/// registry only after `start` has returned `Ok`, and is closed exactly once
/// when it is evicted or the node shuts down. Once `is_failed` reports true
/// it keeps reporting true until the manager is closed and dropped.
pub trait TableSpaceManager: Send + Sync {
    fn start(&self) -> NodeResult<()>;

    fn close(&self) -> NodeResult<()>;

    fn execute_statement(&self, statement: Statement) -> NodeResult<StatementResult>;

    /// Persist in-memory state to the page store and checkpoint the log.
    fn flush(&self) -> NodeResult<()>;

    fn is_leader(&self) -> bool;

    fn is_failed(&self) -> bool;

    fn table_manager(&self, table: &str) -> Option<Arc<dyn TableManager>>;
}

/// Handle onto one table of a tablespace.
pub trait TableManager: Send + Sync {
    fn table(&self) -> Table;

    fn record_count(&self) -> usize;
}

/// Everything a freshly booted tablespace manager needs from the node:
/// its descriptor, its own commit log, and shared collaborator handles.
pub struct TableSpaceContext {
    pub node_id: NodeId,
    pub descriptor: TableSpaceDescriptor,
    pub log: Box<dyn CommitLog>,
    pub pages: Arc<dyn PageStore>,
    pub metadata: Arc<dyn MetadataStore>,
    pub node: NodeHandle,
}

/// Builds tablespace managers during boot; the extension point for
/// swapping the executor implementation.
pub trait TableSpaceFactory: Send + Sync {
    fn create(&self, context: TableSpaceContext) -> NodeResult<Arc<dyn TableSpaceManager>>;
}
