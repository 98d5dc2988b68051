//! Node-level control plane of the SiloDB distributed SQL database.
//!
//! Each cluster member runs one [`NodeManager`]: it boots the tablespaces
//! assigned to the node from persistent metadata, routes statements to the
//! tablespace that owns them, reconciles local state against the cluster
//! catalog on a background activator thread, and shuts everything down in
//! order. The metadata store, write-ahead log and page store are abstract
//! collaborators; in-memory implementations back single-node deployments
//! and tests.

mod activator;
mod config;
mod error;
mod keys;
mod local;
mod metadata;
mod model;
mod node;
mod pool;
mod registry;
mod storage;
mod tablespace;
pub mod test_support;
mod wal;

pub use config::{NodeConfig, NodeConfigBuilder, DEFAULT_WAIT_POLL_INTERVAL};
pub use error::{NodeError, NodeResult};
pub use keys::{Bytes, CodecError};
pub use local::{
    LocalTableManager, LocalTableSpaceFactory, LocalTableSpaceManager,
    DEFAULT_CHECKPOINT_THRESHOLD,
};
pub use metadata::{MemoryMetadataStore, MetadataError, MetadataResult, MetadataStore};
pub use model::{
    DdlResult, DescriptorError, DmlResult, GetResult, NodeId, Record, Statement, StatementBody,
    StatementResult, Table, TableSpaceDescriptor, TableSpaceDescriptorBuilder, TableSpaceName,
    DEFAULT_TABLE_SPACE,
};
pub use node::{NodeHandle, NodeManager};
pub use pool::{PoolClosedError, WorkerPool};
pub use registry::{ExclusiveRegistry, TableSpaceRegistry};
pub use storage::{MemoryPageStore, PageStore, StorageError, StorageResult};
pub use tablespace::{TableManager, TableSpaceContext, TableSpaceFactory, TableSpaceManager};
pub use wal::{
    CommitLog, CommitLogManager, LogEntry, LogError, LogOp, LogResult, Lsn, MemoryCommitLog,
    MemoryCommitLogManager,
};
