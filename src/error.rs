//! Node-level error type.
//!
//! Collaborator failures keep their own error enums ([`MetadataError`],
//! [`LogError`], [`StorageError`]) and fold into [`NodeError`] unchanged, so
//! callers can still classify the failing subsystem.

use thiserror::Error;

use crate::metadata::MetadataError;
use crate::model::TableSpaceName;
use crate::storage::StorageError;
use crate::wal::LogError;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error(transparent)]
    Log(#[from] LogError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// DDL semantically invalid or conflicting with existing objects.
    #[error("ddl error: {0}")]
    Ddl(String),
    /// Malformed statement: missing tablespace, invalid descriptor,
    /// transactional CREATE TABLESPACE.
    #[error("invalid statement: {0}")]
    InvalidStatement(String),
    /// The tablespace is not hosted on this node.
    #[error("no such tablespace {0} on this node")]
    NoSuchTableSpace(TableSpaceName),
    /// Runtime failure while executing a statement.
    #[error("statement execution failed: {0}")]
    Execution(String),
    #[error("node manager already started")]
    AlreadyStarted,
}

impl NodeError {
    pub fn ddl(msg: impl Into<String>) -> Self {
        Self::Ddl(msg.into())
    }

    pub fn invalid_statement(msg: impl Into<String>) -> Self {
        Self::InvalidStatement(msg.into())
    }

    pub fn execution(msg: impl Into<String>) -> Self {
        Self::Execution(msg.into())
    }
}

pub type NodeResult<T> = Result<T, NodeError>;
