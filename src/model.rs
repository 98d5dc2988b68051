//! Core data model: identifiers, tablespace descriptors, statements and
//! their results.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::keys::Bytes;

/// Name of the tablespace every node hosts by default.
pub const DEFAULT_TABLE_SPACE: &str = "default";

/// Opaque identifier of a node within the cluster.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Cluster-wide unique name of a tablespace.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TableSpaceName(String);

impl TableSpaceName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for TableSpaceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TableSpaceName {
    fn from(name: &str) -> Self {
        Self(name.to_owned())
    }
}

impl From<String> for TableSpaceName {
    fn from(name: String) -> Self {
        Self(name)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("tablespace name must not be empty")]
    EmptyName,
    #[error("tablespace descriptor has no leader")]
    NoLeader,
    #[error("replica set must not be empty")]
    NoReplicas,
    #[error("leader {0} is not part of the replica set")]
    LeaderNotReplica(NodeId),
}

/// Cluster-level record of a tablespace: its identity, leader and replica
/// set. Owned by the metadata store; the node holds read copies only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSpaceDescriptor {
    pub name: TableSpaceName,
    pub leader: NodeId,
    pub replicas: BTreeSet<NodeId>,
}

impl TableSpaceDescriptor {
    pub fn builder() -> TableSpaceDescriptorBuilder {
        TableSpaceDescriptorBuilder::default()
    }

    /// Descriptor of a tablespace hosted and led by a single node.
    pub fn single_node(name: impl Into<TableSpaceName>, node: NodeId) -> Self {
        Self {
            name: name.into(),
            leader: node.clone(),
            replicas: BTreeSet::from([node]),
        }
    }
}

/// Validating builder for [`TableSpaceDescriptor`]; the invariants
/// (`leader` in `replicas`, non-empty replica set) hold for every
/// descriptor it produces.
#[derive(Debug, Default)]
pub struct TableSpaceDescriptorBuilder {
    name: Option<TableSpaceName>,
    leader: Option<NodeId>,
    replicas: BTreeSet<NodeId>,
}

impl TableSpaceDescriptorBuilder {
    pub fn name(mut self, name: impl Into<TableSpaceName>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn leader(mut self, leader: impl Into<NodeId>) -> Self {
        self.leader = Some(leader.into());
        self
    }

    pub fn replica(mut self, replica: impl Into<NodeId>) -> Self {
        self.replicas.insert(replica.into());
        self
    }

    pub fn replicas(mut self, replicas: impl IntoIterator<Item = NodeId>) -> Self {
        self.replicas.extend(replicas);
        self
    }

    pub fn build(self) -> Result<TableSpaceDescriptor, DescriptorError> {
        let name = match self.name {
            Some(name) if !name.is_empty() => name,
            _ => return Err(DescriptorError::EmptyName),
        };
        let leader = self.leader.ok_or(DescriptorError::NoLeader)?;
        if self.replicas.is_empty() {
            return Err(DescriptorError::NoReplicas);
        }
        if !self.replicas.contains(&leader) {
            return Err(DescriptorError::LeaderNotReplica(leader));
        }
        Ok(TableSpaceDescriptor {
            name,
            leader,
            replicas: self.replicas,
        })
    }
}

/// Metadata of a single table inside a tablespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    pub name: String,
}

impl Table {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// A key/value row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub key: Bytes,
    pub value: Bytes,
}

impl Record {
    pub fn new(key: Bytes, value: Bytes) -> Self {
        Self { key, value }
    }
}

/// A statement addressed to one tablespace.
///
/// `transaction_id == 0` denotes "no transaction".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statement {
    pub table_space: TableSpaceName,
    pub transaction_id: u64,
    pub body: StatementBody,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatementBody {
    CreateTableSpace {
        name: TableSpaceName,
        leader: NodeId,
        replicas: BTreeSet<NodeId>,
    },
    CreateTable {
        table: String,
    },
    Insert {
        table: String,
        key: Bytes,
        value: Bytes,
    },
    Update {
        table: String,
        key: Bytes,
        value: Bytes,
    },
    Delete {
        table: String,
        key: Bytes,
    },
    Get {
        table: String,
        key: Bytes,
    },
}

impl Statement {
    fn new(table_space: impl Into<TableSpaceName>, body: StatementBody) -> Self {
        Self {
            table_space: table_space.into(),
            transaction_id: 0,
            body,
        }
    }

    pub fn create_table_space(
        name: impl Into<TableSpaceName>,
        leader: impl Into<NodeId>,
        replicas: impl IntoIterator<Item = NodeId>,
    ) -> Self {
        let name = name.into();
        Self::new(
            name.clone(),
            StatementBody::CreateTableSpace {
                name,
                leader: leader.into(),
                replicas: replicas.into_iter().collect(),
            },
        )
    }

    pub fn create_table(table_space: impl Into<TableSpaceName>, table: impl Into<String>) -> Self {
        Self::new(
            table_space,
            StatementBody::CreateTable {
                table: table.into(),
            },
        )
    }

    pub fn insert(
        table_space: impl Into<TableSpaceName>,
        table: impl Into<String>,
        key: Bytes,
        value: Bytes,
    ) -> Self {
        Self::new(
            table_space,
            StatementBody::Insert {
                table: table.into(),
                key,
                value,
            },
        )
    }

    pub fn update(
        table_space: impl Into<TableSpaceName>,
        table: impl Into<String>,
        key: Bytes,
        value: Bytes,
    ) -> Self {
        Self::new(
            table_space,
            StatementBody::Update {
                table: table.into(),
                key,
                value,
            },
        )
    }

    pub fn delete(
        table_space: impl Into<TableSpaceName>,
        table: impl Into<String>,
        key: Bytes,
    ) -> Self {
        Self::new(
            table_space,
            StatementBody::Delete {
                table: table.into(),
                key,
            },
        )
    }

    pub fn get(
        table_space: impl Into<TableSpaceName>,
        table: impl Into<String>,
        key: Bytes,
    ) -> Self {
        Self::new(
            table_space,
            StatementBody::Get {
                table: table.into(),
                key,
            },
        )
    }

    /// Attach a transaction id; used by tests and the session layer.
    pub fn in_transaction(mut self, transaction_id: u64) -> Self {
        self.transaction_id = transaction_id;
        self
    }
}

/// Result of a DDL statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DdlResult;

/// Result of a DML statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmlResult {
    pub update_count: u64,
    pub key: Option<Bytes>,
}

/// Result of a point lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetResult {
    pub record: Option<Record>,
}

impl GetResult {
    pub fn found(&self) -> bool {
        self.record.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatementResult {
    Ddl(DdlResult),
    Dml(DmlResult),
    Get(GetResult),
}

impl StatementResult {
    pub fn kind(&self) -> &'static str {
        match self {
            StatementResult::Ddl(_) => "ddl",
            StatementResult::Dml(_) => "dml",
            StatementResult::Get(_) => "get",
        }
    }
}
