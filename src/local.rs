//! A small in-process tablespace executor.
//!
//! This is the executor booted for tablespaces replicated on this node when
//! no other [`TableSpaceFactory`](crate::tablespace::TableSpaceFactory) is
//! configured. It keeps every table fully in memory, writes durable
//! operations to its commit log before applying them, and checkpoints to the
//! page store. It carries no transaction table: statements with a
//! transaction id are rejected.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::error::{NodeError, NodeResult};
use crate::keys::Bytes;
use crate::model::{
    DdlResult, DmlResult, GetResult, NodeId, Record, Statement, StatementBody, StatementResult,
    Table, TableSpaceName,
};
use crate::node::NodeHandle;
use crate::storage::{PageStore, StorageError};
use crate::tablespace::{TableManager, TableSpaceContext, TableSpaceFactory, TableSpaceManager};
use crate::wal::{CommitLog, LogEntry, LogError, LogOp};

/// Appends after which a background checkpoint is scheduled.
pub const DEFAULT_CHECKPOINT_THRESHOLD: u64 = 1024;

/// Builds [`LocalTableSpaceManager`] instances.
pub struct LocalTableSpaceFactory {
    checkpoint_threshold: u64,
}

impl LocalTableSpaceFactory {
    pub fn new() -> Self {
        Self {
            checkpoint_threshold: DEFAULT_CHECKPOINT_THRESHOLD,
        }
    }

    pub fn with_checkpoint_threshold(checkpoint_threshold: u64) -> Self {
        Self {
            checkpoint_threshold: checkpoint_threshold.max(1),
        }
    }
}

impl Default for LocalTableSpaceFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl TableSpaceFactory for LocalTableSpaceFactory {
    fn create(&self, context: TableSpaceContext) -> NodeResult<Arc<dyn TableSpaceManager>> {
        Ok(LocalTableSpaceManager::new(context, self.checkpoint_threshold))
    }
}

pub struct LocalTableSpaceManager {
    name: TableSpaceName,
    node_id: NodeId,
    leader: bool,
    log: Box<dyn CommitLog>,
    pages: Arc<dyn PageStore>,
    node: NodeHandle,
    tables: RwLock<HashMap<String, Arc<LocalTableManager>>>,
    failed: AtomicBool,
    appends_since_checkpoint: AtomicU64,
    checkpoint_scheduled: AtomicBool,
    checkpoint_threshold: u64,
    // Serializes checkpoints so a background flush cannot interleave with
    // an explicit one.
    checkpoint_lock: Mutex<()>,
    weak: Weak<Self>,
}

impl LocalTableSpaceManager {
    pub fn new(context: TableSpaceContext, checkpoint_threshold: u64) -> Arc<Self> {
        let TableSpaceContext {
            node_id,
            descriptor,
            log,
            pages,
            metadata: _,
            node,
        } = context;
        let leader = descriptor.leader == node_id;
        Arc::new_cyclic(|weak| Self {
            name: descriptor.name,
            node_id,
            leader,
            log,
            pages,
            node,
            tables: RwLock::new(HashMap::new()),
            failed: AtomicBool::new(false),
            appends_since_checkpoint: AtomicU64::new(0),
            checkpoint_scheduled: AtomicBool::new(false),
            checkpoint_threshold: checkpoint_threshold.max(1),
            checkpoint_lock: Mutex::new(()),
            weak: weak.clone(),
        })
    }

    /// Page-store table keys are qualified with the tablespace so two
    /// tablespaces may own tables with the same name.
    fn storage_table_name(&self, table: &str) -> String {
        format!("{}.{}", self.name, table)
    }

    fn require_live(&self) -> NodeResult<()> {
        if self.failed.load(Ordering::SeqCst) {
            return Err(NodeError::execution(format!(
                "tablespace {} has failed on node {}",
                self.name, self.node_id
            )));
        }
        Ok(())
    }

    fn require_leader(&self) -> NodeResult<()> {
        if !self.leader {
            return Err(NodeError::execution(format!(
                "tablespace {} is not led by node {}",
                self.name, self.node_id
            )));
        }
        Ok(())
    }

    fn table_manager_or_err(&self, table: &str) -> NodeResult<Arc<LocalTableManager>> {
        self.tables.read().get(table).cloned().ok_or_else(|| {
            NodeError::execution(format!(
                "no such table {table} in tablespace {}",
                self.name
            ))
        })
    }

    /// Append to the log; a failure poisons the whole tablespace.
    fn append(&self, entry: LogEntry) -> NodeResult<()> {
        match self.log.log(entry) {
            Ok(_) => {
                self.note_append();
                Ok(())
            }
            Err(err) => Err(self.log_failure(err)),
        }
    }

    fn log_failure(&self, err: LogError) -> NodeError {
        self.failed.store(true, Ordering::SeqCst);
        warn!(
            tablespace = %self.name,
            error = %err,
            "commit log failure, tablespace poisoned",
        );
        NodeError::Log(err)
    }

    fn note_append(&self) {
        let appended = self.appends_since_checkpoint.fetch_add(1, Ordering::SeqCst) + 1;
        if appended >= self.checkpoint_threshold
            && !self.checkpoint_scheduled.swap(true, Ordering::SeqCst)
        {
            let weak = self.weak.clone();
            let name = self.name.clone();
            self.node.submit(move || {
                if let Some(manager) = weak.upgrade() {
                    if let Err(err) = manager.flush() {
                        warn!(tablespace = %name, error = %err, "background checkpoint failed");
                    }
                }
            });
        }
    }

    fn storage_failure(&self, err: StorageError) -> NodeError {
        self.failed.store(true, Ordering::SeqCst);
        warn!(
            tablespace = %self.name,
            error = %err,
            "page store failure, tablespace poisoned",
        );
        NodeError::Storage(err)
    }

    /// Apply a recovered or followed log entry to memory, without logging
    /// it again.
    fn apply(&self, entry: &LogEntry) {
        match &entry.op {
            LogOp::CreateTable { table } => {
                self.tables
                    .write()
                    .entry(table.name.clone())
                    .or_insert_with(|| Arc::new(LocalTableManager::new(table.clone())));
            }
            LogOp::Insert { table, key, value } | LogOp::Update { table, key, value } => {
                match self.tables.read().get(table) {
                    Some(manager) => manager.put(key.clone(), value.clone()),
                    None => warn!(
                        tablespace = %self.name,
                        table,
                        "log entry references an unknown table, skipped",
                    ),
                }
            }
            LogOp::Delete { table, key } => match self.tables.read().get(table) {
                Some(manager) => {
                    manager.remove(key);
                }
                None => warn!(
                    tablespace = %self.name,
                    table,
                    "log entry references an unknown table, skipped",
                ),
            },
        }
    }

    /// One-shot drain of the leader's log tail; replicas run this on a
    /// background worker after boot.
    fn catch_up(&self) -> NodeResult<()> {
        let from = self.log.current_lsn();
        self.log.follow(from, &mut |_lsn, entry| self.apply(entry))?;
        Ok(())
    }

    fn execute_create_table(&self, table: String) -> NodeResult<StatementResult> {
        let mut tables = self.tables.write();
        if tables.contains_key(&table) {
            return Err(NodeError::ddl(format!(
                "table {table} already exists in tablespace {}",
                self.name
            )));
        }
        let descriptor = Table::new(&table);
        self.append(LogEntry::new(
            0,
            LogOp::CreateTable {
                table: descriptor.clone(),
            },
        ))?;
        tables.insert(table, Arc::new(LocalTableManager::new(descriptor)));
        Ok(StatementResult::Ddl(DdlResult))
    }

    fn execute_insert(&self, table: String, key: Bytes, value: Bytes) -> NodeResult<StatementResult> {
        let manager = self.table_manager_or_err(&table)?;
        if manager.contains(&key) {
            return Err(NodeError::execution(format!(
                "duplicate key in table {table}"
            )));
        }
        self.append(LogEntry::new(
            0,
            LogOp::Insert {
                table,
                key: key.clone(),
                value: value.clone(),
            },
        ))?;
        manager.put(key.clone(), value);
        Ok(StatementResult::Dml(DmlResult {
            update_count: 1,
            key: Some(key),
        }))
    }

    fn execute_update(&self, table: String, key: Bytes, value: Bytes) -> NodeResult<StatementResult> {
        let manager = self.table_manager_or_err(&table)?;
        if !manager.contains(&key) {
            return Ok(StatementResult::Dml(DmlResult {
                update_count: 0,
                key: None,
            }));
        }
        self.append(LogEntry::new(
            0,
            LogOp::Update {
                table,
                key: key.clone(),
                value: value.clone(),
            },
        ))?;
        manager.put(key.clone(), value);
        Ok(StatementResult::Dml(DmlResult {
            update_count: 1,
            key: Some(key),
        }))
    }

    fn execute_delete(&self, table: String, key: Bytes) -> NodeResult<StatementResult> {
        let manager = self.table_manager_or_err(&table)?;
        if !manager.contains(&key) {
            return Ok(StatementResult::Dml(DmlResult {
                update_count: 0,
                key: None,
            }));
        }
        self.append(LogEntry::new(
            0,
            LogOp::Delete {
                table,
                key: key.clone(),
            },
        ))?;
        manager.remove(&key);
        Ok(StatementResult::Dml(DmlResult {
            update_count: 1,
            key: Some(key),
        }))
    }
}

impl TableSpaceManager for LocalTableSpaceManager {
    fn start(&self) -> NodeResult<()> {
        let checkpoint = self.pages.last_checkpoint_lsn();
        let catalog = self.pages.load_tables(checkpoint, &self.name)?;
        {
            let mut tables = self.tables.write();
            for table in catalog {
                let manager = Arc::new(LocalTableManager::new(table.clone()));
                let storage_name = self.storage_table_name(&table.name);
                let page_count = self.pages.actual_number_of_pages(&storage_name)?;
                for page_id in 1..=page_count {
                    for record in self.pages.load_page(&storage_name, page_id)? {
                        manager.put(record.key, record.value);
                    }
                }
                tables.insert(table.name.clone(), manager);
            }
        }
        self.log
            .recover(checkpoint, &mut |_lsn, entry| self.apply(entry), true)?;
        if self.leader {
            self.log.start_writing()?;
        } else {
            let weak = self.weak.clone();
            let name = self.name.clone();
            self.node.submit(move || {
                if let Some(manager) = weak.upgrade() {
                    if let Err(err) = manager.catch_up() {
                        warn!(tablespace = %name, error = %err, "replica catch-up failed");
                    }
                }
            });
        }
        debug!(
            tablespace = %self.name,
            leader = self.leader,
            tables = self.tables.read().len(),
            "tablespace started",
        );
        Ok(())
    }

    fn close(&self) -> NodeResult<()> {
        self.log.close()?;
        Ok(())
    }

    fn execute_statement(&self, statement: Statement) -> NodeResult<StatementResult> {
        self.require_live()?;
        if statement.transaction_id != 0 {
            return Err(NodeError::execution(
                "transactions are not supported by this tablespace executor",
            ));
        }
        match statement.body {
            StatementBody::CreateTableSpace { .. } => Err(NodeError::invalid_statement(
                "CREATE TABLESPACE is handled by the node manager",
            )),
            StatementBody::CreateTable { table } => {
                self.require_leader()?;
                self.execute_create_table(table)
            }
            StatementBody::Insert { table, key, value } => {
                self.require_leader()?;
                self.execute_insert(table, key, value)
            }
            StatementBody::Update { table, key, value } => {
                self.require_leader()?;
                self.execute_update(table, key, value)
            }
            StatementBody::Delete { table, key } => {
                self.require_leader()?;
                self.execute_delete(table, key)
            }
            StatementBody::Get { table, key } => {
                let manager = self.table_manager_or_err(&table)?;
                Ok(StatementResult::Get(GetResult {
                    record: manager.get(&key),
                }))
            }
        }
    }

    fn flush(&self) -> NodeResult<()> {
        let _checkpoint = self.checkpoint_lock.lock();
        let lsn = self.log.current_lsn();
        let tables: Vec<(String, Arc<LocalTableManager>)> = self
            .tables
            .read()
            .iter()
            .map(|(name, manager)| (name.clone(), manager.clone()))
            .collect();
        let mut catalog = Vec::with_capacity(tables.len());
        for (name, manager) in &tables {
            let storage_name = self.storage_table_name(name);
            self.pages
                .write_page(&storage_name, lsn, manager.snapshot())
                .map_err(|err| self.storage_failure(err))?;
            catalog.push(manager.table());
        }
        self.pages
            .write_tables(&self.name, lsn, catalog)
            .map_err(|err| self.storage_failure(err))?;
        self.log.checkpoint().map_err(|err| self.log_failure(err))?;
        self.appends_since_checkpoint.store(0, Ordering::SeqCst);
        self.checkpoint_scheduled.store(false, Ordering::SeqCst);
        debug!(tablespace = %self.name, lsn = %lsn, "checkpoint written");
        Ok(())
    }

    fn is_leader(&self) -> bool {
        self.leader
    }

    fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    fn table_manager(&self, table: &str) -> Option<Arc<dyn TableManager>> {
        self.tables
            .read()
            .get(table)
            .cloned()
            .map(|manager| manager as Arc<dyn TableManager>)
    }
}

/// One table held fully in memory.
pub struct LocalTableManager {
    table: Table,
    rows: RwLock<std::collections::BTreeMap<Bytes, Bytes>>,
}

impl LocalTableManager {
    fn new(table: Table) -> Self {
        Self {
            table,
            rows: RwLock::new(std::collections::BTreeMap::new()),
        }
    }

    fn contains(&self, key: &Bytes) -> bool {
        self.rows.read().contains_key(key)
    }

    fn put(&self, key: Bytes, value: Bytes) {
        self.rows.write().insert(key, value);
    }

    fn get(&self, key: &Bytes) -> Option<Record> {
        self.rows
            .read()
            .get(key)
            .map(|value| Record::new(key.clone(), value.clone()))
    }

    fn remove(&self, key: &Bytes) -> bool {
        self.rows.write().remove(key).is_some()
    }

    fn snapshot(&self) -> Vec<Record> {
        self.rows
            .read()
            .iter()
            .map(|(key, value)| Record::new(key.clone(), value.clone()))
            .collect()
    }
}

impl TableManager for LocalTableManager {
    fn table(&self) -> Table {
        self.table.clone()
    }

    fn record_count(&self) -> usize {
        self.rows.read().len()
    }
}
