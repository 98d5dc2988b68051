//! Shared fakes and fault-injection helpers for unit tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{NodeError, NodeResult};
use crate::model::{DmlResult, NodeId, Statement, StatementResult, TableSpaceName};
use crate::node::NodeHandle;
use crate::pool::WorkerPool;
use crate::tablespace::{TableManager, TableSpaceContext, TableSpaceFactory, TableSpaceManager};
use crate::wal::{CommitLog, CommitLogManager, LogEntry, LogError, LogResult, Lsn, MemoryCommitLog};

/// A [`NodeHandle`] with its own worker pool and no registry behind it.
pub fn detached_node_handle(node_id: &str) -> NodeHandle {
    NodeHandle::detached(
        NodeId::from(node_id),
        WorkerPool::new(format!("{node_id}-test")),
    )
}

/// Creates [`MemoryCommitLog`]s whose writes can be failed on demand,
/// simulating a WAL outage shared by every log of the node.
pub struct BreakableCommitLogManager {
    broken: Arc<AtomicBool>,
}

impl BreakableCommitLogManager {
    pub fn new() -> Self {
        Self {
            broken: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start failing every write on every log created by this manager.
    pub fn trip(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }

    pub fn restore(&self) {
        self.broken.store(false, Ordering::SeqCst);
    }
}

impl Default for BreakableCommitLogManager {
    fn default() -> Self {
        Self::new()
    }
}

impl CommitLogManager for BreakableCommitLogManager {
    fn create_log(&self, _table_space: &TableSpaceName) -> LogResult<Box<dyn CommitLog>> {
        Ok(Box::new(BreakableCommitLog {
            inner: MemoryCommitLog::new(),
            broken: self.broken.clone(),
        }))
    }
}

struct BreakableCommitLog {
    inner: MemoryCommitLog,
    broken: Arc<AtomicBool>,
}

impl BreakableCommitLog {
    fn ensure_intact(&self) -> LogResult<()> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(LogError::Unavailable("injected log failure".to_owned()));
        }
        Ok(())
    }
}

impl CommitLog for BreakableCommitLog {
    fn log(&self, entry: LogEntry) -> LogResult<Lsn> {
        self.ensure_intact()?;
        self.inner.log(entry)
    }

    fn recover(
        &self,
        after: Lsn,
        consumer: &mut dyn FnMut(Lsn, &LogEntry),
        fencing: bool,
    ) -> LogResult<()> {
        self.inner.recover(after, consumer, fencing)
    }

    fn follow(&self, after: Lsn, consumer: &mut dyn FnMut(Lsn, &LogEntry)) -> LogResult<()> {
        self.inner.follow(after, consumer)
    }

    fn current_lsn(&self) -> Lsn {
        self.inner.current_lsn()
    }

    fn start_writing(&self) -> LogResult<()> {
        self.ensure_intact()?;
        self.inner.start_writing()
    }

    fn clear(&self) -> LogResult<()> {
        self.inner.clear()
    }

    fn close(&self) -> LogResult<()> {
        self.inner.close()
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    fn checkpoint(&self) -> LogResult<()> {
        self.ensure_intact()
    }
}

/// Scripted tablespace manager recording its lifecycle transitions.
pub struct StubTableSpaceManager {
    leader: bool,
    fail_start: bool,
    fail_flush: AtomicBool,
    started: AtomicBool,
    closed: AtomicBool,
    failed: AtomicBool,
}

impl StubTableSpaceManager {
    pub fn new(leader: bool) -> Self {
        Self {
            leader,
            fail_start: false,
            fail_flush: AtomicBool::new(false),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            failed: AtomicBool::new(false),
        }
    }

    fn failing_start(leader: bool) -> Self {
        Self {
            fail_start: true,
            ..Self::new(leader)
        }
    }

    /// Simulate an asynchronous failure, as a poisoned WAL would.
    pub fn fail(&self) {
        self.failed.store(true, Ordering::SeqCst);
    }

    pub fn fail_flush(&self) {
        self.fail_flush.store(true, Ordering::SeqCst);
    }

    pub fn was_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn was_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl TableSpaceManager for StubTableSpaceManager {
    fn start(&self) -> NodeResult<()> {
        if self.fail_start {
            return Err(NodeError::execution("injected start failure"));
        }
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) -> NodeResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn execute_statement(&self, _statement: Statement) -> NodeResult<StatementResult> {
        Ok(StatementResult::Dml(DmlResult {
            update_count: 1,
            key: None,
        }))
    }

    fn flush(&self) -> NodeResult<()> {
        if self.fail_flush.load(Ordering::SeqCst) {
            return Err(NodeError::execution("injected flush failure"));
        }
        Ok(())
    }

    fn is_leader(&self) -> bool {
        self.leader
    }

    fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    fn table_manager(&self, _table: &str) -> Option<Arc<dyn TableManager>> {
        None
    }
}

/// Factory producing [`StubTableSpaceManager`]s and recording every
/// creation, so tests can reach the managers the activator booted.
pub struct StubTableSpaceFactory {
    created: Mutex<Vec<(TableSpaceName, Arc<StubTableSpaceManager>)>>,
    fail_start: Mutex<HashSet<TableSpaceName>>,
}

impl StubTableSpaceFactory {
    pub fn new() -> Self {
        Self {
            created: Mutex::new(Vec::new()),
            fail_start: Mutex::new(HashSet::new()),
        }
    }

    /// Make every future boot of `name` fail during `start`.
    pub fn fail_start_of(&self, name: &TableSpaceName) {
        self.fail_start.lock().insert(name.clone());
    }

    pub fn allow_start_of(&self, name: &TableSpaceName) {
        self.fail_start.lock().remove(name);
    }

    /// The most recently created manager for `name`.
    pub fn manager(&self, name: &TableSpaceName) -> Option<Arc<StubTableSpaceManager>> {
        self.created
            .lock()
            .iter()
            .rev()
            .find(|(created, _)| created == name)
            .map(|(_, manager)| manager.clone())
    }

    pub fn created_count(&self, name: &TableSpaceName) -> usize {
        self.created
            .lock()
            .iter()
            .filter(|(created, _)| created == name)
            .count()
    }
}

impl Default for StubTableSpaceFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl TableSpaceFactory for StubTableSpaceFactory {
    fn create(&self, context: TableSpaceContext) -> NodeResult<Arc<dyn TableSpaceManager>> {
        let leader = context.descriptor.leader == context.node_id;
        let name = context.descriptor.name.clone();
        let manager = if self.fail_start.lock().contains(&name) {
            Arc::new(StubTableSpaceManager::failing_start(leader))
        } else {
            Arc::new(StubTableSpaceManager::new(leader))
        };
        self.created.lock().push((name, manager.clone()));
        Ok(manager)
    }
}
