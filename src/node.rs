//! The node manager: the public façade of one cluster member.
//!
//! It owns the tablespace registry, the activator task and the worker pool,
//! shares the metadata store, page store and log manager with them, and
//! routes every incoming statement to the tablespace that owns it.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossfire::{mpsc, MTx, Rx};
use parking_lot::Mutex;
use tracing::{error, info, trace, warn};

use crate::activator;
use crate::config::NodeConfig;
use crate::error::{NodeError, NodeResult};
use crate::local::LocalTableSpaceFactory;
use crate::metadata::{MetadataError, MetadataStore};
use crate::model::{
    DdlResult, DmlResult, GetResult, NodeId, Statement, StatementBody, StatementResult,
    TableSpaceDescriptor, TableSpaceName,
};
use crate::pool::WorkerPool;
use crate::registry::TableSpaceRegistry;
use crate::storage::PageStore;
use crate::tablespace::{TableSpaceFactory, TableSpaceManager};
use crate::wal::CommitLogManager;

/// Manager of the local SiloDB node.
///
/// `start` boots the collaborators and the activator; `close` tears
/// everything down in order and joins the activator thread. All other
/// operations are safe to call from any number of client threads.
pub struct NodeManager {
    inner: Arc<NodeInner>,
}

pub(crate) struct NodeInner {
    pub(crate) config: NodeConfig,
    pub(crate) metadata: Arc<dyn MetadataStore>,
    pub(crate) pages: Arc<dyn PageStore>,
    pub(crate) logs: Arc<dyn CommitLogManager>,
    pub(crate) factory: Arc<dyn TableSpaceFactory>,
    pub(crate) registry: Arc<TableSpaceRegistry>,
    pub(crate) pool: WorkerPool,
    pub(crate) stopped: AtomicBool,
    wakeups: MTx<()>,
    wakeup_rx: Mutex<Option<Rx<()>>>,
    activator: Mutex<Option<JoinHandle<()>>>,
}

impl NodeInner {
    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub(crate) fn handle(&self) -> NodeHandle {
        NodeHandle {
            node_id: self.config.node_id.clone(),
            pool: self.pool.clone(),
            registry: Arc::downgrade(&self.registry),
        }
    }
}

impl NodeManager {
    /// Create a node manager using the built-in local tablespace executor.
    pub fn new(
        config: NodeConfig,
        metadata: Arc<dyn MetadataStore>,
        pages: Arc<dyn PageStore>,
        logs: Arc<dyn CommitLogManager>,
    ) -> Self {
        Self::with_factory(
            config,
            metadata,
            pages,
            logs,
            Arc::new(LocalTableSpaceFactory::new()),
        )
    }

    pub fn with_factory(
        config: NodeConfig,
        metadata: Arc<dyn MetadataStore>,
        pages: Arc<dyn PageStore>,
        logs: Arc<dyn CommitLogManager>,
        factory: Arc<dyn TableSpaceFactory>,
    ) -> Self {
        // One-slot wakeup channel: any number of pokes before a pass
        // collapse into a single pending reconciliation.
        let (wakeups, wakeup_rx) = mpsc::bounded_blocking(1);
        let pool = WorkerPool::new(config.node_id.as_str());
        Self {
            inner: Arc::new(NodeInner {
                config,
                metadata,
                pages,
                logs,
                factory,
                registry: Arc::new(TableSpaceRegistry::new()),
                pool,
                stopped: AtomicBool::new(false),
                wakeups,
                wakeup_rx: Mutex::new(Some(wakeup_rx)),
                activator: Mutex::new(None),
            }),
        }
    }

    /// Initial boot of the node: starts the metadata store, makes sure the
    /// default tablespace exists, starts the page store and launches the
    /// activator with one pending wakeup.
    pub fn start(&self) -> NodeResult<()> {
        let wakeup_rx = self
            .inner
            .wakeup_rx
            .lock()
            .take()
            .ok_or(NodeError::AlreadyStarted)?;

        self.inner.metadata.start()?;
        self.inner
            .metadata
            .ensure_default_table_space(&self.inner.config.node_id)?;
        {
            let _registry = self.inner.registry.exclusive();
            self.inner.pages.start()?;
        }

        let handle = activator::spawn(self.inner.clone(), wakeup_rx).map_err(|err| {
            NodeError::execution(format!("cannot spawn activator thread: {err}"))
        })?;
        *self.inner.activator.lock() = Some(handle);
        self.trigger_activator();
        info!(node = %self.inner.config.node_id, "node manager started");
        Ok(())
    }

    pub fn node_id(&self) -> &NodeId {
        &self.inner.config.node_id
    }

    /// Capability handle for tablespace managers and background workers.
    pub fn handle(&self) -> NodeHandle {
        self.inner.handle()
    }

    /// Wake the activator. Never blocks: if a reconciliation is already
    /// pending the poke is absorbed by it.
    pub fn trigger_activator(&self) {
        let _ = self.inner.wakeups.try_send(());
    }

    /// Execute one statement against the tablespace it names.
    ///
    /// `CreateTableSpace` is handled by the node itself and must not be
    /// part of a transaction; everything else is delegated to the local
    /// manager of the target tablespace.
    pub fn execute_statement(&self, statement: Statement) -> NodeResult<StatementResult> {
        trace!(tablespace = %statement.table_space, "execute statement");
        if statement.table_space.is_empty() {
            return Err(NodeError::invalid_statement(
                "statement does not name a tablespace",
            ));
        }

        match statement.body {
            StatementBody::CreateTableSpace {
                name,
                leader,
                replicas,
            } => {
                if statement.transaction_id != 0 {
                    return Err(NodeError::invalid_statement(
                        "CREATE TABLESPACE cannot be issued inside a transaction",
                    ));
                }
                self.create_table_space(name, leader, replicas)
            }
            _ => {
                let manager = self
                    .inner
                    .registry
                    .lookup(&statement.table_space)
                    .ok_or_else(|| NodeError::NoSuchTableSpace(statement.table_space.clone()))?;
                // The shared lock is already released; the tablespace call
                // runs without it.
                manager.execute_statement(statement)
            }
        }
    }

    /// Register a new tablespace in the cluster catalog.
    ///
    /// Returns as soon as the catalog write is durable; if this node is a
    /// replica, the local boot happens on the next reconciliation pass.
    /// Callers that need the tablespace ready use
    /// [`NodeManager::wait_for_table_space`].
    pub fn create_table_space(
        &self,
        name: TableSpaceName,
        leader: NodeId,
        replicas: BTreeSet<NodeId>,
    ) -> NodeResult<StatementResult> {
        let descriptor = TableSpaceDescriptor::builder()
            .name(name)
            .leader(leader)
            .replicas(replicas)
            .build()
            .map_err(|err| {
                NodeError::invalid_statement(format!("invalid CREATE TABLESPACE statement: {err}"))
            })?;

        match self.inner.metadata.register(descriptor) {
            Ok(()) => {
                self.trigger_activator();
                Ok(StatementResult::Ddl(DdlResult))
            }
            Err(MetadataError::AlreadyRegistered(name)) => {
                Err(NodeError::ddl(format!("tablespace {name} already exists")))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Execute a single point lookup.
    pub fn get(&self, statement: Statement) -> NodeResult<GetResult> {
        match self.execute_statement(statement)? {
            StatementResult::Get(result) => Ok(result),
            other => Err(NodeError::execution(format!(
                "expected a get result, found a {} result",
                other.kind()
            ))),
        }
    }

    /// Execute a DML statement.
    pub fn execute_update(&self, statement: Statement) -> NodeResult<DmlResult> {
        match self.execute_statement(statement)? {
            StatementResult::Dml(result) => Ok(result),
            other => Err(NodeError::execution(format!(
                "expected a dml result, found a {} result",
                other.kind()
            ))),
        }
    }

    /// Wait until `table_space` is hosted here (and led here, with
    /// `require_leader`), polling the registry. Returns false on timeout;
    /// a zero timeout reports the current availability.
    pub fn wait_for_table_space(
        &self,
        table_space: &TableSpaceName,
        timeout: Duration,
        require_leader: bool,
    ) -> bool {
        self.wait_until(timeout, || {
            self.inner
                .registry
                .lookup(table_space)
                .is_some_and(|manager| !require_leader || manager.is_leader())
        })
    }

    /// As [`NodeManager::wait_for_table_space`], additionally requiring the
    /// tablespace's catalog to contain `table`.
    pub fn wait_for_table(
        &self,
        table_space: &TableSpaceName,
        table: &str,
        timeout: Duration,
        require_leader: bool,
    ) -> bool {
        self.wait_until(timeout, || {
            self.inner
                .registry
                .lookup(table_space)
                .is_some_and(|manager| {
                    (!require_leader || manager.is_leader())
                        && manager.table_manager(table).is_some()
                })
        })
    }

    fn wait_until(&self, timeout: Duration, predicate: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if predicate() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::sleep(self.inner.config.wait_poll_interval.min(deadline - now));
        }
    }

    /// Flush every hosted tablespace to the page store. The first failure
    /// is surfaced and stops the sweep.
    pub fn flush(&self) -> NodeResult<()> {
        let managers = self.inner.registry.snapshot();
        for manager in managers {
            manager.flush()?;
        }
        Ok(())
    }

    /// Offer a task to the worker pool; rejections are logged and dropped.
    pub fn submit<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if let Err(err) = self.inner.pool.submit(task) {
            warn!(node = %self.inner.config.node_id, error = %err, "background task rejected");
        }
    }

    /// The manager of `table_space`, if hosted here.
    pub fn table_space_manager(
        &self,
        table_space: &TableSpaceName,
    ) -> Option<Arc<dyn TableSpaceManager>> {
        self.inner.registry.lookup(table_space)
    }

    /// Orderly shutdown: stop the activator (which closes every tablespace,
    /// then the page store, then the metadata store), join it, and drain
    /// the worker pool. Idempotent.
    pub fn close(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.trigger_activator();
        let handle = self.inner.activator.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!(node = %self.inner.config.node_id, "activator thread panicked");
            }
            info!(node = %self.inner.config.node_id, "node manager closed");
        }
        self.inner.pool.shutdown();
    }
}

impl Drop for NodeManager {
    fn drop(&mut self) {
        self.close();
    }
}

/// Narrow capability object handed to tablespace managers instead of the
/// whole node: background work submission and registry lookups, through a
/// weak reference so a manager never keeps the node alive.
#[derive(Clone)]
pub struct NodeHandle {
    node_id: NodeId,
    pool: WorkerPool,
    registry: Weak<TableSpaceRegistry>,
}

impl NodeHandle {
    pub(crate) fn detached(node_id: NodeId, pool: WorkerPool) -> Self {
        Self {
            node_id,
            pool,
            registry: Weak::new(),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Offer a task to the node's worker pool; rejections are logged and
    /// dropped. Tasks must not capture strong references to node state.
    pub fn submit<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if let Err(err) = self.pool.submit(task) {
            warn!(node = %self.node_id, error = %err, "background task rejected");
        }
    }

    /// Look up another tablespace hosted on this node.
    pub fn table_space(&self, name: &TableSpaceName) -> Option<Arc<dyn TableSpaceManager>> {
        self.registry
            .upgrade()
            .and_then(|registry| registry.lookup(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Once;

    use crate::keys::Bytes;
    use crate::metadata::MemoryMetadataStore;
    use crate::model::{Record, DEFAULT_TABLE_SPACE};
    use crate::storage::MemoryPageStore;
    use crate::test_support::{BreakableCommitLogManager, StubTableSpaceFactory};

    const WAIT: Duration = Duration::from_secs(5);

    fn init_tracing() {
        static INIT: Once = Once::new();
        INIT.call_once(|| {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .try_init();
        });
    }

    struct Fixture {
        node: NodeManager,
        metadata: Arc<MemoryMetadataStore>,
        pages: Arc<MemoryPageStore>,
        logs: Arc<BreakableCommitLogManager>,
    }

    /// A started node backed by the in-memory collaborators and the local
    /// tablespace executor.
    fn local_node(node_id: &str) -> Fixture {
        init_tracing();
        let metadata = Arc::new(MemoryMetadataStore::new());
        let pages = Arc::new(MemoryPageStore::new());
        let logs = Arc::new(BreakableCommitLogManager::new());
        let node = NodeManager::new(
            NodeConfig::builder(node_id)
                .wait_poll_interval(Duration::from_millis(5))
                .build(),
            metadata.clone(),
            pages.clone(),
            logs.clone(),
        );
        node.start().expect("start node");
        Fixture {
            node,
            metadata,
            pages,
            logs,
        }
    }

    fn stub_node(node_id: &str) -> (Fixture, Arc<StubTableSpaceFactory>) {
        init_tracing();
        let metadata = Arc::new(MemoryMetadataStore::new());
        let pages = Arc::new(MemoryPageStore::new());
        let logs = Arc::new(BreakableCommitLogManager::new());
        let factory = Arc::new(StubTableSpaceFactory::new());
        let node = NodeManager::with_factory(
            NodeConfig::builder(node_id)
                .wait_poll_interval(Duration::from_millis(5))
                .build(),
            metadata.clone(),
            pages.clone(),
            logs.clone(),
            factory.clone(),
        );
        node.start().expect("start node");
        (
            Fixture {
                node,
                metadata,
                pages,
                logs,
            },
            factory,
        )
    }

    fn default_space() -> TableSpaceName {
        TableSpaceName::from(DEFAULT_TABLE_SPACE)
    }

    fn create_table_space(fixture: &Fixture, name: &str, leader: &str, replicas: &[&str]) {
        let result = fixture
            .node
            .execute_statement(Statement::create_table_space(
                name,
                leader,
                replicas.iter().map(|id| NodeId::from(*id)),
            ))
            .expect("create tablespace");
        assert!(matches!(result, StatementResult::Ddl(_)));
    }

    #[test]
    fn default_boot_hosts_the_default_tablespace() {
        let fixture = local_node("n1");
        let descriptor = fixture
            .metadata
            .describe(&default_space())
            .expect("default registered");
        assert!(descriptor.replicas.contains(&NodeId::from("n1")));
        assert!(fixture.node.wait_for_table_space(&default_space(), WAIT, true));
        fixture.node.close();
    }

    #[test]
    fn create_and_use_a_new_tablespace() {
        let fixture = local_node("n1");
        let ts2 = TableSpaceName::from("ts2");
        create_table_space(&fixture, "ts2", "n1", &["n1"]);
        assert!(fixture.node.wait_for_table_space(&ts2, WAIT, true));

        fixture
            .node
            .execute_statement(Statement::create_table("ts2", "t1"))
            .expect("create table");
        assert!(fixture.node.wait_for_table(&ts2, "t1", WAIT, true));

        let dml = fixture
            .node
            .execute_update(Statement::insert(
                "ts2",
                "t1",
                Bytes::from_string("k1"),
                Bytes::from_string("v1"),
            ))
            .expect("insert");
        assert_eq!(dml.update_count, 1);
        assert_eq!(dml.key, Some(Bytes::from_string("k1")));

        let get = fixture
            .node
            .get(Statement::get("ts2", "t1", Bytes::from_string("k1")))
            .expect("get");
        assert_eq!(
            get.record,
            Some(Record::new(Bytes::from_string("k1"), Bytes::from_string("v1")))
        );
        fixture.node.close();
    }

    #[test]
    fn tablespace_without_local_replica_is_not_hosted() {
        let fixture = local_node("n1");
        let ts3 = TableSpaceName::from("ts3");
        create_table_space(&fixture, "ts3", "n2", &["n2"]);

        assert!(!fixture
            .node
            .wait_for_table_space(&ts3, Duration::from_millis(500), false));
        let err = fixture
            .node
            .execute_statement(Statement::get("ts3", "t", Bytes::from_string("k")))
            .unwrap_err();
        assert!(matches!(err, NodeError::NoSuchTableSpace(name) if name == ts3));
        fixture.node.close();
    }

    #[test]
    fn transactional_create_table_space_is_rejected() {
        let fixture = local_node("n1");
        let err = fixture
            .node
            .execute_statement(
                Statement::create_table_space("ts4", "n1", [NodeId::from("n1")])
                    .in_transaction(7),
            )
            .unwrap_err();
        assert!(matches!(err, NodeError::InvalidStatement(_)));
        // The catalog must be untouched.
        let err = fixture
            .metadata
            .describe(&TableSpaceName::from("ts4"))
            .unwrap_err();
        assert!(matches!(err, MetadataError::UnknownTableSpace(_)));
        fixture.node.close();
    }

    #[test]
    fn invalid_descriptor_fails_before_touching_the_catalog() {
        let fixture = local_node("n1");
        let err = fixture
            .node
            .execute_statement(Statement::create_table_space(
                "ts5",
                "n2",
                [NodeId::from("n1")],
            ))
            .unwrap_err();
        assert!(matches!(err, NodeError::InvalidStatement(_)));
        assert!(fixture
            .metadata
            .describe(&TableSpaceName::from("ts5"))
            .is_err());
        fixture.node.close();
    }

    #[test]
    fn duplicate_tablespace_is_a_ddl_error() {
        let fixture = local_node("n1");
        create_table_space(&fixture, "ts2", "n1", &["n1"]);
        let err = fixture
            .node
            .execute_statement(Statement::create_table_space(
                "ts2",
                "n1",
                [NodeId::from("n1")],
            ))
            .unwrap_err();
        assert!(matches!(err, NodeError::Ddl(_)));
        fixture.node.close();
    }

    #[test]
    fn statement_without_tablespace_is_rejected() {
        let fixture = local_node("n1");
        let err = fixture
            .node
            .execute_statement(Statement::get("", "t", Bytes::from_string("k")))
            .unwrap_err();
        assert!(matches!(err, NodeError::InvalidStatement(_)));
        fixture.node.close();
    }

    #[test]
    fn failed_tablespace_is_evicted_on_the_next_pass() {
        let fixture = local_node("n1");
        let ts2 = TableSpaceName::from("ts2");
        create_table_space(&fixture, "ts2", "n1", &["n1"]);
        assert!(fixture.node.wait_for_table_space(&ts2, WAIT, true));
        fixture
            .node
            .execute_statement(Statement::create_table("ts2", "t1"))
            .expect("create table");

        fixture.logs.trip();
        let err = fixture
            .node
            .execute_statement(Statement::insert(
                "ts2",
                "t1",
                Bytes::from_string("k"),
                Bytes::from_string("v"),
            ))
            .unwrap_err();
        assert!(matches!(err, NodeError::Log(_)));
        let manager = fixture
            .node
            .table_space_manager(&ts2)
            .expect("still registered");
        assert!(manager.is_failed());

        fixture.node.trigger_activator();
        let deadline = Instant::now() + WAIT;
        while fixture.node.table_space_manager(&ts2).is_some() {
            assert!(Instant::now() < deadline, "failed tablespace never evicted");
            thread::sleep(Duration::from_millis(5));
        }
        fixture.node.close();
    }

    #[test]
    fn orderly_shutdown_closes_managers_then_stores() {
        let (fixture, factory) = stub_node("n1");
        create_table_space(&fixture, "ts2", "n1", &["n1"]);
        create_table_space(&fixture, "ts3", "n1", &["n1"]);
        assert!(fixture
            .node
            .wait_for_table_space(&TableSpaceName::from("ts2"), WAIT, false));
        assert!(fixture
            .node
            .wait_for_table_space(&TableSpaceName::from("ts3"), WAIT, false));

        fixture.node.close();

        for name in ["ts2", "ts3", DEFAULT_TABLE_SPACE] {
            let manager = factory
                .manager(&TableSpaceName::from(name))
                .expect("created");
            assert!(manager.was_started());
            assert!(manager.was_closed());
        }
        assert!(fixture.pages.is_closed());
        assert!(fixture.metadata.is_closed());
        assert!(fixture
            .node
            .table_space_manager(&default_space())
            .is_none());
        // A second close is a no-op.
        fixture.node.close();
    }

    #[test]
    fn wait_with_zero_timeout_reports_current_availability() {
        let fixture = local_node("n1");
        assert!(fixture.node.wait_for_table_space(&default_space(), WAIT, true));
        assert!(fixture
            .node
            .wait_for_table_space(&default_space(), Duration::ZERO, true));
        assert!(!fixture
            .node
            .wait_for_table_space(&TableSpaceName::from("missing"), Duration::ZERO, false));
        fixture.node.close();
    }

    #[test]
    fn concurrent_triggers_coalesce_into_at_least_one_pass() {
        let (fixture, factory) = stub_node("n1");
        let ts = TableSpaceName::from("ts-poked");
        fixture
            .metadata
            .register(TableSpaceDescriptor::single_node("ts-poked", NodeId::from("n1")))
            .expect("register");

        thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| fixture.node.trigger_activator());
            }
        });

        assert!(fixture.node.wait_for_table_space(&ts, WAIT, false));
        assert_eq!(factory.created_count(&ts), 1);
        fixture.node.close();
    }

    #[test]
    fn flush_surfaces_the_first_tablespace_failure() {
        let (fixture, factory) = stub_node("n1");
        create_table_space(&fixture, "ts2", "n1", &["n1"]);
        assert!(fixture
            .node
            .wait_for_table_space(&TableSpaceName::from("ts2"), WAIT, false));

        fixture.node.flush().expect("flush with healthy managers");
        factory
            .manager(&TableSpaceName::from("ts2"))
            .expect("stub")
            .fail_flush();
        let err = fixture.node.flush().unwrap_err();
        assert!(matches!(err, NodeError::Execution(_)));
        fixture.node.close();
    }

    #[test]
    fn result_shape_mismatch_is_reported() {
        let fixture = local_node("n1");
        create_table_space(&fixture, "ts2", "n1", &["n1"]);
        assert!(fixture
            .node
            .wait_for_table_space(&TableSpaceName::from("ts2"), WAIT, true));
        fixture
            .node
            .execute_statement(Statement::create_table("ts2", "t1"))
            .expect("create table");

        let err = fixture
            .node
            .get(Statement::insert(
                "ts2",
                "t1",
                Bytes::from_string("k"),
                Bytes::from_string("v"),
            ))
            .unwrap_err();
        assert!(matches!(err, NodeError::Execution(_)));
        fixture.node.close();
    }

    #[test]
    fn starting_twice_fails() {
        let fixture = local_node("n1");
        let err = fixture.node.start().unwrap_err();
        assert!(matches!(err, NodeError::AlreadyStarted));
        assert_eq!(fixture.node.node_id(), &NodeId::from("n1"));
        fixture.node.close();
    }

    #[test]
    fn submitted_background_work_runs() {
        let fixture = local_node("n1");
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        fixture.node.submit(move || flag.store(true, Ordering::SeqCst));
        let deadline = Instant::now() + WAIT;
        while !ran.load(Ordering::SeqCst) {
            assert!(Instant::now() < deadline, "task never ran");
            thread::sleep(Duration::from_millis(5));
        }
        fixture.node.close();
    }
}
