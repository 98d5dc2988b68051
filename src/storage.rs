//! Physical storage of data pages and per-tablespace table catalogs.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::DashMap;
use thiserror::Error;

use crate::keys::Bytes;
use crate::model::{Record, Table, TableSpaceName};
use crate::wal::Lsn;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("page store is closed")]
    Closed,
    #[error("unknown page {page_id} for table {table}")]
    UnknownPage { table: String, page_id: u64 },
    #[error("page store unavailable: {0}")]
    Unavailable(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Physical page store. Pages are keyed by `(table, page id)`; page ids are
/// assigned by [`PageStore::write_page`], densely from 1 within a
/// checkpoint.
pub trait PageStore: Send + Sync {
    fn start(&self) -> StorageResult<()>;

    fn close(&self) -> StorageResult<()>;

    fn load_page(&self, table: &str, page_id: u64) -> StorageResult<Vec<Record>>;

    /// Feed every known key of `table`, with the page that holds it, into
    /// `consumer`.
    fn load_existing_keys(
        &self,
        table: &str,
        consumer: &mut dyn FnMut(&Bytes, u64),
    ) -> StorageResult<()>;

    /// Persist a page written at `lsn` and return its page id.
    fn write_page(&self, table: &str, lsn: Lsn, page: Vec<Record>) -> StorageResult<u64>;

    fn actual_number_of_pages(&self, table: &str) -> StorageResult<u64>;

    /// Load the table catalog of `table_space` as of `lsn`.
    fn load_tables(&self, lsn: Lsn, table_space: &TableSpaceName) -> StorageResult<Vec<Table>>;

    /// Persist the table catalog of `table_space` at `lsn`; advances the
    /// checkpoint sequence number.
    fn write_tables(
        &self,
        table_space: &TableSpaceName,
        lsn: Lsn,
        tables: Vec<Table>,
    ) -> StorageResult<()>;

    fn last_checkpoint_lsn(&self) -> Lsn;
}

/// In-memory page store for single-node deployments and tests.
///
/// Pages written at a new LSN replace the pages of the previous checkpoint
/// for that table, so a boot always observes exactly one checkpoint's worth
/// of pages.
#[derive(Default)]
pub struct MemoryPageStore {
    pages: DashMap<String, (Lsn, Vec<Vec<Record>>)>,
    catalogs: DashMap<TableSpaceName, (Lsn, Vec<Table>)>,
    checkpoint: AtomicU64,
    started: AtomicBool,
    closed: AtomicBool,
}

impl MemoryPageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> StorageResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StorageError::Closed);
        }
        if !self.started.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("page store not started".to_owned()));
        }
        Ok(())
    }
}

impl PageStore for MemoryPageStore {
    fn start(&self) -> StorageResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StorageError::Closed);
        }
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) -> StorageResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn load_page(&self, table: &str, page_id: u64) -> StorageResult<Vec<Record>> {
        self.ensure_open()?;
        let pages = self
            .pages
            .get(table)
            .ok_or_else(|| StorageError::UnknownPage {
                table: table.to_owned(),
                page_id,
            })?;
        let index = page_id
            .checked_sub(1)
            .and_then(|index| usize::try_from(index).ok())
            .ok_or_else(|| StorageError::UnknownPage {
                table: table.to_owned(),
                page_id,
            })?;
        pages
            .1
            .get(index)
            .cloned()
            .ok_or_else(|| StorageError::UnknownPage {
                table: table.to_owned(),
                page_id,
            })
    }

    fn load_existing_keys(
        &self,
        table: &str,
        consumer: &mut dyn FnMut(&Bytes, u64),
    ) -> StorageResult<()> {
        self.ensure_open()?;
        if let Some(pages) = self.pages.get(table) {
            for (index, page) in pages.1.iter().enumerate() {
                for record in page {
                    consumer(&record.key, index as u64 + 1);
                }
            }
        }
        Ok(())
    }

    fn write_page(&self, table: &str, lsn: Lsn, page: Vec<Record>) -> StorageResult<u64> {
        self.ensure_open()?;
        let mut pages = self
            .pages
            .entry(table.to_owned())
            .or_insert_with(|| (lsn, Vec::new()));
        // A write at a newer LSN starts the next checkpoint's page set.
        if pages.0 != lsn {
            pages.0 = lsn;
            pages.1.clear();
        }
        pages.1.push(page);
        Ok(pages.1.len() as u64)
    }

    fn actual_number_of_pages(&self, table: &str) -> StorageResult<u64> {
        self.ensure_open()?;
        Ok(self.pages.get(table).map_or(0, |pages| pages.1.len() as u64))
    }

    fn load_tables(&self, _lsn: Lsn, table_space: &TableSpaceName) -> StorageResult<Vec<Table>> {
        self.ensure_open()?;
        Ok(self
            .catalogs
            .get(table_space)
            .map(|catalog| catalog.1.clone())
            .unwrap_or_default())
    }

    fn write_tables(
        &self,
        table_space: &TableSpaceName,
        lsn: Lsn,
        tables: Vec<Table>,
    ) -> StorageResult<()> {
        self.ensure_open()?;
        self.catalogs.insert(table_space.clone(), (lsn, tables));
        self.checkpoint.fetch_max(lsn.0, Ordering::SeqCst);
        Ok(())
    }

    fn last_checkpoint_lsn(&self) -> Lsn {
        Lsn(self.checkpoint.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(key: &str, value: &str) -> Record {
        Record::new(Bytes::from_string(key), Bytes::from_string(value))
    }

    fn started() -> MemoryPageStore {
        let store = MemoryPageStore::new();
        store.start().expect("start");
        store
    }

    #[test]
    fn pages_round_trip() {
        let store = started();
        let first = store
            .write_page("t", Lsn(1), vec![record("a", "1")])
            .expect("write");
        let second = store
            .write_page("t", Lsn(1), vec![record("b", "2")])
            .expect("write");
        assert_eq!((first, second), (1, 2));
        assert_eq!(store.actual_number_of_pages("t").expect("count"), 2);
        let page = store.load_page("t", 2).expect("load");
        assert_eq!(page, vec![record("b", "2")]);
    }

    #[test]
    fn writes_at_a_newer_lsn_replace_older_pages() {
        let store = started();
        store
            .write_page("t", Lsn(1), vec![record("a", "1")])
            .expect("write");
        store
            .write_page("t", Lsn(5), vec![record("b", "2")])
            .expect("write");
        assert_eq!(store.actual_number_of_pages("t").expect("count"), 1);
        assert_eq!(store.load_page("t", 1).expect("load"), vec![record("b", "2")]);
    }

    #[test]
    fn load_existing_keys_reports_key_and_page() {
        let store = started();
        store
            .write_page("t", Lsn(1), vec![record("a", "1"), record("b", "2")])
            .expect("write");
        let mut seen = Vec::new();
        store
            .load_existing_keys("t", &mut |key, page_id| {
                seen.push((key.clone(), page_id));
            })
            .expect("keys");
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|(_, page_id)| *page_id == 1));
    }

    #[test]
    fn missing_page_is_an_error() {
        let store = started();
        let err = store.load_page("t", 1).unwrap_err();
        assert!(matches!(err, StorageError::UnknownPage { page_id: 1, .. }));
    }

    #[test]
    fn table_catalog_round_trip_advances_checkpoint() {
        let store = started();
        let space = TableSpaceName::from("ts1");
        assert_eq!(store.last_checkpoint_lsn(), Lsn::ZERO);
        store
            .write_tables(&space, Lsn(7), vec![Table::new("t1")])
            .expect("write tables");
        assert_eq!(store.last_checkpoint_lsn(), Lsn(7));
        let tables = store.load_tables(Lsn(7), &space).expect("load tables");
        assert_eq!(tables, vec![Table::new("t1")]);
    }

    #[test]
    fn closed_store_rejects_operations() {
        let store = started();
        store.close().expect("close");
        assert!(matches!(
            store.write_page("t", Lsn(1), Vec::new()),
            Err(StorageError::Closed)
        ));
    }
}
