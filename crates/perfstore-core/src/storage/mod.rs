//! Persistent storage for telemetry.
//!
//! Tables live in *namespaces*: one SQLite database per namespace, shared by
//! every table in it through a [`SharedConnection`]. A namespace's
//! [`StorageCharacteristic`] picks the durability/throughput trade-off.
//!
//! Every table serialises its statements by holding the connection lock for a
//! whole operation, and runs each operation inside one transaction, so a read
//! never observes half of a poll batch.

pub mod cpu_table;
pub mod event_table;
pub mod live_allocation_table;
pub mod memory_stats_table;
pub mod profiler_table;
pub mod unified_event_table;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use rusqlite::{Connection, TransactionBehavior};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::config::StorageConfig;
use crate::error::StorageError;

pub use cpu_table::{CpuPollBatch, CpuTable};
pub use event_table::EventTable;
pub use live_allocation_table::LiveAllocationTable;
pub use memory_stats_table::{
    FetchedDump, FetchedLegacyAllocations, LegacyAllocationRow, MemoryPollBatch, MemoryStatsTable,
};
pub use profiler_table::{DeviceSnapshot, ProfilerTable};
pub use unified_event_table::UnifiedEventTable;

/// A connection shared by all tables of one namespace
pub type SharedConnection = Arc<Mutex<Connection>>;

/// How a namespace trades durability for write throughput
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageCharacteristic {
    /// Full fsync on commit; used for metadata and artifacts
    Default,
    /// Relaxed sync for high-volume event streams
    Performant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BackingNamespace {
    pub name: &'static str,
    pub characteristic: StorageCharacteristic,
}

impl BackingNamespace {
    /// Shared by every table that does not ask for its own database
    pub const DEFAULT_SHARED: Self = Self {
        name: "perfstore",
        characteristic: StorageCharacteristic::Default,
    };

    /// Live allocation events; write-heavy
    pub const LIVE_ALLOCATIONS: Self = Self {
        name: "live_allocations",
        characteristic: StorageCharacteristic::Performant,
    };
}

impl std::fmt::Display for BackingNamespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name)
    }
}

/// Hands out the connection for a namespace.
///
/// Asking twice for the same namespace returns the same connection.
pub trait ConnectionProvider: Send + Sync {
    fn connection(&self, namespace: &BackingNamespace) -> Result<SharedConnection, StorageError>;
}

fn configure_connection(
    conn: &Connection,
    characteristic: StorageCharacteristic,
    busy_timeout: Duration,
) -> Result<(), StorageError> {
    conn.busy_timeout(busy_timeout)?;
    match characteristic {
        StorageCharacteristic::Default => {
            conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL;")?;
        }
        StorageCharacteristic::Performant => {
            conn.execute_batch(
                "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; \
                 PRAGMA temp_store=MEMORY; PRAGMA cache_size=-16000;",
            )?;
        }
    }
    Ok(())
}

/// One database file per namespace under a data directory
#[derive(Debug)]
pub struct SqliteConnectionProvider {
    data_dir: PathBuf,
    busy_timeout: Duration,
    open: Mutex<HashMap<&'static str, SharedConnection>>,
}

impl SqliteConnectionProvider {
    #[must_use]
    pub fn new(data_dir: impl Into<PathBuf>, busy_timeout: Duration) -> Self {
        Self {
            data_dir: data_dir.into(),
            busy_timeout,
            open: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn from_config(config: &StorageConfig) -> Self {
        Self::new(
            config.resolved_data_dir(),
            Duration::from_millis(config.busy_timeout_ms),
        )
    }

    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Database file backing `namespace`
    #[must_use]
    pub fn database_path(&self, namespace: &BackingNamespace) -> PathBuf {
        self.data_dir.join(format!("{}.sql", namespace.name))
    }
}

impl ConnectionProvider for SqliteConnectionProvider {
    fn connection(&self, namespace: &BackingNamespace) -> Result<SharedConnection, StorageError> {
        let mut open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(conn) = open.get(namespace.name) {
            return Ok(Arc::clone(conn));
        }

        std::fs::create_dir_all(&self.data_dir).map_err(|e| {
            StorageError::Database(format!(
                "cannot create data directory {}: {e}",
                self.data_dir.display()
            ))
        })?;
        let path = self.database_path(namespace);
        let conn = Connection::open(&path)?;
        configure_connection(&conn, namespace.characteristic, self.busy_timeout)?;
        info!(
            namespace = %namespace,
            path = %path.display(),
            characteristic = ?namespace.characteristic,
            "opened namespace database"
        );

        let shared = Arc::new(Mutex::new(conn));
        open.insert(namespace.name, Arc::clone(&shared));
        Ok(shared)
    }
}

/// Private in-memory database per namespace; nothing survives the process
#[derive(Debug, Default)]
pub struct InMemoryConnectionProvider {
    open: Mutex<HashMap<&'static str, SharedConnection>>,
}

impl InMemoryConnectionProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConnectionProvider for InMemoryConnectionProvider {
    fn connection(&self, namespace: &BackingNamespace) -> Result<SharedConnection, StorageError> {
        let mut open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(conn) = open.get(namespace.name) {
            return Ok(Arc::clone(conn));
        }
        let conn = Connection::open_in_memory()?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let shared = Arc::new(Mutex::new(conn));
        open.insert(namespace.name, Arc::clone(&shared));
        debug!(namespace = %namespace, "opened in-memory namespace");
        Ok(shared)
    }
}

/// Connection slot, schema, and query accounting common to every table
#[derive(Debug)]
pub(crate) struct TableHandle {
    name: &'static str,
    schema: &'static str,
    conn: RwLock<Option<SharedConnection>>,
    queries: AtomicU64,
}

impl TableHandle {
    pub(crate) const fn new(name: &'static str, schema: &'static str) -> Self {
        Self {
            name,
            schema,
            conn: RwLock::new(None),
            queries: AtomicU64::new(0),
        }
    }

    /// Create the schema if absent and bind the table to `conn`.
    ///
    /// Safe to repeat, including against a database created by an earlier
    /// process.
    pub(crate) fn initialize(&self, conn: &SharedConnection) -> Result<(), StorageError> {
        {
            let guard = conn.lock().unwrap_or_else(PoisonError::into_inner);
            guard.execute_batch(self.schema)?;
        }
        *self.conn.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(conn));
        debug!(table = self.name, "table initialized");
        Ok(())
    }

    pub(crate) fn is_initialized(&self) -> bool {
        self.conn
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub(crate) fn query_count(&self) -> u64 {
        self.queries.load(Ordering::Relaxed)
    }

    fn shared(&self) -> Result<SharedConnection, StorageError> {
        self.conn
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(StorageError::NotInitialized(self.name))
    }

    /// Run `op` in a deferred transaction; counts as one query
    pub(crate) fn read<T>(
        &self,
        op: impl FnOnce(&Connection) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        self.run(TransactionBehavior::Deferred, op)
    }

    /// Run `op` in an immediate transaction and commit it; counts as one query
    pub(crate) fn write<T>(
        &self,
        op: impl FnOnce(&Connection) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        self.run(TransactionBehavior::Immediate, op)
    }

    fn run<T>(
        &self,
        behavior: TransactionBehavior,
        op: impl FnOnce(&Connection) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let shared = self.shared()?;
        let mut guard = shared.lock().unwrap_or_else(PoisonError::into_inner);
        self.queries.fetch_add(1, Ordering::Relaxed);
        let tx = guard.transaction_with_behavior(behavior)?;
        let out = op(&tx)?;
        tx.commit()?;
        Ok(out)
    }
}

pub(crate) fn to_blob<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    Ok(serde_json::to_vec(value)?)
}

pub(crate) fn from_blob<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
    Ok(serde_json::from_slice(bytes)?)
}

pub(crate) fn decode_all<T: DeserializeOwned>(blobs: &[Vec<u8>]) -> Result<Vec<T>, StorageError> {
    blobs.iter().map(|b| from_blob(b)).collect()
}
