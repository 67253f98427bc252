//! Memory samples plus heap dump and allocation-tracking artifacts.

use rusqlite::{Connection, OptionalExtension, params};

use super::{SharedConnection, TableHandle, decode_all, from_blob, to_blob};
use crate::error::StorageError;
use crate::types::memory::{
    AllocatedClass, AllocationContextsResponse, AllocationStack, AllocationsInfo,
    DumpDataResponse, HeapDumpInfo, LegacyAllocationEvent, MemoryData, MemorySample,
    VmStatsSample,
};
use crate::types::{DumpStatus, Session, TimeRange, UNSPECIFIED_END};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS Memory_Samples (
    Session INTEGER NOT NULL,
    Type INTEGER NOT NULL,
    Timestamp INTEGER NOT NULL,
    Data BLOB NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_Memory_Samples_Session_Type_Timestamp
    ON Memory_Samples (Session, Type, Timestamp);

CREATE TABLE IF NOT EXISTS Memory_HeapDump (
    Session INTEGER NOT NULL,
    StartTime INTEGER NOT NULL,
    EndTime INTEGER NOT NULL,
    Status INTEGER NOT NULL,
    InfoData BLOB NOT NULL,
    DumpData BLOB,
    PRIMARY KEY (Session, StartTime)
);

CREATE TABLE IF NOT EXISTS Memory_AllocationInfo (
    Session INTEGER NOT NULL,
    StartTime INTEGER NOT NULL,
    EndTime INTEGER NOT NULL,
    InfoData BLOB NOT NULL,
    EventsData BLOB,
    DumpData BLOB,
    PRIMARY KEY (Session, StartTime)
);

CREATE TABLE IF NOT EXISTS Memory_LegacyAllocatedClass (
    Session INTEGER NOT NULL,
    ClassId INTEGER NOT NULL,
    Data BLOB NOT NULL,
    PRIMARY KEY (Session, ClassId)
);

CREATE TABLE IF NOT EXISTS Memory_LegacyAllocationStack (
    Session INTEGER NOT NULL,
    StackId INTEGER NOT NULL,
    Data BLOB NOT NULL,
    PRIMARY KEY (Session, StackId)
);
";

const SAMPLE_MEMORY: i64 = 0;
const SAMPLE_VM_STATS: i64 = 1;

/// Bytes fetched for a completed heap dump, with the status to record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedDump {
    pub start_time: i64,
    pub status: DumpStatus,
    pub data: Vec<u8>,
}

/// Legacy allocation artifacts fetched for one tracking window
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FetchedLegacyAllocations {
    pub start_time: i64,
    pub events: Option<Vec<LegacyAllocationEvent>>,
    pub dump: Option<Vec<u8>>,
}

/// Everything one memory stats poll iteration writes
#[derive(Debug, Clone, Default)]
pub struct MemoryPollBatch {
    pub data: MemoryData,
    pub dumps: Vec<FetchedDump>,
    pub legacy: Vec<FetchedLegacyAllocations>,
}

/// An allocation-tracking row and whatever artifacts it has so far
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyAllocationRow {
    pub info: AllocationsInfo,
    pub events: Option<Vec<LegacyAllocationEvent>>,
    pub dump: Option<Vec<u8>>,
}

#[derive(Debug)]
pub struct MemoryStatsTable {
    handle: TableHandle,
}

impl Default for MemoryStatsTable {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStatsTable {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            handle: TableHandle::new("memory_stats", SCHEMA),
        }
    }

    pub fn initialize(&self, conn: &SharedConnection) -> Result<(), StorageError> {
        self.handle.initialize(conn)
    }

    pub fn query_count(&self) -> u64 {
        self.handle.query_count()
    }

    pub fn insert_memory_samples(
        &self,
        session: &Session,
        samples: &[MemorySample],
    ) -> Result<(), StorageError> {
        self.handle.write(|conn| {
            insert_samples(conn, session.session_id, SAMPLE_MEMORY, samples, |s| s.timestamp)
        })
    }

    pub fn insert_vm_stats(
        &self,
        session: &Session,
        samples: &[VmStatsSample],
    ) -> Result<(), StorageError> {
        self.handle.write(|conn| {
            insert_samples(conn, session.session_id, SAMPLE_VM_STATS, samples, |s| s.timestamp)
        })
    }

    /// Samples in `(start, end]` and artifact descriptors overlapping the range,
    /// read as one snapshot
    pub fn get_data(&self, session: &Session, range: TimeRange) -> Result<MemoryData, StorageError> {
        self.handle.read(|conn| {
            let id = session.session_id;
            Ok(MemoryData {
                mem_samples: query_samples(conn, id, SAMPLE_MEMORY, range)?,
                vm_stats_samples: query_samples(conn, id, SAMPLE_VM_STATS, range)?,
                heap_dump_infos: query_heap_infos(conn, id, range)?,
                allocations_infos: query_allocation_infos(conn, id, range)?,
            })
        })
    }

    /// Record a new dump descriptor, discarding any bytes stored for the same
    /// start time; the dump is `NotReady` until its data arrives
    pub fn insert_or_replace_heap_info(
        &self,
        session: &Session,
        info: &HeapDumpInfo,
    ) -> Result<(), StorageError> {
        self.handle.write(|conn| {
            conn.prepare_cached(
                "INSERT OR REPLACE INTO Memory_HeapDump
                 (Session, StartTime, EndTime, Status, InfoData, DumpData)
                 VALUES (?1, ?2, ?3, ?4, ?5, NULL)",
            )?
            .execute(params![
                session.session_id,
                info.start_time,
                info.end_time,
                DumpStatus::NotReady.as_i64(),
                to_blob(info)?
            ])?;
            Ok(())
        })
    }

    /// Attach bytes and a final status to an existing dump descriptor.
    ///
    /// Returns false when no descriptor exists for `start_time`.
    pub fn insert_heap_dump_data(
        &self,
        session: &Session,
        start_time: i64,
        status: DumpStatus,
        data: &[u8],
    ) -> Result<bool, StorageError> {
        self.handle
            .write(|conn| update_dump(conn, session.session_id, start_time, status, data))
    }

    /// Descriptor and bytes of an imported dump, written together
    pub fn import_heap_dump(
        &self,
        session: &Session,
        info: &HeapDumpInfo,
        data: &[u8],
    ) -> Result<(), StorageError> {
        self.handle.write(|conn| {
            conn.prepare_cached(
                "INSERT OR REPLACE INTO Memory_HeapDump
                 (Session, StartTime, EndTime, Status, InfoData, DumpData)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?
            .execute(params![
                session.session_id,
                info.start_time,
                info.end_time,
                DumpStatus::Success.as_i64(),
                to_blob(info)?,
                data
            ])?;
            Ok(())
        })
    }

    /// `NotFound` when no dump started at `start_time`
    pub fn get_heap_dump_status(
        &self,
        session: &Session,
        start_time: i64,
    ) -> Result<DumpStatus, StorageError> {
        self.handle.read(|conn| {
            let status = conn
                .prepare_cached(
                    "SELECT Status FROM Memory_HeapDump WHERE Session = ?1 AND StartTime = ?2",
                )?
                .query_row(params![session.session_id, start_time], |row| {
                    row.get::<_, i64>(0)
                })
                .optional()?;
            Ok(status.map_or(DumpStatus::NotFound, DumpStatus::from_i64))
        })
    }

    /// Status and, on `Success`, the dump bytes
    pub fn get_heap_dump(
        &self,
        session: &Session,
        start_time: i64,
    ) -> Result<DumpDataResponse, StorageError> {
        self.handle.read(|conn| {
            let row = conn
                .prepare_cached(
                    "SELECT Status, DumpData FROM Memory_HeapDump
                     WHERE Session = ?1 AND StartTime = ?2",
                )?
                .query_row(params![session.session_id, start_time], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, Option<Vec<u8>>>(1)?))
                })
                .optional()?;
            Ok(match row {
                None => DumpDataResponse {
                    status: DumpStatus::NotFound,
                    data: Vec::new(),
                },
                Some((code, data)) => {
                    let status = DumpStatus::from_i64(code);
                    match (status, data) {
                        (DumpStatus::Success, Some(data)) => DumpDataResponse { status, data },
                        (DumpStatus::Success, None) => {
                            return Err(StorageError::Corruption {
                                details: format!(
                                    "heap dump {start_time} of session {} is marked complete but has no data",
                                    session.session_id
                                ),
                            });
                        }
                        (status, _) => DumpDataResponse {
                            status,
                            data: Vec::new(),
                        },
                    }
                }
            })
        })
    }

    pub fn get_heap_dump_infos(
        &self,
        session: &Session,
        range: TimeRange,
    ) -> Result<Vec<HeapDumpInfo>, StorageError> {
        self.handle
            .read(|conn| query_heap_infos(conn, session.session_id, range))
    }

    /// Insert or update a tracking descriptor, keeping any stored artifacts
    pub fn insert_or_replace_allocations_info(
        &self,
        session: &Session,
        info: &AllocationsInfo,
    ) -> Result<(), StorageError> {
        self.handle
            .write(|conn| upsert_allocation_info(conn, session.session_id, info))
    }

    pub fn get_allocations_info(
        &self,
        session: &Session,
        start_time: i64,
    ) -> Result<Option<AllocationsInfo>, StorageError> {
        self.handle.read(|conn| {
            let blob = conn
                .prepare_cached(
                    "SELECT InfoData FROM Memory_AllocationInfo WHERE Session = ?1 AND StartTime = ?2",
                )?
                .query_row(params![session.session_id, start_time], |row| {
                    row.get::<_, Vec<u8>>(0)
                })
                .optional()?;
            blob.map(|b| from_blob(&b)).transpose()
        })
    }

    pub fn get_allocations_infos(
        &self,
        session: &Session,
        range: TimeRange,
    ) -> Result<Vec<AllocationsInfo>, StorageError> {
        self.handle
            .read(|conn| query_allocation_infos(conn, session.session_id, range))
    }

    /// Store a finished legacy tracking window with its events and dump.
    ///
    /// Classes and stacks already known for the session are kept.
    pub fn import_legacy_allocations(
        &self,
        session: &Session,
        info: &AllocationsInfo,
        contexts: &AllocationContextsResponse,
        events: &[LegacyAllocationEvent],
        dump: &[u8],
    ) -> Result<(), StorageError> {
        self.handle.write(|conn| {
            let id = session.session_id;
            upsert_allocation_info(conn, id, info)?;
            insert_legacy_contexts(conn, id, contexts)?;
            store_legacy(
                conn,
                id,
                &FetchedLegacyAllocations {
                    start_time: info.start_time,
                    events: Some(events.to_vec()),
                    dump: Some(dump.to_vec()),
                },
            )
        })
    }

    /// Classes and stacks of legacy tracking, looked up by id in request
    /// order; unknown ids are skipped
    pub fn get_legacy_allocation_contexts(
        &self,
        session: &Session,
        class_ids: &[i32],
        stack_ids: &[i64],
    ) -> Result<AllocationContextsResponse, StorageError> {
        self.handle.read(|conn| {
            let id = session.session_id;
            let mut class_stmt = conn.prepare_cached(
                "SELECT Data FROM Memory_LegacyAllocatedClass WHERE Session = ?1 AND ClassId = ?2",
            )?;
            let mut allocated_classes = Vec::with_capacity(class_ids.len());
            for class_id in class_ids {
                let blob = class_stmt
                    .query_row(params![id, class_id], |row| row.get::<_, Vec<u8>>(0))
                    .optional()?;
                if let Some(blob) = blob {
                    allocated_classes.push(from_blob::<AllocatedClass>(&blob)?);
                }
            }

            let mut stack_stmt = conn.prepare_cached(
                "SELECT Data FROM Memory_LegacyAllocationStack WHERE Session = ?1 AND StackId = ?2",
            )?;
            let mut allocation_stacks = Vec::with_capacity(stack_ids.len());
            for stack_id in stack_ids {
                let blob = stack_stmt
                    .query_row(params![id, stack_id], |row| row.get::<_, Vec<u8>>(0))
                    .optional()?;
                if let Some(blob) = blob {
                    allocation_stacks.push(from_blob::<AllocationStack>(&blob)?);
                }
            }

            Ok(AllocationContextsResponse {
                allocated_classes,
                allocation_stacks,
            })
        })
    }

    pub fn get_legacy_allocations(
        &self,
        session: &Session,
        start_time: i64,
    ) -> Result<Option<LegacyAllocationRow>, StorageError> {
        self.handle.read(|conn| {
            let row = conn
                .prepare_cached(
                    "SELECT InfoData, EventsData, DumpData FROM Memory_AllocationInfo
                     WHERE Session = ?1 AND StartTime = ?2",
                )?
                .query_row(params![session.session_id, start_time], |row| {
                    Ok((
                        row.get::<_, Vec<u8>>(0)?,
                        row.get::<_, Option<Vec<u8>>>(1)?,
                        row.get::<_, Option<Vec<u8>>>(2)?,
                    ))
                })
                .optional()?;
            row.map(|(info, events, dump)| {
                Ok::<_, StorageError>(LegacyAllocationRow {
                    info: from_blob(&info)?,
                    events: events.map(|e| from_blob(&e)).transpose()?,
                    dump,
                })
            })
            .transpose()
        })
    }

    /// Write a whole poll iteration in one transaction; returns rows written.
    ///
    /// Heap dump descriptors are upserted without touching stored status or
    /// bytes, so re-polling a finished dump cannot reset it.
    pub fn insert_poll_batch(
        &self,
        session: &Session,
        batch: &MemoryPollBatch,
    ) -> Result<usize, StorageError> {
        let data = &batch.data;
        let rows = data.mem_samples.len()
            + data.vm_stats_samples.len()
            + data.heap_dump_infos.len()
            + data.allocations_infos.len()
            + batch.dumps.len()
            + batch.legacy.len();
        if rows == 0 {
            return Ok(0);
        }
        self.handle.write(|conn| {
            let id = session.session_id;
            insert_samples(conn, id, SAMPLE_MEMORY, &data.mem_samples, |s| s.timestamp)?;
            insert_samples(conn, id, SAMPLE_VM_STATS, &data.vm_stats_samples, |s| {
                s.timestamp
            })?;
            let mut upsert_heap = conn.prepare_cached(
                "INSERT INTO Memory_HeapDump (Session, StartTime, EndTime, Status, InfoData, DumpData)
                 VALUES (?1, ?2, ?3, ?4, ?5, NULL)
                 ON CONFLICT (Session, StartTime)
                 DO UPDATE SET EndTime = excluded.EndTime, InfoData = excluded.InfoData",
            )?;
            for info in &data.heap_dump_infos {
                upsert_heap.execute(params![
                    id,
                    info.start_time,
                    info.end_time,
                    DumpStatus::NotReady.as_i64(),
                    to_blob(info)?
                ])?;
            }
            for info in &data.allocations_infos {
                upsert_allocation_info(conn, id, info)?;
            }
            for dump in &batch.dumps {
                update_dump(conn, id, dump.start_time, dump.status, &dump.data)?;
            }
            for legacy in &batch.legacy {
                store_legacy(conn, id, legacy)?;
            }
            Ok(rows)
        })
    }
}

fn insert_samples<T: serde::Serialize>(
    conn: &Connection,
    session_id: i64,
    kind: i64,
    samples: &[T],
    timestamp: impl Fn(&T) -> i64,
) -> Result<(), StorageError> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO Memory_Samples (Session, Type, Timestamp, Data) VALUES (?1, ?2, ?3, ?4)",
    )?;
    for sample in samples {
        stmt.execute(params![session_id, kind, timestamp(sample), to_blob(sample)?])?;
    }
    Ok(())
}

fn query_samples<T: serde::de::DeserializeOwned>(
    conn: &Connection,
    session_id: i64,
    kind: i64,
    range: TimeRange,
) -> Result<Vec<T>, StorageError> {
    let mut stmt = conn.prepare_cached(
        "SELECT Data FROM Memory_Samples
         WHERE Session = ?1 AND Type = ?2 AND Timestamp > ?3 AND Timestamp <= ?4
         ORDER BY Timestamp",
    )?;
    let blobs = stmt
        .query_map(params![session_id, kind, range.start, range.end], |row| {
            row.get::<_, Vec<u8>>(0)
        })?
        .collect::<Result<Vec<_>, _>>()?;
    decode_all(&blobs)
}

fn query_heap_infos(
    conn: &Connection,
    session_id: i64,
    range: TimeRange,
) -> Result<Vec<HeapDumpInfo>, StorageError> {
    let mut stmt = conn.prepare_cached(
        "SELECT InfoData FROM Memory_HeapDump
         WHERE Session = ?1 AND (EndTime = ?2 OR EndTime > ?3) AND StartTime <= ?4
         ORDER BY StartTime",
    )?;
    let blobs = stmt
        .query_map(
            params![session_id, UNSPECIFIED_END, range.start, range.end],
            |row| row.get::<_, Vec<u8>>(0),
        )?
        .collect::<Result<Vec<_>, _>>()?;
    decode_all(&blobs)
}

fn query_allocation_infos(
    conn: &Connection,
    session_id: i64,
    range: TimeRange,
) -> Result<Vec<AllocationsInfo>, StorageError> {
    let mut stmt = conn.prepare_cached(
        "SELECT InfoData FROM Memory_AllocationInfo
         WHERE Session = ?1 AND (EndTime = ?2 OR EndTime > ?3) AND StartTime <= ?4
         ORDER BY StartTime",
    )?;
    let blobs = stmt
        .query_map(
            params![session_id, UNSPECIFIED_END, range.start, range.end],
            |row| row.get::<_, Vec<u8>>(0),
        )?
        .collect::<Result<Vec<_>, _>>()?;
    decode_all(&blobs)
}

fn update_dump(
    conn: &Connection,
    session_id: i64,
    start_time: i64,
    status: DumpStatus,
    data: &[u8],
) -> Result<bool, StorageError> {
    let data = (status == DumpStatus::Success).then_some(data);
    let updated = conn
        .prepare_cached(
            "UPDATE Memory_HeapDump SET DumpData = ?3, Status = ?4
             WHERE Session = ?1 AND StartTime = ?2",
        )?
        .execute(params![session_id, start_time, data, status.as_i64()])?;
    Ok(updated > 0)
}

fn upsert_allocation_info(
    conn: &Connection,
    session_id: i64,
    info: &AllocationsInfo,
) -> Result<(), StorageError> {
    conn.prepare_cached(
        "INSERT INTO Memory_AllocationInfo (Session, StartTime, EndTime, InfoData)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (Session, StartTime)
         DO UPDATE SET EndTime = excluded.EndTime, InfoData = excluded.InfoData",
    )?
    .execute(params![session_id, info.start_time, info.end_time, to_blob(info)?])?;
    Ok(())
}

fn insert_legacy_contexts(
    conn: &Connection,
    session_id: i64,
    contexts: &AllocationContextsResponse,
) -> Result<(), StorageError> {
    let mut class_stmt = conn.prepare_cached(
        "INSERT OR IGNORE INTO Memory_LegacyAllocatedClass (Session, ClassId, Data) VALUES (?1, ?2, ?3)",
    )?;
    for class in &contexts.allocated_classes {
        class_stmt.execute(params![session_id, class.class_tag, to_blob(class)?])?;
    }
    let mut stack_stmt = conn.prepare_cached(
        "INSERT OR IGNORE INTO Memory_LegacyAllocationStack (Session, StackId, Data) VALUES (?1, ?2, ?3)",
    )?;
    for stack in &contexts.allocation_stacks {
        stack_stmt.execute(params![session_id, stack.stack_id, to_blob(stack)?])?;
    }
    Ok(())
}

fn store_legacy(
    conn: &Connection,
    session_id: i64,
    legacy: &FetchedLegacyAllocations,
) -> Result<(), StorageError> {
    if let Some(events) = &legacy.events {
        conn.prepare_cached(
            "UPDATE Memory_AllocationInfo SET EventsData = ?3 WHERE Session = ?1 AND StartTime = ?2",
        )?
        .execute(params![session_id, legacy.start_time, to_blob(events)?])?;
    }
    if let Some(dump) = &legacy.dump {
        conn.prepare_cached(
            "UPDATE Memory_AllocationInfo SET DumpData = ?3 WHERE Session = ?1 AND StartTime = ?2",
        )?
        .execute(params![session_id, legacy.start_time, dump])?;
    }
    Ok(())
}
