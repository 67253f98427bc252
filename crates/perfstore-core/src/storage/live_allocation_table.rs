//! Live allocation events, their class/stack contexts, and native frames.
//!
//! Lives in the performant namespace: written on every JVMTI poll.

use rusqlite::{Connection, OptionalExtension, params};

use super::{SharedConnection, TableHandle, decode_all, from_blob, to_blob};
use crate::error::StorageError;
use crate::types::memory::{
    AllocatedClass, AllocationContextsResponse, AllocationEvent, AllocationEventKind,
    AllocationSamplingRateEvent, AllocationStack, BatchAllocationSample,
    BatchJniGlobalRefEvent, JniGlobalRefEvent, JniRefEventKind, JvmtiBatch, NativeCallStack,
    NativeFrame, StackFrameInfoResponse,
};
use crate::types::{Session, TimeRange};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS Memory_Allocations (
    Session INTEGER NOT NULL,
    Tag INTEGER NOT NULL,
    ClassTag INTEGER NOT NULL,
    Size INTEGER NOT NULL,
    StackId INTEGER NOT NULL,
    ThreadId INTEGER NOT NULL,
    AllocTime INTEGER NOT NULL,
    FreeTime INTEGER
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_Memory_Allocations_Session_Tag_AllocTime
    ON Memory_Allocations (Session, Tag, AllocTime);
CREATE INDEX IF NOT EXISTS idx_Memory_Allocations_Session_FreeTime
    ON Memory_Allocations (Session, FreeTime);

CREATE TABLE IF NOT EXISTS Memory_AllocatedClass (
    Session INTEGER NOT NULL,
    Tag INTEGER NOT NULL,
    Name TEXT NOT NULL,
    Timestamp INTEGER NOT NULL,
    PRIMARY KEY (Session, Tag)
);

CREATE TABLE IF NOT EXISTS Memory_AllocationStack (
    Session INTEGER NOT NULL,
    StackId INTEGER NOT NULL,
    Data BLOB NOT NULL,
    Timestamp INTEGER NOT NULL,
    PRIMARY KEY (Session, StackId)
);

CREATE TABLE IF NOT EXISTS Memory_NativeFrames (
    Session INTEGER NOT NULL,
    Address INTEGER NOT NULL,
    ModuleName TEXT NOT NULL,
    ModuleOffset INTEGER NOT NULL,
    SymbolName TEXT NOT NULL DEFAULT '',
    FileName TEXT NOT NULL DEFAULT '',
    LineNumber INTEGER NOT NULL DEFAULT 0,
    Resolved INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (Session, Address)
);
CREATE INDEX IF NOT EXISTS idx_Memory_NativeFrames_Resolved
    ON Memory_NativeFrames (Session, Resolved);

CREATE TABLE IF NOT EXISTS Memory_MethodInfo (
    Session INTEGER NOT NULL,
    MethodId INTEGER NOT NULL,
    MethodName TEXT NOT NULL,
    ClassName TEXT NOT NULL,
    PRIMARY KEY (Session, MethodId)
);

CREATE TABLE IF NOT EXISTS Memory_JniGlobalRefs (
    Session INTEGER NOT NULL,
    ObjectTag INTEGER NOT NULL,
    RefValue INTEGER NOT NULL,
    AllocTime INTEGER NOT NULL,
    FreeTime INTEGER,
    AllocThreadId INTEGER NOT NULL,
    FreeThreadId INTEGER,
    AllocBacktrace BLOB NOT NULL,
    FreeBacktrace BLOB
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_Memory_JniGlobalRefs_Session_RefValue_AllocTime
    ON Memory_JniGlobalRefs (Session, RefValue, AllocTime);

CREATE TABLE IF NOT EXISTS Memory_SamplingRates (
    Session INTEGER NOT NULL,
    Timestamp INTEGER NOT NULL,
    Data BLOB NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_Memory_SamplingRates_Session_Timestamp
    ON Memory_SamplingRates (Session, Timestamp);
";

#[derive(Debug)]
pub struct LiveAllocationTable {
    handle: TableHandle,
}

impl Default for LiveAllocationTable {
    fn default() -> Self {
        Self::new()
    }
}

impl LiveAllocationTable {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            handle: TableHandle::new("live_allocations", SCHEMA),
        }
    }

    pub fn initialize(&self, conn: &SharedConnection) -> Result<(), StorageError> {
        self.handle.initialize(conn)
    }

    pub fn query_count(&self) -> u64 {
        self.handle.query_count()
    }

    /// Write one JVMTI batch in a single transaction; returns rows touched.
    ///
    /// Classes, stacks, methods, and native frames are first-writer-wins. A
    /// free event closes the newest still-live allocation with the same tag;
    /// a JNI delete closes the newest open reference with the same value.
    pub fn insert_batch(&self, session: &Session, batch: &JvmtiBatch) -> Result<usize, StorageError> {
        self.handle.write(|conn| {
            let id = session.session_id;
            let mut rows = 0;

            let mut class_stmt = conn.prepare_cached(
                "INSERT OR IGNORE INTO Memory_AllocatedClass (Session, Tag, Name, Timestamp)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for class in &batch.classes {
                rows += class_stmt.execute(params![
                    id,
                    class.class_tag,
                    class.class_name,
                    batch.timestamp
                ])?;
            }

            let mut stack_stmt = conn.prepare_cached(
                "INSERT OR IGNORE INTO Memory_AllocationStack (Session, StackId, Data, Timestamp)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for stack in &batch.stacks {
                rows += stack_stmt.execute(params![
                    id,
                    stack.stack_id,
                    to_blob(&stack.frames)?,
                    batch.timestamp
                ])?;
            }

            let mut frame_stmt = conn.prepare_cached(
                "INSERT OR IGNORE INTO Memory_NativeFrames (Session, Address, ModuleName, ModuleOffset)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for frame in &batch.native_frames {
                rows += frame_stmt.execute(params![
                    id,
                    frame.address,
                    frame.module_name,
                    frame.module_offset
                ])?;
            }

            let mut method_stmt = conn.prepare_cached(
                "INSERT OR IGNORE INTO Memory_MethodInfo (Session, MethodId, MethodName, ClassName)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for method in &batch.methods {
                rows += method_stmt.execute(params![
                    id,
                    method.method_id,
                    method.method_name,
                    method.class_name
                ])?;
            }

            rows += insert_events(conn, id, &batch.events)?;
            rows += insert_jni_ref_events(conn, id, &batch.jni_ref_events)?;

            let mut rate_stmt = conn.prepare_cached(
                "INSERT INTO Memory_SamplingRates (Session, Timestamp, Data) VALUES (?1, ?2, ?3)",
            )?;
            for rate in &batch.sampling_rate_events {
                rows += rate_stmt.execute(params![id, rate.timestamp, to_blob(rate)?])?;
            }

            Ok(rows)
        })
    }

    /// Allocations and frees whose timestamp falls in `(start, end]`
    pub fn get_allocations(
        &self,
        session: &Session,
        range: TimeRange,
    ) -> Result<BatchAllocationSample, StorageError> {
        self.handle.read(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT Tag, ClassTag, Size, StackId, ThreadId, AllocTime, FreeTime
                 FROM Memory_Allocations
                 WHERE Session = ?1 AND ((AllocTime > ?2 AND AllocTime <= ?3)
                    OR (FreeTime > ?2 AND FreeTime <= ?3))",
            )?;
            let rows = stmt
                .query_map(params![session.session_id, range.start, range.end], read_row)?
                .collect::<Result<Vec<_>, _>>()?;

            let mut events = Vec::new();
            for (alloc, free_time) in rows {
                if range.contains(alloc.timestamp) {
                    events.push(alloc.clone());
                }
                if let Some(free_time) = free_time.filter(|t| range.contains(*t)) {
                    events.push(AllocationEvent {
                        kind: AllocationEventKind::Free,
                        timestamp: free_time,
                        ..alloc
                    });
                }
            }
            Ok(into_sample(events))
        })
    }

    /// Objects allocated at or before `at` and not yet freed at `at`
    pub fn get_live_snapshot(
        &self,
        session: &Session,
        at: i64,
    ) -> Result<BatchAllocationSample, StorageError> {
        self.handle.read(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT Tag, ClassTag, Size, StackId, ThreadId, AllocTime, FreeTime
                 FROM Memory_Allocations
                 WHERE Session = ?1 AND AllocTime <= ?2 AND (FreeTime IS NULL OR FreeTime > ?2)",
            )?;
            let events = stmt
                .query_map(params![session.session_id, at], read_row)?
                .map(|row| row.map(|(alloc, _)| alloc))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(into_sample(events))
        })
    }

    /// Newest allocation or free time seen, 0 when nothing was recorded
    pub fn get_latest_allocation_time(&self, session: &Session) -> Result<i64, StorageError> {
        self.handle.read(|conn| {
            let latest: Option<i64> = conn
                .prepare_cached(
                    "SELECT MAX(MAX(AllocTime), COALESCE(MAX(FreeTime), 0))
                     FROM Memory_Allocations WHERE Session = ?1",
                )?
                .query_row(params![session.session_id], |row| row.get::<_, Option<i64>>(0))
                .optional()?
                .flatten();
            Ok(latest.unwrap_or(0))
        })
    }

    /// Classes and stacks first seen in `(start, end]`
    pub fn get_allocation_contexts(
        &self,
        session: &Session,
        range: TimeRange,
    ) -> Result<AllocationContextsResponse, StorageError> {
        self.handle.read(|conn| {
            let allocated_classes = conn
                .prepare_cached(
                    "SELECT Tag, Name FROM Memory_AllocatedClass
                     WHERE Session = ?1 AND Timestamp > ?2 AND Timestamp <= ?3 ORDER BY Tag",
                )?
                .query_map(params![session.session_id, range.start, range.end], |row| {
                    Ok(AllocatedClass {
                        class_tag: row.get(0)?,
                        class_name: row.get(1)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;

            let stack_rows = conn
                .prepare_cached(
                    "SELECT StackId, Data FROM Memory_AllocationStack
                     WHERE Session = ?1 AND Timestamp > ?2 AND Timestamp <= ?3 ORDER BY StackId",
                )?
                .query_map(params![session.session_id, range.start, range.end], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            let allocation_stacks = stack_rows
                .into_iter()
                .map(|(stack_id, data)| {
                    Ok::<_, StorageError>(AllocationStack {
                        stack_id,
                        frames: from_blob(&data)?,
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;

            Ok(AllocationContextsResponse {
                allocated_classes,
                allocation_stacks,
            })
        })
    }

    /// JNI reference creations and deletions whose timestamp falls in
    /// `(start, end]`, oldest first
    pub fn get_jni_ref_events(
        &self,
        session: &Session,
        range: TimeRange,
    ) -> Result<BatchJniGlobalRefEvent, StorageError> {
        self.handle.read(|conn| {
            let rows = conn
                .prepare_cached(
                    "SELECT ObjectTag, RefValue, AllocTime, FreeTime, AllocThreadId, FreeThreadId,
                            AllocBacktrace, FreeBacktrace
                     FROM Memory_JniGlobalRefs
                     WHERE Session = ?1 AND ((AllocTime > ?2 AND AllocTime <= ?3)
                        OR (FreeTime > ?2 AND FreeTime <= ?3))",
                )?
                .query_map(params![session.session_id, range.start, range.end], read_jni_row)?
                .collect::<Result<Vec<_>, _>>()?;

            let mut events = Vec::new();
            for row in rows {
                let (create, delete) = row.into_events()?;
                if range.contains(create.timestamp) {
                    events.push(create);
                }
                events.extend(delete.filter(|d| range.contains(d.timestamp)));
            }
            events.sort_by_key(|e| e.timestamp);
            Ok(into_jni_batch(events))
        })
    }

    /// Creation events of the references still alive at `at`
    pub fn get_jni_ref_snapshot(
        &self,
        session: &Session,
        at: i64,
    ) -> Result<BatchJniGlobalRefEvent, StorageError> {
        self.handle.read(|conn| {
            let rows = conn
                .prepare_cached(
                    "SELECT ObjectTag, RefValue, AllocTime, FreeTime, AllocThreadId, FreeThreadId,
                            AllocBacktrace, FreeBacktrace
                     FROM Memory_JniGlobalRefs
                     WHERE Session = ?1 AND AllocTime <= ?2 AND (FreeTime IS NULL OR FreeTime > ?2)
                     ORDER BY AllocTime",
                )?
                .query_map(params![session.session_id, at], read_jni_row)?
                .collect::<Result<Vec<_>, _>>()?;
            let events = rows
                .into_iter()
                .map(|row| row.into_events().map(|(create, _)| create))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(into_jni_batch(events))
        })
    }

    /// Name and declaring class of a method seen in an allocation stack;
    /// empty when the id is unknown
    pub fn get_stack_frame_info(
        &self,
        session: &Session,
        method_id: i64,
    ) -> Result<StackFrameInfoResponse, StorageError> {
        self.handle.read(|conn| {
            let info = conn
                .prepare_cached(
                    "SELECT MethodName, ClassName FROM Memory_MethodInfo
                     WHERE Session = ?1 AND MethodId = ?2",
                )?
                .query_row(params![session.session_id, method_id], |row| {
                    Ok(StackFrameInfoResponse {
                        method_name: row.get(0)?,
                        class_name: row.get(1)?,
                    })
                })
                .optional()?;
            Ok(info.unwrap_or_default())
        })
    }

    pub fn get_sampling_rate_events(
        &self,
        session: &Session,
        range: TimeRange,
    ) -> Result<Vec<AllocationSamplingRateEvent>, StorageError> {
        self.handle.read(|conn| {
            let blobs = conn
                .prepare_cached(
                    "SELECT Data FROM Memory_SamplingRates
                     WHERE Session = ?1 AND Timestamp > ?2 AND Timestamp <= ?3
                     ORDER BY Timestamp",
                )?
                .query_map(params![session.session_id, range.start, range.end], |row| {
                    row.get::<_, Vec<u8>>(0)
                })?
                .collect::<Result<Vec<_>, _>>()?;
            decode_all(&blobs)
        })
    }

    /// Up to `limit` native frames still waiting for symbolization
    pub fn get_unresolved_native_frames(
        &self,
        session: &Session,
        limit: usize,
    ) -> Result<Vec<NativeFrame>, StorageError> {
        self.handle.read(|conn| {
            let frames = conn
                .prepare_cached(
                    "SELECT Address, ModuleName, ModuleOffset FROM Memory_NativeFrames
                     WHERE Session = ?1 AND Resolved = 0 ORDER BY Address LIMIT ?2",
                )?
                .query_map(params![session.session_id, i64::try_from(limit).unwrap_or(i64::MAX)], |row| {
                    Ok(NativeFrame {
                        address: row.get(0)?,
                        module_name: row.get(1)?,
                        module_offset: row.get(2)?,
                        ..NativeFrame::default()
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(frames)
        })
    }

    /// Store symbol information and mark the frames resolved
    pub fn update_native_symbols(
        &self,
        session: &Session,
        frames: &[NativeFrame],
    ) -> Result<usize, StorageError> {
        self.handle.write(|conn| {
            let mut stmt = conn.prepare_cached(
                "UPDATE Memory_NativeFrames
                 SET SymbolName = ?3, FileName = ?4, LineNumber = ?5, Resolved = 1
                 WHERE Session = ?1 AND Address = ?2",
            )?;
            let mut updated = 0;
            for frame in frames {
                updated += stmt.execute(params![
                    session.session_id,
                    frame.address,
                    frame.symbol_name,
                    frame.file_name,
                    frame.line_number
                ])?;
            }
            Ok(updated)
        })
    }

    /// Frames for `addresses` in the given order; unknown addresses are skipped
    pub fn get_native_frames(
        &self,
        session: &Session,
        addresses: &[i64],
    ) -> Result<NativeCallStack, StorageError> {
        self.handle.read(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT ModuleName, ModuleOffset, SymbolName, FileName, LineNumber
                 FROM Memory_NativeFrames WHERE Session = ?1 AND Address = ?2",
            )?;
            let mut frames = Vec::with_capacity(addresses.len());
            for &address in addresses {
                let frame = stmt
                    .query_row(params![session.session_id, address], |row| {
                        Ok(NativeFrame {
                            address,
                            module_name: row.get(0)?,
                            module_offset: row.get(1)?,
                            symbol_name: row.get(2)?,
                            file_name: row.get(3)?,
                            line_number: row.get(4)?,
                        })
                    })
                    .optional()?;
                frames.extend(frame);
            }
            Ok(NativeCallStack { frames })
        })
    }
}

fn insert_events(
    conn: &Connection,
    session_id: i64,
    events: &[AllocationEvent],
) -> Result<usize, StorageError> {
    let mut alloc_stmt = conn.prepare_cached(
        "INSERT OR IGNORE INTO Memory_Allocations
         (Session, Tag, ClassTag, Size, StackId, ThreadId, AllocTime, FreeTime)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL)",
    )?;
    let mut free_stmt = conn.prepare_cached(
        "UPDATE Memory_Allocations SET FreeTime = ?3
         WHERE rowid = (SELECT rowid FROM Memory_Allocations
                        WHERE Session = ?1 AND Tag = ?2 AND FreeTime IS NULL AND AllocTime <= ?3
                        ORDER BY AllocTime DESC LIMIT 1)",
    )?;
    let mut rows = 0;
    for event in events {
        rows += match event.kind {
            AllocationEventKind::Alloc => alloc_stmt.execute(params![
                session_id,
                event.tag,
                event.class_tag,
                event.size,
                event.stack_id,
                event.thread_id,
                event.timestamp
            ])?,
            AllocationEventKind::Free => {
                free_stmt.execute(params![session_id, event.tag, event.timestamp])?
            }
        };
    }
    Ok(rows)
}

fn insert_jni_ref_events(
    conn: &Connection,
    session_id: i64,
    events: &[JniGlobalRefEvent],
) -> Result<usize, StorageError> {
    let mut create_stmt = conn.prepare_cached(
        "INSERT OR IGNORE INTO Memory_JniGlobalRefs
         (Session, ObjectTag, RefValue, AllocTime, AllocThreadId, AllocBacktrace)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )?;
    let mut delete_stmt = conn.prepare_cached(
        "UPDATE Memory_JniGlobalRefs SET FreeTime = ?3, FreeThreadId = ?4, FreeBacktrace = ?5
         WHERE rowid = (SELECT rowid FROM Memory_JniGlobalRefs
                        WHERE Session = ?1 AND RefValue = ?2 AND FreeTime IS NULL AND AllocTime <= ?3
                        ORDER BY AllocTime DESC LIMIT 1)",
    )?;
    let mut rows = 0;
    for event in events {
        let backtrace = to_blob(&event.backtrace)?;
        rows += match event.kind {
            JniRefEventKind::CreateGlobalRef => create_stmt.execute(params![
                session_id,
                event.object_tag,
                event.ref_value,
                event.timestamp,
                event.thread_id,
                backtrace
            ])?,
            JniRefEventKind::DeleteGlobalRef => delete_stmt.execute(params![
                session_id,
                event.ref_value,
                event.timestamp,
                event.thread_id,
                backtrace
            ])?,
        };
    }
    Ok(rows)
}

/// A stored reference row before its backtraces are decoded
struct JniRow {
    object_tag: i32,
    ref_value: i64,
    alloc_time: i64,
    free_time: Option<i64>,
    alloc_thread_id: i32,
    free_thread_id: Option<i32>,
    alloc_backtrace: Vec<u8>,
    free_backtrace: Option<Vec<u8>>,
}

impl JniRow {
    fn into_events(self) -> Result<(JniGlobalRefEvent, Option<JniGlobalRefEvent>), StorageError> {
        let create = JniGlobalRefEvent {
            kind: JniRefEventKind::CreateGlobalRef,
            object_tag: self.object_tag,
            ref_value: self.ref_value,
            thread_id: self.alloc_thread_id,
            timestamp: self.alloc_time,
            backtrace: from_blob(&self.alloc_backtrace)?,
        };
        let delete = match self.free_time {
            Some(timestamp) => Some(JniGlobalRefEvent {
                kind: JniRefEventKind::DeleteGlobalRef,
                object_tag: self.object_tag,
                ref_value: self.ref_value,
                thread_id: self.free_thread_id.unwrap_or_default(),
                timestamp,
                backtrace: match &self.free_backtrace {
                    Some(blob) => from_blob(blob)?,
                    None => Vec::new(),
                },
            }),
            None => None,
        };
        Ok((create, delete))
    }
}

fn read_jni_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<JniRow> {
    Ok(JniRow {
        object_tag: row.get(0)?,
        ref_value: row.get(1)?,
        alloc_time: row.get(2)?,
        free_time: row.get(3)?,
        alloc_thread_id: row.get(4)?,
        free_thread_id: row.get(5)?,
        alloc_backtrace: row.get(6)?,
        free_backtrace: row.get(7)?,
    })
}

fn into_jni_batch(events: Vec<JniGlobalRefEvent>) -> BatchJniGlobalRefEvent {
    BatchJniGlobalRefEvent {
        timestamp: events.iter().map(|e| e.timestamp).max().unwrap_or(0),
        events,
    }
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(AllocationEvent, Option<i64>)> {
    Ok((
        AllocationEvent {
            kind: AllocationEventKind::Alloc,
            tag: row.get(0)?,
            class_tag: row.get(1)?,
            size: row.get(2)?,
            stack_id: row.get(3)?,
            thread_id: row.get(4)?,
            timestamp: row.get(5)?,
        },
        row.get(6)?,
    ))
}

fn into_sample(mut events: Vec<AllocationEvent>) -> BatchAllocationSample {
    events.sort_by_key(|e| (e.timestamp, e.tag));
    BatchAllocationSample {
        timestamp: events.last().map_or(0, |e| e.timestamp),
        events,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{BackingNamespace, ConnectionProvider, InMemoryConnectionProvider};
    use crate::types::memory::{AllocatedMethod, StackFrame};

    fn table() -> LiveAllocationTable {
        let provider = InMemoryConnectionProvider::new();
        let conn = provider.connection(&BackingNamespace::LIVE_ALLOCATIONS).unwrap();
        let table = LiveAllocationTable::new();
        table.initialize(&conn).unwrap();
        table
    }

    fn session() -> Session {
        Session {
            session_id: 3,
            device_id: 1,
            pid: 9,
            start_timestamp: 0,
            end_timestamp: i64::MAX,
        }
    }

    fn event(kind: AllocationEventKind, tag: i32, timestamp: i64) -> AllocationEvent {
        AllocationEvent {
            kind,
            tag,
            class_tag: 1,
            size: 16,
            stack_id: 5,
            thread_id: 2,
            timestamp,
        }
    }

    fn seed(table: &LiveAllocationTable) {
        let batch = JvmtiBatch {
            timestamp: 10,
            events: vec![
                event(AllocationEventKind::Alloc, 1, 2),
                event(AllocationEventKind::Alloc, 2, 4),
                event(AllocationEventKind::Free, 1, 6),
                event(AllocationEventKind::Alloc, 3, 8),
            ],
            classes: vec![AllocatedClass {
                class_tag: 1,
                class_name: "java.lang.String".into(),
            }],
            stacks: vec![AllocationStack {
                stack_id: 5,
                frames: vec![StackFrame {
                    class_name: "Foo".into(),
                    method_name: "bar".into(),
                    line_number: 12,
                }],
            }],
            native_frames: vec![NativeFrame {
                address: 0x1000,
                module_name: "libapp.so".into(),
                module_offset: 0x200,
                ..NativeFrame::default()
            }],
            sampling_rate_events: vec![AllocationSamplingRateEvent {
                timestamp: 1,
                sampling_num_interval: 10,
            }],
            methods: vec![AllocatedMethod {
                method_id: 77,
                method_name: "bar".into(),
                class_name: "Foo".into(),
            }],
            jni_ref_events: vec![
                jni(JniRefEventKind::CreateGlobalRef, 0x10, 3),
                jni(JniRefEventKind::CreateGlobalRef, 0x20, 5),
                jni(JniRefEventKind::DeleteGlobalRef, 0x10, 7),
            ],
        };
        table.insert_batch(&session(), &batch).unwrap();
    }

    fn jni(kind: JniRefEventKind, ref_value: i64, timestamp: i64) -> JniGlobalRefEvent {
        JniGlobalRefEvent {
            kind,
            object_tag: 1,
            ref_value,
            thread_id: 4,
            timestamp,
            backtrace: vec![0x1000, timestamp],
        }
    }

    #[test]
    fn jni_range_query_pairs_creates_with_deletes() {
        let table = table();
        seed(&table);
        let batch = table.get_jni_ref_events(&session(), TimeRange::new(4, 7)).unwrap();
        let seen: Vec<(JniRefEventKind, i64)> =
            batch.events.iter().map(|e| (e.kind, e.ref_value)).collect();
        assert_eq!(
            seen,
            vec![
                (JniRefEventKind::CreateGlobalRef, 0x20),
                (JniRefEventKind::DeleteGlobalRef, 0x10),
            ]
        );
        assert_eq!(batch.timestamp, 7);
        assert_eq!(batch.events[1].backtrace, vec![0x1000, 7]);
    }

    #[test]
    fn jni_snapshot_lists_refs_alive_at_the_point() {
        let table = table();
        seed(&table);
        let before_delete = table.get_jni_ref_snapshot(&session(), 6).unwrap();
        let values: Vec<i64> = before_delete.events.iter().map(|e| e.ref_value).collect();
        assert_eq!(values, vec![0x10, 0x20]);

        let after_delete = table.get_jni_ref_snapshot(&session(), 7).unwrap();
        let values: Vec<i64> = after_delete.events.iter().map(|e| e.ref_value).collect();
        assert_eq!(values, vec![0x20]);
        assert!(
            after_delete
                .events
                .iter()
                .all(|e| e.kind == JniRefEventKind::CreateGlobalRef)
        );
    }

    #[test]
    fn stack_frame_info_is_looked_up_by_method_id() {
        let table = table();
        seed(&table);
        let info = table.get_stack_frame_info(&session(), 77).unwrap();
        assert_eq!(info.method_name, "bar");
        assert_eq!(info.class_name, "Foo");
        assert_eq!(
            table.get_stack_frame_info(&session(), 78).unwrap(),
            StackFrameInfoResponse::default()
        );
    }

    #[test]
    fn range_query_reports_allocs_and_frees() {
        let table = table();
        seed(&table);
        let sample = table
            .get_allocations(&session(), TimeRange::new(3, 7))
            .unwrap();
        let got: Vec<(AllocationEventKind, i32, i64)> = sample
            .events
            .iter()
            .map(|e| (e.kind, e.tag, e.timestamp))
            .collect();
        assert_eq!(
            got,
            vec![
                (AllocationEventKind::Alloc, 2, 4),
                (AllocationEventKind::Free, 1, 6),
            ]
        );
        assert_eq!(sample.timestamp, 6);
    }

    #[test]
    fn live_snapshot_excludes_freed_objects() {
        let table = table();
        seed(&table);
        let tags = |at| -> Vec<i32> {
            table
                .get_live_snapshot(&session(), at)
                .unwrap()
                .events
                .iter()
                .map(|e| e.tag)
                .collect()
        };
        assert_eq!(tags(5), vec![1, 2]);
        assert_eq!(tags(7), vec![2]);
        assert_eq!(tags(9), vec![2, 3]);
    }

    #[test]
    fn latest_allocation_time_considers_frees() {
        let table = table();
        assert_eq!(table.get_latest_allocation_time(&session()).unwrap(), 0);
        seed(&table);
        assert_eq!(table.get_latest_allocation_time(&session()).unwrap(), 8);
    }

    #[test]
    fn contexts_and_sampling_rates_are_range_scoped() {
        let table = table();
        seed(&table);
        let contexts = table
            .get_allocation_contexts(&session(), TimeRange::new(0, 10))
            .unwrap();
        assert_eq!(contexts.allocated_classes.len(), 1);
        assert_eq!(contexts.allocation_stacks[0].frames[0].method_name, "bar");
        assert!(table
            .get_allocation_contexts(&session(), TimeRange::new(10, 20))
            .unwrap()
            .allocated_classes
            .is_empty());
        let rates = table
            .get_sampling_rate_events(&session(), TimeRange::new(0, 10))
            .unwrap();
        assert_eq!(rates[0].sampling_num_interval, 10);
    }

    #[test]
    fn native_frames_resolve_once() {
        let table = table();
        seed(&table);
        let pending = table.get_unresolved_native_frames(&session(), 100).unwrap();
        assert_eq!(pending.len(), 1);

        let mut resolved = pending[0].clone();
        resolved.symbol_name = "app::draw".into();
        resolved.line_number = 88;
        assert_eq!(table.update_native_symbols(&session(), &[resolved]).unwrap(), 1);
        assert!(table
            .get_unresolved_native_frames(&session(), 100)
            .unwrap()
            .is_empty());

        let stack = table
            .get_native_frames(&session(), &[0x1000, 0xdead])
            .unwrap();
        assert_eq!(stack.frames.len(), 1);
        assert_eq!(stack.frames[0].symbol_name, "app::draw");
        assert_eq!(stack.frames[0].module_name, "libapp.so");
    }
}
