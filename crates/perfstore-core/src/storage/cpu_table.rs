//! CPU usage samples, thread activity, traces, and profiling state.

use std::collections::BTreeMap;

use rusqlite::{Connection, OptionalExtension, params};

use super::{SharedConnection, TableHandle, decode_all, from_blob, to_blob};
use crate::error::StorageError;
use crate::types::cpu::{
    CpuProfilerMode, CpuProfilerType, CpuUsageData, ProfilingStateResponse, ThreadActivity,
    ThreadData, ThreadState, TraceInfo,
};
use crate::types::{Session, TimeRange};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS Cpu_Data (
    Session INTEGER NOT NULL,
    Timestamp INTEGER NOT NULL,
    Data BLOB NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_Cpu_Data_Session_Timestamp ON Cpu_Data (Session, Timestamp);

CREATE TABLE IF NOT EXISTS Thread_Activities (
    Session INTEGER NOT NULL,
    Tid INTEGER NOT NULL,
    Name TEXT NOT NULL,
    State TEXT NOT NULL,
    Timestamp INTEGER NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_Thread_Activities_Session_Tid_Timestamp
    ON Thread_Activities (Session, Tid, Timestamp);

CREATE TABLE IF NOT EXISTS Cpu_Trace (
    Session INTEGER NOT NULL,
    TraceId INTEGER NOT NULL,
    ProfilerType TEXT NOT NULL,
    ProfilerMode TEXT NOT NULL,
    Data BLOB NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_Cpu_Trace_Session_TraceId ON Cpu_Trace (Session, TraceId);

CREATE TABLE IF NOT EXISTS Cpu_Trace_Info (
    Session INTEGER NOT NULL,
    TraceId INTEGER NOT NULL,
    StartTime INTEGER NOT NULL,
    EndTime INTEGER NOT NULL,
    Data BLOB NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_Cpu_Trace_Info_Session_TraceId
    ON Cpu_Trace_Info (Session, TraceId);

CREATE TABLE IF NOT EXISTS Profiling_State (
    Session INTEGER NOT NULL,
    Timestamp INTEGER NOT NULL,
    Data BLOB NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_Profiling_State_Session_Timestamp
    ON Profiling_State (Session, Timestamp);
";

/// Everything one CPU poll iteration writes
#[derive(Debug, Clone, Default)]
pub struct CpuPollBatch {
    pub usage: Vec<CpuUsageData>,
    pub threads: Vec<ThreadData>,
    pub trace_infos: Vec<TraceInfo>,
    pub profiling_state: Option<ProfilingStateResponse>,
}

impl CpuPollBatch {
    pub fn is_empty(&self) -> bool {
        self.usage.is_empty()
            && self.threads.is_empty()
            && self.trace_infos.is_empty()
            && self.profiling_state.is_none()
    }
}

#[derive(Debug)]
pub struct CpuTable {
    handle: TableHandle,
}

impl Default for CpuTable {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuTable {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            handle: TableHandle::new("cpu", SCHEMA),
        }
    }

    pub fn initialize(&self, conn: &SharedConnection) -> Result<(), StorageError> {
        self.handle.initialize(conn)
    }

    pub fn query_count(&self) -> u64 {
        self.handle.query_count()
    }

    pub fn insert_cpu_data(
        &self,
        session: &Session,
        data: &[CpuUsageData],
    ) -> Result<(), StorageError> {
        self.handle
            .write(|conn| insert_usage(conn, session.session_id, data))
    }

    /// Samples with `end_timestamp` in `(range.start, range.end]`, oldest first
    pub fn get_cpu_data(
        &self,
        session: &Session,
        range: TimeRange,
    ) -> Result<Vec<CpuUsageData>, StorageError> {
        self.handle.read(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT Data FROM Cpu_Data
                 WHERE Session = ?1 AND Timestamp > ?2 AND Timestamp <= ?3
                 ORDER BY Timestamp",
            )?;
            let blobs = stmt
                .query_map(params![session.session_id, range.start, range.end], |row| {
                    row.get::<_, Vec<u8>>(0)
                })?
                .collect::<Result<Vec<_>, _>>()?;
            decode_all(&blobs)
        })
    }

    pub fn insert_thread_activities(
        &self,
        session: &Session,
        threads: &[ThreadData],
    ) -> Result<(), StorageError> {
        self.handle
            .write(|conn| insert_threads(conn, session.session_id, threads))
    }

    /// Threads alive at `range.start` plus every transition inside the range.
    ///
    /// A thread's state at the start is its latest transition at or before
    /// `range.start`, reported with timestamp `range.start`; threads already
    /// dead by then are left out. Result is ordered by thread id.
    pub fn get_thread_activities(
        &self,
        session: &Session,
        range: TimeRange,
    ) -> Result<Vec<ThreadData>, StorageError> {
        self.handle.read(|conn| {
            let mut threads: BTreeMap<i32, ThreadData> = BTreeMap::new();

            let mut at_start = conn.prepare_cached(
                "SELECT a.Tid, a.Name, a.State FROM Thread_Activities a
                 JOIN (SELECT Tid, MAX(Timestamp) AS Latest FROM Thread_Activities
                       WHERE Session = ?1 AND Timestamp <= ?2 GROUP BY Tid) l
                   ON a.Tid = l.Tid AND a.Timestamp = l.Latest
                 WHERE a.Session = ?1",
            )?;
            let alive = at_start
                .query_map(params![session.session_id, range.start], |row| {
                    Ok((
                        row.get::<_, i32>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            for (tid, name, state) in alive {
                let state = ThreadState::parse(&state);
                if state == ThreadState::Dead {
                    continue;
                }
                threads.insert(
                    tid,
                    ThreadData {
                        tid,
                        name,
                        activities: vec![ThreadActivity {
                            timestamp: range.start,
                            new_state: state,
                        }],
                    },
                );
            }

            let mut in_range = conn.prepare_cached(
                "SELECT Tid, Name, State, Timestamp FROM Thread_Activities
                 WHERE Session = ?1 AND Timestamp > ?2 AND Timestamp <= ?3
                 ORDER BY Tid, Timestamp",
            )?;
            let rows = in_range
                .query_map(params![session.session_id, range.start, range.end], |row| {
                    Ok((
                        row.get::<_, i32>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            for (tid, name, state, timestamp) in rows {
                let thread = threads.entry(tid).or_insert_with(|| ThreadData {
                    tid,
                    name,
                    activities: Vec::new(),
                });
                thread.activities.push(ThreadActivity {
                    timestamp,
                    new_state: ThreadState::parse(&state),
                });
            }

            Ok(threads.into_values().collect())
        })
    }

    pub fn insert_trace(
        &self,
        session: &Session,
        trace_id: i64,
        profiler_type: CpuProfilerType,
        profiler_mode: CpuProfilerMode,
        data: &[u8],
    ) -> Result<(), StorageError> {
        self.handle.write(|conn| {
            conn.prepare_cached(
                "INSERT OR REPLACE INTO Cpu_Trace (Session, TraceId, ProfilerType, ProfilerMode, Data)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?
            .execute(params![
                session.session_id,
                trace_id,
                profiler_type.as_str(),
                profiler_mode.as_str(),
                data
            ])?;
            Ok(())
        })
    }

    /// Persist a trace and its descriptor together
    pub fn insert_trace_with_info(
        &self,
        session: &Session,
        info: &TraceInfo,
        data: &[u8],
    ) -> Result<(), StorageError> {
        self.handle.write(|conn| {
            conn.prepare_cached(
                "INSERT OR REPLACE INTO Cpu_Trace (Session, TraceId, ProfilerType, ProfilerMode, Data)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?
            .execute(params![
                session.session_id,
                info.trace_id,
                info.configuration.profiler_type.as_str(),
                info.configuration.profiler_mode.as_str(),
                data
            ])?;
            upsert_trace_info(conn, session.session_id, info)
        })
    }

    /// Trace bytes with the profiler type and mode they were captured with
    pub fn get_trace(
        &self,
        session: &Session,
        trace_id: i64,
    ) -> Result<Option<(Vec<u8>, CpuProfilerType, CpuProfilerMode)>, StorageError> {
        self.handle.read(|conn| {
            let row = conn
                .prepare_cached(
                    "SELECT Data, ProfilerType, ProfilerMode FROM Cpu_Trace
                     WHERE Session = ?1 AND TraceId = ?2",
                )?
                .query_row(params![session.session_id, trace_id], |row| {
                    Ok((
                        row.get::<_, Vec<u8>>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })
                .optional()?;
            Ok(row.map(|(data, ty, mode)| {
                (data, CpuProfilerType::parse(&ty), CpuProfilerMode::parse(&mode))
            }))
        })
    }

    pub fn insert_or_replace_trace_info(
        &self,
        session: &Session,
        info: &TraceInfo,
    ) -> Result<(), StorageError> {
        self.handle
            .write(|conn| upsert_trace_info(conn, session.session_id, info))
    }

    /// Traces overlapping `[range.start, range.end]`, ongoing ones included
    pub fn get_trace_infos(
        &self,
        session: &Session,
        range: TimeRange,
    ) -> Result<Vec<TraceInfo>, StorageError> {
        self.handle.read(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT Data FROM Cpu_Trace_Info
                 WHERE Session = ?1 AND StartTime <= ?3 AND (EndTime = 0 OR EndTime >= ?2)
                 ORDER BY StartTime",
            )?;
            let blobs = stmt
                .query_map(params![session.session_id, range.start, range.end], |row| {
                    row.get::<_, Vec<u8>>(0)
                })?
                .collect::<Result<Vec<_>, _>>()?;
            decode_all(&blobs)
        })
    }

    pub fn insert_profiling_state(
        &self,
        session: &Session,
        state: &ProfilingStateResponse,
    ) -> Result<(), StorageError> {
        self.handle
            .write(|conn| insert_state(conn, session.session_id, state))
    }

    /// Most recently recorded profiling state
    pub fn get_profiling_state(
        &self,
        session: &Session,
    ) -> Result<Option<ProfilingStateResponse>, StorageError> {
        self.handle.read(|conn| {
            let blob = conn
                .prepare_cached(
                    "SELECT Data FROM Profiling_State WHERE Session = ?1
                     ORDER BY Timestamp DESC LIMIT 1",
                )?
                .query_row(params![session.session_id], |row| row.get::<_, Vec<u8>>(0))
                .optional()?;
            blob.map(|b| from_blob(&b)).transpose()
        })
    }

    /// Write a whole poll iteration in one transaction; returns rows written
    pub fn insert_poll_batch(
        &self,
        session: &Session,
        batch: &CpuPollBatch,
    ) -> Result<usize, StorageError> {
        if batch.is_empty() {
            return Ok(0);
        }
        self.handle.write(|conn| {
            let id = session.session_id;
            insert_usage(conn, id, &batch.usage)?;
            insert_threads(conn, id, &batch.threads)?;
            for info in &batch.trace_infos {
                upsert_trace_info(conn, id, info)?;
            }
            if let Some(state) = &batch.profiling_state {
                insert_state(conn, id, state)?;
            }
            Ok(batch.usage.len()
                + batch.threads.iter().map(|t| t.activities.len()).sum::<usize>()
                + batch.trace_infos.len()
                + usize::from(batch.profiling_state.is_some()))
        })
    }
}

fn insert_usage(conn: &Connection, session_id: i64, data: &[CpuUsageData]) -> Result<(), StorageError> {
    let mut stmt = conn.prepare_cached(
        "INSERT OR REPLACE INTO Cpu_Data (Session, Timestamp, Data) VALUES (?1, ?2, ?3)",
    )?;
    for sample in data {
        stmt.execute(params![session_id, sample.end_timestamp, to_blob(sample)?])?;
    }
    Ok(())
}

fn insert_threads(
    conn: &Connection,
    session_id: i64,
    threads: &[ThreadData],
) -> Result<(), StorageError> {
    let mut stmt = conn.prepare_cached(
        "INSERT OR REPLACE INTO Thread_Activities (Session, Tid, Name, State, Timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )?;
    for thread in threads {
        for activity in &thread.activities {
            stmt.execute(params![
                session_id,
                thread.tid,
                thread.name,
                activity.new_state.as_str(),
                activity.timestamp
            ])?;
        }
    }
    Ok(())
}

fn upsert_trace_info(conn: &Connection, session_id: i64, info: &TraceInfo) -> Result<(), StorageError> {
    conn.prepare_cached(
        "INSERT OR REPLACE INTO Cpu_Trace_Info (Session, TraceId, StartTime, EndTime, Data)
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )?
    .execute(params![
        session_id,
        info.trace_id,
        info.from_timestamp,
        info.to_timestamp,
        to_blob(info)?
    ])?;
    Ok(())
}

fn insert_state(
    conn: &Connection,
    session_id: i64,
    state: &ProfilingStateResponse,
) -> Result<(), StorageError> {
    conn.prepare_cached("INSERT INTO Profiling_State (Session, Timestamp, Data) VALUES (?1, ?2, ?3)")?
        .execute(params![session_id, state.check_timestamp, to_blob(state)?])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{BackingNamespace, ConnectionProvider, InMemoryConnectionProvider};
    use crate::types::cpu::ProfilerConfiguration;

    fn table() -> CpuTable {
        let provider = InMemoryConnectionProvider::new();
        let conn = provider.connection(&BackingNamespace::DEFAULT_SHARED).unwrap();
        let table = CpuTable::new();
        table.initialize(&conn).unwrap();
        table
    }

    fn session(id: i64) -> Session {
        Session {
            session_id: id,
            device_id: 1,
            pid: 100,
            start_timestamp: 0,
            end_timestamp: i64::MAX,
        }
    }

    fn sample(ts: i64) -> CpuUsageData {
        CpuUsageData {
            end_timestamp: ts,
            elapsed_time_ms: ts / 1000,
            app_cpu_time_ms: 1,
            system_cpu_time_ms: 2,
        }
    }

    fn activity(timestamp: i64, new_state: ThreadState) -> ThreadActivity {
        ThreadActivity {
            timestamp,
            new_state,
        }
    }

    #[test]
    fn cpu_data_range_excludes_start_includes_end() {
        let table = table();
        let s = session(1);
        table
            .insert_cpu_data(&s, &[sample(10), sample(20), sample(30)])
            .unwrap();
        let rows = table.get_cpu_data(&s, TimeRange::new(10, 30)).unwrap();
        let stamps: Vec<i64> = rows.iter().map(|r| r.end_timestamp).collect();
        assert_eq!(stamps, vec![20, 30]);
    }

    #[test]
    fn cpu_data_is_scoped_to_session() {
        let table = table();
        table.insert_cpu_data(&session(1), &[sample(10)]).unwrap();
        table.insert_cpu_data(&session(2), &[sample(10)]).unwrap();
        let rows = table
            .get_cpu_data(&session(2), TimeRange::new(0, 100))
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn duplicate_timestamp_replaces_sample() {
        let table = table();
        let s = session(1);
        table.insert_cpu_data(&s, &[sample(10)]).unwrap();
        let mut updated = sample(10);
        updated.app_cpu_time_ms = 99;
        table.insert_cpu_data(&s, &[updated.clone()]).unwrap();
        let rows = table.get_cpu_data(&s, TimeRange::new(0, 100)).unwrap();
        assert_eq!(rows, vec![updated]);
    }

    #[test]
    fn threads_include_state_alive_at_range_start() {
        let table = table();
        let s = session(1);
        table
            .insert_thread_activities(
                &s,
                &[
                    ThreadData {
                        tid: 7,
                        name: "render".into(),
                        activities: vec![
                            activity(5, ThreadState::Running),
                            activity(15, ThreadState::Sleeping),
                        ],
                    },
                    ThreadData {
                        tid: 3,
                        name: "gone".into(),
                        activities: vec![
                            activity(2, ThreadState::Running),
                            activity(8, ThreadState::Dead),
                        ],
                    },
                ],
            )
            .unwrap();

        let threads = table
            .get_thread_activities(&s, TimeRange::new(10, 20))
            .unwrap();
        assert_eq!(threads.len(), 1);
        let render = &threads[0];
        assert_eq!(render.tid, 7);
        assert_eq!(
            render.activities,
            vec![
                activity(10, ThreadState::Running),
                activity(15, ThreadState::Sleeping),
            ]
        );
    }

    #[test]
    fn threads_are_sorted_by_tid() {
        let table = table();
        let s = session(1);
        let threads: Vec<ThreadData> = [9, 2, 5]
            .into_iter()
            .map(|tid| ThreadData {
                tid,
                name: format!("t{tid}"),
                activities: vec![activity(12, ThreadState::Running)],
            })
            .collect();
        table.insert_thread_activities(&s, &threads).unwrap();
        let tids: Vec<i32> = table
            .get_thread_activities(&s, TimeRange::new(10, 20))
            .unwrap()
            .iter()
            .map(|t| t.tid)
            .collect();
        assert_eq!(tids, vec![2, 5, 9]);
    }

    #[test]
    fn trace_round_trips_with_profiler_type_and_mode() {
        let table = table();
        let s = session(1);
        let bytes = vec![0_u8, 1, 2, 254, 255];
        table
            .insert_trace(
                &s,
                42,
                CpuProfilerType::Simpleperf,
                CpuProfilerMode::Sampled,
                &bytes,
            )
            .unwrap();
        let (data, ty, mode) = table.get_trace(&s, 42).unwrap().unwrap();
        assert_eq!(data, bytes);
        assert_eq!(ty, CpuProfilerType::Simpleperf);
        assert_eq!(mode, CpuProfilerMode::Sampled);
        assert!(table.get_trace(&s, 43).unwrap().is_none());
    }

    #[test]
    fn trace_info_overlap_includes_ongoing() {
        let table = table();
        let s = session(1);
        let info = |trace_id, from_timestamp, to_timestamp| TraceInfo {
            trace_id,
            configuration: ProfilerConfiguration::default(),
            from_timestamp,
            to_timestamp,
        };
        table.insert_or_replace_trace_info(&s, &info(1, 0, 5)).unwrap();
        table.insert_or_replace_trace_info(&s, &info(2, 8, 12)).unwrap();
        table.insert_or_replace_trace_info(&s, &info(3, 9, 0)).unwrap();
        table.insert_or_replace_trace_info(&s, &info(4, 50, 60)).unwrap();

        let ids: Vec<i64> = table
            .get_trace_infos(&s, TimeRange::new(10, 20))
            .unwrap()
            .iter()
            .map(|t| t.trace_id)
            .collect();
        assert_eq!(ids, vec![2, 3]);

        // completing trace 3 replaces the descriptor
        table.insert_or_replace_trace_info(&s, &info(3, 9, 15)).unwrap();
        let infos = table.get_trace_infos(&s, TimeRange::new(10, 20)).unwrap();
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[1].to_timestamp, 15);
    }

    #[test]
    fn latest_profiling_state_wins() {
        let table = table();
        let s = session(1);
        assert!(table.get_profiling_state(&s).unwrap().is_none());
        for (ts, profiled) in [(1, true), (3, false), (2, true)] {
            table
                .insert_profiling_state(
                    &s,
                    &ProfilingStateResponse {
                        check_timestamp: ts,
                        being_profiled: profiled,
                        ..ProfilingStateResponse::default()
                    },
                )
                .unwrap();
        }
        let latest = table.get_profiling_state(&s).unwrap().unwrap();
        assert_eq!(latest.check_timestamp, 3);
        assert!(!latest.being_profiled);
    }

    #[test]
    fn poll_batch_is_one_query() {
        let table = table();
        let s = session(1);
        let before = table.query_count();
        let written = table
            .insert_poll_batch(
                &s,
                &CpuPollBatch {
                    usage: vec![sample(1), sample(2)],
                    threads: vec![ThreadData {
                        tid: 1,
                        name: "main".into(),
                        activities: vec![activity(1, ThreadState::Running)],
                    }],
                    trace_infos: Vec::new(),
                    profiling_state: None,
                },
            )
            .unwrap();
        assert_eq!(written, 3);
        assert_eq!(table.query_count(), before + 1);
        assert_eq!(table.insert_poll_batch(&s, &CpuPollBatch::default()).unwrap(), 0);
    }
}
