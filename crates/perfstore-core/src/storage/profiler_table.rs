//! Devices, processes, sessions, and opaque byte artifacts.

use rusqlite::{Connection, OptionalExtension, params};

use super::{SharedConnection, TableHandle, decode_all, from_blob, to_blob};
use crate::error::StorageError;
use crate::types::profiler::{AgentStatus, Device, DeviceState, Process, ProcessState, SessionMetaData};
use crate::types::{DeviceId, Session};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS Profiler_Devices (
    DeviceId INTEGER PRIMARY KEY,
    LastKnownTime INTEGER,
    Data BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS Profiler_Processes (
    DeviceId INTEGER NOT NULL,
    Pid INTEGER NOT NULL,
    State INTEGER NOT NULL,
    StartTime INTEGER NOT NULL,
    AgentStatus INTEGER NOT NULL DEFAULT 0,
    Data BLOB NOT NULL,
    PRIMARY KEY (DeviceId, Pid)
);

CREATE TABLE IF NOT EXISTS Profiler_Sessions (
    SessionId INTEGER PRIMARY KEY,
    DeviceId INTEGER NOT NULL,
    Pid INTEGER NOT NULL,
    StartTime INTEGER NOT NULL,
    EndTime INTEGER NOT NULL,
    Meta BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS Profiler_Bytes (
    SessionId INTEGER NOT NULL,
    Id TEXT NOT NULL,
    Data BLOB NOT NULL,
    PRIMARY KEY (SessionId, Id)
);
";

/// What the device poller learned about one device in one round
#[derive(Debug, Clone, Default)]
pub struct DeviceSnapshot {
    pub device_id: i64,
    pub device: Option<Device>,
    pub last_known_time: Option<i64>,
    pub processes: Vec<Process>,
    pub agent_statuses: Vec<(i32, AgentStatus)>,
}

#[derive(Debug)]
pub struct ProfilerTable {
    handle: TableHandle,
}

impl Default for ProfilerTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProfilerTable {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            handle: TableHandle::new("profiler", SCHEMA),
        }
    }

    pub fn initialize(&self, conn: &SharedConnection) -> Result<(), StorageError> {
        self.handle.initialize(conn)
    }

    pub fn query_count(&self) -> u64 {
        self.handle.query_count()
    }

    pub fn insert_or_update_device(&self, device: &Device) -> Result<(), StorageError> {
        self.handle.write(|conn| upsert_device(conn, device).map(|_| ()))
    }

    /// Apply one device poll atomically.
    ///
    /// Known processes missing from the snapshot are marked dead; agent status
    /// is only updated for processes the snapshot reports on.
    pub fn apply_device_snapshot(&self, snapshot: &DeviceSnapshot) -> Result<usize, StorageError> {
        self.handle.write(|conn| {
            let mut rows = 0;
            if let Some(device) = &snapshot.device {
                rows += upsert_device(conn, device)?;
            }
            if let Some(time) = snapshot.last_known_time {
                rows += conn
                    .prepare_cached(
                        "UPDATE Profiler_Devices SET LastKnownTime = ?2 WHERE DeviceId = ?1",
                    )?
                    .execute(params![snapshot.device_id, time])?;
            }

            let mut upsert = conn.prepare_cached(
                "INSERT INTO Profiler_Processes (DeviceId, Pid, State, StartTime, Data)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (DeviceId, Pid) DO UPDATE SET
                     State = excluded.State, StartTime = excluded.StartTime, Data = excluded.Data",
            )?;
            for process in &snapshot.processes {
                rows += upsert.execute(params![
                    snapshot.device_id,
                    process.pid,
                    process.state.as_i64(),
                    process.start_timestamp,
                    to_blob(process)?
                ])?;
            }

            let reported: Vec<i32> = snapshot.processes.iter().map(|p| p.pid).collect();
            rows += mark_dead(conn, snapshot.device_id, &reported)?;

            let mut agent = conn.prepare_cached(
                "UPDATE Profiler_Processes SET AgentStatus = ?3 WHERE DeviceId = ?1 AND Pid = ?2",
            )?;
            for (pid, status) in &snapshot.agent_statuses {
                rows += agent.execute(params![snapshot.device_id, pid, status.as_i64()])?;
            }
            Ok(rows)
        })
    }

    pub fn get_devices(&self) -> Result<Vec<Device>, StorageError> {
        self.handle.read(|conn| {
            let blobs = conn
                .prepare_cached("SELECT Data FROM Profiler_Devices ORDER BY DeviceId")?
                .query_map([], |row| row.get::<_, Vec<u8>>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            decode_all(&blobs)
        })
    }

    /// Latest device clock reading seen by the device poller
    pub fn get_device_last_known_time(&self, device: DeviceId) -> Result<Option<i64>, StorageError> {
        self.handle.read(|conn| {
            let time = conn
                .prepare_cached("SELECT LastKnownTime FROM Profiler_Devices WHERE DeviceId = ?1")?
                .query_row(params![device.0], |row| row.get::<_, Option<i64>>(0))
                .optional()?;
            Ok(time.flatten())
        })
    }

    /// Mark the device disconnected and every process on it dead
    pub fn set_device_disconnected(&self, device: DeviceId) -> Result<(), StorageError> {
        self.handle.write(|conn| {
            let stored = conn
                .prepare_cached("SELECT Data FROM Profiler_Devices WHERE DeviceId = ?1")?
                .query_row(params![device.0], |row| row.get::<_, Vec<u8>>(0))
                .optional()?;
            if let Some(blob) = stored {
                let mut record: Device = from_blob(&blob)?;
                record.state = DeviceState::Disconnected;
                upsert_device(conn, &record)?;
            }
            mark_dead(conn, device.0, &[])?;
            Ok(())
        })
    }

    pub fn get_processes(&self, device: DeviceId) -> Result<Vec<Process>, StorageError> {
        self.handle.read(|conn| {
            let rows = conn
                .prepare_cached(
                    "SELECT State, Data FROM Profiler_Processes WHERE DeviceId = ?1 ORDER BY Pid",
                )?
                .query_map(params![device.0], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter()
                .map(|(state, blob)| {
                    let mut process: Process = from_blob(&blob)?;
                    process.state = ProcessState::from_i64(state);
                    Ok::<_, StorageError>(process)
                })
                .collect()
        })
    }

    pub fn get_agent_status(&self, device: DeviceId, pid: i32) -> Result<AgentStatus, StorageError> {
        self.handle.read(|conn| {
            let code = conn
                .prepare_cached(
                    "SELECT AgentStatus FROM Profiler_Processes WHERE DeviceId = ?1 AND Pid = ?2",
                )?
                .query_row(params![device.0, pid], |row| row.get::<_, i64>(0))
                .optional()?;
            Ok(code.map_or(AgentStatus::Unspecified, AgentStatus::from_i64))
        })
    }

    pub fn insert_or_update_session(
        &self,
        session: &Session,
        meta: &SessionMetaData,
    ) -> Result<(), StorageError> {
        self.handle.write(|conn| {
            conn.prepare_cached(
                "INSERT INTO Profiler_Sessions (SessionId, DeviceId, Pid, StartTime, EndTime, Meta)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (SessionId) DO UPDATE SET
                     DeviceId = excluded.DeviceId, Pid = excluded.Pid,
                     StartTime = excluded.StartTime, EndTime = excluded.EndTime,
                     Meta = excluded.Meta",
            )?
            .execute(params![
                session.session_id,
                session.device_id,
                session.pid,
                session.start_timestamp,
                session.end_timestamp,
                to_blob(meta)?
            ])?;
            Ok(())
        })
    }

    /// Returns false when no such session is stored
    pub fn update_session_end(&self, session_id: i64, end: i64) -> Result<bool, StorageError> {
        self.handle.write(|conn| {
            let updated = conn
                .prepare_cached("UPDATE Profiler_Sessions SET EndTime = ?2 WHERE SessionId = ?1")?
                .execute(params![session_id, end])?;
            Ok(updated > 0)
        })
    }

    pub fn get_session(&self, session_id: i64) -> Result<Option<Session>, StorageError> {
        self.handle.read(|conn| {
            Ok(conn
                .prepare_cached(
                    "SELECT SessionId, DeviceId, Pid, StartTime, EndTime
                     FROM Profiler_Sessions WHERE SessionId = ?1",
                )?
                .query_row(params![session_id], read_session)
                .optional()?)
        })
    }

    /// All sessions, oldest first
    pub fn get_sessions(&self) -> Result<Vec<Session>, StorageError> {
        self.handle.read(|conn| {
            Ok(conn
                .prepare_cached(
                    "SELECT SessionId, DeviceId, Pid, StartTime, EndTime
                     FROM Profiler_Sessions ORDER BY StartTime, SessionId",
                )?
                .query_map([], read_session)?
                .collect::<Result<Vec<_>, _>>()?)
        })
    }

    pub fn get_session_meta(&self, session_id: i64) -> Result<Option<SessionMetaData>, StorageError> {
        self.handle.read(|conn| {
            let blob = conn
                .prepare_cached("SELECT Meta FROM Profiler_Sessions WHERE SessionId = ?1")?
                .query_row(params![session_id], |row| row.get::<_, Vec<u8>>(0))
                .optional()?;
            blob.map(|b| from_blob(&b)).transpose()
        })
    }

    /// Remove the session and its byte artifacts; false if it did not exist
    pub fn delete_session(&self, session_id: i64) -> Result<bool, StorageError> {
        self.handle.write(|conn| {
            conn.prepare_cached("DELETE FROM Profiler_Bytes WHERE SessionId = ?1")?
                .execute(params![session_id])?;
            let removed = conn
                .prepare_cached("DELETE FROM Profiler_Sessions WHERE SessionId = ?1")?
                .execute(params![session_id])?;
            Ok(removed > 0)
        })
    }

    pub fn insert_bytes(&self, session_id: i64, id: &str, data: &[u8]) -> Result<(), StorageError> {
        self.handle.write(|conn| {
            conn.prepare_cached(
                "INSERT OR REPLACE INTO Profiler_Bytes (SessionId, Id, Data) VALUES (?1, ?2, ?3)",
            )?
            .execute(params![session_id, id, data])?;
            Ok(())
        })
    }

    pub fn get_bytes(&self, session_id: i64, id: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.handle.read(|conn| {
            Ok(conn
                .prepare_cached("SELECT Data FROM Profiler_Bytes WHERE SessionId = ?1 AND Id = ?2")?
                .query_row(params![session_id, id], |row| row.get::<_, Vec<u8>>(0))
                .optional()?)
        })
    }
}

fn upsert_device(conn: &Connection, device: &Device) -> Result<usize, StorageError> {
    Ok(conn
        .prepare_cached(
            "INSERT INTO Profiler_Devices (DeviceId, Data) VALUES (?1, ?2)
             ON CONFLICT (DeviceId) DO UPDATE SET Data = excluded.Data",
        )?
        .execute(params![device.device_id, to_blob(device)?])?)
}

/// Mark every process of `device_id` not listed in `alive` as dead
fn mark_dead(conn: &Connection, device_id: i64, alive: &[i32]) -> Result<usize, StorageError> {
    let pids = conn
        .prepare_cached("SELECT Pid FROM Profiler_Processes WHERE DeviceId = ?1 AND State != ?2")?
        .query_map(params![device_id, ProcessState::Dead.as_i64()], |row| {
            row.get::<_, i32>(0)
        })?
        .collect::<Result<Vec<_>, _>>()?;
    let mut stmt = conn.prepare_cached(
        "UPDATE Profiler_Processes SET State = ?3 WHERE DeviceId = ?1 AND Pid = ?2",
    )?;
    let mut rows = 0;
    for pid in pids.into_iter().filter(|pid| !alive.contains(pid)) {
        rows += stmt.execute(params![device_id, pid, ProcessState::Dead.as_i64()])?;
    }
    Ok(rows)
}

fn read_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        session_id: row.get(0)?,
        device_id: row.get(1)?,
        pid: row.get(2)?,
        start_timestamp: row.get(3)?,
        end_timestamp: row.get(4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{BackingNamespace, ConnectionProvider, InMemoryConnectionProvider};
    use crate::types::UNSPECIFIED_END;

    fn table() -> ProfilerTable {
        let provider = InMemoryConnectionProvider::new();
        let conn = provider.connection(&BackingNamespace::DEFAULT_SHARED).unwrap();
        let table = ProfilerTable::new();
        table.initialize(&conn).unwrap();
        table
    }

    fn device(id: i64) -> Device {
        Device {
            device_id: id,
            serial: format!("emulator-{id}"),
            state: DeviceState::Online,
            ..Device::default()
        }
    }

    fn process(pid: i32) -> Process {
        Process {
            device_id: 1,
            pid,
            name: format!("com.example.{pid}"),
            state: ProcessState::Alive,
            start_timestamp: 10,
            abi_cpu_arch: "arm64".into(),
        }
    }

    #[test]
    fn snapshot_marks_missing_processes_dead() {
        let table = table();
        table
            .apply_device_snapshot(&DeviceSnapshot {
                device_id: 1,
                device: Some(device(1)),
                last_known_time: Some(100),
                processes: vec![process(10), process(11)],
                agent_statuses: vec![(10, AgentStatus::Attached)],
            })
            .unwrap();
        table
            .apply_device_snapshot(&DeviceSnapshot {
                device_id: 1,
                device: Some(device(1)),
                last_known_time: Some(200),
                processes: vec![process(10)],
                agent_statuses: Vec::new(),
            })
            .unwrap();

        let states: Vec<(i32, ProcessState)> = table
            .get_processes(DeviceId(1))
            .unwrap()
            .iter()
            .map(|p| (p.pid, p.state))
            .collect();
        assert_eq!(states, vec![(10, ProcessState::Alive), (11, ProcessState::Dead)]);
        assert_eq!(table.get_agent_status(DeviceId(1), 10).unwrap(), AgentStatus::Attached);
        assert_eq!(table.get_agent_status(DeviceId(1), 99).unwrap(), AgentStatus::Unspecified);
        assert_eq!(table.get_device_last_known_time(DeviceId(1)).unwrap(), Some(200));
    }

    #[test]
    fn disconnect_kills_processes_and_flags_device() {
        let table = table();
        table
            .apply_device_snapshot(&DeviceSnapshot {
                device_id: 1,
                device: Some(device(1)),
                last_known_time: None,
                processes: vec![process(10)],
                agent_statuses: Vec::new(),
            })
            .unwrap();
        table.set_device_disconnected(DeviceId(1)).unwrap();

        assert_eq!(table.get_devices().unwrap()[0].state, DeviceState::Disconnected);
        assert_eq!(table.get_processes(DeviceId(1)).unwrap()[0].state, ProcessState::Dead);
        assert_eq!(table.get_device_last_known_time(DeviceId(1)).unwrap(), None);
    }

    #[test]
    fn session_lifecycle() {
        let table = table();
        let session = Session {
            session_id: 5,
            device_id: 1,
            pid: 10,
            start_timestamp: 100,
            end_timestamp: UNSPECIFIED_END,
        };
        let meta = SessionMetaData {
            session_id: 5,
            session_name: "app".into(),
            ..SessionMetaData::default()
        };
        table.insert_or_update_session(&session, &meta).unwrap();
        assert!(table.update_session_end(5, 400).unwrap());
        assert!(!table.update_session_end(6, 400).unwrap());

        let stored = table.get_session(5).unwrap().unwrap();
        assert_eq!(stored.end_timestamp, 400);
        assert_eq!(table.get_session_meta(5).unwrap(), Some(meta));
        assert_eq!(table.get_sessions().unwrap().len(), 1);

        table.insert_bytes(5, "trace-1", b"abc").unwrap();
        assert_eq!(table.get_bytes(5, "trace-1").unwrap(), Some(b"abc".to_vec()));
        assert!(table.delete_session(5).unwrap());
        assert_eq!(table.get_session(5).unwrap(), None);
        assert_eq!(table.get_bytes(5, "trace-1").unwrap(), None);
    }
}
