//! Activity lifecycle and system interaction events.

use rusqlite::{Connection, params};

use super::{SharedConnection, TableHandle, decode_all, to_blob};
use crate::error::StorageError;
use crate::types::event::{ActivityData, SystemData};
use crate::types::{Session, TimeRange};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS Events_Activity (
    Session INTEGER NOT NULL,
    Hash INTEGER NOT NULL,
    StartTime INTEGER NOT NULL,
    EndTime INTEGER NOT NULL,
    Data BLOB NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_Events_Activity_Session_Hash
    ON Events_Activity (Session, Hash);

CREATE TABLE IF NOT EXISTS Events_System (
    Session INTEGER NOT NULL,
    EventId INTEGER NOT NULL,
    StartTime INTEGER NOT NULL,
    EndTime INTEGER NOT NULL,
    Data BLOB NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_Events_System_Session_EventId
    ON Events_System (Session, EventId);
";

// EndTime 0 marks an activity or interaction that has not ended.
const OVERLAP: &str = "StartTime <= ?3 AND (EndTime = 0 OR EndTime > ?2)";

#[derive(Debug)]
pub struct EventTable {
    handle: TableHandle,
}

impl Default for EventTable {
    fn default() -> Self {
        Self::new()
    }
}

impl EventTable {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            handle: TableHandle::new("events", SCHEMA),
        }
    }

    pub fn initialize(&self, conn: &SharedConnection) -> Result<(), StorageError> {
        self.handle.initialize(conn)
    }

    pub fn query_count(&self) -> u64 {
        self.handle.query_count()
    }

    /// Later descriptors for the same activity hash replace earlier ones
    pub fn insert_or_replace_activities(
        &self,
        session: &Session,
        activities: &[ActivityData],
    ) -> Result<usize, StorageError> {
        self.handle
            .write(|conn| insert_activities(conn, session.session_id, activities))
    }

    pub fn insert_or_replace_system_events(
        &self,
        session: &Session,
        events: &[SystemData],
    ) -> Result<usize, StorageError> {
        self.handle
            .write(|conn| insert_system(conn, session.session_id, events))
    }

    /// Both event kinds from one poll, committed together
    pub fn insert_poll_batch(
        &self,
        session: &Session,
        activities: &[ActivityData],
        events: &[SystemData],
    ) -> Result<usize, StorageError> {
        self.handle.write(|conn| {
            Ok(insert_activities(conn, session.session_id, activities)?
                + insert_system(conn, session.session_id, events)?)
        })
    }

    /// Activities alive at any point in `(start, end]`, by start time
    pub fn get_activity_data(
        &self,
        session: &Session,
        range: TimeRange,
    ) -> Result<Vec<ActivityData>, StorageError> {
        self.handle.read(|conn| {
            let sql = format!(
                "SELECT Data FROM Events_Activity WHERE Session = ?1 AND {OVERLAP}
                 ORDER BY StartTime, Hash"
            );
            let blobs = conn
                .prepare_cached(&sql)?
                .query_map(params![session.session_id, range.start, range.end], |row| {
                    row.get::<_, Vec<u8>>(0)
                })?
                .collect::<Result<Vec<_>, _>>()?;
            decode_all(&blobs)
        })
    }

    pub fn get_system_data(
        &self,
        session: &Session,
        range: TimeRange,
    ) -> Result<Vec<SystemData>, StorageError> {
        self.handle.read(|conn| {
            let sql = format!(
                "SELECT Data FROM Events_System WHERE Session = ?1 AND {OVERLAP}
                 ORDER BY StartTime, EventId"
            );
            let blobs = conn
                .prepare_cached(&sql)?
                .query_map(params![session.session_id, range.start, range.end], |row| {
                    row.get::<_, Vec<u8>>(0)
                })?
                .collect::<Result<Vec<_>, _>>()?;
            decode_all(&blobs)
        })
    }
}

fn insert_activities(
    conn: &Connection,
    session_id: i64,
    activities: &[ActivityData],
) -> Result<usize, StorageError> {
    let mut stmt = conn.prepare_cached(
        "INSERT OR REPLACE INTO Events_Activity (Session, Hash, StartTime, EndTime, Data)
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )?;
    let mut rows = 0;
    for activity in activities {
        rows += stmt.execute(params![
            session_id,
            activity.hash,
            activity.start_timestamp(),
            activity.end_timestamp(),
            to_blob(activity)?
        ])?;
    }
    Ok(rows)
}

fn insert_system(
    conn: &Connection,
    session_id: i64,
    events: &[SystemData],
) -> Result<usize, StorageError> {
    let mut stmt = conn.prepare_cached(
        "INSERT OR REPLACE INTO Events_System (Session, EventId, StartTime, EndTime, Data)
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )?;
    let mut rows = 0;
    for event in events {
        rows += stmt.execute(params![
            session_id,
            event.event_id,
            event.start_timestamp,
            event.end_timestamp,
            to_blob(event)?
        ])?;
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{BackingNamespace, ConnectionProvider, InMemoryConnectionProvider};
    use crate::types::event::{ActivityState, ActivityStateData, SystemEventType};

    fn table() -> EventTable {
        let provider = InMemoryConnectionProvider::new();
        let conn = provider.connection(&BackingNamespace::DEFAULT_SHARED).unwrap();
        let table = EventTable::new();
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

    fn activity(hash: i64, states: &[(ActivityState, i64)]) -> ActivityData {
        ActivityData {
            hash,
            name: format!("Activity{hash}"),
            fragment: false,
            states: states
                .iter()
                .map(|&(state, timestamp)| ActivityStateData { state, timestamp })
                .collect(),
        }
    }

    #[test]
    fn newer_activity_descriptor_replaces_older() {
        let table = table();
        let s = session(1);
        table
            .insert_or_replace_activities(&s, &[activity(7, &[(ActivityState::Created, 10)])])
            .unwrap();
        table
            .insert_or_replace_activities(
                &s,
                &[activity(
                    7,
                    &[(ActivityState::Created, 10), (ActivityState::Destroyed, 30)],
                )],
            )
            .unwrap();

        let all = table.get_activity_data(&s, TimeRange::new(0, 100)).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].end_timestamp(), 30);
        assert!(table
            .get_activity_data(&s, TimeRange::new(30, 100))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn ongoing_activity_overlaps_every_later_range() {
        let table = table();
        let s = session(1);
        table
            .insert_or_replace_activities(&s, &[activity(1, &[(ActivityState::Resumed, 50)])])
            .unwrap();
        assert!(table.get_activity_data(&s, TimeRange::new(0, 40)).unwrap().is_empty());
        assert_eq!(
            table
                .get_activity_data(&s, TimeRange::new(1_000, 2_000))
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn system_events_are_scoped_by_session() {
        let table = table();
        let touch = SystemData {
            event_id: 4,
            event_type: SystemEventType::Touch,
            action_id: 0,
            start_timestamp: 5,
            end_timestamp: 6,
        };
        assert_eq!(
            table
                .insert_poll_batch(&session(1), &[], std::slice::from_ref(&touch))
                .unwrap(),
            1
        );
        assert_eq!(
            table.get_system_data(&session(1), TimeRange::new(0, 10)).unwrap(),
            vec![touch]
        );
        assert!(table
            .get_system_data(&session(2), TimeRange::new(0, 10))
            .unwrap()
            .is_empty());
    }
}
