//! Events of the unified pipeline, from every stream, read back in groups.

use std::collections::BTreeMap;

use rusqlite::{Connection, params, params_from_iter};

use super::{SharedConnection, TableHandle, decode_all, to_blob};
use crate::error::StorageError;
use crate::types::stream::{EventGroup, GetEventGroupsRequest, UnifiedEvent};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS UnifiedEvents (
    StreamId INTEGER NOT NULL,
    ProcessId INTEGER NOT NULL,
    GroupId INTEGER NOT NULL,
    Kind INTEGER NOT NULL,
    Timestamp INTEGER NOT NULL,
    Data BLOB NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_UnifiedEvents_Identity
    ON UnifiedEvents (StreamId, ProcessId, GroupId, Kind, Timestamp);
CREATE INDEX IF NOT EXISTS idx_UnifiedEvents_Kind_Timestamp
    ON UnifiedEvents (Kind, Timestamp);
";

#[derive(Debug)]
pub struct UnifiedEventTable {
    handle: TableHandle,
}

impl Default for UnifiedEventTable {
    fn default() -> Self {
        Self::new()
    }
}

impl UnifiedEventTable {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            handle: TableHandle::new("unified_events", SCHEMA),
        }
    }

    pub fn initialize(&self, conn: &SharedConnection) -> Result<(), StorageError> {
        self.handle.initialize(conn)
    }

    /// Events are never updated; a repeat of a stored event is dropped
    pub fn insert_event(&self, stream_id: i64, event: &UnifiedEvent) -> Result<usize, StorageError> {
        self.handle
            .write(|conn| insert_events(conn, stream_id, std::slice::from_ref(event)))
    }

    pub fn insert_events(&self, stream_id: i64, events: &[UnifiedEvent]) -> Result<usize, StorageError> {
        self.handle.write(|conn| insert_events(conn, stream_id, events))
    }

    pub fn get_all_events(&self) -> Result<Vec<UnifiedEvent>, StorageError> {
        self.handle.read(|conn| {
            let blobs = conn
                .prepare_cached("SELECT Data FROM UnifiedEvents ORDER BY Timestamp")?
                .query_map([], |row| row.get::<_, Vec<u8>>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            decode_all(&blobs)
        })
    }

    /// Events of one kind grouped by group id, groups in id order.
    ///
    /// Events inside `[from, to]` are always returned. A group also gets its
    /// latest event before `from` unless that event ended it, and its first
    /// event after `to` when the group already has events.
    pub fn get_event_groups(
        &self,
        request: &GetEventGroupsRequest,
    ) -> Result<Vec<EventGroup>, StorageError> {
        let mut filter = String::from("Kind = ?");
        let mut base = vec![request.kind.as_i64()];
        if let Some(stream_id) = request.stream_id {
            filter.push_str(" AND StreamId = ?");
            base.push(stream_id);
        }
        if let Some(pid) = request.pid {
            filter.push_str(" AND ProcessId = ?");
            base.push(i64::from(pid));
        }
        if let Some(group_id) = request.group_id {
            filter.push_str(" AND GroupId = ?");
            base.push(group_id);
        }

        let mut in_range_filter = filter.clone();
        let mut in_range = base.clone();
        if let Some(from) = request.from_timestamp {
            in_range_filter.push_str(" AND Timestamp >= ?");
            in_range.push(from);
        }
        if let Some(to) = request.to_timestamp {
            in_range_filter.push_str(" AND Timestamp <= ?");
            in_range.push(to);
        }

        self.handle.read(|conn| {
            let mut groups: BTreeMap<i64, Vec<UnifiedEvent>> = BTreeMap::new();

            // SQLite takes the bare Data column from the row holding the
            // MAX/MIN aggregate.
            if let Some(from) = request.from_timestamp {
                let sql = format!(
                    "SELECT Data, MAX(Timestamp) FROM UnifiedEvents
                     WHERE {filter} AND Timestamp < ? GROUP BY GroupId"
                );
                let params = base.iter().copied().chain([from]);
                for event in query_events(conn, &sql, params)? {
                    if !event.is_ended {
                        groups.entry(event.group_id).or_default().push(event);
                    }
                }
            }

            let sql = format!(
                "SELECT Data FROM UnifiedEvents WHERE {in_range_filter} ORDER BY Timestamp"
            );
            for event in query_events(conn, &sql, in_range.iter().copied())? {
                groups.entry(event.group_id).or_default().push(event);
            }

            if let Some(to) = request.to_timestamp {
                let sql = format!(
                    "SELECT Data, MIN(Timestamp) FROM UnifiedEvents
                     WHERE {filter} AND Timestamp > ? GROUP BY GroupId"
                );
                let params = base.iter().copied().chain([to]);
                for event in query_events(conn, &sql, params)? {
                    if let Some(group) = groups.get_mut(&event.group_id) {
                        group.push(event);
                    }
                }
            }

            Ok(groups
                .into_iter()
                .map(|(group_id, events)| EventGroup { group_id, events })
                .collect())
        })
    }
}

fn insert_events(
    conn: &Connection,
    stream_id: i64,
    events: &[UnifiedEvent],
) -> Result<usize, StorageError> {
    let mut stmt = conn.prepare_cached(
        "INSERT OR IGNORE INTO UnifiedEvents (StreamId, ProcessId, GroupId, Kind, Timestamp, Data)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )?;
    let mut rows = 0;
    for event in events {
        rows += stmt.execute(params![
            stream_id,
            event.pid,
            event.group_id,
            event.kind.as_i64(),
            event.timestamp,
            to_blob(event)?
        ])?;
    }
    Ok(rows)
}

fn query_events(
    conn: &Connection,
    sql: &str,
    params: impl Iterator<Item = i64>,
) -> Result<Vec<UnifiedEvent>, StorageError> {
    let blobs = conn
        .prepare_cached(sql)?
        .query_map(params_from_iter(params), |row| row.get::<_, Vec<u8>>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    decode_all(&blobs)
}
