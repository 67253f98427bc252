//! Unified events: streams, commands, and grouped event queries.
//!
//! A stream is one agent connection. Events from every stream land in one
//! table and are read back grouped by `group_id`.

use serde::{Deserialize, Serialize};

/// Stream id under which the datastore records its own events
pub const DATASTORE_RESERVED_STREAM_ID: i64 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct Stream {
    pub stream_id: i64,
    pub device_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum EventKind {
    #[default]
    Unspecified,
    Stream,
    Session,
    Process,
    Agent,
    Echo,
}

impl EventKind {
    #[must_use]
    pub fn as_i64(self) -> i64 {
        match self {
            Self::Unspecified => 0,
            Self::Stream => 1,
            Self::Session => 2,
            Self::Process => 3,
            Self::Agent => 4,
            Self::Echo => 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum EventPayload {
    #[default]
    None,
    StreamConnected(Stream),
    StreamDisconnected(Stream),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct UnifiedEvent {
    pub kind: EventKind,
    pub pid: i32,
    pub group_id: i64,
    pub timestamp: i64,
    /// Last event of its group
    pub is_ended: bool,
    pub payload: EventPayload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EventGroup {
    pub group_id: i64,
    pub events: Vec<UnifiedEvent>,
}

/// Filters for [`EventGroup`] queries; `None` matches everything.
///
/// With `from_timestamp`, each group also gets its latest earlier event
/// unless that event ended the group. With `to_timestamp`, groups already
/// returned also get their first later event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct GetEventGroupsRequest {
    pub kind: EventKind,
    pub stream_id: Option<i64>,
    pub pid: Option<i32>,
    pub group_id: Option<i64>,
    pub from_timestamp: Option<i64>,
    pub to_timestamp: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct GetEventGroupsResponse {
    pub groups: Vec<EventGroup>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum CommandKind {
    #[default]
    Unspecified,
    Echo,
    BeginSession,
    EndSession,
    AttachAgent,
}

/// A command routed to the agent behind `stream_id`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Command {
    pub stream_id: i64,
    pub pid: i32,
    pub kind: CommandKind,
    pub payload: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ExecuteResponse {
    pub accepted: bool,
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    #[test]
    fn event_kind_codes_are_distinct() {
        let kinds = [
            EventKind::Unspecified,
            EventKind::Stream,
            EventKind::Session,
            EventKind::Process,
            EventKind::Agent,
            EventKind::Echo,
        ];
        let codes: BTreeSet<i64> = kinds.iter().map(|k| k.as_i64()).collect();
        assert_eq!(codes.len(), kinds.len());
        assert_eq!(EventKind::default().as_i64(), 0);
    }
}
