//! Activity lifecycle and system (input) events.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ActivityState {
    #[default]
    Unspecified,
    Created,
    Started,
    Resumed,
    Paused,
    Stopped,
    Destroyed,
    Saved,
    Restarted,
    Added,
    Attached,
    Detached,
    Removed,
}

impl ActivityState {
    /// States after which no further transitions are reported
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Destroyed | Self::Removed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityStateData {
    pub state: ActivityState,
    pub timestamp: i64,
}

/// An activity or fragment and its lifecycle so far.
///
/// Stored as an insert-or-replace descriptor keyed by `hash`; each poll may
/// deliver a longer `states` list for the same activity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ActivityData {
    pub hash: i64,
    pub name: String,
    pub fragment: bool,
    pub states: Vec<ActivityStateData>,
}

impl ActivityData {
    #[must_use]
    pub fn start_timestamp(&self) -> i64 {
        self.states.first().map_or(0, |s| s.timestamp)
    }

    /// 0 while the activity is alive
    #[must_use]
    pub fn end_timestamp(&self) -> i64 {
        match self.states.last() {
            Some(last) if last.state.is_terminal() => last.timestamp,
            _ => 0,
        }
    }

    #[must_use]
    pub fn latest_timestamp(&self) -> i64 {
        self.states.iter().map(|s| s.timestamp).max().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SystemEventType {
    #[default]
    Unspecified,
    Touch,
    Key,
    Rotation,
}

/// A touch/key/rotation interaction; `end_timestamp == 0` while ongoing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SystemData {
    pub event_id: i64,
    pub event_type: SystemEventType,
    pub action_id: i32,
    pub start_timestamp: i64,
    pub end_timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ActivityDataResponse {
    pub data: Vec<ActivityData>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SystemDataResponse {
    pub data: Vec<SystemData>,
}
