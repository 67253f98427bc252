//! Shared identifiers, ranges, and status values for every telemetry domain.

pub mod cpu;
pub mod event;
pub mod memory;
pub mod profiler;
pub mod stream;

use serde::{Deserialize, Serialize};

/// End timestamp of an artifact that has not finished yet
pub const UNSPECIFIED_END: i64 = i64::MAX;

/// Identity of a connected device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub i64);

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A profiling session against one process on one device.
///
/// Immutable once created; every read, write, and runner is scoped to one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct Session {
    pub session_id: i64,
    pub device_id: i64,
    pub pid: i32,
    pub start_timestamp: i64,
    pub end_timestamp: i64,
}

impl Session {
    #[must_use]
    pub fn device(&self) -> DeviceId {
        DeviceId(self.device_id)
    }

    /// A session that has not been ended has `end_timestamp == UNSPECIFIED_END`
    #[must_use]
    pub fn is_ongoing(&self) -> bool {
        self.end_timestamp == UNSPECIFIED_END
    }
}

/// Half-open time window `(start, end]` in device nanoseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: i64,
    pub end: i64,
}

impl TimeRange {
    #[must_use]
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    /// Everything strictly after `start`
    #[must_use]
    pub fn since(start: i64) -> Self {
        Self {
            start,
            end: i64::MAX,
        }
    }

    #[must_use]
    pub fn contains(&self, timestamp: i64) -> bool {
        timestamp > self.start && timestamp <= self.end
    }
}

/// Outcome of reading a persisted artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum DumpStatus {
    Success,
    #[default]
    NotFound,
    NotReady,
    FailureUnknown,
}

impl DumpStatus {
    #[must_use]
    pub fn as_i64(self) -> i64 {
        match self {
            Self::Success => 0,
            Self::NotFound => 1,
            Self::NotReady => 2,
            Self::FailureUnknown => 3,
        }
    }

    /// Unknown codes read back from storage count as failures
    #[must_use]
    pub fn from_i64(code: i64) -> Self {
        match code {
            0 => Self::Success,
            1 => Self::NotFound,
            2 => Self::NotReady,
            _ => Self::FailureUnknown,
        }
    }
}

/// Telemetry domain a service or runner belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Domain {
    Cpu,
    Memory,
    Event,
    Profiler,
}

impl std::fmt::Display for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Memory => write!(f, "memory"),
            Self::Event => write!(f, "event"),
            Self::Profiler => write!(f, "profiler"),
        }
    }
}

/// Result of a forwarded start/stop monitoring call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum MonitorStatus {
    #[default]
    Unspecified,
    Success,
    Failure,
}

/// Reply to `start_monitoring_app` / `stop_monitoring_app`.
///
/// The default value is what callers get when the device is not connected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MonitoringResponse {
    pub status: MonitorStatus,
    pub error_message: String,
}

impl MonitoringResponse {
    #[must_use]
    pub fn success() -> Self {
        Self {
            status: MonitorStatus::Success,
            error_message: String::new(),
        }
    }
}
