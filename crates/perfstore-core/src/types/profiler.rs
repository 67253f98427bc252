//! Devices, processes, sessions, and other profiler-level metadata.

use serde::{Deserialize, Serialize};

use super::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum DeviceState {
    #[default]
    Unspecified,
    Online,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Device {
    pub device_id: i64,
    pub serial: String,
    pub model: String,
    pub manufacturer: String,
    pub api_level: i32,
    pub state: DeviceState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ProcessState {
    #[default]
    Unspecified,
    Alive,
    Dead,
}

impl ProcessState {
    #[must_use]
    pub fn as_i64(self) -> i64 {
        match self {
            Self::Unspecified => 0,
            Self::Alive => 1,
            Self::Dead => 2,
        }
    }

    #[must_use]
    pub fn from_i64(code: i64) -> Self {
        match code {
            1 => Self::Alive,
            2 => Self::Dead,
            _ => Self::Unspecified,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Process {
    pub device_id: i64,
    pub pid: i32,
    pub name: String,
    pub state: ProcessState,
    pub start_timestamp: i64,
    pub abi_cpu_arch: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum AgentStatus {
    #[default]
    Unspecified,
    Attached,
    Unattachable,
}

impl AgentStatus {
    #[must_use]
    pub fn as_i64(self) -> i64 {
        match self {
            Self::Unspecified => 0,
            Self::Attached => 1,
            Self::Unattachable => 2,
        }
    }

    #[must_use]
    pub fn from_i64(code: i64) -> Self {
        match code {
            1 => Self::Attached,
            2 => Self::Unattachable,
            _ => Self::Unspecified,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AgentData {
    pub status: AgentStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SessionType {
    #[default]
    Full,
    CpuCapture,
    MemoryCapture,
}

/// Display metadata kept alongside a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SessionMetaData {
    pub session_id: i64,
    pub session_name: String,
    pub start_timestamp_epoch_ms: i64,
    pub process_abi: String,
    pub jvmti_enabled: bool,
    pub live_allocation_enabled: bool,
    pub session_type: SessionType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BeginSessionRequest {
    pub device_id: i64,
    pub pid: i32,
    pub session_name: String,
    pub request_time_epoch_ms: i64,
    pub jvmti_enabled: bool,
    pub live_allocation_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BeginSessionResponse {
    pub session: Session,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EndSessionResponse {
    pub session: Session,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TimeResponse {
    pub timestamp_ns: i64,
    pub epoch_timestamp_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct VersionResponse {
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BytesResponse {
    pub contents: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct GetDevicesResponse {
    pub devices: Vec<Device>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct GetProcessesResponse {
    pub processes: Vec<Process>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct GetSessionsResponse {
    pub sessions: Vec<Session>,
}

/// Where to install the agent that attaches when an app starts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ConfigureStartupAgentRequest {
    /// Either a device id or the id of a stream on that device
    pub device_id: i64,
    pub app_package_name: String,
    pub agent_lib_file_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ConfigureStartupAgentResponse {
    /// Arguments the app must be launched with
    pub agent_args: String,
}

/// A whole-session capture imported from a file rather than recorded live
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ImportSessionRequest {
    pub session: Session,
    pub session_name: String,
    pub start_timestamp_epoch_ms: i64,
    pub session_type: SessionType,
}
