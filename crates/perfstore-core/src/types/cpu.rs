//! CPU usage, thread activity, and method-trace messages.

use serde::{Deserialize, Serialize};

use super::DumpStatus;

/// One CPU usage sample reported by the agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CpuUsageData {
    pub end_timestamp: i64,
    pub elapsed_time_ms: i64,
    pub app_cpu_time_ms: i64,
    pub system_cpu_time_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ThreadState {
    #[default]
    Unspecified,
    Running,
    Sleeping,
    Waiting,
    Zombie,
    Stopped,
    Tracing,
    Paging,
    Dead,
}

impl ThreadState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unspecified => "unspecified",
            Self::Running => "running",
            Self::Sleeping => "sleeping",
            Self::Waiting => "waiting",
            Self::Zombie => "zombie",
            Self::Stopped => "stopped",
            Self::Tracing => "tracing",
            Self::Paging => "paging",
            Self::Dead => "dead",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw {
            "running" => Self::Running,
            "sleeping" => Self::Sleeping,
            "waiting" => Self::Waiting,
            "zombie" => Self::Zombie,
            "stopped" => Self::Stopped,
            "tracing" => Self::Tracing,
            "paging" => Self::Paging,
            "dead" => Self::Dead,
            _ => Self::Unspecified,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadActivity {
    pub timestamp: i64,
    pub new_state: ThreadState,
}

/// A thread and the state transitions seen for it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ThreadData {
    pub tid: i32,
    pub name: String,
    pub activities: Vec<ThreadActivity>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum CpuProfilerType {
    #[default]
    Unspecified,
    Art,
    Simpleperf,
    Atrace,
    Perfetto,
}

impl CpuProfilerType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unspecified => "unspecified",
            Self::Art => "art",
            Self::Simpleperf => "simpleperf",
            Self::Atrace => "atrace",
            Self::Perfetto => "perfetto",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw {
            "art" => Self::Art,
            "simpleperf" => Self::Simpleperf,
            "atrace" => Self::Atrace,
            "perfetto" => Self::Perfetto,
            _ => Self::Unspecified,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum CpuProfilerMode {
    #[default]
    Unspecified,
    Sampled,
    Instrumented,
}

impl CpuProfilerMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unspecified => "unspecified",
            Self::Sampled => "sampled",
            Self::Instrumented => "instrumented",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw {
            "sampled" => Self::Sampled,
            "instrumented" => Self::Instrumented,
            _ => Self::Unspecified,
        }
    }
}

/// How a trace is to be captured
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ProfilerConfiguration {
    pub profiler_type: CpuProfilerType,
    pub profiler_mode: CpuProfilerMode,
    pub sampling_interval_us: i32,
    pub buffer_size_mb: i32,
}

/// Descriptor of a captured (or still capturing) trace.
///
/// `to_timestamp == 0` marks a capture that is still in progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TraceInfo {
    pub trace_id: i64,
    pub configuration: ProfilerConfiguration,
    pub from_timestamp: i64,
    pub to_timestamp: i64,
}

impl TraceInfo {
    #[must_use]
    pub fn is_ongoing(&self) -> bool {
        self.to_timestamp == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CpuDataResponse {
    pub data: Vec<CpuUsageData>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct GetThreadsResponse {
    pub threads: Vec<ThreadData>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TraceInfoResponse {
    pub trace_info: Vec<TraceInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ProfilingStatus {
    #[default]
    Unspecified,
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ProfilingStartResponse {
    pub status: ProfilingStatus,
    pub error_message: String,
}

/// Reply to stopping a capture; carries the trace on success
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ProfilingStopResponse {
    pub status: ProfilingStatus,
    pub error_message: String,
    pub trace_info: TraceInfo,
    pub trace: Vec<u8>,
}

/// Whether the app was being profiled at `check_timestamp`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ProfilingStateResponse {
    pub check_timestamp: i64,
    pub being_profiled: bool,
    pub configuration: ProfilerConfiguration,
    pub start_timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TraceResponse {
    pub status: DumpStatus,
    pub data: Vec<u8>,
    pub profiler_type: CpuProfilerType,
    pub profiler_mode: CpuProfilerMode,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_codes_are_stable() {
        for state in [ThreadState::Running, ThreadState::Dead, ThreadState::Paging] {
            assert_eq!(ThreadState::parse(state.as_str()), state);
        }
        assert_eq!(CpuProfilerType::parse("simpleperf"), CpuProfilerType::Simpleperf);
        assert_eq!(CpuProfilerMode::parse("bogus"), CpuProfilerMode::Unspecified);
    }

    #[test]
    fn zero_end_means_ongoing_trace() {
        let info = TraceInfo {
            trace_id: 1,
            from_timestamp: 5,
            ..TraceInfo::default()
        };
        assert!(info.is_ongoing());
    }
}
