//! Device agent clients.
//!
//! Each telemetry domain talks to a connected device through one of these
//! traits. The wire transport behind them is supplied by the embedder; a
//! failed call surfaces as a [`TransportError`].

use std::sync::Arc;

use crate::error::TransportError;
use crate::types::cpu::{
    CpuProfilerType, CpuUsageData, ProfilerConfiguration, ProfilingStartResponse,
    ProfilingStateResponse, ProfilingStopResponse, ThreadData, TraceInfo,
};
use crate::types::event::{ActivityData, SystemData};
use crate::types::memory::{
    DumpDataResponse, ForceGarbageCollectionResponse, JvmtiBatch, LegacyAllocationEventsResponse,
    MemoryData, SetSamplingRateResponse, TrackAllocationsResponse, TriggerHeapDumpResponse,
};
use crate::types::profiler::{
    AgentData, BeginSessionRequest, BeginSessionResponse, ConfigureStartupAgentRequest,
    ConfigureStartupAgentResponse, Device, EndSessionResponse, Process, TimeResponse,
    VersionResponse,
};
use crate::types::stream::{Command, ExecuteResponse, UnifiedEvent};
use crate::types::{DeviceId, MonitoringResponse, Session, TimeRange};

/// Result of one forwarded device call
pub type CallResult<T> = std::result::Result<T, TransportError>;

pub trait CpuClient: Send + Sync {
    fn start_monitoring_app(&self, session: &Session) -> CallResult<MonitoringResponse>;
    fn stop_monitoring_app(&self, session: &Session) -> CallResult<MonitoringResponse>;
    fn get_data(&self, session: &Session, range: TimeRange) -> CallResult<Vec<CpuUsageData>>;
    fn get_threads(&self, session: &Session, range: TimeRange) -> CallResult<Vec<ThreadData>>;
    fn get_trace_info(&self, session: &Session, range: TimeRange) -> CallResult<Vec<TraceInfo>>;
    fn start_profiling_app(
        &self,
        session: &Session,
        configuration: &ProfilerConfiguration,
    ) -> CallResult<ProfilingStartResponse>;
    fn stop_profiling_app(
        &self,
        session: &Session,
        profiler_type: CpuProfilerType,
    ) -> CallResult<ProfilingStopResponse>;
    fn check_app_profiling_state(&self, session: &Session) -> CallResult<ProfilingStateResponse>;
}

pub trait MemoryClient: Send + Sync {
    fn start_monitoring_app(&self, session: &Session) -> CallResult<MonitoringResponse>;
    fn stop_monitoring_app(&self, session: &Session) -> CallResult<MonitoringResponse>;
    fn get_data(&self, session: &Session, range: TimeRange) -> CallResult<MemoryData>;
    /// Allocation events, contexts, and native frames recorded after `since`
    fn get_jvmti_batch(&self, session: &Session, since: i64) -> CallResult<JvmtiBatch>;
    fn trigger_heap_dump(
        &self,
        session: &Session,
        request_time: i64,
    ) -> CallResult<TriggerHeapDumpResponse>;
    fn get_heap_dump(&self, session: &Session, dump_time: i64) -> CallResult<DumpDataResponse>;
    fn track_allocations(
        &self,
        session: &Session,
        enabled: bool,
        request_time: i64,
    ) -> CallResult<TrackAllocationsResponse>;
    fn get_legacy_allocation_events(
        &self,
        session: &Session,
        start_time: i64,
    ) -> CallResult<LegacyAllocationEventsResponse>;
    fn get_legacy_allocation_dump(
        &self,
        session: &Session,
        start_time: i64,
    ) -> CallResult<DumpDataResponse>;
    fn force_garbage_collection(
        &self,
        session: &Session,
    ) -> CallResult<ForceGarbageCollectionResponse>;
    fn set_allocation_sampling_rate(
        &self,
        session: &Session,
        sampling_num_interval: i32,
    ) -> CallResult<SetSamplingRateResponse>;
}

pub trait EventClient: Send + Sync {
    fn start_monitoring_app(&self, session: &Session) -> CallResult<MonitoringResponse>;
    fn stop_monitoring_app(&self, session: &Session) -> CallResult<MonitoringResponse>;
    fn get_activity_data(&self, session: &Session, range: TimeRange)
    -> CallResult<Vec<ActivityData>>;
    fn get_system_data(&self, session: &Session, range: TimeRange) -> CallResult<Vec<SystemData>>;
}

pub trait ProfilerClient: Send + Sync {
    fn get_current_time(&self, device: DeviceId) -> CallResult<TimeResponse>;
    fn get_version(&self, device: DeviceId) -> CallResult<VersionResponse>;
    fn get_devices(&self) -> CallResult<Vec<Device>>;
    fn get_processes(&self, device: DeviceId) -> CallResult<Vec<Process>>;
    fn get_agent_status(&self, device: DeviceId, pid: i32) -> CallResult<AgentData>;
    fn begin_session(&self, request: &BeginSessionRequest) -> CallResult<BeginSessionResponse>;
    fn end_session(&self, device: DeviceId, session_id: i64) -> CallResult<EndSessionResponse>;
    fn get_bytes(&self, session: &Session, id: &str) -> CallResult<Vec<u8>>;
    fn configure_startup_agent(
        &self,
        request: &ConfigureStartupAgentRequest,
    ) -> CallResult<ConfigureStartupAgentResponse>;
    fn execute(&self, command: &Command) -> CallResult<ExecuteResponse>;
    /// Unified events of `stream_id` newer than `since`
    fn get_events(&self, stream_id: i64, since: i64) -> CallResult<Vec<UnifiedEvent>>;
}

/// The live clients for one connected device
#[derive(Clone)]
pub struct DeviceChannel {
    pub cpu: Arc<dyn CpuClient>,
    pub memory: Arc<dyn MemoryClient>,
    pub event: Arc<dyn EventClient>,
    pub profiler: Arc<dyn ProfilerClient>,
}

impl std::fmt::Debug for DeviceChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceChannel").finish_non_exhaustive()
    }
}
