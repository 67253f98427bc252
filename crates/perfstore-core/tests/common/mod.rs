//! Shared test infrastructure for perfstore-core integration tests.
//!
//! Import from integration test files with:
//! ```ignore
//! mod common;
//! use common::{FakeAgent, TestStore};
//! ```

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use perfstore_core::DataStore;
use perfstore_core::client::{
    CallResult, CpuClient, DeviceChannel, EventClient, MemoryClient, ProfilerClient,
};
use perfstore_core::config::Config;
use perfstore_core::error::TransportError;
use perfstore_core::executor::ManualExecutor;
use perfstore_core::storage::InMemoryConnectionProvider;
use perfstore_core::types::cpu::{
    CpuProfilerType, CpuUsageData, ProfilerConfiguration, ProfilingStartResponse,
    ProfilingStateResponse, ProfilingStatus, ProfilingStopResponse, ThreadData, TraceInfo,
};
use perfstore_core::types::event::{ActivityData, SystemData};
use perfstore_core::types::memory::{
    DumpDataResponse, ForceGarbageCollectionResponse, ForceGcStatus, JvmtiBatch,
    LegacyAllocationEventsResponse, MemoryData, SetSamplingRateResponse,
    TrackAllocationsResponse, TriggerHeapDumpResponse,
};
use perfstore_core::types::profiler::{
    AgentData, AgentStatus, BeginSessionRequest, BeginSessionResponse,
    ConfigureStartupAgentRequest, ConfigureStartupAgentResponse, Device, EndSessionResponse,
    Process, TimeResponse, VersionResponse,
};
use perfstore_core::types::stream::{Command, ExecuteResponse, UnifiedEvent};
use perfstore_core::types::{
    DeviceId, DumpStatus, MonitoringResponse, Session, TimeRange, UNSPECIFIED_END,
};

/// Everything a fake agent will answer with
#[derive(Debug, Default)]
pub struct AgentState {
    pub cpu_usage: Vec<CpuUsageData>,
    /// Per-session usage; takes precedence over `cpu_usage` when present
    pub cpu_usage_by_session: HashMap<i64, Vec<CpuUsageData>>,
    pub threads: Vec<ThreadData>,
    pub trace_infos: Vec<TraceInfo>,
    pub profiling_state: ProfilingStateResponse,
    pub stop_profiling: ProfilingStopResponse,
    pub memory: MemoryData,
    pub heap_dumps: HashMap<i64, DumpDataResponse>,
    pub trigger_heap_dump: TriggerHeapDumpResponse,
    pub track_allocations: TrackAllocationsResponse,
    pub legacy_events: HashMap<i64, LegacyAllocationEventsResponse>,
    pub legacy_dumps: HashMap<i64, DumpDataResponse>,
    pub jvmti: JvmtiBatch,
    pub activities: Vec<ActivityData>,
    pub system: Vec<SystemData>,
    pub devices: Vec<Device>,
    pub processes: Vec<Process>,
    pub agent_status: AgentStatus,
    pub time_ns: i64,
    pub next_session_id: i64,
    pub bytes: HashMap<String, Vec<u8>>,
    pub startup_agent_args: String,
    pub executed: Vec<Command>,
    pub unified_events: Vec<UnifiedEvent>,
}

/// A scripted device agent implementing every client trait.
///
/// Counts forwarded control calls and can be told to fail every call.
#[derive(Debug, Default)]
pub struct FakeAgent {
    state: Mutex<AgentState>,
    failing: AtomicBool,
    pub start_calls: AtomicUsize,
    pub stop_calls: AtomicUsize,
    pub data_calls: AtomicUsize,
    pub bytes_calls: AtomicUsize,
}

impl FakeAgent {
    pub fn new(device: DeviceId) -> Arc<Self> {
        let agent = Self::default();
        {
            let mut state = agent.state();
            state.devices.push(Device {
                device_id: device.0,
                serial: format!("fake-{device}"),
                ..Device::default()
            });
            state.next_session_id = 1;
        }
        Arc::new(agent)
    }

    pub fn state(&self) -> MutexGuard<'_, AgentState> {
        self.state.lock().unwrap()
    }

    /// Make every call fail with `Unavailable` until switched back
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn channel(self: &Arc<Self>) -> DeviceChannel {
        DeviceChannel {
            cpu: Arc::clone(self) as Arc<dyn CpuClient>,
            memory: Arc::clone(self) as Arc<dyn MemoryClient>,
            event: Arc::clone(self) as Arc<dyn EventClient>,
            profiler: Arc::clone(self) as Arc<dyn ProfilerClient>,
        }
    }

    fn check(&self) -> CallResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(TransportError::Unavailable("fake agent offline".into()))
        } else {
            Ok(())
        }
    }

    fn started(&self) -> CallResult<MonitoringResponse> {
        self.check()?;
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        Ok(MonitoringResponse::success())
    }

    fn stopped(&self) -> CallResult<MonitoringResponse> {
        self.check()?;
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        Ok(MonitoringResponse::success())
    }
}

impl CpuClient for FakeAgent {
    fn start_monitoring_app(&self, _session: &Session) -> CallResult<MonitoringResponse> {
        self.started()
    }

    fn stop_monitoring_app(&self, _session: &Session) -> CallResult<MonitoringResponse> {
        self.stopped()
    }

    fn get_data(&self, session: &Session, range: TimeRange) -> CallResult<Vec<CpuUsageData>> {
        self.check()?;
        self.data_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state();
        let usage = state
            .cpu_usage_by_session
            .get(&session.session_id)
            .unwrap_or(&state.cpu_usage);
        Ok(usage
            .iter()
            .filter(|d| range.contains(d.end_timestamp))
            .cloned()
            .collect())
    }

    fn get_threads(&self, _session: &Session, _range: TimeRange) -> CallResult<Vec<ThreadData>> {
        self.check()?;
        Ok(self.state().threads.clone())
    }

    fn get_trace_info(&self, _session: &Session, _range: TimeRange) -> CallResult<Vec<TraceInfo>> {
        self.check()?;
        Ok(self.state().trace_infos.clone())
    }

    fn start_profiling_app(
        &self,
        _session: &Session,
        _configuration: &ProfilerConfiguration,
    ) -> CallResult<ProfilingStartResponse> {
        self.check()?;
        Ok(ProfilingStartResponse {
            status: ProfilingStatus::Success,
            error_message: String::new(),
        })
    }

    fn stop_profiling_app(
        &self,
        _session: &Session,
        _profiler_type: CpuProfilerType,
    ) -> CallResult<ProfilingStopResponse> {
        self.check()?;
        Ok(self.state().stop_profiling.clone())
    }

    fn check_app_profiling_state(&self, _session: &Session) -> CallResult<ProfilingStateResponse> {
        self.check()?;
        Ok(self.state().profiling_state.clone())
    }
}

impl MemoryClient for FakeAgent {
    fn start_monitoring_app(&self, _session: &Session) -> CallResult<MonitoringResponse> {
        self.started()
    }

    fn stop_monitoring_app(&self, _session: &Session) -> CallResult<MonitoringResponse> {
        self.stopped()
    }

    fn get_data(&self, _session: &Session, range: TimeRange) -> CallResult<MemoryData> {
        self.check()?;
        self.data_calls.fetch_add(1, Ordering::SeqCst);
        let mut data = self.state().memory.clone();
        data.mem_samples.retain(|s| range.contains(s.timestamp));
        data.vm_stats_samples.retain(|s| range.contains(s.timestamp));
        Ok(data)
    }

    fn get_jvmti_batch(&self, _session: &Session, since: i64) -> CallResult<JvmtiBatch> {
        self.check()?;
        let state = self.state();
        let mut batch = state.jvmti.clone();
        batch.events.retain(|e| e.timestamp > since);
        batch.sampling_rate_events.retain(|r| r.timestamp > since);
        batch.jni_ref_events.retain(|r| r.timestamp > since);
        Ok(batch)
    }

    fn trigger_heap_dump(
        &self,
        _session: &Session,
        _request_time: i64,
    ) -> CallResult<TriggerHeapDumpResponse> {
        self.check()?;
        Ok(self.state().trigger_heap_dump.clone())
    }

    fn get_heap_dump(&self, _session: &Session, dump_time: i64) -> CallResult<DumpDataResponse> {
        self.check()?;
        Ok(self
            .state()
            .heap_dumps
            .get(&dump_time)
            .cloned()
            .unwrap_or(DumpDataResponse {
                status: DumpStatus::NotReady,
                data: Vec::new(),
            }))
    }

    fn track_allocations(
        &self,
        _session: &Session,
        _enabled: bool,
        _request_time: i64,
    ) -> CallResult<TrackAllocationsResponse> {
        self.check()?;
        Ok(self.state().track_allocations.clone())
    }

    fn get_legacy_allocation_events(
        &self,
        _session: &Session,
        start_time: i64,
    ) -> CallResult<LegacyAllocationEventsResponse> {
        self.check()?;
        Ok(self
            .state()
            .legacy_events
            .get(&start_time)
            .cloned()
            .unwrap_or_default())
    }

    fn get_legacy_allocation_dump(
        &self,
        _session: &Session,
        start_time: i64,
    ) -> CallResult<DumpDataResponse> {
        self.check()?;
        Ok(self
            .state()
            .legacy_dumps
            .get(&start_time)
            .cloned()
            .unwrap_or_default())
    }

    fn force_garbage_collection(
        &self,
        _session: &Session,
    ) -> CallResult<ForceGarbageCollectionResponse> {
        self.check()?;
        Ok(ForceGarbageCollectionResponse {
            status: ForceGcStatus::Success,
        })
    }

    fn set_allocation_sampling_rate(
        &self,
        _session: &Session,
        _sampling_num_interval: i32,
    ) -> CallResult<SetSamplingRateResponse> {
        self.check()?;
        Ok(SetSamplingRateResponse { applied: true })
    }
}

impl EventClient for FakeAgent {
    fn start_monitoring_app(&self, _session: &Session) -> CallResult<MonitoringResponse> {
        self.started()
    }

    fn stop_monitoring_app(&self, _session: &Session) -> CallResult<MonitoringResponse> {
        self.stopped()
    }

    fn get_activity_data(
        &self,
        _session: &Session,
        _range: TimeRange,
    ) -> CallResult<Vec<ActivityData>> {
        self.check()?;
        Ok(self.state().activities.clone())
    }

    fn get_system_data(&self, _session: &Session, _range: TimeRange) -> CallResult<Vec<SystemData>> {
        self.check()?;
        Ok(self.state().system.clone())
    }
}

impl ProfilerClient for FakeAgent {
    fn get_current_time(&self, _device: DeviceId) -> CallResult<TimeResponse> {
        self.check()?;
        Ok(TimeResponse {
            timestamp_ns: self.state().time_ns,
            epoch_timestamp_ms: 1_700_000_000_000,
        })
    }

    fn get_version(&self, _device: DeviceId) -> CallResult<VersionResponse> {
        self.check()?;
        Ok(VersionResponse {
            version: "fake-1.0".into(),
        })
    }

    fn get_devices(&self) -> CallResult<Vec<Device>> {
        self.check()?;
        Ok(self.state().devices.clone())
    }

    fn get_processes(&self, _device: DeviceId) -> CallResult<Vec<Process>> {
        self.check()?;
        Ok(self.state().processes.clone())
    }

    fn get_agent_status(&self, _device: DeviceId, _pid: i32) -> CallResult<AgentData> {
        self.check()?;
        Ok(AgentData {
            status: self.state().agent_status,
        })
    }

    fn begin_session(&self, request: &BeginSessionRequest) -> CallResult<BeginSessionResponse> {
        self.check()?;
        let mut state = self.state();
        let session_id = state.next_session_id;
        state.next_session_id += 1;
        Ok(BeginSessionResponse {
            session: Session {
                session_id,
                device_id: request.device_id,
                pid: request.pid,
                start_timestamp: state.time_ns,
                end_timestamp: UNSPECIFIED_END,
            },
        })
    }

    fn end_session(&self, device: DeviceId, session_id: i64) -> CallResult<EndSessionResponse> {
        self.check()?;
        Ok(EndSessionResponse {
            session: Session {
                session_id,
                device_id: device.0,
                end_timestamp: self.state().time_ns,
                ..Session::default()
            },
        })
    }

    fn get_bytes(&self, _session: &Session, id: &str) -> CallResult<Vec<u8>> {
        self.check()?;
        self.bytes_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.state().bytes.get(id).cloned().unwrap_or_default())
    }

    fn configure_startup_agent(
        &self,
        _request: &ConfigureStartupAgentRequest,
    ) -> CallResult<ConfigureStartupAgentResponse> {
        self.check()?;
        Ok(ConfigureStartupAgentResponse {
            agent_args: self.state().startup_agent_args.clone(),
        })
    }

    fn execute(&self, command: &Command) -> CallResult<ExecuteResponse> {
        self.check()?;
        self.state().executed.push(command.clone());
        Ok(ExecuteResponse { accepted: true })
    }

    fn get_events(&self, _stream_id: i64, since: i64) -> CallResult<Vec<UnifiedEvent>> {
        self.check()?;
        Ok(self
            .state()
            .unified_events
            .iter()
            .filter(|e| e.timestamp > since)
            .cloned()
            .collect())
    }
}

type StartHook = Box<dyn FnOnce() + Send>;

/// A cpu client that runs a hook inside its first `start_monitoring_app`,
/// before the device answers; everything else goes to the wrapped agent
pub struct InterruptedStart {
    agent: Arc<FakeAgent>,
    hook: Mutex<Option<StartHook>>,
}

impl InterruptedStart {
    pub fn new(agent: Arc<FakeAgent>, hook: impl FnOnce() + Send + 'static) -> Arc<Self> {
        Arc::new(Self {
            agent,
            hook: Mutex::new(Some(Box::new(hook))),
        })
    }

    pub fn channel(self: &Arc<Self>) -> DeviceChannel {
        DeviceChannel {
            cpu: Arc::clone(self) as Arc<dyn CpuClient>,
            ..self.agent.channel()
        }
    }
}

impl CpuClient for InterruptedStart {
    fn start_monitoring_app(&self, session: &Session) -> CallResult<MonitoringResponse> {
        let hook = self.hook.lock().unwrap().take();
        if let Some(hook) = hook {
            hook();
        }
        CpuClient::start_monitoring_app(&*self.agent, session)
    }

    fn stop_monitoring_app(&self, session: &Session) -> CallResult<MonitoringResponse> {
        CpuClient::stop_monitoring_app(&*self.agent, session)
    }

    fn get_data(&self, session: &Session, range: TimeRange) -> CallResult<Vec<CpuUsageData>> {
        CpuClient::get_data(&*self.agent, session, range)
    }

    fn get_threads(&self, session: &Session, range: TimeRange) -> CallResult<Vec<ThreadData>> {
        self.agent.get_threads(session, range)
    }

    fn get_trace_info(&self, session: &Session, range: TimeRange) -> CallResult<Vec<TraceInfo>> {
        self.agent.get_trace_info(session, range)
    }

    fn start_profiling_app(
        &self,
        session: &Session,
        configuration: &ProfilerConfiguration,
    ) -> CallResult<ProfilingStartResponse> {
        self.agent.start_profiling_app(session, configuration)
    }

    fn stop_profiling_app(
        &self,
        session: &Session,
        profiler_type: CpuProfilerType,
    ) -> CallResult<ProfilingStopResponse> {
        self.agent.stop_profiling_app(session, profiler_type)
    }

    fn check_app_profiling_state(&self, session: &Session) -> CallResult<ProfilingStateResponse> {
        self.agent.check_app_profiling_state(session)
    }
}

/// A datastore on in-memory SQLite whose runners only move when ticked
pub struct TestStore {
    pub store: Arc<DataStore>,
    pub executor: Arc<ManualExecutor>,
}

impl TestStore {
    pub fn new() -> Self {
        Self::with_config(&Config::default())
    }

    pub fn with_config(config: &Config) -> Self {
        let provider = InMemoryConnectionProvider::new();
        let executor = Arc::new(ManualExecutor::new());
        let store = Arc::new(DataStore::new(config, &provider, executor.clone()).unwrap());
        Self { store, executor }
    }

    /// Connect a fresh fake agent as `device`
    pub fn connect(&self, device: DeviceId) -> Arc<FakeAgent> {
        let agent = FakeAgent::new(device);
        self.store.on_device_connected(device, agent.channel());
        agent
    }

    pub fn tick(&self) -> usize {
        self.executor.tick_all()
    }
}

pub fn session(session_id: i64, device: DeviceId) -> Session {
    Session {
        session_id,
        device_id: device.0,
        pid: 1000 + i32::try_from(session_id).unwrap(),
        start_timestamp: 0,
        end_timestamp: UNSPECIFIED_END,
    }
}

pub fn usage(end_timestamp: i64) -> CpuUsageData {
    CpuUsageData {
        end_timestamp,
        elapsed_time_ms: 10,
        app_cpu_time_ms: end_timestamp % 7,
        system_cpu_time_ms: 3,
    }
}
