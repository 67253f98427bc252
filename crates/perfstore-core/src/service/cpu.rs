use std::sync::Arc;

use tracing::{debug, info};

use super::{BackingStore, DomainService, ResponseCache, RunnerSet, ServiceSettings};
use crate::Result;
use crate::client::CpuClient;
use crate::error::StorageError;
use crate::executor::FetchExecutor;
use crate::poller::{CpuPoller, PollRunner};
use crate::registry::ClientRegistry;
use crate::storage::{BackingNamespace, CpuTable, SharedConnection};
use crate::types::cpu::{
    CpuDataResponse, CpuProfilerType, GetThreadsResponse, ProfilerConfiguration,
    ProfilingStartResponse, ProfilingStateResponse, ProfilingStatus, ProfilingStopResponse,
    TraceInfo, TraceInfoResponse, TraceResponse,
};
use crate::types::{DeviceId, Domain, DumpStatus, MonitoringResponse, Session, TimeRange};

pub struct CpuService {
    registry: Arc<ClientRegistry>,
    executor: Arc<dyn FetchExecutor>,
    settings: ServiceSettings,
    table: Arc<CpuTable>,
    runners: RunnerSet<Session>,
    cache: ResponseCache<CpuDataResponse>,
}

impl std::fmt::Debug for CpuService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuService")
            .field("monitored_sessions", &self.runners.len())
            .finish_non_exhaustive()
    }
}

impl CpuService {
    #[must_use]
    pub fn new(
        registry: Arc<ClientRegistry>,
        executor: Arc<dyn FetchExecutor>,
        settings: ServiceSettings,
    ) -> Self {
        Self {
            registry,
            executor,
            settings,
            table: Arc::new(CpuTable::new()),
            runners: RunnerSet::new(Domain::Cpu),
            cache: ResponseCache::new(settings.cache_capacity),
        }
    }

    #[must_use]
    pub fn table(&self) -> &CpuTable {
        &self.table
    }

    #[must_use]
    pub fn response_cache(&self) -> &ResponseCache<CpuDataResponse> {
        &self.cache
    }

    /// Runners polling `session`; 0 when it is not monitored
    #[must_use]
    pub fn active_runner_count(&self, session: &Session) -> usize {
        self.runners.runner_count(session)
    }

    #[must_use]
    pub fn monitored_session_count(&self) -> usize {
        self.runners.len()
    }

    fn client(&self, session: &Session) -> Option<Arc<dyn CpuClient>> {
        self.registry.cpu_client(session.device())
    }

    /// Forward the start and register the session's runner.
    ///
    /// The runner is bound to the channel the request went out on; if the
    /// device disconnects or reconnects before it is registered, it is
    /// withdrawn instead of being left polling a dead channel.
    pub fn start_monitoring_app(&self, session: &Session) -> Result<MonitoringResponse> {
        let Some((generation, channel)) = self.registry.lookup(session.device()) else {
            debug!(session_id = session.session_id, device_id = %session.device(), "cpu start ignored: device not connected");
            return Ok(MonitoringResponse::default());
        };
        let client = channel.cpu;
        let response = client.start_monitoring_app(session)?;

        let started = self.runners.start_bound(*session, session.device(), &self.registry, generation, || {
            let poller = CpuPoller::new(*session, client, Arc::clone(&self.table));
            vec![PollRunner::new(
                Box::new(poller),
                self.settings.poll,
                session.device(),
                Some(session.session_id),
            )]
        });
        if let Some(runners) = started {
            info!(
                domain = %Domain::Cpu,
                session_id = session.session_id,
                device_id = %session.device(),
                status = ?response.status,
                "monitoring started"
            );
            for runner in runners {
                self.executor.submit(runner);
            }
        }
        Ok(response)
    }

    pub fn stop_monitoring_app(&self, session: &Session) -> Result<MonitoringResponse> {
        let stopped = self.runners.stop(session);
        if stopped > 0 {
            info!(domain = %Domain::Cpu, session_id = session.session_id, runners = stopped, "monitoring stopped");
        }
        match self.client(session) {
            Some(client) => Ok(client.stop_monitoring_app(session)?),
            None => Ok(MonitoringResponse::default()),
        }
    }

    /// Usage samples in `(start, end]`, served from the response cache when
    /// the identical request was the last one seen
    pub fn get_data(&self, session: &Session, range: TimeRange) -> Result<CpuDataResponse> {
        Ok(self.cache.get_or_try_insert_with(session, range, || {
            Ok::<_, StorageError>(CpuDataResponse {
                data: self.table.get_cpu_data(session, range)?,
            })
        })?)
    }

    pub fn get_threads(&self, session: &Session, range: TimeRange) -> Result<GetThreadsResponse> {
        Ok(GetThreadsResponse {
            threads: self.table.get_thread_activities(session, range)?,
        })
    }

    pub fn get_trace_info(&self, session: &Session, range: TimeRange) -> Result<TraceInfoResponse> {
        Ok(TraceInfoResponse {
            trace_info: self.table.get_trace_infos(session, range)?,
        })
    }

    pub fn save_trace_info(&self, session: &Session, info: &TraceInfo) -> Result<()> {
        Ok(self.table.insert_or_replace_trace_info(session, info)?)
    }

    pub fn start_profiling_app(
        &self,
        session: &Session,
        configuration: &ProfilerConfiguration,
    ) -> Result<ProfilingStartResponse> {
        match self.client(session) {
            Some(client) => Ok(client.start_profiling_app(session, configuration)?),
            None => Ok(ProfilingStartResponse::default()),
        }
    }

    /// Forward the stop; a successful capture is persisted before returning
    pub fn stop_profiling_app(
        &self,
        session: &Session,
        profiler_type: CpuProfilerType,
    ) -> Result<ProfilingStopResponse> {
        let Some(client) = self.client(session) else {
            return Ok(ProfilingStopResponse::default());
        };
        let response = client.stop_profiling_app(session, profiler_type)?;
        if response.status == ProfilingStatus::Success {
            self.table
                .insert_trace_with_info(session, &response.trace_info, &response.trace)?;
            info!(
                session_id = session.session_id,
                trace_id = response.trace_info.trace_id,
                bytes = response.trace.len(),
                "trace persisted"
            );
        }
        Ok(response)
    }

    /// Last profiling state recorded by the poller
    pub fn check_app_profiling_state(&self, session: &Session) -> Result<ProfilingStateResponse> {
        Ok(self.table.get_profiling_state(session)?.unwrap_or_default())
    }

    pub fn get_trace(&self, session: &Session, trace_id: i64) -> Result<TraceResponse> {
        Ok(match self.table.get_trace(session, trace_id)? {
            Some((data, profiler_type, profiler_mode)) => TraceResponse {
                status: DumpStatus::Success,
                data,
                profiler_type,
                profiler_mode,
            },
            None => TraceResponse::default(),
        })
    }

    /// Store a trace captured outside of `stop_profiling_app`, e.g. imported
    pub fn insert_trace(&self, session: &Session, info: &TraceInfo, data: &[u8]) -> Result<()> {
        Ok(self.table.insert_trace_with_info(session, info, data)?)
    }
}

impl BackingStore for CpuService {
    fn backing_namespaces(&self) -> Vec<BackingNamespace> {
        vec![BackingNamespace::DEFAULT_SHARED]
    }

    fn attach_storage(
        &self,
        namespace: &BackingNamespace,
        conn: &SharedConnection,
    ) -> std::result::Result<(), StorageError> {
        if *namespace == BackingNamespace::DEFAULT_SHARED {
            self.table.initialize(conn)?;
        }
        Ok(())
    }
}

impl DomainService for CpuService {
    fn domain(&self) -> Domain {
        Domain::Cpu
    }

    fn on_device_disconnected(&self, device: DeviceId) -> usize {
        self.runners.stop_device(device)
    }

    fn shutdown(&self) -> usize {
        self.runners.stop_all()
    }
}
