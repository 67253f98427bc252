use std::sync::Arc;

use tracing::{debug, info};

use super::{BackingStore, DomainService, ResponseCache, RunnerSet, ServiceSettings};
use crate::Result;
use crate::client::MemoryClient;
use crate::error::StorageError;
use crate::executor::FetchExecutor;
use crate::poller::{
    JvmtiPoller, MemoryStatsPoller, NativeSymbolizer, PollRunner, Poller, SymbolPoller,
};
use crate::registry::ClientRegistry;
use crate::storage::{
    BackingNamespace, LegacyAllocationRow, LiveAllocationTable, MemoryStatsTable,
    SharedConnection,
};
use crate::types::memory::{
    AllocationContextsResponse, AllocationsInfo, AllocationsStatus, BatchAllocationSample,
    BatchJniGlobalRefEvent, DumpDataResponse, ForceGarbageCollectionResponse, HeapDumpInfo, JvmtiDataResponse,
    LatestAllocationTimeResponse, LegacyAllocationEvent, LegacyAllocationEventsResponse,
    ListHeapDumpInfosResponse, MemoryData, NativeCallStack, SetSamplingRateResponse,
    StackFrameInfoResponse, TrackAllocationsResponse, TrackAllocationsStatus, TriggerHeapDumpResponse,
    TriggerHeapDumpStatus,
};
use crate::types::{DeviceId, Domain, DumpStatus, MonitoringResponse, Session, TimeRange};

/// Memory statistics, heap dumps, and allocation tracking.
///
/// Stats and artifacts live in the shared namespace; the live allocation
/// stream gets its own performant namespace.
pub struct MemoryService {
    registry: Arc<ClientRegistry>,
    executor: Arc<dyn FetchExecutor>,
    settings: ServiceSettings,
    symbolizer: Arc<dyn NativeSymbolizer>,
    stats: Arc<MemoryStatsTable>,
    live: Arc<LiveAllocationTable>,
    runners: RunnerSet<Session>,
    cache: ResponseCache<MemoryData>,
}

impl std::fmt::Debug for MemoryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryService")
            .field("monitored_sessions", &self.runners.len())
            .finish_non_exhaustive()
    }
}

impl MemoryService {
    #[must_use]
    pub fn new(
        registry: Arc<ClientRegistry>,
        executor: Arc<dyn FetchExecutor>,
        settings: ServiceSettings,
        symbolizer: Arc<dyn NativeSymbolizer>,
    ) -> Self {
        Self {
            registry,
            executor,
            settings,
            symbolizer,
            stats: Arc::new(MemoryStatsTable::new()),
            live: Arc::new(LiveAllocationTable::new()),
            runners: RunnerSet::new(Domain::Memory),
            cache: ResponseCache::new(settings.cache_capacity),
        }
    }

    #[must_use]
    pub fn stats_table(&self) -> &MemoryStatsTable {
        &self.stats
    }

    #[must_use]
    pub fn live_table(&self) -> &LiveAllocationTable {
        &self.live
    }

    #[must_use]
    pub fn response_cache(&self) -> &ResponseCache<MemoryData> {
        &self.cache
    }

    #[must_use]
    pub fn active_runner_count(&self, session: &Session) -> usize {
        self.runners.runner_count(session)
    }

    #[must_use]
    pub fn monitored_session_count(&self) -> usize {
        self.runners.len()
    }

    fn client(&self, session: &Session) -> Option<Arc<dyn MemoryClient>> {
        self.registry.memory_client(session.device())
    }

    fn build_runners(&self, session: &Session, client: &Arc<dyn MemoryClient>) -> Vec<Arc<PollRunner>> {
        let runner = |poller: Box<dyn Poller>| {
            PollRunner::new(
                poller,
                self.settings.poll,
                session.device(),
                Some(session.session_id),
            )
        };
        vec![
            runner(Box::new(MemoryStatsPoller::new(
                *session,
                Arc::clone(client),
                Arc::clone(&self.stats),
            ))),
            runner(Box::new(JvmtiPoller::new(
                *session,
                Arc::clone(client),
                Arc::clone(&self.live),
            ))),
            runner(Box::new(SymbolPoller::new(
                *session,
                Arc::clone(&self.symbolizer),
                Arc::clone(&self.live),
            ))),
        ]
    }

    pub fn start_monitoring_app(&self, session: &Session) -> Result<MonitoringResponse> {
        let Some((generation, channel)) = self.registry.lookup(session.device()) else {
            debug!(session_id = session.session_id, device_id = %session.device(), "memory start ignored: device not connected");
            return Ok(MonitoringResponse::default());
        };
        let client = channel.memory;
        let response = client.start_monitoring_app(session)?;

        let started = self.runners.start_bound(
            *session,
            session.device(),
            &self.registry,
            generation,
            || self.build_runners(session, &client),
        );
        if let Some(runners) = started {
            info!(
                domain = %Domain::Memory,
                session_id = session.session_id,
                device_id = %session.device(),
                status = ?response.status,
                runners = runners.len(),
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
            info!(domain = %Domain::Memory, session_id = session.session_id, runners = stopped, "monitoring stopped");
        }
        match self.client(session) {
            Some(client) => Ok(client.stop_monitoring_app(session)?),
            None => Ok(MonitoringResponse::default()),
        }
    }

    /// Samples and artifact descriptors in `(start, end]`
    pub fn get_data(&self, session: &Session, range: TimeRange) -> Result<MemoryData> {
        Ok(self
            .cache
            .get_or_try_insert_with(session, range, || self.stats.get_data(session, range))?)
    }

    /// Allocation sampling-rate changes in `(start, end]`
    pub fn get_jvmti_data(&self, session: &Session, range: TimeRange) -> Result<JvmtiDataResponse> {
        Ok(JvmtiDataResponse {
            sampling_rate_events: self.live.get_sampling_rate_events(session, range)?,
        })
    }

    /// Ask the device for a heap dump; its descriptor is stored as not ready
    /// before returning
    pub fn trigger_heap_dump(
        &self,
        session: &Session,
        request_time: i64,
    ) -> Result<TriggerHeapDumpResponse> {
        let Some(client) = self.client(session) else {
            return Ok(TriggerHeapDumpResponse::default());
        };
        let response = client.trigger_heap_dump(session, request_time)?;
        if response.status == TriggerHeapDumpStatus::Success {
            self.stats.insert_or_replace_heap_info(session, &response.info)?;
            info!(session_id = session.session_id, start_time = response.info.start_time, "heap dump triggered");
        }
        Ok(response)
    }

    pub fn get_heap_dump(&self, session: &Session, dump_time: i64) -> Result<DumpDataResponse> {
        Ok(self.stats.get_heap_dump(session, dump_time)?)
    }

    pub fn list_heap_dump_infos(
        &self,
        session: &Session,
        range: TimeRange,
    ) -> Result<ListHeapDumpInfosResponse> {
        Ok(ListHeapDumpInfosResponse {
            infos: self.stats.get_heap_dump_infos(session, range)?,
        })
    }

    /// Store a dump loaded from a file; it is immediately readable
    pub fn import_heap_dump(&self, session: &Session, info: &HeapDumpInfo, data: &[u8]) -> Result<()> {
        Ok(self.stats.import_heap_dump(session, info, data)?)
    }

    /// Toggle allocation tracking; the descriptor of a successful enable is
    /// stored
    pub fn track_allocations(
        &self,
        session: &Session,
        enabled: bool,
        request_time: i64,
    ) -> Result<TrackAllocationsResponse> {
        let Some(client) = self.client(session) else {
            return Ok(TrackAllocationsResponse::default());
        };
        let response = client.track_allocations(session, enabled, request_time)?;
        if enabled && response.status == TrackAllocationsStatus::Success {
            self.stats
                .insert_or_replace_allocations_info(session, &response.info)?;
        }
        Ok(response)
    }

    pub fn import_legacy_allocations(
        &self,
        session: &Session,
        info: &AllocationsInfo,
        contexts: &AllocationContextsResponse,
        events: &[LegacyAllocationEvent],
        dump: &[u8],
    ) -> Result<()> {
        Ok(self
            .stats
            .import_legacy_allocations(session, info, contexts, events, dump)?)
    }

    pub fn get_legacy_allocation_contexts(
        &self,
        session: &Session,
        class_ids: &[i32],
        stack_ids: &[i64],
    ) -> Result<AllocationContextsResponse> {
        Ok(self
            .stats
            .get_legacy_allocation_contexts(session, class_ids, stack_ids)?)
    }

    /// Readiness of a legacy tracking window's artifacts.
    ///
    /// Missing window is `NotFound`; a failed or non-legacy window is
    /// `FailureUnknown`; a window whose artifact has not arrived is `NotReady`.
    fn legacy_status(row: Option<&LegacyAllocationRow>, has_artifact: bool) -> DumpStatus {
        match row {
            None => DumpStatus::NotFound,
            Some(row) if row.info.status == AllocationsStatus::FailureUnknown || !row.info.legacy => {
                DumpStatus::FailureUnknown
            }
            Some(_) if !has_artifact => DumpStatus::NotReady,
            Some(_) => DumpStatus::Success,
        }
    }

    pub fn get_legacy_allocation_events(
        &self,
        session: &Session,
        start_time: i64,
    ) -> Result<LegacyAllocationEventsResponse> {
        let row = self.stats.get_legacy_allocations(session, start_time)?;
        let has_events = row.as_ref().is_some_and(|r| r.events.is_some());
        let status = Self::legacy_status(row.as_ref(), has_events);
        let events = match (status, row) {
            (DumpStatus::Success, Some(row)) => row.events.unwrap_or_default(),
            _ => Vec::new(),
        };
        Ok(LegacyAllocationEventsResponse { status, events })
    }

    pub fn get_legacy_allocation_dump(
        &self,
        session: &Session,
        start_time: i64,
    ) -> Result<DumpDataResponse> {
        let row = self.stats.get_legacy_allocations(session, start_time)?;
        let has_dump = row.as_ref().is_some_and(|r| r.dump.is_some());
        let status = Self::legacy_status(row.as_ref(), has_dump);
        let data = match (status, row) {
            (DumpStatus::Success, Some(row)) => row.dump.unwrap_or_default(),
            _ => Vec::new(),
        };
        Ok(DumpDataResponse { status, data })
    }

    /// Allocation events in `(start, end]`, or with `live_only` the objects
    /// still alive at `range.end`
    pub fn get_allocations(
        &self,
        session: &Session,
        range: TimeRange,
        live_only: bool,
    ) -> Result<BatchAllocationSample> {
        let sample = if live_only {
            self.live.get_live_snapshot(session, range.end)?
        } else {
            self.live.get_allocations(session, range)?
        };
        Ok(sample)
    }

    /// JNI global reference events in `[start, end)`, or with `live_only`
    /// the creations still alive at `range.end`
    pub fn get_jni_global_refs_events(
        &self,
        session: &Session,
        range: TimeRange,
        live_only: bool,
    ) -> Result<BatchJniGlobalRefEvent> {
        let batch = if live_only {
            self.live.get_jni_ref_snapshot(session, range.end)?
        } else {
            self.live.get_jni_ref_events(session, range)?
        };
        Ok(batch)
    }

    pub fn get_stack_frame_info(&self, session: &Session, method_id: i64) -> Result<StackFrameInfoResponse> {
        Ok(self.live.get_stack_frame_info(session, method_id)?)
    }

    pub fn get_latest_allocation_time(&self, session: &Session) -> Result<LatestAllocationTimeResponse> {
        Ok(LatestAllocationTimeResponse {
            timestamp: self.live.get_latest_allocation_time(session)?,
        })
    }

    pub fn get_allocation_contexts(
        &self,
        session: &Session,
        range: TimeRange,
    ) -> Result<AllocationContextsResponse> {
        Ok(self.live.get_allocation_contexts(session, range)?)
    }

    /// Stored frames for `addresses`, symbolized where the resolver has run
    pub fn resolve_native_backtrace(&self, session: &Session, addresses: &[i64]) -> Result<NativeCallStack> {
        Ok(self.live.get_native_frames(session, addresses)?)
    }

    pub fn force_garbage_collection(&self, session: &Session) -> Result<ForceGarbageCollectionResponse> {
        match self.client(session) {
            Some(client) => Ok(client.force_garbage_collection(session)?),
            None => Ok(ForceGarbageCollectionResponse::default()),
        }
    }

    pub fn set_allocation_sampling_rate(
        &self,
        session: &Session,
        sampling_num_interval: i32,
    ) -> Result<SetSamplingRateResponse> {
        match self.client(session) {
            Some(client) => Ok(client.set_allocation_sampling_rate(session, sampling_num_interval)?),
            None => Ok(SetSamplingRateResponse::default()),
        }
    }
}

impl BackingStore for MemoryService {
    fn backing_namespaces(&self) -> Vec<BackingNamespace> {
        vec![BackingNamespace::DEFAULT_SHARED, BackingNamespace::LIVE_ALLOCATIONS]
    }

    fn attach_storage(
        &self,
        namespace: &BackingNamespace,
        conn: &SharedConnection,
    ) -> std::result::Result<(), StorageError> {
        if *namespace == BackingNamespace::DEFAULT_SHARED {
            self.stats.initialize(conn)?;
        } else if *namespace == BackingNamespace::LIVE_ALLOCATIONS {
            self.live.initialize(conn)?;
        }
        Ok(())
    }
}

impl DomainService for MemoryService {
    fn domain(&self) -> Domain {
        Domain::Memory
    }

    fn on_device_disconnected(&self, device: DeviceId) -> usize {
        self.runners.stop_device(device)
    }

    fn shutdown(&self) -> usize {
        self.runners.stop_all()
    }
}
