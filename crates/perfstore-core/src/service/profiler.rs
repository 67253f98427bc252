use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use super::{BackingStore, DomainService, RunnerSet, ServiceSettings};
use crate::Result;
use crate::client::ProfilerClient;
use crate::error::StorageError;
use crate::executor::FetchExecutor;
use crate::poller::{DevicePoller, PollRunner, UnifiedEventsPoller};
use crate::registry::ClientRegistry;
use crate::storage::{BackingNamespace, ProfilerTable, SharedConnection, UnifiedEventTable};
use crate::types::profiler::{
    AgentData, BeginSessionRequest, BeginSessionResponse, BytesResponse,
    ConfigureStartupAgentRequest, ConfigureStartupAgentResponse, EndSessionResponse,
    GetDevicesResponse, GetProcessesResponse, GetSessionsResponse, ImportSessionRequest,
    SessionMetaData, SessionType, TimeResponse, VersionResponse,
};
use crate::types::stream::{
    Command, DATASTORE_RESERVED_STREAM_ID, EventKind, EventPayload, ExecuteResponse,
    GetEventGroupsRequest, GetEventGroupsResponse, Stream, UnifiedEvent,
};
use crate::types::{DeviceId, Domain, Session, UNSPECIFIED_END};

struct StreamEntry {
    stream: Stream,
    client: Arc<dyn ProfilerClient>,
}

/// Devices, processes, and the session catalogue.
///
/// Unlike the telemetry services, runners here are per device: one device
/// poller keeps the process list fresh for as long as the device is
/// connected.
///
/// The service also owns the unified event pipeline. Each connected stream
/// gets one events poller, and commands addressed to a stream id are routed
/// to that stream's client.
pub struct ProfilerService {
    registry: Arc<ClientRegistry>,
    executor: Arc<dyn FetchExecutor>,
    settings: ServiceSettings,
    table: Arc<ProfilerTable>,
    runners: RunnerSet<DeviceId>,
    events: Arc<UnifiedEventTable>,
    // Held across the whole connect and disconnect of a stream.
    streams: Mutex<HashMap<i64, StreamEntry>>,
    stream_runners: RunnerSet<i64>,
    last_event_time: AtomicI64,
}

impl std::fmt::Debug for ProfilerService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProfilerService")
            .field("monitored_devices", &self.runners.len())
            .field("polled_streams", &self.stream_runners.len())
            .finish_non_exhaustive()
    }
}

impl ProfilerService {
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
            table: Arc::new(ProfilerTable::new()),
            runners: RunnerSet::new(Domain::Profiler),
            events: Arc::new(UnifiedEventTable::new()),
            streams: Mutex::new(HashMap::new()),
            stream_runners: RunnerSet::new(Domain::Profiler),
            last_event_time: AtomicI64::new(0),
        }
    }

    #[must_use]
    pub fn table(&self) -> &ProfilerTable {
        &self.table
    }

    #[must_use]
    pub fn events_table(&self) -> &UnifiedEventTable {
        &self.events
    }

    #[must_use]
    pub fn is_monitoring(&self, device: DeviceId) -> bool {
        self.runners.runner_count(&device) > 0
    }

    fn client(&self, device: DeviceId) -> Option<Arc<dyn ProfilerClient>> {
        self.registry.profiler_client(device)
    }

    fn streams(&self) -> MutexGuard<'_, HashMap<i64, StreamEntry>> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stream_client(&self, stream_id: i64) -> Option<Arc<dyn ProfilerClient>> {
        self.streams()
            .get(&stream_id)
            .map(|entry| Arc::clone(&entry.client))
    }

    /// `id` names a stream if one is connected under it, a device otherwise
    fn routed_client(&self, id: i64) -> Option<Arc<dyn ProfilerClient>> {
        self.stream_client(id).or_else(|| self.client(DeviceId(id)))
    }

    /// Host wall clock in nanoseconds, strictly increasing across calls
    fn next_event_time(&self) -> i64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .ok()
            .and_then(|d| i64::try_from(d.as_nanos()).ok())
            .unwrap_or(0);
        let next = |last: i64| now.max(last.saturating_add(1));
        let previous = self
            .last_event_time
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| Some(next(last)))
            .unwrap_or_else(|last| last);
        next(previous)
    }

    fn record_stream_event(&self, payload: EventPayload, stream: Stream, is_ended: bool) -> Result<()> {
        let event = UnifiedEvent {
            kind: EventKind::Stream,
            group_id: stream.stream_id,
            timestamp: self.next_event_time(),
            is_ended,
            payload,
            ..UnifiedEvent::default()
        };
        self.events.insert_event(DATASTORE_RESERVED_STREAM_ID, &event)?;
        Ok(())
    }

    #[must_use]
    pub fn is_polling_stream(&self, stream_id: i64) -> bool {
        self.stream_runners.runner_count(&stream_id) > 0
    }

    /// Map `stream` to `client`, record that it connected, and start polling
    /// its events.
    ///
    /// False when the stream is already polled or uses the reserved id.
    pub fn start_polling(&self, stream: Stream, client: Arc<dyn ProfilerClient>) -> Result<bool> {
        if stream.stream_id == DATASTORE_RESERVED_STREAM_ID {
            warn!(stream_id = stream.stream_id, "refusing to poll the reserved stream id");
            return Ok(false);
        }
        let device = DeviceId(stream.device_id);
        let mut streams = self.streams();
        if streams.contains_key(&stream.stream_id) {
            debug!(stream_id = stream.stream_id, "stream already polled");
            return Ok(false);
        }
        self.record_stream_event(EventPayload::StreamConnected(stream), stream, false)?;
        let poller_client = Arc::clone(&client);
        let runners = self.stream_runners.start_if_absent(stream.stream_id, device, || {
            vec![PollRunner::new(
                Box::new(UnifiedEventsPoller::new(
                    stream.stream_id,
                    poller_client,
                    Arc::clone(&self.events),
                )),
                self.settings.poll,
                device,
                None,
            )]
        });
        streams.insert(stream.stream_id, StreamEntry { stream, client });
        drop(streams);

        for runner in runners.into_iter().flatten() {
            self.executor.submit(runner);
        }
        info!(stream_id = stream.stream_id, device_id = %device, "stream polling started");
        Ok(true)
    }

    /// Forget a stream and stop its poller, then record the disconnect.
    /// The runner count is returned even when recording fails.
    fn close_stream(&self, stream_id: i64) -> (usize, Result<()>) {
        let mut streams = self.streams();
        let Some(entry) = streams.remove(&stream_id) else {
            return (0, Ok(()));
        };
        let stopped = self.stream_runners.stop(&stream_id);
        let recorded =
            self.record_stream_event(EventPayload::StreamDisconnected(entry.stream), entry.stream, true);
        info!(stream_id, runners = stopped, "stream polling stopped");
        (stopped, recorded)
    }

    /// Stop polling a stream and record that it disconnected; 0 when the
    /// stream was not polled
    pub fn stop_polling(&self, stream_id: i64) -> Result<usize> {
        let (stopped, recorded) = self.close_stream(stream_id);
        recorded?;
        Ok(stopped)
    }

    fn stop_device_streams(&self, device: DeviceId) -> usize {
        let ids: Vec<i64> = self
            .streams()
            .values()
            .filter(|entry| entry.stream.device_id == device.0)
            .map(|entry| entry.stream.stream_id)
            .collect();
        ids.into_iter()
            .map(|stream_id| {
                let (stopped, recorded) = self.close_stream(stream_id);
                if let Err(err) = recorded {
                    warn!(stream_id, error = %err, "failed to record stream disconnect");
                }
                stopped
            })
            .sum()
    }

    /// Forward a command to the stream it names; the default response when
    /// no such stream is connected
    pub fn execute(&self, command: &Command) -> Result<ExecuteResponse> {
        match self.stream_client(command.stream_id) {
            Some(client) => Ok(client.execute(command)?),
            None => {
                debug!(stream_id = command.stream_id, kind = ?command.kind, "command for unknown stream dropped");
                Ok(ExecuteResponse::default())
            }
        }
    }

    pub fn get_event_groups(&self, request: &GetEventGroupsRequest) -> Result<GetEventGroupsResponse> {
        Ok(GetEventGroupsResponse {
            groups: self.events.get_event_groups(request)?,
        })
    }

    /// Ask the agent for the launch arguments that attach it at startup
    pub fn configure_startup_agent(
        &self,
        request: &ConfigureStartupAgentRequest,
    ) -> Result<ConfigureStartupAgentResponse> {
        match self.routed_client(request.device_id) {
            Some(client) => Ok(client.configure_startup_agent(request)?),
            None => Ok(ConfigureStartupAgentResponse::default()),
        }
    }

    /// Start the device poller; false when the device is not connected or is
    /// already being polled
    pub fn start_monitoring(&self, device: DeviceId) -> bool {
        let Some((generation, channel)) = self.registry.lookup(device) else {
            debug!(device_id = %device, "device poller not started: device not connected");
            return false;
        };
        let client = channel.profiler;
        let started = self.runners.start_bound(device, device, &self.registry, generation, || {
            vec![PollRunner::new(
                Box::new(DevicePoller::new(device, client, Arc::clone(&self.table))),
                self.settings.poll,
                device,
                None,
            )]
        });
        match started {
            Some(runners) => {
                info!(domain = %Domain::Profiler, device_id = %device, "device polling started");
                for runner in runners {
                    self.executor.submit(runner);
                }
                true
            }
            None => false,
        }
    }

    /// Stop the device poller and record the device as disconnected
    pub fn stop_monitoring(&self, device: DeviceId) -> Result<usize> {
        let stopped = self.runners.stop(&device);
        self.table.set_device_disconnected(device)?;
        info!(domain = %Domain::Profiler, device_id = %device, runners = stopped, "device polling stopped");
        Ok(stopped)
    }

    pub fn get_current_time(&self, device: DeviceId) -> Result<TimeResponse> {
        match self.routed_client(device.0) {
            Some(client) => Ok(client.get_current_time(device)?),
            None => Ok(TimeResponse::default()),
        }
    }

    pub fn get_version(&self, device: DeviceId) -> Result<VersionResponse> {
        match self.routed_client(device.0) {
            Some(client) => Ok(client.get_version(device)?),
            None => Ok(VersionResponse::default()),
        }
    }

    /// Every device ever seen, connected or not
    pub fn get_devices(&self) -> Result<GetDevicesResponse> {
        Ok(GetDevicesResponse {
            devices: self.table.get_devices()?,
        })
    }

    pub fn get_processes(&self, device: DeviceId) -> Result<GetProcessesResponse> {
        Ok(GetProcessesResponse {
            processes: self.table.get_processes(device)?,
        })
    }

    pub fn get_agent_status(&self, device: DeviceId, pid: i32) -> Result<AgentData> {
        Ok(AgentData {
            status: self.table.get_agent_status(device, pid)?,
        })
    }

    /// Forward to the device and record the new session with its metadata
    pub fn begin_session(&self, request: &BeginSessionRequest) -> Result<BeginSessionResponse> {
        let device = DeviceId(request.device_id);
        let Some(client) = self.client(device) else {
            return Ok(BeginSessionResponse::default());
        };
        let response = client.begin_session(request)?;
        let session = response.session;

        let process_abi = self
            .table
            .get_processes(device)?
            .into_iter()
            .find(|p| p.pid == request.pid)
            .map(|p| p.abi_cpu_arch)
            .unwrap_or_default();
        let meta = SessionMetaData {
            session_id: session.session_id,
            session_name: request.session_name.clone(),
            start_timestamp_epoch_ms: request.request_time_epoch_ms,
            process_abi,
            jvmti_enabled: request.jvmti_enabled,
            live_allocation_enabled: request.live_allocation_enabled,
            session_type: SessionType::Full,
        };
        self.table.insert_or_update_session(&session, &meta)?;
        info!(session_id = session.session_id, device_id = %device, pid = session.pid, "session started");
        Ok(response)
    }

    /// End a session. If the device is gone, the session ends at the last
    /// device time the poller saw.
    pub fn end_session(&self, device: DeviceId, session_id: i64) -> Result<EndSessionResponse> {
        if let Some(client) = self.client(device) {
            let response = client.end_session(device, session_id)?;
            self.table
                .update_session_end(session_id, response.session.end_timestamp)?;
            info!(session_id, device_id = %device, "session ended");
            return Ok(response);
        }

        let Some(mut session) = self.table.get_session(session_id)? else {
            return Ok(EndSessionResponse::default());
        };
        if session.end_timestamp == UNSPECIFIED_END {
            let last_known = self.table.get_device_last_known_time(device)?;
            session.end_timestamp = last_known.unwrap_or(session.start_timestamp).max(session.start_timestamp);
            self.table.update_session_end(session_id, session.end_timestamp)?;
            info!(session_id, device_id = %device, end = session.end_timestamp, "session ended offline");
        }
        Ok(EndSessionResponse { session })
    }

    pub fn get_sessions(&self) -> Result<GetSessionsResponse> {
        Ok(GetSessionsResponse {
            sessions: self.table.get_sessions()?,
        })
    }

    pub fn get_session_by_id(&self, session_id: i64) -> Result<Option<Session>> {
        Ok(self.table.get_session(session_id)?)
    }

    /// Stored metadata, or the default when the session is unknown
    pub fn get_session_meta_data(&self, session_id: i64) -> Result<SessionMetaData> {
        Ok(self.table.get_session_meta(session_id)?.unwrap_or_default())
    }

    pub fn delete_session(&self, session_id: i64) -> Result<bool> {
        let removed = self.table.delete_session(session_id)?;
        if removed {
            info!(session_id, "session deleted");
        }
        Ok(removed)
    }

    /// Record a capture loaded from a file as an already-ended session
    pub fn import_session(&self, request: &ImportSessionRequest) -> Result<()> {
        let session = request.session;
        let meta = SessionMetaData {
            session_id: session.session_id,
            session_name: request.session_name.clone(),
            start_timestamp_epoch_ms: request.start_timestamp_epoch_ms,
            session_type: request.session_type,
            ..SessionMetaData::default()
        };
        self.table.insert_or_update_session(&session, &meta)?;
        info!(session_id = session.session_id, session_type = ?request.session_type, "session imported");
        Ok(())
    }

    /// Opaque bytes stored under `id`; fetched from the device and kept on a
    /// miss
    pub fn get_bytes(&self, session: &Session, id: &str) -> Result<BytesResponse> {
        if let Some(contents) = self.table.get_bytes(session.session_id, id)? {
            return Ok(BytesResponse { contents });
        }
        let Some(client) = self.client(session.device()) else {
            return Ok(BytesResponse::default());
        };
        let contents = client.get_bytes(session, id)?;
        if !contents.is_empty() {
            self.table.insert_bytes(session.session_id, id, &contents)?;
        }
        Ok(BytesResponse { contents })
    }
}

impl BackingStore for ProfilerService {
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
            self.events.initialize(conn)?;
        }
        Ok(())
    }
}

impl DomainService for ProfilerService {
    fn domain(&self) -> Domain {
        Domain::Profiler
    }

    fn on_device_disconnected(&self, device: DeviceId) -> usize {
        let stopped = self.runners.stop_device(device) + self.stop_device_streams(device);
        if let Err(err) = self.table.set_device_disconnected(device) {
            warn!(device_id = %device, error = %err, "failed to record device disconnect");
        }
        stopped
    }

    fn shutdown(&self) -> usize {
        self.streams().clear();
        self.runners.stop_all() + self.stream_runners.stop_all()
    }
}
