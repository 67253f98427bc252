use std::sync::Arc;

use tracing::{debug, info};

use super::{BackingStore, DomainService, ResponseCache, RunnerSet, ServiceSettings};
use crate::Result;
use crate::client::EventClient;
use crate::error::StorageError;
use crate::executor::FetchExecutor;
use crate::poller::{EventPoller, PollRunner};
use crate::registry::ClientRegistry;
use crate::storage::{BackingNamespace, EventTable, SharedConnection};
use crate::types::event::{ActivityDataResponse, SystemDataResponse};
use crate::types::{DeviceId, Domain, MonitoringResponse, Session, TimeRange};

pub struct EventService {
    registry: Arc<ClientRegistry>,
    executor: Arc<dyn FetchExecutor>,
    settings: ServiceSettings,
    table: Arc<EventTable>,
    runners: RunnerSet<Session>,
    cache: ResponseCache<ActivityDataResponse>,
}

impl std::fmt::Debug for EventService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventService")
            .field("monitored_sessions", &self.runners.len())
            .finish_non_exhaustive()
    }
}

impl EventService {
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
            table: Arc::new(EventTable::new()),
            runners: RunnerSet::new(Domain::Event),
            cache: ResponseCache::new(settings.cache_capacity),
        }
    }

    #[must_use]
    pub fn table(&self) -> &EventTable {
        &self.table
    }

    #[must_use]
    pub fn response_cache(&self) -> &ResponseCache<ActivityDataResponse> {
        &self.cache
    }

    #[must_use]
    pub fn active_runner_count(&self, session: &Session) -> usize {
        self.runners.runner_count(session)
    }

    fn client(&self, session: &Session) -> Option<Arc<dyn EventClient>> {
        self.registry.event_client(session.device())
    }

    pub fn start_monitoring_app(&self, session: &Session) -> Result<MonitoringResponse> {
        let Some((generation, channel)) = self.registry.lookup(session.device()) else {
            debug!(session_id = session.session_id, device_id = %session.device(), "event start ignored: device not connected");
            return Ok(MonitoringResponse::default());
        };
        let client = channel.event;
        let response = client.start_monitoring_app(session)?;

        let started = self.runners.start_bound(*session, session.device(), &self.registry, generation, || {
            vec![PollRunner::new(
                Box::new(EventPoller::new(*session, client, Arc::clone(&self.table))),
                self.settings.poll,
                session.device(),
                Some(session.session_id),
            )]
        });
        if let Some(runners) = started {
            info!(
                domain = %Domain::Event,
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
            info!(domain = %Domain::Event, session_id = session.session_id, runners = stopped, "monitoring stopped");
        }
        match self.client(session) {
            Some(client) => Ok(client.stop_monitoring_app(session)?),
            None => Ok(MonitoringResponse::default()),
        }
    }

    /// Activities alive during `(start, end]`; cached like every `get_data`
    pub fn get_activity_data(
        &self,
        session: &Session,
        range: TimeRange,
    ) -> Result<ActivityDataResponse> {
        Ok(self.cache.get_or_try_insert_with(session, range, || {
            Ok::<_, StorageError>(ActivityDataResponse {
                data: self.table.get_activity_data(session, range)?,
            })
        })?)
    }

    pub fn get_system_data(&self, session: &Session, range: TimeRange) -> Result<SystemDataResponse> {
        Ok(SystemDataResponse {
            data: self.table.get_system_data(session, range)?,
        })
    }
}

impl BackingStore for EventService {
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

impl DomainService for EventService {
    fn domain(&self) -> Domain {
        Domain::Event
    }

    fn on_device_disconnected(&self, device: DeviceId) -> usize {
        self.runners.stop_device(device)
    }

    fn shutdown(&self) -> usize {
        self.runners.stop_all()
    }
}
