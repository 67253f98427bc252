//! The datastore: owns the services, wires their storage, and reacts to
//! devices coming and going.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{info, instrument};

use crate::Result;
use crate::client::{DeviceChannel, ProfilerClient};
use crate::config::Config;
use crate::executor::FetchExecutor;
use crate::poller::{NativeSymbolizer, NopSymbolizer};
use crate::registry::ClientRegistry;
use crate::service::{
    CpuService, DomainService, EventService, MemoryService, ProfilerService, ServiceSettings,
};
use crate::storage::{BackingNamespace, ConnectionProvider};
use crate::types::DeviceId;
use crate::types::stream::Stream;

pub struct DataStore {
    registry: Arc<ClientRegistry>,
    cpu: CpuService,
    memory: MemoryService,
    event: EventService,
    profiler: ProfilerService,
}

impl std::fmt::Debug for DataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataStore")
            .field("connected_devices", &self.registry.devices())
            .finish_non_exhaustive()
    }
}

impl DataStore {
    /// Build every service and attach the namespaces they ask for.
    ///
    /// Fails if a namespace cannot be opened or a schema cannot be created.
    pub fn new(
        config: &Config,
        connections: &dyn ConnectionProvider,
        executor: Arc<dyn FetchExecutor>,
    ) -> Result<Self> {
        Self::with_symbolizer(config, connections, executor, Arc::new(NopSymbolizer))
    }

    pub fn with_symbolizer(
        config: &Config,
        connections: &dyn ConnectionProvider,
        executor: Arc<dyn FetchExecutor>,
        symbolizer: Arc<dyn NativeSymbolizer>,
    ) -> Result<Self> {
        let settings = ServiceSettings::from_config(config);
        let registry = Arc::new(ClientRegistry::new());
        let store = Self {
            cpu: CpuService::new(Arc::clone(&registry), Arc::clone(&executor), settings),
            memory: MemoryService::new(
                Arc::clone(&registry),
                Arc::clone(&executor),
                settings,
                symbolizer,
            ),
            event: EventService::new(Arc::clone(&registry), Arc::clone(&executor), settings),
            profiler: ProfilerService::new(Arc::clone(&registry), executor, settings),
            registry,
        };
        store.attach_storage(connections)?;
        Ok(store)
    }

    fn services(&self) -> [&dyn DomainService; 4] {
        [&self.profiler, &self.cpu, &self.memory, &self.event]
    }

    fn attach_storage(&self, connections: &dyn ConnectionProvider) -> Result<()> {
        let mut opened: BTreeSet<&'static str> = BTreeSet::new();
        for service in self.services() {
            for namespace in service.backing_namespaces() {
                let conn = connections.connection(&namespace)?;
                service.attach_storage(&namespace, &conn)?;
                opened.insert(namespace.name);
            }
        }
        info!(namespaces = ?opened, "datastore storage attached");
        Ok(())
    }

    /// Register a device's clients and start polling it.
    ///
    /// A reconnect replaces the old channel and stops runners bound to it.
    #[instrument(skip(self, channel), fields(device_id = %device))]
    pub fn on_device_connected(&self, device: DeviceId, channel: DeviceChannel) {
        if self.registry.insert(device, channel).is_some() {
            let stopped: usize = self
                .services()
                .iter()
                .map(|s| s.on_device_disconnected(device))
                .sum();
            info!(runners = stopped, "replaced existing device channel");
        }
        self.profiler.start_monitoring(device);
    }

    /// Forget a device and stop every runner polling it, in every domain.
    ///
    /// Stored telemetry stays readable.
    #[instrument(skip(self), fields(device_id = %device))]
    pub fn on_device_disconnected(&self, device: DeviceId) -> usize {
        self.registry.remove(device);
        let stopped = self
            .services()
            .iter()
            .map(|s| s.on_device_disconnected(device))
            .sum();
        info!(runners = stopped, "device disconnected");
        stopped
    }

    /// Start polling a unified event stream through `client`
    #[instrument(skip(self, stream, client), fields(stream_id = stream.stream_id, device_id = stream.device_id))]
    pub fn on_stream_connected(&self, stream: Stream, client: Arc<dyn ProfilerClient>) -> Result<bool> {
        self.profiler.start_polling(stream, client)
    }

    #[instrument(skip(self))]
    pub fn on_stream_disconnected(&self, stream_id: i64) -> Result<usize> {
        self.profiler.stop_polling(stream_id)
    }

    /// Stop every runner of every service
    pub fn shutdown(&self) -> usize {
        let stopped = self.services().iter().map(|s| s.shutdown()).sum();
        info!(runners = stopped, "datastore shut down");
        stopped
    }

    #[must_use]
    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    #[must_use]
    pub fn connected_devices(&self) -> Vec<DeviceId> {
        self.registry.devices()
    }

    #[must_use]
    pub fn cpu(&self) -> &CpuService {
        &self.cpu
    }

    #[must_use]
    pub fn memory(&self) -> &MemoryService {
        &self.memory
    }

    #[must_use]
    pub fn event(&self) -> &EventService {
        &self.event
    }

    #[must_use]
    pub fn profiler(&self) -> &ProfilerService {
        &self.profiler
    }

    /// Namespaces some service stores data in
    #[must_use]
    pub fn namespaces(&self) -> Vec<BackingNamespace> {
        let mut all: Vec<BackingNamespace> = Vec::new();
        for service in self.services() {
            for namespace in service.backing_namespaces() {
                if !all.contains(&namespace) {
                    all.push(namespace);
                }
            }
        }
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ManualExecutor;
    use crate::storage::InMemoryConnectionProvider;

    #[test]
    fn setup_attaches_every_table() {
        let provider = InMemoryConnectionProvider::new();
        let store = DataStore::new(
            &Config::default(),
            &provider,
            Arc::new(ManualExecutor::new()),
        )
        .unwrap();
        assert_eq!(
            store.namespaces(),
            vec![BackingNamespace::DEFAULT_SHARED, BackingNamespace::LIVE_ALLOCATIONS]
        );
        // Attached tables answer queries instead of reporting NotInitialized.
        assert!(store.profiler().get_sessions().unwrap().sessions.is_empty());
        assert!(store.connected_devices().is_empty());
    }

    #[test]
    fn disconnecting_unknown_device_is_harmless() {
        let provider = InMemoryConnectionProvider::new();
        let store = DataStore::new(
            &Config::default(),
            &provider,
            Arc::new(ManualExecutor::new()),
        )
        .unwrap();
        assert_eq!(store.on_device_disconnected(DeviceId(42)), 0);
        assert_eq!(store.shutdown(), 0);
    }
}
