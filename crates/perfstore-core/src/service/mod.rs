//! Per-domain services: request routing, response caching, runner lifecycle.
//!
//! Every service follows the same shape. Reads of historical data go to the
//! service's tables (through a small response cache for `get_data`); control
//! calls are forwarded to the device when it is connected and answered with a
//! default value when it is not; `start_monitoring_app` registers one runner
//! set per session.

pub mod cpu;
pub mod event;
pub mod memory;
pub mod profiler;

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use lru::LruCache;
use tracing::debug;

use crate::config::Config;
use crate::error::StorageError;
use crate::poller::{PollRunner, PollSettings};
use crate::registry::{ChannelGeneration, ClientRegistry};
use crate::storage::{BackingNamespace, SharedConnection};
use crate::types::{DeviceId, Domain, Session, TimeRange};

pub use cpu::CpuService;
pub use event::EventService;
pub use memory::MemoryService;
pub use profiler::ProfilerService;

/// Storage wiring for a service.
///
/// The datastore asks each service which namespaces it needs, opens them,
/// and hands the connections back before any request is served.
pub trait BackingStore: Send + Sync {
    fn backing_namespaces(&self) -> Vec<BackingNamespace>;

    fn attach_storage(
        &self,
        namespace: &BackingNamespace,
        conn: &SharedConnection,
    ) -> Result<(), StorageError>;
}

/// Lifecycle hooks the datastore drives on every service
pub trait DomainService: BackingStore {
    fn domain(&self) -> Domain;

    /// Stop every runner polling `device`; returns how many were stopped
    fn on_device_disconnected(&self, device: DeviceId) -> usize;

    /// Stop every runner; returns how many were stopped
    fn shutdown(&self) -> usize;
}

/// Cadence and cache sizing shared by the services
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceSettings {
    pub poll: PollSettings,
    pub cache_capacity: NonZeroUsize,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl ServiceSettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            poll: PollSettings::from(&config.polling),
            cache_capacity: config.cache.capacity(),
        }
    }
}

#[derive(Debug)]
struct RunnerEntry {
    device: DeviceId,
    runners: Vec<Arc<PollRunner>>,
}

/// Runner sets keyed by session (or device), at most one set per key.
#[derive(Debug)]
pub struct RunnerSet<K> {
    domain: Domain,
    entries: Mutex<HashMap<K, RunnerEntry>>,
}

impl<K: Eq + Hash + Clone + std::fmt::Debug> RunnerSet<K> {
    #[must_use]
    pub fn new(domain: Domain) -> Self {
        Self {
            domain,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Register the runners produced by `build` unless `key` already has a
    /// set. Check and insert happen under one lock acquisition.
    ///
    /// Returns the new runners for the caller to submit, or `None` when a set
    /// was already registered (and `build` was not called).
    pub fn start_if_absent(
        &self,
        key: K,
        device: DeviceId,
        build: impl FnOnce() -> Vec<Arc<PollRunner>>,
    ) -> Option<Vec<Arc<PollRunner>>> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match entries.entry(key) {
            Entry::Occupied(existing) => {
                debug!(domain = %self.domain, key = ?existing.key(), "runners already registered");
                None
            }
            Entry::Vacant(slot) => {
                let runners = build();
                debug!(
                    domain = %self.domain,
                    key = ?slot.key(),
                    device_id = %device,
                    runners = runners.len(),
                    "runners registered"
                );
                slot.insert(RunnerEntry {
                    device,
                    runners: runners.clone(),
                });
                Some(runners)
            }
        }
    }

    /// [`start_if_absent`](Self::start_if_absent) for runners built from the
    /// channel registered as `generation`.
    ///
    /// The disconnect path removes the channel before stopping runners, so
    /// re-checking the registry after the set is visible closes the window in
    /// which a disconnect could miss it. If the channel was removed or
    /// replaced meanwhile the new set is withdrawn, stopped, and `None` is
    /// returned.
    pub fn start_bound(
        &self,
        key: K,
        device: DeviceId,
        registry: &ClientRegistry,
        generation: ChannelGeneration,
        build: impl FnOnce() -> Vec<Arc<PollRunner>>,
    ) -> Option<Vec<Arc<PollRunner>>> {
        let runners = self.start_if_absent(key.clone(), device, build)?;
        if registry.is_current(device, generation) {
            return Some(runners);
        }
        self.withdraw(&key, &runners);
        debug!(
            domain = %self.domain,
            key = ?key,
            device_id = %device,
            "device channel changed during start; runners withdrawn"
        );
        None
    }

    /// Remove `key` only if it still holds `runners`, then stop them
    fn withdraw(&self, key: &K, runners: &[Arc<PollRunner>]) {
        {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            if let Entry::Occupied(entry) = entries.entry(key.clone()) {
                let same = entry.get().runners.len() == runners.len()
                    && entry
                        .get()
                        .runners
                        .iter()
                        .zip(runners)
                        .all(|(a, b)| Arc::ptr_eq(a, b));
                if same {
                    entry.remove();
                }
            }
        }
        stop_all(runners);
    }

    /// Stop and forget the set for `key`; 0 when there was none
    pub fn stop(&self, key: &K) -> usize {
        let removed = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        removed.map_or(0, |entry| stop_all(&entry.runners))
    }

    /// Stop and forget every set polling `device`
    pub fn stop_device(&self, device: DeviceId) -> usize {
        let removed: Vec<RunnerEntry> = {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            let keys: Vec<K> = entries
                .iter()
                .filter(|(_, entry)| entry.device == device)
                .map(|(key, _)| key.clone())
                .collect();
            keys.iter().filter_map(|key| entries.remove(key)).collect()
        };
        removed.iter().map(|entry| stop_all(&entry.runners)).sum()
    }

    pub fn stop_all(&self) -> usize {
        let drained: Vec<RunnerEntry> = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        drained.iter().map(|entry| stop_all(&entry.runners)).sum()
    }

    /// Runners registered for `key`
    #[must_use]
    pub fn runner_count(&self, key: &K) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map_or(0, |entry| entry.runners.len())
    }

    /// Keys with a registered set
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn stop_all(runners: &[Arc<PollRunner>]) -> usize {
    for runner in runners {
        runner.stop();
    }
    runners.len()
}

/// LRU of `get_data` responses keyed by exact `(session, range)`.
///
/// With capacity 1 this is a single-slot "last request" cache.
#[derive(Debug)]
pub struct ResponseCache<V> {
    entries: Mutex<LruCache<(Session, TimeRange), V>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<V: Clone> ResponseCache<V> {
    #[must_use]
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Cached value for the key, or the result of `load` (stored on success).
    ///
    /// `load` runs under the cache lock so concurrent identical requests
    /// trigger one table read.
    pub fn get_or_try_insert_with<E>(
        &self,
        session: &Session,
        range: TimeRange,
        load: impl FnOnce() -> Result<V, E>,
    ) -> Result<V, E> {
        let key = (*session, range);
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(value) = entries.get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(value.clone());
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let value = load()?;
        entries.put(key, value.clone());
        Ok(value)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
