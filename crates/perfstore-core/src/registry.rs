//! Device registry: which devices are connected and how to reach them.
//!
//! Lookups never wait for a connection. A device that is not registered is
//! reported as `None`, which callers treat as a normal condition.
//!
//! Every registration gets a fresh generation. Code that builds long-lived
//! state from a channel (poll runners) records the generation it looked up
//! and re-checks it with [`ClientRegistry::is_current`] once that state is
//! visible to the disconnect path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, info};

use crate::client::{CpuClient, DeviceChannel, EventClient, MemoryClient, ProfilerClient};
use crate::types::DeviceId;

/// Identifies one registration of a device channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelGeneration(u64);

#[derive(Debug, Clone)]
struct Registered {
    generation: ChannelGeneration,
    channel: DeviceChannel,
}

#[derive(Debug, Default)]
pub struct ClientRegistry {
    channels: RwLock<HashMap<DeviceId, Registered>>,
    next_generation: AtomicU64,
}

impl ClientRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the channel for `device`, returning the one it replaced
    pub fn insert(&self, device: DeviceId, channel: DeviceChannel) -> Option<DeviceChannel> {
        let generation = ChannelGeneration(self.next_generation.fetch_add(1, Ordering::Relaxed) + 1);
        let previous = self
            .channels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(device, Registered { generation, channel })
            .map(|r| r.channel);
        info!(device_id = %device, generation = generation.0, replaced = previous.is_some(), "device channel registered");
        previous
    }

    pub fn remove(&self, device: DeviceId) -> Option<DeviceChannel> {
        let removed = self
            .channels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&device)
            .map(|r| r.channel);
        debug!(device_id = %device, found = removed.is_some(), "device channel removed");
        removed
    }

    #[must_use]
    pub fn channel(&self, device: DeviceId) -> Option<DeviceChannel> {
        self.lookup(device).map(|(_, channel)| channel)
    }

    /// The channel for `device` together with the registration it came from
    #[must_use]
    pub fn lookup(&self, device: DeviceId) -> Option<(ChannelGeneration, DeviceChannel)> {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&device)
            .map(|r| (r.generation, r.channel.clone()))
    }

    /// True while `generation` is still the registered channel for `device`
    #[must_use]
    pub fn is_current(&self, device: DeviceId, generation: ChannelGeneration) -> bool {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&device)
            .is_some_and(|r| r.generation == generation)
    }

    #[must_use]
    pub fn is_connected(&self, device: DeviceId) -> bool {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&device)
    }

    #[must_use]
    pub fn devices(&self) -> Vec<DeviceId> {
        let mut devices: Vec<DeviceId> = self
            .channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        devices.sort_unstable();
        devices
    }

    #[must_use]
    pub fn cpu_client(&self, device: DeviceId) -> Option<Arc<dyn CpuClient>> {
        self.channel(device).map(|c| c.cpu)
    }

    #[must_use]
    pub fn memory_client(&self, device: DeviceId) -> Option<Arc<dyn MemoryClient>> {
        self.channel(device).map(|c| c.memory)
    }

    #[must_use]
    pub fn event_client(&self, device: DeviceId) -> Option<Arc<dyn EventClient>> {
        self.channel(device).map(|c| c.event)
    }

    #[must_use]
    pub fn profiler_client(&self, device: DeviceId) -> Option<Arc<dyn ProfilerClient>> {
        self.channel(device).map(|c| c.profiler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::unreachable_channel as channel;

    #[test]
    fn unknown_device_has_no_clients() {
        let registry = ClientRegistry::new();
        assert!(registry.cpu_client(DeviceId(1)).is_none());
        assert!(registry.lookup(DeviceId(1)).is_none());
        assert!(!registry.is_connected(DeviceId(1)));
    }

    #[test]
    fn generation_changes_on_every_registration() {
        let registry = ClientRegistry::new();
        let device = DeviceId(3);
        assert!(registry.insert(device, channel()).is_none());
        let (first, _) = registry.lookup(device).unwrap();
        assert!(registry.is_current(device, first));

        assert!(registry.insert(device, channel()).is_some());
        let (second, _) = registry.lookup(device).unwrap();
        assert_ne!(first, second);
        assert!(!registry.is_current(device, first));
        assert!(registry.is_current(device, second));

        assert!(registry.remove(device).is_some());
        assert!(!registry.is_current(device, second));
        assert!(registry.devices().is_empty());
    }
}
