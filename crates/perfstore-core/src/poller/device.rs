use std::sync::Arc;

use super::Poller;
use crate::Result;
use crate::client::ProfilerClient;
use crate::storage::{DeviceSnapshot, ProfilerTable};
use crate::types::DeviceId;
use crate::types::profiler::ProcessState;

/// Keeps the stored device, its process list, agent states, and the
/// device clock up to date while the device is connected.
pub struct DevicePoller {
    device: DeviceId,
    client: Arc<dyn ProfilerClient>,
    table: Arc<ProfilerTable>,
}

impl DevicePoller {
    #[must_use]
    pub fn new(device: DeviceId, client: Arc<dyn ProfilerClient>, table: Arc<ProfilerTable>) -> Self {
        Self {
            device,
            client,
            table,
        }
    }
}

impl Poller for DevicePoller {
    fn name(&self) -> &'static str {
        "device"
    }

    fn poll(&mut self) -> Result<usize> {
        let device = self
            .client
            .get_devices()?
            .into_iter()
            .find(|d| d.device_id == self.device.0);
        let time = self.client.get_current_time(self.device)?;
        let processes = self.client.get_processes(self.device)?;

        let mut agent_statuses = Vec::new();
        for process in processes.iter().filter(|p| p.state == ProcessState::Alive) {
            let agent = self.client.get_agent_status(self.device, process.pid)?;
            agent_statuses.push((process.pid, agent.status));
        }

        let snapshot = DeviceSnapshot {
            device_id: self.device.0,
            device,
            last_known_time: Some(time.timestamp_ns),
            processes,
            agent_statuses,
        };
        Ok(self.table.apply_device_snapshot(&snapshot)?)
    }
}
